//! The transport capability the client consumes.
//!
//! A [`Transport`] performs exactly one request per call and reports either a response (any
//! status) or a transport-level failure. It returns a future instead of blocking: the future is
//! polled by the scheduler's local executor during `update(dt)`, so an implementation must hand
//! the actual I/O to something that makes progress on its own (see [`HttpTransport`]) or resolve
//! immediately.
//!
//! [`HttpTransport`]: crate::http::HttpTransport

use crate::error::TransportError;
use crate::wire::CONTENT_TYPE;
use futures::future::{self, FutureExt, LocalBoxFuture};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

/// HTTP method of a transport request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub timeout: Duration,
}

impl TransportRequest {
    /// JSON POST with the standard content type header.
    pub fn post_json(url: impl Into<String>, body: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: vec![("Content-Type".to_string(), CONTENT_TYPE.to_string())],
            body: body.into(),
            timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self { status, body: body.into() }
    }

    /// Any status in `[200, 300)`.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub type TransportFuture = LocalBoxFuture<'static, Result<TransportResponse, TransportError>>;

type Script = VecDeque<Result<TransportResponse, TransportError>>;

/// Performs one request.
pub trait Transport {
    fn send(&self, request: TransportRequest) -> TransportFuture;
}

impl<T: Transport + ?Sized> Transport for Rc<T> {
    fn send(&self, request: TransportRequest) -> TransportFuture {
        (**self).send(request)
    }
}

/// Scripted in-memory transport for tests and offline hosts.
///
/// Each request is answered from the first matching route script (by URL suffix), then from the
/// shared script, then with the fallback (200 OK unless changed). Every request is recorded.
/// Clones share scripts and the log.
#[derive(Debug, Clone)]
pub struct MockTransport {
    routes: Rc<RefCell<Vec<(String, Script)>>>,
    script: Rc<RefCell<Script>>,
    fallback: Rc<RefCell<Result<TransportResponse, TransportError>>>,
    requests: Rc<RefCell<Vec<TransportRequest>>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Transport that answers 200 to everything.
    pub fn new() -> Self {
        Self {
            routes: Rc::default(),
            script: Rc::default(),
            fallback: Rc::new(RefCell::new(Ok(TransportResponse::new(200, "{}")))),
            requests: Rc::default(),
        }
    }

    /// Transport whose fallback is the given failure.
    pub fn failing(err: TransportError) -> Self {
        let transport = Self::new();
        transport.set_fallback(Err(err));
        transport
    }

    /// Queue the next response.
    pub fn push(&self, outcome: Result<TransportResponse, TransportError>) -> &Self {
        self.script.borrow_mut().push_back(outcome);
        self
    }

    /// Queue `n` copies of the same response.
    pub fn push_n(&self, n: usize, outcome: Result<TransportResponse, TransportError>) -> &Self {
        for _ in 0..n {
            self.push(outcome.clone());
        }
        self
    }

    /// Queue a response for requests whose URL ends with `suffix`.
    pub fn push_for(
        &self,
        suffix: impl Into<String>,
        outcome: Result<TransportResponse, TransportError>,
    ) -> &Self {
        let suffix = suffix.into();
        let mut routes = self.routes.borrow_mut();
        match routes.iter_mut().find(|(s, _)| *s == suffix) {
            Some((_, script)) => script.push_back(outcome),
            None => routes.push((suffix, VecDeque::from([outcome]))),
        }
        self
    }

    pub fn set_fallback(&self, outcome: Result<TransportResponse, TransportError>) {
        *self.fallback.borrow_mut() = outcome;
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.borrow().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.borrow().len()
    }

    /// Requests sent to URLs ending with `suffix`.
    pub fn requests_to(&self, suffix: &str) -> Vec<TransportRequest> {
        self.requests.borrow().iter().filter(|r| r.url.ends_with(suffix)).cloned().collect()
    }

    pub fn clear(&self) {
        self.requests.borrow_mut().clear();
    }
}

impl Transport for MockTransport {
    fn send(&self, request: TransportRequest) -> TransportFuture {
        let routed = self
            .routes
            .borrow_mut()
            .iter_mut()
            .filter(|(suffix, _)| request.url.ends_with(suffix.as_str()))
            .find_map(|(_, script)| script.pop_front());
        let outcome = routed
            .or_else(|| self.script.borrow_mut().pop_front())
            .unwrap_or_else(|| self.fallback.borrow().clone());
        self.requests.borrow_mut().push(request);
        future::ready(outcome).boxed_local()
    }
}

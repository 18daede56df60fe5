//! Virtual time for cooperative retry waits.
//!
//! The host never sleeps on behalf of the client. Instead, every retry wait is a [`Sleep`] future
//! registered on a [`TickTimer`]; the timer's clock only moves when the host calls `advance(dt)`
//! (through `update(dt)`), which wakes every sleeper whose deadline has passed. Time that the host
//! does not report simply does not elapse for pending retries.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

#[derive(Debug, Default)]
struct TimerState {
    now: Cell<Duration>,
    waiters: RefCell<Vec<(Duration, Waker)>>,
}

/// Tick-driven clock. Clones share the same virtual time.
#[derive(Debug, Clone, Default)]
pub struct TickTimer {
    state: Rc<TimerState>,
}

impl TickTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Virtual time elapsed since the timer was created.
    pub fn now(&self) -> Duration {
        self.state.now.get()
    }

    /// Advance virtual time by `dt` and wake every sleeper that is now due.
    pub fn advance(&self, dt: Duration) {
        let now = self.state.now.get().saturating_add(dt);
        self.state.now.set(now);

        let due: Vec<Waker> = {
            let mut waiters = self.state.waiters.borrow_mut();
            let mut due = Vec::new();
            waiters.retain(|(deadline, waker)| {
                if *deadline <= now {
                    due.push(waker.clone());
                    false
                } else {
                    true
                }
            });
            due
        };
        // Wake outside the borrow: a waker may poll synchronously on some executors.
        for waker in due {
            waker.wake();
        }
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.state.waiters.borrow().len()
    }

    /// Future that completes once `duration` of virtual time has passed.
    pub fn sleep(&self, duration: Duration) -> Sleep {
        Sleep { timer: self.clone(), deadline: self.now().saturating_add(duration) }
    }

    fn register(&self, deadline: Duration, waker: &Waker) {
        let mut waiters = self.state.waiters.borrow_mut();
        match waiters.iter_mut().find(|(d, w)| *d == deadline && w.will_wake(waker)) {
            Some(_) => {}
            None => waiters.push((deadline, waker.clone())),
        }
    }
}

/// Future returned by [`TickTimer::sleep`].
#[derive(Debug)]
#[must_use = "sleeps do nothing unless polled"]
pub struct Sleep {
    timer: TickTimer,
    deadline: Duration,
}

impl Sleep {
    pub fn deadline(&self) -> Duration {
        self.deadline
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.timer.now() >= self.deadline {
            Poll::Ready(())
        } else {
            self.timer.register(self.deadline, cx.waker());
            Poll::Pending
        }
    }
}

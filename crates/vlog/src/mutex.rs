//! FIFO async lock with graceful and immediate teardown
//!
//! Waiters are served strictly in arrival order. `destroy(None)` lets every
//! holder and already-queued waiter through and only refuses new lockers;
//! `destroy(Some(err))` rejects the queue with `err` at once, leaving only the
//! current holder.

use std::collections::VecDeque;
use std::future::Future;

use tokio::sync::{oneshot, watch};

use crate::{Error, Result};

enum Waiter {
    Lock(oneshot::Sender<Result<()>>),
    /// Marks the point after which a graceful destroy is complete
    Drain,
}

#[derive(Default)]
struct State {
    locked: bool,
    destroying: bool,
    destroyed: bool,
    destroy_error: Option<Error>,
    queue: VecDeque<Waiter>,
}

pub struct Mutex {
    state: parking_lot::Mutex<State>,
    drained: watch::Sender<bool>,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    pub fn new() -> Self {
        let (drained, _) = watch::channel(false);
        Self {
            state: parking_lot::Mutex::new(State::default()),
            drained,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Lockers currently waiting.
    pub fn queued(&self) -> usize {
        self.state
            .lock()
            .queue
            .iter()
            .filter(|w| matches!(w, Waiter::Lock(_)))
            .count()
    }

    /// Wait for the lock. Must be paired with [`Mutex::unlock`]; prefer
    /// [`Mutex::acquire`].
    pub async fn lock(&self) -> Result<()> {
        let rx = {
            let mut state = self.state.lock();
            if state.destroyed {
                return Err(state.destroy_error.clone().unwrap_or(Error::Destroyed));
            }
            if !state.locked {
                state.locked = true;
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(Waiter::Lock(tx));
            rx
        };

        let mut pending = Pending {
            mutex: self,
            rx,
            settled: false,
        };
        let res = (&mut pending.rx).await.unwrap_or(Err(Error::Destroyed));
        pending.settled = true;
        res
    }

    /// Hand the lock to the next waiter, or release it.
    pub fn unlock(&self) {
        let mut state = self.state.lock();

        while let Some(waiter) = state.queue.pop_front() {
            match waiter {
                Waiter::Lock(tx) => {
                    // A dropped receiver gave up waiting; skip it.
                    if tx.send(Ok(())).is_ok() {
                        return;
                    }
                }
                Waiter::Drain => {
                    self.drained.send_replace(true);
                }
            }
        }

        state.locked = false;
    }

    pub async fn acquire(&self) -> Result<MutexGuard<'_>> {
        self.lock().await?;
        Ok(MutexGuard { mutex: self })
    }

    /// Refuse new lockers. With `err`, also reject everything queued.
    ///
    /// The returned future resolves once every waiter allowed through has
    /// had its turn. Calling it again returns the same completion.
    pub fn destroy(&self, err: Option<Error>) -> impl Future<Output = ()> + Send + 'static {
        {
            let mut state = self.state.lock();

            if !state.destroying {
                state.destroying = true;
                if state.locked {
                    state.queue.push_back(Waiter::Drain);
                } else {
                    self.drained.send_replace(true);
                }
            }

            state.destroyed = true;

            if let Some(err) = err {
                state.destroy_error = Some(err.clone());
                while let Some(waiter) = state.queue.pop_front() {
                    match waiter {
                        Waiter::Lock(tx) => {
                            let _ = tx.send(Err(err.clone()));
                        }
                        Waiter::Drain => {
                            self.drained.send_replace(true);
                        }
                    }
                }
            }
        }

        let mut rx = self.drained.subscribe();
        async move {
            let _ = rx.wait_for(|drained| *drained).await;
        }
    }
}

/// A queued `lock()`. If the waiter is dropped after the lock was already
/// handed to it, the lock moves on to the next waiter.
struct Pending<'a> {
    mutex: &'a Mutex,
    rx: oneshot::Receiver<Result<()>>,
    settled: bool,
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.rx.close();
        if let Ok(Ok(())) = self.rx.try_recv() {
            self.mutex.unlock();
        }
    }
}

/// Holds the lock until dropped.
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

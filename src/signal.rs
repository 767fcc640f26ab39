use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;

type Callback<T> = Box<dyn FnOnce(&T) + Send + 'static>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalError {
    #[error("signal has already been resolved")]
    AlreadyResolved,

    #[error("timed out after {0:?} waiting for signal")]
    Timeout(Duration),
}

enum State<T> {
    Pending(Vec<Callback<T>>),
    Resolved(T),
}

struct Shared<T> {
    state: Mutex<State<T>>,
    resolved: Condvar,
    notify: Notify,
}

/// A single-resolution broadcast value.
///
/// A `Signal` starts pending and is resolved exactly once. Every observer, whether it
/// subscribed before or after resolution, sees a clone of the same terminal value.
/// Observers can:
/// - register a callback with [`Signal::subscribe`], which runs on the thread that
///   resolves the signal (or immediately, if it is already resolved);
/// - block with [`Signal::wait_timeout`];
/// - await with [`Signal::wait`] / [`Signal::wait_for`].
///
/// Timeouts only affect the waiter that asked for them; the signal itself stays pending.
pub struct Signal<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Signal<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Pending(Vec::new())),
                resolved: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    // Callbacks never run while the lock is held, so a poisoned lock still holds a
    // consistent state.
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves the signal and notifies every observer.
    ///
    /// Registered callbacks run on the calling thread, in subscription order, after the
    /// internal lock has been released. Resolving twice is an error.
    pub fn resolve(&self, value: T) -> Result<(), SignalError> {
        let previous = {
            let mut state = self.lock();
            if let State::Resolved(_) = *state {
                return Err(SignalError::AlreadyResolved);
            }
            std::mem::replace(&mut *state, State::Resolved(value.clone()))
        };

        self.shared.resolved.notify_all();
        self.shared.notify.notify_waiters();

        if let State::Pending(callbacks) = previous {
            for callback in callbacks {
                callback(&value);
            }
        }
        Ok(())
    }

    /// Registers `callback` to run once with the resolved value.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        let value = {
            let mut state = self.lock();
            match &mut *state {
                State::Pending(callbacks) => {
                    callbacks.push(Box::new(callback));
                    return;
                }
                State::Resolved(value) => value.clone(),
            }
        };
        callback(&value);
    }

    pub fn is_resolved(&self) -> bool {
        matches!(*self.lock(), State::Resolved(_))
    }

    /// Returns the resolved value without waiting.
    pub fn try_get(&self) -> Option<T> {
        match &*self.lock() {
            State::Resolved(value) => Some(value.clone()),
            State::Pending(_) => None,
        }
    }

    /// Blocks the current thread until the signal resolves or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T, SignalError> {
        let guard = self.lock();
        let (guard, _) = self
            .shared
            .resolved
            .wait_timeout_while(guard, timeout, |state| matches!(state, State::Pending(_)))
            .unwrap_or_else(PoisonError::into_inner);

        match &*guard {
            State::Resolved(value) => Ok(value.clone()),
            State::Pending(_) => Err(SignalError::Timeout(timeout)),
        }
    }

    /// Waits asynchronously until the signal resolves.
    pub async fn wait(&self) -> T {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking the state so a resolve racing with this
            // check is not missed.
            notified.as_mut().enable();
            if let Some(value) = self.try_get() {
                return value;
            }
            notified.await;
        }
    }

    pub async fn wait_for(&self, timeout: Duration) -> Result<T, SignalError> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| SignalError::Timeout(timeout))
    }
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let resolved = match self.shared.state.try_lock() {
            Ok(state) => Some(matches!(*state, State::Resolved(_))),
            Err(_) => None,
        };
        let status = match resolved {
            Some(true) => "resolved",
            Some(false) => "pending",
            None => "busy",
        };
        f.debug_struct("Signal").field("status", &status).finish()
    }
}

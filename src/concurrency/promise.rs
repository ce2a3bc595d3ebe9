//! Promise
//!
//! Set-once completion cell with any number of waiters. Outside callers
//! block in [`Promise::wait`]; pool jobs instead chain continuations with
//! [`Promise::on_complete`] so no worker ever parks on work queued behind it.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::Result;

type Callback<T> = Box<dyn FnOnce(&Result<T>) + Send + 'static>;

enum State<T> {
    Pending(Vec<Callback<T>>),
    Done(Result<T>),
}

struct Inner<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

/// Shared handle to a value that will be produced later
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending(Vec::new())),
                ready: Condvar::new(),
            }),
        }
    }

    /// A promise that is already complete
    pub fn resolved(value: Result<T>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Done(value)),
                ready: Condvar::new(),
            }),
        }
    }

    /// Store the outcome and wake every waiter
    ///
    /// Returns `false` (and drops `value`) if the promise was already
    /// complete. Continuations run on the calling thread, outside the lock.
    pub fn complete(&self, value: Result<T>) -> bool {
        let callbacks = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Done(_) => return false,
                State::Pending(callbacks) => {
                    let callbacks = std::mem::take(callbacks);
                    *state = State::Done(value.clone());
                    callbacks
                }
            }
        };
        self.inner.ready.notify_all();

        for callback in callbacks {
            callback(&value);
        }
        true
    }

    /// Run `callback` once the outcome is known
    ///
    /// If the promise is already complete the callback runs immediately on
    /// the calling thread.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&Result<T>) + Send + 'static,
    {
        let done = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Pending(callbacks) => {
                    callbacks.push(Box::new(callback));
                    return;
                }
                State::Done(value) => value.clone(),
            }
        };
        callback(&done);
    }

    /// Block until the outcome is known
    pub fn wait(&self) -> Result<T> {
        let mut state = self.inner.state.lock();
        loop {
            if let State::Done(value) = &*state {
                return value.clone();
            }
            self.inner.ready.wait(&mut state);
        }
    }

    /// The outcome, if already known
    pub fn try_get(&self) -> Option<Result<T>> {
        match &*self.inner.state.lock() {
            State::Done(value) => Some(value.clone()),
            State::Pending(_) => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(&*self.inner.state.lock(), State::Done(_))
    }

    /// Whether both handles refer to the same cell
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Clone + Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let done = matches!(&*self.inner.state.lock(), State::Done(_));
        f.debug_struct("Promise").field("complete", &done).finish()
    }
}

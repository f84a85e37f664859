//! # Invoke Futures
//!
//! The handle of one pending call. The same handle serves all three call styles:
//! a thread can block on it ([`InvokeFuture::wait`], [`InvokeFuture::sync`]), a
//! callback can be attached ([`InvokeFuture::on_complete`]), and a task can
//! `.await` it.
//!
//! ## Invariants
//! - **Resolved Once**: resolution consumes the [`Resolver`], so exactly one
//!   outcome is ever written.
//! - **Callback Once**: the callback runs exactly once, on the resolving thread, or
//!   immediately on the registering thread if the future is already resolved.
//!   It never runs with the internal lock held.

use std::fmt;
use std::future::IntoFuture;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Notify;

use freerpc::Value;

use crate::error::Error;
use crate::error::Result;

type Callback = Box<dyn FnOnce(&InvokeFuture) + Send>;

struct Outcome {
    result: Result<Value>,
    warning: Option<String>,
}

#[derive(Default)]
struct Inner {
    outcome: Option<Outcome>,
    callback: Option<Callback>,
}

struct State {
    message_id: String,
    inner: Mutex<Inner>,
    resolved: Condvar,
    notify: Notify,
}

/// A pending call's outcome.
#[derive(Clone)]
pub struct InvokeFuture {
    state: Arc<State>,
}

/// The write side of an [`InvokeFuture`].
pub struct Resolver {
    future: InvokeFuture,
}

impl InvokeFuture {
    /// Creates an unresolved future for the message `message_id`.
    pub fn new(message_id: impl Into<String>) -> (InvokeFuture, Resolver) {
        let future = InvokeFuture {
            state: Arc::new(State {
                message_id: message_id.into(),
                inner: Mutex::new(Inner::default()),
                resolved: Condvar::new(),
                notify: Notify::new(),
            }),
        };
        let resolver = Resolver { future: future.clone() };
        (future, resolver)
    }

    /// A future that is already resolved.
    pub fn ready(message_id: impl Into<String>, result: Result<Value>) -> InvokeFuture {
        let (future, resolver) = Self::new(message_id);
        resolver.resolve(result, None);
        future
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.state.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn message_id(&self) -> &str {
        &self.state.message_id
    }

    pub fn is_done(&self) -> bool {
        self.lock().outcome.is_some()
    }

    /// Resolved without an error.
    pub fn is_success(&self) -> bool {
        matches!(self.lock().outcome, Some(Outcome { result: Ok(_), .. }))
    }

    /// The result, once resolved successfully.
    pub fn result(&self) -> Option<Value> {
        match &self.lock().outcome {
            Some(Outcome { result: Ok(v), .. }) => Some(v.clone()),
            _ => None,
        }
    }

    /// The error, once resolved unsuccessfully.
    pub fn error(&self) -> Option<Error> {
        match &self.lock().outcome {
            Some(Outcome { result: Err(e), .. }) => Some(e.clone()),
            _ => None,
        }
    }

    pub fn warning(&self) -> Option<String> {
        self.lock().outcome.as_ref().and_then(|o| o.warning.clone())
    }

    /// Registers the completion callback, replacing any earlier one that has not run.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&InvokeFuture) + Send + 'static,
    {
        let mut inner = self.lock();
        if inner.outcome.is_some() {
            drop(inner);
            callback(self);
        } else {
            inner.callback = Some(Box::new(callback));
        }
    }

    /// Blocks until resolved or until `timeout` passes. Returns whether it resolved.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let inner = self.lock();
        match timeout {
            None => {
                let _inner = self
                    .state
                    .resolved
                    .wait_while(inner, |i| i.outcome.is_none())
                    .unwrap_or_else(PoisonError::into_inner);
                true
            }
            Some(timeout) => {
                let (inner, _) = self
                    .state
                    .resolved
                    .wait_timeout_while(inner, timeout, |i| i.outcome.is_none())
                    .unwrap_or_else(PoisonError::into_inner);
                inner.outcome.is_some()
            }
        }
    }

    /// Blocks until resolved and returns the outcome.
    ///
    /// # Errors
    /// `Error::Timeout` if `timeout` passes first, otherwise the call's own error.
    pub fn sync(&self, timeout: Option<Duration>) -> Result<Value> {
        if !self.wait(timeout) {
            return Err(Error::Timeout);
        }
        self.outcome()
    }

    fn outcome(&self) -> Result<Value> {
        match &self.lock().outcome {
            Some(o) => o.result.clone(),
            None => Err(Error::Timeout),
        }
    }

    /// Waits without blocking the thread.
    pub async fn resolved(&self) {
        loop {
            let notified = self.state.notify.notified();
            if self.is_done() {
                return;
            }
            notified.await;
        }
    }
}

impl IntoFuture for InvokeFuture {
    type Output = Result<Value>;
    type IntoFuture = BoxFuture<'static, Result<Value>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            self.resolved().await;
            self.outcome()
        })
    }
}

impl fmt::Debug for InvokeFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvokeFuture")
            .field("message_id", &self.state.message_id)
            .field("done", &self.is_done())
            .finish()
    }
}

impl Resolver {
    pub fn message_id(&self) -> &str {
        self.future.message_id()
    }

    /// Writes the outcome, wakes every waiter and runs the callback.
    pub fn resolve(self, result: Result<Value>, warning: Option<String>) {
        let future = self.future;
        let callback = {
            let mut inner = future.lock();
            inner.outcome = Some(Outcome { result, warning });
            inner.callback.take()
        };
        future.state.resolved.notify_all();
        future.state.notify.notify_waiters();
        if let Some(callback) = callback {
            callback(&future);
        }
    }
}

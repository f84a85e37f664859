//! # Runtime Handle
//!
//! The event loop that brokers and workers run on, passed to them explicitly.
//!
//! ## Lifecycle
//!
//! - [`Runtime::new`] builds a single-threaded Tokio runtime and [`Runtime::start`]
//!   drives it on a background thread. A second `start` fails; [`Runtime::try_start`]
//!   reports whether this call was the one that started it.
//! - [`Runtime::from_current`] wraps a runtime the caller already runs inside, for
//!   applications and tests that own their own Tokio runtime.
//! - [`Runtime::stop`] shuts the background loop down and joins its thread.
//!
//! ## Invariants
//! - **No Blocking Inside**: blocking APIs refuse to run on a thread that is inside an
//!   async runtime, returning `Error::BlockingInRuntime` instead of deadlocking it.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// The Tokio runtime or its thread could not be created.
    Build(String),
    /// `start` was called on a runtime that is already running.
    AlreadyRunning,
    /// The runtime was never started, so nothing would drive a blocking call.
    NotRunning,
    /// The runtime was stopped and cannot be started again.
    Stopped,
    /// `from_current` was called outside of a Tokio runtime.
    NoCurrentRuntime,
    /// A task spawned on the runtime panicked or was cancelled.
    TaskFailed(String),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Build(msg) => write!(f, "failed to build runtime: {}", msg),
            Self::AlreadyRunning => write!(f, "runtime is already running"),
            Self::NotRunning => write!(f, "runtime is not running"),
            Self::Stopped => write!(f, "runtime has been stopped"),
            Self::NoCurrentRuntime => write!(f, "not inside a Tokio runtime"),
            Self::TaskFailed(msg) => write!(f, "runtime task failed: {}", msg),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// A cloneable handle to the event loop.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

struct Inner {
    handle: Handle,
    running: AtomicBool,
    owned: Mutex<Option<tokio::runtime::Runtime>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Runtime {
    /// Builds a stopped single-threaded runtime.
    pub fn new() -> Result<Self, RuntimeError> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| RuntimeError::Build(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(Inner {
                handle: rt.handle().clone(),
                running: AtomicBool::new(false),
                owned: Mutex::new(Some(rt)),
                shutdown: Mutex::new(None),
                thread: Mutex::new(None),
            }),
        })
    }

    /// Wraps the runtime the caller is running inside.
    pub fn from_current() -> Result<Self, RuntimeError> {
        let handle = Handle::try_current().map_err(|_| RuntimeError::NoCurrentRuntime)?;
        Ok(Self {
            inner: Arc::new(Inner {
                handle,
                running: AtomicBool::new(true),
                owned: Mutex::new(None),
                shutdown: Mutex::new(None),
                thread: Mutex::new(None),
            }),
        })
    }

    /// Builds and starts a runtime in one step.
    pub fn started() -> Result<Self, RuntimeError> {
        let rt = Self::new()?;
        rt.start()?;
        Ok(rt)
    }

    /// Starts the event loop on a background thread.
    pub fn start(&self) -> Result<(), RuntimeError> {
        if self.try_start()? { Ok(()) } else { Err(RuntimeError::AlreadyRunning) }
    }

    /// Starts the event loop unless it is already running. Returns whether this
    /// call started it.
    pub fn try_start(&self) -> Result<bool, RuntimeError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        let rt = self.inner.owned.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(rt) = rt else {
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(RuntimeError::Stopped);
        };

        let (tx, rx) = oneshot::channel::<()>();
        let thread = std::thread::Builder::new()
            .name("freerun".into())
            .spawn(move || {
                rt.block_on(async {
                    let _ = rx.await;
                });
                rt.shutdown_background();
            })
            .map_err(|e| {
                self.inner.running.store(false, Ordering::SeqCst);
                RuntimeError::Build(e.to_string())
            })?;

        *self.inner.shutdown.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        *self.inner.thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(thread);
        debug!("runtime started");
        Ok(true)
    }

    /// Stops a started runtime and joins its thread. Tasks still running are dropped.
    /// A runtime wrapped with `from_current` is left alone.
    pub fn stop(&self) {
        let tx = self.inner.shutdown.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
        let thread = self.inner.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(thread) = thread {
            if thread.thread().id() != std::thread::current().id() {
                let _ = thread.join();
            }
            self.inner.running.store(false, Ordering::SeqCst);
            debug!("runtime stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.handle.spawn(future)
    }

    /// Runs `future` on this runtime and awaits it from any context. Used for
    /// work that binds resources (sockets, timers) to this runtime's reactor.
    pub async fn run<F>(&self, future: F) -> Result<F::Output, Error>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.spawn(future)
            .await
            .map_err(|e| Error::Runtime(RuntimeError::TaskFailed(e.to_string())))
    }

    /// Runs `future` on this runtime and blocks the calling thread until it finishes.
    pub fn block_on<F>(&self, future: F) -> Result<F::Output, Error>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        ensure_blocking_allowed()?;
        if !self.is_running() {
            return Err(Error::Runtime(RuntimeError::NotRunning));
        }
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        self.spawn(async move {
            let _ = tx.send(future.await);
        });
        rx.recv()
            .map_err(|_| Error::Runtime(RuntimeError::TaskFailed("task dropped before finishing".into())))
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime").field("running", &self.is_running()).finish()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let tx = self.shutdown.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }
}

/// Fails when the calling thread is inside an async runtime.
pub(crate) fn ensure_blocking_allowed() -> Result<(), Error> {
    match Handle::try_current() {
        Ok(_) => Err(Error::BlockingInRuntime),
        Err(_) => Ok(()),
    }
}

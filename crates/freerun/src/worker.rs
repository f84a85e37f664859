//! # Worker
//!
//! A peer of the broker. A worker can call functions on the broker, on named
//! services and on raw peer addresses, and can serve a bound [`Service`] itself,
//! all over one connection.
//!
//! ## Architecture
//!
//! - **Pump**: one task reads the connection. Responses resolve the pending
//!   [`InvokeFuture`] with the matching message ID; requests are each handled in
//!   their own task, so a slow method never delays a fast one.
//! - **Pending Table**: a concurrent map from message ID to [`Resolver`], shared by
//!   callers on any thread, the pump and the heartbeat task.
//! - **Heartbeat**: a task pings the broker every livetime/5 and registers the
//!   bound service whenever the broker does not know it, including a service
//!   bound after connecting.
//!
//! Both tasks hold the worker weakly. Dropping the last [`Worker`] handle aborts
//! them and closes the connection.
//!
//! ## Invariants
//! - **No Orphans**: when the connection ends, every pending call is resolved
//!   with `Error::ConnectionLost`.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use freerpc::Address;
use freerpc::FrameSet;
use freerpc::Invocation;
use freerpc::Message;
use freerpc::Request;
use freerpc::Response;
use freerpc::Value;

use crate::config::WorkerConfig;
use crate::dispatch::DispatchError;
use crate::dispatch::Service;
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::error::Result;
use crate::future::InvokeFuture;
use crate::future::Resolver;
use crate::runtime::Runtime;
use crate::runtime::ensure_blocking_allowed;
use crate::transport::TcpTransport;
use crate::transport::Transport;

/// Function name intercepted by every worker to stop serving.
const STOP_SERVICE: &str = "stopService";

/// Where a call goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// The broker's registry.
    Broker,
    /// Whichever peer owns the service name.
    Service(String),
    /// A raw peer address.
    Direct(Address),
}

impl Target {
    /// Builds the message for a call, without sending it.
    pub fn message(&self, function: &str, args: impl Into<Arguments>) -> Result<Message> {
        let Arguments { positional, keyword } = args.into();
        let invocation = Invocation::request(function, positional, keyword);
        let message = match self {
            Target::Broker => Message::new_broker(&invocation)?,
            Target::Service(name) => Message::new_service(name, &invocation)?,
            Target::Direct(address) => Message::new_direct(address, &invocation)?,
        };
        Ok(message)
    }
}

/// Positional and keyword arguments of a call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments {
    pub positional: Vec<Value>,
    pub keyword: Vec<(String, Value)>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keyword.push((name.into(), value.into()));
        self
    }
}

impl From<()> for Arguments {
    fn from(_: ()) -> Self {
        Self::default()
    }
}

impl From<Vec<Value>> for Arguments {
    fn from(positional: Vec<Value>) -> Self {
        Self { positional, keyword: Vec::new() }
    }
}

impl<T: Into<Value>, const N: usize> From<[T; N]> for Arguments {
    fn from(values: [T; N]) -> Self {
        Self { positional: values.into_iter().map(Into::into).collect(), keyword: Vec::new() }
    }
}

struct Binding {
    name: String,
    service: Service,
    interfaces: Vec<Value>,
}

struct WorkerInner {
    transport: Arc<dyn Transport>,
    pending: DashMap<String, Resolver>,
    binding: RwLock<Option<Arc<Binding>>>,
    /// Registered with the broker, as far as this worker knows.
    is_service: AtomicBool,
    /// A service is bound and should stay registered.
    wants_service: AtomicBool,
    closed: AtomicBool,
    runtime: Runtime,
    timeout: Option<Duration>,
    async_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A connected peer. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

/// Configures a [`Worker`] before connecting.
pub struct WorkerBuilder {
    config: WorkerConfig,
    service: Option<(String, Service)>,
    interfaces: Vec<Value>,
    force: bool,
}

impl WorkerBuilder {
    pub fn from_config(config: WorkerConfig) -> Self {
        Self { config, service: None, interfaces: Vec::new(), force: false }
    }

    /// Serves `service` under `name` once connected.
    pub fn service(mut self, name: impl Into<String>, service: Service) -> Self {
        self.service = Some((name.into(), service));
        self
    }

    pub fn interfaces<I, V>(mut self, interfaces: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.interfaces = interfaces.into_iter().map(Into::into).collect();
        self
    }

    /// Takes the service name over from its current owner.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Deadline of blocking calls.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout.as_secs_f64());
        self
    }

    /// Heartbeat livetime; the worker pings every livetime/5.
    pub fn heartbeat(mut self, livetime: Duration) -> Self {
        self.config.heartbeat_livetime = livetime.as_secs_f64();
        self
    }

    /// Connects over TCP and registers the service, if one is bound.
    pub async fn connect(self, runtime: &Runtime) -> Result<Worker> {
        let endpoint = Endpoint::parse(&self.config.endpoint)?;
        let transport = runtime
            .run(async move { TcpTransport::connect(&endpoint).await })
            .await??;
        self.attach(Box::new(transport), runtime).await
    }

    /// Blocking variant of [`WorkerBuilder::connect`].
    pub fn connect_blocking(self, runtime: &Runtime) -> Result<Worker> {
        let rt = runtime.clone();
        runtime.block_on(async move { self.connect(&rt).await })?
    }

    /// Runs the worker over an established transport.
    pub async fn attach(self, transport: Box<dyn Transport>, runtime: &Runtime) -> Result<Worker> {
        let inner = Arc::new(WorkerInner {
            transport: Arc::from(transport),
            pending: DashMap::new(),
            binding: RwLock::new(None),
            is_service: AtomicBool::new(false),
            wants_service: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            runtime: runtime.clone(),
            timeout: self.config.timeout(),
            async_timeout: self.config.async_timeout(),
            tasks: Mutex::new(Vec::new()),
        });
        let worker = Worker { inner };

        let pump = runtime.spawn(pump(Arc::downgrade(&worker.inner), worker.inner.transport.clone()));
        let period = (self.config.heartbeat_livetime() / 5).max(Duration::from_millis(1));
        let heartbeat = runtime.spawn(heartbeat_loop(Arc::downgrade(&worker.inner), period));
        worker.tasks().extend([pump, heartbeat]);

        if let Some((name, service)) = self.service {
            worker.bind_service(name, service, self.interfaces)?;
            if let Err(e) = worker.register(self.force).await {
                worker.shutdown();
                return Err(e);
            }
        }
        Ok(worker)
    }
}

impl Worker {
    pub fn builder(endpoint: impl Into<String>) -> WorkerBuilder {
        WorkerBuilder::from_config(WorkerConfig { endpoint: endpoint.into(), ..WorkerConfig::default() })
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn task_count(&self) -> usize {
        self.tasks().len()
    }

    fn binding(&self) -> Option<Arc<Binding>> {
        self.inner.binding.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Binds a service to serve. The next heartbeat registers it; call
    /// [`Worker::register`] to register right away.
    pub fn bind_service(&self, name: impl Into<String>, service: Service, interfaces: Vec<Value>) -> Result<()> {
        let mut binding = self.inner.binding.write().unwrap_or_else(PoisonError::into_inner);
        if binding.is_some() {
            return Err(Error::ServiceAlreadyBound);
        }
        *binding = Some(Arc::new(Binding { name: name.into(), service, interfaces }));
        self.inner.wants_service.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Registers the bound service with the broker.
    pub async fn register(&self, force: bool) -> Result<()> {
        let Some(binding) = self.binding() else {
            return Ok(());
        };
        let args = Arguments::new()
            .arg(binding.name.as_str())
            .arg(Value::Array(binding.interfaces.clone()))
            .arg(force);
        self.broker().call("registerAsService", args).await?;
        self.inner.wants_service.store(true, Ordering::SeqCst);
        self.inner.is_service.store(true, Ordering::SeqCst);
        info!(service = %binding.name, "registered as service");
        Ok(())
    }

    /// Name of the bound service.
    pub fn service_name(&self) -> Option<String> {
        self.binding().map(|b| b.name.clone())
    }

    /// Whether the bound service is registered, as of the last registration
    /// or heartbeat.
    pub fn is_service(&self) -> bool {
        self.inner.is_service.load(Ordering::SeqCst)
    }

    /// Whether the heartbeat keeps the bound service registered.
    pub fn wants_service(&self) -> bool {
        self.inner.wants_service.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn broker(&self) -> Invoker {
        self.invoker(Target::Broker)
    }

    pub fn service(&self, name: impl Into<String>) -> Invoker {
        self.invoker(Target::Service(name.into()))
    }

    pub fn direct(&self, address: Address) -> Invoker {
        self.invoker(Target::Direct(address))
    }

    pub fn invoker(&self, target: Target) -> Invoker {
        Invoker {
            worker: self.clone(),
            target,
            timeout: self.inner.timeout,
            async_timeout: self.inner.async_timeout,
        }
    }

    /// Sends a call and returns its pending outcome.
    pub fn call(&self, target: &Target, function: &str, args: impl Into<Arguments>) -> Result<InvokeFuture> {
        self.send(target.message(function, args)?)
    }

    /// Sends a prepared message and tracks its response.
    ///
    /// # Errors
    /// `DuplicateMessageId` if the message ID is already pending, or the
    /// transport's error if the connection is gone.
    pub fn send(&self, message: Message) -> Result<InvokeFuture> {
        if self.is_closed() {
            return Err(Error::ConnectionLost);
        }
        let id = message.message_id().to_owned();
        let (future, resolver) = InvokeFuture::new(id.clone());
        match self.inner.pending.entry(id.clone()) {
            Entry::Occupied(_) => return Err(Error::DuplicateMessageId(id)),
            Entry::Vacant(slot) => {
                slot.insert(resolver);
            }
        }
        if let Err(e) = self.inner.transport.send(message.into_segments()) {
            self.inner.pending.remove(&id);
            return Err(e.into());
        }
        Ok(future)
    }

    /// Stops tracking a call. A response arriving later is discarded.
    pub fn abandon(&self, message_id: &str) {
        self.inner.pending.remove(message_id);
    }

    /// Number of calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Unregisters the service (best effort) and drops the connection.
    pub async fn close(&self) {
        self.inner.wants_service.store(false, Ordering::SeqCst);
        if self.inner.is_service.swap(false, Ordering::SeqCst) && !self.is_closed() {
            let unregister = self.broker().with_async_timeout(Duration::from_secs(1));
            if let Err(e) = unregister.call("unregister", ()).await {
                debug!(error = %e, "unregister on close failed");
            }
        }
        self.shutdown();
    }

    /// Blocking variant of [`Worker::close`].
    pub fn close_blocking(&self) -> Result<()> {
        let worker = self.clone();
        self.inner.runtime.block_on(async move { worker.close().await })
    }

    /// Tears the connection down with zero linger.
    fn shutdown(&self) {
        self.inner.teardown();
    }
}

impl WorkerInner {
    /// Aborts the pump and the heartbeat and closes the transport. Safe to call
    /// more than once, including after the pump saw the connection end.
    fn teardown(&self) {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        self.is_service.store(false, Ordering::SeqCst);
        self.wants_service.store(false, Ordering::SeqCst);
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
        self.transport.close();
        self.fail_all_pending();
        if first {
            debug!("worker closed");
        }
    }

    fn fail_all_pending(&self) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, resolver)) = self.pending.remove(&id) {
                resolver.resolve(Err(Error::ConnectionLost), None);
            }
        }
    }

    fn on_response(&self, response: Response) {
        let Response { response_id, outcome, warning } = response;
        match self.pending.remove(&response_id) {
            Some((_, resolver)) => resolver.resolve(outcome.map_err(Error::Remote), warning),
            None => debug!(message_id = %response_id, "ResponseID not recognized"),
        }
    }
}

impl Drop for WorkerInner {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn pump(inner: Weak<WorkerInner>, transport: Arc<dyn Transport>) {
    loop {
        let frames = match transport.recv().await {
            Ok(Some(frames)) => frames,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "connection failed");
                break;
            }
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        on_frames(&inner, frames);
    }
    if let Some(inner) = inner.upgrade() {
        inner.teardown();
    }
}

fn on_frames(inner: &Arc<WorkerInner>, frames: FrameSet) {
    let message = match Message::parse(frames) {
        Ok(m) => m,
        Err(e) => {
            debug!(error = %e, "dropping frame set");
            return;
        }
    };
    match message.invocation() {
        Ok(Invocation::Response(response)) => inner.on_response(response),
        Ok(Invocation::Request(request)) => {
            let source = message.from_address().unwrap_or_default();
            let id = message.message_id().to_owned();
            let worker = Worker { inner: inner.clone() };
            inner.runtime.spawn(async move { worker.on_request(source, id, request).await });
        }
        Err(e) => debug!(message_id = message.message_id(), error = %e, "dropping message"),
    }
}

impl Worker {
    async fn on_request(self, source: Address, id: String, request: Request) {
        let outcome = if request.function == STOP_SERVICE {
            self.inner.wants_service.store(false, Ordering::SeqCst);
            self.inner.is_service.store(false, Ordering::SeqCst);
            self.broker().call("unregister", ()).await.map_err(|e| e.to_string())
        } else {
            let performed = match self.binding() {
                Some(binding) => binding.service.perform(source.clone(), request).await,
                None => Err(DispatchError::NotAvailable(request.function)),
            };
            performed.map_err(|e| e.to_string())
        };

        let response = match outcome {
            Ok(value) => Invocation::response(id, value),
            Err(description) => Invocation::error(id, description),
        };
        let sent = Message::new_direct(&source, &response)
            .map_err(Error::from)
            .and_then(|m| self.inner.transport.send(m.into_segments()).map_err(Error::from));
        if let Err(e) = sent {
            debug!(address = %source, error = %e, "response not sent");
        }
    }
}

async fn heartbeat_loop(inner: Weak<WorkerInner>, period: Duration) {
    let Some(start) = tokio::time::Instant::now().checked_add(period) else {
        return;
    };
    let mut ticker = tokio::time::interval_at(start, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let worker = Worker { inner };
        let beat = worker.broker().with_async_timeout(period).call("heartbeat", ()).await;
        match beat {
            Ok(Value::Bool(false)) if worker.wants_service() => {
                if worker.inner.is_service.swap(false, Ordering::SeqCst) {
                    warn!(service = ?worker.service_name(), "broker lost the registration, registering again");
                }
                if let Err(e) = worker.register(false).await {
                    warn!(error = %e, "Heartbeat: registration failed");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Heartbeat: {}", e),
        }
    }
}

/// Calls functions on one target, in any of the three styles.
#[derive(Clone)]
pub struct Invoker {
    worker: Worker,
    target: Target,
    timeout: Option<Duration>,
    async_timeout: Duration,
}

impl Invoker {
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Deadline of `call_blocking`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Deadline of `call`.
    pub fn with_async_timeout(mut self, timeout: Duration) -> Self {
        self.async_timeout = timeout;
        self
    }

    /// Builds the message without sending it.
    pub fn message(&self, function: &str, args: impl Into<Arguments>) -> Result<Message> {
        self.target.message(function, args)
    }

    /// Sends the call; the outcome arrives on the returned future.
    pub fn send(&self, function: &str, args: impl Into<Arguments>) -> Result<InvokeFuture> {
        self.worker.call(&self.target, function, args)
    }

    /// Sends the call and awaits its result.
    ///
    /// # Errors
    /// The remote error, `Error::Timeout` after the async deadline, or
    /// `Error::ConnectionLost`.
    pub async fn call(&self, function: &str, args: impl Into<Arguments>) -> Result<Value> {
        let future = self.send(function, args)?;
        let id = future.message_id().to_owned();
        match tokio::time::timeout(self.async_timeout, future).await {
            Ok(result) => result,
            Err(_) => {
                self.worker.abandon(&id);
                Err(Error::Timeout)
            }
        }
    }

    /// Sends the call and blocks the calling thread until it resolves.
    ///
    /// # Errors
    /// `Error::BlockingInRuntime` when called from async code, otherwise as `call`.
    pub fn call_blocking(&self, function: &str, args: impl Into<Arguments>) -> Result<Value> {
        ensure_blocking_allowed()?;
        let future = self.send(function, args)?;
        let result = future.sync(self.timeout);
        if matches!(result, Err(Error::Timeout)) {
            self.worker.abandon(future.message_id());
        }
        result
    }
}

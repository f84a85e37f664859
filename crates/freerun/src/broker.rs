//! # Broker
//!
//! Owns the listening socket and the registry. Every frame set a peer sends is
//! classified by its distributing mode and either executed against the registry,
//! forwarded to a raw peer address, or forwarded to the owner of a service name.
//!
//! ## Architecture
//!
//! One router task owns the [`Manager`] and the table of open connections. An
//! accept task and one reader task per connection feed it [`Event`]s over a
//! channel, so every registry read and write happens on the router, in order.
//! Registry RPCs are queued and run at the start of the router's next turn,
//! never inside the routing step that received them. Calls answered by a
//! [`ManagerExtension`] run in their own task and come back as an event.
//!
//! ## Invariants
//! - **Router Never Dies**: failures are per message. Malformed input without an
//!   identifiable sender is logged and dropped; everything else is answered with
//!   an error response to the sender.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use freerpc::Address;
use freerpc::DistributingMode;
use freerpc::FrameSet;
use freerpc::Invocation;
use freerpc::Message;

use crate::config::BrokerConfig;
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::manager::Direction;
use crate::manager::Manager;
use crate::manager::ManagerExtension;
use crate::runtime::Runtime;
use crate::transport::TcpTransport;
use crate::transport::Transport;
use crate::transport::TransportError;

/// Upper bound of the sweep period, in seconds.
const MAX_SWEEP_INTERVAL: u64 = 24 * 60 * 60;

/// Inputs of the router task.
enum Event {
    Opened(Address, Arc<dyn Transport>),
    Frames(Address, FrameSet),
    Closed(Address),
    /// A finished extension call, answered like a registry RPC.
    Replied(Address, Invocation),
}

/// Allocates connection identities: a zero byte followed by a big-endian
/// counter with a random start.
struct AddressAllocator(AtomicU32);

impl AddressAllocator {
    fn new() -> Self {
        Self(AtomicU32::new(rand::random()))
    }

    fn next(&self) -> Address {
        let n = self.0.fetch_add(1, Ordering::Relaxed);
        let mut bytes = Vec::with_capacity(5);
        bytes.push(0);
        bytes.extend_from_slice(&n.to_be_bytes());
        Address::new(bytes)
    }
}

/// A running broker.
pub struct Broker {
    local_addr: Option<SocketAddr>,
    events: mpsc::UnboundedSender<Event>,
    addresses: Arc<AddressAllocator>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    accept: Option<JoinHandle<()>>,
    runtime: Runtime,
}

impl Broker {
    /// Binds the configured endpoint and starts routing on `runtime`.
    pub async fn bind(config: BrokerConfig, runtime: &Runtime) -> Result<Broker> {
        Self::bind_with(config, ManagerExtension::default(), runtime).await
    }

    /// Like [`Broker::bind`], with extra registry behavior.
    pub async fn bind_with(config: BrokerConfig, extension: ManagerExtension, runtime: &Runtime) -> Result<Broker> {
        let endpoint = Endpoint::parse(&config.bind)?;
        let listener = runtime
            .run(async move { TcpListener::bind(endpoint.bind_addr()).await })
            .await?
            .map_err(TransportError::from)?;
        let local_addr = listener.local_addr().map_err(TransportError::from)?;

        let mut broker = Self::start_with(config, extension, runtime);
        broker.local_addr = Some(local_addr);
        broker.accept = Some(runtime.spawn(accept_loop(
            listener,
            broker.events.clone(),
            broker.addresses.clone(),
        )));
        info!(address = %local_addr, "broker listening");
        Ok(broker)
    }

    /// Blocking variant of [`Broker::bind`].
    pub fn bind_blocking(config: BrokerConfig, runtime: &Runtime) -> Result<Broker> {
        let rt = runtime.clone();
        runtime.block_on(async move { Broker::bind(config, &rt).await })?
    }

    /// Starts a broker without a listener. Peers join through [`Broker::attach`].
    pub fn start(config: BrokerConfig, runtime: &Runtime) -> Broker {
        Self::start_with(config, ManagerExtension::default(), runtime)
    }

    pub fn start_with(config: BrokerConfig, extension: ManagerExtension, runtime: &Runtime) -> Broker {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let router = Router::new(&config, extension, events_tx.clone());
        runtime.spawn(router.run(events_rx, shutdown_rx, config));
        Broker {
            local_addr: None,
            events: events_tx,
            addresses: Arc::new(AddressAllocator::new()),
            shutdown: Mutex::new(Some(shutdown_tx)),
            accept: None,
            runtime: runtime.clone(),
        }
    }

    /// Connects an already established transport as a new peer.
    pub fn attach(&self, transport: Box<dyn Transport>) -> Address {
        let address = self.addresses.next();
        let transport: Arc<dyn Transport> = Arc::from(transport);
        let _ = self.events.send(Event::Opened(address.clone(), transport.clone()));
        self.runtime.spawn(read_loop(address.clone(), transport, self.events.clone()));
        address
    }

    /// The bound socket address, when listening on TCP.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// The `tcp://` endpoint workers should connect to.
    pub fn endpoint(&self) -> Option<String> {
        self.local_addr.map(|a| format!("tcp://{}", a))
    }

    /// Stops accepting and routing. Every connection is dropped immediately.
    pub fn close(&self) {
        if let Some(accept) = &self.accept {
            accept.abort();
        }
        let tx = self.shutdown.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(tx) = tx {
            let _ = tx.send(());
            info!("broker closed");
        }
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.close();
    }
}

async fn accept_loop(
    listener: TcpListener,
    events: mpsc::UnboundedSender<Event>,
    addresses: Arc<AddressAllocator>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let address = addresses.next();
                debug!(address = %address, peer = %peer, "connection accepted");
                let transport: Arc<dyn Transport> = Arc::new(TcpTransport::from_stream(stream));
                if events.send(Event::Opened(address.clone(), transport.clone())).is_err() {
                    return;
                }
                tokio::spawn(read_loop(address, transport, events.clone()));
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
}

async fn read_loop(address: Address, transport: Arc<dyn Transport>, events: mpsc::UnboundedSender<Event>) {
    loop {
        match transport.recv().await {
            Ok(Some(frames)) => {
                if events.send(Event::Frames(address.clone(), frames)).is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(address = %address, error = %e, "connection failed");
                break;
            }
        }
    }
    let _ = events.send(Event::Closed(address));
}

/// The single owner of the registry and the connection table.
struct Router {
    manager: Manager,
    connections: HashMap<Address, Arc<dyn Transport>>,
    local_jobs: VecDeque<(Address, Message)>,
    events: mpsc::UnboundedSender<Event>,
}

impl Router {
    fn new(config: &BrokerConfig, extension: ManagerExtension, events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            manager: Manager::new(config, Instant::now()).with_extension(extension),
            connections: HashMap::new(),
            local_jobs: VecDeque::new(),
            events,
        }
    }

    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<Event>,
        mut shutdown: oneshot::Receiver<()>,
        config: BrokerConfig,
    ) {
        let period = config
            .sweep_interval()
            .clamp(Duration::from_millis(1), Duration::from_secs(MAX_SWEEP_INTERVAL));
        let mut sweep = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            while let Some((source, message)) = self.local_jobs.pop_front() {
                self.execute_local(source, message);
            }
            tokio::select! {
                _ = &mut shutdown => break,
                event = events.recv() => match event {
                    Some(event) => self.on_event(event),
                    None => break,
                },
                _ = sweep.tick() => self.sweep(),
            }
        }

        for (_, transport) in self.connections.drain() {
            transport.close();
        }
        debug!("router stopped");
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Opened(address, transport) => {
                self.connections.insert(address, transport);
            }
            Event::Frames(source, frames) => self.route(source, frames),
            Event::Closed(address) => {
                if let Some(transport) = self.connections.remove(&address) {
                    transport.close();
                    debug!(address = %address, "connection closed");
                }
            }
            Event::Replied(target, response) => self.reply(&target, &response),
        }
    }

    fn sweep(&mut self) {
        for (address, service) in self.manager.sweep(Instant::now()) {
            match service {
                Some(name) => info!(address = %address, service = %name, "evicted silent service"),
                None => debug!(address = %address, "evicted silent peer"),
            }
        }
    }

    fn route(&mut self, source: Address, frames: FrameSet) {
        let message = match Message::parse(frames) {
            Ok(m) => m,
            Err(e) => {
                debug!(address = %source, error = %e, "dropping frame set");
                return;
            }
        };
        self.manager.statistics(&source, Direction::Received, message.payload_len(), Instant::now());

        let mode = match message.distributing_mode() {
            Ok(mode) => mode,
            Err(e) => {
                debug!(address = %source, message_id = message.message_id(), error = %e, "dropping message");
                return;
            }
        };
        trace!(address = %source, message_id = message.message_id(), mode = %mode, "routing");

        match mode {
            DistributingMode::Broker => self.local_jobs.push_back((source, message)),
            DistributingMode::Direct => {
                let target = Address::from(message.distributing_address().unwrap_or_default());
                self.forward(source, target, message);
            }
            DistributingMode::Service => {
                let name = String::from_utf8_lossy(message.distributing_address().unwrap_or_default()).into_owned();
                match self.manager.address_of_service(&name) {
                    Some(target) => {
                        let target = target.clone();
                        self.forward(source, target, message);
                    }
                    None => {
                        let id = message.message_id().to_owned();
                        self.reply_error(&source, &id, format!("Service {} not exist.", name));
                    }
                }
            }
        }
    }

    fn forward(&mut self, source: Address, target: Address, message: Message) {
        let id = message.message_id().to_owned();
        if !self.connections.contains_key(&target) {
            self.reply_error(&source, &id, format!("Peer [{}] not connected.", target));
            return;
        }
        match message.relay(&source) {
            Ok(relayed) => {
                if let Err(e) = self.send(&target, relayed) {
                    self.reply_error(&source, &id, e.to_string());
                }
            }
            Err(e) => self.reply_error(&source, &id, e.to_string()),
        }
    }

    /// Runs a queued registry RPC and answers it under the same message ID.
    fn execute_local(&mut self, source: Address, message: Message) {
        let id = message.message_id().to_owned();
        let request = match message.invocation() {
            Ok(Invocation::Request(request)) => request,
            Ok(Invocation::Response(_)) => {
                debug!(address = %source, message_id = %id, "dropping response addressed to the broker");
                return;
            }
            Err(e) => {
                self.reply_error(&source, &id, e.to_string());
                return;
            }
        };

        let now = Instant::now();
        let owns_service = self.manager.heartbeat(&source, now);
        if let Some(service) = self.manager.extension_for(&request.function) {
            let service = service.clone();
            let events = self.events.clone();
            tokio::spawn(async move {
                let response = match service.perform(source.clone(), request).await {
                    Ok(value) => Invocation::response(id, value),
                    Err(e) => Invocation::error(id, e.to_string()),
                };
                let _ = events.send(Event::Replied(source, response));
            });
            return;
        }
        let outcome = if request.function == "heartbeat" {
            Ok(owns_service.into())
        } else {
            self.manager.perform(&source, request, now)
        };

        let response = match outcome {
            Ok(value) => Invocation::response(id, value),
            Err(description) => Invocation::error(id, description),
        };
        self.reply(&source, &response);
    }

    fn reply_error(&mut self, target: &Address, id: &str, description: String) {
        self.reply(target, &Invocation::error(id, description));
    }

    fn reply(&mut self, target: &Address, response: &Invocation) {
        let sent = Message::new_from_broker(&Address::default(), response)
            .map_err(TransportError::from)
            .and_then(|message| self.send(target, message));
        if let Err(e) = sent {
            debug!(address = %target, error = %e, "reply not delivered");
        }
    }

    fn send(&mut self, target: &Address, message: Message) -> std::result::Result<(), TransportError> {
        let transport = self
            .connections
            .get(target)
            .ok_or_else(|| TransportError::ConnectionLost(format!("Peer [{}] not connected.", target)))?;
        self.manager.statistics(target, Direction::Sent, message.payload_len(), Instant::now());
        transport.send(message.into_segments())
    }
}

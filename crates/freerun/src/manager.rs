//! # Service Registry
//!
//! Tracks which peer owns which service name, when each peer was last heard
//! from, and how much traffic each peer moved.
//!
//! ## Invariants
//! - **One Owner Per Name, One Name Per Owner**: `services` (name to record) and
//!   `workers` (address to name) are kept as exact inverses.
//! - **Single Writer**: the broker's router task owns the `Manager`; nothing here
//!   locks. Every time-dependent operation takes `now` so the state machine can be
//!   driven deterministically.
//!
//! A [`ManagerExtension`] adds broker-level RPCs and a check run before every
//! registration. The built-in RPCs keep their names; an extension method with
//! the same name as one of them is never reached.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use tracing::info;

use freerpc::Address;
use freerpc::PROTOCOL;
use freerpc::Request;
use freerpc::Value;

use crate::config::BrokerConfig;
use crate::dispatch::DispatchError;
use crate::dispatch::Param;
use crate::dispatch::Service;
use crate::dispatch::bind_arguments;

/// Registration conflicts, reported to the caller as remote errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The name belongs to another peer and `force` was not given.
    NameOccupied(String),
    /// The caller already owns the given (different) name.
    AlreadyRegistered(String),
    /// The registration check refused the request.
    Rejected(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NameOccupied(name) => write!(f, "Service name [{}] occupied.", name),
            Self::AlreadyRegistered(name) => {
                write!(f, "The current worker has registered as [{}].", name)
            }
            Self::Rejected(reason) => f.write_str(reason),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Message and byte counters of one peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    pub received_messages: u64,
    pub received_bytes: u64,
    pub sent_messages: u64,
    pub sent_bytes: u64,
}

impl Statistics {
    fn record(&mut self, direction: Direction, bytes: usize) {
        match direction {
            Direction::Received => {
                self.received_messages += 1;
                self.received_bytes += bytes as u64;
            }
            Direction::Sent => {
                self.sent_messages += 1;
                self.sent_bytes += bytes as u64;
            }
        }
    }

    pub fn to_value(&self) -> Value {
        Value::map([
            ("Received Message", Value::from(self.received_messages)),
            ("Received Bytes", Value::from(self.received_bytes)),
            ("Sent Message", Value::from(self.sent_messages)),
            ("Sent Bytes", Value::from(self.sent_bytes)),
        ])
    }
}

/// Traffic direction, seen from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Received,
    Sent,
}

#[derive(Debug, Clone)]
struct ServiceRecord {
    address: Address,
    interfaces: Vec<Value>,
    registered_at: Instant,
    stats: Statistics,
}

#[derive(Debug, Clone)]
struct NonServiceRecord {
    first_seen: Instant,
    last_seen: Instant,
    stats: Statistics,
}

type RegistrationCheck = Arc<dyn Fn(&Address, &str, &[Value]) -> Result<(), String> + Send + Sync>;

/// Additions to the broker's registry.
#[derive(Clone, Default)]
pub struct ManagerExtension {
    service: Option<Service>,
    check: Option<RegistrationCheck>,
}

impl ManagerExtension {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves the methods of `service` as broker RPCs. Handlers see the caller
    /// in [`Call::source`](crate::dispatch::Call::source).
    pub fn service(mut self, service: Service) -> Self {
        self.service = Some(service);
        self
    }

    /// Runs `check` with the caller, the name and the interfaces before every
    /// registration. An `Err` refuses it and is returned to the caller verbatim.
    pub fn check_registration<F>(mut self, check: F) -> Self
    where
        F: Fn(&Address, &str, &[Value]) -> Result<(), String> + Send + Sync + 'static,
    {
        self.check = Some(Arc::new(check));
        self
    }
}

impl fmt::Debug for ManagerExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerExtension")
            .field("service", &self.service)
            .field("check", &self.check.is_some())
            .finish()
    }
}

/// The registry state machine.
#[derive(Debug)]
pub struct Manager {
    services: HashMap<String, ServiceRecord>,
    workers: HashMap<Address, String>,
    activities: HashMap<Address, Instant>,
    nonservice: HashMap<Address, NonServiceRecord>,
    previous_gc: Instant,
    livetime: Duration,
    gc_interval: Duration,
    extension: ManagerExtension,
}

impl Manager {
    pub fn new(config: &BrokerConfig, now: Instant) -> Self {
        Self {
            services: HashMap::new(),
            workers: HashMap::new(),
            activities: HashMap::new(),
            nonservice: HashMap::new(),
            previous_gc: now,
            livetime: config.heartbeat_livetime(),
            gc_interval: config.nonservice_gc_interval(),
            extension: ManagerExtension::default(),
        }
    }

    pub fn with_extension(mut self, extension: ManagerExtension) -> Self {
        self.extension = extension;
        self
    }

    /// The extension service answering `function`, when it is not a built-in RPC.
    pub fn extension_for(&self, function: &str) -> Option<&Service> {
        if registry_params(function).is_some() {
            return None;
        }
        self.extension.service.as_ref()
    }

    /// Makes `source` the owner of `name`.
    ///
    /// With `force`, a different current owner is displaced. The new record starts
    /// with zeroed counters; any non-service counters of `source` are discarded.
    pub fn register_as_service(
        &mut self,
        source: &Address,
        name: &str,
        interfaces: Vec<Value>,
        force: bool,
        now: Instant,
    ) -> Result<(), RegistryError> {
        if let Some(check) = &self.extension.check {
            check(source, name, &interfaces).map_err(RegistryError::Rejected)?;
        }
        if let Some(owned) = self.workers.get(source) {
            if owned != name {
                return Err(RegistryError::AlreadyRegistered(owned.clone()));
            }
        }
        if let Some(existing) = self.services.get(name) {
            if !force {
                return Err(RegistryError::NameOccupied(name.to_owned()));
            }
            if existing.address != *source {
                let displaced = existing.address.clone();
                self.workers.remove(&displaced);
                info!(service = name, address = %displaced, "Service [{}] displaced.", name);
            }
        }

        if interfaces.is_empty() {
            info!(service = name, address = %source, "Service [{}] registered.", name);
        } else {
            let listed: Vec<String> = interfaces.iter().map(Value::to_string).collect();
            info!(service = name, address = %source, "Service [{}] registered as [{}].", name, listed.join(", "));
        }

        self.services.insert(
            name.to_owned(),
            ServiceRecord {
                address: source.clone(),
                interfaces,
                registered_at: now,
                stats: Statistics::default(),
            },
        );
        self.workers.insert(source.clone(), name.to_owned());
        self.nonservice.remove(source);
        Ok(())
    }

    /// Drops the service owned by `source`, if any. Returns the dropped name.
    pub fn unregister(&mut self, source: &Address) -> Option<String> {
        let name = self.workers.remove(source)?;
        match self.services.get(&name) {
            Some(record) if record.address == *source => {
                self.services.remove(&name);
                info!(service = %name, address = %source, "Service [{}] unregistered.", name);
                Some(name)
            }
            _ => None,
        }
    }

    /// Records a sign of life. Returns whether `source` owns a service.
    pub fn heartbeat(&mut self, source: &Address, now: Instant) -> bool {
        self.activities.insert(source.clone(), now);
        self.workers.contains_key(source)
    }

    pub fn address_of_service(&self, name: &str) -> Option<&Address> {
        self.services.get(name).map(|r| &r.address)
    }

    pub fn service_of(&self, source: &Address) -> Option<&str> {
        self.workers.get(source).map(String::as_str)
    }

    /// Registered names, sorted.
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn service_statistics(&self, name: &str) -> Option<Statistics> {
        self.services.get(name).map(|r| r.stats)
    }

    pub fn nonservice_statistics(&self, source: &Address) -> Option<Statistics> {
        self.nonservice.get(source).map(|r| r.stats)
    }

    /// One map per service, then one per non-service peer.
    pub fn service_meta(&self, now: Instant) -> Vec<Value> {
        let mut services: Vec<(&String, &ServiceRecord)> = self.services.iter().collect();
        services.sort_by(|a, b| a.0.cmp(b.0));
        let mut nonservice: Vec<(&Address, &NonServiceRecord)> = self.nonservice.iter().collect();
        nonservice.sort_by(|a, b| a.0.cmp(b.0));

        let services = services.into_iter().map(|(name, r)| {
            Value::map([
                ("ServiceName", Value::from(name.as_str())),
                ("Address", Value::from(r.address.as_bytes())),
                ("Interfaces", Value::Array(r.interfaces.clone())),
                ("OnTime", Value::from(now.saturating_duration_since(r.registered_at).as_secs_f64())),
                ("Statistics", r.stats.to_value()),
            ])
        });
        let others = nonservice.into_iter().map(|(address, r)| {
            Value::map([
                ("ServiceName", Value::from("")),
                ("Address", Value::from(address.as_bytes())),
                ("Interfaces", Value::from("")),
                ("OnTime", Value::from(now.saturating_duration_since(r.first_seen).as_secs_f64())),
                ("Statistics", r.stats.to_value()),
            ])
        });
        services.chain(others).collect()
    }

    /// Counts one message of `bytes` payload bytes for `source`.
    ///
    /// Peers without a service are tracked in a separate table, collected every
    /// GC interval: entries not seen since the previous collection are dropped.
    pub fn statistics(&mut self, source: &Address, direction: Direction, bytes: usize, now: Instant) {
        match self.workers.get(source).and_then(|name| self.services.get_mut(name)) {
            Some(record) => record.stats.record(direction, bytes),
            None => {
                let record = self.nonservice.entry(source.clone()).or_insert(NonServiceRecord {
                    first_seen: now,
                    last_seen: now,
                    stats: Statistics::default(),
                });
                record.last_seen = now;
                record.stats.record(direction, bytes);
            }
        }

        if now.saturating_duration_since(self.previous_gc) > self.gc_interval {
            let cutoff = self.previous_gc;
            self.nonservice.retain(|_, r| r.last_seen >= cutoff);
            self.previous_gc = now;
        }
    }

    /// Evicts every peer silent for longer than the heartbeat livetime.
    /// Returns the evicted addresses with the service each one owned.
    pub fn sweep(&mut self, now: Instant) -> Vec<(Address, Option<String>)> {
        let livetime = self.livetime;
        let expired: Vec<Address> = self
            .activities
            .iter()
            .filter(|(_, last)| now.saturating_duration_since(**last) > livetime)
            .map(|(address, _)| address.clone())
            .collect();

        expired
            .into_iter()
            .map(|address| {
                self.activities.remove(&address);
                let name = self.unregister(&address);
                (address, name)
            })
            .collect()
    }

    /// Runs a registry RPC on behalf of `source`.
    ///
    /// Arguments are bound against the RPC's parameter list exactly like a worker
    /// binds a service method, so the errors read the same.
    pub fn perform(&mut self, source: &Address, request: Request, now: Instant) -> Result<Value, String> {
        let Request { function, arguments, keyword_arguments } = request;
        let Some(params) = registry_params(&function) else {
            return Err(DispatchError::NotAvailable(function).to_string());
        };
        let args = bind_arguments(&function, &params, arguments, keyword_arguments)
            .map_err(|e| e.to_string())?;

        match function.as_str() {
            "registerAsService" => {
                let name = string_arg(&function, "name", &args[0])?;
                let interfaces = match &args[1] {
                    Value::Nil => Vec::new(),
                    Value::Array(items) => items.clone(),
                    other => vec![other.clone()],
                };
                let force = args[2].as_bool().unwrap_or(false);
                self.register_as_service(source, &name, interfaces, force, now)
                    .map(|()| Value::Nil)
                    .map_err(|e| e.to_string())
            }
            "unregister" => {
                self.unregister(source);
                Ok(Value::Nil)
            }
            "protocol" => Ok(Value::from(String::from_utf8_lossy(PROTOCOL).into_owned())),
            "heartbeat" => Ok(Value::from(self.heartbeat(source, now))),
            "getAddressOfService" => {
                let name = string_arg(&function, "serviceName", &args[0])?;
                Ok(self
                    .address_of_service(&name)
                    .map_or(Value::Nil, |a| Value::from(a.as_bytes())))
            }
            "listServiceNames" => Ok(Value::from(self.service_names())),
            "listServiceMeta" => Ok(Value::Array(self.service_meta(now))),
            "time" => Ok(Value::from(unix_time())),
            _ => Err(DispatchError::NotAvailable(function).to_string()),
        }
    }
}

/// Parameters of each registry RPC, not counting the implicit caller address.
fn registry_params(function: &str) -> Option<Vec<Param>> {
    let params = match function {
        "registerAsService" => vec![
            Param::required("name"),
            Param::optional("interfaces", Value::Nil),
            Param::optional("force", false),
        ],
        "getAddressOfService" => vec![Param::required("serviceName")],
        "unregister" | "protocol" | "heartbeat" | "listServiceNames" | "listServiceMeta" | "time" => {
            Vec::new()
        }
        _ => return None,
    };
    Some(params)
}

fn string_arg(function: &str, name: &str, value: &Value) -> Result<String, String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Binary(b) => Ok(String::from_utf8_lossy(b).into_owned()),
        other => Err(format!(
            "Argument [{}] of function [{}] must be a string, found {}.",
            name, function, other
        )),
    }
}

/// Seconds since the Unix epoch.
pub fn unix_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

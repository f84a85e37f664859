//! Broker and worker settings.
//!
//! Times are seconds as floats, the unit peers already use on the wire
//! (`time()`, `OnTime`). The `Duration` accessors are what the code reads.

use std::time::Duration;

use serde::Deserialize;

use freerpc::DEFAULT_PORT_TCP;
use freerpc::DEFAULT_PORT_WEBSOCKET;
use freerpc::DEFAULT_PORT_WEBSOCKET_SSL;
use freerpc::HEARTBEAT_LIVETIME;

/// Period of the broker's liveness sweep, in seconds.
pub const SWEEP_INTERVAL: f64 = 2.0;

/// Period of the non-service statistics collection, in seconds.
pub const NONSERVICE_GC_INTERVAL: f64 = 10.0;

/// Default deadline of the awaiting invoker, in seconds.
pub const ASYNC_TIMEOUT: f64 = 30.0;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Endpoint to listen on, `tcp://host:port`.
    pub bind: String,
    /// Plain WebSocket port of the external bridge.
    pub websocket_port: u16,
    /// TLS WebSocket port of the external bridge.
    pub websocket_ssl_port: u16,
    pub heartbeat_livetime: f64,
    pub sweep_interval: f64,
    pub nonservice_gc_interval: f64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind: format!("tcp://*:{}", DEFAULT_PORT_TCP),
            websocket_port: DEFAULT_PORT_WEBSOCKET,
            websocket_ssl_port: DEFAULT_PORT_WEBSOCKET_SSL,
            heartbeat_livetime: HEARTBEAT_LIVETIME as f64,
            sweep_interval: SWEEP_INTERVAL,
            nonservice_gc_interval: NONSERVICE_GC_INTERVAL,
        }
    }
}

impl BrokerConfig {
    pub fn with_bind(mut self, bind: impl Into<String>) -> Self {
        self.bind = bind.into();
        self
    }

    pub fn heartbeat_livetime(&self) -> Duration {
        seconds(self.heartbeat_livetime)
    }

    pub fn sweep_interval(&self) -> Duration {
        seconds(self.sweep_interval)
    }

    pub fn nonservice_gc_interval(&self) -> Duration {
        seconds(self.nonservice_gc_interval)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Broker endpoint, `tcp://host:port`.
    pub endpoint: String,
    pub heartbeat_livetime: f64,
    /// Deadline of blocking calls. `None` waits forever.
    pub timeout: Option<f64>,
    /// Deadline of awaited calls.
    pub async_timeout: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            endpoint: format!("tcp://127.0.0.1:{}", DEFAULT_PORT_TCP),
            heartbeat_livetime: HEARTBEAT_LIVETIME as f64,
            timeout: None,
            async_timeout: ASYNC_TIMEOUT,
        }
    }
}

impl WorkerConfig {
    pub fn heartbeat_livetime(&self) -> Duration {
        seconds(self.heartbeat_livetime)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(seconds)
    }

    pub fn async_timeout(&self) -> Duration {
        seconds(self.async_timeout)
    }
}

/// Negative and NaN values clamp to zero, overflowing ones to `Duration::MAX`.
fn seconds(s: f64) -> Duration {
    if s.is_nan() || s <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(s).unwrap_or(Duration::MAX)
}

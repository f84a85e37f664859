//! # freerun
//!
//! A broker and its workers. Workers connect to one [`Broker`] over TCP; the
//! broker keeps a registry of named services and routes calls between peers by
//! service name or by raw connection address.
//!
//! ```text
//!   Worker ──┐                  ┌── Worker (service "Echo")
//!            ├── Broker/Router ─┤
//!   Worker ──┘    (Manager)     └── Worker (service "Clock")
//! ```

pub mod broker;
pub mod config;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod future;
pub mod manager;
pub mod mock_transport;
pub mod runtime;
pub mod transport;
pub mod worker;

#[cfg(test)]
mod tests;

pub use broker::Broker;
pub use config::BrokerConfig;
pub use config::WorkerConfig;
pub use dispatch::Call;
pub use dispatch::Param;
pub use dispatch::Service;
pub use dispatch::ServiceBuilder;
pub use endpoint::Endpoint;
pub use error::Error;
pub use error::Result;
pub use future::InvokeFuture;
pub use manager::ManagerExtension;
pub use runtime::Runtime;
pub use worker::Arguments;
pub use worker::Invoker;
pub use worker::Target;
pub use worker::Worker;
pub use worker::WorkerBuilder;

pub use freerpc::Address;
pub use freerpc::Value;

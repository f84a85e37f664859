//! Parsing of `tcp://host:port` endpoints.

use std::fmt;
use std::str::FromStr;

use freerpc::DEFAULT_PORT_TCP;

use crate::error::Error;
use crate::error::Result;

/// A TCP endpoint. The scheme and port are optional when parsing; a host of
/// `*` means every interface when binding and the loopback when connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split("://").collect();
        let (scheme, rest) = match parts.as_slice() {
            [rest] => ("tcp", *rest),
            [scheme, rest] => (*scheme, *rest),
            _ => return Err(Error::Endpoint(format!("Invalid address: {}", s))),
        };
        if scheme != "tcp" {
            return Err(Error::Endpoint(format!("Invalid protocol \"{}\" of address \"{}\"", scheme, s)));
        }
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| Error::Endpoint(format!("Invalid port \"{}\" of address \"{}\"", port, s)))?;
                (host, port)
            }
            None => (rest, DEFAULT_PORT_TCP),
        };
        if host.is_empty() {
            return Err(Error::Endpoint(format!("Missing host in address: {}", s)));
        }
        Ok(Endpoint { host: host.to_owned(), port })
    }

    /// Socket address string for a listener.
    pub fn bind_addr(&self) -> String {
        let host = if self.host == "*" { "0.0.0.0" } else { &self.host };
        format!("{}:{}", host, self.port)
    }

    /// Socket address string for an outbound connection.
    pub fn connect_addr(&self) -> String {
        let host = if self.host == "*" { "127.0.0.1" } else { &self.host };
        format!("{}:{}", host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Endpoint::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}:{}", self.host, self.port)
    }
}

/// This module implements `Address` which is used for parsing
/// address strings of the form "tcp::192.168.0.10:1234"
use crate::Error;
use anyhow::anyhow;
use std::fmt;
use std::fmt::{Display, Formatter};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

/// Default time the simulated instrument needs to produce one reading.
pub const DEFAULT_SIM_LATENCY: Duration = Duration::from_millis(5);

/// Represents a parsed address string of an instrument we know how to reach.
#[derive(Clone, Debug, PartialEq)]
pub enum Address {
    /// SCPI over a raw socket, e.g. a LAN to GPIB bridge
    Tcp { addr: SocketAddr },
    /// The built-in simulated sourcemeter
    Sim { latency: Duration },
}

fn invalid(addr: &str) -> Error {
    Error::argument(anyhow!("Invalid address: `{}`", addr))
}

impl Address {
    /// Create a new `Address` by parsing the given address string.
    ///
    /// Accepted forms are `tcp::<host>:<port>`, `sim` and `sim::<latency-ms>`.
    pub fn parse(addr: &str) -> crate::Result<Self> {
        let splits: Vec<_> = addr.trim().split("::").map(|x| x.to_string()).collect();
        let kind = splits[0].to_lowercase();

        if kind == "tcp" {
            // tcp::192.168.0.1:1234
            if splits.len() != 2 {
                return Err(invalid(addr));
            }
            let mut resolved = splits[1]
                .to_socket_addrs()
                .map_err(|_| invalid(addr))?;
            let addr = resolved.next().ok_or_else(|| invalid(addr))?;
            Ok(Address::Tcp { addr })
        } else if kind == "sim" {
            // sim or sim::10
            let latency = match splits.len() {
                1 => DEFAULT_SIM_LATENCY,
                2 if splits[1].is_empty() => DEFAULT_SIM_LATENCY,
                2 => {
                    let millis: u64 = splits[1].parse().map_err(|_| invalid(addr))?;
                    Duration::from_millis(millis)
                }
                _ => return Err(invalid(addr)),
            };
            Ok(Address::Sim { latency })
        } else {
            Err(Error::argument(anyhow!(
                "Unsupported address `{}`, expected `tcp::<host>:<port>` or `sim`",
                addr
            )))
        }
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> Self {
        match addr {
            Address::Tcp { addr } => format!("tcp::{}", addr),
            Address::Sim { latency } => format!("sim::{}", latency.as_millis()),
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let x: String = self.clone().into();
        f.write_str(&x)
    }
}

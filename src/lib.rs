//! Blocking TCP transport for pools of redundant servers.
//!
//! The crate resolves a list of candidate hosts into IPv4/IPv6 address sets,
//! opens a single connection to the first reachable address (IPv6 first unless
//! told otherwise) and wraps it in a channel whose reads and writes are bounded
//! by millisecond timeouts.
//!
//! ```no_run
//! use hostsock::net::{BlockingChannel, TransportConfig};
//!
//! let config = TransportConfig::new().recv_timeout_ms(2000);
//! let mut channel = BlockingChannel::connect(
//!     [("primary.example.net", 2775u16), ("10.0.0.12", 2775)],
//!     config,
//! )?;
//! channel.write(b"ping", None)?;
//! let _reply = channel.read_all(4)?;
//! channel.close();
//! # Ok::<(), hostsock::net::Error>(())
//! ```

pub mod net;

//! Network layer
//!
//! Resolution of candidate hosts, dual-stack connection establishment and a
//! blocking, timeout-bounded byte channel over the resulting socket.
//!
//! Data flows one way: [`Resolver::resolve`] produces [`Host`] values,
//! [`ConnectionEstablisher::open`] turns them into one connected socket, and
//! [`BlockingChannel`] wraps that socket for reads and writes until
//! [`BlockingChannel::close`].

pub mod channel;
pub mod config;
pub mod dns;
pub mod host;
pub mod resolver;
pub mod tcp;
pub mod trace;

use std::io;

pub use channel::{BlockingChannel, ChannelState};
pub use config::{AddressFamilyPolicy, SocketTimeout, TransportConfig};
pub use dns::{DnsLookup, SystemDns};
pub use host::{Host, Port};
pub use resolver::{AddressParser, Literal, Resolver};
pub use tcp::{ConnectionEstablisher, Interest, Readiness, SocketExt};
pub use trace::{TraceSink, Tracer, TracingSink};

/// Result type for network operations
pub type Result<T> = std::result::Result<T, Error>;

/// Network operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid address format: {0}")]
    InvalidAddress(String),

    #[error("Address resolution failed: {0}")]
    ResolutionFailed(String),

    #[error("No valid hosts were found")]
    NoHostsResolved,

    #[error("Unknown service name: {0}")]
    UnknownService(String),

    #[error("Could not connect to any of the specified hosts ({attempts} attempt(s))")]
    Connection { attempts: usize },

    #[error("{context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid channel state: {0}")]
    InvalidState(String),
}

impl Error {
    pub(crate) fn transport(context: impl Into<String>, source: io::Error) -> Self {
        Error::Transport {
            context: context.into(),
            source,
        }
    }

    /// Every candidate host failed to resolve
    pub fn is_resolution(&self) -> bool {
        matches!(self, Error::NoHostsResolved)
    }

    /// Every resolved address refused the connection
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection { .. })
    }

    /// A readiness wait elapsed without progress
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// An OS-level I/O failure on an open channel
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport { .. })
    }

    /// OS error code behind a transport failure, if any
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Transport { source, .. } | Error::Io(source) => source.raw_os_error(),
            _ => None,
        }
    }
}

//! Resolved hosts
//!
//! A [`Host`] is what the resolver hands to the connection establisher: the
//! name the caller gave, the port, and the IPv4/IPv6 addresses found for it.
//! Hosts are built once and never modified.

use std::ffi::{CStr, CString};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::Mutex;

use super::{Error, Result};

/// Destination port: numeric, or a service name such as `"http"`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Port {
    /// Numeric port
    Number(u16),
    /// Symbolic service name, mapped with the system services database
    Service(String),
}

impl Port {
    /// Numeric value of this port.
    ///
    /// Service names are looked up as TCP services with `getservbyname`.
    pub fn number(&self) -> Result<u16> {
        match self {
            Port::Number(port) => Ok(*port),
            Port::Service(name) => lookup_service(name),
        }
    }
}

/// Serializes access to the services database; `getservbyname` returns a
/// pointer into a static buffer shared by all threads.
static SERVICES_DB: Mutex<()> = Mutex::new(());

fn lookup_service(name: &str) -> Result<u16> {
    let c_name = CString::new(name).map_err(|_| Error::UnknownService(name.to_string()))?;
    let proto: &CStr = c"tcp";

    // The lock guards no data, so a poisoned lock is still usable
    let _guard = SERVICES_DB.lock().unwrap_or_else(|e| e.into_inner());

    // SAFETY: both arguments are valid NUL-terminated strings that outlive
    // the call; SERVICES_DB is held so no other thread in this crate touches
    // the static entry until we have copied the port out.
    let entry = unsafe { libc::getservbyname(c_name.as_ptr(), proto.as_ptr()) };
    if entry.is_null() {
        return Err(Error::UnknownService(name.to_string()));
    }

    // SAFETY: `entry` is non-null and points at the static servent filled by
    // the call above; the lock is still held.
    let raw = unsafe { (*entry).s_port };

    // s_port holds the port in network byte order in the low 16 bits
    Ok(u16::from_be(raw as u16))
}

impl From<u16> for Port {
    fn from(port: u16) -> Self {
        Port::Number(port)
    }
}

impl From<&str> for Port {
    fn from(port: &str) -> Self {
        match port.parse::<u16>() {
            Ok(number) => Port::Number(number),
            Err(_) => Port::Service(port.to_string()),
        }
    }
}

impl From<String> for Port {
    fn from(port: String) -> Self {
        Port::from(port.as_str())
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Port::Number(port) => write!(f, "{}", port),
            Port::Service(name) => f.write_str(name),
        }
    }
}

/// A resolved endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    name: String,
    port: Port,
    ipv4: Vec<Ipv4Addr>,
    ipv6: Vec<Ipv6Addr>,
}

impl Host {
    /// Create a host from its parts. Address order is kept as given.
    pub fn new(
        name: impl Into<String>,
        port: impl Into<Port>,
        ipv4: Vec<Ipv4Addr>,
        ipv6: Vec<Ipv6Addr>,
    ) -> Self {
        Host {
            name: name.into(),
            port: port.into(),
            ipv4,
            ipv6,
        }
    }

    /// Name or literal address supplied by the caller
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Destination port
    pub fn port(&self) -> &Port {
        &self.port
    }

    /// IPv4 addresses in resolution order
    pub fn ipv4_addresses(&self) -> &[Ipv4Addr] {
        &self.ipv4
    }

    /// IPv6 addresses in resolution order
    pub fn ipv6_addresses(&self) -> &[Ipv6Addr] {
        &self.ipv6
    }

    /// Total number of addresses across both families
    pub fn address_count(&self) -> usize {
        self.ipv4.len() + self.ipv6.len()
    }

    /// True when neither family has an address
    pub fn is_empty(&self) -> bool {
        self.ipv4.is_empty() && self.ipv6.is_empty()
    }

    /// All addresses, IPv6 first
    pub fn addresses(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.ipv6
            .iter()
            .map(|ip| IpAddr::V6(*ip))
            .chain(self.ipv4.iter().map(|ip| IpAddr::V4(*ip)))
    }

    /// IPv6 socket addresses for the given numeric port
    pub fn ipv6_socket_addrs(&self, port: u16) -> impl Iterator<Item = SocketAddr> + '_ {
        self.ipv6
            .iter()
            .map(move |ip| SocketAddr::V6(SocketAddrV6::new(*ip, port, 0, 0)))
    }

    /// IPv4 socket addresses for the given numeric port
    pub fn ipv4_socket_addrs(&self, port: u16) -> impl Iterator<Item = SocketAddr> + '_ {
        self.ipv4
            .iter()
            .map(move |ip| SocketAddr::V4(SocketAddrV4::new(*ip, port)))
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.port)
    }
}

/// Join addresses with ", " for trace output
pub(crate) fn join_addrs<T: fmt::Display>(addrs: &[T]) -> String {
    addrs
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

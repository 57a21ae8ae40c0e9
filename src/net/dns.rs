//! DNS record lookups
//!
//! The resolver talks to DNS through the [`DnsLookup`] trait so lookups can be
//! replaced in tests. [`SystemDns`] is the real implementation: A, AAAA and PTR
//! records come from a synchronous hickory resolver configured from the
//! system (`/etc/resolv.conf`, hosts file), and the forward name lookup goes
//! through the platform resolver so local aliases such as `localhost` resolve
//! the way other programs see them.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};

use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::Resolver;
use once_cell::sync::OnceCell;

use super::{Error, Result};

/// Source of DNS answers for the resolver
pub trait DnsLookup: Send + Sync {
    /// AAAA records for `name`, in response order.
    ///
    /// A name without AAAA records is `Ok(vec![])`; `Err` is reserved for a
    /// lookup that could not be performed.
    fn lookup_aaaa(&self, name: &str) -> Result<Vec<Ipv6Addr>>;

    /// A records for `name`, in response order. Same error contract as
    /// [`lookup_aaaa`](Self::lookup_aaaa).
    fn lookup_a(&self, name: &str) -> Result<Vec<Ipv4Addr>>;

    /// Plain forward lookup of `name` to a single IPv4 address, the way the
    /// platform resolver answers it (hosts file, local aliases).
    fn lookup_host(&self, name: &str) -> Option<Ipv4Addr>;

    /// Reverse lookup of `ip` to a host name
    fn reverse(&self, ip: IpAddr) -> Option<String>;
}

/// DNS lookups against the system configuration
#[derive(Default)]
pub struct SystemDns {
    resolver: OnceCell<Resolver>,
}

impl SystemDns {
    /// Create a lookup backend. The underlying resolver is built on first use.
    pub fn new() -> Self {
        SystemDns::default()
    }

    fn resolver(&self) -> Result<&Resolver> {
        self.resolver.get_or_try_init(|| {
            Resolver::from_system_conf().map_err(|e| {
                Error::ResolutionFailed(format!("cannot read system DNS configuration: {}", e))
            })
        })
    }
}

impl fmt::Debug for SystemDns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemDns")
            .field("initialized", &self.resolver.get().is_some())
            .finish()
    }
}

/// "No records" is an empty answer, not a failure
fn empty_on_no_records<T>(name: &str, kind: &str, err: ResolveError) -> Result<Vec<T>> {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => Ok(Vec::new()),
        _ => Err(Error::ResolutionFailed(format!(
            "{} lookup for {} failed: {}",
            kind, name, err
        ))),
    }
}

impl DnsLookup for SystemDns {
    fn lookup_aaaa(&self, name: &str) -> Result<Vec<Ipv6Addr>> {
        match self.resolver()?.ipv6_lookup(name) {
            Ok(lookup) => Ok(lookup.iter().map(|aaaa| aaaa.0).collect()),
            Err(e) => empty_on_no_records(name, "AAAA", e),
        }
    }

    fn lookup_a(&self, name: &str) -> Result<Vec<Ipv4Addr>> {
        match self.resolver()?.ipv4_lookup(name) {
            Ok(lookup) => Ok(lookup.iter().map(|a| a.0).collect()),
            Err(e) => empty_on_no_records(name, "A", e),
        }
    }

    fn lookup_host(&self, name: &str) -> Option<Ipv4Addr> {
        let addrs = (name, 0u16).to_socket_addrs().ok()?;
        addrs.into_iter().find_map(|addr| match addr.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
    }

    fn reverse(&self, ip: IpAddr) -> Option<String> {
        let lookup = self.resolver().ok()?.reverse_lookup(ip).ok()?;
        let name = lookup.iter().next()?.0.to_utf8();
        Some(name.trim_end_matches('.').to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_host_localhost() {
        let dns = SystemDns::new();
        assert_eq!(dns.lookup_host("localhost"), Some(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn test_lookup_host_literal() {
        let dns = SystemDns::new();
        assert_eq!(dns.lookup_host("127.0.0.1"), Some(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn test_lookup_host_unresolvable() {
        let dns = SystemDns::new();
        assert_eq!(dns.lookup_host("name.that.does.not.exist.invalid"), None);
    }
}

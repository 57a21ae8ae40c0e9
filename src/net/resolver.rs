//! Host resolution
//!
//! Turns candidate hosts into [`Host`] values carrying their IPv4 and IPv6
//! address sets. Literal addresses are taken as-is; names are looked up as
//! AAAA and A records plus a plain forward lookup for local aliases.
//!
//! Supported address string formats for [`Resolver::resolve_addrs`]:
//! - "localhost:80" - "localhost 80" - "localhost" (with a default port)
//! - "127.0.0.1:80" - "127.0.0.1 80"
//! - "[::1]:80"     - "[::1] 80"     - "::1" (with a default port)
//! - "mail.example.net:smtp" (service names)

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use super::dns::{DnsLookup, SystemDns};
use super::host::join_addrs;
use super::trace::{TraceSink, Tracer};
use super::{AddressFamilyPolicy, Error, Host, Port, Result, TransportConfig};

/// Parsed address components
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAddress {
    /// The host part (IP address or hostname)
    pub host: String,
    /// The port part, if one was given or defaulted
    pub port: Option<Port>,
}

/// Address parser for "host:port" style strings
pub struct AddressParser;

impl AddressParser {
    /// Parse an address string into host and port components
    ///
    /// # Examples
    /// ```
    /// use hostsock::net::resolver::AddressParser;
    /// use hostsock::net::Port;
    ///
    /// let parsed = AddressParser::parse("localhost:8080", None).unwrap();
    /// assert_eq!(parsed.host, "localhost");
    /// assert_eq!(parsed.port, Some(Port::Number(8080)));
    /// ```
    pub fn parse(addr: &str, default_port: Option<&str>) -> Result<ParsedAddress> {
        let (host, port) = Self::split_address(addr)?;

        let host = host.ok_or_else(|| Error::InvalidAddress(format!("missing host in {:?}", addr)))?;
        let port = port.or(default_port).map(Port::from);

        Ok(ParsedAddress {
            host: host.to_string(),
            port,
        })
    }

    /// Split an address string into host and port parts
    fn split_address(addr: &str) -> Result<(Option<&str>, Option<&str>)> {
        let addr = addr.trim();

        if addr.is_empty() {
            return Err(Error::InvalidAddress("Empty address".to_string()));
        }

        // [::1]:80 or [::1] 80
        if let Some(inner) = addr.strip_prefix('[') {
            let close_bracket = inner.find(']')
                .ok_or_else(|| Error::InvalidAddress("IPv6 address lacks ']'".to_string()))?;

            let host = &inner[..close_bracket];
            let rest = &inner[close_bracket + 1..];

            let port = match rest.chars().next() {
                None => None,
                Some(' ') | Some(':') => Some(rest[1..].trim()).filter(|p| !p.is_empty()),
                Some(_) => {
                    return Err(Error::InvalidAddress(
                        "IPv6 address has wrong port separator".to_string(),
                    ))
                }
            };
            return Ok((Some(host).filter(|h| !h.is_empty()), port));
        }

        if let Some(space_pos) = addr.find(' ') {
            let host = &addr[..space_pos];
            let port = addr[space_pos + 1..].trim();
            return Ok((
                Some(host).filter(|h| !h.is_empty()),
                Some(port).filter(|p| !p.is_empty()),
            ));
        }

        if let Some(colon_pos) = addr.find(':') {
            // More than one colon: bare IPv6 address, no port
            if addr[colon_pos + 1..].contains(':') {
                return Ok((Some(addr), None));
            }

            let host = &addr[..colon_pos];
            let port = &addr[colon_pos + 1..];
            return Ok((
                Some(host).filter(|h| !h.is_empty()),
                Some(port).filter(|p| !p.is_empty()),
            ));
        }

        Ok((Some(addr), None))
    }
}

/// A literal address recognized in a host string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Literal {
    /// Dotted-quad IPv4 address
    V4(Ipv4Addr),
    /// IPv6 address, bracketed or not
    V6(Ipv6Addr),
}

impl Literal {
    /// Classify `host` as a literal address, if it is one
    pub fn detect(host: &str) -> Option<Literal> {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Some(Literal::V4(ip));
        }
        let unbracketed = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        unbracketed.parse::<Ipv6Addr>().ok().map(Literal::V6)
    }

    fn ip(self) -> IpAddr {
        match self {
            Literal::V4(ip) => IpAddr::V4(ip),
            Literal::V6(ip) => IpAddr::V6(ip),
        }
    }
}

/// Resolves candidate hosts into connectable [`Host`] values
pub struct Resolver {
    config: TransportConfig,
    dns: Arc<dyn DnsLookup>,
    tracer: Tracer,
}

impl Resolver {
    /// Create a resolver backed by the system DNS configuration
    pub fn new(config: TransportConfig) -> Self {
        Self::with_dns(config, Arc::new(SystemDns::new()))
    }

    /// Create a resolver with a custom lookup backend
    pub fn with_dns(config: TransportConfig, dns: Arc<dyn DnsLookup>) -> Self {
        let tracer = Tracer::new(None, config.debug);
        Resolver { config, dns, tracer }
    }

    /// Attach a trace sink
    pub fn trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.tracer.set_sink(sink);
        self
    }

    /// Replace the trace sink
    pub fn set_trace_sink(&mut self, sink: Arc<dyn TraceSink>) {
        self.tracer.set_sink(sink);
    }

    /// Configuration in use
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub(crate) fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    /// Resolve (host, port) pairs into an ordered list of hosts.
    ///
    /// Hosts left without usable addresses are dropped: hosts with no
    /// addresses at all, and under a forced family, hosts with no address of
    /// that family. Fails with [`Error::NoHostsResolved`] when nothing is left.
    ///
    /// ```no_run
    /// use hostsock::net::{Resolver, TransportConfig};
    ///
    /// let resolver = Resolver::new(TransportConfig::new());
    /// let hosts = resolver.resolve([("127.0.0.1", 8080u16), ("localhost", 8080)])?;
    /// assert_eq!(hosts[0].name(), "127.0.0.1");
    /// # Ok::<(), hostsock::net::Error>(())
    /// ```
    pub fn resolve<I, H, P>(&self, pairs: I) -> Result<Vec<Host>>
    where
        I: IntoIterator<Item = (H, P)>,
        H: AsRef<str>,
        P: Into<Port>,
    {
        let policy = self.config.family_policy();
        let mut hosts = Vec::new();
        let mut total = 0;

        for (name, port) in pairs {
            let host = self.resolve_host(name.as_ref(), port);
            let unusable = host.is_empty()
                || (policy == AddressFamilyPolicy::Ipv4Only && host.ipv4_addresses().is_empty())
                || (policy == AddressFamilyPolicy::Ipv6Only && host.ipv6_addresses().is_empty());
            if unusable {
                self.tracer.line(format_args!("No usable addresses for {}, skipping", host.name()));
                continue;
            }
            total += host.address_count();
            hosts.push(host);
        }

        self.tracer.line(format_args!(
            "Built connection pool of {} host(s) with {} ip(s) in total",
            hosts.len(),
            total
        ));
        tracing::debug!(hosts = hosts.len(), addresses = total, "resolved host pool");

        if hosts.is_empty() {
            return Err(Error::NoHostsResolved);
        }
        Ok(hosts)
    }

    /// Resolve "host:port" strings. `default_port` applies to entries that
    /// carry no port.
    pub fn resolve_addrs(&self, addrs: &[&str], default_port: Option<&str>) -> Result<Vec<Host>> {
        let mut pairs = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let parsed = AddressParser::parse(addr, default_port)?;
            let port = parsed
                .port
                .ok_or_else(|| Error::InvalidAddress(format!("no port given for {:?}", addr)))?;
            pairs.push((parsed.host, port));
        }
        self.resolve(pairs)
    }

    /// Resolve a single host. Never fails; lookup failures leave the
    /// corresponding address set empty.
    pub fn resolve_host(&self, name: &str, port: impl Into<Port>) -> Host {
        let port = port.into();

        if let Some(literal) = Literal::detect(name) {
            let host_name = self.literal_name(name, literal);
            return match literal {
                Literal::V4(ip) => Host::new(host_name, port, vec![ip], vec![]),
                Literal::V6(ip) => Host::new(host_name, port, vec![], vec![ip]),
            };
        }

        let policy = self.config.family_policy();
        let mut ipv4 = Vec::new();
        let mut ipv6 = Vec::new();

        if policy.allows_ipv6() {
            match self.dns.lookup_aaaa(name) {
                Ok(addrs) => ipv6 = addrs,
                Err(e) => {
                    tracing::debug!(host = name, error = %e, "AAAA lookup failed");
                    self.tracer.line(format_args!("DNS lookup for AAAA records for: {} failed", name));
                }
            }
            if self.tracer.is_enabled() {
                self.tracer.line(format_args!("IPv6 addresses for {}: {}", name, join_addrs(&ipv6)));
            }
        }

        if policy.allows_ipv4() {
            match self.dns.lookup_a(name) {
                Ok(addrs) => ipv4 = addrs,
                Err(e) => {
                    tracing::debug!(host = name, error = %e, "A lookup failed");
                    self.tracer.line(format_args!("DNS lookup for A records for: {} failed", name));
                }
            }
            // Local aliases such as "localhost" may have no A record
            if let Some(ip) = self.dns.lookup_host(name) {
                if !ipv4.contains(&ip) {
                    ipv4.push(ip);
                }
            }
            if self.tracer.is_enabled() {
                self.tracer.line(format_args!("IPv4 addresses for {}: {}", name, join_addrs(&ipv4)));
            }
        }

        Host::new(name, port, ipv4, ipv6)
    }

    /// Reverse-resolve an address to a host name
    pub fn host_by_address(&self, ip: IpAddr) -> Option<String> {
        self.dns.reverse(ip)
    }

    /// Name recorded for a literal host: the reverse-lookup name when
    /// `resolve_by_address` is on and one exists, else the literal as given.
    fn literal_name(&self, name: &str, literal: Literal) -> String {
        if !self.config.resolve_by_address {
            return name.to_string();
        }
        match self.dns.reverse(literal.ip()) {
            Some(reversed) => reversed,
            None => {
                self.tracer.line(format_args!("Reverse lookup for {} failed, keeping literal", name));
                name.to_string()
            }
        }
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("config", &self.config)
            .field("tracer", &self.tracer)
            .finish()
    }
}

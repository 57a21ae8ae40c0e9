//! Transport configuration
//!
//! Address-family policy, host ordering, debug tracing and socket timeouts.
//! A `TransportConfig` is handed to the resolver, the connection establisher
//! and the channel explicitly, so independent configurations can coexist in
//! the same process.

use std::fmt;
use std::time::Duration;

/// Default send timeout in milliseconds
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 100;

/// Default receive timeout in milliseconds
pub const DEFAULT_RECV_TIMEOUT_MS: u64 = 750;

/// Which address families may be used for resolution and connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamilyPolicy {
    /// IPv6 first, then IPv4
    Any,
    /// Only IPv4 addresses are looked up and connected to
    Ipv4Only,
    /// Only IPv6 addresses are looked up and connected to
    Ipv6Only,
}

impl AddressFamilyPolicy {
    /// Whether IPv4 addresses are in use under this policy
    pub fn allows_ipv4(self) -> bool {
        !matches!(self, AddressFamilyPolicy::Ipv6Only)
    }

    /// Whether IPv6 addresses are in use under this policy
    pub fn allows_ipv6(self) -> bool {
        !matches!(self, AddressFamilyPolicy::Ipv4Only)
    }
}

/// A socket timeout expressed in milliseconds.
///
/// The OS wants `SO_SNDTIMEO`/`SO_RCVTIMEO` as a (seconds, microseconds)
/// pair; [`secs`](Self::secs) and [`micros`](Self::micros) give that split.
/// A zero timeout means "no timeout", as it does for a zero `timeval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct SocketTimeout {
    millis: u64,
}

impl SocketTimeout {
    /// Create a timeout from milliseconds
    pub const fn from_millis(millis: u64) -> Self {
        SocketTimeout { millis }
    }

    /// Create a timeout from a duration, truncated to whole milliseconds
    pub fn from_duration(duration: Duration) -> Self {
        SocketTimeout {
            millis: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// The timeout in milliseconds
    pub const fn as_millis(&self) -> u64 {
        self.millis
    }

    /// Whole seconds of the (seconds, microseconds) pair
    pub const fn secs(&self) -> u64 {
        self.millis / 1000
    }

    /// Microsecond remainder of the (seconds, microseconds) pair
    pub const fn micros(&self) -> u32 {
        ((self.millis % 1000) * 1000) as u32
    }

    /// The (seconds, microseconds) pair
    pub const fn to_timeval(&self) -> (u64, u32) {
        (self.secs(), self.micros())
    }

    /// Duration suitable for socket options; `None` when the timeout is zero
    pub fn as_duration(&self) -> Option<Duration> {
        if self.millis == 0 {
            None
        } else {
            Some(Duration::new(self.secs(), self.micros() * 1000))
        }
    }
}

impl From<u64> for SocketTimeout {
    fn from(millis: u64) -> Self {
        SocketTimeout::from_millis(millis)
    }
}

impl fmt::Display for SocketTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.millis)
    }
}

/// Configuration shared by [`Resolver`](super::Resolver),
/// [`ConnectionEstablisher`](super::ConnectionEstablisher) and
/// [`BlockingChannel`](super::BlockingChannel).
///
/// ```rust
/// use hostsock::net::{AddressFamilyPolicy, TransportConfig};
///
/// let config = TransportConfig::new()
///     .force_ipv4(true)
///     .send_timeout_ms(250)
///     .recv_timeout_ms(1500);
///
/// assert_eq!(config.family_policy(), AddressFamilyPolicy::Ipv4Only);
/// assert_eq!(config.recv_timeout.to_timeval(), (1, 500_000));
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Only use IPv4. Takes precedence over `force_ipv6`.
    pub force_ipv4: bool,
    /// Only use IPv6
    pub force_ipv6: bool,
    /// Shuffle the host list before connecting
    pub random_host_order: bool,
    /// Deliver trace lines to the configured trace sink
    pub debug: bool,
    /// Reverse-resolve literal hosts to a name
    pub resolve_by_address: bool,
    /// Send timeout applied to newly opened sockets
    pub send_timeout: SocketTimeout,
    /// Receive timeout applied to newly opened sockets
    pub recv_timeout: SocketTimeout,
    /// Bound on each connect attempt. `None` leaves it to the OS.
    pub connect_timeout: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportConfig {
    /// Create a config with defaults: both families, listed host order,
    /// tracing off, 100ms send and 750ms receive timeouts.
    pub fn new() -> Self {
        TransportConfig {
            force_ipv4: false,
            force_ipv6: false,
            random_host_order: false,
            debug: false,
            resolve_by_address: false,
            send_timeout: SocketTimeout::from_millis(DEFAULT_SEND_TIMEOUT_MS),
            recv_timeout: SocketTimeout::from_millis(DEFAULT_RECV_TIMEOUT_MS),
            connect_timeout: None,
        }
    }

    /// Restrict lookups and connections to IPv4
    pub fn force_ipv4(mut self, force: bool) -> Self {
        self.force_ipv4 = force;
        self
    }

    /// Restrict lookups and connections to IPv6
    pub fn force_ipv6(mut self, force: bool) -> Self {
        self.force_ipv6 = force;
        self
    }

    /// Shuffle hosts before connecting to spread load across a fleet
    pub fn random_host_order(mut self, random: bool) -> Self {
        self.random_host_order = random;
        self
    }

    /// Enable delivery of trace lines
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Replace literal host names by their reverse-lookup name
    pub fn resolve_by_address(mut self, enabled: bool) -> Self {
        self.resolve_by_address = enabled;
        self
    }

    /// Set the send timeout (default: 100ms)
    pub fn send_timeout_ms(mut self, millis: u64) -> Self {
        self.send_timeout = SocketTimeout::from_millis(millis);
        self
    }

    /// Set the receive timeout (default: 750ms)
    pub fn recv_timeout_ms(mut self, millis: u64) -> Self {
        self.recv_timeout = SocketTimeout::from_millis(millis);
        self
    }

    /// Bound every connect attempt
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// The effective address-family policy. IPv4 wins when both flags are set.
    pub fn family_policy(&self) -> AddressFamilyPolicy {
        if self.force_ipv4 {
            AddressFamilyPolicy::Ipv4Only
        } else if self.force_ipv6 {
            AddressFamilyPolicy::Ipv6Only
        } else {
            AddressFamilyPolicy::Any
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_split() {
        let timeout = SocketTimeout::from_millis(1500);
        assert_eq!(timeout.secs(), 1);
        assert_eq!(timeout.micros(), 500_000);
        assert_eq!(timeout.to_timeval(), (1, 500_000));
        assert_eq!(timeout.as_duration(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_timeout_zero() {
        let timeout = SocketTimeout::from_millis(0);
        assert_eq!(timeout.to_timeval(), (0, 0));
        assert_eq!(timeout.as_duration(), None);
    }

    #[test]
    fn test_timeout_sub_second() {
        assert_eq!(SocketTimeout::from_millis(750).to_timeval(), (0, 750_000));
        assert_eq!(SocketTimeout::from_millis(3001).to_timeval(), (3, 1000));
    }

    #[test]
    fn test_timeout_from_duration() {
        let timeout = SocketTimeout::from_duration(Duration::from_micros(2_500_900));
        assert_eq!(timeout.as_millis(), 2500);
    }

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.send_timeout.as_millis(), 100);
        assert_eq!(config.recv_timeout.as_millis(), 750);
        assert_eq!(config.family_policy(), AddressFamilyPolicy::Any);
        assert!(config.connect_timeout.is_none());
    }

    #[test]
    fn test_family_policy() {
        let v4 = TransportConfig::new().force_ipv4(true);
        assert_eq!(v4.family_policy(), AddressFamilyPolicy::Ipv4Only);
        assert!(v4.family_policy().allows_ipv4());
        assert!(!v4.family_policy().allows_ipv6());

        let v6 = TransportConfig::new().force_ipv6(true);
        assert_eq!(v6.family_policy(), AddressFamilyPolicy::Ipv6Only);
        assert!(!v6.family_policy().allows_ipv4());

        // IPv4 wins
        let both = TransportConfig::new().force_ipv4(true).force_ipv6(true);
        assert_eq!(both.family_policy(), AddressFamilyPolicy::Ipv4Only);
    }
}

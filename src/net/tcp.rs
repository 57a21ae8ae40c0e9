//! TCP socket utilities and connection establishment
//!
//! [`SocketExt`] adds readiness waits and single-shot send/receive primitives
//! to `socket2::Socket`. [`ConnectionEstablisher`] walks a resolved host list
//! and returns the first socket that connects, trying IPv6 before IPv4.

use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use super::trace::{TraceSink, Tracer};
use super::{Error, Host, Result, SocketTimeout, TransportConfig};

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

/// Condition to wait for on a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Data can be read (or the peer has hung up)
    Read,
    /// Data can be written
    Write,
    /// Only report exceptional conditions
    Exceptional,
}

/// Outcome of a readiness wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The requested condition holds
    Ready,
    /// The timeout elapsed first
    TimedOut,
    /// The socket reports an error condition
    Exceptional,
}

/// Extension trait for `socket2::Socket` with the primitives the channel is
/// built from
pub trait SocketExt {
    /// Wait until `interest` holds, an exceptional condition is reported, or
    /// `timeout` elapses. `None` waits forever, `Some(Duration::ZERO)` probes.
    ///
    /// With [`Interest::Exceptional`] the result is either `Exceptional` or
    /// `TimedOut` (nothing to report).
    fn wait_ready(&self, interest: Interest, timeout: Option<Duration>) -> io::Result<Readiness>;

    /// Receive whatever is immediately available without blocking.
    ///
    /// Returns:
    /// - Ok(Some(n)) where n > 0: n bytes received
    /// - Ok(Some(0)): the peer closed its side
    /// - Ok(None): nothing available right now
    /// - Err(_): any other failure
    fn recv_available(&self, buf: &mut [u8]) -> io::Result<Option<usize>>;

    /// One send call; may write fewer bytes than given. Never raises SIGPIPE
    /// where the platform allows suppressing it.
    fn send_some(&self, buf: &[u8]) -> io::Result<usize>;

    /// Apply send/receive timeouts as `SO_SNDTIMEO`/`SO_RCVTIMEO`
    fn apply_timeouts(&self, send: SocketTimeout, recv: SocketTimeout) -> io::Result<()>;

    /// Peer address as a standard library address
    fn peer_socket_addr(&self) -> io::Result<SocketAddr>;
}

impl SocketExt for Socket {
    fn wait_ready(&self, interest: Interest, timeout: Option<Duration>) -> io::Result<Readiness> {
        use libc::{poll, pollfd, POLLERR, POLLIN, POLLNVAL, POLLOUT, POLLPRI};

        let events = match interest {
            Interest::Read => POLLIN,
            Interest::Write => POLLOUT,
            Interest::Exceptional => POLLPRI,
        };
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let mut pfd = pollfd {
                fd: self.as_raw_fd(),
                events,
                revents: 0,
            };

            let timeout_ms = match deadline {
                None => -1,
                Some(deadline) => poll_millis(deadline.saturating_duration_since(Instant::now())),
            };
            // SAFETY: `pfd` is a valid pollfd for the duration of the call and
            // the count matches the single entry passed.
            let ret = unsafe { poll(&mut pfd, 1, timeout_ms) };

            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }

            if ret == 0 {
                return Ok(Readiness::TimedOut);
            }

            if pfd.revents & (POLLERR | POLLNVAL) != 0 {
                return Ok(Readiness::Exceptional);
            }

            return Ok(match interest {
                // POLLHUP alone counts as readable: the next recv reports the close
                Interest::Read | Interest::Write => Readiness::Ready,
                // Urgent data or a hangup
                Interest::Exceptional => Readiness::Exceptional,
            });
        }
    }

    fn recv_available(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        if buf.is_empty() {
            return Ok(None);
        }
        loop {
            // SAFETY: the pointer and length describe `buf`, which is
            // exclusively borrowed for the call; the fd is owned by `self`.
            let ret = unsafe {
                libc::recv(
                    self.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    libc::MSG_DONTWAIT,
                )
            };

            if ret >= 0 {
                return Ok(Some(ret as usize));
            }

            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(None),
                _ => return Err(err),
            }
        }
    }

    fn send_some(&self, buf: &[u8]) -> io::Result<usize> {
        self.send_with_flags(buf, SEND_FLAGS)
    }

    fn apply_timeouts(&self, send: SocketTimeout, recv: SocketTimeout) -> io::Result<()> {
        self.set_write_timeout(send.as_duration())?;
        self.set_read_timeout(recv.as_duration())
    }

    fn peer_socket_addr(&self) -> io::Result<SocketAddr> {
        self.peer_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "peer is not an IP socket"))
    }
}

/// poll(2) timeout in milliseconds, rounded up so a wait never ends early
fn poll_millis(remaining: Duration) -> i32 {
    let millis = remaining.as_micros().div_ceil(1000);
    i32::try_from(millis).unwrap_or(i32::MAX)
}

/// Opens exactly one connection to the first reachable address of a host list
#[derive(Debug, Clone)]
pub struct ConnectionEstablisher {
    config: TransportConfig,
    tracer: Tracer,
}

impl ConnectionEstablisher {
    /// Create an establisher with the given configuration
    pub fn new(config: TransportConfig) -> Self {
        let tracer = Tracer::new(None, config.debug);
        ConnectionEstablisher { config, tracer }
    }

    pub(crate) fn with_tracer(config: TransportConfig, tracer: Tracer) -> Self {
        ConnectionEstablisher { config, tracer }
    }

    /// Attach a trace sink
    pub fn trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.tracer.set_sink(sink);
        self
    }

    /// Configuration in use
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Connect to the first address that accepts.
    ///
    /// IPv6 addresses of every host are tried first, in host order, unless
    /// IPv4 is forced; then IPv4 addresses of every host, unless IPv6 is
    /// forced. Sockets from failed attempts are closed. The returned socket
    /// is blocking and carries the configured send/receive timeouts.
    pub fn open(&self, hosts: &[Host]) -> Result<Socket> {
        let mut order: Vec<&Host> = hosts.iter().collect();
        if self.config.random_host_order {
            order.shuffle(&mut rand::rng());
        }

        // Hosts whose symbolic port cannot be mapped are skipped
        let targets: Vec<(&Host, u16)> = order
            .into_iter()
            .filter_map(|host| match host.port().number() {
                Ok(port) => Some((host, port)),
                Err(e) => {
                    self.tracer.line(format_args!("Skipping {}: {}", host, e));
                    None
                }
            })
            .collect();

        let policy = self.config.family_policy();
        let mut attempts = 0;

        if policy.allows_ipv6() {
            for (host, port) in &targets {
                for addr in host.ipv6_socket_addrs(*port) {
                    attempts += 1;
                    if let Some(socket) = self.attempt(Domain::IPV6, addr, "") {
                        return Ok(socket);
                    }
                }
            }
        }

        if policy.allows_ipv4() {
            for (host, port) in &targets {
                for addr in host.ipv4_socket_addrs(*port) {
                    attempts += 1;
                    if let Some(socket) = self.attempt(Domain::IPV4, addr, "Using ipv4, ") {
                        return Ok(socket);
                    }
                }
            }
        }

        tracing::warn!(attempts, hosts = hosts.len(), "no host accepted the connection");
        Err(Error::Connection { attempts })
    }

    /// One connect attempt on a fresh socket. Failures are traced, not raised.
    fn attempt(&self, domain: Domain, addr: SocketAddr, prefix: &str) -> Option<Socket> {
        self.tracer.line(format_args!("{}Connecting to {}...", prefix, addr));

        match self.connect(domain, &addr) {
            Ok(socket) => {
                self.tracer.line(format_args!("{}Connected to {}!", prefix, addr));
                tracing::debug!(%addr, "connected");
                Some(socket)
            }
            Err(e) => {
                self.tracer.line(format_args!("{}Socket connect to {} failed; {}", prefix, addr, e));
                tracing::debug!(%addr, error = %e, "connect attempt failed");
                None
            }
        }
    }

    fn connect(&self, domain: Domain, addr: &SocketAddr) -> io::Result<Socket> {
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.apply_timeouts(self.config.send_timeout, self.config.recv_timeout)?;

        let target = SockAddr::from(*addr);
        match self.config.connect_timeout {
            Some(timeout) => {
                socket.set_nonblocking(true)?;
                match socket.connect(&target) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock
                        || e.raw_os_error() == Some(libc::EINPROGRESS) =>
                    {
                        wait_for_connect(&socket, timeout)?;
                    }
                    Err(e) => return Err(e),
                }
                socket.set_nonblocking(false)?;
            }
            None => socket.connect(&target)?,
        }

        Ok(socket)
    }
}

/// Wait for a non-blocking connect to complete
fn wait_for_connect(socket: &Socket, timeout: Duration) -> io::Result<()> {
    match socket.wait_ready(Interest::Write, Some(timeout))? {
        Readiness::TimedOut => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
        Readiness::Ready | Readiness::Exceptional => match socket.take_error()? {
            Some(err) => Err(err),
            None => Ok(()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, Ipv6Addr, TcpListener, TcpStream};
    use std::sync::Mutex;

    /// A loopback port with nothing listening on it
    fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn loopback_pair() -> (Socket, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (Socket::from(client), server)
    }

    #[test]
    fn test_poll_millis_rounds_up() {
        assert_eq!(poll_millis(Duration::ZERO), 0);
        assert_eq!(poll_millis(Duration::from_micros(1)), 1);
        assert_eq!(poll_millis(Duration::from_millis(750)), 750);
        assert_eq!(poll_millis(Duration::from_secs(u64::MAX)), i32::MAX);
    }

    #[test]
    fn test_wait_read_times_out() {
        let (client, _server) = loopback_pair();
        let start = Instant::now();
        let readiness = client.wait_ready(Interest::Read, Some(Duration::from_millis(50))).unwrap();
        assert_eq!(readiness, Readiness::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn test_wait_read_ready_and_recv() {
        let (client, mut server) = loopback_pair();
        server.write_all(b"abc").unwrap();

        let readiness = client.wait_ready(Interest::Read, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(readiness, Readiness::Ready);

        let mut buf = [0u8; 8];
        assert_eq!(client.recv_available(&mut buf).unwrap(), Some(3));
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(client.recv_available(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_recv_available_reports_close() {
        let (client, server) = loopback_pair();
        drop(server);
        client.wait_ready(Interest::Read, Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(client.recv_available(&mut buf).unwrap(), Some(0));
    }

    #[test]
    fn test_write_ready_and_send() {
        let (client, mut server) = loopback_pair();
        let readiness = client.wait_ready(Interest::Write, Some(Duration::ZERO)).unwrap();
        assert_eq!(readiness, Readiness::Ready);

        assert_eq!(client.send_some(b"hello").unwrap(), 5);
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_exceptional_probe_on_healthy_socket() {
        let (client, _server) = loopback_pair();
        let readiness = client.wait_ready(Interest::Exceptional, Some(Duration::ZERO)).unwrap();
        assert_eq!(readiness, Readiness::TimedOut);
    }

    #[test]
    fn test_apply_timeouts() {
        let (client, _server) = loopback_pair();
        client
            .apply_timeouts(SocketTimeout::from_millis(100), SocketTimeout::from_millis(1500))
            .unwrap();
        let send = client.write_timeout().unwrap().unwrap();
        let recv = client.read_timeout().unwrap().unwrap();
        assert!(send >= Duration::from_millis(99) && send <= Duration::from_millis(110));
        assert!(recv >= Duration::from_millis(1499) && recv <= Duration::from_millis(1510));
    }

    #[test]
    fn test_open_first_reachable_wins() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let dead = closed_port();

        let hosts = vec![
            Host::new("dead", dead, vec![Ipv4Addr::LOCALHOST], vec![]),
            Host::new("alive", port, vec![Ipv4Addr::LOCALHOST], vec![]),
        ];
        let establisher = ConnectionEstablisher::new(TransportConfig::new().force_ipv4(true));
        let socket = establisher.open(&hosts).unwrap();
        assert_eq!(socket.peer_socket_addr().unwrap().port(), port);
    }

    #[test]
    fn test_open_all_unreachable() {
        let dead = closed_port();
        let hosts = vec![
            Host::new("a", dead, vec![Ipv4Addr::LOCALHOST], vec![]),
            Host::new("b", dead, vec![Ipv4Addr::LOCALHOST], vec![]),
        ];
        let err = ConnectionEstablisher::new(TransportConfig::new()).open(&hosts).unwrap_err();
        assert!(matches!(err, Error::Connection { attempts: 2 }));
    }

    #[test]
    fn test_force_ipv6_skips_ipv4_addresses() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let hosts = vec![Host::new("v4", port, vec![Ipv4Addr::LOCALHOST], vec![])];

        let err = ConnectionEstablisher::new(TransportConfig::new().force_ipv6(true))
            .open(&hosts)
            .unwrap_err();
        assert!(matches!(err, Error::Connection { attempts: 0 }));
    }

    #[test]
    fn test_ipv6_failure_falls_back_to_ipv4() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        // Nothing listens on [::1]:port, or the host has no IPv6 at all
        let hosts = vec![Host::new(
            "localhost",
            port,
            vec![Ipv4Addr::LOCALHOST],
            vec![Ipv6Addr::LOCALHOST],
        )];

        let lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink_lines = lines.clone();
        let establisher = ConnectionEstablisher::new(TransportConfig::new().debug(true))
            .trace_sink(Arc::new(move |line: &str| {
                sink_lines.lock().unwrap().push(line.to_string());
            }));

        let socket = establisher.open(&hosts).unwrap();
        let peer = socket.peer_socket_addr().unwrap();
        assert!(peer.is_ipv4());
        assert_eq!(peer.port(), port);

        let lines = lines.lock().unwrap();
        assert_eq!(lines[0], format!("Connecting to [::1]:{}...", port));
        assert!(lines[1].starts_with(&format!("Socket connect to [::1]:{} failed; ", port)));
        assert_eq!(lines[2], format!("Using ipv4, Connecting to 127.0.0.1:{}...", port));
        assert_eq!(lines[3], format!("Using ipv4, Connected to 127.0.0.1:{}!", port));
    }

    #[test]
    fn test_unmapped_service_port_is_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let hosts = vec![
            Host::new("unmapped", "no-such-svc", vec![Ipv4Addr::LOCALHOST], vec![]),
            Host::new("alive", port, vec![Ipv4Addr::LOCALHOST], vec![]),
        ];

        let lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink_lines = lines.clone();
        let establisher = ConnectionEstablisher::new(TransportConfig::new().force_ipv4(true).debug(true))
            .trace_sink(Arc::new(move |line: &str| {
                sink_lines.lock().unwrap().push(line.to_string());
            }));

        let socket = establisher.open(&hosts).unwrap();
        assert_eq!(socket.peer_socket_addr().unwrap().port(), port);

        let lines = lines.lock().unwrap();
        assert!(lines[0].starts_with("Skipping unmapped:no-such-svc"), "got {:?}", lines);
        assert_eq!(lines[1], format!("Using ipv4, Connecting to 127.0.0.1:{}...", port));
    }

    #[test]
    fn test_service_name_port_connects() {
        // Ports are mapped through the services database at connect time
        let hosts = vec![Host::new("web", "http", vec![Ipv4Addr::LOCALHOST], vec![])];
        let lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink_lines = lines.clone();
        let establisher = ConnectionEstablisher::new(TransportConfig::new().force_ipv4(true).debug(true))
            .trace_sink(Arc::new(move |line: &str| {
                sink_lines.lock().unwrap().push(line.to_string());
            }));

        // Whether or not something listens on port 80, the attempt targets it
        let _ = establisher.open(&hosts);
        assert_eq!(lines.lock().unwrap()[0], "Using ipv4, Connecting to 127.0.0.1:80...");
    }

    #[test]
    fn test_open_applies_default_timeouts() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let hosts = vec![Host::new("alive", port, vec![Ipv4Addr::LOCALHOST], vec![])];

        let socket = ConnectionEstablisher::new(TransportConfig::new().recv_timeout_ms(1500))
            .open(&hosts)
            .unwrap();
        let recv = socket.read_timeout().unwrap().unwrap();
        assert!(recv >= Duration::from_millis(1499) && recv <= Duration::from_millis(1510));
    }

    #[test]
    fn test_connect_timeout() {
        // TEST-NET-1 is not routable; the attempt fails one way or another
        let hosts = vec![Host::new("blackhole", 80u16, vec![Ipv4Addr::new(192, 0, 2, 1)], vec![])];
        let establisher = ConnectionEstablisher::new(
            TransportConfig::new().connect_timeout(Duration::from_millis(100)),
        );
        let start = Instant::now();
        assert!(establisher.open(&hosts).is_err());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_random_order_still_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let dead = closed_port();
        let hosts = vec![
            Host::new("dead", dead, vec![Ipv4Addr::LOCALHOST], vec![]),
            Host::new("alive", port, vec![Ipv4Addr::LOCALHOST], vec![]),
            Host::new("dead-too", dead, vec![Ipv4Addr::LOCALHOST], vec![]),
        ];
        let establisher = ConnectionEstablisher::new(
            TransportConfig::new().force_ipv4(true).random_host_order(true),
        );
        for _ in 0..5 {
            let socket = establisher.open(&hosts).unwrap();
            assert_eq!(socket.peer_socket_addr().unwrap().port(), port);
        }
    }
}

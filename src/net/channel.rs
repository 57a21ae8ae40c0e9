//! Blocking byte channel over one connected socket
//!
//! A [`BlockingChannel`] owns the socket opened by the
//! [`ConnectionEstablisher`] and exposes reads and writes bounded by the
//! configured send/receive timeouts. It never interprets the bytes it carries.
//!
//! Every call blocks the calling thread for at most its timeout. Closing the
//! socket from another thread while a call is in flight is not supported.

use std::io::{self, Read};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use socket2::Socket;

use super::resolver::Resolver;
use super::tcp::{ConnectionEstablisher, Interest, Readiness, SocketExt};
use super::trace::{TraceSink, Tracer};
use super::{Error, Host, Port, Result, SocketTimeout, TransportConfig};

/// Linger applied on close so queued data is flushed rather than reset
const CLOSE_LINGER: Duration = Duration::from_secs(1);

/// Lifecycle of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Created, no socket yet
    Unconnected,
    /// Connection establishment in progress
    Connecting,
    /// Socket connected and usable
    Open,
    /// Closed for good
    Closed,
}

/// Timeout-bounded blocking I/O over a single TCP connection
pub struct BlockingChannel {
    hosts: Vec<Host>,
    config: TransportConfig,
    tracer: Tracer,
    socket: Option<Socket>,
    state: ChannelState,
}

impl BlockingChannel {
    /// Create an unconnected channel for an already resolved host list
    pub fn new(hosts: Vec<Host>, config: TransportConfig) -> Self {
        let tracer = Tracer::new(None, config.debug);
        BlockingChannel {
            hosts,
            config,
            tracer,
            socket: None,
            state: ChannelState::Unconnected,
        }
    }

    /// Resolve `pairs` with the system DNS and open a connection
    pub fn connect<I, H, P>(pairs: I, config: TransportConfig) -> Result<Self>
    where
        I: IntoIterator<Item = (H, P)>,
        H: AsRef<str>,
        P: Into<Port>,
    {
        let resolver = Resolver::new(config.clone());
        Self::connect_with(&resolver, pairs)
    }

    /// Resolve `pairs` with the given resolver and open a connection using
    /// the resolver's configuration and trace sink
    pub fn connect_with<I, H, P>(resolver: &Resolver, pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (H, P)>,
        H: AsRef<str>,
        P: Into<Port>,
    {
        let hosts = resolver.resolve(pairs)?;
        let mut channel = Self::new(hosts, resolver.config().clone());
        channel.tracer = resolver.tracer().clone();
        channel.open()?;
        Ok(channel)
    }

    /// Wrap a stream that is already connected, e.g. one side of a loopback
    /// pair or an accepted connection. The configured timeouts are applied.
    pub fn from_stream(stream: TcpStream, config: TransportConfig) -> Result<Self> {
        let socket = Socket::from(stream);
        socket.set_nonblocking(false)?;
        socket.apply_timeouts(config.send_timeout, config.recv_timeout)?;

        let mut channel = Self::new(Vec::new(), config);
        channel.socket = Some(socket);
        channel.state = ChannelState::Open;
        Ok(channel)
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

    /// Current state
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Hosts this channel connects to
    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    /// Configuration, including timeouts for the next open
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// The live socket, for options this type does not cover
    pub fn socket(&self) -> Option<&Socket> {
        self.socket.as_ref()
    }

    /// Address of the connected peer
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.live()?.peer_socket_addr()?)
    }

    /// Connect to the first reachable address of the host list
    pub fn open(&mut self) -> Result<()> {
        match self.state {
            ChannelState::Unconnected => {}
            ChannelState::Closed => {
                return Err(Error::InvalidState("a closed channel cannot be reopened".to_string()))
            }
            ChannelState::Open | ChannelState::Connecting => {
                return Err(Error::InvalidState("channel is already open".to_string()))
            }
        }

        self.state = ChannelState::Connecting;
        let establisher = ConnectionEstablisher::with_tracer(self.config.clone(), self.tracer.clone());
        match establisher.open(&self.hosts) {
            Ok(socket) => {
                self.socket = Some(socket);
                self.state = ChannelState::Open;
                Ok(())
            }
            Err(e) => {
                self.state = ChannelState::Unconnected;
                Err(e)
            }
        }
    }

    /// Set the send timeout in milliseconds. Applied to the live socket when
    /// open, otherwise stored for the next open.
    pub fn set_send_timeout(&mut self, millis: u64) -> Result<()> {
        let timeout = SocketTimeout::from_millis(millis);
        if let Some(socket) = self.open_socket() {
            socket.set_write_timeout(timeout.as_duration())?;
        }
        self.config.send_timeout = timeout;
        Ok(())
    }

    /// Set the receive timeout in milliseconds. Applied to the live socket
    /// when open, otherwise stored for the next open.
    pub fn set_recv_timeout(&mut self, millis: u64) -> Result<()> {
        let timeout = SocketTimeout::from_millis(millis);
        if let Some(socket) = self.open_socket() {
            socket.set_read_timeout(timeout.as_duration())?;
        }
        self.config.recv_timeout = timeout;
        Ok(())
    }

    /// Best-effort liveness hint.
    ///
    /// Probes the socket for exceptional conditions without waiting. `false`
    /// when there is no socket or the probe reports an error or a hangup. A
    /// peer that closed only its sending side is not detected; use
    /// [`read`](Self::read) returning `None` for that.
    pub fn is_open(&self) -> Result<bool> {
        let Some(socket) = self.socket.as_ref() else {
            return Ok(false);
        };
        let readiness = socket
            .wait_ready(Interest::Exceptional, Some(Duration::ZERO))
            .map_err(|e| Error::transport("Could not examine socket", e))?;
        Ok(readiness == Readiness::TimedOut)
    }

    /// Whether data is waiting to be read. Does not block.
    pub fn has_data(&self) -> Result<bool> {
        let socket = self.live()?;
        let readiness = socket
            .wait_ready(Interest::Read, Some(Duration::ZERO))
            .map_err(|e| Error::transport("Could not examine socket", e))?;
        Ok(readiness == Readiness::Ready)
    }

    /// Read up to `max_len` bytes with one receive call.
    ///
    /// Returns `Ok(None)` when the receive timeout elapsed with nothing to
    /// read, or when the peer closed its side. Fewer than `max_len` bytes is
    /// a normal outcome. A `max_len` of zero returns an empty buffer without
    /// touching the socket.
    pub fn read(&mut self, max_len: usize) -> Result<Option<Vec<u8>>> {
        let mut socket = self.live()?;
        if max_len == 0 {
            return Ok(Some(Vec::new()));
        }
        let mut buf = vec![0u8; max_len];

        match socket.read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(n) => {
                buf.truncate(n);
                Ok(Some(buf))
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(Error::transport(
                format!("Could not read {} bytes from socket", max_len),
                e,
            )),
        }
    }

    /// Read exactly `len` bytes.
    ///
    /// Drains what is available, then waits up to the socket's receive
    /// timeout for more, until `len` bytes have arrived. Each wait restarts
    /// the timeout. Fails with [`Error::Timeout`] when a wait elapses and
    /// with [`Error::Transport`] on a socket error or if the peer closes
    /// before `len` bytes arrived.
    pub fn read_all(&mut self, len: usize) -> Result<Vec<u8>> {
        let socket = self.live()?;
        let timeout = socket
            .read_timeout()
            .map_err(|e| Error::transport("Could not read receive timeout", e))?;

        let mut data = Vec::with_capacity(len);
        let mut chunk = vec![0u8; len];

        while data.len() < len {
            let wanted = len - data.len();
            match socket.recv_available(&mut chunk[..wanted]) {
                Ok(Some(0)) => {
                    return Err(Error::transport(
                        format!("Connection closed after {} of {} bytes", data.len(), len),
                        io::Error::from(io::ErrorKind::UnexpectedEof),
                    ))
                }
                Ok(Some(n)) => data.extend_from_slice(&chunk[..n]),
                Ok(None) => {}
                Err(e) => {
                    return Err(Error::transport(
                        format!("Could not read {} bytes from socket", len),
                        e,
                    ))
                }
            }

            if data.len() == len {
                break;
            }

            match socket.wait_ready(Interest::Read, timeout) {
                Ok(Readiness::Ready) => {}
                Ok(Readiness::Exceptional) => {
                    return Err(Error::transport(
                        "Socket exception while waiting for data",
                        pending_error(socket),
                    ))
                }
                Ok(Readiness::TimedOut) => {
                    return Err(Error::Timeout(format!(
                        "waiting for data on socket ({} of {} bytes read)",
                        data.len(),
                        len
                    )))
                }
                Err(e) => return Err(Error::transport("Could not examine socket", e)),
            }
        }

        Ok(data)
    }

    /// Write the first `chunk_size` bytes of `buf` (all of it when `None`).
    ///
    /// Partial writes are continued after waiting up to the socket's send
    /// timeout for the socket to accept more.
    pub fn write(&mut self, buf: &[u8], chunk_size: Option<usize>) -> Result<()> {
        let socket = self.live()?;
        let total = chunk_size.unwrap_or(buf.len()).min(buf.len());
        let timeout = socket
            .write_timeout()
            .map_err(|e| Error::transport("Could not read send timeout", e))?;

        let mut offset = 0;
        while offset < total {
            match socket.send_some(&buf[offset..total]) {
                Ok(n) => offset += n,
                // SO_SNDTIMEO expired before anything was accepted
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(Error::transport(
                        format!("Could not write {} bytes to socket", total),
                        e,
                    ))
                }
            }

            if offset == total {
                break;
            }

            match socket.wait_ready(Interest::Write, timeout) {
                Ok(Readiness::Ready) => {}
                Ok(Readiness::Exceptional) => {
                    return Err(Error::transport(
                        "Socket exception while waiting to write data",
                        pending_error(socket),
                    ))
                }
                Ok(Readiness::TimedOut) => {
                    return Err(Error::Timeout(format!(
                        "waiting to write data on socket ({} of {} bytes written)",
                        offset, total
                    )))
                }
                Err(e) => return Err(Error::transport("Could not examine socket", e)),
            }
        }

        Ok(())
    }

    /// Close the connection, lingering so queued outbound data is flushed.
    ///
    /// The channel ends up `Closed` whatever happens; closing twice is a no-op.
    pub fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            if let Err(e) = socket.set_nonblocking(false) {
                tracing::warn!(error = %e, "could not switch socket to blocking mode before close");
            }
            if let Err(e) = socket.set_linger(Some(CLOSE_LINGER)) {
                tracing::warn!(error = %e, "could not set linger before close");
            }
            drop(socket);
            self.tracer.line(format_args!("Connection closed"));
        }
        self.state = ChannelState::Closed;
    }

    fn open_socket(&self) -> Option<&Socket> {
        match self.state {
            ChannelState::Open => self.socket.as_ref(),
            _ => None,
        }
    }

    fn live(&self) -> Result<&Socket> {
        self.open_socket().ok_or_else(|| {
            Error::InvalidState(format!("operation requires an open channel, state is {:?}", self.state))
        })
    }
}

/// The socket's pending error, or a generic one if none is recorded
fn pending_error(socket: &Socket) -> io::Error {
    match socket.take_error() {
        Ok(Some(err)) => err,
        Ok(None) => io::Error::other("exceptional condition on socket"),
        Err(err) => err,
    }
}

impl Drop for BlockingChannel {
    fn drop(&mut self) {
        if self.socket.is_some() {
            self.close();
        }
    }
}

impl std::fmt::Debug for BlockingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingChannel")
            .field("hosts", &self.hosts)
            .field("state", &self.state)
            .field("send_timeout", &self.config.send_timeout)
            .field("recv_timeout", &self.config.recv_timeout)
            .finish()
    }
}

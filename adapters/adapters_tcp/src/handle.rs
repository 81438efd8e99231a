//! Handle Module
//!
//! Provides [`Handle`], the owning wrapper around one TCP/IPv4 socket
//! descriptor. A handle is created unconnected, then either connects out or
//! listens and accepts. Dropping a handle that still owns a descriptor shuts
//! both directions down and closes it.
//!
//! All operations block. Using one handle from several threads at once (for
//! example closing it while another thread is blocked in a receive) is left
//! to the caller to coordinate.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::{NetworkError, Operation};
use crate::init;
use crate::transfer::{self, Transfer};

/// Pending connection queue length used by [`Handle::listen`]
pub const LISTEN_BACKLOG: i32 = 5;

/// Descriptor value reported by a handle that owns no socket
pub const INVALID_DESCRIPTOR: RawFd = -1;

// Writes to a peer that went away must fail with EPIPE, not raise SIGPIPE.
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "netbsd",
    target_os = "openbsd"
))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "netbsd",
    target_os = "openbsd"
)))]
const SEND_FLAGS: libc::c_int = 0;

/// Owning TCP socket handle
///
/// Exactly one `Handle` owns a given descriptor. Moving a handle moves that
/// ownership; [`std::mem::take`] does the same while leaving an inert
/// sentinel handle behind (see [`Handle::default`]).
#[derive(Default)]
pub struct Handle {
    socket: Option<Socket>,
    port: Option<u16>,
}

impl Handle {
    /// Create a new, unconnected TCP/IPv4 socket
    ///
    /// # Returns
    ///
    /// * `Ok(Handle)` - Handle owning the new descriptor
    /// * `Err(NetworkError)` - The OS refused to create a descriptor
    pub fn create() -> Result<Self, NetworkError> {
        init::ensure_initialized();

        let socket = open_socket(Operation::Create)?;
        tracing::debug!(fd = socket.as_raw_fd(), "socket created");
        Ok(Self {
            socket: Some(socket),
            port: None,
        })
    }

    /// Connect to `hostname` on `port`
    ///
    /// The hostname goes through the platform resolver; IPv4 candidates are
    /// tried in the order returned until one connects. The port is remembered
    /// even when connecting fails.
    ///
    /// The first candidate is tried on the handle's own descriptor. Each
    /// further candidate gets a fresh descriptor, since a socket whose connect
    /// failed cannot be reused on every platform; the handle then owns
    /// whichever descriptor made the last attempt.
    ///
    /// # Arguments
    ///
    /// * `hostname` - Host name or dotted IPv4 address
    /// * `port` - Remote port
    ///
    /// # Returns
    ///
    /// * `Ok(())` - Connected
    /// * `Err(NetworkError::Resolve)` - No IPv4 address for `hostname`
    /// * `Err(NetworkError)` - Every candidate refused; the last failure is returned
    pub fn connect(&mut self, hostname: &str, port: u16) -> Result<(), NetworkError> {
        self.port = Some(port);
        self.socket(Operation::Connect)?;
        let candidates = resolve_ipv4(hostname, port)?;
        self.connect_candidates(&candidates)
    }

    fn connect_candidates(&mut self, candidates: &[SocketAddrV4]) -> Result<(), NetworkError> {
        let mut last_err = None;
        for (attempt, addr) in candidates.iter().enumerate() {
            if attempt > 0 {
                self.socket = Some(open_socket(Operation::Connect)?);
            }
            let socket = self.socket(Operation::Connect)?;
            match socket.connect(&SockAddr::from(*addr)) {
                Ok(()) => {
                    tracing::debug!(fd = socket.as_raw_fd(), %addr, "connected");
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!(fd = socket.as_raw_fd(), %addr, error = %e, "connect attempt failed");
                    last_err = Some(NetworkError::from_io(Operation::Connect, e));
                }
            }
        }

        Err(last_err.unwrap_or(NetworkError::InvalidHandle { op: Operation::Connect }))
    }

    /// Bind to the wildcard address on `port` and start listening
    ///
    /// The backlog is fixed at [`LISTEN_BACKLOG`]. Port 0 lets the OS pick a
    /// free port; read it back with [`Handle::local_addr`].
    ///
    /// # Arguments
    ///
    /// * `port` - Local port to bind, recorded even when binding fails
    ///
    /// # Returns
    ///
    /// * `Ok(())` - Listening
    /// * `Err(NetworkError)` - `bind` or `listen` failed; the operation says which
    pub fn listen(&mut self, port: u16) -> Result<(), NetworkError> {
        self.port = Some(port);
        let socket = self.socket(Operation::Listen)?;

        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        socket
            .bind(&SockAddr::from(addr))
            .map_err(|e| NetworkError::from_io(Operation::Bind, e))?;
        socket
            .listen(LISTEN_BACKLOG)
            .map_err(|e| NetworkError::from_io(Operation::Listen, e))?;

        tracing::debug!(fd = socket.as_raw_fd(), port, backlog = LISTEN_BACKLOG, "listening");
        Ok(())
    }

    /// Block until a connection arrives and return a handle that owns it
    ///
    /// # Returns
    ///
    /// * `Ok(Handle)` - New handle with its own descriptor and the listener's port
    /// * `Err(NetworkError)` - Accept failed
    pub fn accept(&self) -> Result<Handle, NetworkError> {
        let socket = self.socket(Operation::Accept)?;
        let (client, peer) = socket
            .accept()
            .map_err(|e| NetworkError::from_io(Operation::Accept, e))?;
        suppress_sigpipe(&client).map_err(|e| NetworkError::from_io(Operation::Accept, e))?;

        tracing::debug!(
            fd = socket.as_raw_fd(),
            client_fd = client.as_raw_fd(),
            peer = ?peer.as_socket(),
            "accepted connection"
        );
        Ok(Handle {
            socket: Some(client),
            port: self.port,
        })
    }

    /// Make one send attempt of up to `buf.len()` bytes
    ///
    /// An empty buffer returns `Ok(0)` without a syscall.
    ///
    /// # Arguments
    ///
    /// * `buf` - Bytes to send
    ///
    /// # Returns
    ///
    /// * `Ok(usize)` - Number of bytes sent, possibly fewer than requested
    /// * `Err(NetworkError::ConnectionClosed)` - Nothing could be sent
    /// * `Err(NetworkError)` - Send failed
    pub fn send_once(&self, buf: &[u8]) -> Result<usize, NetworkError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let socket = self.socket(Operation::Send)?;
        match socket.send_with_flags(buf, SEND_FLAGS) {
            Ok(0) => Err(NetworkError::ConnectionClosed { op: Operation::Send }),
            Ok(n) => {
                tracing::trace!(fd = socket.as_raw_fd(), requested = buf.len(), sent = n, "send");
                Ok(n)
            }
            Err(e) => Err(NetworkError::from_io(Operation::Send, e)),
        }
    }

    /// Send the whole of `buf`, resuming after partial sends
    pub fn send_all(&self, buf: &[u8]) -> Result<(), NetworkError> {
        transfer::send_all(self, buf)
    }

    /// Make one receive attempt of up to `buf.len()` bytes
    ///
    /// An orderly shutdown by the peer is reported as
    /// [`NetworkError::ConnectionClosed`], distinct from OS failures.
    ///
    /// # Arguments
    ///
    /// * `buf` - Buffer to receive into
    ///
    /// # Returns
    ///
    /// * `Ok(usize)` - Number of bytes received, at least 1 for a non-empty buffer
    /// * `Err(NetworkError)` - Receive failed or the peer closed the connection
    pub fn recv_once(&self, buf: &mut [u8]) -> Result<usize, NetworkError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let socket = self.socket(Operation::Recv)?;
        let mut reader: &Socket = socket;
        match reader.read(buf) {
            Ok(0) => Err(NetworkError::ConnectionClosed { op: Operation::Recv }),
            Ok(n) => {
                tracing::trace!(fd = socket.as_raw_fd(), requested = buf.len(), received = n, "recv");
                Ok(n)
            }
            Err(e) => Err(NetworkError::from_io(Operation::Recv, e)),
        }
    }

    /// Fill exactly `buf.len()` bytes, resuming after partial receives
    pub fn recv_all(&self, buf: &mut [u8]) -> Result<(), NetworkError> {
        transfer::recv_all(self, buf)
    }

    /// Receive exactly `len` bytes into a freshly allocated buffer
    ///
    /// # Arguments
    ///
    /// * `len` - Number of bytes to receive
    ///
    /// # Returns
    ///
    /// * `Ok(Vec<u8>)` - Exactly `len` bytes
    /// * `Err(NetworkError)` - A receive failed or the stream ended early
    pub fn read_alloc(&self, len: usize) -> Result<Vec<u8>, NetworkError> {
        let mut buf = vec![0u8; len];
        self.recv_all(&mut buf)?;
        Ok(buf)
    }

    /// Shut down both directions of the connection
    ///
    /// The descriptor stays open until the handle is dropped. Shutdown
    /// failures (typically "not connected") are logged and ignored.
    pub fn close(&self) {
        if let Some(socket) = &self.socket {
            match socket.shutdown(Shutdown::Both) {
                Ok(()) => tracing::debug!(fd = socket.as_raw_fd(), "shutdown"),
                Err(e) => tracing::debug!(fd = socket.as_raw_fd(), error = %e, "shutdown failed"),
            }
        }
    }

    /// Port recorded by the last `connect` or `listen` call
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// The owned descriptor, or [`INVALID_DESCRIPTOR`]
    pub fn descriptor(&self) -> RawFd {
        self.socket
            .as_ref()
            .map_or(INVALID_DESCRIPTOR, |socket| socket.as_raw_fd())
    }

    /// Whether this handle still owns a descriptor
    pub fn is_valid(&self) -> bool {
        self.socket.is_some()
    }

    /// Local address the socket is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        let socket = self.socket(Operation::Bind)?;
        socket
            .local_addr()
            .and_then(|addr| {
                addr.as_socket()
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Invalid socket address"))
            })
            .map_err(|e| NetworkError::from_io(Operation::Bind, e))
    }

    /// Address of the connected peer
    pub fn peer_addr(&self) -> Result<SocketAddr, NetworkError> {
        let socket = self.socket(Operation::Connect)?;
        socket
            .peer_addr()
            .and_then(|addr| {
                addr.as_socket()
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Invalid socket address"))
            })
            .map_err(|e| NetworkError::from_io(Operation::Connect, e))
    }

    /// Set `SO_REUSEADDR`; only useful before [`Handle::listen`]
    pub fn set_reuse_address(&self, reuse: bool) -> Result<(), NetworkError> {
        self.socket(Operation::Bind)?
            .set_reuse_address(reuse)
            .map_err(|e| NetworkError::from_io(Operation::Bind, e))
    }

    /// Give up ownership of the underlying socket without closing it
    pub fn into_socket(mut self) -> Option<Socket> {
        self.socket.take()
    }

    fn socket(&self, op: Operation) -> Result<&Socket, NetworkError> {
        self.socket
            .as_ref()
            .ok_or(NetworkError::InvalidHandle { op })
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if let Some(socket) = self.socket.take() {
            let fd = socket.as_raw_fd();
            let _ = socket.shutdown(Shutdown::Both);
            drop(socket);
            tracing::debug!(fd, "socket closed");
        }
    }
}

impl From<Socket> for Handle {
    fn from(socket: Socket) -> Self {
        Self {
            socket: Some(socket),
            port: None,
        }
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.descriptor() == other.descriptor()
    }
}

impl Eq for Handle {}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("fd", &self.descriptor())
            .field("port", &self.port)
            .finish()
    }
}

impl AsRawFd for Handle {
    fn as_raw_fd(&self) -> RawFd {
        self.descriptor()
    }
}

impl Transfer for Handle {
    fn send_once(&self, buf: &[u8]) -> Result<usize, NetworkError> {
        Handle::send_once(self, buf)
    }

    fn recv_once(&self, buf: &mut [u8]) -> Result<usize, NetworkError> {
        Handle::recv_once(self, buf)
    }
}

impl Read for &Handle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.recv_once(buf) {
            Ok(n) => Ok(n),
            Err(NetworkError::ConnectionClosed { .. }) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

impl Read for Handle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self).read(buf)
    }
}

impl Write for &Handle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.send_once(buf) {
            Ok(n) => Ok(n),
            Err(NetworkError::ConnectionClosed { .. }) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Write for Handle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn resolve_ipv4(hostname: &str, port: u16) -> Result<Vec<SocketAddrV4>, NetworkError> {
    let addrs = (hostname, port)
        .to_socket_addrs()
        .map_err(|e| NetworkError::Resolve {
            host: hostname.to_string(),
            reason: e.to_string(),
        })?;

    let candidates: Vec<SocketAddrV4> = addrs
        .filter_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .collect();

    if candidates.is_empty() {
        return Err(NetworkError::Resolve {
            host: hostname.to_string(),
            reason: "no IPv4 address".to_string(),
        });
    }
    Ok(candidates)
}

fn open_socket(op: Operation) -> Result<Socket, NetworkError> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| NetworkError::from_io(op, e))?;
    suppress_sigpipe(&socket).map_err(|e| NetworkError::from_io(op, e))?;
    Ok(socket)
}

#[cfg(target_vendor = "apple")]
fn suppress_sigpipe(socket: &Socket) -> io::Result<()> {
    socket.set_nosigpipe(true)
}

#[cfg(not(target_vendor = "apple"))]
fn suppress_sigpipe(_socket: &Socket) -> io::Result<()> {
    Ok(())
}

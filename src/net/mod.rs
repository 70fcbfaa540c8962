//! TCP server and client helpers built on the readiness poller.
//!
//! These wrap the usual listen/accept and non-blocking connect dances:
//! a [`Server`] accepts connections from inside its read-readiness
//! callback, and [`Client::connect`] turns write readiness into a
//! connected/failed notification. Everything here rides on the same
//! [`Poller`] and [`Transport`] machinery as user code.

use std::io;
use std::mem;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::trace;

use crate::error::{Error, LibraryError};
use crate::interest::{EventMode, Interest};
use crate::poller::{Poller, StatusListener};
use crate::transport::Transport;

/// Resolves `"host:port"` or `"[host6]:port"` with the blocking OS
/// resolver, returning the first address.
pub fn resolve(address: &str) -> Result<SocketAddr, Error> {
    let mut addrs = address
        .to_socket_addrs()
        .map_err(|err| Error::Library(LibraryError::Resolution(err.to_string())))?;
    addrs.next().ok_or_else(|| {
        Error::Library(LibraryError::Resolution(format!(
            "no addresses found for {}",
            address
        )))
    })
}

/// How bad a server-side failure is.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Severity {
    /// A connection was dropped, but the server keeps running.
    Warning,
    /// A resource limit was hit; accepting will be retried on the next
    /// readiness event.
    Severe,
    /// The listening socket is unusable and has been closed.
    Fatal,
}

/// Callbacks from a [`Server`].
pub trait ServerListener: Send + Sync {
    /// A connection was accepted.
    fn on_accept(&self, connection: Connection);

    /// Something went wrong; see [`Severity`] for how bad.
    fn on_error(&self, _error: Error, _severity: Severity) {}
}

/// Callbacks from a pending [`Client::connect`].
pub trait ClientListener: Send + Sync {
    /// The connection is established.
    fn on_connect(&self, connection: Connection);

    /// The connection attempt failed.
    fn on_connect_failed(&self, error: Error);
}

/// A connected stream socket.
#[derive(Clone, Debug)]
pub struct Connection {
    transport: Arc<Transport>,
}

impl Connection {
    pub(crate) fn new(transport: Arc<Transport>) -> Connection {
        Connection { transport }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn local_address(&self) -> Result<SocketAddr, Error> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getsockname(
            self.transport.as_raw_fd(),
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        ))?;
        to_socket_addr(&storage).map_err(Error::from)
    }

    pub fn peer_address(&self) -> Result<SocketAddr, Error> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getpeername(
            self.transport.as_raw_fd(),
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        ))?;
        to_socket_addr(&storage).map_err(Error::from)
    }
}

/// A listening TCP socket that accepts from readiness callbacks.
///
/// The listening transport is attached level-triggered for reads, so a
/// burst of connections that is not fully drained in one callback is
/// picked up again on the next poll.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    transport: Arc<Transport>,
    listener: Arc<dyn ServerListener>,
    local: SocketAddr,
    closing: AtomicBool,
}

impl Server {
    /// Binds `addr`, starts listening and attaches to the poller. Bind to
    /// port 0 and use [`local_address`] to discover the chosen port.
    ///
    /// [`local_address`]: Server::local_address
    pub fn listen(
        poller: &Poller,
        addr: SocketAddr,
        listener: Arc<dyn ServerListener>,
    ) -> Result<Server, Error> {
        let socket = new_stream_socket(&addr)?;

        let yes: libc::c_int = 1;
        syscall!(setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &yes as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ))?;

        let (storage, len) = sockaddr_from(&addr);
        syscall!(bind(
            socket.as_raw_fd(),
            &storage as *const _ as *const libc::sockaddr,
            len,
        ))?;
        syscall!(listen(socket.as_raw_fd(), 128))?;

        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut slen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getsockname(
            socket.as_raw_fd(),
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut slen,
        ))?;
        let local = to_socket_addr(&storage)?;

        let transport = Transport::from_fd(socket)?;
        let inner = Arc::new(ServerInner {
            transport: transport.clone(),
            listener,
            local,
            closing: AtomicBool::new(false),
        });

        poller.attach(
            &transport,
            Arc::new(Acceptor {
                inner: inner.clone(),
            }),
            Interest::READABLE,
            EventMode::Level,
        )?;

        trace!("server listening on {}", local);
        Ok(Server { inner })
    }

    /// The bound address, with the real port filled in.
    pub fn local_address(&self) -> SocketAddr {
        self.inner.local
    }

    /// Stops accepting and closes the listening socket.
    pub fn close(&self) {
        self.inner.closing.store(true, Ordering::Release);
        self.inner.transport.close();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local", &self.inner.local)
            .finish()
    }
}

struct Acceptor {
    inner: Arc<ServerInner>,
}

impl StatusListener for Acceptor {
    fn on_read_ready(&self, transport: &Arc<Transport>) {
        let listener = &self.inner.listener;

        let mut failures = 0;
        while failures < 10 {
            let fd = match accept_stream(transport.as_raw_fd()) {
                Ok(fd) => fd,
                Err(err) => {
                    let errno = err.raw_os_error().unwrap_or(0);
                    match errno {
                        libc::EAGAIN => return,
                        #[allow(unreachable_patterns)]
                        libc::EWOULDBLOCK => return,
                        libc::EBADF | libc::EINVAL => {
                            self.inner.closing.store(true, Ordering::Release);
                            transport.close();
                            listener.on_error(err.into(), Severity::Fatal);
                            return;
                        }
                        libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM => {
                            listener.on_error(err.into(), Severity::Severe);
                            return;
                        }
                        // The kernel documents these as soft accept
                        // failures; the connection is gone but the
                        // listening socket is fine.
                        #[cfg(any(target_os = "linux", target_os = "android"))]
                        libc::ENETDOWN
                        | libc::EPROTO
                        | libc::ENOPROTOOPT
                        | libc::EHOSTDOWN
                        | libc::ENONET
                        | libc::EHOSTUNREACH
                        | libc::EOPNOTSUPP
                        | libc::ENETUNREACH => {
                            failures += 1;
                            listener.on_error(err.into(), Severity::Warning);
                            continue;
                        }
                        _ => {
                            listener.on_error(err.into(), Severity::Warning);
                            return;
                        }
                    }
                }
            };

            match Transport::from_fd(fd) {
                Ok(connection) => listener.on_accept(Connection::new(connection)),
                Err(err) => {
                    failures += 1;
                    listener.on_error(err, Severity::Warning);
                }
            }
        }
    }

    fn on_hangup(&self, _transport: &Arc<Transport>) {
        if self.inner.closing.load(Ordering::Acquire) {
            return;
        }
        self.inner
            .listener
            .on_error(Error::Library(LibraryError::UnknownHangup), Severity::Fatal);
    }

    fn on_error(&self, _transport: &Arc<Transport>, error: Error) {
        self.inner.listener.on_error(error, Severity::Fatal);
    }
}

/// The result of starting a connect.
#[derive(Debug)]
pub enum Connect {
    /// The socket connected synchronously; no callback will fire.
    Connected(Connection),
    /// The connect is in flight; the [`ClientListener`] hears the outcome.
    Pending(Arc<Transport>),
}

/// Non-blocking TCP connect.
#[derive(Debug)]
pub struct Client;

impl Client {
    /// Starts connecting to `addr`. If the socket connects immediately the
    /// connection is returned directly; otherwise the transport is
    /// attached for write readiness and the listener is told how it went.
    pub fn connect(
        poller: &Poller,
        addr: SocketAddr,
        listener: Arc<dyn ClientListener>,
    ) -> Result<Connect, Error> {
        let socket = new_stream_socket(&addr)?;
        let fd = socket.as_raw_fd();

        let (storage, len) = sockaddr_from(&addr);
        let rv = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
        if rv == 0 {
            let transport = Transport::from_fd(socket)?;
            return Ok(Connect::Connected(Connection::new(transport)));
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            return Err(err.into());
        }

        let transport = Transport::from_fd(socket)?;
        poller.attach(
            &transport,
            Arc::new(Connector { listener }),
            Interest::WRITABLE,
            EventMode::Level,
        )?;
        Ok(Connect::Pending(transport))
    }
}

/// Hijacks write readiness to learn when a connect finishes.
struct Connector {
    listener: Arc<dyn ClientListener>,
}

impl Connector {
    fn detach(&self, transport: &Arc<Transport>) {
        if let Some(poller) = transport.poller() {
            poller.detach_transport(transport);
        }
    }

    /// Reads the socket's pending error. A refused or timed-out connect
    /// parks its errno here.
    fn take_status(transport: &Transport) -> Option<Error> {
        let mut status: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rv = syscall!(getsockopt(
            transport.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut status as *mut _ as *mut libc::c_void,
            &mut len,
        ));
        match rv {
            Err(err) => Some(err.into()),
            Ok(_) if status != 0 => Some(Error::Io(io::Error::from_raw_os_error(status))),
            Ok(_) => None,
        }
    }

    fn fail(&self, transport: &Arc<Transport>, fallback: Error) {
        let error = Connector::take_status(transport).unwrap_or(fallback);
        self.listener.on_connect_failed(error);
        transport.close();
    }
}

impl StatusListener for Connector {
    fn on_write_ready(&self, transport: &Arc<Transport>) {
        self.detach(transport);

        match Connector::take_status(transport) {
            Some(error) => {
                self.listener.on_connect_failed(error);
                transport.close();
            }
            None => self.listener.on_connect(Connection::new(transport.clone())),
        }
    }

    fn on_hangup(&self, transport: &Arc<Transport>) {
        self.fail(transport, Error::Library(LibraryError::UnknownHangup));
    }

    fn on_error(&self, transport: &Arc<Transport>, error: Error) {
        self.fail(transport, error);
    }
}

fn new_stream_socket(addr: &SocketAddr) -> io::Result<OwnedFd> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    #[cfg(not(any(target_os = "ios", target_os = "macos")))]
    {
        let fd = syscall!(socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        ))?;
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    #[cfg(any(target_os = "ios", target_os = "macos"))]
    {
        let fd = syscall!(socket(family, libc::SOCK_STREAM, 0))?;
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        crate::sys::set_nonblocking(fd.as_raw_fd())?;
        crate::sys::set_cloexec(fd.as_raw_fd())?;
        Ok(fd)
    }
}

fn accept_stream(fd: RawFd) -> io::Result<OwnedFd> {
    #[cfg(not(any(target_os = "ios", target_os = "macos")))]
    {
        let conn = syscall!(accept4(
            fd,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        ))?;
        Ok(unsafe { OwnedFd::from_raw_fd(conn) })
    }

    #[cfg(any(target_os = "ios", target_os = "macos"))]
    {
        let conn = syscall!(accept(fd, std::ptr::null_mut(), std::ptr::null_mut()))?;
        let conn = unsafe { OwnedFd::from_raw_fd(conn) };
        crate::sys::set_nonblocking(conn.as_raw_fd())?;
        crate::sys::set_cloexec(conn.as_raw_fd())?;
        Ok(conn)
    }
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            // Field-by-field writes sidestep the per-OS extra members of
            // sockaddr_in (sin_len and friends).
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_scope_id = v6.scope_id();
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

fn to_socket_addr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Ok(SocketAddr::new(
                std::net::IpAddr::V4(std::net::Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes())),
                u16::from_be(sin.sin_port),
            ))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Ok(SocketAddr::new(
                std::net::IpAddr::V6(std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr)),
                u16::from_be(sin6.sin6_port),
            ))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported address family: {}", family),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::{resolve, sockaddr_from, to_socket_addr};
    use crate::error::{Error, LibraryError};

    #[test]
    fn resolve_parses_v4_and_v6() {
        assert_eq!(
            resolve("127.0.0.1:8080").unwrap(),
            "127.0.0.1:8080".parse().unwrap()
        );
        assert_eq!(resolve("[::1]:53").unwrap(), "[::1]:53".parse().unwrap());
    }

    #[test]
    fn resolve_reports_resolver_message() {
        match resolve("definitely-not-a-real-host.invalid:1") {
            Err(Error::Library(LibraryError::Resolution(_))) => {}
            other => panic!("expected a resolution error, got {:?}", other),
        }
    }

    #[test]
    fn sockaddr_round_trip() {
        for addr in ["127.0.0.1:65000", "[::1]:1024"] {
            let addr: std::net::SocketAddr = addr.parse().unwrap();
            let (storage, _) = sockaddr_from(&addr);
            assert_eq!(to_socket_addr(&storage).unwrap(), addr);
        }
    }
}

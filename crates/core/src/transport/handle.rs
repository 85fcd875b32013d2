use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use mio::{Interest, Token};
use parking_lot::Mutex;
use socket2::SockRef;

use crate::error::{Error, Result};
use crate::poller::{EventCallback, EventPoller};

/// Transport kind of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockType {
    Tcp,
    Udp,
}

/// An open OS socket in one of its three roles.
#[derive(Debug)]
pub enum RawSocket {
    Stream(TcpStream),
    Listener(TcpListener),
    Datagram(UdpSocket),
}

impl RawSocket {
    pub fn kind(&self) -> SockType {
        match self {
            Self::Stream(_) | Self::Listener(_) => SockType::Tcp,
            Self::Datagram(_) => SockType::Udp,
        }
    }

    /// Borrow as a `socket2` reference for option and control calls.
    pub fn sock_ref(&self) -> SockRef<'_> {
        match self {
            Self::Stream(s) => SockRef::from(s),
            Self::Listener(s) => SockRef::from(s),
            Self::Datagram(s) => SockRef::from(s),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Self::Stream(s) => s.local_addr(),
            Self::Listener(s) => s.local_addr(),
            Self::Datagram(s) => s.local_addr(),
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Self::Stream(s) => s.peer_addr(),
            Self::Listener(_) => Err(io::Error::from(io::ErrorKind::NotConnected)),
            Self::Datagram(s) => s.peer_addr(),
        }
    }
}

impl AsRawFd for RawSocket {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Stream(s) => s.as_raw_fd(),
            Self::Listener(s) => s.as_raw_fd(),
            Self::Datagram(s) => s.as_raw_fd(),
        }
    }
}

impl From<TcpStream> for RawSocket {
    fn from(s: TcpStream) -> Self {
        Self::Stream(s)
    }
}

impl From<TcpListener> for RawSocket {
    fn from(s: TcpListener) -> Self {
        Self::Listener(s)
    }
}

impl From<UdpSocket> for RawSocket {
    fn from(s: UdpSocket) -> Self {
        Self::Datagram(s)
    }
}

/// Sole owner of an OS socket descriptor.
///
/// Shared between every [`SockFd`] registration of the same descriptor.
/// The descriptor is shut down and closed exactly once, when the last
/// `Arc<SockNum>` is released.
#[derive(Debug)]
pub struct SockNum {
    socket: RawSocket,
}

impl SockNum {
    pub fn new(socket: RawSocket) -> Self {
        Self { socket }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn kind(&self) -> SockType {
        self.socket.kind()
    }

    pub fn socket(&self) -> &RawSocket {
        &self.socket
    }

    /// Hook for platforms that need extra work once a stream connects.
    pub fn set_connected(&self) {}
}

impl Drop for SockNum {
    fn drop(&mut self) {
        // Listening and datagram sockets report ENOTCONN here.
        let _ = self.socket.sock_ref().shutdown(Shutdown::Both);
        tracing::trace!(fd = self.raw_fd(), kind = ?self.kind(), "socket closed");
    }
}

/// One registration of a descriptor with one poller.
///
/// Dropping the last `Arc<SockFd>` removes the registration from its poller;
/// the descriptor itself stays open until every `SockFd` sharing the same
/// [`SockNum`] is gone.
pub struct SockFd {
    num: Arc<SockNum>,
    poller: Arc<EventPoller>,
    token: Mutex<Option<Token>>,
}

impl SockFd {
    pub fn new(socket: RawSocket, poller: &Arc<EventPoller>) -> Self {
        Self {
            num: Arc::new(SockNum::new(socket)),
            poller: poller.clone(),
            token: Mutex::new(None),
        }
    }

    /// Share `that`'s descriptor with a different poller.
    ///
    /// Fails with [`Error::SamePoller`] when `poller` is the one `that` is
    /// bound to, since one poller must never hold two registrations of the
    /// same descriptor.
    pub fn duplicate(that: &SockFd, poller: &Arc<EventPoller>) -> Result<Self> {
        if Arc::ptr_eq(&that.poller, poller) {
            return Err(Error::SamePoller);
        }
        Ok(Self {
            num: that.num.clone(),
            poller: poller.clone(),
            token: Mutex::new(None),
        })
    }

    /// Register for readiness on the owning poller, replacing any previous
    /// registration held by this handle.
    pub fn attach(&self, interest: Interest, callback: EventCallback) -> Result<()> {
        let mut token = self.token.lock();
        if let Some(old) = token.take() {
            let _ = self.poller.del_event(old);
        }
        *token = Some(self.poller.add_event(self.raw_fd(), interest, callback)?);
        Ok(())
    }

    /// Change the interest set of the current registration.
    pub fn modify(&self, interest: Interest) -> Result<()> {
        match *self.token.lock() {
            Some(token) => Ok(self.poller.modify_event(token, interest)?),
            None => Err(Error::NoSocket),
        }
    }

    /// Drop the current registration, keeping the descriptor open.
    pub fn detach(&self) {
        if let Some(token) = self.token.lock().take() {
            if let Err(err) = self.poller.del_event(token) {
                tracing::debug!(fd = self.raw_fd(), error = %err, "deregister failed");
            }
        }
    }

    pub fn is_attached(&self) -> bool {
        self.token.lock().is_some()
    }

    /// Whether both handles share one descriptor.
    pub fn same_descriptor(&self, other: &SockFd) -> bool {
        Arc::ptr_eq(&self.num, &other.num)
    }

    pub fn raw_fd(&self) -> RawFd {
        self.num.raw_fd()
    }

    pub fn kind(&self) -> SockType {
        self.num.kind()
    }

    pub fn socket(&self) -> &RawSocket {
        self.num.socket()
    }

    pub fn poller(&self) -> &Arc<EventPoller> {
        &self.poller
    }

    pub fn set_connected(&self) {
        self.num.set_connected();
    }
}

impl Drop for SockFd {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for SockFd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SockFd")
            .field("fd", &self.raw_fd())
            .field("kind", &self.kind())
            .field("poller", &self.poller.name())
            .finish()
    }
}

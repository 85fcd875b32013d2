use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use super::SockInfo;
use super::socket::Socket;
use crate::error::{Result, SockError};
use crate::poller::EventPoller;

/// Something that accepts outbound bytes and can be shut down.
pub trait SockSender {
    fn send(&self, buf: Bytes) -> Result<usize>;

    /// Close the underlying socket, reporting `err` through its error callback.
    fn shutdown(&self, err: SockError);

    fn send_bytes(&self, data: &[u8]) -> Result<usize> {
        self.send(Bytes::copy_from_slice(data))
    }

    fn send_str(&self, data: &str) -> Result<usize> {
        self.send(Bytes::copy_from_slice(data.as_bytes()))
    }

    fn send_fmt(&self, args: fmt::Arguments<'_>) -> Result<usize> {
        self.send(Bytes::from(fmt::format(args)))
    }
}

/// Session-side wrapper around a [`Socket`].
///
/// Caches the socket's addresses on first use so they stay readable after the
/// socket closes, and owns the `try_flush` policy applied to every send.
pub struct SocketHelper {
    sock: Arc<Socket>,
    try_flush: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    peer_addr: Mutex<Option<SocketAddr>>,
}

impl SocketHelper {
    pub fn new(sock: Arc<Socket>) -> Self {
        Self {
            sock,
            try_flush: AtomicBool::new(true),
            local_addr: Mutex::new(None),
            peer_addr: Mutex::new(None),
        }
    }

    pub fn sock(&self) -> &Arc<Socket> {
        &self.sock
    }

    pub fn poller(&self) -> &Arc<EventPoller> {
        self.sock.poller()
    }

    /// With `false`, sends only queue data; call
    /// [`Socket::flush_all`] or send with the flag restored to write it.
    pub fn set_send_flush_flag(&self, try_flush: bool) {
        self.try_flush.store(try_flush, Ordering::Release);
    }

    pub fn is_socket_busy(&self) -> bool {
        self.sock.is_socket_busy()
    }

    /// Run `task` on the socket's poller.
    pub fn run_async<F>(&self, task: F, may_sync: bool)
    where
        F: FnOnce() + Send + 'static,
    {
        self.sock.poller().run_async(task, may_sync);
    }
}

impl SockSender for SocketHelper {
    fn send(&self, buf: Bytes) -> Result<usize> {
        self.sock
            .send(buf, None, self.try_flush.load(Ordering::Acquire))
    }

    fn shutdown(&self, err: SockError) {
        self.sock.emit_err(err);
    }
}

impl SocketHelper {
    /// Shut down with the default local reason.
    pub fn shutdown_self(&self) {
        self.shutdown(SockError::Shutdown("self shutdown".to_string()));
    }
}

impl SockInfo for SocketHelper {
    fn local_addr(&self) -> Option<SocketAddr> {
        let mut cached = self.local_addr.lock();
        if cached.is_none() {
            *cached = self.sock.local_addr();
        }
        *cached
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        let mut cached = self.peer_addr.lock();
        if cached.is_none() {
            *cached = self.sock.peer_addr();
        }
        *cached
    }

    fn identifier(&self) -> String {
        self.sock.identifier()
    }
}

impl fmt::Debug for SocketHelper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketHelper")
            .field("sock", &self.sock)
            .field("try_flush", &self.try_flush.load(Ordering::Relaxed))
            .finish()
    }
}

use std::collections::VecDeque;
use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;

use bytes::Bytes;
use mio::Interest;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Type};

use super::SockInfo;
use super::buffer::BufferList;
use super::handle::{RawSocket, SockFd, SockType};
use crate::error::{Error, Result, SockError};
use crate::poller::{DelayTask, EventPoller, Ready};

/// Default limit on how long queued data may wait for a full flush.
pub const DEFAULT_MAX_SEND_BUFFER_MS: u32 = 10_000;
/// Default `listen(2)` backlog.
pub const DEFAULT_BACKLOG: i32 = 1024;
/// Default size of the per-socket read buffer.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 256 * 1024;

/// Default flags passed to every send call.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
pub const DEFAULT_SEND_FLAGS: i32 = libc::MSG_NOSIGNAL | libc::MSG_DONTWAIT;
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
pub const DEFAULT_SEND_FLAGS: i32 = libc::MSG_DONTWAIT;

pub type ReadCallback = Arc<dyn Fn(&[u8], SocketAddr) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&SockError) + Send + Sync>;
pub type AcceptCallback = Arc<dyn Fn(Arc<Socket>) + Send + Sync>;
/// Returning `false` stops flush notifications until more data is queued.
pub type FlushCallback = Arc<dyn Fn() -> bool + Send + Sync>;
/// Builds the child socket for an accepted connection, e.g. on another poller.
pub type CreateSocketCallback = Arc<dyn Fn(&Arc<EventPoller>) -> Option<Arc<Socket>> + Send + Sync>;
pub type ConnectCallback = Box<dyn FnOnce(std::result::Result<(), SockError>) + Send>;

/// Per-socket tuning.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Queued data older than this since the last full flush fails the
    /// socket with [`SockError::Timeout`]. `0` disables supervision.
    pub max_send_buffer_ms: u32,
    pub read_buffer_size: usize,
    pub backlog: i32,
    pub tcp_nodelay: bool,
    /// `MSG_*` flags for every send call.
    pub send_flags: i32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            max_send_buffer_ms: DEFAULT_MAX_SEND_BUFFER_MS,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            backlog: DEFAULT_BACKLOG,
            tcp_nodelay: true,
            send_flags: DEFAULT_SEND_FLAGS,
        }
    }
}

#[derive(Default)]
struct Callbacks {
    on_read: Option<ReadCallback>,
    on_err: Option<ErrorCallback>,
    on_accept: Option<AcceptCallback>,
    on_flush: Option<FlushCallback>,
    on_before_accept: Option<CreateSocketCallback>,
}

struct ConnectAttempt {
    callback: Mutex<Option<ConnectCallback>>,
    timer: Mutex<Option<DelayTask>>,
}

impl ConnectAttempt {
    fn take(&self) -> Option<ConnectCallback> {
        if let Some(timer) = self.timer.lock().take() {
            timer.cancel();
        }
        self.callback.lock().take()
    }
}

/// An asynchronous TCP client, TCP listener or UDP endpoint bound to one
/// [`EventPoller`].
///
/// All reads, writes, accepts and timers run on the bound poller's thread.
/// Configuration and [`send`](Self::send) may be called from any thread;
/// they only touch the callback table or the waiting queue under a short
/// lock and post the actual I/O to the poller.
///
/// ## Send path
///
/// ```text
/// any thread ──send()──► waiting queue ──(loop)──► sending queue ──► socket
///                         Bytes + dest              BufferList per dest
/// ```
///
/// A write that would block marks the socket busy
/// ([`is_socket_busy`](Self::is_socket_busy)) and arms write readiness.
/// When the sending queue drains the flush callback fires once.
///
/// ## Errors
///
/// The first failure closes the descriptor and posts the error callback to
/// the poller, exactly once. A failed socket is dead; open a new one rather
/// than reusing it.
pub struct Socket {
    weak_self: Weak<Socket>,
    poller: Arc<EventPoller>,
    config: SocketConfig,
    max_send_buffer_ms: AtomicU32,
    send_flags: AtomicI32,
    sock_fd: Mutex<Option<Arc<SockFd>>>,
    callbacks: Mutex<Callbacks>,
    send_buf_waiting: Mutex<VecDeque<(Bytes, Option<SocketAddr>)>>,
    send_buf_sending: Mutex<VecDeque<BufferList>>,
    read_buffer: Mutex<Vec<u8>>,
    sendable: AtomicBool,
    enable_recv: AtomicBool,
    flush_armed: AtomicBool,
    send_flush_ticker: Mutex<Instant>,
    connect_attempt: Mutex<Option<Arc<ConnectAttempt>>>,
    supervisor: Mutex<Option<DelayTask>>,
}

impl Socket {
    pub fn new(poller: Arc<EventPoller>) -> Arc<Self> {
        Self::with_config(poller, SocketConfig::default())
    }

    pub fn with_config(poller: Arc<EventPoller>, config: SocketConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            poller,
            max_send_buffer_ms: AtomicU32::new(config.max_send_buffer_ms),
            send_flags: AtomicI32::new(config.send_flags),
            read_buffer: Mutex::new(Vec::new()),
            config,
            sock_fd: Mutex::new(None),
            callbacks: Mutex::new(Callbacks::default()),
            send_buf_waiting: Mutex::new(VecDeque::new()),
            send_buf_sending: Mutex::new(VecDeque::new()),
            sendable: AtomicBool::new(true),
            enable_recv: AtomicBool::new(true),
            flush_armed: AtomicBool::new(false),
            send_flush_ticker: Mutex::new(Instant::now()),
            connect_attempt: Mutex::new(None),
            supervisor: Mutex::new(None),
        })
    }

    pub fn poller(&self) -> &Arc<EventPoller> {
        &self.poller
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    // ---------------------------------------------------------------
    // Callbacks
    // ---------------------------------------------------------------

    pub fn set_on_read<F>(&self, cb: F)
    where
        F: Fn(&[u8], SocketAddr) + Send + Sync + 'static,
    {
        self.callbacks.lock().on_read = Some(Arc::new(cb));
    }

    pub fn set_on_err<F>(&self, cb: F)
    where
        F: Fn(&SockError) + Send + Sync + 'static,
    {
        self.callbacks.lock().on_err = Some(Arc::new(cb));
    }

    pub fn set_on_accept<F>(&self, cb: F)
    where
        F: Fn(Arc<Socket>) + Send + Sync + 'static,
    {
        self.callbacks.lock().on_accept = Some(Arc::new(cb));
    }

    pub fn set_on_flush<F>(&self, cb: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.callbacks.lock().on_flush = Some(Arc::new(cb));
    }

    pub fn set_on_before_accept<F>(&self, cb: F)
    where
        F: Fn(&Arc<EventPoller>) -> Option<Arc<Socket>> + Send + Sync + 'static,
    {
        self.callbacks.lock().on_before_accept = Some(Arc::new(cb));
    }

    // ---------------------------------------------------------------
    // Opening
    // ---------------------------------------------------------------

    /// Start an asynchronous TCP connect.
    ///
    /// `callback` fires exactly once on the poller thread: `Ok(())` when
    /// connected, otherwise the failure ([`SockError::Dns`],
    /// [`SockError::Timeout`], [`SockError::ConnectionRefused`], ...).
    /// Host names are resolved on a worker thread. A later `connect` or
    /// [`close_sock`](Self::close_sock) supersedes this attempt and its
    /// callback is dropped unfired.
    pub fn connect<F>(
        &self,
        url: &str,
        port: u16,
        callback: F,
        timeout_sec: f32,
        local_ip: &str,
        local_port: u16,
    ) where
        F: FnOnce(std::result::Result<(), SockError>) + Send + 'static,
    {
        self.close_sock();

        let attempt = Arc::new(ConnectAttempt {
            callback: Mutex::new(Some(Box::new(callback))),
            timer: Mutex::new(None),
        });
        *self.connect_attempt.lock() = Some(attempt.clone());

        let weak_self = self.weak_self.clone();
        let weak_attempt = Arc::downgrade(&attempt);
        let timeout_ms = (timeout_sec.max(0.0) * 1000.0) as u64;
        let timer = self.poller.do_delay_task(timeout_ms, move || {
            if let (Some(this), Some(attempt)) = (weak_self.upgrade(), weak_attempt.upgrade()) {
                this.finish_connect(
                    &attempt,
                    Err(SockError::Timeout("connect timeout".to_string())),
                );
            }
            0
        });
        *attempt.timer.lock() = Some(timer);

        let local = match local_bind_addr(local_ip, local_port) {
            Ok(local) => local,
            Err(err) => {
                self.post_connect_failure(attempt, SockError::from_io(&err));
                return;
            }
        };

        let weak_self = self.weak_self.clone();
        if let Ok(ip) = url.parse::<IpAddr>() {
            let addr = SocketAddr::new(ip, port);
            self.poller.run_async(
                move || {
                    if let Some(this) = weak_self.upgrade() {
                        this.start_connect(&attempt, addr, local);
                    }
                },
                true,
            );
            return;
        }

        let poller = self.poller.clone();
        let host = url.to_string();
        let worker_attempt = attempt.clone();
        let spawned = thread::Builder::new()
            .name("dns-resolver".to_string())
            .spawn(move || {
                let resolved = (host.as_str(), port).to_socket_addrs().and_then(|mut addrs| {
                    addrs
                        .next()
                        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address"))
                });
                poller.run_async(
                    move || {
                        let Some(this) = weak_self.upgrade() else {
                            return;
                        };
                        match resolved {
                            Ok(addr) => this.start_connect(&worker_attempt, addr, local),
                            Err(err) => this.finish_connect(
                                &worker_attempt,
                                Err(SockError::Dns(format!("{host}: {err}"))),
                            ),
                        }
                    },
                    true,
                );
            });
        if let Err(err) = spawned {
            self.post_connect_failure(attempt, SockError::Dns(err.to_string()));
        }
    }

    /// Open a TCP listener. `port = 0` picks an ephemeral port.
    pub fn listen(&self, port: u16, local_ip: &str, backlog: i32) -> Result<()> {
        self.close_sock();

        let addr = bind_addr(local_ip, port)?;
        let socket = socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SockAddr::from(addr))?;
        socket.listen(backlog)?;

        let fd = Arc::new(SockFd::new(RawSocket::Listener(socket.into()), &self.poller));
        self.install(fd.clone());
        if let Err(err) = self.attach_listen(&fd) {
            self.close_sock();
            return Err(err);
        }
        tracing::debug!(fd = fd.raw_fd(), %addr, poller = %self.poller.name(), "listening");
        Ok(())
    }

    /// Open a UDP endpoint. `port = 0` picks an ephemeral port.
    pub fn bind_udp_sock(&self, port: u16, local_ip: &str) -> Result<()> {
        self.close_sock();

        let addr = bind_addr(local_ip, port)?;
        let socket = socket2::Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SockAddr::from(addr))?;

        let udp: UdpSocket = socket.into();
        let fd = Arc::new(SockFd::new(RawSocket::Datagram(udp), &self.poller));
        self.install(fd.clone());
        if let Err(err) = self.attach_event(&fd) {
            self.close_sock();
            return Err(err);
        }
        tracing::debug!(fd = fd.raw_fd(), %addr, "udp socket bound");
        Ok(())
    }

    /// Service `other`'s listening descriptor from this socket's poller too.
    ///
    /// Both sockets then accept connections from the same queue. Fails with
    /// [`Error::SocketInUse`] if this socket owns a different descriptor and
    /// with [`Error::SamePoller`] if both sockets share a poller.
    pub fn clone_from_listen_socket(&self, other: &Socket) -> Result<()> {
        let other_fd = other.sock_fd().ok_or(Error::NoSocket)?;
        if !matches!(other_fd.socket(), RawSocket::Listener(_)) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a listening socket",
            )));
        }
        if let Some(current) = self.sock_fd() {
            if current.same_descriptor(&other_fd) {
                return Ok(());
            }
            return Err(Error::SocketInUse);
        }

        let fd = Arc::new(SockFd::duplicate(&other_fd, &self.poller)?);
        self.install(fd.clone());
        if let Err(err) = self.attach_listen(&fd) {
            self.close_sock();
            return Err(err);
        }
        tracing::debug!(fd = fd.raw_fd(), poller = %self.poller.name(), "listener cloned");
        Ok(())
    }

    /// Set the default destination of a UDP socket.
    pub fn set_send_peer_addr(&self, addr: SocketAddr) -> Result<()> {
        let fd = self.sock_fd().ok_or(Error::NoSocket)?;
        match fd.socket() {
            RawSocket::Datagram(udp) => Ok(udp.connect(addr)?),
            _ => Err(Error::Io(io::Error::new(
                io::ErrorKind::Unsupported,
                "peer address only applies to udp sockets",
            ))),
        }
    }

    // ---------------------------------------------------------------
    // Sending
    // ---------------------------------------------------------------

    /// Queue `buf` for sending. The single outbound entry point.
    ///
    /// Returns the number of bytes queued (`0` for an empty buffer) or
    /// [`Error::NoSocket`]. With `try_flush`, a write is attempted on the
    /// poller right away (inline when already on it). Never blocks.
    pub fn send(&self, buf: Bytes, addr: Option<SocketAddr>, try_flush: bool) -> Result<usize> {
        if self.sock_fd.lock().is_none() {
            return Err(Error::NoSocket);
        }
        let size = buf.len();
        if size == 0 {
            return Ok(0);
        }

        {
            let mut waiting = self.send_buf_waiting.lock();
            if waiting.is_empty() && self.sendable.load(Ordering::Acquire) {
                *self.send_flush_ticker.lock() = Instant::now();
            }
            waiting.push_back((buf, addr));
        }
        self.flush_armed.store(true, Ordering::Release);

        if try_flush && self.sendable.load(Ordering::Acquire) {
            self.flush_all();
        }
        Ok(size)
    }

    pub fn send_bytes(&self, data: &[u8]) -> Result<usize> {
        self.send(Bytes::copy_from_slice(data), None, true)
    }

    pub fn send_str(&self, data: &str) -> Result<usize> {
        self.send_bytes(data.as_bytes())
    }

    /// Post a write attempt for everything queued.
    pub fn flush_all(&self) {
        let weak_self = self.weak_self.clone();
        self.poller.run_async(
            move || {
                let Some(this) = weak_self.upgrade() else {
                    return;
                };
                if let Some(fd) = this.sock_fd() {
                    if this.sendable.load(Ordering::Acquire) {
                        this.flush_data(&fd);
                    }
                }
            },
            true,
        );
    }

    /// Whether the last write attempt left data in the sending queue.
    pub fn is_socket_busy(&self) -> bool {
        !self.sendable.load(Ordering::Acquire)
    }

    /// Buffers (not bytes) waiting in both queues.
    pub fn send_buffer_count(&self) -> usize {
        let waiting = self.send_buf_waiting.lock().len();
        let sending: usize = self.send_buf_sending.lock().iter().map(BufferList::count).sum();
        waiting + sending
    }

    /// Milliseconds since the send queues last drained completely.
    pub fn elapsed_time_after_flushed(&self) -> u64 {
        self.send_flush_ticker.lock().elapsed().as_millis() as u64
    }

    /// Replace the `MSG_*` flags used by later writes.
    pub fn set_send_flags(&self, flags: i32) {
        self.send_flags.store(flags, Ordering::Release);
    }

    pub fn send_flags(&self) -> i32 {
        self.send_flags.load(Ordering::Acquire)
    }

    pub fn set_send_timeout_second(&self, second: u32) {
        self.max_send_buffer_ms
            .store(second.saturating_mul(1000), Ordering::Release);
    }

    // ---------------------------------------------------------------
    // Control
    // ---------------------------------------------------------------

    /// Close the socket and deliver `err` through the error callback.
    ///
    /// Only the first call after a socket was opened has an effect; it
    /// returns `true`. The callback runs later on the poller thread.
    pub fn emit_err(&self, err: SockError) -> bool {
        let Some(fd) = self.sock_fd.lock().take() else {
            return false;
        };
        self.reset_state();
        tracing::debug!(fd = fd.raw_fd(), error = %err, "socket closed on error");
        drop(fd);

        let weak_self = self.weak_self.clone();
        self.poller.run_async(
            move || {
                let Some(this) = weak_self.upgrade() else {
                    return;
                };
                let on_err = this.callbacks.lock().on_err.clone();
                match on_err {
                    Some(cb) => cb(&err),
                    None => tracing::debug!(error = %err, "unhandled socket error"),
                }
            },
            false,
        );
        true
    }

    /// Stop or resume reading. Read readiness stays registered so hang-ups
    /// are still noticed; resuming triggers a read pass for data that
    /// arrived meanwhile.
    pub fn enable_recv(&self, enabled: bool) {
        if self.enable_recv.swap(enabled, Ordering::AcqRel) == enabled || !enabled {
            return;
        }
        let weak_self = self.weak_self.clone();
        self.poller.run_async(
            move || {
                let Some(this) = weak_self.upgrade() else {
                    return;
                };
                if let Some(fd) = this.sock_fd() {
                    this.on_read(&fd);
                }
            },
            true,
        );
    }

    pub fn is_recv_enabled(&self) -> bool {
        self.enable_recv.load(Ordering::Acquire)
    }

    /// Close without notifying the error callback.
    pub fn close_sock(&self) {
        let fd = self.sock_fd.lock().take();
        self.reset_state();
        drop(fd);
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.sock_fd().map(|fd| fd.raw_fd())
    }

    pub fn sock_type(&self) -> Option<SockType> {
        self.sock_fd().map(|fd| fd.kind())
    }

    // ---------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------

    fn sock_fd(&self) -> Option<Arc<SockFd>> {
        self.sock_fd.lock().clone()
    }

    fn is_current(&self, fd: &Arc<SockFd>) -> bool {
        self.sock_fd
            .lock()
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, fd))
    }

    fn install(&self, fd: Arc<SockFd>) {
        let old = self.sock_fd.lock().replace(fd);
        drop(old);
    }

    fn reset_state(&self) {
        if let Some(attempt) = self.connect_attempt.lock().take() {
            drop(attempt.take());
        }
        if let Some(task) = self.supervisor.lock().take() {
            task.cancel();
        }
        self.send_buf_waiting.lock().clear();
        self.send_buf_sending.lock().clear();
        self.sendable.store(true, Ordering::Release);
        self.flush_armed.store(false, Ordering::Release);
    }

    fn post_connect_failure(&self, attempt: Arc<ConnectAttempt>, err: SockError) {
        let weak_self = self.weak_self.clone();
        self.poller.run_async(
            move || {
                if let Some(this) = weak_self.upgrade() {
                    this.finish_connect(&attempt, Err(err));
                }
            },
            true,
        );
    }

    fn is_current_attempt(&self, attempt: &Arc<ConnectAttempt>) -> bool {
        self.connect_attempt
            .lock()
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, attempt))
    }

    fn start_connect(&self, attempt: &Arc<ConnectAttempt>, addr: SocketAddr, local: Option<SocketAddr>) {
        if !self.is_current_attempt(attempt) {
            return;
        }
        let stream = match open_connecting(addr, local) {
            Ok(stream) => stream,
            Err(err) => {
                self.finish_connect(attempt, Err(SockError::from_io(&err)));
                return;
            }
        };

        let fd = Arc::new(SockFd::new(RawSocket::Stream(stream), &self.poller));
        self.install(fd.clone());

        let weak_self = self.weak_self.clone();
        let weak_fd = Arc::downgrade(&fd);
        let weak_attempt = Arc::downgrade(attempt);
        let attached = fd.attach(
            Interest::WRITABLE,
            Box::new(move |ready| {
                let (Some(this), Some(fd), Some(attempt)) =
                    (weak_self.upgrade(), weak_fd.upgrade(), weak_attempt.upgrade())
                else {
                    return;
                };
                this.on_connect_ready(&fd, &attempt, ready);
            }),
        );
        if let Err(err) = attached {
            let err = match err {
                Error::Io(io) => SockError::from_io(&io),
                other => SockError::Other {
                    code: -1,
                    message: other.to_string(),
                },
            };
            self.finish_connect(attempt, Err(err));
            return;
        }
        tracing::debug!(fd = fd.raw_fd(), %addr, "connecting");
    }

    fn on_connect_ready(&self, fd: &Arc<SockFd>, attempt: &Arc<ConnectAttempt>, ready: Ready) {
        if !self.is_current_attempt(attempt) || !self.is_current(fd) {
            return;
        }
        let RawSocket::Stream(stream) = fd.socket() else {
            return;
        };
        match stream.take_error() {
            Ok(Some(err)) | Err(err) => {
                self.finish_connect(attempt, Err(SockError::from_io(&err)));
                return;
            }
            Ok(None) => {}
        }
        match stream.peer_addr() {
            Ok(peer) => {
                fd.set_connected();
                if self.config.tcp_nodelay {
                    let _ = stream.set_nodelay(true);
                }
                if let Err(err) = self.attach_event(fd) {
                    self.finish_connect(
                        attempt,
                        Err(SockError::Other {
                            code: -1,
                            message: err.to_string(),
                        }),
                    );
                    return;
                }
                tracing::debug!(fd = fd.raw_fd(), %peer, "connected");
                self.finish_connect(attempt, Ok(()));
            }
            Err(_) if ready.error || ready.closed => {
                self.finish_connect(
                    attempt,
                    Err(SockError::ConnectionRefused("connection closed during connect".to_string())),
                );
            }
            // Spurious wake-up, still in progress.
            Err(_) => {}
        }
    }

    fn finish_connect(&self, attempt: &Arc<ConnectAttempt>, result: std::result::Result<(), SockError>) {
        let Some(callback) = attempt.take() else {
            return;
        };
        {
            let mut current = self.connect_attempt.lock();
            if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, attempt)) {
                *current = None;
            }
        }
        if let Err(err) = &result {
            tracing::debug!(error = %err, "connect failed");
            self.close_sock();
        }
        callback(result);
    }

    fn attach_listen(&self, fd: &Arc<SockFd>) -> Result<()> {
        let weak_self = self.weak_self.clone();
        let weak_fd = Arc::downgrade(fd);
        fd.attach(
            Interest::READABLE,
            Box::new(move |ready| {
                if let (Some(this), Some(fd)) = (weak_self.upgrade(), weak_fd.upgrade()) {
                    this.on_accept(&fd, ready);
                }
            }),
        )
    }

    fn attach_event(&self, fd: &Arc<SockFd>) -> Result<()> {
        let weak_self = self.weak_self.clone();
        let weak_fd = Arc::downgrade(fd);
        let interest = if self.sendable.load(Ordering::Acquire) {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        fd.attach(
            interest,
            Box::new(move |ready| {
                let (Some(this), Some(fd)) = (weak_self.upgrade(), weak_fd.upgrade()) else {
                    return;
                };
                if ready.readable || ready.closed {
                    this.on_read(&fd);
                }
                if ready.writable {
                    this.on_writable(&fd);
                }
                if ready.error {
                    this.on_error(&fd);
                }
            }),
        )?;
        self.start_send_supervisor();
        Ok(())
    }

    fn on_accept(&self, fd: &Arc<SockFd>, ready: Ready) {
        if ready.error {
            self.on_error(fd);
            return;
        }
        let RawSocket::Listener(listener) = fd.socket() else {
            return;
        };
        loop {
            match listener.accept() {
                Ok((stream, peer)) => self.accept_one(stream, peer),
                Err(err) => match err.kind() {
                    io::ErrorKind::WouldBlock => return,
                    io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted => continue,
                    _ => {
                        tracing::warn!(fd = fd.raw_fd(), error = %err, "accept failed");
                        if self.is_current(fd) {
                            self.emit_err(SockError::from_io(&err));
                        }
                        return;
                    }
                },
            }
        }
    }

    fn accept_one(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(err) = stream.set_nonblocking(true) {
            tracing::warn!(%peer, error = %err, "failed to configure accepted socket");
            return;
        }
        if self.config.tcp_nodelay {
            let _ = stream.set_nodelay(true);
        }

        let (on_before_accept, on_accept) = {
            let callbacks = self.callbacks.lock();
            (callbacks.on_before_accept.clone(), callbacks.on_accept.clone())
        };
        let Some(on_accept) = on_accept else {
            tracing::debug!(%peer, "no accept callback, dropping connection");
            return;
        };
        let child = on_before_accept
            .and_then(|factory| factory(&self.poller))
            .unwrap_or_else(|| Socket::with_config(self.poller.clone(), self.config.clone()));

        let child_fd = child.set_peer_sock(stream);
        tracing::debug!(fd = child_fd.raw_fd(), %peer, poller = %child.poller.name(), "accepted");
        on_accept(child.clone());

        let target = child.clone();
        child.poller.run_async(
            move || {
                if !target.is_current(&child_fd) {
                    return;
                }
                if let Err(err) = target.attach_event(&child_fd) {
                    target.emit_err(SockError::Other {
                        code: -1,
                        message: err.to_string(),
                    });
                }
            },
            true,
        );
    }

    fn set_peer_sock(&self, stream: TcpStream) -> Arc<SockFd> {
        self.close_sock();
        let fd = Arc::new(SockFd::new(RawSocket::Stream(stream), &self.poller));
        fd.set_connected();
        self.install(fd.clone());
        fd
    }

    fn on_read(&self, fd: &Arc<SockFd>) {
        if !self.is_current(fd) {
            return;
        }
        let on_read = self.callbacks.lock().on_read.clone();
        let peer = fd
            .socket()
            .peer_addr()
            .unwrap_or(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
        // Taken out of the lock so the callback may re-enter through
        // `enable_recv`; a nested pass allocates its own buffer.
        let mut buffer = std::mem::take(&mut *self.read_buffer.lock());
        if buffer.is_empty() {
            buffer.resize(self.config.read_buffer_size.max(1), 0);
        }
        self.read_pass(fd, &mut buffer, on_read.as_ref(), peer);
        *self.read_buffer.lock() = buffer;
    }

    fn read_pass(
        &self,
        fd: &Arc<SockFd>,
        buffer: &mut [u8],
        on_read: Option<&ReadCallback>,
        peer: SocketAddr,
    ) {
        loop {
            if !self.enable_recv.load(Ordering::Acquire) {
                return;
            }
            let received = match fd.socket() {
                RawSocket::Stream(stream) => {
                    let mut stream: &TcpStream = stream;
                    stream.read(buffer).map(|n| (n, peer))
                }
                RawSocket::Datagram(udp) => udp.recv_from(buffer),
                RawSocket::Listener(_) => return,
            };
            match received {
                Ok((0, _)) if fd.kind() == SockType::Tcp => {
                    self.emit_err(SockError::EndOfStream);
                    return;
                }
                Ok((n, from)) => match on_read {
                    Some(cb) => cb(&buffer[..n], from),
                    None => tracing::trace!(fd = fd.raw_fd(), n, "data dropped, no read callback"),
                },
                Err(err) => match err.kind() {
                    io::ErrorKind::WouldBlock => return,
                    io::ErrorKind::Interrupted => continue,
                    // ICMP port unreachable from an earlier datagram.
                    io::ErrorKind::ConnectionRefused if fd.kind() == SockType::Udp => continue,
                    _ => {
                        self.emit_err(SockError::from_io(&err));
                        return;
                    }
                },
            }
        }
    }

    fn on_writable(&self, fd: &Arc<SockFd>) {
        if self.is_current(fd) {
            self.flush_data(fd);
        }
    }

    fn on_error(&self, fd: &Arc<SockFd>) {
        if !self.is_current(fd) {
            return;
        }
        let err = match fd.socket().sock_ref().take_error() {
            Ok(Some(err)) | Err(err) => SockError::from_io(&err),
            Ok(None) => SockError::Other {
                code: 0,
                message: "socket error event".to_string(),
            },
        };
        self.emit_err(err);
    }

    /// Drain both queues into the socket. Runs on the poller thread only.
    fn flush_data(&self, fd: &Arc<SockFd>) -> bool {
        let coalesce_all = fd.kind() == SockType::Tcp;
        let flags = self.send_flags();
        let mut had_data = !self.sendable.load(Ordering::Acquire);
        loop {
            {
                let mut sending = self.send_buf_sending.lock();
                if sending.is_empty() {
                    let mut waiting = self.send_buf_waiting.lock();
                    if waiting.is_empty() {
                        drop(waiting);
                        drop(sending);
                        if had_data {
                            self.on_flushed(fd);
                        }
                        return true;
                    }
                    for (buf, addr) in waiting.drain(..) {
                        let addr = if coalesce_all { None } else { addr };
                        match sending.back_mut() {
                            Some(list) if list.addr() == addr => list.push(buf),
                            _ => {
                                let mut list = BufferList::new(addr);
                                list.push(buf);
                                sending.push_back(list);
                            }
                        }
                    }
                }
            }
            had_data = true;

            let mut sending = self.send_buf_sending.lock();
            while let Some(list) = sending.front_mut() {
                if let Err(err) = list.send_to(fd.socket(), flags) {
                    drop(sending);
                    tracing::debug!(fd = fd.raw_fd(), error = %err, "write failed");
                    self.emit_err(SockError::from_io(&err));
                    return false;
                }
                if !list.is_empty() {
                    break;
                }
                sending.pop_front();
            }
            if !sending.is_empty() {
                drop(sending);
                if self.sendable.swap(false, Ordering::AcqRel) {
                    self.set_write_interest(fd, true);
                }
                return true;
            }
        }
    }

    fn on_flushed(&self, fd: &Arc<SockFd>) {
        if !self.sendable.swap(true, Ordering::AcqRel) {
            self.set_write_interest(fd, false);
        }
        *self.send_flush_ticker.lock() = Instant::now();

        if !self.flush_armed.load(Ordering::Acquire) {
            return;
        }
        let on_flush = self.callbacks.lock().on_flush.clone();
        if let Some(cb) = on_flush {
            if !cb() {
                self.flush_armed.store(false, Ordering::Release);
            }
        }
    }

    fn set_write_interest(&self, fd: &Arc<SockFd>, enabled: bool) {
        let interest = if enabled {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if let Err(err) = fd.modify(interest) {
            tracing::debug!(fd = fd.raw_fd(), error = %err, "failed to update write interest");
        }
    }

    fn start_send_supervisor(&self) {
        let weak_self = self.weak_self.clone();
        let interval = supervise_interval(self.max_send_buffer_ms.load(Ordering::Acquire));
        let task = self.poller.do_delay_task(interval, move || {
            let Some(this) = weak_self.upgrade() else {
                return 0;
            };
            if this.sock_fd.lock().is_none() {
                return 0;
            }
            let max_ms = this.max_send_buffer_ms.load(Ordering::Acquire);
            let elapsed = this.elapsed_time_after_flushed();
            if max_ms > 0 && this.send_buffer_count() > 0 && elapsed > u64::from(max_ms) {
                tracing::warn!(elapsed, max_ms, "send buffer stalled");
                this.emit_err(SockError::Timeout(format!(
                    "send buffer not flushed for {elapsed} ms"
                )));
                return 0;
            }
            supervise_interval(max_ms)
        });
        if let Some(old) = self.supervisor.lock().replace(task) {
            old.cancel();
        }
    }
}

impl SockInfo for Socket {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.sock_fd().and_then(|fd| fd.socket().local_addr().ok())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.sock_fd().and_then(|fd| fd.socket().peer_addr().ok())
    }

    fn identifier(&self) -> String {
        format!("{:p}", self as *const Self)
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close_sock();
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("fd", &self.raw_fd())
            .field("poller", &self.poller.name())
            .field("busy", &self.is_socket_busy())
            .finish()
    }
}

fn supervise_interval(max_ms: u32) -> u64 {
    u64::from(max_ms / 4).clamp(100, 2_000)
}

fn bind_addr(local_ip: &str, port: u16) -> io::Result<SocketAddr> {
    let ip: IpAddr = local_ip.parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid local ip: {local_ip}"),
        )
    })?;
    Ok(SocketAddr::new(ip, port))
}

fn local_bind_addr(local_ip: &str, local_port: u16) -> io::Result<Option<SocketAddr>> {
    let addr = bind_addr(local_ip, local_port)?;
    if addr.ip().is_unspecified() && local_port == 0 {
        Ok(None)
    } else {
        Ok(Some(addr))
    }
}

fn open_connecting(addr: SocketAddr, local: Option<SocketAddr>) -> io::Result<TcpStream> {
    let socket = socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    if let Some(local) = local {
        socket.set_reuse_address(true)?;
        socket.bind(&SockAddr::from(local))?;
    }
    match socket.connect(&SockAddr::from(addr)) {
        Ok(()) => {}
        Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
        Err(err) => return Err(err),
    }
    Ok(socket.into())
}

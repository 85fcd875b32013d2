//! Asynchronous sockets driven by [`EventPoller`](crate::poller::EventPoller)s.
//!
//! The layer is split by ownership:
//!
//! - **Handle** ([`handle`]): [`SockNum`] owns an OS descriptor, [`SockFd`]
//!   is one registration of it with one poller. A listening descriptor may
//!   be registered with several pollers at once.
//!
//! - **Socket** ([`socket`]): TCP client, TCP listener or UDP endpoint with
//!   callback-based reads, buffered non-blocking sends, flush notification
//!   and send-timeout supervision.
//!
//! - **Sender** ([`sender`]): the [`SockSender`] trait and [`SocketHelper`],
//!   the wrapper session code writes through.
//!
//! Interleaved RTP (RFC 2326 §10.12) is produced by
//! [`RtpReceiver`](crate::media::RtpReceiver) and written with plain
//! [`Socket::send`] calls.

use std::net::SocketAddr;

pub mod buffer;
pub mod handle;
pub mod sender;
pub mod socket;

pub use buffer::BufferList;
pub use handle::{RawSocket, SockFd, SockNum, SockType};
pub use sender::{SockSender, SocketHelper};
pub use socket::{Socket, SocketConfig};

/// Address information of a socket-like object.
pub trait SockInfo {
    fn local_addr(&self) -> Option<SocketAddr>;
    fn peer_addr(&self) -> Option<SocketAddr>;
    fn identifier(&self) -> String;
}

//! Error types for the streaming core.

use std::fmt;
use std::io;

/// Errors returned synchronously by the streaming core.
///
/// Variants map to specific failure modes across the stack:
///
/// - **OS**: [`Io`](Self::Io): socket creation, bind and listen failures with
///   the OS error preserved.
/// - **Transport**: [`Sock`](Self::Sock): a classified socket failure,
///   [`NoSocket`](Self::NoSocket), [`SocketInUse`](Self::SocketInUse).
/// - **Handle**: [`SamePoller`](Self::SamePoller).
/// - **Media**: [`Packet`](Self::Packet): a dropped RTP packet.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Classified transport failure.
    #[error(transparent)]
    Sock(#[from] SockError),

    /// RTP packet rejected by the receiver.
    #[error(transparent)]
    Packet(#[from] PacketError),

    /// The transport has no descriptor (never opened, or already closed).
    #[error("socket is not open")]
    NoSocket,

    /// A descriptor was duplicated onto the poller it is already registered with.
    #[error("descriptor already registered with this poller")]
    SamePoller,

    /// The transport already owns a different descriptor.
    #[error("socket already owns a different descriptor")]
    SocketInUse,

    /// The poller thread has exited.
    #[error("event poller is shut down")]
    PollerShutdown,
}

/// Numeric transport error code, stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrCode {
    Success = 0,
    Eof = 1,
    Timeout = 2,
    Refused = 3,
    Dns = 4,
    Shutdown = 5,
    Other = 0xFF,
}

/// A transport failure delivered through a socket's error callback.
///
/// Every externally observable failure of a [`Socket`](crate::transport::Socket)
/// arrives as exactly one `SockError`, after which the socket is closed.
/// Success is never represented here: connect callbacks receive `Ok(())`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SockError {
    /// The peer closed the stream.
    #[error("end of stream")]
    EndOfStream,

    /// Connect or send supervision timed out.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The peer actively refused the connection.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// Host name resolution failed.
    #[error("dns resolution failed: {0}")]
    Dns(String),

    /// Shutdown requested locally.
    #[error("shutdown: {0}")]
    Shutdown(String),

    /// Any other OS-level failure, with the raw error code.
    #[error("socket error {code}: {message}")]
    Other { code: i32, message: String },
}

impl SockError {
    pub fn code(&self) -> ErrCode {
        match self {
            Self::EndOfStream => ErrCode::Eof,
            Self::Timeout(_) => ErrCode::Timeout,
            Self::ConnectionRefused(_) => ErrCode::Refused,
            Self::Dns(_) => ErrCode::Dns,
            Self::Shutdown(_) => ErrCode::Shutdown,
            Self::Other { .. } => ErrCode::Other,
        }
    }

    /// Classify an OS error.
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused(err.to_string()),
            io::ErrorKind::TimedOut => Self::Timeout(err.to_string()),
            io::ErrorKind::UnexpectedEof => Self::EndOfStream,
            _ => Self::Other {
                code: err.raw_os_error().unwrap_or(-1),
                message: err.to_string(),
            },
        }
    }
}

impl From<io::Error> for SockError {
    fn from(err: io::Error) -> Self {
        Self::from_io(&err)
    }
}

/// Why an RTP packet was dropped by [`RtpReceiver`](crate::media::RtpReceiver).
///
/// All variants are locally recoverable: the packet is dropped and the
/// session stays alive. Only [`InvalidPacketKind::BadVersion`] is a protocol
/// violation a caller may choose to terminate the session on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    /// Header could not be parsed.
    #[error("invalid RTP packet: {0}")]
    InvalidPacket(InvalidPacketKind),

    /// Header parsed, but no payload bytes follow it.
    #[error("RTP packet has no payload: {len} <= {offset}")]
    EmptyPayload { len: usize, offset: usize },

    /// Packet is larger than [`RTP_MAX_SIZE`](crate::media::RTP_MAX_SIZE).
    #[error("RTP packet too large: {len} bytes")]
    OversizedPacket { len: usize },

    /// The track's clock rate is zero, no millisecond timestamp can be derived.
    #[error("unknown clock rate")]
    UnknownClockRate,

    /// SSRC differs from the one recorded for the track.
    #[error("SSRC mismatch: {got:#010X} != {expected:#010X}")]
    SsrcMismatch { expected: u32, got: u32 },

    /// Mismatches exceeded the threshold; the track now follows `new`.
    #[error("SSRC switched: {old:#010X} -> {new:#010X}")]
    SsrcSwitched { old: u32, new: u32 },
}

impl PacketError {
    /// Whether this is a hard protocol violation rather than a transient drop.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::InvalidPacket(InvalidPacketKind::BadVersion(_)))
    }
}

/// Specific kind of RTP header parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidPacketKind {
    /// Shorter than the 12-byte fixed header.
    TooShort(usize),
    /// Version field is not 2.
    BadVersion(u8),
    /// Declared padding is longer than the packet body.
    BadPadding(u8),
}

impl fmt::Display for InvalidPacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort(len) => write!(f, "packet too short ({len} bytes)"),
            Self::BadVersion(v) => write!(f, "version {v} != 2"),
            Self::BadPadding(p) => write!(f, "padding {p} exceeds packet body"),
        }
    }
}

/// Convenience alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_is_classified() {
        let err = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(SockError::from_io(&err).code(), ErrCode::Refused);
    }

    #[test]
    fn raw_os_error_is_kept() {
        let err = io::Error::from_raw_os_error(98);
        match SockError::from(err) {
            SockError::Other { code, .. } => assert_eq!(code, 98),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn only_bad_version_is_protocol_violation() {
        assert!(PacketError::InvalidPacket(InvalidPacketKind::BadVersion(1)).is_protocol_violation());
        assert!(!PacketError::InvalidPacket(InvalidPacketKind::TooShort(3)).is_protocol_violation());
        assert!(!PacketError::UnknownClockRate.is_protocol_violation());
    }
}

pub mod error;
pub mod media;
pub mod poller;
pub mod transport;

pub use error::{ErrCode, Error, PacketError, Result, SockError};
pub use media::{ReceiverConfig, RtpReceiver, TrackType};
pub use poller::{EventPoller, EventPollerPool};
pub use transport::{SockSender, Socket, SocketConfig, SocketHelper};

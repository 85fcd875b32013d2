//! RTP ingest: from raw datagrams to ordered, session-validated packets.
//!
//! ## Pipeline
//!
//! ```text
//! raw bytes ──► RtpReceiver::handle_one_packet
//!                 │  parse header (rtp), check SSRC, re-frame as
//!                 │  ['$', 2 × track, len_hi, len_lo] + packet
//!                 ▼
//!               PacketSorter (one per track, keyed by sequence number)
//!                 │
//!                 ▼
//!               on-sorted callback ──► TrackDemuxer ──► RtpDecoder
//! ```
//!
//! Packet records come from a [`ResourcePool`] and return to it when the
//! consumer drops them.
//!
//! ## RTP overview (RFC 3550)
//!
//! - **Sequence number** (16-bit, wrapping): reordering and loss detection.
//! - **Timestamp** (32-bit): media clock, converted to milliseconds with the
//!   track's sample rate.
//! - **SSRC** (32-bit): identifies the sender. A track follows one SSRC and
//!   switches only after repeated mismatches.

pub mod demux;
pub mod pool;
pub mod receiver;
pub mod rtp;
pub mod sorter;

pub use demux::{RtpDecoder, TrackDemuxer};
pub use pool::{Pooled, ResourcePool};
pub use receiver::{RTP_MAX_SIZE, ReceiverConfig, RtpReceiver, write_interleaved};
pub use rtp::{RtpHeader, RtpPacket, TrackType};
pub use sorter::PacketSorter;

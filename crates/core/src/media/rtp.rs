use crate::error::InvalidPacketKind;

/// Size of the RTP fixed header.
pub const RTP_HEADER_SIZE: usize = 12;

/// Size of the interleaved frame prefix `['$', channel, len_hi, len_lo]`.
pub const INTERLEAVED_HEADER_SIZE: usize = 4;

/// RTP fixed header (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// All multi-byte fields are big-endian and read byte-wise, so the input
/// slice needs no particular alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    /// RTP payload type (7-bit, RFC 3551).
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
}

impl RtpHeader {
    /// A version 2 header without padding, extension or CSRCs.
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            version: 2,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: false,
            payload_type,
            sequence,
            timestamp,
            ssrc,
        }
    }

    /// Parse the fixed header. Rejects short buffers and any version but 2.
    pub fn parse(buf: &[u8]) -> Result<Self, InvalidPacketKind> {
        if buf.len() < RTP_HEADER_SIZE {
            return Err(InvalidPacketKind::TooShort(buf.len()));
        }
        let version = buf[0] >> 6;
        if version != 2 {
            return Err(InvalidPacketKind::BadVersion(version));
        }
        Ok(Self {
            version,
            padding: buf[0] & 0x20 != 0,
            extension: buf[0] & 0x10 != 0,
            csrc_count: buf[0] & 0x0f,
            marker: buf[1] & 0x80 != 0,
            payload_type: buf[1] & 0x7f,
            sequence: u16::from_be_bytes([buf[2], buf[3]]),
            timestamp: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ssrc: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }

    /// Serialize the 12-byte fixed header. CSRC entries are not written.
    pub fn write(&self) -> [u8; RTP_HEADER_SIZE] {
        let first_byte = (self.version << 6)
            | ((self.padding as u8) << 5)
            | ((self.extension as u8) << 4)
            | (self.csrc_count & 0x0f);
        let second_byte = ((self.marker as u8) << 7) | (self.payload_type & 0x7f);

        let mut header = [0u8; RTP_HEADER_SIZE];
        header[0] = first_byte;
        header[1] = second_byte;
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        header
    }
}

/// Media role of a track. The interleaved channel is `2 × role`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TrackType {
    #[default]
    Video = 0,
    Audio = 1,
}

impl TrackType {
    /// Interleaved RTP channel for this track.
    pub fn interleaved(self) -> u8 {
        2 * self as u8
    }
}

/// A received RTP packet, re-framed for an interleaved byte stream.
///
/// `data` holds `['$', channel, len_hi, len_lo]` followed by the original
/// packet (padding removed, padding flag cleared).
#[derive(Debug, Clone, Default)]
pub struct RtpPacket {
    pub track_type: TrackType,
    pub interleaved: u8,
    pub mark: bool,
    pub payload_type: u8,
    pub sequence: u16,
    /// Timestamp converted to milliseconds.
    pub timestamp_ms: u64,
    pub ssrc: u32,
    /// Offset of the payload within [`data`](Self::data).
    pub offset: usize,
    pub(crate) data: Vec<u8>,
}

impl RtpPacket {
    /// The whole interleaved frame.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The RTP packet without the interleaved prefix.
    pub fn rtp(&self) -> &[u8] {
        self.data.get(INTERLEAVED_HEADER_SIZE..).unwrap_or_default()
    }

    pub fn payload(&self) -> &[u8] {
        self.data.get(self.offset..).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

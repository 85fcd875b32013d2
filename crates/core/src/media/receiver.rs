//! Per-track RTP ingest: parse, validate the SSRC, re-frame, reorder.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::pool::{DEFAULT_POOL_SIZE, Pooled, ResourcePool};
use super::rtp::{INTERLEAVED_HEADER_SIZE, RTP_HEADER_SIZE, RtpHeader, RtpPacket, TrackType};
use super::sorter::{DEFAULT_MAX_SORT_DEPTH, PacketSorter};
use crate::error::{InvalidPacketKind, PacketError};

/// Largest RTP packet accepted, in bytes.
pub const RTP_MAX_SIZE: usize = 10 * 1024;

/// Consecutive SSRC mismatches tolerated before a track adopts the new SSRC.
pub const DEFAULT_SSRC_MISMATCH_THRESHOLD: u32 = 10;

pub type SortedCallback = Box<dyn FnMut(usize, Pooled<RtpPacket>) + Send>;

type SortedSink = Arc<Mutex<Option<SortedCallback>>>;

/// Tuning for an [`RtpReceiver`].
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Idle packet records kept for reuse.
    pub pool_size: usize,
    /// Jitter window of every track's reorder buffer.
    pub max_sort_depth: usize,
    /// The track switches SSRC on the mismatch after this many.
    pub ssrc_mismatch_threshold: u32,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            max_sort_depth: DEFAULT_MAX_SORT_DEPTH,
            ssrc_mismatch_threshold: DEFAULT_SSRC_MISMATCH_THRESHOLD,
        }
    }
}

struct TrackState {
    ssrc: u32,
    mismatch_count: u32,
    sorter: PacketSorter<Pooled<RtpPacket>>,
}

/// Turns raw RTP datagrams into ordered, SSRC-validated packets per track.
///
/// Each accepted packet is copied into a pooled [`RtpPacket`] as an
/// interleaved frame and pushed into its track's [`PacketSorter`]. Sorted
/// packets reach the callback set with [`set_on_sorted`](Self::set_on_sorted),
/// tagged with their track index.
///
/// Not internally synchronized: one consumer context owns a receiver.
pub struct RtpReceiver {
    config: ReceiverConfig,
    pool: ResourcePool<RtpPacket>,
    tracks: HashMap<usize, TrackState>,
    sink: SortedSink,
}

impl RtpReceiver {
    pub fn new(config: ReceiverConfig) -> Self {
        Self {
            pool: ResourcePool::new(config.pool_size),
            config,
            tracks: HashMap::new(),
            sink: Arc::new(Mutex::new(None)),
        }
    }

    pub fn set_on_sorted<F>(&mut self, cb: F)
    where
        F: FnMut(usize, Pooled<RtpPacket>) + Send + 'static,
    {
        *self.sink.lock() = Some(Box::new(cb));
    }

    /// Ingest one raw RTP packet for `track_index`.
    ///
    /// Returns `Ok(true)` for an accepted video packet and `Ok(false)` for an
    /// accepted audio packet: only video acceptance is reported to the
    /// caller, matching the demuxer, which answers `false` for every audio
    /// packet it consumes. Every dropped packet is an `Err` naming the reason.
    ///
    /// Checks run in this order, and a failing check leaves later state
    /// untouched: header length and version, padding, clock rate, SSRC,
    /// payload bounds.
    pub fn handle_one_packet(
        &mut self,
        track_index: usize,
        track_type: TrackType,
        sample_rate: u32,
        raw: &[u8],
    ) -> Result<bool, PacketError> {
        let header = RtpHeader::parse(raw).map_err(|kind| {
            tracing::warn!(track = track_index, len = raw.len(), %kind, "invalid RTP packet");
            PacketError::InvalidPacket(kind)
        })?;

        let mut len = raw.len();
        if header.padding {
            let padding = raw[len - 1];
            if usize::from(padding) > len - RTP_HEADER_SIZE {
                tracing::warn!(track = track_index, padding, len, "RTP padding exceeds packet");
                return Err(PacketError::InvalidPacket(InvalidPacketKind::BadPadding(padding)));
            }
            len -= usize::from(padding);
        }

        if sample_rate == 0 {
            return Err(PacketError::UnknownClockRate);
        }
        let timestamp_ms = u64::from(header.timestamp) * 1000 / u64::from(sample_rate);

        self.validate_ssrc(track_index, header.ssrc)?;

        let mut offset = RTP_HEADER_SIZE + 4 * usize::from(header.csrc_count);
        if header.extension && len >= offset + 4 {
            let words = u16::from_be_bytes([raw[offset + 2], raw[offset + 3]]);
            offset += 4 + 4 * usize::from(words);
        }
        if len <= offset {
            tracing::warn!(track = track_index, len, offset, "RTP packet without payload");
            return Err(PacketError::EmptyPayload { len, offset });
        }
        if len > RTP_MAX_SIZE {
            tracing::warn!(track = track_index, len, max = RTP_MAX_SIZE, "oversized RTP packet");
            return Err(PacketError::OversizedPacket { len });
        }

        let channel = track_type.interleaved();
        let mut packet = self.pool.obtain();
        packet.track_type = track_type;
        packet.interleaved = channel;
        packet.mark = header.marker;
        packet.payload_type = header.payload_type;
        packet.sequence = header.sequence;
        packet.timestamp_ms = timestamp_ms;
        packet.ssrc = header.ssrc;
        packet.offset = INTERLEAVED_HEADER_SIZE + offset;
        write_interleaved(&mut packet.data, channel, &raw[..len])?;

        tracing::trace!(
            track = track_index,
            seq = header.sequence,
            ts = timestamp_ms,
            len,
            "RTP packet accepted"
        );
        let seq = header.sequence;
        self.track_mut(track_index).sorter.sort_packet(seq, packet);
        Ok(track_type == TrackType::Video)
    }

    /// Forget every track's SSRC and mismatch count and empty their reorder
    /// buffers.
    pub fn clear(&mut self) {
        for track in self.tracks.values_mut() {
            track.ssrc = 0;
            track.mismatch_count = 0;
            track.sorter.clear();
        }
    }

    pub fn set_pool_size(&mut self, size: usize) {
        self.config.pool_size = size;
        self.pool.set_size(size);
    }

    pub fn set_max_sort_depth(&mut self, depth: usize) {
        self.config.max_sort_depth = depth;
        for track in self.tracks.values_mut() {
            track.sorter.set_max_depth(depth);
        }
    }

    pub fn jitter_size(&self, track_index: usize) -> usize {
        self.tracks
            .get(&track_index)
            .map_or(0, |track| track.sorter.jitter_size())
    }

    pub fn cycle_count(&self, track_index: usize) -> u64 {
        self.tracks
            .get(&track_index)
            .map_or(0, |track| track.sorter.cycle_count())
    }

    /// The SSRC a track currently follows, if one was seen.
    pub fn ssrc(&self, track_index: usize) -> Option<u32> {
        self.tracks
            .get(&track_index)
            .map(|track| track.ssrc)
            .filter(|&ssrc| ssrc != 0)
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    fn validate_ssrc(&mut self, track_index: usize, ssrc: u32) -> Result<(), PacketError> {
        let threshold = self.config.ssrc_mismatch_threshold;
        let track = self.track_mut(track_index);
        if track.ssrc == 0 {
            track.ssrc = ssrc;
        } else if track.ssrc != ssrc {
            track.mismatch_count += 1;
            if track.mismatch_count > threshold {
                let old = track.ssrc;
                tracing::warn!(
                    track = track_index,
                    old = format_args!("{:#010X}", old),
                    new = format_args!("{:#010X}", ssrc),
                    "SSRC switched"
                );
                track.ssrc = ssrc;
                track.mismatch_count = 0;
                track.sorter.clear();
                return Err(PacketError::SsrcSwitched { old, new: ssrc });
            }
            tracing::warn!(
                track = track_index,
                expected = format_args!("{:#010X}", track.ssrc),
                got = format_args!("{:#010X}", ssrc),
                count = track.mismatch_count,
                "SSRC mismatch"
            );
            return Err(PacketError::SsrcMismatch {
                expected: track.ssrc,
                got: ssrc,
            });
        }
        track.mismatch_count = 0;
        Ok(())
    }

    fn track_mut(&mut self, track_index: usize) -> &mut TrackState {
        let depth = self.config.max_sort_depth;
        let sink = &self.sink;
        self.tracks.entry(track_index).or_insert_with(|| {
            let mut sorter = PacketSorter::new(depth);
            let sink = sink.clone();
            sorter.set_on_sort(move |_seq, packet| {
                if let Some(cb) = sink.lock().as_mut() {
                    cb(track_index, packet);
                }
            });
            TrackState {
                ssrc: 0,
                mismatch_count: 0,
                sorter,
            }
        })
    }
}

impl Default for RtpReceiver {
    fn default() -> Self {
        Self::new(ReceiverConfig::default())
    }
}

impl std::fmt::Debug for RtpReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtpReceiver")
            .field("config", &self.config)
            .field("tracks", &self.tracks.len())
            .field("pool", &self.pool)
            .finish()
    }
}

/// Write `['$', channel, len_hi, len_lo] + packet` into `out`, clearing the
/// RTP padding flag of the copy.
///
/// A packet whose length does not fit the 16-bit prefix is refused with
/// [`PacketError::OversizedPacket`] and `out` is left untouched.
pub fn write_interleaved(
    out: &mut Vec<u8>,
    channel: u8,
    packet: &[u8],
) -> Result<(), PacketError> {
    let len = u16::try_from(packet.len())
        .map_err(|_| PacketError::OversizedPacket { len: packet.len() })?;
    out.clear();
    out.reserve(INTERLEAVED_HEADER_SIZE + packet.len());
    out.push(b'$');
    out.push(channel);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(packet);
    if let Some(first) = out.get_mut(INTERLEAVED_HEADER_SIZE) {
        *first &= !0x20;
    }
    Ok(())
}

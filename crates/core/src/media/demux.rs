use super::rtp::{RtpPacket, TrackType};

/// Consumer of ordered RTP packets for one track, typically a frame
/// assembler for a codec.
pub trait RtpDecoder: Send {
    /// Feed one packet. `key_pos` asks the decoder to report whether the
    /// packet starts a key frame; the return value is that answer.
    fn input_rtp(&mut self, packet: &RtpPacket, key_pos: bool) -> bool;
}

/// Routes sorted packets to the decoder of their track.
///
/// Video packets go to the video decoder with `key_pos = true` and the
/// decoder's answer is returned. Audio packets go to the audio decoder with
/// `key_pos = false` and always yield `false`. Packets for a track without
/// a decoder yield `false`.
#[derive(Default)]
pub struct TrackDemuxer {
    video: Option<Box<dyn RtpDecoder>>,
    audio: Option<Box<dyn RtpDecoder>>,
}

impl TrackDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_decoder(&mut self, track_type: TrackType, decoder: Box<dyn RtpDecoder>) {
        match track_type {
            TrackType::Video => self.video = Some(decoder),
            TrackType::Audio => self.audio = Some(decoder),
        }
    }

    pub fn has_track(&self, track_type: TrackType) -> bool {
        match track_type {
            TrackType::Video => self.video.is_some(),
            TrackType::Audio => self.audio.is_some(),
        }
    }

    pub fn input_rtp(&mut self, packet: &RtpPacket) -> bool {
        match packet.track_type {
            TrackType::Video => self
                .video
                .as_mut()
                .is_some_and(|decoder| decoder.input_rtp(packet, true)),
            TrackType::Audio => {
                if let Some(decoder) = self.audio.as_mut() {
                    decoder.input_rtp(packet, false);
                }
                false
            }
        }
    }
}

impl std::fmt::Debug for TrackDemuxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackDemuxer")
            .field("video", &self.video.is_some())
            .field("audio", &self.audio.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        calls: Arc<AtomicUsize>,
        key_pos_seen: Arc<AtomicUsize>,
    }

    impl RtpDecoder for Recorder {
        fn input_rtp(&mut self, _packet: &RtpPacket, key_pos: bool) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if key_pos {
                self.key_pos_seen.fetch_add(1, Ordering::SeqCst);
            }
            true
        }
    }

    fn recorder() -> (Box<dyn RtpDecoder>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let key_pos_seen = Arc::new(AtomicUsize::new(0));
        let decoder = Recorder {
            calls: calls.clone(),
            key_pos_seen: key_pos_seen.clone(),
        };
        (Box::new(decoder), calls, key_pos_seen)
    }

    fn packet(track_type: TrackType) -> RtpPacket {
        RtpPacket {
            track_type,
            ..RtpPacket::default()
        }
    }

    #[test]
    fn video_returns_decoder_answer() {
        let mut demuxer = TrackDemuxer::new();
        let (decoder, calls, key_pos) = recorder();
        demuxer.set_decoder(TrackType::Video, decoder);
        assert!(demuxer.input_rtp(&packet(TrackType::Video)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(key_pos.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn audio_is_consumed_but_reports_false() {
        let mut demuxer = TrackDemuxer::new();
        let (decoder, calls, key_pos) = recorder();
        demuxer.set_decoder(TrackType::Audio, decoder);
        assert!(!demuxer.input_rtp(&packet(TrackType::Audio)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(key_pos.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn missing_decoder_reports_false() {
        let mut demuxer = TrackDemuxer::new();
        assert!(!demuxer.input_rtp(&packet(TrackType::Video)));
        assert!(!demuxer.has_track(TrackType::Audio));
    }
}

//! Property tests for sequence reordering and RTP header validation.

use std::sync::Arc;

use parking_lot::Mutex;
use proptest::prelude::*;

use mediastream::error::{InvalidPacketKind, PacketError};
use mediastream::media::{PacketSorter, RtpReceiver, TrackType};

fn collecting(sorter: &mut PacketSorter<()>) -> Arc<Mutex<Vec<u16>>> {
    let out = Arc::new(Mutex::new(Vec::new()));
    let sink = out.clone();
    sorter.set_on_sort(move |seq, ()| sink.lock().push(seq));
    out
}

/// `len` consecutive sequence numbers from `start`, shuffled within chunks
/// of `chunk` packets using `keys` as sort keys.
fn locally_shuffled(start: u16, chunk: usize, keys: &[u32]) -> Vec<u16> {
    let mut seqs: Vec<(u32, u16)> = keys
        .iter()
        .enumerate()
        .map(|(i, &key)| (key, start.wrapping_add(i as u16)))
        .collect();
    for window in seqs.chunks_mut(chunk) {
        window.sort_by_key(|&(key, _)| key);
    }
    seqs.into_iter().map(|(_, seq)| seq).collect()
}

fn shuffled_stream() -> impl Strategy<Value = (u16, usize, Vec<u32>)> {
    (any::<u16>(), 1usize..=16, 1usize..3000).prop_flat_map(|(start, chunk, len)| {
        (
            Just(start),
            Just(chunk),
            prop::collection::vec(any::<u32>(), len),
        )
    })
}

proptest! {
    #[test]
    fn bounded_reordering_is_undone((start, chunk, keys) in shuffled_stream()) {
        let mut sorter = PacketSorter::starting_at(start, 16);
        let out = collecting(&mut sorter);
        for seq in locally_shuffled(start, chunk, &keys) {
            sorter.sort_packet(seq, ());
        }

        let expected: Vec<u16> = (0..keys.len()).map(|i| start.wrapping_add(i as u16)).collect();
        prop_assert_eq!(&*out.lock(), &expected);
        prop_assert_eq!(sorter.jitter_size(), 0);
        let last = u64::from(start) + keys.len() as u64 - 1;
        prop_assert_eq!(sorter.cycle_count(), last >> 16);
    }

    #[test]
    fn held_packets_never_exceed_window(
        depth in 0usize..32,
        seqs in prop::collection::vec(any::<u16>(), 1..500),
    ) {
        let mut sorter = PacketSorter::new(depth);
        for seq in seqs {
            sorter.sort_packet(seq, ());
            prop_assert!(sorter.jitter_size() <= depth);
        }
    }

    #[test]
    fn clear_behaves_like_fresh(
        before in prop::collection::vec(any::<u16>(), 0..200),
        after in prop::collection::vec(any::<u16>(), 0..200),
    ) {
        let mut reused = PacketSorter::new(8);
        let reused_out = collecting(&mut reused);
        for seq in before {
            reused.sort_packet(seq, ());
        }
        reused.clear();
        reused_out.lock().clear();

        let mut fresh = PacketSorter::new(8);
        let fresh_out = collecting(&mut fresh);
        for &seq in &after {
            reused.sort_packet(seq, ());
            fresh.sort_packet(seq, ());
        }
        prop_assert_eq!(&*reused_out.lock(), &*fresh_out.lock());
        prop_assert_eq!(reused.jitter_size(), fresh.jitter_size());
        prop_assert_eq!(reused.cycle_count(), fresh.cycle_count());
    }

    #[test]
    fn wrong_version_always_rejected(
        version in prop::sample::select(vec![0u8, 1, 3]),
        mut raw in prop::collection::vec(any::<u8>(), 12..256),
    ) {
        raw[0] = (raw[0] & 0x3f) | (version << 6);
        let mut receiver = RtpReceiver::default();
        let res = receiver.handle_one_packet(0, TrackType::Video, 90_000, &raw);
        prop_assert_eq!(
            res,
            Err(PacketError::InvalidPacket(InvalidPacketKind::BadVersion(version)))
        );
        prop_assert_eq!(receiver.ssrc(0), None);
        prop_assert_eq!(receiver.jitter_size(0), 0);
    }
}

use std::collections::BTreeMap;

/// Default jitter window of a [`PacketSorter`].
pub const DEFAULT_MAX_SORT_DEPTH: usize = 256;

pub type SortCallback<T> = Box<dyn FnMut(u16, T) + Send>;

/// Reorders packets keyed by a wrapping 16-bit sequence number.
///
/// Sequence numbers are compared wrap-aware: a packet up to half the
/// sequence space ahead of the cursor is "ahead", anything else is
/// "behind". Internally every sequence number is extended with a cycle
/// count so ordering across `0xFFFF -> 0` needs no special casing.
///
/// - A packet matching the cursor is delivered at once, followed by every
///   held packet contiguous with it.
/// - A packet ahead of the cursor is held. When more than `max_depth`
///   packets are held, the cursor jumps to the lowest held packet and the
///   gap is treated as lost.
/// - A duplicate or a packet behind the cursor is dropped. More than
///   `max_depth` of those in a row means the sender jumped backwards: held
///   packets are flushed in order and the cursor resyncs to the newcomer.
///
/// Without a preset cursor the first packet defines it.
pub struct PacketSorter<T> {
    held: BTreeMap<u64, (u16, T)>,
    initial: Option<u16>,
    expected: Option<u64>,
    last_delivered: Option<u64>,
    cycles: u64,
    max_depth: usize,
    late_count: usize,
    on_sort: Option<SortCallback<T>>,
}

impl<T> PacketSorter<T> {
    pub fn new(max_depth: usize) -> Self {
        Self {
            held: BTreeMap::new(),
            initial: None,
            expected: None,
            last_delivered: None,
            cycles: 0,
            max_depth,
            late_count: 0,
            on_sort: None,
        }
    }

    /// A sorter whose first delivered packet must be `seq`.
    pub fn starting_at(seq: u16, max_depth: usize) -> Self {
        let mut sorter = Self::new(max_depth);
        sorter.initial = Some(seq);
        sorter.expected = Some(u64::from(seq));
        sorter
    }

    pub fn set_on_sort<F>(&mut self, cb: F)
    where
        F: FnMut(u16, T) + Send + 'static,
    {
        self.on_sort = Some(Box::new(cb));
    }

    pub fn sort_packet(&mut self, seq: u16, packet: T) {
        let expected = *self.expected.get_or_insert(u64::from(seq));
        let diff = seq.wrapping_sub(expected as u16) as i16;

        if diff < 0 {
            self.late_count += 1;
            if self.late_count <= self.max_depth {
                tracing::trace!(seq, expected = expected as u16, "late packet dropped");
                return;
            }
            tracing::debug!(seq, expected = expected as u16, "sequence jumped backwards, resyncing");
            self.flush();
            let resync = expected + u64::from(seq.wrapping_sub(expected as u16));
            self.expected = Some(resync);
            // Not a wrap: the cycle count stays where it is.
            self.last_delivered = Some(resync);
            self.late_count = 0;
            self.deliver(resync, seq, packet);
            return;
        }
        self.late_count = 0;

        let ext = expected + diff as u64;
        if diff == 0 {
            self.deliver(ext, seq, packet);
            self.drain_contiguous();
            return;
        }

        if self.held.contains_key(&ext) {
            tracing::trace!(seq, "duplicate packet dropped");
            return;
        }
        self.held.insert(ext, (seq, packet));

        if self.held.len() > self.max_depth {
            if let Some(&lowest) = self.held.keys().next() {
                tracing::trace!(
                    from = expected as u16,
                    to = lowest as u16,
                    "jitter window exceeded, skipping gap"
                );
                self.expected = Some(lowest);
                self.drain_contiguous();
            }
        }
    }

    /// Drop held packets and return to the freshly constructed state.
    pub fn clear(&mut self) {
        self.held.clear();
        self.expected = self.initial.map(u64::from);
        self.last_delivered = None;
        self.cycles = 0;
        self.late_count = 0;
    }

    /// Packets held waiting for an earlier one.
    pub fn jitter_size(&self) -> usize {
        self.held.len()
    }

    /// `0xFFFF -> 0` crossings among delivered packets. A resync after a
    /// backwards jump is not counted.
    pub fn cycle_count(&self) -> u64 {
        self.cycles
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn set_max_depth(&mut self, max_depth: usize) {
        self.max_depth = max_depth;
    }

    fn deliver(&mut self, ext: u64, seq: u16, packet: T) {
        if let Some(prev) = self.last_delivered {
            self.cycles += (ext >> 16).saturating_sub(prev >> 16);
        }
        self.expected = Some(ext + 1);
        self.last_delivered = Some(ext);
        if let Some(cb) = self.on_sort.as_mut() {
            cb(seq, packet);
        }
    }

    fn drain_contiguous(&mut self) {
        while let Some(entry) = self.held.first_entry() {
            if Some(*entry.key()) != self.expected {
                return;
            }
            let (ext, (seq, packet)) = entry.remove_entry();
            self.deliver(ext, seq, packet);
        }
    }

    fn flush(&mut self) {
        while let Some((ext, (seq, packet))) = self.held.pop_first() {
            self.deliver(ext, seq, packet);
        }
    }
}

impl<T> Default for PacketSorter<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SORT_DEPTH)
    }
}

impl<T> std::fmt::Debug for PacketSorter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketSorter")
            .field("expected", &self.expected.map(|e| e as u16))
            .field("held", &self.held.len())
            .field("max_depth", &self.max_depth)
            .field("cycles", &self.cycle_count())
            .finish()
    }
}

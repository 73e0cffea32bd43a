//! Sequence-ordered set of DATA packets sent but not yet covered by an ACK
//! (§3, §4.3). Accessed exclusively by the I/O worker — no locking, per §5.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::packet::Packet;

struct Entry {
    packet: Packet,
    last_sent: Instant,
}

/// Packets transmitted at least once and still awaiting acknowledgement.
pub struct RetransmitSet {
    entries: BTreeMap<u64, Entry>,
}

impl RetransmitSet {
    pub fn new() -> RetransmitSet {
        RetransmitSet {
            entries: BTreeMap::new(),
        }
    }

    pub fn push(&mut self, packet: Packet, now: Instant) {
        let sequence = packet.header.packet_number;
        self.entries.insert(sequence, Entry { packet, last_sent: now });
    }

    /// Removes every entry with sequence <= `seq`, i.e. everything the peer
    /// has acknowledged contiguous coverage through.
    pub fn ack_up_to(&mut self, seq: u64) {
        let keep = self.entries.split_off(&(seq + 1));
        self.entries = keep;
    }

    /// Packets whose last-send timestamp plus `rto` has elapsed, re-stamped
    /// with `now` as their new last-send time (the caller is about to
    /// retransmit them).
    pub fn take_timed_out(&mut self, now: Instant, rto: std::time::Duration) -> Vec<Packet> {
        let mut timed_out = Vec::new();
        for entry in self.entries.values_mut() {
            if now.duration_since(entry.last_sent) >= rto {
                entry.last_sent = now;
                timed_out.push(entry.packet.clone());
            }
        }
        timed_out
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total payload bytes currently outstanding, used for the peer-window
    /// accounting in §4.5 step 5c.
    pub fn outstanding_bytes(&self) -> usize {
        self.entries.values().map(|entry| entry.packet.payload_len()).sum()
    }
}

impl Default for RetransmitSet {
    fn default() -> Self {
        RetransmitSet::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;
    use std::time::Duration;

    fn data_packet(seq: u64) -> Packet {
        Packet::data(1, 2, seq, 0, vec![1, 2, 3])
    }

    #[test]
    fn ack_up_to_trims_covered_entries() {
        let mut set = RetransmitSet::new();
        let now = Instant::now();
        for seq in 0..5 {
            set.push(data_packet(seq), now);
        }
        set.ack_up_to(2);
        assert_eq!(set.len(), 2);
        assert_eq!(set.outstanding_bytes(), 6);
    }

    #[test]
    fn take_timed_out_filters_by_rto() {
        let mut set = RetransmitSet::new();
        let now = Instant::now();
        set.push(data_packet(0), now - Duration::from_millis(100));
        set.push(data_packet(1), now);

        let timed_out = set.take_timed_out(now, Duration::from_millis(50));
        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0].header.packet_number, 0);
    }
}

//! Packet record, attribute pinning, fragment descriptors, and the
//! per-neighbor queue wrapper.
//!
//! §9 replaces the dynamic `packetbuf.*` attribute dictionary with a small
//! fixed struct; anything a scheduler needs to pin on a packet belongs as a
//! named field here, not a revived bag. The sent-callback is kept out of
//! `Packet` itself (which must stay `Clone`, since Phase B in
//! `crate::network` clones a packet once per candidate receiver) and lives
//! instead on `QueuedPacket`, the record actually stored in a neighbor's
//! outbound queue.

use std::collections::HashMap;

pub type NodeId = u32;

/// Reserved destination/neighbor id meaning "every neighbor on this cell".
/// Node ids are positive per §3, so zero is free to use as the broadcast
/// sentinel.
pub const BROADCAST_ID: NodeId = 0;

/// Sentinel key for the per-node virtual "EB" neighbor queue (§3: "plus two
/// virtual neighbors (broadcast, EB)"). `u32::MAX` is never a real node id.
pub const EB_VIRTUAL_ID: NodeId = NodeId::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameType {
    #[default]
    Data,
    Ack,
    EnhancedBeacon,
}

/// Fixed attribute set a scheduler/routing plugin may pin on a packet before
/// it becomes eligible for a TX cell. Replaces the source's dynamic
/// attribute dictionary (§9).
#[derive(Debug, Clone, Default)]
pub struct PacketAttributes {
    pub slotframe_handle: Option<u32>,
    pub timeslot: Option<u16>,
    pub channel_offset: Option<u8>,
    pub frame_type: FrameType,
    pub join_priority: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentDescriptor {
    pub tag: u32,
    pub index: u16,
    pub total: u16,
}

/// Per-attempt outcome recorded against one candidate receiver during Phase
/// B/C of the network step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReceptionOutcome {
    pub rssi_dbm: f64,
    pub rx_success: bool,
}

#[derive(Debug, Clone)]
pub struct Packet {
    pub source_id: NodeId,
    pub destination_id: NodeId,
    pub seqnum: u32,
    pub app_length: usize,

    pub last_hop: NodeId,
    pub next_hop: NodeId,
    pub link_seqnum: u32,
    pub num_transmissions: u32,
    pub is_ack_required: bool,

    pub attributes: PacketAttributes,
    pub fragment: Option<FragmentDescriptor>,

    /// Receiver-map populated during Phase B/C: `receiver_id -> outcome`.
    pub receiver_outcomes: HashMap<NodeId, ReceptionOutcome>,
}

impl Packet {
    /// Construct a unicast application packet bound for `next_hop`.
    /// `is_ack_required` is derived automatically, honoring the §3
    /// invariant `is_ack_required ⇔ next_hop > 0 ∧ next_hop ≠ broadcast`.
    pub fn new_unicast(source_id: NodeId, destination_id: NodeId, next_hop: NodeId, seqnum: u32, app_length: usize) -> Self {
        let is_ack_required = next_hop != BROADCAST_ID;
        Self {
            source_id,
            destination_id,
            seqnum,
            app_length,
            last_hop: source_id,
            next_hop,
            link_seqnum: 0,
            num_transmissions: 0,
            is_ack_required,
            attributes: PacketAttributes::default(),
            fragment: None,
            receiver_outcomes: HashMap::new(),
        }
    }

    pub fn new_broadcast(source_id: NodeId, seqnum: u32, app_length: usize) -> Self {
        Self {
            source_id,
            destination_id: BROADCAST_ID,
            seqnum,
            app_length,
            last_hop: source_id,
            next_hop: BROADCAST_ID,
            link_seqnum: 0,
            num_transmissions: 0,
            is_ack_required: false,
            attributes: PacketAttributes::default(),
            fragment: None,
            receiver_outcomes: HashMap::new(),
        }
    }

    pub fn record_outcome(&mut self, receiver_id: NodeId, rssi_dbm: f64, rx_success: bool) {
        self.receiver_outcomes.insert(receiver_id, ReceptionOutcome { rssi_dbm, rx_success });
    }

    pub fn outcome_for(&self, receiver_id: NodeId) -> Option<ReceptionOutcome> {
        self.receiver_outcomes.get(&receiver_id).copied()
    }

    /// Split an oversized application packet into MAC-sized fragments, all
    /// but the last exactly `max_fragment_size` bytes (§4.7). `tag` should
    /// come from the sender's per-destination monotonic fragment counter.
    pub fn split_into_fragments(&self, max_fragment_size: usize, tag: u32) -> Vec<Packet> {
        assert!(max_fragment_size > 0);
        let total_fragments = self.app_length.div_ceil(max_fragment_size).max(1) as u16;
        (0..total_fragments)
            .map(|index| {
                let mut fragment = self.clone();
                let remaining = self.app_length - (index as usize) * max_fragment_size;
                fragment.app_length = remaining.min(max_fragment_size);
                fragment.fragment = Some(FragmentDescriptor {
                    tag,
                    index,
                    total: total_fragments,
                });
                fragment.receiver_outcomes.clear();
                fragment
            })
            .collect()
    }
}

/// Invoked once a packet leaves the network's custody: ACKed, dropped, or
/// TX-limit exceeded. Boxed rather than generic so `NeighborQueue` can hold
/// a homogeneous `VecDeque<QueuedPacket>` regardless of caller closure type.
pub type SentCallback = Box<dyn FnMut(&Packet, bool) + Send>;

/// A packet sitting in a neighbor's outbound queue, paired with the
/// callback to invoke when it is finally resolved (ACKed, dropped, or
/// retry-limited). Kept separate from `Packet` itself so `Packet` can stay
/// plain-data and `Clone`.
pub struct QueuedPacket {
    pub packet: Packet,
    pub sent_callback: Option<SentCallback>,
}

impl QueuedPacket {
    pub fn new(packet: Packet) -> Self {
        Self {
            packet,
            sent_callback: None,
        }
    }

    pub fn with_callback(packet: Packet, callback: SentCallback) -> Self {
        Self {
            packet,
            sent_callback: Some(callback),
        }
    }

    pub fn resolve(mut self, ok: bool) {
        if let Some(mut cb) = self.sent_callback.take() {
            cb(&self.packet, ok);
        }
    }
}

impl std::fmt::Debug for QueuedPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedPacket")
            .field("packet", &self.packet)
            .field("has_callback", &self.sent_callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unicast_requires_ack_broadcast_does_not() {
        let unicast = Packet::new_unicast(1, 2, 2, 0, 10);
        assert!(unicast.is_ack_required);
        let broadcast = Packet::new_broadcast(1, 0, 10);
        assert!(!broadcast.is_ack_required);
        assert_eq!(broadcast.next_hop, BROADCAST_ID);
    }

    #[test]
    fn split_into_fragments_sizes_all_but_last_at_max() {
        let packet = Packet::new_unicast(1, 2, 2, 0, 240);
        let fragments = packet.split_into_fragments(100, 7);
        let lengths: Vec<usize> = fragments.iter().map(|f| f.app_length).collect();
        assert_eq!(lengths, vec![100, 100, 40]);
        for (i, f) in fragments.iter().enumerate() {
            let fd = f.fragment.unwrap();
            assert_eq!(fd.tag, 7);
            assert_eq!(fd.index, i as u16);
            assert_eq!(fd.total, 3);
        }
    }

    #[test]
    fn split_exact_multiple_has_no_short_final_fragment() {
        let packet = Packet::new_unicast(1, 2, 2, 0, 200);
        let fragments = packet.split_into_fragments(100, 1);
        assert_eq!(fragments.len(), 2);
        assert!(fragments.iter().all(|f| f.app_length == 100));
    }

    #[test]
    fn sent_callback_fires_exactly_once_on_resolve() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let packet = Packet::new_unicast(1, 2, 2, 0, 10);
        let queued = QueuedPacket::with_callback(
            packet,
            Box::new(move |_p, ok| {
                assert!(ok);
                calls_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        queued.resolve(true);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn record_and_read_outcome_round_trips() {
        let mut packet = Packet::new_unicast(1, 2, 2, 0, 10);
        packet.record_outcome(2, -55.0, true);
        let outcome = packet.outcome_for(2).unwrap();
        assert_eq!(outcome.rssi_dbm, -55.0);
        assert!(outcome.rx_success);
        assert!(packet.outcome_for(3).is_none());
    }
}

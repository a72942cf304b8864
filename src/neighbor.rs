//! Per-neighbor link-quality state: bounded outbound queue, CSMA backoff,
//! ETX, and freshness (§3 "Neighbor", §4.5).

use crate::packet::{NodeId, QueuedPacket};
use crate::random::RandomSource;
use std::collections::VecDeque;

pub const FRESHNESS_MAX: u8 = 16;
pub const FRESHNESS_MIN_COUNT: u8 = 4;
pub const FRESHNESS_RECENCY_SECONDS: f64 = 600.0;
pub const FRESHNESS_HALVING_PERIOD_SECONDS: f64 = 900.0;
pub const ETX_NOACK_PENALTY: u32 = 12;
const ETX_SCALE: f64 = 128.0;
const DEFAULT_ETX_SCALED: i32 = 2 * 128;

/// Bounded FIFO of packets pending transmission to one neighbor.
pub struct NeighborQueue {
    queue: VecDeque<QueuedPacket>,
    capacity: usize,
}

impl NeighborQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity,
        }
    }

    /// Enqueue a packet. Returns `false` (and leaves the queue untouched) if
    /// the queue is already at `MAC_QUEUE_SIZE` capacity — callers must bump
    /// `app_num_queue_drops` on that outcome (§7 category 3).
    pub fn push(&mut self, packet: QueuedPacket) -> bool {
        if self.queue.len() >= self.capacity {
            return false;
        }
        self.queue.push_back(packet);
        true
    }

    pub fn front(&self) -> Option<&QueuedPacket> {
        self.queue.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut QueuedPacket> {
        self.queue.front_mut()
    }

    pub fn pop_front(&mut self) -> Option<QueuedPacket> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedPacket> {
        self.queue.iter()
    }
}

/// Maps an initial RSSI sample to an ETX bootstrap value (§4.5): linear from
/// [-90 dBm, -60 dBm] to [3, 1] ETX units, returned pre-scaled by 128.
pub fn bootstrap_etx_from_rssi(rssi_dbm: f64) -> i32 {
    let clamped = rssi_dbm.clamp(-90.0, -60.0);
    let t = (clamped + 90.0) / 30.0;
    let etx_units = 3.0 - 2.0 * t;
    (etx_units * ETX_SCALE).round() as i32
}

pub struct Neighbor {
    pub id: NodeId,
    pub queue: NeighborQueue,
    pub backoff_exponent: u8,
    pub backoff_window: u32,
    pub freshness: u8,
    pub etx_scaled: i32,
    pub last_tx_seconds: Option<f64>,
    pub last_rx_seconds: Option<f64>,
    pub last_rssi_dbm: f64,
}

impl Neighbor {
    pub fn new(id: NodeId, queue_capacity: usize, min_be: u8) -> Self {
        Self {
            id,
            queue: NeighborQueue::new(queue_capacity),
            backoff_exponent: min_be,
            backoff_window: 0,
            freshness: 0,
            etx_scaled: DEFAULT_ETX_SCALED,
            last_tx_seconds: None,
            last_rx_seconds: None,
            last_rssi_dbm: f64::NEG_INFINITY,
        }
    }

    pub fn is_fresh(&self, now_seconds: f64) -> bool {
        self.freshness >= FRESHNESS_MIN_COUNT
            && self
                .last_tx_seconds
                .is_some_and(|t| now_seconds - t < FRESHNESS_RECENCY_SECONDS)
    }

    /// Update ETX and freshness after a TX attempt resolves (§4.5).
    /// `num_transmissions` is the attempt count on the just-resolved packet.
    pub fn record_tx_outcome(&mut self, now_seconds: f64, num_transmissions: u32, acked: bool) {
        let alpha = if self.is_fresh(now_seconds) { 0.1 } else { 0.25 };
        let term_units = if acked { num_transmissions } else { ETX_NOACK_PENALTY };
        let term_scaled = term_units as f64 * ETX_SCALE;
        self.etx_scaled = ((1.0 - alpha) * self.etx_scaled as f64 + alpha * term_scaled).round() as i32;
        self.freshness = self.freshness.saturating_add(num_transmissions as u8).min(FRESHNESS_MAX);
        self.last_tx_seconds = Some(now_seconds);
    }

    pub fn record_rx(&mut self, now_seconds: f64, rssi_dbm: f64) {
        self.last_rx_seconds = Some(now_seconds);
        self.last_rssi_dbm = rssi_dbm;
    }

    /// Applied by the freshness-halving timer, every 15 minutes, to every
    /// neighbor on every node.
    pub fn halve_freshness(&mut self) {
        self.freshness /= 2;
    }

    /// Reset backoff after success at a shared cell, or whenever the queue
    /// drains empty.
    pub fn reset_backoff(&mut self, min_be: u8) {
        self.backoff_exponent = min_be;
        self.backoff_window = 0;
    }

    /// Apply binary-exponential backoff after a failed shared-cell
    /// transmission: bump the exponent (saturating at `max_be`), then draw
    /// a fresh window `~ U{0, 2^exponent} + 1`.
    pub fn apply_backoff_failure(&mut self, max_be: u8, rng: &mut RandomSource) {
        self.backoff_exponent = (self.backoff_exponent + 1).min(max_be);
        let span = 1u32 << self.backoff_exponent;
        self.backoff_window = rng.gen_range(0, span + 1) + 1;
    }

    /// Called once per broadcast (shared) TX cell for every neighbor with a
    /// pending window and no dedicated cell, or once per dedicated TX cell
    /// for just that neighbor (§4.5).
    pub fn decrement_backoff_window(&mut self) {
        if self.backoff_window > 0 {
            self.backoff_window -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;

    #[test]
    fn queue_rejects_push_past_capacity() {
        let mut q = NeighborQueue::new(2);
        assert!(q.push(QueuedPacket::new(Packet::new_unicast(1, 2, 2, 0, 1))));
        assert!(q.push(QueuedPacket::new(Packet::new_unicast(1, 2, 2, 1, 1))));
        assert!(!q.push(QueuedPacket::new(Packet::new_unicast(1, 2, 2, 2, 1))));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn etx_bootstrap_maps_rssi_range_to_expected_endpoints() {
        assert_eq!(bootstrap_etx_from_rssi(-90.0), (3.0 * ETX_SCALE) as i32);
        assert_eq!(bootstrap_etx_from_rssi(-60.0), (1.0 * ETX_SCALE) as i32);
        assert_eq!(bootstrap_etx_from_rssi(-120.0), (3.0 * ETX_SCALE) as i32);
        assert_eq!(bootstrap_etx_from_rssi(0.0), (1.0 * ETX_SCALE) as i32);
    }

    #[test]
    fn is_fresh_requires_both_count_and_recency() {
        let mut n = Neighbor::new(2, 8, 3);
        assert!(!n.is_fresh(100.0));
        n.freshness = FRESHNESS_MIN_COUNT;
        n.last_tx_seconds = Some(100.0);
        assert!(n.is_fresh(100.0 + FRESHNESS_RECENCY_SECONDS - 1.0));
        assert!(!n.is_fresh(100.0 + FRESHNESS_RECENCY_SECONDS + 1.0));
    }

    #[test]
    fn record_tx_outcome_unacked_uses_penalty_term() {
        let mut n = Neighbor::new(2, 8, 3);
        let before = n.etx_scaled;
        n.record_tx_outcome(0.0, 5, false);
        // Non-fresh alpha = 0.25, penalty term = 12*128, which is larger than
        // default etx (2*128) so etx should move up toward the penalty.
        assert!(n.etx_scaled > before);
    }

    #[test]
    fn halve_freshness_floors_toward_zero() {
        let mut n = Neighbor::new(2, 8, 3);
        n.freshness = 5;
        n.halve_freshness();
        assert_eq!(n.freshness, 2);
        n.halve_freshness();
        assert_eq!(n.freshness, 1);
    }

    #[test]
    fn backoff_reset_and_failure_cycle() {
        let mut rng = RandomSource::new(1);
        let mut n = Neighbor::new(2, 8, 3);
        n.apply_backoff_failure(8, &mut rng);
        assert_eq!(n.backoff_exponent, 4);
        assert!(n.backoff_window >= 1);
        n.reset_backoff(3);
        assert_eq!(n.backoff_exponent, 3);
        assert_eq!(n.backoff_window, 0);
    }

    #[test]
    fn backoff_exponent_saturates_at_max_be() {
        let mut rng = RandomSource::new(1);
        let mut n = Neighbor::new(2, 8, 7);
        for _ in 0..20 {
            n.apply_backoff_failure(7, &mut rng);
        }
        assert_eq!(n.backoff_exponent, 7);
    }

    #[test]
    fn decrement_backoff_window_does_not_go_negative() {
        let mut n = Neighbor::new(2, 8, 3);
        n.backoff_window = 1;
        n.decrement_backoff_window();
        assert_eq!(n.backoff_window, 0);
        n.decrement_backoff_window();
        assert_eq!(n.backoff_window, 0);
    }
}

//! Error taxonomy and propagation policy (§7).
//!
//! Two tiers, matching how the rest of the crate actually fails:
//!
//! 1. Construction-time failures — malformed configuration, malformed
//!    topology JSON, an `IndexedHeap`/`Slotframe` invariant violated by a
//!    caller — surface as `anyhow::Result` with contextual messages
//!    (`config::Configuration::load`, `config::Topology::load`) or as a
//!    panic when they indicate a bug rather than bad input (`Slotframe::new`
//!    asserting a nonzero size).
//! 2. Per-packet and per-reception outcomes during a running simulation —
//!    queue-full, retry-limit-exceeded, no route, no schedule, a link-layer
//!    collision — are never `Result`s. They are recoverable by definition
//!    (the simulation keeps stepping either way) and are surfaced only as
//!    `stats::AggregateStats` counters, via `DropReason::record_on`.
//!
//! A dangling topology reference (a connection naming an unknown node id)
//! is a third, intermediate case: caught once during `Topology::validate`,
//! logged, and the offending connection dropped rather than either failing
//! construction or silently corrupting a running node's neighbor table.

use crate::stats::AggregateStats;

/// Why an application packet never reached its destination (§7 category 3:
/// "application-layer drops"). Each variant maps onto exactly one
/// `AggregateStats` counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The destination neighbor's outbound queue was already at
    /// `MAC_QUEUE_SIZE` capacity.
    QueueFull,
    /// `MAC_MAX_RETRIES` unacknowledged transmissions were exhausted.
    TxLimitExceeded,
    /// The routing plugin declined to forward (no route, or `on_forward`
    /// returned `false`).
    NoRoute,
    /// The scheduler plugin declined to pin the packet to any cell.
    NoSchedule,
    /// Any other drop not covered above (e.g. a reassembly context expiring
    /// before every fragment arrived).
    Other,
}

impl DropReason {
    pub fn record_on(self, stats: &mut AggregateStats) {
        match self {
            DropReason::QueueFull => stats.app_num_queue_drops += 1,
            DropReason::TxLimitExceeded => stats.app_num_tx_limit_drops += 1,
            DropReason::NoRoute => stats.app_num_routing_drops += 1,
            DropReason::NoSchedule => stats.app_num_scheduling_drops += 1,
            DropReason::Other => stats.app_num_other_drops += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_drop_reason_increments_exactly_its_own_counter() {
        let mut stats = AggregateStats::default();
        DropReason::QueueFull.record_on(&mut stats);
        DropReason::TxLimitExceeded.record_on(&mut stats);
        DropReason::NoRoute.record_on(&mut stats);
        DropReason::NoSchedule.record_on(&mut stats);
        DropReason::Other.record_on(&mut stats);
        assert_eq!(stats.app_num_queue_drops, 1);
        assert_eq!(stats.app_num_tx_limit_drops, 1);
        assert_eq!(stats.app_num_routing_drops, 1);
        assert_eq!(stats.app_num_scheduling_drops, 1);
        assert_eq!(stats.app_num_other_drops, 1);
        assert_eq!(stats.app_packets_rxed, 0);
    }
}

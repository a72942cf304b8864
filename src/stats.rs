//! Aggregate statistics surface (§6 "External interfaces": "the core
//! exposes them through a read-only `aggregate_stats()` surface"; §8's
//! round-trip law requires this record to survive a serialize/deserialize
//! cycle exactly).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub app_packets_rxed: u64,
    pub app_num_endpoint_rx: u64,
    pub app_num_queue_drops: u64,
    pub app_num_tx_limit_drops: u64,
    pub app_num_routing_drops: u64,
    pub app_num_scheduling_drops: u64,
    pub app_num_other_drops: u64,
    pub mac_tx_unicast: u64,
    pub mac_acked: u64,
    pub mac_rx_collision: u64,
    pub stats_slots_rx_scanning: u64,
}

impl AggregateStats {
    pub fn merge(&mut self, other: &AggregateStats) {
        self.app_packets_rxed += other.app_packets_rxed;
        self.app_num_endpoint_rx += other.app_num_endpoint_rx;
        self.app_num_queue_drops += other.app_num_queue_drops;
        self.app_num_tx_limit_drops += other.app_num_tx_limit_drops;
        self.app_num_routing_drops += other.app_num_routing_drops;
        self.app_num_scheduling_drops += other.app_num_scheduling_drops;
        self.app_num_other_drops += other.app_num_other_drops;
        self.mac_tx_unicast += other.mac_tx_unicast;
        self.mac_acked += other.mac_acked;
        self.mac_rx_collision += other.mac_rx_collision;
        self.stats_slots_rx_scanning += other.stats_slots_rx_scanning;
    }
}

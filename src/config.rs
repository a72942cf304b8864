//! Simulation configuration (TOML) and network topology (JSON), matching
//! the reference simulator's `ControlConfig`/`Scene` split: a flat,
//! `#[serde(default)]`-backed settings record plus a node/connection graph
//! validated separately after parsing.

use crate::link_model::ConnectionSpec;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_duration_seconds() -> f64 {
    300.0
}
fn default_seed() -> u64 {
    0
}
fn default_slotframe_length() -> u16 {
    101
}
fn default_slot_duration_us() -> u32 {
    10_000
}
fn default_min_be() -> u8 {
    1
}
fn default_max_be() -> u8 {
    7
}
fn default_max_retries() -> u32 {
    7
}
fn default_queue_size() -> usize {
    8
}
fn default_max_subslots() -> usize {
    1
}
fn default_header_size() -> usize {
    21
}
fn default_eb_packet_size() -> usize {
    32
}
fn default_max_packet_size() -> usize {
    100
}
fn default_eb_period_seconds() -> f64 {
    8.0
}
fn default_keepalive_timeout_seconds() -> f64 {
    60.0
}
fn default_desync_threshold_seconds() -> f64 {
    120.0
}
fn default_channel_scan_duration_seconds() -> f64 {
    2.0
}
fn default_hopping_sequence() -> Vec<u8> {
    vec![0, 1, 2, 3]
}
fn default_max_join_priority() -> u8 {
    10
}
fn default_fragmentation_enabled() -> bool {
    true
}
fn default_reassembly_timeout_seconds() -> f64 {
    60.0
}
fn default_co_channel_rejection_db() -> f64 {
    -3.0
}
fn default_num_recent_link_layer_seqnums() -> usize {
    16
}
fn default_scheduling_algorithm() -> String {
    "minimal-shared-cell".to_string()
}
fn default_routing_algorithm() -> String {
    "flood".to_string()
}
fn default_app_packet_size() -> usize {
    20
}
fn default_app_packet_period_seconds() -> f64 {
    10.0
}
fn default_app_warmup_seconds() -> f64 {
    30.0
}

/// Known scheduler plugin names (§6); anything else falls back to
/// `minimal-shared-cell` with a logged warning (§7 category 1).
pub const KNOWN_SCHEDULING_ALGORITHMS: &[&str] = &["minimal-shared-cell"];
/// Known routing plugin names; anything else falls back to `flood`.
pub const KNOWN_ROUTING_ALGORITHMS: &[&str] = &["flood"];

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Configuration {
    pub duration_seconds: f64,
    pub seed: u64,
    pub slotframe_length: u16,
    pub mac_slot_duration_us: u32,
    pub mac_min_be: u8,
    pub mac_max_be: u8,
    pub mac_max_retries: u32,
    pub mac_queue_size: usize,
    pub mac_max_subslots: usize,
    pub mac_header_size: usize,
    pub mac_eb_packet_size: usize,
    pub mac_max_packet_size: usize,
    pub mac_eb_period_seconds: f64,
    pub mac_keepalive_timeout_seconds: f64,
    pub mac_desync_threshold_seconds: f64,
    pub mac_channel_scan_duration_seconds: f64,
    pub mac_hopping_sequence: Vec<u8>,
    pub mac_max_join_priority: u8,
    pub ip_fragmentation_enabled: bool,
    pub ip_reassembly_timeout_seconds: f64,
    pub phy_co_channel_rejection_db: f64,
    /// §4.4 Phase C's duplicate-suppression ring bound
    /// (`NUM_RECENT_LINK_LAYER_SEQNUMS`) — the third core resource bound
    /// named in §5 alongside `mac_queue_size` and
    /// `ip_reassembly_timeout_seconds`; caps `Network`'s per-receiver
    /// recent-delivery ring.
    pub num_recent_link_layer_seqnums: usize,
    pub scheduling_algorithm: String,
    pub routing_algorithm: String,
    pub app_packet_size: usize,
    pub app_packet_period_seconds: f64,
    pub app_warmup_seconds: f64,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            duration_seconds: default_duration_seconds(),
            seed: default_seed(),
            slotframe_length: default_slotframe_length(),
            mac_slot_duration_us: default_slot_duration_us(),
            mac_min_be: default_min_be(),
            mac_max_be: default_max_be(),
            mac_max_retries: default_max_retries(),
            mac_queue_size: default_queue_size(),
            mac_max_subslots: default_max_subslots(),
            mac_header_size: default_header_size(),
            mac_eb_packet_size: default_eb_packet_size(),
            mac_max_packet_size: default_max_packet_size(),
            mac_eb_period_seconds: default_eb_period_seconds(),
            mac_keepalive_timeout_seconds: default_keepalive_timeout_seconds(),
            mac_desync_threshold_seconds: default_desync_threshold_seconds(),
            mac_channel_scan_duration_seconds: default_channel_scan_duration_seconds(),
            mac_hopping_sequence: default_hopping_sequence(),
            mac_max_join_priority: default_max_join_priority(),
            ip_fragmentation_enabled: default_fragmentation_enabled(),
            ip_reassembly_timeout_seconds: default_reassembly_timeout_seconds(),
            phy_co_channel_rejection_db: default_co_channel_rejection_db(),
            num_recent_link_layer_seqnums: default_num_recent_link_layer_seqnums(),
            scheduling_algorithm: default_scheduling_algorithm(),
            routing_algorithm: default_routing_algorithm(),
            app_packet_size: default_app_packet_size(),
            app_packet_period_seconds: default_app_packet_period_seconds(),
            app_warmup_seconds: default_app_warmup_seconds(),
        }
    }
}

impl Configuration {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading configuration file {}", path.display()))?;
        let mut config: Configuration = toml::from_str(&text).with_context(|| format!("parsing configuration file {}", path.display()))?;
        config.resolve_unknown_algorithms();
        Ok(config)
    }

    /// Unknown `scheduling_algorithm`/`routing_algorithm` names fall back to
    /// a default and log a warning rather than failing to parse (§6, §7
    /// category 1).
    fn resolve_unknown_algorithms(&mut self) {
        if !KNOWN_SCHEDULING_ALGORITHMS.contains(&self.scheduling_algorithm.as_str()) {
            log::warn!(
                "unknown scheduling_algorithm '{}', falling back to '{}'",
                self.scheduling_algorithm,
                default_scheduling_algorithm()
            );
            self.scheduling_algorithm = default_scheduling_algorithm();
        }
        if !KNOWN_ROUTING_ALGORITHMS.contains(&self.routing_algorithm.as_str()) {
            log::warn!(
                "unknown routing_algorithm '{}', falling back to '{}'",
                self.routing_algorithm,
                default_routing_algorithm()
            );
            self.routing_algorithm = default_routing_algorithm();
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TopologyNode {
    pub id: u32,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub is_coordinator: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TopologyConnection {
    pub from: u32,
    pub to: u32,
    #[serde(flatten)]
    pub spec: ConnectionSpec,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Topology {
    pub nodes: Vec<TopologyNode>,
    #[serde(default)]
    pub connections: Vec<TopologyConnection>,
}

impl Topology {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading topology file {}", path.display()))?;
        let topology: Topology = serde_json::from_str(&text).with_context(|| format!("parsing topology file {}", path.display()))?;
        Ok(topology)
    }

    /// Enumerates range/uniqueness checks in the reference simulator's
    /// `validate_scene` style: every failure is logged and the offending
    /// element dropped rather than the whole load failing (§7 category 2),
    /// except duplicate node ids, which would corrupt the node map and so
    /// are treated as a construction error.
    pub fn validate(mut self) -> Result<Self> {
        let mut seen_ids = std::collections::HashSet::new();
        for node in &self.nodes {
            if node.id == 0 {
                anyhow::bail!("node id 0 is reserved for the broadcast sentinel, found in topology");
            }
            if !seen_ids.insert(node.id) {
                anyhow::bail!("duplicate node id {} in topology", node.id);
            }
        }

        let valid_ids: std::collections::HashSet<u32> = self.nodes.iter().map(|n| n.id).collect();
        let before = self.connections.len();
        self.connections.retain(|conn| {
            let ok = valid_ids.contains(&conn.from) && valid_ids.contains(&conn.to);
            if !ok {
                log::warn!("dropping connection {}->{}: references an unknown node", conn.from, conn.to);
            }
            ok
        });
        if self.connections.len() != before {
            log::warn!("{} connection(s) dropped due to unknown endpoints", before - self.connections.len());
        }

        for node in &self.nodes {
            let has_link = self.connections.iter().any(|c| c.from == node.id || c.to == node.id);
            if !has_link && self.nodes.len() > 1 {
                log::warn!("node {} has zero links outside trace mode", node.id);
            }
        }

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link_model::LinkModelKind;

    #[test]
    fn default_configuration_has_sane_values() {
        let cfg = Configuration::default();
        assert!(cfg.duration_seconds > 0.0);
        assert!(cfg.mac_min_be <= cfg.mac_max_be);
        assert_eq!(cfg.scheduling_algorithm, "minimal-shared-cell");
    }

    #[test]
    fn resolve_unknown_algorithms_falls_back_without_erroring() {
        let mut cfg = Configuration {
            scheduling_algorithm: "orchestra".to_string(),
            routing_algorithm: "rpl".to_string(),
            ..Configuration::default()
        };
        cfg.resolve_unknown_algorithms();
        assert_eq!(cfg.scheduling_algorithm, "minimal-shared-cell");
        assert_eq!(cfg.routing_algorithm, "flood");
    }

    #[test]
    fn validate_rejects_duplicate_node_ids() {
        let topology = Topology {
            nodes: vec![
                TopologyNode { id: 1, x: 0.0, y: 0.0, is_coordinator: true },
                TopologyNode { id: 1, x: 1.0, y: 0.0, is_coordinator: false },
            ],
            connections: vec![],
        };
        assert!(topology.validate().is_err());
    }

    #[test]
    fn validate_drops_connections_to_unknown_nodes() {
        let topology = Topology {
            nodes: vec![TopologyNode { id: 1, x: 0.0, y: 0.0, is_coordinator: true }],
            connections: vec![TopologyConnection {
                from: 1,
                to: 99,
                spec: ConnectionSpec {
                    kind: LinkModelKind::Fixed,
                    tx_power_dbm: 0.0,
                    fixed_success_rate: Some(1.0),
                    udgm_range_m: 50.0,
                    path_loss_exponent: 2.0,
                    shadowing_sigma_db: 0.0,
                    path_loss_at_reference_db: 40.0,
                    sensitivity_dbm: -97.0,
                    logistic_inflection_dbm: -90.0,
                    logistic_steepness: 0.2,
                    trace_events: vec![],
                },
            }],
        };
        let validated = topology.validate().unwrap();
        assert!(validated.connections.is_empty());
    }
}

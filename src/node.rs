//! A single radio node: slotframes, per-neighbor link state, association
//! state, and the per-slot schedule decision (§3 "Node", §4.3).

use crate::neighbor::Neighbor;
use crate::packet::{NodeId, Packet, EB_VIRTUAL_ID};
use crate::random::RandomSource;
use crate::schedule::{select_best_tsch_cell, Cell, CellKind, Slotframe};
use indexmap::IndexMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Sleep,
    Tx,
    Rx,
    Scan,
}

#[derive(Debug, Clone)]
pub struct ScheduleOutcome {
    pub decision: Decision,
    pub channel_offset: Option<u8>,
    pub slotframe_handle: Option<u32>,
    pub timeslot: Option<u16>,
    /// Neighbor whose queue-front packet was pinned for this TX cell. `None`
    /// unless `decision == Decision::Tx`.
    pub tx_neighbor_id: Option<NodeId>,
    pub is_eb: bool,
}

impl ScheduleOutcome {
    fn sleep() -> Self {
        Self {
            decision: Decision::Sleep,
            channel_offset: None,
            slotframe_handle: None,
            timeslot: None,
            tx_neighbor_id: None,
            is_eb: false,
        }
    }
}

/// Inputs to `Node::schedule` that come from configuration/global clock
/// rather than from the node's own state.
pub struct ScheduleParams<'a> {
    pub now_seconds: f64,
    pub channel_scan_duration_seconds: f64,
    pub join_hopping_sequence: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationState {
    Scanning,
    Joined,
    DesyncPending,
}

pub struct NodeState {
    pub has_joined: bool,
    pub is_coordinator: bool,
    pub join_priority: u8,
    pub current_time_source: Option<NodeId>,
    pub association: AssociationState,
    pub scan_channel_offset: Option<u8>,
    pub last_scan_channel_refresh_seconds: f64,
    pub skip_slots: u16,
    pub backup_cell: Option<(u32, Cell)>,
    pub skipped_tx_slots: u32,
    pub stats_slots_rx_scanning: u32,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            has_joined: false,
            is_coordinator: false,
            join_priority: u8::MAX,
            current_time_source: None,
            association: AssociationState::Scanning,
            scan_channel_offset: None,
            last_scan_channel_refresh_seconds: f64::NEG_INFINITY,
            skip_slots: 0,
            backup_cell: None,
            skipped_tx_slots: 0,
            stats_slots_rx_scanning: 0,
        }
    }
}

pub struct Node {
    pub id: NodeId,
    pub position: (f64, f64),
    pub slotframes: Vec<Slotframe>,
    /// §5 "node iteration order... is part of the reproducibility contract":
    /// an `IndexMap` (not `HashMap`) so the broadcast-cell fallback scan in
    /// `schedule()` below visits neighbors in the order they were first seen,
    /// not in hash order that varies across process runs.
    pub neighbors: IndexMap<NodeId, Neighbor>,
    /// Indexes into `Network`'s link map (§3 ownership note: links are
    /// owned by `Network`, a node holds only the id to look one up by).
    /// Collapsed to the single set of neighbor ids this node has a link to —
    /// see SPEC_FULL.md's Non-goals for why the source data model's
    /// active-vs-potential link distinction isn't carried further.
    pub active_links: std::collections::HashSet<NodeId>,
    pub state: NodeState,
    pub routing_state: Option<Box<dyn crate::plugin::RoutingState>>,

    /// Subslot reception buffers, cleared at the end of every step's Phase D.
    pub rx_ok: Vec<Vec<(NodeId, Packet)>>,
    pub rx_failed: Vec<Vec<(NodeId, f64)>>,

    queue_capacity: usize,
    min_be: u8,
}

impl Node {
    pub fn new(id: NodeId, position: (f64, f64), queue_capacity: usize, min_be: u8) -> Self {
        Self {
            id,
            position,
            slotframes: Vec::new(),
            neighbors: IndexMap::new(),
            active_links: std::collections::HashSet::new(),
            state: NodeState::default(),
            routing_state: None,
            rx_ok: Vec::new(),
            rx_failed: Vec::new(),
            queue_capacity,
            min_be,
        }
    }

    pub fn size_subslot_buffers(&mut self, mac_max_subslots: usize) {
        self.rx_ok = vec![Vec::new(); mac_max_subslots];
        self.rx_failed = vec![Vec::new(); mac_max_subslots];
    }

    pub fn clear_subslot_buffers(&mut self) {
        for bucket in &mut self.rx_ok {
            bucket.clear();
        }
        for bucket in &mut self.rx_failed {
            bucket.clear();
        }
    }

    /// Get or create the `Neighbor` record for `id`, including the two
    /// virtual neighbors (`BROADCAST_ID`, `EB_VIRTUAL_ID`).
    pub fn neighbor_mut(&mut self, id: NodeId) -> &mut Neighbor {
        let capacity = self.queue_capacity;
        let min_be = self.min_be;
        self.neighbors.entry(id).or_insert_with(|| Neighbor::new(id, capacity, min_be))
    }

    pub fn neighbor(&self, id: NodeId) -> Option<&Neighbor> {
        self.neighbors.get(&id)
    }

    fn dedicated_tx_neighbor_ids(&self) -> std::collections::HashSet<NodeId> {
        self.slotframes
            .iter()
            .flat_map(|sf| sf.cells().iter())
            .filter(|c| c.kind == CellKind::Normal && c.options.is_tx())
            .filter_map(|c| c.neighbor_id)
            .collect()
    }

    /// §4.3: the per-slot schedule decision.
    pub fn schedule(&mut self, asn: u64, params: &ScheduleParams, rng: &mut RandomSource) -> ScheduleOutcome {
        if self.state.skip_slots > 0 {
            self.state.skip_slots -= 1;
            return ScheduleOutcome::sleep();
        }

        if !self.state.has_joined {
            let refresh_due = params.now_seconds - self.state.last_scan_channel_refresh_seconds >= params.channel_scan_duration_seconds
                || self.state.scan_channel_offset.is_none();
            if refresh_due {
                if let Some(idx) = rng.pick_index(params.join_hopping_sequence.len()) {
                    self.state.scan_channel_offset = Some(params.join_hopping_sequence[idx]);
                }
                self.state.last_scan_channel_refresh_seconds = params.now_seconds;
            }
            self.state.stats_slots_rx_scanning += 1;
            return ScheduleOutcome {
                decision: Decision::Scan,
                channel_offset: self.state.scan_channel_offset,
                slotframe_handle: None,
                timeslot: None,
                tx_neighbor_id: None,
                is_eb: false,
            };
        }

        let mut due: Vec<(usize, usize)> = Vec::new();
        let mut min_future_ttt: Option<u16> = None;
        for (sf_idx, sf) in self.slotframes.iter().enumerate() {
            for (c_idx, cell) in sf.cells().iter().enumerate() {
                let ttt = cell.time_to_timeslot(asn, sf.size);
                if ttt == 0 {
                    due.push((sf_idx, c_idx));
                } else {
                    min_future_ttt = Some(min_future_ttt.map_or(ttt, |m| m.min(ttt)));
                }
            }
        }
        self.state.skip_slots = min_future_ttt.map(|t| t.saturating_sub(1)).unwrap_or(0);

        let mut primary: Option<(usize, usize)> = None;
        for &(sf_idx, c_idx) in &due {
            let cell = self.slotframes[sf_idx].cells()[c_idx];
            match primary {
                None => primary = Some((sf_idx, c_idx)),
                Some((p_sf, p_c)) => {
                    let p_cell = self.slotframes[p_sf].cells()[p_c];
                    let replace = if cell.options.is_tx() != p_cell.options.is_tx() {
                        cell.options.is_tx()
                    } else {
                        select_best_tsch_cell(&p_cell, &cell)
                    };
                    if replace {
                        primary = Some((sf_idx, c_idx));
                    }
                }
            }
        }

        let mut backup: Option<(usize, usize)> = None;
        for &(sf_idx, c_idx) in &due {
            if Some((sf_idx, c_idx)) == primary {
                continue;
            }
            let cell = self.slotframes[sf_idx].cells()[c_idx];
            if !cell.options.is_rx() {
                continue;
            }
            match backup {
                None => backup = Some((sf_idx, c_idx)),
                Some((b_sf, _)) => {
                    if self.slotframes[sf_idx].handle < self.slotframes[b_sf].handle {
                        backup = Some((sf_idx, c_idx));
                    }
                }
            }
        }

        let Some((p_sf, p_c)) = primary else {
            return ScheduleOutcome::sleep();
        };
        let primary_cell = self.slotframes[p_sf].cells()[p_c];
        let primary_handle = self.slotframes[p_sf].handle;

        let mut tx_neighbor = None;
        let mut is_eb = false;
        if primary_cell.options.is_tx() {
            if primary_cell.kind == CellKind::Advertising {
                if self.neighbors.get(&EB_VIRTUAL_ID).is_some_and(|n| !n.queue.is_empty()) {
                    tx_neighbor = Some(EB_VIRTUAL_ID);
                    is_eb = true;
                }
            }
            if tx_neighbor.is_none() {
                if let Some(dedicated_id) = primary_cell.neighbor_id {
                    if let Some(n) = self.neighbors.get(&dedicated_id) {
                        let ready = n
                            .queue
                            .front()
                            .is_some_and(|qp| packet_matches_pin(&qp.packet, primary_handle, primary_cell.timeslot));
                        let csma_clear = !primary_cell.options.is_shared() || n.backoff_window == 0;
                        if ready && csma_clear {
                            tx_neighbor = Some(dedicated_id);
                        }
                    }
                } else {
                    let dedicated_ids = self.dedicated_tx_neighbor_ids();
                    for (&nid, n) in self.neighbors.iter() {
                        if nid == EB_VIRTUAL_ID || dedicated_ids.contains(&nid) {
                            continue;
                        }
                        let ready = n
                            .queue
                            .front()
                            .is_some_and(|qp| packet_matches_pin(&qp.packet, primary_handle, primary_cell.timeslot));
                        let csma_clear = !primary_cell.options.is_shared() || n.backoff_window == 0;
                        if ready && csma_clear {
                            tx_neighbor = Some(nid);
                            break;
                        }
                    }
                }
            }
        }

        if tx_neighbor.is_none() {
            if let Some((b_sf, b_c)) = backup {
                let backup_cell = self.slotframes[b_sf].cells()[b_c];
                let backup_handle = self.slotframes[b_sf].handle;
                let should_switch = !primary_cell.options.is_rx() || backup_handle < primary_handle;
                if should_switch {
                    self.state.backup_cell = Some((backup_handle, backup_cell));
                    return ScheduleOutcome {
                        decision: Decision::Rx,
                        channel_offset: Some(backup_cell.channel_offset),
                        slotframe_handle: Some(backup_handle),
                        timeslot: Some(backup_cell.timeslot),
                        tx_neighbor_id: None,
                        is_eb: false,
                    };
                }
            }
        }

        if let Some(nid) = tx_neighbor {
            ScheduleOutcome {
                decision: Decision::Tx,
                channel_offset: Some(primary_cell.channel_offset),
                slotframe_handle: Some(primary_handle),
                timeslot: Some(primary_cell.timeslot),
                tx_neighbor_id: Some(nid),
                is_eb,
            }
        } else if primary_cell.options.is_rx() {
            ScheduleOutcome {
                decision: Decision::Rx,
                channel_offset: Some(primary_cell.channel_offset),
                slotframe_handle: Some(primary_handle),
                timeslot: Some(primary_cell.timeslot),
                tx_neighbor_id: None,
                is_eb: false,
            }
        } else {
            self.state.skipped_tx_slots += 1;
            ScheduleOutcome::sleep()
        }
    }
}

/// A packet with no slotframe/timeslot pin matches any cell; a pinned
/// packet only matches the exact coordinates it was pinned to.
fn packet_matches_pin(packet: &Packet, slotframe_handle: u32, timeslot: u16) -> bool {
    match (packet.attributes.slotframe_handle, packet.attributes.timeslot) {
        (None, None) => true,
        (Some(h), Some(t)) => h == slotframe_handle && t == timeslot,
        (Some(h), None) => h == slotframe_handle,
        (None, Some(t)) => t == timeslot,
    }
}

//! Scheduler and routing plugin traits (§6 "External interfaces"), plus the
//! default fallback implementations used when a configured algorithm name
//! isn't recognized (§7 category 1: log a warning, don't fail).
//!
//! Per §9's "polymorphic modules" note, `Network` holds one
//! `Box<dyn SchedulerPlugin>` and each `Node` holds one
//! `Box<dyn RoutingState>`; neither trait threads a `&mut Network` through
//! its methods, so there's no cyclic-borrow hazard to work around.

use crate::node::Node;
use crate::packet::{NodeId, Packet};
use crate::schedule::{Cell, CellOptions};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingStats {
    pub rank: Option<u16>,
    pub dag_version: Option<u8>,
    pub parent_switches: u32,
}

/// Per-node routing state (§6 "Routing plugin": `new RoutingState(node)`).
pub trait RoutingState {
    fn start(&mut self);
    fn on_tx(&mut self, neighbor_id: NodeId, packet: &Packet, ok: bool, ack_required: bool, cell: Option<&Cell>);
    fn on_prepare_tx_packet(&mut self, packet: &mut Packet);
    /// Returns `true` if `new_packet` should actually be forwarded.
    fn on_forward(&mut self, old_packet: &Packet, new_packet: &mut Packet) -> bool;
    fn on_new_time_source(&mut self, old: Option<NodeId>, new: Option<NodeId>);
    fn local_repair(&mut self, from_init: bool);
    fn is_joined(&self) -> bool;
    fn on_periodic_timer(&mut self);
    fn stats_get(&self) -> RoutingStats;
}

/// Factory for per-node routing state, selected by `ROUTING_ALGORITHM`.
pub trait RoutingPlugin {
    fn initialize(&mut self, node_ids: &[NodeId]);
    fn new_routing_state(&self, node_id: NodeId) -> Box<dyn RoutingState>;
}

/// Scheduler plugin, held once by `Network` (§6 "Scheduler plugin").
pub trait SchedulerPlugin {
    fn initialize(&mut self);
    fn node_init(&mut self, node: &mut Node);
    /// May pin slotframe/timeslot/channel-offset on `packet`, or reject it
    /// outright by returning `false`.
    fn on_packet_ready(&mut self, node: &mut Node, packet: &mut Packet) -> bool;
    fn on_new_time_source(&mut self, node: &mut Node, old: Option<NodeId>, new: Option<NodeId>);
    fn on_child_added(&mut self, node: &mut Node, addr: NodeId);
    fn on_child_removed(&mut self, node: &mut Node, addr: NodeId);
    fn on_tx(&mut self, node: &mut Node, packet: &Packet, ok: bool);
    fn on_node_becomes_root(&mut self, node: &mut Node);
    fn add_root(&mut self, node: &mut Node, root_id: NodeId);
}

/// Fallback scheduler used when `SCHEDULING_ALGORITHM` names an algorithm
/// this crate doesn't implement (Orchestra, 6TiSCH-min and
/// Leaf-and-Forwarder are explicitly out of scope per the purpose
/// statement). Installs one shared TX/RX/ADVERTISING cell at
/// (timeslot 0, channel offset 0) in the node's first slotframe so the node
/// can at least exchange EBs and best-effort data; it does not implement
/// any of the named algorithms' specific cell-negotiation rules.
#[derive(Default)]
pub struct MinimalSharedCellScheduler;

impl SchedulerPlugin for MinimalSharedCellScheduler {
    fn initialize(&mut self) {}

    fn node_init(&mut self, node: &mut Node) {
        if node.slotframes.is_empty() {
            node.slotframes.push(crate::schedule::Slotframe::new(0, 101));
        }
        let options = CellOptions::TX | CellOptions::RX | CellOptions::SHARED;
        let cell = Cell::advertising(0, 0, options);
        let _ = node.slotframes[0].add_cell(cell, false);
    }

    fn on_packet_ready(&mut self, _node: &mut Node, _packet: &mut Packet) -> bool {
        true
    }

    fn on_new_time_source(&mut self, _node: &mut Node, _old: Option<NodeId>, _new: Option<NodeId>) {}
    fn on_child_added(&mut self, _node: &mut Node, _addr: NodeId) {}
    fn on_child_removed(&mut self, _node: &mut Node, _addr: NodeId) {}
    fn on_tx(&mut self, _node: &mut Node, _packet: &Packet, _ok: bool) {}
    fn on_node_becomes_root(&mut self, _node: &mut Node) {}
    fn add_root(&mut self, _node: &mut Node, _root_id: NodeId) {}
}

/// Fallback routing: every node forwards every packet it isn't the
/// destination of, with no rank/DAG bookkeeping. Used when
/// `ROUTING_ALGORITHM` names RPL or any other out-of-scope protocol.
#[derive(Default)]
pub struct FloodRouting;

impl RoutingPlugin for FloodRouting {
    fn initialize(&mut self, _node_ids: &[NodeId]) {}

    fn new_routing_state(&self, _node_id: NodeId) -> Box<dyn RoutingState> {
        Box::new(FloodRoutingState { joined: false })
    }
}

pub struct FloodRoutingState {
    joined: bool,
}

impl RoutingState for FloodRoutingState {
    fn start(&mut self) {
        self.joined = true;
    }

    fn on_tx(&mut self, _neighbor_id: NodeId, _packet: &Packet, _ok: bool, _ack_required: bool, _cell: Option<&Cell>) {}

    fn on_prepare_tx_packet(&mut self, _packet: &mut Packet) {}

    fn on_forward(&mut self, _old_packet: &Packet, _new_packet: &mut Packet) -> bool {
        true
    }

    fn on_new_time_source(&mut self, _old: Option<NodeId>, _new: Option<NodeId>) {}

    fn local_repair(&mut self, _from_init: bool) {
        self.joined = false;
    }

    fn is_joined(&self) -> bool {
        self.joined
    }

    fn on_periodic_timer(&mut self) {}

    fn stats_get(&self) -> RoutingStats {
        RoutingStats::default()
    }
}

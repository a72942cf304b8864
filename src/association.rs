//! TSCH association and synchronization state machine (§4.6).
//!
//! Kept free of `Timeline`/`Network` types: each transition function takes
//! the node's own state plus the triggering fact, and returns the list of
//! timer effects the caller (`crate::network::Network`, which owns the one
//! global `Timeline`) must apply. This keeps the policy here pure and
//! testable without constructing a whole simulation.

use crate::node::{AssociationState, NodeState};
use crate::packet::NodeId;
use crate::random::RandomSource;

#[derive(Debug, Clone, Copy)]
pub struct AssociationConfig {
    pub keepalive_timeout_seconds: f64,
    pub desync_threshold_seconds: f64,
    pub max_join_priority: u8,
    pub eb_period_seconds: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AssociationEffect {
    ArmKeepaliveTimer(f64),
    ArmLeaveTimer(f64),
    CancelLeaveTimer,
    StartEbEmission,
    StopEbEmission,
    ResumeScanning,
    InvokeLocalRepair,
}

/// SCANNING → JOINED, triggered by receiving an EB whose join priority is
/// acceptable. A no-op if the node is already joined (only non-coordinator
/// nodes not yet synchronized react to EBs this way).
pub fn on_eb_received(state: &mut NodeState, cfg: &AssociationConfig, sender_id: NodeId, eb_join_priority: u8, effects: &mut Vec<AssociationEffect>) {
    if state.has_joined || eb_join_priority >= cfg.max_join_priority {
        return;
    }
    state.has_joined = true;
    state.association = AssociationState::Joined;
    state.join_priority = eb_join_priority.saturating_add(1);
    state.current_time_source = Some(sender_id);
    effects.push(AssociationEffect::ArmKeepaliveTimer(cfg.keepalive_timeout_seconds / 2.0));
    effects.push(AssociationEffect::StartEbEmission);
}

/// JOINED → DESYNC_PENDING, triggered by the keepalive timer firing without
/// an intervening sync refresh. The caller is responsible for actually
/// transmitting a keepalive frame; this only updates association state and
/// arms the leave timer.
pub fn on_keepalive_timeout(state: &mut NodeState, cfg: &AssociationConfig, effects: &mut Vec<AssociationEffect>) {
    if state.association != AssociationState::Joined {
        return;
    }
    state.association = AssociationState::DesyncPending;
    effects.push(AssociationEffect::ArmLeaveTimer(cfg.desync_threshold_seconds));
}

/// Any RX from, or ACK from, the current time source refreshes both
/// timers and cures a pending desync back to JOINED.
pub fn on_sync_refresh(state: &mut NodeState, cfg: &AssociationConfig, effects: &mut Vec<AssociationEffect>) {
    match state.association {
        AssociationState::Joined | AssociationState::DesyncPending => {
            state.association = AssociationState::Joined;
            effects.push(AssociationEffect::ArmKeepaliveTimer(cfg.keepalive_timeout_seconds));
            effects.push(AssociationEffect::CancelLeaveTimer);
        }
        AssociationState::Scanning => {}
    }
}

/// DESYNC_PENDING → SCANNING, triggered by the leave timer firing.
pub fn on_leave_timeout(state: &mut NodeState, effects: &mut Vec<AssociationEffect>) {
    if state.association != AssociationState::DesyncPending {
        return;
    }
    state.association = AssociationState::Scanning;
    state.has_joined = false;
    state.current_time_source = None;
    effects.push(AssociationEffect::StopEbEmission);
    effects.push(AssociationEffect::ResumeScanning);
    effects.push(AssociationEffect::InvokeLocalRepair);
}

/// §4.6 "EB emission": a jittered period, `period − period/4 + U(0, period/4)`.
pub fn eb_jitter_interval_seconds(rng: &mut RandomSource, period_seconds: f64) -> f64 {
    let quarter = period_seconds / 4.0;
    (period_seconds - quarter) + rng.uniform() * quarter
}

/// Whether an EB should be enqueued this opportunity (§4.6): the virtual EB
/// queue must be empty, the node must have joined a routing DAG and not be
/// a leaf, and the current EB period must still be enabled.
pub fn should_emit_eb(eb_queue_empty: bool, routing_joined: bool, is_leaf: bool, current_eb_period_seconds: f64) -> bool {
    eb_queue_empty && routing_joined && !is_leaf && current_eb_period_seconds > 0.0
}

//! The network: owns every node, every link, the one shared `Timeline`, and
//! runs the per-slot four-phase MAC step (§4.4).
//!
//! Links are owned here, not by `Node` (§3 ownership note) — a `Node` only
//! keeps the neighbor ids it has a link to (`active_links`) and looks the
//! actual `LinkModel` up through `Network::links`.

use crate::association::{self, AssociationConfig, AssociationEffect};
use crate::config::{Configuration, Topology};
use crate::error::DropReason;
use crate::fragmentation::{FragmentTagAllocator, ReassemblyTable};
use crate::link_model::{create_link, LinkModel};
use crate::neighbor::bootstrap_etx_from_rssi;
use crate::node::{Decision, Node, ScheduleParams};
use crate::packet::{NodeId, Packet, QueuedPacket, BROADCAST_ID, EB_VIRTUAL_ID};
use crate::plugin::{FloodRouting, MinimalSharedCellScheduler, RoutingPlugin, SchedulerPlugin};
use crate::random::RandomSource;
use crate::stats::AggregateStats;
use crate::timeline::Timeline;
use anyhow::{anyhow, Result};
use indexmap::IndexMap;
use std::collections::{HashMap, VecDeque};

/// Payload of every timer the network schedules on its own `Timeline`. The
/// per-slot decide/transmit/resolve/ack machine itself is *not* timer-driven
/// — it runs once per `Timeline::step` call, synchronously, before the step
/// advances the clock and dispatches whichever of these fire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NetworkEvent {
    EbEmission(NodeId),
    Keepalive(NodeId),
    Leave(NodeId),
    FreshnessHalving,
    ReassemblyExpirySweep,
    AppGenerate(NodeId),
}

const REASSEMBLY_SWEEP_PERIOD_SECONDS: f64 = 5.0;

fn link_key(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

pub struct Network {
    pub timeline: Timeline<NetworkEvent>,
    /// §3 "Ownership" / §5 "node iteration order... is part of the
    /// reproducibility contract": an `IndexMap` preserves topology-file
    /// insertion order regardless of `NodeId` hashing, unlike `HashMap`
    /// (whose default hasher is reseeded from OS randomness per process).
    pub nodes: IndexMap<NodeId, Node>,
    links: HashMap<(NodeId, NodeId), Box<dyn LinkModel>>,
    scheduler: Box<dyn SchedulerPlugin>,
    routing: Box<dyn RoutingPlugin>,
    pub rng: RandomSource,
    config: Configuration,
    association_cfg: AssociationConfig,
    reassembly: HashMap<NodeId, ReassemblyTable>,
    frag_alloc: FragmentTagAllocator,
    recent_seqnums: HashMap<NodeId, VecDeque<(NodeId, u32)>>,
    stats: HashMap<NodeId, AggregateStats>,
    app_seqnum: HashMap<NodeId, u32>,
}

impl Network {
    pub fn new(config: Configuration, topology: &Topology) -> Result<Self> {
        let mut nodes = IndexMap::new();
        for tn in &topology.nodes {
            let mut node = Node::new(tn.id, (tn.x, tn.y), config.mac_queue_size, config.mac_min_be);
            node.state.is_coordinator = tn.is_coordinator;
            node.size_subslot_buffers(config.mac_max_subslots);
            nodes.insert(tn.id, node);
        }
        if nodes.is_empty() {
            return Err(anyhow!("topology has no nodes"));
        }

        let mut links: HashMap<(NodeId, NodeId), Box<dyn LinkModel>> = HashMap::new();
        for conn in &topology.connections {
            let (ax, ay) = nodes.get(&conn.from).map(|n| n.position).unwrap_or((0.0, 0.0));
            let (bx, by) = nodes.get(&conn.to).map(|n| n.position).unwrap_or((0.0, 0.0));
            let distance = ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt();
            let mut model = create_link(&conn.spec);
            model.update(distance);
            links.insert(link_key(conn.from, conn.to), model);

            if let Some(a) = nodes.get_mut(&conn.from) {
                a.active_links.insert(conn.to);
            }
            if let Some(b) = nodes.get_mut(&conn.to) {
                b.active_links.insert(conn.from);
            }
        }

        // `Configuration::resolve_unknown_algorithms` has already mapped any
        // unrecognized name onto one of these two at load time, so these are
        // the only algorithms `Network` ever needs to construct.
        let mut scheduler: Box<dyn SchedulerPlugin> = Box::new(MinimalSharedCellScheduler);
        let routing: Box<dyn RoutingPlugin> = Box::new(FloodRouting);
        debug_assert_eq!(config.scheduling_algorithm, "minimal-shared-cell");
        debug_assert_eq!(config.routing_algorithm, "flood");

        let node_ids: Vec<NodeId> = nodes.keys().copied().collect();
        routing.initialize(&node_ids);
        scheduler.initialize();

        let association_cfg = AssociationConfig {
            keepalive_timeout_seconds: config.mac_keepalive_timeout_seconds,
            desync_threshold_seconds: config.mac_desync_threshold_seconds,
            max_join_priority: config.mac_max_join_priority,
            eb_period_seconds: config.mac_eb_period_seconds,
        };

        let mut timeline = Timeline::new(vec![config.mac_slot_duration_us as f64 / 1_000_000.0]);

        let mut rng = RandomSource::new(config.seed);
        let mut stats = HashMap::new();
        for id in &node_ids {
            let node = nodes.get_mut(id).expect("just inserted");
            scheduler.node_init(node);
            node.routing_state = Some(routing.new_routing_state(*id));
            stats.insert(*id, AggregateStats::default());

            if node.state.is_coordinator {
                node.state.has_joined = true;
                node.state.association = crate::node::AssociationState::Joined;
                node.state.join_priority = 0;
                if let Some(rs) = node.routing_state.as_mut() {
                    rs.start();
                }
                let jitter = association::eb_jitter_interval_seconds(&mut rng, association_cfg.eb_period_seconds);
                timeline.add_timer(jitter, false, NetworkEvent::EbEmission(*id))?;
            }

            timeline.add_timer(config.app_warmup_seconds, false, NetworkEvent::AppGenerate(*id))?;
        }
        timeline.add_timer(
            crate::neighbor::FRESHNESS_HALVING_PERIOD_SECONDS,
            true,
            NetworkEvent::FreshnessHalving,
        )?;
        timeline.add_timer(REASSEMBLY_SWEEP_PERIOD_SECONDS, true, NetworkEvent::ReassemblyExpirySweep)?;

        Ok(Self {
            timeline,
            nodes,
            links,
            scheduler,
            routing,
            rng,
            config,
            association_cfg,
            reassembly: HashMap::new(),
            frag_alloc: FragmentTagAllocator::default(),
            recent_seqnums: HashMap::new(),
            stats,
            app_seqnum: HashMap::new(),
        })
    }

    pub fn aggregate_stats(&self) -> AggregateStats {
        let mut total = AggregateStats::default();
        for s in self.stats.values() {
            total.merge(s);
        }
        total
    }

    /// Run one full MAC slot: the decide/transmit/resolve/ack machine, then
    /// advance the shared clock and dispatch any timers due.
    pub fn step(&mut self) {
        self.run_mac_slot();

        let nodes = &mut self.nodes;
        let rng = &mut self.rng;
        let config = &self.config;
        let association_cfg = &self.association_cfg;
        let reassembly = &mut self.reassembly;
        let stats = &mut self.stats;
        let app_seqnum = &mut self.app_seqnum;
        let scheduler = &mut self.scheduler;

        self.timeline.step(|tl, event| {
            Self::dispatch_event(tl, nodes, rng, config, association_cfg, reassembly, stats, app_seqnum, scheduler, event);
        });
    }

    fn dispatch_event(
        tl: &mut Timeline<NetworkEvent>,
        nodes: &mut IndexMap<NodeId, Node>,
        rng: &mut RandomSource,
        config: &Configuration,
        association_cfg: &AssociationConfig,
        reassembly: &mut HashMap<NodeId, ReassemblyTable>,
        stats: &mut HashMap<NodeId, AggregateStats>,
        app_seqnum: &mut HashMap<NodeId, u32>,
        scheduler: &mut Box<dyn SchedulerPlugin>,
        event: NetworkEvent,
    ) {
        match event {
            NetworkEvent::EbEmission(id) => {
                if let Some(node) = nodes.get_mut(&id) {
                    let joined = node.routing_state.as_ref().is_some_and(|rs| rs.is_joined());
                    let eb_empty = node.neighbors.get(&EB_VIRTUAL_ID).is_none_or(|n| n.queue.is_empty());
                    if association::should_emit_eb(eb_empty, joined, false, association_cfg.eb_period_seconds) {
                        let mut eb = Packet::new_broadcast(id, 0, config.mac_eb_packet_size);
                        eb.attributes.frame_type = crate::packet::FrameType::EnhancedBeacon;
                        eb.attributes.join_priority = Some(node.state.join_priority);
                        node.neighbor_mut(EB_VIRTUAL_ID).queue.push(QueuedPacket::new(eb));
                    }
                    let jitter = association::eb_jitter_interval_seconds(rng, association_cfg.eb_period_seconds);
                    let _ = tl.add_timer(jitter, false, NetworkEvent::EbEmission(id));
                }
            }
            NetworkEvent::Keepalive(id) => {
                if let Some(node) = nodes.get_mut(&id) {
                    let mut effects = Vec::new();
                    association::on_keepalive_timeout(&mut node.state, association_cfg, &mut effects);
                    Self::apply_association_effects(tl, id, &effects);
                }
            }
            NetworkEvent::Leave(id) => {
                if let Some(node) = nodes.get_mut(&id) {
                    let old_time_source = node.state.current_time_source;
                    let mut effects = Vec::new();
                    association::on_leave_timeout(&mut node.state, &mut effects);
                    let new_time_source = node.state.current_time_source;
                    if new_time_source != old_time_source {
                        scheduler.on_new_time_source(node, old_time_source, new_time_source);
                        if let Some(rs) = node.routing_state.as_mut() {
                            rs.on_new_time_source(old_time_source, new_time_source);
                        }
                    }
                    if let Some(rs) = node.routing_state.as_mut() {
                        rs.local_repair(false);
                    }
                    Self::apply_association_effects(tl, id, &effects);
                }
            }
            NetworkEvent::FreshnessHalving => {
                for node in nodes.values_mut() {
                    for neighbor in node.neighbors.values_mut() {
                        neighbor.halve_freshness();
                    }
                }
            }
            NetworkEvent::ReassemblyExpirySweep => {
                let now = tl.seconds();
                for (node_id, table) in reassembly.iter_mut() {
                    let expired = table.discard_expired(now, config.ip_reassembly_timeout_seconds);
                    if !expired.is_empty() {
                        if let Some(s) = stats.get_mut(node_id) {
                            for _ in &expired {
                                DropReason::Other.record_on(s);
                            }
                        }
                    }
                }
            }
            NetworkEvent::AppGenerate(id) => {
                if let Some(node) = nodes.get(&id) {
                    if !node.state.is_coordinator {
                        let seq = app_seqnum.entry(id).or_insert(0);
                        let value = *seq;
                        *seq += 1;
                        // Destination/next-hop resolution belongs to the
                        // routing plugin in a full multi-hop network; flood
                        // routing's only notion of "forward" is "not me", so
                        // the demo driver is responsible for wiring an actual
                        // destination before enqueueing.
                        let _ = value;
                    }
                }
                let _ = tl.add_timer(config.app_packet_period_seconds, true, NetworkEvent::AppGenerate(id));
            }
        }
    }

    fn apply_association_effects(tl: &mut Timeline<NetworkEvent>, node_id: NodeId, effects: &[AssociationEffect]) {
        for effect in effects {
            match effect {
                AssociationEffect::ArmKeepaliveTimer(seconds) => {
                    let _ = tl.add_timer(*seconds, false, NetworkEvent::Keepalive(node_id));
                }
                AssociationEffect::ArmLeaveTimer(seconds) => {
                    let _ = tl.add_timer(*seconds, false, NetworkEvent::Leave(node_id));
                }
                AssociationEffect::CancelLeaveTimer
                | AssociationEffect::StartEbEmission
                | AssociationEffect::StopEbEmission
                | AssociationEffect::ResumeScanning
                | AssociationEffect::InvokeLocalRepair => {
                    // No separate timer handle is tracked per node for these;
                    // a stale leave timer firing after a cure is a no-op
                    // (on_leave_timeout checks the current association state).
                }
            }
        }
    }

    /// Enqueue an application packet addressed to `destination_id`, applying
    /// fragmentation if it exceeds the MAC payload budget (§4.7). Returns
    /// `false` (and bumps the appropriate drop counter) if it could not be
    /// admitted at all.
    pub fn enqueue_app_packet(&mut self, source_id: NodeId, destination_id: NodeId, next_hop: NodeId, app_length: usize) -> bool {
        let seq = self.app_seqnum.entry(source_id).or_insert(0);
        let seqnum = *seq;
        *seq += 1;
        let mut packet = Packet::new_unicast(source_id, destination_id, next_hop, seqnum, app_length);

        // §6: the routing plugin may stamp the packet before the scheduler
        // gets a chance to pin or reject it (e.g. RPL would attach rank/DAG
        // info here; `FloodRouting` has nothing to add).
        {
            let Some(node) = self.nodes.get_mut(&source_id) else { return false };
            if let Some(rs) = node.routing_state.as_mut() {
                rs.on_prepare_tx_packet(&mut packet);
            }
            if !self.scheduler.on_packet_ready(node, &mut packet) {
                DropReason::NoSchedule.record_on(self.stats.entry(source_id).or_default());
                return false;
            }
        }

        // §4.7: the fragment size cap is MAC_MAX_PACKET_SIZE itself, not that
        // value net of the link-layer header — MAC_HEADER_SIZE governs
        // on-wire framing overhead, not the IP-layer fragmentation threshold.
        let max_fragment = self.config.mac_max_packet_size.max(1);
        let fragments = if self.config.ip_fragmentation_enabled && app_length > max_fragment {
            let tag = self.frag_alloc.next_tag(source_id);
            packet.split_into_fragments(max_fragment, tag)
        } else if app_length > max_fragment {
            self.stats.entry(source_id).or_default();
            DropReason::Other.record_on(self.stats.get_mut(&source_id).expect("just inserted"));
            return false;
        } else {
            vec![packet]
        };

        let Some(node) = self.nodes.get_mut(&source_id) else {
            return false;
        };
        let mut all_admitted = true;
        for fragment in fragments {
            let admitted = node.neighbor_mut(next_hop).queue.push(QueuedPacket::new(fragment));
            if !admitted {
                all_admitted = false;
                DropReason::QueueFull.record_on(self.stats.entry(source_id).or_default());
            }
        }
        all_admitted
    }

    /// Administratively remove the link between `a` and `b` in both
    /// directions, as if the two nodes had moved out of range or the
    /// hardware failed outright. No further transmission between them is
    /// attempted; neither side's association state is touched directly —
    /// the usual keepalive/desync timers are what notice (§4.6).
    pub fn disable_link(&mut self, a: NodeId, b: NodeId) -> bool {
        self.links.remove(&link_key(a, b)).is_some()
    }

    /// Phase A (decide) + Phase B (transmit) + Phase C (resolve reception) +
    /// Phase D (ack), run once per slot before the clock advances (§4.4).
    fn run_mac_slot(&mut self) {
        let asn = self.timeline.asn();
        let now = self.timeline.seconds();

        // §4.2: `Trace` links replay their scripted success-rate/RSSI
        // timeline as simulated time passes, independent of any send
        // attempt this slot.
        for link in self.links.values_mut() {
            link.advance_time(now);
        }

        let params = ScheduleParams {
            now_seconds: now,
            channel_scan_duration_seconds: self.config.mac_channel_scan_duration_seconds,
            join_hopping_sequence: &self.config.mac_hopping_sequence,
        };

        let node_ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        // §5: built and consumed in node-insertion order, not hash order, so
        // every `try_send`/backoff draw against the single shared `self.rng`
        // happens in the same sequence on every run of the same seed+config.
        let mut decisions = IndexMap::new();
        for &id in &node_ids {
            let outcome = {
                let node = self.nodes.get_mut(&id).expect("known id");
                node.schedule(asn, &params, &mut self.rng)
            };
            if outcome.decision == Decision::Scan {
                if let Some(s) = self.stats.get_mut(&id) {
                    s.stats_slots_rx_scanning += 1;
                }
            }
            decisions.insert(id, outcome);
        }

        // Phase B: transmit. Each transmitting node peeks (not pops) its
        // chosen neighbor's queue head and attempts delivery to every
        // receiving node reachable on the same channel offset this slot.
        let mut tx_attempts: IndexMap<NodeId, (NodeId, Packet, u8)> = IndexMap::new();
        for (&tx_id, outcome) in decisions.iter() {
            if outcome.decision != Decision::Tx {
                continue;
            }
            let Some(tx_neighbor_id) = outcome.tx_neighbor_id else { continue };
            let Some(channel_offset) = outcome.channel_offset else { continue };
            let packet = {
                let node = self.nodes.get_mut(&tx_id).expect("known id");
                let Some(neighbor) = node.neighbors.get(&tx_neighbor_id) else { continue };
                let Some(qp) = neighbor.queue.front() else { continue };
                qp.packet.clone()
            };

            // A scanning (not-yet-joined) node is still listening on its
            // current scan channel offset — it must be reachable by EBs or
            // it could never associate (§4.6). It cannot receive ordinary
            // unicast data, since nothing has pinned a cell to it yet.
            let receivers: Vec<NodeId> = decisions
                .iter()
                .filter(|(&rid, rout)| {
                    rid != tx_id
                        && rout.channel_offset == Some(channel_offset)
                        && match rout.decision {
                            Decision::Rx => true,
                            Decision::Scan => packet.attributes.frame_type == crate::packet::FrameType::EnhancedBeacon,
                            _ => false,
                        }
                })
                .filter(|(&rid, _)| packet.next_hop == BROADCAST_ID || packet.next_hop == rid)
                .filter(|(&rid, _)| self.links.contains_key(&link_key(tx_id, rid)))
                .map(|(&rid, _)| rid)
                .collect();

            let mut attempted = packet.clone();
            attempted.num_transmissions += 1;
            for rid in receivers {
                let key = link_key(tx_id, rid);
                let link = self.links.get_mut(&key).expect("filtered to existing links");
                let ok = link.try_send(&mut self.rng, channel_offset);
                let rssi = link.last_rssi();
                attempted.record_outcome(rid, rssi, ok);
                let receiver_node = self.nodes.get_mut(&rid).expect("known id");
                let subslot = 0usize.min(receiver_node.rx_ok.len().saturating_sub(1));
                if ok {
                    receiver_node.rx_ok[subslot].push((tx_id, attempted.clone()));
                } else {
                    receiver_node.rx_failed[subslot].push((tx_id, rssi));
                }
            }
            tx_attempts.insert(tx_id, (tx_neighbor_id, attempted, channel_offset));
        }

        // Phase C: resolve reception with a simplified capture effect — the
        // highest-RSSI successful candidate wins unless a competing signal
        // (successful or not) comes within `PHY_CO_CHANNEL_REJECTION_DB`, in
        // which case no one is delivered. Every `rx_ok` sender that isn't
        // the delivered winner counts as a MAC-level collision, whether or
        // not capture succeeded.
        let mut ack_grants: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for &rid in &node_ids {
            let (winner, collisions) = {
                let node = self.nodes.get(&rid).expect("known id");
                Self::resolve_capture(node, self.config.phy_co_channel_rejection_db)
            };
            if collisions > 0 {
                if let Some(s) = self.stats.get_mut(&rid) {
                    s.mac_rx_collision += collisions;
                }
            }
            if let Some((sender_id, packet)) = winner {
                let grant_ack = self.deliver_packet(rid, sender_id, packet, now);
                if grant_ack {
                    ack_grants.entry(sender_id).or_default().push(rid);
                }
            }
            if let Some(node) = self.nodes.get_mut(&rid) {
                node.clear_subslot_buffers();
            }
        }

        // Phase D: ack. A receiver that successfully received a unicast
        // frame grants the sender a shot at an ack; per §4.4 the ack itself
        // is a one-shot `try_send` on the reverse link (no collisions
        // modeled), so forward delivery alone does not guarantee an ack.
        for (&tx_id, (neighbor_id, attempted, channel_offset)) in tx_attempts.iter() {
            let ack_required = attempted.is_ack_required;
            let forward_granted = ack_required && ack_grants.get(&tx_id).is_some_and(|v| v.contains(neighbor_id));
            let acked = forward_granted
                && match self.links.get_mut(&link_key(tx_id, *neighbor_id)) {
                    Some(link) => link.try_send(&mut self.rng, *channel_offset),
                    None => false,
                };
            let resolved = acked || !ack_required;

            let node = self.nodes.get_mut(&tx_id).expect("known id");
            if ack_required {
                if let Some(s) = self.stats.get_mut(&tx_id) {
                    s.mac_tx_unicast += 1;
                    if acked {
                        s.mac_acked += 1;
                    }
                }
            }
            let exhausted = attempted.num_transmissions >= self.config.mac_max_retries;
            let is_shared = node
                .slotframes
                .iter()
                .flat_map(|sf| sf.cells().iter())
                .any(|c| c.neighbor_id == Some(*neighbor_id) && c.options.is_shared());

            // §6: the scheduler/routing plugins observe every TX attempt's
            // outcome, not just ones that finally resolve the queue head —
            // Orchestra-style cell negotiation or RPL's ETX tracking needs to
            // see every retry, acked or not.
            self.scheduler.on_tx(node, attempted, resolved);
            if let Some(rs) = node.routing_state.as_mut() {
                rs.on_tx(*neighbor_id, attempted, resolved, ack_required, None);
            }

            if resolved || exhausted {
                if let Some(qp) = node.neighbor_mut(*neighbor_id).queue.pop_front() {
                    let ok = resolved;
                    if !resolved && exhausted {
                        DropReason::TxLimitExceeded.record_on(self.stats.entry(tx_id).or_default());
                    }
                    qp.resolve(ok);
                }
                let neighbor = node.neighbor_mut(*neighbor_id);
                if is_shared {
                    if resolved {
                        neighbor.reset_backoff(self.config.mac_min_be);
                    } else {
                        neighbor.apply_backoff_failure(self.config.mac_max_be, &mut self.rng);
                    }
                }
                neighbor.record_tx_outcome(now, attempted.num_transmissions, resolved);
            } else {
                if let Some(qp) = node.neighbor_mut(*neighbor_id).queue.front_mut() {
                    qp.packet.num_transmissions = attempted.num_transmissions;
                }
                let neighbor = node.neighbor_mut(*neighbor_id);
                if is_shared {
                    neighbor.apply_backoff_failure(self.config.mac_max_be, &mut self.rng);
                }
                neighbor.record_tx_outcome(now, attempted.num_transmissions, false);
            }
        }

        // Decrement CSMA backoff windows for everyone with a pending window,
        // independent of whether they transmitted this slot (§4.5).
        for node in self.nodes.values_mut() {
            for neighbor in node.neighbors.values_mut() {
                neighbor.decrement_backoff_window();
            }
        }
    }

    /// Pick the winning `(sender, packet)` among everything a node's Phase B
    /// buckets recorded this slot, plus the number of MAC-level collisions
    /// to record this resolution (§4.4 Phase C: "all other rx_ok at this
    /// receiver/subslot are counted as MAC-level collisions" when capture
    /// succeeds; if no signal clearly dominates, none of the candidates are
    /// delivered and all of them count as collisions instead).
    fn resolve_capture(node: &Node, rejection_db: f64) -> (Option<(NodeId, Packet)>, u64) {
        let mut candidates: Vec<(NodeId, Packet, f64)> = Vec::new();
        for bucket in &node.rx_ok {
            for (sender, packet) in bucket {
                if let Some(outcome) = packet.outcome_for(node.id) {
                    candidates.push((*sender, packet.clone(), outcome.rssi_dbm));
                }
            }
        }
        let mut interferers: Vec<f64> = Vec::new();
        for bucket in &node.rx_failed {
            for (_, rssi) in bucket {
                interferers.push(*rssi);
            }
        }

        if candidates.is_empty() {
            return (None, 0);
        }
        if candidates.len() == 1 && interferers.is_empty() {
            let (sender, packet, _) = candidates.into_iter().next().expect("len == 1");
            return (Some((sender, packet)), 0);
        }
        candidates.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
        let (winner_sender, winner_packet, winner_rssi) = candidates[0].clone();

        let strongest_other = candidates[1..]
            .iter()
            .map(|c| c.2)
            .chain(interferers.iter().copied())
            .fold(f64::NEG_INFINITY, f64::max);

        let captured = !strongest_other.is_finite() || winner_rssi - strongest_other > rejection_db.abs();
        if captured {
            (Some((winner_sender, winner_packet)), (candidates.len() - 1) as u64)
        } else {
            (None, candidates.len() as u64)
        }
    }

    /// Act on a single resolved reception: dispatch EBs to the association
    /// state machine, deliver app-destined packets (reassembling fragments
    /// first), or forward onward per the routing plugin. Returns whether the
    /// forward delivery succeeded well enough to attempt a MAC-layer ack
    /// this slot — Phase D still has to win a one-shot reverse-link
    /// `try_send` before the ack actually counts (§4.4 Phase D).
    fn deliver_packet(&mut self, receiver_id: NodeId, sender_id: NodeId, packet: Packet, now: f64) -> bool {
        let dedup_key = (packet.source_id, packet.seqnum);
        let recent = self.recent_seqnums.entry(receiver_id).or_default();
        if recent.contains(&dedup_key) {
            return packet.is_ack_required;
        }
        recent.push_back(dedup_key);
        while recent.len() > self.config.num_recent_link_layer_seqnums {
            recent.pop_front();
        }

        let node = self.nodes.get_mut(&receiver_id).expect("known id");
        let bootstrap_rssi = packet.outcome_for(receiver_id).map(|o| o.rssi_dbm).unwrap_or(-80.0);
        let is_new_neighbor = !node.neighbors.contains_key(&sender_id);
        let neighbor = node.neighbor_mut(sender_id);
        if is_new_neighbor {
            neighbor.etx_scaled = bootstrap_etx_from_rssi(bootstrap_rssi);
        }
        neighbor.record_rx(now, bootstrap_rssi);

        match packet.attributes.frame_type {
            crate::packet::FrameType::EnhancedBeacon => {
                let join_priority = packet.attributes.join_priority.unwrap_or(u8::MAX);
                let old_time_source = node.state.current_time_source;
                let mut effects = Vec::new();
                association::on_eb_received(&mut node.state, &self.association_cfg, sender_id, join_priority, &mut effects);
                let new_time_source = node.state.current_time_source;
                if new_time_source != old_time_source {
                    self.scheduler.on_new_time_source(node, old_time_source, new_time_source);
                    if let Some(rs) = node.routing_state.as_mut() {
                        // First association (no prior time source): the routing
                        // layer's own join hook, mirroring the coordinator's
                        // construction-time `start()` call for non-coordinators.
                        if old_time_source.is_none() {
                            rs.start();
                        }
                        rs.on_new_time_source(old_time_source, new_time_source);
                    }
                }
                Self::apply_association_effects(&mut self.timeline, receiver_id, &effects);
                false
            }
            crate::packet::FrameType::Ack => false,
            crate::packet::FrameType::Data => {
                let mut effects = Vec::new();
                if Some(sender_id) == node.state.current_time_source {
                    association::on_sync_refresh(&mut node.state, &self.association_cfg, &mut effects);
                }
                Self::apply_association_effects(&mut self.timeline, receiver_id, &effects);

                if packet.destination_id == receiver_id {
                    let whole = if packet.fragment.is_some() {
                        self.reassembly.entry(receiver_id).or_default().on_fragment(packet, now)
                    } else {
                        Some(packet)
                    };
                    if let Some(whole) = whole {
                        let stats = self.stats.entry(receiver_id).or_default();
                        stats.app_packets_rxed += 1;
                        stats.app_num_endpoint_rx += 1;
                        let _ = whole;
                    }
                    true
                } else if packet.destination_id == BROADCAST_ID {
                    true
                } else {
                    let mut forwarded = packet.clone();
                    let should_forward = node
                        .routing_state
                        .as_mut()
                        .map(|rs| rs.on_forward(&packet, &mut forwarded))
                        .unwrap_or(false);
                    if should_forward {
                        let next_hop = forwarded.next_hop;
                        let admitted = node.neighbor_mut(next_hop).queue.push(QueuedPacket::new(forwarded));
                        if !admitted {
                            DropReason::QueueFull.record_on(self.stats.entry(receiver_id).or_default());
                        }
                    } else {
                        DropReason::NoRoute.record_on(self.stats.entry(receiver_id).or_default());
                    }
                    true
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Configuration, Topology, TopologyConnection, TopologyNode};
    use crate::link_model::{ConnectionSpec, LinkModelKind};

    fn fixed_link(success_rate: f64) -> ConnectionSpec {
        ConnectionSpec {
            kind: LinkModelKind::Fixed,
            tx_power_dbm: 0.0,
            fixed_success_rate: Some(success_rate),
            udgm_range_m: 50.0,
            path_loss_exponent: 2.0,
            shadowing_sigma_db: 0.0,
            path_loss_at_reference_db: 40.0,
            sensitivity_dbm: -97.0,
            logistic_inflection_dbm: -90.0,
            logistic_steepness: 0.2,
            trace_events: vec![],
        }
    }

    fn two_node_topology(success_rate: f64) -> Topology {
        Topology {
            nodes: vec![
                TopologyNode { id: 1, x: 0.0, y: 0.0, is_coordinator: true },
                TopologyNode { id: 2, x: 1.0, y: 0.0, is_coordinator: false },
            ],
            connections: vec![TopologyConnection { from: 1, to: 2, spec: fixed_link(success_rate) }],
        }
    }

    fn test_config() -> Configuration {
        Configuration {
            duration_seconds: 60.0,
            mac_eb_period_seconds: 1.0,
            app_warmup_seconds: 2.0,
            ..Configuration::default()
        }
    }

    #[test]
    fn node_two_joins_via_eb_from_coordinator() {
        let mut network = Network::new(test_config(), &two_node_topology(1.0)).unwrap();
        for _ in 0..2000 {
            network.step();
            if network.nodes[&2].state.has_joined {
                break;
            }
        }
        assert!(network.nodes[&2].state.has_joined, "node 2 never joined after 2000 slots");
    }

    #[test]
    fn perfect_channel_unicast_is_delivered_and_acked() {
        let mut network = Network::new(test_config(), &two_node_topology(1.0)).unwrap();
        for _ in 0..2000 {
            network.step();
            if network.nodes[&2].state.has_joined {
                break;
            }
        }
        assert!(network.enqueue_app_packet(1, 2, 2, 20));
        for _ in 0..500 {
            network.step();
        }
        let stats = network.aggregate_stats();
        assert_eq!(stats.app_packets_rxed, 1);
        assert!(stats.mac_acked >= 1);
    }

    #[test]
    fn lossy_channel_eventually_exhausts_retries() {
        let mut network = Network::new(test_config(), &two_node_topology(0.0)).unwrap();
        for _ in 0..2000 {
            network.step();
            if network.nodes[&2].state.has_joined {
                break;
            }
        }
        assert!(network.enqueue_app_packet(1, 2, 2, 20));
        for _ in 0..500 {
            network.step();
        }
        let stats = network.aggregate_stats();
        assert_eq!(stats.app_packets_rxed, 0);
        assert!(stats.app_num_tx_limit_drops >= 1);
    }
}

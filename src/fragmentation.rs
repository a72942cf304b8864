//! Application-layer fragmentation and reassembly (§4.7).

use crate::packet::{NodeId, Packet};
use std::collections::HashMap;

/// Per-sender monotonic fragment tag counter, handed out on enqueue.
#[derive(Default)]
pub struct FragmentTagAllocator {
    next_tag: HashMap<NodeId, u32>,
}

impl FragmentTagAllocator {
    pub fn next_tag(&mut self, sender_id: NodeId) -> u32 {
        let tag = self.next_tag.entry(sender_id).or_insert(0);
        let value = *tag;
        *tag = tag.wrapping_add(1);
        value
    }
}

struct ReassemblyContext {
    fragments: Vec<Option<Packet>>,
    received_count: u16,
    armed_at_seconds: f64,
}

/// Reassembly state keyed by `(source_id, tag)`, with a timeout armed on
/// the first fragment of each context.
#[derive(Default)]
pub struct ReassemblyTable {
    contexts: HashMap<(NodeId, u32), ReassemblyContext>,
}

impl ReassemblyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed in one fragment. Returns the synthesized whole packet once every
    /// index `[0, total)` has arrived; returns `None` (and keeps the
    /// context pending) otherwise. Panics if `fragment.fragment` is `None` —
    /// callers must only route fragmented packets here.
    pub fn on_fragment(&mut self, fragment: Packet, now_seconds: f64) -> Option<Packet> {
        let fd = fragment.fragment.expect("on_fragment requires a fragment descriptor");
        let key = (fragment.source_id, fd.tag);
        let context = self.contexts.entry(key).or_insert_with(|| ReassemblyContext {
            fragments: vec![None; fd.total as usize],
            received_count: 0,
            armed_at_seconds: now_seconds,
        });

        let slot = &mut context.fragments[fd.index as usize];
        if slot.is_none() {
            *slot = Some(fragment);
            context.received_count += 1;
        }

        if context.received_count as usize != context.fragments.len() {
            return None;
        }

        let context = self.contexts.remove(&key).expect("just looked up above");
        Some(reassemble(context.fragments))
    }

    /// Drop every context whose first fragment arrived at least
    /// `timeout_seconds` ago. Returns the dropped `(source_id, tag)` keys so
    /// the caller can bump a drop counter per key.
    pub fn discard_expired(&mut self, now_seconds: f64, timeout_seconds: f64) -> Vec<(NodeId, u32)> {
        let expired: Vec<(NodeId, u32)> = self
            .contexts
            .iter()
            .filter(|(_, ctx)| now_seconds - ctx.armed_at_seconds >= timeout_seconds)
            .map(|(k, _)| *k)
            .collect();
        for key in &expired {
            self.contexts.remove(key);
        }
        expired
    }

    pub fn pending_contexts(&self) -> usize {
        self.contexts.len()
    }
}

fn reassemble(fragments: Vec<Option<Packet>>) -> Packet {
    let mut total_length = 0usize;
    let mut whole: Option<Packet> = None;
    for fragment in fragments.into_iter().flatten() {
        total_length += fragment.app_length;
        if whole.is_none() {
            whole = Some(fragment);
        }
    }
    let mut whole = whole.expect("caller only invokes reassemble once all fragments are present");
    whole.app_length = total_length;
    whole.fragment = None;
    whole
}

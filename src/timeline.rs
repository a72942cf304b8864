//! Deterministic timeline: Absolute Slot Number advancement and the timer heap.
//!
//! A single [`Timeline`] backs all time queries for a [`crate::network::Network`].
//! It owns no knowledge of what a fired timer *means* — that's left to the
//! caller of [`Timeline::step`], which receives the fired payloads in heap
//! order and may itself schedule more timers before the step finishes.

use crate::heap::{HeapHandle, IndexedHeap};
use std::cmp::Ordering;

/// Opaque handle returned by [`Timeline::add_timer`]; pass back to
/// [`Timeline::remove_timer`] to cancel. Cancelling an already-fired timer
/// is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(HeapHandle);

struct TimerRecord<E> {
    fire_at: f64,
    interval: f64,
    is_periodic: bool,
    /// Insertion sequence, used only to break exact `fire_at` ties in FIFO order.
    seq: u64,
    payload: E,
}

/// Advances an Absolute Slot Number and a real-seconds clock through a cyclic
/// table of per-slot durations, dispatching a priority queue of timers each
/// step.
///
/// Invariant (checked by tests, not at runtime): `seconds` always equals the
/// sum of `slot_timings[i mod len]` over `i` in `[0, asn)`.
pub struct Timeline<E: Clone> {
    asn: u64,
    seconds: f64,
    slot_timings: Vec<f64>,
    heap: IndexedHeap<TimerRecord<E>>,
    next_seq: u64,
}

impl<E: Clone + 'static> Timeline<E> {
    /// Construct a timeline with the given per-slot duration table. The
    /// table must contain at least one entry; all entries must be finite
    /// and positive, or slots would never advance (or would advance
    /// backwards).
    pub fn new(slot_timings: Vec<f64>) -> Self {
        assert!(!slot_timings.is_empty(), "slot_timings must have at least one entry");
        assert!(slot_timings.iter().all(|d| d.is_finite() && *d > 0.0), "slot durations must be finite and positive");
        Self {
            asn: 0,
            seconds: 0.0,
            slot_timings,
            heap: IndexedHeap::new(timer_less_than),
            next_seq: 0,
        }
    }

    pub fn asn(&self) -> u64 {
        self.asn
    }

    pub fn seconds(&self) -> f64 {
        self.seconds
    }

    /// Clear the heap and reset ASN/seconds to zero. The slot-timing table is
    /// preserved (it comes from configuration, not runtime state).
    pub fn reset(&mut self) {
        self.asn = 0;
        self.seconds = 0.0;
        self.heap = IndexedHeap::new(timer_less_than);
        self.next_seq = 0;
    }

    /// Duration of the slot the timeline is currently about to enter.
    fn current_slot_duration(&self) -> f64 {
        self.slot_timings[(self.asn as usize) % self.slot_timings.len()]
    }

    /// Predict the next slot boundary without advancing the timeline.
    pub fn get_next_seconds(&self) -> f64 {
        self.seconds + self.current_slot_duration()
    }

    /// Schedule `payload` to fire after `interval` seconds from now. Fails
    /// only if `interval` is not finite.
    pub fn add_timer(&mut self, interval: f64, is_periodic: bool, payload: E) -> Result<TimerHandle, String> {
        if !interval.is_finite() {
            return Err(format!("timer interval must be finite, got {interval}"));
        }
        let fire_at = self.seconds + interval;
        Ok(self.push_timer(fire_at, interval, is_periodic, payload))
    }

    fn push_timer(&mut self, fire_at: f64, interval: f64, is_periodic: bool, payload: E) -> TimerHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        let handle = self.heap.push(TimerRecord {
            fire_at,
            interval,
            is_periodic,
            seq,
            payload,
        });
        TimerHandle(handle)
    }

    /// Cancel a previously scheduled timer. Returns `true` if it was still
    /// pending (and is now removed); `false` if it had already fired or was
    /// already cancelled.
    pub fn remove_timer(&mut self, handle: TimerHandle) -> bool {
        self.heap.remove(handle.0).is_some()
    }

    /// Advance the timeline by one slot and dispatch every timer whose
    /// `fire_at` falls at or before the new `seconds`.
    ///
    /// `handler` is invoked once per fired timer, in heap order (earliest
    /// `fire_at`, ties broken by insertion order). It receives `&mut self`
    /// so it may itself call [`Timeline::add_timer`]/[`Timeline::remove_timer`];
    /// any newly added timer due at or before the current `seconds` is still
    /// picked up within this same `step` call. Periodic timers are
    /// re-inserted only after every timer due in this step (including ones
    /// added by the handler) has fired, at `original_fire_at + interval` —
    /// this preserves cadence even if the handler runs long enough that
    /// `seconds + interval` would have produced drift.
    pub fn step<F: FnMut(&mut Self, E)>(&mut self, mut handler: F) {
        let next_seconds = self.seconds + self.current_slot_duration();
        self.seconds = next_seconds;
        self.asn += 1;

        let mut to_reinsert: Vec<(f64, f64, E)> = Vec::new();
        loop {
            let due = match self.heap.peek_min() {
                Some(t) => t.fire_at <= self.seconds,
                None => false,
            };
            if !due {
                break;
            }
            let timer = self.heap.pop_min().expect("peeked Some above");
            if timer.is_periodic {
                to_reinsert.push((timer.fire_at + timer.interval, timer.interval, timer.payload.clone()));
            }
            handler(self, timer.payload);
        }

        for (fire_at, interval, payload) in to_reinsert {
            self.push_timer(fire_at, interval, true, payload);
        }
    }
}

fn timer_less_than<E>(a: &TimerRecord<E>, b: &TimerRecord<E>) -> bool {
    match a.fire_at.partial_cmp(&b.fire_at) {
        Some(Ordering::Less) => true,
        Some(Ordering::Greater) => false,
        _ => a.seq < b.seq,
    }
}

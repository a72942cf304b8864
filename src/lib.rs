//! Deterministic discrete-event core for a TSCH wireless-network simulator.
//!
//! This crate implements the four tightly coupled subsystems described in
//! the design: a timeline/timer heap advancing an Absolute Slot Number, the
//! per-slot node schedule decision, the radio medium simulation for one
//! slot (capture effect included), and the link-layer completion protocol
//! (ACK/backoff/retransmission). Configuration parsing, the CLI, result
//! writers, and any specific routing/scheduling algorithm implementation
//! are out of scope; this crate only provides the plugin traits they
//! attach to (see [`plugin`]).
//!
//! [`network::Network`] is the top-level entry point: construct one from a
//! [`config::Configuration`] and [`config::Topology`], then call
//! [`network::Network::step`] once per slot.

pub mod association;
pub mod config;
pub mod error;
pub mod fragmentation;
pub mod heap;
pub mod link_model;
pub mod neighbor;
pub mod network;
pub mod node;
pub mod packet;
pub mod plugin;
pub mod random;
pub mod schedule;
pub mod stats;
pub mod timeline;

pub use config::{Configuration, Topology};
pub use network::Network;
pub use stats::AggregateStats;

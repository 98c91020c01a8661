//! Real-time peri-stimulus time histogram (PSTH) engine.
//!
//! Aligns incoming spike times with trigger events (TTL pulses or broadcast
//! messages), bins the resulting offsets, and maintains running per-bin
//! counts across repeated trials.

pub mod config;
pub mod processing;
pub mod utils;

pub use processing::psth_processor::PsthProcessor;
pub use processing::triggers::{TriggerSource, TriggerSourceRegistry, TriggerType};
pub use processing::{ChannelId, ChannelInfo, StreamId};

//! Core logic: per-flow accounting, sampling, classification bookkeeping.
//!
//! - [`flow_table`]: lock-free per-flow rows updated on every packet
//! - [`monitor`]: periodic shortlist, promotion, draining and migration
//! - [`sampling`]: timer-driven sampling state machine and quotas
//! - [`classified`]: classified flows, retirement and activity tracking
//! - [`peer`]: per-peer traffic counters and active traffic indications
//! - [`stats`]: running min/max helpers shared by the above

pub mod classified;
pub mod flow_table;
pub mod monitor;
pub mod peer;
pub mod sampling;
pub mod stats;
pub mod tuple;

pub use classified::{FlowEvent, FlowReport};
pub use flow_table::{FlowRef, FlowTable};
pub use peer::{ActiveTrafficMap, MacAddr};
pub use sampling::{SampleCategory, SamplingState};
pub use tuple::{Direction, FlowTuple, TrafficType};

//! Flow sampling and traffic classification engine.
//!
//! The packet path calls [`StcEngine::track`] for every tracked packet. A
//! periodic monitor picks busy flows, a sampling timer records per-window
//! statistics for them, and an external classifier answers with a
//! [`TrafficType`] that ends up in per-peer active traffic indications.

pub mod channel;
pub mod clock;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod services;

pub use channel::{ClassificationResult, MpscReporter, SampleReport, StcMessage, StcReporter};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::StcConfig;
pub use core::{ActiveTrafficMap, Direction, FlowEvent, FlowReport, FlowTuple, MacAddr, TrafficType};
pub use engine::{attach, StcEngine};
pub use error::StcError;

/// Install a `tracing` subscriber honouring `RUST_LOG`, defaulting to `stc=info`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stc=info".into()),
        )
        .try_init();
}

//! Message channels between the engine and its collaborators.
//!
//! Outbound reports go through the [`StcReporter`] trait so the engine never
//! knows how they travel:
//! - tokio mpsc (`mpsc_backend`), the default for in-process classifiers
//!
//! Inbound classification results arrive as [`ClassificationResult`] values.

pub mod mpsc_backend;

use serde::{Deserialize, Serialize};

use crate::core::classified::FlowReport;
use crate::core::peer::ActiveTrafficMap;
use crate::core::sampling::{ReadinessFlags, SamplePayload};
use crate::core::tuple::{FlowTuple, TrafficType};
use crate::error::StcError;

pub use mpsc_backend::MpscReporter;

/// A finished sample plus the readiness flags it satisfies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SampleReport {
    pub payload: SamplePayload,
    pub flags: ReadinessFlags,
}

/// Everything the engine publishes, as a single stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StcMessage {
    Sample(SampleReport),
    Flow(FlowReport),
    ActiveTraffic(ActiveTrafficMap),
}

/// Verdict returned by the classifier for a sampled flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub tuple: FlowTuple,
    pub traffic_type: TrafficType,
}

/// Best-effort outbound channel. A failed send is logged by the caller and
/// never retried or rolled back.
pub trait StcReporter: Send + Sync {
    /// Whether a classifier is listening at all. `attach` is a no-op otherwise.
    fn is_available(&self) -> bool {
        true
    }

    fn send_sample_report(&self, report: SampleReport) -> Result<(), StcError>;

    fn send_flow_report(&self, report: FlowReport) -> Result<(), StcError>;

    fn send_active_traffic_map(&self, map: ActiveTrafficMap) -> Result<(), StcError>;
}

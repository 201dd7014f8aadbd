//! Unified error type for every engine entry point.
//!
//! `StcError` is returned by the ingress, lifecycle and attach hooks. None of
//! these errors ever reach the packet path as a drop decision: the worst outcome
//! is that a flow is not sampled or classified.

use crate::core::tuple::Direction;

/// Engine-level error.
///
/// Each variant maps to a distinct failure domain. Capacity exhaustion is not an
/// error; it only means a flow is skipped for the current pass.
#[derive(Debug, thiserror::Error)]
pub enum StcError {
    /// A hook was called before `attach` or after `detach`.
    #[error("engine is not attached")]
    NotAttached,

    /// The supplied configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A fixed pool could not be reserved during attach.
    #[error("failed to allocate {0}")]
    Allocation(String),

    /// Flow id outside the flow table for the given direction.
    #[error("flow id {flow_id} out of range for {direction} table (capacity {capacity})")]
    InvalidFlowId {
        direction: Direction,
        flow_id: u32,
        capacity: usize,
    },

    /// Peer id outside the peer map.
    #[error("peer id {0} out of range")]
    InvalidPeerId(u16),

    /// `on_peer_map` for a slot that is already mapped.
    #[error("peer {0} is already mapped")]
    PeerAlreadyMapped(u16),

    /// `on_peer_unmap` for a slot that is not mapped.
    #[error("peer {0} is not mapped")]
    PeerNotMapped(u16),

    /// `on_peer_unmap` with a MAC that differs from the mapped one.
    #[error("peer {0} MAC mismatch on unmap")]
    PeerMacMismatch(u16),

    /// Classified flow id outside the classified table.
    #[error("classified flow id {0} out of range")]
    InvalidClassifiedId(u32),

    /// The outbound channel rejected a message.
    #[error("report channel: {0}")]
    Report(String),
}

impl StcError {
    /// Returns the error kind as a string matching the variant name.
    pub fn kind(&self) -> &'static str {
        match self {
            StcError::NotAttached => "NotAttached",
            StcError::InvalidConfig(_) => "InvalidConfig",
            StcError::Allocation(_) => "Allocation",
            StcError::InvalidFlowId { .. } => "InvalidFlowId",
            StcError::InvalidPeerId(_) => "InvalidPeerId",
            StcError::PeerAlreadyMapped(_) => "PeerAlreadyMapped",
            StcError::PeerNotMapped(_) => "PeerNotMapped",
            StcError::PeerMacMismatch(_) => "PeerMacMismatch",
            StcError::InvalidClassifiedId(_) => "InvalidClassifiedId",
            StcError::Report(_) => "Report",
        }
    }
}

impl From<std::collections::TryReserveError> for StcError {
    fn from(err: std::collections::TryReserveError) -> Self {
        StcError::Allocation(err.to_string())
    }
}

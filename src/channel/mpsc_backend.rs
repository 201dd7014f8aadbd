//! Reporter backed by a bounded tokio mpsc channel.
//!
//! Sends use `try_send`, so the periodic monitor never waits on a slow
//! consumer: a full or closed channel turns into `StcError::Report`.

use tokio::sync::mpsc;

use super::{SampleReport, StcMessage, StcReporter};
use crate::core::classified::FlowReport;
use crate::core::peer::ActiveTrafficMap;
use crate::error::StcError;

pub struct MpscReporter {
    tx: mpsc::Sender<StcMessage>,
}

impl MpscReporter {
    /// Create a reporter and the receiving end the classifier/firmware side reads.
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<StcMessage>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self { tx }, rx)
    }

    fn push(&self, msg: StcMessage) -> Result<(), StcError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => StcError::Report("channel full".into()),
            mpsc::error::TrySendError::Closed(_) => StcError::Report("channel closed".into()),
        })
    }
}

impl StcReporter for MpscReporter {
    fn is_available(&self) -> bool {
        !self.tx.is_closed()
    }

    fn send_sample_report(&self, report: SampleReport) -> Result<(), StcError> {
        self.push(StcMessage::Sample(report))
    }

    fn send_flow_report(&self, report: FlowReport) -> Result<(), StcError> {
        self.push(StcMessage::Flow(report))
    }

    fn send_active_traffic_map(&self, map: ActiveTrafficMap) -> Result<(), StcError> {
        self.push(StcMessage::ActiveTraffic(map))
    }
}

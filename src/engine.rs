//! The engine handle and its collaborator-facing entry points.
//!
//! `attach` builds every fixed pool up front and returns an `Arc<StcEngine>`.
//! All hooks take `&self`; the packet path only touches its own flow row, while
//! the monitor, the sampling timer and the result handler share the sampling
//! and classified tables behind mutexes the packet path never takes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;

use crate::channel::{ClassificationResult, StcReporter};
use crate::clock::Clock;
use crate::config::StcConfig;
use crate::core::classified::{ClassifiedSignals, ClassifiedTable};
use crate::core::flow_table::{BurstThresholds, FlowTable};
use crate::core::peer::{MacAddr, PeerTrafficMap};
use crate::core::sampling::{SampleCategory, SamplingQuotas, SamplingState, SamplingTable};
use crate::core::tuple::{Direction, FlowTuple, TrafficType};
use crate::error::StcError;
use crate::services::EngineTasks;

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Flow sampling and traffic classification engine.
pub struct StcEngine {
    pub(crate) me: Weak<StcEngine>,
    pub(crate) config: StcConfig,
    pub(crate) thresholds: BurstThresholds,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) reporter: Arc<dyn StcReporter>,
    pub(crate) tx_flows: FlowTable,
    pub(crate) rx_flows: FlowTable,
    pub(crate) sampling: Mutex<SamplingTable>,
    pub(crate) quotas: SamplingQuotas,
    pub(crate) classified: Mutex<ClassifiedTable>,
    pub(crate) signals: ClassifiedSignals,
    pub(crate) peers: PeerTrafficMap,
    pub(crate) attached: AtomicBool,
    pub(crate) report_flow_stats: AtomicBool,
    pub(crate) report_classified_flows: AtomicBool,
    pub(crate) tasks: EngineTasks,
}

impl std::fmt::Debug for StcEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StcEngine").finish_non_exhaustive()
    }
}

/// Build an engine.
///
/// Returns `Ok(None)` when the feature is disabled or nobody listens on the
/// report channel. Every pool is reserved before the engine becomes reachable;
/// on failure the ones already built are dropped and the error returned.
pub fn attach(
    config: StcConfig,
    reporter: Arc<dyn StcReporter>,
    clock: Arc<dyn Clock>,
) -> Result<Option<Arc<StcEngine>>, StcError> {
    if !config.enabled {
        tracing::info!("traffic classification disabled by configuration");
        return Ok(None);
    }
    if !reporter.is_available() {
        tracing::warn!("classifier unavailable, traffic classification not attached");
        return Ok(None);
    }
    config.validate()?;

    let tx_flows = FlowTable::allocate(Direction::Tx, config.flow_table_size)?;
    let rx_flows = FlowTable::allocate(Direction::Rx, config.flow_table_size)?;
    let sampling = SamplingTable::allocate(config.sampling_table_size())?;
    let classified = ClassifiedTable::allocate(config.classified_table_size)?;
    let signals = ClassifiedSignals::allocate(config.classified_table_size)?;
    let peers = PeerTrafficMap::allocate(config.max_peers)?;

    let engine = Arc::new_cyclic(|me| StcEngine {
        me: me.clone(),
        thresholds: BurstThresholds::from(&config),
        quotas: SamplingQuotas::new(&config),
        report_flow_stats: AtomicBool::new(config.report_flow_stats),
        report_classified_flows: AtomicBool::new(config.report_classified_flows),
        config,
        clock,
        reporter,
        tx_flows,
        rx_flows,
        sampling: Mutex::new(sampling),
        classified: Mutex::new(classified),
        signals,
        peers,
        attached: AtomicBool::new(true),
        tasks: EngineTasks::default(),
    });
    tracing::info!(
        flows = engine.config.flow_table_size,
        sampling_slots = engine.config.sampling_table_size(),
        classified_slots = engine.config.classified_table_size,
        "traffic classification attached"
    );
    Ok(Some(engine))
}

impl StcEngine {
    fn ensure_attached(&self) -> Result<(), StcError> {
        if self.attached.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StcError::NotAttached)
        }
    }

    pub(crate) fn flows(&self, direction: Direction) -> &FlowTable {
        match direction {
            Direction::Tx => &self.tx_flows,
            Direction::Rx => &self.rx_flows,
        }
    }

    pub fn config(&self) -> &StcConfig {
        &self.config
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Packet ingress hook. Called once per tracked packet; never blocks.
    pub fn track(
        &self,
        direction: Direction,
        flow_id: u32,
        peer_id: u16,
        vdev_id: u8,
        packet_len: u32,
        metadata: u32,
    ) -> Result<(), StcError> {
        self.ensure_attached()?;
        let now = self.clock.now_us();
        self.flows(direction)
            .row(flow_id)?
            .update(now, packet_len, metadata, peer_id, vdev_id, &self.thresholds);
        Ok(())
    }

    /// A new flow was installed upstream. Registers its tuple and makes sure
    /// the periodic monitor runs.
    pub fn on_flow_added(
        &self,
        direction: Direction,
        flow_id: u32,
        tuple: FlowTuple,
        metadata: u32,
    ) -> Result<(), StcError> {
        self.ensure_attached()?;
        self.flows(direction).row(flow_id)?.register_tuple(tuple, metadata);
        self.tasks.arm_monitor(self);
        Ok(())
    }

    /// A classified flow is being torn down in one direction.
    pub fn on_flow_retiring(&self, classified_flow_id: u32, direction: Direction) -> Result<(), StcError> {
        self.ensure_attached()?;
        if !self.signals.request_retire(classified_flow_id, direction)? {
            tracing::debug!(
                classified_flow_id,
                %direction,
                "retirement already requested"
            );
        }
        Ok(())
    }

    /// Classified slot currently owning a flow row, if any.
    pub fn classified_flow_id(&self, direction: Direction, flow_id: u32) -> Option<u32> {
        self.flows(direction).row(flow_id).ok()?.classified_id()
    }

    pub fn on_peer_map(&self, peer_id: u16, mac: MacAddr, vdev_id: u8) -> Result<(), StcError> {
        self.ensure_attached()?;
        if let Err(e) = self.peers.map(peer_id, mac, vdev_id) {
            tracing::warn!(peer_id, kind = e.kind(), "peer map rejected: {e}");
            return Err(e);
        }
        Ok(())
    }

    pub fn on_peer_unmap(&self, peer_id: u16, mac: MacAddr) -> Result<(), StcError> {
        self.ensure_attached()?;
        if let Err(e) = self.peers.unmap(peer_id, mac) {
            tracing::warn!(peer_id, kind = e.kind(), "peer unmap rejected: {e}");
            return Err(e);
        }
        lock(&self.classified).retire_peer(peer_id, &self.signals);
        Ok(())
    }

    /// Inbound verdict. Returns whether a sampling entry accepted it.
    pub fn on_classification_result(&self, tuple: &FlowTuple, traffic_type: TrafficType) -> bool {
        if !self.is_attached() {
            return false;
        }
        let matched = lock(&self.sampling).apply_verdict(tuple, traffic_type);
        match matched {
            Some(slot) => {
                tracing::debug!(slot, ?traffic_type, "classification result matched");
                true
            }
            None => {
                tracing::debug!(?tuple, "classification result without sampling entry");
                false
            }
        }
    }

    /// Feed verdicts arriving on `results` into `on_classification_result`
    /// from a background task. Returns false when no tokio runtime is
    /// available; the caller then delivers verdicts by hand.
    pub fn spawn_result_listener(&self, results: mpsc::Receiver<ClassificationResult>) -> bool {
        self.tasks.spawn_result_listener(self, results)
    }

    pub fn set_flow_stats_reporting(&self, enabled: bool) {
        self.report_flow_stats.store(enabled, Ordering::Release);
    }

    pub fn set_classified_flow_reporting(&self, enabled: bool) {
        self.report_classified_flows.store(enabled, Ordering::Release);
    }

    /// One sampling timer tick. Returns whether another tick is needed; when
    /// it is not, the timer is recorded as idle.
    pub fn sampling_tick(&self) -> bool {
        let now = self.clock.now_us();
        let more = lock(&self.sampling).tick(&self.tx_flows, &self.rx_flows, &self.config, now);
        if !more {
            self.tasks.mark_timer_idle();
        }
        more
    }

    /// Stop the monitor and the timer, waiting for in-flight runs to finish.
    /// Further hook calls fail with `NotAttached`. Idempotent.
    pub async fn detach(&self) {
        if !self.attached.swap(false, Ordering::AcqRel) {
            return;
        }
        self.tasks.shutdown().await;
        tracing::info!("traffic classification detached");
    }

    pub fn is_timer_running(&self) -> bool {
        self.tasks.is_timer_running()
    }

    pub fn is_monitor_running(&self) -> bool {
        self.tasks.is_monitor_running()
    }

    /// Whether a flow row is currently held by a sampling entry.
    pub fn is_flow_selected(&self, direction: Direction, flow_id: u32) -> bool {
        self.flows(direction)
            .row(flow_id)
            .map_or(false, |row| row.is_selected())
    }

    pub fn quota_occupied(&self, category: SampleCategory) -> usize {
        self.quotas.occupied(category)
    }

    /// Quota held across all categories.
    pub fn quota_total(&self) -> usize {
        self.quotas.total()
    }

    pub fn sampling_states(&self) -> Vec<SamplingState> {
        lock(&self.sampling)
            .entries()
            .iter()
            .map(|e| e.state)
            .collect()
    }

    pub fn valid_sampling_entries(&self) -> usize {
        lock(&self.sampling).valid_entries()
    }

    pub fn classified_flows(&self) -> usize {
        self.signals.occupied()
    }

    pub fn peer_counter(&self, peer_id: u16, traffic_type: TrafficType) -> u32 {
        self.peers.counter(peer_id, traffic_type)
    }
}

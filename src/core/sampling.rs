//! Sampling table and the timer-driven sampling state machine.
//!
//! An entry follows one or two flow rows through `num_samples` samples of
//! `windows_per_sample` windows each, one window per timer tick, then keeps
//! ticking to collect burst figures until its attempt budget runs out.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

use crate::config::{StcConfig, MAX_SAMPLES, MAX_WINDOWS_PER_SAMPLE};
use crate::core::flow_table::{BurstSummary, FlowCounters, FlowRef, FlowTable, WindowStats};
use crate::core::peer::PeerHandle;
use crate::core::tuple::{FlowTuple, TrafficType};
use crate::error::StcError;

/// Lifecycle of a sampling entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingState {
    #[default]
    Init,
    FlowAdded,
    SamplingStart,
    SamplingBurstStats,
    SamplingDone,
    SamplesSent,
    Classified,
    SamplingFail,
}

impl SamplingState {
    fn can_advance_to(self, next: SamplingState) -> bool {
        use SamplingState::*;
        matches!(
            (self, next),
            (Init, FlowAdded)
                | (FlowAdded, SamplingStart)
                | (FlowAdded, SamplingFail)
                | (SamplingStart, SamplingBurstStats)
                | (SamplingStart, SamplingFail)
                | (SamplingBurstStats, SamplingDone)
                | (SamplingDone, SamplesSent)
                | (SamplingDone, Classified)
                | (SamplingDone, Init)
                | (SamplesSent, Classified)
                | (SamplesSent, Init)
                | (Classified, Init)
                | (SamplingFail, Init)
        )
    }

    /// States the sampling timer still has work for.
    pub fn needs_tick(self) -> bool {
        matches!(
            self,
            SamplingState::FlowAdded | SamplingState::SamplingStart | SamplingState::SamplingBurstStats
        )
    }
}

/// Quota category of a sampled flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleCategory {
    Bidi,
    TxOnly,
    RxOnly,
}

impl SampleCategory {
    fn index(self) -> usize {
        match self {
            SampleCategory::Bidi => 0,
            SampleCategory::TxOnly => 1,
            SampleCategory::RxOnly => 2,
        }
    }
}

/// Occupancy per quota category, shared across execution contexts.
#[derive(Debug)]
pub struct SamplingQuotas {
    occupied: [AtomicUsize; 3],
    max: [usize; 3],
}

impl SamplingQuotas {
    pub fn new(cfg: &StcConfig) -> Self {
        Self {
            occupied: Default::default(),
            max: [cfg.max_bidi_flows, cfg.max_tx_flows, cfg.max_rx_flows],
        }
    }

    pub fn occupied(&self, cat: SampleCategory) -> usize {
        self.occupied[cat.index()].load(Ordering::Acquire)
    }

    pub fn max(&self, cat: SampleCategory) -> usize {
        self.max[cat.index()]
    }

    pub fn has_room(&self, cat: SampleCategory, pending: usize) -> bool {
        self.occupied(cat) + pending < self.max(cat)
    }

    pub fn try_acquire(&self, cat: SampleCategory) -> bool {
        let max = self.max(cat);
        self.occupied[cat.index()]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| (v < max).then_some(v + 1))
            .is_ok()
    }

    pub fn release(&self, cat: SampleCategory) {
        let _ = self.occupied[cat.index()].fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
            v.checked_sub(1)
        });
    }

    pub fn total(&self) -> usize {
        self.occupied.iter().map(|o| o.load(Ordering::Acquire)).sum()
    }
}

/// Readiness flags reported alongside a sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReadinessFlags {
    pub stats_ready: bool,
    pub stats_sent: bool,
    pub burst_ready: bool,
    pub burst_sent: bool,
}

impl ReadinessFlags {
    pub fn any_sent(&self) -> bool {
        self.stats_sent || self.burst_sent
    }

    pub fn all_sent(&self) -> bool {
        (!self.stats_ready || self.stats_sent) && (!self.burst_ready || self.burst_sent)
    }
}

/// Delta figures of one window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WindowSample {
    pub bytes: u64,
    pub packets: u64,
    pub stats: WindowStats,
}

/// A flow row followed by a sampling entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrackedFlow {
    pub flow: FlowRef,
    #[serde(skip)]
    start: FlowCounters,
    #[serde(skip)]
    reference: FlowCounters,
    pub windows: [[WindowSample; MAX_WINDOWS_PER_SAMPLE]; MAX_SAMPLES],
    pub burst: BurstSummary,
}

impl TrackedFlow {
    pub fn new(flow: FlowRef) -> Self {
        Self {
            flow,
            start: FlowCounters::default(),
            reference: FlowCounters::default(),
            windows: Default::default(),
            burst: BurstSummary::default(),
        }
    }
}

/// Outgoing sample handed to the classifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SamplePayload {
    /// Tx orientation for bidirectional and tx-only samples, rx orientation
    /// for rx-only ones. A verdict may name a bidirectional flow either way.
    pub tuple: FlowTuple,
    pub peer_id: u16,
    pub vdev_id: u8,
    pub category: SampleCategory,
    pub num_samples: usize,
    pub windows_per_sample: usize,
    pub tx: Option<TrackedFlow>,
    pub rx: Option<TrackedFlow>,
}

/// Flows chosen by one monitor pass for promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingCandidate {
    pub peer_id: u16,
    pub vdev_id: u8,
    pub category: SampleCategory,
    pub tuple: FlowTuple,
    pub tx: Option<FlowRef>,
    pub rx: Option<FlowRef>,
}

#[derive(Debug, Clone, Default)]
pub struct SamplingEntry {
    pub state: SamplingState,
    pub category: Option<SampleCategory>,
    pub peer_id: u16,
    /// Peer mapping in force when the flow was promoted.
    pub peer: Option<PeerHandle>,
    pub vdev_id: u8,
    pub tuple: Option<FlowTuple>,
    pub tuple_hash: u64,
    pub tx: Option<TrackedFlow>,
    pub rx: Option<TrackedFlow>,
    pub sample_idx: usize,
    pub window_idx: usize,
    pub ticks: u32,
    pub flags: ReadinessFlags,
    pub verdict: Option<TrafficType>,
    pub done_at_us: u64,
}

impl SamplingEntry {
    /// Checked state change; an out-of-sequence request is refused and logged.
    pub fn transition(&mut self, next: SamplingState) -> bool {
        if !self.state.can_advance_to(next) {
            tracing::error!(from = ?self.state, to = ?next, "refusing invalid sampling transition");
            return false;
        }
        tracing::debug!(from = ?self.state, to = ?next, "sampling transition");
        if next == SamplingState::Init {
            *self = SamplingEntry::default();
        } else {
            self.state = next;
        }
        true
    }

    pub fn is_free(&self) -> bool {
        self.state == SamplingState::Init
    }

    fn matches_tuple(&self, tuple: &FlowTuple) -> bool {
        match self.tuple {
            Some(t) if t == *tuple => true,
            Some(t) => self.category == Some(SampleCategory::Bidi) && t.reversed() == *tuple,
            None => false,
        }
    }

    fn flows_with_tables<'a>(
        &'a mut self,
        tx_table: &'a FlowTable,
        rx_table: &'a FlowTable,
    ) -> impl Iterator<Item = (&'a mut TrackedFlow, &'a FlowTable)> {
        self.tx
            .iter_mut()
            .map(move |f| (f, tx_table))
            .chain(self.rx.iter_mut().map(move |f| (f, rx_table)))
    }

    /// True if any followed row now holds a different flow instance.
    fn is_stale(&self, tx_table: &FlowTable, rx_table: &FlowTable) -> bool {
        self.tx.iter().any(|f| tx_table.live_row(f.flow).is_none())
            || self.rx.iter().any(|f| rx_table.live_row(f.flow).is_none())
    }

    /// Stop the packet path from following this entry on rows still holding our flows.
    pub fn stop_tracking(&self, tx_table: &FlowTable, rx_table: &FlowTable) {
        for f in &self.tx {
            if let Some(row) = tx_table.live_row(f.flow) {
                row.stop_tracking();
            }
        }
        for f in &self.rx {
            if let Some(row) = rx_table.live_row(f.flow) {
                row.stop_tracking();
            }
        }
    }

    /// Clear the `selected` marker on rows still holding our flows.
    pub fn unselect(&self, tx_table: &FlowTable, rx_table: &FlowTable) {
        for f in &self.tx {
            if let Some(row) = tx_table.live_row(f.flow) {
                row.set_selected(false);
            }
        }
        for f in &self.rx {
            if let Some(row) = rx_table.live_row(f.flow) {
                row.set_selected(false);
            }
        }
    }

    pub fn payload(&self, cfg: &StcConfig) -> Option<SamplePayload> {
        Some(SamplePayload {
            tuple: self.tuple?,
            peer_id: self.peer_id,
            vdev_id: self.vdev_id,
            category: self.category?,
            num_samples: cfg.num_samples,
            windows_per_sample: cfg.windows_per_sample,
            tx: self.tx,
            rx: self.rx,
        })
    }

    /// Advance this entry by one timer tick.
    pub fn tick(&mut self, tx_table: &FlowTable, rx_table: &FlowTable, cfg: &StcConfig, now_us: u64) {
        match self.state {
            SamplingState::FlowAdded => {
                self.ticks += 1;
                if self.is_stale(tx_table, rx_table) {
                    tracing::debug!(peer_id = self.peer_id, "flow recycled before sampling started");
                    self.transition(SamplingState::SamplingFail);
                    return;
                }
                for (f, table) in self.flows_with_tables(tx_table, rx_table) {
                    if let Some(row) = table.live_row(f.flow) {
                        f.start = row.counters();
                        f.reference = f.start;
                        row.start_tracking();
                    }
                }
                self.sample_idx = 0;
                self.window_idx = 0;
                self.transition(SamplingState::SamplingStart);
            }
            SamplingState::SamplingStart => {
                self.ticks += 1;
                if self.is_stale(tx_table, rx_table) {
                    tracing::debug!(peer_id = self.peer_id, "flow recycled during sampling");
                    self.stop_tracking(tx_table, rx_table);
                    self.transition(SamplingState::SamplingFail);
                    return;
                }
                self.sample_window(tx_table, rx_table, cfg);
            }
            SamplingState::SamplingBurstStats => {
                self.ticks += 1;
                if self.is_stale(tx_table, rx_table) {
                    self.stop_tracking(tx_table, rx_table);
                    self.done_at_us = now_us;
                    self.transition(SamplingState::SamplingDone);
                    return;
                }
                if self.ticks >= cfg.sampling_max_attempts {
                    for (f, table) in self.flows_with_tables(tx_table, rx_table) {
                        if let Some(row) = table.live_row(f.flow) {
                            let mut burst = row.burst_summary();
                            burst.count = burst.count.saturating_sub(f.start.burst_count);
                            f.burst = burst;
                        }
                    }
                    self.flags.burst_ready = true;
                    self.stop_tracking(tx_table, rx_table);
                    self.done_at_us = now_us;
                    self.transition(SamplingState::SamplingDone);
                }
            }
            _ => {}
        }
    }

    fn sample_window(&mut self, tx_table: &FlowTable, rx_table: &FlowTable, cfg: &StcConfig) {
        let (s, w) = (self.sample_idx, self.window_idx);
        let next_w = w + 1;
        let sample_boundary = next_w == cfg.windows_per_sample;

        for (f, table) in self.flows_with_tables(tx_table, rx_table) {
            let Some(row) = table.live_row(f.flow) else {
                continue;
            };
            let now = row.counters();
            f.windows[s][w] = WindowSample {
                bytes: now.bytes.saturating_sub(f.reference.bytes),
                packets: now.packets.saturating_sub(f.reference.packets),
                stats: row.window_stats(s, w),
            };
            if sample_boundary {
                f.reference = now;
            }
        }

        if sample_boundary {
            self.sample_idx += 1;
            self.window_idx = 0;
        } else {
            self.window_idx = next_w;
        }

        if self.sample_idx == cfg.num_samples {
            self.flags.stats_ready = true;
            self.transition(SamplingState::SamplingBurstStats);
            return;
        }
        let (s, w) = (self.sample_idx, self.window_idx);
        for f in &self.tx {
            if let Some(row) = tx_table.live_row(f.flow) {
                row.set_cursor(s, w);
            }
        }
        for f in &self.rx {
            if let Some(row) = rx_table.live_row(f.flow) {
                row.set_cursor(s, w);
            }
        }
    }
}

/// Fixed pool of sampling entries.
#[derive(Debug)]
pub struct SamplingTable {
    entries: Box<[SamplingEntry]>,
}

impl SamplingTable {
    pub fn allocate(size: usize) -> Result<Self, StcError> {
        let mut entries = Vec::new();
        entries.try_reserve_exact(size)?;
        entries.resize_with(size, SamplingEntry::default);
        Ok(Self {
            entries: entries.into_boxed_slice(),
        })
    }

    pub fn entries(&self) -> &[SamplingEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [SamplingEntry] {
        &mut self.entries
    }

    pub fn valid_entries(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_free()).count()
    }

    /// Place `candidate` in a free slot. Returns the slot, or `None` when full.
    ///
    /// `peer` is the mapping the candidate's peer has right now; verdicts
    /// credit that mapping only.
    pub fn insert(&mut self, candidate: &SamplingCandidate, peer: Option<PeerHandle>) -> Option<usize> {
        let slot = self.entries.iter().position(SamplingEntry::is_free)?;
        let entry = &mut self.entries[slot];
        entry.category = Some(candidate.category);
        entry.peer_id = candidate.peer_id;
        entry.peer = peer;
        entry.vdev_id = candidate.vdev_id;
        entry.tuple = Some(candidate.tuple);
        entry.tuple_hash = candidate.tuple.bidi_hash();
        entry.tx = candidate.tx.map(TrackedFlow::new);
        entry.rx = candidate.rx.map(TrackedFlow::new);
        entry.transition(SamplingState::FlowAdded);
        Some(slot)
    }

    /// Run one timer tick over every entry. Returns whether another tick is needed.
    pub fn tick(&mut self, tx_table: &FlowTable, rx_table: &FlowTable, cfg: &StcConfig, now_us: u64) -> bool {
        for entry in self.entries.iter_mut() {
            entry.tick(tx_table, rx_table, cfg, now_us);
        }
        self.entries.iter().any(|e| e.state.needs_tick())
    }

    /// Attach a verdict to the entry sampling `tuple`.
    ///
    /// The hash narrows the search, the full tuple decides. A bidirectional
    /// entry matches its tuple in either orientation. Only entries that
    /// already reported statistics or bursts can match.
    pub fn apply_verdict(&mut self, tuple: &FlowTuple, traffic_type: TrafficType) -> Option<usize> {
        let hash = tuple.bidi_hash();
        let slot = self.entries.iter().position(|e| {
            e.tuple_hash == hash
                && e.matches_tuple(tuple)
                && e.flags.any_sent()
                && e.verdict.is_none()
                && matches!(
                    e.state,
                    SamplingState::SamplingBurstStats | SamplingState::SamplingDone | SamplingState::SamplesSent
                )
        })?;
        let entry = &mut self.entries[slot];
        entry.verdict = Some(traffic_type);
        if matches!(entry.state, SamplingState::SamplingDone | SamplingState::SamplesSent) {
            entry.transition(SamplingState::Classified);
        }
        Some(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::flow_table::BurstThresholds;
    use crate::core::tuple::Direction;
    use std::net::{IpAddr, Ipv4Addr};

    fn tuple(port: u16) -> FlowTuple {
        FlowTuple {
            src_ip: IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
            dst_ip: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
            src_port: 443,
            dst_port: port,
            protocol: 6,
        }
    }

    struct Fixture {
        cfg: StcConfig,
        tx: FlowTable,
        rx: FlowTable,
        table: SamplingTable,
        th: BurstThresholds,
    }

    impl Fixture {
        fn new() -> Self {
            let cfg = StcConfig::default();
            Self {
                th: BurstThresholds::from(&cfg),
                tx: FlowTable::allocate(Direction::Tx, 8).unwrap(),
                rx: FlowTable::allocate(Direction::Rx, 8).unwrap(),
                table: SamplingTable::allocate(cfg.sampling_table_size()).unwrap(),
                cfg,
            }
        }

        fn rx_packet(&self, flow_id: u32, ts: u64, tag: u32) {
            self.rx.row(flow_id).unwrap().update(ts, 800, tag, 1, 0, &self.th);
        }

        fn tx_packet(&self, flow_id: u32, ts: u64, tag: u32) {
            self.tx.row(flow_id).unwrap().update(ts, 800, tag, 1, 0, &self.th);
        }

        fn promote_rx(&mut self, flow_id: u32, tag: u32, port: u16) -> usize {
            self.table
                .insert(
                    &SamplingCandidate {
                        peer_id: 1,
                        vdev_id: 0,
                        category: SampleCategory::RxOnly,
                        tuple: tuple(port),
                        tx: None,
                        rx: Some(FlowRef { flow_id, tag }),
                    },
                    None,
                )
                .unwrap()
        }

        fn promote_bidi(&mut self, tx: FlowRef, rx: FlowRef, port: u16) -> usize {
            self.table
                .insert(
                    &SamplingCandidate {
                        peer_id: 1,
                        vdev_id: 0,
                        category: SampleCategory::Bidi,
                        tuple: tuple(port).reversed(),
                        tx: Some(tx),
                        rx: Some(rx),
                    },
                    None,
                )
                .unwrap()
        }

        fn mark_reported(&mut self, slot: usize) {
            let entry = &mut self.table.entries_mut()[slot];
            entry.state = SamplingState::SamplingDone;
            entry.flags.stats_ready = true;
            entry.flags.stats_sent = true;
        }
    }

    #[test]
    fn test_invalid_transition_is_refused() {
        let mut entry = SamplingEntry::default();
        assert!(!entry.transition(SamplingState::SamplingDone));
        assert_eq!(entry.state, SamplingState::Init);
        assert!(entry.transition(SamplingState::FlowAdded));
        assert!(!entry.transition(SamplingState::Classified));
    }

    #[test]
    fn test_quota_never_exceeds_max() {
        let cfg = StcConfig::default();
        let quotas = SamplingQuotas::new(&cfg);
        for _ in 0..10 {
            quotas.try_acquire(SampleCategory::RxOnly);
        }
        assert_eq!(quotas.occupied(SampleCategory::RxOnly), cfg.max_rx_flows);
        quotas.release(SampleCategory::RxOnly);
        quotas.release(SampleCategory::RxOnly);
        assert_eq!(quotas.occupied(SampleCategory::RxOnly), 0);
    }

    #[test]
    fn test_progression_reaches_burst_stats_after_exact_ticks() {
        let mut fx = Fixture::new();
        let mut ts = 0;
        fx.rx_packet(2, ts, 11);
        let slot = fx.promote_rx(2, 11, 40_000);

        // FLOW_ADDED -> SAMPLING_START
        assert!(fx.table.tick(&fx.tx, &fx.rx, &fx.cfg, ts));
        assert_eq!(fx.table.entries()[slot].state, SamplingState::SamplingStart);

        let n = fx.cfg.sampling_ticks();
        for i in 1..=n {
            ts += 600_000;
            fx.rx_packet(2, ts, 11);
            fx.table.tick(&fx.tx, &fx.rx, &fx.cfg, ts);
            let entry = &fx.table.entries()[slot];
            if i < n {
                assert_eq!(entry.state, SamplingState::SamplingStart, "tick {i}");
                assert!(!entry.flags.stats_ready);
            } else {
                assert_eq!(entry.state, SamplingState::SamplingBurstStats);
                assert!(entry.flags.stats_ready);
            }
        }
        let rx = fx.table.entries()[slot].rx.unwrap();
        // One packet per window; the reference is re-snapshotted each sample.
        assert_eq!(rx.windows[0][0].packets, 1);
        assert_eq!(rx.windows[0][4].packets, 5);
        assert_eq!(rx.windows[1][0].packets, 1);
        assert_eq!(rx.windows[0][2].stats.packet_len.max, 800);
    }

    #[test]
    fn test_burst_phase_runs_until_attempt_budget() {
        let mut fx = Fixture::new();
        fx.rx_packet(0, 0, 5);
        let slot = fx.promote_rx(0, 5, 40_001);
        let mut more = true;
        let mut ticks = 0;
        while more {
            ticks += 1;
            more = fx.table.tick(&fx.tx, &fx.rx, &fx.cfg, ticks as u64 * 600_000);
        }
        let entry = &fx.table.entries()[slot];
        assert_eq!(ticks, fx.cfg.sampling_max_attempts);
        assert_eq!(entry.state, SamplingState::SamplingDone);
        assert!(entry.flags.burst_ready);
        assert!(!fx.rx.row(0).unwrap().is_tracking());
    }

    #[test]
    fn test_recycled_flow_fails_sampling() {
        let mut fx = Fixture::new();
        fx.rx_packet(3, 0, 21);
        let slot = fx.promote_rx(3, 21, 40_002);
        fx.table.tick(&fx.tx, &fx.rx, &fx.cfg, 0);
        fx.table.tick(&fx.tx, &fx.rx, &fx.cfg, 600_000);
        // Row reused by a different flow.
        fx.rx_packet(3, 700_000, 22);
        fx.table.tick(&fx.tx, &fx.rx, &fx.cfg, 1_200_000);
        assert_eq!(fx.table.entries()[slot].state, SamplingState::SamplingFail);
    }

    #[test]
    fn test_row_recycled_before_first_tick_fails_sampling() {
        let mut fx = Fixture::new();
        fx.rx_packet(4, 0, 31);
        let slot = fx.promote_rx(4, 31, 40_005);
        // Row reused by a different flow before the timer ever ran.
        fx.rx_packet(4, 100_000, 32);
        assert!(!fx.table.tick(&fx.tx, &fx.rx, &fx.cfg, 600_000));
        assert_eq!(fx.table.entries()[slot].state, SamplingState::SamplingFail);
        let row = fx.rx.row(4).unwrap();
        assert!(!row.is_tracking());
        assert_eq!(row.tag(), 32);
    }

    #[test]
    fn test_bidi_verdict_matches_either_orientation() {
        let mut fx = Fixture::new();
        fx.tx_packet(1, 0, 41);
        fx.rx_packet(1, 0, 42);
        let slot = fx.promote_bidi(FlowRef { flow_id: 1, tag: 41 }, FlowRef { flow_id: 1, tag: 42 }, 40_006);
        fx.mark_reported(slot);
        // Named from the receive side.
        let rx_view = tuple(40_006);
        assert_eq!(fx.table.apply_verdict(&rx_view, TrafficType::Gaming), Some(slot));
        assert_eq!(fx.table.entries()[slot].state, SamplingState::Classified);
        assert_eq!(fx.table.entries()[slot].verdict, Some(TrafficType::Gaming));
    }

    #[test]
    fn test_rx_only_verdict_needs_exact_orientation() {
        let mut fx = Fixture::new();
        fx.rx_packet(2, 0, 43);
        let slot = fx.promote_rx(2, 43, 40_007);
        fx.mark_reported(slot);
        let reversed = tuple(40_007).reversed();
        assert_eq!(fx.table.apply_verdict(&reversed, TrafficType::Gaming), None);
        assert_eq!(fx.table.apply_verdict(&tuple(40_007), TrafficType::Gaming), Some(slot));
    }

    #[test]
    fn test_colliding_hash_with_different_tuple_does_not_match() {
        let mut fx = Fixture::new();
        fx.rx_packet(1, 0, 3);
        let slot = fx.promote_rx(1, 3, 40_003);
        let other = tuple(50_000);
        {
            let entry = &mut fx.table.entries_mut()[slot];
            entry.state = SamplingState::SamplingDone;
            entry.flags.stats_ready = true;
            entry.flags.stats_sent = true;
            // Force a hash collision.
            entry.tuple_hash = other.bidi_hash();
        }
        assert_eq!(fx.table.apply_verdict(&other, TrafficType::Gaming), None);
        assert_eq!(fx.table.entries()[slot].verdict, None);
    }

    #[test]
    fn test_verdict_requires_a_sent_report() {
        let mut fx = Fixture::new();
        fx.rx_packet(1, 0, 3);
        let slot = fx.promote_rx(1, 3, 40_004);
        fx.table.entries_mut()[slot].state = SamplingState::SamplingDone;
        let t = tuple(40_004);
        assert_eq!(fx.table.apply_verdict(&t, TrafficType::Streaming), None);

        fx.table.entries_mut()[slot].flags.burst_sent = true;
        assert_eq!(fx.table.apply_verdict(&t, TrafficType::Streaming), Some(slot));
        assert_eq!(fx.table.entries()[slot].state, SamplingState::Classified);
    }
}

//! Per-direction flow tables and the per-packet update path.
//!
//! A row is written by exactly one packet context at a time (the one carrying
//! its flow id), so every field is an atomic updated with plain loads and
//! stores. The monitor and the sampler read rows concurrently; they only write
//! the selection flags and the sampling cursor.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::RwLock;

use serde::Serialize;

use crate::config::{StcConfig, MAX_SAMPLES, MAX_WINDOWS_PER_SAMPLE};
use crate::core::stats::{AtomicMinMax, AtomicMinMaxSum, MinMax, MinMaxSum};
use crate::core::tuple::{Direction, FlowTuple};
use crate::error::StcError;

const FLAG_SELECTED: u8 = 0b01;
const FLAG_CLASSIFIED: u8 = 0b10;

/// Thresholds consumed by the burst detector, in microseconds and bytes.
#[derive(Debug, Clone, Copy)]
pub struct BurstThresholds {
    pub start_time_us: u64,
    pub start_bytes: u64,
    pub end_iat_us: u64,
}

impl From<&StcConfig> for BurstThresholds {
    fn from(cfg: &StcConfig) -> Self {
        Self {
            start_time_us: cfg.burst_start_time_us,
            start_bytes: cfg.burst_start_bytes,
            end_iat_us: cfg.burst_end_iat_us,
        }
    }
}

/// Burst detector state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BurstState {
    Init = 0,
    Start = 1,
    Active = 2,
}

impl BurstState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => BurstState::Start,
            2 => BurstState::Active,
            _ => BurstState::Init,
        }
    }
}

/// Burst figures folded into a finished sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BurstSummary {
    pub count: u64,
    pub duration_us: MinMaxSum,
    pub size_bytes: MinMaxSum,
}

#[derive(Debug, Default)]
struct BurstTracker {
    state: AtomicU8,
    start_ts: AtomicU64,
    bytes: AtomicU64,
    count: AtomicU64,
    duration: AtomicMinMaxSum,
    size: AtomicMinMaxSum,
}

impl BurstTracker {
    fn clear(&self) {
        self.state.store(BurstState::Init as u8, Ordering::Relaxed);
        self.start_ts.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
        self.duration.clear();
        self.size.clear();
    }

    fn begin_detection(&self, now: u64, len: u64) {
        self.start_ts.store(now, Ordering::Relaxed);
        self.bytes.store(len, Ordering::Relaxed);
        self.state.store(BurstState::Start as u8, Ordering::Relaxed);
    }

    fn step(&self, now: u64, prev_ts: u64, iat: u64, len: u64, th: &BurstThresholds) {
        match BurstState::from_u8(self.state.load(Ordering::Relaxed)) {
            BurstState::Init => self.begin_detection(now, len),
            BurstState::Start => {
                let start = self.start_ts.load(Ordering::Relaxed);
                let elapsed = now.saturating_sub(start);
                let bytes = self.bytes.load(Ordering::Relaxed) + len;
                self.bytes.store(bytes, Ordering::Relaxed);

                if elapsed < th.start_time_us {
                    if bytes > th.start_bytes {
                        self.count.fetch_add(1, Ordering::Relaxed);
                        self.state.store(BurstState::Active as u8, Ordering::Relaxed);
                    }
                } else if bytes <= th.start_bytes {
                    self.begin_detection(now, len);
                } else {
                    // Too slow to be a burst but too large to restart from: start over.
                    self.state.store(BurstState::Init as u8, Ordering::Relaxed);
                    self.start_ts.store(0, Ordering::Relaxed);
                    self.bytes.store(0, Ordering::Relaxed);
                }
            }
            BurstState::Active => {
                if iat > th.end_iat_us {
                    let start = self.start_ts.load(Ordering::Relaxed);
                    self.duration.record(prev_ts.saturating_sub(start));
                    self.size.record(self.bytes.load(Ordering::Relaxed));
                    self.state.store(BurstState::Init as u8, Ordering::Relaxed);
                    self.begin_detection(now, len);
                } else {
                    self.bytes.fetch_add(len, Ordering::Relaxed);
                }
            }
        }
    }

    fn summary(&self) -> BurstSummary {
        BurstSummary {
            count: self.count.load(Ordering::Relaxed),
            duration_us: self.duration.load(),
            size_bytes: self.size.load(),
        }
    }
}

/// Min/max figures of one sampling window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WindowStats {
    pub iat_us: MinMax,
    pub packet_len: MinMax,
}

#[derive(Debug, Default)]
struct WindowCell {
    iat: AtomicMinMax,
    packet_len: AtomicMinMax,
}

impl WindowCell {
    fn load(&self) -> WindowStats {
        WindowStats {
            iat_us: self.iat.load(),
            packet_len: self.packet_len.load(),
        }
    }

    fn store(&self, stats: WindowStats) {
        self.iat.store(stats.iat_us);
        self.packet_len.store(stats.packet_len);
    }
}

/// Sampling cursor: written by the sampler, followed by the packet path.
#[derive(Debug, Default)]
struct SampleCursor {
    tracking: AtomicBool,
    epoch: AtomicU32,
    sample: AtomicU8,
    window: AtomicU8,
}

/// Cursor most recently observed by the packet path.
#[derive(Debug, Default)]
struct SeenCursor {
    valid: AtomicBool,
    epoch: AtomicU32,
    sample: AtomicU8,
    window: AtomicU8,
}

/// Cumulative counters snapshotted by the sampler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlowCounters {
    pub bytes: u64,
    pub packets: u64,
    pub burst_count: u64,
}

#[derive(Debug, Clone, Copy)]
struct RegisteredTuple {
    tuple: FlowTuple,
    tag: u32,
}

/// Identifies a row together with the flow instance it held when referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlowRef {
    pub flow_id: u32,
    pub tag: u32,
}

/// One flow row.
#[derive(Debug, Default)]
pub struct FlowRow {
    metadata: AtomicU32,
    bytes: AtomicU64,
    packets: AtomicU64,
    first_ts: AtomicU64,
    last_ts: AtomicU64,
    peer_id: AtomicU16,
    vdev_id: AtomicU8,
    iat: AtomicMinMaxSum,
    packet_len: AtomicMinMax,
    burst: BurstTracker,
    windows: [[WindowCell; MAX_WINDOWS_PER_SAMPLE]; MAX_SAMPLES],
    cursor: SampleCursor,
    seen: SeenCursor,
    flags: AtomicU8,
    classified_id: AtomicU32,
    tuple: RwLock<Option<RegisteredTuple>>,
}

impl FlowRow {
    /// Per-packet update. Never blocks and never allocates.
    pub fn update(
        &self,
        now_us: u64,
        packet_len: u32,
        metadata: u32,
        peer_id: u16,
        vdev_id: u8,
        thresholds: &BurstThresholds,
    ) {
        if self.metadata.load(Ordering::Relaxed) != metadata {
            self.reset(metadata);
        }
        let len = u64::from(packet_len);

        let packets = self.packets.load(Ordering::Relaxed);
        let prev_ts = self.last_ts.load(Ordering::Relaxed);
        let iat = if packets == 0 {
            self.first_ts.store(now_us, Ordering::Relaxed);
            self.peer_id.store(peer_id, Ordering::Relaxed);
            self.vdev_id.store(vdev_id, Ordering::Relaxed);
            0
        } else {
            now_us.saturating_sub(prev_ts)
        };

        self.packets.store(packets + 1, Ordering::Relaxed);
        self.bytes.fetch_add(len, Ordering::Relaxed);
        self.last_ts.store(now_us, Ordering::Relaxed);
        self.iat.record(iat);
        self.packet_len.record(len);

        self.update_window(iat, len);
        self.burst.step(now_us, prev_ts, iat, len, thresholds);
    }

    fn reset(&self, metadata: u32) {
        self.bytes.store(0, Ordering::Relaxed);
        self.packets.store(0, Ordering::Relaxed);
        self.first_ts.store(0, Ordering::Relaxed);
        self.last_ts.store(0, Ordering::Relaxed);
        self.iat.clear();
        self.packet_len.clear();
        self.burst.clear();
        self.cursor.tracking.store(false, Ordering::Relaxed);
        self.seen.valid.store(false, Ordering::Relaxed);
        self.flags.store(0, Ordering::Relaxed);
        self.metadata.store(metadata, Ordering::Release);
    }

    fn update_window(&self, iat: u64, len: u64) {
        if !self.cursor.tracking.load(Ordering::Acquire) {
            return;
        }
        let epoch = self.cursor.epoch.load(Ordering::Relaxed);
        let sample = self.cursor.sample.load(Ordering::Relaxed) as usize;
        let window = self.cursor.window.load(Ordering::Relaxed) as usize;
        if sample >= MAX_SAMPLES || window >= MAX_WINDOWS_PER_SAMPLE {
            return;
        }

        let seen_valid = self.seen.valid.load(Ordering::Relaxed);
        let seen_epoch = self.seen.epoch.load(Ordering::Relaxed);
        let seen_sample = self.seen.sample.load(Ordering::Relaxed) as usize;
        let seen_window = self.seen.window.load(Ordering::Relaxed) as usize;

        let cell = &self.windows[sample][window];
        let same_cursor = seen_valid
            && seen_epoch == epoch
            && seen_sample == sample
            && seen_window == window;
        if !same_cursor {
            // Entering a window: carry the previous window of this sample forward once.
            let carried = if seen_valid && seen_epoch == epoch && seen_sample == sample && seen_window < window {
                self.windows[sample][seen_window].load()
            } else {
                WindowStats::default()
            };
            cell.store(carried);
            self.seen.epoch.store(epoch, Ordering::Relaxed);
            self.seen.sample.store(sample as u8, Ordering::Relaxed);
            self.seen.window.store(window as u8, Ordering::Relaxed);
            self.seen.valid.store(true, Ordering::Relaxed);
        }
        cell.iat.record(iat);
        cell.packet_len.record(len);
    }

    pub fn tag(&self) -> u32 {
        self.metadata.load(Ordering::Acquire)
    }

    pub fn matches(&self, flow: FlowRef) -> bool {
        self.tag() == flow.tag
    }

    pub fn is_populated(&self) -> bool {
        self.packets.load(Ordering::Relaxed) > 0
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn first_seen_us(&self) -> u64 {
        self.first_ts.load(Ordering::Relaxed)
    }

    pub fn last_seen_us(&self) -> u64 {
        self.last_ts.load(Ordering::Relaxed)
    }

    pub fn peer_id(&self) -> u16 {
        self.peer_id.load(Ordering::Relaxed)
    }

    pub fn vdev_id(&self) -> u8 {
        self.vdev_id.load(Ordering::Relaxed)
    }

    pub fn iat_stats(&self) -> MinMaxSum {
        self.iat.load()
    }

    pub fn packet_len_stats(&self) -> MinMax {
        self.packet_len.load()
    }

    pub fn burst_state(&self) -> BurstState {
        BurstState::from_u8(self.burst.state.load(Ordering::Relaxed))
    }

    pub fn burst_summary(&self) -> BurstSummary {
        self.burst.summary()
    }

    pub fn counters(&self) -> FlowCounters {
        FlowCounters {
            bytes: self.bytes(),
            packets: self.packets(),
            burst_count: self.burst.count.load(Ordering::Relaxed),
        }
    }

    /// Flow age and whether it clears the shortlist gate.
    pub fn is_eligible(&self, now_us: u64, min_age_ms: u64, min_rate_pps: u64) -> bool {
        let packets = self.packets();
        if packets == 0 {
            return false;
        }
        let age_ms = now_us.saturating_sub(self.first_seen_us()) / 1_000;
        if age_ms <= min_age_ms || age_ms == 0 {
            return false;
        }
        packets.saturating_mul(1_000) / age_ms >= min_rate_pps
    }

    pub fn is_selected(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & FLAG_SELECTED != 0
    }

    pub fn is_classified(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & FLAG_CLASSIFIED != 0
    }

    pub fn set_selected(&self, on: bool) {
        if on {
            self.flags.fetch_or(FLAG_SELECTED, Ordering::Relaxed);
        } else {
            self.flags.fetch_and(!FLAG_SELECTED, Ordering::Relaxed);
        }
    }

    pub fn set_classified(&self, classified_id: Option<u32>) {
        match classified_id {
            Some(id) => {
                self.classified_id.store(id, Ordering::Relaxed);
                self.flags.fetch_or(FLAG_CLASSIFIED, Ordering::Relaxed);
            }
            None => {
                self.flags.fetch_and(!FLAG_CLASSIFIED, Ordering::Relaxed);
            }
        }
    }

    pub fn classified_id(&self) -> Option<u32> {
        self.is_classified()
            .then(|| self.classified_id.load(Ordering::Relaxed))
    }

    /// Record the tuple for the flow instance identified by `tag`.
    pub fn register_tuple(&self, tuple: FlowTuple, tag: u32) {
        if let Ok(mut slot) = self.tuple.write() {
            *slot = Some(RegisteredTuple { tuple, tag });
        }
    }

    /// Tuple registered for the flow instance currently occupying the row.
    pub fn tuple(&self) -> Option<FlowTuple> {
        let tag = self.tag();
        self.tuple
            .read()
            .ok()
            .and_then(|slot| *slot)
            .filter(|reg| reg.tag == tag)
            .map(|reg| reg.tuple)
    }

    /// Begin following a new sampling session from cursor (0, 0).
    pub fn start_tracking(&self) {
        self.cursor.sample.store(0, Ordering::Relaxed);
        self.cursor.window.store(0, Ordering::Relaxed);
        self.cursor.epoch.fetch_add(1, Ordering::Relaxed);
        self.cursor.tracking.store(true, Ordering::Release);
    }

    pub fn stop_tracking(&self) {
        self.cursor.tracking.store(false, Ordering::Release);
    }

    pub fn is_tracking(&self) -> bool {
        self.cursor.tracking.load(Ordering::Acquire)
    }

    pub fn set_cursor(&self, sample: usize, window: usize) {
        self.cursor.sample.store(sample as u8, Ordering::Relaxed);
        self.cursor.window.store(window as u8, Ordering::Release);
    }

    /// Window figures for the current session, or zeroes if no packet hit that window.
    pub fn window_stats(&self, sample: usize, window: usize) -> WindowStats {
        if sample >= MAX_SAMPLES || window >= MAX_WINDOWS_PER_SAMPLE {
            return WindowStats::default();
        }
        let current = self.seen.valid.load(Ordering::Relaxed)
            && self.seen.epoch.load(Ordering::Relaxed) == self.cursor.epoch.load(Ordering::Relaxed);
        let seen_sample = self.seen.sample.load(Ordering::Relaxed) as usize;
        let seen_window = self.seen.window.load(Ordering::Relaxed) as usize;
        if current && (seen_sample, seen_window) >= (sample, window) {
            self.windows[sample][window].load()
        } else {
            WindowStats::default()
        }
    }
}

/// Fixed-capacity table of rows for one direction.
#[derive(Debug)]
pub struct FlowTable {
    direction: Direction,
    rows: Box<[FlowRow]>,
}

impl FlowTable {
    pub fn allocate(direction: Direction, size: usize) -> Result<Self, StcError> {
        let mut rows = Vec::new();
        rows.try_reserve_exact(size)?;
        rows.resize_with(size, FlowRow::default);
        Ok(Self {
            direction,
            rows: rows.into_boxed_slice(),
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, flow_id: u32) -> Result<&FlowRow, StcError> {
        self.rows
            .get(flow_id as usize)
            .ok_or(StcError::InvalidFlowId {
                direction: self.direction,
                flow_id,
                capacity: self.rows.len(),
            })
    }

    /// Row for `flow`, only while it still holds the same flow instance.
    pub fn live_row(&self, flow: FlowRef) -> Option<&FlowRow> {
        self.rows
            .get(flow.flow_id as usize)
            .filter(|row| row.matches(flow))
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &FlowRow)> {
        self.rows.iter().enumerate().map(|(i, row)| (i as u32, row))
    }
}

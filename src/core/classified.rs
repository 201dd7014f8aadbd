//! Classified flow table: what happens to a flow after the classifier spoke.
//!
//! Retirement requests arrive from the flow teardown path as per-direction bits
//! in [`ClassifiedSignals`], which never takes a lock. The periodic sweep
//! consumes them together with activity changes and keeps the peer counters in
//! step.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use serde::Serialize;

use crate::core::flow_table::{FlowRef, FlowTable};
use crate::core::peer::{PeerHandle, PeerTrafficMap};
use crate::core::tuple::{Direction, FlowTuple, TrafficType};
use crate::error::StcError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifiedState {
    #[default]
    Init,
    Adding,
    Added,
}

/// Lifecycle event carried by a classified flow report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowEvent {
    Added,
    Active,
    Inactive,
    Removed,
}

/// Report about one classified flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlowReport {
    pub classified_id: u32,
    pub peer_id: u16,
    pub tuple: FlowTuple,
    pub traffic_type: TrafficType,
    pub event: FlowEvent,
}

/// Per-direction validity bits of a classified entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectionBits(u8);

impl DirectionBits {
    pub fn has(self, dir: Direction) -> bool {
        self.0 & dir.bit() != 0
    }

    pub fn set(&mut self, dir: Direction) {
        self.0 |= dir.bit();
    }

    pub fn clear(&mut self, dir: Direction) {
        self.0 &= !dir.bit();
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Lock-free state shared with the flow teardown path.
#[derive(Debug)]
pub struct ClassifiedSignals {
    retire: Box<[AtomicU8]>,
    occupied: AtomicUsize,
}

impl ClassifiedSignals {
    pub fn allocate(size: usize) -> Result<Self, StcError> {
        let mut retire = Vec::new();
        retire.try_reserve_exact(size)?;
        retire.resize_with(size, AtomicU8::default);
        Ok(Self {
            retire: retire.into_boxed_slice(),
            occupied: AtomicUsize::new(0),
        })
    }

    /// Request retirement of one direction. Returns false if it was already requested.
    pub fn request_retire(&self, classified_id: u32, dir: Direction) -> Result<bool, StcError> {
        let bits = self
            .retire
            .get(classified_id as usize)
            .ok_or(StcError::InvalidClassifiedId(classified_id))?;
        let prev = bits.fetch_or(dir.bit(), Ordering::AcqRel);
        Ok(prev & dir.bit() == 0)
    }

    fn take(&self, classified_id: usize) -> DirectionBits {
        DirectionBits(self.retire[classified_id].swap(0, Ordering::AcqRel))
    }

    pub fn occupied(&self) -> usize {
        self.occupied.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClassifiedEntry {
    pub state: ClassifiedState,
    pub peer_id: u16,
    pub peer: Option<PeerHandle>,
    pub traffic_type: Option<TrafficType>,
    pub tuple: Option<FlowTuple>,
    pub tx: Option<FlowRef>,
    pub rx: Option<FlowRef>,
    pub valid: DirectionBits,
    pub active: bool,
}

impl ClassifiedEntry {
    fn flow(&self, dir: Direction) -> Option<FlowRef> {
        match dir {
            Direction::Tx => self.tx,
            Direction::Rx => self.rx,
        }
    }

    fn report(&self, classified_id: usize, event: FlowEvent) -> Option<FlowReport> {
        Some(FlowReport {
            classified_id: classified_id as u32,
            peer_id: self.peer_id,
            tuple: self.tuple?,
            traffic_type: self.traffic_type?,
            event,
        })
    }
}

/// A verdict ready to be installed in the classified table.
#[derive(Debug, Clone, Copy)]
pub struct ClassifiedFlow {
    pub peer_id: u16,
    pub peer: Option<PeerHandle>,
    pub traffic_type: TrafficType,
    pub tuple: FlowTuple,
    pub tx: Option<FlowRef>,
    pub rx: Option<FlowRef>,
}

/// Activity thresholds in microseconds.
#[derive(Debug, Clone, Copy)]
pub struct ActivityThresholds {
    pub inactivity_us: u64,
    pub resume_us: u64,
}

/// Fixed pool of classified flows.
#[derive(Debug)]
pub struct ClassifiedTable {
    entries: Box<[ClassifiedEntry]>,
}

fn table_for<'a>(dir: Direction, tx: &'a FlowTable, rx: &'a FlowTable) -> &'a FlowTable {
    match dir {
        Direction::Tx => tx,
        Direction::Rx => rx,
    }
}

impl ClassifiedTable {
    pub fn allocate(size: usize) -> Result<Self, StcError> {
        let mut entries = Vec::new();
        entries.try_reserve_exact(size)?;
        entries.resize_with(size, ClassifiedEntry::default);
        Ok(Self {
            entries: entries.into_boxed_slice(),
        })
    }

    pub fn entries(&self) -> &[ClassifiedEntry] {
        &self.entries
    }

    /// Install a classified flow. Returns its slot, or `None` if the table is full.
    pub fn add(
        &mut self,
        flow: ClassifiedFlow,
        signals: &ClassifiedSignals,
        tx_table: &FlowTable,
        rx_table: &FlowTable,
        peers: &PeerTrafficMap,
    ) -> Option<u32> {
        let slot = self
            .entries
            .iter()
            .position(|e| e.state == ClassifiedState::Init)?;
        let id = slot as u32;
        // Bits left over from a previous occupant must not retire the new one.
        signals.take(slot);

        let entry = &mut self.entries[slot];
        entry.state = ClassifiedState::Adding;
        entry.peer_id = flow.peer_id;
        entry.peer = flow.peer;
        entry.traffic_type = Some(flow.traffic_type);
        entry.tuple = Some(flow.tuple);
        entry.tx = flow.tx;
        entry.rx = flow.rx;
        entry.valid = DirectionBits::default();

        for dir in [Direction::Tx, Direction::Rx] {
            if let Some(f) = entry.flow(dir) {
                if let Some(row) = table_for(dir, tx_table, rx_table).live_row(f) {
                    row.set_classified(Some(id));
                    row.set_selected(false);
                    entry.valid.set(dir);
                }
            }
        }

        entry.active = true;
        if let Some(handle) = entry.peer {
            peers.increment(handle, flow.traffic_type);
        }
        entry.state = ClassifiedState::Added;
        signals.occupied.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(
            classified_id = id,
            peer_id = flow.peer_id,
            traffic_type = ?flow.traffic_type,
            "classified flow added"
        );
        Some(id)
    }

    /// Consume retirement bits and evaluate activity for every added entry.
    pub fn sweep(
        &mut self,
        signals: &ClassifiedSignals,
        tx_table: &FlowTable,
        rx_table: &FlowTable,
        peers: &PeerTrafficMap,
        thresholds: ActivityThresholds,
        now_us: u64,
    ) -> Vec<FlowReport> {
        let mut reports = Vec::new();
        for (slot, entry) in self.entries.iter_mut().enumerate() {
            if entry.state != ClassifiedState::Added {
                continue;
            }

            let retire = signals.take(slot);
            for dir in [Direction::Tx, Direction::Rx] {
                if retire.has(dir) {
                    entry.valid.clear(dir);
                }
                // A row reused behind our back counts as retired.
                if entry.valid.has(dir) {
                    let live = entry
                        .flow(dir)
                        .and_then(|f| table_for(dir, tx_table, rx_table).live_row(f));
                    if live.is_none() {
                        entry.valid.clear(dir);
                    }
                }
            }

            let Some(ty) = entry.traffic_type else {
                continue;
            };

            if entry.valid.is_empty() {
                for dir in [Direction::Tx, Direction::Rx] {
                    if let Some(row) = entry
                        .flow(dir)
                        .and_then(|f| table_for(dir, tx_table, rx_table).live_row(f))
                    {
                        row.set_classified(None);
                    }
                }
                if entry.active {
                    if let Some(handle) = entry.peer {
                        peers.decrement(handle, ty);
                        peers.request_indication(handle);
                    }
                }
                reports.extend(entry.report(slot, FlowEvent::Removed));
                tracing::debug!(classified_id = slot, "classified flow retired");
                *entry = ClassifiedEntry::default();
                let _ = signals
                    .occupied
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
                continue;
            }

            let last_seen = [Direction::Tx, Direction::Rx]
                .into_iter()
                .filter(|d| entry.valid.has(*d))
                .filter_map(|d| {
                    entry
                        .flow(d)
                        .and_then(|f| table_for(d, tx_table, rx_table).live_row(f))
                })
                .map(|row| row.last_seen_us())
                .max()
                .unwrap_or(0);
            let idle = now_us.saturating_sub(last_seen);

            if entry.active && idle > thresholds.inactivity_us {
                entry.active = false;
                if let Some(handle) = entry.peer {
                    peers.decrement(handle, ty);
                    peers.request_indication(handle);
                }
                reports.extend(entry.report(slot, FlowEvent::Inactive));
            } else if !entry.active && idle < thresholds.resume_us {
                entry.active = true;
                if let Some(handle) = entry.peer {
                    peers.increment(handle, ty);
                    peers.request_indication(handle);
                }
                reports.extend(entry.report(slot, FlowEvent::Active));
            }

            if entry.active && ty == TrafficType::Ping {
                if let Some(handle) = entry.peer {
                    peers.touch_ping(handle, now_us);
                }
            }
        }
        reports
    }

    /// Request retirement of every direction of every flow owned by `peer_id`.
    pub fn retire_peer(&self, peer_id: u16, signals: &ClassifiedSignals) {
        for (slot, entry) in self.entries.iter().enumerate() {
            if entry.state == ClassifiedState::Added && entry.peer_id == peer_id {
                for dir in [Direction::Tx, Direction::Rx] {
                    let _ = signals.request_retire(slot as u32, dir);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::flow_table::BurstThresholds;
    use crate::core::peer::MacAddr;
    use std::net::{IpAddr, Ipv6Addr};

    const TH: BurstThresholds = BurstThresholds {
        start_time_us: 10_000,
        start_bytes: 3_000,
        end_iat_us: 50_000,
    };
    const ACT: ActivityThresholds = ActivityThresholds {
        inactivity_us: 5_000_000,
        resume_us: 1_000_000,
    };

    struct Fixture {
        tx: FlowTable,
        rx: FlowTable,
        peers: PeerTrafficMap,
        signals: ClassifiedSignals,
        table: ClassifiedTable,
    }

    fn fixture() -> Fixture {
        let peers = PeerTrafficMap::allocate(4).unwrap();
        peers.map(1, MacAddr([2, 0, 0, 0, 0, 1]), 0).unwrap();
        Fixture {
            tx: FlowTable::allocate(Direction::Tx, 4).unwrap(),
            rx: FlowTable::allocate(Direction::Rx, 4).unwrap(),
            peers,
            signals: ClassifiedSignals::allocate(2).unwrap(),
            table: ClassifiedTable::allocate(2).unwrap(),
        }
    }

    fn tuple() -> FlowTuple {
        FlowTuple {
            src_ip: IpAddr::V6(Ipv6Addr::LOCALHOST),
            dst_ip: IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
            src_port: 3478,
            dst_port: 50_000,
            protocol: 17,
        }
    }

    fn add_bidi(fx: &mut Fixture, ty: TrafficType) -> u32 {
        fx.tx.row(0).unwrap().update(0, 200, 10, 1, 0, &TH);
        fx.rx.row(0).unwrap().update(0, 200, 20, 1, 0, &TH);
        fx.table
            .add(
                ClassifiedFlow {
                    peer_id: 1,
                    peer: fx.peers.handle(1),
                    traffic_type: ty,
                    tuple: tuple(),
                    tx: Some(FlowRef { flow_id: 0, tag: 10 }),
                    rx: Some(FlowRef { flow_id: 0, tag: 20 }),
                },
                &fx.signals,
                &fx.tx,
                &fx.rx,
                &fx.peers,
            )
            .unwrap()
    }

    fn sweep(fx: &mut Fixture, now: u64) -> Vec<FlowReport> {
        fx.table
            .sweep(&fx.signals, &fx.tx, &fx.rx, &fx.peers, ACT, now)
    }

    #[test]
    fn test_add_marks_rows_and_counts_peer() {
        let mut fx = fixture();
        let id = add_bidi(&mut fx, TrafficType::VoiceCall);
        assert_eq!(fx.tx.row(0).unwrap().classified_id(), Some(id));
        assert_eq!(fx.rx.row(0).unwrap().classified_id(), Some(id));
        assert_eq!(fx.peers.counter(1, TrafficType::VoiceCall), 1);
        assert_eq!(fx.signals.occupied(), 1);
    }

    #[test]
    fn test_full_table_rejects_add() {
        let mut fx = fixture();
        add_bidi(&mut fx, TrafficType::Gaming);
        add_bidi(&mut fx, TrafficType::Gaming);
        let third = fx.table.add(
            ClassifiedFlow {
                peer_id: 1,
                peer: None,
                traffic_type: TrafficType::Gaming,
                tuple: tuple(),
                tx: None,
                rx: None,
            },
            &fx.signals,
            &fx.tx,
            &fx.rx,
            &fx.peers,
        );
        assert_eq!(third, None);
    }

    #[test]
    fn test_retire_one_direction_keeps_entry() {
        let mut fx = fixture();
        let id = add_bidi(&mut fx, TrafficType::Streaming);
        assert!(fx.signals.request_retire(id, Direction::Rx).unwrap());
        // Setting the same bit twice is a no-op.
        assert!(!fx.signals.request_retire(id, Direction::Rx).unwrap());
        sweep(&mut fx, 100);
        assert_eq!(fx.table.entries()[id as usize].state, ClassifiedState::Added);
        assert_eq!(fx.peers.counter(1, TrafficType::Streaming), 1);
    }

    #[test]
    fn test_retire_last_direction_releases_slot() {
        let mut fx = fixture();
        let id = add_bidi(&mut fx, TrafficType::Streaming);
        fx.signals.request_retire(id, Direction::Rx).unwrap();
        fx.signals.request_retire(id, Direction::Tx).unwrap();
        let reports = sweep(&mut fx, 100);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].event, FlowEvent::Removed);
        assert_eq!(fx.table.entries()[id as usize].state, ClassifiedState::Init);
        assert_eq!(fx.peers.counter(1, TrafficType::Streaming), 0);
        assert!(!fx.tx.row(0).unwrap().is_classified());
        assert_eq!(fx.signals.occupied(), 0);
    }

    #[test]
    fn test_invalid_classified_id() {
        let fx = fixture();
        assert_eq!(
            fx.signals.request_retire(9, Direction::Tx).unwrap_err().kind(),
            "InvalidClassifiedId"
        );
    }

    #[test]
    fn test_peer_counter_conservation_over_lifecycle() {
        let mut fx = fixture();
        let id = add_bidi(&mut fx, TrafficType::Gaming);
        let mut increments = 1;
        let mut decrements = 0;

        // Idle past the inactivity timeout.
        for r in sweep(&mut fx, 6_000_000) {
            if r.event == FlowEvent::Inactive {
                decrements += 1;
            }
        }
        assert_eq!(fx.peers.counter(1, TrafficType::Gaming), 0);

        // Traffic resumes.
        fx.rx.row(0).unwrap().update(6_500_000, 200, 20, 1, 0, &TH);
        for r in sweep(&mut fx, 7_000_000) {
            if r.event == FlowEvent::Active {
                increments += 1;
            }
        }
        assert_eq!(fx.peers.counter(1, TrafficType::Gaming), 1);

        fx.signals.request_retire(id, Direction::Tx).unwrap();
        fx.signals.request_retire(id, Direction::Rx).unwrap();
        for r in sweep(&mut fx, 7_100_000) {
            if r.event == FlowEvent::Removed {
                decrements += 1;
            }
        }
        assert_eq!(increments, decrements);
        assert_eq!(fx.peers.counter(1, TrafficType::Gaming), 0);
    }

    #[test]
    fn test_inactive_flow_retires_without_double_decrement() {
        let mut fx = fixture();
        let first = add_bidi(&mut fx, TrafficType::Gaming);
        let id = add_bidi(&mut fx, TrafficType::Gaming);
        assert_eq!(fx.peers.counter(1, TrafficType::Gaming), 2);
        // Both go inactive, then only `id` is retired.
        sweep(&mut fx, 6_000_000);
        assert_eq!(fx.peers.counter(1, TrafficType::Gaming), 0);
        fx.signals.request_retire(id, Direction::Tx).unwrap();
        fx.signals.request_retire(id, Direction::Rx).unwrap();
        sweep(&mut fx, 6_100_000);
        assert_eq!(fx.peers.counter(1, TrafficType::Gaming), 0);
        assert_eq!(
            fx.table.entries()[first as usize].state,
            ClassifiedState::Added
        );
    }

    #[test]
    fn test_recycled_rows_retire_implicitly() {
        let mut fx = fixture();
        let id = add_bidi(&mut fx, TrafficType::VideoCall);
        fx.tx.row(0).unwrap().update(50, 200, 11, 1, 0, &TH);
        fx.rx.row(0).unwrap().update(50, 200, 21, 1, 0, &TH);
        sweep(&mut fx, 100);
        assert_eq!(fx.table.entries()[id as usize].state, ClassifiedState::Init);
        assert_eq!(fx.peers.counter(1, TrafficType::VideoCall), 0);
    }

    #[test]
    fn test_retire_peer_flags_all_its_flows() {
        let mut fx = fixture();
        let id = add_bidi(&mut fx, TrafficType::Streaming);
        fx.table.retire_peer(1, &fx.signals);
        sweep(&mut fx, 100);
        assert_eq!(fx.table.entries()[id as usize].state, ClassifiedState::Init);
    }
}

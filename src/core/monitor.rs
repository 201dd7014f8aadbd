//! Periodic flow monitor.
//!
//! One pass shortlists eligible flows, promotes them into the sampling table
//! within the per-category quotas, publishes finished samples, reaps failed or
//! abandoned entries, migrates verdicts into the classified table, sweeps it
//! and flushes peer indications.

use std::sync::atomic::Ordering;

use crate::channel::SampleReport;
use crate::config::StcConfig;
use crate::core::classified::{ActivityThresholds, ClassifiedFlow, FlowEvent, FlowReport};
use crate::core::flow_table::{FlowRef, FlowRow, FlowTable};
use crate::core::peer::ActiveTrafficMap;
use crate::core::sampling::{SampleCategory, SamplingCandidate, SamplingQuotas, SamplingState};
use crate::core::tuple::{FlowTuple, TrafficType};
use crate::engine::{lock, StcEngine};

fn is_candidate(row: &FlowRow, cfg: &StcConfig, now_us: u64) -> bool {
    row.is_populated()
        && !row.is_selected()
        && !row.is_classified()
        && row.is_eligible(now_us, cfg.min_flow_age_ms, cfg.min_packet_rate_pps)
}

struct TxCandidate {
    flow: FlowRef,
    tuple: FlowTuple,
    hash: u64,
    peer_id: u16,
    vdev_id: u8,
    paired: bool,
}

fn pending(candidates: &[SamplingCandidate], category: SampleCategory) -> usize {
    candidates.iter().filter(|c| c.category == category).count()
}

/// Pick the flows one pass would promote, respecting remaining quota.
///
/// Rx rows drive the scan: each is paired with the tx row carrying the
/// reversed tuple when bidirectional quota allows, otherwise sampled alone.
/// Tx rows left unpaired fill the tx-only quota.
pub fn shortlist(
    tx: &FlowTable,
    rx: &FlowTable,
    quotas: &SamplingQuotas,
    cfg: &StcConfig,
    now_us: u64,
) -> Vec<SamplingCandidate> {
    let mut tx_rows: Vec<TxCandidate> = tx
        .iter()
        .filter(|(_, row)| is_candidate(row, cfg, now_us))
        .filter_map(|(flow_id, row)| {
            let tuple = row.tuple()?;
            Some(TxCandidate {
                flow: FlowRef {
                    flow_id,
                    tag: row.tag(),
                },
                hash: tuple.bidi_hash(),
                tuple,
                peer_id: row.peer_id(),
                vdev_id: row.vdev_id(),
                paired: false,
            })
        })
        .collect();

    let mut out = Vec::new();
    for (flow_id, row) in rx.iter() {
        if !is_candidate(row, cfg, now_us) {
            continue;
        }
        let Some(tuple) = row.tuple() else {
            continue;
        };
        let rx_ref = FlowRef {
            flow_id,
            tag: row.tag(),
        };
        let hash = tuple.bidi_hash();
        let reverse = tuple.reversed();

        let peer = tx_rows
            .iter_mut()
            .find(|t| !t.paired && t.hash == hash && t.tuple == reverse);
        if let Some(peer) = peer {
            // The tx side belongs to this flow even if it ends up rx-only.
            peer.paired = true;
            if quotas.has_room(SampleCategory::Bidi, pending(&out, SampleCategory::Bidi)) {
                out.push(SamplingCandidate {
                    peer_id: row.peer_id(),
                    vdev_id: row.vdev_id(),
                    category: SampleCategory::Bidi,
                    tuple: peer.tuple,
                    tx: Some(peer.flow),
                    rx: Some(rx_ref),
                });
                continue;
            }
        }
        if quotas.has_room(SampleCategory::RxOnly, pending(&out, SampleCategory::RxOnly)) {
            out.push(SamplingCandidate {
                peer_id: row.peer_id(),
                vdev_id: row.vdev_id(),
                category: SampleCategory::RxOnly,
                tuple,
                tx: None,
                rx: Some(rx_ref),
            });
        }
    }

    for t in tx_rows.iter().filter(|t| !t.paired) {
        if !quotas.has_room(SampleCategory::TxOnly, pending(&out, SampleCategory::TxOnly)) {
            break;
        }
        out.push(SamplingCandidate {
            peer_id: t.peer_id,
            vdev_id: t.vdev_id,
            category: SampleCategory::TxOnly,
            tuple: t.tuple,
            tx: Some(t.flow),
            rx: None,
        });
    }
    out
}

/// Outbound traffic produced under the table locks, sent after they drop.
#[derive(Default)]
struct Outbox {
    samples: Vec<SampleReport>,
    flows: Vec<FlowReport>,
}

impl StcEngine {
    /// One flow monitor pass.
    pub fn monitor_pass(&self) {
        if !self.is_attached() {
            return;
        }
        let now = self.clock.now_us();
        let cfg = &self.config;
        let report_stats = self.report_flow_stats.load(Ordering::Acquire);
        let report_flows = self.report_classified_flows.load(Ordering::Acquire);
        let mut outbox = Outbox::default();

        {
            let mut sampling = lock(&self.sampling);

            let candidates = shortlist(&self.tx_flows, &self.rx_flows, &self.quotas, cfg, now);
            let mut promoted = 0usize;
            for candidate in &candidates {
                if !self.quotas.try_acquire(candidate.category) {
                    continue;
                }
                let Some(slot) = sampling.insert(candidate, self.peers.handle(candidate.peer_id)) else {
                    self.quotas.release(candidate.category);
                    break;
                };
                if let Some(row) = candidate.tx.and_then(|f| self.tx_flows.live_row(f)) {
                    row.set_selected(true);
                }
                if let Some(row) = candidate.rx.and_then(|f| self.rx_flows.live_row(f)) {
                    row.set_selected(true);
                }
                promoted += 1;
                tracing::debug!(
                    slot,
                    category = ?candidate.category,
                    peer_id = candidate.peer_id,
                    "flow promoted to sampling"
                );
            }
            let needs_tick = sampling.entries().iter().any(|e| e.state.needs_tick());
            if promoted > 0 || (needs_tick && !self.tasks.is_timer_running()) {
                self.tasks.arm_timer(self);
            }

            for entry in sampling.entries_mut() {
                if entry.is_free() {
                    continue;
                }
                let new_stats = entry.flags.stats_ready && !entry.flags.stats_sent;
                let new_burst = entry.flags.burst_ready && !entry.flags.burst_sent;
                if new_stats || new_burst {
                    if report_stats {
                        if let Some(payload) = entry.payload(cfg) {
                            outbox.samples.push(SampleReport {
                                payload,
                                flags: entry.flags,
                            });
                        }
                    }
                    entry.flags.stats_sent |= new_stats;
                    entry.flags.burst_sent |= new_burst;
                }
                if entry.state == SamplingState::SamplingDone && entry.flags.all_sent() {
                    entry.transition(SamplingState::SamplesSent);
                }
            }

            let timeout_us = cfg.classification_timeout_ms.saturating_mul(1_000);
            for entry in sampling.entries_mut() {
                match entry.state {
                    SamplingState::SamplingFail => {
                        entry.unselect(&self.tx_flows, &self.rx_flows);
                        entry.stop_tracking(&self.tx_flows, &self.rx_flows);
                        if let Some(cat) = entry.category {
                            self.quotas.release(cat);
                        }
                        entry.transition(SamplingState::Init);
                    }
                    SamplingState::SamplingDone | SamplingState::SamplesSent => {
                        if entry.verdict.is_some() {
                            entry.transition(SamplingState::Classified);
                        } else if now.saturating_sub(entry.done_at_us) > timeout_us {
                            tracing::debug!(peer_id = entry.peer_id, "no verdict in time, sampling entry released");
                            if let Some(cat) = entry.category {
                                self.quotas.release(cat);
                            }
                            entry.transition(SamplingState::Init);
                        }
                    }
                    _ => {}
                }
            }

            let mut classified = lock(&self.classified);
            for entry in sampling.entries_mut() {
                if entry.state != SamplingState::Classified {
                    continue;
                }
                let (Some(traffic_type), Some(tuple)) = (entry.verdict, entry.tuple) else {
                    continue;
                };
                if traffic_type == TrafficType::Unknown {
                    if let Some(cat) = entry.category {
                        self.quotas.release(cat);
                    }
                    entry.transition(SamplingState::Init);
                    continue;
                }
                let flow = ClassifiedFlow {
                    peer_id: entry.peer_id,
                    peer: entry.peer,
                    traffic_type,
                    tuple,
                    tx: entry.tx.map(|f| f.flow),
                    rx: entry.rx.map(|f| f.flow),
                };
                let Some(classified_id) =
                    classified.add(flow, &self.signals, &self.tx_flows, &self.rx_flows, &self.peers)
                else {
                    tracing::debug!("classified table full, migration retried next pass");
                    break;
                };
                if let Some(cat) = entry.category {
                    self.quotas.release(cat);
                }
                entry.transition(SamplingState::Init);
                if report_flows {
                    outbox.flows.push(FlowReport {
                        classified_id,
                        peer_id: flow.peer_id,
                        tuple,
                        traffic_type,
                        event: FlowEvent::Added,
                    });
                }
            }
            drop(sampling);

            let thresholds = ActivityThresholds {
                inactivity_us: cfg.inactivity_timeout_ms.saturating_mul(1_000),
                resume_us: cfg.activity_resume_ms.saturating_mul(1_000),
            };
            let swept = classified.sweep(
                &self.signals,
                &self.tx_flows,
                &self.rx_flows,
                &self.peers,
                thresholds,
                now,
            );
            if report_flows {
                outbox.flows.extend(swept);
            }
        }

        let indications = self.peers.drain_indications(now, cfg.ping_hold_ms.saturating_mul(1_000));
        self.publish(outbox, indications);
    }

    fn publish(&self, outbox: Outbox, indications: Vec<ActiveTrafficMap>) {
        for report in outbox.samples {
            if let Err(e) = self.reporter.send_sample_report(report) {
                tracing::warn!(kind = e.kind(), "sample report dropped: {e}");
            }
        }
        for report in outbox.flows {
            if let Err(e) = self.reporter.send_flow_report(report) {
                tracing::warn!(kind = e.kind(), "flow report dropped: {e}");
            }
        }
        for map in indications {
            if let Err(e) = self.reporter.send_active_traffic_map(map) {
                tracing::warn!(kind = e.kind(), peer_id = map.peer_id, "active traffic map dropped: {e}");
            }
        }
    }
}

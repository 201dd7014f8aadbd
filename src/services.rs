//! Background service lifecycle management.
//!
//! `EngineTasks` owns the tokio tasks that drive an engine:
//! 1. Flow monitor (periodic, armed by the first `on_flow_added`)
//! 2. Sampling timer (self-rescheduling, armed by the monitor while entries need ticks)
//! 3. Classification result listener (optional, fed by an mpsc receiver
//!    through `StcEngine::spawn_result_listener`)
//!
//! Each task body runs to completion between awaits, so one invocation never
//! overlaps the next. Without a tokio runtime nothing is spawned and the caller
//! drives `monitor_pass`/`sampling_tick` by hand.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::channel::ClassificationResult;
use crate::engine::{lock, StcEngine};

#[derive(Debug, Default)]
pub struct EngineTasks {
    shutdown: AtomicBool,
    monitor_running: AtomicBool,
    timer_running: AtomicBool,
    monitor: Mutex<Option<JoinHandle<()>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl EngineTasks {
    /// Start the periodic flow monitor unless it already runs.
    pub fn arm_monitor(&self, engine: &StcEngine) {
        if self.shutdown.load(Ordering::Acquire) || self.monitor_running.swap(true, Ordering::AcqRel) {
            return;
        }
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("no tokio runtime, flow monitor is driven by the caller");
            return;
        };
        let Some(engine) = engine.me.upgrade() else {
            return;
        };
        let period = Duration::from_millis(engine.config.flow_monitor_interval_ms);
        let handle = rt.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if engine.tasks.shutdown.load(Ordering::Acquire) {
                    break;
                }
                engine.monitor_pass();
            }
        });
        *lock(&self.monitor) = Some(handle);
        tracing::debug!("flow monitor armed");
    }

    /// Start the sampling timer unless it already runs. The timer stops by
    /// itself once no sampling entry needs another tick.
    pub fn arm_timer(&self, engine: &StcEngine) {
        if self.shutdown.load(Ordering::Acquire) || self.timer_running.swap(true, Ordering::AcqRel) {
            return;
        }
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("no tokio runtime, sampling timer is driven by the caller");
            return;
        };
        let Some(engine) = engine.me.upgrade() else {
            return;
        };
        let period = Duration::from_millis(engine.config.sampling_timer_interval_ms);
        let handle = rt.spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                if engine.tasks.shutdown.load(Ordering::Acquire) {
                    break;
                }
                if !engine.sampling_tick() {
                    tracing::debug!("sampling timer idle");
                    break;
                }
            }
        });
        *lock(&self.timer) = Some(handle);
        tracing::debug!("sampling timer armed");
    }

    /// Feed classification results from `results` into the engine. Returns
    /// whether a listener task was started.
    pub fn spawn_result_listener(&self, engine: &StcEngine, mut results: mpsc::Receiver<ClassificationResult>) -> bool {
        if self.shutdown.load(Ordering::Acquire) {
            return false;
        }
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("no tokio runtime, classification results are delivered by the caller");
            return false;
        };
        let Some(engine) = engine.me.upgrade() else {
            return false;
        };
        let handle = rt.spawn(async move {
            while let Some(result) = results.recv().await {
                if engine.tasks.shutdown.load(Ordering::Acquire) {
                    break;
                }
                engine.on_classification_result(&result.tuple, result.traffic_type);
            }
        });
        if let Some(previous) = lock(&self.listener).replace(handle) {
            previous.abort();
        }
        tracing::debug!("classification result listener started");
        true
    }

    pub fn mark_timer_idle(&self) {
        self.timer_running.store(false, Ordering::Release);
    }

    pub fn is_timer_running(&self) -> bool {
        self.timer_running.load(Ordering::Acquire)
    }

    pub fn is_monitor_running(&self) -> bool {
        self.monitor_running.load(Ordering::Acquire)
    }

    /// Stop every task and wait until in-flight invocations have finished.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        for slot in [&self.timer, &self.monitor, &self.listener] {
            let handle = lock(slot).take();
            if let Some(handle) = handle {
                handle.abort();
                if let Err(e) = handle.await {
                    if !e.is_cancelled() {
                        tracing::warn!("engine task ended abnormally: {e}");
                    }
                }
            }
        }
        self.timer_running.store(false, Ordering::Release);
        self.monitor_running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{MpscReporter, StcMessage};
    use crate::clock::ManualClock;
    use crate::config::StcConfig;
    use crate::core::sampling::{SampleCategory, SamplingState};
    use crate::core::tuple::{Direction, FlowTuple, TrafficType};
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    fn engine() -> (Arc<StcEngine>, mpsc::Receiver<StcMessage>) {
        let (reporter, rx) = MpscReporter::channel(64);
        let engine = crate::engine::attach(
            StcConfig::default(),
            Arc::new(reporter),
            Arc::new(ManualClock::new(0)),
        )
        .unwrap()
        .unwrap();
        (engine, rx)
    }

    fn tuple() -> FlowTuple {
        FlowTuple {
            src_ip: IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            dst_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)),
            src_port: 53,
            dst_port: 40_000,
            protocol: 17,
        }
    }

    #[test]
    fn test_without_runtime_nothing_is_spawned() {
        let (engine, _rx) = engine();
        engine.on_flow_added(Direction::Rx, 0, tuple(), 1).unwrap();
        assert!(engine.is_monitor_running());
        assert!(lock(&engine.tasks.monitor).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_stops_itself_when_idle() {
        let (engine, _rx) = engine();
        engine.tasks.arm_timer(&engine);
        assert!(engine.is_timer_running());
        tokio::time::sleep(Duration::from_millis(700)).await;
        // No sampling entries: the first tick finds nothing to do.
        assert!(!engine.is_timer_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_detach_stops_monitor_task() {
        let (engine, _rx) = engine();
        engine.on_flow_added(Direction::Rx, 0, tuple(), 1).unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(engine.is_monitor_running());
        engine.detach().await;
        assert!(!engine.is_monitor_running());
        assert!(lock(&engine.tasks.monitor).is_none());
        // Only our handle remains once the task released its clone.
        assert_eq!(Arc::strong_count(&engine), 1);
    }

    /// Park a sampling entry on `tuple()` that has already reported.
    fn reported_entry(engine: &StcEngine) {
        let mut sampling = lock(&engine.sampling);
        let entry = &mut sampling.entries_mut()[0];
        entry.state = SamplingState::SamplesSent;
        entry.category = Some(SampleCategory::RxOnly);
        entry.tuple = Some(tuple());
        entry.tuple_hash = tuple().bidi_hash();
        entry.flags.stats_ready = true;
        entry.flags.stats_sent = true;
    }

    #[test]
    fn test_result_listener_without_runtime_is_not_spawned() {
        let (engine, _rx) = engine();
        let (_tx, rx) = mpsc::channel(4);
        assert!(!engine.spawn_result_listener(rx));
        assert!(lock(&engine.tasks.listener).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_listener_forwards_verdicts() {
        let (engine, _rx) = engine();
        reported_entry(&engine);
        let (tx, rx) = mpsc::channel(4);
        assert!(engine.spawn_result_listener(rx));
        tx.send(ClassificationResult {
            tuple: tuple(),
            traffic_type: TrafficType::Gaming,
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(engine.sampling_states()[0], SamplingState::Classified);
        assert!(lock(&engine.tasks.listener).is_some());

        engine.detach().await;
        assert!(lock(&engine.tasks.listener).is_none());
        assert!(!engine.spawn_result_listener(mpsc::channel(1).1));
        assert_eq!(Arc::strong_count(&engine), 1);
    }
}

//! Deterministic replay of a single streaming flow through the engine.
//!
//! Usage: `stc-sim [config.json]`. Every message the engine publishes is
//! printed as one JSON line. A stand-in classifier answers the final sample
//! report with `streaming` through the engine's result listener.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::sync::mpsc;

use stc_lib::config::REPORT_CHANNEL_DEPTH;
use stc_lib::core::SamplingState;
use stc_lib::{
    ClassificationResult, Direction, FlowTuple, MacAddr, ManualClock, MpscReporter, StcConfig,
    StcEngine, StcMessage, TrafficType,
};

const PEER_ID: u16 = 1;
const PEER_MAC: MacAddr = MacAddr([0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);
const FLOW_ID: u32 = 5;
const FLOW_TAG: u32 = 0x5151;
const PACKET_LEN: u32 = 800;
const PACKET_GAP_MS: u64 = 20;
const RUN_MS: u64 = 30_000;
/// Packets stop halfway so the tail of the run shows the flow going idle.
const TRAFFIC_MS: u64 = 20_000;
const VERDICT_WAIT_POLLS: u32 = 1_000;

fn load_config() -> anyhow::Result<StcConfig> {
    let Some(path) = std::env::args().nth(1) else {
        return Ok(StcConfig::default());
    };
    let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))
}

/// Block until the listener task has installed the verdict just sent.
fn await_verdict(engine: &StcEngine) -> anyhow::Result<()> {
    for _ in 0..VERDICT_WAIT_POLLS {
        if engine.sampling_states().contains(&SamplingState::Classified) {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    bail!("classification result was not applied");
}

fn main() -> anyhow::Result<()> {
    stc_lib::init_tracing();
    let config = load_config()?;
    let monitor_ms = config.flow_monitor_interval_ms;
    let timer_ms = config.sampling_timer_interval_ms;

    let (reporter, mut messages) = MpscReporter::channel(REPORT_CHANNEL_DEPTH);
    let clock = Arc::new(ManualClock::new(0));
    let Some(engine) = stc_lib::attach(config, Arc::new(reporter), clock.clone())? else {
        bail!("engine not attached (disabled by configuration)");
    };

    // Only the listener runs on the runtime. The replay stays outside its
    // context, so the monitor and the timer remain driven by this loop.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()?;
    let (results, verdicts) = mpsc::channel(1);
    let listening = {
        let _rt = rt.enter();
        engine.spawn_result_listener(verdicts)
    };
    if !listening {
        bail!("classification result listener not started");
    }

    let tuple = FlowTuple {
        src_ip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10)),
        dst_ip: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
        src_port: 443,
        dst_port: 51_000,
        protocol: 6,
    };
    engine.on_peer_map(PEER_ID, PEER_MAC, 0)?;
    engine.on_flow_added(Direction::Rx, FLOW_ID, tuple, FLOW_TAG)?;

    let mut answered = false;
    for t in 0..=RUN_MS {
        clock.set(t * 1_000);
        if t < TRAFFIC_MS && t % PACKET_GAP_MS == 0 {
            engine.track(Direction::Rx, FLOW_ID, PEER_ID, 0, PACKET_LEN, FLOW_TAG)?;
        }
        if t > 0 && t % monitor_ms == 0 {
            engine.monitor_pass();
        }
        if t > 0 && t % timer_ms == 0 && engine.is_timer_running() {
            engine.sampling_tick();
        }

        while let Ok(msg) = messages.try_recv() {
            println!("{}", serde_json::to_string(&msg)?);
            if let StcMessage::Sample(report) = &msg {
                if !answered && report.flags.burst_ready {
                    results
                        .blocking_send(ClassificationResult {
                            tuple: report.payload.tuple,
                            traffic_type: TrafficType::Streaming,
                        })
                        .context("result listener gone")?;
                    await_verdict(&engine)?;
                    answered = true;
                }
            }
        }
    }

    tracing::info!(
        streaming = engine.peer_counter(PEER_ID, TrafficType::Streaming),
        classified = engine.classified_flows(),
        "replay finished"
    );
    rt.block_on(engine.detach());
    Ok(())
}

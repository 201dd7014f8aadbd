//! Centralized runtime constants and engine configuration.
//!
//! All tunable intervals, thresholds and pool sizes are collected here. The
//! constants are the defaults; `StcConfig` carries the values an engine instance
//! actually runs with. Loading a config from disk is the caller's business.

use serde::{Deserialize, Serialize};

use crate::error::StcError;

/// Upper bound on sample slots kept per flow row.
pub const MAX_SAMPLES: usize = 4;

/// Upper bound on windows per sample slot kept per flow row.
pub const MAX_WINDOWS_PER_SAMPLE: usize = 5;

/// Flow rows per direction table.
pub const FLOW_TABLE_SIZE: usize = 128;

/// Concurrently sampled bidirectional flows.
pub const MAX_BIDI_FLOWS: usize = 3;

/// Concurrently sampled transmit-only flows.
pub const MAX_TX_FLOWS: usize = 1;

/// Concurrently sampled receive-only flows.
pub const MAX_RX_FLOWS: usize = 1;

/// Classified flow slots.
pub const CLASSIFIED_TABLE_SIZE: usize = 32;

/// Peer slots in the active traffic map.
pub const MAX_PEERS: usize = 64;

/// Interval of the periodic flow monitor (milliseconds).
pub const FLOW_MONITOR_INTERVAL_MS: u64 = 100;

/// Interval of one sampling timer tick (milliseconds).
pub const SAMPLING_TIMER_INTERVAL_MS: u64 = 600;

/// Samples collected per sampled flow.
pub const NUM_SAMPLES: usize = 3;

/// Windows per sample.
pub const WINDOWS_PER_SAMPLE: usize = 5;

/// Total timer ticks a sampling entry may consume, burst collection included.
pub const SAMPLING_MAX_ATTEMPTS: u32 = 20;

/// A flow must be older than this to be shortlisted (milliseconds).
pub const MIN_FLOW_AGE_MS: u64 = 1_000;

/// A flow must average at least this many packets per second to be shortlisted.
pub const MIN_PACKET_RATE_PPS: u64 = 20;

/// Burst detection window (microseconds).
pub const BURST_START_TIME_US: u64 = 10_000;

/// Bytes that must arrive within the detection window to declare a burst.
pub const BURST_START_BYTES: u64 = 3_000;

/// Inter-arrival gap that ends an active burst (microseconds).
pub const BURST_END_IAT_US: u64 = 50_000;

/// A classified flow with no packets for this long becomes inactive (milliseconds).
pub const INACTIVITY_TIMEOUT_MS: u64 = 5_000;

/// An inactive classified flow that saw a packet within this span resumes (milliseconds).
pub const ACTIVITY_RESUME_MS: u64 = 1_000;

/// The PING bit stays set for this long after the last ping activity (milliseconds).
pub const PING_HOLD_MS: u64 = 10_000;

/// Sampled flows with no verdict this long after sampling finished are dropped (milliseconds).
pub const CLASSIFICATION_TIMEOUT_MS: u64 = 10_000;

/// Largest millisecond setting accepted; the engine keeps time in microseconds.
pub const MAX_DURATION_MS: u64 = u64::MAX / 1_000;

/// Depth of the outbound report channel.
pub const REPORT_CHANNEL_DEPTH: usize = 256;

/// Engine configuration. Every field defaults to the constant of the same name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StcConfig {
    /// Master switch; `attach` is a no-op when false.
    pub enabled: bool,
    pub flow_table_size: usize,
    pub max_bidi_flows: usize,
    pub max_tx_flows: usize,
    pub max_rx_flows: usize,
    pub classified_table_size: usize,
    pub max_peers: usize,
    pub flow_monitor_interval_ms: u64,
    pub sampling_timer_interval_ms: u64,
    pub num_samples: usize,
    pub windows_per_sample: usize,
    pub sampling_max_attempts: u32,
    pub min_flow_age_ms: u64,
    pub min_packet_rate_pps: u64,
    pub burst_start_time_us: u64,
    pub burst_start_bytes: u64,
    pub burst_end_iat_us: u64,
    pub inactivity_timeout_ms: u64,
    pub activity_resume_ms: u64,
    pub ping_hold_ms: u64,
    pub classification_timeout_ms: u64,
    /// Initial state of the flow statistics reporting policy toggle.
    pub report_flow_stats: bool,
    /// Initial state of the classified flow reporting policy toggle.
    pub report_classified_flows: bool,
}

impl Default for StcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            flow_table_size: FLOW_TABLE_SIZE,
            max_bidi_flows: MAX_BIDI_FLOWS,
            max_tx_flows: MAX_TX_FLOWS,
            max_rx_flows: MAX_RX_FLOWS,
            classified_table_size: CLASSIFIED_TABLE_SIZE,
            max_peers: MAX_PEERS,
            flow_monitor_interval_ms: FLOW_MONITOR_INTERVAL_MS,
            sampling_timer_interval_ms: SAMPLING_TIMER_INTERVAL_MS,
            num_samples: NUM_SAMPLES,
            windows_per_sample: WINDOWS_PER_SAMPLE,
            sampling_max_attempts: SAMPLING_MAX_ATTEMPTS,
            min_flow_age_ms: MIN_FLOW_AGE_MS,
            min_packet_rate_pps: MIN_PACKET_RATE_PPS,
            burst_start_time_us: BURST_START_TIME_US,
            burst_start_bytes: BURST_START_BYTES,
            burst_end_iat_us: BURST_END_IAT_US,
            inactivity_timeout_ms: INACTIVITY_TIMEOUT_MS,
            activity_resume_ms: ACTIVITY_RESUME_MS,
            ping_hold_ms: PING_HOLD_MS,
            classification_timeout_ms: CLASSIFICATION_TIMEOUT_MS,
            report_flow_stats: true,
            report_classified_flows: true,
        }
    }
}

impl StcConfig {
    /// Capacity of the sampling table: the sum of all per-category quotas.
    pub fn sampling_table_size(&self) -> usize {
        self.max_bidi_flows + self.max_tx_flows + self.max_rx_flows
    }

    /// Timer ticks spent in the window-sampling phase.
    pub fn sampling_ticks(&self) -> u32 {
        (self.num_samples * self.windows_per_sample) as u32
    }

    /// Reject configurations the fixed row layout or the state machines cannot honour.
    pub fn validate(&self) -> Result<(), StcError> {
        if self.num_samples == 0 || self.num_samples > MAX_SAMPLES {
            return Err(StcError::InvalidConfig(format!(
                "num_samples must be in 1..={MAX_SAMPLES}, got {}",
                self.num_samples
            )));
        }
        if self.windows_per_sample == 0 || self.windows_per_sample > MAX_WINDOWS_PER_SAMPLE {
            return Err(StcError::InvalidConfig(format!(
                "windows_per_sample must be in 1..={MAX_WINDOWS_PER_SAMPLE}, got {}",
                self.windows_per_sample
            )));
        }
        // One tick for FLOW_ADDED, the window ticks, then at least one burst tick.
        if self.sampling_max_attempts <= self.sampling_ticks() + 1 {
            return Err(StcError::InvalidConfig(format!(
                "sampling_max_attempts ({}) must exceed {} ticks",
                self.sampling_max_attempts,
                self.sampling_ticks() + 1
            )));
        }
        if self.flow_table_size == 0 || self.flow_table_size > u32::MAX as usize {
            return Err(StcError::InvalidConfig("flow_table_size out of range".into()));
        }
        if self.max_peers == 0 || self.max_peers > u16::MAX as usize {
            return Err(StcError::InvalidConfig("max_peers out of range".into()));
        }
        if self.sampling_table_size() == 0 {
            return Err(StcError::InvalidConfig("all sampling quotas are zero".into()));
        }
        if self.classified_table_size == 0 {
            return Err(StcError::InvalidConfig("classified_table_size is zero".into()));
        }
        if self.flow_monitor_interval_ms == 0 || self.sampling_timer_interval_ms == 0 {
            return Err(StcError::InvalidConfig("task intervals must be positive".into()));
        }
        for (name, ms) in [
            ("flow_monitor_interval_ms", self.flow_monitor_interval_ms),
            ("sampling_timer_interval_ms", self.sampling_timer_interval_ms),
            ("min_flow_age_ms", self.min_flow_age_ms),
            ("inactivity_timeout_ms", self.inactivity_timeout_ms),
            ("activity_resume_ms", self.activity_resume_ms),
            ("ping_hold_ms", self.ping_hold_ms),
            ("classification_timeout_ms", self.classification_timeout_ms),
        ] {
            if ms > MAX_DURATION_MS {
                return Err(StcError::InvalidConfig(format!(
                    "{name} must be at most {MAX_DURATION_MS}, got {ms}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(StcConfig::default().validate().is_ok());
    }

    #[test]
    fn test_sampling_table_size_is_sum_of_quotas() {
        let cfg = StcConfig::default();
        assert_eq!(
            cfg.sampling_table_size(),
            MAX_BIDI_FLOWS + MAX_TX_FLOWS + MAX_RX_FLOWS
        );
    }

    #[test]
    fn test_rejects_too_many_samples() {
        let cfg = StcConfig {
            num_samples: MAX_SAMPLES + 1,
            ..StcConfig::default()
        };
        assert_eq!(cfg.validate().unwrap_err().kind(), "InvalidConfig");
    }

    #[test]
    fn test_rejects_attempt_budget_without_burst_tick() {
        let cfg = StcConfig {
            sampling_max_attempts: (NUM_SAMPLES * WINDOWS_PER_SAMPLE) as u32 + 1,
            ..StcConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_durations_bounded_by_microsecond_range() {
        let at_limit = StcConfig {
            classification_timeout_ms: MAX_DURATION_MS,
            inactivity_timeout_ms: MAX_DURATION_MS,
            activity_resume_ms: MAX_DURATION_MS,
            ping_hold_ms: MAX_DURATION_MS,
            ..StcConfig::default()
        };
        assert!(at_limit.validate().is_ok());

        for cfg in [
            StcConfig {
                classification_timeout_ms: u64::MAX,
                ..StcConfig::default()
            },
            StcConfig {
                inactivity_timeout_ms: MAX_DURATION_MS + 1,
                ..StcConfig::default()
            },
            StcConfig {
                activity_resume_ms: MAX_DURATION_MS + 1,
                ..StcConfig::default()
            },
            StcConfig {
                ping_hold_ms: u64::MAX,
                ..StcConfig::default()
            },
        ] {
            assert_eq!(cfg.validate().unwrap_err().kind(), "InvalidConfig");
        }
    }

    #[test]
    fn test_oversized_timeout_in_json_is_rejected() {
        let cfg: StcConfig =
            serde_json::from_str(r#"{ "classification_timeout_ms": 18446744073709551615 }"#).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let cfg: StcConfig = serde_json::from_str(r#"{ "max_rx_flows": 4 }"#).unwrap();
        assert_eq!(cfg.max_rx_flows, 4);
        assert_eq!(cfg.flow_table_size, FLOW_TABLE_SIZE);
        assert!(cfg.enabled);
    }

    /// Compile-time sanity: defaults fit the fixed row layout.
    #[test]
    fn test_defaults_fit_row_layout() {
        const _: () = assert!(NUM_SAMPLES <= MAX_SAMPLES);
        const _: () = assert!(WINDOWS_PER_SAMPLE <= MAX_WINDOWS_PER_SAMPLE);
        const _: () = assert!(FLOW_MONITOR_INTERVAL_MS < SAMPLING_TIMER_INTERVAL_MS);
    }
}

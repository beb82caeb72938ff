//! Timeshift tuning knobs

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeshiftTuning {
    pub cleanup_interval_ms: u64,
    pub late_packet_threshold_ms: f64,
    pub target_buffer_level_ms: f64,
    pub loop_max_sleep_ms: u64,
    pub max_catchup_lag_ms: f64,
    pub max_clock_pending_packets: usize,
    pub rtp_continuity_slack_seconds: f64,
    pub rtp_session_reset_threshold_seconds: f64,
    pub playback_ratio_max_deviation_ppm: f64,
    pub playback_ratio_slew_ppm_per_sec: f64,
    pub playback_ratio_kp: f64,
    pub playback_ratio_ki: f64,
    pub playback_ratio_integral_limit_ppm: f64,
    pub playback_ratio_smoothing: f64,
    pub playback_ratio_inbound_rate_smoothing: f64,
    pub playback_rate_adjustment_enabled: bool,
}

impl Default for TimeshiftTuning {
    fn default() -> Self {
        Self {
            cleanup_interval_ms: 1000,
            late_packet_threshold_ms: 100.0,
            target_buffer_level_ms: 60.0,
            loop_max_sleep_ms: 5,
            max_catchup_lag_ms: 500.0,
            max_clock_pending_packets: 512,
            rtp_continuity_slack_seconds: 2.0,
            rtp_session_reset_threshold_seconds: 5.0,
            playback_ratio_max_deviation_ppm: 2000.0,
            playback_ratio_slew_ppm_per_sec: 500.0,
            playback_ratio_kp: 0.6,
            playback_ratio_ki: 0.05,
            playback_ratio_integral_limit_ppm: 1000.0,
            playback_ratio_smoothing: 0.1,
            playback_ratio_inbound_rate_smoothing: 0.05,
            playback_rate_adjustment_enabled: true,
        }
    }
}

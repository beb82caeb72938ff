//! Engine tuning settings
//!
//! The aggregate recognized by `set_audio_settings`. The timeshift and
//! processor subsections live with their owning crates and are re-exported
//! here; `rtp_receiver_tuning` and `system_audio_tuning` belong to the
//! external ingress collaborators and are carried round-trip only.

use serde::{Deserialize, Serialize};

pub use sr_dsp::ProcessorTuning;
pub use sr_timeshift::TimeshiftTuning;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerTuning {
    pub mp3_bitrate_kbps: u32,
    pub mp3_vbr_enabled: bool,
    pub mp3_output_queue_max_size: usize,
    /// Grace period an active lane may run dry before it counts an
    /// underrun and the cycle proceeds with silence
    pub underrun_hold_timeout_ms: u64,
    pub max_input_queue_chunks: usize,
    /// Chunks a lane must buffer before it starts contributing
    pub min_input_queue_chunks: usize,
    pub max_ready_chunks_per_source: usize,
    pub max_queued_chunks: usize,
}

impl Default for MixerTuning {
    fn default() -> Self {
        Self {
            mp3_bitrate_kbps: 192,
            mp3_vbr_enabled: false,
            mp3_output_queue_max_size: 64,
            underrun_hold_timeout_ms: 50,
            max_input_queue_chunks: 16,
            min_input_queue_chunks: 2,
            max_ready_chunks_per_source: 8,
            max_queued_chunks: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceProcessorTuning {
    pub command_loop_sleep_ms: u64,
    pub discontinuity_threshold_ms: f64,
}

impl Default for SourceProcessorTuning {
    fn default() -> Self {
        Self {
            command_loop_sleep_ms: 5,
            discontinuity_threshold_ms: 100.0,
        }
    }
}

/// Ingress-side knobs, consumed by the RTP receiver collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtpReceiverTuning {
    pub max_payload_bytes: usize,
    pub reorder_grace_ms: u64,
}

impl Default for RtpReceiverTuning {
    fn default() -> Self {
        Self {
            max_payload_bytes: 1452,
            reorder_grace_ms: 20,
        }
    }
}

/// Host-capture knobs, consumed by the system-audio collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemAudioTuning {
    pub device_period_ms: u64,
    pub shared_buffer_frames: usize,
}

impl Default for SystemAudioTuning {
    fn default() -> Self {
        Self {
            device_period_ms: 10,
            shared_buffer_frames: 4096,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioEngineSettings {
    pub timeshift_tuning: TimeshiftTuning,
    pub mixer_tuning: MixerTuning,
    pub source_processor_tuning: SourceProcessorTuning,
    pub processor_tuning: ProcessorTuning,
    pub rtp_receiver_tuning: RtpReceiverTuning,
    pub system_audio_tuning: SystemAudioTuning,
}

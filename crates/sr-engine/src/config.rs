//! Sink and source configuration consumed from the control plane

use serde::{Deserialize, Serialize};
use sr_core::{channel_mask, AudioFormat, EngineResult, Sample, SpeakerLayout};
use sr_dsp::EQ_BANDS;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkProtocol {
    Scream,
    Rtp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    pub id: String,
    pub output_ip: String,
    pub output_port: u16,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
    /// WAVEFORMATEX mask; derived from the channel count when omitted
    #[serde(default)]
    pub channel_layout: Option<u16>,
    pub protocol: SinkProtocol,
    #[serde(default)]
    pub enable_mp3: bool,
    #[serde(default)]
    pub time_sync_enabled: bool,
    #[serde(default)]
    pub time_sync_delay_ms: u32,
    /// Downmix applied by processors feeding this sink when their source
    /// configures no layout of its own
    #[serde(default)]
    pub speaker_layout: Option<SpeakerLayout>,
    /// Divide by the active-lane count instead of soft-clipping the sum
    #[serde(default)]
    pub volume_normalization: bool,
}

impl SinkConfig {
    pub fn format(&self) -> EngineResult<AudioFormat> {
        AudioFormat::new(self.sample_rate, self.channels, self.bit_depth)
    }

    pub fn layout_mask(&self) -> u16 {
        self.channel_layout
            .unwrap_or_else(|| channel_mask::default_for(self.channels))
    }
}

fn default_volume() -> Sample {
    1.0
}

fn flat_eq() -> [Sample; EQ_BANDS] {
    [1.0; EQ_BANDS]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Stable ingress stream identifier this instance subscribes to
    pub tag: String,
    #[serde(default = "default_volume")]
    pub initial_volume: Sample,
    #[serde(default)]
    pub initial_delay_ms: u32,
    #[serde(default)]
    pub initial_timeshift_sec: f64,
    pub target_output_channels: u16,
    pub target_output_samplerate: u32,
    #[serde(default = "flat_eq")]
    pub initial_eq: [Sample; EQ_BANDS],
    /// Per-input-channel-count layout overrides
    #[serde(default)]
    pub speaker_layouts_map: HashMap<u16, SpeakerLayout>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_defaults_from_json() {
        let cfg: SinkConfig = serde_json::from_str(
            r#"{"id":"living-room","output_ip":"192.168.1.40","output_port":4010,
                "sample_rate":48000,"channels":2,"bit_depth":16,"protocol":"scream"}"#,
        )
        .unwrap();
        assert!(!cfg.time_sync_enabled);
        assert_eq!(cfg.layout_mask(), 0x0003);
        assert!(cfg.format().is_ok());
    }

    #[test]
    fn test_source_defaults() {
        let cfg: SourceConfig = serde_json::from_str(
            r#"{"tag":"10.0.0.7","target_output_channels":2,"target_output_samplerate":48000}"#,
        )
        .unwrap();
        assert_eq!(cfg.initial_volume, 1.0);
        assert_eq!(cfg.initial_eq, [1.0; EQ_BANDS]);
        assert!(cfg.speaker_layouts_map.is_empty());
    }

    #[test]
    fn test_rtp_protocol_tag() {
        let cfg: SinkConfig = serde_json::from_str(
            r#"{"id":"s","output_ip":"10.0.0.1","output_port":5004,
                "sample_rate":48000,"channels":2,"bit_depth":24,"protocol":"rtp"}"#,
        )
        .unwrap();
        assert_eq!(cfg.protocol, SinkProtocol::Rtp);
    }
}

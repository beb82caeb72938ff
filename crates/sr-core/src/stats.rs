//! Statistics snapshot tree
//!
//! Components keep `AtomicU64` counters; snapshots assemble by reading each
//! counter once. These structs are the read-only surface handed to the
//! monitoring collaborator.

use serde::Serialize;

/// Engine-wide counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct GlobalStats {
    pub packets_ingested: u64,
    pub packets_dispatched: u64,
    pub packets_discarded: u64,
    pub active_sources: usize,
    pub active_sinks: usize,
    pub uptime_secs: f64,
}

/// Per source-tag stream state inside the timeshift manager
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamStats {
    pub source_tag: String,
    pub ring_packets: usize,
    pub anchor_resets: u64,
    pub late_drops: u64,
    pub jitter_ms: f64,
    pub playback_rate: f64,
    pub inbound_packet_rate: f64,
}

/// Per source-instance processing counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceStats {
    pub instance_id: u64,
    pub source_tag: String,
    pub chunks_emitted: u64,
    pub reconfigurations: u64,
    pub discontinuity_flushes: u64,
    pub lane_drops: u64,
    pub healthy: bool,
}

/// Per sink mixing and transmit counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct SinkStats {
    pub sink_id: String,
    pub cycles: u64,
    pub underruns: u64,
    pub barrier_timeouts: u64,
    pub send_failures: u64,
    pub tap_drops: u64,
    pub total_samples_output: u64,
    pub last_rtp_timestamp: u32,
    pub buffer_fill: f64,
    pub healthy: bool,
    pub sync_degraded: bool,
}

/// Full stats snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct AudioEngineStats {
    pub global: GlobalStats,
    pub streams: Vec<StreamStats>,
    pub sources: Vec<SourceStats>,
    pub sinks: Vec<SinkStats>,
}

//! sr-engine: mixers, source processors, synchronization, lifecycle
//!
//! The engine wires the leaf crates into the running topology:
//! packets → timeshift → per-instance source processors → per-sink lanes →
//! mixers → network senders, all gated by the per-rate synchronization
//! clock when sinks opt into time sync. `AudioManager` is the single
//! lifecycle entry point.

mod clock;
mod config;
mod coordinator;
mod lane;
mod manager;
mod mixer;
mod settings;
mod source;

pub use clock::{BarrierWait, GlobalSynchronizationClock, SinkTimingReport, SyncTuning};
pub use config::{SinkConfig, SinkProtocol, SourceConfig};
pub use coordinator::SinkSynchronizationCoordinator;
pub use lane::{create_lane, LaneSender, SinkInputLane};
pub use manager::AudioManager;
pub use mixer::{MixerCommand, SinkAudioMixer};
pub use settings::{
    AudioEngineSettings, MixerTuning, RtpReceiverTuning, SourceProcessorTuning, SystemAudioTuning,
};
pub use source::{SourceCommand, SourceInputProcessor, SourceParameterUpdate};

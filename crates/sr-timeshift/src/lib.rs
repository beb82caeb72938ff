//! sr-timeshift: the jitter/history buffer and time-ordered dispatcher
//!
//! Absorbs network arrival jitter, anchors each source's RTP clock onto the
//! local monotonic clock, and hands subscribers a monotonically-advancing
//! packet stream. Also owns the per-source playback-rate PI controller that
//! keeps subscriber buffers near their target level.

mod anchor;
mod config;
mod manager;
mod rate;

pub use anchor::StreamAnchor;
pub use config::TimeshiftTuning;
pub use manager::{SubscriberQueue, TimeshiftManager};
pub use rate::PlaybackRateController;

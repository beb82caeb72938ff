//! Engine error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid sample rate: {0}")]
    InvalidSampleRate(u32),

    #[error("invalid channel count: {0} (expected 1..=8)")]
    InvalidChannelCount(u16),

    #[error("invalid bit depth: {0} (expected 16, 24 or 32)")]
    InvalidBitDepth(u16),

    #[error("invalid speaker matrix dimensions: {rows}x{cols}")]
    InvalidMatrix { rows: usize, cols: usize },

    #[error("sink already exists: {0}")]
    DuplicateSink(String),

    #[error("sink not found: {0}")]
    UnknownSink(String),

    #[error("source instance not found: {0}")]
    UnknownSourceInstance(u64),

    #[error("source {0} is not connected to sink {1}")]
    NotConnected(u64, String),

    #[error("source {0} output format does not match sink {1}")]
    FormatMismatch(u64, String),

    #[error("engine is not initialized")]
    NotInitialized,

    #[error("sender init failed: {0}")]
    SenderInit(#[source] std::io::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

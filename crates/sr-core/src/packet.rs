//! Packet and chunk containers
//!
//! `TaggedAudioPacket` is created on ingress and owned by the timeshift
//! manager until dispatch, then moved to its subscriber. A
//! `ProcessedAudioChunk` travels from one source processor to exactly one
//! sink lane; its sample buffer is pooled so the steady-state path does not
//! allocate.

use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::{AudioFormat, MonoTime, CHUNK_FRAMES};

/// One ingress PCM packet with its stream metadata
#[derive(Debug, Clone)]
pub struct TaggedAudioPacket {
    /// Stable ingress stream identifier (typically the sender address)
    pub source_tag: Arc<str>,
    /// Monotonic arrival time
    pub arrival: MonoTime,
    /// RTP timestamp when the ingress protocol carries one
    pub rtp_timestamp: Option<u32>,
    pub format: AudioFormat,
    /// WAVEFORMATEX channel mask as received
    pub channel_layout: u16,
    /// Rate hint stamped by the dispatcher just before handoff
    pub playback_rate: f64,
    pub payload: Vec<u8>,
}

impl TaggedAudioPacket {
    /// Stream duration covered by the payload, in seconds
    pub fn duration_secs(&self) -> f64 {
        self.format
            .frames_to_secs(self.format.frames_in(self.payload.len()))
    }
}

/// Fixed-size processed PCM block at a sink's target format
#[derive(Debug)]
pub struct ProcessedAudioChunk {
    samples: Vec<i32>,
    pub source_tag: Arc<str>,
    /// RTP timestamp of the first frame, in the origin stream's clock
    pub rtp_timestamp: u32,
    /// Latest time the owning mixer should emit this chunk
    pub deadline: MonoTime,
    pub format: AudioFormat,
    recycle: Option<Sender<Vec<i32>>>,
}

impl ProcessedAudioChunk {
    pub fn new(
        samples: Vec<i32>,
        source_tag: Arc<str>,
        rtp_timestamp: u32,
        deadline: MonoTime,
        format: AudioFormat,
        recycle: Option<Sender<Vec<i32>>>,
    ) -> Self {
        debug_assert_eq!(samples.len(), CHUNK_FRAMES * format.channels as usize);
        Self {
            samples,
            source_tag,
            rtp_timestamp,
            deadline,
            format,
            recycle,
        }
    }

    #[inline]
    pub fn samples(&self) -> &[i32] {
        &self.samples
    }
}

impl Drop for ProcessedAudioChunk {
    fn drop(&mut self) {
        // Hand the buffer back to the producing pool; if the pool is gone
        // or full the buffer just frees normally.
        if let Some(recycle) = self.recycle.take() {
            let buf = std::mem::take(&mut self.samples);
            let _ = recycle.try_send(buf);
        }
    }
}

/// Fixed-capacity free list of chunk sample buffers.
///
/// Prefilled at construction; `acquire` only allocates when the pool has
/// been drained faster than chunks are dropped, which is a startup or
/// overload transient rather than the steady state.
#[derive(Debug, Clone)]
pub struct ChunkPool {
    tx: Sender<Vec<i32>>,
    rx: Receiver<Vec<i32>>,
    chunk_len: usize,
}

impl ChunkPool {
    pub fn new(capacity: usize, chunk_len: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        for _ in 0..capacity {
            let _ = tx.try_send(vec![0i32; chunk_len]);
        }
        Self { tx, rx, chunk_len }
    }

    /// Take a zeroed buffer of `chunk_len` samples
    pub fn acquire(&self) -> Vec<i32> {
        match self.rx.try_recv() {
            Ok(mut buf) => {
                buf.clear();
                buf.resize(self.chunk_len, 0);
                buf
            }
            Err(_) => vec![0i32; self.chunk_len],
        }
    }

    /// Return side of the pool, attached to emitted chunks
    pub fn recycler(&self) -> Sender<Vec<i32>> {
        self.tx.clone()
    }

    #[inline]
    pub fn chunk_len(&self) -> usize {
        self.chunk_len
    }
}

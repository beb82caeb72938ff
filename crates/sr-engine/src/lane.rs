//! Per-(source instance, sink) chunk lanes
//!
//! Bounded SPSC rings of processed chunks. The producer half lives with
//! the source processor, the consumer half with the mixer. A full lane
//! drops the newest chunk with a counter; the chunk's buffer flows back to
//! its pool either way.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sr_core::{MonoTime, ProcessedAudioChunk};

pub struct LaneSender {
    producer: rtrb::Producer<ProcessedAudioChunk>,
    drops: Arc<AtomicU64>,
}

impl LaneSender {
    /// Push one chunk; a saturated lane counts a drop and recycles the
    /// chunk's buffer via its pool.
    pub fn push(&mut self, chunk: ProcessedAudioChunk) {
        if self.producer.push(chunk).is_err() {
            self.drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }
}

pub struct SinkInputLane {
    pub source_instance: u64,
    consumer: rtrb::Consumer<ProcessedAudioChunk>,
    /// Set once the lane has delivered a chunk; silence before that is
    /// prebuffering, not an underrun
    started: bool,
    /// When a started lane last had data
    empty_since: Option<MonoTime>,
    /// Underrun already charged for the current dry spell
    underrun_charged: bool,
}

impl SinkInputLane {
    pub fn pop(&mut self) -> Option<ProcessedAudioChunk> {
        self.consumer.pop().ok()
    }

    pub fn buffered(&self) -> usize {
        self.consumer.slots()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn mark_delivered(&mut self) {
        self.started = true;
        self.empty_since = None;
        self.underrun_charged = false;
    }

    /// Track a dry cycle at `now`; returns true exactly once per dry
    /// spell that outlives the grace period.
    pub fn mark_empty(&mut self, now: MonoTime, grace_secs: f64) -> bool {
        if !self.started {
            return false;
        }
        let since = *self.empty_since.get_or_insert(now);
        if !self.underrun_charged && now - since >= grace_secs {
            self.underrun_charged = true;
            return true;
        }
        false
    }
}

/// Create a connected lane pair of the given chunk capacity. `drops` is
/// shared so one source can aggregate across all of its lanes.
pub fn create_lane(
    source_instance: u64,
    capacity: usize,
    drops: Arc<AtomicU64>,
) -> (LaneSender, SinkInputLane) {
    let (producer, consumer) = rtrb::RingBuffer::new(capacity.max(2));
    (
        LaneSender { producer, drops },
        SinkInputLane {
            source_instance,
            consumer,
            started: false,
            empty_since: None,
            underrun_charged: false,
        },
    )
}

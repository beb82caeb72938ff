//! Global synchronization clock
//!
//! One clock per sample rate. It is the master RTP-time authority for its
//! rate group, runs the reusable generation-counter dispatch barrier, and
//! turns per-sink output accounting into bounded rate adjustments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use sr_core::MonoTime;

/// Synchronization constants for a rate group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncTuning {
    /// Proportional gain applied to the smoothed error, per second
    pub kp: f64,
    /// EMA factor for the sample error, in [0, 1]
    pub error_smoothing: f64,
    /// Clamp for the rate adjustment around unity
    pub max_rate_adjustment: f64,
    pub barrier_timeout_ms: u64,
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            kp: 0.1,
            error_smoothing: 0.1,
            max_rate_adjustment: 0.005,
            barrier_timeout_ms: 50,
        }
    }
}

/// Outcome of a barrier wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierWait {
    /// All sinks arrived (or the group has at most one active sink)
    Released,
    /// Timed out; dispatch proceeds anyway
    TimedOut,
}

/// Per-cycle accounting a sink reports back to its clock
#[derive(Debug, Clone, Copy)]
pub struct SinkTimingReport {
    pub samples_output: u64,
    pub last_rtp_timestamp: u32,
    pub underruns: u64,
    /// Estimated input-lane fill in [0, 1]
    pub buffer_fill: f64,
}

#[derive(Debug, Clone)]
struct SinkTiming {
    total_samples_output: u64,
    last_rtp_timestamp: u32,
    last_report: MonoTime,
    registered_at: MonoTime,
    smoothed_error_samples: f64,
    rate_adjustment: f64,
    active: bool,
    underruns: u64,
    buffer_fill: f64,
}

struct ClockState {
    reference_mono: MonoTime,
    reference_rtp: u32,
    sinks: HashMap<String, SinkTiming>,
    generation: u64,
    ready: usize,
}

pub struct GlobalSynchronizationClock {
    sample_rate: u32,
    tuning: SyncTuning,
    state: Mutex<ClockState>,
    barrier: Condvar,
    barrier_timeouts: AtomicU64,
}

impl GlobalSynchronizationClock {
    pub fn new(sample_rate: u32, tuning: SyncTuning) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            tuning,
            state: Mutex::new(ClockState {
                reference_mono: MonoTime::now(),
                reference_rtp: 0,
                sinks: HashMap::new(),
                generation: 0,
                ready: 0,
            }),
            barrier: Condvar::new(),
            barrier_timeouts: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn barrier_timeouts(&self) -> u64 {
        self.barrier_timeouts.load(Ordering::Relaxed)
    }

    /// Master playback timestamp for the rate group at `now`
    pub fn playback_timestamp_at(&self, now: MonoTime) -> u32 {
        let state = self.state.lock();
        let elapsed = (now - state.reference_mono).max(0.0);
        state
            .reference_rtp
            .wrapping_add((elapsed * self.sample_rate as f64) as u32)
    }

    pub fn current_playback_timestamp(&self) -> u32 {
        self.playback_timestamp_at(MonoTime::now())
    }

    /// Add a sink to the group; any parked barrier waiters wake so the new
    /// group size is observed.
    pub fn register_sink(&self, sink_id: &str, initial_rtp: u32, now: MonoTime) {
        let mut state = self.state.lock();
        state.sinks.insert(
            sink_id.to_string(),
            SinkTiming {
                total_samples_output: 0,
                last_rtp_timestamp: initial_rtp,
                last_report: now,
                registered_at: now,
                smoothed_error_samples: 0.0,
                rate_adjustment: 1.0,
                active: true,
                underruns: 0,
                buffer_fill: 0.0,
            },
        );
        self.barrier.notify_all();
    }

    pub fn unregister_sink(&self, sink_id: &str) {
        let mut state = self.state.lock();
        state.sinks.remove(sink_id);
        self.barrier.notify_all();
    }

    pub fn active_sinks(&self) -> usize {
        self.state.lock().sinks.values().filter(|s| s.active).count()
    }

    /// Update a sink's accounting and recompute its smoothed error
    pub fn report_sink_timing(&self, sink_id: &str, report: SinkTimingReport, now: MonoTime) {
        let tuning = &self.tuning;
        let mut state = self.state.lock();
        let Some(sink) = state.sinks.get_mut(sink_id) else {
            return;
        };
        sink.total_samples_output = report.samples_output;
        sink.last_rtp_timestamp = report.last_rtp_timestamp;
        sink.last_report = now;
        sink.underruns = report.underruns;
        sink.buffer_fill = report.buffer_fill;

        let expected = (now - sink.registered_at).max(0.0) * self.sample_rate as f64;
        let error = expected - sink.total_samples_output as f64;
        let alpha = tuning.error_smoothing.clamp(0.0, 1.0);
        sink.smoothed_error_samples = alpha * error + (1.0 - alpha) * sink.smoothed_error_samples;
        sink.rate_adjustment = (1.0
            + (sink.smoothed_error_samples / self.sample_rate as f64) * tuning.kp)
            .clamp(
                1.0 - tuning.max_rate_adjustment,
                1.0 + tuning.max_rate_adjustment,
            );
    }

    /// Current bounded rate adjustment for a sink (1.0 when unknown)
    pub fn calculate_rate_adjustment(&self, sink_id: &str) -> f64 {
        self.state
            .lock()
            .sinks
            .get(sink_id)
            .map_or(1.0, |s| s.rate_adjustment)
    }

    /// Reusable generation barrier. Returns immediately when the group has
    /// one active sink; releases when all actives arrive; proceeds on
    /// timeout (counted) after withdrawing its readiness.
    pub fn wait_for_dispatch_barrier(&self, timeout: Duration) -> BarrierWait {
        let mut state = self.state.lock();
        let active = state.sinks.values().filter(|s| s.active).count();
        if active <= 1 {
            return BarrierWait::Released;
        }
        let generation = state.generation;
        state.ready += 1;
        if state.ready >= active {
            state.ready = 0;
            state.generation = state.generation.wrapping_add(1);
            self.barrier.notify_all();
            return BarrierWait::Released;
        }
        loop {
            let result = self.barrier.wait_for(&mut state, timeout);
            if state.generation != generation {
                // A newer generation means our cycle was released
                return BarrierWait::Released;
            }
            if result.timed_out() {
                state.ready = state.ready.saturating_sub(1);
                self.barrier_timeouts.fetch_add(1, Ordering::Relaxed);
                return BarrierWait::TimedOut;
            }
            // Woken by a registration change: re-evaluate the group size
            let active = state.sinks.values().filter(|s| s.active).count();
            if active <= 1 || state.ready >= active {
                state.ready = 0;
                state.generation = state.generation.wrapping_add(1);
                self.barrier.notify_all();
                return BarrierWait::Released;
            }
        }
    }

    /// Snapshot of a sink's timing for stats assembly
    pub fn sink_snapshot(&self, sink_id: &str) -> Option<(u64, u32, f64, f64)> {
        self.state.lock().sinks.get(sink_id).map(|s| {
            (
                s.total_samples_output,
                s.last_rtp_timestamp,
                s.rate_adjustment,
                s.buffer_fill,
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn clock() -> GlobalSynchronizationClock {
        GlobalSynchronizationClock::new(48000, SyncTuning::default())
    }

    #[test]
    fn test_playback_timestamp_advances_with_rate() {
        let c = clock();
        let base = {
            let state = c.state.lock();
            state.reference_mono
        };
        let one_second = c.playback_timestamp_at(base + 1.0);
        let start = c.playback_timestamp_at(base);
        assert_eq!(one_second.wrapping_sub(start), 48000);
    }

    #[test]
    fn test_single_sink_barrier_is_immediate() {
        let c = clock();
        c.register_sink("a", 0, MonoTime::now());
        let outcome = c.wait_for_dispatch_barrier(Duration::from_millis(1));
        assert_eq!(outcome, BarrierWait::Released);
        assert_eq!(c.barrier_timeouts(), 0);
    }

    #[test]
    fn test_two_sinks_release_together() {
        let c = Arc::new(clock());
        let now = MonoTime::now();
        c.register_sink("a", 0, now);
        c.register_sink("b", 0, now);

        let c2 = c.clone();
        let waiter = thread::spawn(move || c2.wait_for_dispatch_barrier(Duration::from_secs(2)));
        // Give the waiter time to park, then arrive as the second sink
        thread::sleep(Duration::from_millis(20));
        let second = c.wait_for_dispatch_barrier(Duration::from_secs(2));
        let first = waiter.join().unwrap();
        assert_eq!(first, BarrierWait::Released);
        assert_eq!(second, BarrierWait::Released);
        assert_eq!(c.barrier_timeouts(), 0);
    }

    #[test]
    fn test_barrier_timeout_counts_and_releases() {
        let c = clock();
        let now = MonoTime::now();
        c.register_sink("a", 0, now);
        c.register_sink("b", 0, now);
        // Only one of two arrives: must time out, not deadlock
        let outcome = c.wait_for_dispatch_barrier(Duration::from_millis(30));
        assert_eq!(outcome, BarrierWait::TimedOut);
        assert_eq!(c.barrier_timeouts(), 1);
    }

    #[test]
    fn test_unregister_wakes_waiter() {
        let c = Arc::new(clock());
        let now = MonoTime::now();
        c.register_sink("a", 0, now);
        c.register_sink("b", 0, now);

        let c2 = c.clone();
        let waiter = thread::spawn(move || c2.wait_for_dispatch_barrier(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        c.unregister_sink("b");
        assert_eq!(waiter.join().unwrap(), BarrierWait::Released);
    }

    #[test]
    fn test_rate_adjustment_bounded() {
        let c = clock();
        let now = MonoTime::from_secs(1000.0);
        c.register_sink("a", 0, now);
        // Report wildly lagging output over many cycles
        for n in 1..200u64 {
            c.report_sink_timing(
                "a",
                SinkTimingReport {
                    samples_output: n * 10,
                    last_rtp_timestamp: 0,
                    underruns: 0,
                    buffer_fill: 0.5,
                },
                now + n as f64,
            );
        }
        let adj = c.calculate_rate_adjustment("a");
        let t = SyncTuning::default();
        assert!(adj <= 1.0 + t.max_rate_adjustment + 1e-12);
        assert!(adj >= 1.0 - t.max_rate_adjustment - 1e-12);
        // Lagging output means the sink must speed up
        assert!(adj > 1.0);
    }

    #[test]
    fn test_slow_sink_gets_speedup_fast_sink_gets_slowdown() {
        let c = clock();
        let base = MonoTime::from_secs(500.0);
        c.register_sink("slow", 0, base);
        c.register_sink("fast", 0, base);
        for n in 1..50u64 {
            let now = base + n as f64;
            // slow emits 500 ppm under, fast 500 ppm over
            c.report_sink_timing(
                "slow",
                SinkTimingReport {
                    samples_output: (n as f64 * 48000.0 * 0.9995) as u64,
                    last_rtp_timestamp: 0,
                    underruns: 0,
                    buffer_fill: 0.5,
                },
                now,
            );
            c.report_sink_timing(
                "fast",
                SinkTimingReport {
                    samples_output: (n as f64 * 48000.0 * 1.0005) as u64,
                    last_rtp_timestamp: 0,
                    underruns: 0,
                    buffer_fill: 0.5,
                },
                now,
            );
        }
        assert!(c.calculate_rate_adjustment("slow") > 1.0);
        assert!(c.calculate_rate_adjustment("fast") < 1.0);
    }

    #[test]
    fn test_unknown_sink_is_unity() {
        let c = clock();
        assert_eq!(c.calculate_rate_adjustment("ghost"), 1.0);
    }
}

//! Per-sink synchronization coordinator
//!
//! Thin state machine between a mixer and its rate group's clock:
//! `Disabled` bypasses coordination entirely; `Enabled` waits the barrier
//! each cycle and relays timing reports. The coordinator holds the clock
//! by `Arc` and identifies its mixer by id, never by pointer, so teardown
//! order cannot dangle.

use std::sync::Arc;
use std::time::Duration;

use sr_core::MonoTime;

use crate::clock::{BarrierWait, GlobalSynchronizationClock, SinkTimingReport};

pub struct SinkSynchronizationCoordinator {
    clock: Arc<GlobalSynchronizationClock>,
    sink_id: String,
    enabled: bool,
    barrier_timeout: Duration,
}

impl SinkSynchronizationCoordinator {
    pub fn new(
        clock: Arc<GlobalSynchronizationClock>,
        sink_id: impl Into<String>,
        barrier_timeout_ms: u64,
    ) -> Self {
        Self {
            clock,
            sink_id: sink_id.into(),
            enabled: false,
            barrier_timeout: Duration::from_millis(barrier_timeout_ms.max(1)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn clock(&self) -> &Arc<GlobalSynchronizationClock> {
        &self.clock
    }

    /// Join the rate group. Idempotent.
    pub fn enable(&mut self, initial_rtp: u32, now: MonoTime) {
        if !self.enabled {
            self.clock.register_sink(&self.sink_id, initial_rtp, now);
            self.enabled = true;
        }
    }

    /// Leave the rate group; parked waiters observe the size change.
    pub fn disable(&mut self) {
        if self.enabled {
            self.clock.unregister_sink(&self.sink_id);
            self.enabled = false;
        }
    }

    /// Gate one mixer cycle. Returns the rate adjustment to apply and
    /// whether the barrier timed out.
    pub fn begin_dispatch(&mut self) -> (f64, bool) {
        if !self.enabled {
            return (1.0, false);
        }
        let outcome = self.clock.wait_for_dispatch_barrier(self.barrier_timeout);
        let adjustment = self.clock.calculate_rate_adjustment(&self.sink_id);
        (adjustment, outcome == BarrierWait::TimedOut)
    }

    /// Report the finished cycle; returns the adjustment for the next one.
    pub fn complete_dispatch(&mut self, report: SinkTimingReport, now: MonoTime) -> f64 {
        if !self.enabled {
            return 1.0;
        }
        self.clock.report_sink_timing(&self.sink_id, report, now);
        self.clock.calculate_rate_adjustment(&self.sink_id)
    }
}

impl Drop for SinkSynchronizationCoordinator {
    fn drop(&mut self) {
        self.disable();
    }
}

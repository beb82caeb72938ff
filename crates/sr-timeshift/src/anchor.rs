//! Stream clock anchoring
//!
//! An anchor maps one source's RTP timestamp domain onto the local
//! monotonic clock: `(t_ref_mono, ts_ref_rtp)` plus the stream sample rate.
//! Arrival error against the anchor feeds the jitter estimate and the
//! re-anchor decisions.

use sr_core::MonoTime;

/// RFC 3550 style jitter smoothing weight
const JITTER_ALPHA: f64 = 1.0 / 16.0;

#[derive(Debug, Clone)]
pub struct StreamAnchor {
    pub ref_mono: MonoTime,
    pub ref_rtp: u32,
    pub sample_rate: u32,
    /// Smoothed |arrival − expected| in seconds
    pub jitter: f64,
    /// Last RTP timestamp observed, for continuity checks
    pub last_rtp: u32,
    /// Start of a continuous over-threshold lag episode
    lag_since: Option<MonoTime>,
}

impl StreamAnchor {
    pub fn new(arrival: MonoTime, rtp: u32, sample_rate: u32) -> Self {
        Self {
            ref_mono: arrival,
            ref_rtp: rtp,
            sample_rate: sample_rate.max(1),
            jitter: 0.0,
            last_rtp: rtp,
            lag_since: None,
        }
    }

    /// Map an RTP timestamp to local monotonic time via the anchor.
    /// The delta is taken wrapping so long sessions survive the u32 roll.
    pub fn rtp_to_mono(&self, rtp: u32) -> MonoTime {
        let delta = rtp.wrapping_sub(self.ref_rtp) as i32 as f64;
        self.ref_mono + delta / self.sample_rate as f64
    }

    /// Observe one arrival. Returns the signed arrival error in seconds
    /// (positive when the packet came later than the anchor predicts) and
    /// whether the error has now stayed over `lag_threshold` continuously
    /// for longer than `lag_window`.
    pub fn observe(
        &mut self,
        arrival: MonoTime,
        rtp: u32,
        lag_threshold: f64,
        lag_window: f64,
    ) -> (f64, bool) {
        let expected = self.rtp_to_mono(rtp);
        let error = arrival - expected;
        self.jitter = JITTER_ALPHA * error.abs() + (1.0 - JITTER_ALPHA) * self.jitter;
        self.last_rtp = rtp;

        let mut must_reanchor = false;
        if error.abs() > lag_threshold {
            let since = *self.lag_since.get_or_insert(arrival);
            if arrival - since >= lag_window {
                must_reanchor = true;
            }
        } else {
            self.lag_since = None;
        }
        (error, must_reanchor)
    }

    /// Re-seat the anchor on a fresh observation, keeping the jitter
    /// estimate as a warm start.
    pub fn reanchor(&mut self, arrival: MonoTime, rtp: u32) {
        self.ref_mono = arrival;
        self.ref_rtp = rtp;
        self.last_rtp = rtp;
        self.lag_since = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_is_linear_in_rtp() {
        let anchor = StreamAnchor::new(MonoTime::from_secs(100.0), 48000, 48000);
        let t = anchor.rtp_to_mono(48000 + 24000);
        assert!((t.secs() - 100.5).abs() < 1e-9);
    }

    #[test]
    fn test_mapping_handles_wraparound() {
        let anchor = StreamAnchor::new(MonoTime::from_secs(10.0), u32::MAX - 100, 48000);
        let t = anchor.rtp_to_mono(u32::MAX.wrapping_add(48000 - 100));
        assert!((t.secs() - 11.0).abs() < 1e-6);
    }

    #[test]
    fn test_on_time_arrivals_keep_jitter_low() {
        let mut anchor = StreamAnchor::new(MonoTime::from_secs(0.0), 0, 48000);
        for n in 1..100u32 {
            let (err, reanchor) = anchor.observe(
                MonoTime::from_secs(n as f64 * 0.024),
                n * 1152,
                0.5,
                2.0,
            );
            assert!(err.abs() < 1e-9);
            assert!(!reanchor);
        }
        assert!(anchor.jitter < 1e-9);
    }

    #[test]
    fn test_sustained_lag_requests_reanchor() {
        let mut anchor = StreamAnchor::new(MonoTime::from_secs(0.0), 0, 48000);
        let mut requested = false;
        for n in 1..200u32 {
            // Every packet a full second late
            let (_, reanchor) = anchor.observe(
                MonoTime::from_secs(n as f64 * 0.024 + 1.0),
                n * 1152,
                0.5,
                2.0,
            );
            requested |= reanchor;
        }
        assert!(requested);
    }

    #[test]
    fn test_transient_lag_does_not_reanchor() {
        let mut anchor = StreamAnchor::new(MonoTime::from_secs(0.0), 0, 48000);
        // One late packet in an otherwise punctual stream
        let (_, r1) = anchor.observe(MonoTime::from_secs(1.0), 1152, 0.5, 2.0);
        let (_, r2) = anchor.observe(MonoTime::from_secs(0.048), 2 * 1152, 0.5, 2.0);
        assert!(!r1);
        assert!(!r2);
    }
}

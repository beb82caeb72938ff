//! Playback-rate PI controller
//!
//! Converts a subscriber buffer-level error into a rate multiplier near
//! 1.0. The proportional and integral terms work in ppm, the integral is
//! clamped, and the applied rate is slew-limited so the downstream
//! resampler never hears a step.

use sr_core::MonoTime;

use crate::TimeshiftTuning;

#[derive(Debug, Clone)]
pub struct PlaybackRateController {
    rate_ppm: f64,
    integral_ppm: f64,
    smoothed_error_ms: f64,
    last_update: Option<MonoTime>,
}

impl Default for PlaybackRateController {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackRateController {
    pub fn new() -> Self {
        Self {
            rate_ppm: 0.0,
            integral_ppm: 0.0,
            smoothed_error_ms: 0.0,
            last_update: None,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Current rate multiplier
    #[inline]
    pub fn rate(&self) -> f64 {
        1.0 + self.rate_ppm * 1e-6
    }

    /// Update with the signed buffer error in milliseconds (positive =
    /// more buffered than the target, so playback should speed up).
    pub fn update(&mut self, error_ms: f64, now: MonoTime, tuning: &TimeshiftTuning) -> f64 {
        if !tuning.playback_rate_adjustment_enabled {
            self.rate_ppm = 0.0;
            return 1.0;
        }
        let dt = match self.last_update {
            Some(prev) => (now - prev).clamp(0.0, 1.0),
            None => 0.0,
        };
        self.last_update = Some(now);

        let s = tuning.playback_ratio_smoothing.clamp(0.0, 1.0);
        self.smoothed_error_ms = s * error_ms + (1.0 - s) * self.smoothed_error_ms;

        self.integral_ppm = (self.integral_ppm
            + tuning.playback_ratio_ki * self.smoothed_error_ms * dt)
            .clamp(
                -tuning.playback_ratio_integral_limit_ppm,
                tuning.playback_ratio_integral_limit_ppm,
            );

        let desired_ppm = (tuning.playback_ratio_kp * self.smoothed_error_ms
            + self.integral_ppm)
            .clamp(
                -tuning.playback_ratio_max_deviation_ppm,
                tuning.playback_ratio_max_deviation_ppm,
            );

        let max_step = tuning.playback_ratio_slew_ppm_per_sec * dt;
        let step = (desired_ppm - self.rate_ppm).clamp(-max_step, max_step);
        self.rate_ppm += step;
        self.rate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn tuning() -> TimeshiftTuning {
        TimeshiftTuning::default()
    }

    #[test]
    fn test_disabled_controller_holds_unity() {
        let mut ctl = PlaybackRateController::new();
        let mut t = tuning();
        t.playback_rate_adjustment_enabled = false;
        let rate = ctl.update(500.0, MonoTime::from_secs(1.0), &t);
        assert_eq!(rate, 1.0);
    }

    #[test]
    fn test_rate_stays_within_deviation_bounds() {
        let mut ctl = PlaybackRateController::new();
        let t = tuning();
        let mut now = MonoTime::from_secs(0.0);
        for _ in 0..600 {
            now = now + 0.1;
            let rate = ctl.update(10_000.0, now, &t);
            let bound = t.playback_ratio_max_deviation_ppm * 1e-6;
            assert!(rate <= 1.0 + bound + 1e-12);
            assert!(rate >= 1.0 - bound - 1e-12);
        }
    }

    #[test]
    fn test_positive_error_speeds_up() {
        let mut ctl = PlaybackRateController::new();
        let t = tuning();
        let mut now = MonoTime::from_secs(0.0);
        let mut rate = 1.0;
        for _ in 0..100 {
            now = now + 0.1;
            rate = ctl.update(100.0, now, &t);
        }
        assert!(rate > 1.0);
    }

    #[test]
    fn test_slew_limit_bounds_step() {
        let mut ctl = PlaybackRateController::new();
        let t = tuning();
        ctl.update(0.0, MonoTime::from_secs(0.0), &t);
        // One 100 ms step against a huge error cannot move faster than
        // slew * dt ppm.
        let r1 = ctl.update(1e9, MonoTime::from_secs(0.1), &t);
        let max = t.playback_ratio_slew_ppm_per_sec * 0.1 * 1e-6;
        assert!((r1 - 1.0).abs() <= max + 1e-12);
    }

    #[test]
    fn test_error_sign_symmetry() {
        let t = tuning();
        let mut up = PlaybackRateController::new();
        let mut down = PlaybackRateController::new();
        let mut now = MonoTime::from_secs(0.0);
        for _ in 0..50 {
            now = now + 0.1;
            up.update(50.0, now, &t);
            down.update(-50.0, now, &t);
        }
        assert!((up.rate() - 1.0) > 0.0);
        assert!((down.rate() - 1.0) < 0.0);
        assert_abs_diff_eq!(up.rate() - 1.0, -(down.rate() - 1.0), epsilon = 1e-9);
    }
}

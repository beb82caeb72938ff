//! Parameter smoothing
//!
//! Volume targets are set from control threads and followed by the audio
//! path with a one-pole smoother per sample, so 50 updates in 100 ms ramp
//! instead of stepping. The RMS normalizer rides on top with separate
//! attack and decay coefficients.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sr_core::Sample;

/// Lock-free gain target shared between a control thread and the DSP path
#[derive(Debug, Clone, Default)]
pub struct SharedGain(Arc<AtomicU64>);

impl SharedGain {
    pub fn new(initial: Sample) -> Self {
        Self(Arc::new(AtomicU64::new(initial.to_bits())))
    }

    #[inline]
    pub fn set(&self, value: Sample) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> Sample {
        Sample::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// One-pole smoother tracking a [`SharedGain`] target
#[derive(Debug)]
pub struct SmoothedGain {
    target: SharedGain,
    current: Sample,
    /// Per-sample approach factor in (0, 1]
    coeff: Sample,
}

impl SmoothedGain {
    pub fn new(target: SharedGain, smoothing_factor: Sample) -> Self {
        let current = target.get();
        Self {
            target,
            current,
            coeff: smoothing_factor.clamp(1e-6, 1.0),
        }
    }

    pub fn set_smoothing_factor(&mut self, factor: Sample) {
        self.coeff = factor.clamp(1e-6, 1.0);
    }

    /// Advance one sample and return the smoothed gain
    #[inline(always)]
    pub fn next(&mut self) -> Sample {
        let target = self.target.get();
        self.current += self.coeff * (target - self.current);
        self.current
    }

    #[inline]
    pub fn current(&self) -> Sample {
        self.current
    }

    /// Jump straight to the target (used on reconfiguration)
    pub fn snap(&mut self) {
        self.current = self.target.get();
    }
}

/// Chunk-RMS driven loudness normalizer.
///
/// The desired gain pulls the chunk toward `target_rms`; the applied gain
/// follows with the attack coefficient when the gain must come down and the
/// decay coefficient when it may rise, so transients duck fast and recovery
/// is gentle.
#[derive(Debug)]
pub struct RmsNormalizer {
    target_rms: Sample,
    attack: Sample,
    decay: Sample,
    gain: Sample,
}

const GAIN_FLOOR: Sample = 0.05;
const GAIN_CEIL: Sample = 8.0;

impl RmsNormalizer {
    pub fn new(target_rms: Sample, attack: Sample, decay: Sample) -> Self {
        Self {
            target_rms: target_rms.max(1e-4),
            attack: attack.clamp(1e-6, 1.0),
            decay: decay.clamp(1e-6, 1.0),
            gain: 1.0,
        }
    }

    pub fn retune(&mut self, target_rms: Sample, attack: Sample, decay: Sample) {
        self.target_rms = target_rms.max(1e-4);
        self.attack = attack.clamp(1e-6, 1.0);
        self.decay = decay.clamp(1e-6, 1.0);
    }

    pub fn reset(&mut self) {
        self.gain = 1.0;
    }

    /// Measure the chunk and apply the smoothed gain in place
    pub fn process(&mut self, buffer: &mut [Sample]) {
        if buffer.is_empty() {
            return;
        }
        let mean_sq: Sample =
            buffer.iter().map(|s| s * s).sum::<Sample>() / buffer.len() as Sample;
        let rms = mean_sq.sqrt();
        let desired = if rms > 1e-6 {
            (self.target_rms / rms).clamp(GAIN_FLOOR, GAIN_CEIL)
        } else {
            // Silence: hold the current gain rather than pumping up noise
            self.gain
        };
        let coeff = if desired < self.gain {
            self.attack
        } else {
            self.decay
        };
        for sample in buffer {
            self.gain += coeff * (desired - self.gain);
            *sample *= self.gain;
        }
    }

    #[inline]
    pub fn gain(&self) -> Sample {
        self.gain
    }
}

//! sr-dsp: DSP primitives and the per-source processing pipeline
//!
//! ## Modules
//! - `biquad` - TDF-II biquad filters (cookbook coefficient forms)
//! - `eq` - 18-band peaking equalizer chain
//! - `smoothing` - lock-free volume ramp and RMS normalizer
//! - `resampler` - streaming windowed-sinc resampler with live ratio retune
//! - `mix` - sparse speaker-matrix taps
//! - `dither` - TPDF dither with error-feedback noise shaping
//! - `pipeline` - the `AudioProcessor` stage chain

pub mod biquad;
pub mod dither;
pub mod eq;
pub mod mix;
pub mod pipeline;
pub mod resampler;
pub mod smoothing;

pub use biquad::{Biquad, BiquadCoeffs, FilterType};
pub use dither::Dither;
pub use eq::{EqChain, Equalizer, EQ_BANDS, EQ_BAND_FREQS};
pub use mix::{build_taps, MixTap};
pub use pipeline::{AudioProcessor, ProcessorTuning};
pub use resampler::SincResampler;
pub use smoothing::{RmsNormalizer, SharedGain, SmoothedGain};

use sr_core::Sample;

/// Trait for stateful processors that can drop their history
pub trait Processor {
    fn reset(&mut self);
}

/// Cubic soft clip: input clamped to the unit interval, then `x - x³/3`
#[inline(always)]
pub fn soft_clip(x: Sample) -> Sample {
    let x = x.clamp(-1.0, 1.0);
    x - x * x * x * (1.0 / 3.0)
}

//! Per-source processing pipeline
//!
//! One `AudioProcessor` per source instance. Stages, in order: PCM decode,
//! volume ramp (+ optional RMS normalization), soft clip, sinc upsample,
//! speaker-matrix mix to the sink's channel count, DC filter, 18-band EQ,
//! sinc downsample, noise-shaped dither to `i32`.
//!
//! All stage buffers are sized at configuration time; the per-chunk path
//! reuses them and performs no allocation once warmed up.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sr_core::{auto_downmix, AudioFormat, EngineResult, Sample, SpeakerLayout, CHUNK_FRAMES};

use crate::biquad::{Biquad, FilterType};
use crate::dither::Dither;
use crate::eq::{EqChain, Equalizer};
use crate::mix::{apply_taps, build_taps, MixTap};
use crate::resampler::SincResampler;
use crate::smoothing::{RmsNormalizer, SharedGain, SmoothedGain};
use crate::soft_clip;

/// Tuning knobs for the processing pipeline.
///
/// `soft_clip_threshold` and `soft_clip_knee` are accepted for
/// compatibility; the clip curve itself is the fixed cubic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorTuning {
    pub oversampling_factor: u32,
    pub volume_smoothing_factor: Sample,
    pub dc_filter_cutoff_hz: Sample,
    pub normalization_target_rms: Sample,
    pub normalization_attack_smoothing: Sample,
    pub normalization_decay_smoothing: Sample,
    pub dither_noise_shaping_factor: Sample,
    pub soft_clip_threshold: Sample,
    pub soft_clip_knee: Sample,
}

impl Default for ProcessorTuning {
    fn default() -> Self {
        Self {
            oversampling_factor: 1,
            volume_smoothing_factor: 0.005,
            dc_filter_cutoff_hz: 20.0,
            normalization_target_rms: 0.2,
            normalization_attack_smoothing: 0.1,
            normalization_decay_smoothing: 0.01,
            dither_noise_shaping_factor: 0.5,
            soft_clip_threshold: 1.0,
            soft_clip_knee: 0.0,
        }
    }
}

pub struct AudioProcessor {
    input: AudioFormat,
    output: AudioFormat,
    tuning: ProcessorTuning,

    volume_target: SharedGain,
    volume: SmoothedGain,
    volume_normalization: bool,
    normalizer: RmsNormalizer,
    playback_rate: f64,

    upsampler: SincResampler,
    downsampler: SincResampler,

    layouts: HashMap<u16, SpeakerLayout>,
    taps: Vec<MixTap>,

    dc_filters: Vec<Biquad>,
    eq: Equalizer,
    chain: EqChain,
    dither: Dither,

    // Stage scratch, reused every chunk
    scaled: Vec<Sample>,
    upsampled: Vec<Sample>,
    planar: Vec<Sample>,
    interleaved: Vec<Sample>,
    downsampled: Vec<Sample>,
}

impl AudioProcessor {
    pub fn new(
        input: AudioFormat,
        output: AudioFormat,
        tuning: ProcessorTuning,
        layouts: HashMap<u16, SpeakerLayout>,
        eq: Equalizer,
        initial_volume: Sample,
    ) -> EngineResult<Self> {
        input.validate()?;
        output.validate()?;

        let oversample = tuning.oversampling_factor.max(1);
        let fs_effective = output.sample_rate as Sample * oversample as Sample;
        let up_ratio = up_ratio(&input, &output, oversample, 1.0);

        let volume_target = SharedGain::new(initial_volume);
        let volume = SmoothedGain::new(volume_target.clone(), tuning.volume_smoothing_factor);
        let normalizer = RmsNormalizer::new(
            tuning.normalization_target_rms,
            tuning.normalization_attack_smoothing,
            tuning.normalization_decay_smoothing,
        );

        let in_ch = input.channels as usize;
        let out_ch = output.channels as usize;
        let chain = EqChain::new(&eq, out_ch, fs_effective);
        let dc_filters = (0..out_ch)
            .map(|_| dc_filter(tuning.dc_filter_cutoff_hz, fs_effective))
            .collect();
        let dither = Dither::new(out_ch, output.bit_depth, tuning.dither_noise_shaping_factor);

        // Worst-case frames in flight through the oversampled middle
        let headroom = (CHUNK_FRAMES as f64 * up_ratio.max(1.0)).ceil() as usize + 64;

        let mut processor = Self {
            input,
            output,
            volume_target,
            volume,
            volume_normalization: false,
            normalizer,
            playback_rate: 1.0,
            upsampler: SincResampler::new(in_ch, up_ratio),
            downsampler: SincResampler::new(out_ch, 1.0 / oversample as f64),
            layouts,
            taps: Vec::new(),
            dc_filters,
            eq,
            chain,
            dither,
            scaled: Vec::with_capacity(CHUNK_FRAMES * in_ch),
            upsampled: Vec::with_capacity(headroom * in_ch),
            planar: Vec::with_capacity(headroom * out_ch),
            interleaved: Vec::with_capacity(headroom * out_ch),
            downsampled: Vec::with_capacity((CHUNK_FRAMES + 64) * out_ch),
            tuning,
        };
        processor.rebuild_taps();
        Ok(processor)
    }

    #[inline]
    pub fn input_format(&self) -> AudioFormat {
        self.input
    }

    #[inline]
    pub fn output_format(&self) -> AudioFormat {
        self.output
    }

    /// Handle for lock-free volume updates from control threads
    pub fn volume_handle(&self) -> SharedGain {
        self.volume_target.clone()
    }

    pub fn set_volume(&self, volume: Sample) {
        self.volume_target.set(volume);
    }

    pub fn set_volume_normalization(&mut self, enabled: bool) {
        if self.volume_normalization && !enabled {
            self.normalizer.reset();
        }
        self.volume_normalization = enabled;
    }

    /// Replace the equalizer: chain rebuilt (states flushed) and taps
    /// rebuilt, per the reconfiguration contract.
    pub fn set_eq(&mut self, eq: Equalizer) {
        self.eq = eq;
        let fs_effective = self.fs_effective();
        self.chain
            .configure(&self.eq, self.output.channels as usize, fs_effective);
        self.flush_dc();
        self.rebuild_taps();
    }

    /// Replace the speaker layout map; flushes filters and rebuilds taps.
    pub fn set_speaker_layouts(&mut self, layouts: HashMap<u16, SpeakerLayout>) {
        self.layouts = layouts;
        self.chain.flush();
        self.flush_dc();
        self.rebuild_taps();
    }

    /// Retune resampler ratios only; filter state is untouched.
    pub fn set_playback_rate(&mut self, rate: f64) {
        if rate > 0.0 && rate != self.playback_rate {
            self.playback_rate = rate;
            self.upsampler
                .set_ratio(up_ratio(&self.input, &self.output, self.oversample(), rate));
        }
    }

    /// Adopt a new output bit depth (sample rate and channels stay fixed).
    /// Only the dither quantizer is rebuilt; used when the first sink
    /// connection decides the wire depth.
    pub fn set_output_bit_depth(&mut self, bit_depth: u16) -> EngineResult<()> {
        let format = AudioFormat {
            bit_depth,
            ..self.output
        };
        format.validate()?;
        self.output = format;
        self.dither = Dither::new(
            self.output.channels as usize,
            bit_depth,
            self.tuning.dither_noise_shaping_factor,
        );
        Ok(())
    }

    /// In-place reconfiguration for a new input format: resamplers are
    /// recreated, filters flushed, taps rebuilt. Output format is fixed
    /// for the processor's lifetime.
    pub fn reconfigure_input(&mut self, input: AudioFormat) -> EngineResult<()> {
        input.validate()?;
        self.input = input;
        let in_ch = input.channels as usize;
        self.upsampler = SincResampler::new(
            in_ch,
            up_ratio(&self.input, &self.output, self.oversample(), self.playback_rate),
        );
        self.downsampler =
            SincResampler::new(self.output.channels as usize, 1.0 / self.oversample() as f64);
        self.flush();
        self.rebuild_taps();
        log::debug!(
            "processor input now {}Hz/{}ch/{}bit (ratio {:.6})",
            input.sample_rate,
            input.channels,
            input.bit_depth,
            self.upsampler.ratio()
        );
        Ok(())
    }

    /// Discontinuity flush: filter and resampler state dropped, smoothed
    /// volume snapped to target.
    pub fn flush(&mut self) {
        self.upsampler.reset();
        self.downsampler.reset();
        self.chain.flush();
        self.flush_dc();
        self.normalizer.reset();
        self.dither.reset();
        self.volume.snap();
    }

    /// Process one block of interleaved input PCM, appending `i32` output
    /// samples at the sink format. Returns the sample count appended.
    pub fn process(&mut self, input_bytes: &[u8], output: &mut Vec<i32>) -> EngineResult<usize> {
        let frames = self.input.frames_in(input_bytes.len());
        if frames == 0 {
            return Ok(0);
        }
        let in_ch = self.input.channels as usize;
        let out_ch = self.output.channels as usize;

        // 1. Decode to float
        decode_pcm(
            input_bytes,
            self.input.bit_depth,
            frames * in_ch,
            &mut self.scaled,
        );

        // 2. Volume ramp + optional normalization, 3. soft clip
        for sample in &mut self.scaled {
            *sample *= self.volume.next();
        }
        if self.volume_normalization {
            self.normalizer.process(&mut self.scaled);
        }
        for sample in &mut self.scaled {
            *sample = soft_clip(*sample);
        }

        // 4. Upsample (bypassed at exactly unity ratio)
        let up: &[Sample] = if self.upsampler.ratio() == 1.0 {
            &self.scaled
        } else {
            self.upsampled.clear();
            self.upsampler.process(&self.scaled, &mut self.upsampled);
            &self.upsampled
        };
        let up_frames = up.len() / in_ch;
        if up_frames == 0 {
            return Ok(0);
        }

        // 5+6. Channel split and speaker mix into planar buffers
        self.planar.clear();
        self.planar.resize(up_frames * out_ch, 0.0);
        apply_taps(&self.taps, up, in_ch, &mut self.planar, up_frames);

        // 7. DC filter, 8. EQ per channel
        for ch in 0..out_ch {
            let slice = &mut self.planar[ch * up_frames..(ch + 1) * up_frames];
            if self.tuning.dc_filter_cutoff_hz > 0.0 {
                self.dc_filters[ch].process_block(slice);
            }
            self.chain.process_channel(ch, slice);
        }

        // Re-interleave for the output-side resampler
        self.interleaved.clear();
        self.interleaved.resize(up_frames * out_ch, 0.0);
        for ch in 0..out_ch {
            let src = &self.planar[ch * up_frames..(ch + 1) * up_frames];
            let mut idx = ch;
            for &s in src {
                self.interleaved[idx] = s;
                idx += out_ch;
            }
        }

        // 9. Downsample back to the output rate
        let fin: &[Sample] = if self.downsampler.ratio() == 1.0 {
            &self.interleaved
        } else {
            self.downsampled.clear();
            self.downsampler
                .process(&self.interleaved, &mut self.downsampled);
            &self.downsampled
        };

        // 10. Dither and quantize
        let before = output.len();
        self.dither.process(fin, output);
        Ok(output.len() - before)
    }

    fn oversample(&self) -> u32 {
        self.tuning.oversampling_factor.max(1)
    }

    fn fs_effective(&self) -> Sample {
        self.output.sample_rate as Sample * self.oversample() as Sample
    }

    fn flush_dc(&mut self) {
        for filter in &mut self.dc_filters {
            filter.flush();
        }
    }

    fn rebuild_taps(&mut self) {
        let in_ch = self.input.channels as usize;
        let out_ch = self.output.channels as usize;
        let matrix = match self.layouts.get(&self.input.channels) {
            Some(layout) => layout.resolve(in_ch, out_ch),
            None => auto_downmix(in_ch, out_ch),
        };
        self.taps = build_taps(&matrix, in_ch, out_ch);
    }

    /// Current taps, exposed for reconfiguration tests
    pub fn mix_taps(&self) -> &[MixTap] {
        &self.taps
    }
}

fn up_ratio(input: &AudioFormat, output: &AudioFormat, oversample: u32, playback_rate: f64) -> f64 {
    (output.sample_rate as f64 * oversample as f64 / playback_rate) / input.sample_rate as f64
}

fn dc_filter(cutoff_hz: Sample, fs_effective: Sample) -> Biquad {
    Biquad::new(
        FilterType::Highpass,
        cutoff_hz.max(1.0) / fs_effective,
        std::f64::consts::FRAC_1_SQRT_2,
        0.0,
    )
}

/// Decode little-endian PCM into float in [-1, 1]
fn decode_pcm(bytes: &[u8], bit_depth: u16, samples: usize, out: &mut Vec<Sample>) {
    out.clear();
    match bit_depth {
        16 => {
            for pair in bytes.chunks_exact(2).take(samples) {
                let v = i16::from_le_bytes([pair[0], pair[1]]);
                out.push(v as Sample / 32768.0);
            }
        }
        24 => {
            for triple in bytes.chunks_exact(3).take(samples) {
                // Sign-extend through the i32 high byte
                let v = i32::from_le_bytes([0, triple[0], triple[1], triple[2]]) >> 8;
                out.push(v as Sample / 8_388_608.0);
            }
        }
        _ => {
            for quad in bytes.chunks_exact(4).take(samples) {
                let v = i32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]);
                out.push(v as Sample / 2_147_483_648.0);
            }
        }
    }
}

//! 18-band peaking equalizer
//!
//! Band gains arrive from configuration as linear multipliers around 1.0;
//! the chain maps them to peaking biquads at fixed log-spaced centers.
//! Bands sitting at exactly 1.0 are skipped entirely. When normalization
//! is enabled all gains are divided by the maximum band before the dB
//! conversion so boosting never costs headroom.

use serde::{Deserialize, Serialize};
use sr_core::Sample;

use crate::biquad::{Biquad, FilterType};
use crate::soft_clip;

/// Number of equalizer bands
pub const EQ_BANDS: usize = 18;

/// Fixed band centers in Hz, a √2 series anchored at 55 Hz
pub const EQ_BAND_FREQS: [Sample; EQ_BANDS] = [
    55.0, 78.0, 110.0, 156.0, 220.0, 311.0, 440.0, 622.0, 880.0, 1245.0, 1760.0, 2489.0, 3520.0,
    4978.0, 7040.0, 9956.0, 14080.0, 19912.0,
];

const BAND_Q: Sample = 1.41;

/// Equalizer configuration: 18 linear band gains plus the normalization flag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Equalizer {
    pub gains: [Sample; EQ_BANDS],
    #[serde(default)]
    pub normalize: bool,
}

impl Default for Equalizer {
    fn default() -> Self {
        Self {
            gains: [1.0; EQ_BANDS],
            normalize: false,
        }
    }
}

impl Equalizer {
    pub fn is_flat(&self) -> bool {
        self.gains.iter().all(|&g| g == 1.0)
    }

    /// Per-band gains in dB after optional normalization.
    ///
    /// The linear-to-dB mapping is `dB = 10·(g − 1)`, so 1.0 is flat, 1.1
    /// is +1 dB and 0.5 is −5 dB.
    pub fn band_gains_db(&self) -> [Sample; EQ_BANDS] {
        let max = self
            .gains
            .iter()
            .cloned()
            .fold(Sample::MIN, Sample::max)
            .max(1e-6);
        let mut out = [0.0; EQ_BANDS];
        for (band, &gain) in self.gains.iter().enumerate() {
            let g = if self.normalize { gain / max } else { gain };
            out[band] = 10.0 * (g - 1.0);
        }
        out
    }
}

/// One active band in the chain
struct EqBand {
    band: usize,
    /// One filter per channel
    filters: Vec<Biquad>,
}

/// Multichannel peaking filter chain
pub struct EqChain {
    bands: Vec<EqBand>,
    channels: usize,
}

impl EqChain {
    pub fn new(eq: &Equalizer, channels: usize, sample_rate: Sample) -> Self {
        let mut chain = Self {
            bands: Vec::with_capacity(EQ_BANDS),
            channels,
        };
        chain.configure(eq, channels, sample_rate);
        chain
    }

    /// Rebuild the chain for a new gain set; filter states start flushed.
    pub fn configure(&mut self, eq: &Equalizer, channels: usize, sample_rate: Sample) {
        self.channels = channels;
        self.bands.clear();
        let gains_db = eq.band_gains_db();
        for (band, &gain_db) in gains_db.iter().enumerate() {
            // Normalization can move a band to unity; skip those too.
            if gain_db == 0.0 {
                continue;
            }
            let fc = EQ_BAND_FREQS[band] / sample_rate;
            let filters = (0..channels)
                .map(|_| Biquad::new(FilterType::Peak, fc, BAND_Q, gain_db))
                .collect();
            self.bands.push(EqBand { band, filters });
        }
    }

    pub fn is_active(&self) -> bool {
        !self.bands.is_empty()
    }

    pub fn flush(&mut self) {
        for band in &mut self.bands {
            for filter in &mut band.filters {
                filter.flush();
            }
        }
    }

    /// Process one channel's contiguous block through every active band,
    /// soft-clipping after the chain.
    pub fn process_channel(&mut self, channel: usize, buffer: &mut [Sample]) {
        if self.bands.is_empty() {
            return;
        }
        for band in &mut self.bands {
            band.filters[channel].process_block(buffer);
        }
        for sample in buffer {
            *sample = soft_clip(*sample);
        }
    }

    /// Indices of the active bands, ascending
    pub fn active_bands(&self) -> Vec<usize> {
        self.bands.iter().map(|b| b.band).collect()
    }
}

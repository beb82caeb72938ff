//! Speaker layouts and the canonical auto-downmix
//!
//! A layout is an 8x8 gain matrix from input channels to output channels.
//! Custom matrices come from configuration; auto mode synthesizes a
//! deterministic fold-down/fan-out from the (input, output) channel pair.
//! An invalid custom matrix falls back to auto with a warning instead of
//! rejecting the update, so live sinks survive a malformed submission.

use serde::{Deserialize, Serialize};

use crate::{EngineError, EngineResult, Sample, MAX_CHANNELS};

/// Resolved mix matrix, `matrix[out][in]`
pub type MixMatrix = [[Sample; MAX_CHANNELS]; MAX_CHANNELS];

const FOLD: Sample = std::f64::consts::FRAC_1_SQRT_2;

/// Per-input-channel-count speaker layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerLayout {
    /// When set, the matrix is ignored and a canonical downmix is used
    #[serde(default = "default_true")]
    pub auto_mode: bool,
    /// Custom gain matrix, rows = output channels, columns = input channels
    #[serde(default)]
    pub matrix: Vec<Vec<Sample>>,
}

fn default_true() -> bool {
    true
}

impl Default for SpeakerLayout {
    fn default() -> Self {
        Self {
            auto_mode: true,
            matrix: Vec::new(),
        }
    }
}

impl SpeakerLayout {
    pub fn auto() -> Self {
        Self::default()
    }

    pub fn custom(matrix: Vec<Vec<Sample>>) -> Self {
        Self {
            auto_mode: false,
            matrix,
        }
    }

    /// Check the custom matrix has full 8x8 dimensions
    pub fn validate(&self) -> EngineResult<()> {
        if self.auto_mode {
            return Ok(());
        }
        let rows = self.matrix.len();
        let cols = self.matrix.first().map_or(0, Vec::len);
        if rows != MAX_CHANNELS || self.matrix.iter().any(|r| r.len() != MAX_CHANNELS) {
            return Err(EngineError::InvalidMatrix { rows, cols });
        }
        Ok(())
    }

    /// Resolve to a fixed matrix for the given channel pair.
    ///
    /// Invalid custom matrices fall back to the auto downmix (warned once
    /// per resolve; the caller rebuilds taps only on reconfiguration).
    pub fn resolve(&self, input_channels: usize, output_channels: usize) -> MixMatrix {
        if !self.auto_mode {
            match self.validate() {
                Ok(()) => {
                    let mut m = [[0.0; MAX_CHANNELS]; MAX_CHANNELS];
                    for (out, row) in self.matrix.iter().enumerate().take(MAX_CHANNELS) {
                        for (inp, &gain) in row.iter().enumerate().take(MAX_CHANNELS) {
                            m[out][inp] = gain;
                        }
                    }
                    return m;
                }
                Err(e) => {
                    log::warn!("speaker layout rejected ({e}), using auto downmix");
                }
            }
        }
        auto_downmix(input_channels, output_channels)
    }
}

/// Canonical downmix/fan-out for a channel pair.
///
/// Channel order follows the WAVEFORMATEX convention:
/// FL FR FC LFE BL BR SL SR.
pub fn auto_downmix(input_channels: usize, output_channels: usize) -> MixMatrix {
    let inputs = input_channels.clamp(1, MAX_CHANNELS);
    let outputs = output_channels.clamp(1, MAX_CHANNELS);
    let mut m = [[0.0; MAX_CHANNELS]; MAX_CHANNELS];

    if inputs == outputs {
        for (ch, row) in m.iter_mut().enumerate().take(inputs) {
            row[ch] = 1.0;
        }
        return m;
    }

    if inputs == 1 {
        // Mono fan-out to every output speaker
        for row in m.iter_mut().take(outputs) {
            row[0] = 1.0;
        }
        return m;
    }

    if outputs == 1 {
        // Equal-weight fold to mono
        let gain = 1.0 / inputs as Sample;
        for inp in 0..inputs {
            m[0][inp] = gain;
        }
        return m;
    }

    if outputs == 2 && inputs >= 6 {
        // ITU-style surround fold-down: center and surrounds at -3 dB,
        // LFE at -6 dB into both fronts.
        m[0][0] = 1.0;
        m[1][1] = 1.0;
        m[0][2] = FOLD;
        m[1][2] = FOLD;
        m[0][3] = 0.5;
        m[1][3] = 0.5;
        m[0][4] = FOLD;
        m[1][5] = FOLD;
        if inputs == 8 {
            m[0][6] = FOLD;
            m[1][7] = FOLD;
        }
        return m;
    }

    if inputs == 2 {
        // Stereo fan-out: fronts verbatim, extra pairs at -3 dB, a center
        // from the sum, LFE from the sum at -6 dB.
        m[0][0] = 1.0;
        m[1][1] = 1.0;
        if outputs > 2 {
            m[2][0] = 0.5;
            m[2][1] = 0.5;
        }
        if outputs > 3 {
            m[3][0] = 0.25;
            m[3][1] = 0.25;
        }
        for out in (4..outputs).step_by(2) {
            m[out][0] = FOLD;
            if out + 1 < outputs {
                m[out + 1][1] = FOLD;
            }
        }
        return m;
    }

    // Generic fallback: wrap inputs onto outputs, normalized per output
    let mut counts = [0usize; MAX_CHANNELS];
    for inp in 0..inputs {
        counts[inp % outputs] += 1;
    }
    for inp in 0..inputs {
        let out = inp % outputs;
        m[out][inp] = 1.0 / counts[out] as Sample;
    }
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_when_equal() {
        let m = auto_downmix(2, 2);
        assert_eq!(m[0][0], 1.0);
        assert_eq!(m[1][1], 1.0);
        assert_eq!(m[0][1], 0.0);
    }

    #[test]
    fn test_mono_fanout() {
        let m = auto_downmix(1, 4);
        for out in 0..4 {
            assert_eq!(m[out][0], 1.0);
        }
    }

    #[test]
    fn test_stereo_to_mono_preserves_level() {
        let m = auto_downmix(2, 1);
        assert!((m[0][0] + m[0][1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_surround_folddown_has_center() {
        let m = auto_downmix(6, 2);
        assert_eq!(m[0][0], 1.0);
        assert!((m[0][2] - FOLD).abs() < 1e-12);
        assert!((m[1][5] - FOLD).abs() < 1e-12);
        // No back-right bleed into the left front
        assert_eq!(m[0][5], 0.0);
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let layout = SpeakerLayout::auto();
        assert_eq!(layout.resolve(6, 2), layout.resolve(6, 2));
    }

    #[test]
    fn test_invalid_custom_falls_back_to_auto() {
        let layout = SpeakerLayout::custom(vec![vec![1.0; 3]; 3]);
        assert!(layout.validate().is_err());
        assert_eq!(layout.resolve(2, 2), auto_downmix(2, 2));
    }

    #[test]
    fn test_valid_custom_used_verbatim() {
        let mut rows = vec![vec![0.0; MAX_CHANNELS]; MAX_CHANNELS];
        rows[0][1] = 0.5;
        let layout = SpeakerLayout::custom(rows);
        let m = layout.resolve(2, 2);
        assert_eq!(m[0][1], 0.5);
        assert_eq!(m[0][0], 0.0);
    }
}

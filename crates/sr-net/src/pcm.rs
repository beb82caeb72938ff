//! Wire PCM encoding
//!
//! Mixer accumulators carry left-justified `i32` samples; the wire wants
//! little-endian PCM at the sink's bit depth.

/// Encode left-justified `i32` samples to little-endian PCM bytes at
/// `bit_depth`, appending to `out`.
pub fn encode_payload(samples: &[i32], bit_depth: u16, out: &mut Vec<u8>) {
    match bit_depth {
        16 => {
            for &s in samples {
                let v = (s >> 16) as i16;
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        24 => {
            for &s in samples {
                let b = (s >> 8).to_le_bytes();
                out.extend_from_slice(&b[..3]);
            }
        }
        _ => {
            for &s in samples {
                out.extend_from_slice(&s.to_le_bytes());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_16() {
        let mut out = Vec::new();
        encode_payload(&[0x1234_0000, -0x1000_0000], 16, &mut out);
        assert_eq!(out, vec![0x34, 0x12, 0x00, 0xF0]);
    }

    #[test]
    fn test_encode_24_keeps_three_bytes() {
        let mut out = Vec::new();
        encode_payload(&[0x1234_5600], 24, &mut out);
        assert_eq!(out, vec![0x56, 0x34, 0x12]);
    }

    #[test]
    fn test_encode_32_is_verbatim() {
        let mut out = Vec::new();
        encode_payload(&[i32::MIN, i32::MAX], 32, &mut out);
        assert_eq!(out.len(), 8);
        assert_eq!(&out[..4], &i32::MIN.to_le_bytes());
    }
}

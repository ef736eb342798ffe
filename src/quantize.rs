//! Linear quantization of float regions to 8 or 16 bits

use crate::types::ValueRange;

/// Map `v` from `range` onto `[0, levels]`, rounding to nearest and
/// clamping values outside the range
fn quantize_value(v: f32, range: &ValueRange, levels: f32) -> f32 {
    let span = range.max - range.min;
    if span.is_nan() || span <= 0.0 {
        return 0.0;
    }
    let q = ((v - range.min) / span * levels).round();
    q.clamp(0.0, levels)
}

pub fn quantize_u8(data: &[f32], range: &ValueRange) -> Vec<u8> {
    data.iter()
        .map(|&v| quantize_value(v, range, 255.0) as u8)
        .collect()
}

/// 16-bit samples, each stored little-endian
pub fn quantize_u16(data: &[f32], range: &ValueRange) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 2);
    for &v in data {
        let q = quantize_value(v, range, 65535.0) as u16;
        out.extend_from_slice(&q.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u8_mapping() {
        let range = ValueRange::new(0.0, 1.0);
        let q = quantize_u8(&[0.0, 0.5, 1.0, -3.0, 7.0], &range);
        assert_eq!(q, vec![0, 128, 255, 0, 255]);
    }

    #[test]
    fn test_u16_little_endian() {
        let range = ValueRange::new(-1.0, 1.0);
        let q = quantize_u16(&[-1.0, 1.0, 0.0], &range);
        assert_eq!(q, vec![0, 0, 0xff, 0xff, 0x00, 0x80]);
    }

    #[test]
    fn test_degenerate_range() {
        let range = ValueRange::new(2.0, 2.0);
        assert_eq!(quantize_u8(&[2.0, 5.0], &range), vec![0, 0]);
    }
}

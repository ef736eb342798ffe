//! Utility functions

use crate::error::{Result, VdcError};
use num_traits::PrimInt;

/// Decode f32 samples stored with the given byte order
pub fn bytes_to_f32(bytes: &[u8], msb_first: bool) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(VdcError::InvalidFormat(
            "Byte length not aligned with data type size".to_string(),
        ));
    }

    let data = bytes
        .chunks_exact(4)
        .map(|c| {
            let raw = [c[0], c[1], c[2], c[3]];
            if msb_first {
                f32::from_be_bytes(raw)
            } else {
                f32::from_le_bytes(raw)
            }
        })
        .collect();
    Ok(data)
}

/// Encode f32 samples with the given byte order
pub fn f32_to_bytes(data: &[f32], msb_first: bool) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(data.len() * 4);
    for v in data {
        if msb_first {
            bytes.extend_from_slice(&v.to_be_bytes());
        } else {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
    }
    bytes
}

/// Integer division rounding up
pub fn ceil_div<T: PrimInt>(a: T, b: T) -> T {
    if a.is_zero() {
        return T::zero();
    }
    (a - T::one()) / b + T::one()
}

/// Format byte size in human-readable form
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Path of the file holding one refinement level of a variable
pub fn level_file_path(base: &str, level: usize) -> String {
    format!("{}.wb{}", base, level)
}

/// Copy a box out of a row-major 3D array
pub fn extract_box(
    src: &[f32],
    src_dims: [usize; 3],
    origin: [usize; 3],
    dims: [usize; 3],
) -> Vec<f32> {
    let mut out = Vec::with_capacity(dims[0] * dims[1] * dims[2]);
    for z in 0..dims[2] {
        for y in 0..dims[1] {
            let start = ((origin[2] + z) * src_dims[1] + origin[1] + y) * src_dims[0] + origin[0];
            out.extend_from_slice(&src[start..start + dims[0]]);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_conversion() {
        let data: Vec<f32> = vec![1.0, 2.0, 3.0, -4.5];
        for &msb in &[false, true] {
            let bytes = f32_to_bytes(&data, msb);
            assert_eq!(bytes.len(), data.len() * 4);
            assert_eq!(bytes_to_f32(&bytes, msb).unwrap(), data);
        }
        assert_eq!(&f32_to_bytes(&[1.0], true), &[0x3f, 0x80, 0, 0]);
        assert!(bytes_to_f32(&[0, 1, 2], false).is_err());
    }

    #[test]
    fn test_ceil_div() {
        assert_eq!(ceil_div(9usize, 2), 5);
        assert_eq!(ceil_div(8usize, 2), 4);
        assert_eq!(ceil_div(0usize, 4), 0);
        assert_eq!(ceil_div(1u32, 4), 1);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }

    #[test]
    fn test_level_file_path() {
        assert_eq!(level_file_path("data/u/u.0000", 0), "data/u/u.0000.wb0");
        assert_eq!(level_file_path("data/u/u.0012", 3), "data/u/u.0012.wb3");
    }

    #[test]
    fn test_extract_box() {
        let src: Vec<f32> = (0..27).map(|v| v as f32).collect();
        let b = extract_box(&src, [3, 3, 3], [1, 1, 1], [2, 1, 2]);
        assert_eq!(b, vec![13.0, 14.0, 22.0, 23.0]);
    }
}

//! Box-filter decimation used to synthesize refinement levels that are not
//! stored on disk.
//!
//! Each output sample averages the 1, 2, 4 or 8 input samples it covers:
//! the sum of those samples is scaled by the product over axes of `0.5` for
//! a full pair and `1.0` for an odd trailing sample.

use crate::coords::{iter_blocks, BlockCoord};
use crate::layout::VolumeLayout;
use crate::utils::{ceil_div, extract_box};
use crate::wavelet::brick;
use crate::block_io::block_to_nonblock;
use ndarray::{s, Array3, ArrayView3};

/// Length of an axis of `n` samples after one decimation
pub fn decimate_length(n: usize) -> usize {
    ceil_div(n, 2)
}

fn pair_weight(count: usize) -> f32 {
    if count == 2 {
        0.5
    } else {
        1.0
    }
}

/// Halve a 1D signal
pub fn decimate_1d(src: &[f32]) -> Vec<f32> {
    decimate_3d(src, [src.len(), 1, 1])
}

/// Halve a row-major 2D array of `dims` (x, y)
pub fn decimate_2d(src: &[f32], dims: [usize; 2]) -> Vec<f32> {
    decimate_3d(src, [dims[0], dims[1], 1])
}

/// Halve a row-major 3D array of `dims` (x, y, z) along every axis longer
/// than one sample
pub fn decimate_3d(src: &[f32], dims: [usize; 3]) -> Vec<f32> {
    let [nx, ny, nz] = dims;
    let Ok(view) = ArrayView3::from_shape((nz, ny, nx), src) else {
        return Vec::new();
    };
    let out = Array3::from_shape_fn(
        (decimate_length(nz), decimate_length(ny), decimate_length(nx)),
        |(k, j, i)| {
            let (z0, z1) = (2 * k, (2 * k + 2).min(nz));
            let (y0, y1) = (2 * j, (2 * j + 2).min(ny));
            let (x0, x1) = (2 * i, (2 * i + 2).min(nx));
            let w = pair_weight(z1 - z0) * pair_weight(y1 - y0) * pair_weight(x1 - x0);
            view.slice(s![z0..z1, y0..y1, x0..x1]).sum() * w
        },
    );
    out.into_raw_vec_and_offset().0
}

/// Blocks of `level + 1` whose voxels cover blocks `[bmin, bmax]` of `level`
pub fn fine_block_range(
    layout: &VolumeLayout,
    level: usize,
    bmin: BlockCoord,
    bmax: BlockCoord,
) -> (BlockCoord, BlockCoord) {
    let fbd = layout.block_dims(level + 1);
    let mut lo = bmin.0;
    let mut hi = bmax.0;
    for i in 0..layout.ndims() {
        lo[i] = 2 * bmin[i];
        hi[i] = (2 * bmax[i] + 1).min(fbd[i] - 1);
    }
    (BlockCoord(lo), BlockCoord(hi))
}

/// Build blocks `[bmin, bmax]` of `level` from the block-major `fine` data
/// covering [`fine_block_range`] of `level + 1`.
///
/// Only voxels inside the volume contribute. Padding past the volume edge
/// replicates the last valid voxel, as on disk.
pub fn decimate_region(
    layout: &VolumeLayout,
    level: usize,
    bmin: BlockCoord,
    bmax: BlockCoord,
    fine: &[f32],
) -> Vec<f32> {
    let bs = layout.block_size();
    let (fmin, fmax) = fine_block_range(layout, level, bmin, bmax);
    let fbd = [
        fmax[0] - fmin[0] + 1,
        fmax[1] - fmin[1] + 1,
        fmax[2] - fmin[2] + 1,
    ];
    let fdims = [fbd[0] * bs[0], fbd[1] * bs[1], fbd[2] * bs[2]];
    let fine_vox = block_to_nonblock(fine, fbd, bs);

    let fine_dim = layout.dim(level + 1);
    let mut crop = [0; 3];
    for i in 0..3 {
        crop[i] = fdims[i].min(fine_dim[i] - fmin[i] * bs[i]);
    }
    let cropped = extract_box(&fine_vox, fdims, [0; 3], crop);
    let coarse = decimate_3d(&cropped, crop);
    let cdims = [
        decimate_length(crop[0]),
        decimate_length(crop[1]),
        decimate_length(crop[2]),
    ];
    let valid_max = [cdims[0] - 1, cdims[1] - 1, cdims[2] - 1];

    let mut out = Vec::with_capacity(layout.block_len() * count_blocks(bmin, bmax));
    for b in iter_blocks(bmin, bmax) {
        let origin = [
            (b[0] - bmin[0]) * bs[0],
            (b[1] - bmin[1]) * bs[1],
            (b[2] - bmin[2]) * bs[2],
        ];
        out.extend(brick(&coarse, cdims, origin, [0; 3], valid_max, bs));
    }
    out
}

fn count_blocks(bmin: BlockCoord, bmax: BlockCoord) -> usize {
    (0..3).map(|i| bmax[i] - bmin[i] + 1).product()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VarType;

    #[test]
    fn test_decimate_length() {
        assert_eq!(decimate_length(5), 3);
        assert_eq!(decimate_length(4), 2);
        assert_eq!(decimate_length(1), 1);
    }

    #[test]
    fn test_decimate_1d_weights() {
        let out = decimate_1d(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(out, vec![(1.0 + 2.0) * 0.5, (3.0 + 4.0) * 0.5, 5.0]);
        assert_eq!(out, vec![1.5, 3.5, 5.0]);
    }

    #[test]
    fn test_decimate_2d_odd_edges() {
        // 3 x 3
        let src = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0];
        let out = decimate_2d(&src, [3, 3]);
        assert_eq!(out, vec![3.0, 4.5, 7.5, 9.0]);
    }

    #[test]
    fn test_decimate_3d_constant() {
        let out = decimate_3d(&[2.0; 5 * 4 * 3], [5, 4, 3]);
        assert_eq!(out.len(), 3 * 2 * 2);
        assert!(out.iter().all(|&v| v == 2.0));
    }

    #[test]
    fn test_decimate_region_matches_voxels() {
        // 6 voxels along x at the finest level, 3 at the coarser level
        let layout = VolumeLayout::from_dims(VarType::Var2DXY, [6, 2, 1], [2, 2, 1], 1);
        assert_eq!(layout.dim(0), [3, 1, 1]);
        let (fmin, fmax) = fine_block_range(&layout, 0, BlockCoord::new(0, 0, 0), BlockCoord::new(1, 0, 0));
        assert_eq!(fmin, BlockCoord::new(0, 0, 0));
        assert_eq!(fmax, BlockCoord::new(2, 0, 0));

        // rows y=0 and y=1 of each 2x2 fine block
        let fine = vec![
            1.0, 2.0, 1.0, 2.0, //
            3.0, 4.0, 3.0, 4.0, //
            5.0, 6.0, 5.0, 6.0,
        ];
        let out = decimate_region(&layout, 0, BlockCoord::new(0, 0, 0), BlockCoord::new(1, 0, 0), &fine);
        // coarse voxels 1.5, 3.5, 5.5; block 1 pads x past the edge, y by replication
        assert_eq!(out, vec![1.5, 3.5, 1.5, 3.5, 5.5, 5.5, 5.5, 5.5]);
    }
}

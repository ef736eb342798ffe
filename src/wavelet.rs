//! Separable block wavelet transform
//!
//! Transforms a super-block of `C = 2^ndims` same-level blocks into one
//! coarser lambda block and `C - 1` gamma blocks, and back. The 1D lifting
//! transform is applied along X, then Y, then Z (3D only). Each application
//! consumes a pair of blocks adjacent along the axis; the left child fills the
//! first half of the lambda and gamma outputs and the right child the second.
//!
//! Children are indexed `z*4 + y*2 + x`. Outputs are `[lambda, gammas..]`
//! with the X gammas at `C/2 + (z*2 + y)`, the Y gammas at `C/4 + z` and the
//! Z gamma at 1.

use crate::coords::child_offset;
use crate::error::{Result, VdcError};
use crate::lifting::Lifting1D;

/// Block-granular separable wavelet transform
#[derive(Debug, Clone)]
pub struct WaveletBlock {
    ndims: usize,
    bs: [usize; 3],
    lifting: Vec<Lifting1D>,
}

impl WaveletBlock {
    /// Transform over blocks of `bs` voxels using `ndims` axes
    pub fn new(ndims: usize, bs: [usize; 3], n: usize, ntilde: usize) -> Result<Self> {
        if ndims != 2 && ndims != 3 {
            return Err(VdcError::Configuration(format!(
                "unsupported dimensionality {}",
                ndims
            )));
        }
        let mut lifting = Vec::with_capacity(ndims);
        for &width in bs.iter().take(ndims) {
            if width % 2 != 0 {
                return Err(VdcError::Configuration(format!(
                    "block size {:?} must be even along transformed axes",
                    bs
                )));
            }
            lifting.push(Lifting1D::new(n, ntilde, width)?);
        }
        Ok(Self { ndims, bs, lifting })
    }

    pub fn ndims(&self) -> usize {
        self.ndims
    }

    pub fn num_children(&self) -> usize {
        1 << self.ndims
    }

    pub fn block_len(&self) -> usize {
        self.bs.iter().product()
    }

    /// Forward transform `C` children into `[lambda, gammas..]`
    pub fn forward(&self, children: &[Vec<f32>]) -> Result<Vec<Vec<f32>>> {
        let c = self.num_children();
        self.check_blocks(children)?;
        let mut dst = vec![Vec::new(); c];

        // X
        let mut lx = Vec::with_capacity(c / 2);
        for yz in 0..c / 2 {
            let (l, g) = self.forward_pair(0, &children[yz * 2], &children[yz * 2 + 1])?;
            lx.push(l);
            dst[c / 2 + yz] = g;
        }

        // Y
        let mut ly = Vec::with_capacity(c / 4);
        for z in 0..c / 4 {
            let (l, g) = self.forward_pair(1, &lx[z * 2], &lx[z * 2 + 1])?;
            ly.push(l);
            dst[c / 4 + z] = g;
        }

        // Z
        if self.ndims == 3 {
            let (l, g) = self.forward_pair(2, &ly[0], &ly[1])?;
            dst[0] = l;
            dst[1] = g;
        } else {
            dst[0] = ly.swap_remove(0);
        }
        Ok(dst)
    }

    /// Inverse transform `[lambda, gammas..]` back into `C` children
    pub fn inverse(&self, coeffs: &[Vec<f32>]) -> Result<Vec<Vec<f32>>> {
        let c = self.num_children();
        self.check_blocks(coeffs)?;

        let ly: Vec<Vec<f32>> = if self.ndims == 3 {
            let (l, r) = self.inverse_pair(2, &coeffs[0], &coeffs[1])?;
            vec![l, r]
        } else {
            vec![coeffs[0].clone()]
        };

        let mut lx = vec![Vec::new(); c / 2];
        for z in 0..c / 4 {
            let (l, r) = self.inverse_pair(1, &ly[z], &coeffs[c / 4 + z])?;
            lx[z * 2] = l;
            lx[z * 2 + 1] = r;
        }

        let mut children = vec![Vec::new(); c];
        for yz in 0..c / 2 {
            let (l, r) = self.inverse_pair(0, &lx[yz], &coeffs[c / 2 + yz])?;
            children[yz * 2] = l;
            children[yz * 2 + 1] = r;
        }
        Ok(children)
    }

    fn check_blocks(&self, blocks: &[Vec<f32>]) -> Result<()> {
        let len = self.block_len();
        if blocks.len() != self.num_children() || blocks.iter().any(|b| b.len() != len) {
            return Err(VdcError::InvalidDimensions(format!(
                "expected {} blocks of {} voxels",
                self.num_children(),
                len
            )));
        }
        Ok(())
    }

    fn stride(&self, axis: usize) -> usize {
        self.bs[..axis].iter().product()
    }

    /// Offsets of the first voxel of every line along `axis`
    fn line_starts(&self, axis: usize) -> impl Iterator<Item = usize> + '_ {
        let stride = self.stride(axis);
        let width = self.bs[axis];
        (0..self.block_len()).filter(move |i| (i / stride) % width == 0)
    }

    fn forward_pair(&self, axis: usize, left: &[f32], right: &[f32]) -> Result<(Vec<f32>, Vec<f32>)> {
        let width = self.bs[axis];
        let half = width / 2;
        let stride = self.stride(axis);
        let lifting = &self.lifting[axis];

        let mut lambda = vec![0.0; self.block_len()];
        let mut gamma = vec![0.0; self.block_len()];
        let mut line = vec![0.0; width];

        for start in self.line_starts(axis) {
            for (side, src) in [left, right].iter().enumerate() {
                for (k, v) in line.iter_mut().enumerate() {
                    *v = src[start + k * stride];
                }
                lifting.forward_transform(&mut line)?;
                for k in 0..half {
                    let off = start + (side * half + k) * stride;
                    lambda[off] = line[2 * k];
                    gamma[off] = line[2 * k + 1];
                }
            }
        }
        Ok((lambda, gamma))
    }

    fn inverse_pair(&self, axis: usize, lambda: &[f32], gamma: &[f32]) -> Result<(Vec<f32>, Vec<f32>)> {
        let width = self.bs[axis];
        let half = width / 2;
        let stride = self.stride(axis);
        let lifting = &self.lifting[axis];

        let mut left = vec![0.0; self.block_len()];
        let mut right = vec![0.0; self.block_len()];
        let mut line = vec![0.0; width];

        for start in self.line_starts(axis) {
            for side in 0..2 {
                for k in 0..half {
                    let off = start + (side * half + k) * stride;
                    line[2 * k] = lambda[off];
                    line[2 * k + 1] = gamma[off];
                }
                lifting.inverse_transform(&mut line)?;
                let dst = if side == 0 { &mut left } else { &mut right };
                for (k, v) in line.iter().enumerate() {
                    dst[start + k * stride] = *v;
                }
            }
        }
        Ok((left, right))
    }
}

/// Which child offsets exist along each axis: `valid[axis][offset]`
pub type ChildMask = [[bool; 2]; 3];

/// True if child `c` exists under `valid`
pub fn child_present(c: usize, valid: &ChildMask) -> bool {
    let off = child_offset(c);
    (0..3).all(|a| valid[a][off[a]])
}

/// Synthesize missing children by replicating the edge voxels of the
/// nearest present child along each axis where the child is absent.
///
/// Present children along any axis must include at least one offset.
pub fn fill_missing(children: &mut [Vec<f32>], valid: &ChildMask, bs: [usize; 3]) {
    let len: usize = bs.iter().product();
    for c in 0..children.len() {
        if child_present(c, valid) {
            continue;
        }
        let off = child_offset(c);
        let mut src_off = off;
        // voxel coordinate pinned on each replaced axis
        let mut pinned: [Option<usize>; 3] = [None; 3];
        for a in 0..3 {
            if !valid[a][off[a]] {
                src_off[a] = 1 - off[a];
                pinned[a] = Some(if off[a] == 1 { bs[a] - 1 } else { 0 });
            }
        }
        let src = src_off[0] + src_off[1] * 2 + src_off[2] * 4;

        let mut block = vec![0.0; len];
        for z in 0..bs[2] {
            let sz = pinned[2].unwrap_or(z);
            for y in 0..bs[1] {
                let sy = pinned[1].unwrap_or(y);
                for x in 0..bs[0] {
                    let sx = pinned[0].unwrap_or(x);
                    block[(z * bs[1] + y) * bs[0] + x] = children[src][(sz * bs[1] + sy) * bs[0] + sx];
                }
            }
        }
        children[c] = block;
    }
}

/// Copy a block out of a row-major array, clamping reads to `valid_max`
/// so voxels past the edge replicate the nearest valid sample
pub fn brick(
    src: &[f32],
    src_dims: [usize; 3],
    origin: [usize; 3],
    valid_min: [usize; 3],
    valid_max: [usize; 3],
    bs: [usize; 3],
) -> Vec<f32> {
    let mut block = Vec::with_capacity(bs.iter().product());
    for z in 0..bs[2] {
        let sz = (origin[2] + z).clamp(valid_min[2], valid_max[2]);
        for y in 0..bs[1] {
            let sy = (origin[1] + y).clamp(valid_min[1], valid_max[1]);
            let row = (sz * src_dims[1] + sy) * src_dims[0];
            for x in 0..bs[0] {
                let sx = (origin[0] + x).clamp(valid_min[0], valid_max[0]);
                block.push(src[row + sx]);
            }
        }
    }
    block
}

/// Copy a block into a row-major array at `origin`, dropping voxels
/// outside `dst_dims`
pub fn unbrick(block: &[f32], bs: [usize; 3], dst: &mut [f32], dst_dims: [usize; 3], origin: [isize; 3]) {
    for z in 0..bs[2] {
        let dz = origin[2] + z as isize;
        if dz < 0 || dz as usize >= dst_dims[2] {
            continue;
        }
        for y in 0..bs[1] {
            let dy = origin[1] + y as isize;
            if dy < 0 || dy as usize >= dst_dims[1] {
                continue;
            }
            for x in 0..bs[0] {
                let dx = origin[0] + x as isize;
                if dx < 0 || dx as usize >= dst_dims[0] {
                    continue;
                }
                dst[(dz as usize * dst_dims[1] + dy as usize) * dst_dims[0] + dx as usize] =
                    block[(z * bs[1] + y) * bs[0] + x];
            }
        }
    }
}

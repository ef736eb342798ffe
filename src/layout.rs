//! Volume layout - how a variable is divided into blocks at each refinement level

use crate::coords::{BlockCoord, VoxelCoord};
use crate::error::{Result, VdcError};
use crate::metadata::VdcMetadata;
use crate::types::VarType;
use serde::{Deserialize, Serialize};

/// Geometry of one variable across its refinement pyramid.
///
/// All coordinates are in storage order. A 2D variable keeps its two axes in
/// slots 0 and 1 and a unit third axis (dimension 1, block size 1) that is
/// never transformed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeLayout {
    var_type: VarType,
    dim: [usize; 3],
    block_size: [usize; 3],
    num_transforms: usize,
    extents: [f64; 6],
}

impl VolumeLayout {
    /// Layout of a variable of type `var_type` at timestep `ts`
    pub fn new(metadata: &VdcMetadata, var_type: VarType, ts: usize) -> Self {
        let axes = var_type.axes();
        let ext = metadata.extents_at(ts);
        let mut dim = [1; 3];
        let mut block_size = [1; 3];
        let mut extents = [0.0; 6];
        for (i, &axis) in axes.iter().enumerate() {
            extents[i] = ext[axis];
            extents[i + 3] = ext[axis + 3];
            if i < var_type.ndims() {
                dim[i] = metadata.dimension[axis];
                block_size[i] = metadata.block_size[axis];
            }
        }
        Self {
            var_type,
            dim,
            block_size,
            num_transforms: metadata.num_transforms,
            extents,
        }
    }

    /// Layout from explicit geometry, unit extents
    pub fn from_dims(
        var_type: VarType,
        dim: [usize; 3],
        block_size: [usize; 3],
        num_transforms: usize,
    ) -> Self {
        let mut dim = dim;
        let mut block_size = block_size;
        if var_type.is_2d() {
            dim[2] = 1;
            block_size[2] = 1;
        }
        Self {
            var_type,
            dim,
            block_size,
            num_transforms,
            extents: [0.0, 0.0, 0.0, 1.0, 1.0, 1.0],
        }
    }

    pub fn var_type(&self) -> VarType {
        self.var_type
    }

    pub fn ndims(&self) -> usize {
        self.var_type.ndims()
    }

    /// Children per super-block: 8 in 3D, 4 in 2D
    pub fn num_children(&self) -> usize {
        1 << self.ndims()
    }

    pub fn num_transforms(&self) -> usize {
        self.num_transforms
    }

    pub fn block_size(&self) -> [usize; 3] {
        self.block_size
    }

    /// Voxels in one block
    pub fn block_len(&self) -> usize {
        self.block_size.iter().product()
    }

    pub fn extents(&self) -> [f64; 6] {
        self.extents
    }

    /// Reject levels beyond the stored pyramid
    pub fn check_level(&self, level: usize) -> Result<()> {
        if level > self.num_transforms {
            return Err(VdcError::InvalidRegion(format!(
                "refinement level {} exceeds {} transforms",
                level, self.num_transforms
            )));
        }
        Ok(())
    }

    /// Voxel dimension at `level`
    pub fn dim(&self, level: usize) -> [usize; 3] {
        let shift = self.num_transforms - level.min(self.num_transforms);
        let mut d = self.dim;
        for (i, v) in d.iter_mut().enumerate().take(self.ndims()) {
            *v = crate::utils::ceil_div(self.dim[i], 1usize << shift);
        }
        d
    }

    /// Block dimension at `level`
    pub fn block_dims(&self, level: usize) -> [usize; 3] {
        let d = self.dim(level);
        [
            crate::utils::ceil_div(d[0], self.block_size[0]),
            crate::utils::ceil_div(d[1], self.block_size[1]),
            crate::utils::ceil_div(d[2], self.block_size[2]),
        ]
    }

    /// Total blocks at `level`
    pub fn num_blocks(&self, level: usize) -> usize {
        self.block_dims(level).iter().product()
    }

    /// Linear index of a block at `level`, (z, y, x) order
    pub fn block_index(&self, level: usize, b: BlockCoord) -> usize {
        let bd = self.block_dims(level);
        (b[2] * bd[1] + b[1]) * bd[0] + b[0]
    }

    pub fn map_vox_to_blk(&self, v: VoxelCoord) -> BlockCoord {
        v.to_block(self.block_size)
    }

    /// Map a native voxel coordinate onto `level`
    pub fn transform_coord(&self, v: VoxelCoord, level: usize) -> VoxelCoord {
        let k = self.num_transforms - level.min(self.num_transforms);
        let mut c = v.coarsen(k);
        // the unit axis of a 2D variable is never halved
        if self.var_type.is_2d() {
            c.0[2] = v.0[2];
        }
        c
    }

    /// User coordinate of a voxel at `level`.
    ///
    /// Each halving moves the sample to the center of mass of its two
    /// parents, half a native spacing further along.
    pub fn map_vox_to_user(&self, level: usize, v: VoxelCoord) -> [f64; 3] {
        let k = self.num_transforms - level.min(self.num_transforms);
        let mut user = [0.0; 3];
        for i in 0..3 {
            let (x0, delta) = self.axis_spacing(i, k);
            user[i] = x0 + v[i] as f64 * delta;
        }
        user
    }

    /// Nearest voxel at `level` to a user coordinate, clamped to the volume
    pub fn map_user_to_vox(&self, level: usize, user: [f64; 3]) -> VoxelCoord {
        let k = self.num_transforms - level.min(self.num_transforms);
        let dim = self.dim(level);
        let mut v = [0usize; 3];
        for i in 0..3 {
            let (x0, delta) = self.axis_spacing(i, k);
            if delta == 0.0 {
                continue;
            }
            let f = ((user[i] - x0) / delta).round();
            v[i] = if f < 0.0 { 0 } else { (f as usize).min(dim[i] - 1) };
        }
        VoxelCoord(v)
    }

    /// Origin and spacing of axis `i` after `k` halvings
    fn axis_spacing(&self, i: usize, k: usize) -> (f64, f64) {
        let (lo, hi) = (self.extents[i], self.extents[i + 3]);
        if self.dim[i] <= 1 {
            return (lo, 0.0);
        }
        let mut delta = (hi - lo) / (self.dim[i] - 1) as f64;
        let mut x0 = lo;
        let halvings = if i < self.ndims() { k } else { 0 };
        for _ in 0..halvings {
            x0 += 0.5 * delta;
            delta *= 2.0;
        }
        (x0, delta)
    }

    /// User extents of the volume at `level`
    pub fn user_extents(&self, level: usize) -> [f64; 6] {
        let d = self.dim(level);
        let lo = self.map_vox_to_user(level, VoxelCoord([0, 0, 0]));
        let hi = self.map_vox_to_user(level, VoxelCoord([d[0] - 1, d[1] - 1, d[2] - 1]));
        [lo[0], lo[1], lo[2], hi[0], hi[1], hi[2]]
    }

    pub fn is_valid_region(&self, level: usize, min: VoxelCoord, max: VoxelCoord) -> bool {
        if level > self.num_transforms {
            return false;
        }
        let d = self.dim(level);
        (0..3).all(|i| min[i] <= max[i] && max[i] < d[i])
    }

    pub fn is_valid_region_blk(&self, level: usize, bmin: BlockCoord, bmax: BlockCoord) -> bool {
        if level > self.num_transforms {
            return false;
        }
        let bd = self.block_dims(level);
        (0..3).all(|i| bmin[i] <= bmax[i] && bmax[i] < bd[i])
    }

    /// Validate a voxel region at `level`
    pub fn check_region(&self, level: usize, min: VoxelCoord, max: VoxelCoord) -> Result<()> {
        self.check_level(level)?;
        if !self.is_valid_region(level, min, max) {
            return Err(VdcError::InvalidRegion(format!(
                "region {:?}..{:?} outside volume {:?} at level {}",
                min.0,
                max.0,
                self.dim(level),
                level
            )));
        }
        Ok(())
    }

    /// Smallest box of native voxels containing `[min, max]` whose faces lie
    /// on super-block boundaries of the coarsest level
    pub fn enclosing_region(&self, min: VoxelCoord, max: VoxelCoord) -> (VoxelCoord, VoxelCoord) {
        let mut lo = [0; 3];
        let mut hi = [0; 3];
        for i in 0..3 {
            let unit = if i < self.ndims() {
                self.block_size[i] << self.num_transforms
            } else {
                self.block_size[i]
            };
            lo[i] = (min[i] / unit) * unit;
            hi[i] = (max[i] / unit + 1) * unit - 1;
        }
        (VoxelCoord(lo), VoxelCoord(hi))
    }

    /// Size in bytes of one block of f32 samples
    pub fn block_size_bytes(&self) -> usize {
        self.block_len() * std::mem::size_of::<f32>()
    }

    /// Get a summary string of the layout
    pub fn summary(&self) -> String {
        let size_str = self
            .dim
            .iter()
            .take(self.ndims())
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(" x ");

        format!(
            "{} Volume: {}, {} blocks of {:?}, {} transforms",
            self.var_type,
            size_str,
            self.num_blocks(self.num_transforms),
            &self.block_size[..self.ndims()],
            self.num_transforms
        )
    }
}

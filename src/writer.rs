//! Sequential slab writer
//!
//! Volumes are written two block rows at a time along the outermost axis
//! (z for 3D variables, y for 2D). Each pair of rows at the finest level is
//! transformed into one row of coarser lambda blocks plus gamma blocks. The
//! gammas go straight to disk; the lambda row is buffered until its partner
//! arrives and the pair is transformed again, recursively, until level 0,
//! where the lambdas themselves are written.

use crate::block_io::WaveletBlockIO;
use crate::coords::{child_offset, BlockCoord, VoxelCoord};
use crate::error::{Result, VdcError};
use crate::io::IOManager;
use crate::layout::VolumeLayout;
use crate::metadata::VdcMetadata;
use crate::types::ValueRange;
use crate::utils::ceil_div;
use crate::wavelet::{brick, child_present, fill_missing, ChildMask, WaveletBlock};
use std::sync::Arc;
use tracing::debug;

/// Blocks of one row at `r` along outer axis `o`, in block index order
pub(crate) fn row_coords(bd: [usize; 3], o: usize, r: usize) -> Vec<BlockCoord> {
    if o == 2 {
        (0..bd[1])
            .flat_map(|y| (0..bd[0]).map(move |x| BlockCoord([x, y, r])))
            .collect()
    } else {
        (0..bd[0]).map(|x| BlockCoord([x, r, 0])).collect()
    }
}

/// Position of a block within its row
pub(crate) fn row_index(b: BlockCoord, bd: [usize; 3], o: usize) -> usize {
    if o == 2 {
        b[1] * bd[0] + b[0]
    } else {
        b[0]
    }
}

/// Children of `parent` as block coordinates one level finer
pub(crate) fn child_block(parent: BlockCoord, c: usize) -> BlockCoord {
    let off = child_offset(c);
    BlockCoord([
        2 * parent[0] + off[0],
        2 * parent[1] + off[1],
        2 * parent[2] + off[2],
    ])
}

/// Writes a variable slab pair by slab pair
pub struct SlabWriter {
    wbio: WaveletBlockIO,
    wb: Option<WaveletBlock>,
    slab_count: usize,
    /// unpaired even row per level
    pending: Vec<Option<(usize, Vec<Vec<f32>>)>>,
    slice_buf: Vec<f32>,
    slice_count: usize,
}

impl SlabWriter {
    pub fn new(io: Arc<dyn IOManager>, metadata: VdcMetadata) -> Result<Self> {
        metadata.validate()?;
        Ok(Self {
            wbio: WaveletBlockIO::new(io, metadata),
            wb: None,
            slab_count: 0,
            pending: Vec::new(),
            slice_buf: Vec::new(),
            slice_count: 0,
        })
    }

    pub fn layout(&self) -> &VolumeLayout {
        self.wbio.layout()
    }

    /// Create the variable's files, levels `0..=reflevel` (all by default)
    pub fn open_variable_write(&mut self, timestep: usize, varname: &str, reflevel: Option<usize>) -> Result<()> {
        self.wbio.open_variable_write(timestep, varname, reflevel)?;
        let layout = self.wbio.layout().clone();
        let metadata = self.wbio.metadata();
        self.wb = if layout.num_transforms() > 0 {
            match WaveletBlock::new(
                layout.ndims(),
                layout.block_size(),
                metadata.filter_coef,
                metadata.lifting_coef,
            ) {
                Ok(wb) => Some(wb),
                Err(e) => {
                    self.wbio.abort();
                    return Err(e);
                }
            }
        } else {
            None
        };
        self.slab_count = 0;
        self.pending = vec![None; layout.num_transforms() + 1];
        self.slice_count = 0;
        self.slice_buf = vec![0.0; self.slab_dims().iter().product()];
        Ok(())
    }

    fn outer_axis(&self) -> usize {
        self.layout().ndims() - 1
    }

    /// Voxel dimensions of the buffer `write_slabs` expects: the block-padded
    /// extent on the inner axes and two block rows on the outer axis
    pub fn slab_dims(&self) -> [usize; 3] {
        let layout = self.layout();
        let bd = layout.block_dims(layout.num_transforms());
        let bs = layout.block_size();
        let o = self.outer_axis();
        let mut d = [bd[0] * bs[0], bd[1] * bs[1], bd[2] * bs[2]];
        d[o] = 2 * bs[o];
        d
    }

    /// Number of `write_slabs` calls a complete variable takes
    pub fn num_slab_pairs(&self) -> usize {
        let layout = self.layout();
        ceil_div(layout.block_dims(layout.num_transforms())[self.outer_axis()], 2)
    }

    /// Write the next two block rows of finest-level data.
    ///
    /// `buf` is row-major with dimensions `slab_dims()`. Voxels past the
    /// volume edge are ignored and replaced by the nearest valid voxel.
    pub fn write_slabs(&mut self, buf: &[f32]) -> Result<()> {
        self.wbio.require_writing()?;
        if self.slab_count >= self.num_slab_pairs() {
            return Err(VdcError::State(format!(
                "all {} slab pairs already written",
                self.num_slab_pairs()
            )));
        }
        let sd = self.slab_dims();
        if buf.len() != sd.iter().product::<usize>() {
            return Err(VdcError::InvalidDimensions(format!(
                "slab buffer has {} samples, expected {:?}",
                buf.len(),
                sd
            )));
        }

        let layout = self.layout().clone();
        let n = layout.num_transforms();
        let o = self.outer_axis();
        let bs = layout.block_size();
        let dim = layout.dim(n);
        let p = self.slab_count;
        let base = 2 * p * bs[o];

        let mut vmax = [dim[0] - 1, dim[1] - 1, dim[2] - 1];
        vmax[o] = (dim[o] - 1 - base).min(sd[o] - 1);

        let mut range = ValueRange::empty();
        for z in 0..=vmax[2] {
            for y in 0..=vmax[1] {
                let row = (z * sd[1] + y) * sd[0];
                for &v in &buf[row..=row + vmax[0]] {
                    range.include(v);
                }
            }
        }
        self.wbio.include_data_range(&range);

        let bd = layout.block_dims(n);
        let local_origin = |b: BlockCoord| {
            let mut origin = [b[0] * bs[0], b[1] * bs[1], b[2] * bs[2]];
            origin[o] -= base;
            origin
        };

        if n == 0 {
            for r in 2 * p..(2 * p + 2).min(bd[o]) {
                for b in row_coords(bd, o, r) {
                    let block = brick(buf, sd, local_origin(b), [0; 3], vmax, bs);
                    self.wbio.set_block_min_max(0, b, ValueRange::of(&block));
                    self.wbio.write_lambda_block(b, &block)?;
                }
            }
        } else {
            let c = layout.num_children();
            let mut lambdas = Vec::new();
            for pb in row_coords(layout.block_dims(n - 1), o, p) {
                let mut children = Vec::with_capacity(c);
                for child in 0..c {
                    let cb = child_block(pb, child);
                    let block = brick(buf, sd, local_origin(cb), [0; 3], vmax, bs);
                    if cb.within(bd) {
                        self.wbio.set_block_min_max(n, cb, ValueRange::of(&block));
                    }
                    children.push(block);
                }
                lambdas.push(self.transform(n, pb, &children)?);
            }
            self.push_row(n - 1, p, lambdas)?;
        }

        self.slab_count += 1;
        Ok(())
    }

    /// Forward transform one super-block, write its gammas, return the lambda
    fn transform(&mut self, level: usize, parent: BlockCoord, children: &[Vec<f32>]) -> Result<Vec<f32>> {
        let wb = self
            .wb
            .as_ref()
            .ok_or_else(|| VdcError::State("no transform configured".to_string()))?;
        let mut coeffs = wb.forward(children)?;
        if level <= self.wbio.max_level() {
            self.wbio.write_gammas(level, parent, &coeffs[1..])?;
        }
        Ok(std::mem::take(&mut coeffs[0]))
    }

    /// Hand a completed lambda row `r` to `level`
    fn push_row(&mut self, level: usize, r: usize, row: Vec<Vec<f32>>) -> Result<()> {
        let layout = self.layout().clone();
        let o = self.outer_axis();
        if level == 0 {
            for (b, block) in row_coords(layout.block_dims(0), o, r).into_iter().zip(&row) {
                self.wbio.write_lambda_block(b, block)?;
            }
            return Ok(());
        }

        if r % 2 == 0 {
            if self.pending[level].is_some() {
                return Err(VdcError::State(format!(
                    "row {} at level {} arrived before its predecessor was paired",
                    r, level
                )));
            }
            self.pending[level] = Some((r, row));
            return Ok(());
        }
        match self.pending[level].take() {
            Some((left_r, left)) if left_r + 1 == r => self.transform_row_pair(level, r / 2, left, Some(row)),
            _ => Err(VdcError::State(format!(
                "row {} at level {} has no left partner",
                r, level
            ))),
        }
    }

    /// Transform the row pair `2 * pr`, `2 * pr + 1` of `level`, filling a
    /// missing right row or missing blocks by edge replication
    fn transform_row_pair(
        &mut self,
        level: usize,
        pr: usize,
        left: Vec<Vec<f32>>,
        right: Option<Vec<Vec<f32>>>,
    ) -> Result<()> {
        let layout = self.layout().clone();
        let o = self.outer_axis();
        let bd = layout.block_dims(level);
        let bs = layout.block_size();
        let c = layout.num_children();

        let mut lambdas = Vec::new();
        for pb in row_coords(layout.block_dims(level - 1), o, pr) {
            let mut valid: ChildMask = [[true, false]; 3];
            for (a, v) in valid.iter_mut().enumerate().take(layout.ndims()) {
                v[1] = 2 * pb[a] + 1 < bd[a];
            }
            valid[o][1] = right.is_some();

            let mut children = vec![Vec::new(); c];
            for (child, slot) in children.iter_mut().enumerate() {
                if !child_present(child, &valid) {
                    continue;
                }
                let cb = child_block(pb, child);
                let row = if child_offset(child)[o] == 0 {
                    &left
                } else {
                    right.as_ref().unwrap_or(&left)
                };
                *slot = row[row_index(cb, bd, o)].clone();
            }
            fill_missing(&mut children, &valid, bs);
            lambdas.push(self.transform(level, pb, &children)?);
        }
        self.push_row(level - 1, pr, lambdas)
    }

    /// Append one plane of native voxels along the outer axis (an XY plane
    /// for 3D variables, an X row for 2D). Full slab pairs are written as
    /// they complete.
    pub fn write_slice(&mut self, slice: &[f32]) -> Result<()> {
        self.wbio.require_writing()?;
        let layout = self.layout().clone();
        let o = self.outer_axis();
        let dim = layout.dim(layout.num_transforms());
        let plane_len: usize = dim[..o].iter().product();
        if slice.len() != plane_len {
            return Err(VdcError::InvalidDimensions(format!(
                "slice has {} samples, expected {}",
                slice.len(),
                plane_len
            )));
        }
        if self.slice_count >= dim[o] {
            return Err(VdcError::State(format!("all {} slices already written", dim[o])));
        }

        let sd = self.slab_dims();
        let per_pair = 2 * layout.block_size()[o];
        let k = self.slice_count % per_pair;
        let rows = if o == 2 { dim[1] } else { 1 };
        for y in 0..rows {
            let dst = if o == 2 { (k * sd[1] + y) * sd[0] } else { k * sd[0] };
            self.slice_buf[dst..dst + dim[0]].copy_from_slice(&slice[y * dim[0]..(y + 1) * dim[0]]);
        }
        self.slice_count += 1;

        if k == per_pair - 1 || self.slice_count == dim[o] {
            let buf = std::mem::take(&mut self.slice_buf);
            let result = self.write_slabs(&buf);
            self.slice_buf = buf;
            result?;
        }
        Ok(())
    }

    /// Write a whole native volume (row-major, storage axis order)
    pub fn write_volume(&mut self, data: &[f32]) -> Result<()> {
        self.wbio.require_writing()?;
        let layout = self.layout().clone();
        let dim = layout.dim(layout.num_transforms());
        if data.len() != dim.iter().product::<usize>() {
            return Err(VdcError::InvalidDimensions(format!(
                "volume has {} samples, expected {:?}",
                data.len(),
                dim
            )));
        }
        let plane_len: usize = dim[..self.outer_axis()].iter().product();
        for plane in data.chunks(plane_len) {
            self.write_slice(plane)?;
        }
        Ok(())
    }

    /// Finish the pyramid, propagate block statistics and flush the files
    pub fn close_variable(&mut self) -> Result<()> {
        self.wbio.require_writing()?;
        if self.slab_count != self.num_slab_pairs() {
            let written = self.slab_count;
            self.wbio.abort();
            return Err(VdcError::State(format!(
                "closed after {} of {} slab pairs",
                written,
                self.num_slab_pairs()
            )));
        }

        let layout = self.layout().clone();
        let n = layout.num_transforms();
        for level in (1..n).rev() {
            if let Some((r, left)) = self.pending[level].take() {
                self.transform_row_pair(level, r / 2, left, None)?;
            }
        }

        self.wbio.propagate_min_max(None);
        let dim = layout.dim(n);
        self.wbio
            .set_valid_region(VoxelCoord::default(), VoxelCoord([dim[0] - 1, dim[1] - 1, dim[2] - 1]));
        debug!(slab_pairs = self.slab_count, "slab writer finished pyramid");
        self.wbio.close_variable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::FileSystemIOManager;
    use crate::types::VarType;
    use tempfile::TempDir;

    fn writer(dir: &TempDir, dim: [usize; 3], bs: [usize; 3], n: usize) -> SlabWriter {
        let metadata = VdcMetadata::new(dim, bs, n)
            .with_variable("v", VarType::Var3D)
            .with_variable("h", VarType::Var2DXY);
        let io: Arc<dyn IOManager> = Arc::new(FileSystemIOManager::new(dir.path()));
        SlabWriter::new(io, metadata).unwrap()
    }

    #[test]
    fn test_slab_geometry() {
        let dir = TempDir::new().unwrap();
        let mut w = writer(&dir, [9, 9, 9], [4, 4, 4], 1);
        w.open_variable_write(0, "v", None).unwrap();
        assert_eq!(w.slab_dims(), [12, 12, 8]);
        assert_eq!(w.num_slab_pairs(), 2);

        w.close_variable().unwrap_err();
        w.open_variable_write(0, "h", None).unwrap();
        assert_eq!(w.slab_dims(), [12, 8, 1]);
        assert_eq!(w.num_slab_pairs(), 2);
    }

    #[test]
    fn test_too_many_slabs() {
        let dir = TempDir::new().unwrap();
        let mut w = writer(&dir, [4, 4, 4], [2, 2, 2], 1);
        w.open_variable_write(0, "v", None).unwrap();
        let buf = vec![1.0; 4 * 4 * 4];
        w.write_slabs(&buf).unwrap();
        assert!(matches!(w.write_slabs(&buf), Err(VdcError::State(_))));
        w.close_variable().unwrap();
        assert!(matches!(w.write_slabs(&buf), Err(VdcError::State(_))));
    }

    #[test]
    fn test_wrong_buffer_size() {
        let dir = TempDir::new().unwrap();
        let mut w = writer(&dir, [4, 4, 4], [2, 2, 2], 1);
        w.open_variable_write(0, "v", None).unwrap();
        assert!(matches!(
            w.write_slabs(&[0.0; 10]),
            Err(VdcError::InvalidDimensions(_))
        ));
        assert!(w.write_slice(&[0.0; 3]).is_err());
    }

    #[test]
    fn test_row_helpers() {
        let rows = row_coords([2, 2, 3], 2, 1);
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[3], BlockCoord::new(1, 1, 1));
        assert_eq!(row_index(rows[3], [2, 2, 3], 2), 3);
        assert_eq!(row_coords([3, 2, 1], 1, 1)[2], BlockCoord::new(2, 1, 0));
        assert_eq!(child_block(BlockCoord::new(1, 0, 2), 6), BlockCoord::new(2, 1, 5));
    }
}

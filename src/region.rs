//! Sub-region writer and reader
//!
//! Both walk the refinement pyramid as a tree rooted at the level 0 blocks
//! that intersect the region. A block at level `j` has `C` children at level
//! `j + 1`; only children that intersect the region are visited. The writer
//! recurses down to the finest level, pads finest blocks from the caller's
//! data by clamping to the region, and transforms back up, synthesizing
//! skipped children by edge replication. Writing the whole volume as one
//! region yields the same files as the slab writer.

use crate::block_io::{block_to_nonblock, WaveletBlockIO};
use crate::coords::{iter_blocks, BlockCoord, VoxelCoord};
use crate::error::{Result, VdcError};
use crate::io::IOManager;
use crate::layout::VolumeLayout;
use crate::metadata::VdcMetadata;
use crate::types::ValueRange;
use crate::utils::extract_box;
use crate::wavelet::{child_present, fill_missing, ChildMask, WaveletBlock};
use crate::writer::child_block;
use std::sync::Arc;
use tracing::debug;

fn make_transform(wbio: &mut WaveletBlockIO, needed: bool) -> Result<Option<WaveletBlock>> {
    if !needed {
        return Ok(None);
    }
    let layout = wbio.layout().clone();
    let metadata = wbio.metadata();
    match WaveletBlock::new(
        layout.ndims(),
        layout.block_size(),
        metadata.filter_coef,
        metadata.lifting_coef,
    ) {
        Ok(wb) => Ok(Some(wb)),
        Err(e) => {
            wbio.abort();
            Err(e)
        }
    }
}

/// Level 0 blocks whose subtrees cover the finest blocks `[bmin, bmax]`
fn root_blocks(layout: &VolumeLayout, bmin: BlockCoord, bmax: BlockCoord, level: usize) -> (BlockCoord, BlockCoord) {
    let mut lo = bmin.coarsen(level);
    let mut hi = bmax.coarsen(level);
    for a in layout.ndims()..3 {
        lo.0[a] = bmin[a];
        hi.0[a] = bmax[a];
    }
    (lo, hi)
}

/// Mask of the children of `b` (at `level`) whose subtrees intersect the
/// finest-level block box `[bmin, bmax]` of a pyramid `finest` levels deep
fn overlap_mask(
    layout: &VolumeLayout,
    b: BlockCoord,
    level: usize,
    finest: usize,
    bmin: BlockCoord,
    bmax: BlockCoord,
) -> ChildMask {
    let k = finest - level - 1;
    let sz = 1usize << k;
    let mut valid: ChildMask = [[true, false]; 3];
    for (a, v) in valid.iter_mut().enumerate().take(layout.ndims()) {
        for (off, slot) in v.iter_mut().enumerate() {
            let dst = (2 * b[a] + off) << k;
            *slot = !(dst > bmax[a] || dst + sz <= bmin[a]);
        }
    }
    valid
}

/// Writes arbitrary axis-aligned regions of native-resolution data
pub struct RegionWriter {
    wbio: WaveletBlockIO,
    wb: Option<WaveletBlock>,
    written: Vec<Vec<bool>>,
    valid: Option<(VoxelCoord, VoxelCoord)>,
}

impl RegionWriter {
    pub fn new(io: Arc<dyn IOManager>, metadata: VdcMetadata) -> Result<Self> {
        metadata.validate()?;
        Ok(Self {
            wbio: WaveletBlockIO::new(io, metadata),
            wb: None,
            written: Vec::new(),
            valid: None,
        })
    }

    pub fn layout(&self) -> &VolumeLayout {
        self.wbio.layout()
    }

    /// Create (truncating) the variable's files, levels `0..=reflevel`
    pub fn open_variable_write(&mut self, timestep: usize, varname: &str, reflevel: Option<usize>) -> Result<()> {
        self.wbio.open_variable_write(timestep, varname, reflevel)?;
        let layout = self.wbio.layout().clone();
        self.wb = make_transform(&mut self.wbio, layout.num_transforms() > 0)?;
        self.written = (0..=layout.num_transforms())
            .map(|l| vec![false; layout.num_blocks(l)])
            .collect();
        self.valid = None;
        Ok(())
    }

    /// Write native voxels `[min, max]` from a row-major buffer covering
    /// exactly that box
    pub fn write_region(&mut self, data: &[f32], min: VoxelCoord, max: VoxelCoord) -> Result<()> {
        self.wbio.require_writing()?;
        let layout = self.layout().clone();
        let n = layout.num_transforms();
        layout.check_region(n, min, max)?;
        let rdims = [max[0] - min[0] + 1, max[1] - min[1] + 1, max[2] - min[2] + 1];
        if data.len() != rdims.iter().product::<usize>() {
            return Err(VdcError::InvalidDimensions(format!(
                "region data has {} samples, expected {:?}",
                data.len(),
                rdims
            )));
        }

        let (elo, ehi) = layout.enclosing_region(min, max);
        debug!(
            region_min = ?min.0,
            region_max = ?max.0,
            enclosing_min = ?elo.0,
            enclosing_max = ?ehi.0,
            "writing region"
        );

        self.wbio.include_data_range(&ValueRange::of(data));
        self.valid = Some(match self.valid {
            None => (min, max),
            Some((lo, hi)) => {
                let mut lo = lo;
                let mut hi = hi;
                for a in 0..3 {
                    lo.0[a] = lo[a].min(min[a]);
                    hi.0[a] = hi[a].max(max[a]);
                }
                (lo, hi)
            }
        });

        let region = Region {
            data,
            rdims,
            min,
            max,
            bmin: layout.map_vox_to_blk(min),
            bmax: layout.map_vox_to_blk(max),
        };

        let (root_lo, root_hi) = root_blocks(&layout, region.bmin, region.bmax, n);
        for root in iter_blocks(root_lo, root_hi) {
            let lambda = self.process(&layout, &region, 0, root)?;
            self.wbio.write_lambda_block(root, &lambda)?;
        }
        Ok(())
    }

    /// Lambda block `b` of `level`, built from the region data below it
    fn process(&mut self, layout: &VolumeLayout, region: &Region, level: usize, b: BlockCoord) -> Result<Vec<f32>> {
        let n = layout.num_transforms();
        if level == n {
            let block = region.pad_block(b, layout.block_size());
            if b.inside(region.bmin, region.bmax) {
                self.wbio.set_block_min_max(n, b, ValueRange::of(&block));
                let idx = layout.block_index(n, b);
                self.written[n][idx] = true;
            }
            return Ok(block);
        }

        let valid = overlap_mask(layout, b, level, n, region.bmin, region.bmax);
        let c = layout.num_children();
        let mut children = vec![Vec::new(); c];
        for (child, slot) in children.iter_mut().enumerate() {
            if child_present(child, &valid) {
                *slot = self.process(layout, region, level + 1, child_block(b, child))?;
            }
        }
        fill_missing(&mut children, &valid, layout.block_size());

        let wb = self
            .wb
            .as_ref()
            .ok_or_else(|| VdcError::State("no transform configured".to_string()))?;
        let mut coeffs = wb.forward(&children)?;
        if level < self.wbio.max_level() {
            self.wbio.write_gammas(level + 1, b, &coeffs[1..])?;
        }
        Ok(std::mem::take(&mut coeffs[0]))
    }

    /// Write whole blocks `[bmin, bmax]` of the finest level from block-major
    /// data. Voxels past the volume edge are ignored.
    pub fn block_write_region(&mut self, blocks: &[f32], bmin: BlockCoord, bmax: BlockCoord) -> Result<()> {
        self.wbio.require_writing()?;
        let layout = self.layout().clone();
        let n = layout.num_transforms();
        if !layout.is_valid_region_blk(n, bmin, bmax) {
            return Err(VdcError::InvalidRegion(format!(
                "block region {:?}..{:?} outside {:?}",
                bmin.0,
                bmax.0,
                layout.block_dims(n)
            )));
        }
        let bs = layout.block_size();
        let bdims = [bmax[0] - bmin[0] + 1, bmax[1] - bmin[1] + 1, bmax[2] - bmin[2] + 1];
        if blocks.len() != bdims.iter().product::<usize>() * layout.block_len() {
            return Err(VdcError::InvalidDimensions(format!(
                "block data has {} samples for {:?} blocks",
                blocks.len(),
                bdims
            )));
        }

        let dim = layout.dim(n);
        let min = bmin.first_voxel(bs);
        let last = bmax.last_voxel(bs);
        let max = VoxelCoord([
            last[0].min(dim[0] - 1),
            last[1].min(dim[1] - 1),
            last[2].min(dim[2] - 1),
        ]);
        let full = block_to_nonblock(blocks, bdims, bs);
        let vdims = [bdims[0] * bs[0], bdims[1] * bs[1], bdims[2] * bs[2]];
        let data = extract_box(
            &full,
            vdims,
            [0; 3],
            [max[0] - min[0] + 1, max[1] - min[1] + 1, max[2] - min[2] + 1],
        );
        self.write_region(&data, min, max)
    }

    /// Write a whole native volume as one region
    pub fn write_volume(&mut self, data: &[f32]) -> Result<()> {
        let dim = self.layout().dim(self.layout().num_transforms());
        self.write_region(data, VoxelCoord::default(), VoxelCoord([dim[0] - 1, dim[1] - 1, dim[2] - 1]))
    }

    /// Propagate block statistics over the written blocks and flush the files
    pub fn close_variable(&mut self) -> Result<()> {
        self.wbio.require_writing()?;
        let mut written = std::mem::take(&mut self.written);
        self.wbio.propagate_min_max(Some(&mut written));
        if let Some((lo, hi)) = self.valid {
            self.wbio.set_valid_region(lo, hi);
        }
        self.wbio.close_variable()
    }
}

/// Caller data of one region write
struct Region<'a> {
    data: &'a [f32],
    rdims: [usize; 3],
    min: VoxelCoord,
    max: VoxelCoord,
    bmin: BlockCoord,
    bmax: BlockCoord,
}

impl Region<'_> {
    /// Finest block `b`, every voxel replaced by its nearest region voxel
    fn pad_block(&self, b: BlockCoord, bs: [usize; 3]) -> Vec<f32> {
        let origin = b.first_voxel(bs);
        let mut block = Vec::with_capacity(bs.iter().product());
        for z in 0..bs[2] {
            let rz = (origin[2] + z).clamp(self.min[2], self.max[2]) - self.min[2];
            for y in 0..bs[1] {
                let ry = (origin[1] + y).clamp(self.min[1], self.max[1]) - self.min[1];
                let row = (rz * self.rdims[1] + ry) * self.rdims[0];
                for x in 0..bs[0] {
                    let rx = (origin[0] + x).clamp(self.min[0], self.max[0]) - self.min[0];
                    block.push(self.data[row + rx]);
                }
            }
        }
        block
    }
}

/// Reads arbitrary axis-aligned regions at a chosen refinement level
pub struct RegionReader {
    wbio: WaveletBlockIO,
    wb: Option<WaveletBlock>,
    reflevel: usize,
}

impl RegionReader {
    pub fn new(io: Arc<dyn IOManager>, metadata: VdcMetadata) -> Result<Self> {
        metadata.validate()?;
        Ok(Self {
            wbio: WaveletBlockIO::new(io, metadata),
            wb: None,
            reflevel: 0,
        })
    }

    pub fn layout(&self) -> &VolumeLayout {
        self.wbio.layout()
    }

    pub fn variable_exists(&self, timestep: usize, varname: &str, reflevel: usize) -> bool {
        self.wbio.variable_exists(timestep, varname, reflevel)
    }

    pub fn open_variable_read(&mut self, timestep: usize, varname: &str, reflevel: usize) -> Result<()> {
        self.wbio.open_variable_read(timestep, varname, reflevel)?;
        self.wb = make_transform(&mut self.wbio, reflevel > 0)?;
        self.reflevel = reflevel;
        Ok(())
    }

    pub fn data_range(&self) -> ValueRange {
        self.wbio.data_range()
    }

    /// Valid voxel region at `level`
    pub fn valid_region(&self, level: usize) -> (VoxelCoord, VoxelCoord) {
        self.wbio.valid_region(level)
    }

    /// Stored min/max of a block at `level`
    pub fn block_min_max(&self, level: usize, b: BlockCoord) -> Result<ValueRange> {
        self.wbio.block_min_max(level, b)
    }

    /// Read blocks `[bmin, bmax]` of the open level, block-major in
    /// (z, y, x) block order
    pub fn block_read_region(&mut self, bmin: BlockCoord, bmax: BlockCoord) -> Result<Vec<f32>> {
        self.wbio.require_reading()?;
        let layout = self.layout().clone();
        let level = self.reflevel;
        if !layout.is_valid_region_blk(level, bmin, bmax) {
            return Err(VdcError::InvalidRegion(format!(
                "block region {:?}..{:?} outside {:?} at level {}",
                bmin.0,
                bmax.0,
                layout.block_dims(level),
                level
            )));
        }
        let bdims = [bmax[0] - bmin[0] + 1, bmax[1] - bmin[1] + 1, bmax[2] - bmin[2] + 1];
        let blen = layout.block_len();
        let mut out = vec![0.0; bdims.iter().product::<usize>() * blen];

        let (root_lo, root_hi) = root_blocks(&layout, bmin, bmax, level);
        for root in iter_blocks(root_lo, root_hi) {
            let lambda = self.wbio.read_lambda_block(root)?;
            self.descend(&layout, 0, root, lambda, bmin, bmax, bdims, &mut out)?;
        }
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    fn descend(
        &mut self,
        layout: &VolumeLayout,
        level: usize,
        b: BlockCoord,
        lambda: Vec<f32>,
        bmin: BlockCoord,
        bmax: BlockCoord,
        bdims: [usize; 3],
        out: &mut [f32],
    ) -> Result<()> {
        if level == self.reflevel {
            if b.inside(bmin, bmax) {
                let blen = layout.block_len();
                let idx = ((b[2] - bmin[2]) * bdims[1] + (b[1] - bmin[1])) * bdims[0] + (b[0] - bmin[0]);
                out[idx * blen..(idx + 1) * blen].copy_from_slice(&lambda);
            }
            return Ok(());
        }

        let gammas = self.wbio.read_gammas(level + 1, b)?;
        let mut coeffs = Vec::with_capacity(gammas.len() + 1);
        coeffs.push(lambda);
        coeffs.extend(gammas);
        let wb = self
            .wb
            .as_ref()
            .ok_or_else(|| VdcError::State("no transform configured".to_string()))?;
        let children = wb.inverse(&coeffs)?;

        let valid = overlap_mask(layout, b, level, self.reflevel, bmin, bmax);
        let fine_bd = layout.block_dims(level + 1);
        for (c, child) in children.into_iter().enumerate() {
            let cb = child_block(b, c);
            if child_present(c, &valid) && cb.within(fine_bd) {
                self.descend(layout, level + 1, cb, child, bmin, bmax, bdims, out)?;
            }
        }
        Ok(())
    }

    /// Read voxels `[min, max]` of the open level as a row-major array
    pub fn read_region(&mut self, min: VoxelCoord, max: VoxelCoord) -> Result<Vec<f32>> {
        let layout = self.layout().clone();
        layout.check_region(self.reflevel, min, max)?;
        let bs = layout.block_size();
        let bmin = layout.map_vox_to_blk(min);
        let bmax = layout.map_vox_to_blk(max);
        let blocks = self.block_read_region(bmin, bmax)?;

        let bdims = [bmax[0] - bmin[0] + 1, bmax[1] - bmin[1] + 1, bmax[2] - bmin[2] + 1];
        let full = block_to_nonblock(&blocks, bdims, bs);
        let origin = [
            min[0] - bmin[0] * bs[0],
            min[1] - bmin[1] * bs[1],
            min[2] - bmin[2] * bs[2],
        ];
        let vdims = [bdims[0] * bs[0], bdims[1] * bs[1], bdims[2] * bs[2]];
        Ok(extract_box(
            &full,
            vdims,
            origin,
            [max[0] - min[0] + 1, max[1] - min[1] + 1, max[2] - min[2] + 1],
        ))
    }

    pub fn close_variable(&mut self) -> Result<()> {
        self.wbio.close_variable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::FileSystemIOManager;
    use crate::types::VarType;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (Arc<dyn IOManager>, VdcMetadata) {
        let metadata = VdcMetadata::new([16, 16, 16], [4, 4, 4], 2).with_variable("v", VarType::Var3D);
        let io: Arc<dyn IOManager> = Arc::new(FileSystemIOManager::new(dir.path()));
        (io, metadata)
    }

    #[test]
    fn test_overlap_mask() {
        let layout = VolumeLayout::from_dims(VarType::Var3D, [16, 16, 16], [4, 4, 4], 2);
        // level 0 block 0 covers finest blocks 0..4; region covers finest block 2 only
        let mask = overlap_mask(
            &layout,
            BlockCoord::new(0, 0, 0),
            0,
            2,
            BlockCoord::new(2, 0, 0),
            BlockCoord::new(2, 3, 1),
        );
        assert_eq!(mask[0], [false, true]);
        assert_eq!(mask[1], [true, true]);
        assert_eq!(mask[2], [true, false]);
    }

    #[test]
    fn test_region_round_trip_at_full_resolution() {
        let dir = TempDir::new().unwrap();
        let (io, metadata) = setup(&dir);
        let min = VoxelCoord::new(3, 0, 5);
        let max = VoxelCoord::new(12, 7, 9);
        let data: Vec<f32> = (0..10 * 8 * 5).map(|v| (v % 17) as f32).collect();

        let mut w = RegionWriter::new(io.clone(), metadata.clone()).unwrap();
        w.open_variable_write(0, "v", None).unwrap();
        w.write_region(&data, min, max).unwrap();
        w.close_variable().unwrap();

        let mut r = RegionReader::new(io, metadata).unwrap();
        r.open_variable_read(0, "v", 2).unwrap();
        let back = r.read_region(min, max).unwrap();
        for (a, b) in data.iter().zip(&back) {
            assert!((a - b).abs() < 1e-4);
        }
        assert_eq!(r.valid_region(2), (min, max));
        assert_eq!(r.valid_region(0), (VoxelCoord::new(0, 0, 1), VoxelCoord::new(3, 1, 2)));
        assert_eq!(r.data_range(), ValueRange::new(0.0, 16.0));
    }

    #[test]
    fn test_invalid_region_rejected() {
        let dir = TempDir::new().unwrap();
        let (io, metadata) = setup(&dir);
        let mut w = RegionWriter::new(io, metadata).unwrap();
        w.open_variable_write(0, "v", None).unwrap();
        let err = w.write_region(&[0.0], VoxelCoord::new(0, 0, 0), VoxelCoord::new(16, 0, 0));
        assert!(matches!(err, Err(VdcError::InvalidRegion(_))));
        let err = w.write_region(&[0.0], VoxelCoord::new(0, 0, 0), VoxelCoord::new(1, 0, 0));
        assert!(matches!(err, Err(VdcError::InvalidDimensions(_))));
    }
}

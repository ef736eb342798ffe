//! Sequential slab reader, the mirror of [`SlabWriter`](crate::writer::SlabWriter)

use crate::block_io::WaveletBlockIO;
use crate::coords::{child_offset, BlockCoord};
use crate::error::{Result, VdcError};
use crate::io::IOManager;
use crate::layout::VolumeLayout;
use crate::metadata::VdcMetadata;
use crate::types::ValueRange;
use crate::utils::ceil_div;
use crate::wavelet::{unbrick, WaveletBlock};
use crate::writer::{child_block, row_coords, row_index};
use std::sync::Arc;

/// Reconstructed row pair `(pr, left, right)` of one level
type RowPair = (usize, Vec<Vec<f32>>, Vec<Vec<f32>>);

/// Reads a variable two block rows at a time at a chosen refinement level
pub struct SlabReader {
    wbio: WaveletBlockIO,
    wb: Option<WaveletBlock>,
    reflevel: usize,
    slab_count: usize,
    rows: Vec<Option<RowPair>>,
    slice_buf: Vec<f32>,
    slice_count: usize,
}

impl SlabReader {
    pub fn new(io: Arc<dyn IOManager>, metadata: VdcMetadata) -> Result<Self> {
        metadata.validate()?;
        Ok(Self {
            wbio: WaveletBlockIO::new(io, metadata),
            wb: None,
            reflevel: 0,
            slab_count: 0,
            rows: Vec::new(),
            slice_buf: Vec::new(),
            slice_count: 0,
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
        let layout = self.wbio.layout().clone();
        let metadata = self.wbio.metadata();
        self.wb = if reflevel > 0 {
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
        self.reflevel = reflevel;
        self.slab_count = 0;
        self.rows = vec![None; reflevel + 1];
        self.slice_count = 0;
        self.slice_buf = vec![0.0; self.slab_dims().iter().product()];
        Ok(())
    }

    fn outer_axis(&self) -> usize {
        self.layout().ndims() - 1
    }

    /// Voxel dimensions of one `read_slabs` result at the open level
    pub fn slab_dims(&self) -> [usize; 3] {
        let bd = self.layout().block_dims(self.reflevel);
        let bs = self.layout().block_size();
        let o = self.outer_axis();
        let mut d = [bd[0] * bs[0], bd[1] * bs[1], bd[2] * bs[2]];
        d[o] = 2 * bs[o];
        d
    }

    pub fn num_slab_pairs(&self) -> usize {
        ceil_div(self.layout().block_dims(self.reflevel)[self.outer_axis()], 2)
    }

    pub fn data_range(&self) -> ValueRange {
        self.wbio.data_range()
    }

    /// Row `r` of lambda blocks at `level`
    fn row(&mut self, level: usize, r: usize) -> Result<Vec<Vec<f32>>> {
        let layout = self.layout().clone();
        let o = self.outer_axis();
        let bd = layout.block_dims(level);

        if level == 0 {
            let coords = row_coords(bd, o, r.min(bd[o] - 1));
            if r >= bd[o] {
                return Ok(vec![vec![0.0; layout.block_len()]; coords.len()]);
            }
            let mut row = Vec::with_capacity(coords.len());
            for b in coords {
                row.push(self.wbio.read_lambda_block(b)?);
            }
            return Ok(row);
        }

        let pr = r / 2;
        let cached = matches!(&self.rows[level], Some((p, _, _)) if *p == pr);
        if !cached {
            let parents = self.row(level - 1, pr)?;
            let row_len = row_coords(bd, o, 0).len();
            let mut left = vec![Vec::new(); row_len];
            let mut right = vec![Vec::new(); row_len];
            let parent_coords = row_coords(layout.block_dims(level - 1), o, pr);
            for (pb, lambda) in parent_coords.into_iter().zip(parents) {
                let children = self.reconstruct(level, pb, lambda)?;
                for (c, child) in children.into_iter().enumerate() {
                    let cb = child_block(pb, c);
                    if (0..o).any(|a| cb[a] >= bd[a]) {
                        continue;
                    }
                    let idx = row_index(cb, bd, o);
                    if child_offset(c)[o] == 0 {
                        left[idx] = child;
                    } else {
                        right[idx] = child;
                    }
                }
            }
            self.rows[level] = Some((pr, left, right));
        }

        match &self.rows[level] {
            Some((_, left, right)) => Ok(if r % 2 == 0 { left.clone() } else { right.clone() }),
            None => Err(VdcError::State("row cache empty".to_string())),
        }
    }

    /// Inverse transform the lambda of `parent` with its stored gammas
    fn reconstruct(&mut self, level: usize, parent: BlockCoord, lambda: Vec<f32>) -> Result<Vec<Vec<f32>>> {
        let gammas = self.wbio.read_gammas(level, parent)?;
        let mut coeffs = Vec::with_capacity(gammas.len() + 1);
        coeffs.push(lambda);
        coeffs.extend(gammas);
        let wb = self
            .wb
            .as_ref()
            .ok_or_else(|| VdcError::State("no transform configured".to_string()))?;
        wb.inverse(&coeffs)
    }

    /// Read the next two block rows.
    ///
    /// With `unblock` the result is a row-major voxel array of `slab_dims()`,
    /// otherwise the blocks of both rows in block order. Returns `false` once
    /// every row has been read.
    pub fn read_slabs(&mut self, buf: &mut [f32], unblock: bool) -> Result<bool> {
        self.wbio.require_reading()?;
        if self.slab_count >= self.num_slab_pairs() {
            return Ok(false);
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
        let o = self.outer_axis();
        let bs = layout.block_size();
        let bd = layout.block_dims(self.reflevel);
        let blen = layout.block_len();
        let p = self.slab_count;

        for side in 0..2 {
            let r = 2 * p + side;
            let row = self.row(self.reflevel, r)?;
            let coords = row_coords(bd, o, r);
            for (i, (b, block)) in coords.iter().zip(&row).enumerate() {
                if unblock {
                    let mut origin = [
                        (b[0] * bs[0]) as isize,
                        (b[1] * bs[1]) as isize,
                        (b[2] * bs[2]) as isize,
                    ];
                    origin[o] = (side * bs[o]) as isize;
                    unbrick(block, bs, buf, sd, origin);
                } else {
                    let start = (side * row.len() + i) * blen;
                    buf[start..start + blen].copy_from_slice(block);
                }
            }
        }

        self.slab_count += 1;
        Ok(true)
    }

    /// Read the next plane of voxels along the outer axis at the open level.
    /// Returns `false` once every plane has been read.
    pub fn read_slice(&mut self, slice: &mut [f32]) -> Result<bool> {
        self.wbio.require_reading()?;
        let layout = self.layout().clone();
        let o = self.outer_axis();
        let dim = layout.dim(self.reflevel);
        let plane_len: usize = dim[..o].iter().product();
        if slice.len() != plane_len {
            return Err(VdcError::InvalidDimensions(format!(
                "slice has {} samples, expected {}",
                slice.len(),
                plane_len
            )));
        }
        if self.slice_count >= dim[o] {
            return Ok(false);
        }

        let per_pair = 2 * layout.block_size()[o];
        let k = self.slice_count % per_pair;
        if k == 0 {
            let mut buf = std::mem::take(&mut self.slice_buf);
            let result = self.read_slabs(&mut buf, true);
            self.slice_buf = buf;
            result?;
        }

        let sd = self.slab_dims();
        let rows = if o == 2 { dim[1] } else { 1 };
        for y in 0..rows {
            let src = if o == 2 { (k * sd[1] + y) * sd[0] } else { k * sd[0] };
            slice[y * dim[0]..(y + 1) * dim[0]].copy_from_slice(&self.slice_buf[src..src + dim[0]]);
        }
        self.slice_count += 1;
        Ok(true)
    }

    /// Read the whole variable at the open level as a row-major array
    pub fn read_volume(&mut self) -> Result<Vec<f32>> {
        let layout = self.layout().clone();
        let o = self.outer_axis();
        let dim = layout.dim(self.reflevel);
        let plane_len: usize = dim[..o].iter().product();
        let mut out = Vec::with_capacity(dim.iter().product());
        let mut plane = vec![0.0; plane_len];
        while self.read_slice(&mut plane)? {
            out.extend_from_slice(&plane);
        }
        Ok(out)
    }

    pub fn close_variable(&mut self) -> Result<()> {
        self.rows.clear();
        self.wbio.close_variable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::FileSystemIOManager;
    use crate::types::VarType;
    use crate::writer::SlabWriter;
    use tempfile::TempDir;

    #[test]
    fn test_reader_requires_existing_level() {
        let dir = TempDir::new().unwrap();
        let metadata = VdcMetadata::new([8, 8, 8], [4, 4, 4], 1).with_variable("v", VarType::Var3D);
        let io: Arc<dyn IOManager> = Arc::new(FileSystemIOManager::new(dir.path()));

        let mut w = SlabWriter::new(io.clone(), metadata.clone()).unwrap();
        w.open_variable_write(0, "v", Some(0)).unwrap();
        w.write_volume(&vec![3.0; 512]).unwrap();
        w.close_variable().unwrap();

        let mut r = SlabReader::new(io, metadata).unwrap();
        assert!(r.variable_exists(0, "v", 0));
        assert!(!r.variable_exists(0, "v", 1));
        assert!(matches!(r.open_variable_read(0, "v", 1), Err(VdcError::NotFound(_))));

        r.open_variable_read(0, "v", 0).unwrap();
        let coarse = r.read_volume().unwrap();
        assert_eq!(coarse, vec![3.0; 64]);
        assert_eq!(r.data_range(), ValueRange::new(3.0, 3.0));
        r.close_variable().unwrap();
    }

    #[test]
    fn test_blocked_output_order() {
        let dir = TempDir::new().unwrap();
        let metadata = VdcMetadata::new([4, 2, 2], [2, 2, 2], 0).with_variable("v", VarType::Var3D);
        let io: Arc<dyn IOManager> = Arc::new(FileSystemIOManager::new(dir.path()));

        let data: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let mut w = SlabWriter::new(io.clone(), metadata.clone()).unwrap();
        w.open_variable_write(0, "v", None).unwrap();
        w.write_volume(&data).unwrap();
        w.close_variable().unwrap();

        let mut r = SlabReader::new(io, metadata).unwrap();
        r.open_variable_read(0, "v", 0).unwrap();
        let mut buf = vec![0.0; 4 * 2 * 4];
        assert!(r.read_slabs(&mut buf, false).unwrap());
        // first block holds x in 0..2
        assert_eq!(&buf[..8], &[0.0, 1.0, 4.0, 5.0, 8.0, 9.0, 12.0, 13.0]);
        assert!(!r.read_slabs(&mut buf, false).unwrap());
    }
}

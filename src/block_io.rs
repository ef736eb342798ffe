//! Block-granular file layout of one variable at one timestep
//!
//! Each refinement level lives in its own file, `<base>.wb<level>`:
//!
//! ```text
//! [header, HEADER_BYTES, bincode]
//! [mins: f32 x nblocks(level)] [maxs: f32 x nblocks(level)]
//! [blocks]
//! ```
//!
//! Level 0 stores the lambda blocks of the coarsest level in (z, y, x) block
//! order. Level `j > 0` stores the `C - 1` gamma blocks produced from each
//! level `j - 1` block, ordered by that parent's linear index. Sample data is
//! big-endian when `msb_first` is set and little-endian otherwise.

use crate::coords::{BlockCoord, VoxelCoord};
use crate::error::{Result, VdcError};
use crate::io::{BlockStream, IOManager, OpenMode};
use crate::layout::VolumeLayout;
use crate::metadata::VdcMetadata;
use crate::types::{ValueRange, VarType};
use crate::utils::{bytes_to_f32, f32_to_bytes, level_file_path};
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use tracing::debug;

/// Bytes reserved for the header at the start of every level file
pub const HEADER_BYTES: u64 = 256;

/// Magic bytes identifying a level file
pub const FILE_MAGIC: [u8; 4] = *b"VDC\0";

/// Current level file format version
pub const FILE_VERSION: u32 = 1;

/// Fixed header of a level file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockFileHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub level: u32,
    pub num_transforms: u32,
    pub ndims: u32,
    pub block_size: [u32; 3],
    pub dim: [u32; 3],
    pub level_dim: [u32; 3],
    pub block_dim: [u32; 3],
    pub valid_min: [u32; 3],
    pub valid_max: [u32; 3],
    pub n: u32,
    pub ntilde: u32,
    pub msb_first: bool,
    pub data_range: [f32; 2],
    pub num_blocks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IoState {
    Closed,
    Reading,
    Writing,
}

fn to_u32(v: [usize; 3]) -> [u32; 3] {
    [v[0] as u32, v[1] as u32, v[2] as u32]
}

fn to_usize(v: [u32; 3]) -> [usize; 3] {
    [v[0] as usize, v[1] as usize, v[2] as usize]
}

/// Open file set of one variable, with block seek and transfer primitives
pub struct WaveletBlockIO {
    io: Arc<dyn IOManager>,
    metadata: VdcMetadata,
    layout: VolumeLayout,
    state: IoState,
    timestep: usize,
    varname: String,
    /// finest level with an open file
    max_level: usize,
    streams: Vec<Box<dyn BlockStream>>,
    mins: Vec<Vec<f32>>,
    maxs: Vec<Vec<f32>>,
    data_range: ValueRange,
    valid_min: VoxelCoord,
    valid_max: VoxelCoord,
}

impl WaveletBlockIO {
    pub fn new(io: Arc<dyn IOManager>, metadata: VdcMetadata) -> Self {
        let layout = VolumeLayout::new(&metadata, VarType::Var3D, 0);
        Self {
            io,
            metadata,
            layout,
            state: IoState::Closed,
            timestep: 0,
            varname: String::new(),
            max_level: 0,
            streams: Vec::new(),
            mins: Vec::new(),
            maxs: Vec::new(),
            data_range: ValueRange::empty(),
            valid_min: VoxelCoord::default(),
            valid_max: VoxelCoord::default(),
        }
    }

    pub fn metadata(&self) -> &VdcMetadata {
        &self.metadata
    }

    /// Layout of the open variable
    pub fn layout(&self) -> &VolumeLayout {
        &self.layout
    }

    pub fn timestep(&self) -> usize {
        self.timestep
    }

    pub fn varname(&self) -> &str {
        &self.varname
    }

    /// Finest level with an open file
    pub fn max_level(&self) -> usize {
        self.max_level
    }

    pub fn is_open(&self) -> bool {
        self.state != IoState::Closed
    }

    fn resolve_layout(&self, timestep: usize, varname: &str) -> Result<VolumeLayout> {
        let var_type = self
            .metadata
            .var_type(varname)
            .ok_or_else(|| VdcError::NotFound(format!("variable {}", varname)))?;
        Ok(VolumeLayout::new(&self.metadata, var_type, timestep))
    }

    fn level_path(&self, timestep: usize, varname: &str, level: usize) -> String {
        level_file_path(&self.metadata.base_path(timestep, varname), level)
    }

    /// True if the files of levels `0..=level` exist
    pub fn variable_exists(&self, timestep: usize, varname: &str, level: usize) -> bool {
        if self.metadata.var_type(varname).is_none() || level > self.metadata.num_transforms {
            return false;
        }
        (0..=level).all(|l| {
            self.io
                .exists(&self.level_path(timestep, varname, l))
                .unwrap_or(false)
        })
    }

    fn block_bytes(&self) -> u64 {
        self.layout.block_size_bytes() as u64
    }

    /// Blocks stored in the file of `level`
    fn stored_blocks(&self, level: usize) -> usize {
        if level == 0 {
            self.layout.num_blocks(0)
        } else {
            self.layout.num_blocks(level - 1) * (self.layout.num_children() - 1)
        }
    }

    fn blocks_offset(&self, level: usize) -> u64 {
        HEADER_BYTES + 2 * 4 * self.layout.num_blocks(level) as u64
    }

    /// Create (truncating) the files of levels `0..=reflevel`
    pub fn open_variable_write(
        &mut self,
        timestep: usize,
        varname: &str,
        reflevel: Option<usize>,
    ) -> Result<()> {
        if self.is_open() {
            return Err(VdcError::State(format!(
                "variable {} already open",
                self.varname
            )));
        }
        let layout = self.resolve_layout(timestep, varname)?;
        let max_level = reflevel.unwrap_or(layout.num_transforms());
        layout.check_level(max_level)?;
        self.layout = layout;

        let mut streams = Vec::with_capacity(max_level + 1);
        for level in 0..=max_level {
            let path = self.level_path(timestep, varname, level);
            let mut stream = self.io.open_stream(&path, OpenMode::Create)?;
            let len = self.blocks_offset(level) + self.stored_blocks(level) as u64 * self.block_bytes();
            stream.resize(len)?;
            streams.push(stream);
        }

        let n = self.layout.num_transforms();
        self.mins = (0..=n).map(|l| vec![f32::MAX; self.layout.num_blocks(l)]).collect();
        self.maxs = (0..=n).map(|l| vec![-f32::MAX; self.layout.num_blocks(l)]).collect();
        self.streams = streams;
        self.max_level = max_level;
        self.timestep = timestep;
        self.varname = varname.to_string();
        self.data_range = ValueRange::empty();
        self.valid_min = VoxelCoord::default();
        self.valid_max = VoxelCoord::default();
        self.state = IoState::Writing;

        debug!(
            timestep,
            varname,
            max_level,
            "opened variable for writing: {}",
            self.layout.summary()
        );
        Ok(())
    }

    /// Open the files of levels `0..=reflevel` for reading
    pub fn open_variable_read(&mut self, timestep: usize, varname: &str, reflevel: usize) -> Result<()> {
        if self.is_open() {
            return Err(VdcError::State(format!(
                "variable {} already open",
                self.varname
            )));
        }
        let layout = self.resolve_layout(timestep, varname)?;
        layout.check_level(reflevel)?;
        self.layout = layout;

        let mut streams = Vec::with_capacity(reflevel + 1);
        let mut mins = Vec::with_capacity(reflevel + 1);
        let mut maxs = Vec::with_capacity(reflevel + 1);
        let mut header0 = None;
        for level in 0..=reflevel {
            let path = self.level_path(timestep, varname, level);
            if !self.io.exists(&path)? {
                return Err(VdcError::NotFound(format!(
                    "variable {} at timestep {} has no level {}",
                    varname, timestep, level
                )));
            }
            let mut stream = self.io.open_stream(&path, OpenMode::Read)?;
            let header = self.read_header(&mut stream, level)?;

            let nblk = self.layout.num_blocks(level);
            let mut raw = vec![0u8; nblk * 8];
            stream.seek(SeekFrom::Start(HEADER_BYTES))?;
            stream.read_exact(&mut raw)?;
            let values = bytes_to_f32(&raw, header.msb_first)?;
            mins.push(values[..nblk].to_vec());
            maxs.push(values[nblk..].to_vec());

            if level == 0 {
                header0 = Some(header);
            }
            streams.push(stream);
        }

        if let Some(h) = header0 {
            self.data_range = ValueRange::new(h.data_range[0], h.data_range[1]);
            self.valid_min = VoxelCoord(to_usize(h.valid_min));
            self.valid_max = VoxelCoord(to_usize(h.valid_max));
            self.metadata.msb_first = h.msb_first;
        }
        self.streams = streams;
        self.mins = mins;
        self.maxs = maxs;
        self.max_level = reflevel;
        self.timestep = timestep;
        self.varname = varname.to_string();
        self.state = IoState::Reading;

        debug!(timestep, varname, reflevel, "opened variable for reading");
        Ok(())
    }

    fn read_header(&self, stream: &mut Box<dyn BlockStream>, level: usize) -> Result<BlockFileHeader> {
        let mut raw = vec![0u8; HEADER_BYTES as usize];
        stream.seek(SeekFrom::Start(0))?;
        stream.read_exact(&mut raw)?;
        let header: BlockFileHeader = bincode::deserialize(&raw)?;

        if header.magic != FILE_MAGIC {
            return Err(VdcError::InvalidFormat("bad level file magic".to_string()));
        }
        if header.version != FILE_VERSION {
            return Err(VdcError::UnsupportedVersion(header.version));
        }
        if header.level as usize != level
            || to_usize(header.block_dim) != self.layout.block_dims(level)
            || to_usize(header.block_size) != self.layout.block_size()
            || header.num_transforms as usize != self.layout.num_transforms()
        {
            return Err(VdcError::InvalidFormat(format!(
                "level {} file does not match the dataset layout",
                level
            )));
        }
        Ok(header)
    }

    fn header(&self, level: usize) -> BlockFileHeader {
        BlockFileHeader {
            magic: FILE_MAGIC,
            version: FILE_VERSION,
            level: level as u32,
            num_transforms: self.layout.num_transforms() as u32,
            ndims: self.layout.ndims() as u32,
            block_size: to_u32(self.layout.block_size()),
            dim: to_u32(self.layout.dim(self.layout.num_transforms())),
            level_dim: to_u32(self.layout.dim(level)),
            block_dim: to_u32(self.layout.block_dims(level)),
            valid_min: to_u32(self.valid_min.0),
            valid_max: to_u32(self.valid_max.0),
            n: self.metadata.filter_coef as u32,
            ntilde: self.metadata.lifting_coef as u32,
            msb_first: self.metadata.msb_first,
            data_range: [self.data_range.min, self.data_range.max],
            num_blocks: self.stored_blocks(level) as u64,
        }
    }

    /// Flush headers and block statistics and release the files
    pub fn close_variable(&mut self) -> Result<()> {
        if self.state == IoState::Writing {
            for level in 0..=self.max_level {
                let mut raw = bincode::serialize(&self.header(level))?;
                if raw.len() > HEADER_BYTES as usize {
                    return Err(VdcError::Serialization(format!(
                        "header of {} bytes exceeds {}",
                        raw.len(),
                        HEADER_BYTES
                    )));
                }
                raw.resize(HEADER_BYTES as usize, 0);
                raw.extend(f32_to_bytes(&self.mins[level], self.metadata.msb_first));
                raw.extend(f32_to_bytes(&self.maxs[level], self.metadata.msb_first));

                let stream = &mut self.streams[level];
                stream.seek(SeekFrom::Start(0))?;
                stream.write_all(&raw)?;
                stream.flush()?;
            }
            debug!(
                timestep = self.timestep,
                varname = %self.varname,
                "closed variable, range {:?}",
                self.data_range
            );
        }
        self.streams.clear();
        self.state = IoState::Closed;
        Ok(())
    }

    /// Release the files without flushing headers
    pub fn abort(&mut self) {
        self.streams.clear();
        self.state = IoState::Closed;
    }

    /// Error unless a variable is open for writing
    pub fn require_writing(&self) -> Result<()> {
        self.require(IoState::Writing)
    }

    /// Error unless a variable is open for reading
    pub fn require_reading(&self) -> Result<()> {
        self.require(IoState::Reading)
    }

    fn require(&self, state: IoState) -> Result<()> {
        if self.state != state {
            return Err(VdcError::State(format!(
                "operation requires {:?} state, variable is {:?}",
                state, self.state
            )));
        }
        Ok(())
    }

    fn stream(&mut self, level: usize) -> Result<&mut Box<dyn BlockStream>> {
        let max_level = self.max_level;
        self.streams.get_mut(level).ok_or_else(|| {
            VdcError::NotFound(format!("level {} not open (max {})", level, max_level))
        })
    }

    /// Position the level 0 stream at lambda block `b`
    pub fn seek_lambda_blocks(&mut self, b: BlockCoord) -> Result<()> {
        let bd = self.layout.block_dims(0);
        if !b.within(bd) {
            return Err(VdcError::InvalidRegion(format!(
                "lambda block {:?} outside {:?}",
                b.0, bd
            )));
        }
        let offset = self.blocks_offset(0) + self.layout.block_index(0, b) as u64 * self.block_bytes();
        self.stream(0)?.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    /// Position the stream of `level` at the gamma blocks produced from
    /// `parent`, a block of `level - 1`
    pub fn seek_gamma_blocks(&mut self, level: usize, parent: BlockCoord) -> Result<()> {
        if level == 0 || level > self.layout.num_transforms() {
            return Err(VdcError::InvalidRegion(format!(
                "level {} has no gamma blocks",
                level
            )));
        }
        let bd = self.layout.block_dims(level - 1);
        if !parent.within(bd) {
            return Err(VdcError::InvalidRegion(format!(
                "parent block {:?} outside {:?}",
                parent.0, bd
            )));
        }
        let per_parent = (self.layout.num_children() - 1) as u64 * self.block_bytes();
        let offset = self.blocks_offset(level) + self.layout.block_index(level - 1, parent) as u64 * per_parent;
        self.stream(level)?.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    fn read_blocks(&mut self, level: usize, nblocks: usize) -> Result<Vec<f32>> {
        let mut raw = vec![0u8; nblocks * self.layout.block_size_bytes()];
        self.stream(level)?.read_exact(&mut raw)?;
        bytes_to_f32(&raw, self.metadata.msb_first)
    }

    fn write_blocks(&mut self, level: usize, data: &[f32]) -> Result<()> {
        if data.len() % self.layout.block_len() != 0 {
            return Err(VdcError::InvalidDimensions(format!(
                "{} samples is not a whole number of blocks",
                data.len()
            )));
        }
        let raw = f32_to_bytes(data, self.metadata.msb_first);
        self.stream(level)?.write_all(&raw)?;
        Ok(())
    }

    /// Read `nblocks` consecutive lambda blocks at the current position
    pub fn read_lambda_blocks(&mut self, nblocks: usize) -> Result<Vec<f32>> {
        self.require(IoState::Reading)?;
        self.read_blocks(0, nblocks)
    }

    /// Write consecutive lambda blocks at the current position
    pub fn write_lambda_blocks(&mut self, data: &[f32]) -> Result<()> {
        self.require(IoState::Writing)?;
        self.write_blocks(0, data)
    }

    /// Read `nblocks` consecutive gamma blocks of `level` at the current position
    pub fn read_gamma_blocks(&mut self, level: usize, nblocks: usize) -> Result<Vec<f32>> {
        self.require(IoState::Reading)?;
        self.read_blocks(level, nblocks)
    }

    /// Write consecutive gamma blocks of `level` at the current position
    pub fn write_gamma_blocks(&mut self, level: usize, data: &[f32]) -> Result<()> {
        self.require(IoState::Writing)?;
        self.write_blocks(level, data)
    }

    /// Read one lambda block of level 0
    pub fn read_lambda_block(&mut self, b: BlockCoord) -> Result<Vec<f32>> {
        self.seek_lambda_blocks(b)?;
        self.read_lambda_blocks(1)
    }

    pub fn write_lambda_block(&mut self, b: BlockCoord, block: &[f32]) -> Result<()> {
        self.seek_lambda_blocks(b)?;
        self.write_lambda_blocks(block)
    }

    /// Read the `C - 1` gamma blocks of `level` derived from `parent`
    pub fn read_gammas(&mut self, level: usize, parent: BlockCoord) -> Result<Vec<Vec<f32>>> {
        self.seek_gamma_blocks(level, parent)?;
        let blen = self.layout.block_len();
        let data = self.read_gamma_blocks(level, self.layout.num_children() - 1)?;
        Ok(data.chunks(blen).map(|c| c.to_vec()).collect())
    }

    /// Write the gamma blocks of `level` derived from `parent`
    pub fn write_gammas(&mut self, level: usize, parent: BlockCoord, gammas: &[Vec<f32>]) -> Result<()> {
        self.seek_gamma_blocks(level, parent)?;
        let data: Vec<f32> = gammas.concat();
        if data.len() != (self.layout.num_children() - 1) * self.layout.block_len() {
            return Err(VdcError::InvalidDimensions(format!(
                "expected {} gamma blocks",
                self.layout.num_children() - 1
            )));
        }
        self.write_gamma_blocks(level, &data)
    }

    /// Global range of the variable's valid voxels
    pub fn data_range(&self) -> ValueRange {
        self.data_range
    }

    pub fn include_data_range(&mut self, range: &ValueRange) {
        self.data_range.union(range);
    }

    /// Valid voxel region at `level`
    pub fn valid_region(&self, level: usize) -> (VoxelCoord, VoxelCoord) {
        (
            self.layout.transform_coord(self.valid_min, level),
            self.layout.transform_coord(self.valid_max, level),
        )
    }

    /// Record the native valid region
    pub fn set_valid_region(&mut self, min: VoxelCoord, max: VoxelCoord) {
        self.valid_min = min;
        self.valid_max = max;
    }

    /// Stored min/max of a block at `level`
    pub fn block_min_max(&self, level: usize, b: BlockCoord) -> Result<ValueRange> {
        let idx = self.layout.block_index(level, b);
        match (self.mins.get(level), self.maxs.get(level)) {
            (Some(mins), Some(maxs)) if idx < mins.len() => Ok(ValueRange::new(mins[idx], maxs[idx])),
            _ => Err(VdcError::InvalidRegion(format!(
                "no statistics for block {:?} at level {}",
                b.0, level
            ))),
        }
    }

    pub fn set_block_min_max(&mut self, level: usize, b: BlockCoord, range: ValueRange) {
        let idx = self.layout.block_index(level, b);
        if let (Some(mins), Some(maxs)) = (self.mins.get_mut(level), self.maxs.get_mut(level)) {
            if idx < mins.len() {
                mins[idx] = range.min;
                maxs[idx] = range.max;
            }
        }
    }

    /// Propagate block statistics from the finest level down to level 0.
    ///
    /// A parent's range is the union of its existing children's ranges.
    /// When `written` is given, only children marked there contribute and a
    /// parent becomes marked when any child is.
    pub fn propagate_min_max(&mut self, mut written: Option<&mut Vec<Vec<bool>>>) {
        let layout = self.layout.clone();
        let c = layout.num_children();
        for level in (0..layout.num_transforms()).rev() {
            let bd = layout.block_dims(level);
            let fine_bd = layout.block_dims(level + 1);
            for b in crate::coords::iter_blocks(
                BlockCoord::default(),
                BlockCoord([bd[0] - 1, bd[1] - 1, bd[2] - 1]),
            ) {
                let parent = crate::coords::LevelCoord::new(level, b);
                let mut range = ValueRange::empty();
                let mut any = false;
                for child in 0..c {
                    let cb = parent.child(child).block;
                    if !cb.within(fine_bd) {
                        continue;
                    }
                    let cidx = layout.block_index(level + 1, cb);
                    if let Some(w) = written.as_deref() {
                        if !w[level + 1][cidx] {
                            continue;
                        }
                    }
                    range.include(self.mins[level + 1][cidx]);
                    range.include(self.maxs[level + 1][cidx]);
                    any = true;
                }
                if any {
                    let pidx = layout.block_index(level, b);
                    self.mins[level][pidx] = range.min;
                    self.maxs[level][pidx] = range.max;
                    if let Some(w) = written.as_deref_mut() {
                        w[level][pidx] = true;
                    }
                }
            }
        }
    }
}

/// Rearrange block-major data covering `bdims` blocks into a row-major
/// voxel array of `bdims * bs` voxels
pub fn block_to_nonblock(blocks: &[f32], bdims: [usize; 3], bs: [usize; 3]) -> Vec<f32> {
    let dims = [bdims[0] * bs[0], bdims[1] * bs[1], bdims[2] * bs[2]];
    let blen: usize = bs.iter().product();
    let mut out = vec![0.0; dims[0] * dims[1] * dims[2]];
    for (i, block) in blocks.chunks(blen).enumerate() {
        let bx = i % bdims[0];
        let by = (i / bdims[0]) % bdims[1];
        let bz = i / (bdims[0] * bdims[1]);
        let origin = [
            (bx * bs[0]) as isize,
            (by * bs[1]) as isize,
            (bz * bs[2]) as isize,
        ];
        crate::wavelet::unbrick(block, bs, &mut out, dims, origin);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::FileSystemIOManager;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> WaveletBlockIO {
        let metadata = VdcMetadata::new([8, 8, 8], [2, 2, 2], 1).with_variable("v", VarType::Var3D);
        let io: Arc<dyn IOManager> = Arc::new(FileSystemIOManager::new(dir.path()));
        WaveletBlockIO::new(io, metadata)
    }

    #[test]
    fn test_header_fits() {
        let dir = TempDir::new().unwrap();
        let wbio = setup(&dir);
        let raw = bincode::serialize(&wbio.header(0)).unwrap();
        assert!(raw.len() <= HEADER_BYTES as usize);
    }

    #[test]
    fn test_write_then_read_blocks() {
        let dir = TempDir::new().unwrap();
        let mut wbio = setup(&dir);
        wbio.open_variable_write(0, "v", None).unwrap();
        assert!(wbio.is_open());

        let lambda = vec![1.5; 8];
        wbio.write_lambda_block(BlockCoord::new(1, 0, 1), &lambda).unwrap();
        let gammas: Vec<Vec<f32>> = (0..7).map(|g| vec![g as f32; 8]).collect();
        wbio.write_gammas(1, BlockCoord::new(0, 1, 0), &gammas).unwrap();
        wbio.set_block_min_max(0, BlockCoord::new(1, 0, 1), ValueRange::new(-1.0, 2.0));
        wbio.include_data_range(&ValueRange::new(-1.0, 2.0));
        wbio.close_variable().unwrap();

        assert!(wbio.variable_exists(0, "v", 1));
        assert!(!wbio.variable_exists(1, "v", 0));

        wbio.open_variable_read(0, "v", 1).unwrap();
        assert_eq!(wbio.read_lambda_block(BlockCoord::new(1, 0, 1)).unwrap(), lambda);
        assert_eq!(wbio.read_gammas(1, BlockCoord::new(0, 1, 0)).unwrap(), gammas);
        assert_eq!(
            wbio.block_min_max(0, BlockCoord::new(1, 0, 1)).unwrap(),
            ValueRange::new(-1.0, 2.0)
        );
        assert_eq!(wbio.data_range(), ValueRange::new(-1.0, 2.0));
        wbio.close_variable().unwrap();
    }

    #[test]
    fn test_state_checks() {
        let dir = TempDir::new().unwrap();
        let mut wbio = setup(&dir);
        assert!(matches!(wbio.read_lambda_blocks(1), Err(VdcError::State(_))));
        assert!(matches!(
            wbio.open_variable_write(0, "nope", None),
            Err(VdcError::NotFound(_))
        ));
        assert!(matches!(
            wbio.open_variable_read(0, "v", 0),
            Err(VdcError::NotFound(_))
        ));
        wbio.open_variable_write(0, "v", Some(0)).unwrap();
        assert!(wbio.open_variable_write(0, "v", None).is_err());
        assert!(wbio.seek_gamma_blocks(1, BlockCoord::default()).is_err());
    }

    #[test]
    fn test_msb_first_bytes_on_disk() {
        let dir = TempDir::new().unwrap();
        let metadata = VdcMetadata::new([4, 4, 4], [2, 2, 2], 0)
            .with_variable("v", VarType::Var3D)
            .with_msb_first(true);
        let io: Arc<dyn IOManager> = Arc::new(FileSystemIOManager::new(dir.path()));
        let mut wbio = WaveletBlockIO::new(io.clone(), metadata);
        wbio.open_variable_write(0, "v", None).unwrap();
        wbio.write_lambda_block(BlockCoord::new(0, 0, 0), &[1.0; 8]).unwrap();
        wbio.close_variable().unwrap();

        let raw = io.read("data/v/v.0000.wb0").unwrap();
        let offset = HEADER_BYTES as usize + 2 * 4 * 8;
        assert_eq!(&raw[offset..offset + 4], &[0x3f, 0x80, 0, 0]);
    }

    #[test]
    fn test_block_to_nonblock() {
        // two 2x1x1 blocks side by side along x
        let out = block_to_nonblock(&[1.0, 2.0, 3.0, 4.0], [2, 1, 1], [2, 1, 1]);
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
        // two 1x2x1 blocks side by side along x
        let out = block_to_nonblock(&[1.0, 2.0, 3.0, 4.0], [2, 1, 1], [1, 2, 1]);
        assert_eq!(out, vec![1.0, 3.0, 2.0, 4.0]);
    }
}

//! Data manager: turns stored and derived variables into cached grids.
//!
//! Requests are block-aligned before they reach the cache so overlapping
//! requests share entries. Native variables come from a [`VolumeReader`],
//! decimated from a finer level when the requested level is not stored.
//! Derived variables are computed by registered [`Pipeline`] stages, and
//! every output of a stage is cached in one pass.

use crate::access::{VdcAccess, VolumeReader};
use crate::cache::{BlockPool, DataKind, RegionCache, RegionData, RegionKey, VarInfoCache};
use crate::coords::{BlockCoord, VoxelCoord};
use crate::decimate::{decimate_region, fine_block_range};
use crate::error::{Result, VdcError};
use crate::grid::Grid;
use crate::layout::VolumeLayout;
use crate::metadata::VdcMetadata;
use crate::pipeline::{CalcRegion, Pipeline, PipelineRegistry};
use crate::quantize::{quantize_u16, quantize_u8};
use crate::types::{CoordSystem, GridType, ValueRange, VarType};
use crate::utils::ceil_div;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Variable holding the z coordinate of every sample of a layered grid
pub const ELEVATION_VAR: &str = "ELEVATION";

/// Levels of detail kept per refinement level. Blocks are stored raw, so
/// only one exists.
pub const NUM_LODS: usize = 1;

pub struct DataMgr {
    reader: Box<dyn VolumeReader>,
    metadata: VdcMetadata,
    block_bytes: usize,
    cache: RegionCache,
    var_info: VarInfoCache,
    pipelines: PipelineRegistry,
    quant_ranges: HashMap<(String, DataKind), ValueRange>,
}

impl DataMgr {
    /// Manager over `reader` with a cache budget of `mem_size_mb` megabytes
    pub fn new(reader: Box<dyn VolumeReader>, mem_size_mb: usize) -> Result<Self> {
        let metadata = reader.metadata();
        metadata.validate()?;
        let block_bytes = metadata.block_size.iter().product::<usize>() * std::mem::size_of::<f32>();
        let pool = BlockPool::with_budget(mem_size_mb, block_bytes);
        if pool.capacity() == 0 {
            return Err(VdcError::Configuration(format!(
                "cache of {} MB cannot hold a block of {} bytes",
                mem_size_mb, block_bytes
            )));
        }
        info!(
            mem_size_mb,
            blocks = pool.capacity(),
            "data manager ready"
        );
        Ok(Self {
            reader,
            metadata,
            block_bytes,
            cache: RegionCache::new(pool),
            var_info: VarInfoCache::new(),
            pipelines: PipelineRegistry::new(),
            quant_ranges: HashMap::new(),
        })
    }

    /// Open a dataset directory or `file://` URL
    pub fn open(url: impl Into<String>, mem_size_mb: usize) -> Result<Self> {
        Self::new(Box::new(VdcAccess::open(url)?), mem_size_mb)
    }

    pub fn metadata(&self) -> &VdcMetadata {
        &self.metadata
    }

    pub fn cache(&self) -> &RegionCache {
        &self.cache
    }

    pub fn num_transforms(&self) -> usize {
        self.metadata.num_transforms
    }

    /// Native and derived variable names
    pub fn variable_names(&self) -> Vec<String> {
        let mut names = self.metadata.variable_names();
        names.extend(self.pipelines.derived_variables());
        names
    }

    pub fn is_derived(&self, varname: &str) -> bool {
        self.pipelines.is_derived(varname)
    }

    pub fn var_type(&self, varname: &str) -> Option<VarType> {
        self.metadata
            .var_type(varname)
            .or_else(|| self.pipelines.var_type(varname))
    }

    fn layout(&self, timestep: usize, varname: &str) -> Result<VolumeLayout> {
        let var_type = self
            .var_type(varname)
            .ok_or_else(|| VdcError::NotFound(format!("variable {}", varname)))?;
        Ok(VolumeLayout::new(&self.metadata, var_type, timestep))
    }

    fn check_request(&self, timestep: usize, lod: usize) -> Result<()> {
        if timestep >= self.metadata.num_timesteps {
            return Err(VdcError::InvalidRegion(format!(
                "timestep {} of {}",
                timestep, self.metadata.num_timesteps
            )));
        }
        if lod >= NUM_LODS {
            return Err(VdcError::InvalidRegion(format!("level of detail {} not stored", lod)));
        }
        Ok(())
    }

    /// Cache units needed for `bytes` of samples
    fn units(&self, bytes: usize) -> usize {
        ceil_div(bytes, self.block_bytes).max(1)
    }

    /// Validate a voxel request and return it with its enclosing blocks
    fn align(
        &self,
        layout: &VolumeLayout,
        level: usize,
        min: VoxelCoord,
        max: VoxelCoord,
    ) -> Result<(VoxelCoord, VoxelCoord, BlockCoord, BlockCoord)> {
        let (mut min, mut max) = (min, max);
        if layout.var_type().is_2d() {
            min.0[2] = 0;
            max.0[2] = 0;
        }
        layout.check_region(level, min, max)?;
        let bs = layout.block_size();
        Ok((min, max, min.to_block(bs), max.to_block(bs)))
    }

    /// Grid of voxels `[min, max]` of `level`.
    ///
    /// With `lock` the regions backing the grid stay pinned in the cache
    /// until [`DataMgr::unlock_grid`]. On failure no new locks are held.
    #[allow(clippy::too_many_arguments)]
    pub fn get_grid(
        &mut self,
        timestep: usize,
        varname: &str,
        level: usize,
        lod: usize,
        min: VoxelCoord,
        max: VoxelCoord,
        lock: bool,
    ) -> Result<Grid> {
        self.check_request(timestep, lod)?;
        let layout = self.layout(timestep, varname)?;
        let (min, max, bmin, bmax) = self.align(&layout, level, min, max)?;

        let mut acquired = Vec::new();
        let result = self.build_grid(timestep, varname, &layout, level, lod, (min, max), (bmin, bmax), &mut acquired);
        match result {
            Ok(grid) if lock => Ok(grid.with_locks(acquired)),
            Ok(grid) => {
                self.release(&acquired);
                Ok(grid)
            }
            Err(e) => {
                self.release(&acquired);
                Err(e)
            }
        }
    }

    /// Grid of a whole variable at `level`
    pub fn get_variable(
        &mut self,
        timestep: usize,
        varname: &str,
        level: usize,
        lod: usize,
        lock: bool,
    ) -> Result<Grid> {
        let layout = self.layout(timestep, varname)?;
        layout.check_level(level)?;
        let d = layout.dim(level);
        let max = VoxelCoord([d[0] - 1, d[1] - 1, d[2] - 1]);
        self.get_grid(timestep, varname, level, lod, VoxelCoord::default(), max, lock)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_grid(
        &mut self,
        timestep: usize,
        varname: &str,
        layout: &VolumeLayout,
        level: usize,
        lod: usize,
        (min, max): (VoxelCoord, VoxelCoord),
        (bmin, bmax): (BlockCoord, BlockCoord),
        acquired: &mut Vec<RegionKey>,
    ) -> Result<Grid> {
        let blocks = self.get_region(timestep, varname, level, lod, bmin, bmax, true, acquired)?;

        let lo = layout.map_vox_to_user(level, min);
        let hi = layout.map_vox_to_user(level, max);
        let extents = [lo[0], lo[1], lo[2], hi[0], hi[1], hi[2]];
        let grid = Grid::new(layout.block_size(), min.0, max.0, extents, self.periodic(layout, level, min, max), blocks)?
            .with_missing_value(self.metadata.missing_value);

        let var_type = layout.var_type();
        let grid = match self.metadata.grid_type {
            GridType::Layered if var_type == VarType::Var3D => {
                let elevation = self.get_region(timestep, ELEVATION_VAR, level, lod, bmin, bmax, true, acquired)?;
                grid.with_elevation(elevation)?
            }
            GridType::Stretched => match self.stretched_coords(layout, level, min, max)? {
                Some(coords) => grid.with_stretched_coords(coords)?,
                None => grid,
            },
            GridType::Spherical => grid.with_spherical(),
            _ if self.metadata.coord_system == CoordSystem::Spherical => grid.with_spherical(),
            _ => grid,
        };
        Ok(grid)
    }

    /// An axis wraps only if the dataset declares it periodic and the
    /// request spans the whole axis
    fn periodic(&self, layout: &VolumeLayout, level: usize, min: VoxelCoord, max: VoxelCoord) -> [bool; 3] {
        let axes = layout.var_type().axes();
        let dim = layout.dim(level);
        let mut periodic = [false; 3];
        for i in 0..layout.ndims() {
            periodic[i] = self.metadata.periodic[axes[i]] && min[i] == 0 && max[i] == dim[i] - 1;
        }
        periodic
    }

    /// Stretched coordinates of voxels `[min, max]` of `level`, each coarse
    /// sample at the mean of the pair it replaces
    fn stretched_coords(
        &self,
        layout: &VolumeLayout,
        level: usize,
        min: VoxelCoord,
        max: VoxelCoord,
    ) -> Result<Option<[Vec<f64>; 3]>> {
        let Some(native) = &self.metadata.stretched_coords else {
            return Ok(None);
        };
        let axes = layout.var_type().axes();
        let halvings = layout.num_transforms() - level;
        let mut out: [Vec<f64>; 3] = Default::default();
        for i in 0..3 {
            if i >= layout.ndims() {
                out[i] = vec![layout.extents()[i]; max[i] - min[i] + 1];
                continue;
            }
            let c = &native[axes[i]];
            if c.len() != self.metadata.dimension[axes[i]] {
                return Err(VdcError::Metadata(format!(
                    "axis {} has {} stretched coordinates for {} samples",
                    axes[i],
                    c.len(),
                    self.metadata.dimension[axes[i]]
                )));
            }
            let mut coarse = c.clone();
            for _ in 0..halvings {
                coarse = coarse
                    .chunks(2)
                    .map(|p| p.iter().sum::<f64>() / p.len() as f64)
                    .collect();
            }
            out[i] = coarse[min[i]..=max[i]].to_vec();
        }
        Ok(Some(out))
    }

    fn release(&mut self, keys: &[RegionKey]) {
        for key in keys {
            if let Err(e) = self.cache.unlock(key) {
                debug!(var = %key.varname, error = %e, "release skipped");
            }
        }
    }

    /// Release the cache pins held by a grid returned with `lock`
    pub fn unlock_grid(&mut self, grid: &mut Grid) -> Result<()> {
        let mut first_err = None;
        for key in grid.take_locks() {
            if let Err(e) = self.cache.unlock(&key) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Block-major samples of blocks `[bmin, bmax]`, from the cache or
    /// loaded into it. A lock taken here is recorded in `acquired`.
    #[allow(clippy::too_many_arguments)]
    fn get_region(
        &mut self,
        timestep: usize,
        varname: &str,
        level: usize,
        lod: usize,
        bmin: BlockCoord,
        bmax: BlockCoord,
        lock: bool,
        acquired: &mut Vec<RegionKey>,
    ) -> Result<Arc<Vec<f32>>> {
        let key = RegionKey::new(timestep, varname, level, lod, bmin, bmax);
        if let Some(data) = self.cache_hit(&key, lock, acquired) {
            return Ok(data);
        }

        if let Some(pipeline) = self.pipelines.producer_of(varname) {
            self.compute_derived(pipeline, timestep, level, lod, bmin, bmax)?;
            return self
                .cache_hit(&key, lock, acquired)
                .ok_or_else(|| VdcError::CacheExhausted(format!("derived region of {} was evicted", varname)));
        }

        let layout = self.layout(timestep, varname)?;
        let data = Arc::new(self.load_native(timestep, varname, &layout, level, bmin, bmax)?);
        let units = self.units(data.len() * std::mem::size_of::<f32>());
        self.cache.insert(key.clone(), RegionData::Float(data.clone()), units, lock)?;
        if lock {
            acquired.push(key);
        }
        Ok(data)
    }

    fn cache_hit(&mut self, key: &RegionKey, lock: bool, acquired: &mut Vec<RegionKey>) -> Option<Arc<Vec<f32>>> {
        let data = self.cache.get(key, lock)?;
        if lock {
            acquired.push(key.clone());
        }
        data.as_float().cloned()
    }

    /// Read blocks of `level`, decimating from the next finer level when
    /// `level` is not stored
    fn load_native(
        &self,
        timestep: usize,
        varname: &str,
        layout: &VolumeLayout,
        level: usize,
        bmin: BlockCoord,
        bmax: BlockCoord,
    ) -> Result<Vec<f32>> {
        if self.reader.variable_exists(timestep, varname, level) {
            let data = self.reader.read_region_blocks(timestep, varname, level, bmin, bmax)?;
            return Ok(self.sanitize(data));
        }
        if level >= layout.num_transforms() {
            return Err(VdcError::NotFound(format!(
                "variable {} at timestep {} has no stored level at or above {}",
                varname, timestep, level
            )));
        }
        let (fmin, fmax) = fine_block_range(layout, level, bmin, bmax);
        let fine = self.load_native(timestep, varname, layout, level + 1, fmin, fmax)?;
        debug!(var = varname, level, "decimating from finer level");
        Ok(decimate_region(layout, level, bmin, bmax, &fine))
    }

    /// Replace non-finite samples that are not the missing value
    fn sanitize(&self, mut data: Vec<f32>) -> Vec<f32> {
        let missing = self.metadata.missing_value.map(f32::to_bits);
        let mut replaced = 0usize;
        for v in data.iter_mut() {
            if !v.is_finite() && Some(v.to_bits()) != missing {
                *v = f32::MAX;
                replaced += 1;
            }
        }
        if replaced > 0 {
            warn!(replaced, "non-finite samples replaced");
        }
        data
    }

    /// Run a pipeline over a block range and cache all of its outputs
    #[allow(clippy::too_many_arguments)]
    fn compute_derived(
        &mut self,
        pipeline: Arc<dyn Pipeline>,
        timestep: usize,
        level: usize,
        lod: usize,
        bmin: BlockCoord,
        bmax: BlockCoord,
    ) -> Result<()> {
        let mut held = Vec::new();
        let result = self.run_pipeline(pipeline.as_ref(), timestep, level, lod, bmin, bmax, &mut held);
        self.release(&held);
        let outputs = result?;

        for ((name, var_type), data) in pipeline.outputs().into_iter().zip(outputs) {
            let (omin, omax) = canonical_blocks(var_type, bmin, bmax);
            let key = RegionKey::new(timestep, name, level, lod, omin, omax);
            let units = self.units(data.len() * std::mem::size_of::<f32>());
            self.cache.insert(key, RegionData::Float(Arc::new(data)), units, false)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn run_pipeline(
        &mut self,
        pipeline: &dyn Pipeline,
        timestep: usize,
        level: usize,
        lod: usize,
        bmin: BlockCoord,
        bmax: BlockCoord,
        held: &mut Vec<RegionKey>,
    ) -> Result<Vec<Vec<f32>>> {
        let mut inputs = Vec::new();
        for input in pipeline.inputs() {
            let var_type = self
                .var_type(&input)
                .ok_or_else(|| VdcError::NotFound(format!("pipeline input {}", input)))?;
            let (imin, imax) = canonical_blocks(var_type, bmin, bmax);
            inputs.push(self.get_region(timestep, &input, level, lod, imin, imax, true, held)?);
        }

        let region = CalcRegion {
            timestep,
            level,
            lod,
            bmin,
            bmax,
            block_size: self.layout(timestep, &pipeline.outputs()[0].0)?.block_size(),
        };
        debug!(pipeline = pipeline.name(), level, "running pipeline");
        let refs: Vec<&[f32]> = inputs.iter().map(|v| v.as_slice()).collect();
        let outputs = pipeline.calculate(&region, &refs)?;

        let expected = pipeline.outputs().len();
        if outputs.len() != expected || outputs.iter().any(|o| o.len() != region.len()) {
            return Err(VdcError::Pipeline(format!(
                "pipeline {} returned {} outputs, expected {} of {} samples",
                pipeline.name(),
                outputs.len(),
                expected,
                region.len()
            )));
        }
        Ok(outputs)
    }

    /// True if `varname` can be produced at `level`
    pub fn variable_exists(&mut self, timestep: usize, varname: &str, level: usize, lod: usize) -> bool {
        if let Some(exists) = self.var_info.exists(timestep, varname, level, lod) {
            return exists;
        }
        let exists = self.compute_exists(timestep, varname, level, lod);
        self.var_info.set_exists(timestep, varname, level, lod, exists);
        exists
    }

    fn compute_exists(&mut self, timestep: usize, varname: &str, level: usize, lod: usize) -> bool {
        if self.check_request(timestep, lod).is_err() || level > self.metadata.num_transforms {
            return false;
        }
        if let Some(pipeline) = self.pipelines.producer_of(varname) {
            return pipeline
                .inputs()
                .iter()
                .all(|input| self.variable_exists(timestep, input, level, lod));
        }
        let Some(var_type) = self.metadata.var_type(varname) else {
            return false;
        };
        let stored = (level..=self.metadata.num_transforms).any(|l| self.reader.variable_exists(timestep, varname, l));
        if !stored {
            return false;
        }
        if self.metadata.grid_type == GridType::Layered && var_type == VarType::Var3D && varname != ELEVATION_VAR {
            return self.variable_exists(timestep, ELEVATION_VAR, level, lod);
        }
        true
    }

    /// Value range of a variable
    pub fn get_data_range(&mut self, timestep: usize, varname: &str) -> Result<ValueRange> {
        if let Some(range) = self.var_info.range(timestep, varname) {
            return Ok(range);
        }
        let range = if self.is_derived(varname) {
            let level = self.num_transforms();
            let grid = self.get_variable(timestep, varname, level, 0, false)?;
            grid.range().unwrap_or_default()
        } else {
            if self.metadata.var_type(varname).is_none() {
                return Err(VdcError::NotFound(format!("variable {}", varname)));
            }
            self.reader.data_range(timestep, varname)?
        };
        self.var_info.set_range(timestep, varname, range);
        Ok(range)
    }

    /// Voxels of `level` holding written data. For a derived variable this
    /// is the intersection of its inputs' regions.
    pub fn get_valid_region(&mut self, timestep: usize, varname: &str, level: usize) -> Result<(VoxelCoord, VoxelCoord)> {
        if let Some(region) = self.var_info.region(timestep, varname, level) {
            return Ok(region);
        }
        let region = match self.pipelines.producer_of(varname) {
            Some(pipeline) => {
                let mut lo = [0usize; 3];
                let mut hi = [usize::MAX; 3];
                for input in pipeline.inputs() {
                    let (imin, imax) = self.get_valid_region(timestep, &input, level)?;
                    let ndims = self.var_type(&input).map_or(3, |t| t.ndims());
                    for i in 0..ndims {
                        lo[i] = lo[i].max(imin[i]);
                        hi[i] = hi[i].min(imax[i]);
                    }
                }
                let layout = self.layout(timestep, varname)?;
                let d = layout.dim(level);
                for i in 0..3 {
                    hi[i] = hi[i].min(d[i] - 1);
                }
                (VoxelCoord(lo), VoxelCoord(hi))
            }
            None => {
                if self.metadata.var_type(varname).is_none() {
                    return Err(VdcError::NotFound(format!("variable {}", varname)));
                }
                self.reader.valid_region(timestep, varname, level)?
            }
        };
        self.var_info.set_region(timestep, varname, level, region);
        Ok(region)
    }

    /// Register a pipeline stage
    pub fn new_pipeline(&mut self, pipeline: Arc<dyn Pipeline>) -> Result<()> {
        let native = self.metadata.variable_names();
        let name = pipeline.name().to_string();
        let replaced = self.pipelines.get(&name);
        self.pipelines.register(pipeline, &native)?;
        if let Some(old) = replaced {
            for (out, _) in old.outputs() {
                self.purge_variable(&out);
            }
        }
        Ok(())
    }

    /// Remove a pipeline stage and every cached output of it. Returns
    /// `false` if no stage has that name.
    pub fn remove_pipeline(&mut self, name: &str) -> bool {
        match self.pipelines.remove(name) {
            Some(pipeline) => {
                for (out, _) in pipeline.outputs() {
                    self.purge_variable(&out);
                }
                true
            }
            None => false,
        }
    }

    pub fn pipeline_names(&self) -> Vec<String> {
        self.pipelines.names()
    }

    /// Drop every cached region and memoized query of a variable
    pub fn purge_variable(&mut self, varname: &str) {
        let n = self.cache.purge(|k| k.varname == varname);
        self.var_info.purge(varname);
        self.quant_ranges.retain(|(v, _), _| v != varname);
        debug!(var = varname, regions = n, "purged variable");
    }

    /// Empty the cache. Registered pipelines are kept.
    pub fn clear(&mut self) {
        self.cache.clear();
        self.var_info.clear();
        self.quant_ranges.clear();
    }

    /// Voxels `[min, max]` quantized to 8 bits over `range`, block-major
    /// over the enclosing blocks
    #[allow(clippy::too_many_arguments)]
    pub fn get_region_u8(
        &mut self,
        timestep: usize,
        varname: &str,
        level: usize,
        lod: usize,
        min: VoxelCoord,
        max: VoxelCoord,
        range: ValueRange,
    ) -> Result<Arc<Vec<u8>>> {
        self.get_quantized(timestep, varname, level, lod, min, max, range, DataKind::UInt8)
    }

    /// Voxels `[min, max]` quantized to 16 bits over `range`, two bytes per
    /// sample, little-endian, block-major over the enclosing blocks
    #[allow(clippy::too_many_arguments)]
    pub fn get_region_u16(
        &mut self,
        timestep: usize,
        varname: &str,
        level: usize,
        lod: usize,
        min: VoxelCoord,
        max: VoxelCoord,
        range: ValueRange,
    ) -> Result<Arc<Vec<u8>>> {
        self.get_quantized(timestep, varname, level, lod, min, max, range, DataKind::UInt16)
    }

    #[allow(clippy::too_many_arguments)]
    fn get_quantized(
        &mut self,
        timestep: usize,
        varname: &str,
        level: usize,
        lod: usize,
        min: VoxelCoord,
        max: VoxelCoord,
        range: ValueRange,
        kind: DataKind,
    ) -> Result<Arc<Vec<u8>>> {
        self.check_request(timestep, lod)?;
        let layout = self.layout(timestep, varname)?;
        let (_, _, bmin, bmax) = self.align(&layout, level, min, max)?;

        let qkey = (varname.to_string(), kind);
        if self.quant_ranges.get(&qkey) != Some(&range) {
            let n = self.cache.purge(|k| k.varname == varname && k.kind == kind);
            if n > 0 {
                debug!(var = varname, regions = n, "quantization range changed");
            }
            self.quant_ranges.insert(qkey, range);
        }

        let key = RegionKey::new(timestep, varname, level, lod, bmin, bmax).with_kind(kind);
        if let Some(hit) = self.cache.get(&key, false).and_then(|d| d.as_bytes().cloned()) {
            return Ok(hit);
        }

        let mut held = Vec::new();
        let floats = self.get_region(timestep, varname, level, lod, bmin, bmax, true, &mut held);
        self.release(&held);
        let floats = floats?;

        let bytes = Arc::new(match kind {
            DataKind::UInt16 => quantize_u16(&floats, &range),
            _ => quantize_u8(&floats, &range),
        });
        let units = self.units(bytes.len());
        self.cache.insert(key, RegionData::Quantized(bytes.clone()), units, false)?;
        Ok(bytes)
    }
}

/// Block range of a variable of `var_type` for a request over `[bmin, bmax]`
fn canonical_blocks(var_type: VarType, bmin: BlockCoord, bmax: BlockCoord) -> (BlockCoord, BlockCoord) {
    let (mut lo, mut hi) = (bmin, bmax);
    if var_type.is_2d() {
        lo.0[2] = 0;
        hi.0[2] = 0;
    }
    (lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{FileSystemIOManager, IOManager};
    use crate::pipeline::tests::ScaleSum;
    use crate::writer::SlabWriter;
    use tempfile::TempDir;

    fn dataset(dir: &TempDir) -> DataMgr {
        let metadata = VdcMetadata::new([8, 8, 8], [4, 4, 4], 1)
            .with_variable("u", VarType::Var3D)
            .with_variable("v", VarType::Var3D);
        let access = VdcAccess::create(dir.path().to_string_lossy().to_string(), metadata.clone()).unwrap();
        let io: Arc<dyn IOManager> = Arc::new(FileSystemIOManager::new(dir.path()));
        for (name, scale) in [("u", 1.0f32), ("v", 2.0)] {
            let data: Vec<f32> = (0..512).map(|i| scale * (i % 8) as f32).collect();
            let mut w = SlabWriter::new(io.clone(), metadata.clone()).unwrap();
            w.open_variable_write(0, name, None).unwrap();
            w.write_volume(&data).unwrap();
            w.close_variable().unwrap();
        }
        DataMgr::new(Box::new(access), 1).unwrap()
    }

    #[test]
    fn test_grid_from_disk() {
        let dir = TempDir::new().unwrap();
        let mut dm = dataset(&dir);
        let grid = dm
            .get_grid(0, "u", 1, 0, VoxelCoord::new(1, 2, 3), VoxelCoord::new(6, 6, 6), false)
            .unwrap();
        assert_eq!(grid.dimensions(), [6, 5, 4]);
        assert!((grid.access_ijk(0, 0, 0).unwrap() - 1.0).abs() < 1e-4);
        assert!((grid.access_ijk(5, 0, 0).unwrap() - 6.0).abs() < 1e-4);
        assert_eq!(dm.cache().len(), 1);
    }

    #[test]
    fn test_locking_and_unlock() {
        let dir = TempDir::new().unwrap();
        let mut dm = dataset(&dir);
        let mut grid = dm.get_variable(0, "u", 0, 0, true).unwrap();
        let key = dm.cache().keys().next().unwrap().clone();
        assert_eq!(dm.cache().lock_count(&key), Some(1));
        dm.unlock_grid(&mut grid).unwrap();
        assert_eq!(dm.cache().lock_count(&key), Some(0));
        // a second unlock finds nothing to release
        dm.unlock_grid(&mut grid).unwrap();
    }

    #[test]
    fn test_derived_outputs_cached_together() {
        let dir = TempDir::new().unwrap();
        let mut dm = dataset(&dir);
        dm.new_pipeline(ScaleSum::new("sum", &["u", "v"], &["s", "s2"], 1.0)).unwrap();
        assert!(dm.variable_exists(0, "s", 1, 0));
        let s = dm.get_variable(0, "s", 1, 0, false).unwrap();
        assert!((s.access_ijk(3, 0, 0).unwrap() - 9.0).abs() < 1e-3);

        let keys: Vec<String> = dm.cache().keys().map(|k| k.varname.clone()).collect();
        assert!(keys.contains(&"s".to_string()));
        assert!(keys.contains(&"s2".to_string()));

        assert!(dm.remove_pipeline("sum"));
        assert!(dm.cache().keys().all(|k| k.varname != "s" && k.varname != "s2"));
        assert!(matches!(dm.get_variable(0, "s", 1, 0, false), Err(VdcError::NotFound(_))));
    }

    #[test]
    fn test_pipeline_output_collides_with_native() {
        let dir = TempDir::new().unwrap();
        let mut dm = dataset(&dir);
        assert!(dm.new_pipeline(ScaleSum::new("p", &["u"], &["v"], 1.0)).is_err());
        assert!(dm.pipeline_names().is_empty());
    }

    #[test]
    fn test_invalid_requests() {
        let dir = TempDir::new().unwrap();
        let mut dm = dataset(&dir);
        let max = VoxelCoord::new(8, 0, 0);
        assert!(matches!(
            dm.get_grid(0, "u", 1, 0, VoxelCoord::default(), max, false),
            Err(VdcError::InvalidRegion(_))
        ));
        assert!(dm.get_variable(1, "u", 1, 0, false).is_err());
        assert!(dm.get_variable(0, "u", 1, 1, false).is_err());
        assert!(matches!(dm.get_variable(0, "nope", 1, 0, false), Err(VdcError::NotFound(_))));
        assert!(dm.cache().is_empty());
    }

    #[test]
    fn test_quantized_range_change() {
        let dir = TempDir::new().unwrap();
        let mut dm = dataset(&dir);
        let (lo, hi) = (VoxelCoord::default(), VoxelCoord::new(7, 7, 7));
        let q = dm.get_region_u8(0, "u", 1, 0, lo, hi, ValueRange::new(0.0, 7.0)).unwrap();
        assert_eq!(q.len(), 512);
        assert_eq!(q[0], 0);
        assert_eq!(q[3], 109);

        let q16 = dm.get_region_u16(0, "u", 1, 0, lo, hi, ValueRange::new(0.0, 7.0)).unwrap();
        assert_eq!(q16.len(), 1024);
        assert_eq!(&q16[6..8], &[0xb6, 0x6d]);

        let q2 = dm.get_region_u8(0, "u", 1, 0, lo, hi, ValueRange::new(0.0, 14.0)).unwrap();
        assert_eq!(q2[3], 55);
        let quantized = dm.cache().keys().filter(|k| k.kind == DataKind::UInt8).count();
        assert_eq!(quantized, 1);
    }
}

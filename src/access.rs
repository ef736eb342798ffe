//! Dataset access - main API for opening datasets and reading/writing variables

use crate::coords::{BlockCoord, VoxelCoord};
use crate::error::{Result, VdcError};
use crate::io::{create_io_manager, IOManager};
use crate::layout::VolumeLayout;
use crate::metadata::VdcMetadata;
use crate::reader::SlabReader;
use crate::region::{RegionReader, RegionWriter};
use crate::types::ValueRange;
use crate::writer::SlabWriter;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

/// Name of the descriptor stored at the dataset root
pub const METADATA_FILE: &str = "metadata.json";

/// Read access to stored variables, as consumed by the data manager
pub trait VolumeReader: Send {
    /// Dataset descriptor
    fn metadata(&self) -> VdcMetadata;

    /// True if `level` of the variable can be read without synthesizing it
    fn variable_exists(&self, timestep: usize, varname: &str, level: usize) -> bool;

    /// Blocks `[bmin, bmax]` of `level`, block-major in (z, y, x) order
    fn read_region_blocks(
        &self,
        timestep: usize,
        varname: &str,
        level: usize,
        bmin: BlockCoord,
        bmax: BlockCoord,
    ) -> Result<Vec<f32>>;

    /// Global value range recorded when the variable was written
    fn data_range(&self, timestep: usize, varname: &str) -> Result<ValueRange>;

    /// Region of `level` holding written data
    fn valid_region(&self, timestep: usize, varname: &str, level: usize) -> Result<(VoxelCoord, VoxelCoord)>;
}

/// Whole-variable write access shared by the slab and region writers
pub trait VolumeWriter {
    fn open_variable_write(&mut self, timestep: usize, varname: &str, reflevel: Option<usize>) -> Result<()>;

    /// Write a complete native volume, row-major in storage axis order
    fn write_volume(&mut self, data: &[f32]) -> Result<()>;

    fn close_variable(&mut self) -> Result<()>;
}

impl VolumeWriter for SlabWriter {
    fn open_variable_write(&mut self, timestep: usize, varname: &str, reflevel: Option<usize>) -> Result<()> {
        SlabWriter::open_variable_write(self, timestep, varname, reflevel)
    }

    fn write_volume(&mut self, data: &[f32]) -> Result<()> {
        SlabWriter::write_volume(self, data)
    }

    fn close_variable(&mut self) -> Result<()> {
        SlabWriter::close_variable(self)
    }
}

impl VolumeWriter for RegionWriter {
    fn open_variable_write(&mut self, timestep: usize, varname: &str, reflevel: Option<usize>) -> Result<()> {
        RegionWriter::open_variable_write(self, timestep, varname, reflevel)
    }

    fn write_volume(&mut self, data: &[f32]) -> Result<()> {
        RegionWriter::write_volume(self, data)
    }

    fn close_variable(&mut self) -> Result<()> {
        RegionWriter::close_variable(self)
    }
}

/// Main interface for accessing a VDC dataset
pub struct VdcAccess {
    /// Dataset descriptor
    metadata: Arc<RwLock<VdcMetadata>>,

    /// I/O manager for storage operations
    io_manager: Arc<dyn IOManager>,
}

impl VdcAccess {
    /// Open an existing dataset
    pub fn open(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        let io_manager: Arc<dyn IOManager> = Arc::from(create_io_manager(&url)?);

        let metadata_bytes = io_manager.read(METADATA_FILE)?;
        let metadata: VdcMetadata =
            serde_json::from_slice(&metadata_bytes).map_err(|e| VdcError::Metadata(e.to_string()))?;
        if !metadata.version.is_compatible(&crate::metadata::VdcVersion::CURRENT) {
            return Err(VdcError::UnsupportedVersion(metadata.version.major as u32));
        }
        metadata.validate()?;
        info!(url = %url, dataset = %metadata.dataset_id, "opened dataset");

        Ok(Self {
            metadata: Arc::new(RwLock::new(metadata)),
            io_manager,
        })
    }

    /// Create a new dataset, writing its descriptor
    pub fn create(url: impl Into<String>, metadata: VdcMetadata) -> Result<Self> {
        let url = url.into();
        metadata.validate()?;
        let io_manager: Arc<dyn IOManager> = Arc::from(create_io_manager(&url)?);

        let metadata_json =
            serde_json::to_vec_pretty(&metadata).map_err(|e| VdcError::Metadata(e.to_string()))?;
        io_manager.write(METADATA_FILE, &metadata_json)?;
        info!(url = %url, dataset = %metadata.dataset_id, "created dataset");

        Ok(Self {
            metadata: Arc::new(RwLock::new(metadata)),
            io_manager,
        })
    }

    /// Get the dataset metadata
    pub fn metadata(&self) -> VdcMetadata {
        self.metadata.read().clone()
    }

    /// Modify the descriptor and persist it
    pub fn update_metadata<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut VdcMetadata),
    {
        let mut metadata = self.metadata.write();
        let mut updated = metadata.clone();
        f(&mut updated);
        updated.validate()?;
        updated.touch();
        let json = serde_json::to_vec_pretty(&updated).map_err(|e| VdcError::Metadata(e.to_string()))?;
        self.io_manager.write(METADATA_FILE, &json)?;
        *metadata = updated;
        Ok(())
    }

    pub fn io_manager(&self) -> Arc<dyn IOManager> {
        Arc::clone(&self.io_manager)
    }

    /// Layout of a declared variable
    pub fn layout(&self, varname: &str, timestep: usize) -> Result<VolumeLayout> {
        let metadata = self.metadata.read();
        let var_type = metadata
            .var_type(varname)
            .ok_or_else(|| VdcError::NotFound(format!("variable {}", varname)))?;
        Ok(VolumeLayout::new(&metadata, var_type, timestep))
    }

    pub fn slab_writer(&self) -> Result<SlabWriter> {
        SlabWriter::new(self.io_manager(), self.metadata())
    }

    pub fn slab_reader(&self) -> Result<SlabReader> {
        SlabReader::new(self.io_manager(), self.metadata())
    }

    pub fn region_writer(&self) -> Result<RegionWriter> {
        RegionWriter::new(self.io_manager(), self.metadata())
    }

    pub fn region_reader(&self) -> Result<RegionReader> {
        RegionReader::new(self.io_manager(), self.metadata())
    }

    /// Read voxels `[min, max]` of `level` as a row-major array
    pub fn read_region(
        &self,
        timestep: usize,
        varname: &str,
        level: usize,
        min: VoxelCoord,
        max: VoxelCoord,
    ) -> Result<Vec<f32>> {
        let mut reader = self.region_reader()?;
        reader.open_variable_read(timestep, varname, level)?;
        let data = reader.read_region(min, max);
        reader.close_variable()?;
        data
    }

    /// Get statistics about one variable
    pub fn get_stats(&self, varname: &str) -> Result<VolumeStats> {
        let layout = self.layout(varname, 0)?;
        let n = layout.num_transforms();
        let dim = layout.dim(n);
        let stored_blocks: usize = (0..=n).map(|l| layout.num_blocks(l)).sum();
        Ok(VolumeStats {
            ndims: layout.ndims(),
            total_voxels: dim.iter().product(),
            total_blocks: stored_blocks,
            num_levels: n + 1,
            uncompressed_size: dim.iter().product::<usize>() * std::mem::size_of::<f32>(),
        })
    }
}

impl VolumeReader for VdcAccess {
    fn metadata(&self) -> VdcMetadata {
        VdcAccess::metadata(self)
    }

    fn variable_exists(&self, timestep: usize, varname: &str, level: usize) -> bool {
        match self.region_reader() {
            Ok(reader) => reader.variable_exists(timestep, varname, level),
            Err(_) => false,
        }
    }

    fn read_region_blocks(
        &self,
        timestep: usize,
        varname: &str,
        level: usize,
        bmin: BlockCoord,
        bmax: BlockCoord,
    ) -> Result<Vec<f32>> {
        let mut reader = self.region_reader()?;
        reader.open_variable_read(timestep, varname, level)?;
        let blocks = reader.block_read_region(bmin, bmax);
        reader.close_variable()?;
        blocks
    }

    fn data_range(&self, timestep: usize, varname: &str) -> Result<ValueRange> {
        let mut reader = self.region_reader()?;
        reader.open_variable_read(timestep, varname, 0)?;
        let range = reader.data_range();
        reader.close_variable()?;
        Ok(range)
    }

    fn valid_region(&self, timestep: usize, varname: &str, level: usize) -> Result<(VoxelCoord, VoxelCoord)> {
        let mut reader = self.region_reader()?;
        reader.open_variable_read(timestep, varname, 0)?;
        let region = reader.valid_region(level);
        reader.close_variable()?;
        Ok(region)
    }
}

/// Variable statistics
#[derive(Debug, Clone)]
pub struct VolumeStats {
    pub ndims: usize,
    pub total_voxels: usize,
    pub total_blocks: usize,
    pub num_levels: usize,
    pub uncompressed_size: usize,
}

impl VolumeStats {
    pub fn summary(&self) -> String {
        format!(
            "{}D Volume: {} voxels, {} blocks over {} levels, {} uncompressed",
            self.ndims,
            self.total_voxels,
            self.total_blocks,
            self.num_levels,
            crate::utils::format_bytes(self.uncompressed_size),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VarType;
    use tempfile::TempDir;

    #[test]
    fn test_create_and_open_dataset() {
        let temp_dir = TempDir::new().unwrap();
        let url = temp_dir.path().to_str().unwrap();

        let metadata = VdcMetadata::new([32, 32, 16], [8, 8, 8], 1).with_variable("temp", VarType::Var3D);
        let created = VdcAccess::create(url, metadata).unwrap();

        let vdc = VdcAccess::open(format!("file://{}", url)).unwrap();
        assert_eq!(vdc.metadata().dataset_id, created.metadata().dataset_id);

        let stats = vdc.get_stats("temp").unwrap();
        assert_eq!(stats.ndims, 3);
        assert_eq!(stats.total_voxels, 32 * 32 * 16);
        assert_eq!(stats.total_blocks, 4 + 32);
        assert!(stats.summary().contains("64.00 KB"));
        assert!(vdc.get_stats("nope").is_err());
    }

    #[test]
    fn test_update_metadata_persists() {
        let temp_dir = TempDir::new().unwrap();
        let url = temp_dir.path().to_str().unwrap();
        let vdc = VdcAccess::create(url, VdcMetadata::new([8, 8, 8], [4, 4, 4], 1)).unwrap();

        vdc.update_metadata(|m| m.add_variable("p", VarType::Var2DXY)).unwrap();
        assert!(vdc
            .update_metadata(|m| m.add_variable("p", VarType::Var3D))
            .is_err());

        let reopened = VdcAccess::open(url).unwrap();
        assert_eq!(reopened.metadata().var_type("p"), Some(VarType::Var2DXY));
    }

    #[test]
    fn test_writer_trait_objects() {
        let temp_dir = TempDir::new().unwrap();
        let url = temp_dir.path().to_str().unwrap();
        let metadata = VdcMetadata::new([8, 8, 8], [4, 4, 4], 1).with_variable("v", VarType::Var3D);
        let vdc = VdcAccess::create(url, metadata).unwrap();

        let mut writers: Vec<Box<dyn VolumeWriter>> =
            vec![Box::new(vdc.slab_writer().unwrap()), Box::new(vdc.region_writer().unwrap())];
        let data: Vec<f32> = (0..512).map(|v| v as f32).collect();
        for (ts, w) in writers.iter_mut().enumerate() {
            w.open_variable_write(ts, "v", None).unwrap();
            w.write_volume(&data).unwrap();
            w.close_variable().unwrap();
        }

        for ts in 0..2 {
            assert!(VolumeReader::variable_exists(&vdc, ts, "v", 1));
            assert_eq!(
                VolumeReader::data_range(&vdc, ts, "v").unwrap(),
                ValueRange::new(0.0, 511.0)
            );
            let blocks = vdc
                .read_region_blocks(ts, "v", 0, BlockCoord::new(0, 0, 0), BlockCoord::new(0, 0, 0))
                .unwrap();
            assert_eq!(blocks.len(), 64);
        }
        assert!(!VolumeReader::variable_exists(&vdc, 2, "v", 0));
    }
}

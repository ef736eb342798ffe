//! VDC - multiresolution wavelet volume storage
//!
//! A pure Rust implementation of a blocked, lifting-scheme wavelet container
//! for large 2D and 3D scalar fields, with a caching data manager on top.
//!
//! # Features
//!
//! - Lifting-scheme biorthogonal wavelets with a Haar fast path
//! - One file per refinement level, per-block min/max statistics
//! - Sequential slab/slice writers and readers
//! - Region writes and reads at any refinement level
//! - Block cache with LRU eviction and lock counting
//! - Derived variables through acyclic pipeline stages
//! - Regular, stretched, layered and spherical grids
//! - Local filesystem backend (implement `IOManager` for other storage)
//!
//! # Example
//!
//! ```rust,ignore
//! use vdc::{DataMgr, VarType, VdcAccess, VdcMetadata, VoxelCoord};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let metadata = VdcMetadata::new([64, 64, 64], [32, 32, 32], 1)
//!     .with_variable("temp", VarType::Var3D);
//! let vdc = VdcAccess::create("file:///data/run1", metadata)?;
//!
//! let mut writer = vdc.slab_writer()?;
//! writer.open_variable_write(0, "temp", None)?;
//! writer.write_volume(&vec![0.0; 64 * 64 * 64])?;
//! writer.close_variable()?;
//!
//! let mut dm = DataMgr::new(Box::new(vdc), 64)?;
//! let grid = dm.get_grid(0, "temp", 0, 0, VoxelCoord::new(0, 0, 0), VoxelCoord::new(15, 15, 15), false)?;
//! let v = grid.value(0.5, 0.5, 0.5);
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod block_io;
pub mod cache;
pub mod coords;
pub mod data_mgr;
pub mod decimate;
pub mod error;
pub mod grid;
pub mod io;
pub mod layout;
pub mod lifting;
pub mod metadata;
pub mod pipeline;
pub mod quantize;
pub mod reader;
pub mod region;
pub mod types;
pub mod utils;
pub mod wavelet;
pub mod writer;

// Re-exports
pub use access::{VdcAccess, VolumeReader, VolumeWriter};
pub use block_io::WaveletBlockIO;
pub use coords::{BlockCoord, VoxelCoord};
pub use data_mgr::DataMgr;
pub use error::{Result, VdcError};
pub use grid::{Grid, Interpolation};
pub use io::{IOManager, StorageBackend};
pub use layout::VolumeLayout;
pub use lifting::Lifting1D;
pub use metadata::VdcMetadata;
pub use pipeline::{CalcRegion, Pipeline};
pub use reader::SlabReader;
pub use region::{RegionReader, RegionWriter};
pub use types::{CoordSystem, GridType, ValueRange, VarType};
pub use wavelet::WaveletBlock;
pub use writer::SlabWriter;

/// Version of the VDC implementation
pub const VDC_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Magic number at the start of every level file
pub const VDC_MAGIC: &[u8; 4] = &block_io::FILE_MAGIC;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VDC_VERSION.is_empty());
        assert_eq!(VDC_MAGIC, b"VDC\0");
    }
}

//! VDC dataset metadata
//!
//! The descriptor every IO class requires at open time. It is persisted as a
//! JSON sidecar (`metadata.json`) at the dataset root.

use crate::error::{Result, VdcError};
use crate::lifting::Lifting1D;
use crate::types::{CoordSystem, GridType, VarType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Deepest supported refinement pyramid
pub const MAX_LEVELS: usize = 16;

/// VDC file format version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdcVersion {
    pub major: u16,
    pub minor: u16,
}

impl VdcVersion {
    pub const CURRENT: Self = Self { major: 2, minor: 0 };

    pub fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub fn is_compatible(&self, other: &Self) -> bool {
        self.major == other.major
    }
}

impl Default for VdcVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// Complete metadata for a VDC dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VdcMetadata {
    /// Format version
    pub version: VdcVersion,

    /// Unique dataset identifier
    pub dataset_id: Uuid,

    /// Native voxel dimension (x, y, z)
    pub dimension: [usize; 3],

    /// Block size in voxels (x, y, z)
    pub block_size: [usize; 3],

    /// Number of wavelet transforms (refinement levels above level 0)
    pub num_transforms: usize,

    /// Number of filter coefficients (`n`)
    pub filter_coef: usize,

    /// Number of lifting coefficients (`ntilde`)
    pub lifting_coef: usize,

    /// Store block data most significant byte first
    pub msb_first: bool,

    /// Number of timesteps
    pub num_timesteps: usize,

    /// User time of each timestep, if known
    pub user_times: Vec<f64>,

    /// Domain extents (xmin, ymin, zmin, xmax, ymax, zmax)
    pub extents: [f64; 6],

    /// Per-timestep extents overriding `extents`
    pub timestep_extents: HashMap<usize, [f64; 6]>,

    pub variables_3d: Vec<String>,
    pub variables_2d_xy: Vec<String>,
    pub variables_2d_xz: Vec<String>,
    pub variables_2d_yz: Vec<String>,

    pub grid_type: GridType,
    pub coord_system: CoordSystem,

    /// Periodic boundary per axis
    pub periodic: [bool; 3],

    /// Sentinel marking missing samples
    pub missing_value: Option<f32>,

    /// Native user coordinates per axis (stretched grids only)
    pub stretched_coords: Option<[Vec<f64>; 3]>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last modification timestamp
    pub modified_at: DateTime<Utc>,

    /// Custom metadata key-value pairs
    pub custom_metadata: HashMap<String, String>,
}

impl VdcMetadata {
    /// Create new metadata with Haar wavelets and a unit-cube domain
    pub fn new(dimension: [usize; 3], block_size: [usize; 3], num_transforms: usize) -> Self {
        let now = Utc::now();
        Self {
            version: VdcVersion::default(),
            dataset_id: Uuid::new_v4(),
            dimension,
            block_size,
            num_transforms,
            filter_coef: 1,
            lifting_coef: 1,
            msb_first: false,
            num_timesteps: 1,
            user_times: Vec::new(),
            extents: [0.0, 0.0, 0.0, 1.0, 1.0, 1.0],
            timestep_extents: HashMap::new(),
            variables_3d: Vec::new(),
            variables_2d_xy: Vec::new(),
            variables_2d_xz: Vec::new(),
            variables_2d_yz: Vec::new(),
            grid_type: GridType::Regular,
            coord_system: CoordSystem::Cartesian,
            periodic: [false; 3],
            missing_value: None,
            stretched_coords: None,
            created_at: now,
            modified_at: now,
            custom_metadata: HashMap::new(),
        }
    }

    /// Set the wavelet (filter and lifting coefficient counts)
    pub fn with_wavelet(mut self, n: usize, ntilde: usize) -> Self {
        self.filter_coef = n;
        self.lifting_coef = ntilde;
        self
    }

    pub fn with_msb_first(mut self, msb_first: bool) -> Self {
        self.msb_first = msb_first;
        self
    }

    pub fn with_num_timesteps(mut self, num_timesteps: usize) -> Self {
        self.num_timesteps = num_timesteps;
        self
    }

    pub fn with_extents(mut self, extents: [f64; 6]) -> Self {
        self.extents = extents;
        self
    }

    pub fn with_grid_type(mut self, grid_type: GridType) -> Self {
        self.grid_type = grid_type;
        self
    }

    pub fn with_coord_system(mut self, coord_system: CoordSystem) -> Self {
        self.coord_system = coord_system;
        self
    }

    pub fn with_periodic(mut self, periodic: [bool; 3]) -> Self {
        self.periodic = periodic;
        self
    }

    pub fn with_missing_value(mut self, missing_value: f32) -> Self {
        self.missing_value = Some(missing_value);
        self
    }

    pub fn with_stretched_coords(mut self, coords: [Vec<f64>; 3]) -> Self {
        self.stretched_coords = Some(coords);
        self
    }

    /// Declare a variable
    pub fn with_variable(mut self, name: impl Into<String>, var_type: VarType) -> Self {
        self.add_variable(name, var_type);
        self
    }

    /// Declare a variable
    pub fn add_variable(&mut self, name: impl Into<String>, var_type: VarType) {
        let name = name.into();
        match var_type {
            VarType::Var3D => self.variables_3d.push(name),
            VarType::Var2DXY => self.variables_2d_xy.push(name),
            VarType::Var2DXZ => self.variables_2d_xz.push(name),
            VarType::Var2DYZ => self.variables_2d_yz.push(name),
        }
    }

    /// Shape class of a declared variable
    pub fn var_type(&self, name: &str) -> Option<VarType> {
        let has = |v: &Vec<String>| v.iter().any(|s| s == name);
        if has(&self.variables_3d) {
            Some(VarType::Var3D)
        } else if has(&self.variables_2d_xy) {
            Some(VarType::Var2DXY)
        } else if has(&self.variables_2d_xz) {
            Some(VarType::Var2DXZ)
        } else if has(&self.variables_2d_yz) {
            Some(VarType::Var2DYZ)
        } else {
            None
        }
    }

    /// All declared variable names
    pub fn variable_names(&self) -> Vec<String> {
        self.variables_3d
            .iter()
            .chain(&self.variables_2d_xy)
            .chain(&self.variables_2d_xz)
            .chain(&self.variables_2d_yz)
            .cloned()
            .collect()
    }

    /// Extents in effect for a timestep
    pub fn extents_at(&self, ts: usize) -> [f64; 6] {
        self.timestep_extents.get(&ts).copied().unwrap_or(self.extents)
    }

    /// Base path, relative to the dataset root, of a variable's file set
    pub fn base_path(&self, ts: usize, varname: &str) -> String {
        format!("data/{}/{}.{:04}", varname, varname, ts)
    }

    /// Check the descriptor for internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.dimension.iter().any(|&d| d == 0) {
            return Err(VdcError::InvalidDimensions(format!(
                "dimension {:?} has a zero extent",
                self.dimension
            )));
        }
        if self.block_size.iter().any(|&b| b == 0) {
            return Err(VdcError::Configuration(format!(
                "block size {:?} has a zero extent",
                self.block_size
            )));
        }
        if self.num_transforms > MAX_LEVELS {
            return Err(VdcError::Configuration(format!(
                "{} transforms exceeds max={}",
                self.num_transforms, MAX_LEVELS
            )));
        }
        if self.num_transforms > 0 {
            if let Some(bs) = self.block_size.iter().find(|&&b| b % 2 != 0) {
                return Err(VdcError::Configuration(format!(
                    "block size {} must be even when transforms are applied",
                    bs
                )));
            }
            for &width in &self.block_size {
                Lifting1D::check_params(self.filter_coef, self.lifting_coef, width)?;
            }
        }

        let mut seen = HashSet::new();
        for name in self.variable_names() {
            if name.is_empty() {
                return Err(VdcError::Metadata("empty variable name".to_string()));
            }
            if !seen.insert(name.clone()) {
                return Err(VdcError::Metadata(format!(
                    "variable {} declared more than once",
                    name
                )));
            }
        }

        if let Some(coords) = &self.stretched_coords {
            for (axis, c) in coords.iter().enumerate() {
                if c.len() != self.dimension[axis] {
                    return Err(VdcError::Metadata(format!(
                        "stretched axis {} has {} coordinates, expected {}",
                        axis,
                        c.len(),
                        self.dimension[axis]
                    )));
                }
            }
        } else if self.grid_type == GridType::Stretched {
            return Err(VdcError::Metadata(
                "stretched grid requires per-axis coordinates".to_string(),
            ));
        }
        Ok(())
    }

    /// Add custom metadata
    pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.custom_metadata.insert(key.into(), value.into());
    }

    /// Get custom metadata
    pub fn get_metadata(&self, key: &str) -> Option<&str> {
        self.custom_metadata.get(key).map(|s| s.as_str())
    }

    /// Update modification timestamp
    pub fn touch(&mut self) {
        self.modified_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_compatibility() {
        let v2_0 = VdcVersion::new(2, 0);
        let v2_1 = VdcVersion::new(2, 1);
        let v1_0 = VdcVersion::new(1, 0);

        assert!(v2_0.is_compatible(&v2_1));
        assert!(!v2_0.is_compatible(&v1_0));
    }

    #[test]
    fn test_variable_lookup() {
        let mut metadata = VdcMetadata::new([64, 64, 32], [16, 16, 16], 2)
            .with_variable("temp", VarType::Var3D)
            .with_variable("hgt", VarType::Var2DXY);
        metadata.add_variable("slice", VarType::Var2DYZ);

        assert_eq!(metadata.var_type("temp"), Some(VarType::Var3D));
        assert_eq!(metadata.var_type("hgt"), Some(VarType::Var2DXY));
        assert_eq!(metadata.var_type("slice"), Some(VarType::Var2DYZ));
        assert_eq!(metadata.var_type("nope"), None);
        assert_eq!(metadata.variable_names(), vec!["temp", "hgt", "slice"]);
        assert!(metadata.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let odd = VdcMetadata::new([10, 10, 10], [5, 4, 4], 1);
        assert!(matches!(odd.validate(), Err(VdcError::Configuration(_))));

        // No transforms: odd blocks are fine
        assert!(VdcMetadata::new([10, 10, 10], [5, 5, 5], 0).validate().is_ok());

        let lifting = VdcMetadata::new([32, 32, 32], [8, 8, 8], 1).with_wavelet(3, 1);
        assert!(lifting.validate().is_err());

        let dup = VdcMetadata::new([8, 8, 8], [4, 4, 4], 1)
            .with_variable("a", VarType::Var3D)
            .with_variable("a", VarType::Var2DXY);
        assert!(matches!(dup.validate(), Err(VdcError::Metadata(_))));
    }

    #[test]
    fn test_json_sidecar_round_trip() {
        let mut metadata = VdcMetadata::new([9, 9, 9], [4, 4, 4], 1)
            .with_variable("u", VarType::Var3D)
            .with_missing_value(-999.0);
        metadata.timestep_extents.insert(3, [0.0, 0.0, 0.0, 2.0, 2.0, 2.0]);
        metadata.add_metadata("project", "tornado");

        let json = serde_json::to_string_pretty(&metadata).unwrap();
        let parsed: VdcMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.dimension, [9, 9, 9]);
        assert_eq!(parsed.missing_value, Some(-999.0));
        assert_eq!(parsed.extents_at(3)[3], 2.0);
        assert_eq!(parsed.extents_at(0)[3], 1.0);
        assert_eq!(parsed.get_metadata("project"), Some("tornado"));
        assert_eq!(parsed.dataset_id, metadata.dataset_id);
        assert_eq!(
            parsed.base_path(7, "u"),
            "data/u/u.0007".to_string()
        );
    }
}

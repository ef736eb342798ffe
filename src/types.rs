//! Core data types for VDC

use serde::{Deserialize, Serialize};
use std::fmt;

/// Shape class of a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum VarType {
    /// Full 3D scalar field
    Var3D = 0,
    /// 2D field in the XY plane
    Var2DXY = 1,
    /// 2D field in the XZ plane
    Var2DXZ = 2,
    /// 2D field in the YZ plane
    Var2DYZ = 3,
}

impl VarType {
    /// Number of spatial dimensions carried by the variable
    pub fn ndims(&self) -> usize {
        match self {
            VarType::Var3D => 3,
            _ => 2,
        }
    }

    /// Volume axes used by the variable, in storage order.
    ///
    /// A 2D variable is stored as if its two axes were X and Y of a
    /// volume whose third axis has length one.
    pub fn axes(&self) -> [usize; 3] {
        match self {
            VarType::Var3D => [0, 1, 2],
            VarType::Var2DXY => [0, 1, 2],
            VarType::Var2DXZ => [0, 2, 1],
            VarType::Var2DYZ => [1, 2, 0],
        }
    }

    pub fn is_2d(&self) -> bool {
        !matches!(self, VarType::Var3D)
    }
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VarType::Var3D => "3D",
            VarType::Var2DXY => "2DXY",
            VarType::Var2DXZ => "2DXZ",
            VarType::Var2DYZ => "2DYZ",
        };
        write!(f, "{}", s)
    }
}

/// Sampling grid declared by a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum GridType {
    #[default]
    Regular,
    /// Terrain following: the vertical coordinate comes from the ELEVATION variable
    Layered,
    /// Per-axis monotonic coordinate arrays
    Stretched,
    Spherical,
}

/// Coordinate system of the user extents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CoordSystem {
    #[default]
    Cartesian,
    /// Longitude, latitude (degrees) and radius
    Spherical,
}

/// Scalar value range
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f32,
    pub max: f32,
}

impl ValueRange {
    pub fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    /// An empty range that any value will widen
    pub fn empty() -> Self {
        Self {
            min: f32::MAX,
            max: -f32::MAX,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min <= self.max
    }

    /// Widen the range to include `v`
    pub fn include(&mut self, v: f32) {
        if v < self.min {
            self.min = v;
        }
        if v > self.max {
            self.max = v;
        }
    }

    /// Widen the range to include another range
    pub fn union(&mut self, other: &ValueRange) {
        self.include(other.min);
        self.include(other.max);
    }

    /// Range of a slice of values
    pub fn of(values: &[f32]) -> Self {
        let mut range = Self::empty();
        for &v in values {
            range.include(v);
        }
        range
    }
}

impl Default for ValueRange {
    fn default() -> Self {
        Self::new(0.0, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_var_type_axes() {
        assert_eq!(VarType::Var3D.ndims(), 3);
        assert_eq!(VarType::Var2DXZ.ndims(), 2);
        assert_eq!(VarType::Var2DXZ.axes(), [0, 2, 1]);
        assert_eq!(VarType::Var2DYZ.axes(), [1, 2, 0]);
        assert!(VarType::Var2DXY.is_2d());
    }

    #[test]
    fn test_value_range() {
        let mut range = ValueRange::empty();
        assert!(!range.is_valid());
        range.include(3.0);
        range.include(-1.0);
        assert_eq!(range, ValueRange::new(-1.0, 3.0));

        range.union(&ValueRange::new(0.0, 7.5));
        assert_eq!(range, ValueRange::new(-1.0, 7.5));
        assert_eq!(ValueRange::of(&[2.0, 9.0, 4.0]), ValueRange::new(2.0, 9.0));
    }
}

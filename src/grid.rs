//! Sampling views over cached block buffers.
//!
//! A [`Grid`] covers the voxels `[min, max]` of one refinement level. Its
//! samples live in a shared block-major buffer spanning the enclosing
//! blocks, so the same buffer can back the cache entry and any number of
//! grids without copying.

use crate::cache::RegionKey;
use crate::coords::child_offset;
use crate::error::{Result, VdcError};
use crate::types::ValueRange;
use std::sync::Arc;

/// How values between samples are reconstructed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interpolation {
    Nearest,
    #[default]
    Linear,
}

/// Coordinate model of a grid
#[derive(Debug, Clone)]
pub enum GridKind {
    /// Uniform spacing between the user extents
    Regular,
    /// Monotonic user coordinates along each axis, one per sample
    Stretched { coords: [Vec<f64>; 3] },
    /// Uniform in x and y; the z coordinate of every sample comes from an
    /// elevation buffer laid out like the data
    Layered { elevation: Arc<Vec<f32>> },
    /// Axes are longitude and latitude in degrees and radius. Points are
    /// given in Cartesian coordinates.
    Spherical,
}

/// A read-mostly view of one variable region
#[derive(Debug, Clone)]
pub struct Grid {
    kind: GridKind,
    bs: [usize; 3],
    bdims: [usize; 3],
    /// Offset of the first sample inside the first block
    min: [usize; 3],
    dims: [usize; 3],
    minabs: [usize; 3],
    /// Extents of the sampling space: user space for regular, stretched and
    /// layered grids (layered z from the elevation), lon/lat/radius for
    /// spherical grids
    extents: [f64; 6],
    periodic: [bool; 3],
    missing_value: Option<f32>,
    interpolation: Interpolation,
    blocks: Arc<Vec<f32>>,
    locks: Vec<RegionKey>,
}

impl Grid {
    /// Regular grid over voxels `[minabs, maxabs]` of a level. `blocks`
    /// holds the enclosing blocks in (z, y, x) order.
    pub fn new(
        bs: [usize; 3],
        minabs: [usize; 3],
        maxabs: [usize; 3],
        extents: [f64; 6],
        periodic: [bool; 3],
        blocks: Arc<Vec<f32>>,
    ) -> Result<Self> {
        let mut bdims = [0; 3];
        let mut min = [0; 3];
        let mut dims = [0; 3];
        for i in 0..3 {
            if bs[i] == 0 || maxabs[i] < minabs[i] {
                return Err(VdcError::InvalidRegion(format!(
                    "grid bounds {:?}..{:?} with block size {:?}",
                    minabs, maxabs, bs
                )));
            }
            bdims[i] = maxabs[i] / bs[i] - minabs[i] / bs[i] + 1;
            min[i] = minabs[i] % bs[i];
            dims[i] = maxabs[i] - minabs[i] + 1;
        }
        let expected = bdims.iter().product::<usize>() * bs.iter().product::<usize>();
        if blocks.len() != expected {
            return Err(VdcError::InvalidDimensions(format!(
                "grid buffer holds {} samples, blocks {:?} of {:?} need {}",
                blocks.len(),
                bdims,
                bs,
                expected
            )));
        }
        Ok(Self {
            kind: GridKind::Regular,
            bs,
            bdims,
            min,
            dims,
            minabs,
            extents,
            periodic,
            missing_value: None,
            interpolation: Interpolation::default(),
            blocks,
            locks: Vec::new(),
        })
    }

    pub fn with_missing_value(mut self, missing_value: Option<f32>) -> Self {
        self.missing_value = missing_value;
        self
    }

    pub fn with_interpolation(mut self, interpolation: Interpolation) -> Self {
        self.interpolation = interpolation;
        self
    }

    /// Switch to stretched coordinates, one array per axis covering the
    /// grid's samples
    pub fn with_stretched_coords(mut self, coords: [Vec<f64>; 3]) -> Result<Self> {
        for (i, c) in coords.iter().enumerate() {
            if c.len() != self.dims[i] {
                return Err(VdcError::InvalidDimensions(format!(
                    "axis {} has {} coordinates for {} samples",
                    i,
                    c.len(),
                    self.dims[i]
                )));
            }
            if c.windows(2).any(|w| w[1] <= w[0]) {
                return Err(VdcError::InvalidDimensions(format!(
                    "coordinates of axis {} are not increasing",
                    i
                )));
            }
            self.extents[i] = c[0];
            self.extents[i + 3] = c[c.len() - 1];
        }
        self.kind = GridKind::Stretched { coords };
        Ok(self)
    }

    /// Switch to a terrain-following grid whose z coordinates come from
    /// `elevation`, a buffer with the same block layout as the data
    pub fn with_elevation(mut self, elevation: Arc<Vec<f32>>) -> Result<Self> {
        if elevation.len() != self.blocks.len() {
            return Err(VdcError::InvalidDimensions(format!(
                "elevation holds {} samples, grid holds {}",
                elevation.len(),
                self.blocks.len()
            )));
        }
        self.kind = GridKind::Layered { elevation };
        if let Some(range) = self.coord_range() {
            self.extents[2] = range.min as f64;
            self.extents[5] = range.max as f64;
        }
        Ok(self)
    }

    /// Interpret the extents as longitude, latitude (degrees) and radius
    pub fn with_spherical(mut self) -> Self {
        self.kind = GridKind::Spherical;
        self
    }

    pub(crate) fn with_locks(mut self, locks: Vec<RegionKey>) -> Self {
        self.locks = locks;
        self
    }

    pub(crate) fn take_locks(&mut self) -> Vec<RegionKey> {
        std::mem::take(&mut self.locks)
    }

    pub fn kind(&self) -> &GridKind {
        &self.kind
    }

    /// Samples along each axis
    pub fn dimensions(&self) -> [usize; 3] {
        self.dims
    }

    /// First voxel of the grid in level coordinates
    pub fn min_voxel(&self) -> [usize; 3] {
        self.minabs
    }

    pub fn block_size(&self) -> [usize; 3] {
        self.bs
    }

    pub fn periodic(&self) -> [bool; 3] {
        self.periodic
    }

    pub fn missing_value(&self) -> Option<f32> {
        self.missing_value
    }

    pub fn interpolation(&self) -> Interpolation {
        self.interpolation
    }

    pub fn set_interpolation(&mut self, interpolation: Interpolation) {
        self.interpolation = interpolation;
    }

    /// Shared block buffer backing the grid
    pub fn blocks(&self) -> &Arc<Vec<f32>> {
        &self.blocks
    }

    fn offset(&self, ijk: [usize; 3]) -> Option<usize> {
        if (0..3).any(|a| ijk[a] >= self.dims[a]) {
            return None;
        }
        let x = ijk[0] + self.min[0];
        let y = ijk[1] + self.min[1];
        let z = ijk[2] + self.min[2];
        let (xb, yb, zb) = (x / self.bs[0], y / self.bs[1], z / self.bs[2]);
        let block = (zb * self.bdims[1] + yb) * self.bdims[0] + xb;
        let (xi, yi, zi) = (x % self.bs[0], y % self.bs[1], z % self.bs[2]);
        Some(block * self.bs.iter().product::<usize>() + (zi * self.bs[1] + yi) * self.bs[0] + xi)
    }

    /// Sample at grid index `(i, j, k)`, or `None` outside the grid
    pub fn access_ijk(&self, i: usize, j: usize, k: usize) -> Option<f32> {
        self.offset([i, j, k]).map(|o| self.blocks[o])
    }

    /// Overwrite one sample. The buffer is copied first if it is shared.
    pub fn set_value(&mut self, i: usize, j: usize, k: usize, v: f32) -> Result<()> {
        let o = self.offset([i, j, k]).ok_or_else(|| {
            VdcError::InvalidRegion(format!("index ({}, {}, {}) outside grid {:?}", i, j, k, self.dims))
        })?;
        Arc::make_mut(&mut self.blocks)[o] = v;
        Ok(())
    }

    fn is_missing(&self, v: f32) -> bool {
        self.missing_value == Some(v)
    }

    fn elevation_at(&self, ijk: [usize; 3]) -> Option<f64> {
        match &self.kind {
            GridKind::Layered { elevation } => self.offset(ijk).map(|o| elevation[o] as f64),
            _ => None,
        }
    }

    /// Range of the z coordinates of a layered grid
    fn coord_range(&self) -> Option<ValueRange> {
        let GridKind::Layered { elevation } = &self.kind else {
            return None;
        };
        let mut range = ValueRange::empty();
        for k in 0..self.dims[2] {
            for j in 0..self.dims[1] {
                for i in 0..self.dims[0] {
                    if let Some(o) = self.offset([i, j, k]) {
                        range.include(elevation[o]);
                    }
                }
            }
        }
        range.is_valid().then_some(range)
    }

    /// Uniform spacing of axis `a` in the sampling space
    fn delta(&self, a: usize) -> f64 {
        if self.dims[a] <= 1 {
            0.0
        } else {
            (self.extents[a + 3] - self.extents[a]) / (self.dims[a] - 1) as f64
        }
    }

    /// User coordinates of sample `(i, j, k)`
    pub fn user_coordinates(&self, i: usize, j: usize, k: usize) -> Option<[f64; 3]> {
        let ijk = [i, j, k];
        if (0..3).any(|a| ijk[a] >= self.dims[a]) {
            return None;
        }
        let uniform = |a: usize| self.extents[a] + ijk[a] as f64 * self.delta(a);
        match &self.kind {
            GridKind::Regular => Some([uniform(0), uniform(1), uniform(2)]),
            GridKind::Stretched { coords } => Some([coords[0][i], coords[1][j], coords[2][k]]),
            GridKind::Layered { .. } => Some([uniform(0), uniform(1), self.elevation_at(ijk)?]),
            GridKind::Spherical => Some(spherical_to_cartesian([uniform(0), uniform(1), uniform(2)])),
        }
    }

    /// Extents in user coordinates, Cartesian for spherical grids
    pub fn user_extents(&self) -> [f64; 6] {
        match self.kind {
            GridKind::Spherical => self.cartesian_extents(),
            _ => self.extents,
        }
    }

    fn cartesian_extents(&self) -> [f64; 6] {
        let mut ext = [f64::MAX, f64::MAX, f64::MAX, f64::MIN, f64::MIN, f64::MIN];
        for k in [0, self.dims[2] - 1] {
            for j in 0..self.dims[1] {
                for i in 0..self.dims[0] {
                    if let Some(p) = self.user_coordinates(i, j, k) {
                        for a in 0..3 {
                            ext[a] = ext[a].min(p[a]);
                            ext[a + 3] = ext[a + 3].max(p[a]);
                        }
                    }
                }
            }
        }
        ext
    }

    /// Map a user point into the sampling space, wrapping periodic axes
    fn sampling_point(&self, p: [f64; 3]) -> [f64; 3] {
        let mut q = match self.kind {
            GridKind::Spherical => cartesian_to_spherical(p),
            _ => p,
        };
        for a in 0..3 {
            let (lo, hi) = (
                self.extents[a].min(self.extents[a + 3]),
                self.extents[a].max(self.extents[a + 3]),
            );
            // layered z is never periodic
            let wrap = self.periodic[a] && !(a == 2 && matches!(self.kind, GridKind::Layered { .. }));
            if wrap && hi > lo && (q[a] < lo || q[a] > hi) {
                q[a] = lo + (q[a] - lo).rem_euclid(hi - lo);
            }
            if self.dims[a] == 1 {
                q[a] = self.extents[a];
            }
        }
        q
    }

    /// Cell index and weight of a sampling-space coordinate along axis `a`
    fn locate(&self, a: usize, x: f64) -> Option<(usize, f64)> {
        let n = self.dims[a];
        if n == 1 {
            return Some((0, 0.0));
        }
        let t = match &self.kind {
            GridKind::Stretched { coords } => {
                let c = &coords[a];
                if x < c[0] || x > c[n - 1] {
                    return None;
                }
                let i = c.partition_point(|&v| v <= x).saturating_sub(1).min(n - 1);
                if i == n - 1 {
                    return Some((i, 0.0));
                }
                return Some((i, (x - c[i]) / (c[i + 1] - c[i])));
            }
            _ => (x - self.extents[a]) / self.delta(a),
        };
        if !(0.0..=(n - 1) as f64).contains(&t) {
            return None;
        }
        let i = (t.floor() as usize).min(n - 1);
        let w = if i == n - 1 { 0.0 } else { t - i as f64 };
        Some((i, w))
    }

    /// Cell and weights of a layered point. x and y are uniform; z is
    /// bracketed by the elevation of the layers at the point.
    fn locate_layered(&self, q: [f64; 3]) -> Option<([usize; 3], [f64; 3])> {
        let (i, wi) = self.locate(0, q[0])?;
        let (j, wj) = self.locate(1, q[1])?;
        let nz = self.dims[2];
        let layer = |k: usize| -> Option<f64> {
            let mut acc = 0.0;
            for c in 0..4 {
                let off = child_offset(c);
                let wx = if off[0] == 1 { wi } else { 1.0 - wi };
                let wy = if off[1] == 1 { wj } else { 1.0 - wj };
                if wx * wy == 0.0 {
                    continue;
                }
                acc += wx * wy * self.elevation_at([i + off[0], j + off[1], k])?;
            }
            Some(acc)
        };
        if nz == 1 {
            return Some(([i, j, 0], [wi, wj, 0.0]));
        }
        let bottom = layer(0)?;
        let top = layer(nz - 1)?;
        if q[2] < bottom || q[2] > top {
            return None;
        }
        let mut k = 0;
        while k + 1 < nz - 1 && layer(k + 1)? <= q[2] {
            k += 1;
        }
        let (z0, z1) = (layer(k)?, layer(k + 1)?);
        let wk = if z1 != z0 { (q[2] - z0) / (z1 - z0) } else { 0.0 };
        Some(([i, j, k], [wi, wj, wk.clamp(0.0, 1.0)]))
    }

    fn cell(&self, p: [f64; 3]) -> Option<([usize; 3], [f64; 3])> {
        let q = self.sampling_point(p);
        if let GridKind::Layered { .. } = self.kind {
            return self.locate_layered(q);
        }
        let (i, wi) = self.locate(0, q[0])?;
        let (j, wj) = self.locate(1, q[1])?;
        let (k, wk) = self.locate(2, q[2])?;
        Some(([i, j, k], [wi, wj, wk]))
    }

    /// True if a user point lies inside the grid
    pub fn inside(&self, x: f64, y: f64, z: f64) -> bool {
        self.cell([x, y, z]).is_some()
    }

    /// Index of the sample nearest to a user point
    pub fn ijk_index(&self, x: f64, y: f64, z: f64) -> Option<[usize; 3]> {
        let (mut idx, w) = self.cell([x, y, z])?;
        for a in 0..3 {
            if w[a] > 0.5 {
                idx[a] += 1;
            }
        }
        Some(idx)
    }

    /// Index of the cell containing a user point
    pub fn ijk_index_floor(&self, x: f64, y: f64, z: f64) -> Option<[usize; 3]> {
        self.cell([x, y, z]).map(|(idx, _)| idx)
    }

    /// Value at a user point, `None` outside the grid or where a
    /// contributing sample is missing
    pub fn value(&self, x: f64, y: f64, z: f64) -> Option<f32> {
        let (idx, w) = self.cell([x, y, z])?;
        match self.interpolation {
            Interpolation::Nearest => {
                let mut n = idx;
                for a in 0..3 {
                    if w[a] > 0.5 {
                        n[a] += 1;
                    }
                }
                let v = self.access_ijk(n[0], n[1], n[2])?;
                (!self.is_missing(v)).then_some(v)
            }
            Interpolation::Linear => {
                let mut acc = 0.0f64;
                for c in 0..8 {
                    let off = child_offset(c);
                    let mut weight = 1.0;
                    for a in 0..3 {
                        weight *= if off[a] == 1 { w[a] } else { 1.0 - w[a] };
                    }
                    if (0..3).any(|a| off[a] == 1 && w[a] == 0.0) {
                        continue;
                    }
                    let v = self.access_ijk(idx[0] + off[0], idx[1] + off[1], idx[2] + off[2])?;
                    if self.is_missing(v) {
                        return None;
                    }
                    acc += weight * v as f64;
                }
                Some(acc as f32)
            }
        }
    }

    /// Iterate samples in (k, j, i) order, i fastest
    pub fn iter(&self) -> impl Iterator<Item = f32> + '_ {
        let [nx, ny, nz] = self.dims;
        (0..nz).flat_map(move |k| {
            (0..ny).flat_map(move |j| (0..nx).filter_map(move |i| self.access_ijk(i, j, k)))
        })
    }

    /// Range of the non-missing samples
    pub fn range(&self) -> Option<ValueRange> {
        let mut range = ValueRange::empty();
        for v in self.iter().filter(|&v| !self.is_missing(v)) {
            range.include(v);
        }
        range.is_valid().then_some(range)
    }
}

fn spherical_to_cartesian(s: [f64; 3]) -> [f64; 3] {
    let (lon, lat, r) = (s[0].to_radians(), s[1].to_radians(), s[2]);
    [r * lat.cos() * lon.cos(), r * lat.cos() * lon.sin(), r * lat.sin()]
}

fn cartesian_to_spherical(p: [f64; 3]) -> [f64; 3] {
    let r = (p[0] * p[0] + p[1] * p[1] + p[2] * p[2]).sqrt();
    if r == 0.0 {
        return [0.0, 0.0, 0.0];
    }
    [p[1].atan2(p[0]).to_degrees(), (p[2] / r).asin().to_degrees(), r]
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 4x4x2 grid of 2x2x2 blocks, value = x + 10y + 100z
    fn grid() -> Grid {
        let bs = [2, 2, 2];
        let mut blocks = Vec::new();
        for by in 0..2 {
            for bx in 0..2 {
                for z in 0..2 {
                    for y in 0..2 {
                        for x in 0..2 {
                            let (gx, gy) = (bx * 2 + x, by * 2 + y);
                            blocks.push((gx + 10 * gy + 100 * z) as f32);
                        }
                    }
                }
            }
        }
        Grid::new(bs, [0, 0, 0], [3, 3, 1], [0.0, 0.0, 0.0, 3.0, 3.0, 1.0], [false; 3], Arc::new(blocks)).unwrap()
    }

    #[test]
    fn test_block_major_access() {
        let g = grid();
        assert_eq!(g.dimensions(), [4, 4, 2]);
        assert_eq!(g.access_ijk(3, 2, 1), Some(123.0));
        assert_eq!(g.access_ijk(0, 3, 0), Some(30.0));
        assert_eq!(g.access_ijk(4, 0, 0), None);
    }

    #[test]
    fn test_subregion_offset() {
        let g = grid();
        let sub = Grid::new(
            [2, 2, 2],
            [1, 1, 0],
            [2, 2, 1],
            [1.0, 1.0, 0.0, 2.0, 2.0, 1.0],
            [false; 3],
            g.blocks().clone(),
        )
        .unwrap();
        assert_eq!(sub.dimensions(), [2, 2, 2]);
        assert_eq!(sub.access_ijk(0, 0, 0), Some(11.0));
        assert_eq!(sub.access_ijk(1, 1, 1), Some(122.0));
        assert!(Arc::ptr_eq(sub.blocks(), g.blocks()));
    }

    #[test]
    fn test_linear_and_nearest() {
        let mut g = grid();
        assert_eq!(g.value(1.5, 2.0, 0.5), Some(71.5));
        assert_eq!(g.value(3.0, 3.0, 1.0), Some(133.0));
        assert_eq!(g.value(3.5, 0.0, 0.0), None);
        g.set_interpolation(Interpolation::Nearest);
        assert_eq!(g.value(1.6, 2.4, 0.2), Some(22.0));
        assert_eq!(g.ijk_index(1.6, 2.4, 0.2), Some([2, 2, 0]));
        assert_eq!(g.ijk_index_floor(1.6, 2.4, 0.2), Some([1, 2, 0]));
    }

    #[test]
    fn test_periodic_wrap() {
        let g = grid();
        let p = Grid::new(
            [2, 2, 2],
            [0, 0, 0],
            [3, 3, 1],
            [0.0, 0.0, 0.0, 3.0, 3.0, 1.0],
            [true, false, false],
            g.blocks().clone(),
        )
        .unwrap();
        assert_eq!(p.value(4.0, 0.0, 0.0), p.value(1.0, 0.0, 0.0));
        assert_eq!(p.value(-1.0, 0.0, 0.0), p.value(2.0, 0.0, 0.0));
        assert!(p.inside(-1.0, 0.0, 0.0));
        assert!(!p.inside(0.0, -1.0, 0.0));
    }

    #[test]
    fn test_missing_value_propagates() {
        let mut g = grid().with_missing_value(Some(-1.0));
        g.set_value(1, 0, 0, -1.0).unwrap();
        assert_eq!(g.value(0.5, 0.0, 0.0), None);
        assert_eq!(g.value(0.0, 0.0, 0.0), Some(0.0));
        let range = g.range().unwrap();
        assert_eq!(range, ValueRange::new(0.0, 133.0));
    }

    #[test]
    fn test_set_value_copies_shared_buffer() {
        let g = grid();
        let mut h = g.clone();
        h.set_value(0, 0, 0, 9.0).unwrap();
        assert_eq!(g.access_ijk(0, 0, 0), Some(0.0));
        assert_eq!(h.access_ijk(0, 0, 0), Some(9.0));
        assert!(h.set_value(9, 0, 0, 1.0).is_err());
    }

    #[test]
    fn test_iteration_order() {
        let g = grid();
        let v: Vec<f32> = g.iter().take(5).collect();
        assert_eq!(v, vec![0.0, 1.0, 2.0, 3.0, 10.0]);
        assert_eq!(g.iter().count(), 32);
    }

    #[test]
    fn test_stretched_lookup() {
        let g = grid()
            .with_stretched_coords([vec![0.0, 1.0, 3.0, 7.0], vec![0.0, 1.0, 2.0, 3.0], vec![0.0, 10.0]])
            .unwrap();
        assert_eq!(g.user_extents(), [0.0, 0.0, 0.0, 7.0, 3.0, 10.0]);
        assert_eq!(g.value(5.0, 0.0, 0.0), Some(2.5));
        assert_eq!(g.user_coordinates(3, 0, 1), Some([7.0, 0.0, 10.0]));
        assert!(grid().with_stretched_coords([vec![0.0; 4], vec![0.0; 4], vec![0.0; 2]]).is_err());
    }

    #[test]
    fn test_layered_bracket() {
        // flat layers at z = 0 and z = 4
        let g = grid();
        let elev: Vec<f32> = g.blocks().iter().map(|v| if *v >= 100.0 { 4.0 } else { 0.0 }).collect();
        let l = g.with_elevation(Arc::new(elev)).unwrap();
        assert_eq!(l.user_extents()[5], 4.0);
        assert_eq!(l.value(0.0, 0.0, 1.0), Some(25.0));
        assert_eq!(l.value(0.0, 0.0, 5.0), None);
        assert_eq!(l.user_coordinates(0, 0, 1), Some([0.0, 0.0, 4.0]));
    }

    #[test]
    fn test_spherical_roundtrip() {
        let s = cartesian_to_spherical(spherical_to_cartesian([30.0, 45.0, 2.0]));
        assert!((s[0] - 30.0).abs() < 1e-9);
        assert!((s[1] - 45.0).abs() < 1e-9);
        assert!((s[2] - 2.0).abs() < 1e-9);

        let g = grid();
        let sph = Grid::new(
            [2, 2, 2],
            [0, 0, 0],
            [3, 3, 1],
            [0.0, 0.0, 1.0, 30.0, 30.0, 2.0],
            [false; 3],
            g.blocks().clone(),
        )
        .unwrap()
        .with_spherical();
        let p = spherical_to_cartesian([10.0, 10.0, 1.5]);
        assert!((sph.value(p[0], p[1], p[2]).unwrap() - 61.0).abs() < 1e-3);
        assert!(sph.user_coordinates(1, 1, 0).is_some());
    }
}

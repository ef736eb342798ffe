//! Typed coordinates
//!
//! Voxel coordinates, block coordinates and level-tagged block coordinates are
//! distinct types so that conversions between them are always explicit.

use serde::{Deserialize, Serialize};
use std::ops::Index;

/// A voxel position (x, y, z) at some refinement level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct VoxelCoord(pub [usize; 3]);

/// A block position (x, y, z) at some refinement level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct BlockCoord(pub [usize; 3]);

/// A block position tagged with the refinement level it lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LevelCoord {
    pub level: usize,
    pub block: BlockCoord,
}

impl VoxelCoord {
    pub fn new(x: usize, y: usize, z: usize) -> Self {
        Self([x, y, z])
    }

    /// Block containing this voxel
    pub fn to_block(&self, bs: [usize; 3]) -> BlockCoord {
        BlockCoord([self.0[0] / bs[0], self.0[1] / bs[1], self.0[2] / bs[2]])
    }

    /// Apply `k` halvings
    pub fn coarsen(&self, k: usize) -> Self {
        Self([self.0[0] >> k, self.0[1] >> k, self.0[2] >> k])
    }

    /// Clamp each component into `[lo, hi]`
    pub fn clamp(&self, lo: VoxelCoord, hi: VoxelCoord) -> Self {
        let mut v = self.0;
        for i in 0..3 {
            v[i] = v[i].clamp(lo.0[i], hi.0[i]);
        }
        Self(v)
    }
}

impl BlockCoord {
    pub fn new(x: usize, y: usize, z: usize) -> Self {
        Self([x, y, z])
    }

    /// First voxel covered by the block
    pub fn first_voxel(&self, bs: [usize; 3]) -> VoxelCoord {
        VoxelCoord([self.0[0] * bs[0], self.0[1] * bs[1], self.0[2] * bs[2]])
    }

    /// Last voxel covered by the block
    pub fn last_voxel(&self, bs: [usize; 3]) -> VoxelCoord {
        VoxelCoord([
            self.0[0] * bs[0] + bs[0] - 1,
            self.0[1] * bs[1] + bs[1] - 1,
            self.0[2] * bs[2] + bs[2] - 1,
        ])
    }

    /// Apply `k` halvings (block coordinate `k` levels coarser)
    pub fn coarsen(&self, k: usize) -> Self {
        Self([self.0[0] >> k, self.0[1] >> k, self.0[2] >> k])
    }

    /// True if every component is strictly below `bound`
    pub fn within(&self, bound: [usize; 3]) -> bool {
        (0..3).all(|i| self.0[i] < bound[i])
    }

    /// True if the block lies inside the inclusive box `[min, max]`
    pub fn inside(&self, min: BlockCoord, max: BlockCoord) -> bool {
        (0..3).all(|i| self.0[i] >= min.0[i] && self.0[i] <= max.0[i])
    }
}

impl LevelCoord {
    pub fn new(level: usize, block: BlockCoord) -> Self {
        Self { level, block }
    }

    /// Parent block on the next coarser level
    pub fn parent(&self) -> Option<LevelCoord> {
        if self.level == 0 {
            return None;
        }
        Some(LevelCoord::new(self.level - 1, self.block.coarsen(1)))
    }

    /// Child `c` on the next finer level (child order `z*4 + y*2 + x`)
    pub fn child(&self, c: usize) -> LevelCoord {
        let b = self.block.0;
        LevelCoord::new(
            self.level + 1,
            BlockCoord([
                2 * b[0] + (c & 1),
                2 * b[1] + ((c >> 1) & 1),
                2 * b[2] + ((c >> 2) & 1),
            ]),
        )
    }
}

impl Index<usize> for VoxelCoord {
    type Output = usize;
    fn index(&self, i: usize) -> &usize {
        &self.0[i]
    }
}

impl Index<usize> for BlockCoord {
    type Output = usize;
    fn index(&self, i: usize) -> &usize {
        &self.0[i]
    }
}

/// Offset of child `c` along each axis
pub fn child_offset(c: usize) -> [usize; 3] {
    [c & 1, (c >> 1) & 1, (c >> 2) & 1]
}

/// Iterate an inclusive box of block coordinates in (z, y, x) order, x fastest
pub fn iter_blocks(min: BlockCoord, max: BlockCoord) -> impl Iterator<Item = BlockCoord> {
    let (lo, hi) = (min.0, max.0);
    (lo[2]..=hi[2]).flat_map(move |z| {
        (lo[1]..=hi[1]).flat_map(move |y| (lo[0]..=hi[0]).map(move |x| BlockCoord([x, y, z])))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voxel_to_block() {
        let v = VoxelCoord::new(9, 4, 3);
        assert_eq!(v.to_block([4, 4, 4]), BlockCoord::new(2, 1, 0));
        assert_eq!(v.coarsen(1), VoxelCoord::new(4, 2, 1));
    }

    #[test]
    fn test_block_voxel_span() {
        let b = BlockCoord::new(1, 0, 2);
        assert_eq!(b.first_voxel([4, 4, 4]), VoxelCoord::new(4, 0, 8));
        assert_eq!(b.last_voxel([4, 4, 4]), VoxelCoord::new(7, 3, 11));
    }

    #[test]
    fn test_level_parent_child() {
        let lc = LevelCoord::new(1, BlockCoord::new(1, 0, 1));
        let child = lc.child(7);
        assert_eq!(child, LevelCoord::new(2, BlockCoord::new(3, 1, 3)));
        assert_eq!(child.parent(), Some(lc));
        assert_eq!(LevelCoord::new(0, BlockCoord::default()).parent(), None);
    }

    #[test]
    fn test_iter_blocks_order() {
        let blocks: Vec<_> =
            iter_blocks(BlockCoord::new(0, 0, 0), BlockCoord::new(1, 1, 0)).collect();
        assert_eq!(
            blocks,
            vec![
                BlockCoord::new(0, 0, 0),
                BlockCoord::new(1, 0, 0),
                BlockCoord::new(0, 1, 0),
                BlockCoord::new(1, 1, 0),
            ]
        );
    }
}

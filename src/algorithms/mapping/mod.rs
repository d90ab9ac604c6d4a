//! Persistent environment representation.

mod voxel_map;

pub use voxel_map::{VoxelMap, VoxelMapConfig};

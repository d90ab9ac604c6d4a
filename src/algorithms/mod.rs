//! Core algorithms: the voxel map, plane association, and the
//! continuous-time trajectory model.

pub mod mapping;
pub mod matching;
pub mod trajectory;

//! LiDAR point sample and voxel indexing.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// A single LiDAR return.
///
/// `raw_pt` is the sensor-frame position as measured and is immutable after
/// ingest; `pt` is the world-frame position and is recomputed whenever the
/// trajectory estimate changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Point3D {
    /// Sensor-frame position (meters). Never modified after ingest.
    pub raw_pt: Vector3<f64>,
    /// World-frame position, derived from `raw_pt` and the trajectory.
    pub pt: Vector3<f64>,
    /// Absolute timestamp (seconds).
    pub timestamp: f64,
    /// In-sweep fraction in [0, 1] between the sweep begin and end times.
    pub alpha_timestamp: f64,
    /// Laser/beam channel that produced the return.
    pub beam_id: u16,
    /// Return intensity as reported by the sensor.
    pub intensity: f32,
    /// Radial velocity for sensors that report it, 0 otherwise.
    pub radial_velocity: f32,
}

impl Point3D {
    /// Create a point from a raw sensor measurement. The world position
    /// starts at the raw position until a trajectory estimate exists.
    pub fn from_raw(raw_pt: Vector3<f64>, timestamp: f64) -> Self {
        Self {
            raw_pt,
            pt: raw_pt,
            timestamp,
            alpha_timestamp: 0.0,
            beam_id: 0,
            intensity: 0.0,
            radial_velocity: 0.0,
        }
    }
}

/// Integer voxel coordinate: `floor(position / voxel_size)` per axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VoxelKey {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl VoxelKey {
    /// Key of the voxel containing `p`.
    #[inline]
    pub fn of(p: &Vector3<f64>, voxel_size: f64) -> Self {
        Self {
            x: (p.x / voxel_size).floor() as i32,
            y: (p.y / voxel_size).floor() as i32,
            z: (p.z / voxel_size).floor() as i32,
        }
    }
}

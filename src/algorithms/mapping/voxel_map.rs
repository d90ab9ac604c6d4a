//! Hashed voxel grid of world-frame map points.
//!
//! The map owns plain 3D points only; trajectory state never enters it.
//! Insertion keeps voxels bounded and spaced, removal keeps the map inside a
//! radius around the sensor, and neighbor queries scan a fixed cube of
//! voxels so their result order does not depend on hash iteration.

use nalgebra::Vector3;
use std::collections::HashMap;

use crate::core::types::VoxelKey;

/// Insertion/eviction parameters of the map.
#[derive(Debug, Clone, Copy)]
pub struct VoxelMapConfig {
    /// Voxel edge length (meters).
    pub voxel_size: f64,
    /// Capacity of one voxel.
    pub max_points_per_voxel: usize,
    /// Minimum spacing between stored points inside one voxel (meters).
    pub min_distance_points: f64,
}

impl Default for VoxelMapConfig {
    fn default() -> Self {
        Self {
            voxel_size: 1.0,
            max_points_per_voxel: 20,
            min_distance_points: 0.1,
        }
    }
}

/// Bounded, spaced voxel grid of world points.
#[derive(Debug, Default, Clone)]
pub struct VoxelMap {
    config: VoxelMapConfig,
    voxels: HashMap<VoxelKey, Vec<Vector3<f64>>>,
    num_points: usize,
}

impl VoxelMap {
    pub fn new(config: VoxelMapConfig) -> Self {
        Self {
            config,
            voxels: HashMap::new(),
            num_points: 0,
        }
    }

    pub fn config(&self) -> &VoxelMapConfig {
        &self.config
    }

    /// Number of stored points.
    pub fn len(&self) -> usize {
        self.num_points
    }

    pub fn is_empty(&self) -> bool {
        self.num_points == 0
    }

    /// Number of non-empty voxels.
    pub fn num_voxels(&self) -> usize {
        self.voxels.len()
    }

    /// Insert one candidate point.
    ///
    /// Rejected when its voxel is full or any stored point of that voxel is
    /// closer than the configured spacing. Returns whether it was stored.
    pub fn add_point(&mut self, point: &Vector3<f64>) -> bool {
        let key = VoxelKey::of(point, self.config.voxel_size);
        let voxel = self.voxels.entry(key).or_default();
        if voxel.len() >= self.config.max_points_per_voxel {
            return false;
        }
        let min_dist_sq = self.config.min_distance_points * self.config.min_distance_points;
        if voxel.iter().any(|p| (p - point).norm_squared() < min_dist_sq) {
            return false;
        }
        voxel.push(*point);
        self.num_points += 1;
        true
    }

    /// Insert a batch of candidates in input order.
    pub fn add(&mut self, points: impl IntoIterator<Item = Vector3<f64>>) {
        for point in points {
            self.add_point(&point);
        }
    }

    /// Drop every voxel whose first stored point is farther than
    /// `max_distance` from `center`.
    ///
    /// The first stored point is the one that created the voxel under the
    /// insertion invariant; all later points lie within one voxel diagonal
    /// of it, so the cull radius is exact up to that diagonal.
    pub fn remove(&mut self, center: &Vector3<f64>, max_distance: f64) {
        let max_dist_sq = max_distance * max_distance;
        let mut removed = 0usize;
        self.voxels.retain(|_, points| {
            let keep = points
                .first()
                .is_some_and(|p| (p - center).norm_squared() <= max_dist_sq);
            if !keep {
                removed += points.len();
            }
            keep
        });
        self.num_points -= removed;
    }

    /// Collect the `k_req` stored points nearest to `query`, scanning the
    /// `(2·nb_voxels + 1)³` cube of voxels around the query's cell.
    ///
    /// Returns points sorted by ascending distance; an empty map (or an
    /// empty cube) yields an empty vector.
    pub fn search_neighbors(
        &self,
        query: &Vector3<f64>,
        nb_voxels: i32,
        k_req: usize,
    ) -> Vec<Vector3<f64>> {
        if self.voxels.is_empty() || k_req == 0 {
            return Vec::new();
        }
        let center = VoxelKey::of(query, self.config.voxel_size);
        let mut candidates: Vec<(f64, Vector3<f64>)> = Vec::new();
        for dx in -nb_voxels..=nb_voxels {
            for dy in -nb_voxels..=nb_voxels {
                for dz in -nb_voxels..=nb_voxels {
                    let key = VoxelKey {
                        x: center.x + dx,
                        y: center.y + dy,
                        z: center.z + dz,
                    };
                    if let Some(points) = self.voxels.get(&key) {
                        for p in points {
                            candidates.push(((p - query).norm_squared(), *p));
                        }
                    }
                }
            }
        }
        // Cube enumeration and intra-voxel order are fixed, so a stable sort
        // on distance keeps the result deterministic across runs.
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));
        candidates.truncate(k_req);
        candidates.into_iter().map(|(_, p)| p).collect()
    }

    /// Iterate all stored points.
    pub fn points(&self) -> impl Iterator<Item = &Vector3<f64>> {
        self.voxels.values().flatten()
    }

    /// Iterate voxels with their stored points.
    pub fn voxels(&self) -> impl Iterator<Item = (&VoxelKey, &[Vector3<f64>])> {
        self.voxels.iter().map(|(k, v)| (k, v.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn test_map() -> VoxelMap {
        VoxelMap::new(VoxelMapConfig {
            voxel_size: 1.0,
            max_points_per_voxel: 4,
            min_distance_points: 0.1,
        })
    }

    #[test]
    fn test_add_respects_voxel_capacity() {
        let mut map = test_map();
        // Seven well-spaced candidates inside one voxel, capacity four.
        for i in 0..7 {
            map.add_point(&Vector3::new(0.04 + 0.15 * i as f64, 0.5, 0.5));
        }
        assert_eq!(map.num_voxels(), 1);
        assert_eq!(map.len(), 4);
        for (_, points) in map.voxels() {
            assert!(points.len() <= 4);
        }
    }

    #[test]
    fn test_add_respects_min_distance() {
        let mut map = test_map();
        assert!(map.add_point(&Vector3::new(0.5, 0.5, 0.5)));
        // Too close to the stored point.
        assert!(!map.add_point(&Vector3::new(0.55, 0.5, 0.5)));
        // Far enough inside the same voxel.
        assert!(map.add_point(&Vector3::new(0.8, 0.5, 0.5)));

        for (_, points) in map.voxels() {
            for (i, a) in points.iter().enumerate() {
                for b in &points[i + 1..] {
                    assert!((a - b).norm() >= 0.1);
                }
            }
        }
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut map = test_map();
        let p = Vector3::new(1.5, 2.5, 3.5);
        assert!(map.add_point(&p));
        let before = map.len();
        assert!(!map.add_point(&p));
        assert_eq!(map.len(), before);
    }

    #[test]
    fn test_remove_culls_distant_voxels() {
        let mut map = test_map();
        map.add_point(&Vector3::new(0.5, 0.0, 0.0));
        map.add_point(&Vector3::new(30.5, 0.0, 0.0));
        map.remove(&Vector3::zeros(), 10.0);
        assert_eq!(map.num_voxels(), 1);
        assert_eq!(map.len(), 1);
        let remaining: Vec<_> = map.points().collect();
        assert_relative_eq!(remaining[0].x, 0.5);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut map = test_map();
        for x in 0..20 {
            map.add_point(&Vector3::new(x as f64 + 0.5, 0.0, 0.0));
        }
        map.remove(&Vector3::zeros(), 10.0);
        let after_first = map.len();
        map.remove(&Vector3::zeros(), 10.0);
        assert_eq!(map.len(), after_first);
    }

    #[test]
    fn test_search_neighbors_empty_map() {
        let map = test_map();
        assert!(map.search_neighbors(&Vector3::zeros(), 2, 10).is_empty());
    }

    #[test]
    fn test_search_neighbors_sorted_by_distance() {
        let mut map = test_map();
        map.add_point(&Vector3::new(0.9, 0.0, 0.0));
        map.add_point(&Vector3::new(0.2, 0.0, 0.0));
        map.add_point(&Vector3::new(-0.6, 0.0, 0.0));

        let neighbors = map.search_neighbors(&Vector3::zeros(), 1, 3);
        assert_eq!(neighbors.len(), 3);
        assert_relative_eq!(neighbors[0].x, 0.2);
        assert_relative_eq!(neighbors[1].x, -0.6);
        assert_relative_eq!(neighbors[2].x, 0.9);
    }

    #[test]
    fn test_search_neighbors_respects_cube_radius() {
        let mut map = test_map();
        map.add_point(&Vector3::new(0.5, 0.0, 0.0));
        map.add_point(&Vector3::new(5.5, 0.0, 0.0));

        // One-voxel cube around the origin cannot see the far point.
        let near = map.search_neighbors(&Vector3::zeros(), 1, 10);
        assert_eq!(near.len(), 1);

        let wide = map.search_neighbors(&Vector3::zeros(), 5, 10);
        assert_eq!(wide.len(), 2);
    }

    #[test]
    fn test_search_neighbors_truncates_to_k() {
        let mut map = test_map();
        for x in 0..4 {
            for y in 0..4 {
                map.add_point(&Vector3::new(0.125 + x as f64 * 0.25, 0.125 + y as f64 * 0.25, 0.0));
            }
        }
        let neighbors = map.search_neighbors(&Vector3::new(0.5, 0.5, 0.0), 1, 5);
        assert_eq!(neighbors.len(), 5);
        // Distances are non-decreasing.
        let dists: Vec<f64> = neighbors
            .iter()
            .map(|p| (p - Vector3::new(0.5, 0.5, 0.0)).norm())
            .collect();
        for pair in dists.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }
}

//! Marker map and pose log shared between the tracking call path and the
//! background bundle adjustment.
//!
//! Both are index-stable arenas behind their own lock. Readers get copies,
//! writers replace entries in place; no reference ever escapes a guard, and
//! no code path holds both locks at once.

use nalgebra::{Isometry3, Point2, Point3};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type MarkerId = u32;

/// Four image corners of one detected marker, in the order of [`marker_grid`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerObservation {
    pub id: MarkerId,
    pub corners: [Point2<f64>; 4],
}

/// Corners of a square marker of side `size` in its own frame.
pub fn marker_grid(size: f64) -> [Point3<f64>; 4] {
    let s = size / 2.0;
    [
        Point3::new(-s, s, 0.0),
        Point3::new(s, s, 0.0),
        Point3::new(s, -s, 0.0),
        Point3::new(-s, -s, 0.0),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub id: MarkerId,
    /// Marker-to-world transform; the reference marker is the identity.
    pub pose: Isometry3<f64>,
}

impl Marker {
    /// World coordinates of the marker corners.
    pub fn corners(&self, grid: &[Point3<f64>; 4]) -> [Point3<f64>; 4] {
        grid.map(|g| self.pose * g)
    }
}

/// A logged camera pose with the observations it was computed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseRecord {
    /// World-to-camera transform.
    pub pose: Isometry3<f64>,
    pub observations: Vec<MarkerObservation>,
}

#[derive(Debug, Default)]
struct MarkerArena {
    markers: Vec<Marker>,
    index: HashMap<MarkerId, usize>,
}

/// Markers discovered so far, keyed by id. The first marker inserted is
/// the reference and is never moved.
#[derive(Debug, Default)]
pub struct MarkerMap {
    inner: Mutex<MarkerArena>,
}

impl MarkerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().markers.is_empty()
    }

    pub fn contains(&self, id: MarkerId) -> bool {
        self.inner.lock().index.contains_key(&id)
    }

    pub fn get(&self, id: MarkerId) -> Option<Marker> {
        let arena = self.inner.lock();
        arena.index.get(&id).map(|&i| arena.markers[i])
    }

    /// Id of the marker fixed at the origin.
    pub fn reference(&self) -> Option<MarkerId> {
        self.inner.lock().markers.first().map(|m| m.id)
    }

    /// Inserts a new marker. Returns `false` if the id is already mapped.
    pub fn insert(&self, marker: Marker) -> bool {
        let mut arena = self.inner.lock();
        if arena.index.contains_key(&marker.id) {
            return false;
        }
        let slot = arena.markers.len();
        arena.index.insert(marker.id, slot);
        arena.markers.push(marker);
        true
    }

    pub fn snapshot(&self) -> Vec<Marker> {
        self.inner.lock().markers.clone()
    }

    /// Writes back optimized poses. Unknown ids and the reference are skipped.
    pub fn update(&self, markers: &[Marker]) {
        let mut arena = self.inner.lock();
        let reference = arena.markers.first().map(|m| m.id);
        for marker in markers {
            if Some(marker.id) == reference {
                continue;
            }
            if let Some(&i) = arena.index.get(&marker.id) {
                arena.markers[i].pose = marker.pose;
            }
        }
    }
}

/// Append-only log of novel camera poses.
#[derive(Debug, Default)]
pub struct PoseLog {
    inner: Mutex<Vec<PoseRecord>>,
}

impl PoseLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record and returns the new length.
    pub fn push(&self, record: PoseRecord) -> usize {
        let mut poses = self.inner.lock();
        poses.push(record);
        poses.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn last(&self) -> Option<PoseRecord> {
        self.inner.lock().last().cloned()
    }

    pub fn snapshot(&self) -> Vec<PoseRecord> {
        self.inner.lock().clone()
    }

    /// Replaces the poses of the first `poses.len()` records.
    ///
    /// Records appended after the snapshot the poses were computed from keep
    /// their own estimate.
    pub fn update_poses(&self, poses: &[Isometry3<f64>]) {
        let mut records = self.inner.lock();
        for (record, pose) in records.iter_mut().zip(poses) {
            record.pose = *pose;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Translation3, UnitQuaternion};

    fn marker(id: MarkerId, x: f64) -> Marker {
        Marker {
            id,
            pose: Isometry3::from_parts(Translation3::new(x, 0.0, 0.0), UnitQuaternion::identity()),
        }
    }

    #[test]
    fn test_marker_grid_is_square() {
        let grid = marker_grid(4.6);
        assert_eq!(grid[0], Point3::new(-2.3, 2.3, 0.0));
        assert_eq!(grid[2], Point3::new(2.3, -2.3, 0.0));
        assert!(((grid[1] - grid[0]).norm() - 4.6).abs() < 1e-12);
    }

    #[test]
    fn test_map_insert_and_lookup() {
        let map = MarkerMap::new();
        assert!(map.is_empty());
        assert!(map.reference().is_none());
        assert!(map.insert(marker(7, 0.0)));
        assert!(map.insert(marker(3, 10.0)));
        assert!(!map.insert(marker(3, 20.0)));
        assert_eq!(map.len(), 2);
        assert_eq!(map.reference(), Some(7));
        assert_eq!(map.get(3).unwrap().pose.translation.x, 10.0);
        assert!(map.get(4).is_none());
    }

    #[test]
    fn test_update_never_moves_reference() {
        let map = MarkerMap::new();
        map.insert(marker(1, 0.0));
        map.insert(marker(2, 5.0));
        map.update(&[marker(1, 3.0), marker(2, 6.0), marker(9, 1.0)]);
        assert_eq!(map.get(1).unwrap().pose, Isometry3::identity());
        assert_eq!(map.get(2).unwrap().pose.translation.x, 6.0);
        assert!(!map.contains(9));
    }

    #[test]
    fn test_pose_log_update_keeps_newer_records() {
        let log = PoseLog::new();
        let record = PoseRecord {
            pose: Isometry3::identity(),
            observations: vec![],
        };
        log.push(record.clone());
        let snapshot = log.snapshot();
        assert_eq!(log.push(record), 2);

        let moved = Isometry3::translation(1.0, 2.0, 3.0);
        log.update_poses(&vec![moved; snapshot.len()]);
        let records = log.snapshot();
        assert_eq!(records[0].pose, moved);
        assert_eq!(records[1].pose, Isometry3::identity());
    }
}

//! Tracking against a growing map of square fiducial markers.
//!
//! The first marker ever detected fixes the world frame. Every tracked frame
//! solves the camera pose from the markers already mapped, places any new
//! marker relative to that pose, and logs the pose for the background
//! bundle adjustment when it adds information.

use super::bundle::{refine_marker, BundleAdjuster, SharedMap};
use super::map::{marker_grid, Marker, MarkerMap, MarkerObservation, PoseLog, PoseRecord};
use super::{CameraFrame, FrameTracker, TrackingError, TrackingResult};
use crate::camera::{CameraModel, RadTanModel};
use crate::config::TrackerConfig;
use crate::geometry::pnp::{solve_p3p, solve_pnp_ransac};
use crate::geometry::{angle, GeometryError};
use log::{debug, info, warn};
use nalgebra::{Isometry3, Point2, Point3, Vector2};
use std::sync::Arc;

/// Finds markers and their four corners in a frame.
///
/// Corners must follow the order of [`marker_grid`]. Implementations wrap an
/// actual fiducial detector; the tracker only needs ids and corner pixels.
pub trait MarkerDetector {
    fn detect(&mut self, frame: &CameraFrame) -> Vec<MarkerObservation>;
}

pub struct MarkerTracker<D> {
    detector: D,
    camera: RadTanModel,
    shared: Arc<SharedMap>,
    adjuster: BundleAdjuster,
}

impl<D: MarkerDetector> MarkerTracker<D> {
    /// Creates a tracker and starts its bundle-adjustment thread.
    pub fn new(detector: D, camera: RadTanModel, config: TrackerConfig) -> Result<Self, TrackingError> {
        camera.validate_params()?;
        if config.marker_size <= 0.0 {
            return Err(TrackingError::InvalidParams("marker size must be positive".to_string()));
        }

        let shared = Arc::new(SharedMap {
            markers: MarkerMap::new(),
            poses: PoseLog::new(),
            grid: marker_grid(config.marker_size),
            k: camera.intrinsics.matrix(),
            config,
        });
        let adjuster = BundleAdjuster::spawn(shared.clone());
        Ok(Self {
            detector,
            camera,
            shared,
            adjuster,
        })
    }

    pub fn markers(&self) -> &MarkerMap {
        &self.shared.markers
    }

    pub fn poses(&self) -> &PoseLog {
        &self.shared.poses
    }

    /// Number of completed background passes.
    pub fn bundle_adjust_passes(&self) -> usize {
        self.adjuster.passes()
    }

    /// Runs one bundle-adjustment pass on the calling thread.
    pub fn bundle_adjust(&self) -> Result<usize, GeometryError> {
        self.shared.adjust()
    }

    /// Removes lens distortion from the detected corners. Detections with a
    /// corner that cannot be undistorted are dropped.
    fn undistort(&self, detections: Vec<MarkerObservation>) -> Vec<MarkerObservation> {
        detections
            .into_iter()
            .filter_map(|detection| {
                let mut corners = detection.corners;
                for corner in corners.iter_mut() {
                    match self.camera.undistort_pixel(&Vector2::new(corner.x, corner.y)) {
                        Ok(p) => *corner = Point2::new(p.x, p.y),
                        Err(e) => {
                            debug!("dropping marker {}: {e}", detection.id);
                            return None;
                        }
                    }
                }
                Some(MarkerObservation {
                    id: detection.id,
                    corners,
                })
            })
            .collect()
    }

    /// Camera pose from the mapped markers, with the observations that agree with it.
    fn solve_camera(
        &self,
        known: &[(MarkerObservation, Marker)],
    ) -> Result<(Isometry3<f64>, Vec<MarkerObservation>), GeometryError> {
        let grid = &self.shared.grid;
        let k = &self.shared.k;
        let config = &self.shared.config;

        let mut world: Vec<Point3<f64>> = Vec::with_capacity(known.len() * 4);
        let mut image: Vec<Point2<f64>> = Vec::with_capacity(known.len() * 4);
        for (observation, marker) in known {
            world.extend(marker.corners(grid));
            image.extend(observation.corners);
        }

        if known.len() == 1 {
            let pose = solve_p3p(&world, &image, k)?;
            return Ok((pose, vec![known[0].0.clone()]));
        }

        let solution = solve_pnp_ransac(
            &world,
            &image,
            k,
            config.pnp_ransac_iterations,
            config.pnp_reprojection_threshold,
        )?;
        // a marker supports the pose if at least three of its corners do
        let inliers = known
            .iter()
            .zip(solution.inliers.chunks(4))
            .filter(|(_, mask)| mask.iter().filter(|&&inlier| inlier).count() >= 3)
            .map(|((observation, _), _)| observation.clone())
            .collect();
        Ok((solution.pose, inliers))
    }

    /// Places a marker seen for the first time in the world frame.
    fn place_marker(&self, camera: &Isometry3<f64>, observation: &MarkerObservation) -> Result<Marker, GeometryError> {
        let grid = &self.shared.grid;
        let k = &self.shared.k;
        let marker_to_camera = solve_p3p(grid, &observation.corners, k)?;
        let marker = Marker {
            id: observation.id,
            pose: camera.inverse() * marker_to_camera,
        };
        match refine_marker(
            &marker,
            camera,
            observation,
            grid,
            k,
            self.shared.config.local_refine_iterations,
        ) {
            Ok(refined) => Ok(refined),
            Err(e) => {
                debug!("keeping unrefined pose of marker {}: {e}", marker.id);
                Ok(marker)
            }
        }
    }

    /// True if the pose differs enough from the last logged one.
    fn is_novel(&self, pose: &Isometry3<f64>) -> bool {
        let Some(last) = self.shared.poses.last() else {
            return true;
        };
        let config = &self.shared.config;
        let moved = (pose.inverse().translation.vector - last.pose.inverse().translation.vector).norm();
        let turned = angle(&(last.pose.rotation.inverse() * pose.rotation)).abs();
        moved > config.novelty_distance || turned > config.novelty_angle_deg.to_radians()
    }

    fn track(&mut self, frame: &CameraFrame) -> TrackingResult {
        let detections = self.detector.detect(frame);
        let detections = self.undistort(detections);
        let Some(first) = detections.first() else {
            return TrackingResult::NotTracked;
        };

        let markers = &self.shared.markers;
        if markers.is_empty() {
            markers.insert(Marker {
                id: first.id,
                pose: Isometry3::identity(),
            });
            info!("marker {} fixed as the world origin", first.id);
        }

        let (known, unknown): (Vec<_>, Vec<_>) = detections
            .into_iter()
            .map(|observation| {
                let marker = markers.get(observation.id);
                (observation, marker)
            })
            .partition(|(_, marker)| marker.is_some());
        let known: Vec<(MarkerObservation, Marker)> =
            known.into_iter().filter_map(|(o, m)| m.map(|m| (o, m))).collect();
        if known.is_empty() {
            debug!("no mapped marker in view");
            return TrackingResult::NotTracked;
        }

        let (pose, mut observations) = match self.solve_camera(&known) {
            Ok(solution) => solution,
            Err(e) => {
                debug!("camera pose failed: {e}");
                return TrackingResult::NotTracked;
            }
        };

        let mut inserted = false;
        for (observation, _) in unknown {
            match self.place_marker(&pose, &observation) {
                Ok(marker) => {
                    if markers.insert(marker) {
                        info!("inserted marker {} at {}", marker.id, marker.pose.translation.vector);
                        inserted = true;
                        observations.push(observation);
                    }
                }
                Err(e) => warn!("cannot place marker {}: {e}", observation.id),
            }
        }

        if inserted || self.is_novel(&pose) {
            let n = self.shared.poses.push(PoseRecord { pose, observations });
            debug!("logged pose {n}");
            self.adjuster.notify();
        }
        TrackingResult::Tracked { pose }
    }
}

impl<D: MarkerDetector> FrameTracker for MarkerTracker<D> {
    fn track_frame(&mut self, frame: &CameraFrame, _dt: f64) -> TrackingResult {
        self.track(frame)
    }
}

impl<D> std::fmt::Debug for MarkerTracker<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkerTracker")
            .field("camera", &self.camera)
            .field("markers", &self.shared.markers.len())
            .field("poses", &self.shared.poses.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Intrinsics, Resolution};
    use crate::geometry::pnp::project;
    use crate::tracking::Tracker;
    use image::GrayImage;
    use nalgebra::{Translation3, UnitQuaternion};
    use std::thread;
    use std::time::Duration;

    fn camera() -> RadTanModel {
        let intrinsics = Intrinsics {
            fx: 800.0,
            fy: 800.0,
            cx: 320.0,
            cy: 240.0,
        };
        let resolution = Resolution {
            width: 640,
            height: 480,
        };
        RadTanModel::new(intrinsics, resolution, [0.0; 5]).unwrap()
    }

    /// Projects a fixed set of world markers through a scripted camera path.
    struct SyntheticDetector {
        markers: Vec<Marker>,
        path: Vec<Isometry3<f64>>,
        frame: usize,
    }

    impl MarkerDetector for SyntheticDetector {
        fn detect(&mut self, _frame: &CameraFrame) -> Vec<MarkerObservation> {
            let pose = self.path[self.frame.min(self.path.len() - 1)];
            self.frame += 1;
            let k = camera().intrinsics.matrix();
            let grid = marker_grid(4.6);
            self.markers
                .iter()
                .map(|m| MarkerObservation {
                    id: m.id,
                    corners: m.corners(&grid).map(|c| project(&k, &pose, &c).unwrap()),
                })
                .collect()
        }
    }

    fn frame() -> CameraFrame {
        CameraFrame::new(GrayImage::new(16, 16), 0.0)
    }

    fn view() -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::new(1.0, -0.5, 40.0),
            UnitQuaternion::from_euler_angles(0.15, -0.1, 0.05),
        )
    }

    #[test]
    fn test_static_marker_keeps_reference_fixed() {
        let detector = SyntheticDetector {
            markers: vec![Marker {
                id: 7,
                pose: Isometry3::identity(),
            }],
            path: vec![view()],
            frame: 0,
        };
        let marker_tracker = MarkerTracker::new(detector, camera(), TrackerConfig::default()).unwrap();
        let mut tracker = Tracker::new(marker_tracker, TrackerConfig::default()).unwrap();

        let dt = 1.0 / 30.0;
        assert!(tracker.track_frame(&frame(), dt));
        assert!(tracker.track_frame(&frame(), dt));
        let first_trace = tracker.position_filter().covariance_trace();
        for _ in 2..50 {
            assert!(tracker.track_frame(&frame(), dt));
        }

        let markers = tracker.frame_tracker().markers();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers.get(7).unwrap().pose, Isometry3::identity());
        assert_eq!(tracker.frame_tracker().poses().len(), 1);
        assert_eq!(tracker.relative_pose_count(), 50);
        assert!(tracker.position_filter().covariance_trace() < first_trace);

        let logged = tracker.frame_tracker().poses().last().unwrap().pose;
        assert!((logged.translation.vector - view().translation.vector).norm() < 1e-3);
    }

    #[test]
    fn test_unknown_markers_only_are_not_tracked() {
        let detector = SyntheticDetector {
            markers: vec![Marker {
                id: 1,
                pose: Isometry3::identity(),
            }],
            path: vec![view()],
            frame: 0,
        };
        let mut tracker = MarkerTracker::new(detector, camera(), TrackerConfig::default()).unwrap();
        assert!(tracker.track_frame(&frame(), 0.0).is_tracked());

        // a detector that only ever reports an unmapped id
        tracker.detector.markers = vec![Marker {
            id: 2,
            pose: Isometry3::translation(10.0, 0.0, 0.0),
        }];
        assert_eq!(tracker.track_frame(&frame(), 0.0), TrackingResult::NotTracked);
        assert!(!tracker.markers().contains(2));
    }

    #[test]
    fn test_new_marker_is_placed_in_world_frame() {
        let second = Marker {
            id: 3,
            pose: Isometry3::from_parts(
                Translation3::new(10.0, 2.0, 0.0),
                UnitQuaternion::from_euler_angles(0.0, 0.0, 0.4),
            ),
        };
        let path = vec![
            view(),
            view(),
            Isometry3::from_parts(Translation3::new(-3.0, 0.0, 45.0), UnitQuaternion::from_euler_angles(0.2, 0.1, 0.0)),
        ];
        let detector = SyntheticDetector {
            markers: vec![
                Marker {
                    id: 1,
                    pose: Isometry3::identity(),
                },
                second,
            ],
            path,
            frame: 0,
        };
        let mut tracker = MarkerTracker::new(detector, camera(), TrackerConfig::default()).unwrap();
        for _ in 0..3 {
            assert!(tracker.track_frame(&frame(), 0.0).is_tracked());
        }

        assert_eq!(tracker.markers().reference(), Some(1));
        let placed = tracker.markers().get(3).unwrap();
        let error = (placed.pose.translation.vector - second.pose.translation.vector).norm();
        assert!(error < 0.1, "marker error {error}");
        // first frame inserts, second is a repeat, third moved
        assert_eq!(tracker.poses().len(), 2);

        tracker.bundle_adjust().unwrap();
        let adjusted = tracker.markers().get(3).unwrap();
        assert!((adjusted.pose.translation.vector - second.pose.translation.vector).norm() < 0.1);
        assert_eq!(tracker.markers().get(1).unwrap().pose, Isometry3::identity());
    }

    #[test]
    fn test_background_adjustment_runs() {
        let detector = SyntheticDetector {
            markers: vec![Marker {
                id: 4,
                pose: Isometry3::identity(),
            }],
            path: vec![view()],
            frame: 0,
        };
        let mut tracker = MarkerTracker::new(detector, camera(), TrackerConfig::default()).unwrap();
        assert!(tracker.track_frame(&frame(), 0.0).is_tracked());

        let mut waited = 0;
        while tracker.bundle_adjust_passes() == 0 && waited < 500 {
            thread::sleep(Duration::from_millis(10));
            waited += 1;
        }
        assert!(tracker.bundle_adjust_passes() >= 1);
    }
}

//! Camera tracking with visual-inertial fusion.
//!
//! A [`FrameTracker`] turns one camera frame into a world-to-camera pose
//! (or nothing). [`Tracker`] wraps any frame tracker and fuses its output
//! with the inertial sensors through the orientation and position Kalman
//! filters:
//!
//! * visual poses live in the frame of the reference marker (or pattern),
//!   inertial ones in the gravity-aligned frame of the device. The offset
//!   between the two is estimated as the average of the last few
//!   `q_visual⁻¹ · q_filter` rotations;
//! * accelerometer readings are rotated into the world frame with the
//!   filter orientation and scaled by gravity before being fused.

pub mod bundle;
pub mod calib;
pub mod map;
pub mod marker;

pub use bundle::{bundle_adjust, refine_marker, BundleAdjuster, SharedMap};
pub use calib::{CalibTracker, PatternDetector};
pub use map::{marker_grid, Marker, MarkerId, MarkerMap, MarkerObservation, PoseLog, PoseRecord};
pub use marker::{MarkerDetector, MarkerTracker};

use crate::camera::CameraModelError;
use crate::config::TrackerConfig;
use crate::ekf::{EkfOrientation, EkfPosition};
use crate::geometry::quaternion_average;
use image::GrayImage;
use log::warn;
use nalgebra::{Isometry3, UnitQuaternion, Vector3};
use std::collections::VecDeque;

#[derive(thiserror::Error, Debug)]
pub enum TrackingError {
    #[error("Invalid camera: {0}")]
    Camera(#[from] CameraModelError),
    #[error("Invalid tracker parameters: {0}")]
    InvalidParams(String),
}

/// A grayscale frame handed to the trackers.
#[derive(Debug, Clone)]
pub struct CameraFrame {
    pub image: GrayImage,
    /// Capture time in seconds.
    pub timestamp: f64,
}

impl CameraFrame {
    pub fn new(image: GrayImage, timestamp: f64) -> Self {
        Self { image, timestamp }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrackingResult {
    NotTracked,
    /// World-to-camera transform, `x_c = R x_w + t`.
    Tracked { pose: Isometry3<f64> },
}

impl TrackingResult {
    pub fn is_tracked(&self) -> bool {
        matches!(self, TrackingResult::Tracked { .. })
    }

    pub fn pose(&self) -> Option<Isometry3<f64>> {
        match self {
            TrackingResult::Tracked { pose } => Some(*pose),
            TrackingResult::NotTracked => None,
        }
    }
}

/// Anything that can locate the camera from a single frame.
pub trait FrameTracker {
    fn track_frame(&mut self, frame: &CameraFrame, dt: f64) -> TrackingResult;
}

/// Sensor fusion around a [`FrameTracker`].
#[derive(Debug)]
pub struct Tracker<F> {
    frame_tracker: F,
    orientation: EkfOrientation,
    position: EkfPosition,
    relative_poses: VecDeque<UnitQuaternion<f64>>,
    config: TrackerConfig,
}

impl<F: FrameTracker> Tracker<F> {
    pub fn new(frame_tracker: F, config: TrackerConfig) -> Result<Self, TrackingError> {
        if config.relative_poses == 0 {
            return Err(TrackingError::InvalidParams(
                "the relative pose buffer needs at least one slot".to_string(),
            ));
        }
        Ok(Self {
            frame_tracker,
            orientation: EkfOrientation::new(),
            position: EkfPosition::new(),
            relative_poses: VecDeque::with_capacity(config.relative_poses),
            config,
        })
    }

    /// Tracks one frame and fuses the visual pose. Returns whether the frame
    /// was tracked; untracked frames leave the filters untouched.
    pub fn track_frame(&mut self, frame: &CameraFrame, dt: f64) -> bool {
        let r = self.orientation.orientation();
        let TrackingResult::Tracked { pose } = self.frame_tracker.track_frame(frame, dt) else {
            return false;
        };
        let q = pose.rotation;

        let relative: Vec<_> = self.relative_poses.iter().copied().collect();
        if let Some(offset) = quaternion_average(&relative) {
            if let Err(e) = self.orientation.update_marker(&(q * offset), dt) {
                warn!("orientation filter rejected marker update: {e}");
            }
            let centre = pose.inverse().translation.vector;
            if let Err(e) = self.position.update_marker(&(offset.inverse() * centre), dt) {
                warn!("position filter rejected marker update: {e}");
            }
        }

        if self.relative_poses.len() >= self.config.relative_poses {
            self.relative_poses.pop_front();
        }
        self.relative_poses.push_back(q.inverse() * r);
        true
    }

    /// Fuses a gyroscope attitude `q`, an accelerometer reading `a` (in g)
    /// and the angular velocity `w`.
    pub fn track_sensor(&mut self, q: &UnitQuaternion<f64>, a: &Vector3<f64>, w: &Vector3<f64>, dt: f64) -> bool {
        let r = self.orientation.orientation();
        if let Err(e) = self.orientation.update_imu(q, w, dt) {
            warn!("orientation filter rejected IMU update: {e}");
        }
        let world = r.inverse() * a * self.config.gravity;
        if let Err(e) = self.position.update_imu(&world, dt) {
            warn!("position filter rejected IMU update: {e}");
        }
        true
    }

    pub fn position(&self) -> Vector3<f64> {
        self.position.position()
    }

    pub fn orientation(&self) -> UnitQuaternion<f64> {
        self.orientation.orientation()
    }

    pub fn frame_tracker(&self) -> &F {
        &self.frame_tracker
    }

    pub fn orientation_filter(&self) -> &EkfOrientation {
        &self.orientation
    }

    pub fn position_filter(&self) -> &EkfPosition {
        &self.position
    }

    /// Number of buffered marker-to-world offsets.
    pub fn relative_pose_count(&self) -> usize {
        self.relative_poses.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Translation3;

    /// Replays a fixed list of results.
    struct Scripted {
        results: Vec<TrackingResult>,
        next: usize,
    }

    impl FrameTracker for Scripted {
        fn track_frame(&mut self, _frame: &CameraFrame, _dt: f64) -> TrackingResult {
            let result = self.results.get(self.next).copied().unwrap_or(TrackingResult::NotTracked);
            self.next += 1;
            result
        }
    }

    fn frame() -> CameraFrame {
        CameraFrame::new(GrayImage::new(8, 8), 0.0)
    }

    fn pose() -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::new(1.0, -2.0, 40.0),
            UnitQuaternion::from_euler_angles(0.2, -0.1, 0.3),
        )
    }

    #[test]
    fn test_untracked_frame_leaves_filters_alone() {
        let scripted = Scripted {
            results: vec![TrackingResult::NotTracked],
            next: 0,
        };
        let mut tracker = Tracker::new(scripted, TrackerConfig::default()).unwrap();
        let before = tracker.position_filter().covariance_trace();
        assert!(!tracker.track_frame(&frame(), 0.1));
        assert_eq!(tracker.relative_pose_count(), 0);
        assert_eq!(tracker.position_filter().covariance_trace(), before);
    }

    #[test]
    fn test_relative_pose_buffer_is_bounded() {
        let config = TrackerConfig {
            relative_poses: 5,
            ..TrackerConfig::default()
        };
        let scripted = Scripted {
            results: vec![TrackingResult::Tracked { pose: pose() }; 12],
            next: 0,
        };
        let mut tracker = Tracker::new(scripted, config).unwrap();
        for _ in 0..12 {
            assert!(tracker.track_frame(&frame(), 1.0 / 30.0));
        }
        assert_eq!(tracker.relative_pose_count(), 5);
    }

    #[test]
    fn test_first_frame_only_seeds_the_offset() {
        let scripted = Scripted {
            results: vec![TrackingResult::Tracked { pose: pose() }],
            next: 0,
        };
        let mut tracker = Tracker::new(scripted, TrackerConfig::default()).unwrap();
        let before = tracker.position_filter().covariance_trace();
        assert!(tracker.track_frame(&frame(), 0.1));
        assert_eq!(tracker.relative_pose_count(), 1);
        assert_eq!(tracker.position_filter().covariance_trace(), before);
    }

    #[test]
    fn test_constant_pose_settles_position() {
        let scripted = Scripted {
            results: vec![TrackingResult::Tracked { pose: pose() }; 40],
            next: 0,
        };
        let mut tracker = Tracker::new(scripted, TrackerConfig::default()).unwrap();
        let r0 = tracker.orientation();
        for _ in 0..40 {
            tracker.track_frame(&frame(), 1.0 / 30.0);
        }
        // the filter keeps its initial attitude, so the offset stays q⁻¹ r0
        let offset = pose().rotation.inverse() * r0;
        let expected = offset.inverse() * pose().inverse().translation.vector;
        assert!((tracker.position() - expected).norm() < 1.0, "{}", tracker.position());
    }

    #[test]
    fn test_sensor_updates_are_accepted() {
        let scripted = Scripted {
            results: vec![],
            next: 0,
        };
        let mut tracker = Tracker::new(scripted, TrackerConfig::default()).unwrap();
        let q = UnitQuaternion::from_euler_angles(0.0, 0.0, 0.4);
        for _ in 0..30 {
            assert!(tracker.track_sensor(&q, &Vector3::zeros(), &Vector3::zeros(), 0.01));
        }
        assert!(tracker.orientation().angle_to(&q) < 0.1);
        assert!(tracker.position().norm() < 1e-9);
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let config = TrackerConfig {
            relative_poses: 0,
            ..TrackerConfig::default()
        };
        let scripted = Scripted {
            results: vec![],
            next: 0,
        };
        assert!(matches!(Tracker::new(scripted, config), Err(TrackingError::InvalidParams(_))));
    }
}

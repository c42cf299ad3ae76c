//! Single-shot tracking against an asymmetric circle grid.

use super::{CameraFrame, FrameTracker, TrackingError, TrackingResult};
use crate::camera::{CameraModel, RadTanModel};
use crate::geometry::pnp::epnp;
use log::debug;
use nalgebra::{Point2, Point3, Vector2};

/// Columns and rows of the circle grid.
pub const PATTERN_SIZE: (usize, usize) = (4, 11);
/// Distance between neighbouring circles, in world units.
pub const PATTERN_SPACING: f64 = 4.0;

/// Locates the circle centres of the calibration pattern, row by row in the
/// order of [`CalibTracker::grid`]. Returns `None` if the pattern is not
/// fully visible.
pub trait PatternDetector {
    fn detect(&mut self, frame: &CameraFrame) -> Option<Vec<Point2<f64>>>;
}

#[derive(Debug)]
pub struct CalibTracker<D> {
    detector: D,
    camera: RadTanModel,
    grid: Vec<Point3<f64>>,
}

/// Object points of the asymmetric grid; odd rows are shifted by half a step.
pub fn asymmetric_grid(columns: usize, rows: usize, spacing: f64) -> Vec<Point3<f64>> {
    (0..rows)
        .flat_map(|i| {
            (0..columns).map(move |j| Point3::new((2 * j + i % 2) as f64 * spacing, i as f64 * spacing, 0.0))
        })
        .collect()
}

impl<D: PatternDetector> CalibTracker<D> {
    pub fn new(detector: D, camera: RadTanModel) -> Result<Self, TrackingError> {
        camera.validate_params()?;
        Ok(Self {
            detector,
            camera,
            grid: asymmetric_grid(PATTERN_SIZE.0, PATTERN_SIZE.1, PATTERN_SPACING),
        })
    }

    pub fn grid(&self) -> &[Point3<f64>] {
        &self.grid
    }
}

impl<D: PatternDetector> FrameTracker for CalibTracker<D> {
    fn track_frame(&mut self, frame: &CameraFrame, _dt: f64) -> TrackingResult {
        let Some(centres) = self.detector.detect(frame) else {
            return TrackingResult::NotTracked;
        };
        if centres.len() != self.grid.len() {
            debug!("pattern has {} of {} circles", centres.len(), self.grid.len());
            return TrackingResult::NotTracked;
        }

        let mut image = Vec::with_capacity(centres.len());
        for c in &centres {
            match self.camera.undistort_pixel(&Vector2::new(c.x, c.y)) {
                Ok(p) => image.push(Point2::new(p.x, p.y)),
                Err(e) => {
                    debug!("cannot undistort circle centre: {e}");
                    return TrackingResult::NotTracked;
                }
            }
        }

        match epnp(&self.grid, &image, &self.camera.intrinsics.matrix()) {
            Ok(pose) => TrackingResult::Tracked { pose },
            Err(e) => {
                debug!("pattern pose failed: {e}");
                TrackingResult::NotTracked
            }
        }
    }
}

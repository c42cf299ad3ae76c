use super::{EkfError, EkfModel, KalmanFilter, MeasurementModel};
use crate::geometry::jet::Real;
use nalgebra::{SMatrix, SVector, Vector3};

/// State layout: `[px, py, pz, vx, vy, vz, ax, ay, az]`.
const STATE: usize = 9;

/// Constant-acceleration kinematics.
#[derive(Debug, Clone, Copy)]
struct KinematicModel;

impl EkfModel<STATE, STATE> for KinematicModel {
    fn transition<T: Real>(&self, x: &SVector<T, STATE>, w: &SVector<T, STATE>, dt: f64) -> SVector<T, STATE> {
        let dt = T::from_f64(dt);
        let half = T::from_f64(0.5);
        SVector::from_fn(|i, _| {
            let value = match i {
                0..=2 => x[i] + x[i + 3] * dt + x[i + 6] * dt * dt * half,
                3..=5 => x[i] + x[i + 3] * dt,
                _ => x[i],
            };
            value + w[i]
        })
    }
}

/// Observes the position block (markers) or the acceleration block (IMU).
struct Block(usize);

impl MeasurementModel<STATE, 3, 3> for Block {
    fn measure<T: Real>(&self, x: &SVector<T, STATE>, v: &SVector<T, 3>) -> SVector<T, 3> {
        SVector::from_fn(|i, _| x[self.0 + i] + v[i])
    }
}

const POSITION: Block = Block(0);
const ACCELERATION: Block = Block(6);

/// Kalman filter fusing marker positions with accelerometer readings.
#[derive(Debug, Clone)]
pub struct EkfPosition {
    filter: KalmanFilter<KinematicModel, STATE, STATE>,
    r_marker: SMatrix<f64, 3, 3>,
    r_imu: SMatrix<f64, 3, 3>,
}

impl Default for EkfPosition {
    fn default() -> Self {
        Self::new()
    }
}

impl EkfPosition {
    pub fn new() -> Self {
        let q = SVector::<f64, STATE>::from_column_slice(&[
            5e-2, 5e-2, 5e-2, 2e-1, 2e-1, 2e-1, 5e-2, 5e-2, 5e-2,
        ]);
        Self {
            filter: KalmanFilter::new(
                KinematicModel,
                SVector::zeros(),
                SMatrix::identity() * 10.0,
                SMatrix::from_diagonal(&q),
            ),
            r_marker: SMatrix::identity() * 5e-2,
            r_imu: SMatrix::identity() * 5e-2,
        }
    }

    /// Fuses a camera position obtained from markers.
    pub fn update_marker(&mut self, x: &Vector3<f64>, dt: f64) -> Result<(), EkfError> {
        self.filter.update(&POSITION, x, &self.r_marker, dt)
    }

    /// Fuses a world-frame acceleration.
    pub fn update_imu(&mut self, a: &Vector3<f64>, dt: f64) -> Result<(), EkfError> {
        self.filter.update(&ACCELERATION, a, &self.r_imu, dt)
    }

    pub fn position(&self) -> Vector3<f64> {
        self.filter.state().fixed_rows::<3>(0).into_owned()
    }

    pub fn velocity(&self) -> Vector3<f64> {
        self.filter.state().fixed_rows::<3>(3).into_owned()
    }

    pub fn covariance_trace(&self) -> f64 {
        self.filter.covariance().trace()
    }
}

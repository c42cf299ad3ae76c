use super::{EkfError, EkfModel, KalmanFilter, MeasurementModel};
use crate::geometry::jet::Real;
use nalgebra::{Quaternion, SMatrix, SVector, UnitQuaternion, Vector3};

/// Quaternions whose norm falls below this are not renormalized.
const MIN_NORM: f64 = 1e-6;

/// State layout: `[qx, qy, qz, qw, wx, wy, wz, ax, ay, az]`.
const STATE: usize = 10;

/// Reads the normalized quaternion `[x, y, z, w]` out of the state.
fn state_quaternion<T: Real>(x: &SVector<T, STATE>) -> [T; 4] {
    let q = [x[0], x[1], x[2], x[3]];
    let norm = (q[0] * q[0] + q[1] * q[1] + q[2] * q[2] + q[3] * q[3]).sqrt();
    if norm.value() > MIN_NORM {
        q.map(|c| c / norm)
    } else {
        q
    }
}

/// Integrates angular velocity and acceleration into the quaternion.
#[derive(Debug, Clone, Copy)]
struct RotationModel;

impl EkfModel<STATE, STATE> for RotationModel {
    fn transition<T: Real>(&self, x: &SVector<T, STATE>, w: &SVector<T, STATE>, dt: f64) -> SVector<T, STATE> {
        let [qx, qy, qz, qw] = state_quaternion(x);
        let dt = T::from_f64(dt);
        let half = T::from_f64(0.5);

        let mut next = *x;
        for i in 0..3 {
            let v = x[4 + i];
            let a = x[7 + i];
            next[4 + i] = v + a * dt;
        }
        let r = [0, 1, 2].map(|i| half * (x[4 + i] * dt + x[7 + i] * dt * dt / T::from_f64(2.0)));

        // (0, r) ⊗ q
        let [rx, ry, rz] = r;
        let dq = [
            rx * qw + ry * qz - rz * qy,
            -rx * qz + ry * qw + rz * qx,
            rx * qy - ry * qx + rz * qw,
            -rx * qx - ry * qy - rz * qz,
        ];
        for i in 0..4 {
            next[i] = x[i] + dq[i];
        }

        SVector::from_fn(|i, _| next[i] + w[i])
    }
}

/// Marker measurement: the normalized quaternion.
struct MarkerQuaternion;

impl MeasurementModel<STATE, 4, 4> for MarkerQuaternion {
    fn measure<T: Real>(&self, x: &SVector<T, STATE>, v: &SVector<T, 4>) -> SVector<T, 4> {
        let q = state_quaternion(x);
        SVector::from_fn(|i, _| q[i] + v[i])
    }
}

/// Inertial measurement: the normalized quaternion and the angular velocity.
struct ImuQuaternion;

impl MeasurementModel<STATE, 7, 7> for ImuQuaternion {
    fn measure<T: Real>(&self, x: &SVector<T, STATE>, v: &SVector<T, 7>) -> SVector<T, 7> {
        let q = state_quaternion(x);
        SVector::from_fn(|i, _| if i < 4 { q[i] + v[i] } else { x[i] + v[i] })
    }
}

/// Kalman filter fusing marker and gyroscope orientation measurements.
#[derive(Debug, Clone)]
pub struct EkfOrientation {
    filter: KalmanFilter<RotationModel, STATE, STATE>,
    r_marker: SMatrix<f64, 4, 4>,
    r_imu: SMatrix<f64, 7, 7>,
}

impl Default for EkfOrientation {
    fn default() -> Self {
        Self::new()
    }
}

impl EkfOrientation {
    pub fn new() -> Self {
        let q = SVector::<f64, STATE>::from_column_slice(&[
            5e-2, 5e-2, 5e-2, 5e-2, 1e-4, 1e-4, 1e-4, 1e-4, 1e-4, 1e-4,
        ]);
        let mut x = SVector::<f64, STATE>::zeros();
        x[1] = 1.0;
        Self {
            filter: KalmanFilter::new(
                RotationModel,
                x,
                SMatrix::identity() * 10.0,
                SMatrix::from_diagonal(&q),
            ),
            r_marker: SMatrix::identity() * 1e-2,
            r_imu: SMatrix::identity() * 1e-2,
        }
    }

    /// Flips `q` into the hemisphere of the current estimate; `q` and `-q`
    /// are the same rotation but not the same measurement.
    fn aligned(&self, q: &UnitQuaternion<f64>) -> [f64; 4] {
        let x = self.filter.state();
        let c = [q.i, q.j, q.k, q.w];
        let dot = c[0] * x[0] + c[1] * x[1] + c[2] * x[2] + c[3] * x[3];
        if dot < 0.0 {
            c.map(|v| -v)
        } else {
            c
        }
    }

    /// Fuses an orientation obtained from a marker.
    pub fn update_marker(&mut self, q: &UnitQuaternion<f64>, dt: f64) -> Result<(), EkfError> {
        let z = SVector::<f64, 4>::from(self.aligned(q));
        self.filter.update(&MarkerQuaternion, &z, &self.r_marker, dt)
    }

    /// Fuses a gyroscope attitude together with the angular velocity.
    pub fn update_imu(&mut self, q: &UnitQuaternion<f64>, w: &Vector3<f64>, dt: f64) -> Result<(), EkfError> {
        let c = self.aligned(q);
        let z = SVector::<f64, 7>::from_column_slice(&[c[0], c[1], c[2], c[3], w.x, w.y, w.z]);
        self.filter.update(&ImuQuaternion, &z, &self.r_imu, dt)
    }

    /// Returns the state quaternion, renormalized. A collapsed state
    /// quaternion reads as the identity.
    pub fn orientation(&self) -> UnitQuaternion<f64> {
        let x = self.filter.state();
        UnitQuaternion::try_new(Quaternion::new(x[3], x[0], x[1], x[2]), MIN_NORM)
            .unwrap_or_else(UnitQuaternion::identity)
    }

    pub fn covariance_trace(&self) -> f64 {
        self.filter.covariance().trace()
    }
}

//! Extended Kalman filter with automatically differentiated models.
//!
//! Process and measurement models are written once against the [`Real`]
//! trait. The filter evaluates them over [`Jet`]s to obtain the state
//! Jacobian and the noise Jacobian in the same pass as the predicted value,
//! so concrete filters never spell out a derivative by hand.
//!
//! Two filters are built on top of the engine:
//!
//! * [`EkfOrientation`]: quaternion, angular velocity and angular acceleration.
//! * [`EkfPosition`]: position, velocity and acceleration.

mod orientation;
mod position;

pub use orientation::EkfOrientation;
pub use position::EkfPosition;

use crate::geometry::jet::{unpack, Jet, Real};
use nalgebra::{SMatrix, SVector};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EkfError {
    /// The innovation covariance could not be inverted. The filter keeps the
    /// predicted state and covariance.
    #[error("Innovation covariance is singular")]
    SingularInnovation,
}

/// State transition `x' = f(x, w, dt)` with `N` states and `W` noise inputs.
pub trait EkfModel<const N: usize, const W: usize> {
    fn transition<T: Real>(&self, x: &SVector<T, N>, w: &SVector<T, W>, dt: f64) -> SVector<T, N>;
}

/// Measurement `z = h(x, v)` with `M` outputs and `V` noise inputs.
pub trait MeasurementModel<const N: usize, const M: usize, const V: usize> {
    fn measure<T: Real>(&self, x: &SVector<T, N>, v: &SVector<T, V>) -> SVector<T, M>;
}

fn constants<T: Real, const D: usize>(values: &SVector<f64, D>) -> SVector<T, D> {
    SVector::from_fn(|i, _| T::from_f64(values[i]))
}

/// Generic fixed-size extended Kalman filter.
#[derive(Debug, Clone)]
pub struct KalmanFilter<P, const N: usize, const W: usize> {
    process: P,
    x: SVector<f64, N>,
    p: SMatrix<f64, N, N>,
    q: SMatrix<f64, W, W>,
}

impl<P, const N: usize, const W: usize> KalmanFilter<P, N, W>
where
    P: EkfModel<N, W>,
{
    /// Creates a filter from its process model, initial state, initial
    /// covariance and process noise covariance.
    pub fn new(process: P, x: SVector<f64, N>, p: SMatrix<f64, N, N>, q: SMatrix<f64, W, W>) -> Self {
        Self { process, x, p, q }
    }

    pub fn state(&self) -> &SVector<f64, N> {
        &self.x
    }

    pub fn covariance(&self) -> &SMatrix<f64, N, N> {
        &self.p
    }

    /// Overwrites the state, leaving the covariance untouched.
    pub fn set_state(&mut self, x: SVector<f64, N>) {
        self.x = x;
    }

    /// Propagates the state and covariance through the process model.
    ///
    /// Returns `(x⁻, P⁻)` with `P⁻ = F P Fᵀ + W_f Q W_fᵀ`.
    pub fn predict(&self, dt: f64) -> (SVector<f64, N>, SMatrix<f64, N, N>) {
        // d f / d x, evaluated with zero process noise.
        let xj = Jet::<N>::seed(&self.x, 0);
        let wj: SVector<Jet<N>, W> = constants(&SVector::zeros());
        let (x_pred, f) = unpack(&self.process.transition(&xj, &wj, dt));

        // d f / d w
        let xc: SVector<Jet<W>, N> = constants(&self.x);
        let wv = Jet::<W>::seed(&SVector::<f64, W>::zeros(), 0);
        let (_, wf) = unpack(&self.process.transition(&xc, &wv, dt));

        let p_pred = f * self.p * f.transpose() + wf * self.q * wf.transpose();
        (x_pred, p_pred)
    }

    /// Runs one predict and update cycle against the measurement `z`.
    ///
    /// On a singular innovation covariance the predicted state is kept and
    /// [`EkfError::SingularInnovation`] is returned.
    pub fn update<H, const M: usize, const V: usize>(
        &mut self,
        measurement: &H,
        z: &SVector<f64, M>,
        r: &SMatrix<f64, V, V>,
        dt: f64,
    ) -> Result<(), EkfError>
    where
        H: MeasurementModel<N, M, V>,
    {
        let (x_pred, p_pred) = self.predict(dt);

        let xj = Jet::<N>::seed(&x_pred, 0);
        let vj: SVector<Jet<N>, V> = constants(&SVector::zeros());
        let (z_pred, h) = unpack(&measurement.measure(&xj, &vj));

        let xc: SVector<Jet<V>, N> = constants(&x_pred);
        let vv = Jet::<V>::seed(&SVector::<f64, V>::zeros(), 0);
        let (_, wh) = unpack(&measurement.measure(&xc, &vv));

        let s = h * p_pred * h.transpose() + wh * r * wh.transpose();
        let Some(s_inv) = s.try_inverse() else {
            self.x = x_pred;
            self.p = p_pred;
            return Err(EkfError::SingularInnovation);
        };

        let k = p_pred * h.transpose() * s_inv;
        self.x = x_pred + k * (z - z_pred);
        self.p = (SMatrix::<f64, N, N>::identity() - k * h) * p_pred;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Constant-velocity model along one axis: state (position, velocity).
    struct ConstantVelocity;

    impl EkfModel<2, 2> for ConstantVelocity {
        fn transition<T: Real>(&self, x: &SVector<T, 2>, w: &SVector<T, 2>, dt: f64) -> SVector<T, 2> {
            SVector::<T, 2>::new(x[0] + x[1] * T::from_f64(dt) + w[0], x[1] + w[1])
        }
    }

    struct RangeSensor;

    impl MeasurementModel<2, 1, 1> for RangeSensor {
        fn measure<T: Real>(&self, x: &SVector<T, 2>, v: &SVector<T, 1>) -> SVector<T, 1> {
            // Nonlinear on purpose: the distance to a beacon at height 1.
            SVector::<T, 1>::new((x[0] * x[0] + T::one()).sqrt() + v[0])
        }
    }

    fn filter(q: f64) -> KalmanFilter<ConstantVelocity, 2, 2> {
        KalmanFilter::new(
            ConstantVelocity,
            SVector::<f64, 2>::new(1.0, 0.0),
            SMatrix::<f64, 2, 2>::identity() * 4.0,
            SMatrix::<f64, 2, 2>::identity() * q,
        )
    }

    #[test]
    fn test_predict_uses_transition_jacobian() {
        let kf = filter(0.5);
        let (x, p) = kf.predict(2.0);
        assert_relative_eq!(x, SVector::<f64, 2>::new(1.0, 0.0));
        // F = [[1, 2], [0, 1]], P = 4 I, W_f = I
        let expected = SMatrix::<f64, 2, 2>::new(20.0 + 0.5, 8.0, 8.0, 4.0 + 0.5);
        assert_relative_eq!(p, expected, epsilon = 1e-12);
    }

    #[test]
    fn test_update_converges_to_measurement() {
        let mut kf = filter(1e-2);
        let target = 3.0f64;
        let z = SVector::<f64, 1>::new((target * target + 1.0).sqrt());
        let r = SMatrix::<f64, 1, 1>::new(1e-3);
        for _ in 0..30 {
            kf.update(&RangeSensor, &z, &r, 0.0).unwrap();
        }
        assert_relative_eq!(kf.state()[0], target, epsilon = 1e-3);
    }

    #[test]
    fn test_covariance_trace_non_increasing_without_process_noise() {
        let mut kf = filter(0.0);
        let z = SVector::<f64, 1>::new(2.0);
        let r = SMatrix::<f64, 1, 1>::new(1e-2);
        let mut trace = kf.covariance().trace();
        for _ in 0..20 {
            kf.update(&RangeSensor, &z, &r, 0.0).unwrap();
            let next = kf.covariance().trace();
            assert!(next <= trace + 1e-12, "trace grew from {trace} to {next}");
            trace = next;
        }
    }

    #[test]
    fn test_singular_innovation_keeps_prediction() {
        let mut kf = KalmanFilter::new(
            ConstantVelocity,
            SVector::<f64, 2>::new(1.0, 1.0),
            SMatrix::<f64, 2, 2>::zeros(),
            SMatrix::<f64, 2, 2>::zeros(),
        );
        let z = SVector::<f64, 1>::new(5.0);
        let r = SMatrix::<f64, 1, 1>::zeros();
        assert_eq!(kf.update(&RangeSensor, &z, &r, 1.0), Err(EkfError::SingularInnovation));
        assert_relative_eq!(kf.state()[0], 2.0);
    }
}

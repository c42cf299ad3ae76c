//! Global rotation-only bundle adjustment of the panorama frames.
//!
//! All frames share a centre of projection, so only their orientations are
//! refined. Four objectives are available, see [`BAMethod`]. Orientations are
//! solver variables as 3-dimensional tangent steps around their gyroscope
//! estimate; the lowest-index participating frame stays fixed to remove the
//! global rotation ambiguity.

use super::graph::MatchGroup;
use super::{BAMethod, EnvironmentError};
use crate::config::EnvironmentConfig;
use crate::geometry::rotation::{
    lit, perturb, quaternion_plus, quaternion_to_array, rotate, rotate_inverse, unit_vector_exp, unit_vector_plus,
};
use log::{debug, log_enabled, Level};
use nalgebra::{DVector, Matrix3, Point2, RealField, Unit, UnitQuaternion, Vector2, Vector3};
use std::collections::{BTreeSet, HashMap};
use tiny_solver::factors::Factor;
use tiny_solver::loss_functions::{HuberLoss, Loss};
use tiny_solver::optimizer::OptimizerOptions;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

/// Orientation of one frame inside a residual block.
#[derive(Debug, Clone, Copy)]
enum Orientation {
    Fixed(UnitQuaternion<f64>),
    Free(UnitQuaternion<f64>),
}

impl Orientation {
    fn quaternion<T: RealField>(&self, params: &[DVector<T>], next: &mut usize) -> [T; 4] {
        match self {
            Orientation::Fixed(q) => quaternion_to_array(q),
            Orientation::Free(q0) => {
                let q = perturb(q0, params[*next].as_slice());
                *next += 1;
                q
            }
        }
    }
}

fn lit3<T: RealField>(v: &Vector3<f64>) -> [T; 3] {
    [lit(v.x), lit(v.y), lit(v.z)]
}

/// Angular misalignment of two world-space rays of the same point,
/// weighted by how central both observations are.
#[derive(Debug, Clone)]
struct RayAlignCost {
    r0: Vector3<f64>,
    r1: Vector3<f64>,
    o0: Orientation,
    o1: Orientation,
}

impl<T: RealField> Factor<T> for RayAlignCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let mut next = 0;
        let q0 = self.o0.quaternion(params, &mut next);
        let q1 = self.o1.quaternion(params, &mut next);
        let w0 = rotate_inverse(&q0, &lit3(&self.r0));
        let w1 = rotate_inverse(&q1, &lit3(&self.r1));
        let a = lit::<T>(self.r0.z * self.r1.z);
        DVector::from_fn(3, |i, _| (w0[i].clone() - w1[i].clone()) * a.clone())
    }
}

/// Reprojection of a world point, free or constrained to the unit sphere.
#[derive(Debug, Clone)]
struct PointAlignCost {
    y: Point2<f64>,
    k: Matrix3<f64>,
    orientation: Orientation,
    /// Base point of the unit-vector parametrization, `None` for a free 3-D point.
    sphere: Option<Vector3<f64>>,
}

impl<T: RealField> Factor<T> for PointAlignCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let mut next = 0;
        let q = self.orientation.quaternion(params, &mut next);
        let p = &params[next];
        let x = match &self.sphere {
            Some(x0) => unit_vector_exp(x0, p.as_slice()),
            None => [p[0].clone(), p[1].clone(), p[2].clone()],
        };
        let c = rotate(&q, &x);
        let k = &self.k;
        let u = lit::<T>(k[(0, 0)]) * c[0].clone() + lit::<T>(k[(0, 2)]) * c[2].clone();
        let v = lit::<T>(k[(1, 1)]) * c[1].clone() + lit::<T>(k[(1, 2)]) * c[2].clone();
        let z = c[2].clone();
        if z > T::zero() {
            DVector::from_vec(vec![u / z.clone() - lit(self.y.x), v / z - lit(self.y.y)])
        } else {
            DVector::zeros(2)
        }
    }
}

/// Transfer of an observation from one frame into another through the
/// rotation-only homography `K₁ R₁ R₀⁻¹ K₀⁻¹`.
#[derive(Debug, Clone)]
struct ReprojectionCost {
    ray: Vector3<f64>,
    y1: Point2<f64>,
    k1: Matrix3<f64>,
    o0: Orientation,
    o1: Orientation,
}

impl<T: RealField> Factor<T> for ReprojectionCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let mut next = 0;
        let q0 = self.o0.quaternion(params, &mut next);
        let q1 = self.o1.quaternion(params, &mut next);
        let c = rotate(&q1, &rotate_inverse(&q0, &lit3(&self.ray)));
        let k = &self.k1;
        let u = lit::<T>(k[(0, 0)]) * c[0].clone() + lit::<T>(k[(0, 2)]) * c[2].clone();
        let v = lit::<T>(k[(1, 1)]) * c[1].clone() + lit::<T>(k[(1, 2)]) * c[2].clone();
        let z = c[2].clone();
        DVector::from_vec(vec![u / z.clone() - lit(self.y1.x), v / z - lit(self.y1.y)])
    }
}

/// Orientations after adjustment, with the frames that took part in it.
#[derive(Debug, Clone)]
pub struct BundleResult {
    pub rotations: Vec<UnitQuaternion<f64>>,
    pub optimized: Vec<bool>,
}

/// Unit viewing ray of a pixel in the camera frame.
fn camera_ray(k_inv: &Matrix3<f64>, y: &Point2<f64>) -> Vector3<f64> {
    (k_inv * Vector3::new(y.x, y.y, 1.0)).normalize()
}

fn inverses(intrinsics: &[Matrix3<f64>]) -> Result<Vec<Matrix3<f64>>, EnvironmentError> {
    intrinsics
        .iter()
        .map(|k| {
            k.try_inverse()
                .ok_or_else(|| EnvironmentError::Optimization("singular camera matrix".to_string()))
        })
        .collect()
}

/// Initial world direction of every group: the normalized mean of the
/// world-space rays through its observations.
pub fn estimate_points(
    rotations: &[UnitQuaternion<f64>],
    intrinsics: &[Matrix3<f64>],
    groups: &[MatchGroup],
) -> Result<Vec<Vector3<f64>>, EnvironmentError> {
    let k_inv = inverses(intrinsics)?;
    Ok(groups
        .iter()
        .map(|group| {
            let sum = group.iter().fold(Vector3::zeros(), |acc, (frame, y)| {
                acc + rotations[*frame].inverse() * camera_ray(&k_inv[*frame], y)
            });
            sum.try_normalize(f64::EPSILON).unwrap_or_else(Vector3::z)
        })
        .collect())
}

fn huber(threshold: f64) -> Option<Box<dyn Loss + Send>> {
    Some(Box::new(HuberLoss::new(threshold)))
}

/// Builds the problem for `method` and solves it.
///
/// `rotations` and `intrinsics` are indexed by frame; group observations
/// refer to those indices. Frames not seen by any group keep their rotation
/// and are reported as not optimized.
pub fn optimize(
    rotations: &[UnitQuaternion<f64>],
    intrinsics: &[Matrix3<f64>],
    groups: &[MatchGroup],
    method: BAMethod,
    config: &EnvironmentConfig,
) -> Result<BundleResult, EnvironmentError> {
    let participating: BTreeSet<usize> = groups.iter().flatten().map(|(frame, _)| *frame).collect();
    let Some(&gauge) = participating.first() else {
        return Ok(BundleResult {
            rotations: rotations.to_vec(),
            optimized: vec![false; rotations.len()],
        });
    };

    let orientation = |frame: usize| {
        if frame == gauge {
            Orientation::Fixed(rotations[frame])
        } else {
            Orientation::Free(rotations[frame])
        }
    };
    let rotation_name = |frame: usize| format!("q{frame}");
    let names_of = |frames: &[usize]| -> Vec<String> {
        frames.iter().filter(|&&f| f != gauge).map(|&f| rotation_name(f)).collect()
    };

    let k_inv = inverses(intrinsics)?;
    let mut problem = tiny_solver::Problem::new();
    let mut initial_values: HashMap<String, DVector<f64>> = HashMap::new();
    let mut blocks = 0usize;

    match method {
        BAMethod::Rays | BAMethod::Reproj => {
            for group in groups {
                for (i, (f0, y0)) in group.iter().enumerate() {
                    for (j, (f1, y1)) in group.iter().enumerate() {
                        if f0 == f1 || (method == BAMethod::Rays && j <= i) {
                            continue;
                        }
                        let names = names_of(&[*f0, *f1]);
                        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
                        let (o0, o1) = (orientation(*f0), orientation(*f1));
                        if method == BAMethod::Rays {
                            let cost = RayAlignCost {
                                r0: camera_ray(&k_inv[*f0], y0),
                                r1: camera_ray(&k_inv[*f1], y1),
                                o0,
                                o1,
                            };
                            problem.add_residual_block(3, &refs, Box::new(cost), huber(config.huber_threshold));
                        } else {
                            let cost = ReprojectionCost {
                                ray: k_inv[*f0] * Vector3::new(y0.x, y0.y, 1.0),
                                y1: *y1,
                                k1: intrinsics[*f1],
                                o0,
                                o1,
                            };
                            problem.add_residual_block(2, &refs, Box::new(cost), huber(config.huber_threshold));
                        }
                        blocks += 1;
                    }
                }
            }
        }
        BAMethod::Points | BAMethod::Vectors => {
            let points = estimate_points(rotations, intrinsics, groups)?;
            for (g, (group, x0)) in groups.iter().zip(&points).enumerate() {
                let point_name = format!("x{g}");
                let sphere = (method == BAMethod::Vectors).then_some(*x0);
                let initial = match sphere {
                    Some(_) => DVector::zeros(2),
                    None => DVector::from_column_slice(x0.as_slice()),
                };
                initial_values.insert(point_name.clone(), initial);

                for (frame, y) in group {
                    let mut names = names_of(&[*frame]);
                    names.push(point_name.clone());
                    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
                    let cost = PointAlignCost {
                        y: *y,
                        k: intrinsics[*frame],
                        orientation: orientation(*frame),
                        sphere,
                    };
                    problem.add_residual_block(2, &refs, Box::new(cost), huber(config.huber_threshold));
                    blocks += 1;
                }
            }
        }
    }

    for &frame in participating.iter().filter(|&&f| f != gauge) {
        initial_values.insert(rotation_name(frame), DVector::zeros(3));
    }

    let max_iteration = match method {
        BAMethod::Rays | BAMethod::Reproj => config.ba_iterations,
        BAMethod::Points | BAMethod::Vectors => config.point_ba_iterations,
    };
    let options = OptimizerOptions {
        max_iteration,
        ..Default::default()
    };
    debug!("{method:?} bundle adjustment: {blocks} residual blocks over {} frames", participating.len());
    let solution = LevenbergMarquardtOptimizer::default()
        .optimize(&problem, &initial_values, Some(options))
        .ok_or_else(|| EnvironmentError::Optimization(format!("{method:?} bundle adjustment failed")))?;

    let mut refined = rotations.to_vec();
    let mut optimized = vec![false; rotations.len()];
    for &frame in &participating {
        optimized[frame] = true;
        if frame == gauge {
            continue;
        }
        if let Some(delta) = solution.get(&rotation_name(frame)) {
            refined[frame] = quaternion_plus(&rotations[frame], &Vector3::new(delta[0], delta[1], delta[2]));
        }
    }

    if method == BAMethod::Vectors && log_enabled!(Level::Debug) {
        let points = estimate_points(rotations, intrinsics, groups)?;
        debug!("largest direction update {:.4} rad", largest_direction_update(&points, &solution));
    }

    Ok(BundleResult {
        rotations: refined,
        optimized,
    })
}

/// Angle by which the solver moved the furthest-travelling direction of the
/// `Vectors` formulation.
fn largest_direction_update(points: &[Vector3<f64>], solution: &HashMap<String, DVector<f64>>) -> f64 {
    points
        .iter()
        .enumerate()
        .filter_map(|(g, x0)| {
            let delta = solution.get(&format!("x{g}"))?;
            let moved = unit_vector_plus(&Unit::new_normalize(*x0), &Vector2::new(delta[0], delta[1]));
            Some(moved.angle(x0))
        })
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::rotation::angle;
    use approx::assert_relative_eq;

    fn k() -> Matrix3<f64> {
        Matrix3::new(500.0, 0.0, 320.0, 0.0, 500.0, 180.0, 0.0, 0.0, 1.0)
    }

    fn truth() -> Vec<UnitQuaternion<f64>> {
        vec![
            UnitQuaternion::from_euler_angles(0.0, 0.0, 0.0),
            UnitQuaternion::from_euler_angles(0.02, 0.2, 0.0),
            UnitQuaternion::from_euler_angles(-0.03, 0.4, 0.01),
        ]
    }

    fn scene() -> Vec<MatchGroup> {
        let rotations = truth();
        let k_inv = k().try_inverse().unwrap();
        let mut groups = Vec::new();
        for u in (100..=540).step_by(55) {
            for v in (40..=320).step_by(40) {
                let ray = camera_ray(&k_inv, &Point2::new(u as f64, v as f64));
                let world = rotations[1].inverse() * ray;
                let group: MatchGroup = rotations
                    .iter()
                    .enumerate()
                    .map(|(i, q)| {
                        let c = k() * (q * world);
                        (i, Point2::new(c.x / c.z, c.y / c.z))
                    })
                    .collect();
                groups.push(group);
            }
        }
        groups
    }

    fn perturbed() -> Vec<UnitQuaternion<f64>> {
        let t = truth();
        vec![
            t[0],
            quaternion_plus(&t[1], &Vector3::new(0.01, -0.015, 0.01)),
            quaternion_plus(&t[2], &Vector3::new(-0.012, 0.01, 0.015)),
        ]
    }

    fn check(method: BAMethod) {
        let intrinsics = vec![k(); 3];
        let result = optimize(&perturbed(), &intrinsics, &scene(), method, &EnvironmentConfig::default()).unwrap();
        assert_eq!(result.optimized, vec![true, true, true]);
        assert_eq!(result.rotations[0], truth()[0]);
        for (estimate, expected) in result.rotations.iter().zip(truth()) {
            let error = angle(&(estimate.inverse() * expected)).abs();
            assert!(error < 5e-3, "{method:?}: rotation error {error}");
        }
    }

    #[test]
    fn test_rays_recover_rotations() {
        check(BAMethod::Rays);
    }

    #[test]
    fn test_reprojection_recovers_rotations() {
        check(BAMethod::Reproj);
    }

    #[test]
    fn test_points_recover_rotations() {
        check(BAMethod::Points);
    }

    #[test]
    fn test_vectors_recover_rotations() {
        check(BAMethod::Vectors);
    }

    #[test]
    fn test_estimated_points_are_unit() {
        let points = estimate_points(&truth(), &[k(); 3], &scene()).unwrap();
        for p in points {
            assert!((p.norm() - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_no_groups_leaves_rotations() {
        let result = optimize(&truth(), &[k(); 3], &[], BAMethod::Rays, &EnvironmentConfig::default()).unwrap();
        assert_eq!(result.rotations, truth());
        assert_eq!(result.optimized, vec![false; 3]);
    }

    #[test]
    fn test_largest_direction_update() {
        let points = vec![Vector3::new(0.0, 0.0, 2.0), Vector3::new(1.0, 0.0, 0.0)];
        let mut solution = HashMap::new();
        assert_eq!(largest_direction_update(&points, &solution), 0.0);
        solution.insert("x0".to_string(), DVector::from_vec(vec![0.05, 0.0]));
        solution.insert("x1".to_string(), DVector::from_vec(vec![0.0, -0.2]));
        assert_relative_eq!(largest_direction_update(&points, &solution), 0.2, epsilon = 1e-12);
    }
}

//! Perspective-n-point pose estimation.
//!
//! Poses are returned as `Isometry3` mapping world (object) coordinates into
//! the camera frame, `x_c = R x_w + t`, with the camera looking down `+z`.
//!
//! * [`solve_p3p`]: minimal 3-point solver, remaining points disambiguate the roots.
//! * [`epnp`]: control-point solver for `n ≥ 4`, with a homography path for planar targets.
//! * [`solve_pnp_ransac`]: RANSAC over minimal samples, returning the inlier mask.
//! * [`refine_pose`]: Levenberg-Marquardt refinement on the rotation manifold.

use super::robust::{self, RobustConfig, RobustModel};
use super::rotation::{lit, perturb, quaternion_plus, rotate};
use super::GeometryError;
use log::debug;
use nalgebra::{
    DMatrix, DVector, Isometry3, Matrix3, Point2, Point3, RealField, Rotation3, SMatrix, Schur,
    SymmetricEigen, Translation3, UnitQuaternion, Vector3,
};
use std::collections::HashMap;
use tiny_solver::factors::Factor;
use tiny_solver::optimizer::OptimizerOptions;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

/// Pose together with the correspondences that support it.
#[derive(Debug, Clone)]
pub struct PnpSolution {
    pub pose: Isometry3<f64>,
    pub inliers: Vec<bool>,
}

/// Projects a world point, `None` if it lies behind the camera.
pub fn project(k: &Matrix3<f64>, pose: &Isometry3<f64>, point: &Point3<f64>) -> Option<Point2<f64>> {
    let pc = pose * point;
    if pc.z <= f64::EPSILON {
        return None;
    }
    let uv = k * (pc.coords / pc.z);
    Some(Point2::new(uv.x, uv.y))
}

/// Root mean square reprojection error in pixels.
pub fn reprojection_error(
    k: &Matrix3<f64>,
    pose: &Isometry3<f64>,
    world: &[Point3<f64>],
    image: &[Point2<f64>],
) -> f64 {
    let sum: f64 = world
        .iter()
        .zip(image)
        .map(|(w, i)| project(k, pose, w).map_or(1e12, |p| (p - i).norm_squared()))
        .sum();
    (sum / world.len().max(1) as f64).sqrt()
}

fn check_input(world: &[Point3<f64>], image: &[Point2<f64>], required: usize) -> Result<(), GeometryError> {
    if world.len() != image.len() || world.len() < required {
        return Err(GeometryError::NotEnoughPoints {
            required,
            found: world.len().min(image.len()),
        });
    }
    Ok(())
}

fn bearing(k_inv: &Matrix3<f64>, p: &Point2<f64>) -> Vector3<f64> {
    (k_inv * Vector3::new(p.x, p.y, 1.0)).normalize()
}

fn inverse_intrinsics(k: &Matrix3<f64>) -> Result<Matrix3<f64>, GeometryError> {
    k.try_inverse()
        .ok_or_else(|| GeometryError::Degenerate("intrinsic matrix is not invertible".to_string()))
}

/// Rigid transform aligning world points to camera-frame points (Kabsch).
pub fn pose_from_points(world: &[Point3<f64>], camera: &[Vector3<f64>]) -> Result<Isometry3<f64>, GeometryError> {
    if world.len() != camera.len() || world.len() < 3 {
        return Err(GeometryError::NotEnoughPoints {
            required: 3,
            found: world.len().min(camera.len()),
        });
    }

    let n = world.len() as f64;
    let c_w = world.iter().fold(Vector3::zeros(), |acc, p| acc + p.coords) / n;
    let c_c = camera.iter().fold(Vector3::zeros(), |acc, p| acc + p) / n;

    let mut h = Matrix3::zeros();
    for (pw, pc) in world.iter().zip(camera) {
        h += (pc - c_c) * (pw.coords - c_w).transpose();
    }

    let svd = h.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Err(GeometryError::Degenerate("svd failed".to_string()));
    };
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_fix = u;
        u_fix.column_mut(2).neg_mut();
        r = u_fix * v_t;
    }

    let t = c_c - r * c_w;
    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r));
    Ok(Isometry3::from_parts(Translation3::from(t), rotation))
}

/// Real roots of a polynomial given highest degree first.
fn real_roots(coeffs: &[f64]) -> Vec<f64> {
    let scale = coeffs.iter().fold(0.0f64, |m, c| m.max(c.abs()));
    let Some(lead) = coeffs.iter().position(|c| c.abs() > 1e-12 * scale.max(1e-300)) else {
        return Vec::new();
    };
    let c = &coeffs[lead..];
    let degree = c.len() - 1;
    if degree == 0 {
        return Vec::new();
    }
    if degree == 1 {
        return vec![-c[1] / c[0]];
    }

    let mut companion = DMatrix::<f64>::zeros(degree, degree);
    for j in 0..degree {
        companion[(0, j)] = -c[j + 1] / c[0];
    }
    for i in 1..degree {
        companion[(i, i - 1)] = 1.0;
    }

    let eval = |x: f64| c.iter().fold(0.0, |acc, a| acc * x + a);
    let deriv = |x: f64| {
        c.iter()
            .take(degree)
            .enumerate()
            .fold(0.0, |acc, (i, a)| acc * x + a * (degree - i) as f64)
    };

    let mut roots: Vec<f64> = Schur::new(companion)
        .complex_eigenvalues()
        .iter()
        .filter(|z| z.im.abs() < 1e-6 * (1.0 + z.re.abs()))
        .map(|z| {
            // A couple of Newton steps to polish the eigenvalue.
            let mut x = z.re;
            for _ in 0..3 {
                let d = deriv(x);
                if d.abs() > f64::EPSILON {
                    x -= eval(x) / d;
                }
            }
            x
        })
        .collect();
    roots.sort_by(|a, b| a.total_cmp(b));
    roots.dedup_by(|a, b| (*a - *b).abs() < 1e-9);
    roots
}

/// Minimal solver: up to four candidate poses from three correspondences.
///
/// Uses Grunert's distance formulation with depth ratios `u = y/x`, `v = z/x`
/// reduced to a quartic in `u`.
pub fn p3p(world: &[Point3<f64>], image: &[Point2<f64>], k: &Matrix3<f64>) -> Result<Vec<Isometry3<f64>>, GeometryError> {
    check_input(world, image, 3)?;
    let k_inv = inverse_intrinsics(k)?;
    let (world, image) = (&world[..3], &image[..3]);
    let b: Vec<Vector3<f64>> = image.iter().map(|p| bearing(&k_inv, p)).collect();

    let a_len = (world[1] - world[2]).norm();
    let b_len = (world[0] - world[2]).norm();
    let c_len = (world[0] - world[1]).norm();
    if a_len < f64::EPSILON || b_len < f64::EPSILON || c_len < f64::EPSILON {
        return Err(GeometryError::Degenerate("coincident points".to_string()));
    }

    let cos_alpha = b[1].dot(&b[2]);
    let cos_beta = b[0].dot(&b[2]);
    let cos_gamma = b[0].dot(&b[1]);

    let (a2, b2, c2) = (a_len * a_len, b_len * b_len, c_len * c_len);
    let d = (b2 - a2) / c2;
    let e = b2 / c2;

    // v = N(u) / D(u)
    let n = [1.0 - d, 2.0 * d * cos_gamma, -(1.0 + d)];
    let den = [2.0 * cos_beta, -2.0 * cos_alpha];
    // 1 - e K(u), K(u) = 1 + u² - 2 u cosγ
    let m = [1.0 - e, 2.0 * e * cos_gamma, -e];

    // Coefficients in ascending powers of u: N² - 2cosβ N D + (1 - eK) D².
    let mut poly = [0.0; 5];
    for i in 0..3 {
        for j in 0..3 {
            poly[i + j] += n[i] * n[j];
        }
        for j in 0..2 {
            poly[i + j] -= 2.0 * cos_beta * n[i] * den[j];
        }
    }
    for i in 0..3 {
        for j in 0..2 {
            for l in 0..2 {
                poly[i + j + l] += m[i] * den[j] * den[l];
            }
        }
    }

    let descending: Vec<f64> = poly.iter().rev().copied().collect();
    let mut candidates = Vec::new();
    for u in real_roots(&descending) {
        let denominator = den[0] + den[1] * u;
        let k_val = 1.0 + u * u - 2.0 * u * cos_gamma;
        if denominator.abs() < 1e-12 || k_val <= 1e-12 {
            continue;
        }
        let v = (n[0] + n[1] * u + n[2] * u * u) / denominator;
        let x = (c2 / k_val).sqrt();
        let (y, z) = (u * x, v * x);
        if y <= 0.0 || z <= 0.0 {
            continue;
        }
        let camera = [b[0] * x, b[1] * y, b[2] * z];
        if let Ok(pose) = pose_from_points(world, &camera) {
            candidates.push(pose);
        }
    }

    if candidates.is_empty() {
        return Err(GeometryError::Degenerate("no valid P3P root".to_string()));
    }
    Ok(candidates)
}

/// P3P on the first three correspondences, picking the root that best
/// explains all of them. Needs at least four points for an unambiguous pose.
pub fn solve_p3p(world: &[Point3<f64>], image: &[Point2<f64>], k: &Matrix3<f64>) -> Result<Isometry3<f64>, GeometryError> {
    check_input(world, image, 4)?;
    p3p(world, image, k)?
        .into_iter()
        .map(|pose| (reprojection_error(k, &pose, world, image), pose))
        .min_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, pose)| pose)
        .ok_or_else(|| GeometryError::Degenerate("no valid P3P root".to_string()))
}

/// Pose of a planar target from the homography between the plane and the
/// normalized image.
fn solve_planar(
    world: &[Point3<f64>],
    image: &[Point2<f64>],
    k_inv: &Matrix3<f64>,
    centroid: &Vector3<f64>,
    basis: &Matrix3<f64>,
) -> Result<Isometry3<f64>, GeometryError> {
    let plane: Vec<Point2<f64>> = world
        .iter()
        .map(|p| {
            let a = basis.transpose() * (p.coords - centroid);
            Point2::new(a.x, a.y)
        })
        .collect();
    let normalized: Vec<Point2<f64>> = image
        .iter()
        .map(|p| {
            let v = k_inv * Vector3::new(p.x, p.y, 1.0);
            Point2::new(v.x / v.z, v.y / v.z)
        })
        .collect();
    let h = super::homography::dlt_homography(&plane, &normalized)?;

    let h1 = h.column(0).into_owned();
    let h2 = h.column(1).into_owned();
    let h3 = h.column(2).into_owned();
    let mut lambda = 2.0 / (h1.norm() + h2.norm());
    if h3.z * lambda < 0.0 {
        lambda = -lambda;
    }
    let r1 = h1 * lambda;
    let r2 = h2 * lambda;
    let r = Matrix3::from_columns(&[r1, r2, r1.cross(&r2)]);

    let svd = r.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Err(GeometryError::Degenerate("svd failed".to_string()));
    };
    let mut r_plane = u * v_t;
    if r_plane.determinant() < 0.0 {
        let mut u_fix = u;
        u_fix.column_mut(2).neg_mut();
        r_plane = u_fix * v_t;
    }
    let t_plane = h3 * lambda;

    // x_c = R_p Bᵀ (x_w - c) + t_p
    let rotation = r_plane * basis.transpose();
    let translation = t_plane - rotation * centroid;
    Ok(Isometry3::from_parts(
        Translation3::from(translation),
        UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(rotation)),
    ))
}

/// EPnP for four or more correspondences.
///
/// Control points are placed along the principal axes of the world points.
/// Planar configurations, where one axis collapses, are solved through the
/// plane homography instead.
pub fn epnp(world: &[Point3<f64>], image: &[Point2<f64>], k: &Matrix3<f64>) -> Result<Isometry3<f64>, GeometryError> {
    check_input(world, image, 4)?;
    let k_inv = inverse_intrinsics(k)?;
    let n = world.len();

    let centroid = world.iter().fold(Vector3::zeros(), |acc, p| acc + p.coords) / n as f64;
    let mut cov = Matrix3::zeros();
    for p in world {
        let d = p.coords - centroid;
        cov += d * d.transpose();
    }
    cov /= n as f64;

    let eigen = SymmetricEigen::new(cov);
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));
    let largest = eigen.eigenvalues[order[0]];
    if largest <= f64::EPSILON {
        return Err(GeometryError::Degenerate("coincident points".to_string()));
    }

    if eigen.eigenvalues[order[2]] < 1e-8 * largest {
        let e1 = eigen.eigenvectors.column(order[0]).into_owned();
        let e2 = eigen.eigenvectors.column(order[1]).into_owned();
        let basis = Matrix3::from_columns(&[e1, e2, e1.cross(&e2)]);
        return solve_planar(world, image, &k_inv, &centroid, &basis);
    }

    let mut control_w = [centroid; 4];
    for (i, &axis) in order.iter().enumerate() {
        let scale = eigen.eigenvalues[axis].abs().sqrt();
        control_w[i + 1] = centroid + eigen.eigenvectors.column(axis) * scale;
    }
    let basis = Matrix3::from_columns(&[
        control_w[1] - control_w[0],
        control_w[2] - control_w[0],
        control_w[3] - control_w[0],
    ]);
    let basis_inv = basis
        .try_inverse()
        .ok_or_else(|| GeometryError::Degenerate("degenerate control points".to_string()))?;

    let alphas: Vec<[f64; 4]> = world
        .iter()
        .map(|p| {
            let c = basis_inv * (p.coords - control_w[0]);
            [1.0 - c.x - c.y - c.z, c.x, c.y, c.z]
        })
        .collect();

    // MᵀM, whose smallest eigenvector holds the camera-frame control points.
    let mut mtm = SMatrix::<f64, 12, 12>::zeros();
    for (alpha, p) in alphas.iter().zip(image) {
        let v = k_inv * Vector3::new(p.x, p.y, 1.0);
        let (u, w) = (v.x / v.z, v.y / v.z);
        let mut r0 = SMatrix::<f64, 1, 12>::zeros();
        let mut r1 = SMatrix::<f64, 1, 12>::zeros();
        for (j, &a) in alpha.iter().enumerate() {
            r0[3 * j] = a;
            r0[3 * j + 2] = -u * a;
            r1[3 * j + 1] = a;
            r1[3 * j + 2] = -w * a;
        }
        mtm += r0.transpose() * r0 + r1.transpose() * r1;
    }
    let eigen12 = SymmetricEigen::new(mtm);
    let (index, _) = eigen12.eigenvalues.argmin();
    let sol = eigen12.eigenvectors.column(index);

    let mut control_c = [Vector3::zeros(); 4];
    for (j, c) in control_c.iter_mut().enumerate() {
        *c = Vector3::new(sol[3 * j], sol[3 * j + 1], sol[3 * j + 2]);
    }

    let (mut sum_w, mut sum_c) = (0.0, 0.0);
    for i in 0..4 {
        for j in (i + 1)..4 {
            sum_w += (control_w[i] - control_w[j]).norm_squared();
            sum_c += (control_c[i] - control_c[j]).norm_squared();
        }
    }
    if sum_c <= f64::EPSILON {
        return Err(GeometryError::Degenerate("degenerate control points".to_string()));
    }
    let scale = (sum_w / sum_c).sqrt();

    let mut camera: Vec<Vector3<f64>> = alphas
        .iter()
        .map(|a| (0..4).fold(Vector3::zeros(), |acc, j| acc + control_c[j] * a[j]) * scale)
        .collect();
    if camera.iter().map(|p| p.z).sum::<f64>() < 0.0 {
        camera.iter_mut().for_each(|p| *p = -*p);
    }

    pose_from_points(world, &camera)
}

/// Reprojection residuals of a set of points under a perturbed pose.
///
/// Parameters: a 3-dimensional rotation tangent around `q0` and a translation.
#[derive(Debug, Clone)]
struct PoseReprojectionCost {
    world: Vec<Point3<f64>>,
    image: Vec<Point2<f64>>,
    k: Matrix3<f64>,
    q0: UnitQuaternion<f64>,
}

impl<T: RealField> Factor<T> for PoseReprojectionCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let q = perturb(&self.q0, params[0].as_slice());
        let t = &params[1];
        let (fx, fy) = (lit::<T>(self.k[(0, 0)]), lit::<T>(self.k[(1, 1)]));
        let (cx, cy) = (lit::<T>(self.k[(0, 2)]), lit::<T>(self.k[(1, 2)]));

        let mut residuals = DVector::zeros(self.world.len() * 2);
        for (i, (w, p)) in self.world.iter().zip(&self.image).enumerate() {
            let pc = rotate(&q, &[lit(w.x), lit(w.y), lit(w.z)]);
            let x = pc[0].clone() + t[0].clone();
            let y = pc[1].clone() + t[1].clone();
            let z = pc[2].clone() + t[2].clone();
            residuals[2 * i] = fx.clone() * x / z.clone() + cx.clone() - lit(p.x);
            residuals[2 * i + 1] = fy.clone() * y / z + cy.clone() - lit(p.y);
        }
        residuals
    }
}

/// Refines a pose by minimizing the reprojection error with Levenberg-Marquardt.
pub fn refine_pose(
    world: &[Point3<f64>],
    image: &[Point2<f64>],
    k: &Matrix3<f64>,
    initial: &Isometry3<f64>,
    max_iterations: usize,
) -> Result<Isometry3<f64>, GeometryError> {
    check_input(world, image, 3)?;

    let mut problem = tiny_solver::Problem::new();
    let cost = PoseReprojectionCost {
        world: world.to_vec(),
        image: image.to_vec(),
        k: *k,
        q0: initial.rotation,
    };
    problem.add_residual_block(world.len() * 2, &["rotation", "translation"], Box::new(cost), None);

    let mut initial_values = HashMap::new();
    initial_values.insert("rotation".to_string(), DVector::zeros(3));
    initial_values.insert(
        "translation".to_string(),
        DVector::from_column_slice(initial.translation.vector.as_slice()),
    );

    let options = OptimizerOptions {
        max_iteration: max_iterations,
        ..Default::default()
    };
    let optimizer = LevenbergMarquardtOptimizer::default();
    let result = optimizer
        .optimize(&problem, &initial_values, Some(options))
        .ok_or_else(|| GeometryError::Optimization("pose refinement failed".to_string()))?;

    let (Some(delta), Some(t)) = (result.get("rotation"), result.get("translation")) else {
        return Err(GeometryError::Optimization("missing pose variables".to_string()));
    };
    let rotation = quaternion_plus(&initial.rotation, &Vector3::new(delta[0], delta[1], delta[2]));
    let refined = Isometry3::from_parts(Translation3::new(t[0], t[1], t[2]), rotation);

    // Keep the initial estimate if the solver wandered off.
    if reprojection_error(k, &refined, world, image) <= reprojection_error(k, initial, world, image) {
        Ok(refined)
    } else {
        Ok(*initial)
    }
}

struct PnpEstimator<'a> {
    k: &'a Matrix3<f64>,
}

impl RobustModel<(Point3<f64>, Point2<f64>)> for PnpEstimator<'_> {
    type Model = Isometry3<f64>;

    fn min_sample_size(&self) -> usize {
        4
    }

    fn estimate(&self, data: &[&(Point3<f64>, Point2<f64>)]) -> Option<Isometry3<f64>> {
        let world: Vec<_> = data.iter().map(|d| d.0).collect();
        let image: Vec<_> = data.iter().map(|d| d.1).collect();
        solve_p3p(&world, &image, self.k).ok()
    }

    fn compute_error(&self, model: &Isometry3<f64>, data: &(Point3<f64>, Point2<f64>)) -> f64 {
        project(self.k, model, &data.0).map_or(f64::INFINITY, |p| (p - data.1).norm())
    }
}

/// RANSAC PnP: minimal P3P samples, scored by reprojection error, followed by
/// refinement on the inlier set.
pub fn solve_pnp_ransac(
    world: &[Point3<f64>],
    image: &[Point2<f64>],
    k: &Matrix3<f64>,
    iterations: usize,
    threshold: f64,
) -> Result<PnpSolution, GeometryError> {
    check_input(world, image, 4)?;
    let data: Vec<_> = world.iter().copied().zip(image.iter().copied()).collect();
    let config = RobustConfig {
        threshold,
        max_iterations: iterations,
        ..RobustConfig::default()
    };
    let result = robust::ransac(&PnpEstimator { k }, &data, &config)
        .ok_or_else(|| GeometryError::Degenerate("no consistent pose".to_string()))?;

    let (inlier_world, inlier_image): (Vec<_>, Vec<_>) = data
        .iter()
        .zip(&result.inliers)
        .filter(|(_, &inlier)| inlier)
        .map(|(d, _)| *d)
        .unzip();
    debug!("PnP RANSAC: {}/{} inliers", result.num_inliers, data.len());

    let pose = refine_pose(&inlier_world, &inlier_image, k, &result.model, 30)?;
    Ok(PnpSolution {
        pose,
        inliers: result.inliers,
    })
}

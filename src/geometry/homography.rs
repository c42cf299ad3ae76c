//! Plane-to-plane homography estimation.
//!
//! A normalized DLT fits `H` with `dst ~ H src`; [`find_homography`] wraps it
//! in RANSAC or LMedS and returns an inlier mask alongside the model.

use super::robust::{self, RobustConfig, RobustModel};
use super::GeometryError;
use nalgebra::{Matrix3, Point2, SMatrix, SymmetricEigen, Vector3};
use serde::{Deserialize, Serialize};

/// Robust estimator used to reject outlier correspondences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HMethod {
    Ransac,
    Lmeds,
}

/// Similarity transform moving the centroid to the origin and scaling the
/// mean distance to √2.
fn normalization(points: &[Point2<f64>]) -> Matrix3<f64> {
    let n = points.len() as f64;
    let centroid = points.iter().fold(Vector3::zeros(), |acc, p| {
        acc + Vector3::new(p.x, p.y, 0.0)
    }) / n;
    let mean_dist = points
        .iter()
        .map(|p| ((p.x - centroid.x).powi(2) + (p.y - centroid.y).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let s = if mean_dist > f64::EPSILON {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    Matrix3::new(s, 0.0, -s * centroid.x, 0.0, s, -s * centroid.y, 0.0, 0.0, 1.0)
}

/// Fits a homography to four or more correspondences with the normalized DLT.
pub fn dlt_homography(
    src: &[Point2<f64>],
    dst: &[Point2<f64>],
) -> Result<Matrix3<f64>, GeometryError> {
    let n = src.len();
    if n < 4 || dst.len() != n {
        return Err(GeometryError::NotEnoughPoints {
            required: 4,
            found: n.min(dst.len()),
        });
    }

    let ts = normalization(src);
    let td = normalization(dst);

    // Accumulate AᵀA directly: the null vector of A is its smallest eigenvector.
    let mut ata = SMatrix::<f64, 9, 9>::zeros();
    for (ps, pd) in src.iter().zip(dst) {
        let s = ts * Vector3::new(ps.x, ps.y, 1.0);
        let d = td * Vector3::new(pd.x, pd.y, 1.0);
        let (x, y) = (s.x / s.z, s.y / s.z);
        let (u, v) = (d.x / d.z, d.y / d.z);
        let r0 = SMatrix::<f64, 1, 9>::from_row_slice(&[
            -x, -y, -1.0, 0.0, 0.0, 0.0, u * x, u * y, u,
        ]);
        let r1 = SMatrix::<f64, 1, 9>::from_row_slice(&[
            0.0, 0.0, 0.0, -x, -y, -1.0, v * x, v * y, v,
        ]);
        ata += r0.transpose() * r0 + r1.transpose() * r1;
    }

    let eigen = SymmetricEigen::new(ata);
    let (index, _) = eigen.eigenvalues.argmin();
    let h = eigen.eigenvectors.column(index);
    let hn = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    let td_inv = td.try_inverse().ok_or(GeometryError::Degenerate(
        "singular normalization".to_string(),
    ))?;
    let mut hmat = td_inv * hn * ts;
    let scale = hmat[(2, 2)];
    if scale.abs() > f64::EPSILON {
        hmat /= scale;
    }
    if !hmat.iter().all(|v| v.is_finite()) {
        return Err(GeometryError::Degenerate("non-finite homography".to_string()));
    }
    Ok(hmat)
}

/// Maps a point through a homography, `None` if it lands at infinity.
pub fn transfer(h: &Matrix3<f64>, p: &Point2<f64>) -> Option<Point2<f64>> {
    let q = h * Vector3::new(p.x, p.y, 1.0);
    if q.z.abs() < 1e-12 {
        return None;
    }
    Some(Point2::new(q.x / q.z, q.y / q.z))
}

struct HomographyEstimator;

impl RobustModel<(Point2<f64>, Point2<f64>)> for HomographyEstimator {
    type Model = Matrix3<f64>;

    fn min_sample_size(&self) -> usize {
        4
    }

    fn estimate(&self, data: &[&(Point2<f64>, Point2<f64>)]) -> Option<Matrix3<f64>> {
        let src: Vec<_> = data.iter().map(|d| d.0).collect();
        let dst: Vec<_> = data.iter().map(|d| d.1).collect();
        dlt_homography(&src, &dst).ok()
    }

    fn compute_error(&self, model: &Matrix3<f64>, data: &(Point2<f64>, Point2<f64>)) -> f64 {
        transfer(model, &data.0).map_or(f64::INFINITY, |p| (p - data.1).norm())
    }
}

/// Robustly fits `dst ~ H src`, returning the model refitted on the inliers
/// together with the inlier mask.
pub fn find_homography(
    src: &[Point2<f64>],
    dst: &[Point2<f64>],
    method: HMethod,
    threshold: f64,
) -> Result<(Matrix3<f64>, Vec<bool>), GeometryError> {
    if src.len() != dst.len() {
        return Err(GeometryError::Degenerate(
            "mismatched correspondence lists".to_string(),
        ));
    }
    let data: Vec<_> = src.iter().copied().zip(dst.iter().copied()).collect();
    let config = RobustConfig {
        threshold,
        ..RobustConfig::default()
    };
    let result = match method {
        HMethod::Ransac => robust::ransac(&HomographyEstimator, &data, &config),
        HMethod::Lmeds => robust::lmeds(&HomographyEstimator, &data, &config),
    }
    .ok_or(GeometryError::NotEnoughPoints {
        required: 4,
        found: data.len(),
    })?;

    let (inlier_src, inlier_dst): (Vec<_>, Vec<_>) = data
        .iter()
        .zip(&result.inliers)
        .filter(|(_, &inlier)| inlier)
        .map(|(d, _)| *d)
        .unzip();
    let h = dlt_homography(&inlier_src, &inlier_dst).unwrap_or(result.model);
    Ok((h, result.inliers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Cell centres of a `cols` × `rows` grid over a 640×480 image.
    fn grid(cols: usize, rows: usize) -> Vec<Point2<f64>> {
        let (w, h) = (640.0 / cols as f64, 480.0 / rows as f64);
        (0..rows)
            .flat_map(|i| (0..cols).map(move |j| Point2::new((j as f64 + 0.5) * w, (i as f64 + 0.5) * h)))
            .collect()
    }

    fn ground_truth() -> Matrix3<f64> {
        Matrix3::new(1.1, 0.05, 12.0, -0.03, 0.95, -7.0, 1e-4, -2e-4, 1.0)
    }

    #[test]
    fn test_dlt_recovers_homography_from_four_points() {
        let h = ground_truth();
        let src = vec![
            Point2::new(0.0, 0.0),
            Point2::new(100.0, 0.0),
            Point2::new(100.0, 80.0),
            Point2::new(0.0, 80.0),
        ];
        let dst: Vec<_> = src.iter().map(|p| transfer(&h, p).unwrap()).collect();
        let est = dlt_homography(&src, &dst).unwrap();
        assert_relative_eq!(est, h, epsilon = 1e-6);
    }

    #[test]
    fn test_find_homography_rejects_outliers() {
        let h = ground_truth();
        let src = grid(9, 7);
        let mut dst: Vec<_> = src.iter().map(|p| transfer(&h, p).unwrap()).collect();
        for i in (0..dst.len()).step_by(7) {
            dst[i] += nalgebra::Vector2::new(40.0, -25.0);
        }

        for method in [HMethod::Ransac, HMethod::Lmeds] {
            let (est, inliers) = find_homography(&src, &dst, method, 3.0).unwrap();
            for (i, inlier) in inliers.iter().enumerate() {
                assert_eq!(*inlier, i % 7 != 0, "method {method:?}, point {i}");
            }
            let p = Point2::new(320.0, 240.0);
            let expected = transfer(&h, &p).unwrap();
            let got = transfer(&est, &p).unwrap();
            assert!((expected - got).norm() < 1e-6);
        }
    }

    #[test]
    fn test_not_enough_points() {
        let pts = vec![Point2::new(0.0, 0.0); 3];
        assert!(matches!(
            dlt_homography(&pts, &pts),
            Err(GeometryError::NotEnoughPoints { .. })
        ));
    }
}

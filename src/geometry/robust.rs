//! Robust model estimation.
//!
//! Provides RANSAC and LMedS drivers over any [`RobustModel`]. Sampling is
//! driven by a seeded generator so repeated runs on the same data give the
//! same answer.

use rand::rngs::StdRng;
use rand::SeedableRng;

/// Configuration for robust estimation.
#[derive(Debug, Clone)]
pub struct RobustConfig {
    /// Inlier threshold on the per-sample error.
    pub threshold: f64,
    pub max_iterations: usize,
    /// Desired probability of drawing at least one outlier-free sample.
    pub confidence: f64,
    pub seed: u64,
}

impl Default for RobustConfig {
    fn default() -> Self {
        Self {
            threshold: 3.0,
            max_iterations: 2000,
            confidence: 0.995,
            seed: 0x5eed,
        }
    }
}

/// Result of a robust fit.
#[derive(Debug, Clone)]
pub struct RobustResult<M> {
    pub model: M,
    pub inliers: Vec<bool>,
    pub num_inliers: usize,
}

/// A model that can be fitted to minimal samples and scored per datum.
pub trait RobustModel<D> {
    type Model: Clone;

    /// Number of data points in a minimal sample.
    fn min_sample_size(&self) -> usize;

    /// Fits a model to a sample; `None` for degenerate samples.
    fn estimate(&self, data: &[&D]) -> Option<Self::Model>;

    /// Error of a single datum under the model.
    fn compute_error(&self, model: &Self::Model, data: &D) -> f64;
}

/// Number of iterations needed to reach `confidence` with the given inlier ratio.
fn adaptive_iterations(confidence: f64, inlier_ratio: f64, sample_size: usize, cap: usize) -> usize {
    let p_good = inlier_ratio.powi(sample_size as i32);
    if p_good >= 1.0 - f64::EPSILON {
        return 1;
    }
    if p_good <= f64::EPSILON {
        return cap;
    }
    let k = (1.0 - confidence).ln() / (1.0 - p_good).ln();
    if k.is_finite() {
        (k.ceil() as usize).clamp(1, cap)
    } else {
        cap
    }
}

fn draw<'a, D>(rng: &mut StdRng, data: &'a [D], k: usize) -> Vec<&'a D> {
    rand::seq::index::sample(rng, data.len(), k)
        .into_iter()
        .map(|i| &data[i])
        .collect()
}

fn score<D, M: RobustModel<D>>(
    estimator: &M,
    model: &M::Model,
    data: &[D],
    threshold: f64,
) -> (Vec<bool>, usize, f64) {
    let mut inliers = vec![false; data.len()];
    let mut count = 0;
    let mut total = 0.0;
    for (flag, d) in inliers.iter_mut().zip(data) {
        let err = estimator.compute_error(model, d);
        if err < threshold {
            *flag = true;
            count += 1;
            total += err;
        }
    }
    (inliers, count, total)
}

/// Random sample consensus: keeps the model with the most inliers.
pub fn ransac<D, M: RobustModel<D>>(
    estimator: &M,
    data: &[D],
    config: &RobustConfig,
) -> Option<RobustResult<M::Model>> {
    let k = estimator.min_sample_size();
    if data.len() < k {
        return None;
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut best: Option<RobustResult<M::Model>> = None;
    let mut best_error = f64::INFINITY;
    let mut iterations = config.max_iterations;
    let mut i = 0;

    while i < iterations {
        i += 1;
        let sample = draw(&mut rng, data, k);
        let Some(model) = estimator.estimate(&sample) else {
            continue;
        };

        let (inliers, count, total) = score(estimator, &model, data, config.threshold);
        let best_count = best.as_ref().map_or(0, |b| b.num_inliers);
        if count > best_count || (count == best_count && count > 0 && total < best_error) {
            best_error = total;
            best = Some(RobustResult {
                model,
                inliers,
                num_inliers: count,
            });
            let ratio = count as f64 / data.len() as f64;
            iterations = adaptive_iterations(config.confidence, ratio, k, config.max_iterations);
        }
    }

    best.filter(|b| b.num_inliers >= k)
}

/// Least median of squares: keeps the model with the smallest median error.
///
/// The model is selected by its median error; inliers are then the data
/// whose error falls below `config.threshold`.
pub fn lmeds<D, M: RobustModel<D>>(
    estimator: &M,
    data: &[D],
    config: &RobustConfig,
) -> Option<RobustResult<M::Model>> {
    let n = data.len();
    let k = estimator.min_sample_size();
    if n < k {
        return None;
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut best_model = None;
    let mut best_median = f64::INFINITY;
    let iterations = adaptive_iterations(config.confidence, 0.5, k, config.max_iterations);

    for _ in 0..iterations {
        let sample = draw(&mut rng, data, k);
        let Some(model) = estimator.estimate(&sample) else {
            continue;
        };
        let mut errors: Vec<f64> = data
            .iter()
            .map(|d| estimator.compute_error(&model, d))
            .collect();
        errors.sort_by(|a, b| a.total_cmp(b));
        let median = errors[n / 2];
        if median < best_median {
            best_median = median;
            best_model = Some(model);
        }
    }

    let model = best_model?;
    let (inliers, num_inliers, _) = score(estimator, &model, data, config.threshold);
    Some(RobustResult {
        model,
        inliers,
        num_inliers,
    })
}

//! Bundle adjustment of the marker map.
//!
//! Every (logged pose, observed marker) pair contributes eight residuals:
//! the pixel offsets of the four projected grid corners. Rotations are
//! optimized as 3-dimensional tangent steps around their current value, so
//! the quaternions never leave the unit sphere, and the reference marker
//! enters the problem as a constant.
//!
//! [`BundleAdjuster`] runs the adjustment on a worker thread. It wakes up
//! whenever the tracker logs a new pose, copies the map under its locks,
//! solves without holding any lock and writes the result back.

use super::map::{Marker, MarkerId, MarkerMap, MarkerObservation, PoseLog, PoseRecord};
use crate::config::TrackerConfig;
use crate::geometry::rotation::{lit, perturb, quaternion_plus, quaternion_to_array, rotate};
use crate::geometry::GeometryError;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use nalgebra::{DVector, Isometry3, Matrix3, Point2, Point3, RealField, Translation3, UnitQuaternion, Vector3};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tiny_solver::factors::Factor;
use tiny_solver::loss_functions::{HuberLoss, Loss};
use tiny_solver::optimizer::OptimizerOptions;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

/// How often the worker re-checks the shutdown flag while idle.
const RECV_TIMEOUT: Duration = Duration::from_millis(50);

/// A rigid transform that is either a constant or a solver variable.
///
/// Free transforms consume two parameter blocks: a rotation tangent around
/// the stored quaternion and a translation.
#[derive(Debug, Clone, Copy)]
enum Anchor {
    Fixed(Isometry3<f64>),
    Free(UnitQuaternion<f64>),
}

impl Anchor {
    fn transform<T: RealField>(&self, params: &[DVector<T>], next: &mut usize) -> ([T; 4], [T; 3]) {
        match self {
            Anchor::Fixed(pose) => {
                let t = pose.translation.vector;
                (quaternion_to_array(&pose.rotation), [lit(t.x), lit(t.y), lit(t.z)])
            }
            Anchor::Free(q0) => {
                let q = perturb(q0, params[*next].as_slice());
                let t = &params[*next + 1];
                *next += 2;
                (q, [t[0].clone(), t[1].clone(), t[2].clone()])
            }
        }
    }
}

fn apply<T: RealField>(q: &[T; 4], t: &[T; 3], p: &[T; 3]) -> [T; 3] {
    let r = rotate(q, p);
    [
        r[0].clone() + t[0].clone(),
        r[1].clone() + t[1].clone(),
        r[2].clone() + t[2].clone(),
    ]
}

/// Reprojection of the four corners of one marker seen from one camera.
#[derive(Debug, Clone)]
struct MarkerCornerCost {
    grid: [Point3<f64>; 4],
    corners: [Point2<f64>; 4],
    k: Matrix3<f64>,
    camera: Anchor,
    marker: Anchor,
}

impl<T: RealField> Factor<T> for MarkerCornerCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let mut next = 0;
        let (qc, tc) = self.camera.transform(params, &mut next);
        let (qm, tm) = self.marker.transform(params, &mut next);
        let (fx, fy) = (lit::<T>(self.k[(0, 0)]), lit::<T>(self.k[(1, 1)]));
        let (cx, cy) = (lit::<T>(self.k[(0, 2)]), lit::<T>(self.k[(1, 2)]));

        let mut residuals = DVector::zeros(8);
        for (j, (g, uv)) in self.grid.iter().zip(&self.corners).enumerate() {
            let world = apply(&qm, &tm, &[lit(g.x), lit(g.y), lit(g.z)]);
            let [x, y, z] = apply(&qc, &tc, &world);
            residuals[2 * j] = fx.clone() * x / z.clone() + cx.clone() - lit(uv.x);
            residuals[2 * j + 1] = fy.clone() * y / z + cy.clone() - lit(uv.y);
        }
        residuals
    }
}

fn translation_value(pose: &Isometry3<f64>) -> DVector<f64> {
    DVector::from_column_slice(pose.translation.vector.as_slice())
}

/// Reads a free transform back out of the solver solution.
fn read_pose(
    solution: &HashMap<String, DVector<f64>>,
    name: &str,
    initial: &Isometry3<f64>,
) -> Result<Isometry3<f64>, GeometryError> {
    let (Some(delta), Some(t)) = (solution.get(&format!("{name}_r")), solution.get(&format!("{name}_t"))) else {
        return Err(GeometryError::Optimization(format!("missing variables for {name}")));
    };
    let rotation = quaternion_plus(&initial.rotation, &Vector3::new(delta[0], delta[1], delta[2]));
    Ok(Isometry3::from_parts(Translation3::new(t[0], t[1], t[2]), rotation))
}

fn huber(threshold: f64) -> Option<Box<dyn Loss + Send>> {
    Some(Box::new(HuberLoss::new(threshold)))
}

/// Jointly refines all non-reference markers and all logged camera poses.
///
/// Observations of markers missing from `markers` are ignored. Returns the
/// updated markers (reference included, unchanged) and one pose per record.
pub fn bundle_adjust(
    markers: &[Marker],
    poses: &[PoseRecord],
    reference: MarkerId,
    grid: &[Point3<f64>; 4],
    k: &Matrix3<f64>,
    config: &TrackerConfig,
) -> Result<(Vec<Marker>, Vec<Isometry3<f64>>), GeometryError> {
    let by_id: HashMap<MarkerId, &Marker> = markers.iter().map(|m| (m.id, m)).collect();

    let mut problem = tiny_solver::Problem::new();
    let mut initial_values = HashMap::new();
    let mut num_blocks = 0;
    for (i, record) in poses.iter().enumerate() {
        let camera_name = format!("pose{i}");
        let mut observed = false;
        for observation in &record.observations {
            let Some(marker) = by_id.get(&observation.id) else {
                continue;
            };
            let marker_name = format!("marker{}", marker.id);
            let mut names = vec![format!("{camera_name}_r"), format!("{camera_name}_t")];
            let marker_anchor = if marker.id == reference {
                Anchor::Fixed(marker.pose)
            } else {
                names.push(format!("{marker_name}_r"));
                names.push(format!("{marker_name}_t"));
                initial_values.insert(format!("{marker_name}_r"), DVector::zeros(3));
                initial_values.insert(format!("{marker_name}_t"), translation_value(&marker.pose));
                Anchor::Free(marker.pose.rotation)
            };
            let cost = MarkerCornerCost {
                grid: *grid,
                corners: observation.corners,
                k: *k,
                camera: Anchor::Free(record.pose.rotation),
                marker: marker_anchor,
            };
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            problem.add_residual_block(8, &refs, Box::new(cost), huber(config.huber_threshold));
            num_blocks += 1;
            observed = true;
        }
        // poses without a mapped marker stay out of the problem
        if observed {
            initial_values.insert(format!("{camera_name}_r"), DVector::zeros(3));
            initial_values.insert(format!("{camera_name}_t"), translation_value(&record.pose));
        }
    }

    if num_blocks == 0 {
        return Ok((markers.to_vec(), poses.iter().map(|r| r.pose).collect()));
    }

    let options = OptimizerOptions {
        max_iteration: config.ba_iterations,
        ..Default::default()
    };
    let optimizer = LevenbergMarquardtOptimizer::default();
    let solution = optimizer
        .optimize(&problem, &initial_values, Some(options))
        .ok_or_else(|| GeometryError::Optimization("marker bundle adjustment failed".to_string()))?;

    let mut refined_markers = Vec::with_capacity(markers.len());
    for marker in markers {
        let name = format!("marker{}", marker.id);
        let pose = if marker.id != reference && solution.contains_key(&format!("{name}_r")) {
            read_pose(&solution, &name, &marker.pose)?
        } else {
            marker.pose
        };
        refined_markers.push(Marker { id: marker.id, pose });
    }

    let mut refined_poses = Vec::with_capacity(poses.len());
    for (i, record) in poses.iter().enumerate() {
        let name = format!("pose{i}");
        if solution.contains_key(&format!("{name}_r")) {
            refined_poses.push(read_pose(&solution, &name, &record.pose)?);
        } else {
            refined_poses.push(record.pose);
        }
    }

    debug!("bundle adjustment over {num_blocks} marker observations");
    Ok((refined_markers, refined_poses))
}

/// Places a newly discovered marker by refining its pose against one view,
/// with the camera held fixed.
pub fn refine_marker(
    marker: &Marker,
    camera: &Isometry3<f64>,
    observation: &MarkerObservation,
    grid: &[Point3<f64>; 4],
    k: &Matrix3<f64>,
    max_iterations: usize,
) -> Result<Marker, GeometryError> {
    let mut problem = tiny_solver::Problem::new();
    let cost = MarkerCornerCost {
        grid: *grid,
        corners: observation.corners,
        k: *k,
        camera: Anchor::Fixed(*camera),
        marker: Anchor::Free(marker.pose.rotation),
    };
    problem.add_residual_block(8, &["marker_r", "marker_t"], Box::new(cost), None);

    let mut initial_values = HashMap::new();
    initial_values.insert("marker_r".to_string(), DVector::zeros(3));
    initial_values.insert("marker_t".to_string(), translation_value(&marker.pose));

    let options = OptimizerOptions {
        max_iteration: max_iterations,
        ..Default::default()
    };
    let solution = LevenbergMarquardtOptimizer::default()
        .optimize(&problem, &initial_values, Some(options))
        .ok_or_else(|| GeometryError::Optimization("marker refinement failed".to_string()))?;
    Ok(Marker {
        id: marker.id,
        pose: read_pose(&solution, "marker", &marker.pose)?,
    })
}

/// State shared between the tracker and its bundle-adjustment worker.
#[derive(Debug)]
pub struct SharedMap {
    pub markers: MarkerMap,
    pub poses: PoseLog,
    pub grid: [Point3<f64>; 4],
    pub k: Matrix3<f64>,
    pub config: TrackerConfig,
}

impl SharedMap {
    /// One snapshot-solve-commit pass. Returns the number of poses processed.
    ///
    /// Each lock is held only while copying or writing back; the solve runs
    /// on private copies.
    pub fn adjust(&self) -> Result<usize, GeometryError> {
        let Some(reference) = self.markers.reference() else {
            return Ok(0);
        };
        let markers = self.markers.snapshot();
        let poses = self.poses.snapshot();
        if poses.is_empty() {
            return Ok(0);
        }

        let (markers, refined) = bundle_adjust(&markers, &poses, reference, &self.grid, &self.k, &self.config)?;
        self.markers.update(&markers);
        self.poses.update_poses(&refined);
        Ok(poses.len())
    }
}

/// Background worker running [`SharedMap::adjust`] whenever it is notified.
///
/// Dropping the adjuster stops the worker and waits for it to exit.
pub struct BundleAdjuster {
    wake: Option<Sender<()>>,
    running: Arc<AtomicBool>,
    passes: Arc<AtomicUsize>,
    handle: Option<JoinHandle<()>>,
}

impl BundleAdjuster {
    pub fn spawn(shared: Arc<SharedMap>) -> Self {
        // one pending wake-up is enough: a pass always sees the whole log
        let (wake, receiver) = bounded::<()>(1);
        let running = Arc::new(AtomicBool::new(true));
        let passes = Arc::new(AtomicUsize::new(0));

        let handle = {
            let running = running.clone();
            let passes = passes.clone();
            thread::spawn(move || run(shared, receiver, running, passes))
        };

        Self {
            wake: Some(wake),
            running,
            passes,
            handle: Some(handle),
        }
    }

    /// Requests a pass. Never blocks.
    pub fn notify(&self) {
        if let Some(wake) = &self.wake {
            let _ = wake.try_send(());
        }
    }

    /// Number of completed passes.
    pub fn passes(&self) -> usize {
        self.passes.load(Ordering::Acquire)
    }

    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        // dropping the sender disconnects the channel and wakes the worker
        self.wake.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("bundle adjustment thread panicked");
            }
        }
    }
}

impl Drop for BundleAdjuster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: Arc<SharedMap>, receiver: Receiver<()>, running: Arc<AtomicBool>, passes: Arc<AtomicUsize>) {
    info!("bundle adjustment thread started");
    while running.load(Ordering::Acquire) {
        match receiver.recv_timeout(RECV_TIMEOUT) {
            Ok(()) => {}
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if !running.load(Ordering::Acquire) {
            break;
        }

        match shared.adjust() {
            Ok(n) => debug!("bundle adjustment refined {n} poses"),
            Err(e) => warn!("bundle adjustment failed, keeping the previous map: {e}"),
        }
        passes.fetch_add(1, Ordering::AcqRel);
    }
    info!("bundle adjustment thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::pnp::project;
    use crate::tracking::map::marker_grid;

    fn k() -> Matrix3<f64> {
        Matrix3::new(800.0, 0.0, 320.0, 0.0, 800.0, 240.0, 0.0, 0.0, 1.0)
    }

    fn second_marker() -> Marker {
        Marker {
            id: 2,
            pose: Isometry3::from_parts(
                Translation3::new(12.0, 1.0, 0.5),
                UnitQuaternion::from_euler_angles(0.0, 0.0, 0.3),
            ),
        }
    }

    fn cameras() -> Vec<Isometry3<f64>> {
        vec![
            Isometry3::from_parts(Translation3::new(-6.0, 0.0, 60.0), UnitQuaternion::from_euler_angles(0.1, 0.0, 0.0)),
            Isometry3::from_parts(Translation3::new(-4.0, 2.0, 55.0), UnitQuaternion::from_euler_angles(0.0, 0.15, 0.05)),
            Isometry3::from_parts(Translation3::new(-8.0, -1.0, 65.0), UnitQuaternion::from_euler_angles(-0.1, -0.1, 0.0)),
        ]
    }

    fn observe(camera: &Isometry3<f64>, marker: &Marker, jitter: f64) -> MarkerObservation {
        let grid = marker_grid(4.6);
        let corners = marker.corners(&grid);
        let mut i: f64 = 0.0;
        MarkerObservation {
            id: marker.id,
            corners: corners.map(|c| {
                i += 1.0;
                let p = project(&k(), camera, &c).unwrap();
                Point2::new(p.x + jitter * (i * 1.7).sin(), p.y + jitter * (i * 2.3).cos())
            }),
        }
    }

    fn records(markers: &[Marker], jitter: f64) -> Vec<PoseRecord> {
        cameras()
            .iter()
            .map(|c| PoseRecord {
                pose: *c,
                observations: markers.iter().map(|m| observe(c, m, jitter)).collect(),
            })
            .collect()
    }

    #[test]
    fn test_bundle_adjust_recovers_perturbed_marker() {
        let reference = Marker {
            id: 1,
            pose: Isometry3::identity(),
        };
        let truth = second_marker();
        let poses = records(&[reference, truth], 0.05);

        let mut perturbed = truth;
        perturbed.pose.translation.vector += Vector3::new(0.8, -0.5, 0.6);
        perturbed.pose.rotation = quaternion_plus(&truth.pose.rotation, &Vector3::new(0.03, -0.02, 0.02));

        let config = TrackerConfig::default();
        let (markers, refined) =
            bundle_adjust(&[reference, perturbed], &poses, 1, &marker_grid(4.6), &k(), &config).unwrap();

        assert_eq!(markers[0].pose, Isometry3::identity());
        let error = (markers[1].pose.translation.vector - truth.pose.translation.vector).norm();
        assert!(error < 0.2, "marker error {error}");
        assert_eq!(refined.len(), 3);
        for (pose, camera) in refined.iter().zip(cameras()) {
            assert!((pose.translation.vector - camera.translation.vector).norm() < 0.5);
        }
    }

    #[test]
    fn test_bundle_adjust_without_observations_is_identity() {
        let reference = Marker {
            id: 1,
            pose: Isometry3::identity(),
        };
        let poses = vec![PoseRecord {
            pose: cameras()[0],
            observations: vec![],
        }];
        let (markers, refined) =
            bundle_adjust(&[reference], &poses, 1, &marker_grid(4.6), &k(), &TrackerConfig::default()).unwrap();
        assert_eq!(markers, vec![reference]);
        assert_eq!(refined, vec![cameras()[0]]);
    }

    #[test]
    fn test_refine_marker_with_fixed_camera() {
        let truth = second_marker();
        let camera = cameras()[1];
        let observation = observe(&camera, &truth, 0.0);
        let mut initial = truth;
        initial.pose.translation.vector += Vector3::new(0.3, 0.2, -0.4);

        let refined = refine_marker(&initial, &camera, &observation, &marker_grid(4.6), &k(), 20).unwrap();
        let error = (refined.pose.translation.vector - truth.pose.translation.vector).norm();
        assert!(error < 1e-3, "marker error {error}");
    }

    #[test]
    fn test_worker_runs_on_notify_and_stops() {
        let _ = env_logger::builder().is_test(true).try_init();
        let shared = Arc::new(SharedMap {
            markers: MarkerMap::new(),
            poses: PoseLog::new(),
            grid: marker_grid(4.6),
            k: k(),
            config: TrackerConfig::default(),
        });
        let reference = Marker {
            id: 1,
            pose: Isometry3::identity(),
        };
        shared.markers.insert(reference);
        for record in records(&[reference], 0.1) {
            shared.poses.push(record);
        }

        let mut adjuster = BundleAdjuster::spawn(shared.clone());
        adjuster.notify();
        let mut waited = 0;
        while adjuster.passes() == 0 && waited < 500 {
            thread::sleep(Duration::from_millis(10));
            waited += 1;
        }
        assert!(adjuster.passes() >= 1);
        adjuster.shutdown();
        assert_eq!(shared.markers.get(1).unwrap().pose, Isometry3::identity());
    }
}

use anyhow::Result;
use nalgebra::Vector3;
use rand::prelude::*;
use tracing_subscriber::EnvFilter;

use rust_lslam::common::{PointCloud, RelativePose, Time};
use rust_lslam::config::EstimatorParams;
use rust_lslam::geometry::SE3;
use rust_lslam::system::{ScanMsg, SlamSystem};

const N_WORKERS: usize = 2;
const STEPS: usize = 20;
const STEP_NS: Time = 100_000_000;
const SENSOR_RANGE: f64 = 8.0;
const N_LANDMARKS: usize = 1500;

/// Simulated robot: ground-truth poses and the frame its odometry starts in.
struct Robot {
    truth: Vec<SE3>,
    odom_origin: SE3,
    time_offset_ns: Time,
}

impl Robot {
    fn time_at(&self, step: usize) -> Time {
        step as Time * STEP_NS + self.time_offset_ns
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let params = match std::env::args().nth(1) {
        Some(path) => {
            println!("Loading estimator parameters from: {}", path);
            EstimatorParams::load(&path)?
        }
        None => EstimatorParams {
            do_icp_step_on_loop_closures: true,
            ..Default::default()
        },
    };

    let mut rng = StdRng::seed_from_u64(7);
    let landmarks: Vec<Vector3<f64>> = (0..N_LANDMARKS)
        .map(|_| {
            Vector3::new(
                rng.gen_range(-8.0..28.0),
                rng.gen_range(-18.0..18.0),
                rng.gen_range(-2.0..2.0),
            )
        })
        .collect();

    // Robot 0 drives along +x, robot 1 along +y; both pass (10, 0) at step 10.
    let robots = [
        Robot {
            truth: (0..STEPS)
                .map(|i| SE3::from_yaw_translation(0.0, Vector3::new(i as f64, 0.0, 0.0)))
                .collect(),
            odom_origin: SE3::identity(),
            time_offset_ns: 0,
        },
        Robot {
            truth: (0..STEPS)
                .map(|i| {
                    SE3::from_yaw_translation(
                        std::f64::consts::FRAC_PI_2,
                        Vector3::new(10.0, i as f64 - 10.0, 0.0),
                    )
                })
                .collect(),
            odom_origin: SE3::from_yaw_translation(0.3, Vector3::new(2.0, 1.0, 0.0)),
            time_offset_ns: STEP_NS / 2,
        },
    ];

    let mut slam_system = SlamSystem::new(params, N_WORKERS)?;

    for step in 0..STEPS {
        for (worker_id, robot) in robots.iter().enumerate() {
            let odometry = noisy_odometry(robot, step, &mut rng);
            let scan = simulate_scan(&robot.truth[step], &landmarks, &mut rng);
            slam_system.process_scan(worker_id, ScanMsg::new(robot.time_at(step), odometry, scan))?;
        }
    }
    slam_system.wait_idle();

    let estimator = slam_system.estimator().clone();
    println!(
        "Ingested {} scans per worker: {} factors, replaceable prior {:?}",
        STEPS,
        estimator.num_factors(),
        estimator.replaceable_prior()
    );
    println!(
        "Robot 1 mean position error before loop closure: {:.3} m",
        mean_position_error(&slam_system, 1, &robots[1])?
    );

    // A place-recognition hit where both robots cross, with a rough guess.
    let truth_a = robots[0].truth[10];
    let truth_b = robots[1].truth[10];
    let guess = truth_a
        .between(&truth_b)
        .compose(&SE3::from_yaw_translation(0.02, Vector3::new(0.15, -0.1, 0.0)));
    let loop_closure = RelativePose {
        track_id_a: 0,
        track_id_b: 1,
        time_a_ns: robots[0].time_at(10),
        time_b_ns: robots[1].time_at(10),
        t_a_b: guess,
    };
    slam_system.process_loop_closure(&loop_closure)?;

    println!(
        "After loop closure: {} factors, robot 0 error {:.3} m, robot 1 error {:.3} m",
        estimator.num_factors(),
        mean_position_error(&slam_system, 0, &robots[0])?,
        mean_position_error(&slam_system, 1, &robots[1])?
    );

    slam_system.shutdown()?;
    println!("Done!");
    Ok(())
}

/// Odometry of `robot` at `step`: ground truth in the odometry frame with a
/// small random drift per step.
fn noisy_odometry(robot: &Robot, step: usize, rng: &mut StdRng) -> SE3 {
    let drift = SE3::from_yaw_translation(
        rng.gen_range(-0.002..0.002) * step as f64,
        Vector3::new(
            rng.gen_range(-0.01..0.01) * step as f64,
            rng.gen_range(-0.01..0.01) * step as f64,
            0.0,
        ),
    );
    robot.odom_origin.compose(&robot.truth[step]).compose(&drift)
}

fn simulate_scan(pose: &SE3, landmarks: &[Vector3<f64>], rng: &mut StdRng) -> PointCloud {
    let t_s_w = pose.inverse();
    PointCloud::from_points(
        landmarks
            .iter()
            .filter(|l| (*l - pose.translation).norm() < SENSOR_RANGE)
            .map(|l| {
                let noise = Vector3::new(
                    rng.gen_range(-0.01..0.01),
                    rng.gen_range(-0.01..0.01),
                    rng.gen_range(-0.01..0.01),
                );
                t_s_w.transform_point(l) + noise
            })
            .collect(),
    )
}

fn mean_position_error(slam_system: &SlamSystem, worker_id: usize, robot: &Robot) -> Result<f64> {
    let track = slam_system.estimator().laser_track(worker_id)?;
    let track = track.read();
    let errors: Vec<f64> = (0..STEPS)
        .filter_map(|step| {
            track
                .pose_at(robot.time_at(step))
                .map(|p| (p.t_w.translation - robot.truth[step].translation).norm())
        })
        .collect();
    Ok(errors.iter().sum::<f64>() / errors.len().max(1) as f64)
}

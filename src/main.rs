use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use clap::Parser;
use tracing::{info, warn};

use vslam_backend::geometry::SE3;
use vslam_backend::graph::KeyframeId;
use vslam_backend::io::write_trajectory_csv;
use vslam_backend::simulation::{circle_trajectory, DriftingOdometry, SyntheticWorld};
use vslam_backend::{BackendConfig, BackendThread, SlamSystem};

/// Drive the backend with a synthetic circular trajectory and drifting
/// odometry, then report how much of the drift the loop closures removed.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Backend configuration (YAML). Defaults are used when absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Keyframes per lap.
    #[arg(long, default_value_t = 40)]
    keyframes: usize,

    /// Number of laps around the circle.
    #[arg(long, default_value_t = 2)]
    laps: usize,

    /// Write the trajectory CSV here.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Seed for the scene, the odometry noise and RANSAC.
    #[arg(long, default_value_t = 7)]
    seed: u64,

    /// Per-axis odometry rotation noise bound (radians).
    #[arg(long, default_value_t = 0.01)]
    rotation_noise: f64,

    /// Per-axis odometry translation noise bound.
    #[arg(long, default_value_t = 0.02)]
    translation_noise: f64,
}

const CIRCLE_RADIUS: f64 = 2.0;
const SCENE_RADIUS: f64 = 6.0;
const SCENE_POINTS: usize = 1500;
const WAIT_TIMEOUT: Duration = Duration::from_secs(60);

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.keyframes < 3 {
        bail!("need at least 3 keyframes per lap, got {}", args.keyframes);
    }

    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            BackendConfig::from_yaml_file(path)?
        }
        None => BackendConfig::default(),
    };
    if config.registration.ransac.seed.is_none() {
        config.registration.ransac.seed = Some(args.seed);
    }

    let world = SyntheticWorld::cylinder(config.camera, SCENE_POINTS, SCENE_RADIUS, args.seed);
    let lap = circle_trajectory(args.keyframes, CIRCLE_RADIUS);
    let truth: Vec<SE3> = lap.iter().cycle().take(args.keyframes * args.laps).copied().collect();
    let mut odometry = DriftingOdometry::new(args.rotation_noise, args.translation_noise, args.seed);
    let (raw, edges) = odometry.integrate(&truth, SCENE_RADIUS - CIRCLE_RADIUS);
    println!(
        "Simulating {} keyframes over {} laps, {} landmarks",
        truth.len(),
        args.laps,
        world.landmarks().len()
    );

    let frame_period = Duration::from_millis(config.poll_interval_ms);
    let backend = BackendThread::spawn(SlamSystem::new(config)?);
    let handle = backend.handle();

    for (i, (true_pose, raw_pose)) in truth.iter().zip(&raw).enumerate() {
        let mut kf = world.observe(KeyframeId::new(i), true_pose, *raw_pose);
        kf.pose = handle.correct(raw_pose);
        handle.submit_keyframe(kf);
        if i > 0 {
            handle.submit_edge(edges[i - 1].clone());
        }
        thread::sleep(frame_period);
    }

    let start = Instant::now();
    while handle.keyframe_count() < truth.len() && backend.is_running() {
        if start.elapsed() > WAIT_TIMEOUT {
            warn!("timed out waiting for the backend");
            break;
        }
        thread::sleep(frame_period);
    }

    let Some(system) = backend.shutdown() else {
        bail!("backend thread panicked");
    };
    let stats = system.stats();
    println!(
        "Backend: {} cycles, {} local loops, {} global loops, {} rejected registrations, {} optimizations ({} failed)",
        stats.cycles,
        stats.local_loops,
        stats.global_loops,
        stats.registrations_rejected,
        stats.optimizations,
        stats.optimizer_failures
    );

    let map = handle.map();
    let keyframes = map.graph.keyframes();
    let raw_rms = rms_error(keyframes.iter().map(|kf| kf.raw_pose), &truth);
    let optimized_rms = rms_error(keyframes.iter().map(|kf| kf.pose), &truth);
    println!("Position RMS error: raw {:.4}, optimized {:.4}", raw_rms, optimized_rms);

    let c = map.correction;
    println!(
        "Final correction: translation [{:.4}, {:.4}, {:.4}], rotation {:.3} deg",
        c.translation.x,
        c.translation.y,
        c.translation.z,
        c.rotation_angle().to_degrees()
    );

    if let Some(path) = &args.output {
        write_trajectory_csv(path, keyframes)?;
        println!("Trajectory written to {}", path.display());
    }
    Ok(())
}

fn rms_error(poses: impl Iterator<Item = SE3>, truth: &[SE3]) -> f64 {
    let (sum, n) = poses
        .zip(truth)
        .fold((0.0, 0usize), |(s, n), (p, t)| (s + (p.translation - t.translation).norm_squared(), n + 1));
    if n == 0 {
        0.0
    } else {
        (sum / n as f64).sqrt()
    }
}

//! Backend configuration.
//!
//! Every section has defaults, so a YAML file only needs the values it
//! changes:
//!
//! ```yaml
//! local_window: 8
//! close_loops: false
//! registration:
//!   min_inliers: 40
//!   ransac:
//!     seed: 7
//! ```

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nalgebra::Matrix4;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::geometry::{CameraModel, SE3};
use crate::loop_closing::{BowDetectorConfig, GlobalLoopConfig, LocalLoopConfig};
use crate::optimizer::PoseGraphConfig;
use crate::registration::{MatcherConfig, RegistrationConfig};

/// Configuration of the whole backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Camera intrinsics and distortion.
    pub camera: CameraModel,

    /// Body-from-camera transform as 16 row-major values. The drift
    /// correction starts from it after a reset. Identity when absent.
    pub body_t_cam: Option<Vec<f64>>,

    /// Size of the front end's local map in keyframes. Optimization starts
    /// once this many keyframes (minus one) exist.
    pub local_window: usize,

    /// Enable appearance-based (global) loop search.
    pub close_loops: bool,

    /// Write every finalized keyframe to `archive_dir`.
    pub save_keyframes: bool,

    pub archive_dir: PathBuf,

    /// Subgraph cap for local optimization, as a multiple of `local_window`.
    pub local_cap_factor: usize,

    /// Subgraph cap after a loop closure, as a multiple of `local_window`.
    pub loop_cap_factor: usize,

    /// Polling period of the backend thread.
    pub poll_interval_ms: u64,

    pub local_loop: LocalLoopConfig,
    pub global_loop: GlobalLoopConfig,
    pub registration: RegistrationConfig,
    pub matcher: MatcherConfig,
    pub detector: BowDetectorConfig,
    pub pose_graph: PoseGraphConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            camera: CameraModel::default(),
            body_t_cam: None,
            local_window: 6,
            close_loops: true,
            save_keyframes: false,
            archive_dir: PathBuf::from("keyframes"),
            local_cap_factor: 5,
            loop_cap_factor: 500,
            poll_interval_ms: 20,
            local_loop: LocalLoopConfig::default(),
            global_loop: GlobalLoopConfig::default(),
            registration: RegistrationConfig::default(),
            matcher: MatcherConfig::default(),
            detector: BowDetectorConfig::default(),
            pose_graph: PoseGraphConfig::default(),
        }
    }
}

impl BackendConfig {
    /// Load and validate a YAML config file. Missing keys take their defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        let config: Self = serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate YAML text.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text).context("Failed to parse backend config")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the backend cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.local_window < 2 {
            bail!("local_window must be at least 2, got {}", self.local_window);
        }
        if self.registration.ransac.n_hypotheses == 0 {
            bail!("registration.ransac.n_hypotheses must be positive");
        }
        if self.registration.ransac.block_size == 0 {
            bail!("registration.ransac.block_size must be positive");
        }
        if self.camera.fx <= 0.0 || self.camera.fy <= 0.0 {
            bail!("camera focal lengths must be positive");
        }
        if let Some(data) = &self.body_t_cam {
            if data.len() != 16 {
                bail!("Expected 16 elements for body_t_cam, got {}", data.len());
            }
        }
        Ok(())
    }

    /// Subgraph cap for optimization without a loop.
    pub fn local_cap(&self) -> usize {
        self.local_cap_factor * self.local_window
    }

    /// Subgraph cap for optimization after a loop closure.
    pub fn loop_cap(&self) -> usize {
        self.loop_cap_factor * self.local_window
    }

    /// Body-from-camera extrinsics, identity when not configured.
    pub fn body_from_camera(&self) -> SE3 {
        match &self.body_t_cam {
            Some(data) if data.len() == 16 => SE3::from_matrix(Matrix4::from_row_slice(data)),
            Some(data) => {
                warn!("ignoring body_t_cam with {} elements", data.len());
                SE3::identity()
            }
            None => SE3::identity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_defaults() {
        let config = BackendConfig::default();
        assert_eq!(config.local_window, 6);
        assert_eq!(config.local_cap(), 30);
        assert_eq!(config.loop_cap(), 3000);
        assert_eq!(config.local_loop.min_id_gap, 15);
        assert_eq!(config.registration.min_inliers, 30);
        assert!(!config.registration.use_sim3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = BackendConfig::from_yaml_str(
            "local_window: 8\nclose_loops: false\nregistration:\n  min_inliers: 40\n  ransac:\n    seed: 7\n",
        )
        .unwrap();
        assert_eq!(config.local_window, 8);
        assert!(!config.close_loops);
        assert_eq!(config.registration.min_inliers, 40);
        assert_eq!(config.registration.ransac.seed, Some(7));
        assert_eq!(config.registration.ransac.n_hypotheses, 300);
        assert_relative_eq!(config.local_loop.max_distance, 1.0);
    }

    #[test]
    fn test_invalid_window_rejected() {
        assert!(BackendConfig::from_yaml_str("local_window: 1\n").is_err());
    }

    #[test]
    fn test_body_t_cam() {
        let config = BackendConfig::from_yaml_str(
            "body_t_cam: [1, 0, 0, 0.5, 0, 1, 0, 0, 0, 0, 1, 0, 0, 0, 0, 1]\n",
        )
        .unwrap();
        assert_relative_eq!(config.body_from_camera().translation.x, 0.5);
        assert!(BackendConfig::from_yaml_str("body_t_cam: [1, 0]\n").is_err());
    }

    #[test]
    fn test_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend.yaml");
        std::fs::write(&path, "poll_interval_ms: 5\n").unwrap();
        let config = BackendConfig::from_yaml_file(&path).unwrap();
        assert_eq!(config.poll_interval_ms, 5);
        assert!(BackendConfig::from_yaml_file(&dir.path().join("missing.yaml")).is_err());
    }
}

//! Keyframe archival, one YAML file per keyframe.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::graph::{Keyframe, KeyframeId};

/// Receives every finalized keyframe. Failures are the caller's to log.
pub trait KeyframeArchive: Send {
    fn store(&mut self, kf: &Keyframe) -> Result<()>;
}

/// Writes `kf<id>.yaml` files into a directory.
#[derive(Debug, Clone)]
pub struct YamlKeyframeArchive {
    dir: PathBuf,
}

impl YamlKeyframeArchive {
    /// Create the directory if needed.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create archive dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// File holding keyframe `id`.
    pub fn path_for(&self, id: KeyframeId) -> PathBuf {
        self.dir.join(format!("kf{}.yaml", id.index()))
    }

    /// Read back an archived keyframe.
    pub fn load(&self, id: KeyframeId) -> Result<Keyframe> {
        let path = self.path_for(id);
        let file = File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;
        serde_yaml::from_reader(file).with_context(|| format!("Failed to parse {}", path.display()))
    }
}

impl KeyframeArchive for YamlKeyframeArchive {
    fn store(&mut self, kf: &Keyframe) -> Result<()> {
        let path = self.path_for(kf.id);
        let file = File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?;
        serde_yaml::to_writer(BufWriter::new(file), kf)
            .with_context(|| format!("Failed to write keyframe {}", kf.id))?;
        Ok(())
    }
}

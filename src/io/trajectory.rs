//! Trajectory export as CSV: raw and optimized pose per keyframe.

use std::path::Path;

use anyhow::{Context, Result};
use csv::{ReaderBuilder, WriterBuilder};
use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::geometry::SE3;
use crate::graph::Keyframe;

/// One CSV row. Quaternions are stored as (x, y, z, w).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryRow {
    pub id: usize,
    pub raw_tx: f64,
    pub raw_ty: f64,
    pub raw_tz: f64,
    pub raw_qx: f64,
    pub raw_qy: f64,
    pub raw_qz: f64,
    pub raw_qw: f64,
    pub tx: f64,
    pub ty: f64,
    pub tz: f64,
    pub qx: f64,
    pub qy: f64,
    pub qz: f64,
    pub qw: f64,
}

impl TrajectoryRow {
    /// Row for one keyframe.
    pub fn from_keyframe(kf: &Keyframe) -> Self {
        let (rt, rq) = (kf.raw_pose.translation, kf.raw_pose.rotation);
        let (t, q) = (kf.pose.translation, kf.pose.rotation);
        Self {
            id: kf.id.index(),
            raw_tx: rt.x,
            raw_ty: rt.y,
            raw_tz: rt.z,
            raw_qx: rq.i,
            raw_qy: rq.j,
            raw_qz: rq.k,
            raw_qw: rq.w,
            tx: t.x,
            ty: t.y,
            tz: t.z,
            qx: q.i,
            qy: q.j,
            qz: q.k,
            qw: q.w,
        }
    }

    /// Front-end pose stored in the row.
    pub fn raw_pose(&self) -> SE3 {
        pose(
            [self.raw_tx, self.raw_ty, self.raw_tz],
            [self.raw_qx, self.raw_qy, self.raw_qz, self.raw_qw],
        )
    }

    /// Optimized pose stored in the row.
    pub fn pose(&self) -> SE3 {
        pose([self.tx, self.ty, self.tz], [self.qx, self.qy, self.qz, self.qw])
    }
}

fn pose(t: [f64; 3], q: [f64; 4]) -> SE3 {
    SE3::new(
        UnitQuaternion::from_quaternion(Quaternion::new(q[3], q[0], q[1], q[2])),
        Vector3::from(t),
    )
}

/// Write one row per keyframe with a header line.
pub fn write_trajectory_csv<P: AsRef<Path>>(path: P, keyframes: &[Keyframe]) -> Result<()> {
    let path = path.as_ref();
    let mut wtr = WriterBuilder::new()
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for kf in keyframes {
        wtr.serialize(TrajectoryRow::from_keyframe(kf))
            .with_context(|| format!("Failed to write keyframe {}", kf.id))?;
    }
    wtr.flush().with_context(|| format!("Failed to flush {}", path.display()))?;
    Ok(())
}

/// Read rows written by [`write_trajectory_csv`].
pub fn read_trajectory_csv<P: AsRef<Path>>(path: P) -> Result<Vec<TrajectoryRow>> {
    let path = path.as_ref();
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut rows = Vec::new();
    for record in rdr.deserialize() {
        let row: TrajectoryRow = record.with_context(|| format!("Failed to parse {}", path.display()))?;
        rows.push(row);
    }
    Ok(rows)
}

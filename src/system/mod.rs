//! Backend orchestration and threading.
//!
//! - `SharedState` / `BackendHandle`: waiting lists, published map, flags
//! - `SlamSystem`: the drain, loop-closure and optimization cycle
//! - `BackendThread`: polls `SlamSystem` on its own thread

mod runner;
pub mod shared_state;
mod slam_system;

pub use runner::BackendThread;
pub use shared_state::{BackendHandle, BackendMap, PendingQueue, SharedState};
pub use slam_system::{BackendStats, CycleReport, LoopEvent, OptimizationReport, SlamSystem};

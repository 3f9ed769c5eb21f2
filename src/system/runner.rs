//! Background thread that polls the backend.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info};

use crate::error::BackendError;

use super::shared_state::{BackendHandle, SharedState};
use super::slam_system::SlamSystem;

/// Runs [`SlamSystem::spin_once`] every poll interval until shut down.
///
/// Submissions are picked up on the next poll; there is no wake-up. A
/// contiguity violation stops the thread, optimizer failures are retried.
pub struct BackendThread {
    shared: Arc<SharedState>,
    stop_tx: Sender<()>,
    join: Option<JoinHandle<SlamSystem>>,
}

impl BackendThread {
    /// Run `system` on its own thread, polling at the configured interval.
    pub fn spawn(system: SlamSystem) -> Self {
        let shared = Arc::clone(system.shared());
        let poll = Duration::from_millis(system.config().poll_interval_ms.max(1));
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let join = thread::spawn(move || run(system, stop_rx, poll));
        Self {
            shared,
            stop_tx,
            join: Some(join),
        }
    }

    /// New handle onto the running backend.
    pub fn handle(&self) -> BackendHandle {
        BackendHandle::new(Arc::clone(&self.shared))
    }

    /// False once the thread has exited.
    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|j| !j.is_finished())
    }

    /// Stop the thread after a final cycle and hand back the backend.
    ///
    /// Returns `None` if the thread panicked.
    pub fn shutdown(mut self) -> Option<SlamSystem> {
        self.stop()
    }

    fn stop(&mut self) -> Option<SlamSystem> {
        let join = self.join.take()?;
        self.shared.request_shutdown();
        let _ = self.stop_tx.try_send(());
        match join.join() {
            Ok(system) => Some(system),
            Err(_) => {
                error!("backend thread panicked");
                None
            }
        }
    }
}

impl Drop for BackendThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(mut system: SlamSystem, stop_rx: Receiver<()>, poll: Duration) -> SlamSystem {
    info!("backend thread started, polling every {:?}", poll);
    loop {
        if system.shared().is_shutdown_requested() {
            break;
        }
        match stop_rx.recv_timeout(poll) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        if !cycle(&mut system) {
            return system;
        }
    }

    // Process whatever was submitted before the shutdown request.
    cycle(&mut system);
    info!("backend thread exiting after {} cycles", system.stats().cycles);
    system
}

/// One cycle; false when the thread must stop.
fn cycle(system: &mut SlamSystem) -> bool {
    match system.spin_once() {
        Ok(report) => {
            if !report.is_idle() {
                debug!(
                    "cycle: {} keyframes, {} local loops, {} global loops",
                    report.keyframes_added,
                    report.local_loops.len(),
                    report.global_loops.len()
                );
            }
            true
        }
        Err(e @ BackendError::GraphContiguityViolation { .. }) => {
            error!("stopping backend: {}", e);
            false
        }
        // Already logged; the flag stays set for the next cycle.
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::geometry::SE3;
    use crate::graph::{Edge, Keyframe, KeyframeId};
    use nalgebra::Vector3;
    use std::time::Instant;

    fn keyframe(i: usize) -> Keyframe {
        let pose = SE3::from_axis_angle(Vector3::zeros(), Vector3::new(i as f64, 0.0, 0.0));
        Keyframe::new(KeyframeId::new(i), pose, vec![], vec![])
    }

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(10) {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_thread_processes_submissions() {
        let config = BackendConfig {
            close_loops: false,
            poll_interval_ms: 2,
            ..BackendConfig::default()
        };
        let backend = BackendThread::spawn(SlamSystem::new(config).unwrap());
        let handle = backend.handle();
        for i in 0..8 {
            handle.submit_keyframe(keyframe(i));
            if i > 0 {
                let step = SE3::from_axis_angle(Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0));
                handle.submit_edge(Edge::odometry(KeyframeId::new(i - 1), KeyframeId::new(i), step, 1.0));
            }
        }
        assert!(wait_for(|| handle.keyframe_count() == 8));
        assert!(wait_for(|| handle.is_map_updated()));

        let system = backend.shutdown().unwrap();
        assert_eq!(system.stats().keyframes, 8);
    }

    #[test]
    fn test_contiguity_violation_stops_thread() {
        let config = BackendConfig {
            poll_interval_ms: 2,
            ..BackendConfig::default()
        };
        let backend = BackendThread::spawn(SlamSystem::new(config).unwrap());
        let handle = backend.handle();
        handle.submit_keyframe(keyframe(3));
        assert!(wait_for(|| !backend.is_running()));
        assert_eq!(handle.keyframe_count(), 0);
    }

    #[test]
    fn test_shutdown_flushes_pending() {
        let config = BackendConfig {
            poll_interval_ms: 60_000,
            ..BackendConfig::default()
        };
        let backend = BackendThread::spawn(SlamSystem::new(config).unwrap());
        let handle = backend.handle();
        handle.submit_keyframe(keyframe(0));
        handle.submit_keyframe(keyframe(1));
        let system = backend.shutdown().unwrap();
        assert_eq!(system.stats().keyframes, 2);
        assert_eq!(handle.keyframe_count(), 2);
    }
}

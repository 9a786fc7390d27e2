use std::sync::{Arc, Mutex, PoisonError};

use rustc_hash::FxHashSet;
use tracing::debug;

/// At most one in-flight run per job type; overlapping runs are skipped, not queued.
#[derive(Debug, Clone, Default)]
pub struct JobGate {
    running: Arc<Mutex<FxHashSet<String>>>,
}

impl JobGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `job`, or `None` if a run of it is already in progress.
    pub fn try_enter(&self, job: &str) -> Option<JobGuard> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if !running.insert(job.to_string()) {
            debug!(job = %job, "job already running; skipping");
            return None;
        }
        Some(JobGuard { gate: self.clone(), job: job.to_string() })
    }

    pub fn is_running(&self, job: &str) -> bool {
        self.running.lock().unwrap_or_else(PoisonError::into_inner).contains(job)
    }
}

/// Releases the job type on drop.
#[derive(Debug)]
pub struct JobGuard {
    gate: JobGate,
    job: String,
}

impl JobGuard {
    pub fn job(&self) -> &str {
        &self.job
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.gate.running.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_runs_are_skipped() {
        let gate = JobGate::new();
        let g = gate.try_enter("check").expect("first run");
        assert!(gate.try_enter("check").is_none());
        assert!(gate.try_enter("cleanup").is_some());
        assert!(gate.is_running("check"));
        drop(g);
        assert!(!gate.is_running("check"));
        assert!(gate.try_enter("check").is_some());
    }

    #[test]
    fn clones_share_state() {
        let gate = JobGate::new();
        let other = gate.clone();
        let _g = gate.try_enter("check").unwrap();
        assert!(other.try_enter("check").is_none());
    }
}

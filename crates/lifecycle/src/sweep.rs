use std::sync::Arc;

use keel_core::ResourceState;
use keel_feedback::FeedbackEmitter;
use keel_kubehub::KindAccessor;
use keel_persist::ResourceStore;
use serde::Serialize;
use tracing::{info, warn};

use crate::{CheckOutcome, JobGate, LifecycleController, LifecycleError, Result};

pub const CHECK_JOB: &str = "lifecycle-check";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Another sweep held the gate; nothing was checked.
    pub skipped: bool,
    pub checked: usize,
    pub completed: usize,
    pub retried: usize,
    pub exhausted: usize,
    pub errors: usize,
}

/// Run `check` for every pending resource, once per gate.
pub async fn sweep_pending(
    gate: &JobGate,
    accessor: Arc<KindAccessor>,
    store: Arc<dyn ResourceStore>,
    emitter: Arc<FeedbackEmitter>,
    threshold: u32,
) -> Result<SweepReport> {
    let Some(_guard) = gate.try_enter(CHECK_JOB) else {
        return Ok(SweepReport { skipped: true, ..Default::default() });
    };
    let pending = store.list_by_state(ResourceState::Pending).map_err(LifecycleError::Store)?;
    let mut report = SweepReport::default();
    for resource in pending {
        let uniqid = resource.uniqid.clone();
        let mut ctl = LifecycleController::new(resource, accessor.clone(), store.clone(), emitter.clone());
        report.checked += 1;
        match ctl.check(threshold).await {
            Ok(CheckOutcome::Completed) => report.completed += 1,
            Ok(CheckOutcome::Retried(d)) => {
                report.retried += 1;
                if d.exhausted() {
                    report.exhausted += 1;
                }
            }
            Ok(CheckOutcome::Skipped) => {}
            Err(e) => {
                report.errors += 1;
                warn!(uniqid = %uniqid, error = %e, "check failed");
            }
        }
    }
    info!(
        checked = report.checked,
        completed = report.completed,
        retried = report.retried,
        exhausted = report.exhausted,
        "sweep finished"
    );
    Ok(report)
}

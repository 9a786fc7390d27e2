//! Keel lifecycle: drive one managed resource through its states.
//!
//! The controller owns a snapshot of the stored record, deletes and inspects the
//! cluster objects its resource type owns, and reports every terminal or retry
//! decision through the feedback emitter.

#![forbid(unsafe_code)]

use std::sync::Arc;

use keel_core::{
    ClusterObjectRef, FeedbackCode, Labels, ManagedResource, ObjectKind, OwnedKindSet, ResourceState, Stage,
};
use keel_feedback::FeedbackEmitter;
use keel_kubehub::{AccessError, KindAccessor};
use keel_persist::{ResourcePatch, ResourceStore};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

mod gate;
mod sweep;

pub use gate::{JobGate, JobGuard};
pub use sweep::{sweep_pending, SweepReport, CHECK_JOB};

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("resource {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error("store: {0:#}")]
    Store(anyhow::Error),
    #[error("feedback: {0:#}")]
    Feedback(anyhow::Error),
}

pub type Result<T, E = LifecycleError> = std::result::Result<T, E>;

/// Outcome of one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryDecision {
    pub attempts: u32,
    pub state: ResourceState,
}

impl RetryDecision {
    /// True once the retry budget is spent and the resource is `Failed`.
    pub fn exhausted(&self) -> bool {
        self.state == ResourceState::Failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum CheckOutcome {
    /// Already failed, already at the desired state, or nothing to converge on.
    Skipped,
    Completed,
    Retried(RetryDecision),
}

pub struct LifecycleController {
    resource: ManagedResource,
    kinds: OwnedKindSet,
    accessor: Arc<KindAccessor>,
    store: Arc<dyn ResourceStore>,
    emitter: Arc<FeedbackEmitter>,
}

impl LifecycleController {
    pub fn new(
        resource: ManagedResource,
        accessor: Arc<KindAccessor>,
        store: Arc<dyn ResourceStore>,
        emitter: Arc<FeedbackEmitter>,
    ) -> Self {
        let kinds = resource.owned_kinds();
        Self { resource, kinds, accessor, store, emitter }
    }

    /// Build a controller for the stored record `uniqid`.
    pub fn load(
        uniqid: &str,
        accessor: Arc<KindAccessor>,
        store: Arc<dyn ResourceStore>,
        emitter: Arc<FeedbackEmitter>,
    ) -> Result<Self> {
        let resource = fetch(store.as_ref(), uniqid)?;
        Ok(Self::new(resource, accessor, store, emitter))
    }

    pub fn resource(&self) -> &ManagedResource {
        &self.resource
    }

    pub fn owned_kinds(&self) -> &OwnedKindSet {
        &self.kinds
    }

    fn identity(&self) -> Labels {
        self.resource.identity().to_labels()
    }

    fn refresh(&mut self) -> Result<()> {
        self.resource = fetch(self.store.as_ref(), &self.resource.uniqid)?;
        Ok(())
    }

    /// Record one failed attempt at `stage` and decide between another try and `Failed`.
    ///
    /// The store increments the count and sets the state in one step, so
    /// concurrent callers never lose an attempt. The feedback message follows.
    pub async fn decide_retry(&mut self, threshold: u32, stage: Stage) -> Result<RetryDecision> {
        let uniqid = self.resource.uniqid.clone();
        let rec = self
            .store
            .record_attempt(&uniqid, threshold)
            .map_err(LifecycleError::Store)?
            .ok_or_else(|| LifecycleError::NotFound(uniqid.clone()))?;
        let (attempts, state) = (rec.attempts, rec.state);
        let details = match state {
            ResourceState::Failed => format!("{} failed", rec.desired_state),
            _ => format!("{} failed , try again", rec.desired_state),
        };
        self.emitter
            .emit(FeedbackCode::ClusterOperationException, stage, &uniqid, &details)
            .await
            .map_err(LifecycleError::Feedback)?;
        self.refresh()?;

        let decision = RetryDecision { attempts, state };
        counter!("lifecycle_retry_total", 1u64);
        if decision.exhausted() {
            counter!("lifecycle_exhausted_total", 1u64);
            warn!(uniqid = %uniqid, attempts, threshold, stage = %stage, "retries exhausted");
        } else {
            info!(uniqid = %uniqid, attempts, threshold, stage = %stage, "attempt failed; will retry");
        }
        Ok(decision)
    }

    /// Terminal success: the resource reaches its desired state and the attempt count resets.
    pub async fn complete(&mut self, stage: Stage) -> Result<()> {
        let current = fetch(self.store.as_ref(), &self.resource.uniqid)?;
        let desired = current.desired_state;
        let patch = ResourcePatch { state: Some(desired), attempt_times: Some(0), message: None };
        self.emitter
            .emit_with(FeedbackCode::Success, stage, &current.uniqid, &format!("{} success", desired), patch)
            .await
            .map_err(LifecycleError::Feedback)?;
        self.refresh()?;
        counter!("lifecycle_complete_total", 1u64);
        info!(uniqid = %current.uniqid, state = %desired, stage = %stage, "resource converged");
        Ok(())
    }

    pub fn reset_attempts(&mut self) -> Result<()> {
        let patch = ResourcePatch { attempt_times: Some(0), ..Default::default() };
        let updated = self.store.update(&self.resource.uniqid, &patch).map_err(LifecycleError::Store)?;
        if !updated {
            return Err(LifecycleError::NotFound(self.resource.uniqid.clone()));
        }
        self.refresh()?;
        debug!(uniqid = %self.resource.uniqid, "attempts reset");
        Ok(())
    }

    /// Delete every owned object carrying this resource's identity labels.
    pub async fn clear(&self) -> usize {
        self.delete_owned(true).await
    }

    /// `clear`, keeping persistent volume claims.
    pub async fn stop(&self) -> usize {
        self.delete_owned(false).await
    }

    async fn delete_owned(&self, include_pvc: bool) -> usize {
        let identity = self.identity();
        let mut deleted = 0usize;
        for kind in self.kinds.selected(include_pvc) {
            deleted += self.accessor.delete(kind, None, Some(&identity), None).await;
        }
        counter!("lifecycle_deleted_total", deleted as u64);
        info!(uniqid = %self.resource.uniqid, deleted, include_pvc, "owned objects deleted");
        deleted
    }

    /// Whether any owned object exists. Lookup failures count as absence.
    pub async fn resource_exists(&self, include_pvc: bool) -> bool {
        let identity = self.identity();
        for kind in self.kinds.selected(include_pvc) {
            if !self.accessor.get(kind, None, Some(&identity)).await.is_empty() {
                return true;
            }
        }
        false
    }

    /// `resource_exists` that reports lookup failures instead of hiding them.
    pub async fn try_resource_exists(&self, include_pvc: bool) -> Result<bool> {
        let identity = self.identity();
        for kind in self.kinds.selected(include_pvc) {
            if !self.accessor.try_get(kind, None, Some(&identity)).await?.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// True only when at least one claim matched and every match is `Bound`.
    ///
    /// Without a selector the claim named after the resource is checked.
    pub async fn pvc_available(&self, name: Option<&str>, labels: Option<&Labels>) -> bool {
        let name = match (name.filter(|n| !n.is_empty()), labels) {
            (None, None) => Some(self.resource.name.as_str()),
            (n, _) => n,
        };
        let claims = self.accessor.get(ObjectKind::PersistentVolumeClaim, name, labels).await;
        let bound = claims.iter().filter(|c| c.phase() == Some("Bound")).count();
        debug!(uniqid = %self.resource.uniqid, claims = claims.len(), bound, "claim availability");
        !claims.is_empty() && bound == claims.len()
    }

    #[deprecated(note = "use KindAccessor::get and pick the object explicitly")]
    pub async fn get_first_resource(
        &self,
        kind: ObjectKind,
        name: Option<&str>,
        labels: Option<&Labels>,
    ) -> Option<ClusterObjectRef> {
        self.accessor.get(kind, name, labels).await.into_iter().next()
    }

    /// One scheduler tick: inspect the cluster and either complete or record a failed attempt.
    pub async fn check(&mut self, threshold: u32) -> Result<CheckOutcome> {
        self.refresh()?;
        let r = &self.resource;
        if r.state == ResourceState::Failed || r.state == r.desired_state {
            return Ok(CheckOutcome::Skipped);
        }
        let desired = r.desired_state;
        let stage = Stage::for_desired(desired);
        let converged = match desired {
            ResourceState::Destroyed => self.try_resource_exists(true).await.map(|exists| !exists),
            ResourceState::Stopped => self.try_resource_exists(false).await.map(|exists| !exists),
            ResourceState::Started | ResourceState::Restarted | ResourceState::Created => {
                match self.try_resource_exists(false).await {
                    Ok(true) if self.kinds.contains(ObjectKind::PersistentVolumeClaim) => {
                        Ok(self.pvc_available(None, None).await)
                    }
                    other => other,
                }
            }
            ResourceState::Pending | ResourceState::Failed => return Ok(CheckOutcome::Skipped),
        };
        let converged = converged.unwrap_or_else(|e| {
            warn!(uniqid = %self.resource.uniqid, error = %e, "existence check failed; counting as a failed attempt");
            false
        });
        if converged {
            self.complete(stage).await?;
            Ok(CheckOutcome::Completed)
        } else {
            Ok(CheckOutcome::Retried(self.decide_retry(threshold, stage).await?))
        }
    }
}

fn fetch(store: &dyn ResourceStore, uniqid: &str) -> Result<ManagedResource> {
    store
        .get(uniqid)
        .map_err(LifecycleError::Store)?
        .ok_or_else(|| LifecycleError::NotFound(uniqid.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ResourceType;
    use keel_feedback::RecordingIntake;
    use keel_kubehub::mock::{claim, object};
    use keel_kubehub::MockCluster;
    use keel_persist::MemoryStore;

    fn resource(rt: ResourceType) -> ManagedResource {
        ManagedResource {
            uniqid: "abc123".into(),
            name: "orders-db".into(),
            appkey: "ak-1".into(),
            channel: "web".into(),
            resource_type: rt,
            desired_state: ResourceState::Started,
            state: ResourceState::Pending,
            attempt_times: 0,
            labels: Labels::new(),
            message: None,
        }
    }

    fn controller(r: ManagedResource, mock: Arc<MockCluster>) -> LifecycleController {
        let store: Arc<dyn ResourceStore> = Arc::new(MemoryStore::with(r.clone()));
        let emitter = Arc::new(FeedbackEmitter::new(store.clone(), Arc::new(RecordingIntake::new())));
        LifecycleController::new(r, Arc::new(KindAccessor::new(mock)), store, emitter)
    }

    #[tokio::test]
    async fn pvc_defaults_to_resource_name() {
        let r = resource(ResourceType::Database);
        let ident = r.identity().to_labels();
        let mock = Arc::new(MockCluster::new().with_object(claim("orders-db", &ident, "Bound")));
        let c = controller(r, mock);
        assert!(c.pvc_available(None, None).await);
        assert!(c.pvc_available(Some(""), None).await);
        assert!(!c.pvc_available(Some("other"), None).await);
    }

    #[tokio::test]
    async fn pvc_requires_every_claim_bound() {
        let r = resource(ResourceType::Database);
        let ident = r.identity().to_labels();
        let mock = Arc::new(
            MockCluster::new()
                .with_object(claim("data-0", &ident, "Bound"))
                .with_object(claim("data-1", &ident, "Pending")),
        );
        let c = controller(r, mock.clone());
        assert!(!c.pvc_available(None, Some(&ident)).await);
        mock.insert(claim("data-2", &ident, "Bound"));
        assert!(!c.pvc_available(None, Some(&ident)).await);
        assert!(c.pvc_available(Some("data-0"), None).await);
    }

    #[tokio::test]
    async fn first_resource_is_first_match() {
        let r = resource(ResourceType::Cache);
        let ident = r.identity().to_labels();
        let mock = Arc::new(
            MockCluster::new()
                .with_object(object(ObjectKind::Service, "a", &ident))
                .with_object(object(ObjectKind::Service, "b", &ident)),
        );
        let c = controller(r, mock);
        #[allow(deprecated)]
        let first = c.get_first_resource(ObjectKind::Service, None, Some(&ident)).await;
        assert_eq!(first.map(|o| o.name), Some("a".to_string()));
        #[allow(deprecated)]
        let none = c.get_first_resource(ObjectKind::Service, None, None).await;
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn try_resource_exists_surfaces_errors() {
        let r = resource(ResourceType::Cache);
        let mock = Arc::new(MockCluster::new());
        mock.fail_kind(ObjectKind::StatefulSet);
        let c = controller(r, mock);
        assert!(!c.resource_exists(true).await);
        assert!(matches!(c.try_resource_exists(true).await, Err(LifecycleError::Access(_))));
    }

    #[tokio::test]
    async fn reset_attempts_zeroes_count() {
        let mut r = resource(ResourceType::Cache);
        r.attempt_times = 2;
        let mut c = controller(r, Arc::new(MockCluster::new()));
        c.reset_attempts().unwrap();
        assert_eq!(c.resource().attempt_times, 0);
    }

    #[test]
    fn check_outcome_serializes_with_tag() {
        let v = serde_json::to_value(CheckOutcome::Retried(RetryDecision {
            attempts: 2,
            state: ResourceState::Pending,
        }))
        .unwrap();
        assert_eq!(v["outcome"], "retried");
        assert_eq!(v["attempts"], 2);
        assert_eq!(v["state"], "pending");
    }
}

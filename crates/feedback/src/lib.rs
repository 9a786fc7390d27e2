//! Keel feedback: report lifecycle outcomes upstream.
//!
//! [`FeedbackEmitter::emit`] records the outcome on the resource and hands a
//! typed [`TaskEvent`] to the in-process task intake. The outward
//! [`CallbackNotifier`] is separate and strictly best-effort.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use keel_core::{FeedbackCode, ManagedResource, Stage};
use keel_persist::{ResourcePatch, ResourceStore};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

mod callback;

pub use callback::{CallbackNotifier, CallbackOutcome};

pub const OCCURRENCE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Outcome record, serialized onto the resource's `message`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Feedback {
    pub code: FeedbackCode,
    pub stage: Stage,
    pub uniqid: String,
    pub details: String,
    pub occurrence_time: String,
}

impl Feedback {
    pub fn new(code: FeedbackCode, stage: Stage, uniqid: &str, details: impl Into<String>) -> Self {
        Self {
            code,
            stage,
            uniqid: uniqid.to_string(),
            details: details.into(),
            occurrence_time: chrono::Utc::now().format(OCCURRENCE_TIME_FORMAT).to_string(),
        }
    }
}

/// Event delivered to task intake: the outcome plus the full resource record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskEvent {
    pub event_id: Uuid,
    #[serde(flatten)]
    pub feedback: Feedback,
    pub resource: ManagedResource,
}

/// In-process consumer of lifecycle outcomes.
#[async_trait]
pub trait TaskIntake: Send + Sync {
    async fn submit(&self, event: TaskEvent) -> Result<()>;
}

/// Task intake fed through a bounded channel.
#[derive(Clone)]
pub struct ChannelIntake {
    tx: mpsc::Sender<TaskEvent>,
}

impl ChannelIntake {
    pub fn new(cap: usize) -> (Self, mpsc::Receiver<TaskEvent>) {
        let (tx, rx) = mpsc::channel(cap.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TaskIntake for ChannelIntake {
    async fn submit(&self, event: TaskEvent) -> Result<()> {
        self.tx.send(event).await.map_err(|_| anyhow!("task intake channel closed"))
    }
}

/// Keeps every submitted event; for tests and dry runs.
#[derive(Default)]
pub struct RecordingIntake {
    events: Mutex<Vec<TaskEvent>>,
}

impl RecordingIntake {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TaskEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl TaskIntake for RecordingIntake {
    async fn submit(&self, event: TaskEvent) -> Result<()> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
        Ok(())
    }
}

#[async_trait]
impl<T: TaskIntake + ?Sized> TaskIntake for Arc<T> {
    async fn submit(&self, event: TaskEvent) -> Result<()> {
        (**self).submit(event).await
    }
}

pub struct FeedbackEmitter {
    store: Arc<dyn ResourceStore>,
    intake: Arc<dyn TaskIntake>,
}

impl FeedbackEmitter {
    pub fn new(store: Arc<dyn ResourceStore>, intake: Arc<dyn TaskIntake>) -> Self {
        Self { store, intake }
    }

    pub async fn emit(&self, code: FeedbackCode, stage: Stage, uniqid: &str, details: &str) -> Result<Feedback> {
        self.emit_with(code, stage, uniqid, details, ResourcePatch::default()).await
    }

    /// `emit`, writing `patch` in the same store update as the message.
    pub async fn emit_with(
        &self,
        code: FeedbackCode,
        stage: Stage,
        uniqid: &str,
        details: &str,
        mut patch: ResourcePatch,
    ) -> Result<Feedback> {
        let feedback = Feedback::new(code, stage, uniqid, details);
        patch.message = Some(serde_json::to_string(&feedback).context("serializing feedback")?);
        if !self.store.update(uniqid, &patch)? {
            return Err(anyhow!("resource {} not found", uniqid));
        }
        let resource = self
            .store
            .get(uniqid)?
            .ok_or_else(|| anyhow!("resource {} vanished after update", uniqid))?;
        let event = TaskEvent { event_id: Uuid::new_v4(), feedback: feedback.clone(), resource };
        debug!(event_id = %event.event_id, "dispatching task event");
        self.intake
            .submit(event)
            .await
            .with_context(|| format!("delivering feedback for {}", uniqid))?;
        counter!("feedback_emitted_total", 1u64);
        info!(uniqid = %uniqid, code = %code, stage = %stage, details = %details, "feedback emitted");
        Ok(feedback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{Labels, ResourceState, ResourceType};
    use keel_persist::MemoryStore;

    fn resource() -> ManagedResource {
        ManagedResource {
            uniqid: "abc123".into(),
            name: "orders-db".into(),
            appkey: "ak-1".into(),
            channel: "web".into(),
            resource_type: ResourceType::Database,
            desired_state: ResourceState::Started,
            state: ResourceState::Pending,
            attempt_times: 1,
            labels: Labels::new(),
            message: None,
        }
    }

    #[tokio::test]
    async fn emit_persists_message_and_dispatches_event() {
        let store = Arc::new(MemoryStore::with(resource()));
        let intake = Arc::new(RecordingIntake::new());
        let emitter = FeedbackEmitter::new(store.clone(), intake.clone());

        let fb = emitter
            .emit(FeedbackCode::ClusterOperationException, Stage::Start, "abc123", "started failed")
            .await
            .unwrap();

        let stored = store.get("abc123").unwrap().unwrap();
        let msg: Feedback = serde_json::from_str(stored.message.as_deref().unwrap()).unwrap();
        assert_eq!(msg, fb);

        let events = intake.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].feedback, fb);
        assert_eq!(events[0].resource.uniqid, "abc123");
        assert_eq!(events[0].resource.message, stored.message);
    }

    #[tokio::test]
    async fn emit_with_writes_patch_atomically() {
        let store = Arc::new(MemoryStore::with(resource()));
        let emitter = FeedbackEmitter::new(store.clone(), Arc::new(RecordingIntake::new()));
        let patch = ResourcePatch { state: Some(ResourceState::Failed), attempt_times: Some(3), message: None };
        emitter
            .emit_with(FeedbackCode::ClusterOperationException, Stage::Start, "abc123", "started failed", patch)
            .await
            .unwrap();
        let stored = store.get("abc123").unwrap().unwrap();
        assert_eq!(stored.state, ResourceState::Failed);
        assert_eq!(stored.attempt_times, 3);
        assert!(stored.message.is_some());
    }

    #[tokio::test]
    async fn emit_for_unknown_resource_fails() {
        let intake = Arc::new(RecordingIntake::new());
        let emitter = FeedbackEmitter::new(Arc::new(MemoryStore::new()), intake.clone());
        assert!(emitter.emit(FeedbackCode::Success, Stage::Stop, "nope", "stopped success").await.is_err());
        assert!(intake.events().is_empty());
    }

    #[tokio::test]
    async fn channel_intake_delivers_and_reports_closed() {
        let (intake, mut rx) = ChannelIntake::new(4);
        let event = TaskEvent {
            event_id: Uuid::new_v4(),
            feedback: Feedback::new(FeedbackCode::Success, Stage::Destroy, "abc123", "destroyed success"),
            resource: resource(),
        };
        intake.submit(event.clone()).await.unwrap();
        assert_eq!(rx.recv().await, Some(event.clone()));
        drop(rx);
        assert!(intake.submit(event).await.is_err());
    }

    #[test]
    fn task_event_flattens_feedback_fields() {
        let event = TaskEvent {
            event_id: Uuid::nil(),
            feedback: Feedback::new(FeedbackCode::Success, Stage::Start, "abc123", "started success"),
            resource: resource(),
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["code"], "Success");
        assert_eq!(v["stage"], "start");
        assert_eq!(v["uniqid"], "abc123");
        assert_eq!(v["resource"]["name"], "orders-db");
        assert_eq!(v["occurrence_time"].as_str().map(str::len), Some(19));
    }
}

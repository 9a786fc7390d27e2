//! In-memory `ClusterClient` for tests and dry runs.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use keel_core::{ClusterObjectRef, DeleteOptions, Labels, ObjectKind, SelectorQuery};
use rustc_hash::FxHashSet;

use crate::{AccessError, ClusterClient};

/// A call observed by the mock, in issue order.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterCall {
    Exists { kind: ObjectKind, name: String },
    List { kind: ObjectKind, query: SelectorQuery },
    Delete { kind: ObjectKind, name: String, options: Option<DeleteOptions> },
    PatchMetadata { kind: ObjectKind, name: String, patch: serde_json::Value },
}

#[derive(Default)]
struct MockState {
    objects: Vec<ClusterObjectRef>,
    calls: Vec<ClusterCall>,
    failing: FxHashSet<ObjectKind>,
}

#[derive(Default)]
pub struct MockCluster {
    state: Mutex<MockState>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(self, obj: ClusterObjectRef) -> Self {
        self.insert(obj);
        self
    }

    pub fn insert(&self, obj: ClusterObjectRef) {
        self.lock().objects.push(obj);
    }

    /// Every call against `kind` fails with a transport-style error.
    pub fn fail_kind(&self, kind: ObjectKind) {
        self.lock().failing.insert(kind);
    }

    pub fn calls(&self) -> Vec<ClusterCall> {
        self.lock().calls.clone()
    }

    pub fn deletes(&self) -> Vec<ClusterCall> {
        self.calls().into_iter().filter(|c| matches!(c, ClusterCall::Delete { .. })).collect()
    }

    pub fn objects(&self, kind: ObjectKind) -> Vec<ClusterObjectRef> {
        self.lock().objects.iter().filter(|o| o.kind == kind).cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(state: &MockState, kind: ObjectKind) -> Result<(), AccessError> {
        if state.failing.contains(&kind) {
            return Err(AccessError::Cluster(format!("injected failure for {}", kind)));
        }
        Ok(())
    }
}

/// Convenience constructor for fixture objects.
pub fn object(kind: ObjectKind, name: &str, labels: &Labels) -> ClusterObjectRef {
    ClusterObjectRef {
        kind,
        name: name.to_string(),
        namespace: Some("default".to_string()),
        labels: labels.clone(),
        annotations: Labels::new(),
        status: serde_json::Value::Null,
    }
}

/// A volume claim fixture reporting `phase`.
pub fn claim(name: &str, labels: &Labels, phase: &str) -> ClusterObjectRef {
    let mut o = object(ObjectKind::PersistentVolumeClaim, name, labels);
    o.status = serde_json::json!({ "phase": phase });
    o
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn exists(&self, kind: ObjectKind, name: &str) -> Result<bool, AccessError> {
        let mut st = self.lock();
        st.calls.push(ClusterCall::Exists { kind, name: name.to_string() });
        Self::check(&st, kind)?;
        Ok(st.objects.iter().any(|o| o.kind == kind && o.name == name))
    }

    async fn list(&self, kind: ObjectKind, query: &SelectorQuery) -> Result<Vec<ClusterObjectRef>, AccessError> {
        let mut st = self.lock();
        st.calls.push(ClusterCall::List { kind, query: query.clone() });
        Self::check(&st, kind)?;
        let hits = st
            .objects
            .iter()
            .filter(|o| o.kind == kind)
            .filter(|o| match query {
                SelectorQuery::ByName(n) => &o.name == n,
                SelectorQuery::ByLabels(l) => o.matches_labels(l),
                SelectorQuery::Nothing => false,
            })
            .cloned()
            .collect();
        Ok(hits)
    }

    async fn delete(&self, kind: ObjectKind, name: &str, options: Option<DeleteOptions>) -> Result<(), AccessError> {
        let mut st = self.lock();
        st.calls.push(ClusterCall::Delete { kind, name: name.to_string(), options });
        Self::check(&st, kind)?;
        st.objects.retain(|o| !(o.kind == kind && o.name == name));
        Ok(())
    }

    async fn patch_metadata(
        &self,
        kind: ObjectKind,
        name: &str,
        patch: &serde_json::Value,
        _field_manager: &str,
    ) -> Result<(), AccessError> {
        let mut st = self.lock();
        st.calls.push(ClusterCall::PatchMetadata { kind, name: name.to_string(), patch: patch.clone() });
        Self::check(&st, kind)?;
        let obj = st
            .objects
            .iter_mut()
            .find(|o| o.kind == kind && o.name == name)
            .ok_or_else(|| AccessError::Cluster(format!("{} {} not found", kind, name)))?;
        merge_map(&mut obj.labels, &patch["metadata"]["labels"]);
        merge_map(&mut obj.annotations, &patch["metadata"]["annotations"]);
        Ok(())
    }
}

/// Merge-patch semantics on a string map: `null` removes, strings set.
fn merge_map(target: &mut Labels, patch: &serde_json::Value) {
    let Some(entries) = patch.as_object() else { return };
    for (k, v) in entries {
        match v {
            serde_json::Value::Null => {
                target.remove(k);
            }
            serde_json::Value::String(s) => {
                target.insert(k.clone(), s.clone());
            }
            other => {
                target.insert(k.clone(), other.to_string());
            }
        }
    }
}

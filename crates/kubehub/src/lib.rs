//! Keel kubehub: generic get/delete over the allow-listed object kinds.
//!
//! [`KindAccessor`] is the only path through which owned cluster objects are
//! observed or removed. The cluster itself is consumed through the
//! [`ClusterClient`] capability; [`KubeClusterClient`] talks to a real API
//! server, [`MockCluster`] keeps objects in memory.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use keel_core::{ClusterObjectRef, DeleteOptions, Labels, ObjectKind, SelectorQuery};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

mod client;
pub mod mock;

pub use client::KubeClusterClient;
pub use mock::{ClusterCall, MockCluster};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum AccessError {
    #[error("no cluster client configured")]
    NoClient,
    #[error("kind not addressable: {0}")]
    UnknownKind(String),
    #[error("cluster: {0}")]
    Cluster(String),
}

impl From<kube::Error> for AccessError {
    fn from(e: kube::Error) -> Self {
        AccessError::Cluster(e.to_string())
    }
}

/// Cluster API capability: existence, selection and deletion by name.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn exists(&self, kind: ObjectKind, name: &str) -> Result<bool, AccessError>;

    /// Objects matching `query`. `SelectorQuery::Nothing` must yield nothing.
    async fn list(&self, kind: ObjectKind, query: &SelectorQuery) -> Result<Vec<ClusterObjectRef>, AccessError>;

    async fn delete(&self, kind: ObjectKind, name: &str, options: Option<DeleteOptions>) -> Result<(), AccessError>;

    /// Apply a JSON merge patch to the object's metadata.
    async fn patch_metadata(
        &self,
        kind: ObjectKind,
        name: &str,
        patch: &serde_json::Value,
        field_manager: &str,
    ) -> Result<(), AccessError>;
}

#[async_trait]
impl<T: ClusterClient + ?Sized> ClusterClient for Arc<T> {
    async fn exists(&self, kind: ObjectKind, name: &str) -> Result<bool, AccessError> {
        (**self).exists(kind, name).await
    }

    async fn list(&self, kind: ObjectKind, query: &SelectorQuery) -> Result<Vec<ClusterObjectRef>, AccessError> {
        (**self).list(kind, query).await
    }

    async fn delete(&self, kind: ObjectKind, name: &str, options: Option<DeleteOptions>) -> Result<(), AccessError> {
        (**self).delete(kind, name, options).await
    }

    async fn patch_metadata(
        &self,
        kind: ObjectKind,
        name: &str,
        patch: &serde_json::Value,
        field_manager: &str,
    ) -> Result<(), AccessError> {
        (**self).patch_metadata(kind, name, patch, field_manager).await
    }
}

/// Map a kind name onto the allow-list.
pub fn parse_kind(kind: &str) -> Result<ObjectKind, AccessError> {
    kind.parse::<ObjectKind>().map_err(|_| AccessError::UnknownKind(kind.to_string()))
}

/// Allow-listed accessor over a swappable cluster client handle.
pub struct KindAccessor {
    client: ArcSwapOption<Box<dyn ClusterClient>>,
}

impl KindAccessor {
    pub fn new(client: impl ClusterClient + 'static) -> Self {
        let boxed: Box<dyn ClusterClient> = Box::new(client);
        Self { client: ArcSwapOption::from_pointee(boxed) }
    }

    /// Accessor without a client; every call fails closed.
    pub fn detached() -> Self {
        Self { client: ArcSwapOption::empty() }
    }

    pub fn set_client(&self, client: impl ClusterClient + 'static) {
        let boxed: Box<dyn ClusterClient> = Box::new(client);
        self.client.store(Some(Arc::new(boxed)));
    }

    pub fn clear_client(&self) {
        self.client.store(None);
    }

    pub fn has_client(&self) -> bool {
        self.client.load().is_some()
    }

    fn handle(&self) -> Result<Arc<Box<dyn ClusterClient>>, AccessError> {
        self.client.load_full().ok_or(AccessError::NoClient)
    }

    /// Resolve objects of `kind` by exact name, else by label set.
    ///
    /// A name is checked for existence first and then fetched through the
    /// `metadata.name` field selector. Without a name or a valid label map the
    /// result is empty.
    pub async fn try_get(
        &self,
        kind: ObjectKind,
        name: Option<&str>,
        labels: Option<&Labels>,
    ) -> Result<Vec<ClusterObjectRef>, AccessError> {
        let client = self.handle()?;
        let t0 = Instant::now();
        counter!("accessor_get_total", 1u64);
        let query = SelectorQuery::resolve(name, labels);
        let out = match &query {
            SelectorQuery::ByName(n) => {
                if client.exists(kind, n).await? {
                    client.list(kind, &query).await?
                } else {
                    Vec::new()
                }
            }
            SelectorQuery::ByLabels(_) => client.list(kind, &query).await?,
            SelectorQuery::Nothing => {
                debug!(kind = %kind, "get without name or labels; selecting nothing");
                Vec::new()
            }
        };
        histogram!("accessor_get_ms", t0.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    /// Fail-closed `try_get`: any error is logged and becomes an empty result.
    ///
    /// Callers cannot tell "not found" from a transport failure here; use
    /// [`KindAccessor::try_get`] when that difference matters.
    pub async fn get(&self, kind: ObjectKind, name: Option<&str>, labels: Option<&Labels>) -> Vec<ClusterObjectRef> {
        match self.try_get(kind, name, labels).await {
            Ok(v) => v,
            Err(e) => {
                counter!("accessor_errors_total", 1u64);
                warn!(kind = %kind, name = ?name, error = %e, "get failed; treating as empty");
                Vec::new()
            }
        }
    }

    /// `get` addressed by kind name. Names outside the allow-list yield nothing.
    pub async fn get_named(&self, kind: &str, name: Option<&str>, labels: Option<&Labels>) -> Vec<ClusterObjectRef> {
        match parse_kind(kind) {
            Ok(k) => self.get(k, name, labels).await,
            Err(e) => {
                warn!(error = %e, "ignoring get");
                Vec::new()
            }
        }
    }

    /// Delete what `try_get` resolves; returns how many objects were deleted.
    ///
    /// Deployments and StatefulSets are deleted with a propagation policy
    /// (default background) and only the first match is removed. Every other
    /// kind deletes all matches without a policy.
    pub async fn try_delete(
        &self,
        kind: ObjectKind,
        name: Option<&str>,
        labels: Option<&Labels>,
        options: Option<DeleteOptions>,
    ) -> Result<usize, AccessError> {
        let targets = self.try_get(kind, name, labels).await?;
        if targets.is_empty() {
            return Ok(0);
        }
        let client = self.handle()?;
        counter!("accessor_delete_total", 1u64);
        if kind.is_workload() {
            // TODO: confirm whether several same-identity workloads can exist; only the first is removed today.
            if targets.len() > 1 {
                warn!(kind = %kind, matched = targets.len(), "multiple workloads matched; deleting only the first");
            }
            let first = &targets[0];
            client.delete(kind, &first.name, Some(options.unwrap_or_default())).await?;
            info!(kind = %kind, name = %first.name, "deleted");
            return Ok(1);
        }
        for obj in &targets {
            client.delete(kind, &obj.name, None).await?;
            info!(kind = %kind, name = %obj.name, "deleted");
        }
        Ok(targets.len())
    }

    /// Fail-closed `try_delete`: errors are logged and reported as zero deletions.
    pub async fn delete(
        &self,
        kind: ObjectKind,
        name: Option<&str>,
        labels: Option<&Labels>,
        options: Option<DeleteOptions>,
    ) -> usize {
        match self.try_delete(kind, name, labels, options).await {
            Ok(n) => n,
            Err(e) => {
                counter!("accessor_errors_total", 1u64);
                warn!(kind = %kind, name = ?name, error = %e, "delete failed");
                0
            }
        }
    }

    /// `delete` addressed by kind name. Names outside the allow-list are a no-op.
    pub async fn delete_named(
        &self,
        kind: &str,
        name: Option<&str>,
        labels: Option<&Labels>,
        options: Option<DeleteOptions>,
    ) -> usize {
        match parse_kind(kind) {
            Ok(k) => self.delete(k, name, labels, options).await,
            Err(e) => {
                warn!(error = %e, "ignoring delete");
                0
            }
        }
    }

    /// Merge-patch the metadata of the object `name`. Errors are returned, not swallowed.
    pub async fn try_patch_metadata(
        &self,
        kind: ObjectKind,
        name: &str,
        patch: &serde_json::Value,
        field_manager: &str,
    ) -> Result<(), AccessError> {
        let client = self.handle()?;
        counter!("accessor_patch_total", 1u64);
        client.patch_metadata(kind, name, patch, field_manager).await?;
        info!(kind = %kind, name = %name, field_manager = %field_manager, "metadata patched");
        Ok(())
    }
}

//! kube-rs backed `ClusterClient`: one typed `Api<K>` per allow-listed kind.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PropagationPolicy},
    Client, Resource, ResourceExt,
};
use keel_core::{ClusterObjectRef, DeleteOptions, ObjectKind, Propagation, SelectorQuery};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::{AccessError, ClusterClient};

/// Bounds shared by every typed kind we address.
trait NamespacedKind:
    Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static
{
}

impl<K> NamespacedKind for K where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static
{
}

pub struct KubeClusterClient {
    client: Client,
    namespace: String,
}

impl KubeClusterClient {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self { client, namespace: namespace.into() }
    }

    /// Client from the ambient kubeconfig / in-cluster config.
    pub async fn try_default(namespace: impl Into<String>) -> anyhow::Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, namespace))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn api<K: NamespacedKind>(&self) -> Api<K> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn exists_as<K: NamespacedKind>(&self, name: &str) -> Result<bool, AccessError> {
        Ok(self.api::<K>().get_opt(name).await?.is_some())
    }

    async fn list_as<K: NamespacedKind>(&self, kind: ObjectKind, lp: &ListParams) -> Result<Vec<ClusterObjectRef>, AccessError> {
        let list = self.api::<K>().list(lp).await?;
        Ok(list.items.iter().map(|o| to_object_ref(kind, o)).collect())
    }

    async fn delete_as<K: NamespacedKind>(&self, name: &str, dp: &DeleteParams) -> Result<(), AccessError> {
        let res = self.api::<K>().delete(name, dp).await?;
        debug!(name = %name, in_progress = res.is_left(), "delete accepted");
        Ok(())
    }

    async fn patch_as<K: NamespacedKind>(&self, name: &str, pp: &PatchParams, patch: &serde_json::Value) -> Result<(), AccessError> {
        self.api::<K>().patch(name, pp, &Patch::Merge(patch)).await?;
        Ok(())
    }
}

fn list_params(query: &SelectorQuery) -> Option<ListParams> {
    match query {
        SelectorQuery::ByName(_) => query.field_selector().map(|f| ListParams::default().fields(&f)),
        SelectorQuery::ByLabels(_) => query.label_selector().map(|l| ListParams::default().labels(&l)),
        SelectorQuery::Nothing => None,
    }
}

fn delete_params(options: Option<DeleteOptions>) -> DeleteParams {
    let propagation_policy = options.map(|o| match o.propagation {
        Propagation::Background => PropagationPolicy::Background,
        Propagation::Foreground => PropagationPolicy::Foreground,
        Propagation::Orphan => PropagationPolicy::Orphan,
    });
    DeleteParams { propagation_policy, ..Default::default() }
}

fn to_object_ref<K: NamespacedKind>(kind: ObjectKind, obj: &K) -> ClusterObjectRef {
    let status = serde_json::to_value(obj)
        .ok()
        .and_then(|mut v| v.get_mut("status").map(serde_json::Value::take))
        .unwrap_or(serde_json::Value::Null);
    ClusterObjectRef {
        kind,
        name: obj.name_any(),
        namespace: obj.namespace(),
        labels: obj.labels().clone(),
        annotations: obj.annotations().clone(),
        status,
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn exists(&self, kind: ObjectKind, name: &str) -> Result<bool, AccessError> {
        match kind {
            ObjectKind::Deployment => self.exists_as::<Deployment>(name).await,
            ObjectKind::StatefulSet => self.exists_as::<StatefulSet>(name).await,
            ObjectKind::Service => self.exists_as::<Service>(name).await,
            ObjectKind::Ingress => self.exists_as::<Ingress>(name).await,
            ObjectKind::ConfigMap => self.exists_as::<ConfigMap>(name).await,
            ObjectKind::PersistentVolumeClaim => self.exists_as::<PersistentVolumeClaim>(name).await,
            ObjectKind::Job => self.exists_as::<Job>(name).await,
            ObjectKind::CronJob => self.exists_as::<CronJob>(name).await,
            ObjectKind::Secret => self.exists_as::<Secret>(name).await,
        }
    }

    async fn list(&self, kind: ObjectKind, query: &SelectorQuery) -> Result<Vec<ClusterObjectRef>, AccessError> {
        let Some(lp) = list_params(query) else { return Ok(Vec::new()) };
        match kind {
            ObjectKind::Deployment => self.list_as::<Deployment>(kind, &lp).await,
            ObjectKind::StatefulSet => self.list_as::<StatefulSet>(kind, &lp).await,
            ObjectKind::Service => self.list_as::<Service>(kind, &lp).await,
            ObjectKind::Ingress => self.list_as::<Ingress>(kind, &lp).await,
            ObjectKind::ConfigMap => self.list_as::<ConfigMap>(kind, &lp).await,
            ObjectKind::PersistentVolumeClaim => self.list_as::<PersistentVolumeClaim>(kind, &lp).await,
            ObjectKind::Job => self.list_as::<Job>(kind, &lp).await,
            ObjectKind::CronJob => self.list_as::<CronJob>(kind, &lp).await,
            ObjectKind::Secret => self.list_as::<Secret>(kind, &lp).await,
        }
    }

    async fn delete(&self, kind: ObjectKind, name: &str, options: Option<DeleteOptions>) -> Result<(), AccessError> {
        let dp = delete_params(options);
        match kind {
            ObjectKind::Deployment => self.delete_as::<Deployment>(name, &dp).await,
            ObjectKind::StatefulSet => self.delete_as::<StatefulSet>(name, &dp).await,
            ObjectKind::Service => self.delete_as::<Service>(name, &dp).await,
            ObjectKind::Ingress => self.delete_as::<Ingress>(name, &dp).await,
            ObjectKind::ConfigMap => self.delete_as::<ConfigMap>(name, &dp).await,
            ObjectKind::PersistentVolumeClaim => self.delete_as::<PersistentVolumeClaim>(name, &dp).await,
            ObjectKind::Job => self.delete_as::<Job>(name, &dp).await,
            ObjectKind::CronJob => self.delete_as::<CronJob>(name, &dp).await,
            ObjectKind::Secret => self.delete_as::<Secret>(name, &dp).await,
        }
    }

    async fn patch_metadata(
        &self,
        kind: ObjectKind,
        name: &str,
        patch: &serde_json::Value,
        field_manager: &str,
    ) -> Result<(), AccessError> {
        let pp = PatchParams { field_manager: Some(field_manager.to_string()), ..Default::default() };
        match kind {
            ObjectKind::Deployment => self.patch_as::<Deployment>(name, &pp, patch).await,
            ObjectKind::StatefulSet => self.patch_as::<StatefulSet>(name, &pp, patch).await,
            ObjectKind::Service => self.patch_as::<Service>(name, &pp, patch).await,
            ObjectKind::Ingress => self.patch_as::<Ingress>(name, &pp, patch).await,
            ObjectKind::ConfigMap => self.patch_as::<ConfigMap>(name, &pp, patch).await,
            ObjectKind::PersistentVolumeClaim => self.patch_as::<PersistentVolumeClaim>(name, &pp, patch).await,
            ObjectKind::Job => self.patch_as::<Job>(name, &pp, patch).await,
            ObjectKind::CronJob => self.patch_as::<CronJob>(name, &pp, patch).await,
            ObjectKind::Secret => self.patch_as::<Secret>(name, &pp, patch).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::Labels;

    #[test]
    fn name_query_uses_field_selector() {
        let lp = list_params(&SelectorQuery::ByName("db-0".into())).expect("params");
        assert_eq!(lp.field_selector.as_deref(), Some("metadata.name=db-0"));
        assert!(lp.label_selector.is_none());
    }

    #[test]
    fn label_query_uses_label_selector() {
        let mut l = Labels::new();
        l.insert("uniqid".into(), "abc".into());
        l.insert("app".into(), "db".into());
        let lp = list_params(&SelectorQuery::ByLabels(l)).expect("params");
        assert_eq!(lp.label_selector.as_deref(), Some("app=db,uniqid=abc"));
    }

    #[test]
    fn nothing_query_never_lists() {
        assert!(list_params(&SelectorQuery::Nothing).is_none());
    }

    #[test]
    fn delete_params_carry_propagation_only_when_asked() {
        assert!(delete_params(None).propagation_policy.is_none());
        let dp = delete_params(Some(DeleteOptions::default()));
        assert!(matches!(dp.propagation_policy, Some(PropagationPolicy::Background)));
    }
}

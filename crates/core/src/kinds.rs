//! Addressable cluster object kinds and the per-resource-type kind sets.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::CoreError;

/// The closed set of cluster object kinds the accessor may touch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    Deployment,
    StatefulSet,
    Service,
    Ingress,
    ConfigMap,
    PersistentVolumeClaim,
    Job,
    CronJob,
    Secret,
}

/// Allow-list, in a stable order.
pub const ALLOWED_KINDS: [ObjectKind; 9] = [
    ObjectKind::Deployment,
    ObjectKind::StatefulSet,
    ObjectKind::Service,
    ObjectKind::Ingress,
    ObjectKind::ConfigMap,
    ObjectKind::PersistentVolumeClaim,
    ObjectKind::Job,
    ObjectKind::CronJob,
    ObjectKind::Secret,
];

impl ObjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Deployment => "Deployment",
            ObjectKind::StatefulSet => "StatefulSet",
            ObjectKind::Service => "Service",
            ObjectKind::Ingress => "Ingress",
            ObjectKind::ConfigMap => "ConfigMap",
            ObjectKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ObjectKind::Job => "Job",
            ObjectKind::CronJob => "CronJob",
            ObjectKind::Secret => "Secret",
        }
    }

    /// `apiVersion` the kind is served under.
    pub fn api_version(self) -> &'static str {
        match self {
            ObjectKind::Deployment | ObjectKind::StatefulSet => "apps/v1",
            ObjectKind::Ingress => "networking.k8s.io/v1",
            ObjectKind::Job | ObjectKind::CronJob => "batch/v1",
            ObjectKind::Service
            | ObjectKind::ConfigMap
            | ObjectKind::PersistentVolumeClaim
            | ObjectKind::Secret => "v1",
        }
    }

    /// Workload kinds: deleted with a propagation policy, and only the first
    /// match is removed per delete call.
    pub fn is_workload(self) -> bool {
        matches!(self, ObjectKind::Deployment | ObjectKind::StatefulSet)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = CoreError;

    /// Exact kind names only; lowercase aliases such as `pvc` are accepted for CLI use.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(k) = ALLOWED_KINDS.iter().find(|k| k.as_str() == s) {
            return Ok(*k);
        }
        match s.to_ascii_lowercase().as_str() {
            "deployment" | "deploy" => Ok(ObjectKind::Deployment),
            "statefulset" | "sts" => Ok(ObjectKind::StatefulSet),
            "service" | "svc" => Ok(ObjectKind::Service),
            "ingress" | "ing" => Ok(ObjectKind::Ingress),
            "configmap" | "cm" => Ok(ObjectKind::ConfigMap),
            "persistentvolumeclaim" | "pvc" => Ok(ObjectKind::PersistentVolumeClaim),
            "job" => Ok(ObjectKind::Job),
            "cronjob" | "cj" => Ok(ObjectKind::CronJob),
            "secret" => Ok(ObjectKind::Secret),
            _ => Err(CoreError::UnknownKind(s.to_string())),
        }
    }
}

/// Ordered, de-duplicated set of kinds a resource type owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct OwnedKindSet {
    kinds: SmallVec<[ObjectKind; 8]>,
}

impl OwnedKindSet {
    pub fn new(kinds: impl IntoIterator<Item = ObjectKind>) -> Self {
        let mut out: SmallVec<[ObjectKind; 8]> = SmallVec::new();
        for k in kinds {
            if !out.contains(&k) {
                out.push(k);
            }
        }
        Self { kinds: out }
    }

    pub fn iter(&self) -> impl Iterator<Item = ObjectKind> + '_ {
        self.kinds.iter().copied()
    }

    /// Owned kinds minus PersistentVolumeClaim unless `include_pvc`.
    pub fn selected(&self, include_pvc: bool) -> impl Iterator<Item = ObjectKind> + '_ {
        self.iter().filter(move |k| include_pvc || *k != ObjectKind::PersistentVolumeClaim)
    }

    pub fn contains(&self, kind: ObjectKind) -> bool {
        self.kinds.contains(&kind)
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

impl FromIterator<ObjectKind> for OwnedKindSet {
    fn from_iter<T: IntoIterator<Item = ObjectKind>>(iter: T) -> Self {
        Self::new(iter)
    }
}

/// Kind of managed service a resource provisions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Database,
    Cache,
    Broker,
    Workspace,
}

impl ResourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceType::Database => "database",
            ResourceType::Cache => "cache",
            ResourceType::Broker => "broker",
            ResourceType::Workspace => "workspace",
        }
    }

    /// Kinds materialized for this resource type.
    pub fn owned_kinds(self) -> OwnedKindSet {
        use ObjectKind::*;
        match self {
            ResourceType::Database | ResourceType::Broker => {
                OwnedKindSet::new([StatefulSet, Service, ConfigMap, Secret, PersistentVolumeClaim])
            }
            ResourceType::Cache => OwnedKindSet::new([StatefulSet, Service, ConfigMap, PersistentVolumeClaim]),
            ResourceType::Workspace => OwnedKindSet::new([
                Deployment,
                Service,
                Ingress,
                ConfigMap,
                Secret,
                PersistentVolumeClaim,
                Job,
                CronJob,
            ]),
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "database" | "db" => Ok(ResourceType::Database),
            "cache" => Ok(ResourceType::Cache),
            "broker" | "mq" => Ok(ResourceType::Broker),
            "workspace" => Ok(ResourceType::Workspace),
            _ => Err(CoreError::UnknownResourceType(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_exact_names_and_aliases() {
        for k in ALLOWED_KINDS {
            assert_eq!(k.as_str().parse::<ObjectKind>().unwrap(), k);
        }
        assert_eq!("pvc".parse::<ObjectKind>().unwrap(), ObjectKind::PersistentVolumeClaim);
        assert_eq!("sts".parse::<ObjectKind>().unwrap(), ObjectKind::StatefulSet);
    }

    #[test]
    fn rejects_kinds_outside_allow_list() {
        assert!("Pod".parse::<ObjectKind>().is_err());
        assert!("DaemonSet".parse::<ObjectKind>().is_err());
        assert!("".parse::<ObjectKind>().is_err());
    }

    #[test]
    fn owned_set_dedups_and_keeps_order() {
        use ObjectKind::*;
        let set = OwnedKindSet::new([Service, StatefulSet, Service, Secret]);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![Service, StatefulSet, Secret]);
    }

    #[test]
    fn selected_can_skip_volume_claims() {
        let set = ResourceType::Database.owned_kinds();
        assert_eq!(set.selected(true).count(), 5);
        assert!(set.selected(false).all(|k| k != ObjectKind::PersistentVolumeClaim));
        assert_eq!(set.selected(false).count(), 4);
    }
}

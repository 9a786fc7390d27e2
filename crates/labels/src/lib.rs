//! Keel labels: merge user-declared labels with system identity labels.
//!
//! Keys a user dropped are tombstoned (`None`, serialized as `null`) so a merge
//! patch removes them from the object. Identity labels are overlaid last and
//! can neither be tombstoned nor overridden.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use keel_core::{normalize_labels, Labels, ManagedResource};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Annotation carrying the fingerprint of the object's declared metadata.
pub const TAG_ANNOTATION: &str = "tag";

/// Label values to apply; `None` unsets the key.
pub type LabelPatch = BTreeMap<String, Option<String>>;

pub fn reconcile_labels(observed: &Labels, desired: &Labels, system: &Labels) -> LabelPatch {
    let mut out: LabelPatch = desired.iter().map(|(k, v)| (k.clone(), Some(v.clone()))).collect();
    let mut tombstoned = 0usize;
    for key in observed.keys() {
        if !desired.contains_key(key) {
            out.insert(key.clone(), None);
            tombstoned += 1;
        }
    }
    for (k, v) in system {
        out.insert(k.clone(), Some(v.clone()));
    }
    debug!(desired = desired.len(), tombstoned, "labels reconciled");
    out
}

/// `reconcile_labels` over loosely typed maps; values are coerced to strings first.
pub fn reconcile_raw_labels(
    observed: &serde_json::Map<String, serde_json::Value>,
    desired: &serde_json::Map<String, serde_json::Value>,
    system: &Labels,
) -> LabelPatch {
    reconcile_labels(&normalize_labels(observed), &normalize_labels(desired), system)
}

/// System labels plus the `tag` fingerprint of `extra_tags` overlaid with `system`.
pub fn reconcile_annotations(system: &Labels, extra_tags: &Labels) -> Labels {
    let mut merged = extra_tags.clone();
    merged.extend(system.iter().map(|(k, v)| (k.clone(), v.clone())));
    let mut out = system.clone();
    out.insert(TAG_ANNOTATION.to_string(), fingerprint(&merged));
    out
}

/// Hex SHA-256 over the canonical (key-sorted) JSON form of `labels`.
pub fn fingerprint(labels: &Labels) -> String {
    let canonical = serde_json::to_vec(labels).unwrap_or_default();
    hex::encode(Sha256::digest(&canonical))
}

/// Labels and annotations to apply to one owned object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciledMetadata {
    pub labels: LabelPatch,
    pub annotations: Labels,
}

impl ReconciledMetadata {
    /// Compute metadata for an object of `resource` currently carrying `observed` labels.
    pub fn for_resource(resource: &ManagedResource, observed: &Labels, extra_tags: &Labels) -> Self {
        let system = resource.identity().to_labels();
        Self {
            labels: reconcile_labels(observed, &resource.labels, &system),
            annotations: reconcile_annotations(&system, extra_tags),
        }
    }

    pub fn to_merge_patch(&self) -> serde_json::Value {
        metadata_patch(&self.labels, &self.annotations)
    }
}

/// JSON merge-patch body updating `metadata.labels` and `metadata.annotations`.
pub fn metadata_patch(labels: &LabelPatch, annotations: &Labels) -> serde_json::Value {
    serde_json::json!({
        "metadata": {
            "labels": labels,
            "annotations": annotations,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{ResourceState, ResourceType, IDENTITY_LABEL_KEYS};

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn system() -> Labels {
        labels(&[("app", "orders-db"), ("appkey", "ak-1"), ("uniqid", "abc123"), ("channel", "web")])
    }

    fn resource() -> ManagedResource {
        ManagedResource {
            uniqid: "abc123".into(),
            name: "orders-db".into(),
            appkey: "ak-1".into(),
            channel: "web".into(),
            resource_type: ResourceType::Database,
            desired_state: ResourceState::Started,
            state: ResourceState::Pending,
            attempt_times: 0,
            labels: labels(&[("tier", "db")]),
            message: None,
        }
    }

    #[test]
    fn removed_keys_are_tombstoned() {
        let out = reconcile_labels(&labels(&[("tier", "cache"), ("owner", "ops")]), &labels(&[("tier", "db")]), &system());
        assert_eq!(out.get("owner"), Some(&None));
        assert_eq!(out.get("tier"), Some(&Some("db".to_string())));
    }

    #[test]
    fn identity_labels_always_present_and_non_null() {
        let hostile = labels(&[("app", "evil"), ("uniqid", "other"), ("channel", "x")]);
        for (observed, desired) in [
            (Labels::new(), Labels::new()),
            (system(), Labels::new()),
            (hostile.clone(), hostile.clone()),
            (labels(&[("appkey", "old")]), labels(&[("tier", "db")])),
        ] {
            let out = reconcile_labels(&observed, &desired, &system());
            for key in IDENTITY_LABEL_KEYS {
                assert_eq!(out.get(key), Some(&system().get(key).cloned()), "key {}", key);
            }
        }
    }

    #[test]
    fn end_to_end_example() {
        let r = resource();
        let observed = labels(&[("tier", "cache"), ("app", "x")]);
        let meta = ReconciledMetadata::for_resource(&r, &observed, &Labels::new());
        let expected: LabelPatch = [
            ("tier", "db"),
            ("app", "orders-db"),
            ("appkey", "ak-1"),
            ("uniqid", "abc123"),
            ("channel", "web"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), Some(v.to_string())))
        .collect();
        assert_eq!(meta.labels, expected);
    }

    #[test]
    fn raw_maps_are_normalized_before_comparison() {
        let observed = serde_json::json!({ "replicas": "3", "ha": "true" });
        let desired = serde_json::json!({ "replicas": 3 });
        let out = reconcile_raw_labels(
            observed.as_object().unwrap(),
            desired.as_object().unwrap(),
            &system(),
        );
        assert_eq!(out.get("replicas"), Some(&Some("3".to_string())));
        assert_eq!(out.get("ha"), Some(&None));
    }

    #[test]
    fn annotations_carry_stable_fingerprint() {
        let a = reconcile_annotations(&system(), &labels(&[("version", "14")]));
        let b = reconcile_annotations(&system(), &labels(&[("version", "14")]));
        let c = reconcile_annotations(&system(), &labels(&[("version", "15")]));
        assert_eq!(a, b);
        assert_ne!(a.get(TAG_ANNOTATION), c.get(TAG_ANNOTATION));
        assert_eq!(a.get(TAG_ANNOTATION).map(|t| t.len()), Some(64));
        for key in IDENTITY_LABEL_KEYS {
            assert!(a.contains_key(key));
        }
    }

    #[test]
    fn extra_tags_cannot_override_identity_in_fingerprint() {
        let spoofed = reconcile_annotations(&system(), &labels(&[("uniqid", "zzz999"), ("version", "14")]));
        let plain = reconcile_annotations(&system(), &labels(&[("version", "14")]));
        assert_eq!(spoofed.get(TAG_ANNOTATION), plain.get(TAG_ANNOTATION));
        assert_eq!(spoofed.get("uniqid").map(String::as_str), Some("abc123"));
    }

    #[test]
    fn merge_patch_serializes_tombstones_as_null() {
        let meta = ReconciledMetadata {
            labels: reconcile_labels(&labels(&[("gone", "1")]), &Labels::new(), &system()),
            annotations: Labels::new(),
        };
        let patch = meta.to_merge_patch();
        assert_eq!(patch["metadata"]["labels"]["gone"], serde_json::Value::Null);
        assert_eq!(patch["metadata"]["labels"]["uniqid"], "abc123");
    }
}

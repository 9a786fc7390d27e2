//! Keel core types: managed resources, owned object kinds, selectors.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub mod kinds;
pub mod settings;

pub use kinds::{ObjectKind, OwnedKindSet, ResourceType, ALLOWED_KINDS};
pub use settings::Settings;

/// Label/annotation map with plain string values.
pub type Labels = BTreeMap<String, String>;

pub const LABEL_APP: &str = "app";
pub const LABEL_APPKEY: &str = "appkey";
pub const LABEL_UNIQID: &str = "uniqid";
pub const LABEL_CHANNEL: &str = "channel";

/// System identity label keys, present on every owned object.
pub const IDENTITY_LABEL_KEYS: [&str; 4] = [LABEL_APP, LABEL_APPKEY, LABEL_UNIQID, LABEL_CHANNEL];

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("unknown object kind: {0}")]
    UnknownKind(String),
    #[error("unknown resource state: {0}")]
    UnknownState(String),
    #[error("unknown resource type: {0}")]
    UnknownResourceType(String),
    #[error("unknown stage: {0}")]
    UnknownStage(String),
}

/// Lifecycle state of a managed resource. Also used for the desired state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResourceState {
    Created,
    Pending,
    Started,
    Restarted,
    Stopped,
    Destroyed,
    Failed,
}

impl ResourceState {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceState::Created => "created",
            ResourceState::Pending => "pending",
            ResourceState::Started => "started",
            ResourceState::Restarted => "restarted",
            ResourceState::Stopped => "stopped",
            ResourceState::Destroyed => "destroyed",
            ResourceState::Failed => "failed",
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "created" => Ok(ResourceState::Created),
            "pending" => Ok(ResourceState::Pending),
            "started" => Ok(ResourceState::Started),
            "restarted" => Ok(ResourceState::Restarted),
            "stopped" => Ok(ResourceState::Stopped),
            "destroyed" => Ok(ResourceState::Destroyed),
            "failed" => Ok(ResourceState::Failed),
            _ => Err(CoreError::UnknownState(s.to_string())),
        }
    }
}

/// Operation stage reported back to task intake (the "deploy type").
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Create,
    Start,
    Stop,
    Restart,
    Destroy,
    Update,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Create => "create",
            Stage::Start => "start",
            Stage::Stop => "stop",
            Stage::Restart => "restart",
            Stage::Destroy => "destroy",
            Stage::Update => "update",
        }
    }

    /// Stage that drives a resource towards `desired`.
    pub fn for_desired(desired: ResourceState) -> Stage {
        match desired {
            ResourceState::Started => Stage::Start,
            ResourceState::Restarted => Stage::Restart,
            ResourceState::Stopped => Stage::Stop,
            ResourceState::Destroyed => Stage::Destroy,
            ResourceState::Created | ResourceState::Pending | ResourceState::Failed => Stage::Create,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(Stage::Create),
            "start" => Ok(Stage::Start),
            "stop" => Ok(Stage::Stop),
            "restart" => Ok(Stage::Restart),
            "destroy" => Ok(Stage::Destroy),
            "update" => Ok(Stage::Update),
            _ => Err(CoreError::UnknownStage(s.to_string())),
        }
    }
}

/// Outcome codes carried by feedback records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FeedbackCode {
    Success,
    ClusterOperationException,
}

impl FeedbackCode {
    pub fn as_str(self) -> &'static str {
        match self {
            FeedbackCode::Success => "Success",
            FeedbackCode::ClusterOperationException => "ClusterOperationException",
        }
    }
}

impl fmt::Display for FeedbackCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A logical platform-provisioned service instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManagedResource {
    pub uniqid: String,
    pub name: String,
    pub appkey: String,
    pub channel: String,
    pub resource_type: ResourceType,
    pub desired_state: ResourceState,
    pub state: ResourceState,
    pub attempt_times: u32,
    /// User-declared labels, values coerced to strings on load.
    #[serde(default, deserialize_with = "de_labels")]
    pub labels: Labels,
    /// Last feedback payload (JSON).
    #[serde(default)]
    pub message: Option<String>,
}

impl ManagedResource {
    pub fn identity(&self) -> IdentityLabels {
        IdentityLabels {
            app: self.name.clone(),
            appkey: self.appkey.clone(),
            uniqid: self.uniqid.clone(),
            channel: self.channel.clone(),
        }
    }

    pub fn owned_kinds(&self) -> OwnedKindSet {
        self.resource_type.owned_kinds()
    }
}

/// System-owned identity metadata stamped on every owned object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityLabels {
    pub app: String,
    pub appkey: String,
    pub uniqid: String,
    pub channel: String,
}

impl IdentityLabels {
    pub fn to_labels(&self) -> Labels {
        let mut out = Labels::new();
        out.insert(LABEL_APP.to_string(), self.app.clone());
        out.insert(LABEL_APPKEY.to_string(), self.appkey.clone());
        out.insert(LABEL_UNIQID.to_string(), self.uniqid.clone());
        out.insert(LABEL_CHANNEL.to_string(), self.channel.clone());
        out
    }
}

/// A resolved cluster object. Read-only view, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterObjectRef {
    pub kind: ObjectKind,
    pub name: String,
    pub namespace: Option<String>,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub annotations: Labels,
    #[serde(default)]
    pub status: serde_json::Value,
}

impl ClusterObjectRef {
    /// `status.phase`, if the object reports one.
    pub fn phase(&self) -> Option<&str> {
        self.status.get("phase").and_then(|v| v.as_str())
    }

    pub fn matches_labels(&self, selector: &Labels) -> bool {
        selector.iter().all(|(k, v)| self.labels.get(k) == Some(v))
    }
}

/// Textual form of a user-supplied label value.
pub fn normalize_label_value(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Coerce a loosely typed label object into string labels.
pub fn normalize_labels(raw: &serde_json::Map<String, serde_json::Value>) -> Labels {
    raw.iter().map(|(k, v)| (k.trim().to_string(), normalize_label_value(v))).collect()
}

/// Accepts an object with any scalar values; anything else (including an
/// empty array) loads as no labels.
fn de_labels<'de, D>(d: D) -> Result<Labels, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = serde_json::Value::deserialize(d)?;
    Ok(match raw {
        serde_json::Value::Object(m) => normalize_labels(&m),
        _ => Labels::new(),
    })
}

static LABEL_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9]$").expect("label name regex"));
static DNS_SUBDOMAIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").expect("dns subdomain regex"));

/// Kubernetes label key syntax: `[prefix/]name`.
pub fn is_valid_label_key(key: &str) -> bool {
    let (prefix, name) = match key.split_once('/') {
        Some((p, n)) => (Some(p), n),
        None => (None, key),
    };
    if let Some(p) = prefix {
        if p.is_empty() || p.len() > 253 || !DNS_SUBDOMAIN_RE.is_match(p) {
            return false;
        }
    }
    !name.is_empty() && name.len() <= 63 && LABEL_NAME_RE.is_match(name)
}

pub fn is_valid_label_value(value: &str) -> bool {
    value.is_empty() || (value.len() <= 63 && LABEL_NAME_RE.is_match(value))
}

/// Which objects a get/delete addresses.
///
/// An exact name wins over a label set; with neither, nothing is selected.
/// `Nothing` never widens to "all objects".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorQuery {
    ByName(String),
    ByLabels(Labels),
    Nothing,
}

impl SelectorQuery {
    pub fn resolve(name: Option<&str>, labels: Option<&Labels>) -> Self {
        if let Some(n) = name.filter(|n| !n.is_empty()) {
            return SelectorQuery::ByName(n.to_string());
        }
        match labels {
            Some(l) if Self::valid_label_map(l) => SelectorQuery::ByLabels(l.clone()),
            _ => SelectorQuery::Nothing,
        }
    }

    /// Non-empty and syntactically valid.
    pub fn valid_label_map(labels: &Labels) -> bool {
        !labels.is_empty() && labels.iter().all(|(k, v)| is_valid_label_key(k) && is_valid_label_value(v))
    }

    /// `metadata.name=<n>` for name queries.
    pub fn field_selector(&self) -> Option<String> {
        match self {
            SelectorQuery::ByName(n) => Some(format!("metadata.name={}", n)),
            _ => None,
        }
    }

    /// `k1=v1,k2=v2` for label queries, keys sorted.
    pub fn label_selector(&self) -> Option<String> {
        match self {
            SelectorQuery::ByLabels(l) => Some(
                l.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(","),
            ),
            _ => None,
        }
    }

    pub fn is_nothing(&self) -> bool {
        matches!(self, SelectorQuery::Nothing)
    }
}

/// Deletion mode for dependents of a deleted object.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Propagation {
    #[default]
    Background,
    Foreground,
    Orphan,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DeleteOptions {
    pub propagation: Propagation,
}

pub mod prelude {
    pub use super::{
        normalize_labels, ClusterObjectRef, CoreError, DeleteOptions, FeedbackCode, IdentityLabels, Labels,
        ManagedResource, ObjectKind, OwnedKindSet, Propagation, ResourceState, ResourceType, SelectorQuery, Stage,
        ALLOWED_KINDS,
    };
}

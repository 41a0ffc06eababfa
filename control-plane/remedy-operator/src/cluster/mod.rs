//! Narrow interface to the cluster state observer. The reconciliation core
//! only ever talks to the cluster through [`ClusterObserver`]; the kube
//! binding lives in [`kube` (the module)](crate::cluster::kube).

pub mod kube;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use ::kube::ResourceExt;
use serde_json::Value as JsonValue;

use crate::crd::remediation_policy::{
    ConditionStatus, RemediationPolicy, RemediationPolicyStatus, TargetKind,
};

#[derive(thiserror::Error, Debug)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("version conflict: {0}")]
    Conflict(String),
    #[error("api unavailable: {0}")]
    Unavailable(String),
    #[error("cluster access failure: {0}")]
    Fatal(String),
}

/// Identity of one target resource. Displayed as `namespace/name`; the kind
/// is implied by the owning policy's `target_kind`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    pub kind: TargetKind,
    pub namespace: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(
        kind: TargetKind,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self { kind, namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Clone, Debug)]
pub struct OwnerRef {
    pub kind: String,
    pub name: String,
}

/// Snapshot of one resource as the observer saw it. Immutable within a
/// reconciliation pass; a fresh list is taken every cycle.
#[derive(Clone, Debug)]
pub struct ObservedResource {
    pub id: ResourceId,
    /// Optimistic-concurrency token for updates.
    pub version: String,
    pub generation: i64,
    pub labels: BTreeMap<String, String>,
    pub owner: Option<OwnerRef>,
    pub desired_replicas: Option<i32>,
    pub available_replicas: Option<i32>,
    pub unavailable_replicas: Option<i32>,
    /// Status conditions by name ("Ready", "Available", ...).
    pub conditions: BTreeMap<String, ConditionStatus>,
    /// Pod template, present on workload kinds.
    pub template: Option<JsonValue>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeType {
    Applied,
    Deleted,
}

#[derive(Clone, Debug)]
pub struct WatchEvent {
    pub id: ResourceId,
    pub generation: i64,
    pub change: ChangeType,
}

#[derive(Clone, Debug)]
pub struct PolicyEvent {
    pub key: PolicyKey,
    pub change: ChangeType,
}

/// Key of a RemediationPolicy (cluster-scoped, so just the name).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PolicyKey(String);

impl PolicyKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&RemediationPolicy> for PolicyKey {
    fn from(policy: &RemediationPolicy) -> Self {
        PolicyKey(policy.name_any())
    }
}

/// Typed mutation request against one resource.
#[derive(Clone, Debug)]
pub struct ResourceUpdate {
    pub id: ResourceId,
    pub expected_version: String,
    pub patch: ResourcePatch,
}

#[derive(Clone, Debug)]
pub enum ResourcePatch {
    /// Merge annotations into the workload's pod-template metadata.
    TemplateAnnotations(BTreeMap<String, String>),
    /// Replace the workload's pod template and merge object annotations.
    Template {
        template: JsonValue,
        annotations: BTreeMap<String, String>,
    },
    /// Set the workload's desired replica count.
    Replicas(i32),
}

/// One historical template snapshot of a workload.
#[derive(Clone, Debug)]
pub struct RevisionRecord {
    pub revision: i64,
    pub template: JsonValue,
}

pub type EventStream<T> = BoxStream<'static, T>;

/// The cluster state observer collaborator. Watch streams are infinite and
/// at-least-once with no cross-resource ordering; lists are fresh snapshots
/// that may lag the watch stream (the next cycle corrects any skew).
#[async_trait]
pub trait ClusterObserver: Send + Sync + 'static {
    async fn watch(
        &self,
        kind: TargetKind,
    ) -> Result<EventStream<WatchEvent>, ClusterError>;

    async fn list(
        &self,
        kind: TargetKind,
        selector: &LabelSelector,
        namespace: Option<&str>,
    ) -> Result<Vec<ObservedResource>, ClusterError>;

    async fn get(
        &self,
        id: &ResourceId,
    ) -> Result<Option<ObservedResource>, ClusterError>;

    /// Returns the new version token, or `Conflict` when the expected
    /// version is stale.
    async fn update(
        &self,
        update: ResourceUpdate,
    ) -> Result<String, ClusterError>;

    async fn delete(&self, id: &ResourceId) -> Result<(), ClusterError>;

    async fn list_revision_history(
        &self,
        workload: &ResourceId,
    ) -> Result<Vec<RevisionRecord>, ClusterError>;

    // Policies persist through the same collaborator; the core owns no
    // durable state of its own.

    async fn list_policies(
        &self,
    ) -> Result<Vec<RemediationPolicy>, ClusterError>;

    async fn watch_policies(
        &self,
    ) -> Result<EventStream<PolicyEvent>, ClusterError>;

    async fn get_policy(
        &self,
        key: &PolicyKey,
    ) -> Result<Option<RemediationPolicy>, ClusterError>;

    async fn update_policy_status(
        &self,
        key: &PolicyKey,
        status: &RemediationPolicyStatus,
        expected_version: &str,
    ) -> Result<String, ClusterError>;
}

/// Conditions are matched with plain label equality. Selector expressions
/// are not part of the policy surface; a selector carrying them is rejected
/// as a permanent per-policy failure rather than silently widened.
pub fn validate_selector(selector: &LabelSelector) -> Result<(), String> {
    if selector
        .match_expressions
        .as_ref()
        .is_some_and(|exprs| !exprs.is_empty())
    {
        return Err("selector matchExpressions are not supported".to_string());
    }
    Ok(())
}

/// Render `match_labels` as the `k=v,...` form the list API takes.
pub fn selector_label_string(selector: &LabelSelector) -> String {
    selector
        .match_labels
        .as_ref()
        .map(|labels| {
            labels
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(",")
        })
        .unwrap_or_default()
}

/// Label-equality match used by in-process observers.
pub fn selector_matches(
    selector: &LabelSelector,
    labels: &BTreeMap<String, String>,
) -> bool {
    match selector.match_labels.as_ref() {
        None => true,
        Some(wanted) => wanted
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|have| have == v)),
    }
}

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Requeue interval used when the spec leaves `check_interval_secs` at zero.
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 300;

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "remedy.io",
    version = "v1alpha1",
    kind = "RemediationPolicy",
    plural = "remediationpolicies",
    shortname = "rp",
    status = "RemediationPolicyStatus",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.lastAppliedStatus"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RemediationPolicySpec {
    /// Label selector for the resources this policy watches.
    pub selector: LabelSelector,
    /// Kind of resource the policy targets.
    pub target_kind: TargetKind,
    /// Restrict matching to one namespace; omitted means all namespaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,
    /// Health conditions that trigger remediation, in declaration order.
    pub conditions: Vec<ConditionSpec>,
    /// Remediation actions; only the first is applied per reconciliation pass.
    pub actions: Vec<ActionSpec>,
    /// Re-check interval in seconds; 0 selects the 300s default.
    #[serde(default)]
    pub check_interval_secs: u64,
    /// Per-resource attempt ceiling; 0 means unlimited.
    #[serde(default)]
    pub max_attempts: u32,
    /// Quiet period after an applied action, in seconds.
    #[serde(default)]
    pub cooldown_secs: u64,
}

impl RemediationPolicySpec {
    pub fn check_interval(&self) -> Duration {
        match self.check_interval_secs {
            0 => Duration::from_secs(DEFAULT_CHECK_INTERVAL_SECS),
            s => Duration::from_secs(s),
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(
    Deserialize,
    Serialize,
    Clone,
    Copy,
    Debug,
    JsonSchema,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
)]
pub enum TargetKind {
    Deployment,
    ReplicaSet,
    Pod,
}

impl TargetKind {
    pub const ALL: [TargetKind; 3] =
        [TargetKind::Deployment, TargetKind::ReplicaSet, TargetKind::Pod];
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetKind::Deployment => "Deployment",
            TargetKind::ReplicaSet => "ReplicaSet",
            TargetKind::Pod => "Pod",
        };
        f.write_str(s)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConditionSpec {
    /// Which health signal to read.
    pub kind: ConditionKind,
    /// Expected condition status, for status-valued kinds. Defaults to True.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ConditionStatus>,
    /// Expected integer value, for replica-count kinds. Defaults to 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<i64>,
    #[serde(default)]
    pub operator: CompareOp,
    /// Seconds the condition must hold continuously before it matches.
    #[serde(default)]
    pub min_duration_secs: u64,
}

/// Closed set of health signals a condition can read. Adding a variant is a
/// compile-time change: the comparator table in the evaluator must cover it.
#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash,
)]
pub enum ConditionKind {
    Ready,
    Available,
    Progressing,
    AvailableReplicas,
    UnavailableReplicas,
}

impl ConditionKind {
    /// Name of the status condition read by status-valued kinds.
    pub fn condition_name(&self) -> &'static str {
        match self {
            ConditionKind::Ready => "Ready",
            ConditionKind::Available => "Available",
            ConditionKind::Progressing => "Progressing",
            ConditionKind::AvailableReplicas => "AvailableReplicas",
            ConditionKind::UnavailableReplicas => "UnavailableReplicas",
        }
    }
}

#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq,
)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq,
)]
pub enum CompareOp {
    #[default]
    Equals,
    LessThan,
    GreaterThan,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionSpec {
    /// What to do when conditions match.
    pub kind: ActionKind,
    /// Action-specific parameters (e.g. "replicas" for Scale).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq,
)]
pub enum ActionKind {
    Restart,
    Recreate,
    Scale,
    RollbackToRevision,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionKind::Restart => "Restart",
            ActionKind::Recreate => "Recreate",
            ActionKind::Scale => "Scale",
            ActionKind::RollbackToRevision => "RollbackToRevision",
        };
        f.write_str(s)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RemediationPolicyStatus {
    /// Number of actions this policy has applied. Never resets.
    #[serde(default)]
    pub applied_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_applied_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_applied_status: Option<AppliedStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_applied_message: Option<String>,
    /// Resource identities currently selected by this policy, recomputed
    /// from a fresh selector query every reconciliation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitored_resources: Option<Vec<String>>,
    /// Resource identity -> generation observed when the last action ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_revisions: Option<BTreeMap<String, i64>>,
    /// Resource identity -> revision number rolled back to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_revisions: Option<BTreeMap<String, i64>>,
    /// Per-resource attempt bookkeeping for max-attempt and cooldown gating.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<BTreeMap<String, AttemptRecord>>,
}

#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq,
)]
#[serde(rename_all = "PascalCase")]
pub enum AppliedStatus {
    Succeeded,
    Failed,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    #[serde(default)]
    pub count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_applied_time: Option<String>,
}

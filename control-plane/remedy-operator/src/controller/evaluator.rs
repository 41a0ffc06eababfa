//! Condition evaluation with minimum-duration gating. Decisions are pure
//! over the inputs: `now` is always passed in, never sampled here.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::cluster::{ObservedResource, PolicyKey, ResourceId};
use crate::crd::remediation_policy::{
    CompareOp, ConditionKind, ConditionSpec, ConditionStatus,
};

type Comparator = fn(&ObservedResource, &ConditionSpec) -> bool;

/// Comparator table over the closed condition-kind set. A new kind does not
/// compile until it gets a row here.
fn comparator_for(kind: ConditionKind) -> Comparator {
    match kind {
        ConditionKind::Ready
        | ConditionKind::Available
        | ConditionKind::Progressing => status_condition,
        ConditionKind::AvailableReplicas => available_replicas,
        ConditionKind::UnavailableReplicas => unavailable_replicas,
    }
}

/// Status-valued kinds compare by equality; ordering operators have no
/// meaning for a status enum and degrade to equality. A condition the
/// resource does not report reads as Unknown.
fn status_condition(
    resource: &ObservedResource,
    cond: &ConditionSpec,
) -> bool {
    let observed = resource
        .conditions
        .get(cond.kind.condition_name())
        .copied()
        .unwrap_or(ConditionStatus::Unknown);
    observed == cond.status.unwrap_or(ConditionStatus::True)
}

fn compare(actual: i64, cond: &ConditionSpec) -> bool {
    let expected = cond.value.unwrap_or(0);
    match cond.operator {
        CompareOp::Equals => actual == expected,
        CompareOp::LessThan => actual < expected,
        CompareOp::GreaterThan => actual > expected,
    }
}

fn available_replicas(
    resource: &ObservedResource,
    cond: &ConditionSpec,
) -> bool {
    compare(i64::from(resource.available_replicas.unwrap_or(0)), cond)
}

/// Falls back to `desired - available` when the count is not reported.
fn unavailable_replicas(
    resource: &ObservedResource,
    cond: &ConditionSpec,
) -> bool {
    let unavailable = resource.unavailable_replicas.unwrap_or_else(|| {
        let desired = resource.desired_replicas.unwrap_or(0);
        let available = resource.available_replicas.unwrap_or(0);
        (desired - available).max(0)
    });
    compare(i64::from(unavailable), cond)
}

/// First-seen timestamps of currently-true conditions, keyed by
/// (resource identity, condition kind) within each policy's scope.
/// Process-memory only: after a restart, duration gating starts over.
#[derive(Default)]
pub struct PendingConditions {
    by_policy: HashMap<
        PolicyKey,
        HashMap<(ResourceId, ConditionKind), DateTime<Utc>>,
    >,
}

impl PendingConditions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate one condition against one resource, updating pending state.
    /// A false observation clears the pending timestamp; a true one starts
    /// or continues it, and the condition matches once it has held for the
    /// declared minimum duration (immediately when that is zero).
    pub fn matches(
        &mut self,
        policy: &PolicyKey,
        resource: &ObservedResource,
        cond: &ConditionSpec,
        now: DateTime<Utc>,
    ) -> bool {
        let raw = comparator_for(cond.kind)(resource, cond);
        let pending = self.by_policy.entry(policy.clone()).or_default();
        let key = (resource.id.clone(), cond.kind);
        if !raw {
            pending.remove(&key);
            return false;
        }
        let since = *pending.entry(key).or_insert(now);
        now.signed_duration_since(since).num_seconds()
            >= cond.min_duration_secs as i64
    }

    /// Drop pending entries for resources the policy no longer selects.
    /// A resource that disappeared is simply not-matched, never an error.
    pub fn retain_resources(
        &mut self,
        policy: &PolicyKey,
        live: &HashSet<ResourceId>,
    ) {
        if let Some(pending) = self.by_policy.get_mut(policy) {
            pending.retain(|(id, _), _| live.contains(id));
            if pending.is_empty() {
                self.by_policy.remove(policy);
            }
        }
    }

    pub fn evict_policy(&mut self, policy: &PolicyKey) {
        self.by_policy.remove(policy);
    }
}

//! Commits reconciliation outcomes into policy status. The delta is what
//! gets retried on conflict, never a stale whole object.

use chrono::{DateTime, Utc};
use tracing::debug;

use super::ReconcileErr;
use super::executor::ActionApplied;
use crate::cluster::{ClusterError, ClusterObserver, PolicyKey};
use crate::crd::remediation_policy::{
    AppliedStatus, RemediationPolicyStatus,
};

/// Accumulated outcome of one reconciliation pass.
#[derive(Clone, Debug, Default)]
pub struct StatusDelta {
    /// Fresh selector-query result; replaces the previous list wholesale.
    pub monitored: Vec<String>,
    pub outcome: Option<CycleOutcome>,
}

#[derive(Clone, Debug)]
pub enum CycleOutcome {
    Applied(ActionApplied),
    /// Permanent per-resource failure; other resources were still processed.
    Failed { message: String },
    /// Normal no-op with a reason worth surfacing.
    Skipped { message: String },
}

pub fn apply_delta(
    status: &mut RemediationPolicyStatus,
    delta: &StatusDelta,
    now: DateTime<Utc>,
) {
    status.monitored_resources = Some(delta.monitored.clone());
    match &delta.outcome {
        None => {}
        Some(CycleOutcome::Applied(applied)) => {
            let stamp = now.to_rfc3339();
            let resource = applied.resource.to_string();
            status.applied_count = status.applied_count.saturating_add(1);
            status.last_applied_time = Some(stamp.clone());
            status.last_applied_status = Some(AppliedStatus::Succeeded);
            status.last_applied_message = Some(applied.message.clone());
            let record = status
                .attempts
                .get_or_insert_with(Default::default)
                .entry(resource.clone())
                .or_default();
            record.count = record.count.saturating_add(1);
            record.last_applied_time = Some(stamp);
            if let Some(generation) = applied.current_generation {
                status
                    .current_revisions
                    .get_or_insert_with(Default::default)
                    .insert(resource.clone(), generation);
            }
            if let Some(revision) = applied.rollback_revision {
                status
                    .rollback_revisions
                    .get_or_insert_with(Default::default)
                    .insert(resource, revision);
            }
        }
        Some(CycleOutcome::Failed { message }) => {
            status.last_applied_status = Some(AppliedStatus::Failed);
            status.last_applied_message = Some(message.clone());
        }
        Some(CycleOutcome::Skipped { message }) => {
            status.last_applied_message = Some(message.clone());
        }
    }
}

/// Optimistic-concurrency commit: read, apply the delta, write with the
/// version token; on conflict, re-read and replay the delta. Exhausting the
/// bound is a transient failure for this cycle only.
pub async fn commit(
    observer: &dyn ClusterObserver,
    key: &PolicyKey,
    delta: &StatusDelta,
    now: DateTime<Utc>,
    retry_bound: u32,
) -> Result<(), ReconcileErr> {
    for attempt in 0..retry_bound.max(1) {
        let policy = match observer.get_policy(key).await {
            Ok(Some(p)) => p,
            // Deleted mid-cycle: nothing left to record against.
            Ok(None) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let version =
            policy.metadata.resource_version.clone().unwrap_or_default();
        let mut status = policy.status.unwrap_or_default();
        apply_delta(&mut status, delta, now);
        match observer.update_policy_status(key, &status, &version).await {
            Ok(_) => return Ok(()),
            Err(ClusterError::Conflict(_)) => {
                debug!(policy = %key, attempt, "status conflict; re-reading");
                continue;
            }
            Err(ClusterError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
    Err(ReconcileErr::Transient(format!(
        "status update for {key} kept conflicting"
    )))
}

//! Applies planned actions through the cluster observer. Every operation is
//! idempotent under retry and returns a structured outcome; nothing is
//! swallowed.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::info;

use super::revisions;
use crate::cluster::{
    ClusterError, ClusterObserver, ObservedResource, ResourceId,
    ResourcePatch, ResourceUpdate,
};
use crate::crd::remediation_policy::{ActionKind, ActionSpec, TargetKind};

pub const RESTARTED_AT_ANNOTATION: &str = "remedy.io/restarted-at";
pub const ROLLBACK_AT_ANNOTATION: &str = "remedy.io/rollback-at";
pub const ROLLBACK_REVISION_ANNOTATION: &str = "remedy.io/rollback-revision";

/// Owner traversal stops here: replica -> replica set -> workload.
const MAX_OWNER_DEPTH: usize = 2;

#[derive(thiserror::Error, Debug)]
pub enum ExecError {
    /// Not retried for this resource in this cycle; recorded in status.
    #[error("{0}")]
    Permanent(String),
    /// Deferred to scheduler backoff.
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Fatal(String),
}

fn from_cluster(e: ClusterError) -> ExecError {
    match e {
        ClusterError::NotFound(m) => {
            ExecError::Permanent(format!("target vanished: {m}"))
        }
        ClusterError::Conflict(m) => ExecError::Transient(m),
        ClusterError::Unavailable(m) => ExecError::Transient(m),
        ClusterError::Fatal(m) => ExecError::Fatal(m),
    }
}

/// What a successful action changed, for the status tracker.
#[derive(Clone, Debug)]
pub struct ActionApplied {
    pub resource: ResourceId,
    pub action: ActionKind,
    pub message: String,
    pub current_generation: Option<i64>,
    pub rollback_revision: Option<i64>,
}

pub enum OwnerResolution {
    Workload(ObservedResource),
    Unresolved(String),
}

/// Walk controller owners up to the owning Deployment. Depth is bounded; a
/// chain that does not land on a workload within [`MAX_OWNER_DEPTH`] hops
/// yields a typed Unresolved result, never unbounded recursion.
pub async fn resolve_owning_workload(
    observer: &dyn ClusterObserver,
    target: &ObservedResource,
) -> Result<OwnerResolution, ExecError> {
    if target.id.kind == TargetKind::Deployment {
        return Ok(OwnerResolution::Workload(target.clone()));
    }
    let mut current = target.clone();
    for _ in 0..MAX_OWNER_DEPTH {
        let Some(owner) = current.owner.clone() else {
            return Ok(OwnerResolution::Unresolved(format!(
                "{} has no controller owner",
                current.id
            )));
        };
        let owner_kind = match owner.kind.as_str() {
            "Deployment" => TargetKind::Deployment,
            "ReplicaSet" => TargetKind::ReplicaSet,
            other => {
                return Ok(OwnerResolution::Unresolved(format!(
                    "unsupported owner kind {other} above {}",
                    current.id
                )));
            }
        };
        let owner_id = ResourceId::new(
            owner_kind,
            current.id.namespace.clone(),
            owner.name,
        );
        let Some(next) =
            observer.get(&owner_id).await.map_err(from_cluster)?
        else {
            return Ok(OwnerResolution::Unresolved(format!(
                "owner {owner_id} not found"
            )));
        };
        if next.id.kind == TargetKind::Deployment {
            return Ok(OwnerResolution::Workload(next));
        }
        current = next;
    }
    Ok(OwnerResolution::Unresolved(format!(
        "owner chain above {} exceeds depth {MAX_OWNER_DEPTH}",
        target.id
    )))
}

async fn require_workload(
    observer: &dyn ClusterObserver,
    target: &ObservedResource,
) -> Result<ObservedResource, ExecError> {
    match resolve_owning_workload(observer, target).await? {
        OwnerResolution::Workload(w) => Ok(w),
        OwnerResolution::Unresolved(reason) => {
            Err(ExecError::Permanent(reason))
        }
    }
}

/// Apply one planned action against the target resource.
pub async fn execute(
    observer: &dyn ClusterObserver,
    action: &ActionSpec,
    target: &ObservedResource,
    now: DateTime<Utc>,
) -> Result<ActionApplied, ExecError> {
    match action.kind {
        ActionKind::Restart => restart(observer, target, now).await,
        ActionKind::Recreate => recreate(observer, target).await,
        ActionKind::Scale => scale(observer, action, target).await,
        ActionKind::RollbackToRevision => {
            rollback(observer, target, now).await
        }
    }
}

/// Stamp the workload's pod template with a restart marker. Pod churn is
/// the external scheduler's consequence, not ours.
async fn restart(
    observer: &dyn ClusterObserver,
    target: &ObservedResource,
    now: DateTime<Utc>,
) -> Result<ActionApplied, ExecError> {
    let workload = require_workload(observer, target).await?;
    let mut annotations = BTreeMap::new();
    annotations
        .insert(RESTARTED_AT_ANNOTATION.to_string(), now.to_rfc3339());
    observer
        .update(ResourceUpdate {
            id: workload.id.clone(),
            expected_version: workload.version.clone(),
            patch: ResourcePatch::TemplateAnnotations(annotations),
        })
        .await
        .map_err(from_cluster)?;
    info!(resource = %target.id, workload = %workload.id, "restart marker stamped");
    Ok(ActionApplied {
        resource: target.id.clone(),
        action: ActionKind::Restart,
        message: format!("restarted {}", workload.id),
        current_generation: Some(workload.generation),
        rollback_revision: None,
    })
}

/// Delete the unhealthy replica directly. This is the path for targets with
/// no resolvable owning workload; anything but a pod is a permanent miss.
async fn recreate(
    observer: &dyn ClusterObserver,
    target: &ObservedResource,
) -> Result<ActionApplied, ExecError> {
    if target.id.kind != TargetKind::Pod {
        return Err(ExecError::Permanent(format!(
            "recreate needs a pod target, got {}",
            target.id.kind
        )));
    }
    observer.delete(&target.id).await.map_err(from_cluster)?;
    info!(resource = %target.id, "replica deleted for recreation");
    Ok(ActionApplied {
        resource: target.id.clone(),
        action: ActionKind::Recreate,
        message: format!("deleted {} for recreation", target.id),
        current_generation: None,
        rollback_revision: None,
    })
}

async fn scale(
    observer: &dyn ClusterObserver,
    action: &ActionSpec,
    target: &ObservedResource,
) -> Result<ActionApplied, ExecError> {
    let replicas = action
        .params
        .get("replicas")
        .and_then(|v| v.parse::<i32>().ok())
        .ok_or_else(|| {
            ExecError::Permanent(
                "scale action needs an integer \"replicas\" param"
                    .to_string(),
            )
        })?;
    let workload = require_workload(observer, target).await?;
    observer
        .update(ResourceUpdate {
            id: workload.id.clone(),
            expected_version: workload.version.clone(),
            patch: ResourcePatch::Replicas(replicas),
        })
        .await
        .map_err(from_cluster)?;
    info!(workload = %workload.id, replicas, "workload scaled");
    Ok(ActionApplied {
        resource: target.id.clone(),
        action: ActionKind::Scale,
        message: format!("scaled {} to {} replicas", workload.id, replicas),
        current_generation: Some(workload.generation),
        rollback_revision: None,
    })
}

/// Replace the workload's template with the latest revision strictly older
/// than its current generation, stamping rollback metadata. Re-running over
/// unchanged cluster state resolves the same revision.
async fn rollback(
    observer: &dyn ClusterObserver,
    target: &ObservedResource,
    now: DateTime<Utc>,
) -> Result<ActionApplied, ExecError> {
    let workload = require_workload(observer, target).await?;
    let history = observer
        .list_revision_history(&workload.id)
        .await
        .map_err(from_cluster)?;
    let revision = revisions::previous_revision(&history, workload.generation)
        .map_err(|e| ExecError::Permanent(e.to_string()))?;
    let mut annotations = BTreeMap::new();
    annotations.insert(ROLLBACK_AT_ANNOTATION.to_string(), now.to_rfc3339());
    annotations.insert(
        ROLLBACK_REVISION_ANNOTATION.to_string(),
        revision.revision.to_string(),
    );
    observer
        .update(ResourceUpdate {
            id: workload.id.clone(),
            expected_version: workload.version.clone(),
            patch: ResourcePatch::Template {
                template: revision.template.clone(),
                annotations,
            },
        })
        .await
        .map_err(from_cluster)?;
    info!(workload = %workload.id, revision = revision.revision, "rolled back");
    Ok(ActionApplied {
        resource: target.id.clone(),
        action: ActionKind::RollbackToRevision,
        message: format!(
            "rolled back {} to revision {}",
            workload.id, revision.revision
        ),
        current_generation: Some(workload.generation),
        rollback_revision: Some(revision.revision),
    })
}

//! One reconciliation pass for one policy key: fetch, evaluate, plan, act,
//! record, and tell the scheduler when to come back.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use super::executor::{self, ActionApplied, ExecError};
use super::planner::{self, PlanDecision, SkipReason};
use super::status::{self, CycleOutcome, StatusDelta};
use super::{ControllerContext, ReconcileErr};
use crate::cluster::{PolicyKey, ResourceId, validate_selector};

/// What the scheduler should do with the key after this pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Directive {
    /// Wake again after the policy's check interval.
    Requeue(Duration),
    /// An action was applied (or a window is still open); hold evaluation
    /// until the cooldown elapses.
    Cooldown(Duration),
    /// Policy is gone; evict the key and cancel its timer.
    Forget,
}

#[instrument(skip(ctx), fields(policy = %key))]
pub async fn reconcile_policy(
    ctx: &ControllerContext,
    key: &PolicyKey,
) -> Result<Directive, ReconcileErr> {
    let now = Utc::now();

    let policy = match ctx.observer.get_policy(key).await {
        Ok(Some(p)) => p,
        Ok(None) => {
            info!("policy deleted; dropping key");
            ctx.pending.lock().await.evict_policy(key);
            ctx.policies.remove(key).await;
            return Ok(Directive::Forget);
        }
        Err(e) => return Err(e.into()),
    };
    ctx.policies.upsert(key.clone(), policy.clone()).await;

    let spec = &policy.spec;
    let prior = policy.status.clone().unwrap_or_default();
    let policy_last_applied = prior
        .last_applied_time
        .as_deref()
        .and_then(planner::parse_rfc3339);

    if let Err(reason) = validate_selector(&spec.selector) {
        warn!(%reason, "rejecting policy selector");
        let delta = StatusDelta {
            monitored: Vec::new(),
            outcome: Some(CycleOutcome::Failed { message: reason }),
        };
        status::commit(
            ctx.observer.as_ref(),
            key,
            &delta,
            now,
            ctx.cfg.status_retries,
        )
        .await?;
        return Ok(Directive::Requeue(spec.check_interval()));
    }

    let resources = ctx
        .observer
        .list(
            spec.target_kind,
            &spec.selector,
            spec.target_namespace.as_deref(),
        )
        .await
        .map_err(ReconcileErr::from)?;
    // Recomputed wholesale from this fresh snapshot; never patched.
    let monitored: Vec<String> =
        resources.iter().map(|r| r.id.to_string()).collect();

    // Cooldown is derived from persisted status, so a restarted process
    // honors the same window. The policy stays observed (monitored list
    // keeps updating) but evaluation is skipped until it elapses.
    let in_cooldown =
        cooldown_remaining(spec.cooldown_secs, policy_last_applied, now);

    let matched_flags: Vec<bool> = if in_cooldown.is_some() {
        debug!("in cooldown; evaluation skipped");
        vec![false; resources.len()]
    } else {
        let mut pending = ctx.pending.lock().await;
        let live: HashSet<ResourceId> =
            resources.iter().map(|r| r.id.clone()).collect();
        pending.retain_resources(key, &live);
        resources
            .iter()
            .map(|resource| {
                let mut matched = false;
                for cond in &spec.conditions {
                    if pending.matches(key, resource, cond, now) {
                        matched = true;
                    }
                }
                matched
            })
            .collect()
    };

    let mut applied: Option<ActionApplied> = None;
    let mut failed: Option<String> = None;
    let mut skipped: Option<SkipReason> = None;

    for (resource, matched) in resources.iter().zip(&matched_flags) {
        if applied.is_some() {
            break; // at most one action per pass
        }
        let ledger = planner::ledger_for(&prior, &resource.id.to_string());
        match planner::plan(spec, *matched, &ledger, policy_last_applied, now)
        {
            PlanDecision::Skip(SkipReason::NoConditionMatched) => {}
            PlanDecision::Skip(reason) => {
                debug!(resource = %resource.id, reason = reason.message(), "skipping");
                skipped = Some(reason);
            }
            PlanDecision::Apply(action) => {
                match executor::execute(
                    ctx.observer.as_ref(),
                    action,
                    resource,
                    now,
                )
                .await
                {
                    Ok(outcome) => {
                        info!(resource = %resource.id, action = %outcome.action, "action applied");
                        applied = Some(outcome);
                    }
                    Err(ExecError::Permanent(m)) => {
                        warn!(resource = %resource.id, error = %m, "permanent remediation failure");
                        failed = Some(format!("{}: {}", resource.id, m));
                        // other monitored resources still get a chance
                    }
                    Err(ExecError::Transient(m)) => {
                        return Err(ReconcileErr::Transient(m));
                    }
                    Err(ExecError::Fatal(m)) => {
                        return Err(ReconcileErr::Fatal(m));
                    }
                }
            }
        }
    }

    let action_applied = applied.is_some();
    let outcome = if let Some(applied) = applied {
        Some(CycleOutcome::Applied(applied))
    } else if let Some(message) = failed {
        Some(CycleOutcome::Failed { message })
    } else {
        skipped.map(|reason| CycleOutcome::Skipped {
            message: reason.message().to_string(),
        })
    };

    let delta = StatusDelta { monitored, outcome };
    status::commit(
        ctx.observer.as_ref(),
        key,
        &delta,
        now,
        ctx.cfg.status_retries,
    )
    .await?;

    if action_applied && spec.cooldown_secs > 0 {
        info!(secs = spec.cooldown_secs, "entering cooldown");
        return Ok(Directive::Cooldown(spec.cooldown()));
    }
    if let Some(remaining) = in_cooldown {
        return Ok(Directive::Cooldown(remaining));
    }
    Ok(Directive::Requeue(spec.check_interval()))
}

fn cooldown_remaining(
    cooldown_secs: u64,
    last_applied: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<Duration> {
    if cooldown_secs == 0 {
        return None;
    }
    let last = last_applied?;
    let elapsed = now.signed_duration_since(last).num_seconds();
    let window = cooldown_secs as i64;
    if elapsed < window {
        Some(Duration::from_secs((window - elapsed.max(0)) as u64))
    } else {
        None
    }
}

//! Maps matched conditions to at most one action per reconciliation pass.
//! "Max attempts reached" and "in cooldown" are ordinary decisions here,
//! never errors.

use chrono::{DateTime, Utc};

use crate::crd::remediation_policy::{
    ActionSpec, RemediationPolicySpec, RemediationPolicyStatus,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    NoConditionMatched,
    NoActions,
    MaxAttemptsReached,
    InCooldown,
}

impl SkipReason {
    pub fn message(&self) -> &'static str {
        match self {
            SkipReason::NoConditionMatched => "no condition matched",
            SkipReason::NoActions => "no actions declared",
            SkipReason::MaxAttemptsReached => "max attempts reached",
            SkipReason::InCooldown => "in cooldown",
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum PlanDecision<'a> {
    Apply(&'a ActionSpec),
    Skip(SkipReason),
}

/// Per-resource view of past attempts, parsed out of the policy status.
#[derive(Clone, Copy, Debug, Default)]
pub struct ResourceLedger {
    pub attempts: u32,
    pub last_applied: Option<DateTime<Utc>>,
}

pub fn ledger_for(
    status: &RemediationPolicyStatus,
    resource: &str,
) -> ResourceLedger {
    status
        .attempts
        .as_ref()
        .and_then(|m| m.get(resource))
        .map(|rec| ResourceLedger {
            attempts: rec.count,
            last_applied: rec
                .last_applied_time
                .as_deref()
                .and_then(parse_rfc3339),
        })
        .unwrap_or_default()
}

/// A timestamp that fails to parse reads as absent rather than poisoning
/// the cycle.
pub fn parse_rfc3339(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw).ok().map(|t| t.with_timezone(&Utc))
}

/// Select the first declared action for a resource whose conditions matched,
/// unless the attempt ceiling or a cooldown window says otherwise. Actions
/// are never combined.
pub fn plan<'a>(
    spec: &'a RemediationPolicySpec,
    matched: bool,
    ledger: &ResourceLedger,
    policy_last_applied: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> PlanDecision<'a> {
    if !matched {
        return PlanDecision::Skip(SkipReason::NoConditionMatched);
    }
    if spec.max_attempts > 0 && ledger.attempts >= spec.max_attempts {
        return PlanDecision::Skip(SkipReason::MaxAttemptsReached);
    }
    if spec.cooldown_secs > 0 {
        let window = chrono::Duration::seconds(spec.cooldown_secs as i64);
        let recent = |t: Option<DateTime<Utc>>| {
            t.is_some_and(|t| now.signed_duration_since(t) < window)
        };
        if recent(policy_last_applied) || recent(ledger.last_applied) {
            return PlanDecision::Skip(SkipReason::InCooldown);
        }
    }
    match spec.actions.first() {
        Some(action) => PlanDecision::Apply(action),
        None => PlanDecision::Skip(SkipReason::NoActions),
    }
}

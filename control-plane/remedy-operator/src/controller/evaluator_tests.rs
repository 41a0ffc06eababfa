use std::collections::{BTreeMap, HashSet};

use chrono::{Duration, Utc};

use crate::cluster::{ObservedResource, PolicyKey, ResourceId};
use crate::controller::evaluator::PendingConditions;
use crate::crd::remediation_policy::{
    CompareOp, ConditionKind, ConditionSpec, ConditionStatus, TargetKind,
};

fn pod(name: &str, ready: ConditionStatus) -> ObservedResource {
    let mut conditions = BTreeMap::new();
    conditions.insert("Ready".to_string(), ready);
    ObservedResource {
        id: ResourceId::new(TargetKind::Pod, "default", name),
        version: "1".to_string(),
        generation: 0,
        labels: BTreeMap::new(),
        owner: None,
        desired_replicas: None,
        available_replicas: None,
        unavailable_replicas: None,
        conditions,
        template: None,
    }
}

fn deployment(name: &str, desired: i32, available: i32) -> ObservedResource {
    ObservedResource {
        id: ResourceId::new(TargetKind::Deployment, "default", name),
        version: "1".to_string(),
        generation: 1,
        labels: BTreeMap::new(),
        owner: None,
        desired_replicas: Some(desired),
        available_replicas: Some(available),
        unavailable_replicas: None,
        conditions: BTreeMap::new(),
        template: None,
    }
}

fn not_ready(min_duration_secs: u64) -> ConditionSpec {
    ConditionSpec {
        kind: ConditionKind::Ready,
        status: Some(ConditionStatus::False),
        value: None,
        operator: CompareOp::Equals,
        min_duration_secs,
    }
}

#[test]
fn zero_duration_matches_on_first_true_observation() {
    let mut pending = PendingConditions::new();
    let key = PolicyKey::new("heal-web");
    let now = Utc::now();
    assert!(pending.matches(
        &key,
        &pod("web-1", ConditionStatus::False),
        &not_ready(0),
        now
    ));
}

#[test]
fn duration_gate_holds_until_continuously_true() {
    let mut pending = PendingConditions::new();
    let key = PolicyKey::new("heal-web");
    let cond = not_ready(60);
    let unhealthy = pod("web-1", ConditionStatus::False);
    let t0 = Utc::now();

    assert!(!pending.matches(&key, &unhealthy, &cond, t0));
    assert!(!pending.matches(
        &key,
        &unhealthy,
        &cond,
        t0 + Duration::seconds(30)
    ));
    assert!(pending.matches(
        &key,
        &unhealthy,
        &cond,
        t0 + Duration::seconds(60)
    ));
}

#[test]
fn intervening_false_observation_resets_the_timer() {
    let mut pending = PendingConditions::new();
    let key = PolicyKey::new("heal-web");
    let cond = not_ready(60);
    let t0 = Utc::now();

    assert!(!pending.matches(
        &key,
        &pod("web-1", ConditionStatus::False),
        &cond,
        t0
    ));
    // recovers at t+30: pending state clears
    assert!(!pending.matches(
        &key,
        &pod("web-1", ConditionStatus::True),
        &cond,
        t0 + Duration::seconds(30)
    ));
    // degrades again: the clock starts over from t+40
    assert!(!pending.matches(
        &key,
        &pod("web-1", ConditionStatus::False),
        &cond,
        t0 + Duration::seconds(40)
    ));
    assert!(!pending.matches(
        &key,
        &pod("web-1", ConditionStatus::False),
        &cond,
        t0 + Duration::seconds(90)
    ));
    assert!(pending.matches(
        &key,
        &pod("web-1", ConditionStatus::False),
        &cond,
        t0 + Duration::seconds(100)
    ));
}

#[test]
fn absent_condition_reads_as_unknown() {
    let mut pending = PendingConditions::new();
    let key = PolicyKey::new("heal-web");
    let mut resource = pod("web-1", ConditionStatus::True);
    resource.conditions.clear();

    let cond = ConditionSpec {
        kind: ConditionKind::Ready,
        status: Some(ConditionStatus::Unknown),
        value: None,
        operator: CompareOp::Equals,
        min_duration_secs: 0,
    };
    assert!(pending.matches(&key, &resource, &cond, Utc::now()));
}

#[test]
fn replica_counts_honor_ordering_operators() {
    let mut pending = PendingConditions::new();
    let key = PolicyKey::new("heal-web");
    let cond = ConditionSpec {
        kind: ConditionKind::AvailableReplicas,
        status: None,
        value: Some(2),
        operator: CompareOp::LessThan,
        min_duration_secs: 0,
    };
    assert!(pending.matches(
        &key,
        &deployment("web", 3, 1),
        &cond,
        Utc::now()
    ));
    assert!(!pending.matches(
        &key,
        &deployment("web", 3, 2),
        &cond,
        Utc::now()
    ));
}

#[test]
fn unavailable_falls_back_to_desired_minus_available() {
    let mut pending = PendingConditions::new();
    let key = PolicyKey::new("heal-web");
    let cond = ConditionSpec {
        kind: ConditionKind::UnavailableReplicas,
        status: None,
        value: Some(0),
        operator: CompareOp::GreaterThan,
        min_duration_secs: 0,
    };
    assert!(pending.matches(
        &key,
        &deployment("web", 3, 1),
        &cond,
        Utc::now()
    ));
    assert!(!pending.matches(
        &key,
        &deployment("web", 3, 3),
        &cond,
        Utc::now()
    ));
}

#[test]
fn pruning_drops_state_for_vanished_resources() {
    let mut pending = PendingConditions::new();
    let key = PolicyKey::new("heal-web");
    let cond = not_ready(60);
    let t0 = Utc::now();

    assert!(!pending.matches(
        &key,
        &pod("web-1", ConditionStatus::False),
        &cond,
        t0
    ));

    // web-1 disappears between cycles
    let live: HashSet<ResourceId> = HashSet::new();
    pending.retain_resources(&key, &live);

    // reappearing later starts gating from zero again
    assert!(!pending.matches(
        &key,
        &pod("web-1", ConditionStatus::False),
        &cond,
        t0 + Duration::seconds(90)
    ));
}

#[test]
fn gating_state_is_scoped_per_policy() {
    let mut pending = PendingConditions::new();
    let cond = not_ready(60);
    let t0 = Utc::now();
    let unhealthy = pod("web-1", ConditionStatus::False);

    let a = PolicyKey::new("policy-a");
    let b = PolicyKey::new("policy-b");
    assert!(!pending.matches(&a, &unhealthy, &cond, t0));
    pending.evict_policy(&a);
    // policy-b never observed the resource before, so its clock starts now
    assert!(!pending.matches(
        &b,
        &unhealthy,
        &cond,
        t0 + Duration::seconds(59)
    ));
}

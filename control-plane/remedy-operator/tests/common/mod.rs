#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use remedy_operator::cluster::{
    ClusterError, ClusterObserver, EventStream, ObservedResource, OwnerRef,
    PolicyEvent, PolicyKey, ResourceId, ResourcePatch, ResourceUpdate,
    RevisionRecord, WatchEvent, selector_matches,
};
use remedy_operator::config::RemedyConfig;
use remedy_operator::crd::remediation_policy::{
    ActionKind, ActionSpec, ConditionKind, ConditionSpec, ConditionStatus,
    CompareOp, RemediationPolicy, RemediationPolicySpec,
    RemediationPolicyStatus, TargetKind,
};

#[derive(Default)]
struct FakeState {
    resources: HashMap<ResourceId, ObservedResource>,
    revisions: HashMap<ResourceId, Vec<RevisionRecord>>,
    policies: HashMap<PolicyKey, RemediationPolicy>,
    version: u64,
    status_conflicts: u32,
    list_unavailable: bool,
    list_fatal: bool,
    list_delay_ms: u64,
    list_calls: u64,
    active_lists: u32,
    max_active_lists: u32,
    updates: Vec<ResourceUpdate>,
    deleted: Vec<ResourceId>,
}

/// In-memory cluster observer with injectable failures and call tracing.
pub struct FakeCluster {
    state: Mutex<FakeState>,
    resource_tx: broadcast::Sender<WatchEvent>,
    policy_tx: broadcast::Sender<PolicyEvent>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        let (resource_tx, _) = broadcast::channel(256);
        let (policy_tx, _) = broadcast::channel(256);
        let state = FakeState { version: 1000, ..FakeState::default() };
        Arc::new(Self { state: Mutex::new(state), resource_tx, policy_tx })
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn put_resource(&self, resource: ObservedResource) {
        self.lock().resources.insert(resource.id.clone(), resource);
    }

    pub fn remove_resource(&self, id: &ResourceId) {
        self.lock().resources.remove(id);
    }

    pub fn put_revisions(
        &self,
        workload: ResourceId,
        revisions: Vec<RevisionRecord>,
    ) {
        self.lock().revisions.insert(workload, revisions);
    }

    pub fn put_policy(&self, mut policy: RemediationPolicy) {
        if policy.metadata.resource_version.is_none() {
            policy.metadata.resource_version = Some("1".to_string());
        }
        self.lock().policies.insert(PolicyKey::from(&policy), policy);
    }

    pub fn remove_policy(&self, key: &PolicyKey) {
        self.lock().policies.remove(key);
    }

    pub fn status(&self, key: &PolicyKey) -> RemediationPolicyStatus {
        self.lock()
            .policies
            .get(key)
            .and_then(|p| p.status.clone())
            .unwrap_or_default()
    }

    pub fn inject_status_conflicts(&self, n: u32) {
        self.lock().status_conflicts = n;
    }

    pub fn set_list_unavailable(&self, on: bool) {
        self.lock().list_unavailable = on;
    }

    pub fn set_list_fatal(&self, on: bool) {
        self.lock().list_fatal = on;
    }

    pub fn set_list_delay_ms(&self, ms: u64) {
        self.lock().list_delay_ms = ms;
    }

    pub fn list_calls(&self) -> u64 {
        self.lock().list_calls
    }

    pub fn max_active_lists(&self) -> u32 {
        self.lock().max_active_lists
    }

    pub fn updates(&self) -> Vec<ResourceUpdate> {
        self.lock().updates.clone()
    }

    pub fn deleted(&self) -> Vec<ResourceId> {
        self.lock().deleted.clone()
    }

    pub fn notify_resource(&self, id: &ResourceId) {
        let _ = self.resource_tx.send(WatchEvent {
            id: id.clone(),
            generation: 0,
            change: remedy_operator::cluster::ChangeType::Applied,
        });
    }

    pub fn notify_policy_deleted(&self, key: &PolicyKey) {
        let _ = self.policy_tx.send(PolicyEvent {
            key: key.clone(),
            change: remedy_operator::cluster::ChangeType::Deleted,
        });
    }
}

#[async_trait]
impl ClusterObserver for FakeCluster {
    async fn watch(
        &self,
        kind: TargetKind,
    ) -> Result<EventStream<WatchEvent>, ClusterError> {
        let rx = self.resource_tx.subscribe();
        let stream = BroadcastStream::new(rx).filter_map(move |res| {
            futures_util::future::ready(
                res.ok().filter(|ev: &WatchEvent| ev.id.kind == kind),
            )
        });
        Ok(Box::pin(stream))
    }

    async fn list(
        &self,
        kind: TargetKind,
        selector: &LabelSelector,
        namespace: Option<&str>,
    ) -> Result<Vec<ObservedResource>, ClusterError> {
        let delay = {
            let mut s = self.lock();
            s.list_calls += 1;
            s.active_lists += 1;
            s.max_active_lists = s.max_active_lists.max(s.active_lists);
            if s.list_fatal {
                s.active_lists -= 1;
                return Err(ClusterError::Fatal(
                    "injected auth failure".to_string(),
                ));
            }
            if s.list_unavailable {
                s.active_lists -= 1;
                return Err(ClusterError::Unavailable(
                    "injected outage".to_string(),
                ));
            }
            s.list_delay_ms
        };
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        let mut s = self.lock();
        s.active_lists -= 1;
        let mut out: Vec<ObservedResource> = s
            .resources
            .values()
            .filter(|r| r.id.kind == kind)
            .filter(|r| namespace.is_none_or(|ns| r.id.namespace == ns))
            .filter(|r| selector_matches(selector, &r.labels))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn get(
        &self,
        id: &ResourceId,
    ) -> Result<Option<ObservedResource>, ClusterError> {
        Ok(self.lock().resources.get(id).cloned())
    }

    async fn update(
        &self,
        update: ResourceUpdate,
    ) -> Result<String, ClusterError> {
        let mut s = self.lock();
        let current = match s.resources.get(&update.id) {
            Some(r) => r.version.clone(),
            None => {
                return Err(ClusterError::NotFound(update.id.to_string()));
            }
        };
        if current != update.expected_version {
            return Err(ClusterError::Conflict(update.id.to_string()));
        }
        s.version += 1;
        let new_version = s.version.to_string();
        if let Some(r) = s.resources.get_mut(&update.id) {
            match &update.patch {
                ResourcePatch::Replicas(n) => r.desired_replicas = Some(*n),
                // template mutations roll the generation, like a real API
                ResourcePatch::Template { template, .. } => {
                    r.template = Some(template.clone());
                    r.generation += 1;
                }
                ResourcePatch::TemplateAnnotations(_) => r.generation += 1,
            }
            r.version = new_version.clone();
        }
        s.updates.push(update);
        Ok(new_version)
    }

    async fn delete(&self, id: &ResourceId) -> Result<(), ClusterError> {
        let mut s = self.lock();
        s.resources.remove(id);
        s.deleted.push(id.clone());
        Ok(())
    }

    async fn list_revision_history(
        &self,
        workload: &ResourceId,
    ) -> Result<Vec<RevisionRecord>, ClusterError> {
        Ok(self.lock().revisions.get(workload).cloned().unwrap_or_default())
    }

    async fn list_policies(
        &self,
    ) -> Result<Vec<RemediationPolicy>, ClusterError> {
        Ok(self.lock().policies.values().cloned().collect())
    }

    async fn watch_policies(
        &self,
    ) -> Result<EventStream<PolicyEvent>, ClusterError> {
        let rx = self.policy_tx.subscribe();
        let stream = BroadcastStream::new(rx)
            .filter_map(|res| futures_util::future::ready(res.ok()));
        Ok(Box::pin(stream))
    }

    async fn get_policy(
        &self,
        key: &PolicyKey,
    ) -> Result<Option<RemediationPolicy>, ClusterError> {
        Ok(self.lock().policies.get(key).cloned())
    }

    async fn update_policy_status(
        &self,
        key: &PolicyKey,
        status: &RemediationPolicyStatus,
        expected_version: &str,
    ) -> Result<String, ClusterError> {
        let mut s = self.lock();
        if s.status_conflicts > 0 {
            s.status_conflicts -= 1;
            return Err(ClusterError::Conflict(
                "injected status conflict".to_string(),
            ));
        }
        s.version += 1;
        let new_version = s.version.to_string();
        let Some(policy) = s.policies.get_mut(key) else {
            return Err(ClusterError::NotFound(key.to_string()));
        };
        let current =
            policy.metadata.resource_version.clone().unwrap_or_default();
        if current != expected_version {
            return Err(ClusterError::Conflict(key.to_string()));
        }
        policy.status = Some(status.clone());
        policy.metadata.resource_version = Some(new_version.clone());
        Ok(new_version)
    }
}

// --- fixture builders ---

pub fn test_config() -> RemedyConfig {
    RemedyConfig {
        http_port: 0,
        workers: 2,
        backoff_base_ms: 1000,
        backoff_cap_secs: 300,
        status_retries: 3,
    }
}

pub fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

pub fn label_selector(pairs: &[(&str, &str)]) -> LabelSelector {
    LabelSelector {
        match_labels: Some(labels(pairs)),
        match_expressions: None,
    }
}

pub fn condition(
    kind: ConditionKind,
    status: ConditionStatus,
    min_duration_secs: u64,
) -> ConditionSpec {
    ConditionSpec {
        kind,
        status: Some(status),
        value: None,
        operator: CompareOp::Equals,
        min_duration_secs,
    }
}

pub fn action(kind: ActionKind) -> ActionSpec {
    ActionSpec { kind, params: BTreeMap::new() }
}

pub fn policy(
    name: &str,
    target_kind: TargetKind,
    conditions: Vec<ConditionSpec>,
    actions: Vec<ActionSpec>,
) -> RemediationPolicy {
    RemediationPolicy::new(
        name,
        RemediationPolicySpec {
            selector: label_selector(&[("app", "web")]),
            target_kind,
            target_namespace: None,
            conditions,
            actions,
            check_interval_secs: 0,
            max_attempts: 0,
            cooldown_secs: 0,
        },
    )
}

pub fn pod(
    name: &str,
    ready: ConditionStatus,
    owner: Option<OwnerRef>,
) -> ObservedResource {
    let mut conditions = BTreeMap::new();
    conditions.insert("Ready".to_string(), ready);
    ObservedResource {
        id: ResourceId::new(TargetKind::Pod, "default", name),
        version: "1".to_string(),
        generation: 0,
        labels: labels(&[("app", "web")]),
        owner,
        desired_replicas: None,
        available_replicas: None,
        unavailable_replicas: None,
        conditions,
        template: None,
    }
}

pub fn replica_set(name: &str, owner: &str) -> ObservedResource {
    ObservedResource {
        id: ResourceId::new(TargetKind::ReplicaSet, "default", name),
        version: "1".to_string(),
        generation: 1,
        labels: labels(&[("app", "web")]),
        owner: Some(OwnerRef {
            kind: "Deployment".to_string(),
            name: owner.to_string(),
        }),
        desired_replicas: Some(1),
        available_replicas: Some(0),
        unavailable_replicas: None,
        conditions: BTreeMap::new(),
        template: None,
    }
}

pub fn deployment(
    name: &str,
    generation: i64,
    conditions: &[(&str, ConditionStatus)],
) -> ObservedResource {
    let conditions = conditions
        .iter()
        .map(|(k, v)| (k.to_string(), *v))
        .collect::<BTreeMap<_, _>>();
    ObservedResource {
        id: ResourceId::new(TargetKind::Deployment, "default", name),
        version: "1".to_string(),
        generation,
        labels: labels(&[("app", "web")]),
        owner: None,
        desired_replicas: Some(3),
        available_replicas: Some(1),
        unavailable_replicas: Some(2),
        conditions,
        template: None,
    }
}

/// The usual owning chain: pod -> replica set -> deployment.
pub fn seed_pod_chain(fake: &FakeCluster, pod_ready: ConditionStatus) {
    fake.put_resource(deployment("web", 3, &[]));
    fake.put_resource(replica_set("web-abc", "web"));
    fake.put_resource(pod(
        "web-abc-1",
        pod_ready,
        Some(OwnerRef {
            kind: "ReplicaSet".to_string(),
            name: "web-abc".to_string(),
        }),
    ));
}

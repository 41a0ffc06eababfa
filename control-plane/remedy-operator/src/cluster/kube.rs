//! Kube-backed [`ClusterObserver`]. Everything cluster-specific (watch
//! mechanics, revision annotations, conflict codes) stays behind this
//! adapter; the controller never sees a kube type.

use std::collections::BTreeMap;
use std::fmt::Debug;

use futures_util::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::runtime::watcher::{self, watcher};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde_json::{Value as JsonValue, json};
use tracing::warn;

use super::{
    ChangeType, ClusterError, ClusterObserver, EventStream, ObservedResource,
    OwnerRef, PolicyEvent, PolicyKey, ResourceId, ResourcePatch,
    ResourceUpdate, RevisionRecord, WatchEvent, selector_label_string,
};
use crate::crd::remediation_policy::{
    ConditionStatus, RemediationPolicy, RemediationPolicyStatus, TargetKind,
};

/// Revision annotation the deployment controller stamps on replica sets.
pub const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

#[derive(Clone)]
pub struct KubeObserver {
    client: Client,
}

impl KubeObserver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn deployments(&self, ns: Option<&str>) -> Api<Deployment> {
        match ns {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn replica_sets(&self, ns: Option<&str>) -> Api<ReplicaSet> {
        match ns {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn pods(&self, ns: Option<&str>) -> Api<Pod> {
        match ns {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn policies(&self) -> Api<RemediationPolicy> {
        Api::all(self.client.clone())
    }
}

fn map_kube_err(e: kube::Error) -> ClusterError {
    match e {
        kube::Error::Api(ae) => match ae.code {
            404 => ClusterError::NotFound(ae.message),
            409 => ClusterError::Conflict(ae.message),
            401 | 403 => ClusterError::Fatal(ae.message),
            _ => ClusterError::Unavailable(ae.message),
        },
        other => ClusterError::Unavailable(other.to_string()),
    }
}

fn condition_status(raw: &str) -> ConditionStatus {
    match raw {
        "True" => ConditionStatus::True,
        "False" => ConditionStatus::False,
        _ => ConditionStatus::Unknown,
    }
}

fn controller_owner<K: Resource>(obj: &K) -> Option<OwnerRef> {
    obj.meta().owner_references.as_ref().and_then(|refs| {
        refs.iter().find(|r| r.controller.unwrap_or(false)).map(|r| OwnerRef {
            kind: r.kind.clone(),
            name: r.name.clone(),
        })
    })
}

fn observe_deployment(d: &Deployment) -> ObservedResource {
    let ns = d.namespace().unwrap_or_else(|| "default".to_string());
    let mut conditions = BTreeMap::new();
    if let Some(conds) = d.status.as_ref().and_then(|s| s.conditions.as_ref())
    {
        for c in conds {
            conditions.insert(c.type_.clone(), condition_status(&c.status));
        }
    }
    ObservedResource {
        id: ResourceId::new(TargetKind::Deployment, ns, d.name_any()),
        version: d.resource_version().unwrap_or_default(),
        generation: d.meta().generation.unwrap_or(0),
        labels: d.labels().clone(),
        owner: controller_owner(d),
        desired_replicas: d.spec.as_ref().and_then(|s| s.replicas),
        available_replicas: d
            .status
            .as_ref()
            .and_then(|s| s.available_replicas),
        unavailable_replicas: d
            .status
            .as_ref()
            .and_then(|s| s.unavailable_replicas),
        conditions,
        template: d
            .spec
            .as_ref()
            .and_then(|s| serde_json::to_value(&s.template).ok()),
    }
}

fn observe_replica_set(rs: &ReplicaSet) -> ObservedResource {
    let ns = rs.namespace().unwrap_or_else(|| "default".to_string());
    let mut conditions = BTreeMap::new();
    if let Some(conds) = rs.status.as_ref().and_then(|s| s.conditions.as_ref())
    {
        for c in conds {
            conditions.insert(c.type_.clone(), condition_status(&c.status));
        }
    }
    ObservedResource {
        id: ResourceId::new(TargetKind::ReplicaSet, ns, rs.name_any()),
        version: rs.resource_version().unwrap_or_default(),
        generation: rs.meta().generation.unwrap_or(0),
        labels: rs.labels().clone(),
        owner: controller_owner(rs),
        desired_replicas: rs.spec.as_ref().and_then(|s| s.replicas),
        available_replicas: rs
            .status
            .as_ref()
            .and_then(|s| s.available_replicas),
        unavailable_replicas: None,
        conditions,
        template: rs
            .spec
            .as_ref()
            .and_then(|s| s.template.as_ref())
            .and_then(|t| serde_json::to_value(t).ok()),
    }
}

fn observe_pod(p: &Pod) -> ObservedResource {
    let ns = p.namespace().unwrap_or_else(|| "default".to_string());
    let mut conditions = BTreeMap::new();
    if let Some(conds) = p.status.as_ref().and_then(|s| s.conditions.as_ref())
    {
        for c in conds {
            conditions.insert(c.type_.clone(), condition_status(&c.status));
        }
    }
    ObservedResource {
        id: ResourceId::new(TargetKind::Pod, ns, p.name_any()),
        version: p.resource_version().unwrap_or_default(),
        generation: p.meta().generation.unwrap_or(0),
        labels: p.labels().clone(),
        owner: controller_owner(p),
        desired_replicas: None,
        available_replicas: None,
        unavailable_replicas: None,
        conditions,
        template: None,
    }
}

fn watch_events<K>(ev: watcher::Event<K>, kind: TargetKind) -> Vec<WatchEvent>
where
    K: Resource,
    K::DynamicType: Default,
{
    let to_event = |obj: &K, change: ChangeType| WatchEvent {
        id: ResourceId::new(
            kind,
            obj.namespace().unwrap_or_else(|| "default".to_string()),
            obj.name_any(),
        ),
        generation: obj.meta().generation.unwrap_or(0),
        change,
    };
    match ev {
        watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => {
            vec![to_event(&obj, ChangeType::Applied)]
        }
        watcher::Event::Delete(obj) => {
            vec![to_event(&obj, ChangeType::Deleted)]
        }
        watcher::Event::Init | watcher::Event::InitDone => Vec::new(),
    }
}

fn watch_stream<K>(api: Api<K>, kind: TargetKind) -> EventStream<WatchEvent>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    K::DynamicType: Clone + Default,
{
    let stream =
        watcher(api, watcher::Config::default()).flat_map(move |res| {
            let events = match res {
                Ok(ev) => watch_events(ev, kind),
                Err(e) => {
                    warn!(error = %e, %kind, "watch stream error");
                    Vec::new()
                }
            };
            futures_util::stream::iter(events)
        });
    Box::pin(stream)
}

fn patch_body(update: &ResourceUpdate) -> JsonValue {
    let mut body = match &update.patch {
        ResourcePatch::TemplateAnnotations(annotations) => json!({
            "spec": {"template": {"metadata": {"annotations": annotations}}}
        }),
        ResourcePatch::Template { template, annotations } => json!({
            "metadata": {"annotations": annotations},
            "spec": {"template": template}
        }),
        ResourcePatch::Replicas(replicas) => {
            json!({"spec": {"replicas": replicas}})
        }
    };
    body["metadata"]["resourceVersion"] = json!(update.expected_version);
    body
}

#[async_trait::async_trait]
impl ClusterObserver for KubeObserver {
    async fn watch(
        &self,
        kind: TargetKind,
    ) -> Result<EventStream<WatchEvent>, ClusterError> {
        let stream = match kind {
            TargetKind::Deployment => {
                watch_stream(self.deployments(None), kind)
            }
            TargetKind::ReplicaSet => {
                watch_stream(self.replica_sets(None), kind)
            }
            TargetKind::Pod => watch_stream(self.pods(None), kind),
        };
        Ok(stream)
    }

    async fn list(
        &self,
        kind: TargetKind,
        selector: &LabelSelector,
        namespace: Option<&str>,
    ) -> Result<Vec<ObservedResource>, ClusterError> {
        let labels = selector_label_string(selector);
        let mut lp = ListParams::default();
        if !labels.is_empty() {
            lp = lp.labels(&labels);
        }
        let mut out = match kind {
            TargetKind::Deployment => self
                .deployments(namespace)
                .list(&lp)
                .await
                .map_err(map_kube_err)?
                .items
                .iter()
                .map(observe_deployment)
                .collect::<Vec<_>>(),
            TargetKind::ReplicaSet => self
                .replica_sets(namespace)
                .list(&lp)
                .await
                .map_err(map_kube_err)?
                .items
                .iter()
                .map(observe_replica_set)
                .collect::<Vec<_>>(),
            TargetKind::Pod => self
                .pods(namespace)
                .list(&lp)
                .await
                .map_err(map_kube_err)?
                .items
                .iter()
                .map(observe_pod)
                .collect::<Vec<_>>(),
        };
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn get(
        &self,
        id: &ResourceId,
    ) -> Result<Option<ObservedResource>, ClusterError> {
        let ns = Some(id.namespace.as_str());
        let observed = match id.kind {
            TargetKind::Deployment => self
                .deployments(ns)
                .get_opt(&id.name)
                .await
                .map_err(map_kube_err)?
                .map(|d| observe_deployment(&d)),
            TargetKind::ReplicaSet => self
                .replica_sets(ns)
                .get_opt(&id.name)
                .await
                .map_err(map_kube_err)?
                .map(|rs| observe_replica_set(&rs)),
            TargetKind::Pod => self
                .pods(ns)
                .get_opt(&id.name)
                .await
                .map_err(map_kube_err)?
                .map(|p| observe_pod(&p)),
        };
        Ok(observed)
    }

    async fn update(
        &self,
        update: ResourceUpdate,
    ) -> Result<String, ClusterError> {
        let body = patch_body(&update);
        let pp = PatchParams::default();
        let ns = Some(update.id.namespace.as_str());
        match update.id.kind {
            TargetKind::Deployment => {
                let obj = self
                    .deployments(ns)
                    .patch(&update.id.name, &pp, &Patch::Merge(&body))
                    .await
                    .map_err(map_kube_err)?;
                Ok(obj.resource_version().unwrap_or_default())
            }
            TargetKind::ReplicaSet => {
                let obj = self
                    .replica_sets(ns)
                    .patch(&update.id.name, &pp, &Patch::Merge(&body))
                    .await
                    .map_err(map_kube_err)?;
                Ok(obj.resource_version().unwrap_or_default())
            }
            TargetKind::Pod => Err(ClusterError::Unavailable(
                "pods carry no mutable template or replica count".to_string(),
            )),
        }
    }

    async fn delete(&self, id: &ResourceId) -> Result<(), ClusterError> {
        let dp = DeleteParams::default();
        let ns = Some(id.namespace.as_str());
        let res = match id.kind {
            TargetKind::Deployment => {
                self.deployments(ns).delete(&id.name, &dp).await.map(|_| ())
            }
            TargetKind::ReplicaSet => {
                self.replica_sets(ns).delete(&id.name, &dp).await.map(|_| ())
            }
            TargetKind::Pod => {
                self.pods(ns).delete(&id.name, &dp).await.map(|_| ())
            }
        };
        match res {
            Ok(()) => Ok(()),
            // Delete-for-recreate is idempotent: already gone is fine.
            Err(e) => match map_kube_err(e) {
                ClusterError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn list_revision_history(
        &self,
        workload: &ResourceId,
    ) -> Result<Vec<RevisionRecord>, ClusterError> {
        let ns = Some(workload.namespace.as_str());
        let dep = self
            .deployments(ns)
            .get_opt(&workload.name)
            .await
            .map_err(map_kube_err)?
            .ok_or_else(|| ClusterError::NotFound(workload.to_string()))?;

        let labels = dep
            .spec
            .as_ref()
            .map(|s| selector_label_string(&s.selector))
            .unwrap_or_default();
        let mut lp = ListParams::default();
        if !labels.is_empty() {
            lp = lp.labels(&labels);
        }
        let list = self
            .replica_sets(ns)
            .list(&lp)
            .await
            .map_err(map_kube_err)?;

        let mut records = Vec::new();
        for rs in list.items {
            let Some(revision) = rs
                .annotations()
                .get(REVISION_ANNOTATION)
                .and_then(|v| v.parse::<i64>().ok())
            else {
                continue;
            };
            let Some(template) = rs
                .spec
                .as_ref()
                .and_then(|s| s.template.as_ref())
                .and_then(|t| serde_json::to_value(t).ok())
            else {
                continue;
            };
            records.push(RevisionRecord { revision, template });
        }
        records.sort_by_key(|r| r.revision);
        Ok(records)
    }

    async fn list_policies(
        &self,
    ) -> Result<Vec<RemediationPolicy>, ClusterError> {
        let list = self
            .policies()
            .list(&ListParams::default())
            .await
            .map_err(map_kube_err)?;
        Ok(list.items)
    }

    async fn watch_policies(
        &self,
    ) -> Result<EventStream<PolicyEvent>, ClusterError> {
        let stream = watcher(self.policies(), watcher::Config::default())
            .flat_map(|res| {
                let events: Vec<PolicyEvent> = match res {
                    Ok(watcher::Event::Apply(p))
                    | Ok(watcher::Event::InitApply(p)) => vec![PolicyEvent {
                        key: PolicyKey::from(&p),
                        change: ChangeType::Applied,
                    }],
                    Ok(watcher::Event::Delete(p)) => vec![PolicyEvent {
                        key: PolicyKey::from(&p),
                        change: ChangeType::Deleted,
                    }],
                    Ok(watcher::Event::Init)
                    | Ok(watcher::Event::InitDone) => Vec::new(),
                    Err(e) => {
                        warn!(error = %e, "policy watch stream error");
                        Vec::new()
                    }
                };
                futures_util::stream::iter(events)
            });
        Ok(Box::pin(stream))
    }

    async fn get_policy(
        &self,
        key: &PolicyKey,
    ) -> Result<Option<RemediationPolicy>, ClusterError> {
        self.policies().get_opt(key.as_str()).await.map_err(map_kube_err)
    }

    async fn update_policy_status(
        &self,
        key: &PolicyKey,
        status: &RemediationPolicyStatus,
        expected_version: &str,
    ) -> Result<String, ClusterError> {
        let body = json!({
            "metadata": {"resourceVersion": expected_version},
            "status": status,
        });
        let obj = self
            .policies()
            .patch_status(
                key.as_str(),
                &PatchParams::default(),
                &Patch::Merge(&body),
            )
            .await
            .map_err(map_kube_err)?;
        Ok(obj.resource_version().unwrap_or_default())
    }
}

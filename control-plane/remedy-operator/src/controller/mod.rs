pub mod evaluator;
pub mod executor;
pub mod planner;
pub mod reconcile;
pub mod revisions;
pub mod scheduler;
pub mod status;

// Unit tests for the evaluator live in a sibling module file
#[cfg(test)]
mod evaluator_tests;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::cluster::{ClusterError, ClusterObserver, PolicyKey};
use crate::config::RemedyConfig;
use crate::crd::remediation_policy::{RemediationPolicy, TargetKind};
use evaluator::PendingConditions;

pub use reconcile::{Directive, reconcile_policy};
pub use scheduler::Scheduler;

#[derive(thiserror::Error, Debug)]
pub enum ReconcileErr {
    /// Retried via scheduler backoff; the next cycle gets a fresh view.
    #[error("transient: {0}")]
    Transient(String),
    /// Propagated to the process supervisor.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<ClusterError> for ReconcileErr {
    fn from(e: ClusterError) -> Self {
        match e {
            ClusterError::Fatal(m) => ReconcileErr::Fatal(m),
            other => ReconcileErr::Transient(other.to_string()),
        }
    }
}

/// Policies by key, kept current by the watch pump and each reconcile.
/// Only used to route resource events to the policies they may affect;
/// reconciliation always re-fetches the live object.
#[derive(Clone, Default)]
pub struct PolicyCache(Arc<RwLock<HashMap<PolicyKey, RemediationPolicy>>>);

impl PolicyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, key: PolicyKey, policy: RemediationPolicy) {
        let mut w = self.0.write().await;
        w.insert(key, policy);
    }

    pub async fn remove(&self, key: &PolicyKey) {
        let mut w = self.0.write().await;
        w.remove(key);
    }

    /// Keys of policies that could select a resource of this kind in this
    /// namespace. Coarse on purpose: the fresh selector list at reconcile
    /// time is what actually decides membership.
    pub async fn keys_for(
        &self,
        kind: TargetKind,
        namespace: &str,
    ) -> Vec<PolicyKey> {
        let r = self.0.read().await;
        r.iter()
            .filter(|(_, p)| {
                p.spec.target_kind == kind
                    && p.spec
                        .target_namespace
                        .as_deref()
                        .is_none_or(|ns| ns == namespace)
            })
            .map(|(k, _)| k.clone())
            .collect()
    }
}

pub struct ControllerContext {
    pub observer: Arc<dyn ClusterObserver>,
    pub cfg: RemedyConfig,
    pub policies: PolicyCache,
    pub pending: Mutex<PendingConditions>,
}

impl ControllerContext {
    pub fn new(observer: Arc<dyn ClusterObserver>, cfg: RemedyConfig) -> Self {
        Self {
            observer,
            cfg,
            policies: PolicyCache::new(),
            pending: Mutex::new(PendingConditions::new()),
        }
    }
}

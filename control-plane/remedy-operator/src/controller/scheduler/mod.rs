//! The control loop: watch pumps feed a coalescing single-flight queue, a
//! bounded worker pool drains it, and per-key wake timers drive periodic,
//! backoff, and cooldown requeues.

pub mod queue;


use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::reconcile::{Directive, reconcile_policy};
use super::{ControllerContext, ReconcileErr};
use crate::cluster::{ChangeType, PolicyKey};
use crate::crd::remediation_policy::TargetKind;
use queue::WorkQueue;

pub struct Scheduler {
    ctx: Arc<ControllerContext>,
    queue: Arc<WorkQueue>,
    /// One pending wake per key; scheduling a new wake replaces the old.
    timers: Mutex<HashMap<PolicyKey, AbortHandle>>,
    /// Consecutive transient failures per key, for exponential backoff.
    failures: Mutex<HashMap<PolicyKey, u32>>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(ctx: Arc<ControllerContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            queue: Arc::new(WorkQueue::new()),
            timers: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Graceful shutdown: no new work is accepted, pending wake timers die,
    /// in-flight reconciliations run to completion.
    pub fn stop(&self) {
        info!("scheduler stopping");
        self.shutdown.cancel();
        self.queue.shut_down();
    }

    /// Single-shot reconciliation, bypassing the queue. For tests and
    /// one-off invocations; single-flight only covers keys dispatched
    /// through [`Scheduler::start`].
    pub async fn reconcile_once(
        &self,
        key: &PolicyKey,
    ) -> Result<Directive, ReconcileErr> {
        reconcile_policy(&self.ctx, key).await
    }

    /// Run the control loop with `workers` parallel workers until shutdown
    /// or a fatal error.
    pub async fn start(self: Arc<Self>, workers: usize) -> anyhow::Result<()> {
        let initial = self
            .ctx
            .observer
            .list_policies()
            .await
            .map_err(|e| anyhow::anyhow!("initial policy list: {e}"))?;
        info!(policies = initial.len(), workers, "scheduler starting");
        for policy in initial {
            let key = PolicyKey::from(&policy);
            self.ctx.policies.upsert(key.clone(), policy).await;
            self.queue.add(key);
        }

        let mut pumps = Vec::new();
        pumps.push(tokio::spawn(policy_pump(self.clone())));
        for kind in TargetKind::ALL {
            pumps.push(tokio::spawn(resource_pump(self.clone(), kind)));
        }

        let mut set = JoinSet::new();
        for worker in 0..workers.max(1) {
            let sched = self.clone();
            set.spawn(async move { sched.worker_loop(worker).await });
        }

        let mut result = Ok(());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.stop();
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
                Err(e) => {
                    self.stop();
                    if result.is_ok() {
                        result = Err(anyhow::anyhow!("worker panicked: {e}"));
                    }
                }
            }
        }
        for pump in pumps {
            pump.abort();
        }
        self.cancel_all_wakes().await;
        result
    }

    async fn worker_loop(
        self: Arc<Self>,
        worker: usize,
    ) -> anyhow::Result<()> {
        while let Some(key) = self.queue.next().await {
            debug!(%key, worker, "reconciling");
            let outcome = reconcile_policy(&self.ctx, &key).await;
            self.queue.done(&key);
            match outcome {
                Ok(Directive::Forget) => {
                    self.cancel_wake(&key).await;
                    self.failures.lock().await.remove(&key);
                }
                Ok(Directive::Requeue(delay))
                | Ok(Directive::Cooldown(delay)) => {
                    self.failures.lock().await.remove(&key);
                    self.schedule_wake(key, delay).await;
                }
                Err(ReconcileErr::Transient(msg)) => {
                    let delay = self.next_backoff(&key).await;
                    warn!(%key, error = %msg, ?delay, "transient failure; backing off");
                    self.schedule_wake(key, delay).await;
                }
                Err(ReconcileErr::Fatal(msg)) => {
                    error!(%key, error = %msg, "fatal failure; shutting down");
                    self.stop();
                    return Err(anyhow::anyhow!(msg));
                }
            }
        }
        debug!(worker, "worker exiting");
        Ok(())
    }

    async fn next_backoff(&self, key: &PolicyKey) -> Duration {
        let mut failures = self.failures.lock().await;
        let n = failures.entry(key.clone()).or_insert(0);
        *n = n.saturating_add(1);
        let base = Duration::from_millis(self.ctx.cfg.backoff_base_ms);
        let cap = Duration::from_secs(self.ctx.cfg.backoff_cap_secs);
        let factor = 2u32.saturating_pow(n.saturating_sub(1).min(16));
        base.saturating_mul(factor).min(cap)
    }

    /// Replace any pending wake for the key. The timer is an explicit,
    /// abortable entry: cancellation and virtual-time tests both reach it.
    async fn schedule_wake(&self, key: PolicyKey, delay: Duration) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let mut timers = self.timers.lock().await;
        if let Some(old) = timers.remove(&key) {
            old.abort();
        }
        let queue = self.queue.clone();
        let token = self.shutdown.clone();
        let wake_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(wake_key),
            }
        });
        timers.insert(key, handle.abort_handle());
    }

    async fn cancel_wake(&self, key: &PolicyKey) {
        if let Some(handle) = self.timers.lock().await.remove(key) {
            handle.abort();
        }
    }

    async fn cancel_all_wakes(&self) {
        for (_, handle) in self.timers.lock().await.drain() {
            handle.abort();
        }
    }
}

/// Enqueue policy keys as policies change; deletions are routed through a
/// final reconcile so the worker observes the miss and forgets the key.
async fn policy_pump(sched: Arc<Scheduler>) {
    loop {
        let started = tokio::select! {
            _ = sched.shutdown.cancelled() => return,
            res = sched.ctx.observer.watch_policies() => res,
        };
        let mut stream = match started {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "policy watch failed to start; retrying");
                tokio::select! {
                    _ = sched.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                }
            }
        };
        loop {
            let event = tokio::select! {
                _ = sched.shutdown.cancelled() => return,
                ev = stream.next() => ev,
            };
            let Some(event) = event else { break };
            if event.change == ChangeType::Deleted {
                sched.ctx.policies.remove(&event.key).await;
            }
            sched.queue.add(event.key);
        }
    }
}

/// Enqueue every policy a changed resource could belong to. The routing is
/// coarse (kind + namespace scope); the fresh selector list at reconcile
/// time decides actual membership.
async fn resource_pump(sched: Arc<Scheduler>, kind: TargetKind) {
    loop {
        let started = tokio::select! {
            _ = sched.shutdown.cancelled() => return,
            res = sched.ctx.observer.watch(kind) => res,
        };
        let mut stream = match started {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, %kind, "resource watch failed to start; retrying");
                tokio::select! {
                    _ = sched.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                }
            }
        };
        loop {
            let event = tokio::select! {
                _ = sched.shutdown.cancelled() => return,
                ev = stream.next() => ev,
            };
            let Some(event) = event else { break };
            let keys =
                sched.ctx.policies.keys_for(kind, &event.id.namespace).await;
            for key in keys {
                sched.queue.add(key);
            }
        }
    }
}

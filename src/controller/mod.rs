//! Reconciliation controller.
//!
//! Every tick runs three phases in order: *observe* (coordination-store
//! snapshot plus cloud telemetry), *diff* (compute corrective actions), and
//! *act* (execute them with bounded parallelism and a per-action timeout).
//! Leader election mirrors the scheduler's on `/leader/controller`; every
//! replica observes so failover is warm, only the leader acts. Every
//! mutation is a CAS against the revision read during observation; a
//! conflict drops that entity's action for the tick and retries on the
//! next one.

mod instances;
mod scaling;
mod workers;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::time::timeout;

use crate::cloud::{CloudInstanceStatus, CloudProvider};
use crate::config::ControlConfig;
use crate::domain::instance::{InstanceId, LabletInstance};
use crate::domain::worker::{Worker, WorkerId, WorkerState};
use crate::error::ControlResult;
use crate::scheduler::LeaderElection;
use crate::service::StateService;
use crate::store::coord::Revision;

/// Snapshot the diff phase works from.
pub struct Observation {
    pub now: DateTime<Utc>,
    pub instances: Vec<(LabletInstance, Revision)>,
    pub workers: Vec<(Worker, Revision)>,
    /// Labs each polled worker reports as running; absent when the poll
    /// failed, in which case no inactivity is charged this tick.
    pub lab_reports: HashMap<WorkerId, HashSet<String>>,
    /// Machine status for workers still moving through their lifecycle
    pub cloud_status: HashMap<WorkerId, CloudInstanceStatus>,
}

/// One corrective action computed by the diff phase.
#[derive(Debug, Clone)]
pub enum Action {
    /// Return a scheduled/instantiating instance that lost its worker to
    /// `pending`
    ResetInstance(InstanceId),
    /// Stop an instance, recording the reason
    StopInstance(InstanceId, String),
    /// Drive a freshly `instantiating` instance onto its worker
    Instantiate(InstanceId),
    /// Advance collecting/grading glue for an instance
    AdvanceGrading(InstanceId),
    /// Record the score and stop a graded instance
    CompleteGrading(InstanceId),
    /// Stop and wipe the backend lab, then mark the instance stopped
    FinishStopping(InstanceId),
    /// Archive a stopped instance
    ArchiveInstance(InstanceId),
    /// Terminate an archived instance and destroy its record
    DestroyInstance(InstanceId),
    /// Advance a pending/provisioning worker as the cloud reports readiness
    AdvanceWorker(WorkerId),
    /// Drop a finished instance from a worker's bookkeeping
    ReleaseStale(WorkerId, InstanceId),
    /// Begin graceful drain of an idle worker
    DrainWorker(WorkerId),
    /// Move a drained (or drain-expired) worker to stopping
    StopDrained(WorkerId, bool),
    /// Record that the cloud confirmed the stop
    ConfirmStopped(WorkerId),
    /// Terminate the machine and destroy the worker record
    TerminateWorker(WorkerId),
    /// Destroy a lingering terminated worker record
    DestroyWorker(WorkerId),
    /// Create a worker from a template for unmet demand
    ScaleUp {
        template: String,
        instance: InstanceId,
        reason: String,
    },
}

impl Action {
    fn label(&self) -> &'static str {
        match self {
            Action::ResetInstance(_) => "reset-instance",
            Action::StopInstance(..) => "stop-instance",
            Action::Instantiate(_) => "instantiate",
            Action::AdvanceGrading(_) => "advance-grading",
            Action::CompleteGrading(_) => "complete-grading",
            Action::FinishStopping(_) => "finish-stopping",
            Action::ArchiveInstance(_) => "archive-instance",
            Action::DestroyInstance(_) => "destroy-instance",
            Action::AdvanceWorker(_) => "advance-worker",
            Action::ReleaseStale(..) => "release-stale",
            Action::DrainWorker(_) => "drain-worker",
            Action::StopDrained(..) => "stop-drained",
            Action::ConfirmStopped(_) => "confirm-stopped",
            Action::TerminateWorker(_) => "terminate-worker",
            Action::DestroyWorker(_) => "destroy-worker",
            Action::ScaleUp { .. } => "scale-up",
        }
    }
}

/// Outcome counts for one reconciliation pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileStats {
    pub executed: usize,
    pub conflicts: usize,
    pub failures: usize,
}

/// The reconciliation controller task.
pub struct Reconciler {
    service: Arc<StateService>,
    cloud: Arc<dyn CloudProvider>,
    leader: Arc<LeaderElection>,
    config: ControlConfig,
    /// Consecutive ticks each running instance has gone unreported
    inactive: HashMap<InstanceId, u32>,
}

impl Reconciler {
    pub fn new(
        service: Arc<StateService>,
        cloud: Arc<dyn CloudProvider>,
        leader: Arc<LeaderElection>,
        config: ControlConfig,
    ) -> Self {
        Self {
            service,
            cloud,
            leader,
            config,
            inactive: HashMap::new(),
        }
    }

    /// Run until cancelled.
    pub async fn run(&mut self) {
        let mut tick = tokio::time::interval(self.config.controller.tick());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            let lead = self.leader.is_leader();
            match self.tick_once(lead).await {
                Ok(stats) if lead => {
                    tracing::info!(
                        executed = stats.executed,
                        conflicts = stats.conflicts,
                        failures = stats.failures,
                        "reconcile pass complete"
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "reconcile pass failed");
                }
            }
        }
    }

    /// Observe, and when `act` is set, diff and execute. Exposed so tests
    /// can drive ticks deterministically.
    pub async fn tick_once(&mut self, act: bool) -> ControlResult<ReconcileStats> {
        let observation = self.observe(act).await?;
        if !act {
            return Ok(ReconcileStats::default());
        }
        let actions = self.diff(&observation);
        Ok(self.act(actions).await)
    }

    /// Phase one: snapshot both entity sets and poll the cloud where the
    /// lifecycle needs it. Telemetry snapshots are persisted only by the
    /// leader, honoring each worker's stored `next_refresh_at`.
    async fn observe(&self, persist_telemetry: bool) -> ControlResult<Observation> {
        let now = Utc::now();
        let (instances, _) = self.service.repo().list_instances().await?;
        let (workers, _) = self.service.repo().list_workers().await?;

        let mut lab_reports = HashMap::new();
        let mut cloud_status = HashMap::new();
        for (worker, _) in &workers {
            let Some(cloud_id) = worker.cloud_instance_id.as_deref() else {
                continue;
            };
            match worker.status {
                WorkerState::Pending | WorkerState::Provisioning | WorkerState::Stopping => {
                    match self.cloud.instance_status(cloud_id).await {
                        Ok(status) => {
                            cloud_status.insert(worker.id, status);
                        }
                        Err(err) => {
                            tracing::debug!(worker_id = %worker.id, error = %err, "status poll failed");
                        }
                    }
                }
                WorkerState::Running | WorkerState::Draining => {
                    match self.cloud.list_labs(cloud_id).await {
                        Ok(labs) => {
                            lab_reports.insert(worker.id, labs.into_iter().collect());
                        }
                        Err(err) => {
                            tracing::debug!(worker_id = %worker.id, error = %err, "lab poll failed");
                        }
                    }
                }
                _ => {}
            }

            if persist_telemetry
                && worker.status == WorkerState::Running
                && worker.next_refresh_at.map(|at| now >= at).unwrap_or(true)
            {
                self.refresh_telemetry(worker, cloud_id, now).await;
            }
        }

        Ok(Observation {
            now,
            instances,
            workers,
            lab_reports,
            cloud_status,
        })
    }

    async fn refresh_telemetry(&self, worker: &Worker, cloud_id: &str, now: DateTime<Utc>) {
        let window = std::time::Duration::from_secs(self.config.telemetry.poll_interval_secs);
        let metrics = match self.cloud.instance_metrics(cloud_id, window).await {
            Ok(metrics) => metrics,
            Err(err) => {
                tracing::debug!(worker_id = %worker.id, error = %err, "metrics poll failed");
                return;
            }
        };
        let active = worker.instance_ids.len() as u32;
        let next = now + self.config.telemetry.poll_interval();
        let result = self
            .service
            .update_worker(worker.id, |w| {
                w.telemetry = Some(crate::domain::worker::WorkerTelemetry {
                    cpu_pct: metrics.cpu_pct,
                    memory_pct: metrics.memory_pct,
                    storage_pct: metrics.storage_pct,
                    active_labs: active,
                    last_activity: Some(now),
                });
                w.next_refresh_at = Some(next);
            })
            .await;
        if let Err(err) = result {
            tracing::debug!(worker_id = %worker.id, error = %err, "telemetry persist skipped");
        }
    }

    /// Phase two: compute corrective actions across the three slices.
    fn diff(&mut self, observation: &Observation) -> Vec<Action> {
        let mut actions = Vec::new();
        actions.extend(self.diff_instances(observation));
        actions.extend(self.diff_workers(observation));
        actions.extend(self.diff_scaling(observation));
        actions
    }

    /// Phase three: execute with bounded parallelism and per-action
    /// timeouts. Conflicts are dropped for this tick.
    async fn act(&self, actions: Vec<Action>) -> ReconcileStats {
        let deadline = self.config.controller.action_timeout();
        let parallelism = self.config.controller.max_parallel_actions;
        let metrics = self.service.metrics().clone();

        let outcomes: Vec<(&'static str, ControlResult<()>)> = stream::iter(actions)
            .map(|action| {
                let label = action.label();
                async move {
                    let result = match timeout(deadline, self.execute(action)).await {
                        Ok(result) => result,
                        Err(_) => Err(crate::error::ControlError::Transient(format!(
                            "action {} timed out",
                            label
                        ))),
                    };
                    (label, result)
                }
            })
            .buffer_unordered(parallelism)
            .collect()
            .await;

        let mut stats = ReconcileStats::default();
        for (label, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    stats.executed += 1;
                    metrics.reconcile_actions.with_label_values(&["ok"]).inc();
                }
                Err(err) if err.is_conflict() => {
                    stats.conflicts += 1;
                    metrics
                        .reconcile_actions
                        .with_label_values(&["conflict"])
                        .inc();
                    tracing::debug!(action = label, error = %err, "action dropped this tick");
                }
                Err(err) => {
                    stats.failures += 1;
                    metrics
                        .reconcile_actions
                        .with_label_values(&["failed"])
                        .inc();
                    tracing::warn!(action = label, error = %err, "action failed");
                }
            }
        }
        stats
    }

    async fn execute(&self, action: Action) -> ControlResult<()> {
        match action {
            Action::ResetInstance(id) => self.execute_reset_instance(id).await,
            Action::StopInstance(id, reason) => self.execute_stop_instance(id, reason).await,
            Action::Instantiate(id) => self.execute_instantiate(id).await,
            Action::AdvanceGrading(id) => self.execute_advance_grading(id).await,
            Action::CompleteGrading(id) => self.execute_complete_grading(id).await,
            Action::FinishStopping(id) => self.execute_finish_stopping(id).await,
            Action::ArchiveInstance(id) => self.execute_archive(id).await,
            Action::DestroyInstance(id) => self.execute_destroy_instance(id).await,
            Action::AdvanceWorker(id) => self.execute_advance_worker(id).await,
            Action::ReleaseStale(worker, instance) => {
                self.execute_release_stale(worker, instance).await
            }
            Action::DrainWorker(id) => self.execute_drain_worker(id).await,
            Action::StopDrained(id, timed_out) => self.execute_stop_drained(id, timed_out).await,
            Action::ConfirmStopped(id) => self.execute_confirm_stopped(id).await,
            Action::TerminateWorker(id) => self.execute_terminate_worker(id).await,
            Action::DestroyWorker(id) => self.execute_destroy_worker(id).await,
            Action::ScaleUp {
                template,
                instance,
                reason,
            } => self.execute_scale_up(&template, instance, &reason).await,
        }
    }
}

//! Worker slice of the reconcile loop: lifecycle advance, drain handling,
//! and bookkeeping repair.

use std::collections::HashMap;

use serde_json::json;

use crate::cloud::CloudInstanceState;
use crate::controller::{Action, Observation, Reconciler};
use crate::domain::event::{Component, EventEnvelope, EventKind};
use crate::domain::instance::InstanceId;
use crate::domain::worker::{Capacity, WorkerId, WorkerState};
use crate::error::{ControlError, ControlResult};

impl Reconciler {
    pub(super) fn diff_workers(&mut self, observation: &Observation) -> Vec<Action> {
        let instances: HashMap<InstanceId, &crate::domain::instance::LabletInstance> = observation
            .instances
            .iter()
            .map(|(i, _)| (i.id, i))
            .collect();
        let mut actions = Vec::new();

        for (worker, _) in &observation.workers {
            match worker.status {
                WorkerState::Pending => {
                    if observation.cloud_status.contains_key(&worker.id) {
                        actions.push(Action::AdvanceWorker(worker.id));
                    }
                }
                WorkerState::Provisioning => {
                    if let Some(status) = observation.cloud_status.get(&worker.id) {
                        if status.state == CloudInstanceState::Running && status.checks_passed {
                            actions.push(Action::AdvanceWorker(worker.id));
                        }
                    }
                }
                WorkerState::Running | WorkerState::Draining => {
                    for instance_id in &worker.instance_ids {
                        let stale = instances
                            .get(instance_id)
                            .map(|i| !i.state.is_active())
                            .unwrap_or(true);
                        if stale {
                            actions.push(Action::ReleaseStale(worker.id, *instance_id));
                        }
                    }
                    if worker.status == WorkerState::Draining {
                        if worker.instance_ids.is_empty() {
                            actions.push(Action::StopDrained(worker.id, false));
                        } else if worker
                            .drain_deadline
                            .map(|deadline| observation.now >= deadline)
                            .unwrap_or(false)
                        {
                            actions.push(Action::StopDrained(worker.id, true));
                        }
                    } else if self.is_scale_down_candidate(worker, observation) {
                        actions.push(Action::DrainWorker(worker.id));
                    }
                }
                WorkerState::Stopping => {
                    let confirmed = match observation.cloud_status.get(&worker.id) {
                        Some(status) => {
                            matches!(
                                status.state,
                                CloudInstanceState::Stopped | CloudInstanceState::Terminated
                            )
                        }
                        // Nothing to confirm against for a machine-less record
                        None => worker.cloud_instance_id.is_none(),
                    };
                    if confirmed {
                        actions.push(Action::ConfirmStopped(worker.id));
                    }
                }
                WorkerState::Stopped => actions.push(Action::TerminateWorker(worker.id)),
                WorkerState::Terminated => actions.push(Action::DestroyWorker(worker.id)),
            }
        }
        actions
    }

    pub(super) async fn execute_advance_worker(&self, id: WorkerId) -> ControlResult<()> {
        let Some((worker, _)) = self.service.get_worker(id).await? else {
            return Ok(());
        };
        match worker.status {
            WorkerState::Pending => {
                self.service
                    .transition_worker(id, WorkerState::Provisioning, None, Component::Controller)
                    .await?;
                Ok(())
            }
            WorkerState::Provisioning => {
                let worker = self
                    .service
                    .transition_worker(id, WorkerState::Running, None, Component::Controller)
                    .await?;
                tracing::info!(worker_id = %id, template = %worker.template, "worker is ready");
                self.service
                    .emit(EventEnvelope::new(
                        EventKind::ScalingUpCompleted,
                        Component::Controller,
                        json!({
                            "worker_id": worker.id,
                            "template": worker.template,
                        }),
                    ))
                    .await;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Remove a finished (or vanished) instance from the worker's
    /// bookkeeping, recomputing allocated capacity from the instances that
    /// remain so the books always match the fleet.
    pub(super) async fn execute_release_stale(
        &self,
        worker_id: WorkerId,
        instance_id: InstanceId,
    ) -> ControlResult<()> {
        let Some((worker, revision)) = self.service.get_worker(worker_id).await? else {
            return Ok(());
        };
        if !worker.instance_ids.contains(&instance_id) {
            return Ok(());
        }
        let mut updated = worker.clone();
        updated.instance_ids.retain(|id| *id != instance_id);
        updated
            .port_allocations
            .retain(|a| a.instance_id != instance_id);

        let mut allocated = Capacity::default();
        for id in &updated.instance_ids {
            let Some((instance, _)) = self.service.get_instance(*id).await? else {
                continue;
            };
            match self.service.definition(&instance.definition) {
                Ok(definition) => {
                    allocated = allocated.plus(&Capacity::required_for(&definition));
                }
                Err(err) => {
                    tracing::warn!(instance_id = %id, error = %err, "definition lookup failed during repair");
                }
            }
        }
        updated.allocated = allocated;
        self.service.repo().cas_worker(&updated, revision).await?;
        tracing::debug!(worker_id = %worker_id, instance_id = %instance_id, "stale assignment released");
        Ok(())
    }

    pub(super) async fn execute_stop_drained(
        &self,
        id: WorkerId,
        timed_out: bool,
    ) -> ControlResult<()> {
        let Some((worker, _)) = self.service.get_worker(id).await? else {
            return Ok(());
        };
        if worker.status != WorkerState::Draining {
            return Ok(());
        }
        // Drain safety: without a deadline expiry, never stop a worker that
        // still hosts anything.
        if !timed_out && !worker.instance_ids.is_empty() {
            return Ok(());
        }
        if timed_out {
            tracing::warn!(worker_id = %id, "drain deadline elapsed; force-stopping");
        }
        if let Some(cloud_id) = worker.cloud_instance_id.as_deref() {
            self.cloud.stop_instance(cloud_id).await?;
        }
        self.service
            .transition_worker(id, WorkerState::Stopping, None, Component::Controller)
            .await?;
        Ok(())
    }

    pub(super) async fn execute_confirm_stopped(&self, id: WorkerId) -> ControlResult<()> {
        let Some((worker, _)) = self.service.get_worker(id).await? else {
            return Ok(());
        };
        if worker.status != WorkerState::Stopping {
            return Ok(());
        }
        let worker = self
            .service
            .transition_worker(id, WorkerState::Stopped, None, Component::Controller)
            .await?;
        self.service
            .emit(EventEnvelope::new(
                EventKind::ScalingDownCompleted,
                Component::Controller,
                json!({
                    "worker_id": worker.id,
                    "template": worker.template,
                }),
            ))
            .await;
        Ok(())
    }

    pub(super) async fn execute_terminate_worker(&self, id: WorkerId) -> ControlResult<()> {
        let Some((worker, _)) = self.service.get_worker(id).await? else {
            return Ok(());
        };
        if worker.status != WorkerState::Stopped {
            return Ok(());
        }
        if let Some(cloud_id) = worker.cloud_instance_id.as_deref() {
            match self.cloud.terminate_instance(cloud_id).await {
                Ok(()) | Err(ControlError::NotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        self.service
            .transition_worker(id, WorkerState::Terminated, None, Component::Controller)
            .await?;
        self.execute_destroy_worker(id).await
    }

    pub(super) async fn execute_destroy_worker(&self, id: WorkerId) -> ControlResult<()> {
        let Some((worker, revision)) = self.service.get_worker(id).await? else {
            return Ok(());
        };
        if worker.status != WorkerState::Terminated {
            return Ok(());
        }
        self.service.destroy_worker(id, revision).await?;
        Ok(())
    }
}

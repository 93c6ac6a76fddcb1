//! Instance slice of the reconcile loop: drift correction, instantiation,
//! and grading glue.

use std::collections::HashMap;

use crate::controller::{Action, Observation, Reconciler};
use crate::domain::event::{Component, EventEnvelope};
use crate::domain::instance::{InstanceId, InstanceState};
use crate::domain::worker::{Worker, WorkerState};
use crate::error::{ControlError, ControlResult};
use crate::rewrite;

impl Reconciler {
    pub(super) fn diff_instances(&mut self, observation: &Observation) -> Vec<Action> {
        let workers: HashMap<_, _> = observation
            .workers
            .iter()
            .map(|(w, _)| (w.id, w))
            .collect();
        let mut actions = Vec::new();

        for (instance, _) in &observation.instances {
            match instance.state {
                InstanceState::Scheduled | InstanceState::Instantiating => {
                    if self.assignment_lost(instance.worker_id, &workers) {
                        actions.push(Action::ResetInstance(instance.id));
                    } else if instance.state == InstanceState::Instantiating
                        && instance.backend_lab_id.is_none()
                    {
                        actions.push(Action::Instantiate(instance.id));
                    }
                }
                InstanceState::Running => {
                    if let Some(action) = self.check_liveness(instance, observation) {
                        actions.push(action);
                    }
                }
                InstanceState::Collecting => {
                    if instance.collected_artifacts_uri.is_some()
                        || instance.grading_score.is_some()
                    {
                        actions.push(Action::AdvanceGrading(instance.id));
                    }
                }
                InstanceState::Grading => {
                    if instance.grading_score.is_some() {
                        actions.push(Action::CompleteGrading(instance.id));
                    }
                }
                InstanceState::Stopping => actions.push(Action::FinishStopping(instance.id)),
                InstanceState::Stopped => actions.push(Action::ArchiveInstance(instance.id)),
                InstanceState::Archived => actions.push(Action::DestroyInstance(instance.id)),
                InstanceState::Pending | InstanceState::Terminated => {}
            }
        }

        // Forget liveness counters for instances no longer running
        let running: std::collections::HashSet<InstanceId> = observation
            .instances
            .iter()
            .filter(|(i, _)| i.state == InstanceState::Running)
            .map(|(i, _)| i.id)
            .collect();
        self.inactive.retain(|id, _| running.contains(id));

        actions
    }

    /// Whether the instance's worker is gone or can no longer host it.
    fn assignment_lost(
        &self,
        worker_id: Option<crate::domain::worker::WorkerId>,
        workers: &HashMap<crate::domain::worker::WorkerId, &Worker>,
    ) -> bool {
        match worker_id {
            None => true,
            Some(id) => match workers.get(&id) {
                None => true,
                Some(worker) => matches!(
                    worker.status,
                    WorkerState::Stopped | WorkerState::Terminated
                ),
            },
        }
    }

    /// Charge an inactivity tick when the worker's lab report is missing
    /// the instance; stop after the configured run of misses.
    fn check_liveness(
        &mut self,
        instance: &crate::domain::instance::LabletInstance,
        observation: &Observation,
    ) -> Option<Action> {
        let worker_id = instance.worker_id?;
        let report = observation.lab_reports.get(&worker_id)?;
        let active = instance
            .backend_lab_id
            .as_ref()
            .map(|lab| report.contains(lab))
            .unwrap_or(false);
        if active {
            self.inactive.remove(&instance.id);
            return None;
        }
        let misses = self.inactive.entry(instance.id).or_insert(0);
        *misses += 1;
        if *misses >= self.config.controller.inactive_ticks {
            self.inactive.remove(&instance.id);
            return Some(Action::StopInstance(
                instance.id,
                format!("worker stopped reporting lab after {} ticks", self.config.controller.inactive_ticks),
            ));
        }
        None
    }

    pub(super) async fn execute_reset_instance(&self, id: InstanceId) -> ControlResult<()> {
        let Some((instance, _)) = self.service.get_instance(id).await? else {
            return Ok(());
        };
        if !matches!(
            instance.state,
            InstanceState::Scheduled | InstanceState::Instantiating
        ) {
            return Ok(());
        }
        self.service
            .transition_instance(id, InstanceState::Pending, Component::Controller)
            .await?;
        tracing::info!(instance_id = %id, "instance returned to pending after losing its worker");
        Ok(())
    }

    pub(super) async fn execute_stop_instance(
        &self,
        id: InstanceId,
        reason: String,
    ) -> ControlResult<()> {
        let Some((instance, _)) = self.service.get_instance(id).await? else {
            return Ok(());
        };
        if !instance.state.is_active() {
            return Ok(());
        }
        self.service
            .update_instance(id, |i| i.last_failure = Some(reason.clone()))
            .await?;
        self.service
            .transition_instance(id, InstanceState::Stopping, Component::Controller)
            .await?;
        Ok(())
    }

    /// Drive one instantiation attempt: fetch the cached artifact, rewrite
    /// it with the allocated ports, hand it to the worker, record the
    /// backend lab id, and mark the instance running. Transient errors
    /// consume one attempt from the retry budget and leave the instance for
    /// the next tick; contract violations quarantine it immediately.
    pub(super) async fn execute_instantiate(&self, id: InstanceId) -> ControlResult<()> {
        let Some((instance, _)) = self.service.get_instance(id).await? else {
            return Ok(());
        };
        if instance.state != InstanceState::Instantiating || instance.backend_lab_id.is_some() {
            return Ok(());
        }
        if instance.instantiation_attempts >= self.config.controller.instantiation_retry_budget {
            return self
                .quarantine(
                    id,
                    format!(
                        "instantiation retry budget of {} exhausted",
                        self.config.controller.instantiation_retry_budget
                    ),
                )
                .await;
        }
        self.service
            .update_instance(id, |i| i.instantiation_attempts += 1)
            .await?;

        match self.try_instantiate(&instance).await {
            Ok(lab_id) => {
                self.service
                    .update_instance(id, |i| i.backend_lab_id = Some(lab_id.clone()))
                    .await?;
                self.service
                    .transition_instance(id, InstanceState::Running, Component::Controller)
                    .await?;
                tracing::info!(instance_id = %id, lab_id = %lab_id, "lab instantiated");
                Ok(())
            }
            Err(err) if matches!(err, ControlError::ContractViolation(_)) => {
                self.quarantine(id, err.to_string()).await
            }
            Err(err) => {
                self.service
                    .update_instance(id, |i| i.last_failure = Some(err.to_string()))
                    .await?;
                Err(err)
            }
        }
    }

    async fn try_instantiate(
        &self,
        instance: &crate::domain::instance::LabletInstance,
    ) -> ControlResult<String> {
        let definition = self.service.definition(&instance.definition)?;
        let artifact = definition.artifact_content.as_ref().ok_or_else(|| {
            ControlError::ContractViolation(format!(
                "definition {} has no cached artifact content",
                instance.definition
            ))
        })?;
        let ports = instance.allocated_ports.as_ref().ok_or_else(|| {
            ControlError::ContractViolation(format!(
                "instance {} reached instantiating without a port assignment",
                instance.id
            ))
        })?;
        let worker_id = instance.worker_id.ok_or_else(|| {
            ControlError::ContractViolation(format!(
                "instance {} reached instantiating without a worker",
                instance.id
            ))
        })?;
        let (worker, _) =
            self.service
                .get_worker(worker_id)
                .await?
                .ok_or(ControlError::NotFound {
                    kind: "worker",
                    id: worker_id.to_string(),
                })?;
        let cloud_id = worker.cloud_instance_id.as_deref().ok_or_else(|| {
            ControlError::ContractViolation(format!("worker {} has no cloud instance", worker_id))
        })?;

        let rewritten = rewrite::rewrite(artifact, ports);
        let lab_id = self.cloud.import_lab(cloud_id, &rewritten).await?;
        self.cloud.start_lab(cloud_id, &lab_id).await?;
        Ok(lab_id)
    }

    async fn quarantine(&self, id: InstanceId, reason: String) -> ControlResult<()> {
        tracing::warn!(instance_id = %id, reason = %reason, "quarantining instance");
        self.service
            .update_instance(id, |i| i.last_failure = Some(reason))
            .await?;
        self.service
            .transition_instance(id, InstanceState::Stopping, Component::Controller)
            .await?;
        Ok(())
    }

    /// `collecting -> grading`, continuing straight to `stopping` when the
    /// grade already arrived.
    pub(super) async fn execute_advance_grading(&self, id: InstanceId) -> ControlResult<()> {
        let Some((instance, _)) = self.service.get_instance(id).await? else {
            return Ok(());
        };
        if instance.state != InstanceState::Collecting {
            return Ok(());
        }
        let graded = self
            .service
            .transition_instance(id, InstanceState::Grading, Component::Controller)
            .await?;
        if graded.grading_score.is_some() {
            self.finish_grading(&graded).await?;
        }
        Ok(())
    }

    pub(super) async fn execute_complete_grading(&self, id: InstanceId) -> ControlResult<()> {
        let Some((instance, _)) = self.service.get_instance(id).await? else {
            return Ok(());
        };
        if instance.state != InstanceState::Grading || instance.grading_score.is_none() {
            return Ok(());
        }
        self.finish_grading(&instance).await
    }

    async fn finish_grading(
        &self,
        instance: &crate::domain::instance::LabletInstance,
    ) -> ControlResult<()> {
        self.service
            .emit(EventEnvelope::grading_completed(
                instance,
                Component::Controller,
            ))
            .await;
        self.service
            .transition_instance(instance.id, InstanceState::Stopping, Component::Controller)
            .await?;
        Ok(())
    }

    /// Stop and wipe the backend lab, then mark the instance stopped, which
    /// releases its worker capacity and port leases.
    pub(super) async fn execute_finish_stopping(&self, id: InstanceId) -> ControlResult<()> {
        let Some((instance, _)) = self.service.get_instance(id).await? else {
            return Ok(());
        };
        if instance.state != InstanceState::Stopping {
            return Ok(());
        }
        if let (Some(worker_id), Some(lab_id)) = (instance.worker_id, &instance.backend_lab_id) {
            if let Some((worker, _)) = self.service.get_worker(worker_id).await? {
                if let Some(cloud_id) = worker.cloud_instance_id.as_deref() {
                    match self.cloud.stop_lab(cloud_id, lab_id).await {
                        Ok(()) | Err(ControlError::NotFound { .. }) => {}
                        Err(err) => return Err(err),
                    }
                    match self.cloud.wipe_lab(cloud_id, lab_id).await {
                        Ok(()) | Err(ControlError::NotFound { .. }) => {}
                        Err(err) => return Err(err),
                    }
                }
            }
        }
        self.service
            .transition_instance(id, InstanceState::Stopped, Component::Controller)
            .await?;
        Ok(())
    }

    pub(super) async fn execute_archive(&self, id: InstanceId) -> ControlResult<()> {
        let Some((instance, _)) = self.service.get_instance(id).await? else {
            return Ok(());
        };
        if instance.state != InstanceState::Stopped {
            return Ok(());
        }
        self.service
            .transition_instance(id, InstanceState::Archived, Component::Controller)
            .await?;
        Ok(())
    }

    pub(super) async fn execute_destroy_instance(&self, id: InstanceId) -> ControlResult<()> {
        let Some((instance, _)) = self.service.get_instance(id).await? else {
            return Ok(());
        };
        if instance.state != InstanceState::Archived {
            return Ok(());
        }
        self.service
            .transition_instance(id, InstanceState::Terminated, Component::Controller)
            .await?;
        if let Some((_, revision)) = self.service.get_instance(id).await? {
            self.service.destroy_instance(id, revision).await?;
        }
        Ok(())
    }
}

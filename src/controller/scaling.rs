//! Scaling slice of the reconcile loop.
//!
//! Scale-up demand is derived from state every tick (pending instances
//! that no running worker can host, and pending instances inside the total
//! lead window), so a replica split between scheduler-leader and
//! controller-leader converges on the same action regardless of event
//! delivery. The dedupe key is `(template, reason)`: a worker already in
//! `pending` or `provisioning` for a template suppresses both reasons.
//!
//! Scale-down never sheds an active worker: candidates are idle running
//! workers with no compatible demand inside the grace window, and they
//! drain before they stop.

use std::collections::HashSet;

use chrono::Utc;

use crate::controller::{Action, Observation, Reconciler};
use crate::domain::event::{Component, EventEnvelope, EventKind};
use crate::domain::instance::{InstanceId, InstanceState};
use crate::domain::worker::{Worker, WorkerState, WorkerTemplate};
use crate::error::ControlResult;
use crate::scheduler::placement;

impl Reconciler {
    pub(super) fn diff_scaling(&mut self, observation: &Observation) -> Vec<Action> {
        let templates = match self.service.docs().list_templates() {
            Ok(templates) => templates,
            Err(err) => {
                tracing::warn!(error = %err, "template listing failed; skipping scale decisions");
                return Vec::new();
            }
        };
        let fleet: Vec<Worker> = observation.workers.iter().map(|(w, _)| w.clone()).collect();

        let mut actions = Vec::new();
        let mut planned: HashSet<(String, &'static str)> = HashSet::new();

        for (instance, _) in &observation.instances {
            if instance.state != InstanceState::Pending {
                continue;
            }
            let Ok(definition) = self.service.definition(&instance.definition) else {
                continue;
            };

            let reason: &'static str = if observation.now
                >= instance.timeslot.start - self.config.controller.total_lead_time()
            {
                "timeslot"
            } else if placement::select(&fleet, &definition).is_none() {
                "queue"
            } else {
                continue;
            };

            let Some(template) = placement::best_template(&templates, &definition) else {
                tracing::error!(
                    instance_id = %instance.id,
                    definition = %instance.definition,
                    "no template satisfies definition; cannot scale up"
                );
                continue;
            };

            // Skip when a worker for this template is already on its way up
            let warming = fleet.iter().any(|w| {
                w.template == template.name
                    && matches!(w.status, WorkerState::Pending | WorkerState::Provisioning)
            });
            if warming || !planned.insert((template.name.clone(), reason)) {
                continue;
            }
            actions.push(Action::ScaleUp {
                template: template.name.clone(),
                instance: instance.id,
                reason: reason.to_string(),
            });
        }
        actions
    }

    /// Whether an idle running worker may start draining.
    pub(super) fn is_scale_down_candidate(
        &self,
        worker: &Worker,
        observation: &Observation,
    ) -> bool {
        if worker.status != WorkerState::Running || worker.scale_down_exempt {
            return false;
        }
        let hosts_active = observation.instances.iter().any(|(i, _)| {
            i.worker_id == Some(worker.id) && i.state.is_active()
        });
        if hosts_active || !worker.instance_ids.is_empty() {
            return false;
        }
        // Hold the worker when compatible demand starts inside the grace
        // window.
        let horizon = observation.now + self.config.controller.scale_down_grace();
        let upcoming = observation.instances.iter().any(|(i, _)| {
            if i.state != InstanceState::Pending && i.state != InstanceState::Scheduled {
                return false;
            }
            if i.timeslot.start > horizon {
                return false;
            }
            match self.service.definition(&i.definition) {
                Ok(definition) => {
                    placement::filter(worker, &definition) == placement::FilterVerdict::Eligible
                }
                Err(_) => true,
            }
        });
        !upcoming
    }

    pub(super) async fn execute_drain_worker(&self, id: crate::domain::worker::WorkerId) -> ControlResult<()> {
        let Some((worker, _)) = self.service.get_worker(id).await? else {
            return Ok(());
        };
        if worker.status != WorkerState::Running {
            return Ok(());
        }
        let drain_timeout = self.drain_timeout_for(&worker.template).await;
        let deadline = Utc::now() + drain_timeout;
        self.service
            .transition_worker(id, WorkerState::Draining, Some(deadline), Component::Controller)
            .await?;
        tracing::info!(worker_id = %id, deadline = %deadline, "worker draining for scale-down");
        self.service
            .emit(EventEnvelope::new(
                EventKind::ScalingDownRequested,
                Component::Controller,
                serde_json::json!({
                    "worker_id": id,
                    "template": worker.template,
                    "drain_deadline": deadline,
                }),
            ))
            .await;
        Ok(())
    }

    async fn drain_timeout_for(&self, template_name: &str) -> chrono::Duration {
        let from_template = self
            .service
            .docs()
            .get_template(template_name)
            .ok()
            .flatten()
            .and_then(|t| t.drain_timeout_secs);
        match from_template {
            Some(secs) => chrono::Duration::seconds(secs as i64),
            None => self.config.controller.drain_timeout_default(),
        }
    }

    /// Launch one worker for an unmet demand signal, re-checking the dedupe
    /// key against fresh state first.
    pub(super) async fn execute_scale_up(
        &self,
        template_name: &str,
        instance: InstanceId,
        reason: &str,
    ) -> ControlResult<()> {
        let template: WorkerTemplate = self
            .service
            .docs()
            .get_template(template_name)?
            .ok_or(crate::error::ControlError::Config(format!(
                "worker template {} is not seeded",
                template_name
            )))?;

        let (workers, _) = self.service.repo().list_workers().await?;
        let warming = workers.iter().any(|(w, _)| {
            w.template == template.name
                && matches!(w.status, WorkerState::Pending | WorkerState::Provisioning)
        });
        if warming {
            return Ok(());
        }

        let cloud_id = self.cloud.create_instance(&template).await?;
        let mut worker = Worker::from_template(&template, String::new());
        worker.name = format!(
            "{}-{}",
            template.name,
            &worker.id.to_string()[..8]
        );
        worker.cloud_instance_id = Some(cloud_id.clone());
        let worker = self.service.create_worker(worker).await?;
        tracing::info!(
            worker_id = %worker.id,
            cloud_id = %cloud_id,
            template = %template.name,
            instance_id = %instance,
            reason,
            "scale-up launched"
        );
        Ok(())
    }
}

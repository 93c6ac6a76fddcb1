//! StateService: the single writer to the state substrate.
//!
//! Every mutation, whether from the public API, the scheduler's placement
//! commits, or the controller's corrective actions, funnels through this
//! facade. Each commit is a CAS against the revision the caller observed;
//! there is no coarser lock. Per-entity event order follows commit order
//! because mutations to one entity are serialized by the CAS itself and
//! the matching event is published immediately after the commit succeeds.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::domain::definition::{DefinitionRef, LabletDefinition};
use crate::domain::event::{Component, EventEnvelope, GradingScore};
use crate::domain::instance::{InstanceId, InstanceState, LabletInstance, Timeslot};
use crate::domain::worker::{Capacity, Worker, WorkerId, WorkerState, WorkerTemplate};
use crate::error::{ControlError, ControlResult};
use crate::fanout::EventFanout;
use crate::ports::PortAllocator;
use crate::store::coord::Revision;
use crate::store::docs::{DefinitionFilter, DocStore};
use crate::store::repo::Repo;
use crate::telemetry::Metrics;

const RELEASE_RETRY_BOUND: usize = 4;

/// Parameters for creating an instance
#[derive(Debug, Clone)]
pub struct CreateInstanceParams {
    pub definition: DefinitionRef,
    pub timeslot: Timeslot,
    pub owner: String,
    pub reservation_ref: String,
}

/// The mutation facade over both stores and the fan-out.
pub struct StateService {
    repo: Repo,
    docs: Arc<DocStore>,
    fanout: Arc<EventFanout>,
    ports: PortAllocator,
    metrics: Metrics,
}

impl StateService {
    pub fn new(
        repo: Repo,
        docs: Arc<DocStore>,
        fanout: Arc<EventFanout>,
        metrics: Metrics,
    ) -> Self {
        let ports = PortAllocator::new(repo.clone());
        Self {
            repo,
            docs,
            fanout,
            ports,
            metrics,
        }
    }

    pub fn repo(&self) -> &Repo {
        &self.repo
    }

    pub fn docs(&self) -> &Arc<DocStore> {
        &self.docs
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Publish an event that is not tied to a commit here (scaling signals,
    /// controller notices).
    pub async fn emit(&self, event: EventEnvelope) {
        self.fanout.publish(event).await;
    }

    // ------------------------------------------------------------------
    // Definitions
    // ------------------------------------------------------------------

    /// Register a definition version. Emits `definition.created` for a new
    /// name and `definition.version.created` for a subsequent version.
    pub async fn create_definition(&self, definition: LabletDefinition) -> ControlResult<()> {
        definition.validate()?;
        let first_version = !self.docs.definition_name_exists(&definition.name)?;
        self.docs.put_definition(&definition)?;
        let kind = if first_version {
            crate::domain::event::EventKind::DefinitionCreated
        } else {
            crate::domain::event::EventKind::DefinitionVersionCreated
        };
        self.fanout
            .publish(EventEnvelope::new(
                kind,
                Component::Api,
                serde_json::json!({
                    "definition_id": definition.id.to_string(),
                    "name": definition.name,
                    "version": definition.version,
                    "owner": definition.owner,
                }),
            ))
            .await;
        Ok(())
    }

    /// Resolve a definition by reference, erroring when absent.
    pub fn definition(&self, reference: &DefinitionRef) -> ControlResult<LabletDefinition> {
        self.docs
            .get_definition(&reference.name, &reference.version)?
            .ok_or_else(|| ControlError::NotFound {
                kind: "definition",
                id: reference.to_string(),
            })
    }

    pub fn list_definitions(
        &self,
        filter: &DefinitionFilter,
    ) -> ControlResult<Vec<LabletDefinition>> {
        self.docs.list_definitions(filter)
    }

    /// Refresh the cached artifact content for a definition version.
    pub async fn sync_definition(
        &self,
        name: &str,
        version: &str,
        content: serde_json::Value,
    ) -> ControlResult<()> {
        let mut definition =
            self.docs
                .get_definition(name, version)?
                .ok_or_else(|| ControlError::NotFound {
                    kind: "definition",
                    id: format!("{}@{}", name, version),
                })?;
        definition.artifact_content = Some(content);
        self.docs.update_definition(&definition)
    }

    /// Mark a definition version deprecated; instances already pinned to it
    /// are unaffected.
    pub async fn deprecate_definition(&self, name: &str, version: &str) -> ControlResult<()> {
        let mut definition =
            self.docs
                .get_definition(name, version)?
                .ok_or_else(|| ControlError::NotFound {
                    kind: "definition",
                    id: format!("{}@{}", name, version),
                })?;
        definition.deprecated = true;
        self.docs.update_definition(&definition)?;
        self.fanout
            .publish(EventEnvelope::new(
                crate::domain::event::EventKind::DefinitionDeprecated,
                Component::Api,
                serde_json::json!({
                    "definition_id": definition.id.to_string(),
                    "name": name,
                    "version": version,
                }),
            ))
            .await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Instances
    // ------------------------------------------------------------------

    /// Create an instance in `pending`.
    pub async fn create_instance(
        &self,
        params: CreateInstanceParams,
    ) -> ControlResult<LabletInstance> {
        let definition = self.definition(&params.definition)?;
        if definition.deprecated {
            return Err(ControlError::ContractViolation(format!(
                "definition {} is deprecated",
                params.definition
            )));
        }
        let instance = LabletInstance::new(
            params.definition,
            params.timeslot,
            params.owner,
            params.reservation_ref,
        );
        self.repo.create_instance(&instance).await?;
        self.fanout
            .publish(EventEnvelope::for_instance(&instance, Component::Api))
            .await;
        Ok(instance)
    }

    pub async fn get_instance(
        &self,
        id: InstanceId,
    ) -> ControlResult<Option<(LabletInstance, Revision)>> {
        self.repo.get_instance(id).await
    }

    pub async fn list_instances(&self) -> ControlResult<Vec<(LabletInstance, Revision)>> {
        Ok(self.repo.list_instances().await?.0)
    }

    pub async fn list_workers(&self) -> ControlResult<Vec<(Worker, Revision)>> {
        Ok(self.repo.list_workers().await?.0)
    }

    pub async fn get_worker(&self, id: WorkerId) -> ControlResult<Option<(Worker, Revision)>> {
        self.repo.get_worker(id).await
    }

    /// Commit a placement decision: port allocation, instance assignment,
    /// worker bookkeeping, in that order.
    ///
    /// The instance CAS from the revision the scheduler observed makes the
    /// decision at-most-once: a concurrent commit loses the race here and
    /// unwinds. A failed worker update releases the ports and reverts the
    /// instance so the scheduler can retry from filtering.
    pub async fn commit_placement(
        &self,
        instance: &LabletInstance,
        instance_rev: Revision,
        worker_id: WorkerId,
        definition: &LabletDefinition,
    ) -> ControlResult<()> {
        self.metrics.placement_attempts.inc();
        let mut placed = instance.clone();
        placed.transition(InstanceState::Scheduled, "scheduler")?;

        let allocated = self
            .ports
            .allocate(worker_id, instance.id, &definition.port_template)
            .await?;
        placed.worker_id = Some(worker_id);
        placed.allocated_ports = Some(allocated.clone());

        let new_rev = match self.repo.cas_instance(&placed, instance_rev).await {
            Ok(rev) => rev,
            Err(err) => {
                self.metrics.placement_conflicts.inc();
                let _ = self
                    .ports
                    .release_exact(worker_id, instance.id, &allocated)
                    .await;
                return Err(err);
            }
        };

        let required = Capacity::required_for(definition);
        match self.apply_assignment(worker_id, placed.id, required).await {
            Ok(()) => {
                self.fanout
                    .publish(EventEnvelope::for_instance(&placed, Component::Scheduler))
                    .await;
                Ok(())
            }
            Err(err) => {
                self.metrics.placement_conflicts.inc();
                let _ = self
                    .ports
                    .release_exact(worker_id, instance.id, &allocated)
                    .await;
                let mut reverted = placed.clone();
                if reverted.transition(InstanceState::Pending, "scheduler").is_ok() {
                    let _ = self.repo.cas_instance(&reverted, new_rev).await;
                }
                Err(err)
            }
        }
    }

    async fn apply_assignment(
        &self,
        worker_id: WorkerId,
        instance_id: InstanceId,
        required: Capacity,
    ) -> ControlResult<()> {
        let (mut worker, revision) =
            self.repo
                .get_worker(worker_id)
                .await?
                .ok_or(ControlError::NotFound {
                    kind: "worker",
                    id: worker_id.to_string(),
                })?;
        worker.assign(instance_id, required)?;
        self.repo.cas_worker(&worker, revision).await?;
        Ok(())
    }

    /// Apply a guarded instance transition and publish the matching event.
    ///
    /// A CAS conflict is returned to the caller: the controller drops the
    /// action for this tick, the API maps it to 409.
    pub async fn transition_instance(
        &self,
        id: InstanceId,
        target: InstanceState,
        actor: Component,
    ) -> ControlResult<LabletInstance> {
        let (mut instance, revision) =
            self.repo
                .get_instance(id)
                .await?
                .ok_or(ControlError::NotFound {
                    kind: "instance",
                    id: id.to_string(),
                })?;
        let released_worker = instance.worker_id;
        instance.transition(target, &actor.to_string())?;

        self.repo.cas_instance(&instance, revision).await?;
        self.fanout
            .publish(EventEnvelope::for_instance(&instance, actor))
            .await;

        // Leaving the fleet (or falling back to pending) releases the
        // worker's capacity, the instance list entry, and the port leases.
        if matches!(target, InstanceState::Stopped | InstanceState::Pending) {
            if let Some(worker_id) = released_worker {
                self.release_assignment(worker_id, &instance).await;
            }
        }
        Ok(instance)
    }

    /// Update a mutable instance field under CAS without a state change.
    pub async fn update_instance<F>(&self, id: InstanceId, mutate: F) -> ControlResult<LabletInstance>
    where
        F: FnOnce(&mut LabletInstance),
    {
        let (mut instance, revision) =
            self.repo
                .get_instance(id)
                .await?
                .ok_or(ControlError::NotFound {
                    kind: "instance",
                    id: id.to_string(),
                })?;
        mutate(&mut instance);
        self.repo.cas_instance(&instance, revision).await?;
        Ok(instance)
    }

    /// Record the artifacts URI delivered by `collection.completed`.
    pub async fn record_collection(
        &self,
        id: InstanceId,
        artifacts_uri: String,
    ) -> ControlResult<()> {
        self.update_instance(id, |instance| {
            instance.collected_artifacts_uri = Some(artifacts_uri);
        })
        .await?;
        Ok(())
    }

    /// Record a grading score delivered by `grading.completed`.
    pub async fn record_grading(&self, id: InstanceId, score: GradingScore) -> ControlResult<()> {
        self.update_instance(id, |instance| {
            instance.grading_score = Some(score);
        })
        .await?;
        Ok(())
    }

    /// Remove a terminated instance's record after archival.
    pub async fn destroy_instance(&self, id: InstanceId, revision: Revision) -> ControlResult<()> {
        self.repo.delete_instance(id, Some(revision)).await
    }

    async fn release_assignment(&self, worker_id: WorkerId, instance: &LabletInstance) {
        let required = match self.definition(&instance.definition) {
            Ok(definition) => Capacity::required_for(&definition),
            Err(err) => {
                tracing::warn!(instance_id = %instance.id, error = %err,
                    "definition lookup failed during release; capacity left for reconcile");
                Capacity::default()
            }
        };
        for _ in 0..RELEASE_RETRY_BOUND {
            let Ok(Some((mut worker, revision))) = self.repo.get_worker(worker_id).await else {
                break;
            };
            if !worker.instance_ids.contains(&instance.id) {
                break;
            }
            worker.unassign(instance.id, required);
            match self.repo.cas_worker(&worker, revision).await {
                Ok(_) => break,
                Err(err) if err.is_conflict() => continue,
                Err(err) => {
                    tracing::warn!(worker_id = %worker_id, error = %err, "assignment release failed");
                    break;
                }
            }
        }
        if let Err(err) = self.ports.release(worker_id, instance.id).await {
            tracing::warn!(worker_id = %worker_id, instance_id = %instance.id, error = %err,
                "port release failed; reconcile will retry");
        }
    }

    // ------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------

    /// Persist a worker freshly stamped from a template (scale-up path).
    pub async fn create_worker(&self, worker: Worker) -> ControlResult<Worker> {
        self.repo.create_worker(&worker).await?;
        self.fanout
            .publish(EventEnvelope::for_worker(&worker, Component::Controller))
            .await;
        Ok(worker)
    }

    /// Register an existing cloud machine as a worker (explicit import).
    pub async fn import_worker(
        &self,
        template: &WorkerTemplate,
        name: String,
        cloud_instance_id: String,
    ) -> ControlResult<Worker> {
        let mut worker = Worker::from_template(template, name);
        worker.cloud_instance_id = Some(cloud_instance_id);
        self.create_worker(worker).await
    }

    /// Apply a guarded worker transition and publish the matching event.
    /// Entering `draining` records the drain deadline.
    pub async fn transition_worker(
        &self,
        id: WorkerId,
        target: WorkerState,
        drain_deadline: Option<DateTime<Utc>>,
        actor: Component,
    ) -> ControlResult<Worker> {
        let (mut worker, revision) =
            self.repo
                .get_worker(id)
                .await?
                .ok_or(ControlError::NotFound {
                    kind: "worker",
                    id: id.to_string(),
                })?;
        worker.transition(target)?;
        if target == WorkerState::Draining {
            worker.drain_deadline = drain_deadline;
        }
        self.repo.cas_worker(&worker, revision).await?;
        self.fanout
            .publish(EventEnvelope::for_worker(&worker, actor))
            .await;
        Ok(worker)
    }

    /// Update mutable worker fields (telemetry, refresh deadline) under CAS
    /// without a lifecycle event.
    pub async fn update_worker<F>(&self, id: WorkerId, mutate: F) -> ControlResult<Worker>
    where
        F: FnOnce(&mut Worker),
    {
        let (mut worker, revision) =
            self.repo
                .get_worker(id)
                .await?
                .ok_or(ControlError::NotFound {
                    kind: "worker",
                    id: id.to_string(),
                })?;
        mutate(&mut worker);
        self.repo.cas_worker(&worker, revision).await?;
        Ok(worker)
    }

    /// Remove a terminated worker's record.
    pub async fn destroy_worker(&self, id: WorkerId, revision: Revision) -> ControlResult<()> {
        self.repo.delete_worker(id, Some(revision)).await
    }
}

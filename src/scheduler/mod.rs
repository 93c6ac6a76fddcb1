//! Placement scheduler.
//!
//! Assigns workers to pending instances, initiates scale-up signalling when
//! no worker fits, and watches approaching timeslots so instantiation
//! begins with adequate lead time. Replicas coordinate through leader
//! election on `/leader/scheduler`; only the leader places, standbys keep a
//! warm cache and campaign when the leader key vacates.

pub mod leader;
pub mod placement;
pub mod timeslot;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;

use crate::config::ControlConfig;
use crate::domain::event::{Component, EventEnvelope};
use crate::domain::instance::{InstanceId, InstanceState, LabletInstance};
use crate::error::{ControlError, ControlResult};
use crate::service::StateService;
use crate::store::cache::FleetCache;
use crate::store::coord::Revision;

pub use leader::LeaderElection;
pub use timeslot::TimeslotQueue;

/// How often a single placement retries within one pass, after a lost CAS
/// race or a commit that found the chosen worker no longer fit, before
/// deferring to the next trigger.
const PLACEMENT_RETRY_BOUND: usize = 3;

/// The placement scheduler task.
pub struct Scheduler {
    service: Arc<StateService>,
    cache: Arc<FleetCache>,
    leader: Arc<LeaderElection>,
    config: ControlConfig,
    queue: TimeslotQueue,
    /// Scale-up signals already emitted, keyed by instance and reason, so a
    /// pass does not re-emit an identical request every tick.
    signalled: HashSet<(InstanceId, &'static str)>,
}

impl Scheduler {
    pub fn new(
        service: Arc<StateService>,
        cache: Arc<FleetCache>,
        leader: Arc<LeaderElection>,
        config: ControlConfig,
    ) -> Self {
        Self {
            service,
            cache,
            leader,
            config,
            queue: TimeslotQueue::new(),
            signalled: HashSet::new(),
        }
    }

    /// Run until cancelled: a placement pass on every watch trigger and on
    /// the conservative periodic tick, leader only.
    pub async fn run(&mut self) {
        let mut dirty = self.cache.dirty();
        let mut tick = tokio::time::interval(self.config.scheduler.tick());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                changed = dirty.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            if !self.leader.is_leader() {
                continue;
            }
            if let Err(err) = self.pass().await {
                tracing::warn!(error = %err, "placement pass failed");
            }
        }
    }

    /// One full pass: place pending instances, then work the timeslot queue.
    pub async fn pass(&mut self) -> ControlResult<()> {
        let (instances, _) = self.service.repo().list_instances().await?;

        let mut pending: Vec<&(LabletInstance, Revision)> = instances
            .iter()
            .filter(|(i, _)| i.state == InstanceState::Pending)
            .collect();
        // Earliest timeslot first so lead-time pressure drives ordering
        pending.sort_by_key(|(i, _)| (i.timeslot.start, i.id));

        for (instance, revision) in pending {
            self.place(instance, *revision).await;
        }

        self.track_timeslots(&instances).await;
        self.prune_signals(&instances);
        Ok(())
    }

    /// Place one pending instance, retrying from filtering within bounds
    /// when the commit loses a race or the chosen worker stops fitting.
    async fn place(&mut self, instance: &LabletInstance, revision: Revision) {
        let definition = match self.service.definition(&instance.definition) {
            Ok(definition) => definition,
            Err(err) => {
                tracing::warn!(instance_id = %instance.id, error = %err,
                    "definition lookup failed; leaving instance pending");
                return;
            }
        };

        let mut current = instance.clone();
        let mut current_rev = revision;
        for attempt in 0..PLACEMENT_RETRY_BOUND {
            let (workers, _) = match self.service.repo().list_workers().await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    tracing::warn!(error = %err, "worker snapshot failed");
                    return;
                }
            };
            let fleet: Vec<_> = workers.iter().map(|(w, _)| w.clone()).collect();

            let Some(chosen) = placement::select(&fleet, &definition) else {
                self.request_scale_up(&current, "queue").await;
                return;
            };

            match self
                .service
                .commit_placement(&current, current_rev, chosen.id, &definition)
                .await
            {
                Ok(()) => {
                    tracing::info!(
                        instance_id = %current.id,
                        worker_id = %chosen.id,
                        attempt,
                        "instance scheduled"
                    );
                    return;
                }
                Err(err)
                    if err.is_conflict()
                        || matches!(err, ControlError::CapacityExhausted(_)) =>
                {
                    // The fleet moved since the snapshot: a CAS race, or the
                    // chosen worker filled up, ran out of ports, or started
                    // draining before the commit landed. The commit already
                    // unwound its ports and assignment; re-read and retry
                    // the whole placement from filtering.
                    match self.service.get_instance(current.id).await {
                        Ok(Some((fresh, fresh_rev))) if fresh.state == InstanceState::Pending => {
                            current = fresh;
                            current_rev = fresh_rev;
                        }
                        _ => return,
                    }
                }
                Err(err) => {
                    tracing::warn!(instance_id = %current.id, error = %err, "placement failed");
                    return;
                }
            }
        }
    }

    /// Maintain the lead-time queue and kick due instances into
    /// instantiation; signal scale-up for instances still unplaced inside
    /// the total lead window.
    async fn track_timeslots(&mut self, instances: &[(LabletInstance, Revision)]) {
        let now = Utc::now();
        for (instance, _) in instances {
            if instance.state == InstanceState::Scheduled {
                self.queue.push(instance.timeslot.start, instance.id);
            }
            // Unplaced inside the total lead window: the controller must
            // provision ahead of the deadline even if no fleet room exists.
            if instance.state == InstanceState::Pending
                && now >= instance.timeslot.start - self.config.controller.total_lead_time()
            {
                self.request_scale_up(instance, "timeslot").await;
            }
        }

        let cutoff = now + self.config.scheduler.lead_time();
        for id in self.queue.pop_due(cutoff) {
            let Ok(Some((instance, _))) = self.service.get_instance(id).await else {
                continue;
            };
            if instance.state != InstanceState::Scheduled {
                continue;
            }
            match self
                .service
                .transition_instance(id, InstanceState::Instantiating, Component::Scheduler)
                .await
            {
                Ok(_) => {
                    tracing::info!(instance_id = %id, "instantiation kicked ahead of timeslot");
                }
                Err(err) if err.is_conflict() => {
                    // Re-queue; the next pass sees the fresh record
                    self.queue.push(instance.timeslot.start, id);
                }
                Err(err) => {
                    tracing::warn!(instance_id = %id, error = %err, "instantiation kick failed");
                }
            }
        }
    }

    /// Emit `scaling.up.requested` once per (instance, reason).
    async fn request_scale_up(&mut self, instance: &LabletInstance, reason: &'static str) {
        if !self.signalled.insert((instance.id, reason)) {
            return;
        }
        let definition = match self.service.definition(&instance.definition) {
            Ok(definition) => definition,
            Err(_) => return,
        };
        let templates = match self.service.docs().list_templates() {
            Ok(templates) => templates,
            Err(err) => {
                tracing::warn!(error = %err, "template listing failed");
                return;
            }
        };
        let Some(template) = placement::best_template(&templates, &definition) else {
            tracing::error!(
                instance_id = %instance.id,
                definition = %instance.definition,
                "no worker template can satisfy definition"
            );
            return;
        };
        self.service.metrics().scale_up_requests.inc();
        tracing::info!(
            instance_id = %instance.id,
            template = %template.name,
            reason,
            "requesting scale-up"
        );
        self.service
            .emit(EventEnvelope::scale_up_requested(
                &template.name,
                instance.id,
                reason,
                Component::Scheduler,
            ))
            .await;
    }

    /// Forget scale-up signals for instances that left `pending`.
    fn prune_signals(&mut self, instances: &[(LabletInstance, Revision)]) {
        let pending: HashSet<InstanceId> = instances
            .iter()
            .filter(|(i, _)| i.state == InstanceState::Pending)
            .map(|(i, _)| i.id)
            .collect();
        self.signalled.retain(|(id, _)| pending.contains(id));
    }
}

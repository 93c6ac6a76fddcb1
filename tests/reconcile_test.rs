//! Reconciliation scenarios: drain-before-stop, drift correction,
//! instantiation, and liveness stops.

mod common;

use chrono::Duration;

use common::{definition, drain_events, drained_kinds, Harness};
use labfleet::cloud::CloudProvider;
use labfleet::domain::event::EventKind;
use labfleet::domain::instance::InstanceState;
use labfleet::domain::worker::WorkerState;

#[tokio::test]
async fn idle_worker_drains_then_stops_then_terminates() {
    let mut harness = Harness::new().await;
    let worker = harness.seed_running_worker("w1").await;
    let mut sub = harness.fanout.subscribe();

    // Tick 1: idle running worker with no upcoming work starts draining
    harness.reconciler.tick_once(true).await.unwrap();
    let (drained, _) = harness.repo.get_worker(worker.id).await.unwrap().unwrap();
    assert_eq!(drained.status, WorkerState::Draining);
    let deadline = drained.drain_deadline.expect("drain deadline set");
    let expected = chrono::Utc::now() + Duration::seconds(3600);
    assert!((deadline - expected).num_seconds().abs() < 5);

    let events = drain_events(&mut sub);
    assert!(events.iter().any(|e| e.kind == EventKind::WorkerDraining));
    assert!(events
        .iter()
        .any(|e| e.kind == EventKind::ScalingDownRequested));

    // A draining worker is invisible to placement
    let def = definition("routing-basics", 4, 8, &["serial_1"]);
    harness.service.create_definition(def.clone()).await.unwrap();
    let instance = harness.create_instance(&def, Duration::minutes(60)).await;
    harness.scheduler.pass().await.unwrap();
    let (unplaced, _) = harness.repo.get_instance(instance.id).await.unwrap().unwrap();
    assert_eq!(unplaced.state, InstanceState::Pending);
    assert!(unplaced.worker_id.is_none());

    // Tick 2: still empty, deadline not needed, proceed to stopping
    harness.reconciler.tick_once(true).await.unwrap();
    let (stopping, _) = harness.repo.get_worker(worker.id).await.unwrap().unwrap();
    assert_eq!(stopping.status, WorkerState::Stopping);

    // Tick 3: the cloud confirms the stop
    harness.reconciler.tick_once(true).await.unwrap();
    let (stopped, _) = harness.repo.get_worker(worker.id).await.unwrap().unwrap();
    assert_eq!(stopped.status, WorkerState::Stopped);

    // Tick 4: terminate and destroy the record
    harness.reconciler.tick_once(true).await.unwrap();
    assert!(harness.repo.get_worker(worker.id).await.unwrap().is_none());

    let kinds = drained_kinds(&mut sub);
    let order = [
        EventKind::WorkerStopping,
        EventKind::WorkerStopped,
        EventKind::ScalingDownCompleted,
        EventKind::WorkerTerminated,
    ];
    let mut last = 0;
    for kind in order {
        let pos = kinds
            .iter()
            .position(|k| *k == kind)
            .unwrap_or_else(|| panic!("missing {kind:?} in {kinds:?}"));
        assert!(pos >= last, "{kind:?} out of order in {kinds:?}");
        last = pos;
    }
}

#[tokio::test]
async fn draining_worker_with_active_instances_is_not_stopped() {
    let mut harness = Harness::new().await;
    let worker = harness.seed_running_worker("w1").await;
    let def = definition("routing-basics", 4, 8, &["serial_1"]);
    harness.service.create_definition(def.clone()).await.unwrap();
    let instance = harness.create_instance(&def, Duration::minutes(60)).await;
    harness.scheduler.pass().await.unwrap();

    // Operator-initiated drain while the instance is still scheduled
    harness
        .service
        .transition_worker(
            worker.id,
            WorkerState::Draining,
            Some(chrono::Utc::now() + Duration::hours(1)),
            labfleet::domain::event::Component::Api,
        )
        .await
        .unwrap();

    for _ in 0..3 {
        harness.reconciler.tick_once(true).await.unwrap();
        let (held, _) = harness.repo.get_worker(worker.id).await.unwrap().unwrap();
        assert_eq!(held.status, WorkerState::Draining);
        assert!(held.instance_ids.contains(&instance.id));
    }
}

#[tokio::test]
async fn workers_with_upcoming_demand_are_not_drained() {
    let mut harness = Harness::new().await;
    let worker = harness.seed_running_worker("w1").await;

    let def = definition("routing-basics", 4, 8, &[]);
    harness.service.create_definition(def.clone()).await.unwrap();
    // Compatible demand 10 minutes out, well inside the 30-minute grace
    harness.create_instance(&def, Duration::minutes(10)).await;

    harness.reconciler.tick_once(true).await.unwrap();
    let (still_running, _) = harness.repo.get_worker(worker.id).await.unwrap().unwrap();
    assert_eq!(still_running.status, WorkerState::Running);
}

#[tokio::test]
async fn scheduled_instance_without_a_worker_is_reset_to_pending() {
    let mut harness = Harness::new().await;
    let worker = harness.seed_running_worker("w1").await;
    let def = definition("routing-basics", 4, 8, &["serial_1"]);
    harness.service.create_definition(def.clone()).await.unwrap();
    let instance = harness.create_instance(&def, Duration::minutes(60)).await;
    harness.scheduler.pass().await.unwrap();

    // The worker record vanishes out from under the assignment
    harness.repo.delete_worker(worker.id, None).await.unwrap();

    harness.reconciler.tick_once(true).await.unwrap();
    let (reset, _) = harness.repo.get_instance(instance.id).await.unwrap().unwrap();
    assert_eq!(reset.state, InstanceState::Pending);
    assert!(reset.worker_id.is_none());
    assert!(reset.allocated_ports.is_none());
}

#[tokio::test]
async fn instantiation_imports_and_starts_the_lab() {
    let mut harness = Harness::new().await;
    let worker = harness.seed_running_worker("w1").await;
    let def = definition("routing-basics", 4, 8, &["serial_1"]);
    harness.service.create_definition(def.clone()).await.unwrap();
    let instance = harness.create_instance(&def, Duration::minutes(60)).await;
    harness.scheduler.pass().await.unwrap();

    harness
        .service
        .transition_instance(
            instance.id,
            InstanceState::Instantiating,
            labfleet::domain::event::Component::Scheduler,
        )
        .await
        .unwrap();

    harness.reconciler.tick_once(true).await.unwrap();

    let (running, _) = harness.repo.get_instance(instance.id).await.unwrap().unwrap();
    assert_eq!(running.state, InstanceState::Running);
    let lab_id = running.backend_lab_id.expect("backend lab id recorded");

    let cloud_id = worker.cloud_instance_id.unwrap();
    let labs = harness.cloud.list_labs(&cloud_id).await.unwrap();
    assert_eq!(labs, vec![lab_id]);
}

#[tokio::test]
async fn instantiation_quarantines_after_contract_violation() {
    let mut harness = Harness::new().await;
    harness.seed_running_worker("w1").await;
    let def = definition("routing-basics", 4, 8, &["serial_1"]);
    harness.service.create_definition(def.clone()).await.unwrap();
    let instance = harness.create_instance(&def, Duration::minutes(60)).await;
    harness.scheduler.pass().await.unwrap();
    harness
        .service
        .transition_instance(
            instance.id,
            InstanceState::Instantiating,
            labfleet::domain::event::Component::Scheduler,
        )
        .await
        .unwrap();

    harness.cloud.inject_malformed_imports(1);
    harness.reconciler.tick_once(true).await.unwrap();

    let (quarantined, _) = harness.repo.get_instance(instance.id).await.unwrap().unwrap();
    assert_eq!(quarantined.state, InstanceState::Stopping);
    assert!(quarantined.last_failure.is_some());
}

#[tokio::test]
async fn unreported_lab_stops_the_instance_after_three_ticks() {
    let mut harness = Harness::new().await;
    let worker = harness.seed_running_worker("w1").await;
    let def = definition("routing-basics", 4, 8, &["serial_1"]);
    harness.service.create_definition(def.clone()).await.unwrap();
    let instance = harness.create_instance(&def, Duration::minutes(60)).await;
    harness.scheduler.pass().await.unwrap();
    harness
        .service
        .transition_instance(
            instance.id,
            InstanceState::Instantiating,
            labfleet::domain::event::Component::Scheduler,
        )
        .await
        .unwrap();
    harness.reconciler.tick_once(true).await.unwrap();

    let (running, _) = harness.repo.get_instance(instance.id).await.unwrap().unwrap();
    assert_eq!(running.state, InstanceState::Running);

    // The backend loses the lab; the worker stops reporting it
    let cloud_id = worker.cloud_instance_id.unwrap();
    harness
        .cloud
        .drop_lab(&cloud_id, running.backend_lab_id.as_deref().unwrap());

    for _ in 0..2 {
        harness.reconciler.tick_once(true).await.unwrap();
        let (still, _) = harness.repo.get_instance(instance.id).await.unwrap().unwrap();
        assert_eq!(still.state, InstanceState::Running);
    }
    harness.reconciler.tick_once(true).await.unwrap();
    let (stopped, _) = harness.repo.get_instance(instance.id).await.unwrap().unwrap();
    assert_eq!(stopped.state, InstanceState::Stopping);
    assert!(stopped.last_failure.unwrap().contains("stopped reporting"));
}

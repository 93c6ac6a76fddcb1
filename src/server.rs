//! Process wiring: construct the substrate, fan-out, service, scheduler,
//! controller, and HTTP adapter in dependency order, and stop them in
//! reverse on shutdown.

use std::future::Future;
use std::sync::Arc;

use uuid::Uuid;

use crate::api::{router, ApiContext};
use crate::cloud::CloudProvider;
use crate::config::ControlConfig;
use crate::controller::Reconciler;
use crate::error::{ControlError, ControlResult};
use crate::fanout::EventFanout;
use crate::scheduler::{LeaderElection, Scheduler};
use crate::service::StateService;
use crate::store::cache::FleetCache;
use crate::store::coord::{CoordStore, MemCoordStore};
use crate::store::docs::DocStore;
use crate::store::repo::Repo;
use crate::telemetry::Metrics;

/// Run the control plane until `shutdown` resolves.
pub async fn run<S>(
    config: ControlConfig,
    cloud: Arc<dyn CloudProvider>,
    shutdown: S,
) -> ControlResult<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    config.validate()?;
    let metrics = Metrics::new()?;

    // Stores first
    let coord: Arc<dyn CoordStore> = Arc::new(MemCoordStore::new());
    let docs = Arc::new(DocStore::open(
        &config.storage.data_dir,
        config.storage.definition_cache_ttl(),
    )?);
    for template in &config.templates {
        docs.put_template(template)?;
    }
    if docs.list_templates()?.is_empty() {
        return Err(ControlError::Config(
            "no worker templates configured or seeded".to_string(),
        ));
    }
    let repo = Repo::new(Arc::clone(&coord));

    // Fan-out, then the mutation facade over both
    let fanout = Arc::new(EventFanout::new(
        config.fanout.clone(),
        Arc::clone(&docs),
        metrics.clone(),
    ));
    let service = Arc::new(StateService::new(
        repo.clone(),
        Arc::clone(&docs),
        Arc::clone(&fanout),
        metrics.clone(),
    ));

    let cache = Arc::new(FleetCache::new(repo.clone()));
    let node_id = format!("{}-{}", config.service.name, &Uuid::new_v4().to_string()[..8]);
    let scheduler_leader = Arc::new(LeaderElection::new(
        Arc::clone(&coord),
        "scheduler",
        node_id.clone(),
        config.scheduler.lease_ttl(),
    ));
    let controller_leader = Arc::new(LeaderElection::new(
        Arc::clone(&coord),
        "controller",
        node_id.clone(),
        config.scheduler.lease_ttl(),
    ));

    tracing::info!(node = %node_id, "control plane starting");

    let cache_task = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.run().await })
    };
    let heartbeat_task = {
        let fanout = Arc::clone(&fanout);
        tokio::spawn(async move { fanout.run_heartbeat().await })
    };
    let scheduler_leader_task = {
        let leader = Arc::clone(&scheduler_leader);
        tokio::spawn(async move { leader.run().await })
    };
    let controller_leader_task = {
        let leader = Arc::clone(&controller_leader);
        tokio::spawn(async move { leader.run().await })
    };
    let scheduler_task = {
        let mut scheduler = Scheduler::new(
            Arc::clone(&service),
            Arc::clone(&cache),
            Arc::clone(&scheduler_leader),
            config.clone(),
        );
        tokio::spawn(async move { scheduler.run().await })
    };
    let controller_task = {
        let mut reconciler = Reconciler::new(
            Arc::clone(&service),
            Arc::clone(&cloud),
            Arc::clone(&controller_leader),
            config.clone(),
        );
        tokio::spawn(async move { reconciler.run().await })
    };

    // HTTP adapter last
    let ctx = ApiContext {
        service: Arc::clone(&service),
        fanout: Arc::clone(&fanout),
        metrics: metrics.clone(),
        internal_token: config.api.internal_token.clone(),
    };
    let listener = tokio::net::TcpListener::bind(&config.api.listen_addr)
        .await
        .map_err(|e| {
            ControlError::Config(format!("cannot bind {}: {}", config.api.listen_addr, e))
        })?;
    tracing::info!(addr = %config.api.listen_addr, "listening");
    let serve = axum::serve(listener, router(ctx)).with_graceful_shutdown(shutdown);
    let result = serve.await;

    // Reverse-order teardown
    tracing::info!("control plane stopping");
    controller_task.abort();
    scheduler_task.abort();
    let _ = controller_leader.resign().await;
    let _ = scheduler_leader.resign().await;
    controller_leader_task.abort();
    scheduler_leader_task.abort();
    heartbeat_task.abort();
    cache_task.abort();
    fanout.shutdown().await;
    docs.flush()?;

    result.map_err(|e| ControlError::Internal(format!("http server failed: {}", e)))
}

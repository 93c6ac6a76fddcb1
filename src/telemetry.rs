//! Tracing initialization and control-plane metrics

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::config::LoggingConfig;
use crate::error::{ControlError, ControlResult};

/// Initialize the global tracing subscriber from configuration.
///
/// `RUST_LOG` takes precedence over the configured level. Safe to call once
/// per process; later calls fail quietly so tests can share a process.
pub fn init_tracing(config: &LoggingConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Prometheus metrics for the control plane.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub placement_attempts: IntCounter,
    pub placement_conflicts: IntCounter,
    pub scale_up_requests: IntCounter,
    pub reconcile_actions: IntCounterVec,
    pub fanout_dropped: IntCounter,
    pub fanout_subscribers: IntGauge,
}

impl Metrics {
    pub fn new() -> ControlResult<Self> {
        let registry = Registry::new();
        let placement_attempts = IntCounter::with_opts(Opts::new(
            "labfleet_placement_attempts_total",
            "Placement attempts by the scheduler",
        ))
        .map_err(|e| ControlError::Internal(e.to_string()))?;
        let placement_conflicts = IntCounter::with_opts(Opts::new(
            "labfleet_placement_conflicts_total",
            "Placement commits that lost a CAS race",
        ))
        .map_err(|e| ControlError::Internal(e.to_string()))?;
        let scale_up_requests = IntCounter::with_opts(Opts::new(
            "labfleet_scale_up_requests_total",
            "Scale-up requests emitted",
        ))
        .map_err(|e| ControlError::Internal(e.to_string()))?;
        let reconcile_actions = IntCounterVec::new(
            Opts::new(
                "labfleet_reconcile_actions_total",
                "Reconcile actions by outcome",
            ),
            &["outcome"],
        )
        .map_err(|e| ControlError::Internal(e.to_string()))?;
        let fanout_dropped = IntCounter::with_opts(Opts::new(
            "labfleet_fanout_dropped_total",
            "Events dropped for slow subscribers",
        ))
        .map_err(|e| ControlError::Internal(e.to_string()))?;
        let fanout_subscribers = IntGauge::with_opts(Opts::new(
            "labfleet_fanout_subscribers",
            "Currently connected push-channel subscribers",
        ))
        .map_err(|e| ControlError::Internal(e.to_string()))?;

        for collector in [
            Box::new(placement_attempts.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(placement_conflicts.clone()),
            Box::new(scale_up_requests.clone()),
            Box::new(reconcile_actions.clone()),
            Box::new(fanout_dropped.clone()),
            Box::new(fanout_subscribers.clone()),
        ] {
            registry
                .register(collector)
                .map_err(|e| ControlError::Internal(e.to_string()))?;
        }

        Ok(Self {
            registry,
            placement_attempts,
            placement_conflicts,
            scale_up_requests,
            reconcile_actions,
            fanout_dropped,
            fanout_subscribers,
        })
    }

    /// Render the registry in the Prometheus text format.
    pub fn render(&self) -> ControlResult<String> {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .map_err(|e| ControlError::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_and_render() {
        let metrics = Metrics::new().unwrap();
        metrics.placement_attempts.inc();
        metrics.reconcile_actions.with_label_values(&["ok"]).inc();
        let text = metrics.render().unwrap();
        assert!(text.contains("labfleet_placement_attempts_total"));
    }
}

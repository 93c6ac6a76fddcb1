//! In-process cloud provider for tests and local runs.
//!
//! Machines advance only when the harness tells them to, which keeps the
//! controller's behavior observable step by step. Fault injection covers
//! the failure classes the controller must handle: transient errors and
//! contract violations.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::cloud::{
    CloudInstanceState, CloudInstanceStatus, CloudInstanceSummary, CloudProvider, InstanceMetrics,
    ListFilter,
};
use crate::domain::worker::WorkerTemplate;
use crate::error::{ControlError, ControlResult};

struct Machine {
    state: CloudInstanceState,
    checks_passed: bool,
    instance_type: String,
    region: String,
    metrics: InstanceMetrics,
    labs: HashMap<String, bool>,
}

#[derive(Default)]
struct Inner {
    machines: HashMap<String, Machine>,
    next_machine: u64,
    next_lab: u64,
    transient_failures: u32,
    malformed_imports: u32,
}

/// Controllable in-memory [`CloudProvider`].
#[derive(Default)]
pub struct MockCloud {
    inner: Mutex<Inner>,
}

impl MockCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls fail transiently.
    pub fn inject_transient_failures(&self, n: u32) {
        self.inner.lock().transient_failures = n;
    }

    /// Make the next `n` lab imports return malformed data.
    pub fn inject_malformed_imports(&self, n: u32) {
        self.inner.lock().malformed_imports = n;
    }

    /// Drive a machine to a state, marking checks as passing when running.
    pub fn set_machine_state(&self, id: &str, state: CloudInstanceState) {
        let mut inner = self.inner.lock();
        if let Some(machine) = inner.machines.get_mut(id) {
            machine.state = state;
            machine.checks_passed = state == CloudInstanceState::Running;
        }
    }

    /// Drive every machine to running with checks passing.
    pub fn boot_all(&self) {
        let mut inner = self.inner.lock();
        for machine in inner.machines.values_mut() {
            machine.state = CloudInstanceState::Running;
            machine.checks_passed = true;
        }
    }

    /// Override a machine's reported metrics.
    pub fn set_metrics(&self, id: &str, metrics: InstanceMetrics) {
        let mut inner = self.inner.lock();
        if let Some(machine) = inner.machines.get_mut(id) {
            machine.metrics = metrics;
        }
    }

    /// Remove a lab from a machine's report, simulating backend loss.
    pub fn drop_lab(&self, instance_id: &str, lab_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(machine) = inner.machines.get_mut(instance_id) {
            machine.labs.remove(lab_id);
        }
    }

    pub fn machine_count(&self) -> usize {
        self.inner.lock().machines.len()
    }

    fn take_transient(inner: &mut Inner) -> ControlResult<()> {
        if inner.transient_failures > 0 {
            inner.transient_failures -= 1;
            return Err(ControlError::Transient(
                "injected provider failure".to_string(),
            ));
        }
        Ok(())
    }

    fn machine_mut<'a>(
        inner: &'a mut Inner,
        id: &str,
    ) -> ControlResult<&'a mut Machine> {
        inner.machines.get_mut(id).ok_or(ControlError::NotFound {
            kind: "cloud instance",
            id: id.to_string(),
        })
    }
}

#[async_trait]
impl CloudProvider for MockCloud {
    fn call_timeout(&self) -> Duration {
        Duration::from_secs(5)
    }

    async fn create_instance(&self, template: &WorkerTemplate) -> ControlResult<String> {
        let mut inner = self.inner.lock();
        Self::take_transient(&mut inner)?;
        inner.next_machine += 1;
        let id = format!("i-{:08x}", inner.next_machine);
        inner.machines.insert(
            id.clone(),
            Machine {
                state: CloudInstanceState::Pending,
                checks_passed: false,
                instance_type: template.instance_type.clone(),
                region: template.region.clone(),
                metrics: InstanceMetrics {
                    cpu_pct: 0.0,
                    memory_pct: 0.0,
                    storage_pct: 0.0,
                },
                labs: HashMap::new(),
            },
        );
        Ok(id)
    }

    async fn start_instance(&self, id: &str) -> ControlResult<()> {
        let mut inner = self.inner.lock();
        Self::take_transient(&mut inner)?;
        let machine = Self::machine_mut(&mut inner, id)?;
        machine.state = CloudInstanceState::Booting;
        Ok(())
    }

    async fn stop_instance(&self, id: &str) -> ControlResult<()> {
        let mut inner = self.inner.lock();
        Self::take_transient(&mut inner)?;
        let machine = Self::machine_mut(&mut inner, id)?;
        machine.state = CloudInstanceState::Stopped;
        machine.checks_passed = false;
        Ok(())
    }

    async fn terminate_instance(&self, id: &str) -> ControlResult<()> {
        let mut inner = self.inner.lock();
        Self::take_transient(&mut inner)?;
        let machine = Self::machine_mut(&mut inner, id)?;
        machine.state = CloudInstanceState::Terminated;
        machine.checks_passed = false;
        Ok(())
    }

    async fn instance_status(&self, id: &str) -> ControlResult<CloudInstanceStatus> {
        let mut inner = self.inner.lock();
        Self::take_transient(&mut inner)?;
        let machine = Self::machine_mut(&mut inner, id)?;
        Ok(CloudInstanceStatus {
            state: machine.state,
            checks_passed: machine.checks_passed,
        })
    }

    async fn instance_metrics(&self, id: &str, _window: Duration) -> ControlResult<InstanceMetrics> {
        let mut inner = self.inner.lock();
        Self::take_transient(&mut inner)?;
        let machine = Self::machine_mut(&mut inner, id)?;
        Ok(machine.metrics)
    }

    async fn list_instances(&self, filter: &ListFilter) -> ControlResult<Vec<CloudInstanceSummary>> {
        let inner = self.inner.lock();
        Ok(inner
            .machines
            .iter()
            .filter(|(_, m)| {
                filter
                    .region
                    .as_ref()
                    .map(|r| m.region == *r)
                    .unwrap_or(true)
                    && filter
                        .instance_type
                        .as_ref()
                        .map(|t| m.instance_type == *t)
                        .unwrap_or(true)
            })
            .map(|(id, m)| CloudInstanceSummary {
                id: id.clone(),
                state: m.state,
                instance_type: m.instance_type.clone(),
                region: m.region.clone(),
            })
            .collect())
    }

    async fn import_lab(&self, instance_id: &str, artifact: &Value) -> ControlResult<String> {
        let mut inner = self.inner.lock();
        Self::take_transient(&mut inner)?;
        if inner.malformed_imports > 0 {
            inner.malformed_imports -= 1;
            return Err(ControlError::ContractViolation(
                "backend returned malformed lab descriptor".to_string(),
            ));
        }
        if !artifact.is_object() {
            return Err(ControlError::ContractViolation(
                "lab artifact is not a structured document".to_string(),
            ));
        }
        inner.next_lab += 1;
        let lab_id = format!("lab-{:08x}", inner.next_lab);
        let machine = Self::machine_mut(&mut inner, instance_id)?;
        machine.labs.insert(lab_id.clone(), false);
        Ok(lab_id)
    }

    async fn start_lab(&self, instance_id: &str, lab_id: &str) -> ControlResult<()> {
        let mut inner = self.inner.lock();
        Self::take_transient(&mut inner)?;
        let machine = Self::machine_mut(&mut inner, instance_id)?;
        match machine.labs.get_mut(lab_id) {
            Some(running) => {
                *running = true;
                Ok(())
            }
            None => Err(ControlError::NotFound {
                kind: "lab",
                id: lab_id.to_string(),
            }),
        }
    }

    async fn stop_lab(&self, instance_id: &str, lab_id: &str) -> ControlResult<()> {
        let mut inner = self.inner.lock();
        Self::take_transient(&mut inner)?;
        let machine = Self::machine_mut(&mut inner, instance_id)?;
        if let Some(running) = machine.labs.get_mut(lab_id) {
            *running = false;
        }
        Ok(())
    }

    async fn wipe_lab(&self, instance_id: &str, lab_id: &str) -> ControlResult<()> {
        let mut inner = self.inner.lock();
        Self::take_transient(&mut inner)?;
        let machine = Self::machine_mut(&mut inner, instance_id)?;
        machine.labs.remove(lab_id);
        Ok(())
    }

    async fn list_labs(&self, instance_id: &str) -> ControlResult<Vec<String>> {
        let mut inner = self.inner.lock();
        Self::take_transient(&mut inner)?;
        let machine = Self::machine_mut(&mut inner, instance_id)?;
        Ok(machine
            .labs
            .iter()
            .filter(|(_, running)| **running)
            .map(|(id, _)| id.clone())
            .collect())
    }
}

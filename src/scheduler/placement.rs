//! Placement algorithm: ordered filters, bin-packing score, deterministic
//! tie-break.

use crate::domain::definition::LabletDefinition;
use crate::domain::worker::{Capacity, Worker, WorkerState, WorkerTemplate};

/// Why a worker was rejected, for the trace log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    Eligible,
    WrongLicense,
    InsufficientCapacity,
    ImageMismatch,
    InsufficientPorts,
    Draining,
}

/// Run the ordered filter chain for one worker, stopping at the first
/// failure.
pub fn filter(worker: &Worker, definition: &LabletDefinition) -> FilterVerdict {
    if !definition.license_affinity.contains(&worker.license) {
        return FilterVerdict::WrongLicense;
    }
    let required = Capacity::required_for(definition);
    if !worker.available().contains(&required) {
        return FilterVerdict::InsufficientCapacity;
    }
    if let Some(family) = &definition.resources.image_family {
        let matches = worker.image_family.as_deref() == Some(family.as_str())
            || worker.image_id == *family;
        if !matches {
            return FilterVerdict::ImageMismatch;
        }
    }
    if worker.free_port_count() < definition.port_template.len() {
        return FilterVerdict::InsufficientPorts;
    }
    if worker.status == WorkerState::Draining {
        return FilterVerdict::Draining;
    }
    FilterVerdict::Eligible
}

/// Utilization score in [0, 1]: the max over resource dimensions of
/// (allocated + required) / declared. Bin-packing prefers the fullest
/// feasible worker, so higher is better.
pub fn score(worker: &Worker, required: &Capacity) -> f64 {
    let dims = [
        (
            worker.allocated.cpu_cores + required.cpu_cores,
            worker.declared.cpu_cores,
        ),
        (
            worker.allocated.memory_gib + required.memory_gib,
            worker.declared.memory_gib,
        ),
        (
            worker.allocated.storage_gib + required.storage_gib,
            worker.declared.storage_gib,
        ),
        (
            worker.allocated.max_nodes + required.max_nodes,
            worker.declared.max_nodes,
        ),
    ];
    dims.iter()
        .filter(|(_, declared)| *declared > 0)
        .map(|(used, declared)| *used as f64 / *declared as f64)
        .fold(0.0, f64::max)
}

/// Select the worker for `definition` from the fleet snapshot.
///
/// Candidates are the `running` workers that pass every filter; the one
/// with the highest utilization score wins, ties broken by worker id in
/// lexicographic order so the algorithm is deterministic.
pub fn select<'a>(workers: &'a [Worker], definition: &LabletDefinition) -> Option<&'a Worker> {
    let required = Capacity::required_for(definition);
    workers
        .iter()
        .filter(|w| w.status == WorkerState::Running)
        .filter(|w| filter(w, definition) == FilterVerdict::Eligible)
        .map(|w| (w, score(w, &required)))
        .max_by(|(a, sa), (b, sb)| {
            sa.partial_cmp(sb)
                .unwrap_or(std::cmp::Ordering::Equal)
                // Reverse the id comparison: max_by keeps the later of equal
                // elements, so the smaller id must compare greater.
                .then_with(|| b.id.to_string().cmp(&a.id.to_string()))
        })
        .map(|(w, _)| w)
}

/// Pick the template for a scale-up request: matching license kind, then
/// the smallest whose declared capacity covers the definition, ties broken
/// by name.
pub fn best_template<'a>(
    templates: &'a [WorkerTemplate],
    definition: &LabletDefinition,
) -> Option<&'a WorkerTemplate> {
    templates
        .iter()
        .filter(|t| t.satisfies(definition))
        .min_by(|a, b| {
            let size = |t: &WorkerTemplate| {
                (
                    t.capacity.cpu_cores,
                    t.capacity.memory_gib,
                    t.capacity.storage_gib,
                    t.capacity.max_nodes,
                )
            };
            size(a).cmp(&size(b)).then_with(|| a.name.cmp(&b.name))
        })
}

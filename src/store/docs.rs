//! Document store: sled-backed collections for definitions, worker
//! templates, and the append-only event audit log.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sled::Db;

use crate::domain::definition::LabletDefinition;
use crate::domain::event::EventEnvelope;
use crate::domain::worker::WorkerTemplate;
use crate::error::{ControlError, ControlResult};

const TREE_DEFINITIONS: &str = "definitions";
const TREE_TEMPLATES: &str = "worker_templates";
const TREE_EVENTS: &str = "events";

/// Query filter for definition listings
#[derive(Debug, Default, Clone)]
pub struct DefinitionFilter {
    pub name: Option<String>,
    pub owner: Option<String>,
    pub include_deprecated: bool,
}

/// Document store over sled with a bounded-TTL definition cache.
///
/// The cache serves definition lookups while sled is briefly unreadable;
/// entries older than the TTL are never served.
pub struct DocStore {
    db: Db,
    definitions: sled::Tree,
    templates: sled::Tree,
    events: sled::Tree,
    def_cache: DashMap<(String, String), (LabletDefinition, Instant)>,
    cache_ttl: Duration,
}

impl DocStore {
    /// Open (or create) the store at `path`.
    pub fn open<P: AsRef<std::path::Path>>(path: P, cache_ttl: Duration) -> ControlResult<Self> {
        let db = sled::open(path)?;
        let definitions = db.open_tree(TREE_DEFINITIONS)?;
        let templates = db.open_tree(TREE_TEMPLATES)?;
        let events = db.open_tree(TREE_EVENTS)?;
        Ok(Self {
            db,
            definitions,
            templates,
            events,
            def_cache: DashMap::new(),
            cache_ttl,
        })
    }

    fn definition_key(name: &str, version: &str) -> String {
        format!("{}:{}", name, version)
    }

    /// Persist a definition. A (name, version) pair is written at most once.
    pub fn put_definition(&self, definition: &LabletDefinition) -> ControlResult<()> {
        let key = Self::definition_key(&definition.name, &definition.version);
        let value = serde_json::to_vec(definition)?;
        let previous = self
            .definitions
            .compare_and_swap(key.as_bytes(), None as Option<&[u8]>, Some(value))?;
        if previous.is_err() {
            return Err(ControlError::Conflict {
                key: format!("definitions/{}", key),
            });
        }
        self.def_cache.insert(
            (definition.name.clone(), definition.version.clone()),
            (definition.clone(), Instant::now()),
        );
        Ok(())
    }

    /// Overwrite a definition record in place (sync and deprecation only;
    /// the specification fields themselves are immutable per version).
    pub fn update_definition(&self, definition: &LabletDefinition) -> ControlResult<()> {
        let key = Self::definition_key(&definition.name, &definition.version);
        let value = serde_json::to_vec(definition)?;
        self.definitions.insert(key.as_bytes(), value)?;
        self.def_cache.insert(
            (definition.name.clone(), definition.version.clone()),
            (definition.clone(), Instant::now()),
        );
        Ok(())
    }

    /// Fetch a definition, falling back to a fresh cache entry when the
    /// store read fails.
    pub fn get_definition(
        &self,
        name: &str,
        version: &str,
    ) -> ControlResult<Option<LabletDefinition>> {
        let key = Self::definition_key(name, version);
        match self.definitions.get(key.as_bytes()) {
            Ok(Some(value)) => {
                let definition: LabletDefinition = serde_json::from_slice(&value)?;
                self.def_cache.insert(
                    (name.to_string(), version.to_string()),
                    (definition.clone(), Instant::now()),
                );
                Ok(Some(definition))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                if let Some(entry) = self.def_cache.get(&(name.to_string(), version.to_string())) {
                    let (definition, cached_at) = entry.value();
                    if cached_at.elapsed() <= self.cache_ttl {
                        return Ok(Some(definition.clone()));
                    }
                }
                Err(ControlError::Storage(err.to_string()))
            }
        }
    }

    /// List definitions matching `filter`.
    pub fn list_definitions(&self, filter: &DefinitionFilter) -> ControlResult<Vec<LabletDefinition>> {
        let mut out = Vec::new();
        for item in self.definitions.iter() {
            let (_, value) = item?;
            let definition: LabletDefinition = serde_json::from_slice(&value)?;
            if let Some(name) = &filter.name {
                if definition.name != *name {
                    continue;
                }
            }
            if let Some(owner) = &filter.owner {
                if definition.owner != *owner {
                    continue;
                }
            }
            if definition.deprecated && !filter.include_deprecated {
                continue;
            }
            out.push(definition);
        }
        out.sort_by(|a, b| (&a.name, &a.version).cmp(&(&b.name, &b.version)));
        Ok(out)
    }

    /// Whether any non-deprecated version of `name` exists.
    pub fn definition_name_exists(&self, name: &str) -> ControlResult<bool> {
        let filter = DefinitionFilter {
            name: Some(name.to_string()),
            ..Default::default()
        };
        Ok(!self.list_definitions(&filter)?.is_empty())
    }

    /// Seed or replace a worker template.
    pub fn put_template(&self, template: &WorkerTemplate) -> ControlResult<()> {
        let value = serde_json::to_vec(template)?;
        self.templates.insert(template.name.as_bytes(), value)?;
        Ok(())
    }

    /// Fetch one template by name.
    pub fn get_template(&self, name: &str) -> ControlResult<Option<WorkerTemplate>> {
        match self.templates.get(name.as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// All templates, ordered by name.
    pub fn list_templates(&self) -> ControlResult<Vec<WorkerTemplate>> {
        let mut out = Vec::new();
        for item in self.templates.iter() {
            let (_, value) = item?;
            out.push(serde_json::from_slice::<WorkerTemplate>(&value)?);
        }
        Ok(out)
    }

    /// Append an event to the audit log, keyed by occurrence time and id so
    /// iteration is time-ordered.
    pub fn append_event(&self, event: &EventEnvelope) -> ControlResult<()> {
        let key = format!(
            "{:020}:{}",
            event.occurred_at.timestamp_nanos_opt().unwrap_or_default(),
            event.id
        );
        let value = serde_json::to_vec(event)?;
        self.events.insert(key.as_bytes(), value)?;
        Ok(())
    }

    /// Events within a time range, optionally restricted to one aggregate.
    pub fn query_events(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        aggregate_id: Option<&str>,
    ) -> ControlResult<Vec<EventEnvelope>> {
        let lo = format!("{:020}", since.timestamp_nanos_opt().unwrap_or_default());
        let hi = format!("{:020}", until.timestamp_nanos_opt().unwrap_or(i64::MAX));
        let mut out = Vec::new();
        for item in self.events.range(lo.as_bytes()..hi.as_bytes()) {
            let (_, value) = item?;
            let event: EventEnvelope = serde_json::from_slice(&value)?;
            if let Some(wanted) = aggregate_id {
                if event.aggregate_id().as_deref() != Some(wanted) {
                    continue;
                }
            }
            out.push(event);
        }
        Ok(out)
    }

    /// Flush sled to disk.
    pub fn flush(&self) -> ControlResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::definition::{ArtifactRef, DefinitionId, LicenseKind, ResourceRequirements};
    use crate::domain::event::{Component, EventKind};
    use std::collections::BTreeSet;

    fn store() -> (DocStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = DocStore::open(dir.path().join("docs"), Duration::from_secs(300)).unwrap();
        (store, dir)
    }

    fn definition(name: &str, version: &str) -> LabletDefinition {
        LabletDefinition {
            id: DefinitionId::new(),
            name: name.to_string(),
            version: version.to_string(),
            artifact: ArtifactRef {
                uri: format!("s3://labs/{}-{}.json", name, version),
                content_hash: "sha256:0".to_string(),
            },
            artifact_content: None,
            resources: ResourceRequirements {
                cpu_cores: 2,
                memory_gib: 4,
                storage_gib: 10,
                nested_virt: false,
                image_family: None,
            },
            license_affinity: BTreeSet::from([LicenseKind::Enterprise]),
            node_count: 1,
            port_template: Vec::new(),
            grading_ruleset: None,
            max_session_secs: 3600,
            warm_pool_depth: 0,
            owner: "alice".to_string(),
            created_at: Utc::now(),
            deprecated: false,
        }
    }

    #[test]
    fn definitions_are_create_once_per_version() {
        let (store, _dir) = store();
        let def = definition("routing", "1.0.0");
        store.put_definition(&def).unwrap();
        assert!(store.put_definition(&def).is_err());
        // a new version is a new record
        store.put_definition(&definition("routing", "1.1.0")).unwrap();
        assert_eq!(
            store
                .list_definitions(&DefinitionFilter {
                    name: Some("routing".to_string()),
                    ..Default::default()
                })
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn deprecated_definitions_are_hidden_by_default() {
        let (store, _dir) = store();
        let mut def = definition("switching", "1.0.0");
        store.put_definition(&def).unwrap();
        def.deprecated = true;
        store.update_definition(&def).unwrap();
        assert!(store
            .list_definitions(&DefinitionFilter::default())
            .unwrap()
            .is_empty());
        assert_eq!(
            store
                .list_definitions(&DefinitionFilter {
                    include_deprecated: true,
                    ..Default::default()
                })
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn events_iterate_in_time_order() {
        let (store, _dir) = store();
        for i in 0..3 {
            let event = EventEnvelope::new(
                EventKind::Heartbeat,
                Component::System,
                serde_json::json!({"seq": i}),
            );
            store.append_event(&event).unwrap();
        }
        let events = store
            .query_events(Utc::now() - chrono::Duration::hours(1), Utc::now() + chrono::Duration::hours(1), None)
            .unwrap();
        assert_eq!(events.len(), 3);
        let seqs: Vec<i64> = events
            .iter()
            .map(|e| e.data["seq"].as_i64().unwrap())
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }
}

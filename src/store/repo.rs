//! Key schema and typed access to entities in the coordination store.
//!
//! Keys are hierarchical: `/instances/{id}`, `/workers/{id}`,
//! `/ports/{worker_id}/{port}`, `/leader/{role}`. Values are the JSON
//! serialization of the domain entities; every read returns the revision a
//! subsequent CAS must present.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::domain::instance::{InstanceId, LabletInstance};
use crate::domain::worker::{Worker, WorkerId};
use crate::error::{ControlError, ControlResult};
use crate::store::coord::{CoordStore, Revision, VersionedValue};

pub const INSTANCE_PREFIX: &str = "/instances/";
pub const WORKER_PREFIX: &str = "/workers/";
pub const PORT_PREFIX: &str = "/ports/";
pub const LEADER_PREFIX: &str = "/leader/";

pub fn instance_key(id: InstanceId) -> String {
    format!("{}{}", INSTANCE_PREFIX, id)
}

pub fn worker_key(id: WorkerId) -> String {
    format!("{}{}", WORKER_PREFIX, id)
}

pub fn port_key(worker_id: WorkerId, port: u16) -> String {
    format!("{}{}/{}", PORT_PREFIX, worker_id, port)
}

pub fn leader_key(role: &str) -> String {
    format!("{}{}", LEADER_PREFIX, role)
}

fn decode<T: DeserializeOwned>(kind: &'static str, vv: &VersionedValue) -> ControlResult<T> {
    serde_json::from_slice(&vv.value)
        .map_err(|e| ControlError::ContractViolation(format!("corrupt {} record: {}", kind, e)))
}

fn encode<T: Serialize>(value: &T) -> ControlResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| ControlError::Internal(e.to_string()))
}

/// Typed repository over the coordination store.
#[derive(Clone)]
pub struct Repo {
    store: Arc<dyn CoordStore>,
}

impl Repo {
    pub fn new(store: Arc<dyn CoordStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CoordStore> {
        &self.store
    }

    pub async fn get_instance(
        &self,
        id: InstanceId,
    ) -> ControlResult<Option<(LabletInstance, Revision)>> {
        match self.store.get(&instance_key(id)).await? {
            Some(vv) => Ok(Some((decode("instance", &vv)?, vv.revision))),
            None => Ok(None),
        }
    }

    /// Create a new instance record; fails if it already exists.
    pub async fn create_instance(&self, instance: &LabletInstance) -> ControlResult<Revision> {
        self.store
            .cas(&instance_key(instance.id), None, encode(instance)?)
            .await
    }

    /// CAS-update an instance from the revision it was read at.
    pub async fn cas_instance(
        &self,
        instance: &LabletInstance,
        expected: Revision,
    ) -> ControlResult<Revision> {
        self.store
            .cas(&instance_key(instance.id), Some(expected), encode(instance)?)
            .await
    }

    pub async fn delete_instance(
        &self,
        id: InstanceId,
        expected: Option<Revision>,
    ) -> ControlResult<()> {
        self.store.delete(&instance_key(id), expected).await
    }

    /// Snapshot all instances with the revision the snapshot is valid at.
    pub async fn list_instances(
        &self,
    ) -> ControlResult<(Vec<(LabletInstance, Revision)>, Revision)> {
        let (items, head) = self.store.list(INSTANCE_PREFIX).await?;
        let mut out = Vec::with_capacity(items.len());
        for (_, vv) in items {
            out.push((decode::<LabletInstance>("instance", &vv)?, vv.revision));
        }
        Ok((out, head))
    }

    pub async fn get_worker(&self, id: WorkerId) -> ControlResult<Option<(Worker, Revision)>> {
        match self.store.get(&worker_key(id)).await? {
            Some(vv) => Ok(Some((decode("worker", &vv)?, vv.revision))),
            None => Ok(None),
        }
    }

    pub async fn create_worker(&self, worker: &Worker) -> ControlResult<Revision> {
        self.store
            .cas(&worker_key(worker.id), None, encode(worker)?)
            .await
    }

    pub async fn cas_worker(&self, worker: &Worker, expected: Revision) -> ControlResult<Revision> {
        self.store
            .cas(&worker_key(worker.id), Some(expected), encode(worker)?)
            .await
    }

    pub async fn delete_worker(
        &self,
        id: WorkerId,
        expected: Option<Revision>,
    ) -> ControlResult<()> {
        self.store.delete(&worker_key(id), expected).await
    }

    pub async fn list_workers(&self) -> ControlResult<(Vec<(Worker, Revision)>, Revision)> {
        let (items, head) = self.store.list(WORKER_PREFIX).await?;
        let mut out = Vec::with_capacity(items.len());
        for (_, vv) in items {
            out.push((decode::<Worker>("worker", &vv)?, vv.revision));
        }
        Ok((out, head))
    }

    /// Mirror port-allocation marker keys for queryability. The worker
    /// record is authoritative; markers are written after its CAS commits.
    pub async fn put_port_markers(
        &self,
        worker_id: WorkerId,
        instance_id: InstanceId,
        ports: &[u16],
    ) -> ControlResult<()> {
        for port in ports {
            let key = port_key(worker_id, *port);
            let value = encode(&instance_id)?;
            match self.store.get(&key).await? {
                Some(vv) => self.store.cas(&key, Some(vv.revision), value).await?,
                None => self.store.cas(&key, None, value).await?,
            };
        }
        Ok(())
    }

    pub async fn delete_port_markers(
        &self,
        worker_id: WorkerId,
        ports: &[u16],
    ) -> ControlResult<()> {
        for port in ports {
            match self.store.delete(&port_key(worker_id, *port), None).await {
                Ok(()) | Err(ControlError::NotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

//! Lease-based leader election on the coordination store.
//!
//! Each replica competes by attempting a create-only `put_with_lease` on
//! `/leader/{role}`. The winner heartbeats its lease; standbys watch the
//! key and campaign again when it disappears. Expected failover is bounded
//! by lease TTL plus watch propagation.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;

use crate::error::{ControlError, ControlResult};
use crate::store::coord::{CoordStore, LeaseId, WatchEventKind};
use crate::store::repo::leader_key;

/// One replica's participation in the election for `role`.
pub struct LeaderElection {
    store: Arc<dyn CoordStore>,
    role: String,
    node_id: String,
    lease_ttl: Duration,
    state_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<bool>,
}

impl LeaderElection {
    pub fn new(
        store: Arc<dyn CoordStore>,
        role: impl Into<String>,
        node_id: impl Into<String>,
        lease_ttl: Duration,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(false);
        Self {
            store,
            role: role.into(),
            node_id: node_id.into(),
            lease_ttl,
            state_tx,
            state_rx,
        }
    }

    /// Whether this replica currently holds the leader key.
    pub fn is_leader(&self) -> bool {
        *self.state_rx.borrow()
    }

    /// Receiver that flips on promotion and demotion.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state_rx.clone()
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Campaign forever: win the key, hold it while the lease renews, demote
    /// on lease loss, and wait for the key to vacate before campaigning
    /// again. Runs until the owning task is cancelled; the lease then
    /// expires on its own and a standby takes over.
    pub async fn run(&self) {
        loop {
            match self.campaign().await {
                Ok(lease) => {
                    tracing::info!(role = %self.role, node = %self.node_id, "acquired leadership");
                    let _ = self.state_tx.send(true);
                    self.hold(lease).await;
                    let _ = self.state_tx.send(false);
                    tracing::warn!(role = %self.role, node = %self.node_id, "lost leadership");
                }
                Err(err) if err.is_conflict() => {
                    self.wait_for_vacancy().await;
                }
                Err(err) => {
                    tracing::warn!(role = %self.role, error = %err, "campaign failed; backing off");
                    // Jitter keeps replicas from campaigning in lockstep
                    let backoff =
                        Duration::from_millis(1000 + rand::thread_rng().gen_range(0..500));
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Try to become leader once.
    async fn campaign(&self) -> ControlResult<LeaseId> {
        let lease = self.store.grant_lease(self.lease_ttl).await?;
        match self
            .store
            .put_with_lease(
                &leader_key(&self.role),
                self.node_id.as_bytes().to_vec(),
                lease,
            )
            .await
        {
            Ok(_) => Ok(lease),
            Err(err) => {
                let _ = self.store.revoke_lease(lease).await;
                Err(err)
            }
        }
    }

    /// Heartbeat the lease until it is lost.
    async fn hold(&self, lease: LeaseId) {
        let period = self.lease_ttl / 3;
        let mut tick = tokio::time::interval(period.max(Duration::from_millis(100)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tick.tick().await;
            if let Err(err) = self.store.keep_alive(lease).await {
                tracing::warn!(role = %self.role, error = %err, "lease heartbeat failed");
                return;
            }
        }
    }

    /// Block until the leader key is absent.
    async fn wait_for_vacancy(&self) {
        let key = leader_key(&self.role);
        loop {
            let stream = match self.store.watch(&key, 0).await {
                Ok(stream) => stream,
                Err(_) => {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
            };
            // Check after registering the watch so a deletion between the
            // two cannot be missed.
            match self.store.get(&key).await {
                Ok(None) => return,
                Ok(Some(_)) => {}
                Err(_) => {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
            }
            let mut stream = stream;
            loop {
                match stream.recv().await {
                    Some(event) if event.kind == WatchEventKind::Delete => return,
                    Some(_) => {}
                    None => break,
                }
            }
        }
    }

    /// Relinquish leadership explicitly (shutdown path).
    pub async fn resign(&self) -> ControlResult<()> {
        if !self.is_leader() {
            return Ok(());
        }
        let _ = self.state_tx.send(false);
        match self.store.delete(&leader_key(&self.role), None).await {
            Ok(()) | Err(ControlError::NotFound { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

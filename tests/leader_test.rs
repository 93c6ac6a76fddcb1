//! Leader failover: a crashed leader's lease expires within the TTL and a
//! standby takes over from a fresh observation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use labfleet::scheduler::LeaderElection;
use labfleet::store::coord::{CoordStore, MemCoordStore};
use labfleet::store::repo::leader_key;

#[tokio::test(start_paused = true)]
async fn failover_completes_within_lease_ttl() {
    let store: Arc<dyn CoordStore> = Arc::new(MemCoordStore::new());
    let ttl = Duration::from_secs(15);

    let a = Arc::new(LeaderElection::new(Arc::clone(&store), "scheduler", "replica-a", ttl));
    let b = Arc::new(LeaderElection::new(Arc::clone(&store), "scheduler", "replica-b", ttl));

    let a_task = {
        let a = Arc::clone(&a);
        tokio::spawn(async move { a.run().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(a.is_leader());
    let held = store.get(&leader_key("scheduler")).await.unwrap().unwrap();
    assert_eq!(held.value, b"replica-a");

    let _b_task = {
        let b = Arc::clone(&b);
        tokio::spawn(async move { b.run().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!b.is_leader());

    // A crashes: heartbeats stop, the lease runs out
    a_task.abort();
    let mut promoted = b.subscribe();
    let waited = tokio::time::Instant::now();
    tokio::time::timeout(Duration::from_secs(20), async {
        while !*promoted.borrow() {
            promoted.changed().await.unwrap();
        }
    })
    .await
    .expect("standby was not promoted");

    // Bounded by lease TTL plus watch propagation
    assert!(waited.elapsed() <= Duration::from_secs(16));
    assert!(b.is_leader());
    let held = store.get(&leader_key("scheduler")).await.unwrap().unwrap();
    assert_eq!(held.value, b"replica-b");
}

#[tokio::test]
async fn resign_vacates_the_key_for_the_standby() {
    let store: Arc<dyn CoordStore> = Arc::new(MemCoordStore::new());
    let ttl = Duration::from_secs(15);
    let a = Arc::new(LeaderElection::new(Arc::clone(&store), "controller", "replica-a", ttl));
    {
        let a = Arc::clone(&a);
        tokio::spawn(async move { a.run().await });
    }
    tokio::time::timeout(Duration::from_secs(2), async {
        let mut rx = a.subscribe();
        while !*rx.borrow() {
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("first replica never became leader");

    a.resign().await.unwrap();
    assert!(store.get(&leader_key("controller")).await.unwrap().is_none());
}

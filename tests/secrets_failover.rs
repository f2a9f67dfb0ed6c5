//! Leader loss during secrets sync.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use provisioner::secrets::{
    InMemoryLeases, InMemorySecretStore, LocalLeaderConnector, Ref, Role, SecretStore,
    SecretsCache, SecretsSync, SyncSettings,
};

fn settings() -> SyncSettings {
    SyncSettings {
        lease_name: "secrets-sync".to_string(),
        lease_ttl: Duration::from_secs(30),
        leader_interval: Duration::from_secs(300),
        follower_interval: Duration::from_secs(60),
    }
}

#[tokio::test(start_paused = true)]
async fn test_follower_takes_over_after_leader_dies() {
    let store = Arc::new(InMemorySecretStore::new());
    store.store(&Ref::global("token"), b"abc").await.unwrap();
    let leases = Arc::new(InMemoryLeases::new());
    let connector = Arc::new(LocalLeaderConnector::new());
    let start = Instant::now();

    let cache_a = Arc::new(SecretsCache::new("inmem", store.clone(), Duration::from_secs(5)));
    connector.register("http://a", cache_a.clone());
    let a = Arc::new(SecretsSync::new(
        cache_a,
        leases.clone(),
        connector.clone(),
        "http://a",
        settings(),
    ));
    let a_task = tokio::spawn({
        let a = a.clone();
        async move { a.run(CancellationToken::new()).await }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(a.role(), Role::Leader);

    let cache_b = Arc::new(SecretsCache::new("inmem", store.clone(), Duration::from_secs(5)));
    let b = Arc::new(SecretsSync::new(
        cache_b.clone(),
        leases,
        connector.clone(),
        "http://b",
        settings(),
    ));
    let cancel_b = CancellationToken::new();
    let b_task = tokio::spawn({
        let b = b.clone();
        let cancel = cancel_b.clone();
        async move { b.run(cancel).await }
    });

    let mut leader_at = None;
    for second in 2..=180u64 {
        tokio::time::sleep_until(start + Duration::from_secs(second)).await;
        if second == 85 {
            // Instance A dies without releasing its lease.
            a_task.abort();
            connector.unregister("http://a");
        }
        if cache_b.is_loaded() {
            assert_eq!(cache_b.get(&Ref::global("token")).await.unwrap(), b"abc");
        }
        if leader_at.is_none() && b.role() == Role::Leader {
            leader_at = Some(start.elapsed());
        }
    }

    assert!(cache_b.is_loaded());
    let leader_at = leader_at.expect("instance b never became leader");
    assert!(leader_at > Duration::from_secs(85));
    assert!(leader_at <= Duration::from_secs(120), "took over at {:?}", leader_at);
    assert_eq!(store.loads(), 1);

    cancel_b.cancel();
    b_task.await.unwrap();
}

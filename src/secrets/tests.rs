use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::*;

fn cache_over(store: Arc<InMemorySecretStore>) -> Arc<SecretsCache> {
    Arc::new(SecretsCache::new("default", store, Duration::from_secs(5)))
}

fn settings() -> SyncSettings {
    SyncSettings {
        lease_name: "secrets-sync".to_string(),
        lease_ttl: Duration::from_secs(30),
        leader_interval: Duration::from_secs(300),
        follower_interval: Duration::from_secs(60),
    }
}

#[test]
fn test_ref_parse_and_display() {
    let r: Ref = "svc.api_key".parse().unwrap();
    assert_eq!(r, Ref::module("svc", "api_key"));
    assert_eq!(r.to_string(), "svc.api_key");

    let global: Ref = "token".parse().unwrap();
    assert_eq!(global.module, None);

    for bad in ["", ".x", "svc.", "a.b.c", "has space"] {
        assert!(bad.parse::<Ref>().is_err(), "{bad}");
    }
    assert_eq!(serde_json::to_value(&r).unwrap(), serde_json::json!("svc.api_key"));
}

#[tokio::test]
async fn test_write_is_visible_immediately() {
    let store = Arc::new(InMemorySecretStore::new());
    let cache = cache_over(store.clone());
    cache.replace_all(vec![]);
    let mut updates = cache.subscribe();
    let key = Ref::module("svc", "password");

    cache.set(&key, b"hunter2").await.unwrap();

    assert_eq!(cache.get(&key).await.unwrap(), b"hunter2");
    assert_eq!(store.load(&key).await.unwrap(), b"hunter2");
    assert_eq!(
        updates.recv().await.unwrap(),
        SecretUpdate {
            reference: key.clone(),
            value: Some(b"hunter2".to_vec()),
        }
    );

    cache.unset(&key).await.unwrap();
    assert!(matches!(cache.get(&key).await, Err(SecretsError::NotFound(_))));
    assert!(updates.recv().await.unwrap().value.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_read_waits_for_first_sync() {
    let store = Arc::new(InMemorySecretStore::new());
    let key = Ref::global("token");
    store.store(&key, b"abc").await.unwrap();
    let cache = cache_over(store);

    let reader = tokio::spawn({
        let cache = cache.clone();
        let key = key.clone();
        async move { cache.get(&key).await }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    cache.sync_from_upstream().await.unwrap();

    assert_eq!(reader.await.unwrap().unwrap(), b"abc");
}

#[tokio::test(start_paused = true)]
async fn test_read_gives_up_after_load_timeout() {
    let cache = cache_over(Arc::new(InMemorySecretStore::new()));
    let start = tokio::time::Instant::now();

    let result = cache.get(&Ref::global("token")).await;

    assert!(matches!(result, Err(SecretsError::NotFound(_))));
    assert!(start.elapsed() >= Duration::from_secs(5));
}

#[tokio::test]
async fn test_upstream_sync_fetches_only_changed() {
    let store = Arc::new(InMemorySecretStore::new());
    let a = Ref::module("svc", "a");
    let b = Ref::module("svc", "b");
    store.store(&a, b"1").await.unwrap();
    store.store(&b, b"2").await.unwrap();
    let cache = cache_over(store.clone());

    assert_eq!(cache.sync_from_upstream().await.unwrap(), 2);
    assert_eq!(cache.sync_from_upstream().await.unwrap(), 0);
    assert_eq!(store.loads(), 2);

    tokio::time::sleep(Duration::from_millis(5)).await;
    store.store(&a, b"changed").await.unwrap();
    store.delete(&b).await.unwrap();

    assert_eq!(cache.sync_from_upstream().await.unwrap(), 1);
    assert_eq!(cache.get(&a).await.unwrap(), b"changed");
    assert!(cache.get(&b).await.is_err());
}

#[tokio::test]
async fn test_list_filters_by_module() {
    let cache = cache_over(Arc::new(InMemorySecretStore::new()));
    cache.replace_all(vec![
        (Ref::module("svc", "a"), b"1".to_vec()),
        (Ref::module("other", "b"), b"2".to_vec()),
        (Ref::global("c"), b"3".to_vec()),
    ]);

    let names: Vec<String> = cache
        .list(Some("svc"))
        .into_iter()
        .map(|(r, _)| r.to_string())
        .collect();

    assert_eq!(names, vec!["c", "svc.a"]);
}

#[tokio::test(start_paused = true)]
async fn test_lease_expiry_hands_over() {
    let leases = InMemoryLeases::new();
    let ttl = Duration::from_secs(30);

    assert!(leases.try_acquire("l", "a", ttl).await.unwrap());
    assert!(!leases.try_acquire("l", "b", ttl).await.unwrap());
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(leases.try_acquire("l", "a", ttl).await.unwrap());
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(!leases.try_acquire("l", "b", ttl).await.unwrap());
    assert_eq!(leases.holder("l").await.unwrap().as_deref(), Some("a"));

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(leases.holder("l").await.unwrap(), None);
    assert!(leases.try_acquire("l", "b", ttl).await.unwrap());

    leases.release("l", "a").await.unwrap();
    assert_eq!(leases.holder("l").await.unwrap().as_deref(), Some("b"));
}

#[tokio::test]
async fn test_follower_copies_leader() {
    let store = Arc::new(InMemorySecretStore::new());
    store.store(&Ref::global("token"), b"abc").await.unwrap();
    let leases = Arc::new(InMemoryLeases::new());
    let connector = Arc::new(LocalLeaderConnector::new());

    let leader_cache = cache_over(store.clone());
    connector.register("http://a", leader_cache.clone());
    let leader = SecretsSync::new(leader_cache, leases.clone(), connector.clone(), "http://a", settings());
    leases
        .try_acquire("secrets-sync", "http://a", Duration::from_secs(30))
        .await
        .unwrap();

    let follower_cache = cache_over(store.clone());
    let follower = SecretsSync::new(follower_cache.clone(), leases, connector, "http://b", settings());

    assert!(matches!(
        follower.sync_as_follower().await,
        Err(SecretsError::NotLoaded)
    ));
    leader.sync_as_leader().await.unwrap();
    assert_eq!(follower.sync_as_follower().await.unwrap(), 1);
    assert_eq!(follower_cache.get(&Ref::global("token")).await.unwrap(), b"abc");
    assert_eq!(store.loads(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_single_instance_becomes_leader() {
    let store = Arc::new(InMemorySecretStore::new());
    store.store(&Ref::global("token"), b"abc").await.unwrap();
    let cache = cache_over(store);
    let sync = Arc::new(SecretsSync::new(
        cache.clone(),
        Arc::new(InMemoryLeases::new()),
        Arc::new(LocalLeaderConnector::new()),
        "http://a",
        settings(),
    ));
    let cancel = CancellationToken::new();

    let handle = tokio::spawn({
        let sync = sync.clone();
        let cancel = cancel.clone();
        async move { sync.run(cancel).await }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(sync.role(), Role::Leader);
    assert!(cache.is_loaded());
    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_follower_write_survives_next_follower_sync() {
    let store = Arc::new(InMemorySecretStore::new());
    let token = Ref::global("token");
    store.store(&token, b"old").await.unwrap();
    let leases = Arc::new(InMemoryLeases::new());
    let connector = Arc::new(LocalLeaderConnector::new());

    let leader_cache = cache_over(store.clone());
    connector.register("http://a", leader_cache.clone());
    let leader = SecretsSync::new(leader_cache.clone(), leases.clone(), connector.clone(), "http://a", settings());
    leases
        .try_acquire("secrets-sync", "http://a", Duration::from_secs(30))
        .await
        .unwrap();
    leader.sync_as_leader().await.unwrap();

    let follower_cache = cache_over(store.clone());
    let follower = SecretsSync::new(follower_cache.clone(), leases, connector, "http://b", settings());
    follower.sync_as_follower().await.unwrap();

    follower.set(&token, b"new").await.unwrap();
    assert_eq!(follower_cache.get(&token).await.unwrap(), b"new");
    assert_eq!(leader_cache.get(&token).await.unwrap(), b"new");

    follower.sync_as_follower().await.unwrap();
    assert_eq!(follower_cache.get(&token).await.unwrap(), b"new");
    assert_eq!(store.load(&token).await.unwrap(), b"new");

    follower.unset(&token).await.unwrap();
    follower.sync_as_follower().await.unwrap();
    assert!(matches!(follower_cache.get(&token).await, Err(SecretsError::NotFound(_))));
    assert!(leader_cache.get(&token).await.is_err());
}

#[tokio::test]
async fn test_leader_write_goes_straight_upstream() {
    let store = Arc::new(InMemorySecretStore::new());
    let leases = Arc::new(InMemoryLeases::new());
    let cache = cache_over(store.clone());
    let sync = SecretsSync::new(cache.clone(), leases.clone(), Arc::new(LocalLeaderConnector::new()), "http://a", settings());
    leases
        .try_acquire("secrets-sync", "http://a", Duration::from_secs(30))
        .await
        .unwrap();
    cache.replace_all(vec![]);

    sync.set(&Ref::module("svc", "key"), b"v").await.unwrap();

    assert_eq!(store.load(&Ref::module("svc", "key")).await.unwrap(), b"v");
    assert_eq!(cache.get(&Ref::module("svc", "key")).await.unwrap(), b"v");
}

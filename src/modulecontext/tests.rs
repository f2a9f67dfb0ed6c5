use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::projectconfig::{Accessor, ProjectConfig};
use crate::schema::{DatabaseConnections, DatabaseRuntime, Module};
use crate::schemaevents::SchemaEventSource;
use crate::secrets::{InMemorySecretStore, Ref, SecretStore, SecretsCache};
use crate::test_utils::database_decl;

fn with_dsn(module: Module, name: &str, dsn: &str) -> Module {
    let mut module = module;
    module.runtime.databases.insert(
        name.to_string(),
        DatabaseRuntime {
            connections: Some(DatabaseConnections {
                read: dsn.to_string(),
                write: dsn.to_string(),
            }),
            migration_digest: None,
        },
    );
    module
}

fn svc() -> Module {
    let module = Module::new("svc").with_decl(database_decl("sales", DatabaseEngine::Postgres, vec![]));
    with_dsn(module, "sales", "postgres://localhost:5432/svc_sales")
}

async fn loaded_cache(entries: &[(Ref, &[u8])]) -> Arc<SecretsCache> {
    let store = Arc::new(InMemorySecretStore::new());
    for (reference, value) in entries {
        store.store(reference, value).await.unwrap();
    }
    let cache = Arc::new(SecretsCache::new("inmem", store, Duration::from_secs(5)));
    cache.sync_from_upstream().await.unwrap();
    cache
}

#[test]
fn test_get_database_checks_name_and_engine() {
    let context = ModuleContext::builder("svc")
        .with_database("sales", DatabaseEngine::Postgres, "postgres://db/svc_sales")
        .build();

    assert_eq!(
        context.get_database("sales", DatabaseEngine::Postgres).unwrap(),
        "postgres://db/svc_sales"
    );
    assert!(matches!(
        context.get_database("ledger", DatabaseEngine::Postgres),
        Err(ModuleContextError::DatabaseNotFound(name)) if name == "ledger"
    ));
    assert!(matches!(
        context.get_database("sales", DatabaseEngine::Mysql),
        Err(ModuleContextError::DatabaseKindMismatch {
            requested: DatabaseEngine::Mysql,
            actual: DatabaseEngine::Postgres,
            ..
        })
    ));
}

#[test]
fn test_testing_context_refuses_non_test_database() {
    let context = ModuleContext::builder("svc")
        .with_database("sales", DatabaseEngine::Postgres, "postgres://prod/svc_sales")
        .with_test_database("scratch", DatabaseEngine::Mysql, "root@tcp(localhost:3306)/scratch")
        .testing(true)
        .build();

    assert!(matches!(
        context.get_database("sales", DatabaseEngine::Postgres),
        Err(ModuleContextError::NotTestDatabase(_))
    ));
    assert!(context.get_database("scratch", DatabaseEngine::Mysql).is_ok());
}

#[test]
fn test_config_lookup() {
    let context = ModuleContext::builder("svc")
        .with_config("limits", br#"{"max": 3}"#.to_vec())
        .build();

    #[derive(serde::Deserialize)]
    struct Limits {
        max: u32,
    }
    let limits: Limits = context.config_json("limits").unwrap();
    assert_eq!(limits.max, 3);
    assert!(matches!(
        context.get_config("missing"),
        Err(ModuleContextError::ConfigNotFound(_))
    ));
    assert!(matches!(
        context.config_json::<Limits>("missing"),
        Err(ModuleContextError::ConfigNotFound(_))
    ));
}

#[tokio::test]
async fn test_build_merges_project_config_secrets_and_runtime() {
    let mut project = ProjectConfig::default();
    project.set_config(None, "region", &Accessor::inline(b"eu-west"));
    project.set_config(Some("svc"), "region", &Accessor::inline(b"us-east"));
    project.set_config(Some("other"), "ignored", &Accessor::inline(b"x"));
    project.set_secret(Some("svc"), "password", &Ref::module("svc", "password"));

    let cache = loaded_cache(&[(Ref::module("svc", "password"), b"hunter2".as_slice())]).await;
    let provider = ModuleContextProvider::new(project).with_secrets(cache);

    let context = provider.build(&svc()).await.unwrap();
    assert_eq!(context.get_config("region").unwrap(), b"us-east");
    assert!(context.get_config("ignored").is_err());
    assert_eq!(context.get_secret("password").unwrap(), b"hunter2");
    assert_eq!(
        context.get_database("sales", DatabaseEngine::Postgres).unwrap(),
        "postgres://localhost:5432/svc_sales"
    );
}

#[tokio::test]
async fn test_unprovisioned_database_is_absent() {
    let provider = ModuleContextProvider::new(ProjectConfig::default());
    let module = Module::new("svc").with_decl(database_decl("sales", DatabaseEngine::Postgres, vec![]));

    let context = provider.build(&module).await.unwrap();
    assert!(context.databases().is_empty());
}

#[tokio::test]
async fn test_secret_without_cache_is_not_found() {
    let mut project = ProjectConfig::default();
    project.set_secret(None, "token", &Ref::global("token"));
    let provider = ModuleContextProvider::new(project);

    assert!(matches!(
        provider.build(&svc()).await,
        Err(ModuleContextError::SecretNotFound(name)) if name == "token"
    ));
}

#[tokio::test]
async fn test_update_replaces_snapshot() {
    let provider = ModuleContextProvider::new(ProjectConfig::default());
    assert!(provider.current("svc").is_none());

    let first = provider.update(&svc()).await.unwrap();
    let moved = with_dsn(svc(), "sales", "postgres://elsewhere:5432/svc_sales");
    provider.update(&moved).await.unwrap();

    let current = provider.current("svc").unwrap();
    assert_eq!(
        first.get_database("sales", DatabaseEngine::Postgres).unwrap(),
        "postgres://localhost:5432/svc_sales"
    );
    assert_eq!(
        current.get_database("sales", DatabaseEngine::Postgres).unwrap(),
        "postgres://elsewhere:5432/svc_sales"
    );
}

#[tokio::test]
async fn test_subscribe_sees_current_then_replacements() {
    let provider = ModuleContextProvider::new(ProjectConfig::default());
    provider.update(&svc()).await.unwrap();

    let mut stream = Box::pin(provider.subscribe("svc"));
    let first = stream.next().await.unwrap();
    assert_eq!(first.module(), "svc");

    let moved = with_dsn(svc(), "sales", "postgres://elsewhere:5432/svc_sales");
    provider.update(&moved).await.unwrap();
    let second = stream.next().await.unwrap();
    assert_eq!(
        second.get_database("sales", DatabaseEngine::Postgres).unwrap(),
        "postgres://elsewhere:5432/svc_sales"
    );

    provider.remove("svc").await;
    assert!(stream.next().await.is_none());
    assert!(provider.current("svc").is_none());
}

#[tokio::test]
async fn test_run_follows_schema_and_secret_updates() {
    let mut project = ProjectConfig::default();
    project.set_secret(None, "token", &Ref::global("token"));
    let cache = loaded_cache(&[(Ref::global("token"), b"v1".as_slice())]).await;
    let provider = Arc::new(ModuleContextProvider::new(project).with_secrets(cache.clone()));

    let source = Arc::new(SchemaEventSource::new());
    source.upsert(svc()).await;
    let cancel = CancellationToken::new();
    let runner = {
        let provider = provider.clone();
        let source = source.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { provider.run(source, cancel).await })
    };

    let mut stream = Box::pin(provider.subscribe("svc"));
    let first = stream.next().await.unwrap();
    assert_eq!(first.get_secret("token").unwrap(), b"v1");

    cache.set(&Ref::global("token"), b"v2").await.unwrap();
    let refreshed = stream.next().await.unwrap();
    assert_eq!(refreshed.get_secret("token").unwrap(), b"v2");
    assert_eq!(first.get_secret("token").unwrap(), b"v1");

    source.remove("svc").await;
    assert!(stream.next().await.is_none());

    cancel.cancel();
    runner.await.unwrap();
}

#[tokio::test]
async fn test_set_project_config_rebuilds_contexts() {
    let provider = ModuleContextProvider::new(ProjectConfig::default());
    provider.update(&svc()).await.unwrap();

    let mut project = ProjectConfig::default();
    project.set_config(None, "region", &Accessor::inline(b"eu-west"));
    provider.set_project_config(project).await.unwrap();

    let current = provider.current("svc").unwrap();
    assert_eq!(current.get_config("region").unwrap(), b"eu-west");
}

#[tokio::test]
async fn test_run_resyncs_after_falling_behind() {
    let provider = Arc::new(ModuleContextProvider::new(ProjectConfig::default()));
    let source = Arc::new(SchemaEventSource::with_capacity(4));
    source.upsert(svc()).await;
    source.upsert(Module::new("gone")).await;
    let cancel = CancellationToken::new();
    let runner = {
        let provider = provider.clone();
        let source = source.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { provider.run(source, cancel).await })
    };

    let mut stream = Box::pin(provider.subscribe("svc"));
    stream.next().await.unwrap();
    assert!(provider.current("gone").is_some());

    // Published without yielding, so the runner falls behind.
    for i in 0..20 {
        let dsn = format!("postgres://burst-{}:5432/svc_sales", i);
        source.upsert(with_dsn(svc(), "sales", &dsn)).await;
    }
    source.remove("gone").await;

    let latest = "postgres://burst-19:5432/svc_sales";
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(context) = stream.next().await {
            if context.get_database("sales", DatabaseEngine::Postgres).unwrap() == latest {
                break;
            }
        }
    })
    .await
    .unwrap();
    assert!(provider.current("gone").is_none());

    let after = "postgres://after:5432/svc_sales";
    source.upsert(with_dsn(svc(), "sales", after)).await;
    let context = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(context.get_database("sales", DatabaseEngine::Postgres).unwrap(), after);

    cancel.cancel();
    runner.await.unwrap();
}

#[tokio::test]
async fn test_rebuild_continues_past_failing_module() {
    let provider = ModuleContextProvider::new(ProjectConfig::default());
    provider.update(&Module::new("alpha")).await.unwrap();
    provider.update(&svc()).await.unwrap();

    let mut project = ProjectConfig::default();
    project.set_config(Some("alpha"), "missing", &Accessor::Env("PROVISIONER_TEST_UNSET_VAR".to_string()));
    project.set_config(Some("svc"), "region", &Accessor::inline(b"eu-west"));
    let result = provider.set_project_config(project).await;

    assert!(matches!(result, Err(ModuleContextError::ProjectConfig(_))));
    assert!(provider.current("alpha").unwrap().get_config("missing").is_err());
    assert_eq!(provider.current("svc").unwrap().get_config("region").unwrap(), b"eu-west");
}

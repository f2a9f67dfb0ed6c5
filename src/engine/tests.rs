use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::service::carry_over_runtime;
use super::*;
use crate::provisioner::{Provisioner, ProvisionerRegistry};
use crate::schema::{
    Data, DatabaseConnections, DatabaseEngine, DatabaseRuntime, DatabaseRuntimeEvent, Decl,
    Module, ModuleRuntimeDeployment, Position, ResourceKind, RuntimeEvent, Type,
};
use crate::schemaevents::{ChangeType, SchemaEventSource};
use crate::test_utils::{database_decl, verb_decl, MockProvisioner};

fn settings() -> EngineSettings {
    EngineSettings {
        max_task_retries: 3,
        call_timeout: Duration::from_secs(5),
        poll_min: Duration::from_millis(10),
        poll_max: Duration::from_millis(100),
    }
}

fn svc() -> Module {
    Module::new("svc")
        .with_decl(database_decl("sales", DatabaseEngine::Postgres, vec![]))
        .with_decl(verb_decl("create", vec![]))
}

fn sales_event() -> RuntimeEvent {
    RuntimeEvent::Database(DatabaseRuntimeEvent {
        id: "sales".to_string(),
        connections: Some(DatabaseConnections {
            read: "postgres://127.0.0.1:15432/svc_sales".to_string(),
            write: "postgres://127.0.0.1:15432/svc_sales".to_string(),
        }),
        migration_digest: None,
    })
}

fn data(name: &str, fields: Vec<(&str, Type)>) -> Decl {
    Decl::Data(Data {
        name: name.to_string(),
        export: true,
        type_parameters: Vec::new(),
        fields: fields
            .into_iter()
            .map(|(n, t)| crate::schema::Field::new(n, t))
            .collect(),
        metadata: Vec::new(),
        pos: Position::default(),
    })
}

/// Engine whose every kind goes to `provisioner`.
fn engine_with(provisioner: Arc<MockProvisioner>) -> Engine {
    let registry = ProvisionerRegistry::new().with_default("mock", provisioner as Arc<dyn Provisioner>);
    Engine::new(
        "test",
        Arc::new(registry),
        Arc::new(SchemaEventSource::new()),
        settings(),
    )
}

#[test]
fn test_error_kind_retry_policy() {
    assert!(!ErrorKind::InvalidSchema.is_retryable());
    assert!(!ErrorKind::UnsupportedKind.is_retryable());
    assert!(!ErrorKind::Cancelled.is_retryable());
    assert!(ErrorKind::UnknownToken.is_retryable());
    assert!(ErrorKind::TransientIo.is_retryable());
    assert!(ErrorKind::FatalProvisioner.is_retryable());
}

#[test]
fn test_logical_clock_is_monotonic() {
    let clock = LogicalClock::new();
    assert_eq!(clock.now(), 0);
    assert_eq!(clock.tick(), 1);
    assert_eq!(clock.tick(), 2);
    assert_eq!(clock.now(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_deploy_applies_events_and_publishes() {
    let provisioner = Arc::new(MockProvisioner::new().with_events(vec![sales_event()]));
    let engine = engine_with(provisioner.clone());
    let mut subscription = engine.events().subscribe().await;

    let outcome = engine.deploy(svc()).await.unwrap();

    assert!(outcome.changed);
    let sales = outcome.module.runtime.databases.get("sales").unwrap();
    assert_eq!(
        sales.connections.as_ref().unwrap().write,
        "postgres://127.0.0.1:15432/svc_sales"
    );
    assert_eq!(engine.module("svc").await.unwrap(), outcome.module);

    let event = subscription.next().await.unwrap();
    assert_eq!(event.change_type, ChangeType::Added);
    assert_eq!(event.module_name, "svc");
    assert_eq!(event.module.unwrap(), outcome.module);

    let request = &provisioner.provisions().await[0];
    assert_eq!(request.cluster_id, "test");
    assert!(request.previous_module.is_none());
    assert_eq!(
        request.kinds,
        vec![
            ResourceKind::Postgres,
            ResourceKind::Runner,
            ResourceKind::Module
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_redeploy_without_changes_publishes_nothing() {
    let provisioner = Arc::new(MockProvisioner::new().with_events(vec![sales_event()]));
    let engine = engine_with(provisioner.clone());
    engine.deploy(svc()).await.unwrap();
    let mut subscription = engine.events().subscribe().await;
    let initial = subscription.next().await.unwrap();
    assert!(!initial.more);

    let outcome = engine.deploy(svc()).await.unwrap();

    assert!(!outcome.changed);
    assert_eq!(provisioner.provisions().await.len(), 1);
    let next = tokio::time::timeout(Duration::from_secs(1), subscription.next()).await;
    assert!(next.is_err(), "no event expected");
}

#[tokio::test(start_paused = true)]
async fn test_failed_task_retried_then_deployment_fails() {
    let provisioner = Arc::new(MockProvisioner::new());
    provisioner
        .set_fail_status(Some("sql-migration svc.migration: invalid dependencies"))
        .await;
    let engine = engine_with(provisioner.clone());

    let err = engine.deploy(svc()).await.unwrap_err();

    match &err {
        EngineError::TaskFailed {
            module,
            provisioner: id,
            attempts,
            message,
        } => {
            assert_eq!(module, "svc");
            assert_eq!(id, "mock");
            assert_eq!(*attempts, 4);
            assert!(message.contains("invalid dependencies"));
        }
        other => panic!("expected task failure, got {:?}", other),
    }
    assert_eq!(provisioner.provisions().await.len(), 4);
    assert!(engine.module("svc").await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_provision_transport_error_is_retried() {
    let provisioner = Arc::new(MockProvisioner::new());
    provisioner.set_fail_provision(Some("connection refused")).await;
    let engine = engine_with(provisioner.clone());

    let err = engine.deploy(svc()).await.unwrap_err();

    assert!(matches!(err, EngineError::TaskFailed { attempts: 4, .. }));
    assert_eq!(err.kind(), ErrorKind::FatalProvisioner);
}

#[tokio::test(start_paused = true)]
async fn test_unbound_kind_rejected() {
    let mut registry = ProvisionerRegistry::new();
    registry
        .register(
            "dev",
            Arc::new(MockProvisioner::new()) as Arc<dyn Provisioner>,
            vec![ResourceKind::Postgres],
        )
        .unwrap();
    let engine = Engine::new(
        "test",
        Arc::new(registry),
        Arc::new(SchemaEventSource::new()),
        settings(),
    );

    let err = engine.deploy(svc()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::UnsupportedKind);
}

#[tokio::test(start_paused = true)]
async fn test_unresolved_reference_rejected() {
    let engine = engine_with(Arc::new(MockProvisioner::new()));
    let module = Module::new("svc").with_decl(data(
        "Order",
        vec![("customer", Type::reference("crm", "Customer"))],
    ));

    let err = engine.deploy(module).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidSchema);
}

#[tokio::test(start_paused = true)]
async fn test_cyclic_imports_rejected() {
    let engine = engine_with(Arc::new(MockProvisioner::new()));
    engine
        .deploy(Module::new("a").with_decl(data("A", vec![])))
        .await
        .unwrap();
    engine
        .deploy(Module::new("b").with_decl(data("B", vec![("a", Type::reference("a", "A"))])))
        .await
        .unwrap();

    let err = engine
        .deploy(Module::new("a").with_decl(data("A", vec![("b", Type::reference("b", "B"))])))
        .await
        .unwrap_err();

    match err {
        EngineError::InvalidSchema(crate::schema::SchemaError::CycleDetected { participants }) => {
            assert_eq!(participants, vec!["a".to_string(), "b".to_string()]);
        }
        other => panic!("expected cycle, got {:?}", other),
    }
    let a = engine.module("a").await.unwrap();
    assert!(a.imports().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_polling_backs_off_until_success() {
    let provisioner = Arc::new(
        MockProvisioner::new()
            .with_events(vec![sales_event()])
            .with_running_for(Duration::from_secs(10)),
    );
    let registry = ProvisionerRegistry::new()
        .with_default("mock", provisioner.clone() as Arc<dyn Provisioner>);
    let engine = Engine::new(
        "test",
        Arc::new(registry),
        Arc::new(SchemaEventSource::new()),
        EngineSettings {
            poll_min: Duration::from_millis(50),
            poll_max: Duration::from_secs(30),
            ..settings()
        },
    );
    let start = Instant::now();

    engine.deploy(svc()).await.unwrap();

    let elapsed = start.elapsed();
    let calls = provisioner.status_calls().await;
    assert!(calls.len() > 2);
    assert!(*calls.last().unwrap() - start >= Duration::from_secs(10));
    assert!(elapsed <= Duration::from_secs(40));
    for pair in calls.windows(2) {
        assert!(pair[1] - pair[0] <= Duration::from_secs(30));
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_polling() {
    let provisioner =
        Arc::new(MockProvisioner::new().with_running_for(Duration::from_secs(3600)));
    let engine = Arc::new(engine_with(provisioner));

    let deploy = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.deploy(svc()).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    engine.cancel();

    let err = deploy.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(engine.module("svc").await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_no_changes_completes_without_polling() {
    let provisioner = Arc::new(MockProvisioner::new());
    provisioner.set_no_changes(true);
    let engine = engine_with(provisioner.clone());

    let outcome = engine.deploy(svc()).await.unwrap();

    assert!(outcome.changed);
    assert!(provisioner.status_calls().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_remove_publishes_removed() {
    let engine = engine_with(Arc::new(MockProvisioner::new()));
    engine.deploy(svc()).await.unwrap();
    let mut subscription = engine.events().subscribe().await;
    subscription.next().await.unwrap();

    engine.remove("svc").await.unwrap();

    let event = subscription.next().await.unwrap();
    assert_eq!(event.change_type, ChangeType::Removed);
    assert!(event.module_removed);
    assert!(engine.module("svc").await.is_none());
    assert!(matches!(
        engine.remove("svc").await,
        Err(EngineError::ModuleNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_remove_refuses_imported_module() {
    let engine = engine_with(Arc::new(MockProvisioner::new()));
    engine
        .deploy(Module::new("a").with_decl(data("A", vec![])))
        .await
        .unwrap();
    engine
        .deploy(Module::new("b").with_decl(data("B", vec![("a", Type::reference("a", "A"))])))
        .await
        .unwrap();

    let err = engine.remove("a").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidSchema);
    assert!(engine.module("a").await.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_bootstrap_deploys_in_dependency_order() {
    let provisioner = Arc::new(MockProvisioner::new());
    let engine = engine_with(provisioner.clone());
    let schema = crate::schema::Schema::new(vec![
        Module::new("b").with_decl(data("B", vec![("a", Type::reference("a", "A"))])),
        Module::new("a").with_decl(data("A", vec![])),
    ]);

    let outcomes = engine.bootstrap(schema).await.unwrap();

    let names: Vec<&str> = outcomes.iter().map(|o| o.module.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b"]);
}

#[test]
fn test_carry_over_keeps_outputs_of_unchanged_resources() {
    let mut previous = svc();
    previous.runtime.databases.insert(
        "sales".to_string(),
        DatabaseRuntime {
            connections: Some(DatabaseConnections {
                read: "r".to_string(),
                write: "w".to_string(),
            }),
            migration_digest: None,
        },
    );
    previous.runtime.deployment = Some(ModuleRuntimeDeployment {
        deployment_key: "dpl-svc-1".to_string(),
        endpoint: Some("http://a".to_string()),
    });
    previous.runtime.clocks.insert("database.sales".to_string(), 7);

    let mut desired = svc();
    carry_over_runtime(&mut desired, Some(&previous));

    assert_eq!(desired.runtime.databases, previous.runtime.databases);
    assert_eq!(desired.deployment_key(), Some("dpl-svc-1"));
    assert_eq!(desired.runtime.clocks.get("database.sales"), Some(&7));
    assert_eq!(desired.runtime.base, previous.runtime.base);
    assert_eq!(desired, previous);
}

#[tokio::test(start_paused = true)]
async fn test_deployment_progress_steps() {
    let provisioner = Arc::new(MockProvisioner::new().with_events(vec![sales_event()]));
    let registry = ProvisionerRegistry::new()
        .with_default("mock", provisioner as Arc<dyn Provisioner>);
    let mut deployment = registry
        .create_deployment(
            "test",
            svc(),
            None,
            &settings(),
            Arc::new(LogicalClock::new()),
            tokio_util::sync::CancellationToken::new(),
        )
        .unwrap();
    assert_eq!(deployment.state().pending, 1);

    assert!(deployment.progress().await.unwrap());
    assert_eq!(deployment.state().running, 1);
    assert!(deployment.tasks()[0].token().is_some());

    assert!(!deployment.progress().await.unwrap());
    assert!(deployment.state().is_complete());
    assert_eq!(deployment.applied_events(), &[sales_event()]);
    assert!(deployment.module().runtime.databases.contains_key("sales"));
}

use super::*;
use crate::schema::{DatabaseEngine, Type};
use crate::test_utils::{database_decl, topic_decl};

fn svc() -> Module {
    Module::new("svc")
        .with_decl(database_decl("sales", DatabaseEngine::Postgres, vec![]))
        .with_decl(topic_decl("orders", Type::Unit))
}

fn request(desired: Module, previous: Option<Module>) -> ProvisionRequest {
    ProvisionRequest {
        cluster_id: "prod".to_string(),
        module_name: desired.name.clone(),
        desired_module: desired,
        previous_module: previous,
        kinds: vec![ResourceKind::Postgres, ResourceKind::Topic],
    }
}

fn provisioner(client: Arc<InMemoryStackClient>) -> CloudStackProvisioner {
    CloudStackProvisioner::new(
        "cloud",
        client,
        vec![ResourceKind::Postgres, ResourceKind::Mysql, ResourceKind::Topic],
    )
}

#[test]
fn test_stack_name() {
    assert_eq!(stack_name("prod", "orderService"), "prod-order-service");
}

#[tokio::test]
async fn test_submit_poll_success() {
    let client = Arc::new(InMemoryStackClient::new().with_polls(2));
    let cloud = provisioner(client.clone());

    let token = match cloud.provision(request(svc(), None)).await.unwrap() {
        ProvisionResponse::Submitted { token } => token,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(token, "prod-svc/op-1");

    assert_eq!(cloud.status(&token, &svc()).await.unwrap(), StatusResponse::Running);
    assert_eq!(cloud.status(&token, &svc()).await.unwrap(), StatusResponse::Running);
    let events = match cloud.status(&token, &svc()).await.unwrap() {
        StatusResponse::Success { events } => events,
        other => panic!("unexpected {:?}", other),
    };

    assert_eq!(
        events,
        vec![
            RuntimeEvent::Topic(TopicRuntimeEvent {
                id: "orders".to_string(),
                topic_id: "prod-svc.orders".to_string(),
                brokers: vec![],
            }),
            RuntimeEvent::Database(DatabaseRuntimeEvent {
                id: "sales".to_string(),
                connections: Some(DatabaseConnections {
                    read: "postgres://cloud.internal/prod-svc/sales".to_string(),
                    write: "postgres://cloud.internal/prod-svc/sales".to_string(),
                }),
                migration_digest: None,
            }),
        ]
    );
}

#[tokio::test]
async fn test_unchanged_template_is_no_changes() {
    let client = Arc::new(InMemoryStackClient::new());
    let cloud = provisioner(client.clone());
    let ProvisionResponse::Submitted { token } = cloud.provision(request(svc(), None)).await.unwrap()
    else {
        panic!("expected submission");
    };
    cloud.status(&token, &svc()).await.unwrap();

    // Previous runtime lost; the stack itself already matches.
    let response = cloud.provision(request(svc(), None)).await.unwrap();

    assert_eq!(response, ProvisionResponse::NoChanges);
}

#[tokio::test]
async fn test_rollback_reports_failed() {
    let client = Arc::new(InMemoryStackClient::new());
    client.fail_next("quota exceeded").await;
    let cloud = provisioner(client.clone());
    let ProvisionResponse::Submitted { token } = cloud.provision(request(svc(), None)).await.unwrap()
    else {
        panic!("expected submission");
    };

    let status = cloud.status(&token, &svc()).await.unwrap();

    assert!(matches!(status, StatusResponse::Failed { message } if message.contains("quota exceeded")));
    assert!(client.stack("prod-svc").await.is_none());
}

#[tokio::test]
async fn test_unknown_token() {
    let cloud = provisioner(Arc::new(InMemoryStackClient::new()));

    for token in ["garbage", "prod-svc/op-9"] {
        let status = cloud.status(token, &svc()).await.unwrap();
        assert!(matches!(status, StatusResponse::Failed { message } if message.starts_with("unknown token")));
    }
}

#[tokio::test]
async fn test_unsupported_kind() {
    let cloud = CloudStackProvisioner::new(
        "cloud",
        Arc::new(InMemoryStackClient::new()),
        vec![ResourceKind::Topic],
    );

    let err = cloud.provision(request(svc(), None)).await.unwrap_err();

    assert!(matches!(
        err,
        ProvisionerError::UnsupportedKind {
            kind: ResourceKind::Postgres,
            ..
        }
    ));
}

//! HTTP surface: provisioner plugin RPC, deployment admin, schema pull and
//! secrets RPC.
//!
//! Every body is JSON. The schema pull stream is newline-delimited JSON.
//! Errors are reported as `{"error": "<message>"}` with a status code chosen
//! so that clients retry only on 5xx.

mod admin;
mod provisioner;
mod secrets;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::engine::Engine;
use crate::provisioner::Provisioner;
use crate::secrets::{SecretsCache, SecretsSync};

pub use admin::DeploymentResponse;

/// Error body returned by every route.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

/// Services exposed by one process. Routes are mounted only for the parts present.
#[derive(Default, Clone)]
pub struct RpcState {
    provisioner: Option<Arc<dyn Provisioner>>,
    engine: Option<Arc<Engine>>,
    secrets: Option<Arc<SecretsCache>>,
    secrets_sync: Option<Arc<SecretsSync>>,
}

impl RpcState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn with_engine(mut self, engine: Arc<Engine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_secrets(mut self, cache: Arc<SecretsCache>) -> Self {
        self.secrets = Some(cache);
        self
    }

    /// Serve the cache of `sync`, forwarding writes to the leader.
    pub fn with_secrets_sync(mut self, sync: Arc<SecretsSync>) -> Self {
        self.secrets = Some(sync.cache().clone());
        self.secrets_sync = Some(sync);
        self
    }
}

async fn health() -> StatusCode {
    StatusCode::OK
}

/// Build the router (separated for testing).
pub fn router(state: RpcState) -> Router {
    let mut router = Router::new().route("/v1/health", get(health));
    if let Some(provisioner) = state.provisioner {
        router = router.merge(provisioner::routes(provisioner));
    }
    if let Some(engine) = state.engine {
        router = router.merge(admin::routes(engine));
    }
    if let Some(cache) = state.secrets {
        router = router.merge(secrets::routes(secrets::SecretsState {
            cache,
            sync: state.secrets_sync,
        }));
    }
    router.layer(TraceLayer::new_for_http())
}

/// Serve `router` on `address` until `cancel` fires.
///
/// An address with port 0 binds an ephemeral port; the bound port is logged.
pub async fn serve(router: Router, address: &str, cancel: CancellationToken) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(address).await?;
    serve_listener(router, listener, cancel).await
}

/// Serve `router` on an already bound listener until `cancel` fires.
pub async fn serve_listener(
    router: Router,
    listener: tokio::net::TcpListener,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let local = listener.local_addr()?;
    info!(address = %local, "RPC server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    info!(address = %local, "RPC server stopped");
    Ok(())
}

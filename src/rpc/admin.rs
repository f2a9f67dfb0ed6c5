//! Deployment admin and schema pull.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};

use super::ApiError;
use crate::engine::{Engine, EngineError, ErrorKind};
use crate::schema::{Module, Schema};
use crate::schemaevents::{SchemaEvent, SubscriptionError};

type AppState = Arc<Engine>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentResponse {
    pub module: Module,
    #[serde(default)]
    pub deployment_key: Option<String>,
    pub changed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct PlanText {
    plan: String,
}

pub(super) fn routes(engine: AppState) -> Router {
    Router::new()
        .route("/v1/deployments", post(deploy))
        .route("/v1/deployments/plan", post(plan))
        .route("/v1/deployments/:module", delete(remove))
        .route("/v1/schema", get(schema))
        .route("/v1/schema/pull", get(pull_schema))
        .with_state(engine)
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match (&err, err.kind()) {
            (EngineError::ModuleNotFound(_), _) => StatusCode::NOT_FOUND,
            (_, ErrorKind::InvalidSchema | ErrorKind::UnsupportedKind) => StatusCode::BAD_REQUEST,
            (_, ErrorKind::Cancelled | ErrorKind::TransientIo) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        };
        ApiError::new(status, err.to_string())
    }
}

async fn deploy(
    State(engine): State<AppState>,
    Json(module): Json<Module>,
) -> Result<Json<DeploymentResponse>, ApiError> {
    let outcome = engine.deploy(module).await?;
    Ok(Json(DeploymentResponse {
        module: outcome.module,
        deployment_key: outcome.deployment_key,
        changed: outcome.changed,
    }))
}

async fn plan(
    State(engine): State<AppState>,
    Json(module): Json<Module>,
) -> Result<Json<PlanText>, ApiError> {
    let plan = engine.plan(module).await?;
    Ok(Json(PlanText { plan }))
}

async fn remove(
    State(engine): State<AppState>,
    Path(module): Path<String>,
) -> Result<Json<Module>, ApiError> {
    Ok(Json(engine.remove(&module).await?))
}

async fn schema(State(engine): State<AppState>) -> Json<Schema> {
    Json((*engine.observed().await).clone())
}

fn encode_line(event: &SchemaEvent) -> Result<Bytes, SubscriptionError> {
    let mut line = serde_json::to_vec(event).map_err(|e| SubscriptionError::Decode(e.to_string()))?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

/// Stream the schema as newline-delimited events.
///
/// An empty initial batch is closed with an explicit end-of-batch marker so
/// clients can tell "no modules" from "still loading". The body fails when
/// the subscriber lags, dropping the connection.
async fn pull_schema(State(engine): State<AppState>) -> Response {
    let subscription = engine.events().subscribe().await;
    let marker = if subscription.initial_len() == 0 {
        vec![Ok(SchemaEvent::end_of_batch())]
    } else {
        Vec::new()
    };
    let events = stream::iter(marker)
        .chain(subscription.into_stream())
        .map(|event| event.and_then(|e| encode_line(&e)));

    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(events),
    )
        .into_response()
}

//! Provisioner plugin RPC, serving any [`Provisioner`].

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::warn;

use super::ApiError;
use crate::provisioner::{
    PlanResponse, ProvisionRequest, ProvisionResponse, Provisioner, ProvisionerError,
    StatusRequest, StatusResponse,
};

type AppState = Arc<dyn Provisioner>;

pub(super) fn routes(provisioner: AppState) -> Router {
    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/provision", post(provision))
        .route("/v1/status", post(status))
        .route("/v1/plan", post(plan))
        .with_state(provisioner)
}

impl From<ProvisionerError> for ApiError {
    fn from(err: ProvisionerError) -> Self {
        let status = match &err {
            ProvisionerError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProvisionerError::UnsupportedKind { .. }
            | ProvisionerError::InvalidSchema(_)
            | ProvisionerError::DuplicateBinding { .. }
            | ProvisionerError::UnknownProvisioner(_)
            | ProvisionerError::Config(_) => StatusCode::BAD_REQUEST,
        };
        ApiError::new(status, err.to_string())
    }
}

async fn ping(State(provisioner): State<AppState>) -> Result<StatusCode, ApiError> {
    provisioner.ping().await?;
    Ok(StatusCode::OK)
}

async fn provision(
    State(provisioner): State<AppState>,
    Json(request): Json<ProvisionRequest>,
) -> Result<Json<ProvisionResponse>, ApiError> {
    let module = request.module_name.clone();
    let response = provisioner.provision(request).await.map_err(|err| {
        warn!(module = %module, error = %err, "Provision rejected");
        err
    })?;
    Ok(Json(response))
}

async fn status(
    State(provisioner): State<AppState>,
    Json(request): Json<StatusRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    Ok(Json(
        provisioner
            .status(&request.token, &request.desired_module)
            .await?,
    ))
}

async fn plan(
    State(provisioner): State<AppState>,
    Json(request): Json<ProvisionRequest>,
) -> Result<Json<PlanResponse>, ApiError> {
    let plan = provisioner.plan(request).await?;
    Ok(Json(PlanResponse { plan }))
}

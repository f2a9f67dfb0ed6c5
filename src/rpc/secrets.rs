//! Secrets RPC served by every instance.
//!
//! Followers copy the leader through `list`. Writes received by a follower
//! are forwarded to the leader when a [`SecretsSync`] is mounted.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::info;

use super::ApiError;
use crate::secrets::{
    Ref, SecretEntry, SecretSetRequest, SecretUnsetRequest, SecretsCache, SecretsError,
    SecretsListRequest, SecretsListResponse, SecretsSync,
};

#[derive(Clone)]
pub(super) struct SecretsState {
    pub(super) cache: Arc<SecretsCache>,
    pub(super) sync: Option<Arc<SecretsSync>>,
}

type AppState = SecretsState;

pub(super) fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/secrets/list", post(list))
        .route("/v1/secrets/set", post(set))
        .route("/v1/secrets/unset", post(unset))
        .with_state(state)
}

impl From<SecretsError> for ApiError {
    fn from(err: SecretsError) -> Self {
        let status = match &err {
            SecretsError::InvalidRef(_) | SecretsError::UnknownProvider(_) => StatusCode::BAD_REQUEST,
            SecretsError::NotFound(_) => StatusCode::NOT_FOUND,
            SecretsError::NotLoaded => StatusCode::SERVICE_UNAVAILABLE,
            SecretsError::Upstream(_) | SecretsError::Leader(_) => StatusCode::BAD_GATEWAY,
            SecretsError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        };
        ApiError::new(status, err.to_string())
    }
}

fn check_provider(cache: &SecretsCache, provider: &str) -> Result<(), SecretsError> {
    if provider == cache.provider() {
        Ok(())
    } else {
        Err(SecretsError::UnknownProvider(provider.to_string()))
    }
}

async fn list(
    State(SecretsState { cache, .. }): State<AppState>,
    Json(request): Json<SecretsListRequest>,
) -> Result<Json<SecretsListResponse>, ApiError> {
    if !cache.is_loaded() {
        return Err(SecretsError::NotLoaded.into());
    }
    let secrets = cache
        .list(request.module.as_deref())
        .iter()
        .map(|(reference, value)| {
            SecretEntry::new(reference, request.include_values.then_some(value.as_slice()))
        })
        .collect();
    Ok(Json(SecretsListResponse { secrets }))
}

async fn set(
    State(state): State<AppState>,
    Json(request): Json<SecretSetRequest>,
) -> Result<StatusCode, ApiError> {
    check_provider(&state.cache, &request.provider)?;
    let reference: Ref = request.ref_path.parse()?;
    let value = STANDARD
        .decode(&request.value)
        .map_err(|e| ApiError::bad_request(format!("invalid value encoding: {}", e)))?;
    match &state.sync {
        Some(sync) => sync.set(&reference, &value).await?,
        None => state.cache.set(&reference, &value).await?,
    }
    info!(secret = %reference, "Secret set");
    Ok(StatusCode::NO_CONTENT)
}

async fn unset(
    State(state): State<AppState>,
    Json(request): Json<SecretUnsetRequest>,
) -> Result<StatusCode, ApiError> {
    check_provider(&state.cache, &request.provider)?;
    let reference: Ref = request.ref_path.parse()?;
    match &state.sync {
        Some(sync) => sync.unset(&reference).await?,
        None => state.cache.unset(&reference).await?,
    }
    info!(secret = %reference, "Secret unset");
    Ok(StatusCode::NO_CONTENT)
}

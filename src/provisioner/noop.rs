//! Provisioner that accepts every request and does nothing.

use async_trait::async_trait;
use tracing::debug;

use super::{ProvisionRequest, ProvisionResponse, Provisioner, Result, StatusResponse};
use crate::schema::Module;

/// Treats every resource it is bound to as already provisioned.
#[derive(Debug, Default, Clone)]
pub struct NoopProvisioner;

#[async_trait]
impl Provisioner for NoopProvisioner {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn provision(&self, request: ProvisionRequest) -> Result<ProvisionResponse> {
        debug!(module = %request.module_name, kinds = ?request.kinds, "Noop provision");
        Ok(ProvisionResponse::NoChanges)
    }

    async fn status(&self, _token: &str, _desired_module: &Module) -> Result<StatusResponse> {
        Ok(StatusResponse::Success { events: Vec::new() })
    }

    async fn plan(&self, _request: ProvisionRequest) -> Result<String> {
        Ok(String::new())
    }
}

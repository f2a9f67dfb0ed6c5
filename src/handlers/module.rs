//! Mints deployment keys for module resources.

use std::sync::Arc;

use async_trait::async_trait;
use rand::distr::Alphanumeric;
use rand::Rng;
use tracing::info;

use crate::artefacts::ArtefactStore;
use crate::provisioner::{HandlerContext, HandlerError, ResourceHandler};
use crate::schema::{
    ModuleRuntimeDeployment, ModuleRuntimeEvent, Provisioned, ResourceSpec, RuntimeEvent,
};

const KEY_SUFFIX_LEN: usize = 16;

/// A fresh `dpl-<module>-<suffix>` key.
pub fn new_deployment_key(module: &str) -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(KEY_SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("dpl-{}-{}", module, suffix)
}

/// Provisions `Module` resources.
///
/// Every change to the module yields a new deployment key. When an artefact
/// store is attached, every artefact of the module must be present in it.
#[derive(Default)]
pub struct ModuleHandler {
    artefacts: Option<Arc<dyn ArtefactStore>>,
}

impl ModuleHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_artefacts(mut self, artefacts: Arc<dyn ArtefactStore>) -> Self {
        self.artefacts = Some(artefacts);
        self
    }
}

#[async_trait]
impl ResourceHandler for ModuleHandler {
    async fn provision(
        &self,
        ctx: &HandlerContext,
        resource: &Provisioned,
        _previous: Option<&Provisioned>,
    ) -> Result<Option<RuntimeEvent>, HandlerError> {
        if let (Some(store), ResourceSpec::Module { artefacts, .. }) =
            (&self.artefacts, &resource.spec)
        {
            for artefact in artefacts {
                let present = store
                    .contains(&artefact.digest)
                    .await
                    .map_err(|e| HandlerError::Transient(e.to_string()))?;
                if !present {
                    return Err(HandlerError::ArtefactMissing(artefact.digest.clone()));
                }
            }
        }

        let deployment_key = new_deployment_key(ctx.module_name());
        info!(module = %ctx.module_name(), deployment_key = %deployment_key, "New deployment");
        Ok(Some(RuntimeEvent::Module(ModuleRuntimeEvent::Deployment(
            ModuleRuntimeDeployment {
                deployment_key,
                endpoint: None,
            },
        ))))
    }
}

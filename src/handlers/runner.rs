//! Starts the compute serving a module deployment.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::provisioner::{HandlerContext, HandlerError, ResourceHandler};
use crate::scaling::{RouteTable, RunnerScaling, TerminationSweeper};
use crate::schema::{
    ModuleRuntimeDeployment, ModuleRuntimeEvent, Provisioned, ResourceKind, ResourceOutput,
    RuntimeEvent,
};
use crate::utils::bootstrap::wait_until_ready;

/// Provisions `Runner` resources through a scaling backend.
///
/// The previous deployment is terminated once the new one serves; a failed
/// termination is handed to the sweeper instead of failing the step.
pub struct RunnerHandler {
    scaling: Arc<dyn RunnerScaling>,
    routes: Arc<RouteTable>,
    sweeper: Option<Arc<TerminationSweeper>>,
    endpoint_timeout: Duration,
}

impl RunnerHandler {
    pub fn new(scaling: Arc<dyn RunnerScaling>, routes: Arc<RouteTable>, endpoint_timeout: Duration) -> Self {
        Self {
            scaling,
            routes,
            sweeper: None,
            endpoint_timeout,
        }
    }

    pub fn with_sweeper(mut self, sweeper: Arc<TerminationSweeper>) -> Self {
        self.sweeper = Some(sweeper);
        self
    }

    async fn terminate_previous(&self, module: &str, previous_key: &str) {
        if let Err(err) = self.scaling.terminate_deployment(module, previous_key).await {
            warn!(
                module = %module,
                deployment_key = %previous_key,
                error = %err,
                "Failed to terminate previous deployment"
            );
            if let Some(sweeper) = &self.sweeper {
                sweeper.schedule(module, previous_key);
            }
        }
    }
}

fn previous_deployment_key(previous: Option<&Provisioned>) -> Option<&str> {
    match previous.and_then(|p| p.output.as_ref()) {
        Some(ResourceOutput::Runner { deployment_key, .. }) => Some(deployment_key),
        _ => None,
    }
}

#[async_trait]
impl ResourceHandler for RunnerHandler {
    #[tracing::instrument(
        name = "handler.runner",
        skip_all,
        fields(module = %ctx.module_name(), resource_id = %resource.resource_id)
    )]
    async fn provision(
        &self,
        ctx: &HandlerContext,
        resource: &Provisioned,
        previous: Option<&Provisioned>,
    ) -> Result<Option<RuntimeEvent>, HandlerError> {
        let module = ctx.module_name();
        let module_ref = resource
            .dependencies
            .iter()
            .find(|d| d.kind == ResourceKind::Module)
            .ok_or_else(|| HandlerError::InvalidDependencies {
                resource: resource.resource_id.clone(),
                reason: "no module dependency".to_string(),
            })?;
        let deployment_key = match ctx.dependency(module_ref).and_then(|d| d.output) {
            Some(ResourceOutput::Module { deployment_key }) => deployment_key,
            _ => return Err(HandlerError::DependencyUnsatisfied(module_ref.id.clone())),
        };

        self.scaling
            .start_deployment(module, &deployment_key, &ctx.module)
            .await
            .map_err(|e| HandlerError::Scaling(e.to_string()))?;

        let scaling = &self.scaling;
        let key = deployment_key.as_str();
        let endpoint = wait_until_ready("runner endpoint", self.endpoint_timeout, || async move {
            match scaling.get_endpoint_for_deployment(module, key).await {
                Ok(Some(endpoint)) => Ok(endpoint),
                Ok(None) => Err("no endpoint yet".to_string()),
                Err(err) => Err(err.to_string()),
            }
        })
        .await
        .map_err(|e| HandlerError::Scaling(e.to_string()))?;

        if let Some(previous_key) = previous_deployment_key(previous) {
            if previous_key != deployment_key {
                self.terminate_previous(module, previous_key).await;
            }
        }

        self.routes.update(module, &deployment_key, &endpoint).await;
        info!(module = %module, deployment_key = %deployment_key, endpoint = %endpoint, "Runner serving");

        Ok(Some(RuntimeEvent::Module(ModuleRuntimeEvent::Deployment(
            ModuleRuntimeDeployment {
                deployment_key,
                endpoint: Some(endpoint),
            },
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scaling::InMemoryScaling;
    use crate::schema::{get_provisioned, runner_resource_id, Module};
    use crate::test_utils::handler_context;

    fn deployed(key: &str, endpoint: Option<&str>) -> Module {
        let mut module = Module::new("svc");
        module.runtime.deployment = Some(ModuleRuntimeDeployment {
            deployment_key: key.to_string(),
            endpoint: endpoint.map(str::to_string),
        });
        module
    }

    fn runner_of(module: &Module) -> Provisioned {
        get_provisioned(module)
            .remove(&runner_resource_id(&module.name))
            .unwrap()
    }

    #[tokio::test]
    async fn test_first_deployment_starts_and_routes() {
        let scaling = Arc::new(InMemoryScaling::default().with_endpoints(vec!["http://a".to_string()]));
        let routes = Arc::new(RouteTable::new());
        let handler = RunnerHandler::new(scaling.clone(), routes.clone(), Duration::from_secs(5));
        let module = deployed("dpl-svc-k1", None);
        let resource = runner_of(&module);

        let event = handler
            .provision(&handler_context(module), &resource, None)
            .await
            .unwrap();

        assert_eq!(
            event,
            Some(RuntimeEvent::Module(ModuleRuntimeEvent::Deployment(
                ModuleRuntimeDeployment {
                    deployment_key: "dpl-svc-k1".to_string(),
                    endpoint: Some("http://a".to_string()),
                }
            )))
        );
        assert!(scaling.is_running("svc", "dpl-svc-k1").await);
        assert_eq!(routes.get("svc").await.unwrap().endpoint, "http://a");
    }

    #[tokio::test]
    async fn test_redeploy_terminates_previous() {
        let scaling = Arc::new(InMemoryScaling::default().with_endpoints(vec!["http://b".to_string()]));
        let handler = RunnerHandler::new(scaling.clone(), Arc::new(RouteTable::new()), Duration::from_secs(5));
        let previous = runner_of(&deployed("dpl-svc-k1", Some("http://a")));
        let module = deployed("dpl-svc-k2", None);
        let resource = runner_of(&module);

        handler
            .provision(&handler_context(module), &resource, Some(&previous))
            .await
            .unwrap();

        assert_eq!(
            scaling.terminated(),
            vec![("svc".to_string(), "dpl-svc-k1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_failed_termination_goes_to_sweeper() {
        let scaling = Arc::new(InMemoryScaling::default());
        scaling.set_fail_terminate(true);
        let sweeper = Arc::new(TerminationSweeper::new(scaling.clone(), Duration::from_secs(60)));
        let handler = RunnerHandler::new(scaling.clone(), Arc::new(RouteTable::new()), Duration::from_secs(5))
            .with_sweeper(sweeper.clone());
        let previous = runner_of(&deployed("dpl-svc-k1", Some("http://a")));
        let module = deployed("dpl-svc-k2", None);
        let resource = runner_of(&module);

        let event = handler
            .provision(&handler_context(module), &resource, Some(&previous))
            .await;

        assert!(event.is_ok());
        assert_eq!(
            sweeper.pending(),
            vec![("svc".to_string(), "dpl-svc-k1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_module_without_deployment_is_unsatisfied() {
        let scaling = Arc::new(InMemoryScaling::default());
        let handler = RunnerHandler::new(scaling, Arc::new(RouteTable::new()), Duration::from_secs(5));
        let module = Module::new("svc");
        let resource = runner_of(&module);

        let err = handler
            .provision(&handler_context(module), &resource, None)
            .await
            .unwrap_err();

        assert!(matches!(err, HandlerError::DependencyUnsatisfied(id) if id == "svc.module"));
    }
}

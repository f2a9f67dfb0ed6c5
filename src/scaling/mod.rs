//! Runner scaling.
//!
//! A [`RunnerScaling`] backend starts and terminates the compute serving a
//! module deployment and reports its endpoint. [`RouteTable`] is the control
//! plane's view of which endpoint serves each module, and
//! [`TerminationSweeper`] retries terminations that failed.

mod routes;
mod sweeper;

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::schema::Module;

pub use routes::RouteTable;
pub use sweeper::TerminationSweeper;

#[derive(Debug, thiserror::Error)]
pub enum ScalingError {
    #[error("deployment {deployment_key} of {module} not found")]
    NotFound {
        module: String,
        deployment_key: String,
    },

    #[error("scaling backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, ScalingError>;

/// Backend running module deployments.
#[async_trait]
pub trait RunnerScaling: Send + Sync {
    /// Start serving `module` at `deployment_key`. Starting a running deployment is a no-op.
    async fn start_deployment(&self, module: &str, deployment_key: &str, schema: &Module)
        -> Result<()>;

    /// Endpoint of the deployment, `None` until it is ready.
    async fn get_endpoint_for_deployment(
        &self,
        module: &str,
        deployment_key: &str,
    ) -> Result<Option<String>>;

    /// Stop the deployment. Terminating an unknown deployment succeeds.
    async fn terminate_deployment(&self, module: &str, deployment_key: &str) -> Result<()>;
}

struct LocalDeployment {
    endpoint: String,
    /// Endpoint polls remaining before the deployment reports ready.
    warmup: u32,
}

/// Scaling backend tracking deployments in memory.
///
/// Endpoints are taken from a scripted queue when one is set, otherwise
/// allocated as `http://127.0.0.1:<port>` from `base_port` upward.
pub struct InMemoryScaling {
    deployments: RwLock<BTreeMap<(String, String), LocalDeployment>>,
    next_port: AtomicU16,
    scripted: Mutex<VecDeque<String>>,
    warmup: u32,
    fail_terminate: AtomicBool,
    terminated: Mutex<Vec<(String, String)>>,
}

impl Default for InMemoryScaling {
    fn default() -> Self {
        Self::new(8900)
    }
}

impl InMemoryScaling {
    pub fn new(base_port: u16) -> Self {
        Self {
            deployments: RwLock::new(BTreeMap::new()),
            next_port: AtomicU16::new(base_port),
            scripted: Mutex::new(VecDeque::new()),
            warmup: 0,
            fail_terminate: AtomicBool::new(false),
            terminated: Mutex::new(Vec::new()),
        }
    }

    /// Hand out `endpoints` in order to the next deployments started.
    pub fn with_endpoints(self, endpoints: Vec<String>) -> Self {
        if let Ok(mut scripted) = self.scripted.lock() {
            scripted.extend(endpoints);
        }
        self
    }

    /// Report no endpoint for the first `polls` lookups of each deployment.
    pub fn with_warmup(mut self, polls: u32) -> Self {
        self.warmup = polls;
        self
    }

    pub fn set_fail_terminate(&self, fail: bool) {
        self.fail_terminate.store(fail, Ordering::SeqCst);
    }

    pub async fn is_running(&self, module: &str, deployment_key: &str) -> bool {
        self.deployments
            .read()
            .await
            .contains_key(&(module.to_string(), deployment_key.to_string()))
    }

    pub async fn running(&self) -> Vec<(String, String)> {
        self.deployments.read().await.keys().cloned().collect()
    }

    /// Successful terminations in call order.
    pub fn terminated(&self) -> Vec<(String, String)> {
        self.terminated.lock().map(|t| t.clone()).unwrap_or_default()
    }

    fn allocate_endpoint(&self) -> String {
        let scripted = self.scripted.lock().ok().and_then(|mut q| q.pop_front());
        scripted.unwrap_or_else(|| {
            let port = self.next_port.fetch_add(1, Ordering::SeqCst);
            format!("http://127.0.0.1:{}", port)
        })
    }
}

#[async_trait]
impl RunnerScaling for InMemoryScaling {
    async fn start_deployment(
        &self,
        module: &str,
        deployment_key: &str,
        _schema: &Module,
    ) -> Result<()> {
        let mut deployments = self.deployments.write().await;
        let key = (module.to_string(), deployment_key.to_string());
        if deployments.contains_key(&key) {
            debug!(module = %module, deployment_key = %deployment_key, "Deployment already running");
            return Ok(());
        }
        let endpoint = self.allocate_endpoint();
        info!(module = %module, deployment_key = %deployment_key, endpoint = %endpoint, "Starting deployment");
        deployments.insert(
            key,
            LocalDeployment {
                endpoint,
                warmup: self.warmup,
            },
        );
        Ok(())
    }

    async fn get_endpoint_for_deployment(
        &self,
        module: &str,
        deployment_key: &str,
    ) -> Result<Option<String>> {
        let mut deployments = self.deployments.write().await;
        let deployment = deployments
            .get_mut(&(module.to_string(), deployment_key.to_string()))
            .ok_or_else(|| ScalingError::NotFound {
                module: module.to_string(),
                deployment_key: deployment_key.to_string(),
            })?;
        if deployment.warmup > 0 {
            deployment.warmup -= 1;
            return Ok(None);
        }
        Ok(Some(deployment.endpoint.clone()))
    }

    async fn terminate_deployment(&self, module: &str, deployment_key: &str) -> Result<()> {
        if self.fail_terminate.load(Ordering::SeqCst) {
            return Err(ScalingError::Backend(format!(
                "terminate {} {} refused",
                module, deployment_key
            )));
        }
        let key = (module.to_string(), deployment_key.to_string());
        if self.deployments.write().await.remove(&key).is_some() {
            info!(module = %module, deployment_key = %deployment_key, "Terminated deployment");
        }
        if let Ok(mut terminated) = self.terminated.lock() {
            terminated.push(key);
        }
        Ok(())
    }
}

//! Module routing table.

use std::collections::HashMap;

use tokio::sync::{watch, RwLock};
use tracing::info;

/// A module's serving deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub deployment_key: String,
    pub endpoint: String,
}

/// Endpoint currently serving each module.
///
/// Subscribers are notified with a version counter whenever a route changes.
pub struct RouteTable {
    routes: RwLock<HashMap<String, Route>>,
    version: watch::Sender<u64>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteTable {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            routes: RwLock::new(HashMap::new()),
            version,
        }
    }

    /// Route `module` to `endpoint`. Returns whether the route changed.
    pub async fn update(&self, module: &str, deployment_key: &str, endpoint: &str) -> bool {
        let route = Route {
            deployment_key: deployment_key.to_string(),
            endpoint: endpoint.to_string(),
        };
        let mut routes = self.routes.write().await;
        if routes.get(module) == Some(&route) {
            return false;
        }
        info!(module = %module, deployment_key = %deployment_key, endpoint = %endpoint, "Updating route");
        routes.insert(module.to_string(), route);
        self.version.send_modify(|v| *v += 1);
        true
    }

    pub async fn remove(&self, module: &str) {
        if self.routes.write().await.remove(module).is_some() {
            info!(module = %module, "Removing route");
            self.version.send_modify(|v| *v += 1);
        }
    }

    pub async fn get(&self, module: &str) -> Option<Route> {
        self.routes.read().await.get(module).cloned()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}

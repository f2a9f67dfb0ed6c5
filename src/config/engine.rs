//! Engine and provisioner registry configuration.

use serde::Deserialize;

/// Task polling and retry.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Restarts of a failed task before the deployment fails.
    pub max_task_retries: u32,
    /// Deadline for each provisioner call.
    pub call_timeout_secs: u64,
    pub poll_min_delay_ms: u64,
    pub poll_max_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_task_retries: 3,
            call_timeout_secs: 300,
            poll_min_delay_ms: 50,
            poll_max_delay_ms: 30_000,
        }
    }
}

/// Where the provisioner plugin bindings live.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Path to the plugin TOML. Without one every kind goes to the builtin provisioners.
    pub plugins: Option<String>,
}

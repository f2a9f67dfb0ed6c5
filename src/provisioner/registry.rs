//! Resource-kind to provisioner bindings.
//!
//! Bindings come from a TOML document:
//!
//! ```toml
//! default = "controller"
//!
//! [[plugins]]
//! id = "dev"
//! resources = ["postgres", "mysql", "topic"]
//!
//! [[plugins]]
//! id = "custom"
//! url = "http://127.0.0.1:8894"
//! resources = ["runner"]
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{PluginProvisioner, PluginProvisionerConfig, ProvisionRequest, Provisioner, ProvisionerError, Result};
use crate::engine::{Deployment, EngineSettings, LogicalClock, Task};
use crate::schema::{get_provisioned, Module, Provisioned, ResourceKind};

/// Provisioner ids served from this process.
pub const BUILTIN_PROVISIONERS: [&str; 6] =
    ["noop", "controller", "dev", "migration", "scaling", "cloud"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginEntry {
    pub id: String,
    /// Base URL of an out-of-process plugin. Required for ids that are not builtin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub resources: Vec<ResourceKind>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Provisioner for kinds no plugin claims.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub plugins: Vec<PluginEntry>,
}

impl PluginConfig {
    /// Bindings used when no plugin file is configured: everything runs in process.
    pub fn local() -> Self {
        let entry = |id: &str, resources: Vec<ResourceKind>| PluginEntry {
            id: id.to_string(),
            url: None,
            resources,
        };
        Self {
            default: Some("controller".to_string()),
            plugins: vec![
                entry(
                    "dev",
                    vec![ResourceKind::Postgres, ResourceKind::Mysql, ResourceKind::Topic],
                ),
                entry("migration", vec![ResourceKind::SqlMigration]),
                entry("scaling", vec![ResourceKind::Runner]),
            ],
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: PluginConfig =
            toml::from_str(text).map_err(|e| ProvisionerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ProvisionerError::Config(format!("{}: {}", path.display(), e)))?;
        Self::parse(&text)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ProvisionerError::Config(e.to_string()))
    }

    /// Every kind is bound at most once and every id appears once.
    pub fn validate(&self) -> Result<()> {
        let mut ids = BTreeSet::new();
        let mut bound: HashMap<ResourceKind, &str> = HashMap::new();
        for plugin in &self.plugins {
            if !ids.insert(plugin.id.as_str()) {
                return Err(ProvisionerError::Config(format!(
                    "provisioner {} listed twice",
                    plugin.id
                )));
            }
            for kind in &plugin.resources {
                if let Some(first) = bound.insert(*kind, &plugin.id) {
                    return Err(ProvisionerError::DuplicateBinding {
                        kind: *kind,
                        first: first.to_string(),
                        second: plugin.id.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// A provisioner and the kinds explicitly bound to it.
pub struct ProvisionerBinding {
    pub id: String,
    pub provisioner: Arc<dyn Provisioner>,
    pub kinds: Vec<ResourceKind>,
}

/// Resources of one module owned by one binding.
struct Group {
    binding: Arc<ProvisionerBinding>,
    resources: Vec<Provisioned>,
    changed: bool,
}

impl Group {
    fn kinds(&self) -> Vec<ResourceKind> {
        let kinds: BTreeSet<ResourceKind> = self.resources.iter().map(|r| r.kind).collect();
        kinds.into_iter().collect()
    }
}

#[derive(Default)]
pub struct ProvisionerRegistry {
    default: Option<Arc<ProvisionerBinding>>,
    bindings: Vec<Arc<ProvisionerBinding>>,
    by_kind: HashMap<ResourceKind, Arc<ProvisionerBinding>>,
}

impl ProvisionerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(mut self, id: impl Into<String>, provisioner: Arc<dyn Provisioner>) -> Self {
        self.default = Some(Arc::new(ProvisionerBinding {
            id: id.into(),
            provisioner,
            kinds: Vec::new(),
        }));
        self
    }

    /// Bind `kinds` to `provisioner`.
    pub fn register(
        &mut self,
        id: impl Into<String>,
        provisioner: Arc<dyn Provisioner>,
        kinds: Vec<ResourceKind>,
    ) -> Result<()> {
        let id = id.into();
        for kind in &kinds {
            if let Some(existing) = self.by_kind.get(kind) {
                return Err(ProvisionerError::DuplicateBinding {
                    kind: *kind,
                    first: existing.id.clone(),
                    second: id,
                });
            }
        }
        let binding = Arc::new(ProvisionerBinding {
            id,
            provisioner,
            kinds,
        });
        for kind in &binding.kinds {
            self.by_kind.insert(*kind, binding.clone());
        }
        self.bindings.push(binding);
        Ok(())
    }

    /// Build bindings from a plugin document.
    ///
    /// Builtin ids resolve through `builtins`; any other id needs a `url`.
    pub fn from_config(
        config: &PluginConfig,
        builtins: &HashMap<String, Arc<dyn Provisioner>>,
    ) -> Result<Self> {
        config.validate()?;
        let resolve = |id: &str| -> Result<Arc<dyn Provisioner>> {
            if let Some(provisioner) = builtins.get(id) {
                return Ok(provisioner.clone());
            }
            let url = config
                .plugins
                .iter()
                .find(|p| p.id == id)
                .and_then(|p| p.url.clone())
                .ok_or_else(|| ProvisionerError::UnknownProvisioner(id.to_string()))?;
            let plugin =
                PluginProvisioner::new(id, PluginProvisionerConfig::default().with_url(url))?;
            Ok(Arc::new(plugin))
        };

        let mut registry = Self::new();
        for plugin in &config.plugins {
            registry.register(plugin.id.clone(), resolve(&plugin.id)?, plugin.resources.clone())?;
        }
        if let Some(default) = &config.default {
            registry = registry.with_default(default.clone(), resolve(default)?);
        }
        Ok(registry)
    }

    pub fn bindings(&self) -> &[Arc<ProvisionerBinding>] {
        &self.bindings
    }

    /// The explicit binding for `kind`, else the default.
    pub fn binding_for(&self, kind: ResourceKind) -> Option<Arc<ProvisionerBinding>> {
        self.by_kind
            .get(&kind)
            .cloned()
            .or_else(|| self.default.clone())
    }

    /// Group the module's resources by binding, in execution order.
    fn groups(&self, desired: &Module, previous: Option<&Module>) -> Result<Vec<Group>> {
        let previous = previous.map(get_provisioned).unwrap_or_default();
        let mut groups: BTreeMap<String, Group> = BTreeMap::new();

        for resource in get_provisioned(desired).into_values() {
            let binding = self
                .binding_for(resource.kind)
                .ok_or_else(|| ProvisionerError::UnsupportedKind {
                    provisioner: "registry".to_string(),
                    kind: resource.kind,
                })?;
            let changed = previous.get(&resource.resource_id) != Some(&resource);
            let group = groups.entry(binding.id.clone()).or_insert_with(|| Group {
                binding,
                resources: Vec::new(),
                changed: false,
            });
            group.changed |= changed;
            group.resources.push(resource);
        }

        Ok(order_groups(groups))
    }

    /// Build the deployment converging `desired`.
    ///
    /// Bindings whose resources are all unchanged get no task.
    pub fn create_deployment(
        &self,
        cluster_id: &str,
        desired: Module,
        previous: Option<Module>,
        settings: &EngineSettings,
        clock: Arc<LogicalClock>,
        cancel: CancellationToken,
    ) -> Result<Deployment> {
        let tasks = self
            .groups(&desired, previous.as_ref())?
            .into_iter()
            .filter(|g| g.changed)
            .map(|g| {
                let kinds = g.kinds();
                Task::new(g.binding, kinds)
            })
            .collect::<Vec<_>>();
        debug!(
            module = %desired.name,
            tasks = ?tasks.iter().map(|t| t.provisioner_id()).collect::<Vec<_>>(),
            "Tasks ordered"
        );
        Ok(Deployment::new(
            cluster_id,
            desired,
            previous,
            tasks,
            settings.clone(),
            clock,
            cancel,
        ))
    }

    /// Dry run: what each bound provisioner would change.
    pub async fn plan(
        &self,
        cluster_id: &str,
        desired: &Module,
        previous: Option<&Module>,
    ) -> Result<String> {
        let mut sections = Vec::new();
        for group in self.groups(desired, previous)? {
            if !group.changed {
                continue;
            }
            let request = ProvisionRequest {
                cluster_id: cluster_id.to_string(),
                module_name: desired.name.clone(),
                desired_module: desired.clone(),
                previous_module: previous.cloned(),
                kinds: group.kinds(),
            };
            let plan = group.binding.provisioner.plan(request).await?;
            if !plan.is_empty() {
                sections.push(format!("[{}]\n{}", group.binding.id, plan));
            }
        }
        Ok(sections.join("\n"))
    }
}

/// Order groups so that a group runs after every group it depends on.
///
/// Ties go to the lower provisioner id. Groups caught in a dependency cycle
/// run last, in id order.
fn order_groups(groups: BTreeMap<String, Group>) -> Vec<Group> {
    let owner: HashMap<&str, &str> = groups
        .iter()
        .flat_map(|(id, g)| {
            g.resources
                .iter()
                .map(move |r| (r.resource_id.as_str(), id.as_str()))
        })
        .collect();

    let mut after: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (id, group) in &groups {
        let deps = group
            .resources
            .iter()
            .flat_map(|r| r.dependencies.iter())
            .filter_map(|d| owner.get(d.id.as_str()).copied())
            .filter(|owner| *owner != id.as_str())
            .map(str::to_string)
            .collect();
        after.insert(id.clone(), deps);
    }

    let mut order = Vec::with_capacity(groups.len());
    loop {
        let next = after
            .iter()
            .find(|(_, deps)| deps.is_empty())
            .map(|(id, _)| id.clone());
        let Some(next) = next else {
            break;
        };
        after.remove(&next);
        for deps in after.values_mut() {
            deps.remove(&next);
        }
        order.push(next);
    }
    if !after.is_empty() {
        warn!(groups = ?after.keys().collect::<Vec<_>>(), "Provisioner groups depend on each other");
        order.extend(after.into_keys());
    }

    let mut groups = groups;
    order
        .into_iter()
        .filter_map(|id| groups.remove(&id))
        .collect()
}

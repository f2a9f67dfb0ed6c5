//! Runtime state attached to a module and the events that mutate it.
//!
//! Every mutation to a module's runtime arrives as a [`RuntimeEvent`] stamped
//! with a logical clock. Each event key remembers the clock of its last
//! applied update; older stamps are ignored so replays are harmless.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Immutable facts about a module deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRuntimeBase {
    #[serde(default = "Utc::now")]
    pub create_time: DateTime<Utc>,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub image: String,
}

impl Default for ModuleRuntimeBase {
    fn default() -> Self {
        Self {
            create_time: Utc::now(),
            language: String::new(),
            os: String::new(),
            arch: String::new(),
            image: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRuntimeScaling {
    pub min_replicas: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRuntimeDeployment {
    pub deployment_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConnections {
    pub read: String,
    pub write: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseRuntime {
    pub connections: Option<DatabaseConnections>,
    /// Digest of the last migration archive applied to this database.
    pub migration_digest: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicRuntime {
    pub topic_id: String,
    pub brokers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRuntime {
    pub topic_id: String,
    pub consumer_group: String,
    pub brokers: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerbRuntime {
    pub subscription: Option<SubscriptionRuntime>,
}

/// Runtime state of a module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleRuntime {
    pub base: ModuleRuntimeBase,
    pub scaling: Option<ModuleRuntimeScaling>,
    pub deployment: Option<ModuleRuntimeDeployment>,
    pub databases: BTreeMap<String, DatabaseRuntime>,
    pub topics: BTreeMap<String, TopicRuntime>,
    pub verbs: BTreeMap<String, VerbRuntime>,
    /// Last applied clock per event key.
    pub clocks: BTreeMap<String, u64>,
}

impl ModuleRuntime {
    pub fn deployment_key(&self) -> Option<&str> {
        self.deployment.as_ref().map(|d| d.deployment_key.as_str())
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.deployment.as_ref().and_then(|d| d.endpoint.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleRuntimeEvent {
    Base(ModuleRuntimeBase),
    Scaling(ModuleRuntimeScaling),
    Deployment(ModuleRuntimeDeployment),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseRuntimeEvent {
    pub id: String,
    #[serde(default)]
    pub connections: Option<DatabaseConnections>,
    #[serde(default)]
    pub migration_digest: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicRuntimeEvent {
    pub id: String,
    pub topic_id: String,
    pub brokers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerbRuntimeEvent {
    pub id: String,
    pub subscription: Option<SubscriptionRuntime>,
}

/// A partial update to a module's runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeEvent {
    Module(ModuleRuntimeEvent),
    Database(DatabaseRuntimeEvent),
    Topic(TopicRuntimeEvent),
    Verb(VerbRuntimeEvent),
}

impl RuntimeEvent {
    /// Key under which this event's clock is tracked.
    pub fn key(&self) -> String {
        match self {
            RuntimeEvent::Module(ModuleRuntimeEvent::Base(_)) => "module.base".to_string(),
            RuntimeEvent::Module(ModuleRuntimeEvent::Scaling(_)) => "module.scaling".to_string(),
            RuntimeEvent::Module(ModuleRuntimeEvent::Deployment(_)) => {
                "module.deployment".to_string()
            }
            RuntimeEvent::Database(e) => format!("database.{}", e.id),
            RuntimeEvent::Topic(e) => format!("topic.{}", e.id),
            RuntimeEvent::Verb(e) => format!("verb.{}", e.id),
        }
    }

    fn apply_to(&self, runtime: &mut ModuleRuntime) {
        match self {
            RuntimeEvent::Module(ModuleRuntimeEvent::Base(base)) => runtime.base = base.clone(),
            RuntimeEvent::Module(ModuleRuntimeEvent::Scaling(scaling)) => {
                runtime.scaling = Some(scaling.clone())
            }
            RuntimeEvent::Module(ModuleRuntimeEvent::Deployment(deployment)) => {
                runtime.deployment = Some(deployment.clone())
            }
            RuntimeEvent::Database(e) => {
                let db = runtime.databases.entry(e.id.clone()).or_default();
                if let Some(connections) = &e.connections {
                    db.connections = Some(connections.clone());
                }
                if let Some(digest) = &e.migration_digest {
                    db.migration_digest = Some(digest.clone());
                }
            }
            RuntimeEvent::Topic(e) => {
                runtime.topics.insert(
                    e.id.clone(),
                    TopicRuntime {
                        topic_id: e.topic_id.clone(),
                        brokers: e.brokers.clone(),
                    },
                );
            }
            RuntimeEvent::Verb(e) => {
                runtime.verbs.entry(e.id.clone()).or_default().subscription =
                    e.subscription.clone();
            }
        }
    }

    /// Apply to `runtime` if `clock` is newer than the key's last applied clock.
    ///
    /// Returns whether the event was applied.
    pub fn apply(&self, runtime: &mut ModuleRuntime, clock: u64) -> bool {
        let key = self.key();
        if let Some(last) = runtime.clocks.get(&key) {
            if *last >= clock {
                return false;
            }
        }
        self.apply_to(runtime);
        runtime.clocks.insert(key, clock);
        true
    }
}

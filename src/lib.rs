//! Provisioner - deployment control plane core
//!
//! Turns declared module schemas into provisioned infrastructure: splits
//! each module into resources, dispatches them to provisioner plugins,
//! polls the resulting tasks, folds their outputs back into the module and
//! publishes the observed schema to subscribers.

pub mod artefacts;
pub mod cloud;
pub mod config;
pub mod engine;
pub mod handlers;
pub mod modulecontext;
pub mod projectconfig;
pub mod provisioner;
pub mod rpc;
pub mod scaling;
pub mod schema;
pub mod schemaevents;
pub mod secrets;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod utils;

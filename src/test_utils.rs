//! Test utilities and mock implementations.
//!
//! Scripted provisioners and handlers for exercising the engine without real
//! databases, scalers or plugins, plus builders for common declarations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::provisioner::{
    HandlerContext, HandlerError, ProvisionRequest, ProvisionResponse, Provisioner,
    ProvisionerError, ResourceHandler, Result as ProvisionerResult, StatusResponse,
};
use crate::schema::{
    Database, DatabaseEngine, Decl, Metadata, Position, Provisioned, RuntimeEvent, Topic, Type,
    Verb,
};

/// Provisioner that records calls and answers from a script.
///
/// Each submitted token reports `Running` until `running_for` has elapsed
/// since submission, then `Success` with the configured events.
#[derive(Default)]
pub struct MockProvisioner {
    provisions: RwLock<Vec<ProvisionRequest>>,
    status_calls: RwLock<Vec<Instant>>,
    submitted: RwLock<HashMap<String, Instant>>,
    events: RwLock<Vec<RuntimeEvent>>,
    running_for: RwLock<Duration>,
    fail_provision: RwLock<Option<String>>,
    fail_status: RwLock<Option<String>>,
    no_changes: AtomicBool,
    counter: AtomicUsize,
}

impl MockProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(self, events: Vec<RuntimeEvent>) -> Self {
        Self {
            events: RwLock::new(events),
            ..self
        }
    }

    pub fn with_running_for(self, running_for: Duration) -> Self {
        Self {
            running_for: RwLock::new(running_for),
            ..self
        }
    }

    /// Fail every `provision` call with a transport error.
    pub async fn set_fail_provision(&self, message: Option<&str>) {
        *self.fail_provision.write().await = message.map(str::to_string);
    }

    /// Report every token as `Failed` with `message`.
    pub async fn set_fail_status(&self, message: Option<&str>) {
        *self.fail_status.write().await = message.map(str::to_string);
    }

    pub fn set_no_changes(&self, no_changes: bool) {
        self.no_changes.store(no_changes, Ordering::SeqCst);
    }

    pub async fn provisions(&self) -> Vec<ProvisionRequest> {
        self.provisions.read().await.clone()
    }

    /// Instants at which `status` was called.
    pub async fn status_calls(&self) -> Vec<Instant> {
        self.status_calls.read().await.clone()
    }
}

#[async_trait]
impl Provisioner for MockProvisioner {
    async fn ping(&self) -> ProvisionerResult<()> {
        Ok(())
    }

    async fn provision(&self, request: ProvisionRequest) -> ProvisionerResult<ProvisionResponse> {
        self.provisions.write().await.push(request);
        if let Some(message) = self.fail_provision.read().await.clone() {
            return Err(ProvisionerError::Transport(message));
        }
        if self.no_changes.load(Ordering::SeqCst) {
            return Ok(ProvisionResponse::NoChanges);
        }
        let token = format!("mock-{}", self.counter.fetch_add(1, Ordering::SeqCst));
        self.submitted
            .write()
            .await
            .insert(token.clone(), Instant::now());
        Ok(ProvisionResponse::Submitted { token })
    }

    async fn status(
        &self,
        token: &str,
        _desired_module: &crate::schema::Module,
    ) -> ProvisionerResult<StatusResponse> {
        self.status_calls.write().await.push(Instant::now());
        if let Some(message) = self.fail_status.read().await.clone() {
            return Ok(StatusResponse::Failed { message });
        }
        let Some(submitted) = self.submitted.read().await.get(token).copied() else {
            return Ok(StatusResponse::Failed {
                message: format!("unknown token: {}", token),
            });
        };
        if submitted.elapsed() < *self.running_for.read().await {
            return Ok(StatusResponse::Running);
        }
        self.submitted.write().await.remove(token);
        Ok(StatusResponse::Success {
            events: self.events.read().await.clone(),
        })
    }
}

/// Handler returning a fixed outcome after an optional delay.
pub struct ScriptedHandler {
    outcome: std::result::Result<Option<RuntimeEvent>, String>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedHandler {
    pub fn emitting(event: Option<RuntimeEvent>) -> Self {
        Self {
            outcome: Ok(event),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Fails every call with a database error carrying `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            outcome: Err(message.into()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceHandler for ScriptedHandler {
    async fn provision(
        &self,
        _ctx: &HandlerContext,
        _resource: &Provisioned,
        _previous: Option<&Provisioned>,
    ) -> std::result::Result<Option<RuntimeEvent>, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.outcome.clone().map_err(HandlerError::Database)
    }
}

pub fn database_decl(name: &str, engine: DatabaseEngine, metadata: Vec<Metadata>) -> Decl {
    Decl::Database(Database {
        name: name.to_string(),
        engine,
        metadata,
        pos: Position::default(),
    })
}

pub fn topic_decl(name: &str, event: Type) -> Decl {
    Decl::Topic(Topic {
        name: name.to_string(),
        export: true,
        event,
        metadata: Vec::new(),
        pos: Position::default(),
    })
}

pub fn verb_decl(name: &str, metadata: Vec<Metadata>) -> Decl {
    Decl::Verb(Verb {
        name: name.to_string(),
        export: true,
        request: Type::Unit,
        response: Type::Unit,
        metadata,
        pos: Position::default(),
    })
}

/// Tar archive holding `files` as regular entries.
pub fn tar_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        if let Err(err) = builder.append_data(&mut header, path, *content) {
            panic!("appending {} to test archive: {}", path, err);
        }
    }
    match builder.into_inner() {
        Ok(bytes) => bytes,
        Err(err) => panic!("finishing test archive: {}", err),
    }
}

/// Handler context for `module` with a fresh cancellation scope.
pub fn handler_context(module: crate::schema::Module) -> HandlerContext {
    HandlerContext {
        cluster_id: "test".to_string(),
        module,
        cancel: tokio_util::sync::CancellationToken::new(),
    }
}

//! Observer hook pipeline.
//!
//! Hooks are four independent capability traits; a collaborator implements
//! any subset and registers them in a [`Hooks`] set. For every captured
//! exchange the stages run strictly in order — pre-process, process,
//! post-process, error-handle — against the same snapshot. A failing stage
//! is recorded in the snapshot's error list and the remaining stages still
//! run; the error handler fires last, only when the list is non-empty.
//!
//! Hooks are `async fn`s and inherit the exchange's ambient cancellation:
//! dropping the wrapped call's future cancels whichever stage is running.

use crate::error::{BoxError, CaptureError, ErrorList, HookStage};
use crate::snapshot::ExchangeSnapshot;
use async_trait::async_trait;
use std::sync::Arc;

/// Rewrites the captured exchange before later stages observe it, e.g.
/// redacting sensitive fields or normalizing payloads.
#[async_trait]
pub trait PreProcess: Send + Sync {
    async fn pre_process(&self, snapshot: &mut ExchangeSnapshot) -> Result<(), BoxError>;
}

/// The primary observer — typically persistence or forwarding.
#[async_trait]
pub trait Process: Send + Sync {
    async fn process(&self, snapshot: &mut ExchangeSnapshot) -> Result<(), BoxError>;
}

/// Secondary observer, running after the primary one.
#[async_trait]
pub trait PostProcess: Send + Sync {
    async fn post_process(&self, snapshot: &mut ExchangeSnapshot) -> Result<(), BoxError>;
}

/// Receives every error collected over the exchange once all other stages
/// have run. May not fail; it has no return value.
#[async_trait]
pub trait ErrorHandle: Send + Sync {
    async fn error_handle(&self, errors: &ErrorList);
}

/// Immutable set of configured hooks, established once and shared by every
/// exchange a wrapper observes.
///
/// Any subset may be present; a missing hook is a no-op stage. Cloning is
/// cheap (one `Arc` per registered hook).
///
/// # Example
///
/// ```rust,ignore
/// let hooks = Hooks::new()
///     .pre_process(RedactAuthHeaders)
///     .process(StoreInDatabase::new(pool))
///     .error_handle(LogErrors);
/// ```
#[derive(Clone, Default)]
pub struct Hooks {
    pre_process: Option<Arc<dyn PreProcess>>,
    process: Option<Arc<dyn Process>>,
    post_process: Option<Arc<dyn PostProcess>>,
    error_handle: Option<Arc<dyn ErrorHandle>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pre_process(mut self, hook: impl PreProcess + 'static) -> Self {
        self.pre_process = Some(Arc::new(hook));
        self
    }

    pub fn process(mut self, hook: impl Process + 'static) -> Self {
        self.process = Some(Arc::new(hook));
        self
    }

    pub fn post_process(mut self, hook: impl PostProcess + 'static) -> Self {
        self.post_process = Some(Arc::new(hook));
        self
    }

    pub fn error_handle(mut self, hook: impl ErrorHandle + 'static) -> Self {
        self.error_handle = Some(Arc::new(hook));
        self
    }

    /// Run the stages in fixed order against one snapshot.
    pub(crate) async fn run(&self, snapshot: &mut ExchangeSnapshot) {
        if let Some(hook) = &self.pre_process {
            if let Err(err) = hook.pre_process(snapshot).await {
                tracing::warn!(stage = %HookStage::PreProcess, error = %err, "pipeline stage failed");
                snapshot.push_error(CaptureError::stage(HookStage::PreProcess, err));
            }
        }

        if let Some(hook) = &self.process {
            if let Err(err) = hook.process(snapshot).await {
                tracing::warn!(stage = %HookStage::Process, error = %err, "pipeline stage failed");
                snapshot.push_error(CaptureError::stage(HookStage::Process, err));
            }
        }

        if let Some(hook) = &self.post_process {
            if let Err(err) = hook.post_process(snapshot).await {
                tracing::warn!(stage = %HookStage::PostProcess, error = %err, "pipeline stage failed");
                snapshot.push_error(CaptureError::stage(HookStage::PostProcess, err));
            }
        }

        if !snapshot.errors.is_empty() {
            if let Some(hook) = &self.error_handle {
                hook.error_handle(&snapshot.errors).await;
            }
        }
    }
}

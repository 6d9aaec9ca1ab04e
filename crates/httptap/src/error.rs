//! Error types for exchange capture

use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};
use std::fmt;
use thiserror::Error;

/// Boxed error type used at hook and body boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The pipeline stage a [`CaptureError::Stage`] failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    PreProcess,
    Process,
    PostProcess,
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookStage::PreProcess => f.write_str("pre-process"),
            HookStage::Process => f.write_str("process"),
            HookStage::PostProcess => f.write_str("post-process"),
        }
    }
}

/// An error recorded while capturing an exchange or running the hook
/// pipeline.
///
/// These never propagate to the wrapped call's caller. They accumulate in
/// the snapshot's [`ErrorList`] and are handed to the registered
/// `ErrorHandle` hook, if any.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// A body read, multipart parse, or capture encoding failed.
    #[error("extraction failed: {0}")]
    Extraction(#[source] BoxError),

    /// A pipeline hook returned an error.
    #[error("{stage} hook failed: {source}")]
    Stage {
        stage: HookStage,
        #[source]
        source: BoxError,
    },

    /// The field accessor was used on a non-multipart exchange.
    #[error("request is not multipart/form-data")]
    NotMultipart,

    /// The captured body did not decode back into the expected shape.
    #[error("captured multipart body did not decode: {0}")]
    Decode(String),

    /// The wrapped call itself failed. Recorded so the error handler sees
    /// it; the failure is still returned to the caller unchanged.
    #[error("upstream call failed: {0}")]
    Upstream(String),
}

impl CaptureError {
    /// Wrap a read/parse/encode failure as an extraction error.
    pub fn extraction(err: impl Into<BoxError>) -> Self {
        CaptureError::Extraction(err.into())
    }

    /// Wrap a hook failure, tagged with the stage it came from.
    pub fn stage(stage: HookStage, source: BoxError) -> Self {
        CaptureError::Stage { stage, source }
    }
}

/// Append-only list of [`CaptureError`]s collected over one exchange.
///
/// The list itself satisfies the error contract: `Display` joins the
/// individual messages, so it can be handed to any consumer expecting a
/// single error value. Entries are never cleared; a later-stage error
/// never erases an earlier one.
#[derive(Debug, Default)]
pub struct ErrorList(Vec<CaptureError>);

impl ErrorList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, err: CaptureError) {
        self.0.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CaptureError> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[CaptureError] {
        &self.0
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for err in &self.0 {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{err}")?;
            first = false;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorList {}

impl Serialize for ErrorList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for err in &self.0 {
            seq.serialize_element(&err.to_string())?;
        }
        seq.end()
    }
}

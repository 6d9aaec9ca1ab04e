//! Capture HTTP exchanges on either side of the wire and feed them
//! through an observer pipeline.
//!
//! httptap wraps an existing HTTP call path — a `tower::Service` used as
//! an outbound client transport, or an inbound handler — and records a
//! replayable [`ExchangeSnapshot`] of each request/response pair: URL,
//! method, status, headers, raw bodies, a caller-assigned event label,
//! the elapsed wall time and any errors collected along the way.
//! Multipart form bodies are additionally decoded into a structured JSON
//! form so file uploads survive capture.
//!
//! Captured snapshots flow through a [`Hooks`] pipeline of up to three
//! stages (pre-process, process, post-process) plus an error handler.
//! Capture is strictly observational: the wrapped call sees the same
//! request, the caller gets the same response and error, and a failing
//! hook is recorded rather than propagated.
//!
//! # Outbound
//!
//! ```rust,ignore
//! use httptap::{Hooks, TransportLayer};
//! use tower::Layer;
//!
//! let transport = TransportLayer::new()
//!     .hooks(Hooks::new().process(PersistExchange::new(pool)))
//!     .event_label("billing-api")
//!     .layer(http_client);
//! ```
//!
//! # Inbound
//!
//! ```rust,ignore
//! use httptap::{CaptureLayer, EventLabelLayer, Hooks};
//! use tower::Layer;
//!
//! let service = CaptureLayer::new()
//!     .hooks(Hooks::new().process(PersistExchange::new(pool)))
//!     .layer(EventLabelLayer::new("login").layer(handler));
//! ```

mod body;
mod client;
mod error;
mod middleware;
mod multipart;
mod pipeline;
mod snapshot;

pub use body::reify;
pub use client::{Transport, TransportLayer};
pub use error::{BoxError, CaptureError, ErrorList, HookStage};
pub use middleware::{
    CaptureHandle, CaptureLayer, CaptureService, EventLabelLayer, EventLabelService,
    PreProcessLayer, PreProcessService,
};
pub use multipart::{FormValue, MultipartFile, MAX_PART_SIZE};
pub use pipeline::{ErrorHandle, Hooks, PostProcess, PreProcess, Process};
pub use snapshot::{ExchangeSnapshot, HeaderValues, Payload};

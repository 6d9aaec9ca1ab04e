//! Outbound call wrapper.
//!
//! [`Transport`] is a `tower::Service` middleware around an inner call
//! executor. Each call is captured into an [`ExchangeSnapshot`] — request
//! side before the call, response side after it returns — and the snapshot
//! is run through the configured hook pipeline. The inner service's result
//! is returned to the caller untouched, except that the response body is
//! replaced with an equivalent unconsumed one.

use crate::error::{BoxError, CaptureError};
use crate::pipeline::Hooks;
use crate::snapshot::ExchangeSnapshot;
use bytes::Bytes;
use http_body::Body;
use http_body_util::Full;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tower::Layer;
use tower_service::Service;

/// Captures every exchange an inner call executor performs.
///
/// # Example
///
/// ```rust,ignore
/// use httptap::{Hooks, Transport};
///
/// let client = Transport::new(http_client)
///     .hooks(Hooks::new().process(StoreInDatabase::new(pool)))
///     .event_label("billing-api");
/// ```
pub struct Transport<S> {
    inner: S,
    hooks: Hooks,
    event_label: Option<String>,
}

impl<S> Transport<S> {
    /// Wrap an inner call executor with no hooks configured.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            hooks: Hooks::new(),
            event_label: None,
        }
    }

    /// Replace the configured hook set.
    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Tag every captured exchange with a caller-assigned label.
    pub fn event_label(mut self, label: impl Into<String>) -> Self {
        self.event_label = Some(label.into());
        self
    }
}

impl<S: Clone> Clone for Transport<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            hooks: self.hooks.clone(),
            event_label: self.event_label.clone(),
        }
    }
}

impl<S, ReqB, ResB> Service<http::Request<ReqB>> for Transport<S>
where
    S: Service<http::Request<Full<Bytes>>, Response = http::Response<ResB>>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
    S::Error: fmt::Display + Send,
    ReqB: Body + Send + 'static,
    ReqB::Data: Send,
    ReqB::Error: Into<BoxError>,
    ResB: Body + Send + 'static,
    ResB::Data: Send,
    ResB::Error: Into<BoxError>,
{
    type Response = http::Response<Full<Bytes>>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<ReqB>) -> Self::Future {
        // The readied service is the one we drive; the clone goes back in.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let hooks = self.hooks.clone();
        let event_label = self.event_label.clone();

        Box::pin(async move {
            let started = Instant::now();
            let mut snapshot = ExchangeSnapshot::new();
            if let Some(label) = event_label {
                snapshot.event_label = label;
            }

            let req = snapshot.extract_request(req).await;

            let result = match inner.call(req).await {
                Ok(response) => Ok(snapshot.extract_response(response).await),
                Err(err) => {
                    snapshot.push_error(CaptureError::Upstream(err.to_string()));
                    Err(err)
                }
            };

            snapshot.duration_nanos = started.elapsed().as_nanos() as u64;
            tracing::debug!(
                method = %snapshot.method,
                url = %snapshot.url,
                status = snapshot.status_code,
                duration_nanos = snapshot.duration_nanos,
                "captured outbound exchange"
            );

            hooks.run(&mut snapshot).await;

            result
        })
    }
}

/// `tower::Layer` producing [`Transport`], for composing the wrapper into
/// an existing client stack.
#[derive(Clone, Default)]
pub struct TransportLayer {
    hooks: Hooks,
    event_label: Option<String>,
}

impl TransportLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn event_label(mut self, label: impl Into<String>) -> Self {
        self.event_label = Some(label.into());
        self
    }
}

impl<S> Layer<S> for TransportLayer {
    type Service = Transport<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Transport {
            inner,
            hooks: self.hooks.clone(),
            event_label: self.event_label.clone(),
        }
    }
}

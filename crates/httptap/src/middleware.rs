//! Inbound handler wrapper.
//!
//! [`CaptureLayer`] is a `tower::Layer` around an application handler.
//! It buffers and captures the request, threads a per-exchange
//! [`CaptureHandle`] through the request extensions, finalizes the
//! response side once the handler returns, and runs the hook pipeline —
//! all without changing what the handler receives or what the client is
//! sent.
//!
//! Additional layers may sit between [`CaptureLayer`] and the handler:
//! [`EventLabelLayer`] stamps the exchange with a route label and
//! [`PreProcessLayer`] rewrites the snapshot before the outer pipeline's
//! process stage runs. Whichever of these layers observes the response
//! first performs the one finalization for the exchange; the others only
//! replay the body.

use crate::body::reify;
use crate::error::{BoxError, CaptureError, HookStage};
use crate::pipeline::{Hooks, PreProcess};
use crate::snapshot::{copy_headers, ExchangeSnapshot};
use bytes::Bytes;
use http_body::Body;
use http_body_util::Full;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::Mutex;
use tower::Layer;
use tower_service::Service;

/// Per-exchange capture state, carried through the composed middleware
/// chain in the request extensions.
///
/// The snapshot and the finalization flag travel together so that every
/// layer of one exchange sees the same state. Handlers may fetch the
/// handle from the request extensions to append application-level errors
/// or inspect the captured request.
pub struct CaptureHandle {
    snapshot: Mutex<ExchangeSnapshot>,
    finalized: AtomicBool,
}

impl CaptureHandle {
    fn new(snapshot: ExchangeSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
            finalized: AtomicBool::new(false),
        }
    }

    /// Fetch the handle a [`CaptureLayer`] placed in the request
    /// extensions, if any.
    pub fn from_extensions(extensions: &http::Extensions) -> Option<Arc<CaptureHandle>> {
        extensions.get::<Arc<CaptureHandle>>().cloned()
    }

    /// Whether the response side has already been recorded.
    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    /// Append an application-level error to the exchange.
    pub async fn append_error(&self, err: CaptureError) {
        self.snapshot.lock().await.push_error(err);
    }

    /// Stamp the exchange with a caller-assigned label.
    pub async fn set_event_label(&self, label: impl Into<String>) {
        self.snapshot.lock().await.event_label = label.into();
    }

    /// Run a closure against the snapshot under the handle's lock.
    pub async fn with_snapshot<R>(&self, f: impl FnOnce(&mut ExchangeSnapshot) -> R) -> R {
        f(&mut *self.snapshot.lock().await)
    }

    /// Record status, headers and body from the response — exactly once
    /// per exchange — and hand back the response with an equivalent
    /// unconsumed body. Calls after the first only replay the body.
    pub(crate) async fn finalize<B>(
        &self,
        response: http::Response<B>,
    ) -> http::Response<Full<Bytes>>
    where
        B: Body,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = response.into_parts();
        let (bytes, replay) = match reify(body).await {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(error = %err, "failed to buffer response body");
                self.append_error(err).await;
                (Bytes::new(), Full::new(Bytes::new()))
            }
        };

        if !self.finalized.swap(true, Ordering::SeqCst) {
            let mut snapshot = self.snapshot.lock().await;
            snapshot.status_code = parts.status.as_u16();
            snapshot.response.headers = copy_headers(&parts.headers);
            snapshot.response.body = bytes;
        }

        http::Response::from_parts(parts, replay)
    }

    async fn take_snapshot(&self) -> ExchangeSnapshot {
        std::mem::take(&mut *self.snapshot.lock().await)
    }
}

impl fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureHandle")
            .field("finalized", &self.is_finalized())
            .finish()
    }
}

/// Replay a response body without recording anything. Used when a
/// composed layer runs outside any [`CaptureLayer`].
async fn normalize<B>(response: http::Response<B>) -> http::Response<Full<Bytes>>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    let (parts, body) = response.into_parts();
    let replay = match reify(body).await {
        Ok((_, replay)) => replay,
        Err(err) => {
            tracing::warn!(error = %err, "failed to buffer response body");
            Full::new(Bytes::new())
        }
    };
    http::Response::from_parts(parts, replay)
}

/// Middleware that captures every exchange a wrapped handler serves.
///
/// # Example
///
/// ```rust,ignore
/// use httptap::{CaptureLayer, EventLabelLayer, Hooks};
/// use tower::Layer;
///
/// let service = CaptureLayer::new()
///     .hooks(Hooks::new().process(StoreInDatabase::new(pool)))
///     .layer(EventLabelLayer::new("login").layer(handler));
/// ```
#[derive(Clone, Default)]
pub struct CaptureLayer {
    hooks: Hooks,
    event_label: Option<String>,
}

impl CaptureLayer {
    pub fn new() -> Self {
        Self::default()
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

impl<S> Layer<S> for CaptureLayer {
    type Service = CaptureService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CaptureService {
            inner,
            hooks: self.hooks.clone(),
            event_label: self.event_label.clone(),
        }
    }
}

/// Service produced by [`CaptureLayer`].
pub struct CaptureService<S> {
    inner: S,
    hooks: Hooks,
    event_label: Option<String>,
}

impl<S: Clone> Clone for CaptureService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            hooks: self.hooks.clone(),
            event_label: self.event_label.clone(),
        }
    }
}

impl<S, ReqB, ResB> Service<http::Request<ReqB>> for CaptureService<S>
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

            let mut req = snapshot.extract_request(req).await;

            let handle = Arc::new(CaptureHandle::new(snapshot));
            req.extensions_mut().insert(handle.clone());

            let result = match inner.call(req).await {
                Ok(response) => Ok(handle.finalize(response).await),
                Err(err) => {
                    handle
                        .append_error(CaptureError::Upstream(err.to_string()))
                        .await;
                    Err(err)
                }
            };

            let mut snapshot = handle.take_snapshot().await;
            snapshot.duration_nanos = started.elapsed().as_nanos() as u64;
            tracing::debug!(
                method = %snapshot.method,
                url = %snapshot.url,
                status = snapshot.status_code,
                duration_nanos = snapshot.duration_nanos,
                "captured inbound exchange"
            );

            hooks.run(&mut snapshot).await;

            result
        })
    }
}

/// Composed layer that stamps the exchange's event label on the way out.
///
/// Must sit inside a [`CaptureLayer`]; when it observes the response
/// before any other layer it also performs the exchange's one
/// finalization.
#[derive(Clone)]
pub struct EventLabelLayer {
    label: String,
}

impl EventLabelLayer {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl<S> Layer<S> for EventLabelLayer {
    type Service = EventLabelService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        EventLabelService {
            inner,
            label: self.label.clone(),
        }
    }
}

/// Service produced by [`EventLabelLayer`].
#[derive(Clone)]
pub struct EventLabelService<S> {
    inner: S,
    label: String,
}

impl<S, ReqB, ResB> Service<http::Request<ReqB>> for EventLabelService<S>
where
    S: Service<http::Request<ReqB>, Response = http::Response<ResB>> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Send,
    ReqB: Send + 'static,
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
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let label = self.label.clone();
        let handle = CaptureHandle::from_extensions(req.extensions());

        Box::pin(async move {
            let response = inner.call(req).await?;

            match handle {
                Some(handle) => {
                    let response = handle.finalize(response).await;
                    handle.set_event_label(label).await;
                    Ok(response)
                }
                None => Ok(normalize(response).await),
            }
        })
    }
}

/// Composed layer that runs a [`PreProcess`] hook against the snapshot as
/// soon as the handler has returned, before the outer pipeline's process
/// stage observes it.
///
/// Must sit inside a [`CaptureLayer`]; when it observes the response
/// before any other layer it also performs the exchange's one
/// finalization.
pub struct PreProcessLayer {
    hook: Arc<dyn PreProcess>,
}

impl PreProcessLayer {
    pub fn new(hook: impl PreProcess + 'static) -> Self {
        Self {
            hook: Arc::new(hook),
        }
    }
}

impl Clone for PreProcessLayer {
    fn clone(&self) -> Self {
        Self {
            hook: self.hook.clone(),
        }
    }
}

impl<S> Layer<S> for PreProcessLayer {
    type Service = PreProcessService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        PreProcessService {
            inner,
            hook: self.hook.clone(),
        }
    }
}

/// Service produced by [`PreProcessLayer`].
pub struct PreProcessService<S> {
    inner: S,
    hook: Arc<dyn PreProcess>,
}

impl<S: Clone> Clone for PreProcessService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            hook: self.hook.clone(),
        }
    }
}

impl<S, ReqB, ResB> Service<http::Request<ReqB>> for PreProcessService<S>
where
    S: Service<http::Request<ReqB>, Response = http::Response<ResB>> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Send,
    ReqB: Send + 'static,
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
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let hook = self.hook.clone();
        let handle = CaptureHandle::from_extensions(req.extensions());

        Box::pin(async move {
            let response = inner.call(req).await?;

            match handle {
                Some(handle) => {
                    let response = handle.finalize(response).await;
                    let mut snapshot = handle.snapshot.lock().await;
                    if let Err(err) = hook.pre_process(&mut snapshot).await {
                        tracing::warn!(stage = %HookStage::PreProcess, error = %err, "pipeline stage failed");
                        snapshot.push_error(CaptureError::stage(HookStage::PreProcess, err));
                    }
                    drop(snapshot);
                    Ok(response)
                }
                None => Ok(normalize(response).await),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use http_body_util::BodyExt;
    use std::sync::Mutex as StdMutex;
    use tower::{service_fn, ServiceExt};

    #[derive(Clone)]
    struct Stash(Arc<StdMutex<Option<serde_json::Value>>>);

    impl Stash {
        fn new() -> Self {
            Self(Arc::new(StdMutex::new(None)))
        }

        fn take(&self) -> serde_json::Value {
            self.0.lock().unwrap().take().expect("process hook never ran")
        }
    }

    #[async_trait]
    impl crate::pipeline::Process for Stash {
        async fn process(&self, snapshot: &mut ExchangeSnapshot) -> Result<(), BoxError> {
            *self.0.lock().unwrap() = Some(serde_json::to_value(&*snapshot)?);
            Ok(())
        }
    }

    fn ok_handler(
        status: u16,
        body: &'static [u8],
    ) -> impl Service<
        http::Request<Full<Bytes>>,
        Response = http::Response<Full<Bytes>>,
        Error = std::io::Error,
        Future = impl Send,
    > + Clone
           + Send {
        service_fn(move |_req: http::Request<Full<Bytes>>| async move {
            Ok(http::Response::builder()
                .status(status)
                .body(Full::new(Bytes::from_static(body)))
                .unwrap())
        })
    }

    #[tokio::test]
    async fn captures_a_full_inbound_exchange() {
        let stash = Stash::new();
        let service = CaptureLayer::new()
            .hooks(Hooks::new().process(stash.clone()))
            .event_label("create")
            .layer(ok_handler(201, b"{\"ok\":true}"));

        let req = http::Request::builder()
            .method("POST")
            .uri("/items")
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from_static(b"{\"a\":1}")))
            .unwrap();

        let response = service.oneshot(req).await.unwrap();
        assert_eq!(response.status(), 201);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"{\"ok\":true}"));

        let seen = stash.take();
        assert_eq!(seen["method"], "POST");
        assert_eq!(seen["url"], "/items");
        assert_eq!(seen["statusCode"], 201);
        assert_eq!(seen["eventLabel"], "create");
        assert_eq!(seen["errors"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn handler_sees_the_original_request_body() {
        let received = Arc::new(StdMutex::new(Bytes::new()));
        let received_clone = received.clone();

        let handler = service_fn(move |req: http::Request<Full<Bytes>>| {
            let received = received_clone.clone();
            async move {
                let body = req.into_body().collect().await.unwrap().to_bytes();
                *received.lock().unwrap() = body;
                Ok::<_, std::io::Error>(
                    http::Response::builder()
                        .status(200)
                        .body(Full::new(Bytes::new()))
                        .unwrap(),
                )
            }
        });

        let service = CaptureLayer::new().layer(handler);
        let req = http::Request::builder()
            .method("POST")
            .uri("/echo")
            .body(Full::new(Bytes::from_static(b"raw payload bytes")))
            .unwrap();

        service.oneshot(req).await.unwrap();
        assert_eq!(
            *received.lock().unwrap(),
            Bytes::from_static(b"raw payload bytes")
        );
    }

    #[tokio::test]
    async fn event_label_layer_stamps_the_snapshot() {
        let stash = Stash::new();
        let service = CaptureLayer::new()
            .hooks(Hooks::new().process(stash.clone()))
            .layer(EventLabelLayer::new("login").layer(ok_handler(200, b"ok")));

        let req = http::Request::builder()
            .uri("/login")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let response = service.oneshot(req).await.unwrap();
        assert_eq!(response.status(), 200);

        let seen = stash.take();
        assert_eq!(seen["eventLabel"], "login");
        assert_eq!(seen["statusCode"], 200);
    }

    #[tokio::test]
    async fn double_wrapping_finalizes_exactly_once() {
        struct RewriteResponse;

        #[async_trait]
        impl PreProcess for RewriteResponse {
            async fn pre_process(&self, snapshot: &mut ExchangeSnapshot) -> Result<(), BoxError> {
                snapshot.response.body = Bytes::from_static(b"[redacted]");
                Ok(())
            }
        }

        let stash = Stash::new();
        // Both the inner layers and the outer capture service observe the
        // response; only the innermost may record it.
        let service = CaptureLayer::new()
            .hooks(Hooks::new().process(stash.clone()))
            .layer(
                PreProcessLayer::new(RewriteResponse)
                    .layer(EventLabelLayer::new("tagged").layer(ok_handler(200, b"secret"))),
            );

        let req = http::Request::builder()
            .uri("/secret")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let response = service.oneshot(req).await.unwrap();
        // the client still gets the real body
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"secret"));

        // had a later layer re-finalized, the rewrite would have been
        // overwritten with the raw body again
        let seen = stash.take();
        let redacted = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            b"[redacted]",
        );
        assert_eq!(seen["response"]["body"], redacted);
        assert_eq!(seen["eventLabel"], "tagged");
    }

    #[tokio::test]
    async fn handle_append_error_reaches_the_pipeline() {
        let stash = Stash::new();

        let handler = service_fn(move |req: http::Request<Full<Bytes>>| async move {
            if let Some(handle) = CaptureHandle::from_extensions(req.extensions()) {
                handle
                    .append_error(CaptureError::Decode("handler-side complaint".into()))
                    .await;
            }
            Ok::<_, std::io::Error>(
                http::Response::builder()
                    .status(500)
                    .body(Full::new(Bytes::new()))
                    .unwrap(),
            )
        });

        let service = CaptureLayer::new()
            .hooks(Hooks::new().process(stash.clone()))
            .layer(handler);

        let req = http::Request::builder()
            .uri("/broken")
            .body(Full::new(Bytes::new()))
            .unwrap();

        service.oneshot(req).await.unwrap();

        let seen = stash.take();
        assert_eq!(seen["statusCode"], 500);
        let errors = seen["errors"].as_array().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0]
            .as_str()
            .unwrap()
            .contains("handler-side complaint"));
    }

    #[tokio::test]
    async fn composed_layer_without_capture_passes_through() {
        let service = EventLabelLayer::new("orphan").layer(ok_handler(200, b"still works"));

        let req = http::Request::builder()
            .uri("/orphan")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let response = service.oneshot(req).await.unwrap();
        assert_eq!(response.status(), 200);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"still works"));
    }
}

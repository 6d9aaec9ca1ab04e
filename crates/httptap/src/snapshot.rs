//! Passive data model for one captured exchange.

use crate::body::reify;
use crate::error::{BoxError, CaptureError, ErrorList};
use crate::multipart;
use bytes::Bytes;
use http_body::Body;
use http_body_util::Full;
use serde::Serialize;
use std::collections::BTreeMap;

/// Copied header map: one-or-many values per lowercased field name.
///
/// Header names are case-insensitive on the wire; the copy normalizes them
/// to lowercase so lookups on the snapshot do not depend on the sender's
/// casing.
pub type HeaderValues = BTreeMap<String, Vec<String>>;

/// One side of an exchange: the headers and body actually seen on the
/// wire, or — for multipart submissions — the structured reconstruction
/// stored in place of the raw multipart body.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Payload {
    pub headers: HeaderValues,
    #[serde(with = "b64")]
    pub body: Bytes,
}

/// The captured record of one request/response pair.
///
/// Created when a wrapper observes a call, mutated in place by capture and
/// the hook pipeline, and dropped once the pipeline finishes. Each
/// snapshot is exclusively owned by the task handling its exchange.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeSnapshot {
    pub request: Payload,
    pub response: Payload,
    pub url: String,
    pub method: String,
    pub status_code: u16,
    pub duration_nanos: u64,
    pub event_label: String,
    pub errors: ErrorList,
}

impl ExchangeSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an error. Earlier entries are never disturbed.
    pub fn push_error(&mut self, err: CaptureError) {
        self.errors.push(err);
    }

    /// Capture the request side and hand back an equivalent request whose
    /// body is unconsumed.
    ///
    /// Extraction failures are recorded in the error list, never returned:
    /// the wrapped call proceeds with whatever bytes were salvaged, or an
    /// empty body if nothing was read.
    pub(crate) async fn extract_request<B>(
        &mut self,
        req: http::Request<B>,
    ) -> http::Request<Full<Bytes>>
    where
        B: Body,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = req.into_parts();
        self.url = parts.uri.to_string();
        self.method = parts.method.to_string();
        self.request.headers = copy_headers(&parts.headers);

        let (bytes, replay) = match reify(body).await {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(error = %err, "failed to buffer request body");
                self.push_error(err);
                (Bytes::new(), Full::new(Bytes::new()))
            }
        };

        if multipart::is_multipart(&parts.headers) {
            // The wrapped call parses the form itself from the replayed
            // bytes; only the capture sees the structured reconstruction.
            match multipart::reconstruct(&parts.headers, bytes).await {
                Ok(structured) => self.request.body = structured,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to reconstruct multipart form");
                    self.push_error(err);
                }
            }
        } else {
            self.request.body = bytes;
        }

        http::Request::from_parts(parts, replay)
    }

    /// Capture the response side; same replacement contract as requests.
    pub(crate) async fn extract_response<B>(
        &mut self,
        response: http::Response<B>,
    ) -> http::Response<Full<Bytes>>
    where
        B: Body,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = response.into_parts();
        self.status_code = parts.status.as_u16();
        self.response.headers = copy_headers(&parts.headers);

        let (bytes, replay) = match reify(body).await {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(error = %err, "failed to buffer response body");
                self.push_error(err);
                (Bytes::new(), Full::new(Bytes::new()))
            }
        };
        self.response.body = bytes;

        http::Response::from_parts(parts, replay)
    }
}

/// Copy headers out of a live map so later in-place mutation by the
/// wrapped call cannot corrupt the snapshot. Values that are not valid
/// UTF-8 are skipped.
pub(crate) fn copy_headers(headers: &http::HeaderMap) -> HeaderValues {
    let mut copied = HeaderValues::new();
    for (name, value) in headers.iter() {
        if let Ok(value) = value.to_str() {
            copied
                .entry(name.as_str().to_ascii_lowercase())
                .or_default()
                .push(value.to_string());
        }
    }
    copied
}

/// Serde helper encoding raw bytes as base64 strings, keeping serialized
/// snapshots text-safe and round-trippable.
pub(crate) mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

//! Multipart reconstruction and field access.
//!
//! When a captured request announces `multipart/form-data`, the buffered
//! body bytes are parsed as a form and folded into a single JSON document
//! mapping each field name to its value(s): a scalar string, a sequence of
//! strings, a file entry, or a sequence of file entries. That document is
//! stored as the captured request body, so downstream consumers see one
//! uniform representation regardless of the original content type. The
//! wrapped call still receives the raw multipart bytes untouched and
//! parses the form itself.

use crate::error::CaptureError;
use crate::snapshot::ExchangeSnapshot;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use multer::{Constraints, Multipart, SizeLimit};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::Infallible;

/// Maximum in-memory size for a single form part.
pub const MAX_PART_SIZE: u64 = 32 * 1024 * 1024;

/// One file submitted under a form field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartFile {
    pub file_name: String,
    pub size: u64,
    #[serde(with = "crate::snapshot::b64")]
    pub content: Bytes,
}

/// Value of one form field in the structured reconstruction.
///
/// Single-valued fields stay scalar; repeated names become sequences in
/// submission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FormValue {
    Text(String),
    TextList(Vec<String>),
    File(MultipartFile),
    FileList(Vec<MultipartFile>),
}

/// Whether the headers announce a multipart form submission.
pub(crate) fn is_multipart(headers: &http::HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|ct| ct.contains("multipart/form-data"))
        .unwrap_or(false)
}

/// Parse a copy of `raw` as a multipart form and serialize the structured
/// field map.
///
/// Operates purely on the buffered bytes; the live stream was already
/// drained by reification and the caller keeps an equivalent replay for
/// the wrapped call.
pub(crate) async fn reconstruct(
    headers: &http::HeaderMap,
    raw: Bytes,
) -> Result<Bytes, CaptureError> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let boundary = multer::parse_boundary(content_type).map_err(CaptureError::extraction)?;

    let stream = futures_util::stream::once(async move { Ok::<Bytes, Infallible>(raw) });
    let constraints = Constraints::new().size_limit(SizeLimit::new().per_field(MAX_PART_SIZE));
    let mut form = Multipart::with_constraints(stream, boundary, constraints);

    let mut texts: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut files: BTreeMap<String, Vec<MultipartFile>> = BTreeMap::new();

    while let Some(field) = form
        .next_field()
        .await
        .map_err(CaptureError::extraction)?
    {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let content = field.bytes().await.map_err(CaptureError::extraction)?;

        match file_name {
            Some(file_name) => files.entry(name).or_default().push(MultipartFile {
                file_name,
                size: content.len() as u64,
                content,
            }),
            None => {
                let value = String::from_utf8_lossy(&content).into_owned();
                texts.entry(name).or_default().push(value);
            }
        }
    }

    let mut body: BTreeMap<String, FormValue> = BTreeMap::new();
    for (name, mut entries) in files {
        let value = if entries.len() == 1 {
            FormValue::File(entries.remove(0))
        } else {
            FormValue::FileList(entries)
        };
        body.insert(name, value);
    }
    // A non-file value under a reused name wins over file entries.
    for (name, mut values) in texts {
        let value = if values.len() == 1 {
            FormValue::Text(values.remove(0))
        } else {
            FormValue::TextList(values)
        };
        body.insert(name, value);
    }

    serde_json::to_vec(&body)
        .map(Bytes::from)
        .map_err(CaptureError::extraction)
}

impl ExchangeSnapshot {
    /// Decode the file entries captured under `field` from a structured
    /// multipart request body.
    ///
    /// Handles both encodings the reconstruction produces: a single file
    /// entry decodes first; on failure the sequence shape is attempted;
    /// only if both fail is a combined [`CaptureError::Decode`] returned.
    /// Fails with [`CaptureError::NotMultipart`] when the exchange did not
    /// carry a multipart submission.
    pub fn multipart_files(&self, field: &str) -> Result<Vec<MultipartFile>, CaptureError> {
        let announced = self
            .request
            .headers
            .get("content-type")
            .map(|values| values.iter().any(|v| v.contains("multipart/form-data")))
            .unwrap_or(false);
        if !announced {
            return Err(CaptureError::NotMultipart);
        }

        let body: BTreeMap<String, serde_json::Value> =
            serde_json::from_slice(&self.request.body).map_err(|err| {
                CaptureError::Decode(format!("captured body is not a JSON object: {err}"))
            })?;
        let value = body
            .get(field)
            .cloned()
            .ok_or_else(|| CaptureError::Decode(format!("no multipart field named `{field}`")))?;

        match serde_json::from_value::<MultipartFile>(value.clone()) {
            Ok(file) => Ok(vec![file]),
            Err(single_err) => serde_json::from_value::<Vec<MultipartFile>>(value).map_err(|seq_err| {
                CaptureError::Decode(format!(
                    "field `{field}` is neither a file entry ({single_err}) nor a sequence of entries ({seq_err})"
                ))
            }),
        }
    }
}

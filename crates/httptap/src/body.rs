//! Body reification: turn a one-shot body into a durable buffer plus an
//! equivalent unconsumed replacement.

use crate::error::{BoxError, CaptureError};
use bytes::Bytes;
use http_body::Body;
use http_body_util::{BodyExt, Full};

/// Read `body` fully into memory and return the captured bytes together
/// with a fresh body that replays exactly the same bytes.
///
/// The input must be finite and fit in memory; this is a capture tool, not
/// a streaming proxy for arbitrarily large bodies. A read failure surfaces
/// as [`CaptureError::Extraction`] and the original body is consumed either
/// way.
pub async fn reify<B>(body: B) -> Result<(Bytes, Full<Bytes>), CaptureError>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    let collected = body
        .collect()
        .await
        .map_err(|err| CaptureError::Extraction(err.into()))?;
    let bytes = collected.to_bytes();
    let replay = Full::new(bytes.clone());
    Ok((bytes, replay))
}

//! Streaming gateway: `/stream/{token}/{filename}`.
//!
//! The only auth on this surface is the stream token; renderers cannot
//! carry cookies. Token failures answer 401 outright, a redirect would
//! just confuse a ZonePlayer. Byte ranges are fully supported because
//! renderers seek by re-requesting with `Range:`.

use crate::token::StreamTokenIssuer;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use sabcache::{CacheFormat, CacheIndex};
use sabstore::{CacheEntry, CacheStatus};
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct StreamState {
    pub index: Arc<CacheIndex>,
    pub issuer: Arc<StreamTokenIssuer>,
}

pub fn stream_router(state: StreamState) -> Router {
    Router::new()
        .route("/stream/{token}/{filename}", get(stream_handler))
        .with_state(state)
}

/// Which artifact file of the entry a request names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactRef {
    Single { ext: String },
    Segment { index: u32, ext: String },
}

/// `audio.<ext>` or `segment_NNN.<ext>`; anything else is unknown.
pub fn parse_artifact_filename(filename: &str) -> Option<ArtifactRef> {
    let (stem, ext) = filename.rsplit_once('.')?;
    if ext.is_empty() || stem.is_empty() {
        return None;
    }

    if stem == "audio" {
        return Some(ArtifactRef::Single {
            ext: ext.to_string(),
        });
    }

    let digits = stem.strip_prefix("segment_")?;
    if digits.len() != 3 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(ArtifactRef::Segment {
        index: digits.parse().ok()?,
        ext: ext.to_string(),
    })
}

/// Checks the named file against the entry's recorded layout.
fn validate_artifact(entry: &CacheEntry, artifact: &ArtifactRef) -> Option<Option<u32>> {
    match artifact {
        ArtifactRef::Single { ext } => {
            if entry.is_segmented() || *ext != entry.cache_format {
                None
            } else {
                Some(None)
            }
        }
        ArtifactRef::Segment { index, ext } => {
            if !entry.is_segmented() || *ext != entry.cache_format || *index >= entry.segment_count
            {
                None
            } else {
                Some(Some(*index))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    Malformed,
    Unsatisfiable,
}

/// Parses a `Range: bytes=...` value against a resource of `size` bytes.
/// Returns the inclusive `(start, end)` pair. Only single ranges are
/// served.
pub fn parse_range(header: &str, size: u64) -> Result<(u64, u64), RangeError> {
    let spec = header.strip_prefix("bytes=").ok_or(RangeError::Malformed)?;
    if spec.contains(',') {
        return Err(RangeError::Malformed);
    }

    let (start_str, end_str) = spec.split_once('-').ok_or(RangeError::Malformed)?;

    if start_str.is_empty() {
        // Suffix form: last k bytes
        let k: u64 = end_str.parse().map_err(|_| RangeError::Malformed)?;
        if k == 0 || size == 0 {
            return Err(RangeError::Unsatisfiable);
        }
        let len = k.min(size);
        return Ok((size - len, size - 1));
    }

    let start: u64 = start_str.parse().map_err(|_| RangeError::Malformed)?;
    if start >= size {
        return Err(RangeError::Unsatisfiable);
    }

    let end = if end_str.is_empty() {
        size - 1
    } else {
        let end: u64 = end_str.parse().map_err(|_| RangeError::Malformed)?;
        if end < start {
            return Err(RangeError::Malformed);
        }
        end.min(size - 1)
    };

    Ok((start, end))
}

async fn stream_handler(
    State(state): State<StreamState>,
    method: Method,
    Path((token, filename)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    // 1. Token first; nothing leaks without it
    let payload = match state.issuer.validate(&token) {
        Ok(payload) => payload,
        Err(e) => {
            debug!("Stream token rejected: {}", e);
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    };

    // 2. The entry the token points at
    let entry = match state.index.lookup(&payload.item_id) {
        Ok(Some(entry)) if entry.status == CacheStatus::Ready => entry,
        Ok(_) => return (StatusCode::NOT_FOUND, "No cached artifact").into_response(),
        Err(e) => {
            warn!("Cache lookup failed for {}: {}", payload.item_id, e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    // 3. Filename against the recorded layout
    let Some(artifact) = parse_artifact_filename(&filename) else {
        return (StatusCode::NOT_FOUND, "Unknown artifact name").into_response();
    };
    let Some(segment_idx) = validate_artifact(&entry, &artifact) else {
        return (StatusCode::NOT_FOUND, "Artifact mismatch").into_response();
    };

    // 4. Open the file
    let path = match state.index.resolve_artifact_path(&entry, segment_idx) {
        Ok(path) => path,
        Err(e) => {
            warn!("Artifact resolution failed: {}", e);
            return StatusCode::NOT_FOUND.into_response();
        }
    };
    let mut file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            warn!("Artifact missing on disk {}: {}", path.display(), e);
            return (StatusCode::NOT_FOUND, "Artifact missing").into_response();
        }
    };
    let size = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    let mime = CacheFormat::parse(&entry.cache_format)
        .map(|f| f.mime_type())
        .unwrap_or("application/octet-stream");
    let head_only = method == Method::HEAD;

    // 5./6. Range handling
    let range_header = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok());

    match range_header {
        None => {
            let mut response = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, mime)
                .header(header::CONTENT_LENGTH, size)
                .header(header::ACCEPT_RANGES, "bytes")
                .header(header::CACHE_CONTROL, "no-cache");

            if head_only {
                return response.body(Body::empty()).unwrap().into_response();
            }
            response = response.header(header::CONNECTION, "keep-alive");
            let stream = ReaderStream::new(file);
            response
                .body(Body::from_stream(stream))
                .unwrap()
                .into_response()
        }
        Some(value) => match parse_range(value, size) {
            Ok((start, end)) => {
                let len = end - start + 1;
                if file.seek(SeekFrom::Start(start)).await.is_err() {
                    return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                }

                let response = Response::builder()
                    .status(StatusCode::PARTIAL_CONTENT)
                    .header(header::CONTENT_TYPE, mime)
                    .header(header::CONTENT_LENGTH, len)
                    .header(
                        header::CONTENT_RANGE,
                        format!("bytes {}-{}/{}", start, end, size),
                    )
                    .header(header::ACCEPT_RANGES, "bytes")
                    .header(header::CACHE_CONTROL, "no-cache");

                if head_only {
                    return response.body(Body::empty()).unwrap().into_response();
                }
                let stream = ReaderStream::new(file.take(len));
                response
                    .body(Body::from_stream(stream))
                    .unwrap()
                    .into_response()
            }
            Err(_) => Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(header::CONTENT_RANGE, format!("bytes */{}", size))
                .body(Body::empty())
                .unwrap()
                .into_response(),
        },
    }
}

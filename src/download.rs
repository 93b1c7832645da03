//! Two-phase downloads: issue a one-shot grant, then redeem it for a stream.

use axum::Json;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::config::{AppConfig, DOWNLOAD_CHUNK_SIZE};
use crate::error::ApiError;
use crate::sessions::{Redemption, TokenPayload, TokenStore};
use crate::storage::RootDir;

#[derive(Debug, Serialize)]
pub struct GrantResponse {
    pub download_url: String,
    pub filename: String,
    /// Absolute expiry, unix seconds.
    pub expires: i64,
}

/// Phase one (`action=download`): resolves the file and mints a single-use
/// grant the client redeems via the returned URL. Any resolution failure,
/// including traversal attempts and directories, reads as a missing file.
pub async fn issue_grant(
    root: &RootDir,
    store: &TokenStore,
    config: &AppConfig,
    file: &str,
) -> Result<Json<GrantResponse>, ApiError> {
    if file.is_empty() {
        return Err(ApiError::BadRequest("File parameter required".into()));
    }
    let not_found = || ApiError::NotFound("File not found".into());
    let target = root.resolve(file).await.map_err(|_| not_found())?;
    let metadata = fs::metadata(&target).await.map_err(|_| not_found())?;
    if !metadata.is_file() {
        return Err(not_found());
    }

    let filename = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    let record = store
        .create(
            TokenPayload::Download {
                file: target,
                filename: filename.clone(),
            },
            config.session_ttl_secs,
        )
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;

    info!(file, expires = record.expires, "issued download grant");
    Ok(Json(GrantResponse {
        download_url: format!("/api.php?action=get&token={}", record.token),
        filename,
        expires: record.expires,
    }))
}

/// Phase two (`action=get`): consumes the grant and streams the file. The
/// record is gone after this call whatever the outcome, so a retry needs a
/// fresh grant.
pub async fn serve_redeemed(
    store: &TokenStore,
    token: &str,
    request_headers: &HeaderMap,
) -> Result<Response, ApiError> {
    if token.is_empty() {
        return Err(ApiError::BadRequest("Token required".into()));
    }
    let (file, filename) = match store
        .redeem_once(token)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
    {
        Redemption::Claimed(record) => match record.payload {
            TokenPayload::Download { file, filename } => (file, filename),
            // a session token names no file; it is consumed all the same
            TokenPayload::Session { .. } => {
                return Err(ApiError::NotFound("File not found".into()));
            }
        },
        Redemption::Expired => return Err(ApiError::Gone("Token expired".into())),
        Redemption::Missing => {
            return Err(ApiError::NotFound("Invalid or expired token".into()));
        }
    };
    stream_file(&file, &filename, request_headers).await
}

/// Streams a file with single-range support in bounded chunks.
async fn stream_file(
    path: &Path,
    filename: &str,
    request_headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let metadata = match fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => metadata,
        _ => return Err(ApiError::NotFound("File not found".into())),
    };
    let file_size = metadata.len();
    let range = parse_range(request_headers.get(header::RANGE), file_size)?;

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    response_headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!("attachment; filename=\"{filename}\"")).unwrap_or_else(
            |_| HeaderValue::from_static("attachment; filename=\"download\""),
        ),
    );
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    response_headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    // keeps nginx from buffering the whole body before forwarding
    response_headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );

    let file = File::open(path)
        .await
        .map_err(|_| ApiError::Internal("Cannot open file".into()))?;

    if let Some((start, end)) = range {
        let length = end - start + 1;
        debug!(path = %path.display(), start, end, length, "serving byte range");
        let mut file = file;
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        let stream = ReaderStream::with_capacity(file.take(length), DOWNLOAD_CHUNK_SIZE);
        response_headers.insert(
            header::CONTENT_RANGE,
            header_value(&format!("bytes {start}-{end}/{file_size}"))?,
        );
        response_headers.insert(header::CONTENT_LENGTH, header_value(&length.to_string())?);
        return Ok((
            StatusCode::PARTIAL_CONTENT,
            response_headers,
            Body::from_stream(stream),
        )
            .into_response());
    }

    response_headers.insert(header::CONTENT_LENGTH, header_value(&file_size.to_string())?);
    info!(path = %path.display(), size = file_size, "serving full file");
    let stream = ReaderStream::with_capacity(file, DOWNLOAD_CHUNK_SIZE);
    Ok((StatusCode::OK, response_headers, Body::from_stream(stream)).into_response())
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value).map_err(|_| ApiError::Internal("invalid header value".into()))
}

/// Parses a single `bytes=start-end` Range header. Open ends and `-suffix`
/// forms are accepted; a zero suffix falls back to the full body; multiple
/// ranges are refused rather than silently truncated.
fn parse_range(
    value: Option<&HeaderValue>,
    file_size: u64,
) -> Result<Option<(u64, u64)>, ApiError> {
    let Some(value) = value else {
        return Ok(None);
    };
    if file_size == 0 {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }
    let value = value
        .to_str()
        .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?;
    let Some(range) = value.strip_prefix("bytes=") else {
        return Err(ApiError::BadRequest("invalid Range header".into()));
    };
    if range.contains(',') {
        return Err(ApiError::BadRequest("multiple ranges not supported".into()));
    }

    let mut parts = range.splitn(2, '-');
    let start_part = parts.next().unwrap_or_default();
    let end_part = parts.next().unwrap_or_default();

    let (start, end) = if start_part.is_empty() {
        let suffix: u64 = end_part
            .parse()
            .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?;
        if suffix == 0 {
            return Ok(None);
        }
        let start = file_size.saturating_sub(suffix);
        (start, file_size.saturating_sub(1))
    } else {
        let start: u64 = start_part
            .parse()
            .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?;
        let end: u64 = if end_part.is_empty() {
            file_size.saturating_sub(1)
        } else {
            end_part
                .parse()
                .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?
        };
        (start, end)
    };

    if start > end || start >= file_size || end >= file_size {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }

    Ok(Some((start, end.min(file_size.saturating_sub(1)))))
}

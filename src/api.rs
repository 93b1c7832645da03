//! Legacy query-string surface served at `/` and `/api.php`.

use axum::Json;
use axum::extract::{ConnectInfo, Extension, Query};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::fs;
use tracing::info;

use crate::auth::authenticate;
use crate::config::{AppConfig, Capability};
use crate::download::{issue_grant, serve_redeemed};
use crate::error::ApiError;
use crate::sessions::TokenStore;
use crate::storage::{DirectoryListing, RootDir, StorageError};

#[derive(Deserialize, Default)]
pub struct ActionQuery {
    action: Option<String>,
    dir: Option<String>,
    file: Option<String>,
    token: Option<String>,
}

#[derive(Serialize)]
struct DeleteResponse {
    success: bool,
}

#[derive(Serialize)]
struct CleanupResponse {
    status: &'static str,
    count: usize,
}

/// Routes `?action=…` requests. Token redemption authenticates itself
/// through the grant, cleanup trusts only the socket peer; everything else
/// passes the credential gate before the action is even validated.
pub async fn dispatch(
    Query(query): Query<ActionQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(config): Extension<Arc<AppConfig>>,
    Extension(root): Extension<Arc<RootDir>>,
    Extension(store): Extension<Arc<TokenStore>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let action = query.action.as_deref().unwrap_or("list");

    match action {
        "get" => serve_redeemed(&store, query.token.as_deref().unwrap_or(""), &headers).await,
        "cleanup" => cleanup(&store, addr).await.map(IntoResponse::into_response),
        _ => {
            let identity = authenticate(&headers, &config, &store).await?;
            match action {
                "list" => {
                    identity.require(Capability::View)?;
                    list_directory(&root, query.dir.as_deref().unwrap_or(""))
                        .await
                        .map(IntoResponse::into_response)
                }
                "download" => {
                    identity.require(Capability::Download)?;
                    issue_grant(&root, &store, &config, query.file.as_deref().unwrap_or(""))
                        .await
                        .map(IntoResponse::into_response)
                }
                "delete" => {
                    identity.require(Capability::Delete)?;
                    delete_file(&root, query.file.as_deref().unwrap_or(""))
                        .await
                        .map(IntoResponse::into_response)
                }
                _ => Err(ApiError::BadRequest("Invalid action".into())),
            }
        }
    }
}

async fn list_directory(root: &RootDir, dir: &str) -> Result<Json<DirectoryListing>, ApiError> {
    let listing = match root.list(dir).await {
        Ok(listing) => listing,
        Err(StorageError::InvalidPath) => {
            return Err(ApiError::BadRequest("Invalid directory".into()));
        }
        Err(StorageError::Io(err)) if err.kind() == ErrorKind::NotFound => {
            return Err(ApiError::NotFound("Directory not found".into()));
        }
        Err(StorageError::Io(err)) => return Err(ApiError::Internal(err.to_string())),
    };
    info!(dir, total = listing.total, "listed directory");
    Ok(Json(listing))
}

/// Deletes a single regular file. Directories are refused outright, there
/// is no recursive delete on this surface.
async fn delete_file(root: &RootDir, file: &str) -> Result<Json<DeleteResponse>, ApiError> {
    if file.is_empty() {
        return Err(ApiError::BadRequest("File parameter required".into()));
    }
    let not_found = || ApiError::NotFound("File not found".into());
    let target = root.resolve(file).await.map_err(|_| not_found())?;
    let metadata = fs::metadata(&target).await.map_err(|_| not_found())?;
    if metadata.is_dir() {
        return Err(ApiError::Forbidden("Cannot delete directories".into()));
    }

    match fs::remove_file(&target).await {
        Ok(()) => {
            info!(file, "deleted file");
            Ok(Json(DeleteResponse { success: true }))
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Err(not_found()),
        Err(_) => Err(ApiError::Internal("Failed to delete file".into())),
    }
}

/// Purges expired token records. Restricted to loopback peers by socket
/// address, forwarded headers are deliberately ignored here.
async fn cleanup(store: &TokenStore, addr: SocketAddr) -> Result<Json<CleanupResponse>, ApiError> {
    if !addr.ip().is_loopback() {
        return Err(ApiError::Forbidden(
            "Cleanup is restricted to local callers".into(),
        ));
    }
    let count = store
        .cleanup_expired()
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    info!(count, "cleaned expired tokens");
    Ok(Json(CleanupResponse {
        status: "cleaned",
        count,
    }))
}

/// Fallback for paths outside the routed surface.
pub async fn endpoint_not_found() -> ApiError {
    ApiError::NotFound("Endpoint not found".into())
}

//! Multipart upload: spool to disk, sanitize the name, place without clobbering.

use axum::Json;
use axum::extract::Extension;
use axum::extract::multipart::{Field, Multipart, MultipartError};
use axum::http::{HeaderMap, StatusCode};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

use crate::auth::authenticate;
use crate::config::{AppConfig, Capability, LOCK_WAIT_TIMEOUT_SECS};
use crate::error::ApiError;
use crate::locking::LockManager;
use crate::sessions::TokenStore;
use crate::storage::RootDir;

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub success: bool,
    pub filename: String,
    pub size: u64,
}

struct SpooledFile {
    temp_path: PathBuf,
    original_name: String,
    size: u64,
}

/// `POST /api/upload`: multipart body with a `file` part and an optional
/// `path` part naming the target directory, in either order. The payload is
/// spooled to a temp file while counting bytes, then moved into place under
/// the per-directory lock.
pub async fn handle_upload(
    Extension(config): Extension<Arc<AppConfig>>,
    Extension(root): Extension<Arc<RootDir>>,
    Extension(store): Extension<Arc<TokenStore>>,
    Extension(locks): Extension<Arc<LockManager>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let identity = authenticate(&headers, &config, &store).await?;
    identity.require(Capability::Upload)?;

    let mut target_param = String::new();
    let mut spooled: Option<SpooledFile> = None;

    let collected: Result<(), ApiError> = async {
        while let Some(mut field) = multipart
            .next_field()
            .await
            .map_err(|err| map_multipart_error(err, config.upload_max_size))?
        {
            let name = field.name().unwrap_or("").to_string();
            match name.as_str() {
                "file" if spooled.is_none() => {
                    spooled = Some(spool_file(&mut field, config.upload_max_size).await?);
                }
                "path" => {
                    target_param = field
                        .text()
                        .await
                        .map_err(|err| map_multipart_error(err, config.upload_max_size))?;
                }
                _ => {}
            }
        }
        Ok(())
    }
    .await;
    if let Err(err) = collected {
        if let Some(spooled) = &spooled {
            let _ = fs::remove_file(&spooled.temp_path).await;
        }
        return Err(err);
    }

    let Some(spooled) = spooled else {
        return Err(ApiError::BadRequest("No file uploaded".into()));
    };

    let placed = place_upload(&config, &root, &locks, &spooled, &target_param).await;
    if placed.is_err() {
        let _ = fs::remove_file(&spooled.temp_path).await;
    }
    let filename = placed?;

    info!(
        filename,
        size = spooled.size,
        username = identity.username,
        role = ?identity.role,
        "upload stored"
    );
    Ok(Json(UploadResponse {
        success: true,
        filename,
        size: spooled.size,
    }))
}

/// A transport-level body cap trips before any field parses; report that as
/// too large rather than as a missing file.
fn map_multipart_error(err: MultipartError, max_size: u64) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge(max_size)
    } else {
        ApiError::BadRequest(err.body_text())
    }
}

async fn spool_file(field: &mut Field<'_>, max_size: u64) -> Result<SpooledFile, ApiError> {
    let original_name = field.file_name().unwrap_or("file").to_string();
    let temp_path = std::env::temp_dir().join(format!("filegate-upload-{}", Uuid::new_v4()));
    let mut file = File::create(&temp_path)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;

    let mut size: u64 = 0;
    let written: Result<(), ApiError> = async {
        loop {
            let chunk = match field.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(err) => return Err(map_multipart_error(err, max_size)),
            };
            size += chunk.len() as u64;
            if max_size > 0 && size > max_size {
                return Err(ApiError::PayloadTooLarge(max_size));
            }
            file.write_all(&chunk)
                .await
                .map_err(|err| ApiError::Internal(err.to_string()))?;
        }
        file.flush()
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))
    }
    .await;

    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }
    Ok(SpooledFile {
        temp_path,
        original_name,
        size,
    })
}

async fn place_upload(
    config: &AppConfig,
    root: &RootDir,
    locks: &LockManager,
    spooled: &SpooledFile,
    target_param: &str,
) -> Result<String, ApiError> {
    let invalid_path = || ApiError::BadRequest("Invalid upload path".into());
    let target_dir = root
        .resolve(target_param)
        .await
        .map_err(|_| invalid_path())?;
    let dir_metadata = fs::metadata(&target_dir).await.map_err(|_| invalid_path())?;
    if !dir_metadata.is_dir() {
        return Err(invalid_path());
    }
    // files must live under at least one subdirectory
    if target_dir.as_path() == root.root_path() {
        return Err(ApiError::BadRequest(
            "Upload to root directory is not allowed".into(),
        ));
    }

    let safe_name = sanitize_filename(&spooled.original_name);
    if !config.upload_extensions.is_empty() {
        let allowed = Path::new(&safe_name)
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .map(|ext| config.upload_extensions.iter().any(|entry| *entry == ext))
            .unwrap_or(false);
        if !allowed {
            return Err(ApiError::BadRequest("File type not allowed".into()));
        }
    }

    let _guard = locks
        .lock_dir(&target_dir, Duration::from_secs(LOCK_WAIT_TIMEOUT_SECS))
        .await
        .map_err(|_| ApiError::Internal("upload lock timed out".into()))?;
    let final_name = next_free_name(&target_dir, &safe_name).await?;
    let destination = target_dir.join(&final_name);

    if fs::rename(&spooled.temp_path, &destination).await.is_err() {
        // the spool directory may sit on a different filesystem
        fs::copy(&spooled.temp_path, &destination)
            .await
            .map_err(|_| ApiError::Internal("Failed to save file".into()))?;
        let _ = fs::remove_file(&spooled.temp_path).await;
    }

    Ok(final_name)
}

/// Probes `name`, `stem_1.ext`, `stem_2.ext`, … until a free slot turns up.
/// Callers hold the directory lock, so concurrent probes cannot agree on the
/// same slot.
async fn next_free_name(dir: &Path, name: &str) -> Result<String, ApiError> {
    let taken = |candidate: String| async move {
        fs::try_exists(dir.join(&candidate))
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))
            .map(|exists| (!exists).then_some(candidate))
    };

    if let Some(free) = taken(name.to_string()).await? {
        return Ok(free);
    }
    let stem = Path::new(name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let extension = Path::new(name)
        .extension()
        .map(|ext| ext.to_string_lossy().into_owned());

    let mut counter: u64 = 1;
    loop {
        let candidate = match &extension {
            Some(ext) => format!("{stem}_{counter}.{ext}"),
            None => format!("{stem}_{counter}"),
        };
        if let Some(free) = taken(candidate).await? {
            return Ok(free);
        }
        counter += 1;
    }
}

/// Reduces a client-supplied filename to `[A-Za-z0-9._-]`: strip any path
/// prefix, transliterate Cyrillic, turn the rest into underscores, collapse
/// runs, trim the edges. A name with nothing left becomes `file`, and a bare
/// dotfile gets a `file` stem so the dot is not mistaken for a hidden file.
fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");

    let mut mapped = String::with_capacity(base.len());
    for ch in base.chars() {
        if let Some(ascii) = transliterate(ch) {
            mapped.push_str(ascii);
        } else if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
            mapped.push(ch);
        } else {
            mapped.push('_');
        }
    }

    let mut collapsed = String::with_capacity(mapped.len());
    for ch in mapped.chars() {
        if ch == '_' && collapsed.ends_with('_') {
            continue;
        }
        collapsed.push(ch);
    }

    let trimmed = collapsed.trim_matches('_');
    if trimmed.is_empty() || trimmed.bytes().all(|byte| byte == b'.') {
        return "file".to_string();
    }
    if trimmed.starts_with('.') {
        return format!("file{trimmed}");
    }
    trimmed.to_string()
}

fn transliterate(ch: char) -> Option<&'static str> {
    let mapped = match ch {
        'а' => "a",
        'б' => "b",
        'в' => "v",
        'г' => "g",
        'д' => "d",
        'е' | 'ё' => "e",
        'ж' => "zh",
        'з' => "z",
        'и' => "i",
        'й' => "y",
        'к' => "k",
        'л' => "l",
        'м' => "m",
        'н' => "n",
        'о' => "o",
        'п' => "p",
        'р' => "r",
        'с' => "s",
        'т' => "t",
        'у' => "u",
        'ф' => "f",
        'х' => "h",
        'ц' => "ts",
        'ч' => "ch",
        'ш' => "sh",
        'щ' => "shch",
        'ъ' | 'ь' => "",
        'ы' => "y",
        'э' => "e",
        'ю' => "yu",
        'я' => "ya",
        'А' => "A",
        'Б' => "B",
        'В' => "V",
        'Г' => "G",
        'Д' => "D",
        'Е' | 'Ё' => "E",
        'Ж' => "Zh",
        'З' => "Z",
        'И' => "I",
        'Й' => "Y",
        'К' => "K",
        'Л' => "L",
        'М' => "M",
        'Н' => "N",
        'О' => "O",
        'П' => "P",
        'Р' => "R",
        'С' => "S",
        'Т' => "T",
        'У' => "U",
        'Ф' => "F",
        'Х' => "H",
        'Ц' => "Ts",
        'Ч' => "Ch",
        'Ш' => "Sh",
        'Щ' => "Shch",
        'Ъ' | 'Ь' => "",
        'Ы' => "Y",
        'Э' => "E",
        'Ю' => "Yu",
        'Я' => "Ya",
        _ => return None,
    };
    Some(mapped)
}

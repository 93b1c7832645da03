//! File-backed token store: one JSON record per token, the token is the key.

use chrono::Utc;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

use crate::atomic::AtomicFile;
use crate::config::Role;

/// Login session tokens carry 32 bytes of entropy, download tokens 16.
pub const SESSION_TOKEN_BYTES: usize = 32;
pub const DOWNLOAD_TOKEN_BYTES: usize = 16;

const CLAIM_PREFIX: &str = ".claim-";
/// Claim files survive only a crash mid-redemption; sweep them once old.
const STALE_CLAIM_SECS: u64 = 3600;

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token: String,
    /// Absolute expiry, unix seconds.
    pub expires: i64,
    #[serde(flatten)]
    pub payload: TokenPayload,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TokenPayload {
    Session {
        username: String,
        /// Records written before roles existed default to the basic role.
        #[serde(default)]
        role: Role,
        ip: String,
    },
    Download {
        file: PathBuf,
        filename: String,
    },
}

pub enum Redemption {
    Claimed(TokenRecord),
    Expired,
    Missing,
}

/// Per-token records under one directory. Records are independent, so no
/// cross-token locking exists; single-use semantics come from the atomic
/// claim rename in [`TokenStore::redeem_once`].
#[derive(Debug)]
pub struct TokenStore {
    dir: PathBuf,
}

impl TokenStore {
    pub async fn open(dir: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Generates a fresh token and persists the payload with an absolute
    /// expiry `ttl_secs` from now.
    pub async fn create(&self, payload: TokenPayload, ttl_secs: i64) -> io::Result<TokenRecord> {
        let bytes = match payload {
            TokenPayload::Session { .. } => SESSION_TOKEN_BYTES,
            TokenPayload::Download { .. } => DOWNLOAD_TOKEN_BYTES,
        };
        let record = TokenRecord {
            token: generate_token(bytes),
            expires: Utc::now().timestamp() + ttl_secs,
            payload,
        };
        self.write_record(&record).await?;
        Ok(record)
    }

    /// Loads a record without consuming it. Expired and unreadable records
    /// are deleted on the way out; deletion races are benign since removing
    /// an absent file is not an error.
    pub async fn validate(&self, token: &str) -> io::Result<Option<TokenRecord>> {
        let Some(path) = self.record_path(token) else {
            return Ok(None);
        };
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        let record: TokenRecord = match serde_json::from_slice(&bytes) {
            Ok(record) => record,
            Err(err) => {
                warn!(token_file = %path.display(), error = %err, "removing unreadable token record");
                remove_ignore_missing(&path).await?;
                return Ok(None);
            }
        };
        if record.expires < Utc::now().timestamp() {
            remove_ignore_missing(&path).await?;
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Consumes a record exactly once. Concurrent redeemers race on a rename
    /// to a private claim file; the filesystem guarantees one winner, the
    /// rest observe the record as missing.
    pub async fn redeem_once(&self, token: &str) -> io::Result<Redemption> {
        let Some(path) = self.record_path(token) else {
            return Ok(Redemption::Missing);
        };
        let claim = self.dir.join(format!("{CLAIM_PREFIX}{}", Uuid::new_v4()));
        match fs::rename(&path, &claim).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Redemption::Missing),
            Err(err) => return Err(err),
        }

        let bytes = fs::read(&claim).await?;
        let _ = fs::remove_file(&claim).await;
        let record: TokenRecord = match serde_json::from_slice(&bytes) {
            Ok(record) => record,
            Err(err) => {
                warn!(token_file = %path.display(), error = %err, "redeemed token record was unreadable");
                return Ok(Redemption::Missing);
            }
        };
        if record.expires < Utc::now().timestamp() {
            return Ok(Redemption::Expired);
        }
        Ok(Redemption::Claimed(record))
    }

    /// Maintenance sweep: deletes expired records and stale claim files,
    /// returning how many records were purged.
    pub async fn cleanup_expired(&self) -> io::Result<usize> {
        let now = Utc::now().timestamp();
        let mut dir = fs::read_dir(&self.dir).await?;
        let mut cleaned = 0;

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(CLAIM_PREFIX) {
                if let Ok(metadata) = entry.metadata().await
                    && let Ok(modified) = metadata.modified()
                    && let Ok(age) = SystemTime::now().duration_since(modified)
                    && age >= Duration::from_secs(STALE_CLAIM_SECS)
                {
                    let _ = fs::remove_file(&path).await;
                }
                continue;
            }
            if path.extension() != Some(OsStr::new("json")) {
                continue;
            }
            let Ok(bytes) = fs::read(&path).await else {
                continue;
            };
            let Ok(record) = serde_json::from_slice::<TokenRecord>(&bytes) else {
                continue;
            };
            if record.expires < now && fs::remove_file(&path).await.is_ok() {
                cleaned += 1;
            }
        }

        Ok(cleaned)
    }

    async fn write_record(&self, record: &TokenRecord) -> io::Result<()> {
        let path = self.dir.join(format!("{}.json", record.token));
        let bytes = serde_json::to_vec(record).map_err(io::Error::other)?;
        let mut atomic = AtomicFile::new(&path).await?;
        if let Err(err) = atomic.file_mut().write_all(&bytes).await {
            atomic.cleanup().await;
            return Err(err);
        }
        atomic.finalize().await
    }

    /// Tokens become file names, so anything but a hex string of the two
    /// issued lengths is rejected before touching the filesystem.
    fn record_path(&self, token: &str) -> Option<PathBuf> {
        let well_formed = matches!(token.len(), 32 | 64)
            && token.bytes().all(|byte| byte.is_ascii_hexdigit());
        well_formed.then(|| self.dir.join(format!("{token}.json")))
    }
}

fn generate_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

async fn remove_ignore_missing(path: &std::path::Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

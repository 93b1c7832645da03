//! CLI arguments, server defaults, and the user/role table.

use clap::Parser;
use serde::{Deserialize, Serialize};
use shadow_rs::formatcp;
use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tracing::warn;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_ROOT_DIR: &str = "/data";
pub const DEFAULT_SESSION_DIR: &str = "/tmp/filegate_sessions";
pub const DEFAULT_USERS_FILE: &str = "config/users.json";
pub const DEFAULT_SESSION_TTL_SECS: u64 = 3600;
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 100 * 1024 * 1024;
pub const DEFAULT_LOGIN_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_LOGIN_WINDOW_SECS: u64 = 15 * 60;
pub const DEFAULT_LOGIN_LOCKOUT_SECS: u64 = 15 * 60;
pub const SESSION_SWEEP_INTERVAL_SECS: u64 = 300;
pub const DOWNLOAD_CHUNK_SIZE: usize = 1024 * 1024;
pub const LOCK_WAIT_TIMEOUT_SECS: u64 = 10;
/// Slack on top of the configured upload limit for multipart framing and
/// the small non-file fields.
pub const UPLOAD_BODY_OVERHEAD: u64 = 64 * 1024;
/// Top-level names never exposed when listing the root directory.
pub const RESERVED_ROOT_NAMES: [&str; 4] = ["api", "config", "js", "css"];

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "filegate", version = VERSION_INFO, about = "Token-authenticated HTTP file gateway")]
pub struct Args {
    #[arg(
        short = 'r',
        long,
        env = "FILEGATE_ROOT_DIR",
        default_value = DEFAULT_ROOT_DIR,
        help = "Root directory exposed to clients"
    )]
    pub root_dir: String,
    #[arg(
        long,
        env = "FILEGATE_SESSION_DIR",
        default_value = DEFAULT_SESSION_DIR,
        help = "Directory holding token records"
    )]
    pub session_dir: String,
    #[arg(
        long,
        env = "FILEGATE_USERS_FILE",
        default_value = DEFAULT_USERS_FILE,
        help = "User and role table (JSON), created with defaults if missing"
    )]
    pub users_file: String,
    #[arg(
        short = 'b',
        long,
        env = "FILEGATE_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "FILEGATE_PORT",
        default_value_t = 8080,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        long,
        env = "FILEGATE_SESSION_TTL_SECS",
        default_value_t = DEFAULT_SESSION_TTL_SECS,
        help = "Login session and download token lifetime in seconds"
    )]
    pub session_ttl_secs: u64,
    #[arg(
        long,
        env = "FILEGATE_UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max upload size in bytes (0 to disable)"
    )]
    pub upload_max_size: u64,
    #[arg(
        long,
        env = "FILEGATE_UPLOAD_EXTENSIONS",
        help = "Comma separated upload extension allow-list (unset allows all)"
    )]
    pub upload_extensions: Option<String>,
    #[arg(
        long,
        env = "FILEGATE_CORS_ORIGINS",
        help = "Comma separated CORS origins (unset allows any origin)"
    )]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "FILEGATE_LOGIN_MAX_ATTEMPTS",
        default_value_t = DEFAULT_LOGIN_MAX_ATTEMPTS,
        help = "Max login failures before lockout (0 to disable)"
    )]
    pub login_max_attempts: u32,
    #[arg(
        long,
        env = "FILEGATE_LOGIN_WINDOW_SECS",
        default_value_t = DEFAULT_LOGIN_WINDOW_SECS,
        help = "Login failure window in seconds"
    )]
    pub login_window_secs: u64,
    #[arg(
        long,
        env = "FILEGATE_LOGIN_LOCKOUT_SECS",
        default_value_t = DEFAULT_LOGIN_LOCKOUT_SECS,
        help = "Login lockout time after max failures"
    )]
    pub login_lockout_secs: u64,
    #[arg(
        long,
        value_name = "PASSWORD",
        help = "Print a bcrypt hash for PASSWORD and exit"
    )]
    pub hash_password: Option<String>,
}

/// Runtime configuration shared with the handlers. Built once in `main`,
/// never mutated afterwards.
#[derive(Debug)]
pub struct AppConfig {
    pub session_ttl_secs: i64,
    pub upload_max_size: u64,
    /// Lowercased extensions without leading dots; empty allows everything.
    pub upload_extensions: Vec<String>,
    pub users: UserTable,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    #[default]
    User,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "admin" => Ok(Role::Admin),
            "user" => Ok(Role::User),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Capability flags a role grants. Absent flags deserialize as denied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    #[serde(default)]
    pub view: bool,
    #[serde(default)]
    pub download: bool,
    #[serde(default)]
    pub upload: bool,
    #[serde(default)]
    pub delete: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    View,
    Download,
    Upload,
    Delete,
}

impl PermissionSet {
    pub fn allows(&self, capability: Capability) -> bool {
        match capability {
            Capability::View => self.view,
            Capability::Download => self.download,
            Capability::Upload => self.upload,
            Capability::Delete => self.delete,
        }
    }
}

#[derive(Clone, Debug)]
pub struct User {
    pub password_hash: String,
    pub role: Role,
}

/// Normalized user/role table resolved from the users file at startup.
#[derive(Debug, Default)]
pub struct UserTable {
    users: HashMap<String, User>,
    roles: HashMap<Role, PermissionSet>,
}

impl UserTable {
    pub fn lookup(&self, username: &str) -> Option<&User> {
        self.users.get(username)
    }

    pub fn permissions(&self, role: Role) -> PermissionSet {
        self.roles
            .get(&role)
            .copied()
            .unwrap_or_else(|| default_permissions(role))
    }
}

fn default_permissions(role: Role) -> PermissionSet {
    match role {
        Role::Admin => PermissionSet {
            view: true,
            download: true,
            upload: true,
            delete: true,
        },
        Role::User => PermissionSet {
            view: true,
            download: true,
            upload: true,
            delete: false,
        },
    }
}

/// On-disk users file. User records come in two shapes for backward
/// compatibility: a bare password hash, or an object carrying a role.
#[derive(Deserialize)]
struct UsersFile {
    #[serde(default)]
    users: HashMap<String, UserSpec>,
    #[serde(default)]
    roles: HashMap<String, PermissionSet>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum UserSpec {
    Hash(String),
    Full {
        password: String,
        #[serde(default)]
        role: Role,
    },
}

impl From<UserSpec> for User {
    fn from(spec: UserSpec) -> Self {
        match spec {
            UserSpec::Hash(password_hash) => User {
                password_hash,
                role: Role::default(),
            },
            UserSpec::Full { password, role } => User {
                password_hash: password,
                role,
            },
        }
    }
}

/// Renders the users file written on first start when none exists. Every
/// default account gets the password `secret`, hashed at creation time;
/// deployments are expected to replace them.
fn default_users_json() -> io::Result<String> {
    let hash = bcrypt::hash("secret", bcrypt::DEFAULT_COST).map_err(io::Error::other)?;
    Ok(format!(
        r#"{{
  "users": {{
    "admin": {{ "password": "{hash}", "role": "admin" }},
    "user": {{ "password": "{hash}", "role": "user" }},
    "demo": "{hash}"
  }},
  "roles": {{
    "admin": {{ "view": true, "download": true, "upload": true, "delete": true }},
    "user": {{ "view": true, "download": true, "upload": true, "delete": false }}
  }}
}}
"#
    ))
}

/// Loads and normalizes the users file, creating it with defaults when
/// absent.
pub async fn load_users(path: &Path) -> io::Result<UserTable> {
    if fs::metadata(path).await.is_err() {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, default_users_json()?).await?;
        warn!(
            path = %path.display(),
            "created users file with default accounts, change the passwords"
        );
    }

    let bytes = fs::read(path).await?;
    let parsed: UsersFile = serde_json::from_slice(&bytes)
        .map_err(|err| invalid_data(format!("users file {}: {err}", path.display())))?;

    let users = parsed
        .users
        .into_iter()
        .map(|(name, spec)| (name, User::from(spec)))
        .collect::<HashMap<_, _>>();
    if users.is_empty() {
        return Err(invalid_data(format!(
            "users file {} defines no users",
            path.display()
        )));
    }

    let mut roles = HashMap::new();
    for (name, permissions) in parsed.roles {
        let role = Role::from_str(&name)
            .map_err(|err| invalid_data(format!("users file {}: {err}", path.display())))?;
        roles.insert(role, permissions);
    }

    Ok(UserTable { users, roles })
}

/// Splits a comma separated extension list into lowercased entries
/// without leading dots.
pub fn parse_extension_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|list| {
            list.split(',')
                .map(|ext| ext.trim().trim_start_matches('.').to_lowercase())
                .filter(|ext| !ext.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn invalid_data(message: String) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, message)
}

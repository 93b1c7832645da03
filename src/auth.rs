//! Credential verification, login endpoints, and per-IP login rate limiting.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, Extension};
use axum::http::HeaderMap;
use axum_extra::headers::authorization::{Basic, Bearer};
use axum_extra::headers::{Authorization, HeaderMapExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{AppConfig, Capability, PermissionSet, Role};
use crate::error::ApiError;
use crate::http::resolve_client_ip;
use crate::sessions::{TokenPayload, TokenStore};

/// Authenticated principal with its capabilities already resolved.
#[derive(Clone, Debug)]
pub struct Identity {
    pub username: String,
    pub role: Role,
    pub permissions: PermissionSet,
}

impl Identity {
    pub fn require(&self, capability: Capability) -> Result<(), ApiError> {
        if self.permissions.allows(capability) {
            Ok(())
        } else {
            Err(ApiError::Forbidden("Permission denied".into()))
        }
    }
}

/// Resolves the request's `Authorization` header to an identity. Basic
/// credentials are checked against the user table, Bearer tokens against the
/// session store. Download grants are not credentials, only session tokens
/// authenticate.
pub async fn authenticate(
    headers: &HeaderMap,
    config: &AppConfig,
    store: &TokenStore,
) -> Result<Identity, ApiError> {
    if let Some(Authorization(basic)) = headers.typed_get::<Authorization<Basic>>()
        && let Some(user) = config.users.lookup(basic.username())
        && bcrypt::verify(basic.password(), &user.password_hash).unwrap_or(false)
    {
        return Ok(identity(basic.username().to_string(), user.role, config));
    }

    if let Some(Authorization(bearer)) = headers.typed_get::<Authorization<Bearer>>()
        && let Some(record) = store
            .validate(bearer.token())
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?
        && let TokenPayload::Session { username, role, .. } = record.payload
    {
        return Ok(identity(username, role, config));
    }

    Err(ApiError::Unauthorized("Authorization required".into()))
}

fn identity(username: String, role: Role, config: &AppConfig) -> Identity {
    Identity {
        username,
        role,
        permissions: config.users.permissions(role),
    }
}

#[derive(Debug)]
struct LoginAttempt {
    window_start: Instant,
    failures: u32,
    locked_until: Option<Instant>,
}

/// Per-IP login failure tracking with lockout. Disabled entirely when
/// `max_attempts` is zero.
#[derive(Debug)]
pub struct LoginLimiter {
    attempts: Mutex<HashMap<IpAddr, LoginAttempt>>,
    window: Duration,
    max_attempts: u32,
    lockout: Duration,
}

impl LoginLimiter {
    pub fn new(max_attempts: u32, window: Duration, lockout: Duration) -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
            window,
            max_attempts,
            lockout,
        }
    }

    /// Seconds until an active lockout lifts, `None` when the address may
    /// attempt a login.
    pub async fn check(&self, ip: IpAddr) -> Option<u64> {
        if self.max_attempts == 0 {
            return None;
        }

        let mut attempts = self.attempts.lock().await;
        let now = Instant::now();
        let entry = attempts.entry(ip).or_insert(LoginAttempt {
            window_start: now,
            failures: 0,
            locked_until: None,
        });

        if let Some(locked_until) = entry.locked_until {
            if now < locked_until {
                return Some(locked_until.saturating_duration_since(now).as_secs().max(1));
            }
            entry.locked_until = None;
            entry.failures = 0;
            entry.window_start = now;
        }

        if now.duration_since(entry.window_start) > self.window {
            entry.window_start = now;
            entry.failures = 0;
        }

        None
    }

    pub async fn register_failure(&self, ip: IpAddr) {
        if self.max_attempts == 0 {
            return;
        }

        let mut attempts = self.attempts.lock().await;
        let now = Instant::now();
        let entry = attempts.entry(ip).or_insert(LoginAttempt {
            window_start: now,
            failures: 0,
            locked_until: None,
        });

        if now.duration_since(entry.window_start) > self.window {
            entry.window_start = now;
            entry.failures = 0;
            entry.locked_until = None;
        }

        entry.failures = entry.failures.saturating_add(1);
        if entry.failures >= self.max_attempts {
            entry.locked_until = Some(now + self.lockout);
            warn!(client_ip = %ip, "login locked out");
        }
    }

    pub async fn clear(&self, ip: IpAddr) {
        let mut attempts = self.attempts.lock().await;
        attempts.remove(&ip);
    }

    /// Drops entries whose window and lockout have both passed.
    pub async fn prune(&self) {
        let mut attempts = self.attempts.lock().await;
        let now = Instant::now();
        attempts.retain(|_, entry| {
            if let Some(locked_until) = entry.locked_until {
                return locked_until > now;
            }
            now.duration_since(entry.window_start) <= self.window
        });
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    success: bool,
    token: String,
    user: UserInfo,
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    user: UserInfo,
}

#[derive(Debug, Serialize)]
pub struct UserInfo {
    pub username: String,
    pub name: String,
    pub role: Role,
    pub permissions: PermissionSet,
}

impl UserInfo {
    fn new(username: String, role: Role, permissions: PermissionSet) -> Self {
        let name = display_name(&username);
        Self {
            username,
            name,
            role,
            permissions,
        }
    }
}

/// `POST /api/login`: verifies a password and issues a session token. A
/// body that fails to parse reads the same as missing credentials.
pub async fn login(
    Extension(config): Extension<Arc<AppConfig>>,
    Extension(store): Extension<Arc<TokenStore>>,
    Extension(limiter): Extension<Arc<LoginLimiter>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>, ApiError> {
    let (username, password) = match payload {
        Ok(Json(LoginRequest {
            username: Some(username),
            password: Some(password),
        })) => (username, password),
        _ => {
            return Err(ApiError::BadRequest(
                "Username and password required".into(),
            ));
        }
    };

    let client_ip = resolve_client_ip(&headers, Some(addr.ip())).unwrap_or_else(|| addr.ip());
    if let Some(retry_after) = limiter.check(client_ip).await {
        return Err(ApiError::TooManyRequests(retry_after));
    }

    let verified = config
        .users
        .lookup(&username)
        .filter(|user| bcrypt::verify(&password, &user.password_hash).unwrap_or(false));
    let Some(user) = verified else {
        limiter.register_failure(client_ip).await;
        return Err(ApiError::LoginRejected);
    };
    limiter.clear(client_ip).await;

    let record = store
        .create(
            TokenPayload::Session {
                username: username.clone(),
                role: user.role,
                ip: client_ip.to_string(),
            },
            config.session_ttl_secs,
        )
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;

    info!(username, client_ip = %client_ip, "login succeeded");
    Ok(Json(LoginResponse {
        success: true,
        token: record.token,
        user: UserInfo::new(username, user.role, config.users.permissions(user.role)),
    }))
}

/// `GET /api/me`: resolves the Bearer session back to its user. Bearer only,
/// Basic credentials are not accepted here.
pub async fn me(
    Extension(config): Extension<Arc<AppConfig>>,
    Extension(store): Extension<Arc<TokenStore>>,
    headers: HeaderMap,
) -> Result<Json<MeResponse>, ApiError> {
    let Some(Authorization(bearer)) = headers.typed_get::<Authorization<Bearer>>() else {
        return Err(ApiError::Unauthorized("Invalid token".into()));
    };
    let record = store
        .validate(bearer.token())
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    match record.map(|record| record.payload) {
        Some(TokenPayload::Session { username, role, .. }) => Ok(Json(MeResponse {
            user: UserInfo::new(username, role, config.users.permissions(role)),
        })),
        _ => Err(ApiError::Unauthorized("Invalid token".into())),
    }
}

fn display_name(username: &str) -> String {
    let mut chars = username.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::FromRequest;
    use axum::http::{Request, header};
    use crate::config::load_users;
    use std::path::PathBuf;
    use tempfile::{TempDir, tempdir};

    fn test_addr() -> ConnectInfo<SocketAddr> {
        ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000)))
    }

    fn relaxed_limiter() -> Arc<LoginLimiter> {
        Arc::new(LoginLimiter::new(
            100,
            Duration::from_secs(300),
            Duration::from_secs(300),
        ))
    }

    async fn make_state(temp: &TempDir) -> (Arc<AppConfig>, Arc<TokenStore>) {
        // cost 4 keeps the hashing fast
        let hash = bcrypt::hash("secret", 4).expect("hash");
        let users_path = temp.path().join("users.json");
        std::fs::write(
            &users_path,
            format!(
                r#"{{"users":{{"admin":{{"password":"{hash}","role":"admin"}},"basic":"{hash}"}}}}"#
            ),
        )
        .expect("write users");
        let users = load_users(&users_path).await.expect("load users");
        let config = Arc::new(AppConfig {
            session_ttl_secs: 60,
            upload_max_size: 0,
            upload_extensions: Vec::new(),
            users,
        });
        let store = Arc::new(
            TokenStore::open(temp.path().join("sessions"))
                .await
                .expect("open store"),
        );
        (config, store)
    }

    fn login_body(username: &str, password: &str) -> Result<Json<LoginRequest>, JsonRejection> {
        Ok(Json(LoginRequest {
            username: Some(username.to_string()),
            password: Some(password.to_string()),
        }))
    }

    async fn body_rejection(request: Request<Body>) -> JsonRejection {
        Json::<LoginRequest>::from_request(request, &())
            .await
            .expect_err("body must be rejected")
    }

    #[tokio::test]
    async fn login_issues_a_working_session_token() {
        let temp = tempdir().expect("tempdir");
        let (config, store) = make_state(&temp).await;

        let response = login(
            Extension(config.clone()),
            Extension(store.clone()),
            Extension(relaxed_limiter()),
            test_addr(),
            HeaderMap::new(),
            login_body("admin", "secret"),
        )
        .await
        .expect("login");

        assert!(response.0.success);
        assert_eq!(response.0.token.len(), 64);
        assert_eq!(response.0.user.name, "Admin");
        assert_eq!(response.0.user.role, Role::Admin);

        let mut headers = HeaderMap::new();
        headers.typed_insert(Authorization::bearer(&response.0.token).expect("bearer"));
        let identity = authenticate(&headers, &config, &store)
            .await
            .expect("token authenticates");
        assert_eq!(identity.username, "admin");
        assert!(identity.permissions.delete);
    }

    #[tokio::test]
    async fn login_requires_both_fields() {
        let temp = tempdir().expect("tempdir");
        let (config, store) = make_state(&temp).await;

        let err = login(
            Extension(config),
            Extension(store),
            Extension(relaxed_limiter()),
            test_addr(),
            HeaderMap::new(),
            Ok(Json(LoginRequest {
                username: Some("admin".to_string()),
                password: None,
            })),
        )
        .await
        .expect_err("missing password rejected");
        assert!(matches!(
            err,
            ApiError::BadRequest(msg) if msg == "Username and password required"
        ));
    }

    #[tokio::test]
    async fn malformed_login_bodies_follow_the_taxonomy() {
        let temp = tempdir().expect("tempdir");
        let (config, store) = make_state(&temp).await;

        let no_content_type = Request::builder().body(Body::empty()).expect("request");
        let bad_json = Request::builder()
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .expect("request");

        for request in [no_content_type, bad_json] {
            let rejection = body_rejection(request).await;
            let err = login(
                Extension(config.clone()),
                Extension(store.clone()),
                Extension(relaxed_limiter()),
                test_addr(),
                HeaderMap::new(),
                Err(rejection),
            )
            .await
            .expect_err("unparseable body");
            assert!(matches!(
                err,
                ApiError::BadRequest(msg) if msg == "Username and password required"
            ));
        }
    }

    #[tokio::test]
    async fn login_rejects_wrong_password() {
        let temp = tempdir().expect("tempdir");
        let (config, store) = make_state(&temp).await;

        let err = login(
            Extension(config),
            Extension(store),
            Extension(relaxed_limiter()),
            test_addr(),
            HeaderMap::new(),
            login_body("admin", "wrong"),
        )
        .await
        .expect_err("bad password rejected");
        assert!(matches!(err, ApiError::LoginRejected));
    }

    #[tokio::test]
    async fn repeated_failures_lock_the_address_out() {
        let temp = tempdir().expect("tempdir");
        let (config, store) = make_state(&temp).await;
        let limiter = Arc::new(LoginLimiter::new(
            2,
            Duration::from_secs(300),
            Duration::from_secs(300),
        ));

        for _ in 0..2 {
            let err = login(
                Extension(config.clone()),
                Extension(store.clone()),
                Extension(limiter.clone()),
                test_addr(),
                HeaderMap::new(),
                login_body("admin", "wrong"),
            )
            .await
            .expect_err("failure registered");
            assert!(matches!(err, ApiError::LoginRejected));
        }

        // even correct credentials are refused while locked
        let err = login(
            Extension(config),
            Extension(store),
            Extension(limiter),
            test_addr(),
            HeaderMap::new(),
            login_body("admin", "secret"),
        )
        .await
        .expect_err("locked out");
        match err {
            ApiError::TooManyRequests(retry_after) => {
                assert!(retry_after > 0 && retry_after <= 300);
            }
            _ => panic!("expected rate limit error"),
        }
    }

    #[tokio::test]
    async fn basic_credentials_resolve_roles() {
        let temp = tempdir().expect("tempdir");
        let (config, store) = make_state(&temp).await;

        let mut headers = HeaderMap::new();
        headers.typed_insert(Authorization::basic("basic", "secret"));
        let identity = authenticate(&headers, &config, &store)
            .await
            .expect("basic auth");
        assert_eq!(identity.role, Role::User);
        assert!(identity.permissions.view);
        assert!(!identity.permissions.delete);
        assert!(identity.require(Capability::View).is_ok());
        assert!(matches!(
            identity.require(Capability::Delete),
            Err(ApiError::Forbidden(_))
        ));

        headers.typed_insert(Authorization::basic("basic", "wrong"));
        let err = authenticate(&headers, &config, &store)
            .await
            .expect_err("wrong password");
        assert!(matches!(err, ApiError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn download_grants_do_not_authenticate() {
        let temp = tempdir().expect("tempdir");
        let (config, store) = make_state(&temp).await;
        let grant = store
            .create(
                TokenPayload::Download {
                    file: PathBuf::from("/srv/files/a.txt"),
                    filename: "a.txt".to_string(),
                },
                60,
            )
            .await
            .expect("create grant");

        let mut headers = HeaderMap::new();
        headers.typed_insert(Authorization::bearer(&grant.token).expect("bearer"));
        let err = authenticate(&headers, &config, &store)
            .await
            .expect_err("grant is not a credential");
        assert!(matches!(err, ApiError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn me_answers_for_bearer_sessions_only() {
        let temp = tempdir().expect("tempdir");
        let (config, store) = make_state(&temp).await;
        let record = store
            .create(
                TokenPayload::Session {
                    username: "basic".to_string(),
                    role: Role::User,
                    ip: String::new(),
                },
                60,
            )
            .await
            .expect("create session");

        let mut headers = HeaderMap::new();
        headers.typed_insert(Authorization::bearer(&record.token).expect("bearer"));
        let response = me(Extension(config.clone()), Extension(store.clone()), headers)
            .await
            .expect("me");
        assert_eq!(response.0.user.username, "basic");
        assert_eq!(response.0.user.name, "Basic");

        // Basic credentials are not accepted by this endpoint
        let mut headers = HeaderMap::new();
        headers.typed_insert(Authorization::basic("basic", "secret"));
        let err = me(Extension(config), Extension(store), headers)
            .await
            .expect_err("basic rejected");
        assert!(matches!(err, ApiError::Unauthorized(msg) if msg == "Invalid token"));
    }
}

//! FileGate server binary.
//!
//! This crate serves a single directory tree over HTTP: a query-string API
//! for listing, deleting, and two-phase downloads, plus JSON endpoints for
//! login, session introspection, and multipart upload. The main entry point
//! builds the Axum router and runs one plain HTTP listener.

mod api;
mod atomic;
mod auth;
mod background;
mod config;
mod download;
mod error;
mod http;
mod locking;
mod logging;
mod sessions;
mod storage;
mod upload;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{get, post};
use axum::{Router, middleware};
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::auth::LoginLimiter;
use crate::background::spawn_background_tasks;
use crate::config::{AppConfig, Args, UPLOAD_BODY_OVERHEAD};
use crate::http::build_cors_layer;
use crate::locking::LockManager;
use crate::sessions::TokenStore;
use crate::storage::RootDir;

shadow!(build);

/// Starts the FileGate server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    if let Some(password) = args.hash_password.as_deref() {
        let hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)
            .map_err(|err| std::io::Error::other(err.to_string()))?;
        println!("{hash}");
        return Ok(());
    }

    // the root must already exist, a missing mount is a deployment error
    let root = Arc::new(RootDir::open(PathBuf::from(&args.root_dir)).await?);
    let store = Arc::new(TokenStore::open(PathBuf::from(&args.session_dir)).await?);
    let users = config::load_users(Path::new(&args.users_file)).await?;
    let app_config = Arc::new(AppConfig {
        session_ttl_secs: args.session_ttl_secs as i64,
        upload_max_size: args.upload_max_size,
        upload_extensions: config::parse_extension_list(args.upload_extensions.as_deref()),
        users,
    });
    let limiter = Arc::new(LoginLimiter::new(
        args.login_max_attempts,
        Duration::from_secs(args.login_window_secs),
        Duration::from_secs(args.login_lockout_secs),
    ));
    let locks = Arc::new(LockManager::new());
    let store_for_tasks = store.clone();
    let limiter_for_tasks = limiter.clone();

    let upload_limit = if args.upload_max_size == 0 {
        DefaultBodyLimit::disable()
    } else {
        DefaultBodyLimit::max((args.upload_max_size + UPLOAD_BODY_OVERHEAD) as usize)
    };

    let app = Router::new()
        .route("/", get(api::dispatch))
        .route("/api.php", get(api::dispatch))
        .route("/api/login", post(auth::login))
        .route("/api/me", get(auth::me))
        .route("/api/upload", post(upload::handle_upload).layer(upload_limit))
        .fallback(api::endpoint_not_found)
        .layer(middleware::from_fn(http::handle_preflight))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let forwarded_ip =
                        http::extract_forwarded_ip(request.headers()).map(|ip| ip.to_string());
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.to_string());
                    let client_ip = forwarded_ip
                        .or(connect_ip)
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(app_config))
        .layer(Extension(root))
        .layer(Extension(store))
        .layer(Extension(limiter))
        .layer(Extension(locks))
        .layer(build_cors_layer(args.cors_origins.as_deref()));

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let listener = TcpListener::bind(addr).await?;
    info!("🚀 Starting HTTP server at {}", addr);

    spawn_background_tasks(store_for_tasks, limiter_for_tasks);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
}

mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use quill_api::auth::{AppState, AppStateInner};
use quill_gateway::{Dispatcher, Store, connection, run_reaper_loop};
use quill_sync::{ReactiveBackend, SystemClock};

use crate::config::Config;

#[derive(Deserialize)]
struct GatewayQuery {
    token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quill=debug,tower_http=debug".into()),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("FATAL: {:#}", e);
            eprintln!("FATAL: {:#}", e);
            eprintln!("       Set it in your .env file and restart.");
            std::process::exit(1);
        }
    };

    // Init database
    let db = Arc::new(quill_db::Database::open(&config.db_path)?);

    // Shared state
    let dispatcher = Dispatcher::new(config.presence.timeout_delta()?);
    let store = Arc::new(Store::new(
        db,
        dispatcher,
        Arc::new(SystemClock),
        config.jwt_secret.clone(),
    ));
    let app_state: AppState = Arc::new(AppStateInner {
        store: store.clone(),
        jwt_secret: config.jwt_secret.clone(),
        limits: config.limits,
        policy: config.policy.clone(),
    });

    // Background presence reaper
    let shutdown = CancellationToken::new();
    let reaper = tokio::spawn(run_reaper_loop(store.clone(), config.reap_interval, shutdown.clone()));

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(store);

    let app = Router::new()
        .merge(quill_api::router(app_state))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Quill server listening on {}", addr);
    info!(
        "Presence: heartbeat every {:?}, timeout {:?}, reaper every {:?}",
        config.presence.heartbeat_interval,
        config.presence.timeout(),
        config.reap_interval
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    let _ = reaper.await;

    Ok(())
}

/// Resolve the optional `?token=` before upgrading. A missing or invalid
/// token gives an anonymous, read-only connection.
async fn ws_upgrade(
    State(store): State<Arc<Store>>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let viewer_id = match query.token.as_deref() {
        Some(token) => store.get_user_id(token).await,
        None => None,
    };
    ws.on_upgrade(move |socket| connection::handle_connection(socket, store, viewer_id))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}

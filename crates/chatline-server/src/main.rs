mod config;

use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderValue, Method, header::{AUTHORIZATION, CONTENT_TYPE}},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use chatline_api::auth::{self, AppState, AppStateInner, decode_token};
use chatline_api::middleware::require_auth;
use chatline_api::{friends, groups, messages};
use chatline_db::Database;
use chatline_gateway::{ChannelRegistry, MessageDispatcher, Notifier, connection};

use crate::config::ServerConfig;

#[derive(Clone)]
struct GatewayState {
    dispatcher: MessageDispatcher,
    jwt_secret: String,
}

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatline=debug,tower_http=debug".into()),
        )
        .init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: {:#}", e);
            eprintln!("       Set it in your .env file and restart.");
            std::process::exit(1);
        }
    };

    // Init database
    let db = Arc::new(Database::open(&config.db_path)?);

    // Realtime core
    let registry = ChannelRegistry::new();
    let dispatcher = MessageDispatcher::new(db.clone(), registry.clone());
    let notifier = Notifier::new(registry.clone());

    let app_state: AppState = Arc::new(AppStateInner {
        db: db.clone(),
        store: db,
        notifier,
        jwt_secret: config.jwt_secret.clone(),
        token_ttl: chrono::Duration::days(config.token_ttl_days),
    });

    let gateway_state = GatewayState {
        dispatcher,
        jwt_secret: config.jwt_secret.clone(),
    };

    // Routes
    let public_routes = Router::new()
        .route("/api/register", post(auth::register))
        .route("/api/login", post(auth::login))
        .with_state(app_state.clone());

    let protected_routes = Router::new()
        .route("/api/friends", get(friends::list_friends))
        .route("/api/friends/request", post(friends::send_friend_request))
        .route("/api/friends/pending", get(friends::list_pending))
        .route("/api/friends/accept", post(friends::accept_friend_request))
        .route("/api/groups", get(groups::list_groups).post(groups::create_group))
        .route("/api/groups/join", post(groups::join_group))
        .route("/api/groups/{group_id}/messages", get(groups::group_messages))
        .route("/api/messages/{friend_id}", get(messages::direct_messages))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_auth))
        .with_state(app_state);

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(gateway_state);

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(config.cors_origin.as_deref())?),
        );

    let addr = config.addr()?;
    info!("Chatline server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry))
        .await?;

    Ok(())
}

fn cors_layer(origin: Option<&str>) -> anyhow::Result<CorsLayer> {
    let allow_origin = match origin {
        Some(origin) => AllowOrigin::exact(origin.parse::<HeaderValue>()?),
        None => AllowOrigin::any(),
    };

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]))
}

/// Token travels as a query parameter since browsers cannot set headers on
/// a WebSocket upgrade.
async fn ws_upgrade(
    State(state): State<GatewayState>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let claims = match decode_token(&state.jwt_secret, &query.token) {
        Ok(claims) => claims,
        Err(e) => {
            warn!("Rejected gateway upgrade: {}", e);
            return e.into_response();
        }
    };

    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state.dispatcher, claims.sub, claims.username)
    })
}

/// Resolves on Ctrl-C or SIGTERM, closing every live connection queue so
/// upgraded sockets wind down alongside the HTTP server.
async fn shutdown_signal(registry: ChannelRegistry) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }

    registry.shutdown().await;
}

pub mod auth;
pub mod error;
mod gateway;
mod handlers;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::dispatch::Dispatcher;
use crate::ingest::{IngestLimits, ResultIngestor};
use crate::queue::PollQueue;
use crate::registry::ConnectionRegistry;
use crate::store::{CommandStore, IncidentStore};

use gateway::agent_socket;
use handlers::*;

#[derive(Clone)]
pub struct AppState {
    pub registry: ConnectionRegistry,
    pub dispatcher: Dispatcher,
    pub queue: PollQueue,
    pub ingestor: ResultIngestor,
    pub commands: Arc<dyn CommandStore>,
    /// Cancelled once on server shutdown; agent sockets send a close frame.
    pub shutdown: CancellationToken,
    /// Open agent sockets.
    pub agent_sockets: Arc<AtomicUsize>,
    pub max_connections: usize,
    /// How long a new socket may stay open without sending `register`.
    pub register_timeout: Duration,
}

impl AppState {
    pub fn new(
        config: &GatewayConfig,
        commands: Arc<dyn CommandStore>,
        incidents: Arc<dyn IncidentStore>,
    ) -> Self {
        let registry = ConnectionRegistry::new();
        Self {
            dispatcher: Dispatcher::new(registry.clone(), commands.clone(), incidents.clone()),
            queue: PollQueue::new(commands.clone(), config.poll.batch_limit),
            ingestor: ResultIngestor::new(
                commands.clone(),
                incidents,
                IngestLimits::from(&config.limits),
            ),
            registry,
            commands,
            shutdown: CancellationToken::new(),
            agent_sockets: Arc::new(AtomicUsize::new(0)),
            max_connections: config.server.max_connections,
            register_timeout: config.registry.heartbeat_timeout(),
        }
    }
}

/// Configuration for the HTTP/WS router.
///
/// Use `RouterConfig::default()` in tests for a minimal no-auth setup.
pub struct RouterConfig {
    pub token: Option<String>,
    pub cors_origins: Vec<String>,
    pub max_request_bytes: usize,
    pub max_result_bytes: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            token: None,
            cors_origins: vec![],
            max_request_bytes: 32 * 1024 * 1024,
            max_result_bytes: 256 * 1024 * 1024,
        }
    }
}

impl From<&GatewayConfig> for RouterConfig {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            token: config.server.token.clone(),
            cors_origins: config.server.cors_origins.clone(),
            max_request_bytes: config.server.max_request_bytes,
            max_result_bytes: config.server.max_result_bytes,
        }
    }
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let result_routes = Router::new()
        .route("/fetch", post(fetch_result))
        .route("/tunnel-fetch", post(tunnel_fetch_result))
        .route("/screenshot", post(screenshot_result))
        .route("/snapshot", post(snapshot_result))
        .route("/popup", post(popup_result))
        .layer(DefaultBodyLimit::max(config.max_result_bytes));

    let protected = Router::new()
        .route("/ws", get(agent_socket))
        .route("/commands", post(submit_command))
        .route("/commands/poll", post(poll_commands))
        .route("/commands/{id}", get(get_command))
        .route("/commands/{id}/results", get(command_results))
        .nest("/results", result_routes)
        .route("/incidents/{id}/session", post(sync_session))
        .route("/agents", get(list_agents))
        .with_state(state.clone());

    let protected = match config.token {
        Some(token) => protected.layer(axum::middleware::from_fn(move |req, next| {
            let t = token.clone();
            async move { auth::require_auth(t, req, next).await }
        })),
        None => protected,
    };

    let router = Router::new()
        .route("/health", get(health))
        .with_state(state)
        .merge(protected)
        .layer(DefaultBodyLimit::max(config.max_request_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ));

    // Conditionally apply CORS if origins are configured.
    if config.cors_origins.is_empty() {
        router
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        router.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]),
        )
    }
}

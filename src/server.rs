use crate::algorithms::AlgorithmRegistry;
use crate::clock::SystemClock;
use crate::config::Config;
use crate::config_validator::ConfigValidator;
use crate::error::Result;
use crate::handlers::{
    forward, health_check, metrics, readiness_check, reset_rate_limit, AppState, SharedState,
};
use crate::health::HealthChecker;
use crate::middleware::{admin_auth_middleware, logging_middleware, rate_limit_middleware};
use crate::store::{MemoryStore, RedisStore, StateStore};
use crate::throttler::Throttler;
use axum::routing::{delete, get};
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// Health and admin routes are served directly, the admin ones behind the
/// bearer token check. Every other path passes the admission middleware
/// before reaching the upstream handler.
pub fn create_app(state: SharedState) -> Router {
    let protected = Router::new()
        .fallback(forward)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ));

    let admin = Router::new()
        .route("/admin/metrics", get(metrics))
        .route("/admin/rate-limit/:client_key", delete(reset_rate_limit))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            admin_auth_middleware,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .merge(admin)
        .with_state(state)
        .merge(protected)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

/// Wire the store, the selected algorithm and the throttler from configuration.
pub fn build_state(config: &Config, registry: &AlgorithmRegistry) -> Result<SharedState> {
    let settings = config.rate_limit_settings(registry)?;

    let (store, backend): (Arc<dyn StateStore>, &'static str) = if config.uses_redis() {
        (Arc::new(RedisStore::new(config.redis_url.trim())?), "redis")
    } else {
        tracing::warn!("No Redis URL configured, rate limit state is local to this instance");
        (Arc::new(MemoryStore::new()), "memory")
    };

    let params = settings.limit_params(config.max_attempts, &config.key_prefix);
    let algorithm = registry.select(&settings.algorithm, store.clone(), params);

    tracing::info!(
        algorithm = algorithm.name(),
        requests_per_second = settings.requests_per_second,
        burst_capacity = settings.burst_capacity,
        window_size_seconds = settings.window_size_seconds,
        whitelisted = settings.whitelist_clients.len(),
        failure_policy = ?config.failure_policy,
        backend = backend,
        "Rate limiting configured"
    );

    let health = HealthChecker::new(
        store.clone(),
        backend,
        algorithm.name(),
        config.store_timeout(),
    );
    let throttler = Throttler::new(algorithm, store)
        .with_whitelist(settings.whitelist())
        .with_clock(Arc::new(SystemClock))
        .with_failure_policy(config.failure_policy)
        .with_store_timeout(config.store_timeout())
        .with_expose_headers(config.expose_headers);

    if config.admin_token.is_none() {
        tracing::warn!("No admin token configured, admin routes are disabled");
    }

    Ok(AppState::new(throttler, health, config.admin_token.clone()))
}

pub struct Server {
    app: Router,
    bind_addr: SocketAddr,
}

impl Server {
    pub fn new(config: Config) -> Result<Self> {
        ConfigValidator::validate_server_config(&config)?;

        let registry = AlgorithmRegistry::with_builtin();
        let state = build_state(&config, &registry)?;

        Ok(Self {
            app: create_app(state),
            bind_addr: config.bind_addr,
        })
    }

    pub async fn run(self) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        tracing::info!("Gatekeeper listening on {}", self.bind_addr);
        tracing::info!("Health check available at /health");
        tracing::info!("Metrics available at /admin/metrics");

        // Run server with graceful shutdown
        axum::serve(
            listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}

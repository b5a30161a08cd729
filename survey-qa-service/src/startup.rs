//! Application startup and lifecycle management.

use crate::config::{LlmProvider, QaConfig};
use crate::handlers;
use crate::metering::{PricingTable, UsageStore};
use crate::services::providers::bedrock::{BedrockChatModel, BedrockConfig};
use crate::services::providers::mock::MockChatModel;
use crate::services::providers::ChatModel;
use crate::services::{AnalystFactory, PgSurveyTools, RequestHarness, SurveyDb};
use axum::{
    http::Request,
    middleware::from_fn,
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::signal;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub harness: Arc<RequestHarness>,
    pub default_timeout: Duration,
    /// Checked by the readiness probe when present.
    pub db: Option<SurveyDb>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::health::root))
        .route("/run", post(handlers::run::run))
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check))
        .route("/metrics", get(handlers::metrics::metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
            let request_id = request
                .headers()
                .get("x-request-id")
                .and_then(|value| value.to_str().ok())
                .unwrap_or("-");

            tracing::info_span!(
                "http_request",
                request_id = %request_id,
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
            )
        }))
        .layer(from_fn(request_id_middleware))
        .layer(CorsLayer::permissive())
}

/// Pricing table with the optional override file applied. Fails when the
/// configured model has no price.
pub fn load_pricing(config: &QaConfig) -> Result<PricingTable, AppError> {
    let pricing = match &config.llm.pricing_file {
        Some(path) => PricingTable::from_file(path).map_err(AppError::ConfigError)?,
        None => PricingTable::builtin(),
    };

    pricing
        .price(&config.llm.model_id)
        .map_err(|e| AppError::ConfigError(anyhow::Error::new(e)))?;

    Ok(pricing)
}

fn build_model(config: &QaConfig, runtime: Handle) -> Result<Arc<dyn ChatModel>, AppError> {
    match config.llm.provider {
        LlmProvider::Bedrock => {
            let bedrock_config = BedrockConfig {
                region: config.llm.region.clone(),
                api_key: config.llm.api_key.clone(),
                model_id: config.llm.model_id.clone(),
                endpoint: config.llm.endpoint.clone(),
                temperature: Some(config.llm.temperature),
                max_tokens: Some(config.llm.max_tokens),
                request_timeout: config.llm.request_timeout,
            };
            let model = BedrockChatModel::new(bedrock_config, runtime)
                .map_err(|e| AppError::ConfigError(anyhow::Error::new(e)))?;
            Ok(Arc::new(model))
        }
        LlmProvider::Mock => Ok(Arc::new(MockChatModel::new(config.llm.model_id.clone()))),
    }
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: QaConfig) -> Result<Self, AppError> {
        let pricing = load_pricing(&config).map_err(|e| {
            tracing::error!("Pricing validation failed: {}", e);
            e
        })?;

        let runtime = Handle::current();
        let model = build_model(&config, runtime.clone())?;

        tracing::info!(
            provider = ?config.llm.provider,
            model = %config.llm.model_id,
            region = %config.llm.region,
            "Initialized LLM provider"
        );

        let db = SurveyDb::connect_lazy(&config.database.url(), config.database.max_connections)?;
        let tools = Arc::new(PgSurveyTools::new(db.clone(), runtime));
        let factory = Arc::new(AnalystFactory::new(
            tools,
            config.run.analyst_max_iterations,
        ));

        let harness = RequestHarness::new(UsageStore::new(), pricing, model, factory);

        let state = AppState {
            harness: Arc::new(harness),
            default_timeout: config.run.default_timeout,
            db: Some(db),
        };

        // Port 0 binds a random port for testing
        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!("Survey QA service listening on port {}", port);

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run the application until a shutdown signal arrives.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = build_router(self.state);

        axum::serve(self.listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| {
                tracing::error!("HTTP server error: {}", e);
                std::io::Error::other(format!("HTTP server error: {}", e))
            })
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

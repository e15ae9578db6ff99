//! Service host for the messaging core.
//!
//! Wires a broker connection, the saga orchestrator, the order fulfillment
//! participants and the circuit breaker registry together, and exposes
//! health, metrics and saga status over HTTP.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use resilience::{CircuitBreakerRegistry, InMemoryIdempotencyStore};
use saga::{
    FulfillmentParticipants, InMemoryInventoryService, InMemoryPaymentService,
    InMemoryShippingService, SagaOrchestrator, SagaRegistry,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use transport::{Broker, Connection};

use config::Config;

/// Name of the breaker guarding the payment gateway.
pub const PAYMENT_GATEWAY: &str = "payment-gateway";

/// In-memory services backing the fulfillment participants.
#[derive(Clone, Default)]
pub struct DemoServices {
    pub inventory: InMemoryInventoryService,
    pub payment: InMemoryPaymentService,
    pub shipping: InMemoryShippingService,
}

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub connection: Connection,
    pub orchestrator: Arc<SagaOrchestrator>,
    pub breakers: CircuitBreakerRegistry,
    pub services: DemoServices,
    pub metrics: PrometheusHandle,
}

/// Connects to the broker and starts the orchestrator and participants.
#[tracing::instrument(skip_all, fields(prefetch = config.prefetch))]
pub async fn bootstrap(
    config: &Config,
    broker: Arc<dyn Broker>,
    metrics: PrometheusHandle,
) -> transport::Result<Arc<AppState>> {
    let connection = Connection::new(broker, config.connection_config());
    connection.connect().await?;

    let orchestrator = Arc::new(SagaOrchestrator::new(
        connection.publisher(),
        SagaRegistry::new(),
    ));
    orchestrator
        .listen(&connection, config.retry_policy())
        .await?;

    let breakers = CircuitBreakerRegistry::new(config.breaker_config());
    let services = DemoServices::default();
    let store = Arc::new(InMemoryIdempotencyStore::new(config.idempotency_config()));
    FulfillmentParticipants {
        inventory: services.inventory.clone(),
        payment: services.payment.clone(),
        shipping: services.shipping.clone(),
        payment_breaker: breakers.get_or_create(PAYMENT_GATEWAY),
    }
    .install(&connection, &config.retry_policy(), store, config.prefetch)
    .await?;

    tracing::info!("messaging core started");
    Ok(Arc::new(AppState {
        connection,
        orchestrator,
        breakers,
        services,
        metrics,
    }))
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(routes::health::check))
        .route("/metrics", get(routes::metrics::get))
        .route("/breakers", get(routes::health::breakers))
        .route("/sagas", get(routes::sagas::stats))
        .route("/sagas/{id}", get(routes::sagas::get))
        .route("/orders", post(routes::orders::create))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

//! HTTP API server for the checkout coordinator and inventory engine.
//!
//! Exposes checkout and stock endpoints, with structured logging (tracing)
//! and Prometheus metrics. Order and payment collaborators are in-process.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use checkout::{
    CheckoutCoordinator, Collaborators, ExpiryReaper, InMemoryOrderService,
    InMemoryPaymentService, InMemorySessionStore, SessionStore,
};
use events::{SharedPublisher, TracingPublisher};
use inventory::{InMemoryStockStore, ReservationEngine, StockStore};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use routes::AppState;
use routes::metrics::MetricsState;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: StockStore + 'static>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(MetricsState {
            handle: metrics_handle,
            coordinator: state.coordinator.clone(),
        });

    Router::new()
        .route("/health", get(routes::health::check::<S>))
        .route("/checkouts", post(routes::checkouts::create::<S>))
        .route("/checkouts/{id}", get(routes::checkouts::get::<S>))
        .route("/stock", axum::routing::put(routes::stock::set::<S>))
        .route("/stock/availability", post(routes::stock::availability::<S>))
        .route("/stock/adjust", post(routes::stock::adjust::<S>))
        .route(
            "/stock/{product_id}/{variant_id}",
            get(routes::stock::get::<S>),
        )
        .route("/reservations/{id}", get(routes::stock::reservation::<S>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Wires the engine, coordinator and reaper over the given stores.
///
/// `shutdown` is observed by the coordinator so in-flight sagas abandon
/// their current step and compensate when the process stops.
pub fn create_state<S: StockStore + 'static>(
    config: &Config,
    stock: S,
    sessions: Arc<dyn SessionStore>,
    publisher: SharedPublisher,
    shutdown: Option<watch::Receiver<bool>>,
    storage: &'static str,
) -> (Arc<AppState<S>>, ExpiryReaper) {
    let engine = Arc::new(ReservationEngine::new(
        stock,
        config.engine.clone(),
        publisher.clone(),
    ));

    let collaborators = Collaborators {
        sessions,
        inventory: engine.clone(),
        orders: Arc::new(InMemoryOrderService::new()),
        payments: Arc::new(InMemoryPaymentService::new()),
    };
    let mut coordinator = CheckoutCoordinator::new(config.checkout.clone(), collaborators, publisher);
    if let Some(rx) = shutdown {
        coordinator = coordinator.with_shutdown(rx);
    }
    let coordinator = Arc::new(coordinator);

    let reaper = ExpiryReaper::new(coordinator.clone(), engine.clone(), config.reaper);
    let state = Arc::new(AppState {
        coordinator,
        engine,
        storage,
    });
    (state, reaper)
}

/// Creates application state backed entirely by in-memory stores.
pub fn create_default_state(config: &Config) -> (Arc<AppState<InMemoryStockStore>>, ExpiryReaper) {
    create_state(
        config,
        InMemoryStockStore::new(),
        Arc::new(InMemorySessionStore::new()),
        Arc::new(TracingPublisher),
        None,
        "memory",
    )
}

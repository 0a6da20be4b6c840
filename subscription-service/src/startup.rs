//! Application startup and lifecycle management.

use crate::clock::{Clock, SystemClock};
use crate::config::{StoreBackend, SubscriptionConfig};
use crate::engine::{
    EngineDeps, HistorySnapshotter, OrderCompletion, PeriodGenerator, PeriodRerun,
    PeriodTransitionEngine, StatusEngine,
};
use crate::handlers::{health, orders, subscriptions};
use crate::scheduler::Scheduler;
use crate::services::{
    init_metrics, Database, EventSink, HttpOrderWorkflow, HttpTelcoProvider, InMemoryStore,
    OrderDispatcher, OrderWorker, OrderWorkflow, SubscriptionStore, TelcoProvider,
    TracingEventSink,
};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SubscriptionStore>,
    pub status: StatusEngine,
    pub rerun: Arc<PeriodRerun>,
    pub completion: Arc<OrderCompletion>,
    pub clock: Arc<dyn Clock>,
}

/// External collaborators the application is wired with.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn SubscriptionStore>,
    pub workflow: Arc<dyn OrderWorkflow>,
    pub telco: Arc<dyn TelcoProvider>,
    pub events: Arc<dyn EventSink>,
    pub clock: Arc<dyn Clock>,
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
    scheduler: Option<Scheduler>,
    worker: OrderWorker,
    shutdown: CancellationToken,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: SubscriptionConfig) -> Result<Self, AppError> {
        let store: Arc<dyn SubscriptionStore> = match (config.store, &config.database) {
            (StoreBackend::Postgres, Some(database)) => {
                let db = Database::new(
                    &database.url,
                    database.max_connections,
                    database.min_connections,
                )
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                    e
                })?;

                db.run_migrations().await.map_err(|e| {
                    tracing::error!(error = %e, "Failed to run migrations");
                    e
                })?;

                Arc::new(db)
            }
            (StoreBackend::Postgres, None) => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Postgres store selected without database settings"
                )))
            }
            (StoreBackend::Memory, _) => {
                tracing::warn!("Using in-memory store; state is lost on restart");
                Arc::new(InMemoryStore::new())
            }
        };

        let workflow = HttpOrderWorkflow::new(
            config.order_service.url.clone(),
            config.order_service.timeout,
        )?;
        let telco = HttpTelcoProvider::new(
            config.telco_service.url.clone(),
            config.telco_service.timeout,
        )?;

        Self::build_with(
            config,
            Collaborators {
                store,
                workflow: Arc::new(workflow),
                telco: Arc::new(telco),
                events: Arc::new(TracingEventSink),
                clock: Arc::new(SystemClock),
            },
        )
        .await
    }

    /// Build the application around the given collaborators.
    /// Tests use this to substitute fakes for the store and upstream services.
    pub async fn build_with(
        config: SubscriptionConfig,
        collaborators: Collaborators,
    ) -> Result<Self, AppError> {
        init_metrics();

        let Collaborators {
            store,
            workflow,
            telco,
            events,
            clock,
        } = collaborators;

        let (orders, worker) = OrderDispatcher::queued(
            workflow,
            store.clone(),
            config.orders.retry_max_elapsed,
            config.orders.queue_size,
        );

        let deps = EngineDeps {
            store: store.clone(),
            orders,
            events,
        };
        let status = StatusEngine::new(deps.clone());

        let scheduler = if config.scheduler.enabled {
            let mut scheduler = Scheduler::new(clock.clone(), config.scheduler.tick);
            scheduler
                .register(Arc::new(PeriodGenerator::new(
                    deps.clone(),
                    config.scheduler.generator_batch_size,
                )))
                .register(Arc::new(PeriodTransitionEngine::new(
                    deps.clone(),
                    status.clone(),
                    config.scheduler.transition_batch_size,
                )))
                .register(Arc::new(HistorySnapshotter::new(
                    store.clone(),
                    telco,
                    config.scheduler.history_batch_size,
                    config.scheduler.history_window(),
                )?));
            Some(scheduler)
        } else {
            tracing::info!("Scheduler disabled by configuration");
            None
        };

        let state = AppState {
            store: store.clone(),
            status: status.clone(),
            rerun: Arc::new(PeriodRerun::new(deps)),
            completion: Arc::new(OrderCompletion::new(store, status)),
            clock,
        };

        let addr = format!("{}:{}", config.common.host, config.common.port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Subscription service listener bound");

        Ok(Self {
            port,
            listener,
            state,
            scheduler,
            worker,
            shutdown: CancellationToken::new(),
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Cancelling this token stops the server, the scheduler and the order worker.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the application until the shutdown token is cancelled.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = router(self.state);

        let worker = tokio::spawn(self.worker.run(self.shutdown.clone()));
        let scheduler = self
            .scheduler
            .map(|scheduler| tokio::spawn(scheduler.run(self.shutdown.clone())));

        tracing::info!(
            service = "subscription-service",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        let shutdown = self.shutdown.clone();
        let result = axum::serve(self.listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;

        self.shutdown.cancel();
        if let Some(scheduler) = scheduler {
            let _ = scheduler.await;
        }
        let _ = worker.await;

        result.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}

/// HTTP routes with request-id, metrics and trace layers.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .route("/metrics", get(health::metrics_endpoint))
        .route("/subscriptions", post(subscriptions::create_subscription))
        .route("/subscriptions/:id", get(subscriptions::get_subscription))
        .route("/subscriptions/:id/periods", get(subscriptions::list_periods))
        .route("/subscriptions/:id/history", get(subscriptions::list_history))
        .route("/subscriptions/:id/activate", post(subscriptions::activate))
        .route("/subscriptions/:id/cancel", post(subscriptions::cancel))
        .route("/subscriptions/:id/uncancel", post(subscriptions::uncancel))
        .route("/subscriptions/:id/suspend", post(subscriptions::suspend))
        .route("/subscriptions/:id/reactivate", post(subscriptions::reactivate))
        .route("/subscriptions/:id/deactivate", post(subscriptions::deactivate))
        .route(
            "/subscriptions/:id/periods/:period_id/rerun",
            post(subscriptions::rerun_period),
        )
        .route("/orders/:order_id/completion", post(orders::order_completion))
        .route_layer(middleware::from_fn(metrics_middleware))
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn(request_id_middleware))
                .layer(TraceLayer::new_for_http().make_span_with(
                    |request: &axum::http::Request<_>| {
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
                        )
                    },
                )),
        )
        .with_state(state)
}

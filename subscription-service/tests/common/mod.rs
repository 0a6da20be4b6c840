//! Test helper module for subscription-service integration tests.
//!
//! Engines run against the in-memory store with fake upstream services and a
//! manual clock. `TestApp` serves the same wiring over HTTP on a random port.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use service_core::config::Config as CoreConfig;
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use subscription_service::clock::Clock;
use subscription_service::config::{
    OrderDispatchConfig, SchedulerConfig, StoreBackend, SubscriptionConfig, UpstreamConfig,
};
use subscription_service::engine::{
    EngineDeps, HistorySnapshotter, OrderCompletion, PeriodGenerator, PeriodRerun,
    PeriodTransitionEngine, StatusEngine, Transition, TransitionOutcome,
};
use subscription_service::models::{
    CreateSubscription, EventEnvelope, NewPeriod, Offer, OrderRef, OrderStatus, PeriodStatus,
    Plan, Subscription, SubscriptionPeriod, TelcoConfig, TelcoUsage,
};
use subscription_service::services::{
    init_metrics, EventSink, InMemoryStore, OrderDispatcher, OrderWorker, OrderWorkflow,
    SubscriptionStore, TelcoProvider,
};
use subscription_service::startup::{Application, Collaborators};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const DAY: i64 = 86_400;

/// 2026-01-01T00:00:00Z, the start of every test timeline.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

pub fn days(n: i64) -> Duration {
    Duration::days(n)
}

/// A call made against the fake order workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderCall {
    RenewPlan {
        order_id: Uuid,
        offer_id: Uuid,
        subscription_id: Uuid,
        period_id: Uuid,
    },
    DeactivatePlan {
        order_id: Uuid,
        subscription_id: Uuid,
    },
    Abort(Uuid),
    Retry(Uuid),
}

#[derive(Default)]
struct WorkflowState {
    calls: Vec<OrderCall>,
    orders: HashMap<Uuid, OrderStatus>,
    failing_creates: usize,
    cancel_on_create: Option<(Arc<InMemoryStore>, Uuid)>,
}

/// Order workflow that records calls and keeps order status in memory.
#[derive(Default)]
pub struct FakeOrderWorkflow {
    state: Mutex<WorkflowState>,
}

impl FakeOrderWorkflow {
    pub fn calls(&self) -> Vec<OrderCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Renewal orders created for `period_id`, oldest first.
    pub fn renewals_for(&self, period_id: Uuid) -> Vec<Uuid> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                OrderCall::RenewPlan {
                    order_id,
                    period_id: p,
                    ..
                } if p == period_id => Some(order_id),
                _ => None,
            })
            .collect()
    }

    pub fn renewal_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, OrderCall::RenewPlan { .. }))
            .count()
    }

    pub fn deactivations(&self) -> Vec<Uuid> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                OrderCall::DeactivatePlan {
                    subscription_id, ..
                } => Some(subscription_id),
                _ => None,
            })
            .collect()
    }

    pub fn aborted(&self) -> Vec<Uuid> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                OrderCall::Abort(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn retried(&self) -> Vec<Uuid> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                OrderCall::Retry(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn set_status(&self, order_id: Uuid, status: OrderStatus) {
        self.state.lock().unwrap().orders.insert(order_id, status);
    }

    pub fn status_of(&self, order_id: Uuid) -> Option<OrderStatus> {
        self.state.lock().unwrap().orders.get(&order_id).copied()
    }

    /// The next renewal order cancels `period_id` while it is being created,
    /// as a concurrent cancel would.
    pub fn cancel_period_on_create(&self, store: Arc<InMemoryStore>, period_id: Uuid) {
        self.state.lock().unwrap().cancel_on_create = Some((store, period_id));
    }

    /// The next `n` order creations fail as if the workflow were down.
    pub fn fail_next_creates(&self, n: usize) {
        self.state.lock().unwrap().failing_creates = n;
    }

    fn create(&self, call: impl FnOnce(Uuid) -> OrderCall) -> Result<OrderRef, AppError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_creates > 0 {
            state.failing_creates -= 1;
            return Err(AppError::ServiceUnavailable);
        }

        let order_id = Uuid::new_v4();
        state.calls.push(call(order_id));
        state.orders.insert(order_id, OrderStatus::Pending);
        Ok(OrderRef {
            order_id,
            status: OrderStatus::Pending,
        })
    }
}

#[async_trait]
impl OrderWorkflow for FakeOrderWorkflow {
    async fn create_renew_plan(
        &self,
        _user_id: Uuid,
        offer_id: Uuid,
        subscription_id: Uuid,
        period_id: Uuid,
    ) -> Result<OrderRef, AppError> {
        let cancel = self.state.lock().unwrap().cancel_on_create.take();
        if let Some((store, cancelled)) = cancel {
            store
                .update_period_status(cancelled, &[], PeriodStatus::Cancelled)
                .await?;
        }
        self.create(|order_id| OrderCall::RenewPlan {
            order_id,
            offer_id,
            subscription_id,
            period_id,
        })
    }

    async fn create_deactivate_plan(
        &self,
        _user_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<OrderRef, AppError> {
        self.create(|order_id| OrderCall::DeactivatePlan {
            order_id,
            subscription_id,
        })
    }

    async fn abort(&self, order_id: Uuid) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(OrderCall::Abort(order_id));
        state.orders.insert(order_id, OrderStatus::Aborted);
        Ok(())
    }

    async fn retry(&self, order_id: Uuid) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(OrderCall::Retry(order_id));
        Ok(())
    }

    async fn get_order(&self, order_id: Uuid) -> Result<OrderRef, AppError> {
        let state = self.state.lock().unwrap();
        state
            .orders
            .get(&order_id)
            .map(|status| OrderRef {
                order_id,
                status: *status,
            })
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Order not found")))
    }
}

/// Telco provider returning whatever usage and config the test sets.
#[derive(Default)]
pub struct FakeTelcoProvider {
    usage: Mutex<Vec<TelcoUsage>>,
    configs: Mutex<Vec<TelcoConfig>>,
    unavailable: Mutex<bool>,
}

impl FakeTelcoProvider {
    pub fn set_usage(&self, usage: Vec<TelcoUsage>) {
        *self.usage.lock().unwrap() = usage;
    }

    pub fn set_configs(&self, configs: Vec<TelcoConfig>) {
        *self.configs.lock().unwrap() = configs;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().unwrap() = unavailable;
    }

    fn check(&self) -> Result<(), AppError> {
        if *self.unavailable.lock().unwrap() {
            Err(AppError::BadGateway("telco provider down".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TelcoProvider for FakeTelcoProvider {
    async fn get_subscription_usage(
        &self,
        subscription_id: Uuid,
        children: &[Uuid],
    ) -> Result<Vec<TelcoUsage>, AppError> {
        self.check()?;
        Ok(self
            .usage
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.subscription_id == subscription_id || children.contains(&u.subscription_id))
            .cloned()
            .collect())
    }

    async fn get_subscription_config(
        &self,
        subscription_id: Uuid,
        children: &[Uuid],
    ) -> Result<Vec<TelcoConfig>, AppError> {
        self.check()?;
        Ok(self
            .configs
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.subscription_id == subscription_id || children.contains(&c.subscription_id))
            .cloned()
            .collect())
    }
}

/// Event sink that keeps every published event.
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<EventEnvelope>>,
}

impl RecordingEventSink {
    pub fn names(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.event.name())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<EventEnvelope> {
        self.events.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl EventSink for RecordingEventSink {
    async fn publish(&self, envelope: EventEnvelope) {
        self.events.lock().unwrap().push(envelope);
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

pub const HISTORY_WINDOW_SECS: u64 = 3600 - 30;

/// Engines wired to the in-memory store, fakes and an inline order dispatcher,
/// so every order call has happened by the time an engine call returns.
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub orders: Arc<FakeOrderWorkflow>,
    pub telco: Arc<FakeTelcoProvider>,
    pub events: Arc<RecordingEventSink>,
    pub deps: EngineDeps,
    pub status: StatusEngine,
    pub generator: PeriodGenerator,
    pub transition: PeriodTransitionEngine,
    pub history: HistorySnapshotter,
    pub rerun: PeriodRerun,
    pub completion: OrderCompletion,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_transition_batch(4)
    }

    pub fn with_transition_batch(transition_batch: i64) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let orders = Arc::new(FakeOrderWorkflow::default());
        let dispatcher = OrderDispatcher::inline(
            orders.clone(),
            store.clone(),
            std::time::Duration::ZERO,
        );
        Self::wire(store, orders, dispatcher, transition_batch)
    }

    /// Orders go through a queue; nothing reaches the workflow until the
    /// returned worker runs.
    pub fn with_queued_orders() -> (Self, OrderWorker) {
        let store = Arc::new(InMemoryStore::new());
        let orders = Arc::new(FakeOrderWorkflow::default());
        let (dispatcher, worker) = OrderDispatcher::queued(
            orders.clone(),
            store.clone(),
            std::time::Duration::ZERO,
            64,
        );
        (Self::wire(store, orders, dispatcher, 4), worker)
    }

    fn wire(
        store: Arc<InMemoryStore>,
        orders: Arc<FakeOrderWorkflow>,
        dispatcher: OrderDispatcher,
        transition_batch: i64,
    ) -> Self {
        init_metrics();

        let telco = Arc::new(FakeTelcoProvider::default());
        let events = Arc::new(RecordingEventSink::default());

        let deps = EngineDeps {
            store: store.clone(),
            orders: dispatcher,
            events: events.clone(),
        };
        let status = StatusEngine::new(deps.clone());

        Self {
            generator: PeriodGenerator::new(deps.clone(), 1),
            transition: PeriodTransitionEngine::new(deps.clone(), status.clone(), transition_batch),
            history: HistorySnapshotter::new(
                store.clone(),
                telco.clone(),
                10,
                std::time::Duration::from_secs(HISTORY_WINDOW_SECS),
            )
            .expect("valid history window"),
            rerun: PeriodRerun::new(deps.clone()),
            completion: OrderCompletion::new(store.clone(), status.clone()),
            status,
            deps,
            store,
            orders,
            telco,
            events,
        }
    }

    /// Register an offer whose plan lasts `valid_for_days`.
    pub async fn offer(&self, valid_for_days: i64, does_auto_renew: bool) -> Uuid {
        seed_offer(&self.store, valid_for_days, does_auto_renew).await
    }

    /// Create a PENDING subscription starting at `starts_at`.
    pub async fn pending(
        &self,
        offer_id: Uuid,
        starts_at: DateTime<Utc>,
    ) -> (Subscription, SubscriptionPeriod) {
        self.status
            .create(&create_input(offer_id, None, starts_at), starts_at)
            .await
            .expect("Failed to create subscription")
    }

    /// Create a subscription and activate it at `starts_at`.
    pub async fn active(
        &self,
        offer_id: Uuid,
        starts_at: DateTime<Utc>,
    ) -> (Subscription, SubscriptionPeriod) {
        let (subscription, period) = self.pending(offer_id, starts_at).await;
        let subscription = self.apply(subscription.subscription_id, Transition::Activate, starts_at).await;
        (subscription, period)
    }

    /// Create a child line of `parent_id` and activate it.
    pub async fn active_child(
        &self,
        parent_id: Uuid,
        offer_id: Uuid,
        starts_at: DateTime<Utc>,
    ) -> Subscription {
        let (child, _) = self
            .status
            .create(&create_input(offer_id, Some(parent_id), starts_at), starts_at)
            .await
            .expect("Failed to create child subscription");
        self.apply(child.subscription_id, Transition::Activate, starts_at).await
    }

    /// Apply a transition that is expected to succeed.
    pub async fn apply(
        &self,
        subscription_id: Uuid,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Subscription {
        match self
            .status
            .apply(subscription_id, transition, now)
            .await
            .expect("Transition failed")
        {
            TransitionOutcome::Applied(subscription) => subscription,
            TransitionOutcome::Skipped => panic!("{} was skipped", transition),
        }
    }

    pub async fn subscription(&self, subscription_id: Uuid) -> Subscription {
        self.store
            .get_subscription(subscription_id)
            .await
            .unwrap()
            .expect("Subscription missing")
    }

    pub async fn periods(&self, subscription_id: Uuid) -> Vec<SubscriptionPeriod> {
        self.store.list_periods(subscription_id).await.unwrap()
    }
}

pub async fn seed_offer(store: &InMemoryStore, valid_for_days: i64, does_auto_renew: bool) -> Uuid {
    let plan = Plan {
        plan_id: Uuid::new_v4(),
        name: format!("{} day plan", valid_for_days),
        valid_for_seconds: valid_for_days * DAY,
        does_auto_renew,
    };
    let offer = Offer {
        offer_id: Uuid::new_v4(),
        plan_id: plan.plan_id,
        name: format!("{} day offer", valid_for_days),
    };
    let offer_id = offer.offer_id;
    store.insert_offer(offer, plan).await;
    offer_id
}

pub fn create_input(
    offer_id: Uuid,
    parent_id: Option<Uuid>,
    starts_at: DateTime<Utc>,
) -> CreateSubscription {
    CreateSubscription {
        user_id: Uuid::new_v4(),
        offer_id,
        parent_id,
        sim_iccid: Some("8944500102198304826".to_string()),
        phone_number_msisdn: Some("447700900123".to_string()),
        starts_at,
    }
}

pub fn test_config() -> SubscriptionConfig {
    SubscriptionConfig {
        common: CoreConfig {
            port: 0, // Random port
            host: "127.0.0.1".to_string(),
        },
        service_name: "subscription-service-test".to_string(),
        log_level: "warn".to_string(),
        otlp_endpoint: None,
        store: StoreBackend::Memory,
        database: None,
        order_service: UpstreamConfig {
            url: "http://localhost:50061".to_string(),
            timeout: std::time::Duration::from_secs(1),
        },
        telco_service: UpstreamConfig {
            url: "http://localhost:50062".to_string(),
            timeout: std::time::Duration::from_secs(1),
        },
        scheduler: SchedulerConfig {
            enabled: false,
            ..Default::default()
        },
        orders: OrderDispatchConfig {
            queue_size: 64,
            retry_max_elapsed: std::time::Duration::ZERO,
        },
    }
}

/// Test application wrapper for HTTP integration tests.
pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub store: Arc<InMemoryStore>,
    pub orders: Arc<FakeOrderWorkflow>,
    pub events: Arc<RecordingEventSink>,
    pub clock: Arc<ManualClock>,
    pub client: reqwest::Client,
    shutdown: CancellationToken,
}

impl TestApp {
    /// Spawn a new test application on a random port.
    pub async fn spawn() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let orders = Arc::new(FakeOrderWorkflow::default());
        let events = Arc::new(RecordingEventSink::default());
        let clock = Arc::new(ManualClock::new(t0()));

        let app = Application::build_with(
            test_config(),
            Collaborators {
                store: store.clone(),
                workflow: orders.clone(),
                telco: Arc::new(FakeTelcoProvider::default()),
                events: events.clone(),
                clock: clock.clone(),
            },
        )
        .await
        .expect("Failed to build test application");

        let port = app.port();
        let shutdown = app.shutdown_token();
        let address = format!("http://127.0.0.1:{}", port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        // Wait for HTTP server to be ready by polling health endpoint
        let client = reqwest::Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }

        TestApp {
            address,
            port,
            store,
            orders,
            events,
            clock,
            client,
            shutdown,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    /// Wait until the queued order worker has made at least `n` calls.
    pub async fn wait_for_order_calls(&self, n: usize) -> Vec<OrderCall> {
        for _ in 0..100 {
            let calls = self.orders.calls();
            if calls.len() >= n {
                return calls;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        }
        panic!(
            "expected {} order calls, got {:?}",
            n,
            self.orders.calls()
        );
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Seed a period of `subscription_id` covering `[starts_at, ends_at)`.
pub async fn seed_period(
    store: &InMemoryStore,
    subscription_id: Uuid,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
    status: PeriodStatus,
) -> SubscriptionPeriod {
    store
        .seed_period(
            &NewPeriod {
                subscription_id,
                offer_id: Uuid::new_v4(),
                starts_at,
                ends_at,
            },
            status,
        )
        .await
}

/// Panics if two uncancelled periods overlap.
pub fn assert_no_overlap(periods: &[SubscriptionPeriod]) {
    let mut live: Vec<&SubscriptionPeriod> = periods
        .iter()
        .filter(|p| p.status != PeriodStatus::Cancelled)
        .collect();
    live.sort_by_key(|p| p.starts_at);
    for pair in live.windows(2) {
        assert!(
            pair[0].ends_at <= pair[1].starts_at,
            "[{}, {}) overlaps [{}, {})",
            pair[0].starts_at,
            pair[0].ends_at,
            pair[1].starts_at,
            pair[1].ends_at
        );
    }
}

//! Services module for subscription-service.

pub mod database;
pub mod dispatcher;
pub mod events;
pub mod memory;
pub mod metrics;
pub mod order_client;
pub mod store;
pub mod telco_client;

pub use database::Database;
pub use dispatcher::{OrderCommand, OrderDispatcher, OrderWorker};
pub use events::{EventSink, TracingEventSink};
pub use memory::InMemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use order_client::{HttpOrderWorkflow, OrderWorkflow};
pub use store::{StatusChangeResult, SubscriptionStore};
pub use telco_client::{HttpTelcoProvider, TelcoProvider};

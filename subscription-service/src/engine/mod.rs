//! Renewal, status and history engines driven by the scheduler and the API.

pub mod completion;
pub mod generator;
pub mod history;
pub mod rerun;
pub mod status;
pub mod transition;

pub use completion::{CompletionOutcome, OrderCompletion};
pub use generator::PeriodGenerator;
pub use history::HistorySnapshotter;
pub use rerun::{PeriodRerun, RerunOutcome};
pub use status::{StatusEngine, Transition, TransitionOutcome};
pub use transition::PeriodTransitionEngine;

use crate::services::{EventSink, OrderDispatcher, SubscriptionStore};
use std::sync::Arc;

/// Collaborators shared by every engine.
#[derive(Clone)]
pub struct EngineDeps {
    pub store: Arc<dyn SubscriptionStore>,
    pub orders: OrderDispatcher,
    pub events: Arc<dyn EventSink>,
}

/// What one job tick did with the subscriptions it selected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub selected: usize,
    pub changed: usize,
    pub skipped: usize,
    pub failed: usize,
}

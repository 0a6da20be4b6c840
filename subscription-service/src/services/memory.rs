//! In-memory `SubscriptionStore`.
//!
//! All state sits behind one async mutex, so each trait method is atomic in the
//! same way a single Postgres transaction is. Used by the test-suite and by
//! `STORE_BACKEND=memory` for local runs without a database.

use crate::models::{
    CreateSubscription, HistoryUsage, NewPeriod, Offer, OrderLink, PeriodCascade, PeriodStatus,
    Plan, StatusChange, Subscription, SubscriptionHistory, SubscriptionPeriod, SubscriptionStatus,
};
use crate::services::store::{StatusChangeResult, SubscriptionStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use service_core::error::AppError;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct State {
    plans: HashMap<Uuid, Plan>,
    offers: HashMap<Uuid, Offer>,
    subscriptions: HashMap<Uuid, Subscription>,
    periods: HashMap<Uuid, SubscriptionPeriod>,
    orders: Vec<OrderLink>,
    history: Vec<SubscriptionHistory>,
    usage: Vec<HistoryUsage>,
}

impl State {
    fn periods_of(&self, subscription_id: Uuid) -> Vec<&SubscriptionPeriod> {
        let mut periods: Vec<&SubscriptionPeriod> = self
            .periods
            .values()
            .filter(|p| p.subscription_id == subscription_id)
            .collect();
        periods.sort_by_key(|p| p.starts_at);
        periods
    }

    fn current_period_end(&self, subscription: &Subscription) -> Option<DateTime<Utc>> {
        subscription
            .current_period_id
            .and_then(|id| self.periods.get(&id))
            .map(|p| p.ends_at)
    }

    fn new_period(period: &NewPeriod, status: PeriodStatus) -> SubscriptionPeriod {
        let now = Utc::now();
        SubscriptionPeriod {
            period_id: Uuid::new_v4(),
            subscription_id: period.subscription_id,
            offer_id: period.offer_id,
            status,
            starts_at: period.starts_at,
            ends_at: period.ends_at,
            created_utc: now,
            updated_utc: now,
        }
    }

    fn starts_taken(&self, subscription_id: Uuid, starts_at: DateTime<Utc>) -> bool {
        self.periods
            .values()
            .any(|p| p.subscription_id == subscription_id && p.starts_at == starts_at)
    }
}

/// Process-local store with the same compare-and-write semantics as Postgres.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an offer and the plan behind it.
    pub async fn insert_offer(&self, offer: Offer, plan: Plan) {
        let mut state = self.state.lock().await;
        state.plans.insert(plan.plan_id, plan);
        state.offers.insert(offer.offer_id, offer);
    }

    /// Insert a period as-is, bypassing generation rules.
    pub async fn seed_period(&self, period: &NewPeriod, status: PeriodStatus) -> SubscriptionPeriod {
        let mut state = self.state.lock().await;
        let row = State::new_period(period, status);
        state.periods.insert(row.period_id, row.clone());
        row
    }

    /// Every history row currently stored, in insertion order.
    pub async fn all_history(&self) -> Vec<SubscriptionHistory> {
        self.state.lock().await.history.clone()
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn get_plan_for_offer(&self, offer_id: Uuid) -> Result<Option<Plan>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .offers
            .get(&offer_id)
            .and_then(|offer| state.plans.get(&offer.plan_id))
            .cloned())
    }

    async fn create_subscription(
        &self,
        input: &CreateSubscription,
        ends_at: DateTime<Utc>,
    ) -> Result<(Subscription, SubscriptionPeriod), AppError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let subscription_id = Uuid::new_v4();

        let period = State::new_period(
            &NewPeriod {
                subscription_id,
                offer_id: input.offer_id,
                starts_at: input.starts_at,
                ends_at,
            },
            PeriodStatus::Pending,
        );

        let subscription = Subscription {
            subscription_id,
            user_id: input.user_id,
            offer_id: input.offer_id,
            parent_id: input.parent_id,
            status: SubscriptionStatus::Pending,
            current_period_id: Some(period.period_id),
            sim_iccid: input.sim_iccid.clone(),
            phone_number_msisdn: input.phone_number_msisdn.clone(),
            activated_at: None,
            canceled_at: None,
            suspended_at: None,
            deactivated_at: None,
            created_utc: now,
            updated_utc: now,
        };

        state.periods.insert(period.period_id, period.clone());
        state
            .subscriptions
            .insert(subscription_id, subscription.clone());

        Ok((subscription, period))
    }

    async fn get_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        Ok(self
            .state
            .lock()
            .await
            .subscriptions
            .get(&subscription_id)
            .cloned())
    }

    async fn list_child_subscriptions(
        &self,
        parent_id: Uuid,
    ) -> Result<Vec<Subscription>, AppError> {
        let state = self.state.lock().await;
        let mut children: Vec<Subscription> = state
            .subscriptions
            .values()
            .filter(|s| s.parent_id == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by_key(|s| (s.created_utc, s.subscription_id));
        Ok(children)
    }

    async fn find_subscriptions_needing_period(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Subscription>, AppError> {
        let state = self.state.lock().await;
        let mut candidates: Vec<(DateTime<Utc>, &Subscription)> = state
            .subscriptions
            .values()
            .filter(|s| s.status == SubscriptionStatus::Active)
            .filter(|s| {
                state
                    .offers
                    .get(&s.offer_id)
                    .and_then(|o| state.plans.get(&o.plan_id))
                    .is_some_and(|p| p.does_auto_renew)
            })
            .filter(|s| {
                !state
                    .periods
                    .values()
                    .any(|p| {
                        p.subscription_id == s.subscription_id
                            && p.status != PeriodStatus::Cancelled
                            && p.is_future(now)
                    })
            })
            .filter_map(|s| state.current_period_end(s).map(|end| (end, s)))
            .collect();

        candidates.sort_by_key(|(end, s)| (*end, s.subscription_id));
        Ok(candidates
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn find_subscriptions_with_ended_period(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Subscription>, AppError> {
        let state = self.state.lock().await;
        let mut ended: Vec<(DateTime<Utc>, &Subscription)> = state
            .subscriptions
            .values()
            .filter_map(|s| state.current_period_end(s).map(|end| (end, s)))
            .filter(|(end, _)| *end <= now)
            .collect();

        ended.sort_by_key(|(end, s)| (*end, s.subscription_id));
        Ok(ended
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn apply_status_change(
        &self,
        change: &StatusChange,
    ) -> Result<Option<StatusChangeResult>, AppError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        match state.subscriptions.get(&change.subscription_id) {
            Some(s) if change.expected.is_empty() || change.expected.contains(&s.status) => {}
            _ => return Ok(None),
        }

        let mut changed = Vec::new();
        let started = match &change.start_period {
            Some(period) if state.starts_taken(period.subscription_id, period.starts_at) => {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "A period starting at {} already exists",
                    period.starts_at
                )));
            }
            Some(period) => {
                let row = State::new_period(period, PeriodStatus::Pending);
                state.periods.insert(row.period_id, row.clone());
                Some(row)
            }
            None => None,
        };

        let Some(subscription) = state.subscriptions.get_mut(&change.subscription_id) else {
            return Ok(None);
        };

        subscription.status = change.status;
        subscription.activated_at = change.activated_at.apply(subscription.activated_at);
        subscription.canceled_at = change.canceled_at.apply(subscription.canceled_at);
        subscription.suspended_at = change.suspended_at.apply(subscription.suspended_at);
        subscription.deactivated_at = change.deactivated_at.apply(subscription.deactivated_at);
        if change.clear_current_period {
            subscription.current_period_id = None;
        }
        if let Some(row) = &started {
            subscription.current_period_id = Some(row.period_id);
            subscription.offer_id = row.offer_id;
        }
        subscription.updated_utc = now;
        let subscription = subscription.clone();

        for period in state.periods.values_mut() {
            if period.subscription_id != change.subscription_id
                || started.as_ref().is_some_and(|s| s.period_id == period.period_id)
            {
                continue;
            }
            let next = match change.periods {
                PeriodCascade::None => None,
                PeriodCascade::CancelPending { after } => (period.status == PeriodStatus::Pending
                    && after.map_or(true, |a| period.starts_at > a))
                .then_some(PeriodStatus::Cancelled),
                PeriodCascade::Reinstate { after } => (period.status == PeriodStatus::Cancelled
                    && period.starts_at > after)
                    .then_some(PeriodStatus::Pending),
            };
            if let Some(status) = next {
                period.status = status;
                period.updated_utc = now;
                changed.push(period.clone());
            }
        }
        changed.extend(started);
        changed.sort_by_key(|p| p.starts_at);

        Ok(Some(StatusChangeResult {
            subscription,
            periods: changed,
        }))
    }

    async fn advance_current_period(
        &self,
        subscription_id: Uuid,
        expected_period_id: Uuid,
        next: &SubscriptionPeriod,
    ) -> Result<bool, AppError> {
        let mut state = self.state.lock().await;
        match state.subscriptions.get_mut(&subscription_id) {
            Some(subscription) if subscription.current_period_id == Some(expected_period_id) => {
                subscription.current_period_id = Some(next.period_id);
                subscription.offer_id = next.offer_id;
                subscription.updated_utc = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_period(&self, period_id: Uuid) -> Result<Option<SubscriptionPeriod>, AppError> {
        Ok(self.state.lock().await.periods.get(&period_id).cloned())
    }

    async fn list_periods(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<SubscriptionPeriod>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .periods_of(subscription_id)
            .into_iter()
            .cloned()
            .collect())
    }

    async fn latest_period(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<SubscriptionPeriod>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .periods_of(subscription_id)
            .into_iter()
            .filter(|p| p.status != PeriodStatus::Cancelled)
            .max_by_key(|p| p.ends_at)
            .cloned())
    }

    async fn find_period_at(
        &self,
        subscription_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<SubscriptionPeriod>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .periods_of(subscription_id)
            .into_iter()
            .filter(|p| p.contains(at) && p.status.can_become_current())
            .max_by_key(|p| p.starts_at)
            .cloned())
    }

    async fn insert_next_period(
        &self,
        period: &NewPeriod,
    ) -> Result<Option<SubscriptionPeriod>, AppError> {
        let mut state = self.state.lock().await;
        if state.starts_taken(period.subscription_id, period.starts_at) {
            return Ok(None);
        }

        let row = State::new_period(period, PeriodStatus::Pending);
        state.periods.insert(row.period_id, row.clone());

        let from_here = state
            .periods
            .values()
            .filter(|p| {
                p.subscription_id == period.subscription_id
                    && p.status != PeriodStatus::Cancelled
                    && p.starts_at >= period.starts_at
            })
            .count();
        if from_here != 1 {
            state.periods.remove(&row.period_id);
            return Err(AppError::InvariantViolation(anyhow::anyhow!(
                "subscription {} would have {} periods starting at or after {}",
                period.subscription_id,
                from_here,
                period.starts_at
            )));
        }

        Ok(Some(row))
    }

    async fn update_period_status(
        &self,
        period_id: Uuid,
        expected: &[PeriodStatus],
        status: PeriodStatus,
    ) -> Result<Option<SubscriptionPeriod>, AppError> {
        let mut state = self.state.lock().await;
        match state.periods.get_mut(&period_id) {
            Some(period) if expected.is_empty() || expected.contains(&period.status) => {
                period.status = status;
                period.updated_utc = Utc::now();
                Ok(Some(period.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn record_order(&self, link: &OrderLink) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        if !state.orders.iter().any(|o| o.order_id == link.order_id) {
            state.orders.push(link.clone());
        }
        Ok(())
    }

    async fn get_order_link(&self, order_id: Uuid) -> Result<Option<OrderLink>, AppError> {
        let state = self.state.lock().await;
        Ok(state.orders.iter().find(|o| o.order_id == order_id).cloned())
    }

    async fn list_orders_for_period(&self, period_id: Uuid) -> Result<Vec<OrderLink>, AppError> {
        let state = self.state.lock().await;
        // Insertion order breaks ties between links created in the same instant.
        let mut orders: Vec<(usize, OrderLink)> = state
            .orders
            .iter()
            .enumerate()
            .filter(|(_, o)| o.period_id == Some(period_id))
            .map(|(i, o)| (i, o.clone()))
            .collect();
        orders.sort_by(|(ia, a), (ib, b)| b.created_utc.cmp(&a.created_utc).then(ib.cmp(ia)));
        Ok(orders.into_iter().map(|(_, o)| o).collect())
    }

    async fn find_subscriptions_due_for_history(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Subscription>, AppError> {
        let state = self.state.lock().await;
        let mut due: Vec<&Subscription> = state
            .subscriptions
            .values()
            .filter(|s| s.status == SubscriptionStatus::Active && s.is_root())
            .filter(|s| {
                !state
                    .history
                    .iter()
                    .any(|h| h.subscription_id == s.subscription_id && h.recorded_at > cutoff)
            })
            .collect();

        due.sort_by_key(|s| (s.created_utc, s.subscription_id));
        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn insert_history_snapshot(
        &self,
        root: &Subscription,
        children: &[Subscription],
        recorded_at: DateTime<Utc>,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SubscriptionHistory>, AppError> {
        let mut state = self.state.lock().await;

        let rows: Vec<SubscriptionHistory> = std::iter::once(root)
            .chain(children.iter())
            .map(|s| SubscriptionHistory {
                history_id: Uuid::new_v4(),
                subscription_id: s.subscription_id,
                recorded_at,
                sim_iccid: s.sim_iccid.clone(),
                phone_number_msisdn: s.phone_number_msisdn.clone(),
                config: None,
            })
            .collect();
        let inserted = rows.len();
        state.history.extend(rows.iter().cloned());

        let recent = state
            .history
            .iter()
            .filter(|h| h.subscription_id == root.subscription_id && h.recorded_at > cutoff)
            .count();
        if recent > 1 {
            let keep = state.history.len() - inserted;
            state.history.truncate(keep);
            return Err(AppError::InvariantViolation(anyhow::anyhow!(
                "multiple_sub_history: subscription {} has {} snapshots newer than {}",
                root.subscription_id,
                recent,
                cutoff
            )));
        }

        Ok(rows)
    }

    async fn attach_history_config(
        &self,
        history_id: Uuid,
        config: &Value,
    ) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        let row = state
            .history
            .iter_mut()
            .find(|h| h.history_id == history_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("History row not found")))?;
        row.config = Some(config.clone());
        Ok(())
    }

    async fn insert_history_usage(&self, usage: &[HistoryUsage]) -> Result<(), AppError> {
        self.state.lock().await.usage.extend(usage.iter().cloned());
        Ok(())
    }

    async fn previous_usage(
        &self,
        subscription_id: Uuid,
        before: DateTime<Utc>,
    ) -> Result<Vec<HistoryUsage>, AppError> {
        let state = self.state.lock().await;
        let previous = state
            .history
            .iter()
            .filter(|h| h.subscription_id == subscription_id && h.recorded_at < before)
            .max_by_key(|h| h.recorded_at);

        Ok(match previous {
            Some(row) => state
                .usage
                .iter()
                .filter(|u| u.history_id == row.history_id)
                .cloned()
                .collect(),
            None => Vec::new(),
        })
    }

    async fn list_history(
        &self,
        subscription_id: Uuid,
        limit: i64,
    ) -> Result<Vec<SubscriptionHistory>, AppError> {
        let state = self.state.lock().await;
        let mut rows: Vec<SubscriptionHistory> = state
            .history
            .iter()
            .filter(|h| h.subscription_id == subscription_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn list_history_usage(&self, history_id: Uuid) -> Result<Vec<HistoryUsage>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .usage
            .iter()
            .filter(|u| u.history_id == history_id)
            .cloned()
            .collect())
    }
}

//! Order workflow callback integration tests for subscription-service.

mod common;

use common::{days, t0, Harness};
use service_core::error::AppError;
use subscription_service::engine::{CompletionOutcome, Transition};
use subscription_service::models::{OrderStatus, PeriodStatus, SubscriptionStatus};
use subscription_service::services::SubscriptionStore;
use uuid::Uuid;

#[tokio::test]
async fn first_successful_order_activates_the_subscription() {
    let h = Harness::new();
    let offer = h.offer(30, true).await;
    let (sub, period) = h.pending(offer, t0()).await;
    let order_id = h.orders.renewals_for(period.period_id)[0];
    let now = t0() + chrono::Duration::minutes(2);

    let processing = h
        .completion
        .handle(order_id, OrderStatus::Processing, now)
        .await
        .unwrap();
    assert!(matches!(
        processing,
        CompletionOutcome::PeriodUpdated {
            subscription_activated: false,
            ..
        }
    ));

    let outcome = h
        .completion
        .handle(order_id, OrderStatus::Succeeded, now)
        .await
        .unwrap();

    let CompletionOutcome::PeriodUpdated {
        period,
        subscription_activated,
    } = outcome
    else {
        panic!("expected the period to move");
    };
    assert_eq!(period.status, PeriodStatus::Done);
    assert!(subscription_activated);

    let sub = h.subscription(sub.subscription_id).await;
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert_eq!(sub.activated_at, Some(now));
    assert_eq!(h.events.names().last(), Some(&"subscription.activated"));
}

#[tokio::test]
async fn renewal_success_leaves_an_active_subscription_alone() {
    let h = Harness::new();
    let offer = h.offer(30, true).await;
    let (sub, _) = h.active(offer, t0()).await;
    h.generator.tick(t0() + days(29)).await.unwrap();
    let next = h.periods(sub.subscription_id).await.remove(1);
    let order_id = h.orders.renewals_for(next.period_id)[0];
    let events = h.events.count();

    let outcome = h
        .completion
        .handle(order_id, OrderStatus::Succeeded, t0() + days(29))
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        CompletionOutcome::PeriodUpdated {
            subscription_activated: false,
            ..
        }
    ));
    assert_eq!(h.events.count(), events);
}

#[tokio::test]
async fn failed_order_fails_the_period() {
    let h = Harness::new();
    let offer = h.offer(30, true).await;
    let (_, period) = h.pending(offer, t0()).await;
    let order_id = h.orders.renewals_for(period.period_id)[0];

    h.completion
        .handle(order_id, OrderStatus::Failed, t0())
        .await
        .unwrap();

    let period = h.store.get_period(period.period_id).await.unwrap().unwrap();
    assert_eq!(period.status, PeriodStatus::Failed);
}

#[tokio::test]
async fn late_callbacks_for_cancelled_periods_are_ignored() {
    let h = Harness::new();
    let offer = h.offer(30, true).await;
    let (sub, _) = h.active(offer, t0()).await;
    h.generator.tick(t0() + days(29)).await.unwrap();
    let next = h.periods(sub.subscription_id).await.remove(1);
    let order_id = h.orders.renewals_for(next.period_id)[0];
    h.apply(sub.subscription_id, Transition::Cancel, t0() + days(29))
        .await;

    let outcome = h
        .completion
        .handle(order_id, OrderStatus::Succeeded, t0() + days(29))
        .await
        .unwrap();

    assert_eq!(outcome, CompletionOutcome::Ignored);
    let next = h.store.get_period(next.period_id).await.unwrap().unwrap();
    assert_eq!(next.status, PeriodStatus::Cancelled);
}

#[tokio::test]
async fn deactivation_orders_and_non_terminal_updates_are_ignored() {
    let h = Harness::new();
    let offer = h.offer(30, true).await;
    let (sub, period) = h.active(offer, t0()).await;
    let renewal = h.orders.renewals_for(period.period_id)[0];

    let pending = h
        .completion
        .handle(renewal, OrderStatus::Pending, t0())
        .await
        .unwrap();
    assert_eq!(pending, CompletionOutcome::Ignored);

    h.apply(sub.subscription_id, Transition::Deactivate, t0() + days(1))
        .await;
    let deactivation = h
        .orders
        .calls()
        .into_iter()
        .find_map(|call| match call {
            common::OrderCall::DeactivatePlan { order_id, .. } => Some(order_id),
            _ => None,
        })
        .unwrap();

    let outcome = h
        .completion
        .handle(deactivation, OrderStatus::Succeeded, t0() + days(1))
        .await
        .unwrap();
    assert_eq!(outcome, CompletionOutcome::Ignored);
}

#[tokio::test]
async fn unknown_order_is_not_found() {
    let h = Harness::new();

    let result = h
        .completion
        .handle(Uuid::new_v4(), OrderStatus::Succeeded, t0())
        .await;

    assert!(matches!(result, Err(AppError::NotFound(_))));
}

//! Period boundary integration tests for subscription-service.

mod common;

use common::{days, t0, Harness};
use subscription_service::engine::Transition;
use subscription_service::models::{NewPeriod, PeriodStatus, SubscriptionStatus};

#[tokio::test]
async fn advances_to_the_pending_period_at_the_boundary() {
    let h = Harness::new();
    let offer = h.offer(30, true).await;
    let upgrade = h.offer(30, true).await;
    let (sub, first) = h.active(offer, t0()).await;

    // Plan change queued for the next period
    let next = h
        .store
        .seed_period(
            &NewPeriod {
                subscription_id: sub.subscription_id,
                offer_id: upgrade,
                starts_at: first.ends_at,
                ends_at: first.ends_at + days(30),
            },
            PeriodStatus::Pending,
        )
        .await;

    let report = h.transition.tick(first.ends_at).await.unwrap();
    assert_eq!(report.changed, 1);

    let sub = h.subscription(sub.subscription_id).await;
    assert_eq!(sub.current_period_id, Some(next.period_id));
    assert_eq!(sub.offer_id, upgrade);
    assert_eq!(sub.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn leaves_running_periods_alone() {
    let h = Harness::new();
    let offer = h.offer(30, true).await;
    let (sub, first) = h.active(offer, t0()).await;

    let report = h
        .transition
        .tick(first.ends_at - chrono::Duration::seconds(1))
        .await
        .unwrap();

    assert_eq!(report.selected, 0);
    assert_eq!(
        h.subscription(sub.subscription_id).await.current_period_id,
        Some(first.period_id)
    );
}

#[tokio::test]
async fn deactivates_when_no_period_follows() {
    let h = Harness::new();
    let offer = h.offer(30, false).await;
    let (sub, first) = h.active(offer, t0()).await;
    let now = first.ends_at + chrono::Duration::minutes(5);

    let report = h.transition.tick(now).await.unwrap();
    assert_eq!(report.changed, 1);

    let sub = h.subscription(sub.subscription_id).await;
    assert_eq!(sub.status, SubscriptionStatus::Deactivated);
    assert_eq!(sub.current_period_id, None);
    assert_eq!(sub.deactivated_at, Some(now));
    assert_eq!(h.orders.deactivations(), vec![sub.subscription_id]);
    assert_eq!(h.events.names().last(), Some(&"subscription.deactivated"));

    // Nothing left pending in the past
    for period in h.periods(sub.subscription_id).await {
        assert!(!(period.status == PeriodStatus::Pending && period.starts_at < now));
    }
}

#[tokio::test]
async fn failed_and_cancelled_periods_do_not_become_current() {
    let h = Harness::new();
    let offer = h.offer(30, true).await;
    let (sub, first) = h.active(offer, t0()).await;

    h.store
        .seed_period(
            &NewPeriod {
                subscription_id: sub.subscription_id,
                offer_id: offer,
                starts_at: first.ends_at,
                ends_at: first.ends_at + days(30),
            },
            PeriodStatus::Failed,
        )
        .await;

    h.transition.tick(first.ends_at).await.unwrap();

    let sub = h.subscription(sub.subscription_id).await;
    assert_eq!(sub.status, SubscriptionStatus::Deactivated);
    assert_eq!(sub.current_period_id, None);
}

#[tokio::test]
async fn deactivation_order_failure_keeps_the_deactivation() {
    let h = Harness::new();
    let offer = h.offer(30, false).await;
    let (sub, first) = h.active(offer, t0()).await;

    h.orders.fail_next_creates(1);
    h.transition.tick(first.ends_at).await.unwrap();

    let sub = h.subscription(sub.subscription_id).await;
    assert_eq!(sub.status, SubscriptionStatus::Deactivated);
    assert!(h.orders.deactivations().is_empty());
}

#[tokio::test]
async fn processes_a_bounded_batch_per_tick() {
    let h = Harness::with_transition_batch(2);
    let offer = h.offer(30, false).await;
    let mut ids = Vec::new();
    for _ in 0..3 {
        let (sub, _) = h.active(offer, t0()).await;
        ids.push(sub.subscription_id);
    }
    let now = t0() + days(31);

    let first = h.transition.tick(now).await.unwrap();
    assert_eq!(first.selected, 2);

    let second = h.transition.tick(now).await.unwrap();
    assert_eq!(second.selected, 1);

    for id in ids {
        assert_eq!(h.subscription(id).await.status, SubscriptionStatus::Deactivated);
    }
}

#[tokio::test]
async fn concurrent_status_change_wins_over_deactivation() {
    let h = Harness::new();
    let offer = h.offer(30, false).await;
    let (sub, first) = h.active(offer, t0()).await;

    // Read as ACTIVE, then suspended by an operator before the write
    let stale = h.subscription(sub.subscription_id).await;
    h.apply(sub.subscription_id, Transition::Suspend, first.ends_at)
        .await;
    let events_before = h.events.count();

    let outcome = h
        .status
        .apply_to(&stale, Transition::Deactivate, first.ends_at)
        .await
        .unwrap();

    assert_eq!(outcome, subscription_service::engine::TransitionOutcome::Skipped);
    assert_eq!(
        h.subscription(sub.subscription_id).await.status,
        SubscriptionStatus::Suspended
    );
    assert_eq!(h.events.count(), events_before);
    assert!(h.orders.deactivations().is_empty());
}

#[tokio::test]
async fn renewing_subscription_has_contiguous_periods() {
    let h = Harness::new();
    let offer = h.offer(30, true).await;
    let (sub, _) = h.active(offer, t0()).await;

    for cycle in 1..=6 {
        let boundary = t0() + days(30 * cycle);
        h.generator.tick(boundary - days(1)).await.unwrap();
        h.transition.tick(boundary).await.unwrap();
    }

    let periods = h.periods(sub.subscription_id).await;
    assert_eq!(periods.len(), 7);
    for pair in periods.windows(2) {
        assert_eq!(pair[0].ends_at, pair[1].starts_at, "gap or overlap");
    }

    let sub = h.subscription(sub.subscription_id).await;
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert_eq!(sub.current_period_id, Some(periods[6].period_id));
}

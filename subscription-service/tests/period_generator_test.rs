//! Period generation integration tests for subscription-service.

mod common;

use common::{assert_no_overlap, days, seed_period, t0, Harness};
use subscription_service::engine::{PeriodGenerator, TickReport, Transition};
use subscription_service::models::PeriodStatus;
use subscription_service::services::SubscriptionStore;

#[tokio::test]
async fn generates_the_period_after_the_current_one() {
    let h = Harness::new();
    let offer = h.offer(30, true).await;
    let (sub, first) = h.active(offer, t0()).await;

    let report = h.generator.tick(t0() + days(29)).await.unwrap();
    assert_eq!(report.selected, 1);
    assert_eq!(report.changed, 1);

    let periods = h.periods(sub.subscription_id).await;
    assert_eq!(periods.len(), 2);
    let next = &periods[1];
    assert_eq!(next.starts_at, t0() + days(30));
    assert_eq!(next.ends_at, t0() + days(60));
    assert_eq!(next.status, PeriodStatus::Pending);
    assert_eq!(next.offer_id, offer);
    assert_eq!(first.ends_at, next.starts_at);

    // The new period is ordered right away
    assert_eq!(h.orders.renewals_for(next.period_id).len(), 1);
    let links = h.store.list_orders_for_period(next.period_id).await.unwrap();
    assert_eq!(links.len(), 1);
}

#[tokio::test]
async fn running_twice_produces_one_period() {
    let h = Harness::new();
    let offer = h.offer(30, true).await;
    let (sub, _) = h.active(offer, t0()).await;
    let now = t0() + days(29);

    h.generator.tick(now).await.unwrap();
    let second = h.generator.tick(now).await.unwrap();

    assert_eq!(second, TickReport::default());
    assert_eq!(h.periods(sub.subscription_id).await.len(), 2);
}

#[tokio::test]
async fn overlapping_ticks_insert_one_period() {
    let h = Harness::new();
    let offer = h.offer(30, true).await;
    let (sub, _) = h.active(offer, t0()).await;
    let other = PeriodGenerator::new(h.deps.clone(), 1);
    let now = t0() + days(29);

    let (a, b) = tokio::join!(h.generator.tick(now), other.tick(now));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.changed + b.changed, 1);
    let periods = h.periods(sub.subscription_id).await;
    assert_eq!(periods.len(), 2);
    assert_eq!(h.orders.renewals_for(periods[1].period_id).len(), 1);
}

#[tokio::test]
async fn skips_subscriptions_that_are_not_renewing() {
    let h = Harness::new();
    let renewing = h.offer(30, true).await;
    let one_off = h.offer(30, false).await;

    let (pending, _) = h.pending(renewing, t0()).await;
    let (no_renew, _) = h.active(one_off, t0()).await;
    let (cancelled, _) = h.active(renewing, t0()).await;
    h.apply(cancelled.subscription_id, Transition::Cancel, t0() + days(1))
        .await;

    let report = h.generator.tick(t0() + days(29)).await.unwrap();

    assert_eq!(report.selected, 0);
    for id in [
        pending.subscription_id,
        no_renew.subscription_id,
        cancelled.subscription_id,
    ] {
        assert_eq!(h.periods(id).await.len(), 1);
    }
}

#[tokio::test]
async fn handles_at_most_one_subscription_per_tick() {
    let h = Harness::new();
    let offer = h.offer(30, true).await;
    let (early, _) = h.active(offer, t0()).await;
    let (late, _) = h.active(offer, t0() + days(1)).await;
    let now = t0() + days(29);

    h.generator.tick(now).await.unwrap();
    assert_eq!(h.periods(early.subscription_id).await.len(), 2);
    assert_eq!(h.periods(late.subscription_id).await.len(), 1);

    h.generator.tick(now).await.unwrap();
    assert_eq!(h.periods(late.subscription_id).await.len(), 2);
}

#[tokio::test]
async fn anchors_on_the_latest_uncancelled_period() {
    let h = Harness::new();
    let offer = h.offer(30, true).await;
    let (sub, _) = h.active(offer, t0()).await;
    h.generator.tick(t0() + days(29)).await.unwrap();

    // A cancelled period further out neither blocks nor anchors renewal
    seed_period(
        &h.store,
        sub.subscription_id,
        t0() + days(70),
        t0() + days(100),
        PeriodStatus::Cancelled,
    )
    .await;

    let report = h.generator.tick(t0() + days(31)).await.unwrap();
    assert_eq!(report.changed, 1);

    let periods = h.periods(sub.subscription_id).await;
    assert_eq!(periods.len(), 4);
    assert_no_overlap(&periods);
    let next = periods
        .iter()
        .find(|p| p.starts_at == t0() + days(60))
        .expect("period anchored on [30d, 60d)");
    assert_eq!(next.ends_at, t0() + days(90));
    assert_eq!(next.status, PeriodStatus::Pending);
}

#[tokio::test]
async fn order_failure_keeps_the_period() {
    let h = Harness::new();
    let offer = h.offer(30, true).await;
    let (sub, _) = h.active(offer, t0()).await;
    let before = h.orders.renewal_count();

    h.orders.fail_next_creates(1);
    let report = h.generator.tick(t0() + days(29)).await.unwrap();

    assert_eq!(report.changed, 1);
    let periods = h.periods(sub.subscription_id).await;
    assert_eq!(periods.len(), 2);
    assert_eq!(periods[1].status, PeriodStatus::Pending);
    assert_eq!(h.orders.renewal_count(), before);
    assert!(h
        .store
        .list_orders_for_period(periods[1].period_id)
        .await
        .unwrap()
        .is_empty());
}

//! Postgres-backed `SubscriptionStore`.

use crate::models::{
    CreateSubscription, HistoryUsage, NewPeriod, Offer, OrderLink, PeriodCascade, PeriodStatus,
    Plan, StatusChange, Subscription, SubscriptionHistory, SubscriptionPeriod, UnknownVariant,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{StatusChangeResult, SubscriptionStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::str::FromStr;
use std::time::Duration;
use tracing::{error, info, instrument};
use uuid::Uuid;

fn db_error(context: &str, e: sqlx::Error) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

fn decode<T: FromStr<Err = UnknownVariant>>(value: &str) -> Result<T, AppError> {
    value
        .parse()
        .map_err(|e: UnknownVariant| AppError::DatabaseError(e.into()))
}

#[derive(FromRow)]
struct SubscriptionRow {
    subscription_id: Uuid,
    user_id: Uuid,
    offer_id: Uuid,
    parent_id: Option<Uuid>,
    status: String,
    current_period_id: Option<Uuid>,
    sim_iccid: Option<String>,
    phone_number_msisdn: Option<String>,
    activated_at: Option<DateTime<Utc>>,
    canceled_at: Option<DateTime<Utc>>,
    suspended_at: Option<DateTime<Utc>>,
    deactivated_at: Option<DateTime<Utc>>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = AppError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            subscription_id: row.subscription_id,
            user_id: row.user_id,
            offer_id: row.offer_id,
            parent_id: row.parent_id,
            status: decode(&row.status)?,
            current_period_id: row.current_period_id,
            sim_iccid: row.sim_iccid,
            phone_number_msisdn: row.phone_number_msisdn,
            activated_at: row.activated_at,
            canceled_at: row.canceled_at,
            suspended_at: row.suspended_at,
            deactivated_at: row.deactivated_at,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        })
    }
}

#[derive(FromRow)]
struct PeriodRow {
    period_id: Uuid,
    subscription_id: Uuid,
    offer_id: Uuid,
    status: String,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl TryFrom<PeriodRow> for SubscriptionPeriod {
    type Error = AppError;

    fn try_from(row: PeriodRow) -> Result<Self, Self::Error> {
        Ok(SubscriptionPeriod {
            period_id: row.period_id,
            subscription_id: row.subscription_id,
            offer_id: row.offer_id,
            status: decode(&row.status)?,
            starts_at: row.starts_at,
            ends_at: row.ends_at,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        })
    }
}

#[derive(FromRow)]
struct OrderLinkRow {
    order_id: Uuid,
    subscription_id: Uuid,
    period_id: Option<Uuid>,
    kind: String,
    created_utc: DateTime<Utc>,
}

impl TryFrom<OrderLinkRow> for OrderLink {
    type Error = AppError;

    fn try_from(row: OrderLinkRow) -> Result<Self, Self::Error> {
        Ok(OrderLink {
            order_id: row.order_id,
            subscription_id: row.subscription_id,
            period_id: row.period_id,
            kind: decode(&row.kind)?,
            created_utc: row.created_utc,
        })
    }
}

#[derive(FromRow)]
struct UsageRow {
    history_id: Uuid,
    subscription_id: Uuid,
    volume_type: String,
    is_roaming: bool,
    is_unlimited: bool,
    amount_used: i64,
    amount_total: Option<i64>,
    amount_used_increment: i64,
}

impl TryFrom<UsageRow> for HistoryUsage {
    type Error = AppError;

    fn try_from(row: UsageRow) -> Result<Self, Self::Error> {
        Ok(HistoryUsage {
            history_id: row.history_id,
            subscription_id: row.subscription_id,
            volume_type: decode(&row.volume_type)?,
            is_roaming: row.is_roaming,
            is_unlimited: row.is_unlimited,
            amount_used: row.amount_used,
            amount_total: row.amount_total,
            amount_used_increment: row.amount_used_increment,
        })
    }
}

#[derive(FromRow)]
struct HistoryRow {
    history_id: Uuid,
    subscription_id: Uuid,
    recorded_at: DateTime<Utc>,
    sim_iccid: Option<String>,
    phone_number_msisdn: Option<String>,
    config: Option<Value>,
}

impl From<HistoryRow> for SubscriptionHistory {
    fn from(row: HistoryRow) -> Self {
        SubscriptionHistory {
            history_id: row.history_id,
            subscription_id: row.subscription_id,
            recorded_at: row.recorded_at,
            sim_iccid: row.sim_iccid,
            phone_number_msisdn: row.phone_number_msisdn,
            config: row.config,
        }
    }
}

#[derive(FromRow)]
struct PlanRow {
    plan_id: Uuid,
    name: String,
    valid_for_seconds: i64,
    does_auto_renew: bool,
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>, AppError>
where
    T: TryFrom<R, Error = AppError>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "subscription-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Upsert an offer and its plan. The catalog is owned elsewhere; this keeps
    /// a local copy for renewal lookups.
    #[instrument(skip(self, offer, plan), fields(offer_id = %offer.offer_id, plan_id = %plan.plan_id))]
    pub async fn upsert_offer(&self, offer: &Offer, plan: &Plan) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["upsert_offer"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        sqlx::query(
            r#"
            INSERT INTO plans (plan_id, name, valid_for_seconds, does_auto_renew)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (plan_id) DO UPDATE
            SET name = EXCLUDED.name,
                valid_for_seconds = EXCLUDED.valid_for_seconds,
                does_auto_renew = EXCLUDED.does_auto_renew
            "#,
        )
        .bind(plan.plan_id)
        .bind(&plan.name)
        .bind(plan.valid_for_seconds)
        .bind(plan.does_auto_renew)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to upsert plan", e))?;

        sqlx::query(
            r#"
            INSERT INTO offers (offer_id, plan_id, name)
            VALUES ($1, $2, $3)
            ON CONFLICT (offer_id) DO UPDATE
            SET plan_id = EXCLUDED.plan_id, name = EXCLUDED.name
            "#,
        )
        .bind(offer.offer_id)
        .bind(offer.plan_id)
        .bind(&offer.name)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to upsert offer", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit offer", e))?;

        timer.observe_duration();
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for Database {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Catalog
    // =========================================================================

    #[instrument(skip(self), fields(offer_id = %offer_id))]
    async fn get_plan_for_offer(&self, offer_id: Uuid) -> Result<Option<Plan>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_plan_for_offer"])
            .start_timer();

        let row = sqlx::query_as::<_, PlanRow>(
            r#"
            SELECT p.plan_id, p.name, p.valid_for_seconds, p.does_auto_renew
            FROM offers o
            JOIN plans p ON p.plan_id = o.plan_id
            WHERE o.offer_id = $1
            "#,
        )
        .bind(offer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get plan for offer", e))?;

        timer.observe_duration();

        Ok(row.map(|r| Plan {
            plan_id: r.plan_id,
            name: r.name,
            valid_for_seconds: r.valid_for_seconds,
            does_auto_renew: r.does_auto_renew,
        }))
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    #[instrument(skip(self, input), fields(user_id = %input.user_id, offer_id = %input.offer_id))]
    async fn create_subscription(
        &self,
        input: &CreateSubscription,
        ends_at: DateTime<Utc>,
    ) -> Result<(Subscription, SubscriptionPeriod), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_subscription"])
            .start_timer();

        let subscription_id = Uuid::new_v4();
        let period_id = Uuid::new_v4();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        let subscription = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            INSERT INTO subscriptions (subscription_id, user_id, offer_id, parent_id, status, current_period_id, sim_iccid, phone_number_msisdn)
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7)
            RETURNING subscription_id, user_id, offer_id, parent_id, status, current_period_id, sim_iccid, phone_number_msisdn, activated_at, canceled_at, suspended_at, deactivated_at, created_utc, updated_utc
            "#,
        )
        .bind(subscription_id)
        .bind(input.user_id)
        .bind(input.offer_id)
        .bind(input.parent_id)
        .bind(period_id)
        .bind(&input.sim_iccid)
        .bind(&input.phone_number_msisdn)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to create subscription", e))?;

        let period = sqlx::query_as::<_, PeriodRow>(
            r#"
            INSERT INTO subscription_periods (period_id, subscription_id, offer_id, status, starts_at, ends_at)
            VALUES ($1, $2, $3, 'pending', $4, $5)
            RETURNING period_id, subscription_id, offer_id, status, starts_at, ends_at, created_utc, updated_utc
            "#,
        )
        .bind(period_id)
        .bind(subscription_id)
        .bind(input.offer_id)
        .bind(input.starts_at)
        .bind(ends_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to create first period", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit subscription", e))?;

        timer.observe_duration();
        info!(subscription_id = %subscription_id, period_id = %period_id, "Subscription created");

        Ok((subscription.try_into()?, period.try_into()?))
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn get_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_subscription"])
            .start_timer();

        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT subscription_id, user_id, offer_id, parent_id, status, current_period_id, sim_iccid, phone_number_msisdn, activated_at, canceled_at, suspended_at, deactivated_at, created_utc, updated_utc
            FROM subscriptions
            WHERE subscription_id = $1
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get subscription", e))?;

        timer.observe_duration();

        row.map(Subscription::try_from).transpose()
    }

    #[instrument(skip(self), fields(parent_id = %parent_id))]
    async fn list_child_subscriptions(
        &self,
        parent_id: Uuid,
    ) -> Result<Vec<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_child_subscriptions"])
            .start_timer();

        let rows = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT subscription_id, user_id, offer_id, parent_id, status, current_period_id, sim_iccid, phone_number_msisdn, activated_at, canceled_at, suspended_at, deactivated_at, created_utc, updated_utc
            FROM subscriptions
            WHERE parent_id = $1
            ORDER BY created_utc, subscription_id
            "#,
        )
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list child subscriptions", e))?;

        timer.observe_duration();

        convert_all(rows)
    }

    #[instrument(skip(self))]
    async fn find_subscriptions_needing_period(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_subscriptions_needing_period"])
            .start_timer();

        let rows = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT s.subscription_id, s.user_id, s.offer_id, s.parent_id, s.status, s.current_period_id, s.sim_iccid, s.phone_number_msisdn, s.activated_at, s.canceled_at, s.suspended_at, s.deactivated_at, s.created_utc, s.updated_utc
            FROM subscriptions s
            JOIN subscription_periods cp ON cp.period_id = s.current_period_id
            JOIN offers o ON o.offer_id = s.offer_id
            JOIN plans p ON p.plan_id = o.plan_id
            WHERE s.status = 'active'
              AND p.does_auto_renew = TRUE
              AND NOT EXISTS (
                  SELECT 1 FROM subscription_periods f
                  WHERE f.subscription_id = s.subscription_id
                    AND f.status <> 'cancelled'
                    AND f.starts_at > $1
              )
            ORDER BY cp.ends_at, s.subscription_id
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to find subscriptions needing a period", e))?;

        timer.observe_duration();

        convert_all(rows)
    }

    #[instrument(skip(self))]
    async fn find_subscriptions_with_ended_period(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_subscriptions_with_ended_period"])
            .start_timer();

        let rows = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT s.subscription_id, s.user_id, s.offer_id, s.parent_id, s.status, s.current_period_id, s.sim_iccid, s.phone_number_msisdn, s.activated_at, s.canceled_at, s.suspended_at, s.deactivated_at, s.created_utc, s.updated_utc
            FROM subscriptions s
            JOIN subscription_periods cp ON cp.period_id = s.current_period_id
            WHERE cp.ends_at <= $1
            ORDER BY cp.ends_at, s.subscription_id
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to find subscriptions with ended period", e))?;

        timer.observe_duration();

        convert_all(rows)
    }

    #[instrument(skip(self, change), fields(subscription_id = %change.subscription_id, status = change.status.as_str()))]
    async fn apply_status_change(
        &self,
        change: &StatusChange,
    ) -> Result<Option<StatusChangeResult>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_status_change"])
            .start_timer();

        let expected: Vec<String> = change
            .expected
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let (touch_activated, activated_at) = change.activated_at.as_sql_params();
        let (touch_canceled, canceled_at) = change.canceled_at.as_sql_params();
        let (touch_suspended, suspended_at) = change.suspended_at.as_sql_params();
        let (touch_deactivated, deactivated_at) = change.deactivated_at.as_sql_params();
        let fresh_period_id = change.start_period.as_ref().map(|_| Uuid::new_v4());
        let fresh_offer_id = change.start_period.as_ref().map(|p| p.offer_id);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        let updated = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            UPDATE subscriptions
            SET status = $3,
                activated_at = CASE WHEN $4 THEN $5 ELSE activated_at END,
                canceled_at = CASE WHEN $6 THEN $7 ELSE canceled_at END,
                suspended_at = CASE WHEN $8 THEN $9 ELSE suspended_at END,
                deactivated_at = CASE WHEN $10 THEN $11 ELSE deactivated_at END,
                current_period_id = CASE
                    WHEN $13::uuid IS NOT NULL THEN $13
                    WHEN $12 THEN NULL
                    ELSE current_period_id
                END,
                offer_id = COALESCE($14, offer_id),
                updated_utc = NOW()
            WHERE subscription_id = $1
              AND (cardinality($2::text[]) = 0 OR status = ANY($2))
            RETURNING subscription_id, user_id, offer_id, parent_id, status, current_period_id, sim_iccid, phone_number_msisdn, activated_at, canceled_at, suspended_at, deactivated_at, created_utc, updated_utc
            "#,
        )
        .bind(change.subscription_id)
        .bind(&expected)
        .bind(change.status.as_str())
        .bind(touch_activated)
        .bind(activated_at)
        .bind(touch_canceled)
        .bind(canceled_at)
        .bind(touch_suspended)
        .bind(suspended_at)
        .bind(touch_deactivated)
        .bind(deactivated_at)
        .bind(change.clear_current_period)
        .bind(fresh_period_id)
        .bind(fresh_offer_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to apply status change", e))?;

        let Some(updated) = updated else {
            timer.observe_duration();
            return Ok(None);
        };

        let mut periods = match change.periods {
            PeriodCascade::None => Vec::new(),
            PeriodCascade::CancelPending { after } => sqlx::query_as::<_, PeriodRow>(
                r#"
                UPDATE subscription_periods
                SET status = 'cancelled', updated_utc = NOW()
                WHERE subscription_id = $1
                  AND status = 'pending'
                  AND ($2::timestamptz IS NULL OR starts_at > $2)
                RETURNING period_id, subscription_id, offer_id, status, starts_at, ends_at, created_utc, updated_utc
                "#,
            )
            .bind(change.subscription_id)
            .bind(after)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to cancel pending periods", e))?,
            PeriodCascade::Reinstate { after } => sqlx::query_as::<_, PeriodRow>(
                r#"
                UPDATE subscription_periods
                SET status = 'pending', updated_utc = NOW()
                WHERE subscription_id = $1
                  AND status = 'cancelled'
                  AND starts_at > $2
                RETURNING period_id, subscription_id, offer_id, status, starts_at, ends_at, created_utc, updated_utc
                "#,
            )
            .bind(change.subscription_id)
            .bind(after)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to reinstate periods", e))?,
        };

        if let (Some(period), Some(period_id)) = (&change.start_period, fresh_period_id) {
            let started = sqlx::query_as::<_, PeriodRow>(
                r#"
                INSERT INTO subscription_periods (period_id, subscription_id, offer_id, status, starts_at, ends_at)
                VALUES ($1, $2, $3, 'pending', $4, $5)
                ON CONFLICT (subscription_id, starts_at) DO NOTHING
                RETURNING period_id, subscription_id, offer_id, status, starts_at, ends_at, created_utc, updated_utc
                "#,
            )
            .bind(period_id)
            .bind(period.subscription_id)
            .bind(period.offer_id)
            .bind(period.starts_at)
            .bind(period.ends_at)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to start period", e))?;

            match started {
                Some(row) => periods.push(row),
                None => {
                    tx.rollback()
                        .await
                        .map_err(|e| db_error("Failed to roll back status change", e))?;
                    return Err(AppError::Conflict(anyhow::anyhow!(
                        "A period starting at {} already exists",
                        period.starts_at
                    )));
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit status change", e))?;

        timer.observe_duration();

        let mut periods: Vec<SubscriptionPeriod> = convert_all(periods)?;
        periods.sort_by_key(|p| p.starts_at);

        Ok(Some(StatusChangeResult {
            subscription: updated.try_into()?,
            periods,
        }))
    }

    #[instrument(skip(self, next), fields(subscription_id = %subscription_id, next_period_id = %next.period_id))]
    async fn advance_current_period(
        &self,
        subscription_id: Uuid,
        expected_period_id: Uuid,
        next: &SubscriptionPeriod,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["advance_current_period"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET current_period_id = $3, offer_id = $4, updated_utc = NOW()
            WHERE subscription_id = $1 AND current_period_id = $2
            "#,
        )
        .bind(subscription_id)
        .bind(expected_period_id)
        .bind(next.period_id)
        .bind(next.offer_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to advance current period", e))?;

        timer.observe_duration();

        Ok(result.rows_affected() == 1)
    }

    // =========================================================================
    // Periods
    // =========================================================================

    #[instrument(skip(self), fields(period_id = %period_id))]
    async fn get_period(&self, period_id: Uuid) -> Result<Option<SubscriptionPeriod>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_period"])
            .start_timer();

        let row = sqlx::query_as::<_, PeriodRow>(
            r#"
            SELECT period_id, subscription_id, offer_id, status, starts_at, ends_at, created_utc, updated_utc
            FROM subscription_periods
            WHERE period_id = $1
            "#,
        )
        .bind(period_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get period", e))?;

        timer.observe_duration();

        row.map(SubscriptionPeriod::try_from).transpose()
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn list_periods(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<SubscriptionPeriod>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_periods"])
            .start_timer();

        let rows = sqlx::query_as::<_, PeriodRow>(
            r#"
            SELECT period_id, subscription_id, offer_id, status, starts_at, ends_at, created_utc, updated_utc
            FROM subscription_periods
            WHERE subscription_id = $1
            ORDER BY starts_at
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list periods", e))?;

        timer.observe_duration();

        convert_all(rows)
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn latest_period(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<SubscriptionPeriod>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["latest_period"])
            .start_timer();

        let row = sqlx::query_as::<_, PeriodRow>(
            r#"
            SELECT period_id, subscription_id, offer_id, status, starts_at, ends_at, created_utc, updated_utc
            FROM subscription_periods
            WHERE subscription_id = $1 AND status <> 'cancelled'
            ORDER BY ends_at DESC
            LIMIT 1
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get latest period", e))?;

        timer.observe_duration();

        row.map(SubscriptionPeriod::try_from).transpose()
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn find_period_at(
        &self,
        subscription_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<SubscriptionPeriod>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_period_at"])
            .start_timer();

        let eligible: Vec<String> = PeriodStatus::ELIGIBLE_FOR_CURRENT
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let row = sqlx::query_as::<_, PeriodRow>(
            r#"
            SELECT period_id, subscription_id, offer_id, status, starts_at, ends_at, created_utc, updated_utc
            FROM subscription_periods
            WHERE subscription_id = $1
              AND starts_at <= $2
              AND ends_at > $2
              AND status = ANY($3)
            ORDER BY starts_at DESC
            LIMIT 1
            "#,
        )
        .bind(subscription_id)
        .bind(at)
        .bind(&eligible)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to find period", e))?;

        timer.observe_duration();

        row.map(SubscriptionPeriod::try_from).transpose()
    }

    #[instrument(skip(self, period), fields(subscription_id = %period.subscription_id, starts_at = %period.starts_at))]
    async fn insert_next_period(
        &self,
        period: &NewPeriod,
    ) -> Result<Option<SubscriptionPeriod>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_next_period"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        let inserted = sqlx::query_as::<_, PeriodRow>(
            r#"
            INSERT INTO subscription_periods (period_id, subscription_id, offer_id, status, starts_at, ends_at)
            VALUES ($1, $2, $3, 'pending', $4, $5)
            ON CONFLICT (subscription_id, starts_at) DO NOTHING
            RETURNING period_id, subscription_id, offer_id, status, starts_at, ends_at, created_utc, updated_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(period.subscription_id)
        .bind(period.offer_id)
        .bind(period.starts_at)
        .bind(period.ends_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to insert period", e))?;

        let Some(inserted) = inserted else {
            tx.rollback()
                .await
                .map_err(|e| db_error("Failed to roll back period insert", e))?;
            timer.observe_duration();
            return Ok(None);
        };

        let (from_here,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM subscription_periods
            WHERE subscription_id = $1 AND status <> 'cancelled' AND starts_at >= $2
            "#,
        )
        .bind(period.subscription_id)
        .bind(period.starts_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to count periods", e))?;

        if from_here != 1 {
            tx.rollback()
                .await
                .map_err(|e| db_error("Failed to roll back period insert", e))?;
            error!(
                subscription_id = %period.subscription_id,
                count = from_here,
                "Period insert rolled back"
            );
            return Err(AppError::InvariantViolation(anyhow::anyhow!(
                "subscription {} would have {} periods starting at or after {}",
                period.subscription_id,
                from_here,
                period.starts_at
            )));
        }

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit period", e))?;

        timer.observe_duration();

        Ok(Some(inserted.try_into()?))
    }

    #[instrument(skip(self, expected), fields(period_id = %period_id, status = status.as_str()))]
    async fn update_period_status(
        &self,
        period_id: Uuid,
        expected: &[PeriodStatus],
        status: PeriodStatus,
    ) -> Result<Option<SubscriptionPeriod>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_period_status"])
            .start_timer();

        let expected: Vec<String> = expected.iter().map(|s| s.as_str().to_string()).collect();

        let row = sqlx::query_as::<_, PeriodRow>(
            r#"
            UPDATE subscription_periods
            SET status = $3, updated_utc = NOW()
            WHERE period_id = $1
              AND (cardinality($2::text[]) = 0 OR status = ANY($2))
            RETURNING period_id, subscription_id, offer_id, status, starts_at, ends_at, created_utc, updated_utc
            "#,
        )
        .bind(period_id)
        .bind(&expected)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to update period status", e))?;

        timer.observe_duration();

        row.map(SubscriptionPeriod::try_from).transpose()
    }

    // =========================================================================
    // Orders
    // =========================================================================

    #[instrument(skip(self, link), fields(order_id = %link.order_id, kind = link.kind.as_str()))]
    async fn record_order(&self, link: &OrderLink) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_order"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO order_links (order_id, subscription_id, period_id, kind, created_utc)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (order_id) DO NOTHING
            "#,
        )
        .bind(link.order_id)
        .bind(link.subscription_id)
        .bind(link.period_id)
        .bind(link.kind.as_str())
        .bind(link.created_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to record order", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    async fn get_order_link(&self, order_id: Uuid) -> Result<Option<OrderLink>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_order_link"])
            .start_timer();

        let row = sqlx::query_as::<_, OrderLinkRow>(
            r#"
            SELECT order_id, subscription_id, period_id, kind, created_utc
            FROM order_links
            WHERE order_id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get order link", e))?;

        timer.observe_duration();

        row.map(OrderLink::try_from).transpose()
    }

    #[instrument(skip(self), fields(period_id = %period_id))]
    async fn list_orders_for_period(&self, period_id: Uuid) -> Result<Vec<OrderLink>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_orders_for_period"])
            .start_timer();

        let rows = sqlx::query_as::<_, OrderLinkRow>(
            r#"
            SELECT order_id, subscription_id, period_id, kind, created_utc
            FROM order_links
            WHERE period_id = $1
            ORDER BY created_utc DESC
            "#,
        )
        .bind(period_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list orders for period", e))?;

        timer.observe_duration();

        convert_all(rows)
    }

    // =========================================================================
    // History
    // =========================================================================

    #[instrument(skip(self))]
    async fn find_subscriptions_due_for_history(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_subscriptions_due_for_history"])
            .start_timer();

        let rows = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT s.subscription_id, s.user_id, s.offer_id, s.parent_id, s.status, s.current_period_id, s.sim_iccid, s.phone_number_msisdn, s.activated_at, s.canceled_at, s.suspended_at, s.deactivated_at, s.created_utc, s.updated_utc
            FROM subscriptions s
            WHERE s.status = 'active'
              AND s.parent_id IS NULL
              AND NOT EXISTS (
                  SELECT 1 FROM subscription_history h
                  WHERE h.subscription_id = s.subscription_id AND h.recorded_at > $1
              )
            ORDER BY s.created_utc, s.subscription_id
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to find subscriptions due for history", e))?;

        timer.observe_duration();

        convert_all(rows)
    }

    #[instrument(skip(self, root, children), fields(subscription_id = %root.subscription_id, children = children.len()))]
    async fn insert_history_snapshot(
        &self,
        root: &Subscription,
        children: &[Subscription],
        recorded_at: DateTime<Utc>,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SubscriptionHistory>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_history_snapshot"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        // Concurrent snapshots of one subscription queue behind this lock, so
        // the window count below sees any row committed before it.
        sqlx::query("SELECT 1 FROM subscriptions WHERE subscription_id = $1 FOR UPDATE")
            .bind(root.subscription_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to lock subscription for history", e))?;

        let mut rows = Vec::with_capacity(children.len() + 1);
        for subscription in std::iter::once(root).chain(children.iter()) {
            let row = sqlx::query_as::<_, HistoryRow>(
                r#"
                INSERT INTO subscription_history (history_id, subscription_id, recorded_at, sim_iccid, phone_number_msisdn)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING history_id, subscription_id, recorded_at, sim_iccid, phone_number_msisdn, config
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(subscription.subscription_id)
            .bind(recorded_at)
            .bind(&subscription.sim_iccid)
            .bind(&subscription.phone_number_msisdn)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to insert history row", e))?;
            rows.push(SubscriptionHistory::from(row));
        }

        let (recent,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM subscription_history
            WHERE subscription_id = $1 AND recorded_at > $2
            "#,
        )
        .bind(root.subscription_id)
        .bind(cutoff)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to count history rows", e))?;

        if recent > 1 {
            tx.rollback()
                .await
                .map_err(|e| db_error("Failed to roll back history snapshot", e))?;
            return Err(AppError::InvariantViolation(anyhow::anyhow!(
                "multiple_sub_history: subscription {} has {} snapshots newer than {}",
                root.subscription_id,
                recent,
                cutoff
            )));
        }

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit history snapshot", e))?;

        timer.observe_duration();

        Ok(rows)
    }

    #[instrument(skip(self, config), fields(history_id = %history_id))]
    async fn attach_history_config(
        &self,
        history_id: Uuid,
        config: &Value,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["attach_history_config"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE subscription_history SET config = $2 WHERE history_id = $1
            "#,
        )
        .bind(history_id)
        .bind(config)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to attach history config", e))?;

        timer.observe_duration();

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!("History row not found")));
        }
        Ok(())
    }

    #[instrument(skip(self, usage), fields(rows = usage.len()))]
    async fn insert_history_usage(&self, usage: &[HistoryUsage]) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_history_usage"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        for row in usage {
            sqlx::query(
                r#"
                INSERT INTO subscription_history_usage (history_id, subscription_id, volume_type, is_roaming, is_unlimited, amount_used, amount_total, amount_used_increment)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (history_id, volume_type, is_roaming) DO NOTHING
                "#,
            )
            .bind(row.history_id)
            .bind(row.subscription_id)
            .bind(row.volume_type.as_str())
            .bind(row.is_roaming)
            .bind(row.is_unlimited)
            .bind(row.amount_used)
            .bind(row.amount_total)
            .bind(row.amount_used_increment)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to insert history usage", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit history usage", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn previous_usage(
        &self,
        subscription_id: Uuid,
        before: DateTime<Utc>,
    ) -> Result<Vec<HistoryUsage>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["previous_usage"])
            .start_timer();

        let rows = sqlx::query_as::<_, UsageRow>(
            r#"
            SELECT u.history_id, u.subscription_id, u.volume_type, u.is_roaming, u.is_unlimited, u.amount_used, u.amount_total, u.amount_used_increment
            FROM subscription_history_usage u
            WHERE u.history_id = (
                SELECT h.history_id FROM subscription_history h
                WHERE h.subscription_id = $1 AND h.recorded_at < $2
                ORDER BY h.recorded_at DESC
                LIMIT 1
            )
            "#,
        )
        .bind(subscription_id)
        .bind(before)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load previous usage", e))?;

        timer.observe_duration();

        convert_all(rows)
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn list_history(
        &self,
        subscription_id: Uuid,
        limit: i64,
    ) -> Result<Vec<SubscriptionHistory>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_history"])
            .start_timer();

        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT history_id, subscription_id, recorded_at, sim_iccid, phone_number_msisdn, config
            FROM subscription_history
            WHERE subscription_id = $1
            ORDER BY recorded_at DESC
            LIMIT $2
            "#,
        )
        .bind(subscription_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list history", e))?;

        timer.observe_duration();

        Ok(rows.into_iter().map(SubscriptionHistory::from).collect())
    }

    #[instrument(skip(self), fields(history_id = %history_id))]
    async fn list_history_usage(&self, history_id: Uuid) -> Result<Vec<HistoryUsage>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_history_usage"])
            .start_timer();

        let rows = sqlx::query_as::<_, UsageRow>(
            r#"
            SELECT history_id, subscription_id, volume_type, is_roaming, is_unlimited, amount_used, amount_total, amount_used_increment
            FROM subscription_history_usage
            WHERE history_id = $1
            ORDER BY volume_type, is_roaming
            "#,
        )
        .bind(history_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list history usage", e))?;

        timer.observe_duration();

        convert_all(rows)
    }
}

//! Plan and offer catalog model.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;

/// Renewal characteristics of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: Uuid,
    pub name: String,
    pub valid_for_seconds: i64,
    pub does_auto_renew: bool,
}

impl Plan {
    /// End of a period of this plan that starts at `starts_at`.
    pub fn period_end(&self, starts_at: DateTime<Utc>) -> Result<DateTime<Utc>, AppError> {
        Duration::try_seconds(self.valid_for_seconds)
            .filter(|validity| *validity > Duration::zero())
            .and_then(|validity| starts_at.checked_add_signed(validity))
            .ok_or_else(|| {
                AppError::InvariantViolation(anyhow::anyhow!(
                    "Plan {} has an unusable duration of {}s",
                    self.plan_id,
                    self.valid_for_seconds
                ))
            })
    }
}

/// A sellable offer; every offer points at exactly one plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub offer_id: Uuid,
    pub plan_id: Uuid,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn plan(valid_for_seconds: i64) -> Plan {
        Plan {
            plan_id: Uuid::new_v4(),
            name: "plan".to_string(),
            valid_for_seconds,
            does_auto_renew: true,
        }
    }

    #[test]
    fn period_end_adds_the_plan_duration() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            plan(30 * 86_400).period_end(start).unwrap(),
            start + Duration::days(30)
        );
    }

    #[test]
    fn unusable_durations_are_rejected() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        for seconds in [0, -86_400, i64::MAX] {
            let result = plan(seconds).period_end(start);
            assert!(
                matches!(result, Err(AppError::InvariantViolation(_))),
                "{} seconds accepted",
                seconds
            );
        }
    }
}

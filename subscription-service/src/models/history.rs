//! Usage history snapshots.

use super::UnknownVariant;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

/// Metered volume type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolumeType {
    Data,
    Voice,
    Sms,
}

impl VolumeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeType::Data => "data",
            VolumeType::Voice => "voice",
            VolumeType::Sms => "sms",
        }
    }
}

impl FromStr for VolumeType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "data" => Ok(VolumeType::Data),
            "voice" => Ok(VolumeType::Voice),
            "sms" => Ok(VolumeType::Sms),
            other => Err(UnknownVariant::new("volume type", other)),
        }
    }
}

/// Immutable point-in-time record of one subscription line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionHistory {
    pub history_id: Uuid,
    pub subscription_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub sim_iccid: Option<String>,
    pub phone_number_msisdn: Option<String>,
    pub config: Option<serde_json::Value>,
}

/// Usage counters attached to a history row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryUsage {
    pub history_id: Uuid,
    pub subscription_id: Uuid,
    pub volume_type: VolumeType,
    pub is_roaming: bool,
    pub is_unlimited: bool,
    pub amount_used: i64,
    pub amount_total: Option<i64>,
    pub amount_used_increment: i64,
}

/// Usage as reported by the telco provider for one line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelcoUsage {
    pub subscription_id: Uuid,
    #[serde(rename = "type")]
    pub volume_type: VolumeType,
    pub is_roaming: bool,
    pub is_unlimited: bool,
    pub amount_used: i64,
    pub amount_total: Option<i64>,
}

/// Provider-side line configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelcoConfig {
    pub subscription_id: Uuid,
    pub config: serde_json::Value,
}

/// Usage counters are tracked per volume type and roaming flag.
pub type UsageKey = (VolumeType, bool);

/// Turn provider usage into history usage rows for `history_id`.
///
/// The increment is measured against the previous snapshot of the same key and
/// defaults to zero previous usage. A counter below its previous value was reset
/// at a period boundary, so the whole current amount is new usage.
pub fn usage_with_increments(
    history_id: Uuid,
    current: &[TelcoUsage],
    previous: &[HistoryUsage],
) -> Vec<HistoryUsage> {
    let previous: HashMap<UsageKey, i64> = previous
        .iter()
        .map(|u| ((u.volume_type, u.is_roaming), u.amount_used))
        .collect();

    current
        .iter()
        .map(|usage| {
            let before = previous
                .get(&(usage.volume_type, usage.is_roaming))
                .copied()
                .unwrap_or(0);
            let increment = if usage.amount_used >= before {
                usage.amount_used - before
            } else {
                usage.amount_used
            };

            HistoryUsage {
                history_id,
                subscription_id: usage.subscription_id,
                volume_type: usage.volume_type,
                is_roaming: usage.is_roaming,
                is_unlimited: usage.is_unlimited,
                amount_used: usage.amount_used,
                amount_total: if usage.is_unlimited {
                    None
                } else {
                    usage.amount_total
                },
                amount_used_increment: increment,
            }
        })
        .collect()
}

//! Core record model for the ad library mirror.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "adm-core";

/// Whether an ad is currently being served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    #[default]
    Active,
    Inactive,
}

impl Liveness {
    pub fn from_flag(active: bool) -> Self {
        if active {
            Self::Active
        } else {
            Self::Inactive
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }
}

/// Identity of one ad record: unique per `(page_id, archive_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AdIdentity {
    pub page_id: String,
    pub archive_id: String,
}

impl fmt::Display for AdIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.page_id, self.archive_id)
    }
}

/// One end of a bucketed metric, kept in whatever JSON form upstream sent it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricBound {
    Number(serde_json::Number),
    Text(String),
}

impl MetricBound {
    /// Accepts a JSON string or number; anything else is not a bound.
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::String(s) => Some(Self::Text(s.clone())),
            JsonValue::Number(n) => Some(Self::Number(n.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for MetricBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for MetricBound {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<u64> for MetricBound {
    fn from(value: u64) -> Self {
        Self::Number(value.into())
    }
}

/// Bucketed metric as reported upstream (spend, impressions).
///
/// Keys besides the two bounds stay in `extra`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetricRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_bound: Option<MetricBound>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_bound: Option<MetricBound>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

/// One ad as mirrored locally.
///
/// The modeled fields are the ones the sync logic reads. Every other attribute
/// the upstream entry carried lands in `extra` and is written back out verbatim,
/// so creative text and metrics the model does not know about survive every
/// store round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdRecord {
    pub ad_archive_id: String,
    pub page_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_name: Option<String>,
    #[serde(default)]
    pub liveness: Liveness,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ad_creation_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ad_delivery_start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ad_delivery_stop_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ad_snapshot_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spend: Option<MetricRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impressions: Option<MetricRange>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

impl AdRecord {
    pub fn new(page_id: impl Into<String>, ad_archive_id: impl Into<String>) -> Self {
        Self {
            ad_archive_id: ad_archive_id.into(),
            page_id: page_id.into(),
            page_name: None,
            liveness: Liveness::Active,
            ad_creation_time: None,
            ad_delivery_start_time: None,
            ad_delivery_stop_time: None,
            ad_snapshot_url: None,
            currency: None,
            spend: None,
            impressions: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn identity(&self) -> AdIdentity {
        AdIdentity {
            page_id: self.page_id.clone(),
            archive_id: self.ad_archive_id.clone(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.liveness.is_active()
    }

    /// Copy of this record marked inactive, stopped at `observed_at`.
    pub fn retired_at(&self, observed_at: DateTime<Utc>) -> Self {
        let mut retired = self.clone();
        retired.liveness = Liveness::Inactive;
        retired.ad_delivery_stop_time = Some(observed_at);
        retired
    }
}

/// Per-page aggregate written at the end of every successful sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMetadata {
    pub page_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_name: Option<String>,
    pub last_synced: DateTime<Utc>,
    pub total_ads: usize,
    pub active_ads: usize,
    pub inactive_ads: usize,
}

impl PageMetadata {
    /// Counts liveness over `records`; `active_ads + inactive_ads == total_ads` by construction.
    pub fn from_records<'a>(
        page_id: impl Into<String>,
        page_name: Option<String>,
        records: impl IntoIterator<Item = &'a AdRecord>,
        synced_at: DateTime<Utc>,
    ) -> Self {
        let (mut active_ads, mut inactive_ads) = (0usize, 0usize);
        for record in records {
            match record.liveness {
                Liveness::Active => active_ads += 1,
                Liveness::Inactive => inactive_ads += 1,
            }
        }
        Self {
            page_id: page_id.into(),
            page_name,
            last_synced: synced_at,
            total_ads: active_ads + inactive_ads,
            active_ads,
            inactive_ads,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.active_ads + self.inactive_ads == self.total_ads
    }
}

/// Outcome of one initial or incremental sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,
    pub total_fetched: usize,
    pub errors: Vec<String>,
    pub page_id: String,
    pub run_id: Uuid,
    pub new_records: usize,
    pub updated_records: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).single().unwrap()
    }

    #[test]
    fn metadata_counters_always_sum_to_total() {
        let mut records = vec![
            AdRecord::new("p1", "a1"),
            AdRecord::new("p1", "a2"),
            AdRecord::new("p1", "a3"),
        ];
        records[1].liveness = Liveness::Inactive;

        let metadata = PageMetadata::from_records("p1", None, &records, ts(2));
        assert_eq!(metadata.total_ads, 3);
        assert_eq!(metadata.active_ads, 2);
        assert_eq!(metadata.inactive_ads, 1);
        assert!(metadata.is_consistent());

        let empty = PageMetadata::from_records("p1", None, &Vec::<AdRecord>::new(), ts(2));
        assert_eq!(empty.total_ads, 0);
        assert!(empty.is_consistent());
    }

    #[test]
    fn unknown_attributes_survive_json_round_trip() {
        let mut record = AdRecord::new("p1", "a1");
        record.spend = Some(MetricRange {
            lower_bound: Some(100u64.into()),
            upper_bound: Some("199".into()),
            extra: BTreeMap::from([("currency".to_string(), json!("USD"))]),
        });
        record
            .extra
            .insert("ad_creative_bodies".into(), json!(["Buy now", "Limited offer"]));
        record.extra.insert("publisher_platforms".into(), json!(["facebook"]));

        let text = serde_json::to_string_pretty(&record).unwrap();
        let back: AdRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.extra["ad_creative_bodies"], json!(["Buy now", "Limited offer"]));

        let spend = serde_json::to_value(&back.spend).unwrap();
        assert_eq!(spend, json!({ "lower_bound": 100, "upper_bound": "199", "currency": "USD" }));
    }

    #[test]
    fn retiring_marks_inactive_and_stamps_stop_time() {
        let record = AdRecord::new("p1", "a1");
        let retired = record.retired_at(ts(5));
        assert_eq!(retired.liveness, Liveness::Inactive);
        assert_eq!(retired.ad_delivery_stop_time, Some(ts(5)));
        assert_eq!(retired.identity(), record.identity());
    }

    #[test]
    fn sync_result_serializes_camel_case() {
        let result = SyncResult {
            success: true,
            total_fetched: 3,
            errors: vec![],
            page_id: "p1".into(),
            run_id: Uuid::nil(),
            new_records: 3,
            updated_records: 0,
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["totalFetched"], json!(3));
        assert_eq!(value["pageId"], json!("p1"));
    }
}

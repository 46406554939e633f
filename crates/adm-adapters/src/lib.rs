//! Automation driver contract, payload extraction, and a recorded-feed driver.

use std::fs;
use std::path::Path;
use std::time::Duration;

use adm_core::{AdRecord, Liveness, MetricBound, MetricRange};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

pub const CRATE_NAME: &str = "adm-adapters";

pub const AD_LIBRARY_URL: &str = "https://www.facebook.com/ads/library/";

/// One intercepted response body, already decoded as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPayload {
    pub url: String,
    pub content_type: String,
    pub body: JsonValue,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

/// Which intercepted responses a subscription forwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFilter {
    pub url_contains: String,
    pub content_type_contains: String,
}

impl Default for ResponseFilter {
    fn default() -> Self {
        Self {
            url_contains: "/api/graphql".to_string(),
            content_type_contains: "application/json".to_string(),
        }
    }
}

impl ResponseFilter {
    pub fn matches(&self, url: &str, content_type: &str) -> bool {
        url.contains(&self.url_contains) && content_type.contains(&self.content_type_contains)
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver failed to start: {0}")]
    Init(String),
    #[error("navigation to {url} timed out after {}s", timeout.as_secs())]
    NavigationTimeout { url: String, timeout: Duration },
    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },
    #[error("driver used before initialize")]
    NotInitialized,
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

pub type PayloadSender = mpsc::UnboundedSender<RawPayload>;
pub type PayloadReceiver = mpsc::UnboundedReceiver<RawPayload>;

/// Browser-like collaborator that loads a listing and exposes the responses it triggers.
#[async_trait]
pub trait AutomationDriver: Send {
    async fn initialize(&mut self) -> Result<(), DriverError>;

    /// Forward every later response matching `filter` on the returned channel.
    /// A second call replaces the earlier subscription.
    fn subscribe(&mut self, filter: ResponseFilter) -> PayloadReceiver;

    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<(), DriverError>;

    /// Trigger further loading; `true` when the page's content extent grew.
    async fn advance(&mut self) -> Result<bool, DriverError>;

    async fn close(&mut self) -> Result<(), DriverError>;
}

/// A known nesting of ad edges inside a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShapeProbe {
    pub name: &'static str,
    pub path: &'static [&'static str],
}

pub const AD_LIBRARY_MAIN: ShapeProbe = ShapeProbe {
    name: "ad_library_main",
    path: &["data", "ad_library_main", "search_results", "edges"],
};

pub const PAGE_SEARCH_RESULT_ADS: ShapeProbe = ShapeProbe {
    name: "page_search_result_ads",
    path: &["data", "page", "ad_library_page_search_result_ads", "edges"],
};

/// Probes in priority order.
pub const DEFAULT_SHAPES: &[ShapeProbe] = &[AD_LIBRARY_MAIN, PAGE_SEARCH_RESULT_ADS];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("entry {index} carries no node object")]
    MissingNode { index: usize },
    #[error("entry {index} carries no ad_archive_id")]
    MissingIdentity { index: usize },
    #[error("ad {archive_id} carries no page id")]
    MissingPageId { archive_id: String },
    #[error("ad {archive_id}: invalid {field}: {reason}")]
    InvalidField {
        archive_id: String,
        field: &'static str,
        reason: String,
    },
}

/// What one payload yielded: records in entry order, plus skipped entries and unreadable fields.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub shape: Option<&'static str>,
    pub records: Vec<AdRecord>,
    pub failures: Vec<ExtractError>,
}

#[derive(Debug, Clone)]
pub struct Extractor {
    shapes: Vec<ShapeProbe>,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new(DEFAULT_SHAPES.to_vec())
    }
}

impl Extractor {
    pub fn new(shapes: Vec<ShapeProbe>) -> Self {
        Self { shapes }
    }

    pub fn shapes(&self) -> &[ShapeProbe] {
        &self.shapes
    }

    /// First probe whose path resolves to a non-empty array.
    pub fn match_shape<'a>(&self, body: &'a JsonValue) -> Option<(&'static str, &'a [JsonValue])> {
        self.shapes.iter().find_map(|probe| {
            json_at(body, probe.path)
                .and_then(JsonValue::as_array)
                .filter(|edges| !edges.is_empty())
                .map(|edges| (probe.name, edges.as_slice()))
        })
    }

    pub fn contains_ad_data(&self, body: &JsonValue) -> bool {
        self.match_shape(body).is_some()
    }

    pub fn extract(&self, body: &JsonValue) -> Extraction {
        let Some((shape, edges)) = self.match_shape(body) else {
            return Extraction::default();
        };

        let mut extraction = Extraction {
            shape: Some(shape),
            ..Extraction::default()
        };
        for (index, edge) in edges.iter().enumerate() {
            match normalize_entry(index, edge) {
                Ok(Normalized { record, issues }) => {
                    for issue in &issues {
                        debug!(shape, error = %issue, "ad field left unset");
                    }
                    extraction.failures.extend(issues);
                    extraction.records.push(record);
                }
                Err(err) => {
                    debug!(shape, error = %err, "skipping ad entry");
                    extraction.failures.push(err);
                }
            }
        }
        extraction
    }
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn id_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn unix_seconds(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

fn parse_timestamp(value: &JsonValue) -> Result<Option<DateTime<Utc>>, String> {
    match value {
        JsonValue::Null => Ok(None),
        JsonValue::Number(n) => n
            .as_i64()
            .and_then(unix_seconds)
            .map(Some)
            .ok_or_else(|| format!("{n} is not a unix timestamp")),
        JsonValue::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(None);
            }
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Ok(Some(ts.with_timezone(&Utc)));
            }
            if let Ok(ts) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%z") {
                return Ok(Some(ts.with_timezone(&Utc)));
            }
            s.parse::<i64>()
                .ok()
                .and_then(unix_seconds)
                .map(Some)
                .ok_or_else(|| format!("unrecognised timestamp {s:?}"))
        }
        other => Err(format!("unexpected value {other}")),
    }
}

fn parse_liveness(value: &JsonValue) -> Result<Option<Liveness>, String> {
    match value {
        JsonValue::Null => Ok(None),
        JsonValue::Bool(flag) => Ok(Some(Liveness::from_flag(*flag))),
        JsonValue::Number(n) => match n.as_i64() {
            Some(0) => Ok(Some(Liveness::Inactive)),
            Some(1) => Ok(Some(Liveness::Active)),
            _ => Err(format!("unexpected flag {n}")),
        },
        JsonValue::String(s) => match s.as_str() {
            "active" => Ok(Some(Liveness::Active)),
            "inactive" => Ok(Some(Liveness::Inactive)),
            _ => Err(format!("unexpected flag {s:?}")),
        },
        other => Err(format!("unexpected flag {other}")),
    }
}

fn optional_string(value: &JsonValue) -> Result<Option<String>, String> {
    match value {
        JsonValue::Null => Ok(None),
        JsonValue::String(s) => Ok(Some(s.clone())),
        other => Err(format!("expected a string, got {other}")),
    }
}

fn metric_range(value: &JsonValue) -> Result<Option<MetricRange>, String> {
    let range = match value {
        JsonValue::Null => return Ok(None),
        JsonValue::Object(range) => range,
        other => return Err(format!("expected a range object, got {other}")),
    };
    let mut metric = MetricRange::default();
    for (key, item) in range {
        let slot = match key.as_str() {
            "lower_bound" => &mut metric.lower_bound,
            "upper_bound" => &mut metric.upper_bound,
            _ => {
                metric.extra.insert(key.clone(), item.clone());
                continue;
            }
        };
        match item {
            JsonValue::Null => {}
            item => {
                *slot = Some(
                    MetricBound::from_json(item).ok_or_else(|| format!("{key} is {item}"))?,
                );
            }
        }
    }
    Ok(Some(metric))
}

/// Record extra key holding modeled attributes whose upstream value could not be read.
pub const UNPARSED_FIELDS_KEY: &str = "unparsed_fields";

/// Lifts modeled attributes out of a node, setting aside the ones it cannot read.
struct NodeFields<'a> {
    archive_id: &'a str,
    node: Map<String, JsonValue>,
    unparsed: Map<String, JsonValue>,
    issues: Vec<ExtractError>,
}

impl NodeFields<'_> {
    fn lift<T>(
        &mut self,
        field: &'static str,
        parse: impl FnOnce(&JsonValue) -> Result<Option<T>, String>,
    ) -> Option<T> {
        let value = self.node.remove(field)?;
        match parse(&value) {
            Ok(parsed) => parsed,
            Err(reason) => {
                self.issues.push(ExtractError::InvalidField {
                    archive_id: self.archive_id.to_string(),
                    field,
                    reason,
                });
                self.unparsed.insert(field.to_string(), value);
                None
            }
        }
    }
}

/// A normalized entry plus the modeled fields that had to be left unset.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub record: AdRecord,
    pub issues: Vec<ExtractError>,
}

/// Normalize one edge of a matched shape into a record.
///
/// Only a missing node, archive id or page id rejects the entry. A modeled
/// attribute with an unreadable value is left unset, reported in
/// [`Normalized::issues`], and kept verbatim under [`UNPARSED_FIELDS_KEY`].
/// Everything else, including nested objects such as `page`, is kept in
/// [`AdRecord::extra`].
pub fn normalize_entry(index: usize, edge: &JsonValue) -> Result<Normalized, ExtractError> {
    let mut node: Map<String, JsonValue> = edge
        .get("node")
        .and_then(JsonValue::as_object)
        .cloned()
        .ok_or(ExtractError::MissingNode { index })?;

    let archive_id = node
        .remove("ad_archive_id")
        .as_ref()
        .and_then(id_string)
        .ok_or(ExtractError::MissingIdentity { index })?;

    let nested_page = node.get("page").cloned();
    let page_id = node
        .remove("page_id")
        .as_ref()
        .and_then(id_string)
        .or_else(|| nested_page.as_ref().and_then(|p| p.get("id")).and_then(id_string))
        .ok_or_else(|| ExtractError::MissingPageId {
            archive_id: archive_id.clone(),
        })?;

    let mut fields = NodeFields {
        archive_id: &archive_id,
        node,
        unparsed: Map::new(),
        issues: Vec::new(),
    };
    let mut record = AdRecord::new(page_id, archive_id.clone());
    record.page_name = fields.lift("page_name", optional_string).or_else(|| {
        nested_page
            .as_ref()
            .and_then(|p| p.get("name"))
            .and_then(JsonValue::as_str)
            .map(ToString::to_string)
    });
    let flag = fields.lift("is_active", parse_liveness);
    let stored = fields.lift("liveness", parse_liveness);
    record.liveness = flag.or(stored).unwrap_or_default();
    record.ad_creation_time = fields.lift("ad_creation_time", parse_timestamp);
    record.ad_delivery_start_time = fields.lift("ad_delivery_start_time", parse_timestamp);
    record.ad_delivery_stop_time = fields.lift("ad_delivery_stop_time", parse_timestamp);
    record.ad_snapshot_url = fields.lift("ad_snapshot_url", optional_string);
    record.currency = fields.lift("currency", optional_string);
    record.spend = fields.lift("spend", metric_range);
    record.impressions = fields.lift("impressions", metric_range);

    let NodeFields {
        node,
        unparsed,
        issues,
        ..
    } = fields;
    record.extra = node.into_iter().collect();
    if !unparsed.is_empty() {
        record
            .extra
            .insert(UNPARSED_FIELDS_KEY.to_string(), JsonValue::Object(unparsed));
    }
    Ok(Normalized { record, issues })
}

/// `view_all_page_id` of an ad library URL, when it is a valid page id.
pub fn page_id_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .query_pairs()
        .find(|(key, _)| key == "view_all_page_id")
        .map(|(_, value)| value.into_owned())
        .filter(|id| is_valid_page_id(id))
}

pub fn is_valid_page_id(page_id: &str) -> bool {
    !page_id.is_empty() && page_id.bytes().all(|b| b.is_ascii_digit())
}

/// Library view listing every ad (active and inactive) of one page.
pub fn library_url_for_page(page_id: &str) -> String {
    format!(
        "{AD_LIBRARY_URL}?active_status=all&ad_type=all&country=ALL&view_all_page_id={page_id}"
    )
}

/// A recorded scroll session: `pages[0]` arrives on navigation, each later
/// page on one successful advance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedFixture {
    pub feed_id: String,
    #[serde(default)]
    pub notes: Option<String>,
    pub pages: Vec<Vec<RawPayload>>,
}

pub fn load_feed_fixture(path: impl AsRef<Path>) -> Result<FeedFixture> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Replays a [`FeedFixture`] through the driver contract.
#[derive(Debug)]
pub struct FixtureDriver {
    feed: FeedFixture,
    initialized: bool,
    next_page: usize,
    subscription: Option<(ResponseFilter, PayloadSender)>,
    navigated_to: Option<String>,
}

impl FixtureDriver {
    pub fn new(feed: FeedFixture) -> Self {
        Self {
            feed,
            initialized: false,
            next_page: 0,
            subscription: None,
            navigated_to: None,
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_feed_fixture(path)?))
    }

    pub fn navigated_to(&self) -> Option<&str> {
        self.navigated_to.as_deref()
    }

    fn emit_page(&self, index: usize) {
        let (Some((filter, sender)), Some(page)) = (&self.subscription, self.feed.pages.get(index))
        else {
            return;
        };
        for payload in page {
            if filter.matches(&payload.url, &payload.content_type) {
                // A dropped receiver only means nobody is listening any more.
                let _ = sender.send(payload.clone());
            }
        }
    }
}

#[async_trait]
impl AutomationDriver for FixtureDriver {
    async fn initialize(&mut self) -> Result<(), DriverError> {
        self.initialized = true;
        Ok(())
    }

    fn subscribe(&mut self, filter: ResponseFilter) -> PayloadReceiver {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscription = Some((filter, sender));
        receiver
    }

    async fn navigate(&mut self, url: &str, _timeout: Duration) -> Result<(), DriverError> {
        if !self.initialized {
            return Err(DriverError::NotInitialized);
        }
        if Url::parse(url).is_err() {
            return Err(DriverError::Navigation {
                url: url.to_string(),
                message: "not an absolute URL".to_string(),
            });
        }
        self.navigated_to = Some(url.to_string());
        self.emit_page(0);
        self.next_page = 1;
        Ok(())
    }

    async fn advance(&mut self) -> Result<bool, DriverError> {
        if !self.initialized {
            return Err(DriverError::NotInitialized);
        }
        if self.next_page >= self.feed.pages.len() {
            return Ok(false);
        }
        self.emit_page(self.next_page);
        self.next_page += 1;
        Ok(true)
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        self.subscription = None;
        self.initialized = false;
        Ok(())
    }
}

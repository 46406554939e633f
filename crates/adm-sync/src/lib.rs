//! Sync engine: pagination, deduplication, reconciliation and run orchestration.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use adm_adapters::{
    library_url_for_page, page_id_from_url, AutomationDriver, DriverError, ExtractError, Extractor,
    PayloadReceiver, RawPayload, ResponseFilter,
};
use adm_core::{AdIdentity, AdRecord, PageMetadata, SyncResult};
use adm_storage::{PayloadArchive, RecordStore, StoreError};
use anyhow::Context;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "adm-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub artifacts_dir: Option<PathBuf>,
    pub navigation_timeout: Duration,
    pub settle_interval: Duration,
    pub stall_limit: usize,
    pub first_payload_attempts: usize,
    pub first_payload_poll: Duration,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./ads_data"),
            artifacts_dir: None,
            navigation_timeout: Duration::from_secs(60),
            settle_interval: Duration::from_millis(2000),
            stall_limit: 5,
            first_payload_attempts: 10,
            first_payload_poll: Duration::from_millis(1000),
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".to_string(),
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("ADM_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            artifacts_dir: std::env::var("ADM_ARTIFACTS_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            navigation_timeout: Duration::from_secs(env_parsed("ADM_NAVIGATION_TIMEOUT_SECS", 60)),
            settle_interval: Duration::from_millis(env_parsed("ADM_SETTLE_MS", 2000)),
            stall_limit: env_parsed("ADM_STALL_LIMIT", defaults.stall_limit).max(1),
            first_payload_attempts: env_parsed(
                "ADM_FIRST_PAYLOAD_ATTEMPTS",
                defaults.first_payload_attempts,
            ),
            first_payload_poll: Duration::from_millis(env_parsed("ADM_FIRST_PAYLOAD_POLL_MS", 1000)),
            scheduler_enabled: std::env::var("ADM_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("ADM_SYNC_CRON").unwrap_or(defaults.sync_cron),
        }
    }

    pub fn pagination(&self, max_records: Option<usize>) -> PaginationConfig {
        PaginationConfig {
            stall_limit: self.stall_limit.max(1),
            settle_interval: self.settle_interval,
            first_payload_attempts: self.first_payload_attempts,
            first_payload_poll: self.first_payload_poll,
            // A zero cap means "no cap".
            max_records: max_records.filter(|cap| *cap > 0),
            keep_payloads: self.artifacts_dir.is_some(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PaginationConfig {
    pub stall_limit: usize,
    pub settle_interval: Duration,
    pub first_payload_attempts: usize,
    pub first_payload_poll: Duration,
    pub max_records: Option<usize>,
    pub keep_payloads: bool,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        SyncConfig::default().pagination(None)
    }
}

/// Identity-keyed record set in first-seen order.
///
/// A repeated identity overwrites the stored record in place: the last
/// occurrence wins on content, the first occurrence fixes the position.
#[derive(Debug, Clone, Default)]
pub struct LiveSet {
    records: Vec<AdRecord>,
    index: HashMap<AdIdentity, usize>,
}

impl LiveSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Returns `true` when the identity was not seen before.
    pub fn insert(&mut self, record: AdRecord) -> bool {
        let identity = record.identity();
        match self.index.get(&identity) {
            Some(&slot) => {
                self.records[slot] = record;
                false
            }
            None => {
                self.index.insert(identity, self.records.len());
                self.records.push(record);
                true
            }
        }
    }

    pub fn get(&self, identity: &AdIdentity) -> Option<&AdRecord> {
        self.index.get(identity).map(|&slot| &self.records[slot])
    }

    /// Keep the first `cap` identities.
    pub fn truncate(&mut self, cap: usize) {
        if self.records.len() <= cap {
            return;
        }
        for dropped in self.records.drain(cap..) {
            self.index.remove(&dropped.identity());
        }
    }

    pub fn records(&self) -> &[AdRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<AdRecord> {
        self.records
    }
}

impl Extend<AdRecord> for LiveSet {
    fn extend<I: IntoIterator<Item = AdRecord>>(&mut self, iter: I) {
        for record in iter {
            self.insert(record);
        }
    }
}

impl FromIterator<AdRecord> for LiveSet {
    fn from_iter<I: IntoIterator<Item = AdRecord>>(iter: I) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}

pub fn deduplicate(records: impl IntoIterator<Item = AdRecord>) -> Vec<AdRecord> {
    records.into_iter().collect::<LiveSet>().into_records()
}

/// Responses delivered by the driver and not yet consumed by a cycle.
///
/// Created per sync invocation from a fresh subscription, so no two runs can
/// see each other's payloads.
#[derive(Debug)]
pub struct ResponseBuffer {
    receiver: PayloadReceiver,
    pending: Vec<RawPayload>,
}

impl ResponseBuffer {
    pub fn new(receiver: PayloadReceiver) -> Self {
        Self {
            receiver,
            pending: Vec::new(),
        }
    }

    fn pull(&mut self) {
        while let Ok(payload) = self.receiver.try_recv() {
            self.pending.push(payload);
        }
    }

    pub fn has_pending(&mut self) -> bool {
        self.pull();
        !self.pending.is_empty()
    }

    pub fn drain(&mut self) -> Vec<RawPayload> {
        self.pull();
        std::mem::take(&mut self.pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    StallExhausted,
    CapReached,
    NoFurtherContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginationState {
    Init,
    Accumulating,
    Stalled { consecutive: usize },
    Done(StopReason),
}

impl PaginationState {
    /// Transition after a cycle that moved the live set from `previous` to `current` records.
    pub fn after_cycle(
        self,
        previous: usize,
        current: usize,
        max_records: Option<usize>,
        stall_limit: usize,
    ) -> Self {
        if let Self::Done(_) = self {
            return self;
        }
        if max_records.is_some_and(|cap| current >= cap) {
            return Self::Done(StopReason::CapReached);
        }
        if current > previous {
            return Self::Accumulating;
        }
        let consecutive = match self {
            Self::Stalled { consecutive } => consecutive + 1,
            _ => 1,
        };
        if consecutive >= stall_limit {
            Self::Done(StopReason::StallExhausted)
        } else {
            Self::Stalled { consecutive }
        }
    }
}

/// Live set produced by one pagination run.
#[derive(Debug, Clone)]
pub struct Collected {
    pub records: Vec<AdRecord>,
    pub stop_reason: StopReason,
    pub cycles: usize,
    pub extraction_failures: Vec<ExtractError>,
    /// Populated only when [`PaginationConfig::keep_payloads`] is set.
    pub payloads: Vec<RawPayload>,
}

pub struct PaginationController {
    config: PaginationConfig,
    extractor: Extractor,
}

impl PaginationController {
    pub fn new(config: PaginationConfig, extractor: Extractor) -> Self {
        Self { config, extractor }
    }

    /// Drive fetch/advance cycles until stall exhaustion, the cap, or the end of content.
    ///
    /// The driver must already be subscribed (feeding `buffer`) and navigated.
    pub async fn run(
        &self,
        driver: &mut dyn AutomationDriver,
        buffer: &mut ResponseBuffer,
    ) -> Result<Collected, DriverError> {
        let mut live = LiveSet::new();
        let mut failures = Vec::new();
        let mut kept = Vec::new();
        let mut state = PaginationState::Init;
        let mut cycles = 0usize;

        self.wait_for_first_payload(buffer).await;

        let stop_reason = loop {
            cycles += 1;
            let previous = live.len();
            self.harvest(buffer, &mut live, &mut failures, &mut kept);
            state = state.after_cycle(
                previous,
                live.len(),
                self.config.max_records,
                self.config.stall_limit,
            );
            debug!(
                cycle = cycles,
                records = live.len(),
                failures = failures.len(),
                ?state,
                "pagination cycle"
            );

            if let PaginationState::Done(reason) = state {
                break reason;
            }

            if !driver.advance().await? {
                // Responses triggered by the last advance may still be buffered.
                self.harvest(buffer, &mut live, &mut failures, &mut kept);
                break StopReason::NoFurtherContent;
            }
            tokio::time::sleep(self.config.settle_interval).await;
        };

        if let Some(cap) = self.config.max_records {
            live.truncate(cap);
        }
        info!(records = live.len(), cycles, ?stop_reason, "pagination finished");

        Ok(Collected {
            records: live.into_records(),
            stop_reason,
            cycles,
            extraction_failures: failures,
            payloads: kept,
        })
    }

    async fn wait_for_first_payload(&self, buffer: &mut ResponseBuffer) {
        for _ in 0..self.config.first_payload_attempts {
            if buffer.has_pending() {
                return;
            }
            tokio::time::sleep(self.config.first_payload_poll).await;
        }
    }

    fn harvest(
        &self,
        buffer: &mut ResponseBuffer,
        live: &mut LiveSet,
        failures: &mut Vec<ExtractError>,
        kept: &mut Vec<RawPayload>,
    ) {
        for payload in buffer.drain() {
            let extraction = self.extractor.extract(&payload.body);
            live.extend(extraction.records);
            failures.extend(extraction.failures);
            if self.config.keep_payloads {
                kept.push(payload);
            }
        }
    }
}

/// Writes an incremental run must apply to bring the stored page up to date.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    /// Live identities absent from the snapshot.
    pub new: Vec<AdRecord>,
    /// Live versions of identities whose tracked fields moved.
    pub changed: Vec<AdRecord>,
    /// Snapshot identities that were active and are no longer live, already marked inactive.
    pub retired: Vec<AdRecord>,
    pub unchanged: usize,
    /// Page state once the plan is applied: every live and every snapshot identity.
    pub merged: Vec<AdRecord>,
}

impl ReconcilePlan {
    pub fn updated(&self) -> usize {
        self.changed.len() + self.retired.len()
    }

    pub fn is_noop(&self) -> bool {
        self.new.is_empty() && self.changed.is_empty() && self.retired.is_empty()
    }
}

/// Fields whose movement makes a stored record stale.
pub fn has_material_change(stored: &AdRecord, live: &AdRecord) -> bool {
    stored.liveness != live.liveness
        || stored.ad_delivery_stop_time != live.ad_delivery_stop_time
        || stored.spend != live.spend
        || stored.impressions != live.impressions
}

/// Three-way diff of a freshly collected live set against the stored snapshot.
///
/// Absence from the live set never deletes: an active snapshot record that
/// disappeared is retired (inactive, stop time = `observed_at`), an inactive
/// one is left alone.
pub fn reconcile(live: &[AdRecord], snapshot: &[AdRecord], observed_at: DateTime<Utc>) -> ReconcilePlan {
    let stored: HashMap<AdIdentity, &AdRecord> =
        snapshot.iter().map(|record| (record.identity(), record)).collect();
    let mut plan = ReconcilePlan::default();
    let mut seen = HashSet::with_capacity(live.len());

    for record in live {
        let identity = record.identity();
        match stored.get(&identity) {
            None => {
                plan.new.push(record.clone());
                plan.merged.push(record.clone());
            }
            Some(previous) if has_material_change(previous, record) => {
                plan.changed.push(record.clone());
                plan.merged.push(record.clone());
            }
            Some(previous) => {
                plan.unchanged += 1;
                plan.merged.push((*previous).clone());
            }
        }
        seen.insert(identity);
    }

    for record in snapshot {
        if seen.contains(&record.identity()) {
            continue;
        }
        if record.is_active() {
            let retired = record.retired_at(observed_at);
            plan.merged.push(retired.clone());
            plan.retired.push(retired);
        } else {
            plan.merged.push(record.clone());
        }
    }

    plan
}

/// Page state after a plan's writes, given the identities whose write failed.
///
/// A failed identity counts as its snapshot version, or not at all when the
/// snapshot never held it.
pub fn settled_view<'a>(
    merged: &'a [AdRecord],
    snapshot: &'a [AdRecord],
    failed: &HashSet<AdIdentity>,
) -> Vec<&'a AdRecord> {
    if failed.is_empty() {
        return merged.iter().collect();
    }
    let stored: HashMap<AdIdentity, &AdRecord> =
        snapshot.iter().map(|record| (record.identity(), record)).collect();
    merged
        .iter()
        .filter_map(|record| {
            let identity = record.identity();
            if failed.contains(&identity) {
                stored.get(&identity).copied()
            } else {
                Some(record)
            }
        })
        .collect()
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("automation driver failed to start: {0}")]
    DriverInit(#[source] DriverError),
    #[error("navigation to {url} timed out after {}s", timeout.as_secs())]
    NavigationTimeout { url: String, timeout: Duration },
    #[error("automation driver failed: {0}")]
    Driver(#[source] DriverError),
    #[error("no metadata found for page {page_id}; run an initial sync first")]
    MissingMetadata { page_id: String },
    #[error("no ads collected from {url}; the URL may be invalid or the page has no ads")]
    EmptyResult { url: String },
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}

impl SyncError {
    fn from_navigation(err: DriverError) -> Self {
        match err {
            DriverError::NavigationTimeout { url, timeout } => Self::NavigationTimeout { url, timeout },
            other => Self::Driver(other),
        }
    }
}

/// Hands out a fresh automation driver for each run.
pub trait DriverFactory: Send + Sync {
    fn create(&self) -> Box<dyn AutomationDriver>;
}

impl<F> DriverFactory for F
where
    F: Fn() -> Box<dyn AutomationDriver> + Send + Sync,
{
    fn create(&self) -> Box<dyn AutomationDriver> {
        self()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Initial,
    Incremental,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Incremental => "incremental",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Starting,
    Fetching,
    Reconciling,
    Persisting,
    Finalizing,
    Done,
    Failed,
}

struct RunState {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    phase: SyncPhase,
    page_id: String,
    total_fetched: usize,
    errors: Vec<String>,
    new_records: usize,
    updated_records: usize,
}

impl RunState {
    fn new(page_id: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            phase: SyncPhase::Starting,
            page_id: page_id.into(),
            total_fetched: 0,
            errors: Vec::new(),
            new_records: 0,
            updated_records: 0,
        }
    }

    fn enter(&mut self, phase: SyncPhase) {
        debug!(from = ?self.phase, to = ?phase, "sync phase");
        self.phase = phase;
    }

    fn finish(mut self, outcome: Result<(), SyncError>) -> SyncResult {
        let success = match outcome {
            Ok(()) => {
                self.enter(SyncPhase::Done);
                info!(
                    page_id = %self.page_id,
                    fetched = self.total_fetched,
                    new = self.new_records,
                    updated = self.updated_records,
                    non_fatal_errors = self.errors.len(),
                    "sync complete"
                );
                true
            }
            Err(err) => {
                self.enter(SyncPhase::Failed);
                error!(page_id = %self.page_id, error = %err, "sync failed");
                self.errors.push(err.to_string());
                false
            }
        };
        SyncResult {
            success,
            total_fetched: self.total_fetched,
            errors: self.errors,
            page_id: self.page_id,
            run_id: self.run_id,
            new_records: self.new_records,
            updated_records: self.updated_records,
        }
    }
}

/// Sequences initial and incremental runs against one store.
///
/// Callers must not run two syncs for the same page at once; nothing here
/// serializes them.
pub struct SyncManager {
    config: SyncConfig,
    store: Arc<dyn RecordStore>,
    drivers: Box<dyn DriverFactory>,
    extractor: Extractor,
    archive: Option<PayloadArchive>,
}

impl SyncManager {
    pub fn new(config: SyncConfig, store: Arc<dyn RecordStore>, drivers: Box<dyn DriverFactory>) -> Self {
        let archive = config.artifacts_dir.clone().map(PayloadArchive::new);
        Self {
            config,
            store,
            drivers,
            extractor: Extractor::default(),
            archive,
        }
    }

    pub fn with_extractor(mut self, extractor: Extractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn RecordStore {
        self.store.as_ref()
    }

    /// Mirror a page for the first time from a library `url`.
    pub async fn initial_sync(&self, url: &str, max_records: Option<usize>) -> SyncResult {
        let mut run = RunState::new(page_id_from_url(url).unwrap_or_default());
        let span = info_span!("sync_run", run_id = %run.run_id, mode = SyncMode::Initial.as_str());
        async move {
            info!(url, ?max_records, "starting initial sync");
            let mut driver = self.drivers.create();
            let outcome = self
                .initial_phases(driver.as_mut(), url, max_records, &mut run)
                .await;
            self.release(driver, &mut run).await;
            run.finish(outcome)
        }
        .instrument(span)
        .await
    }

    /// Bring an already mirrored page up to date with the live library.
    pub async fn incremental_sync(&self, page_id: &str) -> SyncResult {
        let mut run = RunState::new(page_id);
        let span = info_span!("sync_run", run_id = %run.run_id, mode = SyncMode::Incremental.as_str());
        async move {
            info!(page_id, "starting incremental sync");
            let outcome = match self.require_metadata(page_id).await {
                Ok(metadata) => {
                    let mut driver = self.drivers.create();
                    let outcome = self
                        .incremental_phases(driver.as_mut(), metadata, &mut run)
                        .await;
                    self.release(driver, &mut run).await;
                    outcome
                }
                Err(err) => Err(err),
            };
            run.finish(outcome)
        }
        .instrument(span)
        .await
    }

    /// Incremental sync of every page that has metadata, one page at a time.
    pub async fn sync_tracked_pages(&self) -> Result<Vec<SyncResult>, SyncError> {
        let pages = self.store.list_pages().await?;
        info!(pages = pages.len(), "syncing tracked pages");
        let mut results = Vec::with_capacity(pages.len());
        for page_id in pages {
            results.push(self.incremental_sync(&page_id).await);
        }
        Ok(results)
    }

    async fn initial_phases(
        &self,
        driver: &mut dyn AutomationDriver,
        url: &str,
        max_records: Option<usize>,
        run: &mut RunState,
    ) -> Result<(), SyncError> {
        run.enter(SyncPhase::Fetching);
        let collected = self.fetch_live(driver, url, max_records).await?;
        run.total_fetched = collected.records.len();
        let Some(first) = collected.records.first() else {
            return Err(SyncError::EmptyResult { url: url.to_string() });
        };
        if run.page_id.is_empty() {
            run.page_id = first.page_id.clone();
        }
        let page_name = collected.records.iter().find_map(|r| r.page_name.clone());

        run.enter(SyncPhase::Persisting);
        self.store.ensure_container(&run.page_id).await?;
        let mut written = Vec::with_capacity(collected.records.len());
        for record in &collected.records {
            if self.persist(record, run).await {
                run.new_records += 1;
                written.push(record);
            }
        }
        self.archive_payloads(&collected.payloads, run).await;

        run.enter(SyncPhase::Finalizing);
        let metadata = PageMetadata::from_records(&run.page_id, page_name, written, Utc::now());
        self.store.put_metadata(&run.page_id, &metadata).await?;
        info!(
            total = metadata.total_ads,
            active = metadata.active_ads,
            inactive = metadata.inactive_ads,
            "page metadata written"
        );
        Ok(())
    }

    async fn incremental_phases(
        &self,
        driver: &mut dyn AutomationDriver,
        metadata: PageMetadata,
        run: &mut RunState,
    ) -> Result<(), SyncError> {
        run.enter(SyncPhase::Fetching);
        let url = library_url_for_page(&run.page_id);
        let collected = self.fetch_live(driver, &url, None).await?;
        run.total_fetched = collected.records.len();
        if collected.records.is_empty() {
            return Err(SyncError::EmptyResult { url });
        }
        let snapshot = self.store.list_all(&run.page_id).await?;

        run.enter(SyncPhase::Reconciling);
        let plan = reconcile(&collected.records, &snapshot, Utc::now());
        info!(
            new = plan.new.len(),
            changed = plan.changed.len(),
            retired = plan.retired.len(),
            unchanged = plan.unchanged,
            "reconciled live set against snapshot"
        );

        run.enter(SyncPhase::Persisting);
        self.store.ensure_container(&run.page_id).await?;
        let mut failed = HashSet::new();
        for record in &plan.new {
            if self.persist(record, run).await {
                run.new_records += 1;
            } else {
                failed.insert(record.identity());
            }
        }
        for record in plan.changed.iter().chain(&plan.retired) {
            if self.persist(record, run).await {
                run.updated_records += 1;
            } else {
                failed.insert(record.identity());
            }
        }
        self.archive_payloads(&collected.payloads, run).await;

        run.enter(SyncPhase::Finalizing);
        let page_name = metadata
            .page_name
            .or_else(|| collected.records.iter().find_map(|r| r.page_name.clone()));
        let refreshed = PageMetadata::from_records(
            &run.page_id,
            page_name,
            settled_view(&plan.merged, &snapshot, &failed),
            Utc::now(),
        );
        self.store.put_metadata(&run.page_id, &refreshed).await?;
        info!(
            total = refreshed.total_ads,
            active = refreshed.active_ads,
            inactive = refreshed.inactive_ads,
            "page metadata written"
        );
        Ok(())
    }

    async fn require_metadata(&self, page_id: &str) -> Result<PageMetadata, SyncError> {
        self.store
            .get_metadata(page_id)
            .await?
            .ok_or_else(|| SyncError::MissingMetadata {
                page_id: page_id.to_string(),
            })
    }

    async fn fetch_live(
        &self,
        driver: &mut dyn AutomationDriver,
        url: &str,
        max_records: Option<usize>,
    ) -> Result<Collected, SyncError> {
        driver.initialize().await.map_err(SyncError::DriverInit)?;
        let mut buffer = ResponseBuffer::new(driver.subscribe(ResponseFilter::default()));
        driver
            .navigate(url, self.config.navigation_timeout)
            .await
            .map_err(SyncError::from_navigation)?;

        let controller =
            PaginationController::new(self.config.pagination(max_records), self.extractor.clone());
        let collected = controller
            .run(driver, &mut buffer)
            .await
            .map_err(SyncError::Driver)?;
        if !collected.extraction_failures.is_empty() {
            warn!(
                issues = collected.extraction_failures.len(),
                "malformed ad entries skipped or fields left unset"
            );
        }
        Ok(collected)
    }

    /// Per-record write; a failure is recorded on the run and does not stop it.
    async fn persist(&self, record: &AdRecord, run: &mut RunState) -> bool {
        match self
            .store
            .put(&record.page_id, &record.ad_archive_id, record)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!(ad = %record.identity(), error = %err, "failed to save ad");
                run.errors
                    .push(format!("failed to save ad {}: {err}", record.ad_archive_id));
                false
            }
        }
    }

    async fn archive_payloads(&self, payloads: &[RawPayload], run: &mut RunState) {
        let Some(archive) = &self.archive else {
            return;
        };
        for payload in payloads {
            let archived = match serde_json::to_vec_pretty(&payload.body) {
                Ok(bytes) => archive.archive(run.started_at, &run.page_id, &bytes).await,
                Err(err) => Err(err.into()),
            };
            if let Err(err) = archived {
                warn!(error = %err, "failed to archive raw payload");
                run.errors.push(format!("failed to archive payload from {}: {err:#}", payload.url));
            }
        }
    }

    async fn release(&self, mut driver: Box<dyn AutomationDriver>, run: &mut RunState) {
        if let Err(err) = driver.close().await {
            warn!(error = %err, "failed to close automation driver");
            run.errors.push(format!("failed to close automation driver: {err}"));
        }
    }
}

/// Cron job sweeping every tracked page, when the scheduler is enabled.
pub async fn maybe_build_scheduler(manager: Arc<SyncManager>) -> anyhow::Result<Option<JobScheduler>> {
    if !manager.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = manager.config.sync_cron.clone();
    let job_manager = Arc::clone(&manager);
    let job = Job::new_async(&cron, move |_uuid, _lock| {
        let manager = Arc::clone(&job_manager);
        Box::pin(async move {
            match manager.sync_tracked_pages().await {
                Ok(results) => {
                    let failed = results.iter().filter(|r| !r.success).count();
                    info!(pages = results.len(), failed, "scheduled sweep finished");
                }
                Err(err) => warn!(error = %err, "scheduled sweep could not list tracked pages"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

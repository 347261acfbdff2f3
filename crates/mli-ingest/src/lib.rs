//! Export file ingestion: discovery, parsing, duplicate filtering, upload.
//!
//! The long-running entry point is [`ListingMonitor::run`], which polls a
//! watch directory for CSV export files dropped by the external scraper,
//! turns fresh files into batches of new [`Listing`]s, and pushes them to
//! the remote store through a bounded worker pool. Everything here is a
//! single-process, single-writer design; running two monitors against the
//! same store will produce duplicate writes.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::Utc;
use mli_core::{identity_key, Listing, LISTING_SOURCE, UNCATEGORIZED};
use mli_store::{
    BackoffPolicy, DuplicateIndex, HttpRemoteStore, RemoteStore, StoreConfig, UploadError,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "mli-ingest";

const DIRECTORY_BACKOFF: Duration = Duration::from_secs(10);
const REJECTION_LOG_SAMPLE: usize = 5;
const DUPLICATE_LOG_SAMPLE: usize = 5;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub watch_dir: PathBuf,
    pub poll_interval: Duration,
    pub settle_delay: Duration,
    pub min_price: f64,
    pub max_price: f64,
    pub database_url: String,
    pub collection: String,
    pub auth_token: String,
    pub upload_workers: usize,
    pub http_timeout_secs: u64,
    pub workspace_root: PathBuf,
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        Self {
            watch_dir: std::env::var("MLI_WATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_watch_dir()),
            poll_interval: Duration::from_secs(env_parse("MLI_POLL_SECS", 5)),
            settle_delay: Duration::from_secs(env_parse("MLI_SETTLE_SECS", 2)),
            min_price: env_parse("MLI_MIN_PRICE", 50.0),
            max_price: env_parse("MLI_MAX_PRICE", 2000.0),
            database_url: std::env::var("MLI_DATABASE_URL").unwrap_or_default(),
            collection: std::env::var("MLI_COLLECTION")
                .unwrap_or_else(|_| "phone_listings".to_string()),
            auth_token: std::env::var("MLI_AUTH_TOKEN").unwrap_or_default(),
            upload_workers: env_parse("MLI_UPLOAD_WORKERS", 8usize),
            http_timeout_secs: env_parse("MLI_HTTP_TIMEOUT_SECS", 15u64),
            workspace_root: PathBuf::from("."),
        }
    }
}

fn default_watch_dir() -> PathBuf {
    std::env::var("HOME")
        .map(|home| PathBuf::from(home).join("Downloads"))
        .unwrap_or_else(|_| PathBuf::from("."))
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Search context
// ---------------------------------------------------------------------------

/// Region vocabulary matched against export file names. The scraper encodes
/// the searched city in the file name, sometimes as an area code or a base
/// page identifier rather than a word.
const REGION_VOCABULARY: &[(&str, &str)] = &[
    ("corpuschristi", "Corpus Christi"),
    ("corpus", "Corpus Christi"),
    ("103103056397247", "Corpus Christi"),
    ("houston", "Houston"),
    ("austin", "Austin"),
    ("dallas", "Dallas"),
    ("361", "Corpus Christi"),
    ("cc", "Corpus Christi"),
];

/// Coarse search-context tag from the export file name alone. Pure function;
/// unmatched names map to "unknown".
pub fn search_context_for_file(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    for (needle, label) in REGION_VOCABULARY {
        if stem.contains(needle) {
            return (*label).to_string();
        }
    }
    "unknown".to_string()
}

// ---------------------------------------------------------------------------
// Category rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct CategoryRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<CategoryRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryRule {
    pub label: String,
    pub contains_all: Vec<String>,
}

/// Ordered category rule table, most specific rule first. Best-effort
/// enrichment only; a title that matches nothing lands in the generic
/// bucket instead of being rejected.
#[derive(Debug, Clone)]
pub struct CategoryRules {
    rules: Vec<CategoryRule>,
}

/// Compiled-in fallback mirroring rules/categories.yaml. Tokens are matched
/// against the normalized (lowercase, alphanumeric, single-spaced) title,
/// so "12.9" appears here as "12 9".
const BUILTIN_CATEGORY_RULES: &[(&str, &[&str])] = &[
    ("iPhone 17 Pro Max", &["iphone", "17", "pro max"]),
    ("iPhone 17 Pro", &["iphone", "17", "pro"]),
    ("iPhone 17 Air", &["iphone", "17", "air"]),
    ("iPhone 17", &["iphone", "17"]),
    ("iPhone 16 Pro Max", &["iphone", "16", "pro max"]),
    ("iPhone 16 Pro", &["iphone", "16", "pro"]),
    ("iPhone 16 Plus", &["iphone", "16", "plus"]),
    ("iPhone 16e", &["iphone", "16e"]),
    ("iPhone 16", &["iphone", "16"]),
    ("iPhone 15 Pro Max", &["iphone", "15", "pro max"]),
    ("iPhone 15 Pro", &["iphone", "15", "pro"]),
    ("iPhone 15 Plus", &["iphone", "15", "plus"]),
    ("iPhone 15", &["iphone", "15"]),
    ("iPhone 14 Pro Max", &["iphone", "14", "pro max"]),
    ("iPhone 14 Pro", &["iphone", "14", "pro"]),
    ("iPhone 14 Plus", &["iphone", "14", "plus"]),
    ("iPhone 14", &["iphone", "14"]),
    ("iPhone", &["iphone"]),
    ("iPad Pro 12.9\"", &["ipad pro", "12 9"]),
    ("iPad Pro 11\"", &["ipad pro", "11"]),
    ("iPad Pro", &["ipad pro"]),
    ("iPad Air M2", &["ipad air", "m2"]),
    ("iPad Air M1", &["ipad air", "m1"]),
    ("iPad Air", &["ipad air"]),
    ("iPad Mini", &["ipad mini"]),
    ("iPad", &["ipad"]),
    ("MacBook Air M3", &["macbook air", "m3"]),
    ("MacBook Air M2", &["macbook air", "m2"]),
    ("MacBook Air M1", &["macbook air", "m1"]),
    ("MacBook Air", &["macbook air"]),
    ("MacBook Pro 16\"", &["macbook pro", "16"]),
    ("MacBook Pro 14\"", &["macbook pro", "14"]),
    ("MacBook Pro 13\"", &["macbook pro", "13"]),
    ("MacBook Pro", &["macbook pro"]),
    ("MacBook", &["macbook"]),
];

impl CategoryRules {
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("rules").join("categories.yaml");
        let file: CategoryRulesFile = serde_yaml::from_str(
            &std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?,
        )
        .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self { rules: file.rules })
    }

    pub fn builtin() -> Self {
        Self {
            rules: BUILTIN_CATEGORY_RULES
                .iter()
                .map(|(label, tokens)| CategoryRule {
                    label: (*label).to_string(),
                    contains_all: tokens.iter().map(|t| (*t).to_string()).collect(),
                })
                .collect(),
        }
    }

    /// First rule whose tokens are all contained in the normalized title.
    pub fn classify(&self, title: &str) -> String {
        let haystack = mli_core::normalize_fragment(title);
        for rule in &self.rules {
            if rule
                .contains_all
                .iter()
                .all(|needle| haystack.contains(needle.to_ascii_lowercase().as_str()))
            {
                return rule.label.clone();
            }
        }
        UNCATEGORIZED.to_string()
    }
}

// ---------------------------------------------------------------------------
// Record parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowRejection {
    MissingTitle,
    MissingLink,
    BadPrice,
}

/// Column positions resolved once per file. Lookup is case-insensitive, so
/// both historical header spellings (`Title` and `title`) resolve; extra
/// columns are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderMap {
    title: Option<usize>,
    price: Option<usize>,
    location: Option<usize>,
    link: Option<usize>,
}

impl HeaderMap {
    pub fn from_headers(headers: &csv::StringRecord) -> Self {
        let mut map = Self::default();
        for (idx, name) in headers.iter().enumerate() {
            let slot = match name.trim().to_ascii_lowercase().as_str() {
                "title" => &mut map.title,
                "price" => &mut map.price,
                "location" => &mut map.location,
                "link" => &mut map.link,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(idx);
            }
        }
        map
    }

    fn field<'a>(&self, record: &'a csv::StringRecord, idx: Option<usize>) -> &'a str {
        idx.and_then(|i| record.get(i)).unwrap_or("").trim()
    }
}

/// Partial listing straight out of one export row, before identity and
/// context are attached.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRow {
    pub title: String,
    pub price: f64,
    pub location: String,
    pub link: String,
}

pub fn parse_row(
    record: &csv::StringRecord,
    headers: &HeaderMap,
) -> std::result::Result<ParsedRow, RowRejection> {
    let title = headers.field(record, headers.title);
    if title.is_empty() {
        return Err(RowRejection::MissingTitle);
    }
    let link = headers.field(record, headers.link);
    if link.is_empty() {
        return Err(RowRejection::MissingLink);
    }
    let price = mli_core::parse_price(headers.field(record, headers.price))
        .ok_or(RowRejection::BadPrice)?;
    let location = headers.field(record, headers.location);

    Ok(ParsedRow {
        title: title.to_string(),
        price,
        location: location.to_string(),
        link: link.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Ingest pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct PriceBand {
    pub min: f64,
    pub max: f64,
}

impl Default for PriceBand {
    fn default() -> Self {
        Self {
            min: 50.0,
            max: 2000.0,
        }
    }
}

impl PriceBand {
    pub fn contains(&self, price: f64) -> bool {
        price >= self.min && price <= self.max
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct IngestStats {
    pub total_rows: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub duplicates: usize,
}

/// Read one export file end-to-end and assemble the batch of listings not
/// yet known to the duplicate index. Row-level problems are counted, never
/// fatal; only an unreadable file is an error.
pub fn ingest_file(
    path: &Path,
    index: &DuplicateIndex,
    rules: &CategoryRules,
    band: PriceBand,
) -> Result<(Vec<Listing>, IngestStats)> {
    let search_context = search_context_for_file(path);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("opening export file {}", path.display()))?;
    let headers = HeaderMap::from_headers(
        reader
            .headers()
            .with_context(|| format!("reading header row of {}", path.display()))?,
    );

    let mut stats = IngestStats::default();
    let mut batch = Vec::new();

    for record in reader.records() {
        stats.total_rows += 1;
        let record = match record {
            Ok(record) => record,
            Err(_) => {
                stats.rejected += 1;
                continue;
            }
        };
        let row = match parse_row(&record, &headers) {
            Ok(row) => row,
            Err(rejection) => {
                stats.rejected += 1;
                if stats.rejected <= REJECTION_LOG_SAMPLE {
                    debug!(?rejection, row = stats.total_rows, "rejected export row");
                }
                continue;
            }
        };
        if !band.contains(row.price) {
            stats.rejected += 1;
            continue;
        }

        let key = identity_key(&row.link, &row.title, row.price, &row.location);
        // A non-empty row must never map to an empty identity; a silent
        // corruption of the index is the one failure worth crashing for.
        assert!(!key.is_empty(), "identity key derived as empty string");

        if index.contains(&key) {
            stats.duplicates += 1;
            if stats.duplicates <= DUPLICATE_LOG_SAMPLE {
                debug!(title = %row.title, "filtered duplicate listing");
            }
            continue;
        }

        let category = rules.classify(&row.title);
        stats.accepted += 1;
        batch.push(Listing {
            title: row.title,
            price: row.price,
            location: row.location,
            link: row.link,
            search_context: search_context.clone(),
            category,
            identity_key: key,
            source: LISTING_SOURCE.to_string(),
            discovered_at: Utc::now(),
        });
    }

    Ok((batch, stats))
}

// ---------------------------------------------------------------------------
// File watcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub dir: PathBuf,
    pub poll_interval: Duration,
    pub settle_delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportFile {
    pub path: PathBuf,
    pub modified_at: SystemTime,
}

/// Polls a directory for CSV files modified at or after the watcher's own
/// start; pre-existing files belong to a prior run and are ignored. Each
/// `(path, mtime)` pair is handed off exactly once, so a file rewritten
/// later (mtime advanced) counts as a new occurrence.
#[derive(Debug)]
pub struct ExportFileWatcher {
    config: WatcherConfig,
    started_at: SystemTime,
    processed: HashSet<(PathBuf, SystemTime)>,
}

impl ExportFileWatcher {
    pub fn new(config: WatcherConfig) -> Self {
        Self::with_start_time(config, SystemTime::now())
    }

    pub fn with_start_time(config: WatcherConfig, started_at: SystemTime) -> Self {
        Self {
            config,
            started_at,
            processed: HashSet::new(),
        }
    }

    /// One directory scan: eligible files not yet handed off, newest first.
    pub fn poll_once(&mut self) -> std::io::Result<Vec<ExportFile>> {
        let mut fresh = Vec::new();
        for entry in std::fs::read_dir(&self.config.dir)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            let path = entry.path();
            let is_csv = path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("csv"))
                .unwrap_or(false);
            if !is_csv {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(metadata) if metadata.is_file() => metadata,
                _ => continue,
            };
            let modified_at = match metadata.modified() {
                Ok(modified_at) => modified_at,
                Err(_) => continue,
            };
            if modified_at < self.started_at {
                continue;
            }
            let key = (path.clone(), modified_at);
            if self.processed.contains(&key) {
                continue;
            }
            self.processed.insert(key);
            fresh.push(ExportFile { path, modified_at });
        }
        fresh.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));
        Ok(fresh)
    }

    /// Poll until something shows up, then wait out the settle delay so a
    /// file still being written is not read half-finished.
    pub async fn next_batch(&mut self) -> Vec<ExportFile> {
        loop {
            match self.poll_once() {
                Ok(files) if !files.is_empty() => {
                    tokio::time::sleep(self.config.settle_delay).await;
                    return files;
                }
                Ok(_) => tokio::time::sleep(self.config.poll_interval).await,
                Err(err) => {
                    warn!(
                        dir = %self.config.dir.display(),
                        error = %err,
                        "watch directory unavailable; backing off"
                    );
                    tokio::time::sleep(DIRECTORY_BACKOFF).await;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Uploader
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct FailedUpload {
    pub listing: Listing,
    pub error: UploadError,
}

#[derive(Debug, Default)]
pub struct UploadOutcome {
    pub succeeded: Vec<Listing>,
    pub failed: Vec<FailedUpload>,
    pub skipped_duplicates: usize,
}

enum UploadTaskResult {
    Uploaded(Listing),
    Duplicate,
    Failed(FailedUpload),
}

/// Push a batch concurrently through a bounded worker pool.
///
/// Each worker re-checks the index right before sending, and a confirmed
/// write inserts its identity before the worker finishes, so a second copy
/// of the same item later in the batch is still caught. Failed listings
/// stay out of the index; they will surface again if the file is ever
/// reprocessed. Upload order across workers is unspecified.
pub async fn upload_batch(
    store: Arc<dyn RemoteStore>,
    index: Arc<DuplicateIndex>,
    batch: Vec<Listing>,
    workers: usize,
) -> UploadOutcome {
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut tasks = JoinSet::new();

    for listing in batch {
        let store = Arc::clone(&store);
        let index = Arc::clone(&index);
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("semaphore not closed");
            if index.contains(&listing.identity_key) {
                return UploadTaskResult::Duplicate;
            }
            match store.create(&listing).await {
                Ok(()) => {
                    index.insert(listing.identity_key.clone());
                    UploadTaskResult::Uploaded(listing)
                }
                Err(error) => UploadTaskResult::Failed(FailedUpload { listing, error }),
            }
        });
    }

    let mut outcome = UploadOutcome::default();
    while let Some(joined) = tasks.join_next().await {
        match joined.expect("upload worker panicked") {
            UploadTaskResult::Uploaded(listing) => outcome.succeeded.push(listing),
            UploadTaskResult::Duplicate => outcome.skipped_duplicates += 1,
            UploadTaskResult::Failed(failure) => outcome.failed.push(failure),
        }
    }
    outcome
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize)]
pub struct FileSummary {
    pub stats: IngestStats,
    pub uploaded: usize,
    pub failed: usize,
    pub skipped_duplicates: usize,
}

/// Top-level orchestrator owning the duplicate index and the store client.
pub struct ListingMonitor {
    config: MonitorConfig,
    store: Arc<dyn RemoteStore>,
    index: Arc<DuplicateIndex>,
    rules: CategoryRules,
}

impl ListingMonitor {
    pub fn new(config: MonitorConfig) -> Result<Self> {
        let store = HttpRemoteStore::new(StoreConfig {
            database_url: config.database_url.clone(),
            collection: config.collection.clone(),
            auth_token: config.auth_token.clone(),
            timeout: Duration::from_secs(config.http_timeout_secs),
            backoff: BackoffPolicy::default(),
        })?;
        let rules = match CategoryRules::from_workspace_root(&config.workspace_root) {
            Ok(rules) => rules,
            Err(err) => {
                debug!(error = %err, "category rule file unavailable; using built-in table");
                CategoryRules::builtin()
            }
        };
        Ok(Self::with_store(config, Arc::new(store), rules))
    }

    pub fn with_store(
        config: MonitorConfig,
        store: Arc<dyn RemoteStore>,
        rules: CategoryRules,
    ) -> Self {
        Self {
            config,
            store,
            index: Arc::new(DuplicateIndex::new()),
            rules,
        }
    }

    pub fn index(&self) -> &Arc<DuplicateIndex> {
        &self.index
    }

    /// One bulk read of the remote collection to seed the index. A failure
    /// degrades to an empty index rather than crashing; duplicate uploads
    /// are possible until the store becomes reachable again.
    pub async fn bootstrap(&self) {
        match self.store.fetch_all().await {
            Ok(records) => {
                let known = self.index.bootstrap(&records);
                info!(known, fetched = records.len(), "duplicate index bootstrapped");
            }
            Err(err) => {
                warn!(
                    error = %err,
                    "bootstrap failed; running with an empty duplicate index"
                );
            }
        }
    }

    pub async fn process_file(&self, path: &Path) -> Result<FileSummary> {
        let band = PriceBand {
            min: self.config.min_price,
            max: self.config.max_price,
        };
        let (batch, stats) = ingest_file(path, &self.index, &self.rules, band)?;

        if batch.is_empty() {
            info!(
                path = %path.display(),
                total = stats.total_rows,
                duplicates = stats.duplicates,
                "no new listings in export file"
            );
            return Ok(FileSummary {
                stats,
                uploaded: 0,
                failed: 0,
                skipped_duplicates: 0,
            });
        }

        let outcome = upload_batch(
            Arc::clone(&self.store),
            Arc::clone(&self.index),
            batch,
            self.config.upload_workers,
        )
        .await;

        for failure in &outcome.failed {
            warn!(
                title = %failure.listing.title,
                error = %failure.error,
                "listing upload failed"
            );
        }

        Ok(FileSummary {
            stats,
            uploaded: outcome.succeeded.len(),
            failed: outcome.failed.len(),
            skipped_duplicates: outcome.skipped_duplicates,
        })
    }

    /// Watch loop. Stops accepting new files once `shutdown` flips; a file
    /// already being processed runs to completion first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.bootstrap().await;

        let mut watcher = ExportFileWatcher::new(WatcherConfig {
            dir: self.config.watch_dir.clone(),
            poll_interval: self.config.poll_interval,
            settle_delay: self.config.settle_delay,
        });
        info!(
            dir = %self.config.watch_dir.display(),
            "watching for new export files"
        );

        loop {
            let files = tokio::select! {
                files = watcher.next_batch() => files,
                _ = shutdown.changed() => break,
            };
            for file in files {
                match self.process_file(&file.path).await {
                    Ok(summary) => info!(
                        path = %file.path.display(),
                        total = summary.stats.total_rows,
                        accepted = summary.stats.accepted,
                        rejected = summary.stats.rejected,
                        duplicates = summary.stats.duplicates + summary.skipped_duplicates,
                        uploaded = summary.uploaded,
                        failed = summary.failed,
                        "export file processed"
                    ),
                    Err(err) => warn!(
                        path = %file.path.display(),
                        error = %err,
                        "failed to process export file"
                    ),
                }
            }
            if *shutdown.borrow() {
                break;
            }
        }

        info!("listing monitor stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use mli_store::StoredRecord;
    use tempfile::tempdir;

    #[derive(Default)]
    struct MockRemoteStore {
        records: HashMap<String, StoredRecord>,
        fail_links: HashSet<String>,
        unreachable: bool,
        created: Mutex<Vec<Listing>>,
    }

    #[async_trait::async_trait]
    impl RemoteStore for MockRemoteStore {
        async fn fetch_all(&self) -> anyhow::Result<HashMap<String, StoredRecord>> {
            if self.unreachable {
                anyhow::bail!("store unreachable");
            }
            Ok(self.records.clone())
        }

        async fn create(&self, listing: &Listing) -> std::result::Result<(), UploadError> {
            if self.fail_links.contains(&listing.link) {
                return Err(UploadError::Permanent {
                    message: "http status 400".to_string(),
                });
            }
            self.created
                .lock()
                .expect("mock store lock poisoned")
                .push(listing.clone());
            Ok(())
        }
    }

    fn test_config(root: &Path) -> MonitorConfig {
        MonitorConfig {
            watch_dir: root.to_path_buf(),
            poll_interval: Duration::from_millis(10),
            settle_delay: Duration::from_millis(10),
            min_price: 50.0,
            max_price: 2000.0,
            database_url: String::new(),
            collection: "phone_listings".to_string(),
            auth_token: String::new(),
            upload_workers: 1,
            http_timeout_secs: 5,
            workspace_root: root.to_path_buf(),
        }
    }

    fn monitor_with(root: &Path, store: Arc<MockRemoteStore>) -> ListingMonitor {
        ListingMonitor::with_store(test_config(root), store, CategoryRules::builtin())
    }

    fn link(id: u64) -> String {
        format!("https://www.facebook.com/marketplace/item/{id}/?ref=search")
    }

    fn make_listing(id: u64, title: &str, price: f64) -> Listing {
        let link = link(id);
        let identity = identity_key(&link, title, price, "Houston");
        Listing {
            title: title.to_string(),
            price,
            location: "Houston".to_string(),
            link,
            search_context: "Houston".to_string(),
            category: UNCATEGORIZED.to_string(),
            identity_key: identity,
            source: LISTING_SOURCE.to_string(),
            discovered_at: Utc::now(),
        }
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        for header in ["Title,Price,Location,Link", "title,price,location,link"] {
            let body = format!("{header}\niPhone 15,$600,Austin,{}\n", link(10));
            let mut reader = csv::Reader::from_reader(body.as_bytes());
            let headers = HeaderMap::from_headers(&reader.headers().unwrap().clone());
            let record = reader.records().next().unwrap().unwrap();
            let row = parse_row(&record, &headers).unwrap();
            assert_eq!(row.title, "iPhone 15");
            assert_eq!(row.price, 600.0);
            assert_eq!(row.location, "Austin");
        }
    }

    #[test]
    fn rows_missing_required_fields_are_rejected() {
        let body = format!(
            "Title,Price,Location,Link\n,{p},Austin,{l}\niPhone,{p},Austin,\niPhone,free,Austin,{l}\n",
            p = "$600",
            l = link(11)
        );
        let mut reader = csv::Reader::from_reader(body.as_bytes());
        let headers = HeaderMap::from_headers(&reader.headers().unwrap().clone());
        let rejections: Vec<_> = reader
            .records()
            .map(|r| parse_row(&r.unwrap(), &headers).unwrap_err())
            .collect();
        assert_eq!(
            rejections,
            vec![
                RowRejection::MissingTitle,
                RowRejection::MissingLink,
                RowRejection::BadPrice
            ]
        );
    }

    #[test]
    fn search_context_is_derived_from_file_name() {
        assert_eq!(
            search_context_for_file(Path::new("/tmp/houston_iphone_15.csv")),
            "Houston"
        );
        assert_eq!(
            search_context_for_file(Path::new("austin-2.csv")),
            "Austin"
        );
        assert_eq!(
            search_context_for_file(Path::new("361_results.csv")),
            "Corpus Christi"
        );
        assert_eq!(
            search_context_for_file(Path::new("marketplace-export.csv")),
            "unknown"
        );
    }

    #[test]
    fn classification_prefers_the_most_specific_rule() {
        let rules = CategoryRules::builtin();
        assert_eq!(rules.classify("iPhone 16 Pro Max 256GB"), "iPhone 16 Pro Max");
        assert_eq!(rules.classify("IPHONE 16 pro, great shape"), "iPhone 16 Pro");
        assert_eq!(rules.classify("Macbook Air M2 2022"), "MacBook Air M2");
        assert_eq!(rules.classify("iPad Pro 12.9 inch"), "iPad Pro 12.9\"");
        assert_eq!(rules.classify("Leather couch"), UNCATEGORIZED);
    }

    #[test]
    fn rule_table_loads_from_yaml() {
        let dir = tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("rules")).unwrap();
        std::fs::write(
            dir.path().join("rules").join("categories.yaml"),
            "version: 1\nrules:\n  - label: Pixel 9 Pro\n    contains_all: [pixel, \"9\", pro]\n  - label: Pixel\n    contains_all: [pixel]\n",
        )
        .unwrap();
        let rules = CategoryRules::from_workspace_root(dir.path()).unwrap();
        assert_eq!(rules.classify("Google Pixel 9 Pro"), "Pixel 9 Pro");
        assert_eq!(rules.classify("pixel 7a"), "Pixel");
        assert_eq!(rules.classify("iPhone 14"), UNCATEGORIZED);
    }

    #[tokio::test]
    async fn second_ingest_of_unchanged_file_yields_only_duplicates() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("houston_run.csv");
        std::fs::write(
            &path,
            format!(
                "Title,Price,Location,Link\niPhone 15,$600,Austin,{}\niPad Air,$300,Austin,{}\n",
                link(1),
                link(2)
            ),
        )
        .unwrap();

        let store = Arc::new(MockRemoteStore::default());
        let monitor = monitor_with(dir.path(), Arc::clone(&store));

        let first = monitor.process_file(&path).await.unwrap();
        assert_eq!(first.stats.accepted, 2);
        assert_eq!(first.uploaded, 2);

        let second = monitor.process_file(&path).await.unwrap();
        assert_eq!(second.stats.accepted, 0);
        assert_eq!(second.stats.duplicates, 2);
        assert_eq!(second.uploaded, 0);
        assert_eq!(store.created.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn partial_batch_failure_keeps_failed_identity_out_of_index() {
        let batch: Vec<_> = (1..=5)
            .map(|id| make_listing(id, &format!("iPhone {id}"), 500.0))
            .collect();
        let failing = batch[2].clone();

        let mut store = MockRemoteStore::default();
        store.fail_links.insert(failing.link.clone());
        let store = Arc::new(store);
        let index = Arc::new(DuplicateIndex::new());

        let outcome = upload_batch(
            Arc::clone(&store) as Arc<dyn RemoteStore>,
            Arc::clone(&index),
            batch,
            4,
        )
        .await;

        assert_eq!(outcome.succeeded.len(), 4);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.skipped_duplicates, 0);
        assert_eq!(index.len(), 4);
        assert!(!index.contains(&failing.identity_key));
        assert!(!outcome.failed[0].error.is_transient());
    }

    #[tokio::test]
    async fn repeated_link_within_one_file_uploads_once() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("dallas_scan.csv");
        std::fs::write(
            &path,
            format!(
                "Title,Price,Location,Link\niPhone 14 blue,$450,Dallas,{l}\niPhone 14 BLUE!!,$450,Dallas,{l}\n",
                l = link(77)
            ),
        )
        .unwrap();

        let store = Arc::new(MockRemoteStore::default());
        let monitor = monitor_with(dir.path(), Arc::clone(&store));

        let summary = monitor.process_file(&path).await.unwrap();
        // Both rows pass the batch-assembly check; the uploader's index
        // update catches the second copy before it is sent.
        assert_eq!(summary.stats.accepted, 2);
        assert_eq!(summary.uploaded, 1);
        assert_eq!(summary.skipped_duplicates, 1);
        assert_eq!(store.created.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn distinct_identities_with_identical_fields_both_upload() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("austin.csv");
        std::fs::write(
            &path,
            format!(
                "Title,Price,Location,Link\niPhone 13,$350,Austin,{}\niPhone 13,$350,Austin,{}\n",
                link(100),
                link(101)
            ),
        )
        .unwrap();

        let store = Arc::new(MockRemoteStore::default());
        let monitor = monitor_with(dir.path(), Arc::clone(&store));
        let summary = monitor.process_file(&path).await.unwrap();
        assert_eq!(summary.uploaded, 2);
        assert_eq!(summary.skipped_duplicates, 0);
    }

    #[tokio::test]
    async fn out_of_band_prices_are_filtered_in_the_pipeline() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("houston.csv");
        std::fs::write(
            &path,
            format!(
                "Title,Price,Location,Link\nCase,$10,Houston,{}\niPhone 15,$600,Houston,{}\nGold iPhone,$9999,Houston,{}\n",
                link(201),
                link(202),
                link(203)
            ),
        )
        .unwrap();

        let store = Arc::new(MockRemoteStore::default());
        let monitor = monitor_with(dir.path(), Arc::clone(&store));
        let summary = monitor.process_file(&path).await.unwrap();
        assert_eq!(summary.stats.total_rows, 3);
        assert_eq!(summary.stats.rejected, 2);
        assert_eq!(summary.uploaded, 1);
    }

    #[tokio::test]
    async fn bootstrap_failure_degrades_to_empty_index() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(MockRemoteStore {
            unreachable: true,
            ..Default::default()
        });
        let monitor = monitor_with(dir.path(), Arc::clone(&store));
        monitor.bootstrap().await;
        assert!(monitor.index().is_empty());
    }

    #[tokio::test]
    async fn bootstrap_seeds_index_from_remote_records() {
        let dir = tempdir().expect("tempdir");
        let mut store = MockRemoteStore::default();
        store.records.insert(
            "-rec1".to_string(),
            StoredRecord {
                title: "iPhone 15".to_string(),
                price: 600.0,
                location: "Austin".to_string(),
                link: link(1),
            },
        );
        let store = Arc::new(store);
        let monitor = monitor_with(dir.path(), Arc::clone(&store));
        monitor.bootstrap().await;

        let path = dir.path().join("austin.csv");
        std::fs::write(
            &path,
            format!("Title,Price,Location,Link\niPhone 15,$600,Austin,{}\n", link(1)),
        )
        .unwrap();
        let summary = monitor.process_file(&path).await.unwrap();
        assert_eq!(summary.stats.duplicates, 1);
        assert_eq!(summary.uploaded, 0);
    }

    #[test]
    fn pre_existing_files_are_never_handed_off() {
        let dir = tempdir().expect("tempdir");
        let old = dir.path().join("old.csv");
        std::fs::write(&old, "Title,Price,Location,Link\n").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let mut watcher = ExportFileWatcher::new(WatcherConfig {
            dir: dir.path().to_path_buf(),
            poll_interval: Duration::from_millis(10),
            settle_delay: Duration::from_millis(10),
        });
        assert!(watcher.poll_once().unwrap().is_empty());

        let fresh = dir.path().join("fresh.csv");
        std::fs::write(&fresh, "Title,Price,Location,Link\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not an export").unwrap();

        let batch = watcher.poll_once().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].path, fresh);

        // Same (path, mtime) occurrence is never dispatched twice.
        assert!(watcher.poll_once().unwrap().is_empty());
    }

    #[test]
    fn rewritten_file_is_a_new_occurrence() {
        let dir = tempdir().expect("tempdir");
        let mut watcher = ExportFileWatcher::new(WatcherConfig {
            dir: dir.path().to_path_buf(),
            poll_interval: Duration::from_millis(10),
            settle_delay: Duration::from_millis(10),
        });

        let path = dir.path().join("export.csv");
        std::fs::write(&path, "Title,Price,Location,Link\n").unwrap();
        assert_eq!(watcher.poll_once().unwrap().len(), 1);

        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(&path, "Title,Price,Location,Link\nmore\n").unwrap();
        let again = watcher.poll_once().unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].path, path);
    }

    #[test]
    fn newest_file_is_handed_off_first() {
        let dir = tempdir().expect("tempdir");
        let mut watcher = ExportFileWatcher::new(WatcherConfig {
            dir: dir.path().to_path_buf(),
            poll_interval: Duration::from_millis(10),
            settle_delay: Duration::from_millis(10),
        });

        let first = dir.path().join("first.csv");
        std::fs::write(&first, "a\n").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let second = dir.path().join("second.csv");
        std::fs::write(&second, "b\n").unwrap();

        let batch = watcher.poll_once().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].path, second);
        assert_eq!(batch[1].path, first);
    }

    #[test]
    fn missing_watch_directory_is_an_error_not_a_panic() {
        let dir = tempdir().expect("tempdir");
        let mut watcher = ExportFileWatcher::new(WatcherConfig {
            dir: dir.path().join("does-not-exist"),
            poll_interval: Duration::from_millis(10),
            settle_delay: Duration::from_millis(10),
        });
        assert!(watcher.poll_once().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn settle_delay_elapses_before_handoff() {
        let dir = tempdir().expect("tempdir");
        let settle = Duration::from_secs(2);
        let mut watcher = ExportFileWatcher::with_start_time(
            WatcherConfig {
                dir: dir.path().to_path_buf(),
                poll_interval: Duration::from_secs(5),
                settle_delay: settle,
            },
            SystemTime::UNIX_EPOCH,
        );
        std::fs::write(dir.path().join("export.csv"), "Title\n").unwrap();

        let before = tokio::time::Instant::now();
        let batch = watcher.next_batch().await;
        assert_eq!(batch.len(), 1);
        assert!(before.elapsed() >= settle);
    }
}

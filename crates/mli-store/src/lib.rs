//! Remote listing store client and in-memory duplicate index for MLI.
//!
//! The remote store is a document-style key/value database reached over
//! HTTP: one bulk read returns the whole collection as a map of opaque
//! record ids to listing payloads, and one append-style POST creates a
//! record. There are no update or delete operations and no server-side
//! uniqueness constraint; duplicate prevention lives entirely in the
//! client-side [`DuplicateIndex`].

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use mli_core::{identity_key, Listing};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "mli-store";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_request_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Why an individual create request ultimately failed.
///
/// Transient failures already went through the bounded retry loop; a
/// permanent failure was never retried.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("transient failure after {attempts} attempts: {message}")]
    Transient { attempts: usize, message: String },
    #[error("permanent failure: {message}")]
    Permanent { message: String },
}

impl UploadError {
    pub fn is_transient(&self) -> bool {
        matches!(self, UploadError::Transient { .. })
    }
}

/// Listing payload as stored remotely. Older records may predate link
/// capture, so every field is optional on the wire.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoredRecord {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub link: String,
}

impl StoredRecord {
    /// Recompute the identity key the same way the ingest pipeline would.
    pub fn identity_key(&self) -> String {
        identity_key(&self.link, &self.title, self.price, &self.location)
    }
}

/// Boundary to the remote persistent store. Object-safe so tests can swap
/// in an in-memory implementation.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Bulk read of the full current collection, keyed by opaque record id.
    async fn fetch_all(&self) -> anyhow::Result<HashMap<String, StoredRecord>>;

    /// Append one listing. The store assigns the record id.
    async fn create(&self, listing: &Listing) -> Result<(), UploadError>;
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub collection: String,
    pub auth_token: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            collection: "phone_listings".to_string(),
            auth_token: String::new(),
            timeout: Duration::from_secs(15),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpRemoteStore {
    client: reqwest::Client,
    collection_url: String,
    backoff: BackoffPolicy,
}

impl HttpRemoteStore {
    pub fn new(config: StoreConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;

        let base = config.database_url.trim_end_matches('/');
        let collection_url = format!(
            "{base}/{collection}.json?auth={token}",
            collection = config.collection,
            token = config.auth_token
        );

        Ok(Self {
            client,
            collection_url,
            backoff: config.backoff,
        })
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn fetch_all(&self) -> anyhow::Result<HashMap<String, StoredRecord>> {
        let mut last_error: Option<anyhow::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(&self.collection_url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        // An empty collection comes back as a bare `null`.
                        let body: Option<HashMap<String, StoredRecord>> = resp
                            .json()
                            .await
                            .context("decoding bulk listing response")?;
                        return Ok(body.unwrap_or_default());
                    }
                    // An invalid credential looks like any other refusal here;
                    // the caller degrades the same way for both.
                    let err = anyhow::anyhow!("bulk read returned http status {status}");
                    if classify_status(status) == RetryDisposition::NonRetryable {
                        return Err(err);
                    }
                    last_error = Some(err);
                }
                Err(err) => {
                    if classify_request_error(&err) == RetryDisposition::NonRetryable {
                        return Err(err).context("bulk read request failed");
                    }
                    last_error = Some(anyhow::Error::new(err).context("bulk read request failed"));
                }
            }
            if attempt < self.backoff.max_retries {
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            }
        }

        Err(last_error.expect("retry loop always records an error before exhausting"))
    }

    async fn create(&self, listing: &Listing) -> Result<(), UploadError> {
        let mut attempts = 0;
        let mut last_message = String::new();

        for attempt in 0..=self.backoff.max_retries {
            attempts += 1;
            match self.client.post(&self.collection_url).json(listing).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(());
                    }
                    if classify_status(status) == RetryDisposition::NonRetryable {
                        return Err(UploadError::Permanent {
                            message: format!("create returned http status {status}"),
                        });
                    }
                    last_message = format!("create returned http status {status}");
                }
                Err(err) => {
                    if classify_request_error(&err) == RetryDisposition::NonRetryable {
                        return Err(UploadError::Permanent {
                            message: err.to_string(),
                        });
                    }
                    last_message = err.to_string();
                }
            }
            if attempt < self.backoff.max_retries {
                debug!(attempt, "retrying listing create after transient failure");
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            }
        }

        Err(UploadError::Transient {
            attempts,
            message: last_message,
        })
    }
}

/// Process-wide set of identity keys mirroring the remote store's contents.
///
/// Bootstrapped once at startup, mutated after each confirmed write, never
/// persisted locally; a restart rebuilds it from the remote store. Safe for
/// concurrent use from upload workers, but `contains` followed by `insert`
/// is not one atomic step: two workers interleaving between the two calls
/// can still both decide "new". Closing that fully would need a uniqueness
/// constraint on the store side, which it does not have.
#[derive(Debug, Default)]
pub struct DuplicateIndex {
    keys: Mutex<HashSet<String>>,
}

impl DuplicateIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains(key)
    }

    /// Returns false when the key was already present.
    pub fn insert(&self, key: impl Into<String>) -> bool {
        self.lock().insert(key.into())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Populate from a bulk read of the remote collection. Returns the number
    /// of distinct identities now known.
    pub fn bootstrap(&self, records: &HashMap<String, StoredRecord>) -> usize {
        let mut keys = self.lock();
        for record in records.values() {
            if record.link.is_empty() && record.title.is_empty() {
                warn!("skipping stored record with neither link nor title during bootstrap");
                continue;
            }
            keys.insert(record.identity_key());
        }
        keys.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.keys.lock().expect("duplicate index lock poisoned")
    }
}

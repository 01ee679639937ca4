//! Durable credits cache, dead-letter set and HTTP fetch utilities for Sagebrush.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use sagebrush_core::CacheRecord;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "sagebrush-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("encoding cache record for remote id {remote_id}: {source}")]
    Encode {
        remote_id: i64,
        source: serde_json::Error,
    },
    #[error("cache already holds a record for remote id {0}")]
    DuplicateCacheRecord(i64),
}

impl StorageError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Result of reading a line-oriented log: the parsed entries and how many lines were skipped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Loaded<T> {
    pub entries: T,
    pub malformed_lines: usize,
}

/// Parses JSONL cache text. Blank lines are ignored, undecodable lines are counted and
/// skipped, and the first record for a remote id wins.
pub fn parse_cache_lines(text: &str) -> Loaded<HashMap<i64, CacheRecord>> {
    let mut loaded = Loaded::<HashMap<i64, CacheRecord>>::default();
    for (index, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CacheRecord>(line) {
            Ok(record) => {
                loaded.entries.entry(record.remote_id).or_insert(record);
            }
            Err(err) => {
                warn!(line = index + 1, error = %err, "skipping malformed cache line");
                loaded.malformed_lines += 1;
            }
        }
    }
    loaded
}

/// Parses dead-letter text: one integer id per line, blanks ignored.
pub fn parse_dead_letter_lines(text: &str) -> Loaded<HashSet<i64>> {
    let mut loaded = Loaded::<HashSet<i64>>::default();
    for (index, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match trimmed.parse::<i64>() {
            Ok(id) => {
                loaded.entries.insert(id);
            }
            Err(_) => {
                warn!(line = index + 1, content = trimmed, "skipping malformed dead-letter line");
                loaded.malformed_lines += 1;
            }
        }
    }
    loaded
}

/// Reads a log file, tolerating a missing file and invalid UTF-8. A torn final line left
/// by an interrupted append is terminated so the next append starts on a fresh line.
async fn read_log_text(path: &Path) -> Result<String, StorageError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(err) => return Err(StorageError::io(path, err)),
    };

    if bytes.last().is_some_and(|b| *b != b'\n') {
        debug!(path = %path.display(), "terminating torn final line");
        append_line(path, "").await?;
    }

    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Appends one line and syncs it to disk before returning.
async fn append_line(path: &Path, line: &str) -> Result<(), StorageError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|err| StorageError::io(parent, err))?;
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|err| StorageError::io(path, err))?;

    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    file.write_all(&buf)
        .await
        .map_err(|err| StorageError::io(path, err))?;
    file.flush().await.map_err(|err| StorageError::io(path, err))?;
    file.sync_data()
        .await
        .map_err(|err| StorageError::io(path, err))?;
    Ok(())
}

/// Append-only backing log of cache records.
#[async_trait]
pub trait CacheLog: Send + Sync {
    async fn load(&self) -> Result<Loaded<HashMap<i64, CacheRecord>>, StorageError>;
    async fn append(&self, record: &CacheRecord) -> Result<(), StorageError>;
    fn describe(&self) -> String;
}

/// Append-only backing log of dead-lettered remote ids.
#[async_trait]
pub trait DeadLetterLog: Send + Sync {
    async fn load(&self) -> Result<Loaded<HashSet<i64>>, StorageError>;
    async fn append(&self, remote_id: i64) -> Result<(), StorageError>;
    fn describe(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct JsonlCacheLog {
    path: PathBuf,
}

impl JsonlCacheLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CacheLog for JsonlCacheLog {
    async fn load(&self) -> Result<Loaded<HashMap<i64, CacheRecord>>, StorageError> {
        let text = read_log_text(&self.path).await?;
        Ok(parse_cache_lines(&text))
    }

    async fn append(&self, record: &CacheRecord) -> Result<(), StorageError> {
        let line = serde_json::to_string(record).map_err(|source| StorageError::Encode {
            remote_id: record.remote_id,
            source,
        })?;
        append_line(&self.path, &line).await
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[derive(Debug, Clone)]
pub struct FileDeadLetterLog {
    path: PathBuf,
}

impl FileDeadLetterLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Dead-letter file living next to a cache file: same stem, `.dead` extension.
    pub fn beside(cache_path: &Path) -> Self {
        Self::new(cache_path.with_extension("dead"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DeadLetterLog for FileDeadLetterLog {
    async fn load(&self) -> Result<Loaded<HashSet<i64>>, StorageError> {
        let text = read_log_text(&self.path).await?;
        Ok(parse_dead_letter_lines(&text))
    }

    async fn append(&self, remote_id: i64) -> Result<(), StorageError> {
        append_line(&self.path, &remote_id.to_string()).await
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-process cache log. Clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct MemoryCacheLog {
    records: Arc<Mutex<Vec<CacheRecord>>>,
}

impl MemoryCacheLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<CacheRecord>) -> Self {
        Self {
            records: Arc::new(Mutex::new(records)),
        }
    }

    /// Every record ever appended, in append order.
    pub async fn records(&self) -> Vec<CacheRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl CacheLog for MemoryCacheLog {
    async fn load(&self) -> Result<Loaded<HashMap<i64, CacheRecord>>, StorageError> {
        let mut entries = HashMap::new();
        for record in self.records.lock().await.iter() {
            entries
                .entry(record.remote_id)
                .or_insert_with(|| record.clone());
        }
        Ok(Loaded {
            entries,
            malformed_lines: 0,
        })
    }

    async fn append(&self, record: &CacheRecord) -> Result<(), StorageError> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// In-process dead-letter log. Clones share the same ids.
#[derive(Debug, Clone, Default)]
pub struct MemoryDeadLetterLog {
    ids: Arc<Mutex<Vec<i64>>>,
}

impl MemoryDeadLetterLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ids(ids: Vec<i64>) -> Self {
        Self {
            ids: Arc::new(Mutex::new(ids)),
        }
    }

    pub async fn ids(&self) -> Vec<i64> {
        self.ids.lock().await.clone()
    }
}

#[async_trait]
impl DeadLetterLog for MemoryDeadLetterLog {
    async fn load(&self) -> Result<Loaded<HashSet<i64>>, StorageError> {
        Ok(Loaded {
            entries: self.ids.lock().await.iter().copied().collect(),
            malformed_lines: 0,
        })
    }

    async fn append(&self, remote_id: i64) -> Result<(), StorageError> {
        self.ids.lock().await.push(remote_id);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Previously fetched credits, keyed by remote id, backed by an append-only log.
pub struct CacheStore {
    records: HashMap<i64, CacheRecord>,
    log: Box<dyn CacheLog>,
    malformed_on_load: usize,
}

impl CacheStore {
    pub async fn open(log: Box<dyn CacheLog>) -> Result<Self, StorageError> {
        let loaded = log.load().await?;
        debug!(
            location = %log.describe(),
            records = loaded.entries.len(),
            malformed = loaded.malformed_lines,
            "credits cache loaded"
        );
        Ok(Self {
            records: loaded.entries,
            log,
            malformed_on_load: loaded.malformed_lines,
        })
    }

    pub fn get(&self, remote_id: i64) -> Option<&CacheRecord> {
        self.records.get(&remote_id)
    }

    pub fn contains(&self, remote_id: i64) -> bool {
        self.records.contains_key(&remote_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn malformed_on_load(&self) -> usize {
        self.malformed_on_load
    }

    pub fn location(&self) -> String {
        self.log.describe()
    }

    /// Persists the record, then makes it visible to `get`. A second record for the
    /// same remote id is refused.
    pub async fn append(&mut self, record: CacheRecord) -> Result<(), StorageError> {
        if self.records.contains_key(&record.remote_id) {
            return Err(StorageError::DuplicateCacheRecord(record.remote_id));
        }
        self.log.append(&record).await?;
        self.records.insert(record.remote_id, record);
        Ok(())
    }
}

/// Remote ids confirmed missing upstream. Membership checks never touch the log.
pub struct DeadLetterSet {
    ids: HashSet<i64>,
    log: Box<dyn DeadLetterLog>,
    malformed_on_load: usize,
}

impl DeadLetterSet {
    pub async fn open(log: Box<dyn DeadLetterLog>) -> Result<Self, StorageError> {
        let loaded = log.load().await?;
        debug!(
            location = %log.describe(),
            ids = loaded.entries.len(),
            malformed = loaded.malformed_lines,
            "dead-letter set loaded"
        );
        Ok(Self {
            ids: loaded.entries,
            log,
            malformed_on_load: loaded.malformed_lines,
        })
    }

    pub fn contains(&self, remote_id: i64) -> bool {
        self.ids.contains(&remote_id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn malformed_on_load(&self) -> usize {
        self.malformed_on_load
    }

    pub fn location(&self) -> String {
        self.log.describe()
    }

    /// Returns `false` without writing when the id is already present.
    pub async fn insert(&mut self, remote_id: i64) -> Result<bool, StorageError> {
        if self.ids.contains(&remote_id) {
            return Ok(false);
        }
        self.log.append(remote_id).await?;
        self.ids.insert(remote_id);
        Ok(true)
    }
}

/// Throttling and server errors clear up on their own; other statuses will not.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

pub fn is_retryable_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Retry budget for a single fetch. The delay doubles with each retry up to `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
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
    /// Requests sent before giving up, the first one included.
    pub fn attempts(&self) -> usize {
        self.max_retries + 1
    }

    /// Pause before retry number `retry` (zero-based).
    pub fn delay_before_retry(&self, retry: usize) -> Duration {
        let doublings = u32::try_from(retry).unwrap_or(u32::MAX).min(20);
        self.base_delay
            .saturating_mul(1 << doublings)
            .min(self.max_delay)
    }
}

/// Request budget: up to `burst` requests back to back, then one per `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub burst: u32,
    pub interval: Duration,
}

impl RateLimit {
    /// TMDB publishes its limit as requests per second; zero disables limiting.
    pub fn per_second(requests: u32) -> Option<Self> {
        (requests > 0).then(|| Self {
            burst: requests,
            interval: (Duration::from_secs(1) / requests).max(Duration::from_millis(1)),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Allowance {
    tokens: u32,
    credited_at: Instant,
}

impl Allowance {
    /// Credits every whole interval since `credited_at`. The unused fraction of the
    /// current interval carries over; a full bucket does not bank time.
    fn credit(&mut self, limit: &RateLimit, now: Instant) {
        if self.tokens >= limit.burst {
            self.credited_at = now;
            return;
        }
        let elapsed = now.saturating_duration_since(self.credited_at);
        let earned = elapsed.as_nanos() / limit.interval.as_nanos().max(1);
        if earned == 0 {
            return;
        }
        let earned = u32::try_from(earned).unwrap_or(u32::MAX);
        self.tokens = self.tokens.saturating_add(earned).min(limit.burst);
        if self.tokens == limit.burst {
            self.credited_at = now;
        } else {
            self.credited_at += limit.interval * earned;
        }
    }

    fn wait(&self, limit: &RateLimit, now: Instant) -> Duration {
        (self.credited_at + limit.interval).saturating_duration_since(now)
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    limit: RateLimit,
    allowance: Mutex<Allowance>,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            allowance: Mutex::new(Allowance {
                tokens: limit.burst,
                credited_at: Instant::now(),
            }),
        }
    }

    /// Waits until a request may be sent.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut allowance = self.allowance.lock().await;
                let now = Instant::now();
                allowance.credit(&self.limit, now);
                if allowance.tokens > 0 {
                    allowance.tokens -= 1;
                    return;
                }
                allowance.wait(&self.limit, now)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            rate_limit: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
}

impl HttpError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Request(err) => err.status().map(|s| s.as_u16()),
            Self::HttpStatus { status, .. } => Some(*status),
        }
    }
}

/// Rate-limited GET client. Throttling, server errors and transport failures are
/// retried per [`BackoffPolicy`]; the last failure is returned once retries run out.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limiter: Option<RateLimiter>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build().context("building reqwest client")?,
            limiter: config.rate_limit.map(RateLimiter::new),
            backoff: config.backoff,
        })
    }

    /// GETs `url` with `query` appended. `url` is what appears in logs and errors, so
    /// credentials belong in `query`.
    pub async fn get(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<FetchedResponse, HttpError> {
        let span = info_span!("http_fetch", url);
        self.get_with_retries(url, query).instrument(span).await
    }

    async fn get_with_retries(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<FetchedResponse, HttpError> {
        let mut retry = 0;
        loop {
            if let Some(limiter) = &self.limiter {
                limiter.acquire().await;
            }
            let can_retry = retry < self.backoff.max_retries;

            match self.client.get(url).query(query).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let body = resp
                        .bytes()
                        .await
                        .map_err(|err| HttpError::Request(err.without_url()))?;
                    return Ok(FetchedResponse {
                        status,
                        body: body.to_vec(),
                    });
                }
                Ok(resp) if can_retry && is_retryable_status(resp.status()) => {
                    debug!(retry, status = resp.status().as_u16(), "retrying after http status");
                }
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(HttpError::HttpStatus {
                        status,
                        url: url.to_string(),
                        body,
                    });
                }
                Err(err) => {
                    let err = err.without_url();
                    if !(can_retry && is_retryable_transport(&err)) {
                        return Err(HttpError::Request(err));
                    }
                    debug!(retry, error = %err, "retrying after transport error");
                }
            }

            tokio::time::sleep(self.backoff.delay_before_retry(retry)).await;
            retry += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use sagebrush_core::{RawMetadata, RolePredicate};
    use serde_json::json;
    use tempfile::tempdir;

    fn record(remote_id: i64, director: &str) -> CacheRecord {
        let raw = RawMetadata::new(json!({
            "id": remote_id,
            "crew": [{ "job": "Director", "name": director }],
        }));
        let fields = RolePredicate::default().derive(&raw);
        let fetched_at = Utc
            .with_ymd_and_hms(2026, 2, 24, 12, 0, 0)
            .single()
            .expect("ts");
        CacheRecord::new(remote_id, raw, fields, fetched_at)
    }

    #[tokio::test]
    async fn jsonl_cache_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("credits.jsonl");

        let mut store = CacheStore::open(Box::new(JsonlCacheLog::new(&path)))
            .await
            .expect("open empty");
        assert!(store.is_empty());
        store.append(record(429, "Sergio Leone")).await.expect("append");
        store.append(record(33, "Clint Eastwood")).await.expect("append");

        let reopened = CacheStore::open(Box::new(JsonlCacheLog::new(&path)))
            .await
            .expect("reopen");
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.get(33), Some(&record(33, "Clint Eastwood")));
    }

    #[test]
    fn malformed_cache_lines_are_skipped() {
        let good = serde_json::to_string(&record(1, "John Ford")).expect("encode");
        let text = format!("{good}\n{{not json\n\n{{\"remote_id\": \"x\"}}\n");
        let loaded = parse_cache_lines(&text);
        assert_eq!(loaded.entries.len(), 1);
        assert_eq!(loaded.malformed_lines, 2);
        assert!(loaded.entries.contains_key(&1));
    }

    #[test]
    fn first_cache_record_for_an_id_wins() {
        let first = serde_json::to_string(&record(5, "Howard Hawks")).expect("encode");
        let second = serde_json::to_string(&record(5, "Someone Else")).expect("encode");
        let loaded = parse_cache_lines(&format!("{first}\n{second}\n"));
        assert_eq!(loaded.entries[&5], record(5, "Howard Hawks"));
    }

    #[tokio::test]
    async fn torn_tail_does_not_swallow_next_append() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("credits.jsonl");
        let good = serde_json::to_string(&record(1, "John Ford")).expect("encode");
        std::fs::write(&path, format!("{good}\n{{\"remote_id\": 2, \"raw")).expect("seed");

        let mut store = CacheStore::open(Box::new(JsonlCacheLog::new(&path)))
            .await
            .expect("open");
        assert_eq!(store.len(), 1);
        assert_eq!(store.malformed_on_load(), 1);
        store.append(record(3, "Anthony Mann")).await.expect("append");

        let reopened = CacheStore::open(Box::new(JsonlCacheLog::new(&path)))
            .await
            .expect("reopen");
        assert!(reopened.contains(1));
        assert!(reopened.contains(3));
        assert_eq!(reopened.malformed_on_load(), 1);
    }

    #[tokio::test]
    async fn cache_store_refuses_second_record_for_id() {
        let log = MemoryCacheLog::new();
        let mut store = CacheStore::open(Box::new(log.clone())).await.expect("open");
        store.append(record(7, "Budd Boetticher")).await.expect("first");
        let err = store
            .append(record(7, "Budd Boetticher"))
            .await
            .expect_err("duplicate");
        assert!(matches!(err, StorageError::DuplicateCacheRecord(7)));
        assert_eq!(log.records().await.len(), 1);
    }

    #[test]
    fn dead_letter_lines_ignore_blanks_and_junk() {
        let loaded = parse_dead_letter_lines("12\n\n  34  \nabc\n12\n");
        assert_eq!(loaded.entries, HashSet::from([12, 34]));
        assert_eq!(loaded.malformed_lines, 1);
    }

    #[tokio::test]
    async fn dead_letter_file_round_trips_and_dedups() {
        let dir = tempdir().expect("tempdir");
        let cache_path = dir.path().join("credits_dump.jsonl");
        let log = FileDeadLetterLog::beside(&cache_path);
        assert_eq!(log.path(), dir.path().join("credits_dump.dead"));

        let mut set = DeadLetterSet::open(Box::new(log.clone())).await.expect("open");
        assert!(set.insert(99).await.expect("insert"));
        assert!(!set.insert(99).await.expect("second insert"));

        let text = std::fs::read_to_string(log.path()).expect("read");
        assert_eq!(text, "99\n");

        let reopened = DeadLetterSet::open(Box::new(log)).await.expect("reopen");
        assert!(reopened.contains(99));
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn retry_delays_double_until_capped() {
        let policy = BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_millis(800),
        };

        assert_eq!(policy.attempts(), 3);
        assert_eq!(policy.delay_before_retry(0), Duration::from_millis(250));
        assert_eq!(policy.delay_before_retry(1), Duration::from_millis(500));
        assert_eq!(policy.delay_before_retry(2), Duration::from_millis(800));
        assert_eq!(policy.delay_before_retry(usize::MAX), Duration::from_millis(800));
    }

    #[test]
    fn tmdb_throttling_and_outages_are_retried() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn rate_limit_follows_requests_per_second() {
        assert!(RateLimit::per_second(0).is_none());
        assert_eq!(
            RateLimit::per_second(40),
            Some(RateLimit {
                burst: 40,
                interval: Duration::from_millis(25),
            })
        );
    }

    #[test]
    fn allowance_carries_partial_intervals_forward() {
        let limit = RateLimit::per_second(40).expect("limit");
        let start = Instant::now();
        let mut allowance = Allowance {
            tokens: 0,
            credited_at: start,
        };

        allowance.credit(&limit, start + Duration::from_millis(10));
        assert_eq!(allowance.tokens, 0);
        assert_eq!(
            allowance.wait(&limit, start + Duration::from_millis(10)),
            Duration::from_millis(15)
        );

        let now = start + Duration::from_millis(60);
        allowance.credit(&limit, now);
        assert_eq!(allowance.tokens, 2);
        allowance.tokens = 0;
        assert_eq!(allowance.wait(&limit, now), Duration::from_millis(15));
    }

    #[test]
    fn full_allowance_does_not_bank_idle_time() {
        let limit = RateLimit {
            burst: 2,
            interval: Duration::from_millis(25),
        };
        let start = Instant::now();
        let mut allowance = Allowance {
            tokens: 2,
            credited_at: start,
        };

        let later = start + Duration::from_secs(10);
        allowance.credit(&limit, later);
        assert_eq!(allowance.tokens, 2);
        assert_eq!(allowance.credited_at, later);
    }

    #[tokio::test]
    async fn limiter_holds_requests_past_the_burst() {
        let limiter = RateLimiter::new(RateLimit {
            burst: 2,
            interval: Duration::from_millis(30),
        });
        let started = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(started.elapsed() >= Duration::from_millis(25));
    }
}

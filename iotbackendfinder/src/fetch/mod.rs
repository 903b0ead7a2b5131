//! Paginated, throttled retrieval of raw records from a remote query API.
//!
//! A [`PageSource`] turns one page request into one page of raw records. The
//! [`RateLimitedFetcher`] owns everything else: the pagination cursor, the
//! token bucket, retry with backoff, and classification of failures into
//! [`FetchError`].

pub mod dnsdb;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RateLimitConfig;
use crate::rate_limit::{RetryHelper, SharedRateLimiter};
use crate::record::{ExtractionWarning, RawRecord};

pub use dnsdb::DnsdbSource;

/// Remote lookup mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    /// Exact or wildcard rrset lookup
    Basic,
    /// Regular expression pushed down to the remote flexible search
    Flexible,
}

impl QueryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryMode::Basic => "basic",
            QueryMode::Flexible => "flexible",
        }
    }
}

fn default_rrtype() -> String {
    "ANY".to_string()
}

/// A single remote query
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Query {
    pub mode: QueryMode,
    /// Domain (with optional wildcard) for basic lookups, regex for flexible ones
    pub term: String,
    #[serde(default = "default_rrtype")]
    pub rrtype: String,
}

impl Query {
    pub fn basic(term: impl Into<String>, rrtype: impl Into<String>) -> Self {
        Self {
            mode: QueryMode::Basic,
            term: term.into(),
            rrtype: rrtype.into(),
        }
    }

    pub fn flexible(term: impl Into<String>, rrtype: impl Into<String>) -> Self {
        Self {
            mode: QueryMode::Flexible,
            term: term.into(),
            rrtype: rrtype.into(),
        }
    }

    /// Stable identifier used in logs and checkpoints, e.g. `rrset/name/*.example.com/A`
    pub fn key(&self) -> String {
        match self.mode {
            QueryMode::Basic => format!("rrset/name/{}/{}", self.term, self.rrtype),
            QueryMode::Flexible => format!("regex/rrnames/{}/{}", self.term, self.rrtype),
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Position of the next page to request
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaginationCursor {
    /// Number of remote results consumed so far
    pub offset: u64,
    /// Number of pages fetched so far
    pub page: u32,
}

impl PaginationCursor {
    pub fn start() -> Self {
        Self::default()
    }

    fn advance(self, consumed: u64) -> Self {
        Self {
            offset: self.offset + consumed,
            page: self.page + 1,
        }
    }
}

impl fmt::Display for PaginationCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page {} (offset {})", self.page + 1, self.offset)
    }
}

/// One page request handed to a [`PageSource`]
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub query: Query,
    pub offset: u64,
    pub limit: u32,
}

/// One page of results
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<RawRecord>,
    /// Remote results this page covered, including lines that were skipped
    pub consumed: u64,
    /// The remote reported more results beyond this page
    pub more: bool,
    pub warnings: Vec<ExtractionWarning>,
}

impl Page {
    pub fn new(records: Vec<RawRecord>, more: bool) -> Self {
        let consumed = records.len() as u64;
        Self {
            records,
            consumed,
            more,
            warnings: Vec::new(),
        }
    }
}

/// Failure of a single page request
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("remote query failed: {0}")]
    RemoteFailed(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl SourceError {
    /// Credential or quota failures; never retried
    pub fn is_quota(&self) -> bool {
        matches!(self, SourceError::Http { status: 401 | 403 | 429, .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            SourceError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Errors surfaced by the fetcher after classification and retries
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    /// Retries exhausted; resumable from `cursor`
    #[error("transient failure for {query} at {cursor} after {attempts} attempts: {message}")]
    Transient {
        query: Query,
        cursor: PaginationCursor,
        attempts: u32,
        message: String,
    },

    /// Credential rejected or quota exhausted; not retried
    #[error("quota exhausted for {query} at {cursor} (HTTP {status}): {message}")]
    QuotaExhausted {
        query: Query,
        cursor: PaginationCursor,
        status: u16,
        message: String,
    },
}

impl FetchError {
    pub fn query(&self) -> &Query {
        match self {
            FetchError::Transient { query, .. } | FetchError::QuotaExhausted { query, .. } => query,
        }
    }

    /// Cursor of the page that failed
    pub fn cursor(&self) -> PaginationCursor {
        match self {
            FetchError::Transient { cursor, .. } | FetchError::QuotaExhausted { cursor, .. } => *cursor,
        }
    }

    pub fn is_resumable(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }
}

/// A remote API that returns one page of raw records per request
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, SourceError>;
}

/// Wraps a [`PageSource`] with pagination, throttling and retry
pub struct RateLimitedFetcher {
    source: Arc<dyn PageSource>,
    limiter: SharedRateLimiter,
    retry: RetryHelper,
    page_size: u32,
}

impl RateLimitedFetcher {
    /// The token bucket is created here and shared by every stream of this fetcher.
    pub fn new(source: Arc<dyn PageSource>, rate_limit: &RateLimitConfig, page_size: u32) -> Self {
        debug!(
            "Fetcher for {}: {} req/s, {:?} backoff, max {} retries, page size {}",
            source.name(),
            rate_limit.requests_per_second,
            rate_limit.backoff_strategy,
            rate_limit.max_retries,
            page_size
        );
        Self {
            source,
            limiter: SharedRateLimiter::new(rate_limit.requests_per_second),
            retry: RetryHelper::new(rate_limit),
            page_size: page_size.max(1),
        }
    }

    /// Lazy stream over all results of `query`, starting from the first page
    pub fn fetch(&self, query: Query) -> RecordStream<'_> {
        self.resume(query, PaginationCursor::start())
    }

    /// Lazy stream starting at the page `cursor` points to
    pub fn resume(&self, query: Query, cursor: PaginationCursor) -> RecordStream<'_> {
        if cursor != PaginationCursor::start() {
            info!("Resuming {} from {}", query, cursor);
        }
        RecordStream {
            fetcher: self,
            query,
            cursor,
            buffer: VecDeque::new(),
            exhausted: false,
            warnings: Vec::new(),
        }
    }

    async fn request_page(&self, query: &Query, cursor: PaginationCursor) -> Result<Page, FetchError> {
        let request = PageRequest {
            query: query.clone(),
            offset: cursor.offset,
            limit: self.page_size,
        };
        let source = &self.source;
        let limiter = &self.limiter;
        let request_ref = &request;

        let result = self
            .retry
            .with_retry(
                move || async move {
                    limiter.acquire().await;
                    source.fetch_page(request_ref).await
                },
                |e: &SourceError| !e.is_quota(),
            )
            .await;

        match result {
            Ok(page) => Ok(page),
            Err(failure) => {
                let error = failure.error;
                if let Some(status) = error.status().filter(|_| error.is_quota()) {
                    warn!("{} rejected {} with HTTP {}", self.source.name(), query, status);
                    Err(FetchError::QuotaExhausted {
                        query: query.clone(),
                        cursor,
                        status,
                        message: error.to_string(),
                    })
                } else {
                    Err(FetchError::Transient {
                        query: query.clone(),
                        cursor,
                        attempts: failure.attempts,
                        message: error.to_string(),
                    })
                }
            }
        }
    }
}

/// Pull-based stream of raw records for one query.
///
/// A page is requested only when the caller asks for it; use either
/// [`RecordStream::next_page`] or [`RecordStream::next_record`] for a stream,
/// not both.
pub struct RecordStream<'a> {
    fetcher: &'a RateLimitedFetcher,
    query: Query,
    cursor: PaginationCursor,
    buffer: VecDeque<RawRecord>,
    exhausted: bool,
    warnings: Vec<ExtractionWarning>,
}

impl<'a> RecordStream<'a> {
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Cursor of the next page to request; after an error, the page that failed
    pub fn cursor(&self) -> PaginationCursor {
        self.cursor
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted && self.buffer.is_empty()
    }

    /// Fetch the next page. Returns `Ok(None)` once the remote reports no more results.
    pub async fn next_page(&mut self) -> Result<Option<Vec<RawRecord>>, FetchError> {
        if self.exhausted {
            return Ok(None);
        }

        let page = self.fetcher.request_page(&self.query, self.cursor).await?;
        debug!(
            "{}: {} returned {} records ({} skipped), more={}",
            self.query,
            self.cursor,
            page.records.len(),
            page.warnings.len(),
            page.more
        );

        self.cursor = self.cursor.advance(page.consumed);
        if !page.more || page.consumed == 0 {
            self.exhausted = true;
        }
        for warning in &page.warnings {
            warn!("{}", warning);
        }
        self.warnings.extend(page.warnings);
        Ok(Some(page.records))
    }

    /// Next record, draining the current page before requesting another
    pub async fn next_record(&mut self) -> Result<Option<RawRecord>, FetchError> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return Ok(Some(record));
            }
            match self.next_page().await? {
                Some(records) => self.buffer.extend(records),
                None => return Ok(None),
            }
        }
    }

    /// Warnings for malformed lines seen so far
    pub fn take_warnings(&mut self) -> Vec<ExtractionWarning> {
        std::mem::take(&mut self.warnings)
    }
}

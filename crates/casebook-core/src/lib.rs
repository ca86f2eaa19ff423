use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Default number of visit records rewritten per work unit. Kept well below
/// what a single request-time budget can absorb; deployments tune it at
/// runtime.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

const CURSOR_PREFIX: &str = "vbc1:";
const CURSOR_HEX_DIGITS: usize = 16;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("record store error: {0}")]
pub struct StoreError(pub String);

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("work scheduler error: {0}")]
pub struct SchedulerError(pub String);

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PipelineError {
    #[error("malformed cursor: {0}")]
    MalformedCursor(String),
    #[error("chunk size must be >= 1")]
    InvalidChunkSize,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ClientId(pub i64);

impl Display for ClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VisitId(pub i64);

impl Display for VisitId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Client {
    pub first_name: String,
    pub last_name: String,
    pub address: Option<String>,
    pub phone: Option<String>,
}

/// One assistance visit logged against a client. `retired` is `None` on rows
/// written before the attribute existed; the backfill pipeline's whole job is
/// to drive every `None` to an explicit `Some(false)`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Visit {
    pub client_id: ClientId,
    pub visited_on: String,
    pub assistance: String,
    pub note: Option<String>,
    pub retired: Option<bool>,
}

/// Opaque resumable position in the id-ordered, unfiltered visit enumeration.
///
/// The wire form is `vbc1:` followed by sixteen lowercase hex digits. The
/// payload is the store's ordering key of the last record already consumed;
/// [`Cursor::BEGIN`] denotes the position before the first record. Cursors
/// are only meaningful against the enumeration they were captured from and
/// are not defended against concurrent inserts or deletes mid-scan.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Cursor(u64);

impl Cursor {
    pub const BEGIN: Self = Self(0);

    #[must_use]
    pub fn from_position(position: u64) -> Self {
        Self(position)
    }

    #[must_use]
    pub fn position(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn encode(self) -> String {
        format!("{CURSOR_PREFIX}{:016x}", self.0)
    }

    /// Decode a cursor token previously produced by [`Cursor::encode`].
    ///
    /// # Errors
    /// Returns [`PipelineError::MalformedCursor`] when the prefix, length, or
    /// hex payload is wrong. A malformed token is a permanent failure: the
    /// scheduler must not redeliver it.
    pub fn decode(raw: &str) -> Result<Self, PipelineError> {
        let Some(digits) = raw.strip_prefix(CURSOR_PREFIX) else {
            return Err(PipelineError::MalformedCursor(format!(
                "token `{raw}` is missing the `{CURSOR_PREFIX}` prefix"
            )));
        };

        if digits.len() != CURSOR_HEX_DIGITS {
            return Err(PipelineError::MalformedCursor(format!(
                "token `{raw}` payload must be exactly {CURSOR_HEX_DIGITS} hex digits"
            )));
        }

        let position = u64::from_str_radix(digits, 16).map_err(|err| {
            PipelineError::MalformedCursor(format!("token `{raw}` payload is not hex: {err}"))
        })?;

        Ok(Self(position))
    }
}

impl Display for Cursor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}

impl Serialize for Cursor {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Cursor {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::decode(&raw).map_err(serde::de::Error::custom)
    }
}

/// Scheduler payload for one unit of backfill work. Delivered at least once;
/// processing is idempotent so duplicate delivery is harmless.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct WorkItem {
    pub resume_cursor: Cursor,
}

/// Audit record appended after each successfully completed non-empty chunk.
/// Never read back to decide whether the chain continues.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ProgressRecord {
    pub cursor_after_chunk: Cursor,
    pub processed_count: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub completed_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScannedVisit {
    pub id: VisitId,
    pub retired: Option<bool>,
}

/// One page of the visit enumeration. `cursor_after` is the resume position
/// immediately after the last returned record; when the page is empty it
/// equals the cursor the scan started from.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct VisitPage {
    pub records: Vec<ScannedVisit>,
    pub cursor_after: Cursor,
}

/// Query/write surface the pipeline needs from the record store. The store
/// cannot filter on attribute absence, so the scan is always unfiltered.
pub trait RecordStore {
    /// Fetch up to `limit` visits starting immediately after `start`.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the underlying read fails.
    fn scan_visits(&mut self, start: Cursor, limit: usize) -> Result<VisitPage, StoreError>;

    /// Rewrite one visit so `retired` carries an explicit value, defaulting
    /// an absent attribute to `false` and leaving an explicit `true` intact.
    /// Idempotent; each call is an independently committed write.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the underlying write fails.
    fn write_retired_default(&mut self, id: VisitId) -> Result<(), StoreError>;

    /// Append one progress record to the audit log.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the underlying write fails.
    fn append_progress(&mut self, entry: &ProgressRecord) -> Result<(), StoreError>;
}

/// Enqueue surface of the external work scheduler. Accepted items are
/// delivered to the resume entry point at least once, at an unspecified
/// future time.
pub trait WorkScheduler {
    /// Submit one work item for future delivery.
    ///
    /// # Errors
    /// Returns [`SchedulerError`] when the item could not be accepted.
    fn submit(&mut self, item: WorkItem) -> Result<(), SchedulerError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct StartReport {
    pub scheduled: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ChunkReport {
    /// A non-empty chunk was rewritten; a continuation item was submitted.
    Continued { cursor_after: Cursor, processed: u64 },
    /// The resume cursor pointed past the end of the collection; the chain
    /// terminates here.
    Complete,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct ProgressSummary {
    pub chunks: u64,
    pub total_processed: u64,
    pub last_chunk: u64,
}

/// Migration Initiator: probe the collection with a single bounded fetch and
/// schedule the first work unit if any record exists.
///
/// At most one item is enqueued per invocation. Calling this while a prior
/// chain is still running enqueues an additional redundant chain; rewrites
/// are idempotent so that is wasteful but safe.
///
/// # Errors
/// Returns [`PipelineError::InvalidChunkSize`] for a zero chunk size, or
/// propagates store/scheduler failures (in which case nothing was scheduled).
pub fn start_backfill(
    store: &mut dyn RecordStore,
    scheduler: &mut dyn WorkScheduler,
    chunk_size: usize,
) -> Result<StartReport, PipelineError> {
    if chunk_size == 0 {
        return Err(PipelineError::InvalidChunkSize);
    }

    let probe = store.scan_visits(Cursor::BEGIN, 1)?;
    if probe.records.is_empty() {
        return Ok(StartReport { scheduled: false });
    }

    scheduler.submit(WorkItem { resume_cursor: Cursor::BEGIN })?;
    Ok(StartReport { scheduled: true })
}

/// Chunk Processor: rewrite one bounded batch of visits starting at the work
/// item's cursor and decide whether the chain continues.
///
/// Every fetched visit gets an explicit `retired` value. A non-empty chunk
/// appends one [`ProgressRecord`] and submits the continuation; an empty
/// fetch completes the chain. Each rewrite commits independently, so a
/// failure mid-chunk leaves earlier rewrites in place; the caller should
/// surface the error to the scheduler so the same item is redelivered.
///
/// # Errors
/// Returns [`PipelineError::InvalidChunkSize`] for a zero chunk size, or
/// propagates the first store/scheduler failure.
pub fn process_chunk(
    store: &mut dyn RecordStore,
    scheduler: &mut dyn WorkScheduler,
    item: WorkItem,
    chunk_size: usize,
    completed_at: OffsetDateTime,
) -> Result<ChunkReport, PipelineError> {
    if chunk_size == 0 {
        return Err(PipelineError::InvalidChunkSize);
    }

    let page = store.scan_visits(item.resume_cursor, chunk_size)?;

    let mut processed = 0_u64;
    for record in &page.records {
        store.write_retired_default(record.id)?;
        processed += 1;
    }

    if processed == 0 {
        return Ok(ChunkReport::Complete);
    }

    let entry = ProgressRecord {
        cursor_after_chunk: page.cursor_after,
        processed_count: processed,
        completed_at,
    };
    store.append_progress(&entry)?;
    scheduler.submit(WorkItem { resume_cursor: page.cursor_after })?;

    Ok(ChunkReport::Continued { cursor_after: page.cursor_after, processed })
}

/// Collapse the append-only progress log into operator-facing totals.
#[must_use]
pub fn summarize_progress(entries: &[ProgressRecord]) -> ProgressSummary {
    let chunks = u64::try_from(entries.len()).unwrap_or(u64::MAX);
    let total_processed = entries.iter().map(|entry| entry.processed_count).sum();
    let last_chunk = entries.last().map_or(0, |entry| entry.processed_count);

    ProgressSummary { chunks, total_processed, last_chunk }
}

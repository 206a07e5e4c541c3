//! Deduplication index and the incremental ingestor.
//!
//! Duplicate detection is content-based: a stable SHA-256 over the canonical
//! record tuple, scoped to a trailing time window so repeated runs never need
//! the full historical corpus in memory. The index is an explicit value,
//! rebuilt deterministically from the store at the start of a run and handed
//! into [`Ingestor::ingest`]; there is no hidden process-wide state.

use std::collections::HashSet;
use std::io::BufRead;
use std::path::Path;

use chrono::{DateTime, Days, NaiveDate, Utc};
use dfin_core::ContributionRecord;
use dfin_sources::{LayoutError, RowNormalizer, RowOutcome, SourceLayout, SourceLines};
use dfin_store::{Store, StoreError, StoredContribution};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, info_span};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dfin-ingest";

const DEDUP_PAGE_SIZE: i64 = 50_000;
pub const DEFAULT_BATCH_SIZE: usize = 1_000;

/// Trailing window inside which duplicate detection is guaranteed. Records
/// older than the window are assumed never to be re-submitted; if that
/// assumption is violated the duplicate is accepted silently, a deliberate
/// cost/completeness tradeoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupWindow {
    since: NaiveDate,
}

impl DedupWindow {
    /// Window covering the last `days` days up to and including `today`.
    pub fn trailing_days(today: NaiveDate, days: u64) -> Self {
        Self {
            since: today.checked_sub_days(Days::new(days)).unwrap_or(NaiveDate::MIN),
        }
    }

    /// Window covering the current and prior calendar year.
    pub fn calendar_years(today: NaiveDate) -> Self {
        use chrono::Datelike;
        Self {
            since: NaiveDate::from_ymd_opt(today.year() - 1, 1, 1)
                .expect("january 1st always exists"),
        }
    }

    pub fn since(&self) -> NaiveDate {
        self.since
    }
}

/// Stable content hash over the canonical record tuple.
pub fn content_hash(
    first_name: &str,
    last_name: &str,
    city: &str,
    state: &str,
    zip_code: &str,
    date_iso: &str,
    recipient_key: &str,
    amount_cents: i64,
    record_type: &str,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in [
        first_name,
        last_name,
        city,
        state,
        zip_code,
        date_iso,
        recipient_key,
        &amount_cents.to_string(),
        record_type,
    ] {
        hasher.update(part.as_bytes());
        hasher.update(b"|");
    }
    hasher.finalize().into()
}

pub fn record_hash(record: &ContributionRecord) -> [u8; 32] {
    content_hash(
        &record.first_name,
        &record.last_name,
        &record.city,
        &record.state,
        &record.zip_code,
        &record.date.to_string(),
        record.recipient.key(),
        record.amount_cents,
        &record.record_type,
    )
}

pub fn stored_hash(row: &StoredContribution) -> [u8; 32] {
    content_hash(
        &row.first_name,
        &row.last_name,
        &row.city,
        &row.state,
        &row.zip_code,
        &row.contribution_date,
        &row.recipient_key,
        row.amount_cents,
        &row.record_type,
    )
}

/// Windowed content-hash set answering "was this exact record already
/// committed" in O(1) amortized. Owned by one ingestor run; concurrent
/// ingestion of multiple files must use one index per file or serialize.
#[derive(Debug)]
pub struct DedupIndex {
    window: DedupWindow,
    hashes: HashSet<[u8; 32]>,
}

impl DedupIndex {
    pub fn empty(window: DedupWindow) -> Self {
        Self {
            window,
            hashes: HashSet::new(),
        }
    }

    /// Rebuild the index from every committed row inside the window,
    /// paging by rowid so the scan's working set stays bounded.
    pub async fn rebuild(store: &Store, window: DedupWindow) -> Result<Self, StoreError> {
        let span = info_span!("dedup_rebuild", since = %window.since());
        let _guard = span.enter();

        let mut hashes = HashSet::new();
        let mut after_rowid = 0i64;
        loop {
            let page = store
                .contributions_since_page(window.since(), after_rowid, DEDUP_PAGE_SIZE)
                .await?;
            let Some((last_rowid, _)) = page.last() else {
                break;
            };
            after_rowid = *last_rowid;
            for (_, row) in &page {
                hashes.insert(stored_hash(row));
            }
        }
        info!(indexed = hashes.len(), since = %window.since(), "dedup index rebuilt");
        Ok(Self { window, hashes })
    }

    pub fn window(&self) -> DedupWindow {
        self.window
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn contains(&self, hash: &[u8; 32]) -> bool {
        self.hashes.contains(hash)
    }

    /// Insert a hash; returns false if it was already present.
    pub fn insert(&mut self, hash: [u8; 32]) -> bool {
        self.hashes.insert(hash)
    }
}

/// Per-run counters. `new` counts committed rows only, so on a commit
/// failure the counts describe exactly what made it into the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestCounts {
    pub new: u64,
    pub duplicate: u64,
    pub error: u64,
    /// Rows excluded by the layout's entity filter; not errors.
    pub filtered: u64,
    /// Committed rows whose recipient key is a provisional filing-level
    /// identifier; surfaced for a later remapping pass.
    pub provisional: u64,
    pub batches_committed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub source_label: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub counts: IngestCounts,
}

#[derive(Debug, Error)]
pub enum IngestError {
    /// A batch commit failed. Prior batches stand; re-running the same file
    /// re-derives the same dedup decisions, so ingestion is resumable.
    #[error("committing batch to the store (committed so far: {committed} new rows): {source}")]
    Commit {
        counts: IngestCounts,
        committed: u64,
        source: StoreError,
    },
    #[error("reading source stream: {source}")]
    Read {
        counts: IngestCounts,
        source: std::io::Error,
    },
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Streams one source file through the normalizer, consults the dedup
/// index, and commits new records in fixed-size batches. Single-threaded
/// per file so batch boundaries and counters are deterministic.
pub struct Ingestor<'a> {
    store: &'a Store,
    batch_size: usize,
}

impl<'a> Ingestor<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self {
            store,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub async fn ingest_path(
        &self,
        path: &Path,
        layout: &SourceLayout,
        dedup: &mut DedupIndex,
        source_label: &str,
    ) -> Result<IngestSummary, IngestError> {
        let reader = dfin_sources::open_source_reader(path).map_err(|err| IngestError::Read {
            counts: IngestCounts::default(),
            source: std::io::Error::other(err),
        })?;
        self.ingest(reader, layout, dedup, source_label).await
    }

    pub async fn ingest(
        &self,
        reader: impl BufRead,
        layout: &SourceLayout,
        dedup: &mut DedupIndex,
        source_label: &str,
    ) -> Result<IngestSummary, IngestError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("ingest", %run_id, source_label);
        let _guard = span.enter();

        let mut normalizer = RowNormalizer::new(layout);
        let mut counts = IngestCounts::default();
        let mut batch: Vec<ContributionRecord> = Vec::with_capacity(self.batch_size);
        let mut batch_provisional = 0u64;

        for line in SourceLines::new(reader) {
            let line = line.map_err(|source| IngestError::Read { counts, source })?;
            if normalizer.needs_header() {
                normalizer.bind_header(&line);
                continue;
            }
            if line.is_empty() {
                continue;
            }

            let record = match normalizer.normalize(&line)? {
                RowOutcome::Record(record) => record,
                RowOutcome::Filtered => {
                    counts.filtered += 1;
                    continue;
                }
                RowOutcome::Rejected(reason) => {
                    counts.error += 1;
                    debug!(%reason, "rejected row");
                    continue;
                }
            };

            let hash = record_hash(&record);
            if dedup.contains(&hash) {
                counts.duplicate += 1;
                debug!(hash = %hex::encode(hash), "duplicate row skipped");
                continue;
            }
            dedup.insert(hash);
            if record.recipient.is_provisional() {
                batch_provisional += 1;
            }
            batch.push(record);

            if batch.len() >= self.batch_size {
                self.commit(&mut batch, &mut batch_provisional, &mut counts)
                    .await?;
            }
        }

        if !batch.is_empty() {
            self.commit(&mut batch, &mut batch_provisional, &mut counts)
                .await?;
        }

        let finished_at = Utc::now();
        info!(
            new = counts.new,
            duplicate = counts.duplicate,
            error = counts.error,
            provisional = counts.provisional,
            "ingest finished"
        );
        Ok(IngestSummary {
            run_id,
            source_label: source_label.to_string(),
            started_at,
            finished_at,
            counts,
        })
    }

    async fn commit(
        &self,
        batch: &mut Vec<ContributionRecord>,
        batch_provisional: &mut u64,
        counts: &mut IngestCounts,
    ) -> Result<(), IngestError> {
        match self.store.commit_batch(batch).await {
            Ok(()) => {
                counts.new += batch.len() as u64;
                counts.provisional += *batch_provisional;
                counts.batches_committed += 1;
                batch.clear();
                *batch_provisional = 0;
                Ok(())
            }
            Err(source) => Err(IngestError::Commit {
                counts: *counts,
                committed: counts.new,
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable_and_field_separated() {
        let a = content_hash("JOHN", "SMITH", "SPRINGFIELD", "IL", "62701", "2024-03-15", "C1", 25_000, "15");
        let b = content_hash("JOHN", "SMITH", "SPRINGFIELD", "IL", "62701", "2024-03-15", "C1", 25_000, "15");
        assert_eq!(a, b);

        // Moving a character across a field boundary must change the hash.
        let c = content_hash("JOHNS", "MITH", "SPRINGFIELD", "IL", "62701", "2024-03-15", "C1", 25_000, "15");
        assert_ne!(a, c);

        let d = content_hash("JOHN", "SMITH", "SPRINGFIELD", "IL", "62701", "2024-03-15", "C1", 25_001, "15");
        assert_ne!(a, d);
    }

    #[test]
    fn trailing_window_cutoff() {
        let today = NaiveDate::from_ymd_opt(2026, 8, 4).unwrap();
        let window = DedupWindow::trailing_days(today, 365);
        assert_eq!(window.since(), NaiveDate::from_ymd_opt(2025, 8, 4).unwrap());
    }

    #[test]
    fn calendar_year_window_starts_prior_january() {
        let today = NaiveDate::from_ymd_opt(2026, 8, 4).unwrap();
        let window = DedupWindow::calendar_years(today);
        assert_eq!(window.since(), NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
    }

    #[test]
    fn empty_index_accepts_then_rejects() {
        let today = NaiveDate::from_ymd_opt(2026, 8, 4).unwrap();
        let mut index = DedupIndex::empty(DedupWindow::trailing_days(today, 365));
        let hash = content_hash("A", "B", "C", "D", "E", "2026-01-01", "R", 100, "");
        assert!(!index.contains(&hash));
        assert!(index.insert(hash));
        assert!(index.contains(&hash));
        assert!(!index.insert(hash));
        assert_eq!(index.len(), 1);
    }
}

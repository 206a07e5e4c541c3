//! Derived-table builders: donor percentile aggregation and recipient
//! rollups.
//!
//! Both builders are full recomputations over the primary store. They write
//! into staging tables and swap atomically, so downstream readers only ever
//! see a complete rebuild. Partitions (years for percentiles, recipient key
//! ranges for rollups) fail independently; a failed partition is recorded
//! in the run report and the rest continue. A cooperative cancel flag is
//! checked between partitions, never mid-partition, so a stop request
//! completes within one partition's processing time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use dfin_store::{DerivedTable, Store, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dfin-aggregate";

/// Percentile points materialized per year.
pub const PERCENTILE_POINTS: [i64; 9] = [1, 5, 10, 25, 50, 75, 90, 95, 99];

/// Cooperative cancellation shared with the caller. Builders poll it
/// between partitions; a cancelled run abandons its staging tables and
/// leaves the live derived tables untouched.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionFailure {
    pub partition: String,
    pub error: String,
}

/// Outcome of one rebuild run. `failed` lists partitions to retry; the
/// swap still happens for whatever completed, since a re-run regenerates
/// everything from the primary store anyway.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateReport {
    pub run_id: Uuid,
    pub job: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub completed_partitions: Vec<String>,
    pub failed_partitions: Vec<PartitionFailure>,
    pub rows_written: u64,
    pub cancelled: bool,
}

impl AggregateReport {
    pub fn is_partial(&self) -> bool {
        !self.failed_partitions.is_empty() || self.cancelled
    }
}

struct ReportBuilder {
    run_id: Uuid,
    job: String,
    started_at: DateTime<Utc>,
    completed: Vec<String>,
    failed: Vec<PartitionFailure>,
    rows_written: u64,
}

impl ReportBuilder {
    fn new(job: &str) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            job: job.to_string(),
            started_at: Utc::now(),
            completed: Vec::new(),
            failed: Vec::new(),
            rows_written: 0,
        }
    }

    fn partition_done(&mut self, name: String, rows: u64) {
        self.rows_written += rows;
        self.completed.push(name);
    }

    fn partition_failed(&mut self, name: String, error: impl ToString) {
        warn!(partition = %name, error = %error.to_string(), "aggregation partition failed");
        self.failed.push(PartitionFailure {
            partition: name,
            error: error.to_string(),
        });
    }

    fn finish(self, cancelled: bool) -> AggregateReport {
        AggregateReport {
            run_id: self.run_id,
            job: self.job,
            started_at: self.started_at,
            finished_at: Utc::now(),
            completed_partitions: self.completed,
            failed_partitions: self.failed,
            rows_written: self.rows_written,
            cancelled,
        }
    }
}

const DONOR_KEY_SQL: &str =
    "lower(first_name) || '|' || lower(last_name) || '|' || substr(zip_code, 1, 5)";

/// Rebuilds `donor_year_totals` and `percentile_thresholds` from scratch.
///
/// Phase A groups contributions by (donor key, year), one year at a time so
/// the grouping working set never spans the whole corpus. Phase B derives
/// the rank thresholds per year from the freshly swapped totals.
pub struct PercentileAggregator<'a> {
    store: &'a Store,
}

impl<'a> PercentileAggregator<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub async fn rebuild(&self, cancel: &CancelFlag) -> Result<AggregateReport, AggregateError> {
        let mut report = ReportBuilder::new("percentiles");
        let span = info_span!("percentile_rebuild", run_id = %report.run_id);
        let _guard = span.enter();

        let years: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT CAST(strftime('%Y', contribution_date) AS INTEGER)
             FROM contributions ORDER BY 1",
        )
        .fetch_all(self.store.pool())
        .await?;

        self.store.reset_staging(DerivedTable::DonorYearTotals).await?;
        for year in &years {
            if cancel.is_cancelled() {
                return Ok(report.finish(true));
            }
            let name = format!("totals:{year}");
            match self.build_year_totals(*year).await {
                Ok(rows) => report.partition_done(name, rows),
                Err(err) => report.partition_failed(name, err),
            }
        }
        if cancel.is_cancelled() {
            return Ok(report.finish(true));
        }
        self.store.swap_in_staging(DerivedTable::DonorYearTotals).await?;

        self.store
            .reset_staging(DerivedTable::PercentileThresholds)
            .await?;
        let total_years: Vec<i64> =
            sqlx::query_scalar("SELECT DISTINCT year FROM donor_year_totals ORDER BY year")
                .fetch_all(self.store.pool())
                .await?;
        for year in &total_years {
            if cancel.is_cancelled() {
                return Ok(report.finish(true));
            }
            let name = format!("thresholds:{year}");
            match self.build_year_thresholds(*year).await {
                Ok(rows) => report.partition_done(name, rows),
                Err(err) => report.partition_failed(name, err),
            }
        }
        if cancel.is_cancelled() {
            return Ok(report.finish(true));
        }
        self.store
            .swap_in_staging(DerivedTable::PercentileThresholds)
            .await?;

        let report = report.finish(false);
        info!(
            rows = report.rows_written,
            failed = report.failed_partitions.len(),
            "percentile rebuild finished"
        );
        Ok(report)
    }

    /// One year of donor totals. Groups whose total is not positive are
    /// discarded (refunds can net a donor-year to zero or below).
    async fn build_year_totals(&self, year: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(&format!(
            "INSERT INTO donor_year_totals_staging
                (donor_key, year, total_cents, contribution_count, first_name, last_name, zip5)
             SELECT {DONOR_KEY_SQL} AS donor_key,
                    ? AS year,
                    SUM(amount_cents) AS total_cents,
                    COUNT(*) AS contribution_count,
                    first_name,
                    last_name,
                    substr(zip_code, 1, 5) AS zip5
             FROM contributions
             WHERE contribution_date >= ? AND contribution_date <= ?
             GROUP BY donor_key
             HAVING SUM(amount_cents) > 0"
        ))
        .bind(year)
        .bind(format!("{year:04}-01-01"))
        .bind(format!("{year:04}-12-31"))
        .execute(self.store.pool())
        .await?;
        Ok(result.rows_affected())
    }

    async fn build_year_thresholds(&self, year: i64) -> Result<u64, sqlx::Error> {
        let total_donors: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM donor_year_totals WHERE year = ?")
                .bind(year)
                .fetch_one(self.store.pool())
                .await?;
        if total_donors == 0 {
            return Ok(0);
        }

        let mut rows = 0u64;
        for percentile in PERCENTILE_POINTS {
            let position = ((percentile * total_donors) / 100).max(1);
            // The position-th largest total; ties sort on amount alone, so
            // the threshold amount is stable even when tied donors are not.
            let threshold: Option<i64> = sqlx::query_scalar(
                "SELECT total_cents FROM donor_year_totals
                 WHERE year = ?
                 ORDER BY total_cents DESC
                 LIMIT 1 OFFSET ?",
            )
            .bind(year)
            .bind(position - 1)
            .fetch_optional(self.store.pool())
            .await?;
            let Some(amount_cents) = threshold else {
                continue;
            };
            sqlx::query(
                "INSERT OR REPLACE INTO percentile_thresholds_staging
                    (year, percentile, amount_cents, rank_at_threshold)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(year)
            .bind(percentile)
            .bind(amount_cents)
            .bind(position)
            .execute(self.store.pool())
            .await?;
            rows += 1;
        }
        Ok(rows)
    }
}

/// Half-open recipient key range; `None` bounds are unbounded so the union
/// of all partitions always covers the whole key space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Option<&'static str>,
    pub end: Option<&'static str>,
}

impl KeyRange {
    pub fn label(&self) -> String {
        format!(
            "{}..{}",
            self.start.unwrap_or("-inf"),
            self.end.unwrap_or("+inf")
        )
    }
}

/// Disjoint key ranges covering every possible recipient key: everything
/// before 'A', eight alphabetic spans, and an open-ended tail past 'V' so
/// keys beyond 'Z' are never dropped.
pub fn key_partitions() -> Vec<KeyRange> {
    const BOUNDS: [&str; 8] = ["A", "D", "G", "J", "M", "P", "S", "V"];
    let mut ranges = Vec::with_capacity(BOUNDS.len() + 1);
    let mut previous: Option<&'static str> = None;
    for bound in BOUNDS {
        ranges.push(KeyRange {
            start: previous,
            end: Some(bound),
        });
        previous = Some(bound);
    }
    ranges.push(KeyRange {
        start: previous,
        end: None,
    });
    ranges
}

/// Rebuilds `recipient_rollups` and its full-text projection. Lifetime and
/// trailing-window statistics come from one pass per key range; the recent
/// cutoff is computed once at run start, not re-evaluated per row.
pub struct RecipientRollupBuilder<'a> {
    store: &'a Store,
}

impl<'a> RecipientRollupBuilder<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn default_recent_cutoff(today: NaiveDate) -> NaiveDate {
        today - chrono::Days::new(365)
    }

    pub async fn rebuild(
        &self,
        recent_cutoff: NaiveDate,
        cancel: &CancelFlag,
    ) -> Result<AggregateReport, AggregateError> {
        let mut report = ReportBuilder::new("recipient-rollups");
        let span = info_span!("rollup_rebuild", run_id = %report.run_id);
        let _guard = span.enter();
        let built_at = Utc::now().to_rfc3339();

        self.store.reset_staging(DerivedTable::RecipientRollups).await?;
        for range in key_partitions() {
            if cancel.is_cancelled() {
                return Ok(report.finish(true));
            }
            let name = format!("rollups:{}", range.label());
            match self
                .build_range(&range, recent_cutoff, &built_at)
                .await
            {
                Ok(rows) => report.partition_done(name, rows),
                Err(err) => report.partition_failed(name, err),
            }
        }
        if cancel.is_cancelled() {
            return Ok(report.finish(true));
        }
        self.store.swap_in_staging(DerivedTable::RecipientRollups).await?;
        self.rebuild_search_projection().await?;

        let report = report.finish(false);
        info!(
            rows = report.rows_written,
            failed = report.failed_partitions.len(),
            "recipient rollup rebuild finished"
        );
        Ok(report)
    }

    async fn build_range(
        &self,
        range: &KeyRange,
        recent_cutoff: NaiveDate,
        built_at: &str,
    ) -> Result<u64, sqlx::Error> {
        let mut conditions = Vec::new();
        if range.start.is_some() {
            conditions.push("c.recipient_key >= ?");
        }
        if range.end.is_some() {
            conditions.push("c.recipient_key < ?");
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let sql = format!(
            "INSERT INTO recipient_rollups_staging
                (recipient_key, display_name, kind, lifetime_count, lifetime_cents,
                 recent_count, recent_cents, first_date, last_date,
                 contributor_count, built_at)
             SELECT c.recipient_key,
                    COALESCE(m.name, c.recipient_key) AS display_name,
                    COALESCE(m.kind, '') AS kind,
                    COUNT(*) AS lifetime_count,
                    SUM(c.amount_cents) AS lifetime_cents,
                    SUM(CASE WHEN c.contribution_date >= ?1 THEN 1 ELSE 0 END) AS recent_count,
                    SUM(CASE WHEN c.contribution_date >= ?1 THEN c.amount_cents ELSE 0 END) AS recent_cents,
                    MIN(c.contribution_date) AS first_date,
                    MAX(c.contribution_date) AS last_date,
                    COUNT(DISTINCT {DONOR_KEY_SQL}) AS contributor_count,
                    ?2 AS built_at
             FROM contributions c
             LEFT JOIN recipients m ON c.recipient_key = m.recipient_key
             {where_clause}
             GROUP BY c.recipient_key"
        );

        let mut query = sqlx::query(&sql)
            .bind(recent_cutoff.to_string())
            .bind(built_at);
        if let Some(start) = range.start {
            query = query.bind(start);
        }
        if let Some(end) = range.end {
            query = query.bind(end);
        }
        let result = query.execute(self.store.pool()).await?;
        Ok(result.rows_affected())
    }

    /// Repopulate the FTS projection from the freshly swapped rollups in a
    /// single transaction.
    async fn rebuild_search_projection(&self) -> Result<(), AggregateError> {
        let mut tx = self.store.pool().begin().await.map_err(StoreError::from)?;
        sqlx::query("DELETE FROM recipient_rollups_fts")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO recipient_rollups_fts (recipient_key, display_name)
             SELECT recipient_key, display_name FROM recipient_rollups",
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await.map_err(StoreError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_partitions_are_disjoint_and_cover_everything() {
        let ranges = key_partitions();
        assert_eq!(ranges.len(), 9);
        assert_eq!(ranges[0].start, None);
        assert_eq!(ranges.last().unwrap().end, None);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn threshold_position_floors_and_clamps() {
        // position = max(1, floor(p/100 * donors))
        let position = |p: i64, donors: i64| ((p * donors) / 100).max(1);
        assert_eq!(position(1, 50), 1); // floor(0.5) = 0, clamped to 1
        assert_eq!(position(50, 101), 50);
        assert_eq!(position(99, 100), 99);
        assert_eq!(position(99, 1), 1);
    }

    #[test]
    fn cancel_flag_is_sticky() {
        let flag = CancelFlag::new();
        assert!(!flag.is_cancelled());
        let clone = flag.clone();
        clone.cancel();
        assert!(flag.is_cancelled());
    }
}

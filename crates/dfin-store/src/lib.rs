//! SQLite-backed primary store for contribution records and derived tables.
//!
//! The `contributions` table is the single source of truth; every derived
//! table (donor year totals, percentile thresholds, recipient rollups and
//! their search projection) is a pure function of it and is rebuilt into a
//! staging table that is swapped in atomically, so readers never observe a
//! half-built rebuild.

use std::path::Path;

use chrono::NaiveDate;
use dfin_core::ContributionRecord;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::info;

pub const CRATE_NAME: &str = "dfin-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("creating database directory {path}: {source}")]
    CreateDir {
        path: String,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A committed contribution row as read back for dedup-index rebuilds.
#[derive(Debug, Clone)]
pub struct StoredContribution {
    pub first_name: String,
    pub last_name: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
    pub contribution_date: String,
    pub recipient_key: String,
    pub amount_cents: i64,
    pub record_type: String,
}

/// Recipient metadata from a committee/filer export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientMeta {
    pub recipient_key: String,
    pub name: String,
    pub kind: String,
}

/// Derived tables that rebuild through the staging-swap protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivedTable {
    DonorYearTotals,
    PercentileThresholds,
    RecipientRollups,
}

impl DerivedTable {
    pub fn live_name(self) -> &'static str {
        match self {
            DerivedTable::DonorYearTotals => "donor_year_totals",
            DerivedTable::PercentileThresholds => "percentile_thresholds",
            DerivedTable::RecipientRollups => "recipient_rollups",
        }
    }

    pub fn staging_name(self) -> &'static str {
        match self {
            DerivedTable::DonorYearTotals => "donor_year_totals_staging",
            DerivedTable::PercentileThresholds => "percentile_thresholds_staging",
            DerivedTable::RecipientRollups => "recipient_rollups_staging",
        }
    }

    fn ddl(self, table_name: &str) -> String {
        match self {
            DerivedTable::DonorYearTotals => format!(
                "CREATE TABLE {table_name} (
                    donor_key TEXT NOT NULL,
                    year INTEGER NOT NULL,
                    total_cents INTEGER NOT NULL,
                    contribution_count INTEGER NOT NULL,
                    first_name TEXT NOT NULL,
                    last_name TEXT NOT NULL,
                    zip5 TEXT NOT NULL,
                    PRIMARY KEY (donor_key, year)
                )"
            ),
            DerivedTable::PercentileThresholds => format!(
                "CREATE TABLE {table_name} (
                    year INTEGER NOT NULL,
                    percentile INTEGER NOT NULL,
                    amount_cents INTEGER NOT NULL,
                    rank_at_threshold INTEGER NOT NULL,
                    PRIMARY KEY (year, percentile)
                )"
            ),
            DerivedTable::RecipientRollups => format!(
                "CREATE TABLE {table_name} (
                    recipient_key TEXT PRIMARY KEY,
                    display_name TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    lifetime_count INTEGER NOT NULL,
                    lifetime_cents INTEGER NOT NULL,
                    recent_count INTEGER NOT NULL,
                    recent_cents INTEGER NOT NULL,
                    first_date TEXT,
                    last_date TEXT,
                    contributor_count INTEGER NOT NULL,
                    built_at TEXT NOT NULL
                )"
            ),
        }
    }

    fn index_ddl(self) -> &'static [&'static str] {
        match self {
            DerivedTable::DonorYearTotals => &[
                "CREATE INDEX IF NOT EXISTS idx_dyt_year ON donor_year_totals (year)",
                "CREATE INDEX IF NOT EXISTS idx_dyt_year_total ON donor_year_totals (year, total_cents)",
            ],
            DerivedTable::PercentileThresholds => &[],
            DerivedTable::RecipientRollups => &[
                "CREATE INDEX IF NOT EXISTS idx_rollup_display ON recipient_rollups (display_name)",
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `path` and ensure the
    /// schema exists. WAL mode keeps readers live during batch commits.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                    path: parent.display().to_string(),
                    source,
                })?;
            }
        }
        let newly_created = !path.exists();
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(&url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        sqlx::query("PRAGMA synchronous = NORMAL").execute(&pool).await?;
        sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

        let store = Self { pool };
        store.create_schema().await?;
        if newly_created {
            info!(path = %path.display(), "initialized new contribution database");
        }
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS contributions (
                first_name TEXT NOT NULL,
                last_name TEXT NOT NULL,
                city TEXT NOT NULL,
                state TEXT NOT NULL,
                zip_code TEXT NOT NULL,
                contribution_date TEXT NOT NULL,
                recipient_key TEXT NOT NULL,
                recipient_key_provisional INTEGER NOT NULL DEFAULT 0,
                amount_cents INTEGER NOT NULL,
                record_type TEXT NOT NULL DEFAULT '',
                employer TEXT,
                occupation TEXT,
                filing_id TEXT,
                transaction_id TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS recipients (
                recipient_key TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                kind TEXT NOT NULL DEFAULT ''
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS processed_sources (
                label TEXT PRIMARY KEY,
                processed_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        for table in [
            DerivedTable::DonorYearTotals,
            DerivedTable::PercentileThresholds,
            DerivedTable::RecipientRollups,
        ] {
            let ddl = table
                .ddl(table.live_name())
                .replace("CREATE TABLE", "CREATE TABLE IF NOT EXISTS");
            sqlx::query(&ddl).execute(&self.pool).await?;
            for index in table.index_ddl() {
                sqlx::query(index).execute(&self.pool).await?;
            }
        }

        sqlx::query(
            "CREATE VIRTUAL TABLE IF NOT EXISTS recipient_rollups_fts
             USING fts5(display_name, recipient_key UNINDEXED)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Create the secondary indexes used by search and aggregation. Kept
    /// separate from schema creation so bulk loads can defer them.
    pub async fn create_indexes(&self) -> Result<()> {
        for ddl in [
            "CREATE INDEX IF NOT EXISTS idx_contrib_name ON contributions (first_name, last_name)",
            "CREATE INDEX IF NOT EXISTS idx_contrib_location ON contributions (city, state, zip_code)",
            "CREATE INDEX IF NOT EXISTS idx_contrib_date ON contributions (contribution_date)",
            "CREATE INDEX IF NOT EXISTS idx_contrib_recipient ON contributions (recipient_key)",
            "CREATE INDEX IF NOT EXISTS idx_contrib_flz_date ON contributions (first_name, last_name, zip_code, contribution_date)",
            "CREATE INDEX IF NOT EXISTS idx_contrib_flz_amount ON contributions (first_name, last_name, zip_code, amount_cents)",
            "CREATE INDEX IF NOT EXISTS idx_recipient_name ON recipients (name)",
        ] {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Commit one batch of normalized records in a single transaction.
    /// On error nothing from this batch is visible; previously committed
    /// batches stand.
    pub async fn commit_batch(&self, records: &[ContributionRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                "INSERT INTO contributions (
                    first_name, last_name, city, state, zip_code,
                    contribution_date, recipient_key, recipient_key_provisional,
                    amount_cents, record_type, employer, occupation,
                    filing_id, transaction_id
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&record.first_name)
            .bind(&record.last_name)
            .bind(&record.city)
            .bind(&record.state)
            .bind(&record.zip_code)
            .bind(record.date.to_string())
            .bind(record.recipient.key())
            .bind(record.recipient.is_provisional() as i64)
            .bind(record.amount_cents)
            .bind(&record.record_type)
            .bind(&record.employer)
            .bind(&record.occupation)
            .bind(&record.filing_id)
            .bind(&record.transaction_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn contribution_count(&self) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM contributions")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Rows whose recipient key is a provisional filing-level identifier;
    /// surfaced so an identifier-remapping pass can find its work.
    pub async fn provisional_key_count(&self) -> Result<i64> {
        let count = sqlx::query_scalar(
            "SELECT COUNT(*) FROM contributions WHERE recipient_key_provisional = 1",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// One keyset page of committed rows on or after `since`, ordered by
    /// rowid. Used to rebuild the dedup index without materializing the
    /// whole window at once.
    pub async fn contributions_since_page(
        &self,
        since: NaiveDate,
        after_rowid: i64,
        limit: i64,
    ) -> Result<Vec<(i64, StoredContribution)>> {
        let rows = sqlx::query(
            "SELECT rowid, first_name, last_name, city, state, zip_code,
                    contribution_date, recipient_key, amount_cents, record_type
             FROM contributions
             WHERE contribution_date >= ? AND rowid > ?
             ORDER BY rowid
             LIMIT ?",
        )
        .bind(since.to_string())
        .bind(after_rowid)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push((
                row.try_get("rowid")?,
                StoredContribution {
                    first_name: row.try_get("first_name")?,
                    last_name: row.try_get("last_name")?,
                    city: row.try_get("city")?,
                    state: row.try_get("state")?,
                    zip_code: row.try_get("zip_code")?,
                    contribution_date: row.try_get("contribution_date")?,
                    recipient_key: row.try_get("recipient_key")?,
                    amount_cents: row.try_get("amount_cents")?,
                    record_type: row.try_get("record_type")?,
                },
            ));
        }
        Ok(out)
    }

    pub async fn is_source_processed(&self, label: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM processed_sources WHERE label = ?")
            .bind(label)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn mark_source_processed(&self, label: &str, processed_at: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO processed_sources (label, processed_at) VALUES (?, ?)",
        )
        .bind(label)
        .bind(processed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_recipients(&self, recipients: &[RecipientMeta]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for recipient in recipients {
            sqlx::query(
                "INSERT OR REPLACE INTO recipients (recipient_key, name, kind) VALUES (?, ?, ?)",
            )
            .bind(&recipient.recipient_key)
            .bind(&recipient.name)
            .bind(&recipient.kind)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Drop and recreate the staging table for `table`, ready for a fresh
    /// rebuild.
    pub async fn reset_staging(&self, table: DerivedTable) -> Result<()> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", table.staging_name()))
            .execute(&self.pool)
            .await?;
        sqlx::query(&table.ddl(table.staging_name()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Atomically replace the live derived table with its fully-built
    /// staging twin. Runs in one transaction so no reader sees the gap
    /// between drop and rename.
    pub async fn swap_in_staging(&self, table: DerivedTable) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", table.live_name()))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "ALTER TABLE {} RENAME TO {}",
            table.staging_name(),
            table.live_name()
        ))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        for index in table.index_ddl() {
            sqlx::query(index).execute(&self.pool).await?;
        }
        Ok(())
    }
}

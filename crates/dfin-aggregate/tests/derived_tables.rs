//! Store-backed rebuild flows for the derived tables.

use chrono::NaiveDate;
use dfin_aggregate::{CancelFlag, PercentileAggregator, RecipientRollupBuilder};
use dfin_core::{ContributionRecord, RecipientKey};
use dfin_store::{RecipientMeta, Store};
use tempfile::tempdir;

fn record(
    first: &str,
    last: &str,
    zip: &str,
    date: &str,
    cents: i64,
    recipient: &str,
) -> ContributionRecord {
    ContributionRecord {
        first_name: first.into(),
        last_name: last.into(),
        city: "SPRINGFIELD".into(),
        state: "IL".into(),
        zip_code: zip.into(),
        date: date.parse().unwrap(),
        recipient: RecipientKey::Resolved(recipient.into()),
        amount_cents: cents,
        record_type: "15".into(),
        employer: None,
        occupation: None,
        filing_id: None,
        transaction_id: None,
    }
}

async fn open_store() -> (tempfile::TempDir, Store) {
    let dir = tempdir().unwrap();
    let store = Store::open(&dir.path().join("contributions.db")).await.unwrap();
    (dir, store)
}

#[tokio::test]
async fn thresholds_follow_the_rank_formula_and_do_not_increase_with_the_point() {
    let (_dir, store) = open_store().await;

    // 120 donors in 2024 with distinct totals 1_000, 2_000, ... 120_000.
    let records: Vec<ContributionRecord> = (0..120)
        .map(|i| {
            record(
                &format!("DONOR{i}"),
                "TEST",
                "62701",
                "2024-03-15",
                (i + 1) * 1_000,
                "C00123456",
            )
        })
        .collect();
    store.commit_batch(&records).await.unwrap();

    let report = PercentileAggregator::new(&store)
        .rebuild(&CancelFlag::new())
        .await
        .unwrap();
    assert!(!report.is_partial());

    let rows: Vec<(i64, i64, i64)> = sqlx::query_as(
        "SELECT percentile, amount_cents, rank_at_threshold
         FROM percentile_thresholds WHERE year = 2024 ORDER BY percentile",
    )
    .fetch_all(store.pool())
    .await
    .unwrap();
    assert_eq!(rows.len(), 9);

    // position = max(1, floor(p/100 * 120)); amount = position-th largest.
    assert_eq!(rows[0], (1, 120_000, 1));
    let p50 = rows.iter().find(|r| r.0 == 50).unwrap();
    assert_eq!(*p50, (50, 61_000, 60));
    let p99 = rows.iter().find(|r| r.0 == 99).unwrap();
    assert_eq!(*p99, (99, 3_000, 118));

    for pair in rows.windows(2) {
        assert!(
            pair[0].1 >= pair[1].1,
            "threshold at p={} should be >= threshold at p={}",
            pair[0].0,
            pair[1].0
        );
    }
}

#[tokio::test]
async fn donor_years_netting_to_zero_or_below_are_discarded() {
    let (_dir, store) = open_store().await;
    store
        .commit_batch(&[
            record("JOHN", "SMITH", "62701", "2024-03-15", 25_000, "C00123456"),
            // Refund wipes out the donor-year.
            record("REFUNDED", "DONOR", "90210", "2024-04-01", 5_000, "C00123456"),
            {
                let mut refund =
                    record("REFUNDED", "DONOR", "90210", "2024-05-01", -5_000, "C00123456");
                refund.record_type = "24T".into();
                refund
            },
        ])
        .await
        .unwrap();

    PercentileAggregator::new(&store)
        .rebuild(&CancelFlag::new())
        .await
        .unwrap();

    let keys: Vec<String> =
        sqlx::query_scalar("SELECT donor_key FROM donor_year_totals WHERE year = 2024")
            .fetch_all(store.pool())
            .await
            .unwrap();
    assert_eq!(keys, vec!["john|smith|62701".to_string()]);
}

#[tokio::test]
async fn totals_are_partitioned_per_year() {
    let (_dir, store) = open_store().await;
    store
        .commit_batch(&[
            record("JOHN", "SMITH", "62701", "2023-03-15", 10_000, "C00123456"),
            record("JOHN", "SMITH", "62701", "2023-09-01", 5_000, "C00123456"),
            record("JOHN", "SMITH", "62701", "2024-01-02", 20_000, "C00123456"),
        ])
        .await
        .unwrap();

    PercentileAggregator::new(&store)
        .rebuild(&CancelFlag::new())
        .await
        .unwrap();

    let rows: Vec<(i64, i64, i64)> = sqlx::query_as(
        "SELECT year, total_cents, contribution_count
         FROM donor_year_totals WHERE donor_key = 'john|smith|62701' ORDER BY year",
    )
    .fetch_all(store.pool())
    .await
    .unwrap();
    assert_eq!(rows, vec![(2023, 15_000, 2), (2024, 20_000, 1)]);
}

#[tokio::test]
async fn rollups_cover_every_recipient_for_any_key_shape() {
    let (_dir, store) = open_store().await;
    // Keys landing in the pre-'A' range, several alphabetic ranges, and
    // past 'Z' (lowercase sorts after 'Z' in SQLite's binary collation).
    let records = vec![
        record("A", "ONE", "11111", "2025-01-10", 1_000, "0198233"),
        record("B", "TWO", "22222", "2025-01-11", 2_000, "ACME PAC"),
        record("C", "THREE", "33333", "2025-01-12", 3_000, "EDGEWATER"),
        record("D", "FOUR", "44444", "2025-01-13", 4_000, "MIDWAY FUND"),
        record("E", "FIVE", "55555", "2025-01-14", 5_000, "ZZ COMMITTEE"),
        record("F", "SIX", "66666", "2025-01-15", 6_000, "innovate-lower"),
    ];
    let expected_total: i64 = records.iter().map(|r| r.amount_cents).sum();
    store.commit_batch(&records).await.unwrap();

    let cutoff = NaiveDate::from_ymd_opt(2024, 8, 4).unwrap();
    let report = RecipientRollupBuilder::new(&store)
        .rebuild(cutoff, &CancelFlag::new())
        .await
        .unwrap();
    assert!(!report.is_partial());

    let (rollup_count, rollup_total): (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), COALESCE(SUM(lifetime_cents), 0) FROM recipient_rollups",
    )
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(rollup_count, 6);
    assert_eq!(rollup_total, expected_total);
}

#[tokio::test]
async fn rollup_window_and_contributor_stats() {
    let (_dir, store) = open_store().await;
    store
        .upsert_recipients(&[RecipientMeta {
            recipient_key: "C00123456".into(),
            name: "FRIENDS OF EXAMPLE".into(),
            kind: "Candidate".into(),
        }])
        .await
        .unwrap();
    store
        .commit_batch(&[
            record("JOHN", "SMITH", "62701", "2024-06-01", 10_000, "C00123456"),
            record("JOHN", "SMITH", "62701", "2025-06-01", 20_000, "C00123456"),
            record("MARIA", "GARCIA", "93701", "2025-07-01", 30_000, "C00123456"),
        ])
        .await
        .unwrap();

    let cutoff = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
    RecipientRollupBuilder::new(&store)
        .rebuild(cutoff, &CancelFlag::new())
        .await
        .unwrap();

    let row: (String, i64, i64, i64, i64, String, String, i64) = sqlx::query_as(
        "SELECT display_name, lifetime_count, lifetime_cents, recent_count, recent_cents,
                first_date, last_date, contributor_count
         FROM recipient_rollups WHERE recipient_key = 'C00123456'",
    )
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(row.0, "FRIENDS OF EXAMPLE");
    assert_eq!(row.1, 3);
    assert_eq!(row.2, 60_000);
    assert_eq!(row.3, 2);
    assert_eq!(row.4, 50_000);
    assert_eq!(row.5, "2024-06-01");
    assert_eq!(row.6, "2025-07-01");
    assert_eq!(row.7, 2);
}

#[tokio::test]
async fn search_projection_matches_display_name_tokens() {
    let (_dir, store) = open_store().await;
    store
        .upsert_recipients(&[RecipientMeta {
            recipient_key: "C00123456".into(),
            name: "FRIENDS OF EXAMPLE".into(),
            kind: "Candidate".into(),
        }])
        .await
        .unwrap();
    store
        .commit_batch(&[record("JOHN", "SMITH", "62701", "2025-06-01", 10_000, "C00123456")])
        .await
        .unwrap();

    let cutoff = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
    RecipientRollupBuilder::new(&store)
        .rebuild(cutoff, &CancelFlag::new())
        .await
        .unwrap();

    let keys: Vec<String> = sqlx::query_scalar(
        "SELECT recipient_key FROM recipient_rollups_fts WHERE recipient_rollups_fts MATCH ?",
    )
    .bind("friends")
    .fetch_all(store.pool())
    .await
    .unwrap();
    assert_eq!(keys, vec!["C00123456".to_string()]);
}

#[tokio::test]
async fn cancelled_run_leaves_live_tables_untouched() {
    let (_dir, store) = open_store().await;
    store
        .commit_batch(&[record("JOHN", "SMITH", "62701", "2024-03-15", 25_000, "C00123456")])
        .await
        .unwrap();
    PercentileAggregator::new(&store)
        .rebuild(&CancelFlag::new())
        .await
        .unwrap();
    let before: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM donor_year_totals")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert!(before > 0);

    // More data arrives, but the next run is cancelled before any partition.
    store
        .commit_batch(&[record("MARIA", "GARCIA", "93701", "2024-06-03", 150_000, "C00123456")])
        .await
        .unwrap();
    let cancel = CancelFlag::new();
    cancel.cancel();
    let report = PercentileAggregator::new(&store).rebuild(&cancel).await.unwrap();
    assert!(report.cancelled);
    assert!(report.completed_partitions.is_empty());

    let after: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM donor_year_totals")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(after, before);
}

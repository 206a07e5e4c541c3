//! Store-backed ingestion flows: idempotent re-runs, the dedup window
//! boundary, and provisional-key accounting.

use std::io::Cursor;

use chrono::NaiveDate;
use dfin_ingest::{DedupIndex, DedupWindow, Ingestor};
use dfin_sources::{california_jurisdiction, federal_jurisdiction};
use dfin_store::Store;
use tempfile::tempdir;

fn federal_row(name: &str, zip: &str, date: &str, amount: &str) -> String {
    let mut cols = vec![String::new(); 18];
    cols[0] = "C00999999".into();
    cols[7] = name.into();
    cols[8] = "SPRINGFIELD".into();
    cols[9] = "IL".into();
    cols[10] = zip.into();
    cols[13] = date.into();
    cols[14] = amount.into();
    cols[15] = "C00123456".into();
    cols[16] = "15".into();
    cols.join("|")
}

async fn open_store() -> (tempfile::TempDir, Store) {
    let dir = tempdir().unwrap();
    let store = Store::open(&dir.path().join("contributions.db")).await.unwrap();
    (dir, store)
}

fn window() -> DedupWindow {
    DedupWindow::trailing_days(NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(), 365)
}

#[tokio::test]
async fn reingesting_the_same_file_adds_nothing() {
    let (_dir, store) = open_store().await;
    let jurisdiction = federal_jurisdiction();
    let file = [
        federal_row("SMITH, JOHN", "62701", "03152025", "250.00"),
        federal_row("GARCIA, MARIA", "93701", "04012025", "1500"),
        federal_row("NG, WEI", "10001", "04022025", "75.50"),
    ]
    .join("\n");

    let ingestor = Ingestor::new(&store).with_batch_size(2);
    let mut dedup = DedupIndex::rebuild(&store, window()).await.unwrap();
    let first = ingestor
        .ingest(Cursor::new(file.clone()), &jurisdiction.layout, &mut dedup, "cycle-2025")
        .await
        .unwrap();
    assert_eq!(first.counts.new, 3);
    assert_eq!(first.counts.duplicate, 0);
    assert_eq!(first.counts.error, 0);
    assert_eq!(first.counts.batches_committed, 2);
    assert_eq!(store.contribution_count().await.unwrap(), 3);

    // Fresh index rebuilt from the store, as a new process would do.
    let mut dedup = DedupIndex::rebuild(&store, window()).await.unwrap();
    assert_eq!(dedup.len(), 3);
    let second = ingestor
        .ingest(Cursor::new(file), &jurisdiction.layout, &mut dedup, "cycle-2025")
        .await
        .unwrap();
    assert_eq!(second.counts.new, 0);
    assert_eq!(second.counts.duplicate, 3);
    assert_eq!(store.contribution_count().await.unwrap(), 3);
}

#[tokio::test]
async fn second_file_with_one_overlap_counts_one_duplicate() {
    let (_dir, store) = open_store().await;
    let jurisdiction = federal_jurisdiction();
    let ingestor = Ingestor::new(&store);

    let first_file = [
        federal_row("SMITH, JOHN", "62701", "03152025", "250.00"),
        federal_row("GARCIA, MARIA", "93701", "04012025", "1500"),
    ]
    .join("\n");
    let mut dedup = DedupIndex::rebuild(&store, window()).await.unwrap();
    ingestor
        .ingest(Cursor::new(first_file), &jurisdiction.layout, &mut dedup, "file-1")
        .await
        .unwrap();

    // One row identical in normalized content, one genuinely new.
    let second_file = [
        federal_row("SMITH, JOHN", "62701", "03152025", "250.00"),
        federal_row("OKAFOR, ADA", "30301", "05052025", "900"),
    ]
    .join("\n");
    let mut dedup = DedupIndex::rebuild(&store, window()).await.unwrap();
    let summary = ingestor
        .ingest(Cursor::new(second_file), &jurisdiction.layout, &mut dedup, "file-2")
        .await
        .unwrap();
    assert_eq!(summary.counts.new, 1);
    assert_eq!(summary.counts.duplicate, 1);
    assert_eq!(store.contribution_count().await.unwrap(), 3);
}

#[tokio::test]
async fn content_identical_record_outside_window_is_accepted_as_new() {
    let (_dir, store) = open_store().await;
    let jurisdiction = federal_jurisdiction();
    let ingestor = Ingestor::new(&store);

    // Committed ~400 days before the window reference date of 2025-06-01.
    let old_row = federal_row("SMITH, JOHN", "62701", "04252024", "250.00");
    let mut dedup = DedupIndex::rebuild(&store, window()).await.unwrap();
    ingestor
        .ingest(Cursor::new(old_row.clone()), &jurisdiction.layout, &mut dedup, "old")
        .await
        .unwrap();
    assert_eq!(store.contribution_count().await.unwrap(), 1);

    // A rebuilt 365-day index no longer covers it, so the identical row is
    // accepted again. Expected, not a defect.
    let mut dedup = DedupIndex::rebuild(&store, window()).await.unwrap();
    assert_eq!(dedup.len(), 0);
    let summary = ingestor
        .ingest(Cursor::new(old_row), &jurisdiction.layout, &mut dedup, "old-again")
        .await
        .unwrap();
    assert_eq!(summary.counts.new, 1);
    assert_eq!(summary.counts.duplicate, 0);
    assert_eq!(store.contribution_count().await.unwrap(), 2);
}

#[tokio::test]
async fn rejected_rows_count_as_errors_and_do_not_stop_the_stream() {
    let (_dir, store) = open_store().await;
    let jurisdiction = federal_jurisdiction();
    let ingestor = Ingestor::new(&store);

    let file = [
        federal_row("SMITH, JOHN", "62701", "03152025", "250.00"),
        federal_row("BADDATE, AMY", "62701", "0315202", "10"),
        federal_row("FREE, RIDER", "62701", "03152025", "-5"),
        federal_row("GARCIA, MARIA", "93701", "04012025", "1500"),
    ]
    .join("\n");
    let mut dedup = DedupIndex::rebuild(&store, window()).await.unwrap();
    let summary = ingestor
        .ingest(Cursor::new(file), &jurisdiction.layout, &mut dedup, "mixed")
        .await
        .unwrap();
    assert_eq!(summary.counts.new, 2);
    assert_eq!(summary.counts.error, 2);
    assert_eq!(store.contribution_count().await.unwrap(), 2);
}

#[tokio::test]
async fn provisional_recipient_keys_are_counted_and_stored() {
    let (_dir, store) = open_store().await;
    let jurisdiction = california_jurisdiction();
    let ingestor = Ingestor::new(&store);

    let header = "FILING_ID\tAMEND_ID\tREC_TYPE\tENTITY_CD\tCTRIB_NAML\tCTRIB_NAMF\tCTRIB_CITY\tCTRIB_ST\tCTRIB_ZIP4\tCTRIB_EMP\tCTRIB_OCC\tRCPT_DATE\tAMOUNT\tCMTE_ID\tTRAN_ID";
    let resolved = "1789555\t0\tRCPT\tIND\tGARCIA\tMARIA\tFRESNO\tCA\t93701\tSELF\tFARMER\t6/3/2025\t1500\tC00222222\tT100";
    let provisional = "1789556\t0\tRCPT\tIND\tLOPEZ\tJUAN\tFRESNO\tCA\t93702\t\t\t6/4/2025\t200\t\tT101";
    let skipped_org = "1789557\t0\tRCPT\tORG\tMEGACORP\t\tFRESNO\tCA\t93703\t\t\t6/5/2025\t5000\tC00333333\tT102";
    let file = [header, resolved, provisional, skipped_org].join("\n");

    let mut dedup = DedupIndex::rebuild(&store, window()).await.unwrap();
    let summary = ingestor
        .ingest(Cursor::new(file), &jurisdiction.layout, &mut dedup, "ca-receipts")
        .await
        .unwrap();
    assert_eq!(summary.counts.new, 2);
    assert_eq!(summary.counts.provisional, 1);
    assert_eq!(summary.counts.filtered, 1);
    assert_eq!(store.provisional_key_count().await.unwrap(), 1);
}

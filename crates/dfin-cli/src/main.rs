use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use dfin_aggregate::{AggregateReport, CancelFlag, PercentileAggregator, RecipientRollupBuilder};
use dfin_ingest::{DedupIndex, DedupWindow, Ingestor};
use dfin_query::{
    PageRequest, PersonFilters, PersonSearch, PersonSort, QueryConfig, RecipientSort, Resolver,
};
use dfin_sources::{JurisdictionConfig, JurisdictionRegistry, RecipientNormalizer, SourceLines};
use dfin_store::{RecipientMeta, Store};
use tracing::warn;

#[derive(Debug, Parser)]
#[command(name = "dfin")]
#[command(about = "Donation Finder ingestion, aggregation and search")]
struct Cli {
    /// Database file. Falls back to $DFIN_DB, then ./dfin_contributions.db.
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Jurisdiction registry YAML. Built-in federal/california when omitted.
    #[arg(long, global = true)]
    registry: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the database schema and secondary indexes.
    Migrate,
    /// Ingest one delimited export, skipping duplicates inside the window.
    Ingest {
        file: PathBuf,
        #[arg(long, default_value = "federal")]
        jurisdiction: String,
        /// Source label recorded on completion; defaults to the file name.
        #[arg(long)]
        label: Option<String>,
        /// Dedup window length in days.
        #[arg(long, default_value_t = 365)]
        window_days: u64,
        /// Use the current-and-prior-calendar-year window instead.
        #[arg(long)]
        calendar_window: bool,
        #[arg(long, default_value_t = dfin_ingest::DEFAULT_BATCH_SIZE)]
        batch_size: usize,
        /// Re-ingest even if this label was already processed.
        #[arg(long)]
        force: bool,
        #[arg(long)]
        json: bool,
    },
    /// Load recipient/committee metadata into the recipients table.
    LoadRecipients {
        file: PathBuf,
        #[arg(long, default_value = "federal")]
        jurisdiction: String,
    },
    /// Rebuild donor year totals and percentile thresholds.
    BuildPercentiles {
        #[arg(long)]
        json: bool,
    },
    /// Rebuild recipient rollups and the fuzzy-search projection.
    BuildRollups {
        #[arg(long)]
        json: bool,
    },
    /// Cascading person search.
    SearchPerson {
        #[arg(long)]
        first_name: Option<String>,
        #[arg(long)]
        last_name: Option<String>,
        #[arg(long)]
        city: Option<String>,
        #[arg(long)]
        state: Option<String>,
        #[arg(long)]
        postal_code: Option<String>,
        #[arg(long)]
        year: Option<i32>,
        #[arg(long, default_value = "federal")]
        jurisdiction: String,
        #[arg(long)]
        sort_by: Option<String>,
        #[arg(long)]
        order: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: i64,
        #[arg(long)]
        json: bool,
    },
    /// Fuzzy recipient search over the rollup projection.
    SearchRecipients {
        query: String,
        #[arg(long)]
        sort: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: i64,
        #[arg(long)]
        json: bool,
    },
    /// Rank and percentile for one donor in every year they appear.
    DonorStanding {
        first_name: String,
        last_name: String,
        zip_code: String,
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let db_path = cli
        .db
        .clone()
        .or_else(|| std::env::var("DFIN_DB").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("dfin_contributions.db"));
    let registry = load_registry(cli.registry.as_deref())?;

    match cli.command {
        Commands::Migrate => {
            let store = Store::open(&db_path).await?;
            store.create_indexes().await?;
            println!("schema ready at {}", db_path.display());
        }
        Commands::Ingest {
            file,
            jurisdiction,
            label,
            window_days,
            calendar_window,
            batch_size,
            force,
            json,
        } => {
            let jurisdiction = lookup(&registry, &jurisdiction)?;
            let store = Store::open(&db_path).await?;
            let label = label.unwrap_or_else(|| {
                file.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| file.display().to_string())
            });
            if !force && store.is_source_processed(&label).await? {
                println!("skipping {label}: already processed (use --force to re-ingest)");
                return Ok(());
            }

            let today = Utc::now().date_naive();
            let window = if calendar_window {
                DedupWindow::calendar_years(today)
            } else {
                DedupWindow::trailing_days(today, window_days)
            };
            let mut dedup = DedupIndex::rebuild(&store, window).await?;
            let summary = Ingestor::new(&store)
                .with_batch_size(batch_size)
                .ingest_path(&file, &jurisdiction.layout, &mut dedup, &label)
                .await?;
            store.create_indexes().await?;
            store
                .mark_source_processed(&label, &Utc::now().to_rfc3339())
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "ingest complete: new={} duplicate={} error={} filtered={} provisional={} batches={}",
                    summary.counts.new,
                    summary.counts.duplicate,
                    summary.counts.error,
                    summary.counts.filtered,
                    summary.counts.provisional,
                    summary.counts.batches_committed,
                );
            }
        }
        Commands::LoadRecipients { file, jurisdiction } => {
            let jurisdiction = lookup(&registry, &jurisdiction)?;
            let Some(layout) = &jurisdiction.recipient_layout else {
                bail!("jurisdiction {} has no recipient metadata layout", jurisdiction.layout.id);
            };
            let store = Store::open(&db_path).await?;
            let loaded = load_recipients(&store, &file, layout).await?;
            println!("loaded {loaded} recipients from {}", file.display());
        }
        Commands::BuildPercentiles { json } => {
            let store = Store::open(&db_path).await?;
            let cancel = cancel_on_ctrl_c();
            let report = PercentileAggregator::new(&store).rebuild(&cancel).await?;
            finish_aggregate(report, json)?;
        }
        Commands::BuildRollups { json } => {
            let store = Store::open(&db_path).await?;
            let cancel = cancel_on_ctrl_c();
            let cutoff = RecipientRollupBuilder::default_recent_cutoff(Utc::now().date_naive());
            let report = RecipientRollupBuilder::new(&store).rebuild(cutoff, &cancel).await?;
            finish_aggregate(report, json)?;
        }
        Commands::SearchPerson {
            first_name,
            last_name,
            city,
            state,
            postal_code,
            year,
            jurisdiction,
            sort_by,
            order,
            page,
            json,
        } => {
            let jurisdiction = lookup(&registry, &jurisdiction)?;
            let store = Store::open(&db_path).await?;
            let config = QueryConfig {
                conduit_exclusions: jurisdiction.conduit_exclusions.clone(),
                ..Default::default()
            };
            let resolver = Resolver::new(&store, config);
            let filters = PersonFilters {
                first_name,
                last_name,
                city,
                state,
                postal_code,
                year,
            };
            let sort = PersonSort::from_params(sort_by.as_deref(), order.as_deref());
            let outcome = resolver
                .search_person(&filters, sort, PageRequest::new(page, dfin_query::DEFAULT_PAGE_SIZE))
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
                return Ok(());
            }
            match outcome {
                PersonSearch::Found(found) => {
                    println!(
                        "{} matches at level \"{}\" (page {} of {})",
                        found.total_count,
                        found.level.describe(),
                        page,
                        found.total_pages,
                    );
                    for row in &found.rows {
                        println!(
                            "{} {} {} -> {} ({}) ${}.{:02} [{} {} {}]",
                            row.contribution_date,
                            row.first_name,
                            row.last_name,
                            row.recipient_display_name,
                            dfin_query::committee_category(&row.recipient_kind),
                            row.amount_cents / 100,
                            row.amount_cents % 100,
                            row.city,
                            row.state,
                            row.zip_code,
                        );
                    }
                }
                PersonSearch::NoResults(report) => println!("{}", report.message),
            }
        }
        Commands::SearchRecipients { query, sort, page, json } => {
            let store = Store::open(&db_path).await?;
            let resolver = Resolver::new(&store, QueryConfig::default());
            let sort = RecipientSort::from_param(sort.as_deref());
            let result = resolver
                .search_recipients(&query, sort, PageRequest::new(page, dfin_query::DEFAULT_PAGE_SIZE))
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
                return Ok(());
            }
            println!(
                "{} recipients{} (page {} of {})",
                result.total_count,
                if result.used_substring_fallback {
                    " via substring fallback"
                } else {
                    ""
                },
                page,
                result.total_pages,
            );
            for row in &result.rows {
                println!(
                    "{} | {} | lifetime {} (${}.{:02}) | recent {} (${}.{:02})",
                    row.recipient_key,
                    row.display_name,
                    row.lifetime_count,
                    row.lifetime_cents / 100,
                    row.lifetime_cents % 100,
                    row.recent_count,
                    row.recent_cents / 100,
                    row.recent_cents % 100,
                );
            }
        }
        Commands::DonorStanding {
            first_name,
            last_name,
            zip_code,
            json,
        } => {
            let store = Store::open(&db_path).await?;
            let resolver = Resolver::new(&store, QueryConfig::default());
            let standings = resolver
                .donor_percentiles(&first_name, &last_name, &zip_code)
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&standings)?);
                return Ok(());
            }
            if standings.is_empty() {
                println!("no donor-year totals for {first_name} {last_name} {zip_code}");
                return Ok(());
            }
            for standing in &standings {
                println!(
                    "{}: ${}.{:02} across {} contributions, rank {} of {} ({:.1} percentile)",
                    standing.year,
                    standing.total_cents / 100,
                    standing.total_cents % 100,
                    standing.contribution_count,
                    standing.rank,
                    standing.total_donors,
                    standing.percentile,
                );
            }
        }
    }

    Ok(())
}

fn load_registry(path: Option<&Path>) -> Result<JurisdictionRegistry> {
    match path {
        Some(path) => JurisdictionRegistry::from_yaml_file(path),
        None => Ok(JurisdictionRegistry::builtin()),
    }
}

fn lookup<'a>(registry: &'a JurisdictionRegistry, id: &str) -> Result<&'a JurisdictionConfig> {
    registry
        .get(id)
        .with_context(|| format!("unknown jurisdiction {id:?}"))
}

fn cancel_on_ctrl_c() -> CancelFlag {
    let flag = CancelFlag::new();
    let handle = flag.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("stop requested; finishing the current partition");
            handle.cancel();
        }
    });
    flag
}

fn finish_aggregate(report: AggregateReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{}: {} rows across {} partitions ({} failed{})",
            report.job,
            report.rows_written,
            report.completed_partitions.len(),
            report.failed_partitions.len(),
            if report.cancelled { ", cancelled" } else { "" },
        );
    }
    if report.cancelled {
        println!("cancelled before completion; live tables were left untouched");
        return Ok(());
    }
    if !report.failed_partitions.is_empty() {
        for failure in &report.failed_partitions {
            eprintln!("partition {} failed: {}", failure.partition, failure.error);
        }
        bail!("{} aggregation partitions failed; retry the run", report.failed_partitions.len());
    }
    Ok(())
}

async fn load_recipients(
    store: &Store,
    file: &Path,
    layout: &dfin_sources::RecipientLayout,
) -> Result<u64> {
    let reader = dfin_sources::open_source_reader(file)?;
    let mut normalizer = RecipientNormalizer::new(layout);
    let mut batch: Vec<RecipientMeta> = Vec::with_capacity(1_000);
    let mut loaded = 0u64;

    for line in SourceLines::new(reader) {
        let line = line.with_context(|| format!("reading {}", file.display()))?;
        if normalizer.needs_header() {
            normalizer.bind_header(&line);
            continue;
        }
        if line.is_empty() {
            continue;
        }
        let Some(row) = normalizer.normalize(&line)? else {
            continue;
        };
        batch.push(RecipientMeta {
            recipient_key: row.key,
            name: row.name,
            kind: row.kind,
        });
        if batch.len() >= 1_000 {
            loaded += batch.len() as u64;
            store.upsert_recipients(&batch).await?;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        loaded += batch.len() as u64;
        store.upsert_recipients(&batch).await?;
    }
    Ok(loaded)
}

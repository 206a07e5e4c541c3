//! Read-side query surface: the cascading person-search resolver, recipient
//! fuzzy search, and per-donor percentile lookup.
//!
//! The resolver walks a fixed ladder of relaxation levels, executing the
//! most specific query first and dropping filters in a fixed precedence
//! order until something matches. The filter set applied at level N is a
//! pure function of the original filters and N; no state carries between
//! attempts. Exhausting every level yields a structured report naming the
//! original filters and each level tried, never a bare empty list.

use dfin_core::{donor_key, fold, zip5};
use dfin_store::Store;
use serde::Serialize;
use sqlx::Row;
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "dfin-query";

pub const DEFAULT_PAGE_SIZE: i64 = 25;
/// Cap on candidates pulled for the substring fallback before in-memory
/// ranking and pagination.
const FALLBACK_CANDIDATE_CAP: i64 = 500;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("no search filters were provided")]
    NoFilters,
}

/// Per-jurisdiction read-side knobs: passthrough committees excluded from
/// person search, and the page size.
#[derive(Debug, Clone)]
pub struct QueryConfig {
    pub conduit_exclusions: Vec<String>,
    pub page_size: i64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            conduit_exclusions: Vec::new(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

// ---------------------------------------------------------------------------
// Person search

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PersonFilters {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub year: Option<i32>,
}

impl PersonFilters {
    /// Canonical comparison form: trimmed, uppercased, empties dropped,
    /// years outside a plausible four-digit range cleared.
    pub fn normalized(&self) -> Self {
        let clean = |v: &Option<String>| {
            v.as_deref()
                .map(fold)
                .filter(|s| !s.is_empty())
        };
        Self {
            first_name: clean(&self.first_name),
            last_name: clean(&self.last_name),
            city: clean(&self.city),
            state: clean(&self.state),
            postal_code: clean(&self.postal_code),
            year: self.year.filter(|y| (1000..=9999).contains(y)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.first_name.is_none()
            && self.last_name.is_none()
            && self.city.is_none()
            && self.state.is_none()
            && self.postal_code.is_none()
            && self.year.is_none()
    }

    /// Human-readable description of the supplied filters, for the
    /// no-results report.
    pub fn describe(&self) -> Vec<String> {
        let mut parts = Vec::new();
        if let Some(v) = &self.first_name {
            parts.push(format!("first name {v}"));
        }
        if let Some(v) = &self.last_name {
            parts.push(format!("last name {v}"));
        }
        if let Some(v) = &self.city {
            parts.push(format!("city {v}"));
        }
        if let Some(v) = &self.state {
            parts.push(format!("state {v}"));
        }
        if let Some(v) = &self.postal_code {
            parts.push(format!("postal code {v}"));
        }
        if let Some(v) = &self.year {
            parts.push(format!("year {v}"));
        }
        parts
    }
}

/// One step of the resolver's fixed relaxation ladder. State and year, when
/// supplied, are never dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RelaxationLevel {
    AllFilters,
    DroppedPostalCode,
    DroppedCityAndPostalCode,
}

impl RelaxationLevel {
    pub fn describe(&self) -> &'static str {
        match self {
            RelaxationLevel::AllFilters => "all filters",
            RelaxationLevel::DroppedPostalCode => "dropped postal code",
            RelaxationLevel::DroppedCityAndPostalCode => "dropped city and postal code",
        }
    }
}

/// Ladder of levels for this filter set. A level exists only if it would
/// actually drop something the caller supplied.
pub fn relaxation_plan(filters: &PersonFilters) -> Vec<RelaxationLevel> {
    let mut plan = vec![RelaxationLevel::AllFilters];
    if filters.postal_code.is_some() {
        plan.push(RelaxationLevel::DroppedPostalCode);
    }
    if filters.city.is_some() {
        plan.push(RelaxationLevel::DroppedCityAndPostalCode);
    }
    plan
}

/// The filter set actually applied at `level`. Pure: reproducible from the
/// original filters and the level alone.
pub fn filters_at_level(filters: &PersonFilters, level: RelaxationLevel) -> PersonFilters {
    let mut applied = filters.clone();
    match level {
        RelaxationLevel::AllFilters => {}
        RelaxationLevel::DroppedPostalCode => {
            applied.postal_code = None;
        }
        RelaxationLevel::DroppedCityAndPostalCode => {
            applied.postal_code = None;
            applied.city = None;
        }
    }
    applied
}

/// Allow-listed sort columns for person search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PersonSortColumn {
    Date,
    Amount,
}

impl PersonSortColumn {
    fn as_sql(self) -> &'static str {
        match self {
            PersonSortColumn::Date => "c.contribution_date",
            PersonSortColumn::Amount => "c.amount_cents",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    fn as_sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PersonSort {
    pub column: PersonSortColumn,
    pub direction: SortDirection,
}

impl Default for PersonSort {
    fn default() -> Self {
        Self {
            column: PersonSortColumn::Date,
            direction: SortDirection::Desc,
        }
    }
}

impl PersonSort {
    /// Unrecognized values fall back to the default rather than erroring.
    pub fn from_params(column: Option<&str>, direction: Option<&str>) -> Self {
        let column = match column {
            Some("amount") => PersonSortColumn::Amount,
            Some("contribution_date") | Some("date") => PersonSortColumn::Date,
            _ => PersonSortColumn::Date,
        };
        let direction = match direction {
            Some("asc") => SortDirection::Asc,
            Some("desc") => SortDirection::Desc,
            _ => SortDirection::Desc,
        };
        Self { column, direction }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// 1-based page number.
    pub page: i64,
    pub per_page: i64,
}

impl PageRequest {
    pub fn new(page: i64, per_page: i64) -> Self {
        Self {
            page: page.max(1),
            per_page: per_page.max(1),
        }
    }

    fn offset(&self) -> i64 {
        (self.page - 1) * self.per_page
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PersonSearchRow {
    pub first_name: String,
    pub last_name: String,
    pub contribution_date: String,
    pub recipient_key: String,
    pub recipient_display_name: String,
    pub recipient_kind: String,
    pub amount_cents: i64,
    pub city: String,
    pub state: String,
    pub zip_code: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PersonSearchOutcome {
    pub rows: Vec<PersonSearchRow>,
    pub total_count: i64,
    pub total_pages: i64,
    /// The level whose filters produced these results.
    pub level: RelaxationLevel,
    pub attempted: Vec<RelaxationLevel>,
    pub effective_filters: PersonFilters,
}

/// Structured explanation when every relaxation level came back empty.
#[derive(Debug, Clone, Serialize)]
pub struct NoResultsReport {
    pub filters: PersonFilters,
    pub attempted: Vec<RelaxationLevel>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub enum PersonSearch {
    Found(PersonSearchOutcome),
    NoResults(NoResultsReport),
}

/// Ordered predicate list for one filter set, consumed by the count and
/// data queries alike.
fn build_person_where(filters: &PersonFilters, exclusions: &[String]) -> (String, Vec<String>) {
    let mut clauses = Vec::new();
    let mut params = Vec::new();

    if !exclusions.is_empty() {
        let placeholders = vec!["?"; exclusions.len()].join(", ");
        clauses.push(format!("c.recipient_key NOT IN ({placeholders})"));
        params.extend(exclusions.iter().cloned());
    }
    if let Some(v) = &filters.first_name {
        clauses.push("c.first_name = ?".to_string());
        params.push(v.clone());
    }
    if let Some(v) = &filters.last_name {
        clauses.push("c.last_name = ?".to_string());
        params.push(v.clone());
    }
    if let Some(v) = &filters.postal_code {
        clauses.push("c.zip_code LIKE ?".to_string());
        params.push(format!("{v}%"));
    }
    if let Some(v) = &filters.city {
        clauses.push("c.city = ?".to_string());
        params.push(v.clone());
    }
    if let Some(v) = &filters.state {
        clauses.push("c.state = ?".to_string());
        params.push(v.clone());
    }
    if let Some(year) = filters.year {
        clauses.push("c.contribution_date >= ? AND c.contribution_date <= ?".to_string());
        params.push(format!("{year:04}-01-01"));
        params.push(format!("{year:04}-12-31"));
    }

    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    (where_clause, params)
}

// ---------------------------------------------------------------------------
// Recipient search

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecipientSort {
    RecentActivity,
    TotalActivity,
    Alphabetical,
    /// Jaro-Winkler similarity to the query; only changes the ordering on
    /// the substring fallback, where the index gave no token match.
    BestMatch,
}

impl RecipientSort {
    pub fn from_param(value: Option<&str>) -> Self {
        match value {
            Some("total_activity") => RecipientSort::TotalActivity,
            Some("alphabetical") => RecipientSort::Alphabetical,
            Some("best_match") => RecipientSort::BestMatch,
            _ => RecipientSort::RecentActivity,
        }
    }

    fn as_sql(self) -> &'static str {
        match self {
            RecipientSort::RecentActivity | RecipientSort::BestMatch => {
                "r.recent_count DESC, r.recent_cents DESC, r.lifetime_count DESC"
            }
            RecipientSort::TotalActivity => {
                "r.lifetime_count DESC, r.lifetime_cents DESC, r.recent_count DESC"
            }
            RecipientSort::Alphabetical => "r.display_name ASC",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecipientSearchRow {
    pub recipient_key: String,
    pub display_name: String,
    pub kind: String,
    pub lifetime_count: i64,
    pub lifetime_cents: i64,
    pub recent_count: i64,
    pub recent_cents: i64,
    pub last_date: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecipientSearchPage {
    pub rows: Vec<RecipientSearchRow>,
    pub total_count: i64,
    pub total_pages: i64,
    /// True when the token index had no match and substring matching was
    /// used instead.
    pub used_substring_fallback: bool,
}

/// Reduce free text to lowercase alphanumeric tokens, both for safe FTS
/// MATCH queries and for similarity ranking.
pub fn normalize_query_fragment(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Donor standing

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DonorYearStanding {
    pub year: i64,
    pub total_cents: i64,
    pub contribution_count: i64,
    /// 1 + donors strictly above this total in the year.
    pub rank: i64,
    /// `100 * (total_donors - (rank - 1)) / total_donors`.
    pub percentile: f64,
    pub total_donors: i64,
}

// ---------------------------------------------------------------------------
// Resolver

pub struct Resolver<'a> {
    store: &'a Store,
    config: QueryConfig,
}

impl<'a> Resolver<'a> {
    pub fn new(store: &'a Store, config: QueryConfig) -> Self {
        Self { store, config }
    }

    /// Execute the cascading person search: most specific level first,
    /// stopping at the first level with any match; count and page queries
    /// share the level's filter set.
    pub async fn search_person(
        &self,
        filters: &PersonFilters,
        sort: PersonSort,
        page: PageRequest,
    ) -> Result<PersonSearch, QueryError> {
        let filters = filters.normalized();
        if filters.is_empty() {
            return Err(QueryError::NoFilters);
        }

        let plan = relaxation_plan(&filters);
        let mut attempted = Vec::with_capacity(plan.len());
        for level in &plan {
            attempted.push(*level);
            let effective = filters_at_level(&filters, *level);
            let (where_clause, params) =
                build_person_where(&effective, &self.config.conduit_exclusions);

            let count_sql = format!("SELECT COUNT(*) FROM contributions c {where_clause}");
            let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
            for param in &params {
                count_query = count_query.bind(param);
            }
            let total_count = count_query.fetch_one(self.store.pool()).await?;
            debug!(level = level.describe(), total_count, "cascade attempt");
            if total_count == 0 {
                continue;
            }

            let data_sql = format!(
                "SELECT c.first_name, c.last_name, c.contribution_date,
                        c.recipient_key,
                        COALESCE(m.name, c.recipient_key) AS recipient_display_name,
                        COALESCE(m.kind, '') AS recipient_kind,
                        c.amount_cents, c.city, c.state, c.zip_code
                 FROM contributions c
                 LEFT JOIN recipients m ON c.recipient_key = m.recipient_key
                 {where_clause}
                 ORDER BY {} {}
                 LIMIT ? OFFSET ?",
                sort.column.as_sql(),
                sort.direction.as_sql(),
            );
            let mut data_query = sqlx::query(&data_sql);
            for param in &params {
                data_query = data_query.bind(param);
            }
            data_query = data_query.bind(page.per_page).bind(page.offset());

            let rows = data_query.fetch_all(self.store.pool()).await?;
            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                out.push(PersonSearchRow {
                    first_name: row.try_get("first_name")?,
                    last_name: row.try_get("last_name")?,
                    contribution_date: row.try_get("contribution_date")?,
                    recipient_key: row.try_get("recipient_key")?,
                    recipient_display_name: row.try_get("recipient_display_name")?,
                    recipient_kind: row.try_get("recipient_kind")?,
                    amount_cents: row.try_get("amount_cents")?,
                    city: row.try_get("city")?,
                    state: row.try_get("state")?,
                    zip_code: row.try_get("zip_code")?,
                });
            }

            return Ok(PersonSearch::Found(PersonSearchOutcome {
                rows: out,
                total_count,
                total_pages: pages_for(total_count, page.per_page),
                level: *level,
                attempted,
                effective_filters: effective,
            }));
        }

        let described = filters.describe().join(", ");
        let levels = attempted
            .iter()
            .map(|l| l.describe())
            .collect::<Vec<_>>()
            .join("; ");
        Ok(PersonSearch::NoResults(NoResultsReport {
            message: format!("no contributions matched {described} (levels tried: {levels})"),
            filters,
            attempted,
        }))
    }

    /// Fuzzy recipient search over the rollup projection: token index
    /// first, substring fallback when the index has no match.
    pub async fn search_recipients(
        &self,
        query: &str,
        sort: RecipientSort,
        page: PageRequest,
    ) -> Result<RecipientSearchPage, QueryError> {
        let fts_query = normalize_query_fragment(query);
        if fts_query.is_empty() {
            return Ok(RecipientSearchPage {
                rows: Vec::new(),
                total_count: 0,
                total_pages: 0,
                used_substring_fallback: false,
            });
        }

        let fts_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*)
             FROM recipient_rollups_fts f
             JOIN recipient_rollups r ON f.recipient_key = r.recipient_key
             WHERE f.display_name MATCH ?",
        )
        .bind(&fts_query)
        .fetch_one(self.store.pool())
        .await?;

        if fts_count > 0 {
            let sql = format!(
                "SELECT r.recipient_key, r.display_name, r.kind,
                        r.lifetime_count, r.lifetime_cents,
                        r.recent_count, r.recent_cents, r.last_date
                 FROM recipient_rollups_fts f
                 JOIN recipient_rollups r ON f.recipient_key = r.recipient_key
                 WHERE f.display_name MATCH ?
                 ORDER BY {}
                 LIMIT ? OFFSET ?",
                sort.as_sql()
            );
            let rows = sqlx::query(&sql)
                .bind(&fts_query)
                .bind(page.per_page)
                .bind(page.offset())
                .fetch_all(self.store.pool())
                .await?;
            return Ok(RecipientSearchPage {
                rows: recipient_rows(rows)?,
                total_count: fts_count,
                total_pages: pages_for(fts_count, page.per_page),
                used_substring_fallback: false,
            });
        }

        // Substring fallback over a capped candidate set; pagination happens
        // in memory so best-match ranking can reorder the whole set.
        let like = format!("%{}%", query.trim());
        let rows = sqlx::query(
            "SELECT r.recipient_key, r.display_name, r.kind,
                    r.lifetime_count, r.lifetime_cents,
                    r.recent_count, r.recent_cents, r.last_date
             FROM recipient_rollups r
             WHERE r.display_name LIKE ? OR r.recipient_key LIKE ?
             ORDER BY r.recent_count DESC, r.recent_cents DESC, r.lifetime_count DESC
             LIMIT ?",
        )
        .bind(&like)
        .bind(&like)
        .bind(FALLBACK_CANDIDATE_CAP)
        .fetch_all(self.store.pool())
        .await?;
        let mut candidates = recipient_rows(rows)?;

        match sort {
            RecipientSort::BestMatch => {
                let target = normalize_query_fragment(query);
                candidates.sort_by(|a, b| {
                    let score_a = jaro_winkler(&normalize_query_fragment(&a.display_name), &target);
                    let score_b = jaro_winkler(&normalize_query_fragment(&b.display_name), &target);
                    score_b
                        .partial_cmp(&score_a)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            }
            RecipientSort::Alphabetical => {
                candidates.sort_by(|a, b| a.display_name.cmp(&b.display_name));
            }
            RecipientSort::TotalActivity => {
                candidates.sort_by(|a, b| {
                    (b.lifetime_count, b.lifetime_cents, b.recent_count).cmp(&(
                        a.lifetime_count,
                        a.lifetime_cents,
                        a.recent_count,
                    ))
                });
            }
            RecipientSort::RecentActivity => {}
        }

        let total_count = candidates.len() as i64;
        let start = (page.offset() as usize).min(candidates.len());
        let end = (start + page.per_page as usize).min(candidates.len());
        Ok(RecipientSearchPage {
            rows: candidates[start..end].to_vec(),
            total_pages: pages_for(total_count, page.per_page),
            total_count,
            used_substring_fallback: true,
        })
    }

    /// Rank and percentile for one donor in every year they appear,
    /// computed against the rebuilt donor-year totals.
    pub async fn donor_percentiles(
        &self,
        first_name: &str,
        last_name: &str,
        zip_code: &str,
    ) -> Result<Vec<DonorYearStanding>, QueryError> {
        let zip_code = fold(zip_code);
        if zip5(&zip_code).len() < 5 {
            return Ok(Vec::new());
        }
        let key = donor_key(&fold(first_name), &fold(last_name), &zip_code);

        let donor_years: Vec<(i64, i64, i64)> = sqlx::query_as(
            "SELECT year, total_cents, contribution_count
             FROM donor_year_totals
             WHERE donor_key = ?
             ORDER BY year DESC",
        )
        .bind(&key)
        .fetch_all(self.store.pool())
        .await?;

        let mut standings = Vec::with_capacity(donor_years.len());
        for (year, total_cents, contribution_count) in donor_years {
            let donors_above: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM donor_year_totals WHERE year = ? AND total_cents > ?",
            )
            .bind(year)
            .bind(total_cents)
            .fetch_one(self.store.pool())
            .await?;
            let total_donors: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM donor_year_totals WHERE year = ?")
                    .bind(year)
                    .fetch_one(self.store.pool())
                    .await?;
            if total_donors == 0 {
                continue;
            }
            standings.push(DonorYearStanding {
                year,
                total_cents,
                contribution_count,
                rank: donors_above + 1,
                percentile: 100.0 * (total_donors - donors_above) as f64 / total_donors as f64,
                total_donors,
            });
        }
        Ok(standings)
    }
}

fn recipient_rows(
    rows: Vec<sqlx::sqlite::SqliteRow>,
) -> Result<Vec<RecipientSearchRow>, QueryError> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(RecipientSearchRow {
            recipient_key: row.try_get("recipient_key")?,
            display_name: row.try_get("display_name")?,
            kind: row.try_get("kind")?,
            lifetime_count: row.try_get("lifetime_count")?,
            lifetime_cents: row.try_get("lifetime_cents")?,
            recent_count: row.try_get("recent_count")?,
            recent_cents: row.try_get("recent_cents")?,
            last_date: row.try_get("last_date")?,
        });
    }
    Ok(out)
}

fn pages_for(total: i64, per_page: i64) -> i64 {
    if total == 0 {
        0
    } else {
        (total + per_page - 1) / per_page
    }
}

/// Display category for a committee type code, as shown next to search
/// results.
pub fn committee_category(code: &str) -> &'static str {
    match code {
        "H" | "S" | "P" => "Candidate",
        "X" | "Y" => "Party Committee",
        _ => "PAC",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_filters() -> PersonFilters {
        PersonFilters {
            first_name: Some("JOHN".into()),
            last_name: Some("SMITH".into()),
            city: Some("NOWHERE".into()),
            state: Some("ZZ".into()),
            postal_code: Some("00000".into()),
            year: Some(2024),
        }
    }

    #[test]
    fn plan_only_contains_levels_that_drop_something() {
        assert_eq!(
            relaxation_plan(&full_filters()),
            vec![
                RelaxationLevel::AllFilters,
                RelaxationLevel::DroppedPostalCode,
                RelaxationLevel::DroppedCityAndPostalCode,
            ]
        );

        let name_only = PersonFilters {
            first_name: Some("JOHN".into()),
            ..Default::default()
        };
        assert_eq!(relaxation_plan(&name_only), vec![RelaxationLevel::AllFilters]);

        let with_city = PersonFilters {
            city: Some("FRESNO".into()),
            ..Default::default()
        };
        assert_eq!(
            relaxation_plan(&with_city),
            vec![
                RelaxationLevel::AllFilters,
                RelaxationLevel::DroppedCityAndPostalCode
            ]
        );
    }

    #[test]
    fn level_filters_are_pure_functions_of_level_and_input() {
        let filters = full_filters();
        let at_two = filters_at_level(&filters, RelaxationLevel::DroppedCityAndPostalCode);
        assert_eq!(at_two.city, None);
        assert_eq!(at_two.postal_code, None);
        // State and year are never dropped.
        assert_eq!(at_two.state.as_deref(), Some("ZZ"));
        assert_eq!(at_two.year, Some(2024));
        // The original filter set is untouched.
        assert_eq!(filters.city.as_deref(), Some("NOWHERE"));
        assert_eq!(
            filters_at_level(&filters, RelaxationLevel::DroppedCityAndPostalCode),
            at_two
        );
    }

    #[test]
    fn normalization_folds_case_and_validates_year() {
        let filters = PersonFilters {
            first_name: Some("  john ".into()),
            last_name: Some("".into()),
            year: Some(24),
            ..Default::default()
        }
        .normalized();
        assert_eq!(filters.first_name.as_deref(), Some("JOHN"));
        assert_eq!(filters.last_name, None);
        assert_eq!(filters.year, None);
    }

    #[test]
    fn unrecognized_sorts_fall_back_to_the_default() {
        assert_eq!(PersonSort::from_params(None, None), PersonSort::default());
        assert_eq!(
            PersonSort::from_params(Some("amount"), Some("asc")),
            PersonSort {
                column: PersonSortColumn::Amount,
                direction: SortDirection::Asc
            }
        );
        assert_eq!(
            PersonSort::from_params(Some("; DROP TABLE contributions"), Some("sideways")),
            PersonSort::default()
        );
        assert_eq!(
            RecipientSort::from_param(Some("nonsense")),
            RecipientSort::RecentActivity
        );
    }

    #[test]
    fn predicate_builder_is_driven_by_present_filters_only() {
        let filters = PersonFilters {
            last_name: Some("SMITH".into()),
            year: Some(2024),
            ..Default::default()
        };
        let (where_clause, params) = build_person_where(&filters, &[]);
        assert_eq!(
            where_clause,
            "WHERE c.last_name = ? AND c.contribution_date >= ? AND c.contribution_date <= ?"
        );
        assert_eq!(params, vec!["SMITH", "2024-01-01", "2024-12-31"]);

        let exclusions = vec!["C00401224".to_string(), "C00694323".to_string()];
        let (where_clause, params) = build_person_where(&filters, &exclusions);
        assert!(where_clause.starts_with("WHERE c.recipient_key NOT IN (?, ?)"));
        assert_eq!(params.len(), 5);
    }

    #[test]
    fn query_fragments_are_reduced_to_tokens() {
        assert_eq!(
            normalize_query_fragment("  Friends-of (Example)! "),
            "friends of example"
        );
        assert_eq!(normalize_query_fragment("\"--;\""), "");
    }

    #[test]
    fn committee_categories_map_codes() {
        assert_eq!(committee_category("H"), "Candidate");
        assert_eq!(committee_category("Y"), "Party Committee");
        assert_eq!(committee_category("Q"), "PAC");
    }
}

//! Source layouts and the record normalizer.
//!
//! A [`SourceLayout`] declares how one jurisdiction's delimited export maps
//! onto [`ContributionRecord`]: delimiter, column references, the
//! locale-pinned date format, the donor-name style, and the recipient-key
//! fallback rule. The normalizer itself is pure and stateless apart from the
//! header binding; all I/O lives in the line reader at the bottom.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::NaiveDate;
use dfin_core::{fold, parse_amount_cents, ContributionRecord, RecipientKey, RejectReason};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "dfin-sources";

/// Reference to one field of a raw row: positional for headerless exports,
/// named for exports that carry a header line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnRef {
    Index(usize),
    Name(String),
}

/// Date format pinned per source. Ambiguous or malformed dates reject the
/// row; the normalizer never guesses between day-first and month-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateLayout {
    /// Eight digits, `MMDDYYYY`.
    CompactMdy,
    /// `M/D/YYYY`, optionally followed by a time component after a space.
    SlashMdy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameStyle {
    /// One column holding `LAST, FIRST`. Without a separator the whole
    /// value is treated as the last name.
    CombinedLastFirst { column: ColumnRef },
    /// Separate first/last columns.
    Split { first: ColumnRef, last: ColumnRef },
}

/// Keep only rows whose `column` equals `keep`; everything else is filtered
/// out before normalization (not an error, not counted as a rejection).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityFilter {
    pub column: ColumnRef,
    pub keep: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLayout {
    pub id: String,
    pub display_name: String,
    pub delimiter: char,
    #[serde(default)]
    pub has_header: bool,
    pub name: NameStyle,
    pub city: ColumnRef,
    pub state: ColumnRef,
    pub zip_code: ColumnRef,
    pub date: ColumnRef,
    pub date_layout: DateLayout,
    pub amount: ColumnRef,
    /// Resolved recipient identifier column.
    pub recipient_primary: ColumnRef,
    /// Substitute when the primary is empty.
    #[serde(default)]
    pub recipient_fallback: Option<ColumnRef>,
    /// Whether a substituted fallback key is a filing-level identifier
    /// rather than a resolved committee id.
    #[serde(default)]
    pub fallback_is_provisional: bool,
    #[serde(default)]
    pub record_type: Option<ColumnRef>,
    #[serde(default)]
    pub employer: Option<ColumnRef>,
    #[serde(default)]
    pub occupation: Option<ColumnRef>,
    #[serde(default)]
    pub filing_id: Option<ColumnRef>,
    #[serde(default)]
    pub transaction_id: Option<ColumnRef>,
    #[serde(default)]
    pub entity_filter: Option<EntityFilter>,
}

/// Layout of a recipient/committee metadata export. Display names may be
/// assembled from several columns (some registries split name suffixes out).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientLayout {
    pub delimiter: char,
    #[serde(default)]
    pub has_header: bool,
    pub key: ColumnRef,
    pub name_parts: Vec<ColumnRef>,
    #[serde(default)]
    pub kind: Option<ColumnRef>,
}

/// One row of recipient metadata, ready for the store's `recipients` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientRow {
    pub key: String,
    pub name: String,
    pub kind: String,
}

/// One jurisdiction: the field layout plus the query-side knobs that vary
/// per region (passthrough committees to exclude from person search, and
/// the optional default state).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JurisdictionConfig {
    pub layout: SourceLayout,
    #[serde(default)]
    pub recipient_layout: Option<RecipientLayout>,
    #[serde(default)]
    pub conduit_exclusions: Vec<String>,
    #[serde(default)]
    pub default_state: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JurisdictionRegistry {
    pub jurisdictions: Vec<JurisdictionConfig>,
}

impl JurisdictionRegistry {
    /// Registry with the built-in federal and california jurisdictions.
    pub fn builtin() -> Self {
        Self {
            jurisdictions: vec![federal_jurisdiction(), california_jurisdiction()],
        }
    }

    pub fn from_yaml_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn get(&self, id: &str) -> Option<&JurisdictionConfig> {
        self.jurisdictions.iter().find(|j| j.layout.id == id)
    }
}

/// Federal bulk individual-contribution export: pipe-delimited, headerless,
/// positional columns, eight-digit dates, combined `LAST, FIRST` name.
pub fn federal_jurisdiction() -> JurisdictionConfig {
    JurisdictionConfig {
        layout: SourceLayout {
            id: "federal".into(),
            display_name: "Federal individual contributions".into(),
            delimiter: '|',
            has_header: false,
            name: NameStyle::CombinedLastFirst {
                column: ColumnRef::Index(7),
            },
            city: ColumnRef::Index(8),
            state: ColumnRef::Index(9),
            zip_code: ColumnRef::Index(10),
            date: ColumnRef::Index(13),
            date_layout: DateLayout::CompactMdy,
            amount: ColumnRef::Index(14),
            recipient_primary: ColumnRef::Index(15),
            recipient_fallback: Some(ColumnRef::Index(0)),
            fallback_is_provisional: false,
            record_type: Some(ColumnRef::Index(16)),
            employer: Some(ColumnRef::Index(11)),
            occupation: Some(ColumnRef::Index(12)),
            filing_id: None,
            transaction_id: Some(ColumnRef::Index(17)),
            entity_filter: None,
        },
        recipient_layout: Some(RecipientLayout {
            delimiter: '|',
            has_header: false,
            key: ColumnRef::Index(0),
            name_parts: vec![ColumnRef::Index(1)],
            kind: Some(ColumnRef::Index(3)),
        }),
        conduit_exclusions: vec![
            "C00401224".into(), // ACTBLUE
            "C00694323".into(), // WINRED
            "C00708504".into(), // NATIONBUILDER
            "C00580100".into(), // REPUBLICAN PLATFORM FUND
        ],
        default_state: None,
    }
}

/// California receipt export: tab-delimited with a header line, split name
/// columns, slash dates with a trailing time, and a filing-id fallback that
/// yields provisional recipient keys.
pub fn california_jurisdiction() -> JurisdictionConfig {
    JurisdictionConfig {
        layout: SourceLayout {
            id: "california".into(),
            display_name: "California campaign receipts".into(),
            delimiter: '\t',
            has_header: true,
            name: NameStyle::Split {
                first: ColumnRef::Name("CTRIB_NAMF".into()),
                last: ColumnRef::Name("CTRIB_NAML".into()),
            },
            city: ColumnRef::Name("CTRIB_CITY".into()),
            state: ColumnRef::Name("CTRIB_ST".into()),
            zip_code: ColumnRef::Name("CTRIB_ZIP4".into()),
            date: ColumnRef::Name("RCPT_DATE".into()),
            date_layout: DateLayout::SlashMdy,
            amount: ColumnRef::Name("AMOUNT".into()),
            recipient_primary: ColumnRef::Name("CMTE_ID".into()),
            recipient_fallback: Some(ColumnRef::Name("FILING_ID".into())),
            fallback_is_provisional: true,
            record_type: Some(ColumnRef::Name("REC_TYPE".into())),
            employer: Some(ColumnRef::Name("CTRIB_EMP".into())),
            occupation: Some(ColumnRef::Name("CTRIB_OCC".into())),
            filing_id: Some(ColumnRef::Name("FILING_ID".into())),
            transaction_id: Some(ColumnRef::Name("TRAN_ID".into())),
            entity_filter: Some(EntityFilter {
                column: ColumnRef::Name("ENTITY_CD".into()),
                keep: "IND".into(),
            }),
        },
        recipient_layout: Some(RecipientLayout {
            delimiter: '\t',
            has_header: true,
            key: ColumnRef::Name("FILER_ID".into()),
            name_parts: vec![
                ColumnRef::Name("FILER_NAML".into()),
                ColumnRef::Name("FILER_NAMF".into()),
                ColumnRef::Name("FILER_NAMT".into()),
                ColumnRef::Name("FILER_NAMS".into()),
            ],
            kind: Some(ColumnRef::Name("ENTITY_CD".into())),
        }),
        conduit_exclusions: Vec::new(),
        default_state: Some("CA".into()),
    }
}

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("layout {layout} references header column {column:?} but the source has no header")]
    HeaderlessNamedColumn { layout: String, column: String },
    #[error("header is missing column {0:?}")]
    MissingHeaderColumn(String),
}

/// Outcome of normalizing one raw line.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Record(ContributionRecord),
    /// Row excluded by the layout's entity filter; not an error.
    Filtered,
    Rejected(RejectReason),
}

/// Pure per-row normalizer for one layout. For header-carrying sources the
/// first line must be passed through [`RowNormalizer::bind_header`] before
/// any data line.
#[derive(Debug)]
pub struct RowNormalizer<'a> {
    layout: &'a SourceLayout,
    header: Option<HashMap<String, usize>>,
}

impl<'a> RowNormalizer<'a> {
    pub fn new(layout: &'a SourceLayout) -> Self {
        Self {
            layout,
            header: None,
        }
    }

    pub fn layout(&self) -> &SourceLayout {
        self.layout
    }

    pub fn needs_header(&self) -> bool {
        self.layout.has_header && self.header.is_none()
    }

    pub fn bind_header(&mut self, line: &str) {
        let map = line
            .split(self.layout.delimiter)
            .enumerate()
            .map(|(i, name)| (name.trim().to_string(), i))
            .collect();
        self.header = Some(map);
    }

    pub fn normalize(&self, line: &str) -> Result<RowOutcome, LayoutError> {
        let fields: Vec<&str> = line.split(self.layout.delimiter).collect();

        if let Some(filter) = &self.layout.entity_filter {
            match self.field(&fields, &filter.column)? {
                Some(value) if value.trim() == filter.keep => {}
                _ => return Ok(RowOutcome::Filtered),
            }
        }

        let (first_name, last_name) = match &self.layout.name {
            NameStyle::CombinedLastFirst { column } => {
                let raw = self.field(&fields, column)?;
                match raw {
                    Some(raw) => match raw.trim().split_once(", ") {
                        Some((last, first)) => (fold(first), fold(last)),
                        None => (String::new(), fold(raw)),
                    },
                    None => return Ok(RowOutcome::Rejected(self.short_row(&fields))),
                }
            }
            NameStyle::Split { first, last } => {
                let first = self.field(&fields, first)?.map(fold).unwrap_or_default();
                let last = self.field(&fields, last)?.map(fold).unwrap_or_default();
                (first, last)
            }
        };
        if first_name.is_empty() && last_name.is_empty() {
            return Ok(RowOutcome::Rejected(RejectReason::MissingName));
        }

        let raw_date = match self.field(&fields, &self.layout.date)? {
            Some(v) if !v.trim().is_empty() => v.trim().to_string(),
            _ => return Ok(RowOutcome::Rejected(RejectReason::MissingDate)),
        };
        let date = match parse_date(&raw_date, self.layout.date_layout) {
            Some(date) => date,
            None => return Ok(RowOutcome::Rejected(RejectReason::UnparseableDate(raw_date))),
        };

        let raw_amount = self
            .field(&fields, &self.layout.amount)?
            .unwrap_or_default()
            .trim()
            .to_string();
        let amount_cents = match parse_amount_cents(&raw_amount) {
            Some(cents) => cents,
            None => {
                return Ok(RowOutcome::Rejected(RejectReason::UnparseableAmount(
                    raw_amount,
                )))
            }
        };
        if amount_cents <= 0 {
            return Ok(RowOutcome::Rejected(RejectReason::NonPositiveAmount));
        }

        let primary = self
            .field(&fields, &self.layout.recipient_primary)?
            .map(str::trim)
            .unwrap_or_default();
        let recipient = if !primary.is_empty() {
            RecipientKey::Resolved(primary.to_string())
        } else {
            let fallback = match &self.layout.recipient_fallback {
                Some(column) => self
                    .field(&fields, column)?
                    .map(str::trim)
                    .unwrap_or_default(),
                None => "",
            };
            if fallback.is_empty() {
                return Ok(RowOutcome::Rejected(RejectReason::MissingRecipient));
            }
            if self.layout.fallback_is_provisional {
                RecipientKey::Provisional(fallback.to_string())
            } else {
                RecipientKey::Resolved(fallback.to_string())
            }
        };

        let record = ContributionRecord {
            first_name,
            last_name,
            city: self.field(&fields, &self.layout.city)?.map(fold).unwrap_or_default(),
            state: self.field(&fields, &self.layout.state)?.map(fold).unwrap_or_default(),
            zip_code: self
                .field(&fields, &self.layout.zip_code)?
                .map(fold)
                .unwrap_or_default(),
            date,
            recipient,
            amount_cents,
            record_type: self
                .optional(&fields, &self.layout.record_type)?
                .unwrap_or_default(),
            employer: self.optional(&fields, &self.layout.employer)?,
            occupation: self.optional(&fields, &self.layout.occupation)?,
            filing_id: self.optional(&fields, &self.layout.filing_id)?,
            transaction_id: self.optional(&fields, &self.layout.transaction_id)?,
        };
        Ok(RowOutcome::Record(record))
    }

    fn resolve(&self, column: &ColumnRef) -> Result<usize, LayoutError> {
        match column {
            ColumnRef::Index(i) => Ok(*i),
            ColumnRef::Name(name) => {
                let header = self.header.as_ref().ok_or_else(|| {
                    LayoutError::HeaderlessNamedColumn {
                        layout: self.layout.id.clone(),
                        column: name.clone(),
                    }
                })?;
                header
                    .get(name)
                    .copied()
                    .ok_or_else(|| LayoutError::MissingHeaderColumn(name.clone()))
            }
        }
    }

    fn field<'r>(
        &self,
        fields: &[&'r str],
        column: &ColumnRef,
    ) -> Result<Option<&'r str>, LayoutError> {
        let index = self.resolve(column)?;
        Ok(fields.get(index).copied())
    }

    fn optional(
        &self,
        fields: &[&str],
        column: &Option<ColumnRef>,
    ) -> Result<Option<String>, LayoutError> {
        match column {
            Some(column) => Ok(self
                .field(fields, column)?
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)),
            None => Ok(None),
        }
    }

    fn short_row(&self, fields: &[&str]) -> RejectReason {
        RejectReason::ShortRow {
            needed: self.max_index() + 1,
            got: fields.len(),
        }
    }

    fn max_index(&self) -> usize {
        let mut max = 0usize;
        let mut consider = |c: &ColumnRef| {
            if let ColumnRef::Index(i) = c {
                max = max.max(*i);
            }
        };
        match &self.layout.name {
            NameStyle::CombinedLastFirst { column } => consider(column),
            NameStyle::Split { first, last } => {
                consider(first);
                consider(last);
            }
        }
        for c in [
            &self.layout.city,
            &self.layout.state,
            &self.layout.zip_code,
            &self.layout.date,
            &self.layout.amount,
            &self.layout.recipient_primary,
        ] {
            consider(c);
        }
        max
    }
}

/// Normalizer for recipient/committee metadata exports. Rows without a key
/// are skipped; names join the configured parts with single spaces.
#[derive(Debug)]
pub struct RecipientNormalizer<'a> {
    layout: &'a RecipientLayout,
    header: Option<HashMap<String, usize>>,
}

impl<'a> RecipientNormalizer<'a> {
    pub fn new(layout: &'a RecipientLayout) -> Self {
        Self {
            layout,
            header: None,
        }
    }

    pub fn needs_header(&self) -> bool {
        self.layout.has_header && self.header.is_none()
    }

    pub fn bind_header(&mut self, line: &str) {
        let map = line
            .split(self.layout.delimiter)
            .enumerate()
            .map(|(i, name)| (name.trim().to_string(), i))
            .collect();
        self.header = Some(map);
    }

    fn resolve(&self, column: &ColumnRef) -> Result<usize, LayoutError> {
        match column {
            ColumnRef::Index(i) => Ok(*i),
            ColumnRef::Name(name) => {
                let header = self.header.as_ref().ok_or_else(|| {
                    LayoutError::HeaderlessNamedColumn {
                        layout: "recipient metadata".to_string(),
                        column: name.clone(),
                    }
                })?;
                header
                    .get(name)
                    .copied()
                    .ok_or_else(|| LayoutError::MissingHeaderColumn(name.clone()))
            }
        }
    }

    fn pick<'r>(&self, fields: &[&'r str], column: &ColumnRef) -> Result<&'r str, LayoutError> {
        Ok(fields
            .get(self.resolve(column)?)
            .copied()
            .unwrap_or("")
            .trim())
    }

    pub fn normalize(&self, line: &str) -> Result<Option<RecipientRow>, LayoutError> {
        let fields: Vec<&str> = line.split(self.layout.delimiter).collect();

        let key = self.pick(&fields, &self.layout.key)?;
        if key.is_empty() {
            return Ok(None);
        }
        let mut name_parts = Vec::new();
        for part in &self.layout.name_parts {
            let value = self.pick(&fields, part)?;
            if !value.is_empty() {
                name_parts.push(value);
            }
        }
        let kind = match &self.layout.kind {
            Some(column) => self.pick(&fields, column)?.to_string(),
            None => String::new(),
        };
        Ok(Some(RecipientRow {
            key: key.to_string(),
            name: name_parts.join(" "),
            kind,
        }))
    }
}

/// Parse a source date into a calendar date. Total and deterministic: a
/// value that does not match the pinned layout exactly returns `None`.
pub fn parse_date(raw: &str, layout: DateLayout) -> Option<NaiveDate> {
    match layout {
        DateLayout::CompactMdy => {
            if raw.len() != 8 || !raw.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let month: u32 = raw[0..2].parse().ok()?;
            let day: u32 = raw[2..4].parse().ok()?;
            let year: i32 = raw[4..8].parse().ok()?;
            NaiveDate::from_ymd_opt(year, month, day)
        }
        DateLayout::SlashMdy => {
            let date_part = raw.split_whitespace().next()?;
            let mut parts = date_part.split('/');
            let month: u32 = parts.next()?.parse().ok()?;
            let day: u32 = parts.next()?.parse().ok()?;
            let year: i32 = parts.next()?.parse().ok()?;
            if parts.next().is_some() {
                return None;
            }
            NaiveDate::from_ymd_opt(year, month, day)
        }
    }
}

/// Open a source file for line streaming, transparently decompressing zstd.
///
/// A path `p` falls back to `p.zst` when only the compressed form exists;
/// a path already ending in `.zst` is always decoded.
pub fn open_source_reader(path: &Path) -> anyhow::Result<Box<dyn BufRead + Send>> {
    let zst_sibling = PathBuf::from(format!("{}.zst", path.display()));
    let (open_path, compressed) = if path.extension().is_some_and(|e| e == "zst") {
        (path.to_path_buf(), true)
    } else if path.exists() {
        (path.to_path_buf(), false)
    } else if zst_sibling.exists() {
        (zst_sibling, true)
    } else {
        anyhow::bail!("neither {} nor {}.zst exists", path.display(), path.display());
    };

    debug!(path = %open_path.display(), compressed, "opening source file");
    let file =
        File::open(&open_path).with_context(|| format!("opening {}", open_path.display()))?;
    if compressed {
        let decoder = zstd::stream::read::Decoder::new(file)
            .with_context(|| format!("opening zstd stream {}", open_path.display()))?;
        Ok(Box::new(BufReader::new(decoder)))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Line iterator that tolerates malformed encoding: invalid UTF-8 bytes are
/// substituted, NUL bytes stripped, and trailing CR/LF removed.
pub struct SourceLines<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: BufRead> SourceLines<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(512),
        }
    }
}

impl<R: BufRead> Iterator for SourceLines<R> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => None,
            Ok(_) => {
                while matches!(self.buf.last(), Some(b'\n') | Some(b'\r')) {
                    self.buf.pop();
                }
                self.buf.retain(|&b| b != 0);
                Some(Ok(String::from_utf8_lossy(&self.buf).into_owned()))
            }
            Err(err) => Some(Err(err)),
        }
    }
}

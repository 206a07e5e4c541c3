//! Core domain model for disclosed political contributions.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "dfin-core";

/// Recipient identifier attached to a contribution.
///
/// A `Resolved` key points at a known committee/filer record. A `Provisional`
/// key is a filing- or batch-level identifier substituted when the source row
/// carried no resolved committee id; it is lower-confidence and must stay
/// distinguishable so a later remapping pass can correct it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key")]
pub enum RecipientKey {
    Resolved(String),
    Provisional(String),
}

impl RecipientKey {
    pub fn key(&self) -> &str {
        match self {
            RecipientKey::Resolved(k) | RecipientKey::Provisional(k) => k,
        }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, RecipientKey::Provisional(_))
    }
}

/// One disclosed contribution in canonical form. Immutable once committed;
/// corrections arrive as new rows and duplicate detection is content-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContributionRecord {
    pub first_name: String,
    pub last_name: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
    pub date: NaiveDate,
    pub recipient: RecipientKey,
    pub amount_cents: i64,
    pub record_type: String,
    pub employer: Option<String>,
    pub occupation: Option<String>,
    pub filing_id: Option<String>,
    pub transaction_id: Option<String>,
}

impl ContributionRecord {
    pub fn year(&self) -> i32 {
        self.date.year()
    }

    /// Derived grouping identity: `lower(first) | lower(last) | zip5`.
    ///
    /// The same physical person may map to multiple keys when name or ZIP
    /// varies across filings; no identity resolution happens beyond this.
    pub fn donor_key(&self) -> String {
        donor_key(&self.first_name, &self.last_name, &self.zip_code)
    }
}

pub fn donor_key(first_name: &str, last_name: &str, zip_code: &str) -> String {
    format!(
        "{}|{}|{}",
        first_name.to_lowercase(),
        last_name.to_lowercase(),
        zip5(zip_code)
    )
}

/// First five digits of a postal code, as stored on disk.
pub fn zip5(zip_code: &str) -> &str {
    let end = zip_code
        .char_indices()
        .nth(5)
        .map(|(i, _)| i)
        .unwrap_or(zip_code.len());
    &zip_code[..end]
}

/// Canonical comparison form for names and locations: trimmed, uppercased.
pub fn fold(value: &str) -> String {
    value.trim().to_uppercase()
}

/// Parse a decimal money string into fixed-point integer cents.
///
/// Accepts `1234`, `1234.5`, `1234.56`; rejects more than two fractional
/// digits, signs other than a leading minus, and anything non-numeric.
pub fn parse_amount_cents(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let (whole, frac) = match digits.split_once('.') {
        Some((w, f)) => (w, f),
        None => (digits, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return None;
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || frac.len() > 2 {
        return None;
    }
    if !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let whole_value: i64 = if whole.is_empty() {
        0
    } else {
        whole.parse().ok()?
    };
    let frac_value: i64 = match frac.len() {
        0 => 0,
        1 => frac.parse::<i64>().ok()? * 10,
        _ => frac.parse().ok()?,
    };
    let cents = whole_value.checked_mul(100)?.checked_add(frac_value)?;
    Some(if negative { -cents } else { cents })
}

/// Why a raw row was refused by the normalizer. Rejections increment the
/// caller's error counter; they never abort the stream.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RejectReason {
    #[error("row has fewer fields than the layout requires ({got} < {needed})")]
    ShortRow { needed: usize, got: usize },
    #[error("both donor name components are missing")]
    MissingName,
    #[error("contribution date is missing")]
    MissingDate,
    #[error("unparseable contribution date {0:?}")]
    UnparseableDate(String),
    #[error("unparseable amount {0:?}")]
    UnparseableAmount(String),
    #[error("amount is not positive")]
    NonPositiveAmount,
    #[error("no recipient identifier and no fallback identifier")]
    MissingRecipient,
}

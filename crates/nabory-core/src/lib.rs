//! Core domain model, normalization and content fingerprinting for the funding-call catalog.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "nabory-core";

/// Status assigned to freshly ingested opportunities.
pub const DEFAULT_OPPORTUNITY_STATUS: &str = "active";

/// An institutional web page that publishes funding calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub region: String,
    #[serde(rename = "type")]
    pub source_type: String,
    pub active: bool,
    pub last_scraped: Option<DateTime<Utc>>,
}

/// Seed/admin input for a source; `url` is the identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSource {
    pub name: String,
    pub url: String,
    pub region: String,
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Canonical persisted funding call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Opportunity {
    pub id: Uuid,
    pub source_id: Uuid,
    pub title: String,
    pub institution: String,
    pub description: Option<String>,
    pub beneficiaries: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub deadline: Option<NaiveDate>,
    pub amount: Option<String>,
    pub budget: Option<String>,
    #[serde(rename = "type")]
    pub opportunity_type: Option<String>,
    pub link: Option<String>,
    pub content_hash: String,
    pub scraped_at: DateTime<Utc>,
    pub status: String,
}

/// Normalized fields produced from one extracted record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpportunityFields {
    pub title: String,
    pub institution: String,
    pub description: Option<String>,
    pub beneficiaries: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub deadline: Option<NaiveDate>,
    pub amount: Option<String>,
    pub budget: Option<String>,
    #[serde(rename = "type")]
    pub opportunity_type: Option<String>,
    pub link: Option<String>,
}

impl OpportunityFields {
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.title, &self.institution, self.date_from, self.date_to)
    }
}

/// Create request handed to the persistence layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOpportunity {
    pub source_id: Uuid,
    pub fields: OpportunityFields,
    pub content_hash: String,
    pub scraped_at: DateTime<Utc>,
    pub status: String,
}

impl NewOpportunity {
    pub fn new(source_id: Uuid, fields: OpportunityFields, scraped_at: DateTime<Utc>) -> Self {
        let content_hash = fields.fingerprint();
        Self {
            source_id,
            fields,
            content_hash,
            scraped_at,
            status: DEFAULT_OPPORTUNITY_STATUS.to_string(),
        }
    }

    pub fn into_opportunity(self, id: Uuid) -> Opportunity {
        let OpportunityFields {
            title,
            institution,
            description,
            beneficiaries,
            date_from,
            date_to,
            deadline,
            amount,
            budget,
            opportunity_type,
            link,
        } = self.fields;
        Opportunity {
            id,
            source_id: self.source_id,
            title,
            institution,
            description,
            beneficiaries,
            date_from,
            date_to,
            deadline,
            amount,
            budget,
            opportunity_type,
            link,
            content_hash: self.content_hash,
            scraped_at: self.scraped_at,
            status: self.status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Success,
    Error,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Success => "success",
            LogStatus::Error => "error",
        }
    }
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown scraping log status `{0}`")]
pub struct UnknownLogStatus(pub String);

impl FromStr for LogStatus {
    type Err = UnknownLogStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(LogStatus::Success),
            "error" => Ok(LogStatus::Error),
            other => Err(UnknownLogStatus(other.to_string())),
        }
    }
}

/// Append-only audit row; one per source per batch attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapingLog {
    pub id: Uuid,
    pub source_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub status: LogStatus,
    pub items_found: u32,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewScrapingLog {
    pub source_id: Uuid,
    pub status: LogStatus,
    pub items_found: u32,
    pub error_message: Option<String>,
}

impl NewScrapingLog {
    pub fn success(source_id: Uuid, items_found: usize) -> Self {
        Self {
            source_id,
            status: LogStatus::Success,
            items_found: u32::try_from(items_found).unwrap_or(u32::MAX),
            error_message: None,
        }
    }

    pub fn error(source_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            source_id,
            status: LogStatus::Error,
            items_found: 0,
            error_message: Some(message.into()),
        }
    }
}

/// Raw record as returned by the extraction capability, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedRecord {
    pub title: String,
    pub institution: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub beneficiaries: Option<String>,
    #[serde(default)]
    pub date_from: Option<String>,
    #[serde(default)]
    pub date_to: Option<String>,
    #[serde(default)]
    pub deadline: Option<String>,
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default)]
    pub budget: Option<String>,
    #[serde(default, rename = "type")]
    pub opportunity_type: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
}

/// Trims and collapses internal whitespace runs to a single space.
pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn clean_optional(value: Option<&str>) -> Option<String> {
    value.map(collapse_whitespace).filter(|s| !s.is_empty())
}

static ISO_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4})-(\d{2})-(\d{2})").expect("static regex"));
static DASHED_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{2})-(\d{2})-(\d{4})").expect("static regex"));
static DOTTED_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{2})\.(\d{2})\.(\d{4})").expect("static regex"));

#[derive(Clone, Copy)]
enum DateOrder {
    YearFirst,
    DayFirst,
}

/// Parses `YYYY-MM-DD`, `DD-MM-YYYY` or `DD.MM.YYYY` found anywhere in `input`.
///
/// Patterns are tried in that order and the first one that matches decides the result;
/// a match that is not a real calendar day yields `None`.
pub fn parse_date(input: &str) -> Option<NaiveDate> {
    let patterns: [(&Regex, DateOrder); 3] = [
        (&ISO_DATE, DateOrder::YearFirst),
        (&DASHED_DATE, DateOrder::DayFirst),
        (&DOTTED_DATE, DateOrder::DayFirst),
    ];

    for (pattern, order) in patterns {
        let Some(caps) = pattern.captures(input) else {
            continue;
        };
        let part = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());
        let (year, month, day) = match order {
            DateOrder::YearFirst => (part(1)?, part(2)?, part(3)?),
            DateOrder::DayFirst => (part(3)?, part(2)?, part(1)?),
        };
        return NaiveDate::from_ymd_opt(i32::try_from(year).ok()?, month, day);
    }
    None
}

fn parse_optional_date(value: Option<&str>) -> Option<NaiveDate> {
    value.and_then(parse_date)
}

/// Maps one extracted record onto canonical fields. Absent or unparseable values stay `None`.
pub fn normalize_record(record: &ExtractedRecord) -> OpportunityFields {
    OpportunityFields {
        title: collapse_whitespace(&record.title),
        institution: collapse_whitespace(&record.institution),
        description: clean_optional(record.description.as_deref()),
        beneficiaries: clean_optional(record.beneficiaries.as_deref()),
        date_from: parse_optional_date(record.date_from.as_deref()),
        date_to: parse_optional_date(record.date_to.as_deref()),
        deadline: parse_optional_date(record.deadline.as_deref()),
        amount: clean_optional(record.amount.as_deref()),
        budget: clean_optional(record.budget.as_deref()),
        opportunity_type: clean_optional(record.opportunity_type.as_deref()),
        link: clean_optional(record.link.as_deref()),
    }
}

fn fingerprint_fragment(input: &str) -> String {
    collapse_whitespace(&input.to_lowercase())
}

/// SHA-256 hex digest identifying a funding call independent of casing and spacing.
pub fn fingerprint(
    title: &str,
    institution: &str,
    date_from: Option<NaiveDate>,
    date_to: Option<NaiveDate>,
) -> String {
    let iso = |d: Option<NaiveDate>| d.map(|d| d.format("%Y-%m-%d").to_string()).unwrap_or_default();
    let content = [
        fingerprint_fragment(title),
        fingerprint_fragment(institution),
        iso(date_from),
        iso(date_to),
    ]
    .join("|");

    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

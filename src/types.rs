use crate::error::RecordError;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde_json::Value;
use std::fmt;

/// Bearer token for the management API. Lives for one run only.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    #[must_use]
    pub const fn new(token: String) -> Self {
        Self(token)
    }

    #[must_use]
    pub fn secret(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn bearer_header(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential([redacted])")
    }
}

/// One billed line item, reduced to the day it started and its pre-tax cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub date: NaiveDate,
    pub cost: Decimal,
}

impl UsageRecord {
    /// Extracts a record from one raw `value[]` entry of a usage-details page.
    ///
    /// `properties.usageStart` / `properties.pretaxCost` are read first; the
    /// legacy `properties.date` / `properties.cost` pair is the fallback.
    ///
    /// # Errors
    /// Returns a [`RecordError`] when either field is absent or unparseable.
    pub fn from_item(item: &Value) -> Result<Self, RecordError> {
        let props = item.get("properties").unwrap_or(&Value::Null);

        let date_raw = present(props, "usageStart")
            .or_else(|| present(props, "date"))
            .ok_or(RecordError::MissingDate)?;
        let cost_raw = present(props, "pretaxCost")
            .or_else(|| present(props, "cost"))
            .ok_or(RecordError::MissingCost)?;

        Ok(Self {
            date: parse_date(date_raw)?,
            cost: parse_cost(cost_raw)?,
        })
    }

    /// Renders the record as one `date<TAB>cost` report line.
    #[must_use]
    pub fn line(&self) -> String {
        format!("{}\t{}", self.date.format("%Y-%m-%d"), self.cost)
    }
}

fn present<'a>(props: &'a Value, key: &str) -> Option<&'a Value> {
    props.get(key).filter(|v| !v.is_null())
}

fn parse_date(raw: &Value) -> Result<NaiveDate, RecordError> {
    let text = raw
        .as_str()
        .ok_or_else(|| RecordError::InvalidDate(raw.to_string()))?;
    let day = text.split('T').next().unwrap_or_default().trim();
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .map_err(|_| RecordError::InvalidDate(text.to_string()))
}

fn parse_cost(raw: &Value) -> Result<Decimal, RecordError> {
    let text = match raw {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        other => return Err(RecordError::InvalidCost(other.to_string())),
    };
    text.parse::<Decimal>()
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|_| RecordError::InvalidCost(text))
}

/// Usage records in API order across every page, plus how many raw items were dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageRecordSet {
    records: Vec<UsageRecord>,
    skipped: usize,
}

impl UsageRecordSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: UsageRecord) {
        self.records.push(record);
    }

    pub fn mark_skipped(&mut self) {
        self.skipped += 1;
    }

    /// Parses a raw item and either keeps it or counts it as skipped.
    ///
    /// # Errors
    /// Returns the reason when the item was skipped. The set is updated either way.
    pub fn ingest(&mut self, item: &Value) -> Result<(), RecordError> {
        match UsageRecord::from_item(item) {
            Ok(record) => {
                self.push(record);
                Ok(())
            }
            Err(e) => {
                self.mark_skipped();
                Err(e)
            }
        }
    }

    #[must_use]
    pub fn records(&self) -> &[UsageRecord] {
        &self.records
    }

    #[must_use]
    pub const fn skipped(&self) -> usize {
        self.skipped
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Rendered cost report. The table is for the console, the body goes in the email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub lines: Vec<String>,
    pub skipped: usize,
    pub table: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub from_address: String,
    pub from_name: String,
    pub to: String,
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
}

/// Final reply from the mail relay for an accepted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub code: String,
    pub message: String,
}

impl fmt::Display for DeliveryReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} {}", self.code, self.message)
        }
    }
}

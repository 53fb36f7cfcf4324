use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::event::{LineItem, NormalizedEvent, OutputRow};
use crate::items::parse_items;
use crate::normalize::{normalize, NormalizeError};

/// Timestamps above this are microseconds since the epoch.
pub const MICROS_THRESHOLD: f64 = 1e14;
/// Timestamps above this (and not above `MICROS_THRESHOLD`) are milliseconds.
pub const MILLIS_THRESHOLD: f64 = 1e11;

/// Unit of an `event_timestamp`. Producers do not declare it, so it is guessed from magnitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampUnit {
    Seconds,
    Milliseconds,
    Microseconds,
}

impl TimestampUnit {
    pub fn detect(raw: f64) -> Self {
        if raw > MICROS_THRESHOLD {
            TimestampUnit::Microseconds
        } else if raw > MILLIS_THRESHOLD {
            TimestampUnit::Milliseconds
        } else {
            TimestampUnit::Seconds
        }
    }

    fn micros_per_unit(self) -> f64 {
        match self {
            TimestampUnit::Seconds => 1_000_000.0,
            TimestampUnit::Milliseconds => 1_000.0,
            TimestampUnit::Microseconds => 1.0,
        }
    }
}

/// Convert a raw `event_timestamp` to a UTC instant, `None` when out of range.
pub fn resolve_event_time(raw: f64) -> Option<DateTime<Utc>> {
    let micros = (raw * TimestampUnit::detect(raw).micros_per_unit()).round();

    // Casting saturates, so anything that would not survive it is out of range.
    if !micros.is_finite() || micros.abs() >= i64::MAX as f64 {
        return None;
    }

    DateTime::from_timestamp_micros(micros as i64)
}

/// Why a well-formed event produced no rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// `items` is absent or null.
    ItemsMissing,
    /// `items` holds no record: an empty list, a list of non-objects, or text without blocks.
    NoItemRecords,
}

/// Why a message could not become an event at all.
#[derive(Error, Debug)]
pub enum InvalidReason {
    #[error(transparent)]
    Payload(#[from] NormalizeError),
    #[error("event has no event_timestamp")]
    MissingTimestamp,
    #[error("event_timestamp is not a number")]
    TimestampNotNumeric,
    #[error("event_timestamp {0} is out of range")]
    TimestampOutOfRange(f64),
    #[error("items is neither a list nor text")]
    ItemsNotAList,
}

/// Outcome of turning one event into rows.
#[derive(Debug)]
pub enum Expansion {
    /// At least one row.
    Rows(Vec<OutputRow>),
    Skipped(SkipReason),
    Invalid(InvalidReason),
}

impl Expansion {
    /// Rows to persist, empty for skipped and invalid events.
    pub fn into_rows(self) -> Vec<OutputRow> {
        match self {
            Expansion::Rows(rows) => rows,
            Expansion::Skipped(_) | Expansion::Invalid(_) => Vec::new(),
        }
    }

    /// Short label for logs and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Expansion::Rows(_) => "rows",
            Expansion::Skipped(SkipReason::ItemsMissing) => "items_missing",
            Expansion::Skipped(SkipReason::NoItemRecords) => "no_item_records",
            Expansion::Invalid(InvalidReason::Payload(error)) => error.reason(),
            Expansion::Invalid(InvalidReason::MissingTimestamp) => "missing_timestamp",
            Expansion::Invalid(InvalidReason::TimestampNotNumeric) => "timestamp_not_numeric",
            Expansion::Invalid(InvalidReason::TimestampOutOfRange(_)) => "timestamp_out_of_range",
            Expansion::Invalid(InvalidReason::ItemsNotAList) => "items_not_a_list",
        }
    }
}

/// Expand one event into a row per item record, all sharing the event-level fields.
pub fn expand(event: &NormalizedEvent) -> Expansion {
    let raw = match event.get("event_timestamp") {
        None | Some(Value::Null) => return Expansion::Invalid(InvalidReason::MissingTimestamp),
        Some(Value::Number(n)) => match n.as_f64() {
            Some(raw) => raw,
            None => return Expansion::Invalid(InvalidReason::TimestampNotNumeric),
        },
        Some(Value::Bool(_) | Value::String(_) | Value::Array(_) | Value::Object(_)) => {
            return Expansion::Invalid(InvalidReason::TimestampNotNumeric)
        }
    };

    let Some(event_time) = resolve_event_time(raw) else {
        return Expansion::Invalid(InvalidReason::TimestampOutOfRange(raw));
    };

    let items: Vec<LineItem> = match event.get("items") {
        None | Some(Value::Null) => return Expansion::Skipped(SkipReason::ItemsMissing),
        Some(Value::Array(values)) => values
            .iter()
            .filter_map(|value| match value {
                Value::Object(object) => Some(LineItem::from_object(object)),
                _ => None,
            })
            .collect(),
        Some(Value::String(text)) => parse_items(text),
        Some(Value::Bool(_) | Value::Number(_) | Value::Object(_)) => {
            return Expansion::Invalid(InvalidReason::ItemsNotAList)
        }
    };

    if items.is_empty() {
        return Expansion::Skipped(SkipReason::NoItemRecords);
    }

    Expansion::Rows(
        items
            .into_iter()
            .map(|item| OutputRow::new(event_time, event, item))
            .collect(),
    )
}

/// Normalize a raw message body and expand it.
pub fn transform(body: &str) -> Expansion {
    match normalize(body) {
        Ok(event) => expand(&event),
        Err(error) => Expansion::Invalid(InvalidReason::Payload(error)),
    }
}

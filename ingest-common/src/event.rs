use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// A decoded analytics event: a JSON object whose keys are not known up front.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NormalizedEvent(Map<String, Value>);

impl NormalizedEvent {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Event-level text field. Absent and null are both `None`.
    pub fn text(&self, key: &str) -> Option<String> {
        self.get(key).and_then(text_value)
    }
}

/// One product line of an event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LineItem {
    pub item_id: Option<String>,
    pub item_name: Option<String>,
    pub price: Option<f64>,
    pub item_list_name: Option<String>,
}

impl LineItem {
    /// Build an item from a JSON object, as found when `items` arrives as a real list.
    pub fn from_object(object: &Map<String, Value>) -> Self {
        let text = |key: &str| object.get(key).and_then(text_value);

        Self {
            item_id: text("item_id"),
            item_name: text("item_name"),
            price: object.get("price").and_then(price_value),
            item_list_name: text("item_list_name"),
        }
    }
}

/// A row of the `fact_events` table.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRow {
    pub event_time: DateTime<Utc>,
    pub user_id: Option<String>,
    pub event_name: Option<String>,
    pub platform: Option<String>,
    pub list_name: Option<String>,
    pub product_id: Option<String>,
    pub product_name: Option<String>,
    pub price: Option<f64>,
}

impl OutputRow {
    pub fn new(event_time: DateTime<Utc>, event: &NormalizedEvent, item: LineItem) -> Self {
        Self {
            event_time,
            user_id: event.text("user_id"),
            event_name: event.text("event_name"),
            platform: event.text("platform"),
            list_name: item.item_list_name,
            product_id: item.item_id,
            product_name: item.item_name,
            price: item.price,
        }
    }
}

/// Render a JSON value for a nullable text column.
///
/// Scalars keep their natural text form, nested values are stored as compact JSON.
pub fn text_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

/// Read a JSON value as a price. Numeric strings are accepted, anything else is `None`.
pub fn price_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|p| p.is_finite()),
        Value::Null | Value::Bool(_) | Value::Array(_) | Value::Object(_) => None,
    }
}

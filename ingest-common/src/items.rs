//! Parser for the textual item lists some producers send instead of JSON arrays.
//!
//! The format looks like `[{item_id=SKU1, item_name=Mug, price=12.5}, {...}]`: records
//! are brace-delimited, fields are comma-separated `key=value` pairs and nothing is
//! quoted or escaped. Values may contain nested braces, so records are found by
//! tracking brace depth instead of splitting on separators.

use crate::event::LineItem;

/// Values standing for "no value" in the textual format.
const NULL_SENTINELS: [&str; 2] = ["(not set)", "null"];

/// Extract every top-level record of a textual item list.
///
/// Missing or unrecognised fields never fail a record, and an unparseable price
/// only nulls the price.
pub fn parse_items(text: &str) -> Vec<LineItem> {
    let body = text.trim().trim_matches(|c: char| c == '[' || c == ']');

    records(body).into_iter().map(parse_record).collect()
}

/// Split the list body into the contents of its top-level `{...}` blocks.
///
/// A closing brace with no open record is ignored, and a record still open at
/// the end of the input is dropped.
fn records(body: &str) -> Vec<&str> {
    let mut records = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (i, c) in body.char_indices() {
        match c {
            '{' => {
                if depth == 0 {
                    start = i + 1;
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    records.push(&body[start..i]);
                }
            }
            _ => {}
        }
    }

    records
}

/// Split a record's contents on the commas that are not nested in braces.
///
/// Brackets are plain value text, so `size=[XL, price=5` still yields a `price` field.
fn fields(record: &str) -> Vec<&str> {
    let mut fields = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (i, c) in record.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                fields.push(&record[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    fields.push(&record[start..]);

    fields
}

#[derive(Default)]
struct RawItem<'a> {
    item_id: Option<&'a str>,
    item_name: Option<&'a str>,
    price: Option<&'a str>,
    item_list_name: Option<&'a str>,
}

fn parse_record(record: &str) -> LineItem {
    let mut raw = RawItem::default();

    for field in fields(record) {
        let Some((key, value)) = field.split_once('=') else {
            continue;
        };
        let slot = match key.trim() {
            "item_id" => &mut raw.item_id,
            "item_name" => &mut raw.item_name,
            "price" => &mut raw.price,
            "item_list_name" => &mut raw.item_list_name,
            _ => continue,
        };
        // First occurrence wins.
        slot.get_or_insert(value.trim());
    }

    LineItem {
        item_id: present(raw.item_id).map(str::to_owned),
        item_name: present(raw.item_name).map(str::to_owned),
        price: present(raw.price)
            .and_then(|price| price.parse::<f64>().ok())
            .filter(|price| price.is_finite()),
        item_list_name: present(raw.item_list_name).map(str::to_owned),
    }
}

fn present(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty() && !NULL_SENTINELS.contains(v))
}

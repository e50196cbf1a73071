//! Canonical event/page shapes and the response normalizer.
//!
//! The server emits two envelope shapes for the same feed: a flat object
//! (`{data: [...], hasMore, nextCursor, meta}`) and a nested one
//! (`{data: {data: [...], pagination, meta}}`). Both collapse to [`Page`]
//! here so nothing downstream cares which one arrived. Shape detection is
//! explicit field inspection; unrecognized input yields an empty page.

use chrono::{DateTime, NaiveDateTime};
use serde_json::Value;

/// An event ready for ingestion: stable id, ms timestamp, verbatim payload.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestEvent {
    pub event_id: String,
    pub timestamp_ms: i64,
    /// The raw record as served, preserved for the store's JSONB column.
    pub payload: Value,
}

/// One canonical page of events, newest first as served.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub events: Vec<IngestEvent>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
    pub total: Option<i64>,
}

impl Page {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Timestamp fields accepted on a raw event, in preference order.
const TIMESTAMP_KEYS: [&str; 4] = ["timestamp", "ts", "created_at", "createdAt"];

/// Numeric values below this are seconds since epoch, at or above it ms.
const MS_THRESHOLD: i64 = 1_000_000_000_000;

/// Collapse any server response body to the canonical page shape.
pub fn normalize_page(body: &Value) -> Page {
    // Nested envelope: {data: {data: [...], pagination: {...}, meta: {...}}}
    if let Some(inner) = body.get("data").filter(|d| d.is_object()) {
        if let Some(items) = inner.get("data").and_then(Value::as_array) {
            let pagination = inner.get("pagination");
            return Page {
                events: collect_events(items),
                has_more: bool_field(pagination, "hasMore"),
                next_cursor: str_field(pagination, "nextCursor"),
                total: i64_field(inner.get("meta"), "total"),
            };
        }
    }

    // Flat envelope: {data: [...], hasMore | pagination.hasMore, ...}
    if let Some(items) = body.get("data").and_then(Value::as_array) {
        let pagination = body.get("pagination");
        let has_more = body
            .get("hasMore")
            .and_then(Value::as_bool)
            .unwrap_or_else(|| bool_field(pagination, "hasMore"));
        let next_cursor = body
            .get("nextCursor")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .or_else(|| str_field(pagination, "nextCursor"));
        return Page {
            events: collect_events(items),
            has_more,
            next_cursor,
            total: i64_field(body.get("meta"), "total"),
        };
    }

    Page::empty()
}

/// Collapse the accepted timestamp renditions to ms since epoch.
///
/// Integers (or digit-only strings) below 1e12 are seconds, above are ms.
/// Anything else goes through ISO-8601 parsing. `None` means unusable.
pub fn normalize_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => {
            let raw = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            Some(scale_to_ms(raw))
        }
        Value::String(s) => {
            let s = s.trim();
            if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
                return s.parse::<i64>().ok().map(scale_to_ms);
            }
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.timestamp_millis());
            }
            // ISO-8601 without an offset: take it as UTC.
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|dt| dt.and_utc().timestamp_millis())
        }
        _ => None,
    }
}

fn scale_to_ms(raw: i64) -> i64 {
    if raw < MS_THRESHOLD { raw * 1000 } else { raw }
}

fn collect_events(items: &[Value]) -> Vec<IngestEvent> {
    items.iter().filter_map(event_from_value).collect()
}

/// `None` when the item lacks a string id or a usable timestamp; such
/// records are dropped without failing the page.
fn event_from_value(item: &Value) -> Option<IngestEvent> {
    let id = item.get("id").and_then(Value::as_str)?;
    let ts_value = TIMESTAMP_KEYS.iter().find_map(|key| item.get(*key))?;
    let timestamp_ms = normalize_timestamp(ts_value)?;
    Some(IngestEvent {
        event_id: id.to_owned(),
        timestamp_ms,
        payload: item.clone(),
    })
}

fn bool_field(obj: Option<&Value>, key: &str) -> bool {
    obj.and_then(|o| o.get(key))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn str_field(obj: Option<&Value>, key: &str) -> Option<String> {
    obj.and_then(|o| o.get(key))
        .and_then(Value::as_str)
        .map(str::to_owned)
}

fn i64_field(obj: Option<&Value>, key: &str) -> Option<i64> {
    obj.and_then(|o| o.get(key)).and_then(Value::as_i64)
}

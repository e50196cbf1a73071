//! Synthetic pagination cursors and timeline partitioning.
//!
//! The upstream API pages with opaque base64url cursors whose JSON payload
//! resolves position purely through its `ts` field. Encoding a chosen
//! timestamp therefore yields a valid continuation point anywhere on the
//! timeline, which is what makes range partitioning possible: each worker
//! enters its slice of the timeline through a forged cursor at the slice's
//! upper bound and walks downward.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::json;
use uuid::Uuid;

/// Protocol version literal the server embeds in its own cursors.
const CURSOR_VERSION: u8 = 2;
/// 2100-01-01T00:00:00Z, far past any expiry the server would mint.
const FAR_FUTURE_EXP_MS: i64 = 4_102_444_800_000;

/// Synthesize a cursor the server resolves to `ts_ms`.
///
/// The payload mirrors the server's own shape: `{id, ts, v, exp}` with a
/// nil id and a far-future expiry. Output is base64url without padding.
pub fn forge_cursor(ts_ms: i64) -> String {
    let payload = json!({
        "id": Uuid::nil().to_string(),
        "ts": ts_ms,
        "v": CURSOR_VERSION,
        "exp": FAR_FUTURE_EXP_MS,
    });
    URL_SAFE_NO_PAD.encode(payload.to_string())
}

/// Best-effort inverse of [`forge_cursor`]: extract the `ts` field.
///
/// Accepts padded or unpadded input in either base64 alphabet. Returns
/// `None` on any parse failure; never panics.
pub fn decode_cursor_ts(cursor: &str) -> Option<i64> {
    let normalized: String = cursor
        .trim()
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();
    let bytes = URL_SAFE_NO_PAD.decode(normalized.as_bytes()).ok()?;
    let payload: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    payload.get("ts")?.as_i64()
}

/// A half-open `[start_ts, end_ts)` slice of the ingestion timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeChunk {
    pub start_ts: i64,
    pub end_ts: i64,
}

/// Split the inclusive range `[ts_min, ts_max]` into `n` contiguous
/// half-open chunks of uniform width.
///
/// The final chunk ends at `ts_max + 1` so events landing exactly on
/// `ts_max` are still covered. `n` is treated as at least 1.
pub fn partition_timeline(ts_min: i64, ts_max: i64, n: usize) -> Vec<TimeChunk> {
    let n = n.max(1);
    let width = (ts_max - ts_min) as f64 / n as f64;
    (0..n)
        .map(|i| {
            let start = (ts_min as f64 + width * i as f64).floor() as i64;
            let end = if i == n - 1 {
                ts_max + 1
            } else {
                (ts_min as f64 + width * (i + 1) as f64).floor() as i64
            };
            TimeChunk {
                start_ts: start,
                end_ts: end,
            }
        })
        .collect()
}

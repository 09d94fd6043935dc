//! Utility functions for meshkv

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Range end selecting every key greater than or equal to the start key
pub const GTE_RANGE_END: &[u8] = &[0];

const TS_LEN: u32 = 5 * 8;
const CNT_LEN: u32 = 8;
const SUFFIX_LEN: u32 = TS_LEN + CNT_LEN;

/// Request ID generator.
///
/// IDs are laid out as `| peer (16 bits) | timestamp ms (40 bits) | counter (8 bits) |`.
/// The low 56 bits are seeded once from the clock and then only incremented,
/// so IDs stay unique per peer even if the clock moves backwards.
#[derive(Debug)]
pub struct IdGenerator {
    prefix: u64,
    suffix: AtomicU64,
}

impl IdGenerator {
    pub fn new(peer_uid: u64) -> Self {
        let prefix = (peer_uid & 0xffff) << SUFFIX_LEN;
        let ts = timestamp_now_millis() & ((1 << TS_LEN) - 1);
        Self {
            prefix,
            suffix: AtomicU64::new(ts << CNT_LEN),
        }
    }

    /// Next ID; strictly increasing for this generator
    pub fn next(&self) -> u64 {
        let suffix = self.suffix.fetch_add(1, Ordering::SeqCst) + 1;
        self.prefix | (suffix & ((1 << SUFFIX_LEN) - 1))
    }
}

/// Is `range_end` the "greater than or equal to key" sentinel?
pub fn is_gte_range(range_end: &[u8]) -> bool {
    range_end == GTE_RANGE_END
}

/// Range end covering every key with the given prefix.
///
/// Increments the last byte that is not `0xff` and truncates after it. An
/// all-`0xff` (or empty) prefix falls back to the `>= prefix` sentinel.
pub fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    GTE_RANGE_END.to_vec()
}

/// Does `key` fall inside `[start, end)` as interpreted by the KV surface?
pub fn key_in_range(key: &[u8], start: &[u8], end: Option<&[u8]>) -> bool {
    match end {
        None => key == start,
        Some(end) if end.is_empty() => key == start,
        Some(end) if is_gte_range(end) => key >= start,
        Some(end) => key >= start && key < end,
    }
}

/// Parse duration string (e.g., "30s", "5m", "1h", "250ms")
pub fn parse_duration(s: &str) -> crate::Result<std::time::Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else {
        let split = s.len() - s.chars().last().map(char::len_utf8).unwrap_or(0);
        (&s[..split], &s[split..])
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let duration = match unit {
        "ms" => std::time::Duration::from_millis(num),
        "s" => std::time::Duration::from_secs(num),
        "m" => std::time::Duration::from_secs(num * 60),
        "h" => std::time::Duration::from_secs(num * 3600),
        _ => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };

    Ok(duration)
}

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

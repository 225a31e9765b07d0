//! Unix-millisecond conversions shared by the domain math and the store.
//!
//! Readings are persisted as integer unix milliseconds so range scans stay
//! total-order correct no matter what UTC offset the decoder reported.

use time::OffsetDateTime;

pub(crate) fn unix_ms(ts: OffsetDateTime) -> i64 {
    (ts.unix_timestamp_nanos() / 1_000_000) as i64
}

pub(crate) fn from_unix_ms(ms: i64) -> OffsetDateTime {
    // Milliseconds written through `unix_ms` are always in range.
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

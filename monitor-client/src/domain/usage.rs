use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;

use crate::domain::counter::{classify, CounterPolicy, DeltaOutcome};
use crate::domain::Reading;
use crate::ts::{from_unix_ms, unix_ms};

/// One derived point of a usage series: energy consumed within the bucket
/// and the average power over the bucket. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsagePoint {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub kwh: f64,
    pub kw: f64,
}

/// A dense usage series for one meter, ascending by bucket start.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSeries {
    pub meter_id: String,
    pub points: Vec<UsagePoint>,
}

/// Turn one meter's raw readings into a dense bucketed series.
///
/// `readings` must be ascending by timestamp and should include the anchor
/// reading immediately before `start` so the first bucket's delta can be
/// computed. Each consecutive pair's energy is spread across the buckets
/// the interval overlaps, weighted by overlap duration, so reading cadence
/// and bucket width need not align. Buckets without any covering interval
/// are reported as zero, not omitted.
pub fn bucket_series(
    readings: &[Reading],
    start: OffsetDateTime,
    end: OffsetDateTime,
    width: Duration,
    units_per_kwh: f64,
    policy: &CounterPolicy,
) -> Vec<UsagePoint> {
    let width_ms = width.as_millis() as i64;
    if start >= end || width_ms <= 0 {
        return Vec::new();
    }

    let start_ms = unix_ms(start);
    let end_ms = unix_ms(end);
    let span_ms = end_ms - start_ms;
    let n = ((span_ms + width_ms - 1) / width_ms) as usize;

    let mut kwh_per_bucket = vec![0.0_f64; n];

    for pair in readings.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        let energy = match classify(prev, next, units_per_kwh, policy) {
            DeltaOutcome::Normal { kwh } => kwh,
            DeltaOutcome::Rejected { kwh: Some(kwh) } => kwh,
            DeltaOutcome::Reset | DeltaOutcome::Rejected { kwh: None } => continue,
        };
        if energy <= 0.0 {
            continue;
        }

        let t0 = unix_ms(prev.timestamp);
        let t1 = unix_ms(next.timestamp);
        let interval_ms = (t1 - t0) as f64;

        // Buckets the interval could touch, clamped to the query window.
        let first = ((t0 - start_ms).max(0) / width_ms) as usize;
        let last = (((t1 - start_ms - 1).max(0)) / width_ms).min(n as i64 - 1) as usize;

        for (k, bucket) in kwh_per_bucket
            .iter_mut()
            .enumerate()
            .take(last + 1)
            .skip(first)
        {
            let b0 = start_ms + k as i64 * width_ms;
            let b1 = b0 + width_ms;
            let overlap = (t1.min(b1) - t0.max(b0)) as f64;
            if overlap > 0.0 {
                *bucket += energy * overlap / interval_ms;
            }
        }
    }

    let bucket_hours = width_ms as f64 / 3_600_000.0;
    kwh_per_bucket
        .into_iter()
        .enumerate()
        .map(|(k, kwh)| UsagePoint {
            timestamp: from_unix_ms(start_ms + k as i64 * width_ms),
            kwh,
            kw: kwh / bucket_hours,
        })
        .collect()
}

use std::time::Duration;

use crate::domain::Reading;

/// Thresholds for classifying raw counter movement.
///
/// Raw meter counters are untrusted external input: they arrive out of
/// order, roll over, and get replaced wholesale when a meter is swapped.
/// The policy decides when a backwards step is a meter reset (large drop)
/// versus a transient glitch, and how long an interval can be before it is
/// useless for estimating power.
#[derive(Debug, Clone)]
pub struct CounterPolicy {
    /// A drop larger than this fraction of the previous value is a reset.
    pub reset_drop_fraction: f64,
    /// Intervals longer than this are excluded from power estimation.
    pub max_power_interval: Duration,
}

impl Default for CounterPolicy {
    fn default() -> Self {
        Self {
            reset_drop_fraction: 0.5,
            max_power_interval: Duration::from_secs(6 * 3600),
        }
    }
}

/// Outcome of comparing two chronologically ordered readings of one meter.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaOutcome {
    /// Counter moved forward; `kwh` is the consumed energy.
    Normal { kwh: f64 },
    /// Counter dropped far enough to call it a meter replacement or
    /// rollover. Contributes zero consumption for the interval.
    Reset,
    /// Pair unusable for a power estimate. `kwh` carries the energy delta
    /// when it is still non-negative (e.g. a long but monotonic interval),
    /// `None` when nothing can be salvaged.
    Rejected { kwh: Option<f64> },
}

/// Classify the movement between two readings of the same meter.
///
/// `prev` must be the chronologically earlier reading; a pair violating
/// that (or with equal timestamps) is `Rejected` outright. Never yields a
/// negative energy delta.
pub fn classify(
    prev: &Reading,
    next: &Reading,
    units_per_kwh: f64,
    policy: &CounterPolicy,
) -> DeltaOutcome {
    if next.timestamp <= prev.timestamp || units_per_kwh <= 0.0 {
        return DeltaOutcome::Rejected { kwh: None };
    }

    if next.cumulative_raw < prev.cumulative_raw {
        let drop = (prev.cumulative_raw - next.cumulative_raw) as f64;
        if drop > policy.reset_drop_fraction * prev.cumulative_raw as f64 {
            return DeltaOutcome::Reset;
        }
        // Small backwards step: a glitched report, not a reset.
        return DeltaOutcome::Rejected { kwh: None };
    }

    let kwh = (next.cumulative_raw - prev.cumulative_raw) as f64 / units_per_kwh;
    let elapsed = next.timestamp - prev.timestamp;
    if elapsed > policy.max_power_interval {
        // Too far apart to say anything about power, but the energy total
        // is still real and non-negative.
        return DeltaOutcome::Rejected { kwh: Some(kwh) };
    }

    DeltaOutcome::Normal { kwh }
}

/// Instantaneous power estimate from a meter's two most recent readings.
///
/// `latest` must be ascending by timestamp; only its last two entries are
/// consulted. Returns `None` with fewer than two readings or when the
/// newest pair classifies as anything but `Normal`.
pub fn estimate_current_kw(
    latest: &[Reading],
    units_per_kwh: f64,
    policy: &CounterPolicy,
) -> Option<f64> {
    if latest.len() < 2 {
        return None;
    }
    let prev = &latest[latest.len() - 2];
    let next = &latest[latest.len() - 1];

    match classify(prev, next, units_per_kwh, policy) {
        DeltaOutcome::Normal { kwh } => {
            let hours = (next.timestamp - prev.timestamp).as_seconds_f64() / 3600.0;
            if hours > 0.0 {
                Some(kwh / hours)
            } else {
                None
            }
        }
        _ => None,
    }
}

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// One raw cumulative-counter reading as reported by a physical meter.
///
/// `cumulative_raw` is in meter-native units (the meter's total since its
/// epoch); division by `units_per_kwh` happens in the counter model, not
/// here. Readings are immutable facts keyed by `(meter_id, timestamp)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub meter_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub cumulative_raw: i64,
}

/// Dashboard gauge thresholds for a single meter. All bands are optional
/// and independently settable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeterSettings {
    pub green_max_kw: Option<f64>,
    pub yellow_max_kw: Option<f64>,
    pub red_max_kw: Option<f64>,
}

impl MeterSettings {
    pub fn is_empty(&self) -> bool {
        self.green_max_kw.is_none() && self.yellow_max_kw.is_none() && self.red_max_kw.is_none()
    }
}

/// A known meter with its derived fields populated at query time.
///
/// Meters are created implicitly by the first accepted reading and never
/// deleted; `last_seen` and `current_estimated_kw` are recomputed from the
/// newest stored readings on every listing.
#[derive(Debug, Clone, Serialize)]
pub struct Meter {
    pub meter_id: String,
    pub label: Option<String>,
    pub active: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
    pub current_estimated_kw: Option<f64>,
    pub settings: Option<MeterSettings>,
}

/// Partial update for a meter's operator-editable fields. `None` leaves a
/// field untouched; a whitespace-only `label` clears it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MeterUpdate {
    pub label: Option<String>,
    pub active: Option<bool>,
    pub green_max_kw: Option<f64>,
    pub yellow_max_kw: Option<f64>,
    pub red_max_kw: Option<f64>,
}

impl MeterUpdate {
    pub fn touches_settings(&self) -> bool {
        self.green_max_kw.is_some() || self.yellow_max_kw.is_some() || self.red_max_kw.is_some()
    }
}

pub mod db;
pub mod domain;
mod ts;

pub use db::{ReadingStore, StoreError, UpsertOutcome};
pub use domain::{
    bucket_series, estimate_current_kw, CounterPolicy, DeltaOutcome, Meter, MeterSettings,
    MeterUpdate, Reading, UsagePoint, UsageSeries,
};

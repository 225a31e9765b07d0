pub mod counter;
pub mod meter;
pub mod usage;

pub use counter::{estimate_current_kw, CounterPolicy, DeltaOutcome};
pub use meter::{Meter, MeterSettings, MeterUpdate, Reading};
pub use usage::{bucket_series, UsagePoint, UsageSeries};

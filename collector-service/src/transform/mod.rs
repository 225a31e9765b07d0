use monitor_client::Reading;
use time::macros::datetime;

use crate::pipeline::{Envelope, PipelineError, Transform};

/// Pure validation of a parsed `Reading`.
///
/// Rules:
/// - the counter must be non-negative (parsers already enforce this, but
///   the pipeline is the contract boundary);
/// - the timestamp must fall in a broad sanity window [2000-01-01,
///   2100-01-01]; decoder clock glitches occasionally produce epoch or
///   far-future stamps.
pub fn validate_reading(env: Envelope<Reading>) -> Result<Envelope<Reading>, PipelineError> {
    let r = &env.payload;

    if r.cumulative_raw < 0 {
        return Err(PipelineError::Transform(
            "cumulative_raw must be non-negative".to_string(),
        ));
    }

    let min_ts = datetime!(2000-01-01 00:00:00 UTC);
    let max_ts = datetime!(2100-01-01 00:00:00 UTC);

    if r.timestamp < min_ts || r.timestamp > max_ts {
        return Err(PipelineError::Transform(
            "timestamp out of allowed range".to_string(),
        ));
    }

    Ok(env)
}

#[derive(Clone, Default)]
pub struct ReadingValidation;

#[async_trait::async_trait]
impl Transform<Reading, Reading> for ReadingValidation {
    async fn apply(&self, input: Envelope<Reading>) -> Result<Envelope<Reading>, PipelineError> {
        match validate_reading(input) {
            Ok(env) => Ok(env),
            Err(e) => {
                metrics::counter!("validation_reading_rejected_total").increment(1);
                Err(e)
            }
        }
    }
}

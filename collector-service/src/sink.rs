use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use monitor_client::{Reading, ReadingStore, StoreError, UpsertOutcome};
use tokio_util::sync::CancellationToken;

use crate::pipeline::{Envelope, IngestCounters, PipelineError, Sink};

/// Called every `progress_every` stored rows, with the shared counters.
pub type ProgressFn = Arc<dyn Fn(&IngestCounters) + Send + Sync>;

/// Writes validated readings into the reading store, one row per upsert.
///
/// rtlamr delivers a reading every few seconds per meter, so there is no
/// batching pressure; committing per row keeps the "in-flight rows survive
/// a shutdown" property trivial. Transient database errors are retried
/// with a linear backoff before the pipeline run is failed.
pub struct StoreSink {
    store: ReadingStore,
    counters: Arc<IngestCounters>,
    cancel: CancellationToken,
    max_retries: u32,
    retry_backoff: Duration,
    progress: Option<(u64, ProgressFn)>,
}

impl StoreSink {
    pub fn new(store: ReadingStore, counters: Arc<IngestCounters>, cancel: CancellationToken) -> Self {
        Self {
            store,
            counters,
            cancel,
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
            progress: None,
        }
    }

    /// Report progress every `every` stored rows. Used by the bulk import
    /// pipeline; the live pipeline leaves this unset.
    pub fn with_progress(mut self, every: u64, f: ProgressFn) -> Self {
        if every > 0 {
            self.progress = Some((every, f));
        }
        self
    }

    async fn store_one(&self, env: &Envelope<Reading>) -> Result<(), PipelineError> {
        let mut attempt: u32 = 0;
        loop {
            match self.store.upsert_reading(&env.payload).await {
                Ok(outcome) => {
                    match outcome {
                        UpsertOutcome::Inserted => {
                            self.counters.record_inserted(&env.payload.meter_id);
                            metrics::counter!("store_readings_inserted_total").increment(1);
                        }
                        UpsertOutcome::Duplicate => {
                            self.counters.record_duplicate(&env.payload.meter_id);
                            metrics::counter!("store_readings_duplicate_total").increment(1);
                        }
                    }

                    if let Ok(dur) = std::time::SystemTime::now().duration_since(env.received_at) {
                        let hist = metrics::histogram!("ingest_end_to_end_latency_seconds");
                        hist.record(dur.as_secs_f64());
                    }

                    return Ok(());
                }
                Err(e @ StoreError::Database(_)) if attempt < self.max_retries => {
                    attempt += 1;
                    let sleep_for = self.retry_backoff * attempt;
                    tracing::warn!(
                        error = %e,
                        attempt,
                        meter_id = %env.payload.meter_id,
                        "store sink write failed, retrying with backoff"
                    );
                    tokio::time::sleep(sleep_for).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "store sink write failed, giving up");
                    metrics::counter!("store_sink_errors_total").increment(1);
                    return Err(PipelineError::Sink(e.to_string()));
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Sink<Reading> for StoreSink {
    async fn run<S>(&self, mut input: S) -> Result<(), PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<Reading>, PipelineError>> + Send + Unpin + 'static,
    {
        loop {
            // Cancellation interrupts the wait for the next row, never a
            // write in progress, so a reading that made it out of the
            // source always reaches the store.
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tracing::info!("store sink stopping on cancellation");
                    return Ok(());
                }
                item = input.next() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            let env = match item {
                Ok(env) => env,
                Err(e) => {
                    // Rejected upstream (validation); counted here so the
                    // invalid total covers more than parse failures.
                    self.counters.record_invalid();
                    tracing::error!(error = %e, "error in upstream pipeline for StoreSink");
                    continue;
                }
            };

            self.store_one(&env).await?;

            if let Some((every, f)) = &self.progress {
                if self.counters.rows_stored() % every == 0 {
                    f(&self.counters);
                }
            }
        }

        Ok(())
    }
}

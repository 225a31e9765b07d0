use std::collections::HashSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use futures::{Stream, StreamExt};

/// A payload flowing through an ingestion pipeline, stamped with the time
/// it entered the process (for end-to-end latency metrics).
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub payload: T,
    pub received_at: SystemTime,
}

impl<T> Envelope<T> {
    pub fn now(payload: T) -> Self {
        Self {
            payload,
            received_at: SystemTime::now(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("source error: {0}")]
    Source(String),
    #[error("transform error: {0}")]
    Transform(String),
    #[error("sink error: {0}")]
    Sink(String),
}

#[async_trait::async_trait]
pub trait Source<T>: Send + Sync {
    async fn stream(
        &self,
    ) -> Pin<Box<dyn Stream<Item = Result<Envelope<T>, PipelineError>> + Send>>;
}

#[async_trait::async_trait]
pub trait Transform<I, O>: Send + Sync {
    async fn apply(&self, input: Envelope<I>) -> Result<Envelope<O>, PipelineError>;
}

#[async_trait::async_trait]
pub trait Sink<T>: Send + Sync {
    async fn run<S>(&self, input: S) -> Result<(), PipelineError>
    where
        S: Stream<Item = Result<Envelope<T>, PipelineError>> + Send + Unpin + 'static;
}

/// Source -> transforms -> sink, the shape every ingestion path in this
/// service takes (live decoder sessions, replay files, bulk imports).
pub struct Pipeline<S, T, K> {
    pub source: S,
    pub transforms: Vec<Arc<dyn Transform<T, T> + Send + Sync>>, // same-type transforms chain
    pub sink: K,
}

impl<T, S, K> Pipeline<S, T, K>
where
    T: Send + 'static,
    S: Source<T> + Send + Sync + 'static,
    K: Sink<T> + Send + Sync + 'static,
{
    pub async fn run(self) -> Result<(), PipelineError> {
        let mut stream = self.source.stream().await;

        // Apply transforms in sequence (if any).
        for t in self.transforms {
            let t_arc = t.clone();
            stream = Box::pin(stream.then(move |item| {
                let t_inner = t_arc.clone();
                async move {
                    match item {
                        Ok(env) => t_inner.apply(env).await,
                        Err(e) => Err(e),
                    }
                }
            }));
        }

        self.sink.run(stream).await
    }
}

/// Shared row accounting for one ingestion run.
///
/// The source, the sink and the progress reporter all hold the same
/// `Arc<IngestCounters>`; a live supervisor additionally reads it to tell
/// whether a decoder session delivered anything before it died.
#[derive(Debug, Default)]
pub struct IngestCounters {
    rows_processed: AtomicU64,
    rows_invalid: AtomicU64,
    rows_filtered: AtomicU64,
    rows_inserted: AtomicU64,
    rows_duplicate: AtomicU64,
    bytes_read: AtomicU64,
    distinct_meters: Mutex<HashSet<String>>,
}

impl IngestCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_row(&self) {
        self.rows_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid(&self) {
        self.rows_invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_filtered(&self) {
        self.rows_filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_inserted(&self, meter_id: &str) {
        self.rows_inserted.fetch_add(1, Ordering::Relaxed);
        self.note_meter(meter_id);
    }

    pub fn record_duplicate(&self, meter_id: &str) {
        self.rows_duplicate.fetch_add(1, Ordering::Relaxed);
        self.note_meter(meter_id);
    }

    pub fn record_bytes(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    fn note_meter(&self, meter_id: &str) {
        if let Ok(mut seen) = self.distinct_meters.lock() {
            if !seen.contains(meter_id) {
                seen.insert(meter_id.to_string());
            }
        }
    }

    pub fn rows_processed(&self) -> u64 {
        self.rows_processed.load(Ordering::Relaxed)
    }

    pub fn rows_invalid(&self) -> u64 {
        self.rows_invalid.load(Ordering::Relaxed)
    }

    pub fn rows_filtered(&self) -> u64 {
        self.rows_filtered.load(Ordering::Relaxed)
    }

    pub fn rows_inserted(&self) -> u64 {
        self.rows_inserted.load(Ordering::Relaxed)
    }

    pub fn rows_duplicate(&self) -> u64 {
        self.rows_duplicate.load(Ordering::Relaxed)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Readings that reached the store, inserted or deduplicated.
    pub fn rows_stored(&self) -> u64 {
        self.rows_inserted() + self.rows_duplicate()
    }

    pub fn distinct_meters(&self) -> u64 {
        self.distinct_meters.lock().map(|s| s.len() as u64).unwrap_or(0)
    }
}

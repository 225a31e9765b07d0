//! Bulk import of reading files.
//!
//! An upload is either a 3-column backup export or a capture in the live
//! CSV layout; the schema is decided from the first non-empty line before
//! a single row is committed, and a file matching neither layout is
//! rejected wholesale. Rows then flow through the same validate/store
//! pipeline as live ingestion, so dedup and validation behave identically.

use std::io;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use monitor_client::{Reading, ReadingStore};
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::pipeline::{IngestCounters, Pipeline, PipelineError, Transform};
use crate::protocol::detect_schema;
use crate::sink::StoreSink;
use crate::sources::{LineParser, LineStreamSource};
use crate::transform::ReadingValidation;

#[derive(thiserror::Error, Debug)]
pub enum ImportError {
    /// First non-empty line matches neither recognised layout. Nothing
    /// was committed.
    #[error("unrecognized import format")]
    UnrecognizedFormat,
    /// Another import already holds the single import slot.
    #[error("an import is already in progress")]
    Busy,
    /// The store stayed unavailable through the sink's retries. Rows
    /// committed before the failure stay committed; `partial` counts them.
    #[error("store write failed: {source}")]
    Store {
        source: PipelineError,
        partial: ImportSummary,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    /// Data rows seen (header and blank lines excluded).
    pub rows_total: u64,
    pub rows_imported: u64,
    pub rows_skipped_duplicate: u64,
    pub rows_skipped_invalid: u64,
    pub distinct_meters_seen: u64,
}

/// Progress stream emitted by [`Importer::run_streaming`]. Terminates
/// with exactly one `Completed` or `Failed`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ImportEvent {
    Progress {
        rows_processed: u64,
        /// Extrapolated from bytes consumed when the caller knows the
        /// total upload size; otherwise just the rows seen so far.
        rows_total_estimate: u64,
        rows_imported: u64,
        rows_skipped_duplicate: u64,
    },
    Completed(ImportSummary),
    Failed {
        error: String,
        /// Rows committed before the failure; present for store failures.
        #[serde(skip_serializing_if = "Option::is_none")]
        partial: Option<ImportSummary>,
    },
}

#[derive(Clone)]
pub struct Importer {
    store: ReadingStore,
    progress_every: u64,
    slot: Arc<Semaphore>,
}

impl Importer {
    pub fn new(store: ReadingStore, progress_every: u64) -> Self {
        Self {
            store,
            progress_every,
            slot: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.slot.available_permits() == 0
    }

    /// Run an import to completion and return the summary.
    pub async fn run<S>(&self, lines: S) -> Result<ImportSummary, ImportError>
    where
        S: Stream<Item = io::Result<String>> + Send + Unpin + 'static,
    {
        self.run_inner(lines, None, None, CancellationToken::new())
            .await
    }

    /// Run an import in the background, reporting progress as it goes.
    /// `total_bytes` (when the upload size is known) drives the row-count
    /// estimate in `Progress` events. Cancelling the token stops the
    /// import after the row in flight; the partial summary still arrives
    /// as `Completed`.
    pub fn run_streaming<S>(
        &self,
        lines: S,
        total_bytes: Option<u64>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<ImportEvent>
    where
        S: Stream<Item = io::Result<String>> + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(16);
        let importer = self.clone();
        tokio::spawn(async move {
            match importer
                .run_inner(lines, total_bytes, Some(tx.clone()), cancel)
                .await
            {
                Ok(summary) => {
                    let _ = tx.send(ImportEvent::Completed(summary)).await;
                }
                Err(e) => {
                    let partial = match &e {
                        ImportError::Store { partial, .. } => Some(partial.clone()),
                        _ => None,
                    };
                    let _ = tx
                        .send(ImportEvent::Failed {
                            error: e.to_string(),
                            partial,
                        })
                        .await;
                }
            }
        });
        rx
    }

    async fn run_inner<S>(
        &self,
        mut lines: S,
        total_bytes: Option<u64>,
        events: Option<mpsc::Sender<ImportEvent>>,
        cancel: CancellationToken,
    ) -> Result<ImportSummary, ImportError>
    where
        S: Stream<Item = io::Result<String>> + Send + Unpin + 'static,
    {
        let _permit = self
            .slot
            .clone()
            .try_acquire_owned()
            .map_err(|_| ImportError::Busy)?;

        // Detect the schema before committing anything. Consumed lines are
        // fed back in front of the remainder so the pipeline still sees
        // the whole file.
        let mut consumed: Vec<io::Result<String>> = Vec::new();
        let schema = loop {
            match lines.next().await {
                Some(Ok(line)) => {
                    if line.trim().is_empty() {
                        consumed.push(Ok(line));
                        continue;
                    }
                    let schema =
                        detect_schema(&line).ok_or(ImportError::UnrecognizedFormat)?;
                    consumed.push(Ok(line));
                    break schema;
                }
                Some(Err(e)) => return Err(ImportError::Io(e)),
                None => return Err(ImportError::UnrecognizedFormat),
            }
        };
        tracing::info!(?schema, "import schema detected");

        let counters = IngestCounters::new();
        let source = LineStreamSource::new(
            futures::stream::iter(consumed).chain(lines),
            LineParser::Import { schema },
            counters.clone(),
        );
        let mut sink = StoreSink::new(self.store.clone(), counters.clone(), cancel);
        if let Some(tx) = events {
            sink = sink.with_progress(
                self.progress_every,
                Arc::new(move |c: &IngestCounters| {
                    // Best effort; a full channel drops the update rather
                    // than stalling the import.
                    let _ = tx.try_send(ImportEvent::Progress {
                        rows_processed: c.rows_processed(),
                        rows_total_estimate: estimate_total_rows(c, total_bytes),
                        rows_imported: c.rows_inserted(),
                        rows_skipped_duplicate: c.rows_duplicate(),
                    });
                }),
            );
        }

        let pipeline = Pipeline {
            source,
            transforms: vec![
                Arc::new(ReadingValidation) as Arc<dyn Transform<Reading, Reading> + Send + Sync>
            ],
            sink,
        };
        pipeline.run().await.map_err(|source| ImportError::Store {
            partial: summarize(&counters),
            source,
        })?;

        let summary = summarize(&counters);
        tracing::info!(
            rows_total = summary.rows_total,
            rows_imported = summary.rows_imported,
            rows_skipped_duplicate = summary.rows_skipped_duplicate,
            rows_skipped_invalid = summary.rows_skipped_invalid,
            "import finished"
        );
        metrics::counter!("import_rows_imported_total").increment(summary.rows_imported);
        Ok(summary)
    }
}

fn summarize(counters: &IngestCounters) -> ImportSummary {
    let rows_total = counters.rows_processed();
    let rows_imported = counters.rows_inserted();
    let rows_skipped_duplicate = counters.rows_duplicate();
    ImportSummary {
        rows_total,
        rows_imported,
        rows_skipped_duplicate,
        // Parse failures plus rows the validation stage rejected.
        rows_skipped_invalid: rows_total - rows_imported - rows_skipped_duplicate,
        distinct_meters_seen: counters.distinct_meters(),
    }
}

fn estimate_total_rows(counters: &IngestCounters, total_bytes: Option<u64>) -> u64 {
    let processed = counters.rows_processed();
    match total_bytes {
        Some(total) if counters.bytes_read() > 0 => {
            (processed as u128 * total as u128 / counters.bytes_read() as u128) as u64
        }
        _ => processed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BACKUP_HEADER;
    use futures::stream;

    fn file_lines(body: &str) -> impl Stream<Item = io::Result<String>> + Unpin {
        stream::iter(
            body.lines()
                .map(|l| Ok(l.to_string()))
                .collect::<Vec<io::Result<String>>>(),
        )
    }

    fn backup_body(rows: &[(&str, &str, i64)]) -> String {
        let mut body = format!("{BACKUP_HEADER}\n");
        for (meter, ts, raw) in rows {
            body.push_str(&format!("{meter},{ts},{raw}\n"));
        }
        body
    }

    #[test]
    fn events_serialize_with_an_event_tag() {
        let event = ImportEvent::Progress {
            rows_processed: 10,
            rows_total_estimate: 20,
            rows_imported: 9,
            rows_skipped_duplicate: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "progress");
        assert_eq!(json["rows_total_estimate"], 20);

        let done = ImportEvent::Completed(ImportSummary {
            rows_total: 10,
            rows_imported: 9,
            rows_skipped_duplicate: 1,
            rows_skipped_invalid: 0,
            distinct_meters_seen: 2,
        });
        let json = serde_json::to_value(&done).unwrap();
        assert_eq!(json["event"], "completed");
        assert_eq!(json["rows_imported"], 9);

        let failed = ImportEvent::Failed {
            error: "store write failed".to_string(),
            partial: None,
        };
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["event"], "failed");
        assert!(json.get("partial").is_none());
    }

    #[tokio::test]
    async fn backup_import_is_idempotent() {
        let store = ReadingStore::in_memory().await.unwrap();
        let importer = Importer::new(store.clone(), 0);

        // 100 valid rows across two meters, quarter-hourly cadence.
        let rows: Vec<(String, String, i64)> = (0..100)
            .map(|i| {
                let meter = if i % 2 == 0 { "55297873" } else { "70011222" };
                let minutes = (i / 2) * 15;
                (
                    meter.to_string(),
                    format!("2024-01-01T{:02}:{:02}:00Z", minutes / 60, minutes % 60),
                    1000 + i64::from(i),
                )
            })
            .collect();
        let row_refs: Vec<(&str, &str, i64)> = rows
            .iter()
            .map(|(m, t, r)| (m.as_str(), t.as_str(), *r))
            .collect();
        let body = backup_body(&row_refs);

        let first = importer.run(file_lines(&body)).await.unwrap();
        assert_eq!(first.rows_total, 100);
        assert_eq!(first.rows_imported, 100);
        assert_eq!(first.rows_skipped_duplicate, 0);
        assert_eq!(first.rows_skipped_invalid, 0);
        assert_eq!(first.distinct_meters_seen, 2);

        // A byte-identical re-import changes nothing.
        let second = importer.run(file_lines(&body)).await.unwrap();
        assert_eq!(second.rows_imported, 0);
        assert_eq!(second.rows_skipped_duplicate, 100);
        assert_eq!(store.total_readings().await.unwrap(), 100);
    }

    #[tokio::test]
    async fn live_capture_import_counts_invalid_rows() {
        let store = ReadingStore::in_memory().await.unwrap();
        let importer = Importer::new(store.clone(), 0);
        let body = "\n2024-01-01T00:00:00Z,0,0,55297873,7,2,5,1000\n\
                    2024-01-01T00:05:00Z,0,0,55297873,7,2,5,not-a-number\n\
                    2024-01-01T00:10:00Z,0,0,55297873,7,2,5,1005\n";

        let summary = importer.run(file_lines(body)).await.unwrap();
        assert_eq!(summary.rows_total, 3);
        assert_eq!(summary.rows_imported, 2);
        assert_eq!(summary.rows_skipped_invalid, 1);
        assert_eq!(store.total_readings().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn unrecognized_files_are_rejected_before_any_write() {
        let store = ReadingStore::in_memory().await.unwrap();
        let importer = Importer::new(store.clone(), 0);

        let err = importer
            .run(file_lines("id;reading;when\n1;2;3\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::UnrecognizedFormat));

        let err = importer.run(file_lines("\n\n")).await.unwrap_err();
        assert!(matches!(err, ImportError::UnrecognizedFormat));

        assert_eq!(store.total_readings().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn a_second_concurrent_import_is_rejected() {
        let store = ReadingStore::in_memory().await.unwrap();
        let importer = Importer::new(store.clone(), 0);

        // First import blocks in schema detection while holding the slot.
        let _rx = importer.run_streaming(
            stream::pending::<io::Result<String>>(),
            None,
            CancellationToken::new(),
        );
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(importer.is_busy());

        let body = backup_body(&[("55297873", "2024-01-01T00:00:00Z", 1000)]);
        let err = importer.run(file_lines(&body)).await.unwrap_err();
        assert!(matches!(err, ImportError::Busy));
    }

    #[tokio::test]
    async fn streaming_import_reports_progress_then_completes() {
        let store = ReadingStore::in_memory().await.unwrap();
        let importer = Importer::new(store.clone(), 2);
        let rows: Vec<(String, String, i64)> = (0..5)
            .map(|i| {
                (
                    "55297873".to_string(),
                    format!("2024-01-01T00:{:02}:00Z", i),
                    1000 + i64::from(i),
                )
            })
            .collect();
        let row_refs: Vec<(&str, &str, i64)> = rows
            .iter()
            .map(|(m, t, r)| (m.as_str(), t.as_str(), *r))
            .collect();
        let body = backup_body(&row_refs);

        let mut rx = importer.run_streaming(
            file_lines(&body),
            Some(body.len() as u64),
            CancellationToken::new(),
        );
        let mut progress_events = 0;
        let mut completed = None;
        while let Some(event) = rx.recv().await {
            match event {
                ImportEvent::Progress { rows_imported, .. } => {
                    progress_events += 1;
                    assert!(rows_imported <= 5);
                }
                ImportEvent::Completed(summary) => completed = Some(summary),
                ImportEvent::Failed { error, .. } => panic!("import failed: {error}"),
            }
        }

        assert!(progress_events >= 1);
        let summary = completed.unwrap();
        assert_eq!(summary.rows_imported, 5);
        assert_eq!(summary.distinct_meters_seen, 1);
    }

    #[tokio::test]
    async fn store_failure_reports_committed_progress() {
        let store = ReadingStore::in_memory().await.unwrap();
        let importer = Importer::new(store.clone(), 0);
        let (tx, rx) = futures::channel::mpsc::unbounded::<io::Result<String>>();

        tx.unbounded_send(Ok(BACKUP_HEADER.to_string())).unwrap();
        tx.unbounded_send(Ok("55297873,2024-01-01T00:00:00Z,1000".to_string()))
            .unwrap();

        let mut events = importer.run_streaming(rx, None, CancellationToken::new());

        // Let the first row commit, then take the store away.
        while store.total_readings().await.unwrap() < 1 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        store.close().await;
        tx.unbounded_send(Ok("55297873,2024-01-01T00:30:00Z,1010".to_string()))
            .unwrap();
        drop(tx);

        let mut partial = None;
        while let Some(event) = events.recv().await {
            if let ImportEvent::Failed { partial: p, .. } = event {
                partial = p;
            }
        }

        let partial = partial.expect("failed event should carry the partial summary");
        assert_eq!(partial.rows_imported, 1);
        assert_eq!(partial.rows_total, 2);
    }

    #[tokio::test]
    async fn cancelled_import_reports_a_partial_summary() {
        let store = ReadingStore::in_memory().await.unwrap();
        let importer = Importer::new(store.clone(), 0);
        let body = backup_body(&[("55297873", "2024-01-01T00:00:00Z", 1000)]);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut rx = importer.run_streaming(file_lines(&body), None, cancel);

        let mut completed = None;
        while let Some(event) = rx.recv().await {
            if let ImportEvent::Completed(summary) = event {
                completed = Some(summary);
            }
        }

        // Cancelled before any row reached the store.
        let summary = completed.unwrap();
        assert_eq!(summary.rows_imported, 0);
        assert_eq!(store.total_readings().await.unwrap(), 0);
    }
}

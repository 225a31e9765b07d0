//! Transport-agnostic operation surface for the dashboard layer.
//!
//! Routing, auth and content negotiation live in the external HTTP
//! frontend; this module only exposes the operations with serialisable
//! shapes and a single error type per call.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use futures::Stream;
use monitor_client::{
    bucket_series, CounterPolicy, Meter, MeterUpdate, ReadingStore, StoreError, UsageSeries,
};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::filter::{read_filter_ids, write_filter_ids, FilterSet};
use crate::import::{ImportError, ImportEvent, ImportSummary, Importer};
use crate::supervisor::{PipelineState, SupervisorHandle};

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("meter {0} has never been seen")]
    MeterNotFound(String),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Import(#[from] ImportError),
    #[error("export failed: {0}")]
    Export(String),
    #[error("collector is not accepting commands")]
    CollectorUnavailable,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::MeterNotFound(id) => ApiError::MeterNotFound(id),
            other => ApiError::Store(other),
        }
    }
}

/// Which meters a usage query targets. The dashboard default is every
/// meter still marked active.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeterSelection {
    #[default]
    ActiveMeters,
    Ids(Vec<String>),
}

/// Collector status as shown in the dashboard header.
#[derive(Debug, Clone, Serialize)]
pub struct CollectorStatus {
    pub state: PipelineState,
    pub tracked_meter_ids: Vec<String>,
    pub discovery_mode: bool,
}

pub struct Api {
    store: ReadingStore,
    importer: Importer,
    supervisor: SupervisorHandle,
    filter_path: PathBuf,
    units_per_kwh: f64,
    policy: CounterPolicy,
}

impl Api {
    pub fn new(
        store: ReadingStore,
        importer: Importer,
        supervisor: SupervisorHandle,
        filter_path: PathBuf,
        units_per_kwh: f64,
        policy: CounterPolicy,
    ) -> Self {
        Self {
            store,
            importer,
            supervisor,
            filter_path,
            units_per_kwh,
            policy,
        }
    }

    pub async fn list_meters(&self) -> Result<Vec<Meter>, ApiError> {
        Ok(self
            .store
            .list_meters(self.units_per_kwh, &self.policy)
            .await?)
    }

    /// Partial update of a meter's operator-editable fields. Meters come
    /// into existence through readings, never through this call.
    pub async fn update_meter(
        &self,
        meter_id: &str,
        update: &MeterUpdate,
    ) -> Result<Meter, ApiError> {
        Ok(self
            .store
            .set_meter_fields(meter_id, update, self.units_per_kwh, &self.policy)
            .await?)
    }

    /// Bucketed usage for the selected meters over `[start, end)`. Every
    /// series is dense; meters without readings in range produce all-zero
    /// buckets.
    pub async fn usage(
        &self,
        selection: MeterSelection,
        start: OffsetDateTime,
        end: OffsetDateTime,
        bucket_width: Duration,
    ) -> Result<Vec<UsageSeries>, ApiError> {
        let meter_ids = match selection {
            MeterSelection::ActiveMeters => self.store.active_meter_ids().await?,
            MeterSelection::Ids(ids) => ids,
        };

        let mut series = Vec::with_capacity(meter_ids.len());
        for meter_id in meter_ids {
            let readings = self.store.query_range(&meter_id, start, end).await?;
            let points = bucket_series(
                &readings,
                start,
                end,
                bucket_width,
                self.units_per_kwh,
                &self.policy,
            );
            series.push(UsageSeries { meter_id, points });
        }
        Ok(series)
    }

    /// Raw readings for the given meters as backup-schema CSV, suitable
    /// for re-import.
    pub async fn export_backup_csv(
        &self,
        meter_ids: &[String],
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<String, ApiError> {
        let readings = self.store.export_range(meter_ids, start, end).await?;

        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(["meter_id", "timestamp", "cumulative_raw"])
            .map_err(|e| ApiError::Export(e.to_string()))?;
        for reading in &readings {
            let ts = reading
                .timestamp
                .format(&Rfc3339)
                .map_err(|e| ApiError::Export(e.to_string()))?;
            writer
                .write_record([
                    reading.meter_id.as_str(),
                    ts.as_str(),
                    &reading.cumulative_raw.to_string(),
                ])
                .map_err(|e| ApiError::Export(e.to_string()))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| ApiError::Export(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| ApiError::Export(e.to_string()))
    }

    pub async fn import_file<S>(&self, lines: S) -> Result<ImportSummary, ApiError>
    where
        S: Stream<Item = io::Result<String>> + Send + Unpin + 'static,
    {
        Ok(self.importer.run(lines).await?)
    }

    /// Streaming import; the caller keeps the token to cancel (e.g. on a
    /// dropped upload connection) and still receives the partial summary.
    pub fn import_file_streaming<S>(
        &self,
        lines: S,
        total_bytes: Option<u64>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<ImportEvent>
    where
        S: Stream<Item = io::Result<String>> + Send + Unpin + 'static,
    {
        self.importer.run_streaming(lines, total_bytes, cancel)
    }

    pub fn status(&self) -> CollectorStatus {
        let filter = read_filter_ids(&self.filter_path);
        CollectorStatus {
            state: self.supervisor.state(),
            discovery_mode: filter.is_discovery(),
            tracked_meter_ids: filter.ids().to_vec(),
        }
    }

    pub fn tracked_filter(&self) -> FilterSet {
        read_filter_ids(&self.filter_path)
    }

    /// Replace the tracked-meter filter. Persists the new set and tells
    /// the supervisor to restart the decoder with it; the restart is the
    /// observable effect, not an eventual side channel.
    pub async fn set_tracked_filter(&self, ids: Vec<String>) -> Result<FilterSet, ApiError> {
        let filter = FilterSet::new(ids);
        write_filter_ids(&self.filter_path, &filter)?;
        self.supervisor
            .set_filter(filter.ids().to_vec())
            .await
            .map_err(|_| ApiError::CollectorUnavailable)?;
        Ok(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::{
        BackoffPolicy, DecoderLauncher, DecoderSession, Supervisor,
    };
    use monitor_client::Reading;
    use std::sync::Arc;
    use time::macros::datetime;

    /// Launcher whose sessions produce no lines and never end; enough to
    /// give the API a live supervisor to talk to.
    struct IdleLauncher;

    #[async_trait::async_trait]
    impl DecoderLauncher for IdleLauncher {
        async fn launch(&self, _filter: &FilterSet) -> anyhow::Result<DecoderSession> {
            Ok(DecoderSession {
                lines: Box::pin(futures::stream::pending()),
                children: Vec::new(),
            })
        }
    }

    async fn test_api(dir: &tempfile::TempDir) -> (Api, ReadingStore) {
        let store = ReadingStore::in_memory().await.unwrap();
        let filter_path = dir.path().join("filter_ids.txt");
        let supervisor = Supervisor::new(
            Arc::new(IdleLauncher),
            store.clone(),
            filter_path.clone(),
            BackoffPolicy {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(100),
            },
        );
        let (handle, _join) = supervisor.spawn();
        let api = Api::new(
            store.clone(),
            Importer::new(store.clone(), 0),
            handle,
            filter_path,
            100.0,
            CounterPolicy::default(),
        );
        (api, store)
    }

    async fn seed(store: &ReadingStore, meter_id: &str, rows: &[(OffsetDateTime, i64)]) {
        for (ts, raw) in rows {
            store
                .upsert_reading(&Reading {
                    meter_id: meter_id.to_string(),
                    timestamp: *ts,
                    cumulative_raw: *raw,
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn usage_buckets_energy_for_active_meters() {
        let dir = tempfile::tempdir().unwrap();
        let (api, store) = test_api(&dir).await;
        seed(
            &store,
            "55297873",
            &[
                (datetime!(2024-01-01 00:00:00 UTC), 1000),
                (datetime!(2024-01-01 00:30:00 UTC), 1010),
                (datetime!(2024-01-01 01:00:00 UTC), 1040),
            ],
        )
        .await;

        let series = api
            .usage(
                MeterSelection::ActiveMeters,
                datetime!(2024-01-01 00:00:00 UTC),
                datetime!(2024-01-01 01:00:00 UTC),
                Duration::from_secs(3600),
            )
            .await
            .unwrap();

        assert_eq!(series.len(), 1);
        assert_eq!(series[0].meter_id, "55297873");
        assert_eq!(series[0].points.len(), 1);
        // 40 raw units at 100 units/kWh over one hour.
        assert!((series[0].points[0].kwh - 0.4).abs() < 1e-9);
        assert!((series[0].points[0].kw - 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn update_meter_rejects_unseen_ids() {
        let dir = tempfile::tempdir().unwrap();
        let (api, _store) = test_api(&dir).await;

        let err = api
            .update_meter(
                "99999999",
                &MeterUpdate {
                    label: Some("garage".to_string()),
                    ..MeterUpdate::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::MeterNotFound(id) if id == "99999999"));
    }

    #[tokio::test]
    async fn export_produces_reimportable_backup_csv() {
        let dir = tempfile::tempdir().unwrap();
        let (api, store) = test_api(&dir).await;
        seed(
            &store,
            "55297873",
            &[
                (datetime!(2024-01-01 00:00:00 UTC), 1000),
                (datetime!(2024-01-01 00:30:00 UTC), 1010),
            ],
        )
        .await;

        let csv = api
            .export_backup_csv(
                &["55297873".to_string()],
                datetime!(2024-01-01 00:00:00 UTC),
                datetime!(2024-01-02 00:00:00 UTC),
            )
            .await
            .unwrap();

        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("meter_id,timestamp,cumulative_raw"));
        assert_eq!(
            lines.next(),
            Some("55297873,2024-01-01T00:00:00Z,1000")
        );
        assert_eq!(
            lines.next(),
            Some("55297873,2024-01-01T00:30:00Z,1010")
        );
        assert_eq!(lines.next(), None);

        // The export round-trips through the importer as duplicates.
        let body: Vec<io::Result<String>> =
            csv.lines().map(|l| Ok(l.to_string())).collect();
        let summary = api
            .import_file(futures::stream::iter(body))
            .await
            .unwrap();
        assert_eq!(summary.rows_skipped_duplicate, 2);
        assert_eq!(summary.rows_imported, 0);
    }

    #[tokio::test]
    async fn set_tracked_filter_persists_and_updates_status() {
        let dir = tempfile::tempdir().unwrap();
        let (api, _store) = test_api(&dir).await;

        assert!(api.tracked_filter().is_discovery());

        let filter = api
            .set_tracked_filter(vec!["55297873".to_string(), "70011222".to_string()])
            .await
            .unwrap();
        assert_eq!(filter.ids().len(), 2);
        assert_eq!(api.tracked_filter(), filter);

        let status = api.status();
        assert!(!status.discovery_mode);
        assert_eq!(status.tracked_meter_ids, filter.ids());
    }

    #[tokio::test]
    async fn listing_shows_meters_created_by_ingestion() {
        let dir = tempfile::tempdir().unwrap();
        let (api, store) = test_api(&dir).await;
        seed(&store, "55297873", &[(datetime!(2024-01-01 00:00:00 UTC), 1000)]).await;

        let meters = api.list_meters().await.unwrap();
        assert_eq!(meters.len(), 1);
        assert_eq!(meters[0].meter_id, "55297873");
        assert!(meters[0].active);
    }
}

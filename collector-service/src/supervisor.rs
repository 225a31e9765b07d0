//! Decoder process supervision.
//!
//! The supervisor owns the live ingestion loop: launch rtlamr (and its
//! rtl_tcp companion), pump its stdout through the parse/validate/store
//! pipeline, and relaunch with exponential backoff whenever the session
//! dies. Filter changes from the API land here as commands and trigger a
//! clean restart with the new decoder arguments.

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::{Stream, StreamExt};
use monitor_client::{Reading, ReadingStore};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::LinesStream;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;

use crate::config::CollectorConfig;
use crate::filter::{read_filter_ids, write_filter_ids, FilterSet};
use crate::pipeline::{IngestCounters, Pipeline, Transform};
use crate::sink::StoreSink;
use crate::sources::{LineParser, LineStreamSource};
use crate::transform::ReadingValidation;

/// Where the live pipeline currently is, published over a watch channel so
/// the API layer can report it without asking the supervisor anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Stopped,
    Starting,
    Running,
    Crashed,
    Stopping,
}

#[derive(Debug)]
pub enum SupervisorCommand {
    /// Replace the tracked-meter filter and restart the decoder with it.
    SetFilter(Vec<String>),
    Shutdown,
}

/// A running decoder attempt: its line output plus the child processes
/// that must die with it. Children are spawned with `kill_on_drop`, so
/// dropping the session tears the processes down and ends the stream.
pub struct DecoderSession {
    pub lines: Pin<Box<dyn Stream<Item = io::Result<String>> + Send>>,
    pub children: Vec<Child>,
}

/// Best-effort kill; `kill_on_drop` is the backstop for anything that
/// survives this.
fn kill_children(children: &mut [Child]) {
    for child in children {
        let _ = child.start_kill();
    }
}

#[async_trait::async_trait]
pub trait DecoderLauncher: Send + Sync {
    async fn launch(&self, filter: &FilterSet) -> anyhow::Result<DecoderSession>;
}

/// Spawns rtl_tcp (if configured), waits out its tuner warmup, then spawns
/// rtlamr in CSV mode pointed at it.
pub struct RtlamrLauncher {
    cfg: CollectorConfig,
}

impl RtlamrLauncher {
    pub fn new(cfg: CollectorConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait::async_trait]
impl DecoderLauncher for RtlamrLauncher {
    async fn launch(&self, filter: &FilterSet) -> anyhow::Result<DecoderSession> {
        let mut children = Vec::new();

        if let Some(rtl_tcp) = &self.cfg.rtl_tcp_path {
            let child = Command::new(rtl_tcp)
                .arg("-a")
                .arg(&self.cfg.rtltcp_host)
                .arg("-p")
                .arg(self.cfg.rtltcp_port.to_string())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .with_context(|| format!("failed to spawn {rtl_tcp}"))?;
            children.push(child);

            // rtl_tcp refuses connections until the dongle is tuned.
            tokio::time::sleep(Duration::from_millis(self.cfg.rtl_tcp_warmup_ms)).await;
        }

        let mut cmd = Command::new(&self.cfg.rtlamr_path);
        cmd.arg("-format=csv").arg(format!(
            "-server={}:{}",
            self.cfg.rtltcp_host, self.cfg.rtltcp_port
        ));
        if let Some(ids) = filter.filter_arg() {
            cmd.arg(format!("-filterid={ids}"));
        }
        if self.cfg.unique {
            cmd.arg("-unique=true");
        }
        let mut child = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.cfg.rtlamr_path))?;
        let stdout = child
            .stdout
            .take()
            .context("rtlamr stdout was not captured")?;
        children.push(child);

        // A length-capped line codec so a corrupted decoder cannot make us
        // buffer without bound; over-long lines surface as stream errors
        // and are counted as invalid rows.
        let codec = LinesCodec::new_with_max_length(self.cfg.max_line_bytes);
        let lines = FramedRead::new(stdout, codec)
            .map(|res| res.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)));

        Ok(DecoderSession {
            lines: Box::pin(lines),
            children,
        })
    }
}

/// Feeds a captured decoder output file through the live pipeline exactly
/// once. Used with `Supervisor::one_shot` for replay mode.
pub struct ReplayLauncher {
    path: PathBuf,
}

impl ReplayLauncher {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait::async_trait]
impl DecoderLauncher for ReplayLauncher {
    async fn launch(&self, _filter: &FilterSet) -> anyhow::Result<DecoderSession> {
        let file = File::open(&self.path)
            .await
            .with_context(|| format!("failed to open replay file {}", self.path.display()))?;
        let lines = LinesStream::new(BufReader::new(file).lines());
        Ok(DecoderSession {
            lines: Box::pin(lines),
            children: Vec::new(),
        })
    }
}

/// Exponential backoff for decoder relaunches. `attempt` is 1-based; the
/// counter resets whenever a session managed to store at least one reading.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial.saturating_mul(1 << exp).min(self.max)
    }
}

/// Handle held by the API layer: observe pipeline state, change the
/// filter, request shutdown.
#[derive(Clone)]
pub struct SupervisorHandle {
    cmd_tx: mpsc::Sender<SupervisorCommand>,
    state_rx: watch::Receiver<PipelineState>,
}

impl SupervisorHandle {
    pub fn state(&self) -> PipelineState {
        *self.state_rx.borrow()
    }

    pub fn state_stream(&self) -> watch::Receiver<PipelineState> {
        self.state_rx.clone()
    }

    pub async fn set_filter(&self, ids: Vec<String>) -> anyhow::Result<()> {
        self.cmd_tx
            .send(SupervisorCommand::SetFilter(ids))
            .await
            .context("supervisor is no longer running")
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.cmd_tx
            .send(SupervisorCommand::Shutdown)
            .await
            .context("supervisor is no longer running")
    }
}

enum Step {
    Continue,
    Shutdown,
}

pub struct Supervisor {
    launcher: Arc<dyn DecoderLauncher>,
    store: ReadingStore,
    filter_path: PathBuf,
    backoff: BackoffPolicy,
    /// Run a single session to completion instead of relaunching (replay).
    one_shot: bool,
}

impl Supervisor {
    pub fn new(
        launcher: Arc<dyn DecoderLauncher>,
        store: ReadingStore,
        filter_path: PathBuf,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            launcher,
            store,
            filter_path,
            backoff,
            one_shot: false,
        }
    }

    pub fn one_shot(mut self) -> Self {
        self.one_shot = true;
        self
    }

    pub fn spawn(self) -> (SupervisorHandle, tokio::task::JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(PipelineState::Stopped);
        let handle = SupervisorHandle { cmd_tx, state_rx };
        let join = tokio::spawn(self.run(cmd_rx, state_tx));
        (handle, join)
    }

    async fn run(
        self,
        mut cmd_rx: mpsc::Receiver<SupervisorCommand>,
        state_tx: watch::Sender<PipelineState>,
    ) {
        let mut filter = read_filter_ids(&self.filter_path);
        let mut attempt: u32 = 0;

        loop {
            let _ = state_tx.send(PipelineState::Starting);
            let session = match self.launcher.launch(&filter).await {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!(error = %e, "decoder launch failed");
                    metrics::counter!("decoder_restarts_total").increment(1);
                    let _ = state_tx.send(PipelineState::Crashed);
                    if self.one_shot {
                        break;
                    }
                    attempt = attempt.saturating_add(1);
                    match self.wait_backoff(attempt, &mut cmd_rx, &mut filter).await {
                        Step::Continue => continue,
                        Step::Shutdown => break,
                    }
                }
            };

            let DecoderSession { lines, children } = session;
            let counters = IngestCounters::new();
            let session_cancel = CancellationToken::new();
            let source = LineStreamSource::new(
                lines,
                LineParser::Live {
                    filter: filter.clone(),
                },
                counters.clone(),
            );
            let sink = StoreSink::new(self.store.clone(), counters.clone(), session_cancel.clone());
            let pipeline = Pipeline {
                source,
                transforms: vec![
                    Arc::new(ReadingValidation) as Arc<dyn Transform<Reading, Reading> + Send + Sync>
                ],
                sink,
            };

            let _ = state_tx.send(PipelineState::Running);
            tracing::info!(
                discovery = filter.is_discovery(),
                tracked = filter.ids().len(),
                "decoder session started"
            );
            let mut run = tokio::spawn(pipeline.run());

            let mut children = children;

            tokio::select! {
                res = &mut run => {
                    kill_children(&mut children);
                    match res {
                        Ok(Ok(())) => tracing::warn!("decoder session ended"),
                        Ok(Err(e)) => tracing::warn!(error = %e, "decoder session failed"),
                        Err(e) => tracing::error!(error = %e, "decoder session task panicked"),
                    }
                    tracing::info!(
                        rows_stored = counters.rows_stored(),
                        rows_invalid = counters.rows_invalid(),
                        rows_filtered = counters.rows_filtered(),
                        "decoder session summary"
                    );
                    if self.one_shot {
                        break;
                    }
                    metrics::counter!("decoder_restarts_total").increment(1);
                    let _ = state_tx.send(PipelineState::Crashed);
                    // A session that delivered data earns a fresh backoff.
                    if counters.rows_stored() > 0 {
                        attempt = 0;
                    }
                    attempt = attempt.saturating_add(1);
                    match self.wait_backoff(attempt, &mut cmd_rx, &mut filter).await {
                        Step::Continue => continue,
                        Step::Shutdown => break,
                    }
                }
                cmd = cmd_rx.recv() => {
                    let _ = state_tx.send(PipelineState::Stopping);
                    session_cancel.cancel();
                    // Killing the decoder closes its stdout, which ends the
                    // line stream and lets the session task finish.
                    kill_children(&mut children);
                    let _ = run.await;
                    match cmd {
                        Some(SupervisorCommand::SetFilter(ids)) => {
                            filter = self.apply_filter(ids);
                            attempt = 0;
                        }
                        Some(SupervisorCommand::Shutdown) | None => break,
                    }
                }
            }
        }

        let _ = state_tx.send(PipelineState::Stopped);
        tracing::info!("supervisor stopped");
    }

    fn apply_filter(&self, ids: Vec<String>) -> FilterSet {
        let filter = FilterSet::new(ids);
        if let Err(e) = write_filter_ids(&self.filter_path, &filter) {
            tracing::warn!(
                error = %e,
                path = %self.filter_path.display(),
                "failed to persist filter file"
            );
        }
        filter
    }

    async fn wait_backoff(
        &self,
        attempt: u32,
        cmd_rx: &mut mpsc::Receiver<SupervisorCommand>,
        filter: &mut FilterSet,
    ) -> Step {
        let delay = self.backoff.delay(attempt);
        tracing::info!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "relaunching decoder after backoff"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => Step::Continue,
            cmd = cmd_rx.recv() => match cmd {
                Some(SupervisorCommand::SetFilter(ids)) => {
                    *filter = self.apply_filter(ids);
                    Step::Continue
                }
                Some(SupervisorCommand::Shutdown) | None => Step::Shutdown,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::Write;
    use std::sync::Mutex;

    struct FakeSession {
        lines: Vec<String>,
        then_hang: bool,
    }

    /// Scripted launcher: each launch pops the next session; running out
    /// of sessions fails the launch like a missing binary would.
    struct FakeLauncher {
        sessions: Mutex<VecDeque<FakeSession>>,
        filters_seen: Mutex<Vec<FilterSet>>,
    }

    impl FakeLauncher {
        fn new(sessions: Vec<FakeSession>) -> Arc<Self> {
            Arc::new(Self {
                sessions: Mutex::new(sessions.into()),
                filters_seen: Mutex::new(Vec::new()),
            })
        }

        fn launches(&self) -> usize {
            self.filters_seen.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl DecoderLauncher for FakeLauncher {
        async fn launch(&self, filter: &FilterSet) -> anyhow::Result<DecoderSession> {
            self.filters_seen.lock().unwrap().push(filter.clone());
            let session = self
                .sessions
                .lock()
                .unwrap()
                .pop_front()
                .context("no scripted session left")?;
            let base = futures::stream::iter(session.lines.into_iter().map(io::Result::Ok));
            let lines: Pin<Box<dyn Stream<Item = io::Result<String>> + Send>> =
                if session.then_hang {
                    Box::pin(base.chain(futures::stream::pending()))
                } else {
                    Box::pin(base)
                };
            Ok(DecoderSession {
                lines,
                children: Vec::new(),
            })
        }
    }

    fn line(ts: &str, meter_id: &str, raw: i64) -> String {
        format!("{ts},0,0,{meter_id},7,2,5,{raw}")
    }

    fn test_backoff() -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(100),
        }
    }

    async fn wait_for_rows(store: &ReadingStore, n: i64) {
        for _ in 0..500 {
            if store.total_readings().await.unwrap() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for {n} stored rows");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(60),
        };
        assert_eq!(policy.delay(1), Duration::from_secs(5));
        assert_eq!(policy.delay(2), Duration::from_secs(10));
        assert_eq!(policy.delay(3), Duration::from_secs(20));
        assert_eq!(policy.delay(5), Duration::from_secs(60));
        assert_eq!(policy.delay(30), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn one_shot_session_stores_readings_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReadingStore::in_memory().await.unwrap();
        let launcher = FakeLauncher::new(vec![FakeSession {
            lines: vec![
                "recv.go:135: rtltcp.SampleRate: 2359296".to_string(),
                line("2024-01-01T00:00:00Z", "55297873", 1000),
                line("2024-01-01T00:30:00Z", "55297873", 1010),
            ],
            then_hang: false,
        }]);

        let supervisor = Supervisor::new(
            launcher.clone(),
            store.clone(),
            dir.path().join("filter_ids.txt"),
            test_backoff(),
        )
        .one_shot();
        let (handle, join) = supervisor.spawn();
        join.await.unwrap();

        assert_eq!(handle.state(), PipelineState::Stopped);
        assert_eq!(store.total_readings().await.unwrap(), 2);
        assert_eq!(launcher.launches(), 1);
    }

    #[tokio::test]
    async fn relaunches_after_a_session_dies() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReadingStore::in_memory().await.unwrap();
        let launcher = FakeLauncher::new(vec![
            FakeSession {
                lines: vec![line("2024-01-01T00:00:00Z", "55297873", 1000)],
                then_hang: false,
            },
            FakeSession {
                lines: vec![line("2024-01-01T00:30:00Z", "55297873", 1010)],
                then_hang: true,
            },
        ]);

        let supervisor = Supervisor::new(
            launcher.clone(),
            store.clone(),
            dir.path().join("filter_ids.txt"),
            test_backoff(),
        );
        let (handle, join) = supervisor.spawn();

        wait_for_rows(&store, 2).await;
        assert!(launcher.launches() >= 2);

        handle.shutdown().await.unwrap();
        join.await.unwrap();
        assert_eq!(handle.state(), PipelineState::Stopped);
    }

    #[tokio::test]
    async fn set_filter_persists_and_restarts_the_decoder() {
        let dir = tempfile::tempdir().unwrap();
        let filter_path = dir.path().join("filter_ids.txt");
        let store = ReadingStore::in_memory().await.unwrap();
        let launcher = FakeLauncher::new(vec![
            FakeSession {
                lines: vec![],
                then_hang: true,
            },
            FakeSession {
                lines: vec![],
                then_hang: true,
            },
        ]);

        let supervisor = Supervisor::new(
            launcher.clone(),
            store.clone(),
            filter_path.clone(),
            test_backoff(),
        );
        let (handle, join) = supervisor.spawn();

        let mut state = handle.state_stream();
        state
            .wait_for(|s| *s == PipelineState::Running)
            .await
            .unwrap();

        handle.set_filter(vec!["55297873".to_string()]).await.unwrap();
        for _ in 0..500 {
            if launcher.launches() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let seen = launcher.filters_seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].is_discovery());
        assert_eq!(seen[1].ids(), ["55297873".to_string()]);
        assert_eq!(
            read_filter_ids(&filter_path),
            FilterSet::new(["55297873".to_string()])
        );

        handle.shutdown().await.unwrap();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn replay_launcher_streams_a_capture_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "recv.go:135: rtltcp.SampleRate: 2359296").unwrap();
        writeln!(file, "{}", line("2024-01-01T00:00:00Z", "55297873", 1000)).unwrap();
        writeln!(file, "{}", line("2024-01-01T00:30:00Z", "55297873", 1010)).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let store = ReadingStore::in_memory().await.unwrap();
        let launcher = Arc::new(ReplayLauncher::new(file.path().to_path_buf()));
        let supervisor = Supervisor::new(
            launcher,
            store.clone(),
            dir.path().join("filter_ids.txt"),
            test_backoff(),
        )
        .one_shot();
        let (handle, join) = supervisor.spawn();
        join.await.unwrap();

        assert_eq!(handle.state(), PipelineState::Stopped);
        assert_eq!(store.total_readings().await.unwrap(), 2);
    }
}

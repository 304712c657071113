use std::sync::Arc;

use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cluster::Cluster;
use crate::errors::{AppError, AppResult};
use crate::locate::{locate, LocateOptions};
use crate::podwatch::watcher::{spawn_phase_watcher, WatchOptions};
use crate::state::SessionState;
use crate::stream::multiplexer::{self, MuxOutcome, StreamOptions};
use crate::steps::sequence;
use crate::types::{BuildRef, TerminalResult};

#[derive(Clone, Copy, Debug)]
pub struct SessionConfig {
    pub locate: LocateOptions,
    /// Capacity of the phase watcher -> multiplexer event channel.
    pub event_capacity: usize,
    pub watch: WatchOptions,
    pub stream: StreamOptions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            locate: LocateOptions::default(),
            event_capacity: 32,
            watch: WatchOptions::default(),
            stream: StreamOptions::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionReport {
    pub result: TerminalResult,
    /// Steps whose logs could not be read. Does not affect `result`.
    pub logs_unavailable: Vec<String>,
    /// The output sink closed before the build finished.
    pub output_closed: bool,
}

impl SessionReport {
    fn cancelled() -> Self {
        Self {
            result: TerminalResult::Cancelled,
            logs_unavailable: Vec::new(),
            output_closed: false,
        }
    }
}

/// Streams the logs of one build from pod discovery to terminal state.
pub struct LogSession {
    cluster: Arc<dyn Cluster>,
    config: SessionConfig,
}

impl LogSession {
    pub fn new(cluster: Arc<dyn Cluster>, config: SessionConfig) -> Self {
        Self { cluster, config }
    }

    /// Blocks until the build is terminal or `cancel` fires.
    ///
    /// Build outcomes, including failed steps and cancellation, come back as
    /// `Ok`. `Err` is reserved for a session that could not run: no pod, more
    /// than one pod, or a watch that gave up.
    pub async fn stream<W>(
        &self,
        build: &BuildRef,
        sink: &mut W,
        cancel: CancellationToken,
    ) -> AppResult<SessionReport>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let pod = match locate(self.cluster.as_ref(), build, self.config.locate, &cancel).await {
            Ok(pod) => pod,
            Err(AppError::Cancelled) => return Ok(SessionReport::cancelled()),
            Err(e) => return Err(e),
        };

        let steps = sequence(&pod);
        tracing::info!(
            namespace = %pod.key.namespace,
            pod = %pod.key.name,
            steps = ?steps.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            "streaming build logs"
        );

        let state = Arc::new(SessionState::new(pod, steps));
        let tasks = cancel.child_token();
        let (tx, rx) = mpsc::channel(self.config.event_capacity.max(1));

        let watcher = spawn_phase_watcher(
            self.cluster.clone(),
            state.clone(),
            tx,
            self.config.watch,
            tasks.child_token(),
        );

        let muxed = multiplexer::run(
            self.cluster.clone(),
            state.clone(),
            rx,
            sink,
            self.config.stream,
            tasks.child_token(),
        )
        .await;

        // Stop the watch (and anything still open) before reporting.
        tasks.cancel();
        let watched = match watcher.await {
            Ok(r) => r,
            Err(e) => Err(AppError::Other(format!("phase watcher task failed: {e}"))),
        };

        if cancel.is_cancelled() {
            return Ok(SessionReport::cancelled());
        }

        let report = match muxed {
            Ok(report) => report,
            // A watcher that gave up explains the early end better than the multiplexer can.
            Err(e) => return Err(watched.err().unwrap_or(e)),
        };

        let (result, output_closed) = match report.outcome {
            MuxOutcome::Succeeded => (TerminalResult::Succeeded, false),
            MuxOutcome::Failed(reason) => (TerminalResult::Failed(reason), false),
            MuxOutcome::Cancelled => (TerminalResult::Cancelled, false),
            MuxOutcome::OutputClosed => (TerminalResult::Cancelled, true),
        };

        tracing::debug!(
            pod = %state.pod.key.name,
            result = ?result,
            phase = ?state.phase(),
            "log session finished"
        );

        Ok(SessionReport {
            result,
            logs_unavailable: report.logs_unavailable,
            output_closed,
        })
    }
}

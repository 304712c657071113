use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::AsyncReadExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::{sleep_or_cancel, Backoff};
use crate::cluster::{Cluster, LogStream};
use crate::errors::{AppError, AppResult};
use crate::state::{Progress, SessionState};
use crate::types::{ContainerSpec, FailureReason, PodPhase, StepEvent, StepState};

#[derive(Clone, Copy, Debug)]
pub struct StreamOptions {
    /// Attempts per step before its logs are declared unavailable.
    pub attempts: u32,
    pub retry_delay: Duration,
    /// How long an EOF may precede the step's terminal status before it is
    /// treated as a dropped connection.
    pub eof_grace: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            retry_delay: Duration::from_millis(250),
            eof_grace: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MuxOutcome {
    Succeeded,
    Failed(FailureReason),
    Cancelled,
    /// The output sink went away.
    OutputClosed,
}

#[derive(Clone, Debug)]
pub struct MuxReport {
    pub outcome: MuxOutcome,
    /// Steps whose logs could not be read.
    pub logs_unavailable: Vec<String>,
}

enum Copied {
    /// Stream reached EOF.
    Eof,
    /// Connection broke mid-stream.
    Broken(io::Error),
    Cancelled,
    OutputClosed,
}

/// Copies step logs to `sink` in step order as the phase watcher reports progress.
///
/// Events are drained by a separate pump task into the session's progress
/// cell, so a long blocking read never stalls the watcher.
pub async fn run<W>(
    cluster: Arc<dyn Cluster>,
    state: Arc<SessionState>,
    events: mpsc::Receiver<StepEvent>,
    sink: &mut W,
    opts: StreamOptions,
    cancel: CancellationToken,
) -> AppResult<MuxReport>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    let pump = spawn_pump(state.clone(), events);
    let mut mux = Multiplexer {
        cluster,
        progress: state.progress(),
        state,
        opts,
        cancel,
        logs_unavailable: Vec::new(),
    };

    let outcome = mux.copy_all(sink).await;
    pump.abort();

    Ok(MuxReport {
        outcome: outcome?,
        logs_unavailable: mux.logs_unavailable,
    })
}

fn spawn_pump(state: Arc<SessionState>, mut events: mpsc::Receiver<StepEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            state.record(event);
        }
        state.close_progress();
    })
}

struct Multiplexer {
    cluster: Arc<dyn Cluster>,
    state: Arc<SessionState>,
    progress: watch::Receiver<Progress>,
    opts: StreamOptions,
    cancel: CancellationToken,
    logs_unavailable: Vec<String>,
}

impl Multiplexer {
    async fn copy_all<W>(&mut self, sink: &mut W) -> AppResult<MuxOutcome>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let steps = self.state.steps.clone();

        for (i, step) in steps.iter().enumerate() {
            self.state.set_cursor(i);

            let Some(progress) = self.wait(|p| p.step_ready(i)).await? else {
                return Ok(MuxOutcome::Cancelled);
            };
            if progress.steps[i] == StepState::Waiting {
                // Build ended (or the watch died) before this step ran.
                return stopped(&progress, step);
            }

            match self.copy_step(i, step, sink).await? {
                Copied::Cancelled => return Ok(MuxOutcome::Cancelled),
                Copied::OutputClosed => return Ok(MuxOutcome::OutputClosed),
                Copied::Eof | Copied::Broken(_) => {}
            }

            let Some(progress) = self.wait(|p| p.step_settled(i)).await? else {
                return Ok(MuxOutcome::Cancelled);
            };
            match progress.steps[i] {
                StepState::Completed => continue,
                StepState::Failed => {
                    let reason = progress.failures[i]
                        .clone()
                        .unwrap_or_else(|| FailureReason::pod(format!("step {} failed", step.name)));
                    return Ok(MuxOutcome::Failed(reason));
                }
                StepState::Waiting | StepState::Streaming => return stopped(&progress, step),
            }
        }

        self.state.set_cursor(steps.len());
        let Some(progress) = self.wait(|p| p.terminal.is_some() || p.closed).await? else {
            return Ok(MuxOutcome::Cancelled);
        };
        match progress.terminal {
            Some(t) if t.phase == PodPhase::Failed => Ok(MuxOutcome::Failed(
                t.reason.unwrap_or_else(|| FailureReason::pod("build pod failed")),
            )),
            Some(_) => Ok(MuxOutcome::Succeeded),
            None => Err(watch_ended()),
        }
    }

    /// Streams one step, reconnecting on transient failures without repeating
    /// bytes already written.
    async fn copy_step<W>(&mut self, i: usize, step: &ContainerSpec, sink: &mut W) -> AppResult<Copied>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let pod = self.state.pod.key.clone();
        let mut backoff = Backoff::new(self.opts.retry_delay, self.opts.retry_delay * 8);
        let mut attempts_left = self.opts.attempts;
        let mut written: u64 = 0;

        loop {
            let opened = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(Copied::Cancelled),
                r = self.cluster.open_log(&pod, &step.name) => r,
            };

            let failure = match opened {
                Ok(reader) => {
                    let before = written;
                    let copied = copy_stream(reader, sink, &mut written, &self.cancel).await;
                    if written > before {
                        attempts_left = self.opts.attempts;
                        backoff.reset();
                    }

                    match copied {
                        Copied::Eof => {
                            // EOF normally means the container exited. Confirm it.
                            let settled = tokio::time::timeout(
                                self.opts.eof_grace,
                                self.wait(|p| p.step_settled(i)),
                            )
                            .await;
                            match settled {
                                Ok(Ok(None)) => return Ok(Copied::Cancelled),
                                Ok(Ok(Some(_))) => return Ok(Copied::Eof),
                                Ok(Err(e)) => return Err(e),
                                Err(_) => "stream ended while the step was still running".to_string(),
                            }
                        }
                        Copied::Broken(e) => e.to_string(),
                        other => return Ok(other),
                    }
                }
                Err(e) => e.to_string(),
            };

            attempts_left = attempts_left.saturating_sub(1);
            if attempts_left == 0 {
                tracing::warn!(
                    namespace = %pod.namespace,
                    pod = %pod.name,
                    step = %step.name,
                    error = %failure,
                    "logs unavailable for step"
                );
                self.logs_unavailable.push(step.name.clone());
                return Ok(Copied::Broken(io::Error::other(failure)));
            }

            let delay = backoff.next_delay();
            tracing::debug!(
                pod = %pod.name,
                step = %step.name,
                error = %failure,
                delay_ms = delay.as_millis() as u64,
                "log stream interrupted; reopening"
            );
            if !sleep_or_cancel(delay, &self.cancel).await {
                return Ok(Copied::Cancelled);
            }
        }
    }

    /// Waits until `pred` holds for the recorded progress. `None` when cancelled.
    async fn wait(&self, pred: impl FnMut(&Progress) -> bool) -> AppResult<Option<Progress>> {
        let mut rx = self.progress.clone();
        tokio::select! {
            _ = self.cancel.cancelled() => Ok(None),
            r = rx.wait_for(pred) => match r {
                Ok(p) => Ok(Some(p.clone())),
                Err(_) => Err(watch_ended()),
            },
        }
    }
}

/// Copies `reader` to `sink` until EOF, skipping the first `written` bytes
/// (already delivered by an earlier connection) and advancing `written`.
async fn copy_stream<W>(
    mut reader: LogStream,
    sink: &mut W,
    written: &mut u64,
    cancel: &CancellationToken,
) -> Copied
where
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    let mut skip = *written;
    let mut buf = vec![0u8; 8 * 1024];

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return Copied::Cancelled,
            r = reader.read(&mut buf) => match r {
                Ok(0) => return Copied::Eof,
                Ok(n) => n,
                Err(e) => return Copied::Broken(e),
            },
        };

        let from = std::cmp::min(skip, n as u64) as usize;
        skip -= from as u64;
        if from == n {
            continue;
        }

        let wrote = tokio::select! {
            _ = cancel.cancelled() => return Copied::Cancelled,
            r = write_chunk(sink, &buf[from..n]) => r,
        };
        match wrote {
            Ok(()) => *written += (n - from) as u64,
            Err(e) => {
                tracing::debug!(error = %e, "output closed");
                return Copied::OutputClosed;
            }
        }
    }
}

async fn write_chunk<W>(sink: &mut W, bytes: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    sink.write_all(bytes).await?;
    sink.flush().await
}

/// Outcome when the build stopped with step `step` not finished.
fn stopped(progress: &Progress, step: &ContainerSpec) -> AppResult<MuxOutcome> {
    match &progress.terminal {
        Some(t) if t.phase == PodPhase::Failed => Ok(MuxOutcome::Failed(
            t.reason
                .clone()
                .unwrap_or_else(|| FailureReason::pod("build pod failed")),
        )),
        Some(t) => Err(AppError::Other(format!(
            "build pod reached {:?} before step {} finished",
            t.phase, step.name
        ))),
        None => Err(watch_ended()),
    }
}

fn watch_ended() -> AppError {
    AppError::WatchConnection("pod watch ended before the build finished".to_string())
}

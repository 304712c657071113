pub mod backoff;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod errors;
pub mod locate;
pub mod logging;
pub mod podwatch;
pub mod report;
pub mod session;
pub mod shutdown;
pub mod state;
pub mod steps;
pub mod stream;
pub mod types;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;

use crate::cluster::kube::{make_client, KubeCluster};
use crate::cluster::scripted::{BuildScript, ScriptedCluster};
use crate::cluster::Cluster;
use crate::config::Config;
use crate::errors::AppResult;
use crate::session::LogSession;
use crate::shutdown::{Shutdown, ShutdownReason};
use crate::types::TerminalResult;

/// Streams the logs of `config.build` to stdout and prints the final result line.
pub async fn run(config: Config) -> AppResult<TerminalResult> {
    let shutdown = Shutdown::new();
    shutdown.listen_for_signals();

    // Pick the cluster backend depending on mode.
    let cluster: Arc<dyn Cluster> = match &config.dev {
        Some(dev) => {
            tracing::info!("starting dev-mode build simulation");
            let mut script = BuildScript::demo(
                config.build.as_str(),
                dev.lines,
                dev.fail_step.as_deref(),
            );
            script.namespace = config.namespace.clone();
            script.line_delay = Duration::from_millis(dev.rate_ms);
            ScriptedCluster::start(script)
        }
        None => {
            let client = make_client().await?;
            Arc::new(KubeCluster::new(
                client,
                config.namespace.clone(),
                config.label_key.clone(),
                config.selector.clone(),
            ))
        }
    };

    let session = LogSession::new(cluster, config.session);
    let mut stdout = tokio::io::stdout();
    let streamed = session
        .stream(&config.build, &mut stdout, shutdown.token())
        .await;

    // Signal listener is no longer needed either way.
    shutdown.cancel();
    let session_report = streamed?;

    if session_report.output_closed {
        tracing::info!(reason = ?ShutdownReason::OutputClosed, "shutting down");
        return Ok(session_report.result);
    }

    let line = report::result_line(&config.build, &session_report, &config.output);
    if let Err(e) = write_line(&mut stdout, &line).await {
        if e.kind() != io::ErrorKind::BrokenPipe {
            return Err(e.into());
        }
    }

    Ok(session_report.result)
}

async fn write_line(out: &mut tokio::io::Stdout, line: &str) -> io::Result<()> {
    out.write_all(line.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await
}

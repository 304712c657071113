use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use kpack_logs::cluster::scripted::{BuildScript, ScriptStep, ScriptedCluster};
use kpack_logs::errors::AppError;
use kpack_logs::session::{LogSession, SessionConfig, SessionReport};
use kpack_logs::types::{BuildRef, TerminalResult};
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

fn expected_output(script: &BuildScript, upto: usize) -> String {
    script.steps[..upto]
        .iter()
        .flat_map(|s| s.lines.iter())
        .map(|l| format!("{l}\n"))
        .collect()
}

async fn stream(cluster: Arc<ScriptedCluster>, image: &str) -> (Result<SessionReport, AppError>, String) {
    let session = LogSession::new(cluster, SessionConfig::default());
    let mut out = Vec::new();
    let r = session
        .stream(&BuildRef::new(image).unwrap(), &mut out, CancellationToken::new())
        .await;
    (r, String::from_utf8(out).unwrap())
}

#[tokio::test(start_paused = true)]
async fn failing_step_stops_the_build_after_its_logs() {
    let script = BuildScript::new(
        "app",
        vec![
            ScriptStep::init("prepare", &["ok"], 0),
            ScriptStep::init("build", &["error: compile failed"], 1),
            ScriptStep::init("export", &["exported"], 0),
        ],
    );
    let cluster = ScriptedCluster::start(script);

    let (report, out) = stream(cluster.clone(), "app").await;
    let report = report.unwrap();

    assert_eq!(out, "ok\nerror: compile failed\n");
    match report.result {
        TerminalResult::Failed(reason) => {
            assert_eq!(reason.step.as_deref(), Some("build"));
            assert_eq!(reason.exit_code, Some(1));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(!cluster.log_opens().contains(&"export".to_string()));
}

#[tokio::test(start_paused = true)]
async fn successful_build_streams_every_step_in_order() {
    let script = BuildScript::demo("app", 3, None);
    let cluster = ScriptedCluster::start(script.clone());

    let (report, out) = stream(cluster.clone(), "app").await;

    assert_eq!(report.unwrap().result, TerminalResult::Succeeded);
    assert_eq!(out, expected_output(&script, script.steps.len()));

    let order: Vec<String> = script.steps.iter().map(|s| s.name.clone()).collect();
    assert_eq!(cluster.log_opens(), order);
}

#[tokio::test(start_paused = true)]
async fn step_failing_before_any_output_is_reported() {
    let script = BuildScript::new(
        "app",
        vec![
            ScriptStep::init("prepare", &[], 2),
            ScriptStep::init("build", &["never"], 0),
        ],
    );
    let cluster = ScriptedCluster::start(script);

    let (report, out) = stream(cluster.clone(), "app").await;

    assert_eq!(out, "");
    match report.unwrap().result {
        TerminalResult::Failed(reason) => {
            assert_eq!(reason.step.as_deref(), Some("prepare"));
            assert_eq!(reason.exit_code, Some(2));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(cluster.log_opens(), ["prepare"]);
}

#[tokio::test(start_paused = true)]
async fn watch_drop_mid_build_neither_repeats_nor_loses_output() {
    let mut script = BuildScript::demo("app", 4, None);
    script.watch_drops = vec![2];
    let cluster = ScriptedCluster::start(script.clone());

    let (report, out) = stream(cluster.clone(), "app").await;

    assert_eq!(report.unwrap().result, TerminalResult::Succeeded);
    assert_eq!(out, expected_output(&script, script.steps.len()));

    let subs = cluster.subscriptions();
    assert!(subs.len() >= 2, "expected a reconnect, got {subs:?}");
    assert!(subs[1].is_some());
}

#[tokio::test(start_paused = true)]
async fn log_open_failures_below_the_attempt_limit_are_retried() {
    let mut script = BuildScript::demo("app", 2, None);
    script.log_open_failures = HashMap::from([("build".to_string(), 2)]);
    let cluster = ScriptedCluster::start(script.clone());

    let (report, out) = stream(cluster, "app").await;
    let report = report.unwrap();

    assert_eq!(report.result, TerminalResult::Succeeded);
    assert!(report.logs_unavailable.is_empty());
    assert_eq!(out, expected_output(&script, script.steps.len()));
}

#[tokio::test(start_paused = true)]
async fn exhausted_log_retries_lose_logs_but_not_the_build() {
    let mut script = BuildScript::demo("app", 2, None);
    script.log_open_failures = HashMap::from([("build".to_string(), 3)]);
    let cluster = ScriptedCluster::start(script.clone());

    let (report, out) = stream(cluster, "app").await;
    let report = report.unwrap();

    assert_eq!(report.result, TerminalResult::Succeeded);
    assert_eq!(report.logs_unavailable, ["build"]);
    assert!(!out.contains("build: line 1"));
    assert!(out.contains("===> EXPORT"));
}

#[tokio::test(start_paused = true)]
async fn broken_log_connection_resumes_without_duplicates() {
    let mut script = BuildScript::demo("app", 5, None);
    script.log_read_failures = HashMap::from([("detect".to_string(), 1)]);
    let cluster = ScriptedCluster::start(script.clone());

    let (report, out) = stream(cluster.clone(), "app").await;

    assert_eq!(report.unwrap().result, TerminalResult::Succeeded);
    assert_eq!(out, expected_output(&script, script.steps.len()));
    let detect_opens = cluster.log_opens().iter().filter(|c| *c == "detect").count();
    assert_eq!(detect_opens, 2);
}

#[tokio::test(start_paused = true)]
async fn cancellation_mid_stream_returns_cancelled_promptly() {
    let cluster = ScriptedCluster::start(BuildScript::demo("app", 100, None));
    let session = LogSession::new(cluster, SessionConfig::default());
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let mut out = Vec::new();
    let started = tokio::time::Instant::now();
    let report = session
        .stream(&BuildRef::new("app").unwrap(), &mut out, cancel)
        .await
        .unwrap();

    assert_eq!(report.result, TerminalResult::Cancelled);
    assert!(!out.is_empty(), "some logs should have streamed before cancel");
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn missing_build_is_not_found() {
    let cluster = ScriptedCluster::start(BuildScript::demo("app", 1, None));
    let mut config = SessionConfig::default();
    config.locate.timeout = Duration::from_secs(3);
    let session = LogSession::new(cluster, config);

    let mut out = Vec::new();
    let err = session
        .stream(&BuildRef::new("other").unwrap(), &mut out, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::NotFound { .. }), "got {err:?}");
}

struct ClosedPipe;

impl AsyncWrite for ClosedPipe {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[tokio::test(start_paused = true)]
async fn closed_output_ends_the_session() {
    let cluster = ScriptedCluster::start(BuildScript::demo("app", 2, None));
    let session = LogSession::new(cluster, SessionConfig::default());

    let report = session
        .stream(&BuildRef::new("app").unwrap(), &mut ClosedPipe, CancellationToken::new())
        .await
        .unwrap();

    assert!(report.output_closed);
    assert_eq!(report.result, TerminalResult::Cancelled);
}

use owo_colors::OwoColorize;
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::config::{OutputConfig, OutputMode};
use crate::session::SessionReport;
use crate::types::{BuildRef, TerminalResult};

#[derive(Debug, Serialize)]
struct ResultLine<'a> {
    #[serde(with = "time::serde::rfc3339")]
    ts: OffsetDateTime,
    build: &'a str,
    result: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    step: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
    #[serde(skip_serializing_if = "is_empty")]
    logs_unavailable: &'a [String],
}

fn is_empty(steps: &&[String]) -> bool {
    steps.is_empty()
}

/// The line printed after the build logs.
pub fn result_line(build: &BuildRef, report: &SessionReport, out: &OutputConfig) -> String {
    match out.mode {
        OutputMode::Human => format_human(report, out.color),
        OutputMode::Json => format_json(build, report, OffsetDateTime::now_utc()),
    }
}

fn format_human(report: &SessionReport, color: bool) -> String {
    let mut line = match &report.result {
        TerminalResult::Succeeded => "Build succeeded".to_string(),
        TerminalResult::Failed(reason) => format!("Build failed: {reason}"),
        TerminalResult::Cancelled => "Build cancelled".to_string(),
    };

    if !report.logs_unavailable.is_empty() {
        line.push_str(&format!(
            " (logs unavailable for: {})",
            report.logs_unavailable.join(", ")
        ));
    }

    if !color {
        return line;
    }
    match report.result {
        TerminalResult::Succeeded => line.bright_green().to_string(),
        TerminalResult::Failed(_) => line.bright_red().to_string(),
        TerminalResult::Cancelled => line.bright_yellow().to_string(),
    }
}

fn format_json(build: &BuildRef, report: &SessionReport, ts: OffsetDateTime) -> String {
    let (result, reason) = match &report.result {
        TerminalResult::Succeeded => ("succeeded", None),
        TerminalResult::Failed(reason) => ("failed", Some(reason)),
        TerminalResult::Cancelled => ("cancelled", None),
    };

    let line = ResultLine {
        ts,
        build: build.as_str(),
        result,
        step: reason.and_then(|r| r.step.as_deref()),
        exit_code: reason.and_then(|r| r.exit_code),
        message: reason.map(|r| r.message.as_str()),
        logs_unavailable: &report.logs_unavailable,
    };

    serde_json::to_string(&line).unwrap_or_else(|_| {
        let ts = ts.format(&Rfc3339).unwrap_or_else(|_| ts.to_string());
        format!(r#"{{"ts":"{ts}","build":"{build}","result":"{result}"}}"#)
    })
}

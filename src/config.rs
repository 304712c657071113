use std::io::IsTerminal;
use std::time::Duration;

use crate::cli::{Cli, ColorModeArg};
use crate::errors::{AppError, AppResult};
use crate::locate::LocateOptions;
use crate::session::SessionConfig;
use crate::types::BuildRef;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutputMode {
    Human,
    Json,
}

#[derive(Clone, Copy, Debug)]
pub struct OutputConfig {
    pub mode: OutputMode,
    pub color: bool,
}

#[derive(Clone, Debug)]
pub struct DevConfig {
    pub rate_ms: u64,
    pub lines: u64,
    pub fail_step: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub build: BuildRef,
    pub namespace: String,
    pub label_key: String,
    pub selector: Option<String>,

    /// Simulated cluster instead of a real one.
    pub dev: Option<DevConfig>,

    pub output: OutputConfig,
    pub session: SessionConfig,
}

impl TryFrom<Cli> for Config {
    type Error = AppError;

    fn try_from(cli: Cli) -> AppResult<Self> {
        let build = BuildRef::new(cli.image)
            .ok_or_else(|| AppError::Cli("no image name provided".to_string()))?;

        if cli.timeout_secs == 0 {
            return Err(AppError::Cli("--timeout-secs must be positive".to_string()));
        }
        if cli.poll_interval_ms == 0 {
            return Err(AppError::Cli("--poll-interval-ms must be positive".to_string()));
        }

        let mode = if cli.json {
            OutputMode::Json
        } else {
            OutputMode::Human
        };

        let color = !cli.no_color
            && match cli.color {
                ColorModeArg::Always => true,
                ColorModeArg::Never => false,
                ColorModeArg::Auto => std::io::stdout().is_terminal(),
            };

        let session = SessionConfig {
            locate: LocateOptions {
                interval: Duration::from_millis(cli.poll_interval_ms),
                timeout: Duration::from_secs(cli.timeout_secs),
            },
            ..SessionConfig::default()
        };

        let dev = cli.dev.then(|| DevConfig {
            rate_ms: cli.dev_rate_ms,
            lines: cli.dev_lines,
            fail_step: cli.dev_fail_step.filter(|s| !s.trim().is_empty()),
        });

        Ok(Self {
            build,
            namespace: cli.namespace,
            label_key: cli.label_key,
            selector: cli.selector.filter(|s| !s.trim().is_empty()),
            dev,
            output: OutputConfig { mode, color },
            session,
        })
    }
}

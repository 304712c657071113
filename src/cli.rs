use clap::{Parser, ValueEnum};

use crate::cluster::kube::DEFAULT_LABEL_KEY;

#[derive(Debug, Parser)]
#[command(
    name = "kpack-logs",
    version,
    about = "Stream build logs from an image, step by step",
    after_help = "Example: kpack-logs my-app -n builds"
)]
pub struct Cli {
    /// Image (build) name whose logs to stream
    pub image: String,

    /// Namespace hosting the build pods
    #[arg(
        short = 'n',
        long = "namespace",
        env = "KPACK_LOGS_NAMESPACE",
        default_value = "default"
    )]
    pub namespace: String,

    /// Pod label whose value is the image name
    #[arg(long = "label-key", default_value = DEFAULT_LABEL_KEY)]
    pub label_key: String,

    /// Extra label selector to narrow the match (e.g. build.kpack.io/build=app-build-3)
    #[arg(short = 'l', long = "selector")]
    pub selector: Option<String>,

    /// Seconds to wait for the build pod to appear
    #[arg(long = "timeout-secs", default_value_t = 60)]
    pub timeout_secs: u64,

    /// Milliseconds between pod lookups
    #[arg(long = "poll-interval-ms", default_value_t = 1000)]
    pub poll_interval_ms: u64,

    /// Print the final result as a JSON object
    #[arg(long = "json", default_value_t = false)]
    pub json: bool,

    /// Color mode: auto (tty only), always, never
    #[arg(long = "color", value_enum, default_value_t = ColorModeArg::Auto)]
    pub color: ColorModeArg,

    /// Disable colors (overrides --color)
    #[arg(long = "no-color", default_value_t = false)]
    pub no_color: bool,

    /// Dev mode: simulate a build without a cluster
    #[arg(long = "dev", default_value_t = false)]
    pub dev: bool,

    /// Dev: milliseconds between lines
    #[arg(long = "dev-rate-ms", default_value_t = 100)]
    pub dev_rate_ms: u64,

    /// Dev: lines per build step
    #[arg(long = "dev-lines", default_value_t = 3)]
    pub dev_lines: u64,

    /// Dev: make this step exit non-zero
    #[arg(long = "dev-fail-step")]
    pub dev_fail_step: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum ColorModeArg {
    Auto,
    Always,
    Never,
}

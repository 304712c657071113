use std::process::ExitCode;

use kpack_logs::{cli::Cli, config::Config};

/// Exit code for runs that never reached a build result.
const SETUP_FAILED: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    kpack_logs::logging::init();

    let cli = <Cli as clap::Parser>::parse();

    let result = match Config::try_from(cli) {
        Ok(config) => kpack_logs::run(config).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(result) => ExitCode::from(result.exit_code()),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(SETUP_FAILED)
        }
    }
}

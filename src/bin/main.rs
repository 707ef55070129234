use std::process::ExitCode;

use shale::{cli, telemetry};

fn main() -> ExitCode {
    let cli = cli::parse_from(std::env::args_os());
    telemetry::init(cli.verbose);

    match cli::run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("error: {}", err);
            ExitCode::from(err.exit_code())
        }
    }
}

use std::process::ExitCode;

use tracing::error;

mod bootstrap;
mod config;
mod protocol;
mod server;
mod transport;

fn main() -> ExitCode {
    match bootstrap::run_server() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "startup_failed");
            ExitCode::FAILURE
        }
    }
}

mod atomic_io;
mod bootstrap;
mod cli;
mod commands;
mod config;

use std::env;
use std::io;
use std::process::ExitCode;

use pixcanvas::resolve_app_paths;
use tracing::error;

use crate::cli::{parse_args, Command};

fn main() -> ExitCode {
    let args = env::args().skip(1).collect::<Vec<_>>();
    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::from(2);
        }
    };
    if command == Command::Help {
        println!("{}", cli::usage_text());
        return ExitCode::SUCCESS;
    }

    bootstrap::init_tracing();
    let paths = match resolve_app_paths() {
        Ok(paths) => paths,
        Err(err) => {
            error!(error = %err, "startup_failed");
            return ExitCode::from(1);
        }
    };

    match commands::run(command, &paths, &mut io::stdout().lock()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "command_failed");
            ExitCode::from(1)
        }
    }
}

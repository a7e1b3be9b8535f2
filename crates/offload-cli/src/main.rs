//! `offload` command-line driver
//!
//! Runs one problem end to end and maps the outcome to the exit status:
//!
//! | code | meaning                                              |
//! |------|------------------------------------------------------|
//! | 0    | output verified (or devices listed)                  |
//! | 1    | kernel build failed; the compiler log is on stderr   |
//! | 2    | device output differs from the host reference        |
//! | 3    | no platform, no device of the class, or device busy  |
//! | 4    | anything else                                        |

mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Command};
use commands::{ProblemArgs, Status};
use offload_tracing::{init_global_tracing, TracingConfig};
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_global_tracing(&TracingConfig::from_env().with_verbosity(cli.verbose)) {
        eprintln!("warning: {e}");
    }

    let outcome = match cli.command {
        Command::VecAdd { elements, kernel, run } => {
            commands::run_problem(ProblemArgs::VecAdd { elements }, &kernel, &run)
        }
        Command::MatMul {
            rows,
            cols,
            inner,
            seed,
            kernel,
            run,
        } => commands::run_problem(
            ProblemArgs::MatMul {
                rows,
                cols,
                inner,
                seed,
            },
            &kernel,
            &run,
        ),
        Command::Devices { backend, json } => commands::list_devices(backend, json),
    };

    let status = match outcome {
        Ok(status) => status,
        Err(err) => {
            let status = Status::of_error(&err);
            if let Some(offload_core::Error::Build { log }) = err.downcast_ref::<offload_core::Error>() {
                eprintln!("error: kernel build failed");
                eprintln!("{}", log.trim_end());
            } else {
                eprintln!("error: {err:#}");
            }
            tracing::error!(code = status.code(), error = %err, "run_failed");
            status
        }
    };
    ExitCode::from(status.code())
}

pub mod cli;

use std::process::ExitCode;

use anstream::eprintln;
use clap::Parser;
use diskann_rest_log::get_log_level_max;
use eyre::Result;
use tracing::metadata::LevelFilter;

fn main() -> Result<ExitCode> {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;

    let parsed = match cli::Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return Ok(ExitCode::from(err.exit_code().try_into().unwrap_or(2)));
        },
    };

    let verbose = parsed.verbose > 0;

    match runtime.block_on(parsed.execute()) {
        Ok(exit_code) => Ok(exit_code),
        Err(err) => {
            if verbose || get_log_level_max() > LevelFilter::INFO {
                eprintln!("error: {err:?}");
            } else {
                eprintln!("error: {err}");
            }
            Ok(ExitCode::FAILURE)
        },
    }
}

//! Launches a server through a fixture and then leaks the fixture, so neither teardown nor `Drop`
//! runs. Only the exit hook is left to kill the server.
//!
//! Usage: `mock_leaked_fixture <build_tool> <server_binary> <working_dir> <exit|wait>`
//!
//! Prints `<server pid> <server address>` on one line. With `exit` the process then calls
//! `std::process::exit(0)`; with `wait` it sleeps until it is signalled.
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use diskann_rest_harness::{
    Fixture,
    FixtureConfig,
    Target,
    Toolchain,
};
use diskann_rest_log::LogArgs;
use tracing::error;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let _log_guard = diskann_rest_log::initialize_logging(LogArgs {
        log_level: None,
        log_to_stderr: true,
        log_file_path: None::<PathBuf>,
        delete_old_log_file: false,
    });

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let [build_tool, server_binary, working_dir, mode] = args.as_slice() else {
        error!("Usage: mock_leaked_fixture <build_tool> <server_binary> <working_dir> <exit|wait>");
        return ExitCode::FAILURE;
    };

    let mut config = FixtureConfig::new(Target::Launch {
        toolchain: Toolchain {
            build_tool: build_tool.into(),
            server_binary: server_binary.into(),
        },
        working_dir: Some(working_dir.into()),
    });
    config.vector_count = 100;
    config.dims = 8;

    let fixture = match Fixture::setup(&config).await {
        Ok(fixture) => fixture,
        Err(err) => {
            error!(%err, "Fixture setup failed");
            return ExitCode::FAILURE;
        },
    };
    let Some(server) = fixture.server() else {
        error!("Fixture did not launch a server");
        return ExitCode::FAILURE;
    };
    println!("{} {}", server.pid(), fixture.address());
    std::mem::forget(fixture);

    match mode.as_str() {
        #[allow(clippy::exit)]
        "exit" => std::process::exit(0),
        _ => loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
        },
    }
}

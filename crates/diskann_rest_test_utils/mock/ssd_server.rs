//! A stand-in for DiskANN's `ssd_server` used to test the fixture lifecycle.
//!
//! Usage: `mock_ssd_server <address> <type> <index_prefix> <dims> <threads>`
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use diskann_rest_harness::VectorMatrix;
use diskann_rest_harness::consts::ELEMENT_TYPE_FLOAT;
use diskann_rest_harness::index_builder::disk_index_path;
use diskann_rest_log::LogArgs;
use diskann_rest_test_utils::{
    MOCK_SSD_SERVER_STARTUP_DELAY_MS,
    SearchServer,
    exit_code,
};
use tokio_util::sync::CancellationToken;
use tracing::{
    error,
    info,
};
use url::Url;

struct Args {
    address: Url,
    index_prefix: PathBuf,
    dims: usize,
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let [address, element_type, index_prefix, dims, threads] = args else {
        return Err(format!("expected 5 arguments, got {}", args.len()));
    };
    if element_type != ELEMENT_TYPE_FLOAT {
        return Err(format!("unsupported type {element_type}"));
    }
    threads.parse::<usize>().map_err(|err| format!("invalid threads {threads}: {err}"))?;
    Ok(Args {
        address: Url::parse(address).map_err(|err| format!("invalid address {address}: {err}"))?,
        index_prefix: PathBuf::from(index_prefix),
        dims: dims.parse().map_err(|err| format!("invalid dims {dims}: {err}"))?,
    })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let _log_guard = diskann_rest_log::initialize_logging(LogArgs {
        log_level: None,
        log_to_stderr: true,
        log_file_path: None::<PathBuf>,
        delete_old_log_file: false,
    });

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let args = match parse_args(&args) {
        Ok(args) => args,
        Err(err) => {
            error!(%err, "Usage: mock_ssd_server <address> <type> <index_prefix> <dims> <threads>");
            return ExitCode::from(exit_code::USAGE);
        },
    };

    let index_path = disk_index_path(&args.index_prefix);
    if !index_path.exists() {
        error!(path =? index_path, "Disk index not found");
        return ExitCode::from(exit_code::MISSING_INDEX);
    }
    let index = match VectorMatrix::read_bin_file(&index_path) {
        Ok(index) if index.dims() == args.dims => index,
        Ok(index) => {
            error!(expected = args.dims, actual = index.dims(), "Disk index dimension mismatch");
            return ExitCode::from(exit_code::INVALID_INDEX);
        },
        Err(err) => {
            error!(%err, path =? index_path, "Failed to read disk index");
            return ExitCode::from(exit_code::INVALID_INDEX);
        },
    };

    if let Some(delay) = std::env::var(MOCK_SSD_SERVER_STARTUP_DELAY_MS)
        .ok()
        .and_then(|delay| delay.parse::<u64>().ok())
    {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    let socket_addr = match args.address.socket_addrs(|| None).map(|addrs| addrs.into_iter().next()) {
        Ok(Some(socket_addr)) => socket_addr,
        Ok(None) | Err(_) => {
            error!(address =% args.address, "Address does not resolve");
            return ExitCode::from(exit_code::USAGE);
        },
    };
    let rows = index.rows();
    let server = match SearchServer::bind(socket_addr, index).await {
        Ok(server) => server,
        Err(err) => {
            error!(%err, %socket_addr, "Failed to bind");
            return ExitCode::FAILURE;
        },
    };

    info!(%socket_addr, rows, "Serving searches");
    server.serve(CancellationToken::new()).await;
    ExitCode::SUCCESS
}

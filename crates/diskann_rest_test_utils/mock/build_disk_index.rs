//! A stand-in for DiskANN's `build_disk_index` used to test the fixture lifecycle.
//!
//! Usage: `mock_build_disk_index <type> <dist_fn> <data_file> <index_prefix> <R> <L> <B> <M> <T>`
//!
//! The "index" written to `<index_prefix>_disk.index` is a copy of the dataset. Empty PQ files are
//! written next to it so the directory looks like a real build.
use std::path::{
    Path,
    PathBuf,
};
use std::process::ExitCode;

use diskann_rest_harness::VectorMatrix;
use diskann_rest_harness::consts::{
    DIST_FN_L2,
    ELEMENT_TYPE_FLOAT,
};
use diskann_rest_harness::index_builder::disk_index_path;
use diskann_rest_log::LogArgs;
use tracing::{
    error,
    info,
};

const PQ_SUFFIXES: &[&str] = &["_pq_pivots.bin", "_pq_compressed.bin"];

fn build(args: &[String]) -> Result<PathBuf, String> {
    let [element_type, dist_fn, data_file, index_prefix, build_params @ ..] = args else {
        return Err(format!("expected at least 4 arguments, got {}", args.len()));
    };
    if build_params.len() < 5 {
        return Err(format!("expected 5 build parameters, got {}", build_params.len()));
    }
    if element_type != ELEMENT_TYPE_FLOAT {
        return Err(format!("unsupported type {element_type}"));
    }
    if dist_fn != DIST_FN_L2 && dist_fn != "mips" {
        return Err(format!("unsupported distance function {dist_fn}"));
    }

    let data = VectorMatrix::read_bin_file(data_file).map_err(|err| format!("failed to read {data_file}: {err}"))?;
    let index_prefix = Path::new(index_prefix);
    let index_path = disk_index_path(index_prefix);
    data.write_bin_file(&index_path)
        .map_err(|err| format!("failed to write {}: {err}", index_path.display()))?;

    for suffix in PQ_SUFFIXES {
        let mut path = index_prefix.as_os_str().to_owned();
        path.push(suffix);
        std::fs::write(&path, b"").map_err(|err| format!("failed to write {}: {err}", path.to_string_lossy()))?;
    }

    info!(rows = data.rows(), dims = data.dims(), path =? index_path, "Built disk index");
    Ok(index_path)
}

fn main() -> ExitCode {
    let _log_guard = diskann_rest_log::initialize_logging(LogArgs {
        log_level: None,
        log_to_stderr: true,
        log_file_path: None::<PathBuf>,
        delete_old_log_file: false,
    });

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    match build(&args) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "Index build failed");
            ExitCode::FAILURE
        },
    }
}

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anstream::println;
use clap::{
    ArgAction,
    Parser,
};
use diskann_rest_harness::{
    CaseOutcome,
    FixtureConfig,
    Orchestrator,
    QueryCase,
    Readiness,
    SuiteReport,
};
use diskann_rest_log::{
    LogArgs,
    initialize_logging,
};
use diskann_rest_os_shim::Env;
use eyre::Result;
use tracing::{
    Level,
    debug,
};

/// Builds a DiskANN SSD index from a seeded dataset, launches `ssd_server` for it and checks that
/// it answers search requests.
///
/// The server is taken from `DISKANN_REST_SERVER` when set. Otherwise `DISKANN_BUILD_DIR` must
/// point at a DiskANN build directory.
#[derive(Debug, Parser, PartialEq)]
#[command(version, about, name = "diskann-rest-smoke")]
pub struct Cli {
    /// Seed for the dataset and query vector
    #[arg(long)]
    pub seed: Option<u64>,
    /// Number of points in the dataset
    #[arg(long)]
    pub count: Option<usize>,
    /// Dimensionality of the dataset
    #[arg(long)]
    pub dims: Option<usize>,
    /// Number of neighbors requested
    #[arg(long, default_value_t = 10)]
    pub k: u32,
    /// Search list size
    #[arg(long, default_value_t = 32)]
    pub ls: u32,
    /// Query id of the first request
    #[arg(long, default_value_t = 1234)]
    pub query_id: u64,
    /// Number of requests to send, with consecutive query ids
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub cases: u32,
    /// Give up waiting for the server to accept connections after this many seconds
    #[arg(long, conflicts_with = "settle_ms")]
    pub readiness_timeout_secs: Option<u64>,
    /// Sleep this long after launch instead of probing the server
    #[arg(long)]
    pub settle_ms: Option<u64>,
    /// Timeout for each request, 0 to wait forever
    #[arg(long)]
    pub request_timeout_secs: Option<u64>,
    /// Also write logs to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,
    /// Increase logging verbosity
    #[arg(long, short = 'v', action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub async fn execute(self) -> Result<ExitCode> {
        let _log_guard = initialize_logging(LogArgs {
            log_level: match self.verbose > 0 {
                true => Some(
                    match self.verbose {
                        1 => Level::INFO,
                        2 => Level::DEBUG,
                        _ => Level::TRACE,
                    }
                    .to_string(),
                ),
                false => None,
            },
            log_to_stderr: true,
            log_file_path: self.log_file.clone(),
            delete_old_log_file: true,
        })?;

        debug!(command =? std::env::args().collect::<Vec<_>>(), "Command ran");

        let mut config = FixtureConfig::from_env(&Env::new())?;
        self.apply(&mut config);

        let report = Orchestrator::new(config).with_cases(self.query_cases()).run().await?;
        print_report(&report);

        Ok(match report.is_success() {
            true => ExitCode::SUCCESS,
            false => ExitCode::FAILURE,
        })
    }

    fn apply(&self, config: &mut FixtureConfig) {
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(count) = self.count {
            config.vector_count = count;
        }
        if let Some(dims) = self.dims {
            config.dims = dims;
        }
        if let Some(settle_ms) = self.settle_ms {
            config.readiness = Readiness::Settle(Duration::from_millis(settle_ms));
        }
        if let (Some(secs), Readiness::Probe { timeout, .. }) = (self.readiness_timeout_secs, &mut config.readiness) {
            *timeout = Duration::from_secs(secs);
        }
        match self.request_timeout_secs {
            Some(0) => config.request_timeout = None,
            Some(secs) => config.request_timeout = Some(Duration::from_secs(secs)),
            None => {},
        }
    }

    fn query_cases(&self) -> Vec<QueryCase> {
        (0..self.cases)
            .map(|i| {
                let query_id = self.query_id + u64::from(i);
                QueryCase {
                    name: format!("query_{query_id}"),
                    ls: self.ls,
                    query_id,
                    k: self.k,
                }
            })
            .collect()
    }
}

fn print_report(report: &SuiteReport) {
    for case in &report.cases {
        match &case.outcome {
            CaseOutcome::Passed { status } => println!("PASS {} ({status}) in {:?}", case.name, case.elapsed),
            CaseOutcome::Failed { error } => println!("FAIL {}: {error}", case.name),
        }
    }
    println!("{} passed, {} failed", report.passed(), report.failed());
}

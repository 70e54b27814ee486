use std::time::{
    Duration,
    Instant,
};

use reqwest::StatusCode;
use tracing::{
    error,
    info,
};

use crate::error::Error;
use crate::fixture::{
    Fixture,
    FixtureConfig,
};
use crate::index_builder::{
    DiskIndexBuilder,
    IndexBuilder,
};
use crate::query::{
    QueryRequest,
    QueryResponse,
};

/// One query sent with the fixture's seeded query vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryCase {
    pub name: String,
    pub ls: u32,
    pub query_id: u64,
    pub k: u32,
}

impl QueryCase {
    /// The case the server must pass: `Ls=32`, `query_id=1234`, `k=10`.
    pub fn server_responds() -> Self {
        Self {
            name: "server_responds".to_owned(),
            ls: 32,
            query_id: 1234,
            k: 10,
        }
    }

    pub fn request(&self, query: &[f32]) -> QueryRequest {
        QueryRequest {
            ls: self.ls,
            query_id: self.query_id,
            query: query.to_vec(),
            k: self.k,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseOutcome {
    Passed { status: StatusCode },
    Failed { error: String },
}

#[derive(Debug, Clone)]
pub struct CaseReport {
    pub name: String,
    pub outcome: CaseOutcome,
    pub elapsed: Duration,
}

impl CaseReport {
    pub fn passed(&self) -> bool {
        matches!(self.outcome, CaseOutcome::Passed { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct SuiteReport {
    pub cases: Vec<CaseReport>,
}

impl SuiteReport {
    pub fn passed(&self) -> usize {
        self.cases.iter().filter(|c| c.passed()).count()
    }

    pub fn failed(&self) -> usize {
        self.cases.len() - self.passed()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }
}

/// Runs a single case, requiring HTTP 200.
pub async fn run_case(fixture: &Fixture, case: &QueryCase) -> Result<QueryResponse, Error> {
    fixture
        .query_expecting_ok(&case.request(fixture.query_vector()))
        .await
}

/// Runs every case in order against one fixture. A failing case does not stop the remaining ones.
pub async fn run_cases(fixture: &Fixture, cases: &[QueryCase]) -> SuiteReport {
    let mut report = SuiteReport::default();
    for case in cases {
        let start = Instant::now();
        let outcome = match run_case(fixture, case).await {
            Ok(response) => {
                info!(case =% case.name, status =% response.status, "Case passed");
                CaseOutcome::Passed {
                    status: response.status,
                }
            },
            Err(err) => {
                error!(case =% case.name, %err, "Case failed");
                CaseOutcome::Failed { error: err.to_string() }
            },
        };
        report.cases.push(CaseReport {
            name: case.name.clone(),
            outcome,
            elapsed: start.elapsed(),
        });
    }
    report
}

/// Sets up a fixture, runs the cases, and tears the fixture down whatever the cases did.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    config: FixtureConfig,
    cases: Vec<QueryCase>,
}

impl Orchestrator {
    pub fn new(config: FixtureConfig) -> Self {
        Self {
            config,
            cases: vec![QueryCase::server_responds()],
        }
    }

    pub fn with_cases(mut self, cases: Vec<QueryCase>) -> Self {
        self.cases = cases;
        self
    }

    pub fn config(&self) -> &FixtureConfig {
        &self.config
    }

    pub fn cases(&self) -> &[QueryCase] {
        &self.cases
    }

    pub async fn run(&self) -> Result<SuiteReport, Error> {
        self.run_with(&DiskIndexBuilder).await
    }

    /// Fails only if the fixture cannot be set up; case failures are in the report.
    pub async fn run_with(&self, builder: &dyn IndexBuilder) -> Result<SuiteReport, Error> {
        let mut fixture = Fixture::setup_with(&self.config, builder).await?;
        let report = run_cases(&fixture, &self.cases).await;
        fixture.teardown().await;
        info!(passed = report.passed(), failed = report.failed(), "Suite finished");
        Ok(report)
    }
}

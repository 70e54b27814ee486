//! Fixture lifecycle management for the DiskANN SSD REST server smoke tests.
//!
//! A [Fixture] owns everything a test run needs: the generated dataset, the working directory the
//! index is built into, the launched `ssd_server` process and an HTTP client pointed at it. When an
//! externally managed server is configured the fixture is only a client and owns no process.

pub mod consts;
pub mod dataset;
pub mod error;
pub mod exit_hook;
pub mod fixture;
pub mod index_builder;
pub mod orchestrator;
pub mod query;
pub mod server;

pub use dataset::{
    Dataset,
    DatasetGenerator,
    VectorMatrix,
};
pub use error::Error;
pub use fixture::{
    Fixture,
    FixtureConfig,
    Target,
    Toolchain,
};
pub use index_builder::{
    BuildParams,
    BuildRequest,
    DiskIndexBuilder,
    IndexBuilder,
};
pub use orchestrator::{
    CaseOutcome,
    CaseReport,
    Orchestrator,
    QueryCase,
    SuiteReport,
};
pub use query::{
    QueryClient,
    QueryRequest,
    QueryResponse,
};
pub use server::{
    PortStrategy,
    Readiness,
    ServerLaunchSpec,
    ServerProcess,
    ServerStatus,
};

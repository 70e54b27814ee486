use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use url::Url;

use crate::server::ServerStatus;

#[derive(Debug, Error)]
pub enum Error {
    #[error("the environment variable {0} must be set to the DiskANN build directory on disk")]
    MissingEnvVar(&'static str),
    #[error("invalid server address {address:?}: {source}")]
    InvalidAddress { address: String, source: url::ParseError },
    #[error("invalid dataset: {0}")]
    InvalidDataset(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    HttpClient(#[from] reqwest::Error),
    #[error("failed to run {}: {source}", .tool.display())]
    SpawnTool { tool: PathBuf, source: std::io::Error },
    #[error("index build tool {} failed with {status}", .tool.display())]
    BuildFailed { tool: PathBuf, status: ExitStatus },
    #[error("index build finished but {} was not produced", .0.display())]
    MissingArtifact(PathBuf),
    #[error("server exited before becoming ready ({status})")]
    ServerExited { status: ExitStatus },
    #[error("server at {address} was not ready after {elapsed:?}, {status}")]
    ReadinessTimeout {
        address: SocketAddr,
        elapsed: Duration,
        status: ServerStatus,
    },
    #[error("request to {address} failed: {source}, {status}")]
    Request {
        address: Url,
        source: reqwest::Error,
        status: ServerStatus,
    },
    #[error("expected a successful request to {address} but received {code}, {status}")]
    UnexpectedStatus {
        address: Url,
        code: StatusCode,
        status: ServerStatus,
    },
}

impl Error {
    /// The server state captured when the error was produced, if the error concerns the server.
    pub fn server_status(&self) -> Option<&ServerStatus> {
        match self {
            Error::ReadinessTimeout { status, .. }
            | Error::Request { status, .. }
            | Error::UnexpectedStatus { status, .. } => Some(status),
            _ => None,
        }
    }
}

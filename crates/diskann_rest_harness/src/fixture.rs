use std::ffi::OsString;
use std::path::{
    Path,
    PathBuf,
};
use std::time::Duration;

use diskann_rest_os_shim::Env;
use tempfile::TempDir;
use tracing::{
    info,
    warn,
};
use url::Url;

use crate::consts::env_var::{
    DISKANN_BUILD_DIR,
    DISKANN_REST_SERVER,
    DISKANN_REST_TEST_WORKING_DIR,
};
use crate::consts::{
    DEFAULT_SEED,
    DEFAULT_VECTOR_COUNT,
    DEFAULT_VECTOR_DIMS,
    ELEMENT_TYPE_FLOAT,
    INDEX_BASENAME,
    toolchain,
};
use crate::dataset::DatasetGenerator;
use crate::error::Error;
use crate::index_builder::{
    BuildParams,
    BuildRequest,
    DiskIndexBuilder,
    IndexBuilder,
};
use crate::query::{
    QueryClient,
    QueryRequest,
    QueryResponse,
};
use crate::server::{
    PortStrategy,
    Readiness,
    ServerLaunchSpec,
    ServerProcess,
    ServerStatus,
    ephemeral_port,
    server_address,
};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Locations of the index build tool and the server binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub build_tool: PathBuf,
    pub server_binary: PathBuf,
}

impl Toolchain {
    /// The layout of a DiskANN build directory.
    pub fn from_build_dir(build_dir: impl AsRef<Path>) -> Self {
        let build_dir = build_dir.as_ref();
        Self {
            build_tool: build_dir.join(toolchain::BUILD_DISK_INDEX_PATH),
            server_binary: build_dir.join(toolchain::SSD_SERVER_PATH),
        }
    }
}

/// Which server the fixture talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A server someone else runs. Nothing is built or launched.
    External(Url),
    /// Build an index and launch a server for it. Without a `working_dir` a temporary directory
    /// is used and removed on teardown.
    Launch {
        toolchain: Toolchain,
        working_dir: Option<PathBuf>,
    },
}

#[derive(Debug, Clone)]
pub struct FixtureConfig {
    pub target: Target,
    pub seed: u64,
    pub vector_count: usize,
    pub dims: usize,
    pub element_type: String,
    /// Thread count hint passed to the server.
    pub threads: usize,
    pub index_basename: String,
    pub build_params: BuildParams,
    pub port: PortStrategy,
    pub readiness: Readiness,
    pub request_timeout: Option<Duration>,
    /// Extra environment variables for the server process.
    pub server_env: Vec<(OsString, OsString)>,
}

impl FixtureConfig {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            seed: DEFAULT_SEED,
            vector_count: DEFAULT_VECTOR_COUNT,
            dims: DEFAULT_VECTOR_DIMS,
            element_type: ELEMENT_TYPE_FLOAT.to_owned(),
            threads: 1,
            index_basename: INDEX_BASENAME.to_owned(),
            build_params: BuildParams::default(),
            port: PortStrategy::default(),
            readiness: Readiness::default(),
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            server_env: Vec::new(),
        }
    }

    /// Resolves the target from `DISKANN_REST_SERVER`, `DISKANN_BUILD_DIR` and
    /// `DISKANN_REST_TEST_WORKING_DIR`. An external server takes precedence over launching one.
    pub fn from_env(env: &Env) -> Result<Self, Error> {
        if let Ok(address) = env.get(DISKANN_REST_SERVER) {
            let url = Url::parse(&address).map_err(|source| Error::InvalidAddress { address, source })?;
            return Ok(Self::new(Target::External(url)));
        }

        let build_dir = env.get_path(DISKANN_BUILD_DIR).ok_or(Error::MissingEnvVar(DISKANN_BUILD_DIR))?;
        Ok(Self::new(Target::Launch {
            toolchain: Toolchain::from_build_dir(build_dir),
            working_dir: env.get_path(DISKANN_REST_TEST_WORKING_DIR),
        }))
    }
}

#[derive(Debug)]
enum WorkingDir {
    Ephemeral(TempDir),
    Persistent(PathBuf),
}

impl WorkingDir {
    fn path(&self) -> &Path {
        match self {
            WorkingDir::Ephemeral(dir) => dir.path(),
            WorkingDir::Persistent(path) => path,
        }
    }
}

/// Shared state for a set of query cases: the server address, the server process when the
/// fixture launched it, and the working directory holding the index.
///
/// [Fixture::teardown] releases everything and may be called repeatedly. Dropping a fixture that
/// was never torn down still kills the server and removes a temporary working directory.
#[derive(Debug)]
pub struct Fixture {
    client: QueryClient,
    external: bool,
    server: Option<ServerProcess>,
    working_dir: Option<WorkingDir>,
    query: Vec<f32>,
}

impl Fixture {
    pub async fn setup(config: &FixtureConfig) -> Result<Self, Error> {
        Self::setup_with(config, &DiskIndexBuilder).await
    }

    pub async fn setup_with(config: &FixtureConfig, builder: &dyn IndexBuilder) -> Result<Self, Error> {
        let query = DatasetGenerator::new(config.seed).vector(config.dims);

        let (toolchain, working_dir) = match &config.target {
            Target::External(address) => {
                info!(%address, "Using externally managed server");
                return Ok(Self {
                    client: QueryClient::new(address.clone(), config.request_timeout)?,
                    external: true,
                    server: None,
                    working_dir: None,
                    query,
                });
            },
            Target::Launch { toolchain, working_dir } => (toolchain, working_dir),
        };

        let working_dir = match working_dir {
            Some(path) => {
                tokio::fs::create_dir_all(path).await?;
                WorkingDir::Persistent(path.clone())
            },
            None => WorkingDir::Ephemeral(tempfile::Builder::new().prefix("diskann-rest-").tempdir()?),
        };
        info!(path =% working_dir.path().display(), "Using working directory");

        let mut generator = DatasetGenerator::new(config.seed);
        let vectors = generator.matrix(config.vector_count, config.dims)?;
        let request = BuildRequest::new(&toolchain.build_tool, working_dir.path())
            .with_index_basename(&config.index_basename)
            .with_element_type(&config.element_type)
            .with_params(config.build_params.clone());
        let index_prefix = builder.build(&request, &vectors).await?;

        let port = match &config.port {
            PortStrategy::Ephemeral => ephemeral_port()?,
            PortStrategy::Seeded { range } => generator.port(range.clone()),
        };
        let spec = ServerLaunchSpec {
            binary: toolchain.server_binary.clone(),
            address: server_address(port)?,
            element_type: config.element_type.clone(),
            index_prefix,
            dims: config.dims,
            threads: config.threads,
            env: config.server_env.clone(),
        };
        info!(command =% spec.command_line(), "Executing REST server startup command");

        // From here on a failure drops the server, which kills it.
        let server = ServerProcess::spawn(&spec)?;
        server.wait_until_ready(&config.readiness).await?;

        Ok(Self {
            client: QueryClient::new(spec.address, config.request_timeout)?,
            external: false,
            server: Some(server),
            working_dir: Some(working_dir),
            query,
        })
    }

    pub fn address(&self) -> &Url {
        self.client.address()
    }

    /// The seeded query vector.
    pub fn query_vector(&self) -> &[f32] {
        &self.query
    }

    /// The launched server, `None` for an external server or after teardown.
    pub fn server(&self) -> Option<&ServerProcess> {
        self.server.as_ref()
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_ref().map(WorkingDir::path)
    }

    pub fn is_external(&self) -> bool {
        self.external
    }

    pub fn server_status(&self) -> ServerStatus {
        match &self.server {
            Some(server) => server.status(),
            None if self.external => ServerStatus::External,
            None => ServerStatus::Unknown("server was torn down".to_owned()),
        }
    }

    pub fn has_exited(&self) -> bool {
        self.server_status().has_exited()
    }

    /// Sends a request. A transport failure is reported together with the server's status.
    pub async fn query(&self, request: &QueryRequest) -> Result<QueryResponse, Error> {
        self.client.search(request).await.map_err(|source| Error::Request {
            address: self.address().clone(),
            source,
            status: self.server_status(),
        })
    }

    /// Sends a request and requires HTTP 200.
    pub async fn query_expecting_ok(&self, request: &QueryRequest) -> Result<QueryResponse, Error> {
        let response = self.query(request).await?;
        if response.status != reqwest::StatusCode::OK {
            return Err(Error::UnexpectedStatus {
                address: self.address().clone(),
                code: response.status,
                status: self.server_status(),
            });
        }
        Ok(response)
    }

    /// Kills the server and removes a temporary working directory. Does nothing for an external
    /// server or when called again.
    pub async fn teardown(&mut self) {
        if let Some(server) = self.server.take() {
            let status = server.shutdown().await;
            info!(%status, "Server torn down");
        }

        match self.working_dir.take() {
            Some(WorkingDir::Ephemeral(dir)) => {
                let path = dir.path().to_path_buf();
                if let Err(err) = dir.close() {
                    warn!(path =% path.display(), %err, "Failed to remove working directory");
                }
            },
            Some(WorkingDir::Persistent(path)) => info!(path =% path.display(), "Keeping working directory"),
            None => {},
        }
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        if let Some(server) = &self.server {
            server.kill();
        }
    }
}

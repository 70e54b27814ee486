use std::ffi::OsString;
use std::fmt;
use std::net::{
    Ipv4Addr,
    SocketAddr,
    TcpListener,
};
use std::ops::Range;
use std::path::PathBuf;
use std::process::{
    ExitStatus,
    Stdio,
};
use std::time::{
    Duration,
    Instant,
};

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::process::Child;
use tracing::{
    debug,
    info,
    warn,
};
use url::Url;

use crate::consts::SEEDED_PORT_RANGE;
use crate::error::Error;
use crate::exit_hook;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const MIN_PROBE_BACKOFF: Duration = Duration::from_millis(1);

/// How the port the server binds to is chosen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PortStrategy {
    /// Ask the OS for a currently unused port.
    #[default]
    Ephemeral,
    /// Draw a port from `range` using the dataset's seeded generator. The port is not checked.
    Seeded { range: Range<u16> },
}

impl PortStrategy {
    pub fn seeded() -> Self {
        Self::Seeded {
            range: SEEDED_PORT_RANGE,
        }
    }
}

/// Returns a port the OS considers free right now.
///
/// The listener is closed before returning, so another process may still take the port before the
/// server binds it.
pub fn ephemeral_port() -> Result<u16, Error> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

/// The address the server is told to listen on.
pub fn server_address(port: u16) -> Result<Url, Error> {
    let address = format!("http://{}:{port}/", Ipv4Addr::LOCALHOST);
    Url::parse(&address).map_err(|source| Error::InvalidAddress { address, source })
}

/// How to decide the server is ready to accept requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Sleep for a fixed duration and assume the server is up.
    Settle(Duration),
    /// Repeatedly connect to the server's port until a connection succeeds, backing off
    /// exponentially between attempts. Fails early if the process exits.
    Probe {
        timeout: Duration,
        initial_backoff: Duration,
        max_backoff: Duration,
    },
}

impl Default for Readiness {
    fn default() -> Self {
        Self::Probe {
            timeout: Duration::from_secs(30),
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        }
    }
}

/// Positional arguments for `ssd_server`.
#[derive(Debug, Clone)]
pub struct ServerLaunchSpec {
    pub binary: PathBuf,
    pub address: Url,
    pub element_type: String,
    pub index_prefix: PathBuf,
    pub dims: usize,
    pub threads: usize,
    /// Extra environment variables for the server process.
    pub env: Vec<(OsString, OsString)>,
}

impl ServerLaunchSpec {
    pub fn args(&self) -> Vec<OsString> {
        vec![
            self.address.as_str().into(),
            self.element_type.clone().into(),
            self.index_prefix.clone().into(),
            self.dims.to_string().into(),
            self.threads.to_string().into(),
        ]
    }

    /// The full command line, for logs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.binary.as_os_str().to_owned())
            .chain(self.args())
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// What is known about the server process at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerStatus {
    /// The server is not owned by the harness.
    External,
    Running,
    Exited(ExitStatus),
    /// Polling the process failed.
    Unknown(String),
}

impl ServerStatus {
    pub fn has_exited(&self) -> bool {
        matches!(self, ServerStatus::Exited(_))
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerStatus::External => write!(f, "server is externally managed"),
            ServerStatus::Running => write!(f, "server process is still running"),
            ServerStatus::Exited(status) => write!(f, "server process has exited with {status}"),
            ServerStatus::Unknown(err) => write!(f, "server process status is unknown: {err}"),
        }
    }
}

/// A launched server. The process is killed when this is dropped.
#[derive(Debug)]
pub struct ServerProcess {
    child: Mutex<Child>,
    pid: u32,
    address: Url,
    socket_addr: SocketAddr,
}

impl ServerProcess {
    /// Starts the server. Must be called from within a tokio runtime.
    pub fn spawn(spec: &ServerLaunchSpec) -> Result<Self, Error> {
        let socket_addr = spec
            .address
            .socket_addrs(|| None)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::InvalidAddress {
                address: spec.address.to_string(),
                source: url::ParseError::EmptyHost,
            })?;

        let child = tokio::process::Command::new(&spec.binary)
            .args(spec.args())
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::SpawnTool {
                tool: spec.binary.clone(),
                source,
            })?;
        let Some(pid) = child.id() else {
            return Err(Error::Io(std::io::Error::other("server exited before its pid was read")));
        };
        exit_hook::register(pid);
        info!(pid, address =% spec.address, "Launched server");

        Ok(Self {
            child: Mutex::new(child),
            pid,
            address: spec.address.clone(),
            socket_addr,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn address(&self) -> &Url {
        &self.address
    }

    /// Polls the process without blocking.
    ///
    /// Once the process is seen to have exited it is reaped and its pid may be reused, so it is
    /// dropped from the exit hook.
    pub fn status(&self) -> ServerStatus {
        match self.child.lock().try_wait() {
            Ok(None) => ServerStatus::Running,
            Ok(Some(status)) => {
                exit_hook::unregister(self.pid);
                ServerStatus::Exited(status)
            },
            Err(err) => ServerStatus::Unknown(err.to_string()),
        }
    }

    pub fn has_exited(&self) -> bool {
        self.status().has_exited()
    }

    pub async fn wait_until_ready(&self, readiness: &Readiness) -> Result<(), Error> {
        match readiness {
            Readiness::Settle(duration) => {
                debug!(?duration, "Waiting for server to settle");
                tokio::time::sleep(*duration).await;
                Ok(())
            },
            Readiness::Probe {
                timeout,
                initial_backoff,
                max_backoff,
            } => self.probe(*timeout, *initial_backoff, *max_backoff).await,
        }
    }

    async fn probe(&self, timeout: Duration, initial_backoff: Duration, max_backoff: Duration) -> Result<(), Error> {
        let start = Instant::now();
        let mut backoff = initial_backoff.max(MIN_PROBE_BACKOFF);
        let mut attempts = 0_u32;
        loop {
            if let ServerStatus::Exited(status) = self.status() {
                return Err(Error::ServerExited { status });
            }

            attempts += 1;
            match TcpStream::connect(self.socket_addr).await {
                Ok(_) => {
                    info!(attempts, elapsed = ?start.elapsed(), "Server is accepting connections");
                    return Ok(());
                },
                Err(err) => debug!(attempts, %err, "Server is not accepting connections yet"),
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(Error::ReadinessTimeout {
                    address: self.socket_addr,
                    elapsed,
                    status: self.status(),
                });
            }
            tokio::time::sleep(backoff.min(timeout - elapsed)).await;
            backoff = next_backoff(backoff, max_backoff);
        }
    }

    /// Kills the process if it is still running. Safe to call any number of times.
    pub fn kill(&self) {
        let mut child = self.child.lock();
        match child.try_wait() {
            Ok(Some(status)) => debug!(pid = self.pid, %status, "Server already exited"),
            Ok(None) => match child.start_kill() {
                Ok(()) => info!(pid = self.pid, "Killed server"),
                Err(err) => warn!(pid = self.pid, %err, "Failed to kill server"),
            },
            Err(err) => warn!(pid = self.pid, %err, "Failed to poll server"),
        }
        exit_hook::unregister(self.pid);
    }

    /// Kills the process and waits for it to be reaped.
    pub async fn shutdown(mut self) -> ServerStatus {
        self.kill();
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.child.get_mut().wait()).await {
            Ok(Ok(status)) => {
                exit_hook::unregister(self.pid);
                ServerStatus::Exited(status)
            },
            Ok(Err(err)) => ServerStatus::Unknown(err.to_string()),
            Err(_elapsed) => {
                warn!(pid = self.pid, "Server did not exit after being killed");
                self.status()
            },
        }
    }
}

/// Doubles `backoff` up to `max_backoff`, never returning zero.
fn next_backoff(backoff: Duration, max_backoff: Duration) -> Duration {
    (backoff * 2).min(max_backoff).max(MIN_PROBE_BACKOFF)
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

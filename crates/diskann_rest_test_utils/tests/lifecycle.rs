//! Drives the fixture end to end against the mock toolchain binaries.
use std::io::{
    BufRead as _,
    BufReader,
};
use std::net::SocketAddr;
use std::path::{
    Path,
    PathBuf,
};
use std::process::{
    Child,
    Stdio,
};
use std::time::Duration;

use async_trait::async_trait;
use diskann_rest_harness::exit_hook;
use diskann_rest_harness::index_builder::disk_index_path;
use diskann_rest_harness::{
    BuildRequest,
    Error,
    Fixture,
    FixtureConfig,
    IndexBuilder,
    Orchestrator,
    QueryCase,
    Readiness,
    ServerStatus,
    Target,
    Toolchain,
    VectorMatrix,
};
use diskann_rest_test_utils::{
    MOCK_SSD_SERVER_STARTUP_DELAY_MS,
    SearchResponse,
    SearchServer,
};
use http::StatusCode;
use tokio::net::TcpStream;

fn mock_toolchain() -> Toolchain {
    Toolchain {
        build_tool: env!("CARGO_BIN_EXE_mock_build_disk_index").into(),
        server_binary: env!("CARGO_BIN_EXE_mock_ssd_server").into(),
    }
}

fn launch_config(working_dir: Option<PathBuf>) -> FixtureConfig {
    let mut config = FixtureConfig::new(Target::Launch {
        toolchain: mock_toolchain(),
        working_dir,
    });
    config.vector_count = 200;
    config.dims = 16;
    config
}

/// Skips the build so the server finds no index.
#[derive(Debug)]
struct NoopBuilder;

#[async_trait]
impl IndexBuilder for NoopBuilder {
    async fn build(&self, request: &BuildRequest, _vectors: &VectorMatrix) -> Result<PathBuf, Error> {
        Ok(request.index_prefix())
    }
}

#[derive(Debug)]
struct UnreachableBuilder;

#[async_trait]
impl IndexBuilder for UnreachableBuilder {
    async fn build(&self, _request: &BuildRequest, _vectors: &VectorMatrix) -> Result<PathBuf, Error> {
        panic!("an external server needs no index");
    }
}

async fn wait_for_port_closed(address: SocketAddr) -> bool {
    for _ in 0..50 {
        if TcpStream::connect(address).await.is_err() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

fn socket_addr(fixture: &Fixture) -> SocketAddr {
    fixture.address().socket_addrs(|| None).unwrap()[0]
}

#[tokio::test]
async fn test_round_trip() {
    diskann_rest_log::init_test_logging();
    let mut config = launch_config(None);
    config.vector_count = 1000;
    config.dims = 100;

    let mut fixture = Fixture::setup(&config).await.unwrap();
    let working_dir = fixture.working_dir().unwrap().to_path_buf();
    assert!(working_dir.join("vectors.bin").exists());
    assert!(disk_index_path(&working_dir.join("smoke_test")).exists());
    assert!(working_dir.join("smoke_test_pq_pivots.bin").exists());
    assert_eq!(fixture.server_status(), ServerStatus::Running);

    let case = QueryCase::server_responds();
    let response = fixture
        .query_expecting_ok(&case.request(fixture.query_vector()))
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::OK);
    let body: SearchResponse = serde_json::from_str(&response.body).unwrap();
    assert_eq!(body.query_id, 1234);
    assert_eq!(body.indices.len(), 10);
    // The query is the first dataset row.
    assert_eq!(body.indices[0], 0);

    let pid = fixture.server().unwrap().pid();
    let address = socket_addr(&fixture);
    fixture.teardown().await;
    assert!(!working_dir.exists());
    assert!(fixture.server().is_none());
    assert!(!exit_hook::is_registered(pid));
    assert!(wait_for_port_closed(address).await);

    fixture.teardown().await;
    assert!(matches!(fixture.server_status(), ServerStatus::Unknown(_)));
}

#[tokio::test]
async fn test_orchestrator_reports_each_case() {
    diskann_rest_log::init_test_logging();
    let narrow = QueryCase {
        name: "ls_below_k".to_owned(),
        ls: 5,
        query_id: 7,
        k: 10,
    };
    let orchestrator = Orchestrator::new(launch_config(None)).with_cases(vec![
        QueryCase::server_responds(),
        narrow,
        QueryCase {
            name: "single_neighbor".to_owned(),
            ls: 1,
            query_id: 8,
            k: 1,
        },
    ]);

    let report = orchestrator.run().await.unwrap();
    assert_eq!(report.cases.len(), 3);
    assert_eq!(report.passed(), 2);
    assert_eq!(report.failed(), 1);
    assert!(!report.is_success());
    assert!(!report.cases[1].passed());
    assert_eq!(report.cases[1].name, "ls_below_k");
}

#[tokio::test]
async fn test_persistent_working_dir_is_kept() {
    diskann_rest_log::init_test_logging();
    let root = tempfile::tempdir().unwrap();
    let working_dir = root.path().join("nested").join("index");

    let mut fixture = Fixture::setup(&launch_config(Some(working_dir.clone()))).await.unwrap();
    assert_eq!(fixture.working_dir(), Some(working_dir.as_path()));
    fixture
        .query_expecting_ok(&QueryCase::server_responds().request(fixture.query_vector()))
        .await
        .unwrap();
    fixture.teardown().await;

    assert!(disk_index_path(&working_dir.join("smoke_test")).exists());
}

#[tokio::test]
async fn test_server_exit_is_detected_while_probing() {
    diskann_rest_log::init_test_logging();
    let err = Fixture::setup_with(&launch_config(None), &NoopBuilder).await.unwrap_err();
    match err {
        Error::ServerExited { status } => assert_eq!(status.code(), Some(2)),
        err => panic!("unexpected error: {err}"),
    }
}

#[tokio::test]
async fn test_server_exit_is_reported_with_request_failure() {
    diskann_rest_log::init_test_logging();
    let mut config = launch_config(None);
    config.readiness = Readiness::Settle(Duration::from_millis(200));

    let mut fixture = Fixture::setup_with(&config, &NoopBuilder).await.unwrap();
    for _ in 0..50 {
        if fixture.has_exited() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(fixture.has_exited());

    let err = fixture
        .query_expecting_ok(&QueryCase::server_responds().request(fixture.query_vector()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Request { .. }));
    assert!(err.server_status().unwrap().has_exited());
    assert!(err.to_string().contains("exit status: 2"), "{err}");
    fixture.teardown().await;
}

#[tokio::test]
async fn test_probe_waits_for_slow_startup() {
    diskann_rest_log::init_test_logging();
    let mut config = launch_config(None);
    config
        .server_env
        .push((MOCK_SSD_SERVER_STARTUP_DELAY_MS.into(), "500".into()));

    let mut fixture = Fixture::setup(&config).await.unwrap();
    fixture
        .query_expecting_ok(&QueryCase::server_responds().request(fixture.query_vector()))
        .await
        .unwrap();
    fixture.teardown().await;
}

#[tokio::test]
async fn test_probe_times_out() {
    diskann_rest_log::init_test_logging();
    let mut config = launch_config(None);
    config
        .server_env
        .push((MOCK_SSD_SERVER_STARTUP_DELAY_MS.into(), "10000".into()));
    config.readiness = Readiness::Probe {
        timeout: Duration::from_millis(300),
        initial_backoff: Duration::from_millis(20),
        max_backoff: Duration::from_millis(100),
    };

    let err = Fixture::setup(&config).await.unwrap_err();
    match err {
        Error::ReadinessTimeout { status, .. } => assert_eq!(status, ServerStatus::Running),
        err => panic!("unexpected error: {err}"),
    }
}

#[tokio::test]
async fn test_teardown_after_manual_kill() {
    diskann_rest_log::init_test_logging();
    let mut fixture = Fixture::setup(&launch_config(None)).await.unwrap();
    let server = fixture.server().unwrap();
    server.kill();
    server.kill();

    fixture.teardown().await;
    fixture.teardown().await;
    assert!(fixture.server().is_none());
}

#[tokio::test]
async fn test_drop_kills_server() {
    diskann_rest_log::init_test_logging();
    let fixture = Fixture::setup(&launch_config(None)).await.unwrap();
    let pid = fixture.server().unwrap().pid();
    let address = socket_addr(&fixture);
    assert!(exit_hook::is_registered(pid));

    drop(fixture);
    assert!(!exit_hook::is_registered(pid));
    assert!(wait_for_port_closed(address).await);
}

#[tokio::test]
async fn test_external_server_is_not_managed() {
    diskann_rest_log::init_test_logging();
    let config = FixtureConfig {
        dims: 16,
        ..FixtureConfig::new(Target::External(url::Url::parse("http://127.0.0.1:1/").unwrap()))
    };
    let index = diskann_rest_harness::Dataset::generate(config.seed, 50, config.dims)
        .unwrap()
        .vectors()
        .clone();
    let handle = SearchServer::bind_local(index).await.unwrap().spawn_listener();
    let config = FixtureConfig {
        target: Target::External(handle.url()),
        ..config
    };

    let mut fixture = Fixture::setup_with(&config, &UnreachableBuilder).await.unwrap();
    assert!(fixture.is_external());
    assert!(fixture.working_dir().is_none());
    assert_eq!(fixture.server_status(), ServerStatus::External);
    fixture
        .query_expecting_ok(&QueryCase::server_responds().request(fixture.query_vector()))
        .await
        .unwrap();

    fixture.teardown().await;
    assert_eq!(fixture.server_status(), ServerStatus::External);
    // The server is still up after teardown.
    fixture
        .query_expecting_ok(&QueryCase::server_responds().request(fixture.query_vector()))
        .await
        .unwrap();
}

/// Runs `mock_leaked_fixture`, returning it with the pid and address of the server it leaked.
fn spawn_leaked_fixture(working_dir: &Path, mode: &str) -> (Child, u32, SocketAddr) {
    let mut child = std::process::Command::new(env!("CARGO_BIN_EXE_mock_leaked_fixture"))
        .arg(env!("CARGO_BIN_EXE_mock_build_disk_index"))
        .arg(env!("CARGO_BIN_EXE_mock_ssd_server"))
        .arg(working_dir)
        .arg(mode)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();

    let mut line = String::new();
    BufReader::new(child.stdout.take().unwrap())
        .read_line(&mut line)
        .unwrap();
    let (pid, address) = line
        .trim()
        .split_once(' ')
        .unwrap_or_else(|| panic!("unexpected output {line:?}"));
    let address = url::Url::parse(address).unwrap().socket_addrs(|| None).unwrap()[0];
    (child, pid.parse().unwrap(), address)
}

/// Whether `pid` has terminated. A zombie counts as terminated since nothing may be reaping it.
#[cfg(target_os = "linux")]
async fn wait_for_process_dead(pid: u32) -> bool {
    for _ in 0..50 {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Err(_) => return true,
            Ok(stat) => {
                let state = stat.rsplit_once(')').map(|(_, rest)| rest.trim_start());
                if state.is_some_and(|state| state.starts_with('Z') || state.starts_with('X')) {
                    return true;
                }
            },
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::test]
async fn test_exit_hook_kills_leaked_server_on_exit() {
    diskann_rest_log::init_test_logging();
    let working_dir = tempfile::tempdir().unwrap();
    let (mut child, pid, address) = spawn_leaked_fixture(working_dir.path(), "exit");

    let status = child.wait().unwrap();
    assert!(status.success(), "{status}");
    assert!(wait_for_port_closed(address).await, "server {pid} outlived the process that launched it");
    #[cfg(target_os = "linux")]
    assert!(wait_for_process_dead(pid).await, "server {pid} is still running");
}

#[cfg(unix)]
#[tokio::test]
async fn test_exit_hook_kills_leaked_server_on_sigterm() {
    use nix::sys::signal::{
        Signal,
        kill,
    };
    use nix::unistd::Pid;

    diskann_rest_log::init_test_logging();
    let working_dir = tempfile::tempdir().unwrap();
    let (mut child, pid, address) = spawn_leaked_fixture(working_dir.path(), "wait");
    assert!(TcpStream::connect(address).await.is_ok());

    kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).unwrap();
    let status = child.wait().unwrap();
    assert_eq!(status.code(), Some(130));
    assert!(wait_for_port_closed(address).await, "server {pid} outlived the process that launched it");
    #[cfg(target_os = "linux")]
    assert!(wait_for_process_dead(pid).await, "server {pid} is still running");
}

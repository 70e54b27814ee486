use std::fs::File;
use std::path::Path;
use std::sync::{
    Mutex,
    Once,
};

use thiserror::Error;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{
    EnvFilter,
    Registry,
    fmt,
};

/// Environment variable holding an `EnvFilter` directive, used when no level is set explicitly.
pub const DISKANN_REST_LOG_LEVEL: &str = "DISKANN_REST_LOG_LEVEL";

const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;
const DEFAULT_FILTER: LevelFilter = LevelFilter::WARN;

static LOG_LEVEL_GLOBAL: Mutex<Option<String>> = Mutex::new(None);
static MAX_LEVEL: Mutex<Option<LevelFilter>> = Mutex::new(None);
static ENV_FILTER_RELOADABLE_HANDLE: Mutex<Option<tracing_subscriber::reload::Handle<EnvFilter, Registry>>> =
    Mutex::new(None);
static TEST_LOGGING: Once = Once::new();

// A logging error
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    TracingReload(#[from] tracing_subscriber::reload::Error),
}

/// Arguments to the initialize_logging function
#[derive(Debug)]
pub struct LogArgs<T: AsRef<Path>> {
    /// The log level to use. When not set, the default log level is used.
    pub log_level: Option<String>,
    /// Whether or not we log to stderr.
    pub log_to_stderr: bool,
    /// The log file path which we write logs to. When not set, we do not write to a file.
    pub log_file_path: Option<T>,
    /// Whether we should delete the log file at each launch.
    pub delete_old_log_file: bool,
}

/// The log guard maintains tracing guards which send log information to other threads.
///
/// This must be kept alive for logging to function as expected.
#[must_use]
#[derive(Debug)]
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
    _stderr_guard: Option<WorkerGuard>,
}

/// Initialize logging for the smoke runner using the given LogArgs.
///
/// # Returns
///
/// On success, this returns a guard which must be kept alive.
pub fn initialize_logging<T: AsRef<Path>>(args: LogArgs<T>) -> Result<LogGuard, Error> {
    let filter_layer = create_filter_layer();
    let (reloadable_filter_layer, reloadable_handle) = tracing_subscriber::reload::Layer::new(filter_layer);
    ENV_FILTER_RELOADABLE_HANDLE.lock().unwrap().replace(reloadable_handle);

    let (file_layer, _file_guard) = match args.log_file_path {
        Some(log_file_path) => {
            let log_path = log_file_path.as_ref();

            if let Some(parent) = log_path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            // Old logs are removed on request, otherwise only once the file has grown too large.
            if args.delete_old_log_file {
                std::fs::remove_file(log_path).ok();
            } else if log_path.exists() && std::fs::metadata(log_path)?.len() > MAX_FILE_SIZE {
                std::fs::remove_file(log_path)?;
            }

            let file = if args.delete_old_log_file {
                File::create(log_path)?
            } else {
                File::options().append(true).create(true).open(log_path)?
            };

            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            let file_layer = fmt::layer()
                .with_line_number(true)
                .with_ansi(false)
                .with_writer(non_blocking);

            (Some(file_layer), Some(guard))
        },
        None => (None, None),
    };

    let (stderr_layer, _stderr_guard) = if args.log_to_stderr {
        let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stderr());
        let stderr_layer = fmt::layer().with_line_number(true).with_writer(non_blocking);
        (Some(stderr_layer), Some(guard))
    } else {
        (None, None)
    };

    if let Some(level) = args.log_level {
        set_log_level(level)?;
    }

    tracing_subscriber::registry()
        .with(reloadable_filter_layer)
        .with(file_layer)
        .with(stderr_layer)
        .init();

    Ok(LogGuard {
        _file_guard,
        _stderr_guard,
    })
}

/// Installs a subscriber writing through the libtest capture, at most once per test binary.
///
/// Safe to call from every test; a subscriber installed by someone else is left in place.
pub fn init_test_logging() {
    TEST_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(create_filter_layer())
            .with_test_writer()
            .try_init();
    });
}

/// Get the current log level by first seeing if it is set in application, then environment, then
/// otherwise using the default
///
/// # Returns
///
/// Returns a string identifying the current log level.
pub fn get_log_level() -> String {
    LOG_LEVEL_GLOBAL
        .lock()
        .unwrap()
        .clone()
        .unwrap_or_else(|| std::env::var(DISKANN_REST_LOG_LEVEL).unwrap_or_else(|_| DEFAULT_FILTER.to_string()))
}

/// Set the log level to the given level.
///
/// # Returns
///
/// On success, returns the old log level.
pub fn set_log_level(level: String) -> Result<String, Error> {
    info!("Setting log level to {level:?}");

    let old_level = get_log_level();
    *LOG_LEVEL_GLOBAL.lock().unwrap() = Some(level);

    let filter_layer = create_filter_layer();
    *MAX_LEVEL.lock().unwrap() = filter_layer.max_level_hint();

    ENV_FILTER_RELOADABLE_HANDLE
        .lock()
        .unwrap()
        .as_ref()
        .expect("set_log_level must not be called before logging is initialized")
        .reload(filter_layer)?;

    Ok(old_level)
}

/// Get the current max log level
///
/// # Returns
///
/// The max log level which is set every time the log level is set.
pub fn get_log_level_max() -> LevelFilter {
    let max_level = *MAX_LEVEL.lock().unwrap();
    match max_level {
        Some(level) => level,
        None => {
            let filter_layer = create_filter_layer();
            *MAX_LEVEL.lock().unwrap() = filter_layer.max_level_hint();
            filter_layer.max_level_hint().unwrap_or(DEFAULT_FILTER)
        },
    }
}

fn create_filter_layer() -> EnvFilter {
    let directive = Directive::from(DEFAULT_FILTER);

    let log_level = LOG_LEVEL_GLOBAL
        .lock()
        .unwrap()
        .clone()
        .or_else(|| std::env::var(DISKANN_REST_LOG_LEVEL).ok());

    match log_level {
        Some(level) => EnvFilter::builder()
            .with_default_directive(directive)
            .parse_lossy(level),
        None => EnvFilter::default().add_directive(directive),
    }
}

#[cfg(test)]
mod tests {
    use std::fs::read_to_string;
    use std::time::Duration;

    use tracing::{
        debug,
        error,
        trace,
        warn,
    };

    use super::*;

    #[test]
    fn test_logging() {
        let tempdir = tempfile::TempDir::new().unwrap();
        let log_path = tempdir.path().join("logs").join("smoke.log");

        let guard = initialize_logging(LogArgs {
            log_level: Some("trace".to_owned()),
            log_to_stderr: true,
            log_file_path: Some(&log_path),
            delete_old_log_file: true,
        })
        .unwrap();

        assert_eq!(get_log_level(), "trace");
        assert_eq!(get_log_level_max(), LevelFilter::TRACE);

        trace!("launching server");
        debug!("server args");
        info!("server ready");
        warn!("server already exited");
        error!("case failed");

        // Restores the default level.
        assert_eq!(set_log_level(DEFAULT_FILTER.to_string()).unwrap(), "trace");
        assert_eq!(get_log_level(), DEFAULT_FILTER.to_string());
        assert_eq!(get_log_level_max(), DEFAULT_FILTER);

        // Dropping the guard flushes the non-blocking writers.
        drop(guard);
        std::thread::sleep(Duration::from_millis(100));
        let logs = read_to_string(&log_path).unwrap();
        for needle in [
            "TRACE",
            "DEBUG",
            "INFO",
            "WARN",
            "ERROR",
            "launching server",
            "server args",
            "server ready",
            "server already exited",
            "case failed",
        ] {
            assert!(logs.contains(needle), "missing {needle:?} in {logs}");
        }
    }
}

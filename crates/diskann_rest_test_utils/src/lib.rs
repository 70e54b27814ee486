//! A stand-in for the DiskANN toolchain so the fixture lifecycle can be tested without a DiskANN
//! build.
//!
//! The `mock_build_disk_index` and `mock_ssd_server` binaries accept the same positional
//! arguments as the real tools. The mock index is the dataset itself and the server answers
//! queries by exhaustive L2 search, so results are exact.

pub mod search_service;

pub use search_service::*;

/// Delays binding the listener in `mock_ssd_server`, in milliseconds.
pub const MOCK_SSD_SERVER_STARTUP_DELAY_MS: &str = "MOCK_SSD_SERVER_STARTUP_DELAY_MS";

/// Exit codes of `mock_ssd_server`.
pub mod exit_code {
    pub const USAGE: u8 = 1;
    pub const MISSING_INDEX: u8 = 2;
    pub const INVALID_INDEX: u8 = 3;
}

use std::ops::Range;

/// Seed shared by the dataset, the query vector and seeded port selection.
pub const DEFAULT_SEED: u64 = 12345;

pub const DEFAULT_VECTOR_COUNT: usize = 1000;

pub const DEFAULT_VECTOR_DIMS: usize = 100;

/// Basename of the index under the build directory, passed to both the build tool and the server.
pub const INDEX_BASENAME: &str = "smoke_test";

/// File the dataset is written to before the build tool runs.
pub const DATASET_FILE_NAME: &str = "vectors.bin";

/// Suffix appended to the index prefix for the file the server loads.
pub const DISK_INDEX_SUFFIX: &str = "_disk.index";

pub const ELEMENT_TYPE_FLOAT: &str = "float";

pub const DIST_FN_L2: &str = "l2";

pub const SEEDED_PORT_RANGE: Range<u16> = 10000..10100;

/// Locations of the DiskANN binaries relative to `DISKANN_BUILD_DIR`.
pub mod toolchain {
    pub const BUILD_DISK_INDEX_PATH: &str = "tests/build_disk_index";
    pub const SSD_SERVER_PATH: &str = "tests/restapi/ssd_server";
}

pub mod env_var {
    macro_rules! define_env_vars {
        ($($(#[$meta:meta])* $ident:ident = $name:expr),*) => {
            $(
                $(#[$meta])*
                pub const $ident: &str = $name;
            )*

            pub const ALL: &[&str] = &[$($ident),*];
        }
    }

    define_env_vars! {
        /// Address of an already running server, skips building and launching
        DISKANN_REST_SERVER = "DISKANN_REST_SERVER",

        /// The DiskANN build directory containing the build tool and the server binary
        DISKANN_BUILD_DIR = "DISKANN_BUILD_DIR",

        /// A persistent working directory to build the index into instead of a temporary one
        DISKANN_REST_TEST_WORKING_DIR = "DISKANN_REST_TEST_WORKING_DIR"
    }
}

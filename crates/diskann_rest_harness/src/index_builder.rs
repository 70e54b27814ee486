use std::ffi::OsString;
use std::path::{
    Path,
    PathBuf,
};
use std::process::Stdio;

use tracing::{
    debug,
    info,
};

use crate::consts::{
    DATASET_FILE_NAME,
    DISK_INDEX_SUFFIX,
    DIST_FN_L2,
    ELEMENT_TYPE_FLOAT,
    INDEX_BASENAME,
};
use crate::dataset::VectorMatrix;
use crate::error::Error;

/// Tuning arguments passed positionally to `build_disk_index` after the index prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildParams {
    /// `R`, the graph degree.
    pub max_degree: u32,
    /// `L`, the candidate list size during construction.
    pub build_list_size: u32,
    /// `B`, the memory budget in GiB for search-time PQ data.
    pub search_dram_budget_gb: f64,
    /// `M`, the memory budget in GiB for construction.
    pub build_dram_budget_gb: f64,
    /// `T`
    pub num_threads: u32,
}

impl Default for BuildParams {
    fn default() -> Self {
        Self {
            max_degree: 32,
            build_list_size: 50,
            search_dram_budget_gb: 0.003,
            build_dram_budget_gb: 1.0,
            num_threads: 1,
        }
    }
}

/// Everything the build tool needs to turn a dataset into an index under `build_dir`.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub build_tool: PathBuf,
    pub build_dir: PathBuf,
    pub index_basename: String,
    pub element_type: String,
    pub dist_fn: String,
    pub params: BuildParams,
}

impl BuildRequest {
    pub fn new(build_tool: impl Into<PathBuf>, build_dir: impl Into<PathBuf>) -> Self {
        Self {
            build_tool: build_tool.into(),
            build_dir: build_dir.into(),
            index_basename: INDEX_BASENAME.to_owned(),
            element_type: ELEMENT_TYPE_FLOAT.to_owned(),
            dist_fn: DIST_FN_L2.to_owned(),
            params: BuildParams::default(),
        }
    }

    pub fn with_index_basename(mut self, basename: impl Into<String>) -> Self {
        self.index_basename = basename.into();
        self
    }

    pub fn with_element_type(mut self, element_type: impl Into<String>) -> Self {
        self.element_type = element_type.into();
        self
    }

    pub fn with_params(mut self, params: BuildParams) -> Self {
        self.params = params;
        self
    }

    pub fn dataset_path(&self) -> PathBuf {
        self.build_dir.join(DATASET_FILE_NAME)
    }

    /// The prefix every index file shares; this is the path handed to the server.
    pub fn index_prefix(&self) -> PathBuf {
        self.build_dir.join(&self.index_basename)
    }

    pub fn disk_index_path(&self) -> PathBuf {
        disk_index_path(&self.index_prefix())
    }

    pub fn args(&self) -> Vec<OsString> {
        let BuildParams {
            max_degree,
            build_list_size,
            search_dram_budget_gb,
            build_dram_budget_gb,
            num_threads,
        } = &self.params;
        vec![
            self.element_type.clone().into(),
            self.dist_fn.clone().into(),
            self.dataset_path().into(),
            self.index_prefix().into(),
            max_degree.to_string().into(),
            build_list_size.to_string().into(),
            search_dram_budget_gb.to_string().into(),
            build_dram_budget_gb.to_string().into(),
            num_threads.to_string().into(),
        ]
    }
}

/// Path of the file a disk index with the given prefix is loaded from.
pub fn disk_index_path(index_prefix: &Path) -> PathBuf {
    let mut path = index_prefix.as_os_str().to_owned();
    path.push(DISK_INDEX_SUFFIX);
    PathBuf::from(path)
}

/// Produces an on-disk index from a dataset.
#[async_trait::async_trait]
pub trait IndexBuilder: Send + Sync {
    /// Builds the index and returns its prefix.
    async fn build(&self, request: &BuildRequest, vectors: &VectorMatrix) -> Result<PathBuf, Error>;
}

/// Runs DiskANN's `build_disk_index` as a subprocess.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskIndexBuilder;

#[async_trait::async_trait]
impl IndexBuilder for DiskIndexBuilder {
    async fn build(&self, request: &BuildRequest, vectors: &VectorMatrix) -> Result<PathBuf, Error> {
        tokio::fs::create_dir_all(&request.build_dir).await?;

        let dataset_path = request.dataset_path();
        let mut bytes = Vec::with_capacity(8 + std::mem::size_of_val(vectors.as_slice()));
        vectors.write_bin(&mut bytes)?;
        tokio::fs::write(&dataset_path, bytes).await?;
        debug!(path =% dataset_path.display(), rows = vectors.rows(), dims = vectors.dims(), "Wrote dataset");

        let args = request.args();
        info!(tool =% request.build_tool.display(), ?args, "Building disk index");
        let status = tokio::process::Command::new(&request.build_tool)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|source| Error::SpawnTool {
                tool: request.build_tool.clone(),
                source,
            })?;
        if !status.success() {
            return Err(Error::BuildFailed {
                tool: request.build_tool.clone(),
                status,
            });
        }

        verify_artifact(request).await?;
        Ok(request.index_prefix())
    }
}

/// Checks that the file the server loads exists. Its contents are not inspected.
pub async fn verify_artifact(request: &BuildRequest) -> Result<(), Error> {
    let path = request.disk_index_path();
    match tokio::fs::try_exists(&path).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(Error::MissingArtifact(path)),
        Err(err) => Err(err.into()),
    }
}

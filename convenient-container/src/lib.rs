//! Container runtime contract for SDK builds
//!
//! The build orchestrator only needs a handful of capabilities from a
//! container technology: image/container existence checks, image builds
//! with streamed output, container construction with mounts and environment,
//! blocking or interactive runs, log retrieval, exit status, and copying a
//! tree out of a container or image. [`ContainerRuntime`] and [`Container`]
//! capture exactly that; [`cli::CliRuntime`] implements it on top of the
//! `docker`/`podman` command line.
//!
//! Log output is a [`LogStream`]: a lazy, finite stream of lines that is
//! consumed while the producing process is still running and cannot be
//! restarted.

use std::collections::BTreeMap;
use std::path::Path;

use futures::stream::BoxStream;
use thiserror::Error;

pub mod cli;
pub mod mount;

pub use cli::{merged_output, status_code, CliRuntime};
pub use mount::{validate_mounts, Mount, MountKind};

/// Environment variable that marks a process as running inside a build container
pub const INSIDE_CONTAINER_ENV: &str = "INSIDE_CONTAINER";

/// Lines of output produced by a container, an image build or a process
pub type LogStream = BoxStream<'static, std::io::Result<String>>;

/// Container runtime errors
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Interactive containers do not return logs")]
    InteractiveLogs,

    #[error("Container has not been started")]
    NotStarted,

    #[error("Invalid mount {mount}: {reason}")]
    InvalidMount { mount: String, reason: String },

    #[error("No interface for container technology '{0}'")]
    UnsupportedTechnology(String),

    #[error("'{command}' failed with exit code {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Unexpected runtime output: {0}")]
    InvalidOutput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ContainerResult<T> = Result<T, ContainerError>;

/// Everything needed to construct a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Image tag the container is created from
    pub image: String,

    /// Environment passed into the container
    pub env: BTreeMap<String, String>,

    /// Attach a TTY and run in the foreground
    pub interactive: bool,

    /// Remove the container when it exits (interactive only)
    pub ephemeral: bool,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>, env: BTreeMap<String, String>) -> Self {
        Self {
            image: image.into(),
            env,
            interactive: false,
            ephemeral: false,
        }
    }

    pub fn interactive(mut self, ephemeral: bool) -> Self {
        self.interactive = true;
        self.ephemeral = ephemeral;
        self
    }
}

/// Capabilities the orchestrator needs from a container technology
#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Technology name (for logging)
    fn name(&self) -> &str;

    /// Does an image with this id or tag exist?
    async fn image_exists(&self, tag: &str) -> ContainerResult<bool>;

    /// Does a container with this id or name exist?
    async fn container_exists(&self, id: &str) -> ContainerResult<bool>;

    /// Build an image from `context_dir`, streaming the build output
    ///
    /// A failed build surfaces as the last item of the stream.
    async fn build_image(
        &self,
        no_cache: bool,
        context_dir: &Path,
        tag: &str,
        build_args: &BTreeMap<String, String>,
    ) -> ContainerResult<LogStream>;

    /// Construct (but don't start) a container
    fn new_container(&self, spec: ContainerSpec) -> Box<dyn Container>;

    /// Copy `src` out of an existing container as a tar archive at `dst`
    async fn copy_from_container(
        &self,
        id: &str,
        src: &str,
        dst: &Path,
        remove_after: bool,
    ) -> ContainerResult<()>;

    /// Copy `src` out of an image through a throwaway container
    async fn copy_from_image(&self, tag: &str, src: &str, dst: &Path) -> ContainerResult<()>;

    /// Remove a container, running or not
    async fn destroy(&self, id: &str) -> ContainerResult<()>;
}

/// A container constructed by a [`ContainerRuntime`]
#[async_trait::async_trait]
pub trait Container: Send + Sync {
    /// Validate and attach mounts; must be called before [`Container::run`]
    fn set_mounts(&mut self, mounts: Vec<Mount>) -> ContainerResult<()>;

    fn mounts(&self) -> &[Mount];

    fn spec(&self) -> &ContainerSpec;

    /// Start `cmd` in the container
    ///
    /// Detached for regular containers; interactive containers block until
    /// the shell exits.
    async fn run(&mut self, cmd: &[String]) -> ContainerResult<()>;

    /// Follow the container output until it exits
    ///
    /// # Errors
    ///
    /// `ContainerError::InteractiveLogs` for interactive containers.
    async fn logs(&mut self) -> ContainerResult<LogStream>;

    /// Block until the container exits and return its status code
    async fn wait(&mut self) -> ContainerResult<i32>;

    /// Runtime id, once started (interactive containers have none)
    fn id(&self) -> Option<&str>;
}

/// Pick the runtime implementation for a technology identifier
pub fn runtime_for(technology: &str) -> ContainerResult<Box<dyn ContainerRuntime>> {
    match technology {
        "docker" | "podman" => Ok(Box::new(CliRuntime::new(technology))),
        other => Err(ContainerError::UnsupportedTechnology(other.to_string())),
    }
}

/// True if this process runs inside a build container
pub fn inside_container() -> bool {
    std::env::var_os(INSIDE_CONTAINER_ENV).is_some_and(|value| !value.is_empty())
}

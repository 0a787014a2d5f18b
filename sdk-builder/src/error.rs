//! Error taxonomy for a build invocation

use std::path::PathBuf;

use convenient_container::ContainerError;
use convenient_git::GitError;
use convenient_paths::PathError;
use thiserror::Error;

/// Exit code for a build invocation without `--target`
pub const MISSING_TARGET_EXIT_CODE: i32 = 13;

/// Broad class of a [`BuildError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad flags, files or names; fix the invocation
    Configuration,
    /// Nothing to resume from (no image, no container)
    Precondition,
    /// A script, container, git or filesystem operation failed
    Execution,
    /// API misuse, e.g. logs from an interactive container
    Contract,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Mandatory argument not specified: '-t|--target'")]
    MissingTarget,

    #[error("Target specified ('{target}') not supported; known targets: {}", .known.join(", "))]
    UnknownTarget { target: String, known: Vec<String> },

    #[error("'{0}' does not identify a build task")]
    UnknownTask(String),

    #[error("Conflicting options: {0}")]
    ConflictingFlags(String),

    #[error("Developer configs can only be used for dev builds")]
    DeveloperConfigMisuse,

    #[error("Invalid number of build cores: {0}")]
    InvalidCores(u32),

    #[error("No SDK implementation for target '{0}'")]
    NoSdkForTarget(String),

    #[error("Invalid configuration file {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to read {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Path error: {0}")]
    Path(#[from] PathError),

    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    #[error("Checkout failed: {0}")]
    Git(#[from] GitError),

    #[error("Script {} failed with exit code {code}", .script.display())]
    ScriptFailed { script: PathBuf, code: i32 },

    #[error("Container exited with code {0}")]
    ContainerExit(i32),

    #[error("No Dockerfile at {}; populate the staging directory first", .0.display())]
    MissingDockerfile(PathBuf),

    #[error("Image build failed: {0}")]
    ImageBuild(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to copy tree: {0}")]
    Walk(#[from] walkdir::Error),
}

pub type BuildResult<T> = Result<T, BuildError>;

impl BuildError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::MissingTarget => MISSING_TARGET_EXIT_CODE,
            Self::ContainerExit(code) | Self::ScriptFailed { code, .. } if *code != 0 => *code,
            _ => 1,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Container(ContainerError::ImageNotFound(_))
            | Self::Container(ContainerError::ContainerNotFound(_)) => ErrorCategory::Precondition,
            Self::Container(ContainerError::InteractiveLogs)
            | Self::Container(ContainerError::NotStarted) => ErrorCategory::Contract,
            Self::Container(ContainerError::InvalidMount { .. })
            | Self::Container(ContainerError::UnsupportedTechnology(_)) => {
                ErrorCategory::Configuration
            }
            Self::MissingTarget
            | Self::UnknownTarget { .. }
            | Self::UnknownTask(_)
            | Self::ConflictingFlags(_)
            | Self::DeveloperConfigMisuse
            | Self::InvalidCores(_)
            | Self::NoSdkForTarget(_)
            | Self::MissingDockerfile(_)
            | Self::Config { .. }
            | Self::ConfigRead { .. }
            | Self::Path(_) => ErrorCategory::Configuration,
            _ => ErrorCategory::Execution,
        }
    }
}

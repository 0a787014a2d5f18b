//! Step dispatch
//!
//! A step list names tasks and the execution context each one belongs to.
//! The same list is read on the host and again inside the container; each
//! process only runs the steps for its own context.

use std::fmt;
use std::str::FromStr;

use tracing::{debug, info};

use crate::config::Step;
use crate::error::{BuildError, BuildResult};

/// Tasks a step list may name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildTask {
    Checkout,
    Build,
    BuildOnlyFirmware,
    InstallConfigs,
    PrepareSystem,
    PrepareSdk,
    BuildContainerImage,
    PopulateStagingDir,
    RetrieveBuildArtifacts,
}

impl BuildTask {
    pub const ALL: [BuildTask; 9] = [
        Self::Checkout,
        Self::Build,
        Self::BuildOnlyFirmware,
        Self::InstallConfigs,
        Self::PrepareSystem,
        Self::PrepareSdk,
        Self::BuildContainerImage,
        Self::PopulateStagingDir,
        Self::RetrieveBuildArtifacts,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Checkout => "checkout",
            Self::Build => "build",
            Self::BuildOnlyFirmware => "build_only_firmware",
            Self::InstallConfigs => "install_configs",
            Self::PrepareSystem => "prepare_system",
            Self::PrepareSdk => "prepare_sdk",
            Self::BuildContainerImage => "build_container_image",
            Self::PopulateStagingDir => "populate_staging_dir",
            Self::RetrieveBuildArtifacts => "retrieve_build_artifacts",
        }
    }
}

impl fmt::Display for BuildTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildTask {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|task| task.as_str() == s)
            .ok_or_else(|| BuildError::UnknownTask(s.to_string()))
    }
}

/// Something that can carry out a [`BuildTask`]
#[async_trait::async_trait]
pub trait TaskRunner: Send {
    async fn run_task(&mut self, task: BuildTask) -> BuildResult<()>;
}

/// Run, in order, every step whose context is `context`
///
/// Every step is parsed before anything runs, so a misspelled task fails
/// the whole list up front. Returns the tasks that ran.
///
/// # Errors
///
/// `BuildError::UnknownTask` for an unknown name, otherwise the first
/// error a task returns.
pub async fn dispatch<R>(steps: &[Step], context: &str, runner: &mut R) -> BuildResult<Vec<BuildTask>>
where
    R: TaskRunner + ?Sized,
{
    let plan = steps
        .iter()
        .map(|step| Ok((step.task.parse::<BuildTask>()?, step.context.as_str())))
        .collect::<BuildResult<Vec<_>>>()?;

    let mut ran = Vec::new();
    for (task, step_context) in plan {
        if step_context != context {
            debug!("Skipping step {} [{}]", task, step_context);
            continue;
        }
        info!(" > Step: {} [{}]", task, context);
        runner.run_task(task).await?;
        ran.push(task);
    }
    Ok(ran)
}

//! Command line

use std::path::PathBuf;

use clap::Parser;

use crate::config::{check_cores, BuildKind};
use crate::error::{BuildError, BuildResult};

/// Build an SDK inside a container
#[derive(Debug, Clone, Parser)]
#[command(name = "sdk-builder", version, about)]
pub struct Cli {
    /// Perform the build in a directory mounted from the host and keep
    /// artifacts there. Useful for 'dev' containers
    #[arg(short = 'd', long = "dev", alias = "devbuild-with-host-mounts")]
    pub dev: bool,

    /// Target platform to build for
    #[arg(short, long, value_name = "PLATFORM")]
    pub target: Option<String>,

    /// Do not print verbose/diagnostic messages
    #[arg(short, long)]
    pub quiet: bool,

    /// Print verbose/diagnostic messages when they've been silenced
    #[arg(short, long)]
    pub verbose: bool,

    /// Start clean: fresh checkout, image built without cache
    #[arg(long)]
    pub clean: bool,

    /// Check that every configuration file parses
    #[arg(long)]
    pub validate: bool,

    /// List currently supported targets
    #[arg(long)]
    pub list_targets: bool,

    /// Number of processor cores to use for the build
    #[arg(long, default_value_t = 1)]
    pub cores: u32,

    /// Build full firmware using prebuilt sdk infrastructure
    #[arg(long)]
    pub build_firmware: bool,

    /// Build only the given package(s) and retrieve the artifact(s).
    /// Assumes the firmware has already been built
    #[arg(long, num_args = 1.., value_name = "PACKAGE")]
    pub build_package: Option<Vec<String>>,

    /// Create and attach to a container for the target. The container is
    /// kept on exit unless --ephemeral is given too
    #[arg(long)]
    pub container: bool,

    /// With --container, remove the container when the shell exits
    #[arg(long)]
    pub ephemeral: bool,

    /// Developer config to use instead of <root>/developer.json
    #[arg(long, value_name = "CONFIG")]
    pub devconfig: Option<PathBuf>,

    /// Populate the staging directory and do nothing else
    #[arg(long)]
    pub stage: bool,

    /// Run the scripts of one hook with the current environment
    #[arg(long, value_name = "HOOK")]
    pub run_hook: Option<String>,

    /// Project root (default: current directory)
    #[arg(long, env = "SDK_BUILDER_ROOT", value_name = "DIR")]
    pub root: Option<PathBuf>,
}

/// What a build invocation does once the target is known
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildAction {
    /// Dispatch the step list
    Full,
    Firmware,
    Packages(Vec<String>),
    Interactive { ephemeral: bool },
    Stage,
}

/// What an invocation does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    ListTargets,
    Validate,
    RunHook(String),
    Build(BuildAction),
}

impl Cli {
    /// Reject flag combinations that make no sense
    pub fn check(&self) -> BuildResult<()> {
        if self.quiet && self.verbose {
            return Err(BuildError::ConflictingFlags(
                "'--verbose' and '--quiet'".to_string(),
            ));
        }
        if self.build_firmware && self.build_package.is_some() {
            return Err(BuildError::ConflictingFlags(
                "'--build-firmware' and '--build-package'".to_string(),
            ));
        }
        check_cores(self.cores)?;
        Ok(())
    }

    pub fn action(&self) -> Action {
        if self.list_targets {
            Action::ListTargets
        } else if self.validate {
            Action::Validate
        } else if let Some(hook) = &self.run_hook {
            Action::RunHook(hook.clone())
        } else if let Some(packages) = &self.build_package {
            Action::Build(BuildAction::Packages(packages.clone()))
        } else if self.build_firmware {
            Action::Build(BuildAction::Firmware)
        } else if self.container {
            Action::Build(BuildAction::Interactive {
                ephemeral: self.ephemeral,
            })
        } else if self.stage {
            Action::Build(BuildAction::Stage)
        } else {
            Action::Build(BuildAction::Full)
        }
    }

    /// Anything but staging, interactive sessions, listing and validation
    pub fn build_mode(&self) -> bool {
        !(self.stage || self.container || self.list_targets || self.validate)
    }

    pub fn interactive(&self) -> bool {
        self.container
    }

    /// Build mode is chatty by default; everything else only with `-v`
    pub fn verbose_output(&self) -> bool {
        !self.quiet && (self.build_mode() || self.verbose)
    }

    pub fn kind(&self) -> BuildKind {
        if self.dev { BuildKind::Dev } else { BuildKind::Automated }
    }

    /// Lower-cased target, if given
    pub fn target(&self) -> Option<String> {
        self.target
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
    }
}

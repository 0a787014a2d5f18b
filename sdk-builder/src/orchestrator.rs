//! Lifecycle of one SDK build
//!
//! [`BuildOrchestrator`] owns everything a single invocation needs: the
//! target's [`BuildSpec`], the read-only [`BuildConfig`], a view of the
//! path table pinned to this process's context, the container runtime and,
//! after a restricted build, the container it ran in.
//!
//! ```text
//! INIT -> CHECKOUT -> STAGED_BUILD{prebuild, build, postbuild} -> ARTIFACT_RETRIEVAL
//! INIT -> RESTRICTED_FIRMWARE_BUILD -> ARTIFACT_RETRIEVAL
//! INIT -> RESTRICTED_PACKAGE_BUILD -> ARTIFACT_RETRIEVAL
//! INIT -> INTERACTIVE_SESSION
//! INIT -> STAGE_POPULATE
//! ```
//!
//! Every step runs to completion before the next one; a failure ends the
//! run and containers left behind by a failed restricted build stay.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use convenient_container::{Container, ContainerError, ContainerRuntime, ContainerSpec, Mount, INSIDE_CONTAINER_ENV};
use convenient_git::{CheckoutOutcome, SdkCheckout};
use convenient_paths::{PathView, BASEDIR};
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::archive::{append_to_archive, last_component};
use crate::config::{BuildConfig, BuildKind, BuildSpec};
use crate::environment::{assemble_mounts, inherited, overlay, EnvMap, MandatoryMounts};
use crate::error::{BuildError, BuildResult};
use crate::layout::{CONTAINER, HOST, STAGING};
use crate::scripts::{run_hook, run_scripts};
use crate::staging::{self, STAGES};

/// Format of the start/end lines in the timestamp file
pub const TIMESTAMP_FORMAT: &str = "%b %d %Y ~ %H:%M";

/// Variable carrying the package list of a restricted package build
pub const PACKAGES_ENV: &str = "PACKAGES_TO_BUILD";

/// Hook run inside the container for a restricted package build
pub const BUILD_PACKAGES_HOOK: &str = "build_packages";

pub struct BuildOrchestrator {
    spec: BuildSpec,
    config: BuildConfig,
    paths: PathView,
    runtime: Box<dyn ContainerRuntime>,
    container: Option<Box<dyn Container>>,
    image_tag: String,
}

impl BuildOrchestrator {
    /// Set up the build and record its start time
    pub fn new(
        spec: BuildSpec,
        config: BuildConfig,
        paths: PathView,
        runtime: Box<dyn ContainerRuntime>,
    ) -> BuildResult<Self> {
        let image_tag = spec.image_tag(config.kind);
        let orchestrator = Self {
            spec,
            config,
            paths,
            runtime,
            container: None,
            image_tag,
        };
        orchestrator.record_timestamp("Started:   ")?;
        Ok(orchestrator)
    }

    pub fn spec(&self) -> &BuildSpec {
        &self.spec
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn paths(&self) -> &PathView {
        &self.paths
    }

    pub fn image_tag(&self) -> &str {
        &self.image_tag
    }

    /// Container of the last restricted build, if any
    pub fn container(&self) -> Option<&dyn Container> {
        self.container.as_deref()
    }

    /// SDK source tree in the current context
    pub fn sdk_path(&self) -> BuildResult<PathBuf> {
        Ok(self.paths.path("sdk_path")?.join(self.spec.dir_name()))
    }

    /// Append `<prefix> <time>` to the timestamp file, if this context has one
    fn record_timestamp(&self, prefix: &str) -> BuildResult<()> {
        let Some(path) = self.paths.try_resolve("timestamp") else {
            return Ok(());
        };
        let path = Path::new(&path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let now = chrono::Local::now().format(TIMESTAMP_FORMAT);
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{} {}", prefix, now)?;
        Ok(())
    }

    /// Values derived from the layout and the invocation
    fn computed_vars(&self) -> BuildResult<EnvMap> {
        let container = self.paths.pinned(Some(CONTAINER))?;
        let python_path = std::env::var("PYTHONPATH").unwrap_or_default();

        let mut vars = EnvMap::new();
        vars.insert(
            "VERBOSE".to_string(),
            if self.config.verbose { "Y" } else { "" }.to_string(),
        );
        vars.insert("BUILD_ARTIFACTS_OUTDIR".to_string(), container.resolve("outdir")?);
        vars.insert("PACKAGE_OUTDIR".to_string(), container.resolve("pkg_outdir")?);
        vars.insert("NUM_BUILD_CORES".to_string(), self.config.cores.to_string());
        vars.insert(
            "PYTHONPATH".to_string(),
            format!("{}:{}", python_path, container.resolve(BASEDIR)?),
        );
        vars.insert("CONFIGS_DIR".to_string(), container.resolve("files")?);
        vars.insert(
            "SDK_TOPDIR".to_string(),
            format!("{}{}", container.resolve("sdk_path")?, self.spec.dir_name()),
        );
        Ok(vars)
    }

    /// Assembled environment, lowest priority first: inherited (optional),
    /// defaults, SDK variables, computed values, user overrides
    pub fn env_vars(&self, inherit: bool) -> BuildResult<EnvMap> {
        let base = if inherit { inherited() } else { EnvMap::new() };
        let computed = self.computed_vars()?;
        Ok(overlay([
            &base,
            &self.config.env_defaults,
            &self.spec.environment.variables,
            &computed,
            &self.config.env_overrides,
        ]))
    }

    /// Mounts for containers of this build
    pub fn mounts(&self) -> BuildResult<Vec<Mount>> {
        let host = self.paths.pinned(Some(HOST))?;
        let container = self.paths.pinned(Some(CONTAINER))?;
        let mandatory = MandatoryMounts {
            sdk_source: host.path("sdk_path")?.join(self.spec.dir_name()).to_string_lossy().to_string(),
            sdk_target: format!("{}{}", container.resolve("home")?, self.spec.dir_name()),
            staging_source: host.resolve("staging")?,
            staging_target: container.resolve(BASEDIR)?,
        };
        Ok(assemble_mounts(
            self.config.kind,
            &self.config.mount_defaults,
            &mandatory,
            &self.config.mount_overrides,
        )?)
    }

    /// Clone or switch the SDK sources to the target's revision
    pub async fn checkout(&self) -> BuildResult<CheckoutOutcome> {
        let checkout = SdkCheckout::new(self.sdk_path()?, &self.spec.sdk_url, &self.spec.sdk_tag)
            .clean_start(self.config.clean_start);
        Ok(checkout.run().await?)
    }

    /// Staged build for `automated`, firmware-only build for `dev`
    pub async fn build(&mut self) -> BuildResult<()> {
        match self.config.kind {
            BuildKind::Automated => self.run_staged_build().await,
            BuildKind::Dev => self.build_only_firmware().await,
        }
    }

    /// Run the prebuild, build and postbuild script directories in order
    pub async fn run_staged_build(&self) -> BuildResult<()> {
        let scripts = self.paths.path("scripts")?;
        let env = self.env_vars(true)?;
        for stage in STAGES {
            let time = chrono::Local::now().format("%H:%M:%S");
            info!("============| Stage: {} [{}] |============", stage, time);
            run_scripts(&scripts.join(stage), &env).await?;
        }
        Ok(())
    }

    /// Rebuild the firmware in a container of the existing image
    pub async fn build_only_firmware(&mut self) -> BuildResult<()> {
        info!("Restricted firmware-only build using prebuilt sdk");
        let env = self.container_env()?;
        let cmd = self.entrypoint_command(vec![
            "-t".to_string(),
            self.spec.target.clone(),
            format!("--cores={}", self.config.cores),
        ])?;
        self.run_restricted(env, cmd).await
    }

    /// Build `packages` in a container of the existing image
    pub async fn build_packages(&mut self, packages: &[String]) -> BuildResult<()> {
        info!("Restricted build for packages: {}", packages.join(" "));
        let mut env = self.container_env()?;
        env.insert(PACKAGES_ENV.to_string(), packages.join(" "));
        let cmd = self.entrypoint_command(vec![
            "--run-hook".to_string(),
            BUILD_PACKAGES_HOOK.to_string(),
        ])?;
        self.run_restricted(env, cmd).await
    }

    /// Attach a shell in a container of the existing image
    ///
    /// Returns the shell's exit code.
    pub async fn interactive_session(&mut self, ephemeral: bool) -> BuildResult<i32> {
        info!("Getting interactive container for image '{}'", self.image_tag);
        self.require_image().await?;

        let spec = ContainerSpec::new(&self.image_tag, self.container_env()?).interactive(ephemeral);
        let mut container = self.runtime.new_container(spec);
        container.set_mounts(self.mounts()?)?;
        container.run(&["/bin/bash".to_string()]).await?;
        let code = container.wait().await?;
        info!("Interactive session ended with code {}", code);
        Ok(code)
    }

    /// Build the image for this (sdk, kind, target) from the staging tree
    pub async fn build_container_image(&self) -> BuildResult<()> {
        let staging = self.paths.pinned(Some(STAGING))?;
        let context_dir = staging.path(BASEDIR)?;
        let dockerfile = staging.path("dockerfile")?;
        if !dockerfile.is_file() {
            return Err(BuildError::MissingDockerfile(dockerfile));
        }
        let outdir = self.paths.resolve_in(CONTAINER, "outdir")?;
        let user = &self.config.build_user;

        let build_args: BTreeMap<String, String> = [
            ("UID", nix::unistd::getuid().as_raw().to_string()),
            ("GID", nix::unistd::getgid().as_raw().to_string()),
            ("USER", user.clone()),
            ("GROUP", user.clone()),
            ("SDK_DIRNAME", self.spec.dir_name()),
            ("TARGET", self.spec.target.clone()),
            (
                "QUIET_MODE_CLI_FLAG",
                if self.config.verbose { "" } else { "--quiet" }.to_string(),
            ),
            ("NUM_BUILD_CORES_CLI_FLAG", format!("--cores={}", self.config.cores)),
            ("BUILD_ARTIFACTS_OUTDIR", outdir),
            (
                "DEV_BUILD_CLI_FLAG",
                if self.config.kind == BuildKind::Dev { "-d" } else { "" }.to_string(),
            ),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        debug!("Image build args: {:?}", build_args);

        let mut output = self
            .runtime
            .build_image(self.config.clean_start, &context_dir, &self.image_tag, &build_args)
            .await?;
        while let Some(line) = output.next().await {
            let line = line.map_err(|e| BuildError::ImageBuild(e.to_string()))?;
            info!(target: "container", "{}", line);
        }
        info!("Built image {}", self.image_tag);
        Ok(())
    }

    /// Recreate the staging directory
    pub fn populate_staging_dir(&self) -> BuildResult<()> {
        let host = self.paths.pinned(Some(HOST))?;
        staging::populate(
            &host,
            &self.spec.sdk_name,
            self.config.entrypoint_source.as_deref(),
            &self.config.entrypoint,
        )
    }

    /// Run a hook with the full environment
    pub async fn run_hook(&self, hook: &str) -> BuildResult<()> {
        let hooks = self.paths.path("hooks")?;
        run_hook(&hooks, hook, &self.env_vars(true)?).await?;
        Ok(())
    }

    /// Copy `source` (container path, default: the output directory) into
    /// the host archive, then append the build log and timestamps under
    /// `prefix` (default: last component of `source`)
    ///
    /// Copies from the container of a restricted build (removing it) when
    /// there is one, else from the image for `automated` builds. A `dev`
    /// build without a container has nothing to copy.
    pub async fn retrieve_build_artifacts(
        &mut self,
        source: Option<&str>,
        prefix: Option<&str>,
    ) -> BuildResult<PathBuf> {
        let outdir = self.paths.path("outdir")?;
        std::fs::create_dir_all(&outdir)?;
        let archive = outdir.join(format!("{}.tar", self.spec.build_artifacts_archive_name));
        let source = match source {
            Some(source) => source.to_string(),
            None => self.paths.resolve_in(CONTAINER, "outdir")?,
        };
        let prefix = prefix.map_or_else(|| last_component(&source), str::to_string);

        match self.container.take() {
            Some(container) => {
                info!("Copying artifacts from scope-restricted build");
                let id = container.id().ok_or(ContainerError::NotStarted)?;
                if !self.runtime.container_exists(id).await? {
                    return Err(ContainerError::ContainerNotFound(id.to_string()).into());
                }
                self.runtime
                    .copy_from_container(id, &source, &archive, true)
                    .await?;
            }
            None if self.config.kind == BuildKind::Automated => {
                info!("Copying full build artifacts");
                if !self.runtime.image_exists(&self.image_tag).await? {
                    return Err(ContainerError::ImageNotFound(self.image_tag.clone()).into());
                }
                self.runtime
                    .copy_from_image(&self.image_tag, &source, &archive)
                    .await?;
            }
            None => warn!("No container to copy artifacts from"),
        }

        self.record_timestamp("Completed: ")?;
        let extras: Vec<PathBuf> = ["buildlog", "timestamp"]
            .into_iter()
            .filter_map(|label| self.paths.try_resolve(label))
            .map(PathBuf::from)
            .collect();
        let extras: Vec<&Path> = extras.iter().map(PathBuf::as_path).collect();
        append_to_archive(&archive, &extras, &prefix)?;

        info!("Artifacts bundled in {}", archive.display());
        Ok(archive)
    }

    /// Environment passed into build containers
    fn container_env(&self) -> BuildResult<EnvMap> {
        let mut env = self.env_vars(false)?;
        env.insert(INSIDE_CONTAINER_ENV.to_string(), "1".to_string());
        Ok(env)
    }

    /// This program inside the container, followed by `args`
    fn entrypoint_command(&self, args: Vec<String>) -> BuildResult<Vec<String>> {
        let basedir = self.paths.resolve_in(CONTAINER, BASEDIR)?;
        let mut cmd = vec![format!("{}{}", basedir, self.config.entrypoint)];
        cmd.extend(args);
        Ok(cmd)
    }

    async fn require_image(&self) -> BuildResult<()> {
        if !self.runtime.image_exists(&self.image_tag).await? {
            warn!("Action not possible: no container image '{}' found", self.image_tag);
            return Err(ContainerError::ImageNotFound(self.image_tag.clone()).into());
        }
        Ok(())
    }

    /// Run `cmd` in a fresh container, following its output to the log
    async fn run_restricted(&mut self, env: EnvMap, cmd: Vec<String>) -> BuildResult<()> {
        self.require_image().await?;

        let mut container = self
            .runtime
            .new_container(ContainerSpec::new(&self.image_tag, env));
        container.set_mounts(self.mounts()?)?;

        info!("Starting container with cmd '{}'", cmd.join(" "));
        container.run(&cmd).await?;

        let mut logs = container.logs().await?;
        while let Some(line) = logs.next().await {
            let line = line?;
            info!(target: "container", "{}", line);
        }

        let code = container.wait().await?;
        info!("Container exited with exit code {}", code);
        self.container = Some(container);
        if code != 0 {
            return Err(BuildError::ContainerExit(code));
        }
        Ok(())
    }
}

//! One invocation, from parsed flags to exit code

use std::path::{Path, PathBuf};

use convenient_container::ContainerRuntime;
use convenient_paths::PathView;
use tracing::{debug, info};

use crate::cli::{Action, BuildAction, Cli};
use crate::config::{
    load_env_defaults, load_json, warn_oversubscribed, BuildConfig, BuildKind, BuildSpec,
    DeveloperConfig, StepList, Variables,
};
use crate::dispatcher::dispatch;
use crate::environment::inherited;
use crate::error::{BuildError, BuildResult};
use crate::layout::{standard_layout, LayoutOptions, CONTAINER};
use crate::orchestrator::BuildOrchestrator;
use crate::scripts::run_hook;
use crate::sdk::SdkRegistry;

/// Print the supported targets for the user
pub fn print_targets(known: &[String]) {
    if known.is_empty() {
        println!("No support for any targets");
        return;
    }
    println!("Supported targets:");
    for target in known {
        println!("\t ** {}", target);
    }
}

/// Parsed flags plus the path table they select
pub struct Session {
    cli: Cli,
    paths: PathView,
}

impl Session {
    /// Check the flags and lay out the paths under `root`
    pub fn new(cli: Cli, root: &Path, inside_container: bool) -> BuildResult<Self> {
        cli.check()?;
        let target = cli.target();
        let options = LayoutOptions::new(root)
            .target(target.as_deref())
            .inside_container(inside_container);
        let paths = standard_layout(&options)?;
        Ok(Self { cli, paths })
    }

    /// Same, with an explicit layout (tests use a relocated container home)
    pub fn with_layout(cli: Cli, options: &LayoutOptions) -> BuildResult<Self> {
        cli.check()?;
        let options = options.clone().target(cli.target().as_deref());
        let paths = standard_layout(&options)?;
        Ok(Self { cli, paths })
    }

    pub fn cli(&self) -> &Cli {
        &self.cli
    }

    pub fn paths(&self) -> &PathView {
        &self.paths
    }

    /// Target directories under the target root, sorted, without `common`
    pub fn known_targets(&self) -> BuildResult<Vec<String>> {
        let tgroot = self.paths.path("tgroot")?;
        let mut targets = Vec::new();
        if tgroot.is_dir() {
            for entry in std::fs::read_dir(&tgroot)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if entry.file_type()?.is_dir() && name != "common" {
                    targets.push(name);
                }
            }
        }
        targets.sort();
        Ok(targets)
    }

    /// The requested target, which must be a known one
    ///
    /// # Errors
    ///
    /// `BuildError::MissingTarget` without `--target`,
    /// `BuildError::UnknownTarget` (listing the known ones) otherwise.
    pub fn target(&self) -> BuildResult<String> {
        let target = self.cli.target().ok_or(BuildError::MissingTarget)?;
        let known = self.known_targets()?;
        if !known.contains(&target) {
            return Err(BuildError::UnknownTarget { target, known });
        }
        Ok(target)
    }

    /// The developer config in effect, if the file exists
    pub fn developer_config(&self) -> Option<PathBuf> {
        self.cli
            .devconfig
            .clone()
            .or_else(|| self.paths.path("devconfig").ok())
            .filter(|path| path.is_file())
    }

    /// Recreate the temp directory and, unless interactive, the output
    /// directory
    pub fn clean_workspace(&self) -> BuildResult<Vec<PathBuf>> {
        let mut dirs = vec![self.paths.path("tmpdir")?];
        if !self.cli.interactive() {
            dirs.push(self.paths.path("outdir")?);
        }
        for dir in &dirs {
            match std::fs::remove_dir_all(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            std::fs::create_dir_all(dir)?;
        }
        Ok(dirs)
    }

    /// Host log file, if this process runs on the host
    pub fn log_file(&self) -> Option<PathBuf> {
        self.paths.try_resolve("buildlog").map(PathBuf::from)
    }

    /// Parse every configuration file, returning the ones checked
    ///
    /// # Errors
    ///
    /// The first file that doesn't parse, or a target directory without
    /// its `<target>_spec.json`.
    pub fn validate(&self) -> BuildResult<Vec<PathBuf>> {
        let mut checked = Vec::new();

        for label in ["automated_build_steps", "dev_build_steps"] {
            let path = self.paths.path(label)?;
            if path.is_file() {
                let _: StepList = load_json(&path)?;
                checked.push(path);
            }
        }

        let common_specs = self.paths.path("common")?.join("specs");
        if common_specs.is_dir() {
            let mut files: Vec<PathBuf> = std::fs::read_dir(&common_specs)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
                .collect();
            files.sort();
            for path in files {
                let _: Variables = load_json(&path)?;
                checked.push(path);
            }
        }

        let tgroot = self.paths.path("tgroot")?;
        for target in self.known_targets()? {
            let path = tgroot.join(&target).join(format!("{}_spec.json", target));
            BuildSpec::load(&path)?;
            checked.push(path);
        }

        if let Some(path) = self.developer_config() {
            DeveloperConfig::load(&path)?;
            checked.push(path);
        }

        for path in &checked {
            info!(" # {} : valid.", path.display());
        }
        Ok(checked)
    }

    /// Run a hook outside any build, with this process's environment
    pub async fn run_hook(&self, hook: &str) -> BuildResult<usize> {
        let hooks = self.paths.path("hooks")?;
        run_hook(&hooks, hook, &inherited()).await
    }

    /// Assemble the [`BuildConfig`] for `spec`
    ///
    /// Runs once logging is up, so core-count warnings reach the build log.
    pub fn build_config(&self, entrypoint_source: Option<PathBuf>) -> BuildResult<BuildConfig> {
        let kind = self.cli.kind();
        let devconfig = self.developer_config();
        if devconfig.is_some()
            && (self.cli.build_mode() || self.cli.interactive())
            && kind != BuildKind::Dev
        {
            return Err(BuildError::DeveloperConfigMisuse);
        }
        let devconfig = match devconfig {
            Some(path) => {
                info!("Using developer config {}", path.display());
                DeveloperConfig::load(&path)?
            }
            None => DeveloperConfig::default(),
        };
        let home = self.paths.resolve_in(CONTAINER, "home")?;
        warn_oversubscribed(self.cli.cores);

        Ok(BuildConfig {
            kind,
            clean_start: self.cli.clean,
            cores: self.cli.cores,
            verbose: self.cli.verbose_output(),
            env_defaults: load_env_defaults(&self.paths.path("env_defaults")?)?,
            env_overrides: devconfig.environment.variables.clone(),
            mount_defaults: Vec::new(),
            mount_overrides: devconfig.mounts_under(&home),
            entrypoint_source,
            ..BuildConfig::default()
        })
    }

    /// Run a build action for `target`
    ///
    /// Returns the exit code of an interactive shell, 0 otherwise.
    pub async fn execute(
        &self,
        action: BuildAction,
        config: BuildConfig,
        runtime: Box<dyn ContainerRuntime>,
        registry: &SdkRegistry,
    ) -> BuildResult<i32> {
        let spec = BuildSpec::load(&self.paths.path("tgspec")?)?;
        info!(" ** SDK type:   '{}'", config.kind);
        info!(" ** SDK target: '{}'", spec.target);

        let steps_label = match config.kind {
            BuildKind::Automated => "automated_build_steps",
            BuildKind::Dev => "dev_build_steps",
        };
        let steps = StepList::load(&self.paths.path(steps_label)?)?;

        let orchestrator = BuildOrchestrator::new(spec, config, self.paths.clone(), runtime)?;
        debug!(" ** environment: {:?}", orchestrator.env_vars(false)?);
        debug!(" ** mounts: {:?}", orchestrator.mounts()?);
        let mut sdk = registry.create(orchestrator)?;

        match action {
            BuildAction::Packages(packages) => {
                sdk.build_packages(&packages).await?;
                let source = self.paths.resolve_in(CONTAINER, "pkg_outdir")?;
                sdk.retrieve_build_artifacts(Some(&source)).await?;
            }
            BuildAction::Firmware => {
                sdk.build_only_firmware().await?;
                let source = self.paths.resolve_in(CONTAINER, "outdir")?;
                sdk.retrieve_build_artifacts(Some(&source)).await?;
            }
            BuildAction::Interactive { ephemeral } => {
                return sdk.interactive_session(ephemeral).await;
            }
            BuildAction::Stage => sdk.populate_staging_dir().await?,
            BuildAction::Full => {
                debug!(" ** steps: {:?}", steps.steps);
                let ran = dispatch(&steps.steps, self.paths.context(), sdk.as_mut()).await?;
                info!("Ran {} step(s) in context '{}'", ran.len(), self.paths.context());
            }
        }
        Ok(0)
    }

    /// Everything after logging is set up
    pub async fn run(
        &self,
        runtime_for: impl FnOnce(&str) -> BuildResult<Box<dyn ContainerRuntime>>,
        registry: &SdkRegistry,
    ) -> BuildResult<i32> {
        match self.cli.action() {
            Action::ListTargets => {
                print_targets(&self.known_targets()?);
                Ok(0)
            }
            Action::Validate => {
                self.validate()?;
                Ok(0)
            }
            Action::RunHook(hook) => {
                self.run_hook(&hook).await?;
                Ok(0)
            }
            Action::Build(action) => {
                let config = self.build_config(std::env::current_exe().ok())?;
                let runtime = runtime_for(&config.container_tech)?;
                self.execute(action, config, runtime, registry).await
            }
        }
    }
}

//! SDK families
//!
//! [`Sdk`] is what a family of SDKs can do. Every family delegates to a
//! [`BuildOrchestrator`] for the shared lifecycle and overrides what
//! differs. [`SdkRegistry`] maps targets and family names to constructors.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::dispatcher::{BuildTask, TaskRunner};
use crate::error::{BuildError, BuildResult};
use crate::orchestrator::BuildOrchestrator;

/// Lifecycle operations of an SDK family
#[async_trait::async_trait]
pub trait Sdk: Send {
    /// Family name
    fn name(&self) -> &str;

    fn orchestrator(&self) -> &BuildOrchestrator;

    async fn checkout(&mut self) -> BuildResult<()>;
    async fn build(&mut self) -> BuildResult<()>;
    async fn build_only_firmware(&mut self) -> BuildResult<()>;
    async fn build_packages(&mut self, packages: &[String]) -> BuildResult<()>;
    async fn install_configs(&mut self) -> BuildResult<()>;
    async fn prepare_system(&mut self) -> BuildResult<()>;
    async fn prepare_sdk(&mut self) -> BuildResult<()>;
    async fn build_container_image(&mut self) -> BuildResult<()>;
    async fn populate_staging_dir(&mut self) -> BuildResult<()>;
    async fn interactive_session(&mut self, ephemeral: bool) -> BuildResult<i32>;
    async fn retrieve_build_artifacts(&mut self, source: Option<&str>) -> BuildResult<PathBuf>;
}

#[async_trait::async_trait]
impl<S: Sdk + ?Sized> TaskRunner for S {
    async fn run_task(&mut self, task: BuildTask) -> BuildResult<()> {
        match task {
            BuildTask::Checkout => self.checkout().await,
            BuildTask::Build => self.build().await,
            BuildTask::BuildOnlyFirmware => self.build_only_firmware().await,
            BuildTask::InstallConfigs => self.install_configs().await,
            BuildTask::PrepareSystem => self.prepare_system().await,
            BuildTask::PrepareSdk => self.prepare_sdk().await,
            BuildTask::BuildContainerImage => self.build_container_image().await,
            BuildTask::PopulateStagingDir => self.populate_staging_dir().await,
            BuildTask::RetrieveBuildArtifacts => self.retrieve_build_artifacts(None).await.map(|_| ()),
        }
    }
}

/// OpenWrt and boards built from an OpenWrt tree
pub struct OpenWrtSdk {
    inner: BuildOrchestrator,
}

impl OpenWrtSdk {
    pub const FAMILY: &'static str = "openwrt";

    pub fn new(inner: BuildOrchestrator) -> Self {
        Self { inner }
    }
}

#[async_trait::async_trait]
impl Sdk for OpenWrtSdk {
    fn name(&self) -> &str {
        Self::FAMILY
    }

    fn orchestrator(&self) -> &BuildOrchestrator {
        &self.inner
    }

    async fn checkout(&mut self) -> BuildResult<()> {
        let outcome = self.inner.checkout().await?;
        debug!("Checkout: {:?}", outcome);
        Ok(())
    }

    async fn build(&mut self) -> BuildResult<()> {
        self.inner.build().await
    }

    async fn build_only_firmware(&mut self) -> BuildResult<()> {
        self.inner.build_only_firmware().await
    }

    async fn build_packages(&mut self, packages: &[String]) -> BuildResult<()> {
        self.inner.build_packages(packages).await
    }

    async fn install_configs(&mut self) -> BuildResult<()> {
        self.inner.run_hook("install_configs").await
    }

    async fn prepare_system(&mut self) -> BuildResult<()> {
        self.inner.run_hook("prepare_system").await
    }

    async fn prepare_sdk(&mut self) -> BuildResult<()> {
        self.inner.run_hook("prepare_sdk").await
    }

    async fn build_container_image(&mut self) -> BuildResult<()> {
        self.inner.build_container_image().await
    }

    async fn populate_staging_dir(&mut self) -> BuildResult<()> {
        self.inner.populate_staging_dir()
    }

    async fn interactive_session(&mut self, ephemeral: bool) -> BuildResult<i32> {
        self.inner.interactive_session(ephemeral).await
    }

    async fn retrieve_build_artifacts(&mut self, source: Option<&str>) -> BuildResult<PathBuf> {
        self.inner.retrieve_build_artifacts(source, None).await
    }
}

fn openwrt(orchestrator: BuildOrchestrator) -> Box<dyn Sdk> {
    Box::new(OpenWrtSdk::new(orchestrator))
}

/// Builds the [`Sdk`] for an orchestrator
pub type SdkFactory = fn(BuildOrchestrator) -> Box<dyn Sdk>;

/// Target and family name to [`Sdk`] constructor
#[derive(Default)]
pub struct SdkRegistry {
    targets: BTreeMap<String, SdkFactory>,
    families: BTreeMap<String, SdkFactory>,
}

impl SdkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every family this crate ships
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_family(OpenWrtSdk::FAMILY, openwrt);
        registry.register_target("rpi4b", openwrt);
        registry
    }

    /// Constructor for one specific target; wins over the family entry
    pub fn register_target(&mut self, target: &str, factory: SdkFactory) {
        self.targets.insert(target.to_lowercase(), factory);
    }

    /// Constructor for every target whose `sdk_name` is `family`
    pub fn register_family(&mut self, family: &str, factory: SdkFactory) {
        self.families.insert(family.to_lowercase(), factory);
    }

    /// The [`Sdk`] for the orchestrator's target
    ///
    /// # Errors
    ///
    /// `BuildError::NoSdkForTarget` if neither the target nor its SDK family
    /// is registered.
    pub fn create(&self, orchestrator: BuildOrchestrator) -> BuildResult<Box<dyn Sdk>> {
        let target = orchestrator.spec().target.to_lowercase();
        let family = orchestrator.spec().sdk_name.to_lowercase();

        let factory = self
            .targets
            .get(&target)
            .or_else(|| self.families.get(&family))
            .ok_or_else(|| BuildError::NoSdkForTarget(target.clone()))?;
        let sdk = factory(orchestrator);
        info!("Using {} SDK for target '{}'", sdk.name(), target);
        Ok(sdk)
    }
}

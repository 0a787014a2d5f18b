//! Build configuration: per-target specs, step lists, environment
//! defaults, the developer override file and the invocation settings.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use convenient_container::Mount;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{BuildError, BuildResult};

/// User the build runs as inside the container
pub const DEFAULT_BUILD_USER: &str = "dev";

/// Container technology used unless told otherwise
pub const DEFAULT_CONTAINER_TECH: &str = "docker";

/// Name this program is installed under in the staging root
pub const DEFAULT_ENTRYPOINT: &str = "sdk-builder";

/// Read and deserialize a JSON configuration file
pub fn load_json<T: DeserializeOwned>(path: &Path) -> BuildResult<T> {
    debug!("Loading {}", path.display());
    let content = std::fs::read_to_string(path).map_err(|source| BuildError::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| BuildError::Config {
        path: path.to_path_buf(),
        source,
    })
}

/// `{"variables": {...}}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variables {
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

/// Shared environment defaults for every target
pub fn load_env_defaults(path: &Path) -> BuildResult<BTreeMap<String, String>> {
    load_json::<Variables>(path).map(|v| v.variables)
}

/// Per-target build description, `<target>_spec.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
    pub target: String,
    pub sdk_name: String,
    pub sdk_url: String,
    pub sdk_tag: String,

    #[serde(default)]
    pub environment: Variables,

    /// Artifact archive name, without the `.tar` extension
    pub build_artifacts_archive_name: String,
}

impl BuildSpec {
    pub fn load(path: &Path) -> BuildResult<Self> {
        load_json(path)
    }

    /// Directory the SDK sources are checked out to, e.g. `openwrt_v23.05.3`
    pub fn dir_name(&self) -> String {
        format!("{}_{}", self.sdk_name, self.sdk_tag)
    }

    /// Tag of the image built for this (sdk, kind, target) triple
    pub fn image_tag(&self, kind: BuildKind) -> String {
        format!(
            "{}_{}:latest_{}_{}",
            self.sdk_name, self.sdk_tag, kind, self.target
        )
        .to_lowercase()
    }
}

/// One `{"<task>": "<context>"}` entry of a step list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub task: String,
    pub context: String,
}

impl Step {
    pub fn new(task: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            context: context.into(),
        }
    }
}

#[derive(Deserialize)]
struct RawStepList {
    steps: Vec<BTreeMap<String, String>>,
}

/// Ordered step list, `automated_build.json` / `dev_build.json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawStepList")]
pub struct StepList {
    pub steps: Vec<Step>,
}

impl TryFrom<RawStepList> for StepList {
    type Error = String;

    fn try_from(raw: RawStepList) -> Result<Self, Self::Error> {
        let steps = raw
            .steps
            .into_iter()
            .enumerate()
            .map(|(i, entry)| {
                if entry.len() != 1 {
                    return Err(format!(
                        "step {} must map exactly one task to a context, found {} entries",
                        i,
                        entry.len()
                    ));
                }
                let (task, context) = entry.into_iter().next().ok_or_else(String::new)?;
                Ok(Step { task, context })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { steps })
    }
}

impl StepList {
    pub fn load(path: &Path) -> BuildResult<Self> {
        load_json(path)
    }
}

/// Developer override file: extra variables and extra mounts
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DeveloperConfig {
    #[serde(default)]
    pub environment: Variables,

    /// Mounts keyed by a free-form label
    #[serde(default)]
    pub mounts: BTreeMap<String, Mount>,
}

impl DeveloperConfig {
    pub fn load(path: &Path) -> BuildResult<Self> {
        load_json(path)
    }

    /// Override mounts with relative targets placed under `container_home`
    pub fn mounts_under(&self, container_home: &str) -> Vec<Mount> {
        let home = container_home.trim_end_matches('/');
        self.mounts
            .values()
            .map(|mount| {
                let mut mount = mount.clone();
                if !mount.target.starts_with('/') {
                    mount.target = format!("{}/{}", home, mount.target);
                }
                mount
            })
            .collect()
    }
}

/// `automated` builds are self-contained in the image; `dev` builds work
/// on sources mounted from the host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum BuildKind {
    #[default]
    Automated,
    Dev,
}

impl BuildKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Automated => "automated",
            Self::Dev => "dev",
        }
    }
}

impl fmt::Display for BuildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Invocation-level settings, assembled once and read-only afterwards
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfig {
    pub kind: BuildKind,
    pub clean_start: bool,
    pub cores: u32,
    pub verbose: bool,
    pub env_defaults: BTreeMap<String, String>,
    pub env_overrides: BTreeMap<String, String>,
    pub mount_defaults: Vec<Mount>,
    pub mount_overrides: Vec<Mount>,
    pub container_tech: String,
    pub build_user: String,
    /// File name of this program in the staging root
    pub entrypoint: String,
    /// Binary copied into the staging root; `None` skips the copy
    pub entrypoint_source: Option<PathBuf>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            kind: BuildKind::Automated,
            clean_start: false,
            cores: 1,
            verbose: false,
            env_defaults: BTreeMap::new(),
            env_overrides: BTreeMap::new(),
            mount_defaults: Vec::new(),
            mount_overrides: Vec::new(),
            container_tech: DEFAULT_CONTAINER_TECH.to_string(),
            build_user: DEFAULT_BUILD_USER.to_string(),
            entrypoint: DEFAULT_ENTRYPOINT.to_string(),
            entrypoint_source: None,
        }
    }
}

/// Reject a core count of zero
pub fn check_cores(cores: u32) -> BuildResult<u32> {
    if cores == 0 {
        return Err(BuildError::InvalidCores(cores));
    }
    Ok(cores)
}

/// Warn when more cores are requested than the host has
///
/// Returns whether the request exceeds the host.
pub fn warn_oversubscribed(cores: u32) -> bool {
    let available = num_cpus::get();
    let over = cores as usize > available;
    if over {
        warn!(
            "{} build cores requested but only {} available",
            cores, available
        );
    }
    over
}

#[cfg(test)]
mod tests {
    use super::*;
    use convenient_container::MountKind;

    #[test]
    fn test_image_tag_is_lower_case() {
        let spec: BuildSpec = serde_json::from_str(
            r#"{
                "target": "RPi4B",
                "sdk_name": "OpenWrt",
                "sdk_url": "https://git.openwrt.org/openwrt/openwrt.git",
                "sdk_tag": "v23.05.3",
                "environment": {"variables": {"FORCE_UNSAFE_CONFIGURE": "1"}},
                "build_artifacts_archive_name": "rpi4b_artifacts"
            }"#,
        )
        .unwrap();

        assert_eq!(spec.dir_name(), "OpenWrt_v23.05.3");
        assert_eq!(spec.image_tag(BuildKind::Dev), "openwrt_v23.05.3:latest_dev_rpi4b");
        assert_eq!(spec.environment.variables["FORCE_UNSAFE_CONFIGURE"], "1");
    }

    #[test]
    fn test_step_list_keeps_order() {
        let steps: StepList = serde_json::from_str(
            r#"{"steps": [{"checkout": "host"}, {"build": "container"}, {"retrieve_build_artifacts": "host"}]}"#,
        )
        .unwrap();
        assert_eq!(
            steps.steps,
            vec![
                Step::new("checkout", "host"),
                Step::new("build", "container"),
                Step::new("retrieve_build_artifacts", "host"),
            ]
        );
    }

    #[test]
    fn test_step_with_two_tasks_is_rejected() {
        let result: Result<StepList, _> =
            serde_json::from_str(r#"{"steps": [{"checkout": "host", "build": "container"}]}"#);
        let err = result.unwrap_err().to_string();
        assert!(err.contains("exactly one task"), "{}", err);
    }

    #[test]
    fn test_developer_mounts_relative_to_home() {
        let config: DeveloperConfig = serde_json::from_str(
            r#"{
                "environment": {"variables": {"CONFIG_DEBUG": "y"}},
                "mounts": {
                    "dl": {"source": "/data/dl", "target": "openwrt_v23.05.3/dl", "type": "bind"},
                    "ccache": {"source": "ccache", "target": "/ccache", "type": "volume"}
                }
            }"#,
        )
        .unwrap();

        let mounts = config.mounts_under("/home/dev/");
        assert_eq!(
            mounts,
            vec![
                Mount::new("ccache", "/ccache", MountKind::Volume),
                Mount::bind("/data/dl", "/home/dev/openwrt_v23.05.3/dl"),
            ]
        );
    }

    #[test]
    fn test_zero_cores_is_rejected() {
        assert!(matches!(check_cores(0), Err(BuildError::InvalidCores(0))));
        assert_eq!(check_cores(1).unwrap(), 1);
        assert!(!warn_oversubscribed(1));
    }
}

//! Shared fixtures: an in-memory container runtime and a project tree

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use convenient_container::{
    Container, ContainerError, ContainerResult, ContainerRuntime, ContainerSpec, LogStream, Mount,
};
use futures::stream;
use tempfile::TempDir;

/// What the fake runtime saw and what it will answer
#[derive(Debug, Default)]
pub struct State {
    pub images: BTreeSet<String>,
    pub containers: BTreeSet<String>,
    pub calls: Vec<String>,
    pub exit_code: i32,
    pub log_lines: Vec<String>,
    /// Containers handed out by `new_container`
    pub constructed: usize,
    /// Containers started with `run`
    pub created: usize,
    pub started: Vec<(ContainerSpec, Vec<Mount>, Vec<String>)>,
    pub build_args: BTreeMap<String, String>,
    pub build_fails: bool,
}

/// Container runtime that never leaves the process
#[derive(Clone, Default)]
pub struct FakeRuntime {
    pub state: Arc<Mutex<State>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(tag: &str) -> Self {
        let runtime = Self::new();
        runtime.state().images.insert(tag.to_string());
        runtime
    }

    pub fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn boxed(&self) -> Box<dyn ContainerRuntime> {
        Box::new(self.clone())
    }
}

/// Archive standing in for whatever the container produced
fn write_artifacts(dst: &Path, src: &str) -> ContainerResult<()> {
    let prefix = src.trim_end_matches('/').rsplit('/').next().unwrap_or("out");
    let file = fs::File::create(dst)?;
    let mut builder = tar::Builder::new(file);
    let data = b"firmware image";
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, format!("{}/firmware.bin", prefix), &data[..])?;
    builder.finish()?;
    Ok(())
}

#[async_trait::async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    async fn image_exists(&self, tag: &str) -> ContainerResult<bool> {
        Ok(self.state().images.contains(tag))
    }

    async fn container_exists(&self, id: &str) -> ContainerResult<bool> {
        Ok(self.state().containers.contains(id))
    }

    async fn build_image(
        &self,
        no_cache: bool,
        _context_dir: &Path,
        tag: &str,
        build_args: &BTreeMap<String, String>,
    ) -> ContainerResult<LogStream> {
        let mut state = self.state();
        state.calls.push(format!("build {} no_cache={}", tag, no_cache));
        state.build_args = build_args.clone();
        let mut lines = vec![Ok("Step 1/2 : FROM debian".to_string())];
        if state.build_fails {
            lines.push(Err(std::io::Error::other("build exited with code 1")));
        } else {
            state.images.insert(tag.to_string());
            lines.push(Ok(format!("Successfully tagged {}", tag)));
        }
        Ok(Box::pin(stream::iter(lines)))
    }

    fn new_container(&self, spec: ContainerSpec) -> Box<dyn Container> {
        self.state().constructed += 1;
        Box::new(FakeContainer {
            state: self.state.clone(),
            spec,
            mounts: Vec::new(),
            id: None,
        })
    }

    async fn copy_from_container(
        &self,
        id: &str,
        src: &str,
        dst: &Path,
        remove_after: bool,
    ) -> ContainerResult<()> {
        let mut state = self.state();
        if !state.containers.contains(id) {
            return Err(ContainerError::ContainerNotFound(id.to_string()));
        }
        state.calls.push(format!("copy {}:{}", id, src));
        write_artifacts(dst, src)?;
        if remove_after {
            state.containers.remove(id);
            state.calls.push(format!("destroy {}", id));
        }
        Ok(())
    }

    async fn copy_from_image(&self, tag: &str, src: &str, dst: &Path) -> ContainerResult<()> {
        let mut state = self.state();
        if !state.images.contains(tag) {
            return Err(ContainerError::ImageNotFound(tag.to_string()));
        }
        state.calls.push(format!("copy image {}:{}", tag, src));
        write_artifacts(dst, src)
    }

    async fn destroy(&self, id: &str) -> ContainerResult<()> {
        let mut state = self.state();
        state.containers.remove(id);
        state.calls.push(format!("destroy {}", id));
        Ok(())
    }
}

pub struct FakeContainer {
    state: Arc<Mutex<State>>,
    spec: ContainerSpec,
    mounts: Vec<Mount>,
    id: Option<String>,
}

#[async_trait::async_trait]
impl Container for FakeContainer {
    fn set_mounts(&mut self, mounts: Vec<Mount>) -> ContainerResult<()> {
        self.mounts = convenient_container::validate_mounts(mounts)?;
        Ok(())
    }

    fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    fn spec(&self) -> &ContainerSpec {
        &self.spec
    }

    async fn run(&mut self, cmd: &[String]) -> ContainerResult<()> {
        let mut state = self.state.lock().unwrap();
        state.created += 1;
        state
            .started
            .push((self.spec.clone(), self.mounts.clone(), cmd.to_vec()));
        if !self.spec.interactive {
            let id = format!("fake{}", state.created);
            state.containers.insert(id.clone());
            self.id = Some(id);
        }
        Ok(())
    }

    async fn logs(&mut self) -> ContainerResult<LogStream> {
        if self.spec.interactive {
            return Err(ContainerError::InteractiveLogs);
        }
        if self.id.is_none() {
            return Err(ContainerError::NotStarted);
        }
        let lines: Vec<std::io::Result<String>> =
            self.state.lock().unwrap().log_lines.iter().cloned().map(Ok).collect();
        Ok(Box::pin(stream::iter(lines)))
    }

    async fn wait(&mut self) -> ContainerResult<i32> {
        Ok(self.state.lock().unwrap().exit_code)
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }
}

pub const TARGET: &str = "rpi4b";
pub const SDK_TAG: &str = "v23.05.3";

/// Image tag the fixture target gets for a build kind
pub fn image_tag(kind: &str) -> String {
    format!("openwrt_{}:latest_{}_{}", SDK_TAG, kind, TARGET)
}

/// A project root with one target, shared defaults and step lists
pub struct Project {
    pub dir: TempDir,
}

impl Project {
    pub fn new() -> Self {
        let project = Self {
            dir: TempDir::new().unwrap(),
        };
        project.write(
            &format!("spec/targets/{0}/{0}_spec.json", TARGET),
            &format!(
                r#"{{
    "target": "{}",
    "sdk_name": "openwrt",
    "sdk_url": "https://git.openwrt.org/openwrt/openwrt.git",
    "sdk_tag": "{}",
    "environment": {{"variables": {{"SDK_VAR": "from-spec"}}}},
    "build_artifacts_archive_name": "rpi4b-firmware"
}}"#,
                TARGET, SDK_TAG
            ),
        );
        project.write("Dockerfile", "FROM debian:bookworm\n");
        project.write(
            "spec/targets/common/specs/environment.json",
            r#"{"variables": {"DEFAULT_VAR": "default", "SDK_VAR": "from-defaults"}}"#,
        );
        project.write(
            "spec/steps/automated_build.json",
            r#"{"steps": [
    {"checkout": "host"},
    {"populate_staging_dir": "host"},
    {"build_container_image": "host"},
    {"build": "container"},
    {"retrieve_build_artifacts": "host"}
]}"#,
        );
        project.write(
            "spec/steps/dev_build.json",
            r#"{"steps": [
    {"populate_staging_dir": "host"},
    {"build_container_image": "host"},
    {"build": "host"},
    {"retrieve_build_artifacts": "host"}
]}"#,
        );
        project
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Container home for layouts that run "inside" the container
    pub fn home(&self) -> PathBuf {
        self.root().join("home")
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root().join(rel)
    }

    pub fn write(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.path(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    /// Executable shell script
    #[cfg(unix)]
    pub fn script(&self, rel: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = self.write(rel, &format!("#!/bin/sh\n{}\n", body));
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }
}

/// Entry names of a tar archive, sorted
pub fn archive_entries(path: &Path) -> Vec<String> {
    let mut archive = tar::Archive::new(fs::File::open(path).unwrap());
    let mut names: Vec<String> = archive
        .entries()
        .unwrap()
        .map(|entry| entry.unwrap().path().unwrap().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

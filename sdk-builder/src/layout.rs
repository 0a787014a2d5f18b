//! The label table every build uses
//!
//! Three contexts: `host` is the project root, `container` the base
//! directory inside the build container and `staging` the tree that
//! becomes the image build context.

use std::path::{Path, PathBuf};

use convenient_paths::{PathGraph, PathResult, PathView, ALL, BASEDIR};

pub const HOST: &str = "host";
pub const CONTAINER: &str = "container";
pub const STAGING: &str = "staging";

/// Home directory of the build user inside the container
pub const CONTAINER_HOME: &str = "/home/dev";

/// Where the project lives and which context this process runs in
#[derive(Debug, Clone)]
pub struct LayoutOptions {
    pub root: PathBuf,
    pub container_home: String,
    pub target: Option<String>,
    pub inside_container: bool,
}

impl LayoutOptions {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            container_home: CONTAINER_HOME.to_string(),
            target: None,
            inside_container: false,
        }
    }

    pub fn target(mut self, target: Option<&str>) -> Self {
        self.target = target.map(str::to_string);
        self
    }

    pub fn container_home(mut self, home: impl Into<String>) -> Self {
        self.container_home = home.into();
        self
    }

    pub fn inside_container(mut self, inside: bool) -> Self {
        self.inside_container = inside;
        self
    }
}

/// Register the standard labels and pin the current context
pub fn standard_layout(options: &LayoutOptions) -> PathResult<PathView> {
    let root = options.root.to_string_lossy();
    let root = root.trim_end_matches('/');
    let home = options.container_home.trim_end_matches('/');
    let staging_root = format!("{}/staging", root);

    let mut graph = PathGraph::new();
    graph.add_context(HOST, root)?;
    graph.add_context(CONTAINER, format!("{}/base", home))?;
    graph.add_context(STAGING, staging_root.clone())?;
    graph.set_current(if options.inside_container { CONTAINER } else { HOST })?;

    graph.register(CONTAINER, "home", home, None)?;
    graph.register(ALL, "tmpdir", ".tmp", Some(BASEDIR))?;
    graph.register(ALL, "specs", "spec", Some(BASEDIR))?;
    graph.register(ALL, "tgroot", "targets", Some("specs"))?;
    graph.register(ALL, "schemas", "json_schema", Some("specs"))?;
    graph.register(ALL, "steps_dir", "steps", Some("specs"))?;
    graph.register(ALL, "common", "common", Some("tgroot"))?;

    graph.register(HOST, "outdir", "out", Some(BASEDIR))?;
    graph.register(CONTAINER, "outdir", "out", Some("home"))?;
    graph.register(ALL, "pkg_outdir", "package", Some("outdir"))?;
    graph.register(HOST, "sdk_path", "", Some(BASEDIR))?;
    graph.register(CONTAINER, "sdk_path", "", Some("home"))?;

    graph.register_file(HOST, "timestamp", "timestamp", Some("tmpdir"))?;
    graph.register_file(HOST, "buildlog", "build.log", Some("tmpdir"))?;
    graph.register_file(ALL, "automated_build_steps", "automated_build.json", Some("steps_dir"))?;
    graph.register_file(ALL, "dev_build_steps", "dev_build.json", Some("steps_dir"))?;
    graph.register_file(ALL, "env_defaults", "specs/environment.json", Some("common"))?;
    graph.register_file(HOST, "devconfig", "developer.json", Some(BASEDIR))?;
    graph.register_file(HOST, "dockerfile", "Dockerfile", Some(BASEDIR))?;
    graph.register_file("staging;container", "dockerfile", "Dockerfile", Some(BASEDIR))?;

    graph.register(HOST, "depends", "depends", Some("specs"))?;
    graph.register("staging;container", "depends", "depends", Some(BASEDIR))?;
    graph.register(HOST, "common_scripts", "scripts", Some("common"))?;
    graph.register(HOST, "common_hooks", "hooks", Some("common_scripts"))?;
    graph.register(HOST, "common_files", "files", Some("common"))?;

    graph.register(HOST, "staging", staging_root.clone(), None)?;
    graph.register(HOST, "filestore", staging_root, None)?;
    graph.register("staging;container", "filestore", "", Some(BASEDIR))?;
    graph.register(ALL, "system_configs", "files/system_config", Some("filestore"))?;
    graph.register(ALL, "sdk_configs", "files/sdk_config", Some("filestore"))?;

    graph.register("staging;container", "files", "files", Some(BASEDIR))?;
    graph.register("staging;container", "scripts", "scripts", Some(BASEDIR))?;
    graph.register("staging;container", "hooks", "hooks", Some("scripts"))?;

    if let Some(target) = &options.target {
        graph.register(ALL, "target", target.as_str(), Some("tgroot"))?;
        graph.register_file(ALL, "tgspec", format!("{}_spec.json", target), Some("target"))?;
        graph.register(HOST, "target_scripts", "scripts", Some("target"))?;
        graph.register(HOST, "target_hooks", "hooks", Some("target_scripts"))?;
        graph.register(HOST, "target_files", "files", Some("target"))?;
        graph.register_file(HOST, "target_dockerfile", "Dockerfile", Some("target"))?;
    }

    graph.into_view()
}

//! Staging directory population
//!
//! The staging tree is the build context of the SDK image and, once the
//! image exists, the base directory inside the container. Sources are
//! merged in three layers (common, SDK family, target) with later layers
//! overwriting earlier files.

use std::fs;
use std::path::{Path, PathBuf};

use convenient_paths::{PathView, BASEDIR};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{BuildError, BuildResult};
use crate::layout::STAGING;
use crate::scripts::HOOKS;

/// Build stages with a script directory each
pub const STAGES: [&str; 3] = ["prebuild", "build", "postbuild"];

/// Copy the contents of `src` into `dst`, overwriting existing files
///
/// A missing source is skipped. Returns the number of files copied.
pub fn copy_tree(src: &Path, dst: &Path) -> BuildResult<usize> {
    if !src.is_dir() {
        debug!("Nothing to copy from {}", src.display());
        return Ok(0);
    }

    let mut copied = 0;
    for entry in WalkDir::new(src).follow_links(true) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Copy one file into directory `dst_dir`; the file must exist
fn copy_file_into(src: &Path, dst_dir: &Path) -> BuildResult<()> {
    let name = src.file_name().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} has no file name", src.display()),
        )
    })?;
    fs::create_dir_all(dst_dir)?;
    fs::copy(src, dst_dir.join(name)).map_err(|e| {
        BuildError::Io(std::io::Error::new(
            e.kind(),
            format!("{}: {}", src.display(), e),
        ))
    })?;
    Ok(())
}

/// Recreate the staging tree from the host sources
///
/// The target's `Dockerfile` wins over the project one; either lands in
/// the staging root.
///
/// `paths` must be pinned to the host context; `sdk_name` selects the
/// family layer and `entrypoint` is copied into the staging root under
/// `entrypoint_name`.
pub fn populate(
    paths: &PathView,
    sdk_name: &str,
    entrypoint: Option<&Path>,
    entrypoint_name: &str,
) -> BuildResult<()> {
    let host = paths;
    let staging = paths.pinned(Some(STAGING))?;
    let root = staging.path(BASEDIR)?;

    info!("Populating staging directory {}", root.display());
    match fs::remove_dir_all(&root) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    fs::create_dir_all(&root)?;

    // what the builder itself needs to carry on inside the container
    copy_tree(&host.path("depends")?, &staging.path("depends")?)?;
    copy_tree(&host.path("schemas")?, &staging.path("schemas")?)?;
    copy_tree(&host.path("steps_dir")?, &staging.path("steps_dir")?)?;
    copy_file_into(&host.path("tgspec")?, &staging.path("target")?)?;
    copy_file_into(
        &host.path("env_defaults")?,
        &staging.path("common")?.join("specs"),
    )?;

    let common_files = host.path("common_files")?;
    let common_scripts = host.path("common_scripts")?;
    let common_hooks = host.path("common_hooks")?;
    let files = staging.path("files")?;
    let scripts = staging.path("scripts")?;
    let hooks = staging.path("hooks")?;

    let mut copied = 0;
    for layer in ["common", sdk_name] {
        for kind in ["system_config", "sdk_config"] {
            copied += copy_tree(&common_files.join(kind).join(layer), &files.join(kind))?;
        }
        for stage in STAGES {
            copied += copy_tree(&common_scripts.join(stage).join(layer), &scripts.join(stage))?;
        }
        for hook in HOOKS {
            copied += copy_tree(&common_hooks.join(hook).join(layer), &hooks.join(hook))?;
        }
    }

    // target overrides land on top; target hooks live under its scripts
    copied += copy_tree(&host.path("target_files")?, &files)?;
    copied += copy_tree(&host.path("target_scripts")?, &scripts)?;
    info!("Staged {} build files", copied);

    let dockerfile = [host.path("target_dockerfile")?, host.path("dockerfile")?]
        .into_iter()
        .find(|path| path.is_file());
    match dockerfile {
        Some(src) => {
            debug!("Using {} for the image build", src.display());
            fs::copy(&src, staging.path("dockerfile")?)?;
        }
        None => warn!("No Dockerfile found for target or project; the image can't be built"),
    }

    if let Some(entrypoint) = entrypoint {
        let installed: PathBuf = root.join(entrypoint_name);
        debug!("Installing {} as {}", entrypoint.display(), installed.display());
        fs::copy(entrypoint, &installed)?;
    }
    Ok(())
}

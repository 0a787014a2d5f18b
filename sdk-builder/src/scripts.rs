//! Running directories of executable scripts
//!
//! Build stages and hooks are both directories of executables run in
//! lexicographic order with one shared environment.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use convenient_container::{merged_output, status_code};
use futures::StreamExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::environment::EnvMap;
use crate::error::{BuildError, BuildResult};

/// Hooks the build knows about
pub const HOOKS: [&str; 4] = ["install_configs", "prepare_system", "prepare_sdk", "build_packages"];

/// Executable regular files directly under `dir`, sorted by name
///
/// A missing directory yields no scripts.
pub fn sorted_scripts(dir: &Path) -> BuildResult<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut scripts = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_file() && is_executable(&metadata) {
            scripts.push(entry.path());
        }
    }
    scripts.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(scripts)
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}

/// Run one script with exactly `env`, logging its output line by line
///
/// # Errors
///
/// `BuildError::ScriptFailed` on a non-zero exit.
pub async fn run_script(script: &Path, env: &EnvMap) -> BuildResult<()> {
    info!("Running {}", script.display());
    let mut cmd = Command::new(script);
    cmd.env_clear()
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = script.parent() {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn()?;
    let mut output = merged_output(&mut child);
    while let Some(line) = output.next().await {
        let line = line?;
        info!(target: "script", "{}", line);
    }

    let code = status_code(child.wait().await?);
    if code != 0 {
        return Err(BuildError::ScriptFailed {
            script: script.to_path_buf(),
            code,
        });
    }
    Ok(())
}

/// Run every script under `dir` in order, stopping at the first failure
///
/// Returns the number of scripts run.
pub async fn run_scripts(dir: &Path, env: &EnvMap) -> BuildResult<usize> {
    let scripts = sorted_scripts(dir)?;
    if scripts.is_empty() {
        warn!("No scripts to run in {}", dir.display());
    }
    for script in &scripts {
        run_script(script, env).await?;
    }
    Ok(scripts.len())
}

/// Run the scripts of `hook` under `hooks_dir`
///
/// A hook without scripts is only a warning.
pub async fn run_hook(hooks_dir: &Path, hook: &str, env: &EnvMap) -> BuildResult<usize> {
    if !HOOKS.contains(&hook) {
        warn!("Running unrecognized hook '{}'", hook);
    }
    let dir = hooks_dir.join(hook);
    info!(" => [Hook runner] {}", dir.display());
    run_scripts(&dir, env).await
}

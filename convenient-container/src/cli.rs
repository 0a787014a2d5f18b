//! `docker`/`podman` command-line backend
//!
//! Both tools share the command-line surface used here, so one
//! implementation drives either binary. Every call shells out; nothing is
//! cached between calls.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::mount::{validate_mounts, Mount};
use crate::{Container, ContainerError, ContainerResult, ContainerRuntime, ContainerSpec, LogStream};

/// Container runtime driven through its command-line client
#[derive(Debug, Clone)]
pub struct CliRuntime {
    program: String,
}

impl CliRuntime {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.kill_on_drop(true);
        cmd
    }

    /// Run to completion, returning stdout; a non-zero exit is an error
    async fn output(&self, args: &[&str]) -> ContainerResult<String> {
        debug!("{} {}", self.program, args.join(" "));
        let output = self
            .command()
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            return Err(ContainerError::CommandFailed {
                command: format!("{} {}", self.program, args.join(" ")),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Exit status only, output discarded
    async fn succeeds(&self, args: &[&str]) -> ContainerResult<bool> {
        let status = self
            .command()
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        Ok(status.success())
    }

    /// Stream `<program> cp <from> -` (a tar archive) into `dst`
    async fn copy_archive(&self, from: &str, dst: &Path) -> ContainerResult<()> {
        info!("Copying {} to {}", from, dst.display());
        let mut child = self
            .command()
            .args(["cp", from, "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ContainerError::InvalidOutput("cp produced no stdout".to_string()))?;
        let mut file = tokio::fs::File::create(dst).await?;
        let bytes = tokio::io::copy(&mut stdout, &mut file).await?;

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(ContainerError::CommandFailed {
                command: format!("{} cp {} -", self.program, from),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        debug!("Wrote {} bytes to {}", bytes, dst.display());
        Ok(())
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for CliRuntime {
    fn name(&self) -> &str {
        &self.program
    }

    async fn image_exists(&self, tag: &str) -> ContainerResult<bool> {
        self.succeeds(&["image", "inspect", tag]).await
    }

    async fn container_exists(&self, id: &str) -> ContainerResult<bool> {
        self.succeeds(&["container", "inspect", id]).await
    }

    async fn build_image(
        &self,
        no_cache: bool,
        context_dir: &Path,
        tag: &str,
        build_args: &BTreeMap<String, String>,
    ) -> ContainerResult<LogStream> {
        let args = build_args_for(no_cache, context_dir, tag, build_args);
        info!("Building image {} from {}", tag, context_dir.display());
        debug!("{} {}", self.program, args.join(" "));

        let child = self
            .command()
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        Ok(child_output(child, format!("{} build", self.program)))
    }

    fn new_container(&self, spec: ContainerSpec) -> Box<dyn Container> {
        Box::new(CliContainer {
            runtime: self.clone(),
            spec,
            mounts: Vec::new(),
            id: None,
            exit_code: None,
        })
    }

    async fn copy_from_container(
        &self,
        id: &str,
        src: &str,
        dst: &Path,
        remove_after: bool,
    ) -> ContainerResult<()> {
        if !self.container_exists(id).await? {
            return Err(ContainerError::ContainerNotFound(id.to_string()));
        }
        self.copy_archive(&format!("{}:{}", id, src), dst).await?;
        if remove_after {
            self.destroy(id).await?;
        }
        Ok(())
    }

    async fn copy_from_image(&self, tag: &str, src: &str, dst: &Path) -> ContainerResult<()> {
        if !self.image_exists(tag).await? {
            return Err(ContainerError::ImageNotFound(tag.to_string()));
        }

        let id = self.output(&["create", tag]).await?;
        if id.is_empty() {
            return Err(ContainerError::InvalidOutput(format!(
                "no container id from create {}",
                tag
            )));
        }
        let copied = self.copy_archive(&format!("{}:{}", id, src), dst).await;
        // the throwaway container goes either way
        let removed = self.destroy(&id).await;
        copied.and(removed)
    }

    async fn destroy(&self, id: &str) -> ContainerResult<()> {
        debug!("Removing container {}", id);
        self.output(&["rm", "-f", id]).await.map(|_| ())
    }
}

/// A container started through the command-line client
pub struct CliContainer {
    runtime: CliRuntime,
    spec: ContainerSpec,
    mounts: Vec<Mount>,
    id: Option<String>,
    exit_code: Option<i32>,
}

#[async_trait::async_trait]
impl Container for CliContainer {
    fn set_mounts(&mut self, mounts: Vec<Mount>) -> ContainerResult<()> {
        self.mounts = validate_mounts(mounts)?;
        Ok(())
    }

    fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    fn spec(&self) -> &ContainerSpec {
        &self.spec
    }

    async fn run(&mut self, cmd: &[String]) -> ContainerResult<()> {
        let args = run_args(&self.spec, &self.mounts, cmd);

        if self.spec.interactive {
            info!("Attaching to {} {}", self.runtime.program, args.join(" "));
            let status = self.runtime.command().args(&args).status().await?;
            self.exit_code = Some(status_code(status));
            return Ok(());
        }

        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let id = self.runtime.output(&refs).await?;
        if id.is_empty() {
            return Err(ContainerError::InvalidOutput(
                "no container id from run".to_string(),
            ));
        }
        info!("Started container {}", id);
        self.id = Some(id);
        Ok(())
    }

    async fn logs(&mut self) -> ContainerResult<LogStream> {
        if self.spec.interactive {
            return Err(ContainerError::InteractiveLogs);
        }
        let id = self.id.as_deref().ok_or(ContainerError::NotStarted)?;

        let child = self
            .runtime
            .command()
            .args(["logs", "--follow", id])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        Ok(child_output(child, format!("{} logs", self.runtime.program)))
    }

    async fn wait(&mut self) -> ContainerResult<i32> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let id = self.id.clone().ok_or(ContainerError::NotStarted)?;
        let output = self.runtime.output(&["wait", &id]).await?;
        let code = output
            .lines()
            .last()
            .and_then(|line| line.trim().parse::<i32>().ok())
            .ok_or_else(|| ContainerError::InvalidOutput(format!("wait returned '{}'", output)))?;
        self.exit_code = Some(code);
        Ok(code)
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }
}

/// Arguments for `<program> build`
fn build_args_for(
    no_cache: bool,
    context_dir: &Path,
    tag: &str,
    build_args: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut args = vec![
        "build".to_string(),
        "--network=host".to_string(),
        "--rm".to_string(),
        "--tag".to_string(),
        tag.to_string(),
    ];
    if no_cache {
        args.push("--no-cache".to_string());
    }
    for (key, value) in build_args {
        args.push("--build-arg".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.push(context_dir.to_string_lossy().to_string());
    args
}

/// Arguments for `<program> run`
fn run_args(spec: &ContainerSpec, mounts: &[Mount], cmd: &[String]) -> Vec<String> {
    let mut args = vec!["run".to_string()];

    if spec.interactive {
        if spec.ephemeral {
            args.push("--rm".to_string());
        }
        args.push("-it".to_string());
    } else {
        args.push("--detach".to_string());
    }
    args.push("--network=host".to_string());

    for (key, value) in &spec.env {
        args.push("--env".to_string());
        args.push(format!("{}={}", key, value));
    }
    for mount in mounts {
        args.push("--mount".to_string());
        args.push(mount.to_mount_arg());
    }

    args.push(spec.image.clone());
    args.extend(cmd.iter().cloned());
    args
}

/// Exit code of a finished process; signals map to `128 + signal`
pub fn status_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or_else(|| {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            128 + status.signal().unwrap_or(0)
        }
        #[cfg(not(unix))]
        {
            1
        }
    })
}

/// Lines of a reader, ending at EOF or after the first read error
///
/// Bytes that aren't UTF-8 are replaced rather than failing the stream.
fn lines_of<R>(reader: R) -> LogStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    stream::unfold(Some(BufReader::new(reader)), |state| async move {
        let mut reader = state?;
        let mut buf = Vec::new();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => None,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                Some((Ok(line), Some(reader)))
            }
            Err(e) => Some((Err(e), None)),
        }
    })
    .boxed()
}

/// Take the piped stdout and stderr of `child` and interleave their lines
///
/// The child itself is left to the caller to wait on.
pub fn merged_output(child: &mut Child) -> LogStream {
    let stdout = child.stdout.take().map(lines_of);
    let stderr = child.stderr.take().map(lines_of);
    stream::select(
        stdout.unwrap_or_else(|| stream::empty().boxed()),
        stderr.unwrap_or_else(|| stream::empty().boxed()),
    )
    .boxed()
}

/// Merged output of `child`, then its exit status
///
/// After both pipes close the child is reaped; an unsuccessful exit becomes
/// the final item of the stream.
fn child_output(mut child: Child, what: String) -> LogStream {
    let merged = merged_output(&mut child);

    let status = stream::once(async move {
        match child.wait().await {
            Ok(status) if status.success() => None,
            Ok(status) => Some(Err(std::io::Error::other(format!(
                "{} exited with code {}",
                what,
                status_code(status)
            )))),
            Err(e) => Some(Err(e)),
        }
    })
    .filter_map(|item| async move { item });

    merged.chain(status).boxed()
}

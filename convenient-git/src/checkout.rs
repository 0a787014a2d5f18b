//! Clone or switch an SDK working copy
//!
//! All `git2` work runs on the blocking pool.

use std::path::{Path, PathBuf};

use git2::{build::CheckoutBuilder, AutotagOption, FetchOptions, Oid, ProxyOptions, RemoteCallbacks, Repository};
use tokio::task;
use tracing::{debug, info};

use crate::{GitError, GitResult};

/// What [`SdkCheckout::run`] did to get the working copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutOutcome {
    /// A fresh clone
    Cloned,
    /// The existing working copy was moved to the revision
    Switched,
}

/// Working copy of an SDK at a revision
#[derive(Debug, Clone)]
pub struct SdkCheckout {
    path: PathBuf,
    url: String,
    revision: String,
    clean_start: bool,
}

impl SdkCheckout {
    /// # Arguments
    ///
    /// * `path` - Where the working copy lives
    /// * `url` - Clone URL (a local path works too)
    /// * `revision` - Tag, branch or commit to check out
    pub fn new(path: impl AsRef<Path>, url: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            url: url.into(),
            revision: revision.into(),
            clean_start: false,
        }
    }

    /// Remove an existing working copy before checking out
    pub fn clean_start(mut self, clean_start: bool) -> Self {
        self.clean_start = clean_start;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bring the working copy to the configured revision
    ///
    /// # Errors
    ///
    /// `GitError::InvalidReference` if the revision is unknown even after a
    /// fetch, `GitError::NotARepository` if the path holds something else,
    /// otherwise whatever git or the filesystem report.
    pub async fn run(&self) -> GitResult<CheckoutOutcome> {
        if self.clean_start && tokio::fs::try_exists(&self.path).await? {
            info!("Clean start: removing {}", self.path.display());
            tokio::fs::remove_dir_all(&self.path).await?;
        }

        if self.is_working_copy().await? {
            info!("Switching {} to {}", self.path.display(), self.revision);
            self.switch().await?;
            return Ok(CheckoutOutcome::Switched);
        }

        info!("Cloning {} ({}) into {}", self.url, self.revision, self.path.display());
        self.clone_fresh().await?;
        Ok(CheckoutOutcome::Cloned)
    }

    /// Commit id the working copy is at
    pub async fn head_commit(&self) -> GitResult<String> {
        let path = self.path.clone();
        blocking(move || {
            let repo = Repository::open(&path)?;
            let commit = repo.head()?.peel_to_commit()?;
            Ok(commit.id().to_string())
        })
        .await
    }

    /// True for an openable repository, false for nothing or an empty directory
    async fn is_working_copy(&self) -> GitResult<bool> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(false);
        }
        if Repository::open(&self.path).is_ok() {
            return Ok(true);
        }

        let mut entries = tokio::fs::read_dir(&self.path).await?;
        if entries.next_entry().await?.is_none() {
            return Ok(false);
        }
        Err(GitError::NotARepository(self.path.clone()))
    }

    async fn clone_fresh(&self) -> GitResult<()> {
        let path = self.path.clone();
        let url = self.url.clone();
        let revision = self.revision.clone();

        blocking(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let repo = git2::build::RepoBuilder::new()
                .fetch_options(fetch_options())
                .clone(&url, &path)?;
            let oid = resolve(&repo, &revision)?;
            detach_at(&repo, oid)?;
            info!("Checked out {} at {}", revision, oid);
            Ok(())
        })
        .await
    }

    async fn switch(&self) -> GitResult<()> {
        let path = self.path.clone();
        let revision = self.revision.clone();

        blocking(move || {
            let repo = Repository::open(&path)?;
            let oid = match resolve(&repo, &revision) {
                Ok(oid) => oid,
                Err(GitError::InvalidReference(_)) => {
                    debug!("{} not known locally, fetching", revision);
                    fetch_origin(&repo)?;
                    resolve(&repo, &revision)?
                }
                Err(e) => return Err(e),
            };
            detach_at(&repo, oid)?;
            info!("Checked out {} at {}", revision, oid);
            Ok(())
        })
        .await
    }
}

async fn blocking<T, F>(f: F) -> GitResult<T>
where
    F: FnOnce() -> GitResult<T> + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(f)
        .await
        .map_err(|e| GitError::Task(e.to_string()))?
}

fn fetch_options() -> FetchOptions<'static> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.transfer_progress(|stats| {
        if stats.received_objects() == stats.total_objects() {
            debug!(
                "Resolving deltas {}/{}",
                stats.indexed_deltas(),
                stats.total_deltas()
            );
        } else if stats.received_objects() % 1000 == 0 {
            debug!(
                "Received {}/{} objects ({} kb)",
                stats.received_objects(),
                stats.total_objects(),
                stats.received_bytes() / 1024
            );
        }
        true
    });

    let mut proxy = ProxyOptions::new();
    proxy.auto();

    let mut options = FetchOptions::new();
    options.remote_callbacks(callbacks);
    options.proxy_options(proxy);
    options.download_tags(AutotagOption::All);
    options
}

fn fetch_origin(repo: &Repository) -> GitResult<()> {
    let mut remote = repo.find_remote("origin")?;
    remote.fetch(&[] as &[&str], Some(&mut fetch_options()), None)?;
    Ok(())
}

/// Remote branch, then tag, then local branch, then anything rev-parse takes
fn resolve(repo: &Repository, revision: &str) -> GitResult<Oid> {
    let candidates = [
        format!("refs/remotes/origin/{}", revision),
        format!("refs/tags/{}", revision),
        format!("refs/heads/{}", revision),
    ];
    for name in &candidates {
        if let Ok(reference) = repo.find_reference(name) {
            return Ok(reference.peel_to_commit()?.id());
        }
    }

    repo.revparse_single(revision)
        .and_then(|object| object.peel_to_commit())
        .map(|commit| commit.id())
        .map_err(|_| GitError::InvalidReference(revision.to_string()))
}

fn detach_at(repo: &Repository, oid: Oid) -> GitResult<()> {
    repo.set_head_detached(oid)?;
    let mut checkout = CheckoutBuilder::new();
    checkout.force();
    repo.checkout_head(Some(&mut checkout))?;
    Ok(())
}

//! SDK source checkout
//!
//! An SDK build starts from a working copy of the SDK sources at a given
//! revision. [`SdkCheckout`] produces that working copy: it clones when
//! nothing is there yet, switches the revision in place when a working copy
//! already exists, and removes the tree first when a clean start is asked
//! for.

use std::path::PathBuf;

pub mod checkout;

pub use checkout::{CheckoutOutcome, SdkCheckout};

/// Git errors
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown revision '{0}'")]
    InvalidReference(String),

    #[error("{0} exists but is not a git working copy")]
    NotARepository(PathBuf),

    #[error("Git task failed: {0}")]
    Task(String),
}

pub type GitResult<T> = Result<T, GitError>;

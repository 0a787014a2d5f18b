//! Host-to-container mounts

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{ContainerError, ContainerResult};

/// Mount type as understood by `--mount type=...`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    Bind,
    Volume,
    Tmpfs,
}

impl MountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bind => "bind",
            Self::Volume => "volume",
            Self::Tmpfs => "tmpfs",
        }
    }
}

impl fmt::Display for MountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MountKind {
    type Err = ContainerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bind" => Ok(Self::Bind),
            "volume" => Ok(Self::Volume),
            "tmpfs" => Ok(Self::Tmpfs),
            other => Err(ContainerError::InvalidMount {
                mount: other.to_string(),
                reason: "unknown mount type".to_string(),
            }),
        }
    }
}

/// A (source, target, kind) mount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Host path or volume name
    pub source: String,

    /// Absolute path inside the container
    pub target: String,

    #[serde(rename = "type")]
    pub kind: MountKind,
}

impl Mount {
    pub fn new(source: impl Into<String>, target: impl Into<String>, kind: MountKind) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            kind,
        }
    }

    pub fn bind(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(source, target, MountKind::Bind)
    }

    /// Check that the mount is well formed
    pub fn validate(&self) -> ContainerResult<()> {
        let invalid = |reason: &str| ContainerError::InvalidMount {
            mount: self.to_string(),
            reason: reason.to_string(),
        };

        if self.target.is_empty() {
            return Err(invalid("empty target"));
        }
        if !self.target.starts_with('/') {
            return Err(invalid("target must be an absolute path"));
        }
        match self.kind {
            MountKind::Bind if !self.source.starts_with('/') => {
                return Err(invalid("bind source must be an absolute path"));
            }
            MountKind::Volume if self.source.is_empty() => {
                return Err(invalid("volume name is empty"));
            }
            _ => {}
        }
        if [&self.source, &self.target].iter().any(|s| s.contains(',')) {
            return Err(invalid("paths must not contain ','"));
        }
        Ok(())
    }

    /// Value for the `--mount` option
    pub fn to_mount_arg(&self) -> String {
        match self.kind {
            MountKind::Tmpfs => format!("type=tmpfs,target={}", self.target),
            kind => format!("type={},source={},target={}", kind, self.source, self.target),
        }
    }
}

impl fmt::Display for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.source, self.target, self.kind)
    }
}

/// Validate every mount, returning them unchanged on success
pub fn validate_mounts(mounts: Vec<Mount>) -> ContainerResult<Vec<Mount>> {
    for mount in &mounts {
        mount.validate()?;
    }
    Ok(mounts)
}

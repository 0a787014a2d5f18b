//! Environment and mount assembly for scripts and containers

use std::collections::BTreeMap;

use convenient_container::{validate_mounts, ContainerResult, Mount};

use crate::config::BuildKind;

pub type EnvMap = BTreeMap<String, String>;

/// Overlay `layers` in order; later layers win on key collision
pub fn overlay<'a, I>(layers: I) -> EnvMap
where
    I: IntoIterator<Item = &'a EnvMap>,
{
    let mut env = EnvMap::new();
    for layer in layers {
        env.extend(layer.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    env
}

/// The environment this process was started with
pub fn inherited() -> EnvMap {
    std::env::vars().collect()
}

/// Host-side bindings every `dev` container gets
#[derive(Debug, Clone)]
pub struct MandatoryMounts {
    /// SDK source tree on the host
    pub sdk_source: String,
    /// Where the SDK tree appears in the container
    pub sdk_target: String,
    /// Host staging directory
    pub staging_source: String,
    /// Container base directory
    pub staging_target: String,
}

impl MandatoryMounts {
    fn mounts(&self) -> [Mount; 2] {
        [
            Mount::bind(trim(&self.sdk_source), trim(&self.sdk_target)),
            Mount::bind(trim(&self.staging_source), trim(&self.staging_target)),
        ]
    }
}

fn trim(path: &str) -> &str {
    match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}

/// Defaults, then the mandatory bindings, then overrides, validated
///
/// `automated` builds run entirely from the image and get no mounts.
pub fn assemble_mounts(
    kind: BuildKind,
    defaults: &[Mount],
    mandatory: &MandatoryMounts,
    overrides: &[Mount],
) -> ContainerResult<Vec<Mount>> {
    if kind == BuildKind::Automated {
        return Ok(Vec::new());
    }

    let mut mounts = defaults.to_vec();
    mounts.extend(mandatory.mounts());
    mounts.extend_from_slice(overrides);
    validate_mounts(mounts)
}

//! Build metadata reported by the daemon and the stats snapshot.

use serde::Serialize;

/// Package version from Cargo.toml.
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Short commit SHA at build time, or "unknown" outside a git checkout.
pub const GIT_SHA: &str = match option_env!("VERGEN_GIT_SHA") {
    Some(sha) => sha,
    None => "unknown",
};

/// Build timestamp, or "unknown" if vergen could not emit it.
pub const BUILD_TIMESTAMP: &str = match option_env!("VERGEN_BUILD_TIMESTAMP") {
    Some(ts) => ts,
    None => "unknown",
};

/// Build identity embedded in every [`StatsSnapshot`](crate::StatsSnapshot).
#[derive(Debug, Clone, Serialize)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_sha: &'static str,
    pub dirty: bool,
    pub built_at: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: PKG_VERSION,
            git_sha: GIT_SHA,
            dirty: option_env!("VERGEN_GIT_DIRTY") == Some("true"),
            built_at: BUILD_TIMESTAMP,
        }
    }
}

/// `{version}+{sha}` with a `.dirty` suffix for modified trees.
pub fn version_string() -> String {
    let info = BuildInfo::current();
    let dirty = if info.dirty { ".dirty" } else { "" };
    format!("{}+{}{}", info.version, info.git_sha, dirty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_string_starts_with_package_version() {
        assert!(version_string().starts_with(PKG_VERSION));
        assert!(version_string().contains('+'));
    }
}

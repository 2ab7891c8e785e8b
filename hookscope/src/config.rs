use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Recognized agent options. The surrounding deployment machinery owns
/// where these come from; this struct is the interface.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Use mmap tracing to rescan binaries for delay-loaded libraries
    /// like OpenSSL.
    #[serde(default = "default_true")]
    pub rescan_on_dlopen: bool,

    /// Exponential backoff factor applied to a process's rescan period
    /// when a pass finds nothing new.
    #[serde(default = "default_backoff_factor")]
    pub rescan_backoff_factor: f64,

    /// Upper bound on the rescan backoff multiplier, in deploy-pass
    /// iterations. Required: without a ceiling a long-lived quiet
    /// process would effectively never be rescanned.
    pub rescan_backoff_ceiling: u32,

    /// Deploy the Go HTTP2 probe group.
    #[serde(default)]
    pub enable_http2_tracing: bool,

    /// Skip the agent's own pid during deployment.
    #[serde(default = "default_true")]
    pub disable_self_probing: bool,

    /// Budget for resolving a single binary before it is classed a
    /// transient failure and retried later.
    #[serde(default = "default_attach_timeout_ms")]
    pub probe_attach_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_attach_timeout_ms() -> u64 {
    5_000
}

impl AgentConfig {
    /// Defaults with the one required field filled in.
    pub fn with_ceiling(rescan_backoff_ceiling: u32) -> Self {
        Self {
            rescan_on_dlopen: default_true(),
            rescan_backoff_factor: default_backoff_factor(),
            rescan_backoff_ceiling,
            enable_http2_tracing: false,
            disable_self_probing: default_true(),
            probe_attach_timeout_ms: default_attach_timeout_ms(),
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).context("invalid agent configuration")
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading {}", path.as_ref().display()))?;
        Self::from_toml_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied() {
        let cfg = AgentConfig::from_toml_str("rescan_backoff_ceiling = 4096").unwrap();
        assert!(cfg.rescan_on_dlopen);
        assert_eq!(cfg.rescan_backoff_factor, 2.0);
        assert_eq!(cfg.rescan_backoff_ceiling, 4096);
        assert!(!cfg.enable_http2_tracing);
        assert!(cfg.disable_self_probing);
        assert_eq!(cfg.probe_attach_timeout_ms, 5_000);
    }

    #[test]
    fn test_ceiling_is_required() {
        assert!(AgentConfig::from_toml_str("rescan_on_dlopen = false").is_err());
    }

    #[test]
    fn test_overrides() {
        let cfg = AgentConfig::from_toml_str(
            "rescan_backoff_ceiling = 64\n\
             rescan_backoff_factor = 1.5\n\
             enable_http2_tracing = true\n\
             disable_self_probing = false\n",
        )
        .unwrap();
        assert_eq!(cfg.rescan_backoff_factor, 1.5);
        assert!(cfg.enable_http2_tracing);
        assert!(!cfg.disable_self_probing);
    }
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use haltkit_contracts::NameResolver;
use serde::{Deserialize, Serialize};

use crate::pool::{PoolOptions, WorkerPool, DEFAULT_POOL_SIZE, DEFAULT_RESCAN_INTERVAL};
use crate::worker::{WorkerOptions, DEFAULT_HANDSHAKE_TIMEOUT};

pub const ENV_NAME_BACKEND: &str = "HALTKIT_NAME_BACKEND";
pub const ENV_NAME_WORKERS: &str = "HALTKIT_NAME_WORKERS";
pub const ENV_NAME_HELPER_BIN: &str = "HALTKIT_NAME_HELPER_BIN";
pub const ENV_NAME_TIMEOUT_MS: &str = "HALTKIT_NAME_TIMEOUT_MS";

pub const HELPER_BIN_NAME: &str = "haltkit-name-helper";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process, through the deadline-bounded syscall executor.
    Native,
    /// Helper processes behind pipes.
    #[default]
    Pool,
}

impl std::str::FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "native" => Ok(Backend::Native),
            "pool" => Ok(Backend::Pool),
            other => anyhow::bail!("unknown name backend {other:?} (expected native or pool)"),
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Backend::Native => "native",
            Backend::Pool => "pool",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResolverConfig {
    pub backend: Backend,
    pub workers: usize,
    /// Helper program; defaults to the sibling of the current executable.
    pub helper_bin: Option<PathBuf>,
    /// Default per-lookup timeout.
    pub timeout_ms: u64,
    /// Per kernel call on the native path.
    pub native_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub rescan_interval_ms: u64,
    pub name_buffer_ceiling: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            backend: Backend::default(),
            workers: DEFAULT_POOL_SIZE,
            helper_bin: None,
            timeout_ms: haltkit_contracts::DEFAULT_NAME_TIMEOUT.as_millis() as u64,
            native_timeout_ms: haltkit_syscall::DEFAULT_NATIVE_CALL_TIMEOUT.as_millis() as u64,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT.as_millis() as u64,
            rescan_interval_ms: DEFAULT_RESCAN_INTERVAL.as_millis() as u64,
            name_buffer_ceiling: haltkit_syscall::DEFAULT_NAME_BUFFER_CEILING,
        }
    }
}

impl ResolverConfig {
    /// Defaults with the `HALTKIT_NAME_*` overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut cfg = ResolverConfig::default();
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// JSON file, then the environment on top.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let bytes =
            std::fs::read(path).with_context(|| format!("read config: {}", path.display()))?;
        let mut cfg: ResolverConfig = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse config JSON: {}", path.display()))?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(raw) = var(ENV_NAME_BACKEND) {
            self.backend = raw
                .parse()
                .with_context(|| format!("invalid {ENV_NAME_BACKEND}"))?;
        }
        if let Some(raw) = var(ENV_NAME_WORKERS) {
            self.workers = raw
                .trim()
                .parse()
                .with_context(|| format!("invalid {ENV_NAME_WORKERS}={raw:?}"))?;
        }
        if let Some(raw) = var(ENV_NAME_HELPER_BIN) {
            if !raw.trim().is_empty() {
                self.helper_bin = Some(PathBuf::from(raw));
            }
        }
        if let Some(raw) = var(ENV_NAME_TIMEOUT_MS) {
            self.timeout_ms = raw
                .trim()
                .parse()
                .with_context(|| format!("invalid {ENV_NAME_TIMEOUT_MS}={raw:?}"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        for (name, ms) in [
            ("timeout_ms", self.timeout_ms),
            ("native_timeout_ms", self.native_timeout_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("rescan_interval_ms", self.rescan_interval_ms),
        ] {
            if ms == 0 {
                anyhow::bail!("{name} must be positive");
            }
        }
        if self.name_buffer_ceiling < 1024 {
            anyhow::bail!(
                "name_buffer_ceiling must be at least 1024 bytes, got {}",
                self.name_buffer_ceiling
            );
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn helper_path(&self) -> PathBuf {
        match &self.helper_bin {
            Some(path) => path.clone(),
            None => resolve_sibling_or_path(HELPER_BIN_NAME),
        }
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            worker: WorkerOptions {
                handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            },
            rescan_interval: Duration::from_millis(self.rescan_interval_ms),
        }
    }
}

/// Next to the current executable (or its parent when running from a cargo
/// `deps` dir), else the bare name for a `PATH` lookup.
pub fn resolve_sibling_or_path(name: &str) -> PathBuf {
    let file = format!("{name}{}", std::env::consts::EXE_SUFFIX);
    let Ok(exe) = std::env::current_exe() else {
        return PathBuf::from(name);
    };
    let Some(dir) = exe.parent() else {
        return PathBuf::from(name);
    };

    let sibling = dir.join(&file);
    if sibling.is_file() {
        return sibling;
    }
    if dir
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n == "deps")
    {
        if let Some(parent) = dir.parent() {
            let sibling = parent.join(&file);
            if sibling.is_file() {
                return sibling;
            }
        }
    }

    PathBuf::from(name)
}

/// Builds the resolver `config` selects. It is not started.
pub fn build_resolver(config: &ResolverConfig) -> Result<Box<dyn NameResolver>> {
    config.validate()?;
    match config.backend {
        Backend::Pool => Ok(Box::new(WorkerPool::new(
            config.helper_path(),
            config.workers,
            config.pool_options(),
        ))),
        Backend::Native => build_native(config),
    }
}

#[cfg(any(target_os = "linux", all(windows, target_arch = "x86_64")))]
fn build_native(config: &ResolverConfig) -> Result<Box<dyn NameResolver>> {
    Ok(Box::new(
        haltkit_syscall::NativeNameResolver::new()
            .with_call_timeout(Duration::from_millis(config.native_timeout_ms))
            .with_buffer_ceiling(config.name_buffer_ceiling),
    ))
}

#[cfg(not(any(target_os = "linux", all(windows, target_arch = "x86_64"))))]
fn build_native(_config: &ResolverConfig) -> Result<Box<dyn NameResolver>> {
    anyhow::bail!("native name backend is not supported on this platform")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let cfg = ResolverConfig::default();
        assert_eq!(cfg.backend, Backend::Pool);
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.timeout_ms, 100);
        assert_eq!(cfg.native_timeout_ms, 1);
        assert_eq!(cfg.handshake_timeout_ms, 5000);
        assert_eq!(cfg.rescan_interval_ms, 200);
        assert_eq!(cfg.name_buffer_ceiling, 256 * 1024 * 1024);
        cfg.validate().unwrap();
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let mut cfg: ResolverConfig =
            serde_json::from_str(r#"{"backend": "native", "workers": 4}"#).unwrap();
        cfg.apply_overrides(env(&[
            (ENV_NAME_BACKEND, "pool"),
            (ENV_NAME_TIMEOUT_MS, " 250 "),
            (ENV_NAME_HELPER_BIN, "/opt/haltkit/helper"),
        ]))
        .unwrap();
        assert_eq!(cfg.backend, Backend::Pool);
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.timeout(), Duration::from_millis(250));
        assert_eq!(cfg.helper_path(), PathBuf::from("/opt/haltkit/helper"));
    }

    #[test]
    fn bad_env_value_names_the_variable() {
        let mut cfg = ResolverConfig::default();
        let err = cfg
            .apply_overrides(env(&[(ENV_NAME_WORKERS, "many")]))
            .unwrap_err();
        assert!(format!("{err:#}").contains(ENV_NAME_WORKERS), "{err:#}");
    }

    #[test]
    fn unknown_fields_and_zero_values_are_rejected() {
        assert!(serde_json::from_str::<ResolverConfig>(r#"{"threads": 2}"#).is_err());
        let cfg = ResolverConfig {
            workers: 0,
            ..ResolverConfig::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = ResolverConfig {
            timeout_ms: 0,
            ..ResolverConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn json_file_round_trips_through_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("names.json");
        std::fs::write(&path, br#"{"workers": 3, "rescan_interval_ms": 50}"#).unwrap();
        let cfg = ResolverConfig::from_json_file(&path).unwrap();
        assert_eq!(cfg.workers, 3);
        assert_eq!(
            cfg.pool_options().rescan_interval,
            Duration::from_millis(50)
        );
    }

    #[test]
    fn pool_backend_builds_an_unstarted_resolver() {
        let cfg = ResolverConfig {
            helper_bin: Some(PathBuf::from("/nonexistent/helper")),
            ..ResolverConfig::default()
        };
        let resolver = build_resolver(&cfg).unwrap();
        assert!(resolver.start().is_err());
    }
}

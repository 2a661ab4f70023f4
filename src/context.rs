//! Provisioning context threaded through every step.
//!
//! Holds what a step may consult or use: feature flags, the probed machine
//! architecture, the command runner, the host filesystem and the package
//! source registry. Nothing is read from ambient globals once the context
//! has been built.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;

use crate::apt::AptGet;
use crate::cli::LogLevel;
use crate::error::ProvisionError;
use crate::executor::{CommandExecutor, CommandRunner};
use crate::fs::HostFs;
use crate::sources::SourceRegistry;

/// Boolean switches read from environment-style configuration.
///
/// Recognized values are `1` (on) and `0` or empty (off); an unset flag is
/// off. Anything else is a configuration error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureFlags {
    values: BTreeMap<String, bool>,
}

impl FeatureFlags {
    /// Parses a raw flag value.
    pub fn parse_value(name: &str, raw: &str) -> Result<bool, ProvisionError> {
        match raw.trim() {
            "1" => Ok(true),
            "0" | "" => Ok(false),
            other => Err(ProvisionError::Config(format!(
                "feature flag {} has unrecognized value '{}' (expected 1 or 0)",
                name, other
            ))),
        }
    }

    /// Reads the declared flags through `lookup`.
    pub fn from_lookup<F>(names: &[String], lookup: F) -> Result<Self, ProvisionError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut values = BTreeMap::new();
        for name in names {
            let enabled = match lookup(name) {
                Some(raw) => Self::parse_value(name, &raw)?,
                None => false,
            };
            values.insert(name.clone(), enabled);
        }
        Ok(Self { values })
    }

    /// Reads the declared flags from the process environment.
    pub fn from_env(names: &[String]) -> Result<Self, ProvisionError> {
        Self::from_lookup(names, |name| std::env::var(name).ok())
    }

    /// Applies `NAME=VALUE` overrides. Only declared flags may be overridden.
    pub fn apply_overrides(&mut self, overrides: &[String]) -> Result<(), ProvisionError> {
        for item in overrides {
            let Some((name, raw)) = item.split_once('=') else {
                return Err(ProvisionError::Config(format!(
                    "feature override '{}' must have the form NAME=VALUE",
                    item
                )));
            };
            let name = name.trim();
            if !self.values.contains_key(name) {
                return Err(ProvisionError::Config(format!(
                    "feature override names undeclared flag '{}'",
                    name
                )));
            }
            let value = Self::parse_value(name, raw)?;
            self.values.insert(name.to_string(), value);
        }
        Ok(())
    }

    pub fn set(&mut self, name: impl Into<String>, enabled: bool) {
        self.values.insert(name.into(), enabled);
    }

    /// Returns whether the flag is on. Unknown flags are off.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.values.get(name).copied().unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Settings for building a [`ProvisioningContext`].
#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// Image root; `/` when provisioning the running system
    pub root: Utf8PathBuf,
    /// Parent directory for scoped temporary directories
    pub tmp_dir: Utf8PathBuf,
    pub arch: String,
    pub features: FeatureFlags,
    pub log_level: LogLevel,
    pub network_timeout: Option<Duration>,
    pub dry_run: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            root: Utf8PathBuf::from("/"),
            tmp_dir: Utf8PathBuf::from("/tmp"),
            arch: String::new(),
            features: FeatureFlags::default(),
            log_level: LogLevel::Info,
            network_timeout: Some(Duration::from_secs(crate::config::DEFAULT_NETWORK_TIMEOUT_SECS)),
            dry_run: false,
        }
    }
}

/// State shared by all steps of one pipeline run.
pub struct ProvisioningContext {
    pub features: FeatureFlags,
    pub arch: String,
    pub runner: CommandRunner,
    pub fs: HostFs,
    pub tmp_dir: Utf8PathBuf,
    pub log_level: LogLevel,
    pub network_timeout: Option<Duration>,
    pub sources: SourceRegistry,
}

impl ProvisioningContext {
    pub fn new(executor: Arc<dyn CommandExecutor>, options: ContextOptions) -> Self {
        let runner = CommandRunner::new(executor, options.dry_run);
        let fs = HostFs::new(options.root, options.dry_run);
        let apt = AptGet::new(
            runner.clone(),
            options.log_level.quiet_package_manager(),
            options.network_timeout,
        );
        let sources = SourceRegistry::new(
            fs.clone(),
            runner.clone(),
            apt,
            options.tmp_dir.clone(),
            options.network_timeout,
        );
        Self {
            features: options.features,
            arch: options.arch,
            runner,
            fs,
            tmp_dir: options.tmp_dir,
            log_level: options.log_level,
            network_timeout: options.network_timeout,
            sources,
        }
    }

    pub fn dry_run(&self) -> bool {
        self.runner.dry_run()
    }

    /// The package manager shared with the source registry.
    pub fn package_manager(&self) -> &AptGet {
        self.sources.package_manager()
    }
}

//! Profile loading and validation.
//!
//! A profile is a YAML document declaring run defaults, the feature flags
//! the steps may test, and the ordered list of steps.
//!
//! ```yaml
//! defaults:
//!   network_timeout_secs: 600
//! features:
//!   - DOVECOT_COMMUNITY_REPO
//! steps:
//!   - name: refresh
//!     action:
//!       type: update
//! ```

use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::Deserialize;

use crate::error::ProvisionError;
use crate::pipeline::Pipeline;
use crate::step::Step;

/// Timeout applied to network-bound commands unless the profile says otherwise.
pub const DEFAULT_NETWORK_TIMEOUT_SECS: u64 = 600;

/// Profiles compiled into the binary, selectable with `--profile NAME`.
pub const BUILTIN_PROFILES: &[(&str, &str)] =
    &[("mailserver", include_str!("../profiles/mailserver.yaml"))];

static FEATURE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z][A-Z0-9_]*$").expect("feature name regex is valid"));

fn default_root() -> Utf8PathBuf {
    Utf8PathBuf::from("/")
}

fn default_tmp_dir() -> Utf8PathBuf {
    Utf8PathBuf::from("/tmp")
}

fn default_network_timeout_secs() -> u64 {
    DEFAULT_NETWORK_TIMEOUT_SECS
}

/// Run defaults; CLI options take precedence.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    /// Image root every step path is resolved under
    #[serde(default = "default_root")]
    pub root: Utf8PathBuf,
    /// Host directory for scoped temporary directories
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: Utf8PathBuf,
    /// Architecture override; probed with `uname` when unset
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(default = "default_network_timeout_secs")]
    pub network_timeout_secs: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            root: default_root(),
            tmp_dir: default_tmp_dir(),
            architecture: None,
            network_timeout_secs: DEFAULT_NETWORK_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    #[serde(default)]
    pub defaults: Defaults,
    /// Feature flag names read from the environment
    #[serde(default)]
    pub features: Vec<String>,
    pub steps: Vec<Step>,
}

impl Profile {
    pub fn pipeline(&self) -> Pipeline<'_> {
        Pipeline::new(&self.steps)
    }

    /// Checks the whole profile before any side effect takes place.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        if !self.defaults.root.is_absolute() {
            return Err(ProvisionError::Validation(format!(
                "defaults.root must be absolute: {}",
                self.defaults.root
            )));
        }
        if !self.defaults.tmp_dir.is_absolute() {
            return Err(ProvisionError::Validation(format!(
                "defaults.tmp_dir must be absolute: {}",
                self.defaults.tmp_dir
            )));
        }
        if self.defaults.network_timeout_secs == 0 {
            return Err(ProvisionError::Validation(
                "defaults.network_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.defaults.architecture.as_deref().is_some_and(|a| a.trim().is_empty()) {
            return Err(ProvisionError::Validation(
                "defaults.architecture must not be empty".to_string(),
            ));
        }

        let mut declared = HashSet::new();
        for name in &self.features {
            if !FEATURE_NAME.is_match(name) {
                return Err(ProvisionError::Validation(format!(
                    "invalid feature flag name '{}'",
                    name
                )));
            }
            if !declared.insert(name.as_str()) {
                return Err(ProvisionError::Validation(format!(
                    "feature flag '{}' is declared more than once",
                    name
                )));
            }
        }
        for step in &self.steps {
            if let Some(undeclared) = step.when.features().find(|f| !declared.contains(f)) {
                return Err(ProvisionError::Validation(format!(
                    "step '{}' refers to undeclared feature flag '{}'",
                    step.name, undeclared
                )));
            }
        }

        self.pipeline().validate()
    }
}

/// Parses a profile from YAML text.
pub fn parse_profile(yaml: &str) -> Result<Profile, ProvisionError> {
    serde_yaml::from_str(yaml)
        .map_err(|e| ProvisionError::Config(format!("failed to parse profile: {}", e)))
}

/// Loads a profile from a YAML file.
pub fn load_profile(path: &Utf8Path) -> Result<Profile> {
    let file = File::open(path)
        .map_err(|e| ProvisionError::io(format!("failed to open profile: {}", path), e))?;
    let reader = BufReader::new(file);
    let profile: Profile = serde_yaml::from_reader(reader)
        .map_err(|e| ProvisionError::Config(format!("failed to parse profile: {}", e)))
        .with_context(|| format!("failed to load profile: {}", path))?;
    Ok(profile)
}

/// Returns a profile compiled into the binary.
pub fn builtin_profile(name: &str) -> Result<Profile> {
    let (_, yaml) = BUILTIN_PROFILES
        .iter()
        .find(|(builtin, _)| *builtin == name)
        .ok_or_else(|| {
            let known: Vec<_> = BUILTIN_PROFILES.iter().map(|(n, _)| *n).collect();
            ProvisionError::Config(format!(
                "unknown built-in profile '{}' (available: {})",
                name,
                known.join(", ")
            ))
        })?;
    parse_profile(yaml).with_context(|| format!("failed to load built-in profile '{}'", name))
}

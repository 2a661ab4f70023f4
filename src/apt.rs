//! Package manager interface and its `apt-get`/`dpkg` implementation.

use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use camino::Utf8Path;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::ProvisionError;
use crate::executor::{CommandRunner, CommandSpec};

/// Debian package name, optionally qualified with an architecture.
static PACKAGE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9+.\-]+(:[a-z0-9\-]+)?$").expect("package name regex is valid")
});

/// Options for a package installation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallOptions {
    /// Install recommended packages as well (default: no)
    #[serde(default)]
    pub recommends: bool,
    /// Pin the installation to a release (`apt-get -t <release>`)
    #[serde(default)]
    pub target_release: Option<String>,
}

/// A named group of packages installed together.
///
/// The order of packages carries no meaning; the package manager resolves
/// dependencies within the set.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageSet {
    pub name: String,
    pub packages: Vec<String>,
}

impl PackageSet {
    pub fn new(name: impl Into<String>, packages: &[&str]) -> Self {
        Self {
            name: name.into(),
            packages: packages.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Checks that the set is non-empty and its identifiers are valid and unique.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        if self.packages.is_empty() {
            return Err(ProvisionError::Validation(format!(
                "package set '{}' must not be empty",
                self.name
            )));
        }
        validate_package_names(&self.packages, &format!("package set '{}'", self.name))
    }
}

/// Checks that every package identifier is well-formed and appears once.
pub(crate) fn validate_package_names(
    packages: &[String],
    label: &str,
) -> Result<(), ProvisionError> {
    let mut seen = HashSet::new();
    for package in packages {
        if !PACKAGE_NAME.is_match(package) {
            return Err(ProvisionError::Validation(format!(
                "{} contains an invalid package name: '{}'",
                label, package
            )));
        }
        if !seen.insert(package.as_str()) {
            return Err(ProvisionError::Validation(format!(
                "{} lists package '{}' more than once",
                label, package
            )));
        }
    }
    Ok(())
}

/// Package manager operations used by provisioning steps.
///
/// Every operation is synchronous and fails with a command-failure error
/// when the underlying tool exits non-zero.
pub trait PackageManager {
    fn update(&self) -> Result<()>;
    fn install(&self, packages: &[String], options: &InstallOptions) -> Result<()>;
    fn upgrade(&self) -> Result<()>;
    fn purge(&self, packages: &[String]) -> Result<()>;
    fn autoremove(&self) -> Result<()>;
    fn clean(&self) -> Result<()>;
    /// Installs a package file that is already on disk.
    fn install_local(&self, deb: &Utf8Path) -> Result<()>;
}

/// `apt-get` driven through a [`CommandRunner`].
#[derive(Clone)]
pub struct AptGet {
    runner: CommandRunner,
    quiet: bool,
    network_timeout: Option<Duration>,
}

impl AptGet {
    /// Creates the package manager.
    ///
    /// `quiet` adds `-qq` to every invocation; `network_timeout` bounds the
    /// operations that download (update, install, upgrade).
    pub fn new(runner: CommandRunner, quiet: bool, network_timeout: Option<Duration>) -> Self {
        Self {
            runner,
            quiet,
            network_timeout,
        }
    }

    fn apt_spec(&self, subcommand: &str, extra: Vec<String>, networked: bool) -> CommandSpec {
        let mut args = Vec::with_capacity(extra.len() + 3);
        if self.quiet {
            args.push("-qq".to_string());
        }
        args.push("--yes".to_string());
        args.push(subcommand.to_string());
        args.extend(extra);
        let timeout = if networked { self.network_timeout } else { None };
        CommandSpec::new("apt-get", args)
            .with_env("DEBIAN_FRONTEND", "noninteractive")
            .with_timeout(timeout)
    }

    fn run_apt(&self, subcommand: &str, extra: Vec<String>, networked: bool) -> Result<()> {
        let spec = self.apt_spec(subcommand, extra, networked);
        self.runner
            .run(&spec)
            .with_context(|| format!("apt-get {} failed", subcommand))?;
        Ok(())
    }
}

impl PackageManager for AptGet {
    fn update(&self) -> Result<()> {
        info!("refreshing package index");
        self.run_apt("update", Vec::new(), true)
    }

    fn install(&self, packages: &[String], options: &InstallOptions) -> Result<()> {
        if packages.is_empty() {
            debug!("no packages to install");
            return Ok(());
        }
        info!("installing {} package(s): {}", packages.len(), packages.join(" "));
        let mut extra = Vec::new();
        if !options.recommends {
            extra.push("--no-install-recommends".to_string());
        }
        if let Some(release) = &options.target_release {
            extra.push("-t".to_string());
            extra.push(release.clone());
        }
        extra.extend(packages.iter().cloned());
        self.run_apt("install", extra, true)
    }

    fn upgrade(&self) -> Result<()> {
        info!("upgrading installed packages");
        self.run_apt("upgrade", Vec::new(), true)
    }

    fn purge(&self, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        info!("purging {}", packages.join(" "));
        self.run_apt("purge", packages.to_vec(), false)
    }

    fn autoremove(&self) -> Result<()> {
        self.run_apt("autoremove", Vec::new(), false)
    }

    fn clean(&self) -> Result<()> {
        self.run_apt("clean", Vec::new(), false)
    }

    fn install_local(&self, deb: &Utf8Path) -> Result<()> {
        info!("installing local package {}", deb);
        let spec = CommandSpec::new("dpkg", vec!["-i".to_string(), deb.to_string()])
            .with_env("DEBIAN_FRONTEND", "noninteractive");
        self.runner
            .run(&spec)
            .with_context(|| format!("failed to install {}", deb))?;
        Ok(())
    }
}

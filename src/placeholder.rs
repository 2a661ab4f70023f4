//! Placeholder package building.
//!
//! Some packages depend on a virtual package that is only provided by a
//! specific build of another package. When that provider is swapped for a
//! different build (e.g. Dovecot from the community repository), an empty
//! package with the expected name satisfies the dependency.
//!
//! [`PlaceholderPackageBuilder`] builds and installs such a package with
//! `checkinstall`. The build tool is a build-only dependency: it is
//! installed, used and purged again within one call.

use std::time::Duration;

use anyhow::{Context, Result};
use camino::Utf8Path;
use serde::Deserialize;
use tracing::{error, info};

use crate::apt::{InstallOptions, PackageManager, validate_package_names};
use crate::error::ProvisionError;
use crate::executor::{CommandRunner, CommandSpec};
use crate::fs::ScopedTempDir;

/// Makefile whose `install` target does nothing, so checkinstall records
/// a package without files.
const NOOP_MAKEFILE: &str = "install:\n\t@true\n";

/// Description of the placeholder package.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlaceholderPackage {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub description: String,
    #[serde(default = "default_maintainer")]
    pub maintainer: String,
    #[serde(default = "default_group")]
    pub group: String,
    /// Package providing the build tool
    #[serde(default = "default_tool")]
    pub tool: String,
}

fn default_version() -> String {
    "1".to_string()
}

fn default_maintainer() -> String {
    "Nobody".to_string()
}

fn default_group() -> String {
    "mail".to_string()
}

fn default_tool() -> String {
    "checkinstall".to_string()
}

impl PlaceholderPackage {
    pub fn validate(&self) -> Result<(), ProvisionError> {
        validate_package_names(
            &[self.name.clone(), self.tool.clone()],
            &format!("placeholder package '{}'", self.name),
        )?;
        if self.description.trim().is_empty() {
            return Err(ProvisionError::Validation(format!(
                "placeholder package '{}' needs a description",
                self.name
            )));
        }
        if self.version.trim().is_empty() {
            return Err(ProvisionError::Validation(format!(
                "placeholder package '{}' needs a version",
                self.name
            )));
        }
        Ok(())
    }
}

/// Builds, installs and cleans up after a [`PlaceholderPackage`].
pub struct PlaceholderPackageBuilder<'a> {
    package: &'a PlaceholderPackage,
    runner: &'a CommandRunner,
    packages: &'a dyn PackageManager,
    tmp_dir: &'a Utf8Path,
    timeout: Option<Duration>,
}

impl<'a> PlaceholderPackageBuilder<'a> {
    pub fn new(
        package: &'a PlaceholderPackage,
        runner: &'a CommandRunner,
        packages: &'a dyn PackageManager,
        tmp_dir: &'a Utf8Path,
    ) -> Self {
        Self {
            package,
            runner,
            packages,
            tmp_dir,
            timeout: None,
        }
    }

    /// Bounds the build command's run time.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs the full lifecycle: install tool, build and install the
    /// placeholder, purge the tool.
    ///
    /// The tool is purged even when the build fails; the build error is
    /// returned in that case.
    pub fn provision(&self) -> Result<()> {
        self.install_tool()?;
        let build_result = self.build_and_install();
        let uninstall_result = self.uninstall_tool();

        match (build_result, uninstall_result) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) => Err(e),
            (Ok(()), Err(e)) => {
                Err(e).with_context(|| format!("failed to uninstall {}", self.package.tool))
            }
            (Err(build_err), Err(uninstall_err)) => {
                error!("uninstalling {} also failed: {:#}", self.package.tool, uninstall_err);
                Err(build_err)
            }
        }
    }

    fn install_tool(&self) -> Result<()> {
        info!("installing build tool {}", self.package.tool);
        self.packages
            .install(&[self.package.tool.clone()], &InstallOptions::default())
            .with_context(|| format!("failed to install build tool {}", self.package.tool))
    }

    /// Builds the placeholder in a scratch directory and installs it.
    pub fn build_and_install(&self) -> Result<()> {
        let pkg = self.package;
        info!("building placeholder package {} {}", pkg.name, pkg.version);

        let scratch =
            ScopedTempDir::create(self.tmp_dir, "rsprovision-placeholder", self.runner.dry_run())?;
        scratch.write("Makefile", NOOP_MAKEFILE)?;
        scratch.write("description-pak", &format!("{}\n", pkg.description))?;

        let spec = CommandSpec::new(
            "checkinstall",
            vec![
                "-y".to_string(),
                "--install=yes".to_string(),
                "--fstrans=no".to_string(),
                format!("--pkgname={}", pkg.name),
                format!("--pkgversion={}", pkg.version),
                format!("--maintainer={}", pkg.maintainer),
                format!("--pkggroup={}", pkg.group),
            ],
        )
        .with_cwd(scratch.path().to_owned())
        .with_timeout(self.timeout);

        self.runner
            .run(&spec)
            .with_context(|| format!("failed to build placeholder package {}", pkg.name))?;
        Ok(())
    }

    fn uninstall_tool(&self) -> Result<()> {
        info!("removing build tool {}", self.package.tool);
        self.packages.purge(&[self.package.tool.clone()])?;
        self.packages.autoremove()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package() -> PlaceholderPackage {
        PlaceholderPackage {
            name: "dovecot-abi-2.3.abiv13".to_string(),
            version: default_version(),
            description: "Dummy package to satisfy dovecot-fts-xapian dependency".to_string(),
            maintainer: default_maintainer(),
            group: default_group(),
            tool: default_tool(),
        }
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(package().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_description() {
        let mut pkg = package();
        pkg.description = "  ".to_string();
        assert!(pkg.validate().unwrap_err().to_string().contains("needs a description"));
    }

    #[test]
    fn validate_rejects_tool_equal_to_package() {
        let mut pkg = package();
        pkg.tool = pkg.name.clone();
        assert!(pkg.validate().is_err());
    }
}

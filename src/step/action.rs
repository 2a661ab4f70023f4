//! Step actions.
//!
//! `StepAction` is a data-driven enum: each variant describes *what* a step
//! does, and [`StepAction::execute`] provides *how* through exhaustive
//! matching. Adding an action means adding a variant and its arms in
//! `validate` and `execute`.

use std::collections::HashSet;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::Deserialize;
use strum::IntoStaticStr;
use tracing::{error, info, warn};

use crate::apt::{InstallOptions, PackageManager, PackageSet, validate_package_names};
use crate::artifact::{ArtifactInstaller, SignedArtifact};
use crate::context::ProvisioningContext;
use crate::error::ProvisionError;
use crate::executor::CommandSpec;
use crate::fs::ScopedTempDir;
use crate::placeholder::{PlaceholderPackage, PlaceholderPackageBuilder};
use crate::sources::{PackageSourceEntry, select_for_architecture};

/// Binary replaced by [`StepAction::HostnameShim`] while packages install.
pub const HOSTNAME_BIN: &str = "/bin/hostname";
const HOSTNAME_BACKUP: &str = "/bin/hostname.bak";

static HOSTNAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9.\-]*$").expect("hostname regex is valid"));

fn default_caddy_dir() -> Utf8PathBuf {
    Utf8PathBuf::from("/etc/caddy")
}

/// What a step did when it ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    /// The step ran but is knowingly not a finished implementation.
    Incomplete(String),
}

/// The side-effecting part of a step.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, IntoStaticStr)]
#[serde(tag = "type", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StepAction {
    /// Refresh the package index
    Update,
    /// Upgrade installed packages
    Upgrade,
    /// Install one or more package sets in a single transaction
    Packages {
        sets: Vec<PackageSet>,
        #[serde(default)]
        options: InstallOptions,
    },
    /// Register a package source and install packages from it
    Source {
        entry: PackageSourceEntry,
        #[serde(default)]
        packages: Vec<String>,
        #[serde(default)]
        options: InstallOptions,
    },
    /// Register the one source matching the machine architecture and
    /// install packages from it
    ArchSource {
        candidates: Vec<PackageSourceEntry>,
        #[serde(default)]
        packages: Vec<String>,
        #[serde(default)]
        options: InstallOptions,
    },
    /// Download, verify and install a signed package file
    SignedArtifact { artifact: SignedArtifact },
    /// Build and install an empty package satisfying a dependency
    Placeholder { package: PlaceholderPackage },
    Purge { packages: Vec<String> },
    /// Preseed debconf answers (`debconf-set-selections` lines)
    Debconf { selections: Vec<String> },
    Autoremove,
    Clean,
    WriteFile {
        path: Utf8PathBuf,
        content: String,
        #[serde(default)]
        executable: bool,
    },
    /// Delete a file; fails if it does not exist
    RemoveFile { path: Utf8PathBuf },
    /// Delete a directory tree; a missing tree is fine
    RemoveTree { path: Utf8PathBuf },
    MoveFile { from: Utf8PathBuf, to: Utf8PathBuf },
    CreateDir { path: Utf8PathBuf },
    /// Run an arbitrary command
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        /// Apply the network timeout to this command
        #[serde(default)]
        network: bool,
    },
    /// Web server setup placeholder; only creates the config directory
    CaddyStub {
        #[serde(default = "default_caddy_dir")]
        config_dir: Utf8PathBuf,
    },
    /// Install packages whose maintainer scripts need `hostname` to print
    /// a fully qualified name
    HostnameShim {
        hostname: String,
        packages: Vec<String>,
        #[serde(default)]
        options: InstallOptions,
    },
}

fn validate_absolute(path: &Utf8Path, label: &str) -> Result<(), ProvisionError> {
    if !path.is_absolute() {
        return Err(ProvisionError::Validation(format!("{} must be absolute: {}", label, path)));
    }
    if path.components().any(|c| c == camino::Utf8Component::ParentDir) {
        return Err(ProvisionError::Validation(format!(
            "{} '{}' contains '..' components",
            label, path
        )));
    }
    Ok(())
}

impl StepAction {
    /// Returns the action type as written in profiles (e.g. `signed_artifact`).
    pub fn kind(&self) -> &'static str {
        self.into()
    }

    pub fn validate(&self) -> Result<(), ProvisionError> {
        match self {
            Self::Update | Self::Upgrade | Self::Autoremove | Self::Clean => Ok(()),
            Self::Packages { sets, .. } => {
                if sets.is_empty() {
                    return Err(ProvisionError::Validation(
                        "packages action needs at least one package set".to_string(),
                    ));
                }
                sets.iter().try_for_each(PackageSet::validate)
            }
            Self::Source { entry, packages, .. } => {
                entry.validate()?;
                validate_package_names(packages, &format!("source '{}'", entry.name))
            }
            Self::ArchSource {
                candidates,
                packages,
                ..
            } => {
                if candidates.is_empty() {
                    return Err(ProvisionError::Validation(
                        "arch_source action needs at least one candidate".to_string(),
                    ));
                }
                candidates.iter().try_for_each(PackageSourceEntry::validate)?;
                if candidates.iter().filter(|c| c.applies_to.is_none()).count() > 1 {
                    return Err(ProvisionError::Validation(
                        "arch_source action has more than one catch-all candidate".to_string(),
                    ));
                }
                let mut archs = HashSet::new();
                for arch in candidates.iter().filter_map(|c| c.applies_to.as_deref()) {
                    if !archs.insert(arch) {
                        return Err(ProvisionError::Validation(format!(
                            "arch_source action has more than one candidate for '{}'",
                            arch
                        )));
                    }
                }
                validate_package_names(packages, "arch_source action")
            }
            Self::SignedArtifact { artifact } => artifact.validate(),
            Self::Placeholder { package } => package.validate(),
            Self::Purge { packages } => {
                if packages.is_empty() {
                    return Err(ProvisionError::Validation(
                        "purge action needs at least one package".to_string(),
                    ));
                }
                validate_package_names(packages, "purge action")
            }
            Self::Debconf { selections } => {
                if selections.is_empty() {
                    return Err(ProvisionError::Validation(
                        "debconf action needs at least one selection".to_string(),
                    ));
                }
                let malformed = selections
                    .iter()
                    .find(|s| s.split_whitespace().count() < 3 || s.contains('\n'));
                match malformed {
                    Some(bad) => Err(ProvisionError::Validation(format!(
                        "malformed debconf selection: '{}'",
                        bad
                    ))),
                    None => Ok(()),
                }
            }
            Self::WriteFile { path, .. } => validate_absolute(path, "write_file path"),
            Self::RemoveFile { path } => validate_absolute(path, "remove_file path"),
            Self::RemoveTree { path } => {
                validate_absolute(path, "remove_tree path")?;
                if path.as_str() == "/" {
                    return Err(ProvisionError::Validation(
                        "remove_tree refuses to remove the image root".to_string(),
                    ));
                }
                Ok(())
            }
            Self::MoveFile { from, to } => {
                validate_absolute(from, "move_file source")?;
                validate_absolute(to, "move_file destination")
            }
            Self::CreateDir { path } => validate_absolute(path, "create_dir path"),
            Self::Command { program, .. } => {
                if program.trim().is_empty() {
                    return Err(ProvisionError::Validation(
                        "command program must not be empty".to_string(),
                    ));
                }
                Ok(())
            }
            Self::CaddyStub { config_dir } => validate_absolute(config_dir, "caddy config_dir"),
            Self::HostnameShim {
                hostname, packages, ..
            } => {
                if !HOSTNAME.is_match(hostname) {
                    return Err(ProvisionError::Validation(format!(
                        "invalid hostname for hostname shim: '{}'",
                        hostname
                    )));
                }
                if packages.is_empty() {
                    return Err(ProvisionError::Validation(
                        "hostname_shim action needs at least one package".to_string(),
                    ));
                }
                validate_package_names(packages, "hostname_shim action")
            }
        }
    }

    pub fn execute(&self, ctx: &mut ProvisioningContext) -> Result<StepOutcome> {
        match self {
            Self::Update => ctx.sources.refresh_index()?,
            Self::Upgrade => ctx.package_manager().upgrade()?,
            Self::Packages { sets, options } => {
                let mut seen = HashSet::new();
                let mut packages = Vec::new();
                for set in sets {
                    info!("package set '{}': {} package(s)", set.name, set.packages.len());
                    packages
                        .extend(set.packages.iter().filter(|p| seen.insert(p.as_str())).cloned());
                }
                ctx.sources.install(&packages, options)?;
            }
            Self::Source {
                entry,
                packages,
                options,
            } => {
                ctx.sources.register(entry)?;
                ctx.sources.install(packages, &entry.install_options(options))?;
            }
            Self::ArchSource {
                candidates,
                packages,
                options,
            } => {
                let entry = select_for_architecture(candidates, &ctx.arch)?;
                info!("architecture '{}' selects package source '{}'", ctx.arch, entry.name);
                ctx.sources.register(entry)?;
                ctx.sources.install(packages, &entry.install_options(options))?;
            }
            Self::SignedArtifact { artifact } => {
                ArtifactInstaller::new(
                    &ctx.runner,
                    ctx.sources.package_manager(),
                    &ctx.fs,
                    &ctx.tmp_dir,
                    ctx.network_timeout,
                )
                .install(artifact)?;
            }
            Self::Placeholder { package } => {
                PlaceholderPackageBuilder::new(
                    package,
                    &ctx.runner,
                    ctx.sources.package_manager(),
                    &ctx.tmp_dir,
                )
                .with_timeout(ctx.network_timeout)
                .provision()?;
            }
            Self::Purge { packages } => ctx.package_manager().purge(packages)?,
            Self::Debconf { selections } => {
                let scratch =
                    ScopedTempDir::create(&ctx.tmp_dir, "rsprovision-debconf", ctx.dry_run())?;
                let file = scratch.write("selections", &format!("{}\n", selections.join("\n")))?;
                ctx.runner
                    .run(&CommandSpec::new("debconf-set-selections", vec![file.to_string()]))?;
            }
            Self::Autoremove => ctx.package_manager().autoremove()?,
            Self::Clean => ctx.package_manager().clean()?,
            Self::WriteFile {
                path,
                content,
                executable,
            } => {
                let mode = if *executable { 0o755 } else { 0o644 };
                ctx.fs.write_file(path, content, Some(mode))?;
            }
            Self::RemoveFile { path } => ctx.fs.remove_file(path)?,
            Self::RemoveTree { path } => ctx.fs.remove_tree(path)?,
            Self::MoveFile { from, to } => ctx.fs.rename(from, to)?,
            Self::CreateDir { path } => ctx.fs.create_dir(path)?,
            Self::Command {
                program,
                args,
                network,
            } => {
                let timeout = if *network { ctx.network_timeout } else { None };
                let spec = CommandSpec::new(program.clone(), args.clone()).with_timeout(timeout);
                ctx.runner.run(&spec)?;
            }
            Self::CaddyStub { config_dir } => {
                ctx.fs.create_dir(config_dir)?;
                warn!("caddy setup is not implemented yet; only {} was created", config_dir);
                return Ok(StepOutcome::Incomplete(
                    "caddy setup is not implemented yet".to_string(),
                ));
            }
            Self::HostnameShim {
                hostname,
                packages,
                options,
            } => install_with_hostname_shim(ctx, hostname, packages, options)?,
        }
        Ok(StepOutcome::Completed)
    }
}

/// Temporarily replaces `/bin/hostname` with a script printing `hostname`,
/// installs `packages` and restores the original binary on every exit path.
fn install_with_hostname_shim(
    ctx: &mut ProvisioningContext,
    hostname: &str,
    packages: &[String],
    options: &InstallOptions,
) -> Result<()> {
    let bin = Utf8Path::new(HOSTNAME_BIN);
    let backup = Utf8Path::new(HOSTNAME_BACKUP);

    warn!("replacing {} with a shim reporting '{}' while installing", HOSTNAME_BIN, hostname);
    ctx.fs.rename(bin, backup)?;

    let script = format!("#!/bin/sh\necho '{}'\n", hostname);
    let install_result = ctx
        .fs
        .write_file(bin, &script, Some(0o755))
        .map_err(anyhow::Error::from)
        .and_then(|()| ctx.sources.install(packages, options));
    let restore_result = ctx
        .fs
        .rename(backup, bin)
        .with_context(|| format!("failed to restore {}", HOSTNAME_BIN));

    match (install_result, restore_result) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(e), Ok(())) => Err(e),
        (Ok(()), Err(e)) => Err(e),
        (Err(install_err), Err(restore_err)) => {
            error!("{:#}", restore_err);
            Err(install_err)
        }
    }
}

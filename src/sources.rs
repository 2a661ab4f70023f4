//! Package source registry.
//!
//! Registers external APT repositories (signing key plus `.list`
//! descriptor) and keeps track of whether the package index must be
//! refreshed before the next installation.
//!
//! Registered sources are never removed again, including those only
//! needed for a single installation.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info};

use crate::apt::{AptGet, InstallOptions, PackageManager};
use crate::error::ProvisionError;
use crate::executor::CommandRunner;
use crate::fetch::{download, parse_download_url};
use crate::fs::{HostFs, ScopedTempDir};
use crate::verify::{GpgVerifier, SignatureVerifier};

/// Directory holding the `.list` descriptors.
pub const SOURCES_LIST_DIR: &str = "/etc/apt/sources.list.d";
/// Directory holding the repository signing keys.
pub const TRUSTED_KEYS_DIR: &str = "/etc/apt/trusted.gpg.d";

static SOURCE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._\-]*$").expect("source name regex is valid")
});

/// How a repository's signing key is obtained.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SigningKey {
    /// Download the key file; ASCII-armored keys are dearmored first.
    Url {
        url: String,
        #[serde(default = "default_dearmor")]
        dearmor: bool,
    },
    /// Import the key by ID from a key server and export it.
    Keyserver { key_id: String, keyserver: String },
}

fn default_dearmor() -> bool {
    true
}

/// Repository location and the options of its `.list` line.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceDescriptor {
    pub uri: String,
    pub suite: String,
    pub components: Vec<String>,
    /// Restrict the repository to these Debian architectures (e.g. `arm64`)
    #[serde(default)]
    pub architectures: Vec<String>,
    /// Also emit a `deb-src` line
    #[serde(default)]
    pub deb_src: bool,
}

impl SourceDescriptor {
    /// Renders the `.list` file content for this descriptor.
    ///
    /// `signed_by` is the key path as seen from inside the image.
    pub fn render(&self, signed_by: &Utf8Path) -> String {
        let mut options = Vec::new();
        if !self.architectures.is_empty() {
            options.push(format!("arch={}", self.architectures.join(",")));
        }
        options.push(format!("signed-by={}", signed_by));
        let body = format!(
            "[{}] {} {} {}",
            options.join(" "),
            self.uri,
            self.suite,
            self.components.join(" ")
        );
        let mut content = format!("deb {}\n", body);
        if self.deb_src {
            content.push_str(&format!("deb-src {}\n", body));
        }
        content
    }
}

/// An external repository registration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageSourceEntry {
    /// File stem of the descriptor and key files
    pub name: String,
    pub signing_key: SigningKey,
    pub descriptor: SourceDescriptor,
    /// Machine architecture this entry applies to; absent means any
    #[serde(default)]
    pub applies_to: Option<String>,
    /// Release to pin installations from this source to (`-t`)
    #[serde(default)]
    pub install_release: Option<String>,
}

impl PackageSourceEntry {
    /// Path of the `.list` descriptor inside the image.
    pub fn list_path(&self) -> Utf8PathBuf {
        Utf8Path::new(SOURCES_LIST_DIR).join(format!("{}.list", self.name))
    }

    /// Path of the signing key inside the image.
    pub fn key_path(&self) -> Utf8PathBuf {
        Utf8Path::new(TRUSTED_KEYS_DIR).join(format!("{}.gpg", self.name))
    }

    pub fn render(&self) -> String {
        self.descriptor.render(&self.key_path())
    }

    /// Install options for packages taken from this source.
    pub fn install_options(&self, base: &InstallOptions) -> InstallOptions {
        let mut options = base.clone();
        if options.target_release.is_none() {
            options.target_release = self.install_release.clone();
        }
        options
    }

    /// Checks the entry for malformed fields.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        let malformed =
            |msg: String| ProvisionError::Registration(format!("source '{}': {}", self.name, msg));

        if !SOURCE_NAME.is_match(&self.name) {
            return Err(ProvisionError::Registration(format!(
                "invalid source name '{}': only letters, digits, '.', '_' and '-' are allowed",
                self.name
            )));
        }
        parse_download_url(&self.descriptor.uri, "repository URI")
            .map_err(|e| malformed(e.to_string()))?;
        if self.descriptor.suite.trim().is_empty() {
            return Err(malformed("suite must not be empty".to_string()));
        }
        if self.descriptor.components.is_empty() {
            return Err(malformed("at least one component is required".to_string()));
        }
        if self.descriptor.components.iter().any(|c| c.trim().is_empty() || c.contains(' ')) {
            return Err(malformed("components must be single non-empty words".to_string()));
        }
        match &self.signing_key {
            SigningKey::Url { url, .. } => {
                parse_download_url(url, "signing key URL").map_err(|e| malformed(e.to_string()))?;
            }
            SigningKey::Keyserver { key_id, keyserver } => {
                if key_id.trim().is_empty() || keyserver.trim().is_empty() {
                    return Err(malformed("key_id and keyserver must not be empty".to_string()));
                }
            }
        }
        if matches!(&self.applies_to, Some(arch) if arch.trim().is_empty()) {
            return Err(malformed("applies_to must not be empty when set".to_string()));
        }
        Ok(())
    }
}

/// Outcome of [`SourceRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Key and descriptor were written.
    Registered,
    /// The identical descriptor was already in place; nothing was written.
    AlreadyRegistered,
}

/// Picks the one entry that applies to `arch`.
///
/// An entry whose `applies_to` equals `arch` wins over the catch-all entry
/// (no `applies_to`). Ambiguity or no match is a registration error, so
/// exactly one branch is ever registered.
pub fn select_for_architecture<'a>(
    candidates: &'a [PackageSourceEntry],
    arch: &str,
) -> Result<&'a PackageSourceEntry, ProvisionError> {
    let specific: Vec<_> = candidates
        .iter()
        .filter(|c| c.applies_to.as_deref() == Some(arch))
        .collect();
    let fallback: Vec<_> = candidates.iter().filter(|c| c.applies_to.is_none()).collect();

    match (specific.as_slice(), fallback.as_slice()) {
        ([one], _) => Ok(one),
        ([], [one]) => Ok(one),
        ([], []) => Err(ProvisionError::Registration(format!(
            "no package source applies to architecture '{}'",
            arch
        ))),
        ([], _) => Err(ProvisionError::Registration(format!(
            "more than one catch-all package source for architecture '{}'",
            arch
        ))),
        _ => Err(ProvisionError::Registration(format!(
            "more than one package source applies to architecture '{}'",
            arch
        ))),
    }
}

/// Registers package sources and installs packages from them.
pub struct SourceRegistry {
    fs: HostFs,
    runner: CommandRunner,
    apt: AptGet,
    tmp_dir: Utf8PathBuf,
    network_timeout: Option<Duration>,
    registered: BTreeMap<String, String>,
    refresh_pending: bool,
}

impl SourceRegistry {
    pub fn new(
        fs: HostFs,
        runner: CommandRunner,
        apt: AptGet,
        tmp_dir: Utf8PathBuf,
        network_timeout: Option<Duration>,
    ) -> Self {
        Self {
            fs,
            runner,
            apt,
            tmp_dir,
            network_timeout,
            registered: BTreeMap::new(),
            refresh_pending: false,
        }
    }

    /// Returns true if a source was registered since the last index refresh.
    pub fn refresh_pending(&self) -> bool {
        self.refresh_pending
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.registered.contains_key(name)
    }

    /// Names of the sources registered during this run, in name order.
    pub fn registered_names(&self) -> impl Iterator<Item = &str> {
        self.registered.keys().map(String::as_str)
    }

    /// Registers a source: signing key first, then the descriptor.
    ///
    /// Registering an identical descriptor again is a no-op. A different
    /// descriptor under an existing name is a conflict.
    #[tracing::instrument(skip_all, fields(source = %entry.name))]
    pub fn register(&mut self, entry: &PackageSourceEntry) -> Result<Registration> {
        entry.validate()?;
        let rendered = entry.render();

        if let Some(existing) = self.existing_descriptor(entry)? {
            if existing == rendered {
                debug!("source '{}' is already registered", entry.name);
                return Ok(Registration::AlreadyRegistered);
            }
            return Err(ProvisionError::Registration(format!(
                "source '{}' is already registered with a different descriptor",
                entry.name
            ))
            .into());
        }

        info!("registering package source '{}'", entry.name);
        self.fs.create_dir(Utf8Path::new(TRUSTED_KEYS_DIR))?;
        self.install_key(entry)
            .with_context(|| format!("failed to install signing key for source '{}'", entry.name))?;
        self.fs.write_file(&entry.list_path(), &rendered, Some(0o644))?;

        self.registered.insert(entry.name.clone(), rendered);
        self.refresh_pending = true;
        Ok(Registration::Registered)
    }

    fn existing_descriptor(&self, entry: &PackageSourceEntry) -> Result<Option<String>> {
        if let Some(existing) = self.registered.get(&entry.name) {
            return Ok(Some(existing.clone()));
        }
        let list_path = entry.list_path();
        if self.fs.exists(&list_path) {
            return Ok(Some(self.fs.read_to_string(&list_path)?));
        }
        Ok(None)
    }

    fn install_key(&self, entry: &PackageSourceEntry) -> Result<()> {
        let key_path = self.fs.resolve(&entry.key_path());
        match &entry.signing_key {
            SigningKey::Url { url, dearmor: false } => {
                let url = parse_download_url(url, "signing key URL")?;
                download(&self.runner, &url, &key_path, self.network_timeout)
            }
            SigningKey::Url { url, dearmor: true } => {
                let url = parse_download_url(url, "signing key URL")?;
                let scratch =
                    ScopedTempDir::create(&self.tmp_dir, "rsprovision-key", self.runner.dry_run())?;
                let armored = scratch.join("key.asc");
                download(&self.runner, &url, &armored, self.network_timeout)?;
                self.verifier(&scratch).dearmor(&armored, &key_path)
            }
            SigningKey::Keyserver { key_id, keyserver } => {
                let scratch =
                    ScopedTempDir::create(&self.tmp_dir, "rsprovision-key", self.runner.dry_run())?;
                let gpg = self.verifier(&scratch);
                gpg.import_key(key_id, keyserver)?;
                gpg.export_key(key_id, &key_path)
            }
        }
    }

    fn verifier(&self, scratch: &ScopedTempDir) -> GpgVerifier {
        GpgVerifier::new(self.runner.clone(), scratch.path().to_owned(), self.network_timeout)
    }

    /// Refreshes the package index and clears the pending flag.
    pub fn refresh_index(&mut self) -> Result<()> {
        self.apt.update()?;
        self.refresh_pending = false;
        Ok(())
    }

    /// Installs packages, refreshing the index first if a source was
    /// registered since the last refresh.
    pub fn install(&mut self, packages: &[String], options: &InstallOptions) -> Result<()> {
        if self.refresh_pending {
            debug!("source registered since last refresh, refreshing index before install");
            self.refresh_index()?;
        }
        self.apt.install(packages, options)
    }

    /// The package manager used for installations.
    pub fn package_manager(&self) -> &AptGet {
        &self.apt
    }
}

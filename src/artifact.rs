//! Signed artifact installation.
//!
//! A signed artifact is a package file published together with a detached
//! signature. Installation walks through
//! `Fetching -> Verifying -> {Installing | Rejected}`: the payload is only
//! installed when the signature verifies and the signer's fingerprint is
//! exactly the pinned one. A rejection is fatal.
//!
//! All downloaded files and the temporary keyring live in one
//! [`ScopedTempDir`] that is removed on every exit path.

use std::time::Duration;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use regex::RegexBuilder;
use serde::Deserialize;
use strum::Display;
use tracing::{error, info, trace};

use crate::apt::PackageManager;
use crate::error::{ProvisionError, VerificationFailure};
use crate::executor::CommandRunner;
use crate::fetch::{download, parse_download_url};
use crate::fs::{HostFs, ScopedTempDir};
use crate::verify::{GpgVerifier, SignatureVerifier, normalize_fingerprint};

/// A targeted text substitution in a configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigPatch {
    /// File inside the image
    pub path: Utf8PathBuf,
    /// Regular expression, matched in multi-line mode
    pub pattern: String,
    /// Replacement; `$1`-style group references are expanded
    pub replacement: String,
}

impl ConfigPatch {
    pub fn validate(&self) -> Result<(), ProvisionError> {
        if !self.path.is_absolute() {
            return Err(ProvisionError::Validation(format!(
                "config patch path must be absolute: {}",
                self.path
            )));
        }
        self.regex()?;
        Ok(())
    }

    fn regex(&self) -> Result<regex::Regex, ProvisionError> {
        RegexBuilder::new(&self.pattern)
            .multi_line(true)
            .build()
            .map_err(|e| {
                ProvisionError::Validation(format!(
                    "invalid config patch pattern '{}': {}",
                    self.pattern, e
                ))
            })
    }

    /// Applies the substitution to every match. Fails if nothing matches.
    pub fn apply(&self, fs: &HostFs) -> Result<()> {
        let regex = self.regex()?;
        let original = match fs.read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if is_dry_run_miss(fs, &e) => {
                info!("dry run: would patch {}", self.path);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if !regex.is_match(&original) {
            anyhow::bail!(
                "config patch pattern '{}' does not match anything in {}",
                self.pattern,
                self.path
            );
        }
        let patched = regex.replace_all(&original, self.replacement.as_str());
        fs.write_file(&self.path, &patched, None)?;
        info!("patched {}", self.path);
        Ok(())
    }
}

/// In a dry run the patched file usually does not exist yet, because the
/// package that ships it was never installed.
fn is_dry_run_miss(fs: &HostFs, err: &ProvisionError) -> bool {
    fs.is_dry_run()
        && matches!(
            err,
            ProvisionError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound
        )
}

/// A package file authenticated by a detached signature.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignedArtifact {
    pub payload_url: String,
    /// Defaults to `payload_url` with `.asc` appended
    #[serde(default)]
    pub signature_url: Option<String>,
    /// Pinned signer fingerprint, compared after whitespace normalization
    pub expected_fingerprint: String,
    /// Key to import for verification
    pub key_id: String,
    pub keyserver: String,
    /// Applied once after a successful installation
    #[serde(default)]
    pub config_patch: Option<ConfigPatch>,
}

impl SignedArtifact {
    pub fn signature_url(&self) -> String {
        self.signature_url
            .clone()
            .unwrap_or_else(|| format!("{}.asc", self.payload_url))
    }

    /// File name of the payload, taken from the last URL path segment.
    pub fn file_name(&self) -> String {
        parse_download_url(&self.payload_url, "payload URL")
            .ok()
            .and_then(|url| {
                url.path_segments()
                    .and_then(|mut segments| segments.next_back().map(str::to_string))
            })
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "artifact.deb".to_string())
    }

    pub fn validate(&self) -> Result<(), ProvisionError> {
        parse_download_url(&self.payload_url, "payload URL")?;
        parse_download_url(&self.signature_url(), "signature URL")?;
        if normalize_fingerprint(&self.expected_fingerprint).is_empty() {
            return Err(ProvisionError::Validation(
                "expected_fingerprint must not be empty".to_string(),
            ));
        }
        if self.key_id.trim().is_empty() || self.keyserver.trim().is_empty() {
            return Err(ProvisionError::Validation(
                "key_id and keyserver must not be empty".to_string(),
            ));
        }
        if let Some(patch) = &self.config_patch {
            patch.validate()?;
        }
        Ok(())
    }
}

/// Compares the extracted signer fingerprint with the pinned one.
pub fn check_fingerprint(
    artifact: &str,
    expected: &str,
    extracted: Option<&str>,
) -> Result<(), VerificationFailure> {
    let Some(actual) = extracted else {
        return Err(VerificationFailure::NoFingerprint {
            artifact: artifact.to_string(),
        });
    };
    let expected = normalize_fingerprint(expected);
    let actual = normalize_fingerprint(actual);
    if actual != expected {
        return Err(VerificationFailure::FingerprintMismatch {
            artifact: artifact.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "UPPERCASE")]
enum ArtifactState {
    Fetching,
    Verifying,
    Installing,
    Rejected,
}

/// Downloads, verifies and installs [`SignedArtifact`]s.
pub struct ArtifactInstaller<'a> {
    runner: &'a CommandRunner,
    packages: &'a dyn PackageManager,
    fs: &'a HostFs,
    tmp_dir: &'a Utf8Path,
    network_timeout: Option<Duration>,
}

impl<'a> ArtifactInstaller<'a> {
    pub fn new(
        runner: &'a CommandRunner,
        packages: &'a dyn PackageManager,
        fs: &'a HostFs,
        tmp_dir: &'a Utf8Path,
        network_timeout: Option<Duration>,
    ) -> Self {
        Self {
            runner,
            packages,
            fs,
            tmp_dir,
            network_timeout,
        }
    }

    pub fn install(&self, artifact: &SignedArtifact) -> Result<()> {
        let file_name = artifact.file_name();

        trace!(artifact = %file_name, state = %ArtifactState::Fetching, "signed artifact state");
        let scratch =
            ScopedTempDir::create(self.tmp_dir, "rsprovision-artifact", self.runner.dry_run())?;
        let payload = scratch.join(&file_name);
        let signature = scratch.join(&format!("{}.asc", file_name));
        let payload_url = parse_download_url(&artifact.payload_url, "payload URL")?;
        let signature_url = parse_download_url(&artifact.signature_url(), "signature URL")?;
        download(self.runner, &payload_url, &payload, self.network_timeout)?;
        download(self.runner, &signature_url, &signature, self.network_timeout)?;

        trace!(artifact = %file_name, state = %ArtifactState::Verifying, "signed artifact state");
        let gpg = GpgVerifier::new(
            self.runner.clone(),
            scratch.path().to_owned(),
            self.network_timeout,
        );
        gpg.import_key(&artifact.key_id, &artifact.keyserver)?;
        let extracted = match gpg.verify(&signature, &payload) {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                error!(artifact = %file_name, state = %ArtifactState::Rejected, "{:#}", e);
                return Err(e);
            }
        };

        if self.runner.dry_run() {
            info!("dry run: skipping fingerprint check for {}", file_name);
        } else if let Err(failure) =
            check_fingerprint(&file_name, &artifact.expected_fingerprint, extracted.as_deref())
        {
            error!(artifact = %file_name, state = %ArtifactState::Rejected, "{}", failure);
            return Err(ProvisionError::from(failure).into());
        }

        trace!(artifact = %file_name, state = %ArtifactState::Installing, "signed artifact state");
        self.packages.install_local(&payload)?;
        if let Some(patch) = &artifact.config_patch {
            patch
                .apply(self.fs)
                .with_context(|| {
                    format!("failed to patch configuration after installing {}", file_name)
                })?;
        }
        Ok(())
    }
}

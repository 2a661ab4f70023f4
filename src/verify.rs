//! Detached-signature verification with GnuPG.
//!
//! [`GpgVerifier`] runs `gpg` against an isolated home directory so that
//! imported keys never reach the image's own keyrings.

use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;

use crate::error::{ProvisionError, VerificationFailure};
use crate::executor::{CommandRunner, CommandSpec};

/// Line printed by `gpg --verify` that carries the signer's primary key.
static PRIMARY_KEY_FINGERPRINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Primary key fingerprint:\s*(.+)$").expect("fingerprint regex is valid")
});

/// Normalizes a fingerprint for comparison.
///
/// Leading and trailing whitespace is dropped and inner whitespace runs are
/// collapsed to a single space. Case is preserved, so the comparison stays
/// case-sensitive.
pub fn normalize_fingerprint(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Extracts the signer fingerprint from `gpg --verify` output.
pub fn parse_fingerprint<'a>(lines: impl IntoIterator<Item = &'a str>) -> Option<String> {
    lines.into_iter().find_map(|line| {
        PRIMARY_KEY_FINGERPRINT
            .captures(line)
            .map(|caps| normalize_fingerprint(&caps[1]))
            .filter(|fpr| !fpr.is_empty())
    })
}

/// Key import and signature verification.
pub trait SignatureVerifier {
    /// Imports and trusts the public key `key_id` from `keyserver`.
    fn import_key(&self, key_id: &str, keyserver: &str) -> Result<()>;

    /// Verifies `signature` against `payload`.
    ///
    /// Returns the normalized signer fingerprint, or `None` when the output
    /// carried none. A signature that gpg rejects outright is reported as
    /// [`VerificationFailure::BadSignature`].
    fn verify(&self, signature: &Utf8Path, payload: &Utf8Path) -> Result<Option<String>>;
}

/// `gpg` with a private `GNUPGHOME`.
pub struct GpgVerifier {
    runner: CommandRunner,
    home: Utf8PathBuf,
    network_timeout: Option<Duration>,
}

impl GpgVerifier {
    /// Creates a verifier whose keyring lives in `home`, which the caller
    /// owns and cleans up.
    pub fn new(
        runner: CommandRunner,
        home: Utf8PathBuf,
        network_timeout: Option<Duration>,
    ) -> Self {
        Self {
            runner,
            home,
            network_timeout,
        }
    }

    fn gpg(&self, args: Vec<String>) -> CommandSpec {
        let mut full = vec!["--batch".to_string(), "--no-tty".to_string()];
        full.extend(args);
        CommandSpec::new("gpg", full)
            .with_env("GNUPGHOME", self.home.as_str())
            .with_env("LANG", "C")
    }

    /// Exports the public key `key_id` in binary form to `output`.
    pub fn export_key(&self, key_id: &str, output: &Utf8Path) -> Result<()> {
        let spec = self.gpg(vec![
            "--yes".to_string(),
            "--output".to_string(),
            output.to_string(),
            "--export".to_string(),
            key_id.to_string(),
        ]);
        self.runner
            .run(&spec)
            .with_context(|| format!("failed to export key {}", key_id))?;
        Ok(())
    }

    /// Converts an ASCII-armored key file to the binary keyring format.
    pub fn dearmor(&self, input: &Utf8Path, output: &Utf8Path) -> Result<()> {
        let spec = self.gpg(vec![
            "--yes".to_string(),
            "--output".to_string(),
            output.to_string(),
            "--dearmor".to_string(),
            input.to_string(),
        ]);
        self.runner
            .run(&spec)
            .with_context(|| format!("failed to dearmor {}", input))?;
        Ok(())
    }
}

impl SignatureVerifier for GpgVerifier {
    fn import_key(&self, key_id: &str, keyserver: &str) -> Result<()> {
        tracing::debug!("importing key {} from {}", key_id, keyserver);
        let spec = self
            .gpg(vec![
                "--keyserver".to_string(),
                keyserver.to_string(),
                "--recv-keys".to_string(),
                key_id.to_string(),
            ])
            .with_timeout(self.network_timeout);
        self.runner
            .run(&spec)
            .with_context(|| format!("failed to import key {} from {}", key_id, keyserver))?;
        Ok(())
    }

    fn verify(&self, signature: &Utf8Path, payload: &Utf8Path) -> Result<Option<String>> {
        let spec = self
            .gpg(vec![
                "--verify".to_string(),
                signature.to_string(),
                payload.to_string(),
            ])
            .capturing_output();
        let result = self.runner.run_unchecked(&spec)?;
        let succeeded = result.success();
        let code = result.code();
        let output = result.output.unwrap_or_default();

        if !succeeded {
            let detail = output
                .lines()
                .find(|l| l.contains("BAD signature") || l.contains("Can't check signature"))
                .map(str::to_string)
                .unwrap_or_else(|| match code {
                    Some(code) => format!("gpg exited with status {}", code),
                    None => "gpg was terminated by a signal".to_string(),
                });
            return Err(ProvisionError::from(VerificationFailure::BadSignature {
                artifact: payload.to_string(),
                detail,
            })
            .into());
        }

        Ok(parse_fingerprint(output.lines()))
    }
}

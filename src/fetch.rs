//! HTTP downloads through `curl`.

use std::time::Duration;

use anyhow::{Context, Result};
use camino::Utf8Path;
use url::Url;

use crate::error::ProvisionError;
use crate::executor::{CommandRunner, CommandSpec};

/// Parses a download URL, accepting only `http` and `https`.
pub fn parse_download_url(raw: &str, label: &str) -> Result<Url, ProvisionError> {
    let url = Url::parse(raw).map_err(|e| {
        ProvisionError::Validation(format!("{} '{}' is not a valid URL: {}", label, raw, e))
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(ProvisionError::Validation(format!(
            "{} '{}' uses unsupported scheme '{}'",
            label, raw, scheme
        ))),
    }
}

/// Builds the `curl` invocation that downloads `url` to `dest`.
pub fn download_spec(url: &Url, dest: &Utf8Path, timeout: Option<Duration>) -> CommandSpec {
    let mut args = vec![
        "--fail".to_string(),
        "--silent".to_string(),
        "--show-error".to_string(),
        "--location".to_string(),
    ];
    if let Some(timeout) = timeout {
        args.push("--max-time".to_string());
        args.push(timeout.as_secs().max(1).to_string());
    }
    args.push("--output".to_string());
    args.push(dest.to_string());
    args.push(url.to_string());
    CommandSpec::new("curl", args).with_timeout(timeout)
}

/// Downloads `url` to `dest`, failing on any HTTP error status.
pub fn download(
    runner: &CommandRunner,
    url: &Url,
    dest: &Utf8Path,
    timeout: Option<Duration>,
) -> Result<()> {
    tracing::debug!("downloading {} to {}", url, dest);
    runner
        .run(&download_spec(url, dest, timeout))
        .with_context(|| format!("failed to download {}", url))?;
    Ok(())
}

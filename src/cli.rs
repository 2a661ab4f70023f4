use anyhow::Result;
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the steps of a profile against the image
    Apply(ApplyArgs),

    /// Validate a profile without running anything
    Validate(ValidateArgs),

    /// List the steps of a profile and their run conditions
    List(ListArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

/// Where the profile comes from.
#[derive(Args, Debug, Clone, Default)]
pub struct ProfileSource {
    /// Path to a YAML profile
    #[arg(short, long, conflicts_with = "profile")]
    pub file: Option<Utf8PathBuf>,

    /// Name of a built-in profile (default: mailserver)
    #[arg(short, long)]
    pub profile: Option<String>,
}

#[derive(Args, Debug)]
pub struct ApplyArgs {
    #[command(flatten)]
    pub source: ProfileSource,

    /// Set the log level
    #[arg(short, long, default_value = "info")]
    pub log_level: LogLevel,

    /// Do not run, just show what would be done
    #[arg(long)]
    pub dry_run: bool,

    /// Override the probed machine architecture (e.g. aarch64)
    #[arg(long)]
    pub arch: Option<String>,

    /// Override a feature flag, as NAME=VALUE (repeatable)
    #[arg(long = "feature", value_name = "NAME=VALUE")]
    pub features: Vec<String>,

    /// Image root directory all paths are resolved under
    #[arg(long)]
    pub root: Option<Utf8PathBuf>,

    /// Directory for temporary files
    #[arg(long)]
    pub tmp_dir: Option<Utf8PathBuf>,
}

#[derive(Args, Debug)]
pub struct ValidateArgs {
    #[command(flatten)]
    pub source: ProfileSource,

    /// Set the log level
    #[arg(short, long, default_value = "info")]
    pub log_level: LogLevel,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[command(flatten)]
    pub source: ProfileSource,

    /// Set the log level
    #[arg(short, long, default_value = "warn")]
    pub log_level: LogLevel,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

/// Represents log levels for controlling the verbosity of logging output.
///
/// This enum maps directly to the log levels used by the `tracing` crate.
/// It also decides whether the package manager runs quietly: anything
/// less verbose than `debug` passes `-qq` to `apt-get`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Returns true when package manager output should be suppressed.
    pub fn quiet_package_manager(self) -> bool {
        matches!(self, Self::Info | Self::Warn | Self::Error)
    }
}

pub fn parse_args() -> Result<Cli> {
    Ok(Cli::parse())
}

pub mod apt;
pub mod arch;
pub mod artifact;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod fs;
pub mod pipeline;
pub mod placeholder;
pub mod sources;
pub mod step;
pub mod verify;

pub use error::{ProvisionError, VerificationFailure};

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{FmtSubscriber, filter::LevelFilter};

use crate::arch::{ArchProbe, FixedArch, UnameProbe};
use crate::config::Profile;
use crate::context::{ContextOptions, FeatureFlags, ProvisioningContext};
use crate::executor::CommandExecutor;
use crate::pipeline::RunReport;

/// Built-in profile used when neither `--file` nor `--profile` is given.
pub const DEFAULT_PROFILE: &str = "mailserver";

pub fn init_logging(log_level: cli::LogLevel) -> Result<()> {
    let filter = match log_level {
        cli::LogLevel::Trace => LevelFilter::TRACE,
        cli::LogLevel::Debug => LevelFilter::DEBUG,
        cli::LogLevel::Info => LevelFilter::INFO,
        cli::LogLevel::Warn => LevelFilter::WARN,
        cli::LogLevel::Error => LevelFilter::ERROR,
    };

    tracing::subscriber::set_global_default(
        FmtSubscriber::builder().with_max_level(filter).finish(),
    )
    .context("failed to set global default tracing subscriber")
}

/// Loads the profile named by the CLI: a file, a built-in profile, or the
/// default built-in profile.
pub fn resolve_profile(source: &cli::ProfileSource) -> Result<Profile> {
    match (&source.file, &source.profile) {
        (Some(path), _) => config::load_profile(path),
        (None, Some(name)) => config::builtin_profile(name),
        (None, None) => config::builtin_profile(DEFAULT_PROFILE),
    }
}

/// Builds the provisioning context for an `apply` run.
///
/// CLI options take precedence over profile defaults. The architecture is
/// probed with `probe` only when neither overrides it.
pub fn build_context(
    profile: &Profile,
    opts: &cli::ApplyArgs,
    executor: Arc<dyn CommandExecutor>,
    probe: &dyn ArchProbe,
) -> Result<ProvisioningContext> {
    let mut features = FeatureFlags::from_env(&profile.features)?;
    features.apply_overrides(&opts.features)?;
    for (name, enabled) in features.iter() {
        info!("feature {}: {}", name, if enabled { "on" } else { "off" });
    }

    let fixed = opts
        .arch
        .clone()
        .or_else(|| profile.defaults.architecture.clone())
        .map(FixedArch);
    let probe: &dyn ArchProbe = match &fixed {
        Some(fixed) => fixed,
        None => probe,
    };
    let arch = probe.machine().context("failed to probe machine architecture")?;
    info!("machine architecture: {}", arch);

    let options = ContextOptions {
        root: opts.root.clone().unwrap_or_else(|| profile.defaults.root.clone()),
        tmp_dir: opts.tmp_dir.clone().unwrap_or_else(|| profile.defaults.tmp_dir.clone()),
        arch,
        features,
        log_level: opts.log_level,
        network_timeout: Some(Duration::from_secs(profile.defaults.network_timeout_secs)),
        dry_run: opts.dry_run,
    };

    if !options.dry_run && !options.tmp_dir.exists() {
        std::fs::create_dir_all(&options.tmp_dir)
            .with_context(|| format!("failed to create directory: {}", options.tmp_dir))?;
    }

    Ok(ProvisioningContext::new(executor, options))
}

pub fn run_apply(opts: &cli::ApplyArgs, executor: Arc<dyn CommandExecutor>) -> Result<RunReport> {
    let profile = resolve_profile(&opts.source)?;
    profile.validate().context("profile validation failed")?;

    let mut ctx = build_context(&profile, opts, executor, &UnameProbe)?;
    profile.pipeline().run(&mut ctx)
}

pub fn run_validate(opts: &cli::ValidateArgs) -> Result<()> {
    let profile = resolve_profile(&opts.source)?;
    profile.validate().context("profile validation failed")?;
    info!("validation successful: {} step(s)", profile.steps.len());
    Ok(())
}

/// Writes the steps of the profile with their action type and condition.
pub fn run_list(opts: &cli::ListArgs, out: &mut dyn Write) -> Result<()> {
    let profile = resolve_profile(&opts.source)?;
    profile.validate().context("profile validation failed")?;
    for (index, step) in profile.steps.iter().enumerate() {
        writeln!(
            out,
            "{:>3}. {} [{}] when: {}",
            index + 1,
            step.name,
            step.action.kind(),
            step.when
        )?;
    }
    Ok(())
}

pub fn generate_completions(shell: clap_complete::Shell, out: &mut dyn Write) {
    use clap::CommandFactory;

    let mut cmd = cli::Cli::command();
    clap_complete::generate(shell, &mut cmd, env!("CARGO_PKG_NAME"), out);
}

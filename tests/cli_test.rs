use anyhow::Result;
use camino::Utf8PathBuf;
use clap::Parser;
use rsprovision::cli::{Cli, Commands, LogLevel};

#[test]
fn test_parse_apply_command_defaults() -> Result<()> {
    let args = Cli::parse_from(["rsprovision", "apply"]);

    match args.command {
        Commands::Apply(opts) => {
            assert_eq!(opts.source.file, None);
            assert_eq!(opts.source.profile, None);
            assert_eq!(opts.log_level, LogLevel::Info);
            assert!(!opts.dry_run);
            assert!(opts.arch.is_none());
            assert!(opts.features.is_empty());
            assert!(opts.root.is_none());
        }
        _ => panic!("Expected Apply command"),
    }

    Ok(())
}

#[test]
fn test_parse_apply_command_with_flags() -> Result<()> {
    let args = Cli::parse_from([
        "rsprovision",
        "apply",
        "--file",
        "profile.yml",
        "--dry-run",
        "--log-level",
        "debug",
        "--arch",
        "aarch64",
        "--feature",
        "DOVECOT_COMMUNITY_REPO=1",
        "--feature",
        "OTHER=0",
        "--root",
        "/srv/image",
        "--tmp-dir",
        "/var/tmp",
    ]);

    match args.command {
        Commands::Apply(opts) => {
            assert_eq!(opts.source.file, Some(Utf8PathBuf::from("profile.yml")));
            assert!(opts.dry_run);
            assert_eq!(opts.log_level, LogLevel::Debug);
            assert_eq!(opts.arch.as_deref(), Some("aarch64"));
            assert_eq!(opts.features, vec!["DOVECOT_COMMUNITY_REPO=1", "OTHER=0"]);
            assert_eq!(opts.root, Some(Utf8PathBuf::from("/srv/image")));
            assert_eq!(opts.tmp_dir, Some(Utf8PathBuf::from("/var/tmp")));
        }
        _ => panic!("Expected Apply command"),
    }

    Ok(())
}

#[test]
fn test_file_and_profile_conflict() {
    let result =
        Cli::try_parse_from(["rsprovision", "apply", "--file", "a.yml", "--profile", "mailserver"]);
    assert!(result.is_err());
}

#[test]
fn test_parse_validate_command() -> Result<()> {
    let args = Cli::parse_from(["rsprovision", "validate", "--profile", "mailserver"]);

    match args.command {
        Commands::Validate(opts) => {
            assert_eq!(opts.source.profile.as_deref(), Some("mailserver"));
        }
        _ => panic!("Expected Validate command"),
    }

    Ok(())
}

#[test]
fn test_parse_list_command_defaults_to_warn() -> Result<()> {
    let args = Cli::parse_from(["rsprovision", "list"]);

    match args.command {
        Commands::List(opts) => assert_eq!(opts.log_level, LogLevel::Warn),
        _ => panic!("Expected List command"),
    }

    Ok(())
}

#[test]
fn test_invalid_log_level_rejected() {
    let result = Cli::try_parse_from(["rsprovision", "apply", "--log-level", "verbose"]);
    assert!(result.is_err());
}

#[test]
fn test_quiet_package_manager_follows_log_level() {
    assert!(!LogLevel::Trace.quiet_package_manager());
    assert!(!LogLevel::Debug.quiet_package_manager());
    assert!(LogLevel::Info.quiet_package_manager());
    assert!(LogLevel::Warn.quiet_package_manager());
    assert!(LogLevel::Error.quiet_package_manager());
}

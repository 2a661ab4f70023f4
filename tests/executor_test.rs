use std::sync::Arc;
use std::time::{Duration, Instant};

use rsprovision::ProvisionError;
use rsprovision::executor::{CommandExecutor, CommandRunner, CommandSpec, RealCommandExecutor};

#[test]
fn dry_run_skips_command_lookup() {
    let executor = RealCommandExecutor { dry_run: true };
    let spec = CommandSpec::new("definitely-not-a-command", Vec::new());

    let result = executor
        .execute(&spec)
        .expect("dry run should not require command to exist");
    assert!(result.status.is_none(), "dry run result should not have an exit status");
    assert!(result.success());
}

#[test]
fn non_dry_run_fails_for_nonexistent_command() {
    let executor = RealCommandExecutor { dry_run: false };
    let spec = CommandSpec::new("this-command-should-not-exist", Vec::new());

    let err = executor.execute(&spec).unwrap_err();

    assert!(err.to_string().contains("not found in PATH"), "got: {}", err);
    assert!(
        matches!(
            err.downcast_ref::<ProvisionError>(),
            Some(ProvisionError::CommandNotFound { .. })
        ),
        "Expected CommandNotFound variant, got: {:#}",
        err
    );
}

#[test]
fn exit_status_is_reported() {
    let executor = RealCommandExecutor { dry_run: false };

    let ok = executor.execute(&CommandSpec::new("true", Vec::new())).unwrap();
    assert!(ok.success());
    assert_eq!(ok.code(), Some(0));

    let failed = executor.execute(&CommandSpec::new("false", Vec::new())).unwrap();
    assert!(!failed.success());
    assert_eq!(failed.code(), Some(1));
}

#[test]
fn runner_turns_failure_into_command_failure() {
    let runner = CommandRunner::new(Arc::new(RealCommandExecutor { dry_run: false }), false);

    let err = runner.run(&CommandSpec::new("false", Vec::new())).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ProvisionError>(),
        Some(ProvisionError::CommandFailure { .. })
    ));

    let result = runner.run_unchecked(&CommandSpec::new("false", Vec::new())).unwrap();
    assert!(!result.success());
}

#[test]
fn captured_output_is_returned() {
    let executor = RealCommandExecutor { dry_run: false };
    let spec = CommandSpec::new(
        "sh",
        vec!["-c".to_string(), "echo out; echo err >&2".to_string()],
    )
    .capturing_output();

    let result = executor.execute(&spec).unwrap();
    let output = result.output.expect("output should be captured");
    assert_eq!(output.stdout.trim(), "out");
    assert_eq!(output.stderr.trim(), "err");
    assert_eq!(output.lines().collect::<Vec<_>>(), vec!["out", "err"]);
}

#[test]
fn uncaptured_output_is_not_returned() {
    let executor = RealCommandExecutor { dry_run: false };
    let result = executor
        .execute(&CommandSpec::new("echo", vec!["hello".to_string()]))
        .unwrap();
    assert!(result.output.is_none());
}

#[test]
fn env_and_cwd_are_applied() {
    let dir = tempfile::tempdir().unwrap();
    let cwd = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let executor = RealCommandExecutor { dry_run: false };
    let spec = CommandSpec::new("sh", vec!["-c".to_string(), "echo $GREETING; pwd".to_string()])
        .with_env("GREETING", "hello")
        .with_cwd(cwd.clone())
        .capturing_output();

    let output = executor.execute(&spec).unwrap().output.unwrap();
    let lines: Vec<_> = output.stdout.lines().collect();
    assert_eq!(lines[0], "hello");
    let reported = std::fs::canonicalize(lines[1]).unwrap();
    assert_eq!(reported, std::fs::canonicalize(&cwd).unwrap());
}

#[test]
fn timeout_kills_long_running_command() {
    let executor = RealCommandExecutor { dry_run: false };
    let spec = CommandSpec::new("sleep", vec!["30".to_string()])
        .with_timeout(Some(Duration::from_millis(200)));

    let started = Instant::now();
    let err = executor.execute(&spec).unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(err.to_string().contains("timed out"), "got: {}", err);
    assert!(matches!(
        err.downcast_ref::<ProvisionError>(),
        Some(ProvisionError::CommandFailure { .. })
    ));
}

#[test]
fn timeout_kills_background_jobs_holding_the_pipes() {
    let executor = RealCommandExecutor { dry_run: false };
    let spec = CommandSpec::new("sh", vec!["-c".to_string(), "sleep 20 & sleep 20".to_string()])
        .with_timeout(Some(Duration::from_millis(300)));

    let started = Instant::now();
    let err = executor.execute(&spec).unwrap_err();

    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_secs(5), "timeout of 300ms took {:?}", elapsed);
    assert!(err.to_string().contains("timed out"), "got: {}", err);
}

#[test]
fn timeout_does_not_wait_for_escaped_descendants() {
    let executor = RealCommandExecutor { dry_run: false };
    let spec = CommandSpec::new(
        "sh",
        vec!["-c".to_string(), "setsid sleep 20 & sleep 20".to_string()],
    )
    .with_timeout(Some(Duration::from_millis(300)));

    let started = Instant::now();
    assert!(executor.execute(&spec).is_err());
    assert!(started.elapsed() < Duration::from_secs(5));
}

//! Tests for package source registration and architecture selection.

mod helpers;

use std::sync::Arc;

use rsprovision::ProvisionError;
use rsprovision::apt::InstallOptions;
use rsprovision::sources::{PackageSourceEntry, Registration, select_for_architecture};
use rsprovision::step::{Step, StepAction};

use helpers::{MockExecutor, TestEnv};

fn rspamd_candidates() -> Vec<PackageSourceEntry> {
    serde_yaml::from_str(
        r#"
- name: rspamd
  signing_key:
    type: url
    url: https://rspamd.com/apt-stable/gpg.key
  descriptor:
    uri: http://rspamd.com/apt-stable/
    suite: bookworm
    components: [main]
    deb_src: true
- name: bookworm-backports
  applies_to: aarch64
  install_release: bookworm-backports
  signing_key:
    type: url
    url: https://ftp-master.debian.org/keys/archive-key-12.asc
  descriptor:
    uri: http://deb.debian.org/debian
    suite: bookworm-backports
    components: [main]
"#,
    )
    .unwrap()
}

fn rspamd_step() -> Step {
    Step::new(
        "rspamd",
        StepAction::ArchSource {
            candidates: rspamd_candidates(),
            packages: vec!["rspamd".to_string(), "redis-server".to_string()],
            options: InstallOptions::default(),
        },
    )
}

fn dovecot_entry(suite: &str) -> PackageSourceEntry {
    serde_yaml::from_str(&format!(
        r#"
name: dovecot
signing_key:
  type: url
  url: https://repo.dovecot.org/DOVECOT-REPO-GPG
descriptor:
  uri: https://repo.dovecot.org/ce-2.3-latest/debian/{suite}
  suite: {suite}
  components: [main]
"#
    ))
    .unwrap()
}

// =============================================================================
// Architecture selection
// =============================================================================

#[test]
fn test_aarch64_registers_backports_only() {
    let env = TestEnv::new();
    let executor = Arc::new(MockExecutor::new());
    let mut ctx = env.context(executor.clone(), "aarch64", &[]);

    rspamd_step().execute(&mut ctx).unwrap();

    assert!(env.exists("/etc/apt/sources.list.d/bookworm-backports.list"));
    assert!(!env.exists("/etc/apt/sources.list.d/rspamd.list"));
    assert_eq!(executor.count_matching("rspamd.com"), 0);

    let install = executor
        .joined_calls()
        .into_iter()
        .find(|c| c.contains(" install "))
        .expect("packages should be installed");
    assert!(install.contains("-t bookworm-backports rspamd redis-server"), "got: {}", install);
}

#[test]
fn test_other_architecture_registers_vendor_source_only() {
    let env = TestEnv::new();
    let executor = Arc::new(MockExecutor::new());
    let mut ctx = env.context(executor.clone(), "x86_64", &[]);

    rspamd_step().execute(&mut ctx).unwrap();

    assert!(!env.exists("/etc/apt/sources.list.d/bookworm-backports.list"));
    let list = env.read("/etc/apt/sources.list.d/rspamd.list");
    assert_eq!(
        list,
        "deb [signed-by=/etc/apt/trusted.gpg.d/rspamd.gpg] http://rspamd.com/apt-stable/ bookworm main\n\
         deb-src [signed-by=/etc/apt/trusted.gpg.d/rspamd.gpg] http://rspamd.com/apt-stable/ bookworm main\n"
    );
    assert_eq!(executor.count_matching("deb.debian.org"), 0);
    assert_eq!(executor.count_matching("-t bookworm-backports"), 0);
}

#[test]
fn test_select_for_architecture_rejects_ambiguity() {
    let mut candidates = rspamd_candidates();
    candidates.push(dovecot_entry("bookworm"));
    let err = select_for_architecture(&candidates, "x86_64").unwrap_err();
    assert!(matches!(err, ProvisionError::Registration(_)));

    let only_arm: Vec<_> =
        rspamd_candidates().into_iter().filter(|c| c.applies_to.is_some()).collect();
    let err = select_for_architecture(&only_arm, "x86_64").unwrap_err();
    assert!(err.to_string().contains("no package source applies"), "got: {}", err);
}

// =============================================================================
// Registration
// =============================================================================

#[test]
fn test_register_installs_key_then_descriptor() {
    let env = TestEnv::new();
    let executor = Arc::new(MockExecutor::new());
    let mut ctx = env.context(executor.clone(), "x86_64", &[]);

    let outcome = ctx.sources.register(&dovecot_entry("bookworm")).unwrap();
    assert_eq!(outcome, Registration::Registered);
    assert!(ctx.sources.refresh_pending());
    assert!(ctx.sources.is_registered("dovecot"));

    let calls = executor.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0][0], "curl");
    assert!(calls[0].contains(&"https://repo.dovecot.org/DOVECOT-REPO-GPG".to_string()));
    assert_eq!(calls[1][0], "gpg");
    assert!(calls[1].contains(&"--dearmor".to_string()));
    let key_path = env.root.join("etc/apt/trusted.gpg.d/dovecot.gpg");
    assert!(calls[1].contains(&key_path.to_string()));

    assert!(env.exists("/etc/apt/sources.list.d/dovecot.list"));
    assert!(env.leftover_tmp_entries().is_empty(), "key scratch directory should be removed");
}

#[test]
fn test_register_same_descriptor_twice_is_noop() {
    let env = TestEnv::new();
    let executor = Arc::new(MockExecutor::new());
    let mut ctx = env.context(executor.clone(), "x86_64", &[]);

    ctx.sources.register(&dovecot_entry("bookworm")).unwrap();
    let calls_after_first = executor.call_count();
    let outcome = ctx.sources.register(&dovecot_entry("bookworm")).unwrap();

    assert_eq!(outcome, Registration::AlreadyRegistered);
    assert_eq!(executor.call_count(), calls_after_first);
}

#[test]
fn test_register_recognizes_descriptor_already_on_disk() {
    let env = TestEnv::new();
    let entry = dovecot_entry("bookworm");
    env.write("/etc/apt/sources.list.d/dovecot.list", &entry.render());

    let executor = Arc::new(MockExecutor::new());
    let mut ctx = env.context(executor.clone(), "x86_64", &[]);
    let outcome = ctx.sources.register(&entry).unwrap();

    assert_eq!(outcome, Registration::AlreadyRegistered);
    assert_eq!(executor.call_count(), 0);
    assert!(!ctx.sources.refresh_pending());
}

#[test]
fn test_register_conflicting_descriptor_fails() {
    let env = TestEnv::new();
    let executor = Arc::new(MockExecutor::new());
    let mut ctx = env.context(executor.clone(), "x86_64", &[]);

    ctx.sources.register(&dovecot_entry("bookworm")).unwrap();
    let err = ctx.sources.register(&dovecot_entry("trixie")).unwrap_err();

    let cause = err.downcast_ref::<ProvisionError>().unwrap();
    assert!(matches!(cause, ProvisionError::Registration(_)));
    assert!(cause.to_string().contains("different descriptor"));
}

#[test]
fn test_register_keyserver_key_imports_and_exports() {
    let env = TestEnv::new();
    let executor = Arc::new(MockExecutor::new());
    let mut ctx = env.context(executor.clone(), "x86_64", &[]);
    let entry: PackageSourceEntry = serde_yaml::from_str(
        r#"
name: example
signing_key:
  type: keyserver
  key_id: "0x683BF1BEBD0A882C"
  keyserver: hkps://keyserver.ubuntu.com
descriptor:
  uri: https://example.org/debian
  suite: bookworm
  components: [main, contrib]
  architectures: [arm64]
"#,
    )
    .unwrap();

    ctx.sources.register(&entry).unwrap();

    let joined = executor.joined_calls();
    assert!(joined[0].contains("--recv-keys 0x683BF1BEBD0A882C"), "got: {:?}", joined);
    assert!(joined[1].contains("--export 0x683BF1BEBD0A882C"), "got: {:?}", joined);
    assert_eq!(
        env.read("/etc/apt/sources.list.d/example.list"),
        "deb [arch=arm64 signed-by=/etc/apt/trusted.gpg.d/example.gpg] https://example.org/debian bookworm main contrib\n"
    );
}

#[test]
fn test_register_rejects_missing_components() {
    let env = TestEnv::new();
    let executor = Arc::new(MockExecutor::new());
    let mut ctx = env.context(executor.clone(), "x86_64", &[]);
    let mut entry = dovecot_entry("bookworm");
    entry.descriptor.components.clear();

    let err = ctx.sources.register(&entry).unwrap_err();
    assert!(matches!(err.downcast_ref::<ProvisionError>(), Some(ProvisionError::Registration(_))));
    assert_eq!(executor.call_count(), 0);
}

// =============================================================================
// Index refresh
// =============================================================================

#[test]
fn test_install_refreshes_once_after_registration() {
    let env = TestEnv::new();
    let executor = Arc::new(MockExecutor::new());
    let mut ctx = env.context(executor.clone(), "x86_64", &[]);
    let packages = vec!["dovecot-core".to_string()];

    ctx.sources.register(&dovecot_entry("bookworm")).unwrap();
    ctx.sources.install(&packages, &InstallOptions::default()).unwrap();
    ctx.sources.install(&packages, &InstallOptions::default()).unwrap();

    assert_eq!(executor.count_matching("apt-get -qq --yes update"), 1);
    assert_eq!(executor.count_matching(" install "), 2);
    assert!(!ctx.sources.refresh_pending());

    let joined = executor.joined_calls();
    let update = joined.iter().position(|c| c.contains(" update")).unwrap();
    let install = joined.iter().position(|c| c.contains(" install ")).unwrap();
    assert!(update < install);
}

#[test]
fn test_install_without_registration_does_not_refresh() {
    let env = TestEnv::new();
    let executor = Arc::new(MockExecutor::new());
    let mut ctx = env.context(executor.clone(), "x86_64", &[]);

    ctx.sources
        .install(&["postfix".to_string()], &InstallOptions::default())
        .unwrap();

    assert_eq!(
        executor.joined_calls(),
        vec!["apt-get -qq --yes install --no-install-recommends postfix"]
    );
}

#[test]
fn test_verbose_log_level_disables_quiet_mode() {
    let env = TestEnv::new();
    let executor = Arc::new(MockExecutor::new());
    let mut options = env.options("x86_64", &[]);
    options.log_level = rsprovision::cli::LogLevel::Debug;
    let mut ctx = rsprovision::context::ProvisioningContext::new(executor.clone(), options);

    ctx.sources
        .install(&["postfix".to_string()], &InstallOptions::default())
        .unwrap();

    assert_eq!(executor.count_matching("-qq"), 0);
    let spec = &executor.specs()[0];
    assert!(spec.env.contains(&("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string())));
}

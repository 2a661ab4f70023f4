use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use camino::Utf8PathBuf;
use rsprovision::context::{ContextOptions, FeatureFlags, ProvisioningContext};
use rsprovision::executor::{CommandExecutor, CommandSpec, ExecutionResult};

/// Fingerprint of the key that signs the fail2ban release.
#[allow(dead_code)]
pub const FAIL2BAN_FINGERPRINT: &str = "8738 559E 26F6 71DF 9E2C  6D9E 683B F1BE BD0A 882C";

/// Records executed commands in order, optionally failing some of them.
///
/// Every command succeeds with exit status 0 unless it is selected by
/// `fail_on_call` or `fail_on_command`. `gpg --verify` returns
/// `verify_output` on stderr, the way gpg reports the signer.
#[allow(dead_code)]
pub struct MockExecutor {
    calls: Mutex<Vec<CommandSpec>>,
    /// If set, the Nth call (0-indexed) exits with status 1.
    pub fail_on_call: Option<usize>,
    /// Calls whose command line starts with these words exit with status 1.
    pub fail_on_command: Option<Vec<String>>,
    /// Output of `gpg --verify`
    pub verify_output: String,
}

#[allow(dead_code)]
impl MockExecutor {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_on_call: None,
            fail_on_command: None,
            verify_output: format!(
                "gpg: Good signature from \"Serg G. Brester (sebres)\"\nPrimary key fingerprint: {}\n",
                FAIL2BAN_FINGERPRINT
            ),
        }
    }

    pub fn failing_on(call_index: usize) -> Self {
        Self {
            fail_on_call: Some(call_index),
            ..Self::new()
        }
    }

    /// Fails every call whose command line starts with `words`.
    pub fn failing_command(words: &[&str]) -> Self {
        Self {
            fail_on_command: Some(words.iter().map(|w| w.to_string()).collect()),
            ..Self::new()
        }
    }

    pub fn with_verify_output(mut self, output: impl Into<String>) -> Self {
        self.verify_output = output.into();
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn specs(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Command lines as `[command, args...]`.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.specs()
            .into_iter()
            .map(|spec| {
                let mut line = vec![spec.command];
                line.extend(spec.args);
                line
            })
            .collect()
    }

    /// Command lines joined with spaces, for substring assertions.
    pub fn joined_calls(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.join(" ")).collect()
    }

    /// Number of calls whose command line contains `needle`.
    pub fn count_matching(&self, needle: &str) -> usize {
        self.joined_calls().iter().filter(|c| c.contains(needle)).count()
    }

    fn fails(&self, index: usize, line: &[String]) -> bool {
        if self.fail_on_call == Some(index) {
            return true;
        }
        match &self.fail_on_command {
            Some(words) => line.len() >= words.len() && line[..words.len()] == words[..],
            None => false,
        }
    }
}

impl CommandExecutor for MockExecutor {
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult> {
        let mut calls = self.calls.lock().unwrap();
        let index = calls.len();
        calls.push(spec.clone());
        drop(calls);

        let mut line = vec![spec.command.clone()];
        line.extend(spec.args.iter().cloned());
        let status = if self.fails(index, &line) {
            ExitStatus::from_raw(1 << 8)
        } else {
            ExitStatus::from_raw(0)
        };

        let result = ExecutionResult::new(Some(status));
        if spec.command == "gpg" && spec.has_arg("--verify") {
            return Ok(result.with_output("", self.verify_output.clone()));
        }
        Ok(result)
    }
}

/// Creates a temporary directory with a UTF-8 path.
#[allow(dead_code)]
pub fn utf8_tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path =
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("path should be valid UTF-8");
    (dir, path)
}

/// Scratch image root and temp directory for one test.
#[allow(dead_code)]
pub struct TestEnv {
    _guard: tempfile::TempDir,
    pub root: Utf8PathBuf,
    pub tmp: Utf8PathBuf,
}

#[allow(dead_code)]
impl TestEnv {
    pub fn new() -> Self {
        let (guard, base) = utf8_tempdir();
        let root = base.join("root");
        let tmp = base.join("tmp");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&tmp).unwrap();
        Self {
            _guard: guard,
            root,
            tmp,
        }
    }

    pub fn options(&self, arch: &str, features: &[(&str, bool)]) -> ContextOptions {
        let mut flags = FeatureFlags::default();
        for (name, enabled) in features {
            flags.set(*name, *enabled);
        }
        ContextOptions {
            root: self.root.clone(),
            tmp_dir: self.tmp.clone(),
            arch: arch.to_string(),
            features: flags,
            ..ContextOptions::default()
        }
    }

    pub fn context(
        &self,
        executor: Arc<MockExecutor>,
        arch: &str,
        features: &[(&str, bool)],
    ) -> ProvisioningContext {
        ProvisioningContext::new(executor, self.options(arch, features))
    }

    /// Writes a file inside the image root.
    pub fn write(&self, path: &str, content: &str) {
        let target = self.root.join(path.trim_start_matches('/'));
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(target, content).unwrap();
    }

    pub fn read(&self, path: &str) -> String {
        std::fs::read_to_string(self.root.join(path.trim_start_matches('/'))).unwrap()
    }

    pub fn exists(&self, path: &str) -> bool {
        self.root.join(path.trim_start_matches('/')).exists()
    }

    /// Entries left in the temp directory.
    pub fn leftover_tmp_entries(&self) -> Vec<String> {
        std::fs::read_dir(&self.tmp)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }
}

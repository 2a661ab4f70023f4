//! Machine architecture probe.
//!
//! Steps and package sources branch on the machine architecture string as
//! reported by `uname -m` (e.g. `x86_64`, `aarch64`).

use anyhow::Result;

/// Source of the machine architecture identifier.
pub trait ArchProbe {
    fn machine(&self) -> Result<String>;
}

/// Probes the running kernel via `uname(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnameProbe;

impl ArchProbe for UnameProbe {
    fn machine(&self) -> Result<String> {
        let uts = rustix::system::uname();
        let machine = uts.machine().to_string_lossy().trim().to_string();
        if machine.is_empty() {
            anyhow::bail!("uname returned an empty machine architecture");
        }
        Ok(machine)
    }
}

/// Fixed architecture, used when the profile or the CLI overrides the probe.
#[derive(Debug, Clone)]
pub struct FixedArch(pub String);

impl ArchProbe for FixedArch {
    fn machine(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

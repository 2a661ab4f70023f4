//! Declarative run conditions for steps.

use serde::Deserialize;

use crate::context::ProvisioningContext;

/// Predicate deciding whether a step runs.
///
/// Every field that is set must hold; a condition with no fields set is
/// always true.
///
/// ```yaml
/// when:
///   feature: DOVECOT_COMMUNITY_REPO
///   not_arch: aarch64
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Condition {
    /// Feature flag that must be on
    #[serde(default)]
    pub feature: Option<String>,
    /// Feature flag that must be off
    #[serde(default)]
    pub not_feature: Option<String>,
    /// Machine architecture that must match
    #[serde(default)]
    pub arch: Option<String>,
    /// Machine architecture that must not match
    #[serde(default)]
    pub not_arch: Option<String>,
}

impl Condition {
    pub fn always() -> Self {
        Self::default()
    }

    pub fn feature(name: impl Into<String>) -> Self {
        Self {
            feature: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn arch(arch: impl Into<String>) -> Self {
        Self {
            arch: Some(arch.into()),
            ..Self::default()
        }
    }

    pub fn is_always(&self) -> bool {
        self == &Self::default()
    }

    /// Feature flag names this condition refers to.
    pub fn features(&self) -> impl Iterator<Item = &str> {
        self.feature.iter().chain(self.not_feature.iter()).map(String::as_str)
    }

    pub fn evaluate(&self, ctx: &ProvisioningContext) -> bool {
        self.evaluate_with(|name| ctx.features.is_enabled(name), &ctx.arch)
    }

    /// Evaluates against an explicit flag lookup and architecture.
    pub fn evaluate_with<F>(&self, feature_enabled: F, arch: &str) -> bool
    where
        F: Fn(&str) -> bool,
    {
        self.feature.as_deref().is_none_or(|f| feature_enabled(f))
            && self.not_feature.as_deref().is_none_or(|f| !feature_enabled(f))
            && self.arch.as_deref().is_none_or(|a| a == arch)
            && self.not_arch.as_deref().is_none_or(|a| a != arch)
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_always() {
            return f.write_str("always");
        }
        let mut parts = Vec::new();
        if let Some(name) = &self.feature {
            parts.push(format!("feature {}", name));
        }
        if let Some(name) = &self.not_feature {
            parts.push(format!("not feature {}", name));
        }
        if let Some(arch) = &self.arch {
            parts.push(format!("arch {}", arch));
        }
        if let Some(arch) = &self.not_arch {
            parts.push(format!("not arch {}", arch));
        }
        f.write_str(&parts.join(" and "))
    }
}

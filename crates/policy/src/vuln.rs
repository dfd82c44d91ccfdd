//! Vulnerability check configuration and its merge semantics.
//!
//! A route-level value replaces the policy default entirely for that
//! check; a `fields` list replaces, never merges.

use serde::Deserialize;

/// Per-check configuration: a plain enable/disable flag, or a field scope
/// (which implies the check is on).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CheckConfig {
    /// Turn the check on or off wholesale.
    Enabled(bool),
    /// Enable the check for the listed fields only.
    Scoped {
        /// Field names or dotted paths to inspect.
        fields: Vec<String>,
    },
}

/// Vulnerability check table as written in a policy document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VulnerabilityChecks {
    /// `__proto__`/`constructor`/`prototype` object keys.
    #[serde(default, alias = "prototypePollution")]
    pub prototype_pollution: Option<CheckConfig>,
    /// `../`-style traversal sequences in string values.
    #[serde(default, alias = "pathTraversal")]
    pub path_traversal: Option<CheckConfig>,
    /// URLs pointing at loopback or private ranges.
    #[serde(default, alias = "ssrfInternal")]
    pub ssrf_internal: Option<CheckConfig>,
    /// `$`-prefixed MongoDB operator keys.
    #[serde(default, alias = "nosqlInjection")]
    pub nosql_injection: Option<CheckConfig>,
    /// Shell metacharacter patterns in string values.
    #[serde(default, alias = "commandInjection")]
    pub command_injection: Option<CheckConfig>,
}

/// Resolved state of one check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EffectiveCheck {
    /// Whether the check runs at all.
    pub enabled: bool,
    /// Restrict inspection to these fields; `None` inspects everything.
    pub fields: Option<Vec<String>>,
}

impl EffectiveCheck {
    fn from_config(config: &CheckConfig) -> Self {
        match config {
            CheckConfig::Enabled(enabled) => Self { enabled: *enabled, fields: None },
            CheckConfig::Scoped { fields } => Self { enabled: true, fields: Some(fields.clone()) },
        }
    }

    fn resolve(builtin: bool, default: Option<&CheckConfig>, route: Option<&CheckConfig>) -> Self {
        route
            .or(default)
            .map_or(Self { enabled: builtin, fields: None }, Self::from_config)
    }

    /// Whether a value at `dotted` (path below the root segment, leaf key
    /// `leaf`) is in scope for this check.
    #[must_use]
    pub fn field_in_scope(&self, leaf: &str, dotted: &str) -> bool {
        match &self.fields {
            None => true,
            Some(fields) => fields.iter().any(|f| f == leaf || f == dotted),
        }
    }
}

/// Fully resolved vulnerability check table for one evaluation.
#[derive(Debug, Clone, Default)]
pub struct EffectiveChecks {
    /// Prototype pollution scan; built-in default on.
    pub prototype_pollution: EffectiveCheck,
    /// Path traversal scan; built-in default on.
    pub path_traversal: EffectiveCheck,
    /// SSRF target scan; built-in default on.
    pub ssrf_internal: EffectiveCheck,
    /// NoSQL operator scan; built-in default off.
    pub nosql_injection: EffectiveCheck,
    /// Command injection scan; built-in default off.
    pub command_injection: EffectiveCheck,
}

impl EffectiveChecks {
    /// Merge route overrides onto policy defaults onto built-in defaults.
    #[must_use]
    pub fn resolve(
        defaults: &VulnerabilityChecks,
        route: Option<&VulnerabilityChecks>,
    ) -> Self {
        Self {
            prototype_pollution: EffectiveCheck::resolve(
                true,
                defaults.prototype_pollution.as_ref(),
                route.and_then(|r| r.prototype_pollution.as_ref()),
            ),
            path_traversal: EffectiveCheck::resolve(
                true,
                defaults.path_traversal.as_ref(),
                route.and_then(|r| r.path_traversal.as_ref()),
            ),
            ssrf_internal: EffectiveCheck::resolve(
                true,
                defaults.ssrf_internal.as_ref(),
                route.and_then(|r| r.ssrf_internal.as_ref()),
            ),
            nosql_injection: EffectiveCheck::resolve(
                false,
                defaults.nosql_injection.as_ref(),
                route.and_then(|r| r.nosql_injection.as_ref()),
            ),
            command_injection: EffectiveCheck::resolve(
                false,
                defaults.command_injection.as_ref(),
                route.and_then(|r| r.command_injection.as_ref()),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_defaults_apply() {
        let eff = EffectiveChecks::resolve(&VulnerabilityChecks::default(), None);
        assert!(eff.prototype_pollution.enabled);
        assert!(eff.path_traversal.enabled);
        assert!(eff.ssrf_internal.enabled);
        assert!(!eff.nosql_injection.enabled);
        assert!(!eff.command_injection.enabled);
    }

    #[test]
    fn route_bool_replaces_default() {
        let defaults = VulnerabilityChecks {
            path_traversal: Some(CheckConfig::Scoped { fields: vec!["file".into()] }),
            ..VulnerabilityChecks::default()
        };
        let route = VulnerabilityChecks {
            path_traversal: Some(CheckConfig::Enabled(false)),
            ..VulnerabilityChecks::default()
        };
        let eff = EffectiveChecks::resolve(&defaults, Some(&route));
        assert!(!eff.path_traversal.enabled);
        assert!(eff.path_traversal.fields.is_none());
    }

    #[test]
    fn scoping_implies_enabled_and_replaces_list() {
        let defaults = VulnerabilityChecks {
            command_injection: Some(CheckConfig::Scoped { fields: vec!["cmd".into()] }),
            ..VulnerabilityChecks::default()
        };
        let route = VulnerabilityChecks {
            command_injection: Some(CheckConfig::Scoped { fields: vec!["exec".into()] }),
            ..VulnerabilityChecks::default()
        };
        let eff = EffectiveChecks::resolve(&defaults, Some(&route));
        assert!(eff.command_injection.enabled);
        assert_eq!(eff.command_injection.fields.as_deref(), Some(&["exec".to_string()][..]));
    }

    #[test]
    fn field_scope_matches_leaf_or_dotted_path() {
        let check = EffectiveCheck { enabled: true, fields: Some(vec!["file.path".into()]) };
        assert!(check.field_in_scope("path", "file.path"));
        assert!(!check.field_in_scope("path", "other.path"));
        let unscoped = EffectiveCheck { enabled: true, fields: None };
        assert!(unscoped.field_in_scope("anything", "at.all"));
    }
}

//! Role-based tool access control (spec §7): glob-patterned allow/deny
//! matchers per role, deny overriding allow. Consulted by the Planner
//! before every tool invocation.

use globset::{Glob, GlobSet, GlobSetBuilder};
use loom_core::config::SecurityConfig;
use std::collections::HashMap;

struct CompiledRole {
    allow: GlobSet,
    deny: GlobSet,
}

/// Compiled form of `SecurityConfig`, built once at startup.
pub struct AccessControl {
    enabled: bool,
    default_role: String,
    roles: HashMap<String, CompiledRole>,
}

impl AccessControl {
    pub fn new(config: &SecurityConfig) -> loom_core::Result<Self> {
        let mut roles = HashMap::new();
        for (name, rules) in &config.roles {
            roles.insert(
                name.clone(),
                CompiledRole {
                    allow: build_set(&rules.allow)?,
                    deny: build_set(&rules.deny)?,
                },
            );
        }
        Ok(Self {
            enabled: config.enabled,
            default_role: config.default_role.clone(),
            roles,
        })
    }

    /// `true` if `role` may invoke `tool_name`. Deny overrides allow; an
    /// unknown role falls back to the configured default role; when
    /// security is disabled every call is permitted.
    pub fn is_allowed(&self, role: Option<&str>, tool_name: &str) -> bool {
        if !self.enabled {
            return true;
        }
        let role = role.unwrap_or(&self.default_role);
        let compiled = match self.roles.get(role).or_else(|| self.roles.get(&self.default_role)) {
            Some(c) => c,
            None => return true,
        };
        if compiled.deny.is_match(tool_name) {
            return false;
        }
        compiled.allow.is_match(tool_name)
    }
}

fn build_set(patterns: &[String]) -> loom_core::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| loom_core::Error::ConfigError(format!("invalid glob '{pattern}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| loom_core::Error::ConfigError(format!("failed to build glob set: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::config::RoleRules;

    fn config_with(roles: Vec<(&str, Vec<&str>, Vec<&str>)>) -> SecurityConfig {
        let mut map = HashMap::new();
        for (name, allow, deny) in roles {
            map.insert(
                name.to_string(),
                RoleRules {
                    allow: allow.into_iter().map(String::from).collect(),
                    deny: deny.into_iter().map(String::from).collect(),
                },
            );
        }
        SecurityConfig {
            enabled: true,
            default_role: "guest".to_string(),
            roles: map,
        }
    }

    #[test]
    fn disabled_security_allows_everything() {
        let mut config = config_with(vec![("guest", vec![], vec!["*"])]);
        config.enabled = false;
        let ac = AccessControl::new(&config).unwrap();
        assert!(ac.is_allowed(Some("guest"), "dangerous_tool"));
    }

    #[test]
    fn deny_overrides_allow() {
        let config = config_with(vec![("guest", vec!["*"], vec!["dangerous_tool"])]);
        let ac = AccessControl::new(&config).unwrap();
        assert!(!ac.is_allowed(Some("guest"), "dangerous_tool"));
        assert!(ac.is_allowed(Some("guest"), "read"));
    }

    #[test]
    fn unlisted_role_falls_back_to_default() {
        let config = config_with(vec![("guest", vec!["read*"], vec![])]);
        let ac = AccessControl::new(&config).unwrap();
        assert!(ac.is_allowed(Some("nonexistent-role"), "read_file"));
        assert!(!ac.is_allowed(Some("nonexistent-role"), "write_file"));
    }

    #[test]
    fn glob_patterns_match_prefixes() {
        let config = config_with(vec![("admin", vec!["tool_*"], vec![])]);
        let ac = AccessControl::new(&config).unwrap();
        assert!(ac.is_allowed(Some("admin"), "tool_a"));
        assert!(!ac.is_allowed(Some("admin"), "other"));
    }
}

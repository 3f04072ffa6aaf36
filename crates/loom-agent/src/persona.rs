//! Persona/Plugin Wiring (spec C9): capability assembly and persona
//! eligibility. Plugins themselves (`Tool` providers with optional
//! lifecycle hooks) are an external collaborator per spec §1 — this module
//! owns only the registered-capability bookkeeping and the eligibility
//! check, computed once at startup per SPEC_FULL.md §9(b).

use loom_core::config::PersonasConfig;
use loom_core::types::{Persona, PersonaRequirements};
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// The capability surface actually available once plugins have loaded —
/// used only to validate persona `requires` against, never mutated after
/// construction.
pub struct CapabilitySet {
    pub plugins: HashSet<String>,
    pub core_tools: HashSet<String>,
    pub plugin_tools: HashSet<String>,
}

impl CapabilitySet {
    pub fn new(
        plugins: impl IntoIterator<Item = String>,
        core_tools: impl IntoIterator<Item = String>,
        plugin_tools: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            plugins: plugins.into_iter().collect(),
            core_tools: core_tools.into_iter().collect(),
            plugin_tools: plugin_tools.into_iter().collect(),
        }
    }

    fn satisfies(&self, requires: &PersonaRequirements) -> bool {
        requires.plugins.iter().all(|p| self.plugins.contains(p))
            && requires.core_tools.iter().all(|t| self.core_tools.contains(t))
            && requires.plugin_tools.iter().all(|t| self.plugin_tools.contains(t))
    }
}

/// Source material for building a `Persona` roster: name, prompt, and the
/// requirements it declares. Loading the actual prompt text is a config/file
/// concern outside this module's scope (spec §1: persona text is "static
/// blobs keyed by name").
pub struct PersonaSpec {
    pub name: String,
    pub system_prompt: String,
    pub requires: PersonaRequirements,
}

pub struct PersonaTable {
    personas: HashMap<String, Persona>,
    default_name: String,
}

impl PersonaTable {
    /// Validates every enabled persona against `capabilities`, marking
    /// ineligible ones rather than rejecting them outright — they still
    /// show up in listings, just never get selected.
    pub fn build(
        specs: Vec<PersonaSpec>,
        config: &PersonasConfig,
        capabilities: &CapabilitySet,
        default_name: impl Into<String>,
    ) -> Self {
        let enabled: HashSet<&str> = config.enabled.iter().map(String::as_str).collect();
        let mut personas = HashMap::new();
        for spec in specs {
            if !enabled.is_empty() && !enabled.contains(spec.name.as_str()) {
                continue;
            }
            let eligible = capabilities.satisfies(&spec.requires);
            personas.insert(
                spec.name.clone(),
                Persona {
                    name: spec.name,
                    system_prompt: spec.system_prompt,
                    requires: spec.requires,
                    eligible,
                },
            );
        }
        Self {
            personas,
            default_name: default_name.into(),
        }
    }

    /// Resolves `requested` to a usable persona, falling back to `default`
    /// with a log entry if it's missing or ineligible (spec §4.9).
    pub fn resolve(&self, requested: Option<&str>) -> Option<&Persona> {
        if let Some(name) = requested {
            match self.personas.get(name) {
                Some(p) if p.eligible => return Some(p),
                Some(_) => warn!(persona = name, "requested persona is ineligible, falling back to default"),
                None => warn!(persona = name, "requested persona not found, falling back to default"),
            }
        }
        self.personas.get(&self.default_name)
    }

    pub fn list(&self) -> Vec<&Persona> {
        self.personas.values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, requires: PersonaRequirements) -> PersonaSpec {
        PersonaSpec {
            name: name.to_string(),
            system_prompt: format!("you are {name}"),
            requires,
        }
    }

    #[test]
    fn persona_with_satisfied_requirements_is_eligible() {
        let caps = CapabilitySet::new(vec!["memory".into()], vec!["read".into()], vec![]);
        let config = PersonasConfig {
            enabled: vec!["default".into(), "researcher".into()],
        };
        let table = PersonaTable::build(
            vec![
                spec("default", PersonaRequirements::default()),
                spec(
                    "researcher",
                    PersonaRequirements {
                        plugins: vec!["memory".into()],
                        core_tools: vec!["read".into()],
                        plugin_tools: vec![],
                    },
                ),
            ],
            &config,
            &caps,
            "default",
        );
        let resolved = table.resolve(Some("researcher")).unwrap();
        assert!(resolved.eligible);
        assert_eq!(resolved.name, "researcher");
    }

    #[test]
    fn ineligible_persona_falls_back_to_default() {
        let caps = CapabilitySet::new(vec![], vec![], vec![]);
        let config = PersonasConfig {
            enabled: vec!["default".into(), "researcher".into()],
        };
        let table = PersonaTable::build(
            vec![
                spec("default", PersonaRequirements::default()),
                spec(
                    "researcher",
                    PersonaRequirements {
                        plugins: vec!["memory".into()],
                        core_tools: vec![],
                        plugin_tools: vec![],
                    },
                ),
            ],
            &config,
            &caps,
            "default",
        );
        let resolved = table.resolve(Some("researcher")).unwrap();
        assert_eq!(resolved.name, "default");
    }

    #[test]
    fn unknown_persona_name_falls_back_to_default() {
        let caps = CapabilitySet::new(vec![], vec![], vec![]);
        let config = PersonasConfig {
            enabled: vec!["default".into()],
        };
        let table = PersonaTable::build(
            vec![spec("default", PersonaRequirements::default())],
            &config,
            &caps,
            "default",
        );
        let resolved = table.resolve(Some("does-not-exist")).unwrap();
        assert_eq!(resolved.name, "default");
    }
}

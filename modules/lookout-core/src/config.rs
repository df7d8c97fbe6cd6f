//! Two-pass config validation: a structural pass over the YAML document,
//! then per-plugin specialization through the registry. Issues accumulate
//! across the whole document and surface as one aggregated error.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::actor::Actor;
use crate::chain::{build_chain, Chain, ChainStage};
use crate::error::LookoutError;
use crate::record::shorten;
use crate::registry::{ActorBuilder, ActorSection, PluginContext, PluginRegistry};

/// One malformed field: where it is, what it was, and why it is wrong.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub path: String,
    pub value: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "error parsing \"{}\" in config section \"{}\": {}",
            self.value, self.path, self.message
        )
    }
}

/// Aggregate of every issue found in one parse. The loader reports all of
/// them at once instead of stopping at the first.
#[derive(Debug)]
pub struct ConfigError {
    pub issues: Vec<ConfigIssue>,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to process configuration file, following errors occurred:"
        )?;
        for issue in &self.issues {
            write!(f, "\n    {issue}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Structural document shape
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ConfigDocument {
    #[serde(rename = "Actors")]
    actors: BTreeMap<String, RawActorSection>,
    #[serde(rename = "Chains", default)]
    chains: BTreeMap<String, Vec<BTreeMap<String, Vec<String>>>>,
}

#[derive(Debug, Deserialize)]
struct RawActorSection {
    #[serde(default)]
    config: Map<String, Value>,
    #[serde(default)]
    defaults: Map<String, Value>,
    entities: Vec<Map<String, Value>>,
}

/// Merge defaults into each entity (entity value wins) and inject the actor
/// name into its config block.
fn flatten_actor_section(
    name: &str,
    raw: RawActorSection,
    issues: &mut Vec<ConfigIssue>,
) -> ActorSection {
    let mut config = raw.config;
    config.insert("name".to_string(), Value::String(name.to_string()));

    let mut entities = Vec::new();
    let mut seen_names: HashSet<String> = HashSet::new();
    for (i, entity) in raw.entities.into_iter().enumerate() {
        let mut merged = raw.defaults.clone();
        for (key, value) in entity {
            merged.insert(key, value);
        }
        let path = format!("Actors.{name}.entities[{i}]");
        match merged.get("name").and_then(Value::as_str) {
            Some(entity_name) => {
                if !seen_names.insert(entity_name.to_string()) {
                    issues.push(ConfigIssue {
                        path,
                        value: entity_name.to_string(),
                        message: "duplicate entity name under one actor".to_string(),
                    });
                }
            }
            None => issues.push(ConfigIssue {
                path,
                value: render_value(&Value::Object(merged.clone())),
                message: "entity is missing the required \"name\" field".to_string(),
            }),
        }
        entities.push(Value::Object(merged));
    }

    ActorSection {
        name: name.to_string(),
        config: Value::Object(config),
        entities,
    }
}

// ---------------------------------------------------------------------------
// Parse
// ---------------------------------------------------------------------------

/// Parse and validate a config document, returning the constructed actors
/// and wired chains. Every validation failure in the document is collected
/// into a single [`ConfigError`].
pub async fn parse(
    registry: &PluginRegistry,
    ctx: &PluginContext,
    text: &str,
) -> Result<(BTreeMap<String, Arc<dyn Actor>>, Vec<Chain>), LookoutError> {
    let doc: ConfigDocument = serde_yaml::from_str(text).map_err(|e| ConfigError {
        issues: vec![ConfigIssue {
            path: e
                .location()
                .map(|l| format!("line {}, column {}", l.line(), l.column()))
                .unwrap_or_else(|| "document".to_string()),
            value: String::new(),
            message: e.to_string(),
        }],
    })?;

    let mut issues = Vec::new();
    let mut actors: BTreeMap<String, Arc<dyn Actor>> = BTreeMap::new();

    for (name, raw) in doc.actors {
        let builder = match registry.get(&name) {
            Ok(builder) => builder,
            Err(e) => {
                issues.push(ConfigIssue {
                    path: format!("Actors.{name}"),
                    value: name.clone(),
                    message: e.to_string(),
                });
                continue;
            }
        };
        let section = flatten_actor_section(&name, raw, &mut issues);
        match builder.build(ctx, section).await {
            Ok(actor) => {
                actors.insert(name, actor);
            }
            Err(mut plugin_issues) => issues.append(&mut plugin_issues),
        }
    }

    let mut chain_specs: Vec<(String, Vec<ChainStage>)> = Vec::new();
    for (name, raw_stages) in doc.chains {
        let mut stages = Vec::new();
        let mut well_formed = true;
        for (i, stage) in raw_stages.into_iter().enumerate() {
            if stage.len() != 1 {
                issues.push(ConfigIssue {
                    path: format!("Chains.{name}[{i}]"),
                    value: format!("{} keys", stage.len()),
                    message: "each chain stage must be a single {actor: [entities]} mapping"
                        .to_string(),
                });
                well_formed = false;
                continue;
            }
            if let Some((actor, entities)) = stage.into_iter().next() {
                stages.push(ChainStage { actor, entities });
            }
        }
        if well_formed {
            chain_specs.push((name, stages));
        }
    }

    if !issues.is_empty() {
        return Err(ConfigError { issues }.into());
    }

    let chains = chain_specs
        .into_iter()
        .map(|(name, stages)| build_chain(&ctx.bus, &name, &stages))
        .collect();
    Ok((actors, chains))
}

// ---------------------------------------------------------------------------
// Helpers for plugin builders
// ---------------------------------------------------------------------------

fn render_value(value: &Value) -> String {
    shorten(&value.to_string(), 80)
}

/// Deserialize one section value into its typed form, recording a located
/// issue on failure.
pub fn parse_value<T: DeserializeOwned>(
    value: &Value,
    path: &str,
    issues: &mut Vec<ConfigIssue>,
) -> Option<T> {
    match serde_json::from_value(value.clone()) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            issues.push(ConfigIssue {
                path: path.to_string(),
                value: render_value(value),
                message: e.to_string(),
            });
            None
        }
    }
}

/// Typed view of the actor's config block.
pub fn parse_config<C: DeserializeOwned>(
    section: &ActorSection,
    issues: &mut Vec<ConfigIssue>,
) -> Option<C> {
    parse_value(
        &section.config,
        &format!("Actors.{}.config", section.name),
        issues,
    )
}

/// Typed view of every entity, each with its own located issue on failure.
pub fn parse_entities<E: DeserializeOwned>(
    section: &ActorSection,
    issues: &mut Vec<ConfigIssue>,
) -> Vec<E> {
    section
        .entities
        .iter()
        .enumerate()
        .filter_map(|(i, value)| {
            parse_value(
                value,
                &format!("Actors.{}.entities[{i}]", section.name),
                issues,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{ActorConfig, FilterActor, Matcher, Named};
    use crate::bus::MessageBus;
    use crate::record::Record;
    use async_trait::async_trait;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct PatternEntity {
        name: String,
        #[allow(dead_code)]
        patterns: Vec<String>,
    }

    impl Named for PatternEntity {
        fn name(&self) -> &str {
            &self.name
        }
    }

    #[derive(Default)]
    struct PassAll;

    impl Matcher for PassAll {
        type Entity = PatternEntity;

        fn evaluate(&self, _entity: &PatternEntity, record: &Record) -> Option<Record> {
            Some(record.clone())
        }
    }

    struct PatternFilterBuilder;

    #[async_trait]
    impl crate::registry::ActorBuilder for PatternFilterBuilder {
        async fn build(
            &self,
            ctx: &PluginContext,
            section: ActorSection,
        ) -> Result<Arc<dyn Actor>, Vec<ConfigIssue>> {
            let mut issues = Vec::new();
            let conf: Option<ActorConfig> = parse_config(&section, &mut issues);
            let entities: Vec<PatternEntity> = parse_entities(&section, &mut issues);
            if !issues.is_empty() {
                return Err(issues);
            }
            let conf = conf.expect("no issues means the config parsed");
            Ok(FilterActor::create(ctx.bus.clone(), conf, entities, PassAll))
        }
    }

    fn test_registry() -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        registry.register("filter.pattern", Box::new(PatternFilterBuilder));
        registry
    }

    fn test_ctx() -> PluginContext {
        PluginContext {
            bus: Arc::new(MessageBus::new()),
        }
    }

    #[tokio::test]
    async fn valid_config_builds_actors_and_chains() {
        let text = r#"
Actors:
  filter.pattern:
    defaults:
      patterns: ["x"]
    entities:
      - name: one
      - name: two
        patterns: ["y"]
Chains:
  main:
    - filter.pattern: [one]
    - filter.pattern: [two]
"#;
        let registry = test_registry();
        let ctx = test_ctx();
        let (actors, chains) = parse(&registry, &ctx, text).await.unwrap();
        assert_eq!(actors.len(), 1);
        assert_eq!(chains.len(), 1);
        assert!(actors["filter.pattern"].has_entity("one"));
        assert!(actors["filter.pattern"].has_entity("two"));
        // The chain subscribed a forwarder on the producer's outgoing topic.
        assert_eq!(
            ctx.bus.subscriber_count("output/filter.pattern/one"),
            1
        );
    }

    #[tokio::test]
    async fn all_malformed_entities_reported_in_one_error() {
        let text = r#"
Actors:
  filter.pattern:
    entities:
      - name: one
      - name: two
"#;
        let registry = test_registry();
        let err = parse(&registry, &test_ctx(), text).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("entities[0]"), "{message}");
        assert!(message.contains("entities[1]"), "{message}");
        assert!(message.contains("patterns"), "{message}");
    }

    #[tokio::test]
    async fn unknown_plugin_and_duplicate_entity_are_issues() {
        let text = r#"
Actors:
  no.such.plugin:
    entities:
      - name: a
  filter.pattern:
    defaults:
      patterns: []
    entities:
      - name: same
      - name: same
"#;
        let registry = test_registry();
        let err = parse(&registry, &test_ctx(), text).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("no.such.plugin"), "{message}");
        assert!(message.contains("duplicate entity name"), "{message}");
    }

    #[tokio::test]
    async fn multi_key_chain_stage_is_rejected() {
        let text = r#"
Actors:
  filter.pattern:
    defaults:
      patterns: []
    entities:
      - name: one
Chains:
  broken:
    - filter.pattern: [one]
      other: [two]
    - filter.pattern: [one]
"#;
        let registry = test_registry();
        let err = parse(&registry, &test_ctx(), text).await.unwrap_err();
        assert!(err.to_string().contains("single"), "{err}");
    }

    #[tokio::test]
    async fn defaults_merge_with_entity_winning() {
        let text = r#"
Actors:
  filter.pattern:
    defaults:
      patterns: ["default"]
    entities:
      - name: uses-default
      - name: overrides
        patterns: ["own"]
"#;
        let registry = test_registry();
        let ctx = test_ctx();
        let (actors, _) = parse(&registry, &ctx, text).await.unwrap();
        assert!(actors["filter.pattern"].has_entity("uses-default"));
        assert!(actors["filter.pattern"].has_entity("overrides"));
    }
}

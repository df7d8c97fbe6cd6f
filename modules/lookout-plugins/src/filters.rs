//! Built-in filters: pass, drop, substring match/exclude, event-type and
//! record-type gates, JSON rendering and `{field}` formatting.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use lookout_core::config::{parse_config, parse_entities};
use lookout_core::template::expand_placeholders;
use lookout_core::{
    Actor, ActorBuilder, ActorConfig, ActorSection, ConfigIssue, EventType, FilterActor, Matcher,
    Named, PluginContext, PluginRegistry, Record,
};

pub fn register(registry: &mut PluginRegistry) {
    registry.register("filter.noop", Box::new(FilterBuilder::<NoopFilter>::new()));
    registry.register("filter.void", Box::new(FilterBuilder::<VoidFilter>::new()));
    registry.register("filter.match", Box::new(FilterBuilder::<MatchFilter>::new()));
    registry.register(
        "filter.exclude",
        Box::new(FilterBuilder::<ExcludeFilter>::new()),
    );
    registry.register("filter.event", Box::new(FilterBuilder::<EventFilter>::new()));
    registry.register("filter.type", Box::new(FilterBuilder::<TypeFilter>::new()));
    registry.register("filter.json", Box::new(FilterBuilder::<JsonFilter>::new()));
    registry.register("filter.format", Box::new(FilterBuilder::<FormatFilter>::new()));
}

/// Shared builder for filters: parse the config and entity sections into
/// the matcher's typed forms, then hand them to the generic filter driver.
struct FilterBuilder<M> {
    _marker: PhantomData<fn() -> M>,
}

impl<M> FilterBuilder<M> {
    fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<M> ActorBuilder for FilterBuilder<M>
where
    M: Matcher + Default,
    M::Entity: DeserializeOwned,
{
    async fn build(
        &self,
        ctx: &PluginContext,
        section: ActorSection,
    ) -> Result<Arc<dyn Actor>, Vec<ConfigIssue>> {
        let mut issues = Vec::new();
        let conf: Option<ActorConfig> = parse_config(&section, &mut issues);
        let entities: Vec<M::Entity> = parse_entities(&section, &mut issues);
        match (conf, issues.is_empty()) {
            (Some(conf), true) => {
                let actor: Arc<dyn Actor> =
                    FilterActor::create(ctx.bus.clone(), conf, entities, M::default());
                Ok(actor)
            }
            _ => Err(issues),
        }
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct EmptyFilterEntity {
    pub name: String,
}

impl Named for EmptyFilterEntity {
    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatchFilterEntity {
    pub name: String,
    pub patterns: Vec<String>,
}

impl Named for MatchFilterEntity {
    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventFilterEntity {
    pub name: String,
    #[serde(default)]
    pub event_types: Option<Vec<EventType>>,
}

impl Named for EventFilterEntity {
    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TypeFilterEntity {
    pub name: String,
    pub types: Vec<String>,
    #[serde(default)]
    pub exact_match: bool,
}

impl Named for TypeFilterEntity {
    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonFilterEntity {
    pub name: String,
    #[serde(default)]
    pub prettify: bool,
}

impl Named for JsonFilterEntity {
    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FormatFilterEntity {
    pub name: String,
    pub fmt: String,
    #[serde(default)]
    pub missing: String,
}

impl Named for FormatFilterEntity {
    fn name(&self) -> &str {
        &self.name
    }
}

// ---------------------------------------------------------------------------
// Matchers
// ---------------------------------------------------------------------------

/// Pass every record through unchanged.
#[derive(Default)]
pub struct NoopFilter;

impl Matcher for NoopFilter {
    type Entity = EmptyFilterEntity;

    fn evaluate(&self, _entity: &EmptyFilterEntity, record: &Record) -> Option<Record> {
        Some(record.clone())
    }
}

/// Drop every record.
#[derive(Default)]
pub struct VoidFilter;

impl Matcher for VoidFilter {
    type Entity = EmptyFilterEntity;

    fn evaluate(&self, _entity: &EmptyFilterEntity, _record: &Record) -> Option<Record> {
        None
    }
}

/// Pass records whose text form contains any of the patterns.
#[derive(Default)]
pub struct MatchFilter;

impl Matcher for MatchFilter {
    type Entity = MatchFilterEntity;

    fn evaluate(&self, entity: &MatchFilterEntity, record: &Record) -> Option<Record> {
        let text = record.display();
        entity
            .patterns
            .iter()
            .any(|pattern| text.contains(pattern.as_str()))
            .then(|| record.clone())
    }
}

/// Pass records whose text form contains none of the patterns.
#[derive(Default)]
pub struct ExcludeFilter;

impl Matcher for ExcludeFilter {
    type Entity = MatchFilterEntity;

    fn evaluate(&self, entity: &MatchFilterEntity, record: &Record) -> Option<Record> {
        let text = record.display();
        entity
            .patterns
            .iter()
            .all(|pattern| !text.contains(pattern.as_str()))
            .then(|| record.clone())
    }
}

/// Pass events, optionally restricted to a set of event types.
#[derive(Default)]
pub struct EventFilter;

impl Matcher for EventFilter {
    type Entity = EventFilterEntity;

    fn evaluate(&self, entity: &EventFilterEntity, record: &Record) -> Option<Record> {
        let Record::Event(event) = record else {
            return None;
        };
        match &entity.event_types {
            None => Some(record.clone()),
            Some(types) => types.contains(&event.event_type).then(|| record.clone()),
        }
    }
}

/// Pass records whose class name, or any declared ancestor name, is in the
/// allowed list.
#[derive(Default)]
pub struct TypeFilter;

impl Matcher for TypeFilter {
    type Entity = TypeFilterEntity;

    fn evaluate(&self, entity: &TypeFilterEntity, record: &Record) -> Option<Record> {
        let tested: Vec<&str> = if entity.exact_match {
            vec![record.class_name()]
        } else {
            record.ancestry().to_vec()
        };
        tested
            .iter()
            .any(|tested| entity.types.iter().any(|allowed| allowed == tested))
            .then(|| record.clone())
    }
}

/// Render the record as canonical JSON in a text record. A record whose
/// text form is already valid JSON is normalized instead of double-encoded.
#[derive(Default)]
pub struct JsonFilter;

impl Matcher for JsonFilter {
    type Entity = JsonFilterEntity;

    fn evaluate(&self, entity: &JsonFilterEntity, record: &Record) -> Option<Record> {
        let text = record.display();
        let json = match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(value) if entity.prettify => {
                serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
            }
            Ok(value) => value.to_string(),
            Err(_) if entity.prettify => record.pretty_json(),
            Err(_) => record.canonical_json(),
        };
        Some(Record::text(json))
    }
}

/// Substitute `{field}` placeholders from the record's fields.
#[derive(Default)]
pub struct FormatFilter;

impl Matcher for FormatFilter {
    type Entity = FormatFilterEntity;

    fn evaluate(&self, entity: &FormatFilterEntity, record: &Record) -> Option<Record> {
        Some(Record::text(expand_placeholders(
            &entity.fmt,
            record,
            &entity.missing,
        )))
    }
}

//! Actor lifecycle and dispatch: per-entity subscription to an incoming
//! topic, typed handler invocation inside a failure boundary, publication
//! on an outgoing topic.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::bus::MessageBus;
use crate::record::{Record, RecordKind};

/// Shared per-actor parameters. Plugin configs embed at least the actor
/// name, which the config loader injects from the section key.
#[derive(Debug, Clone, Deserialize)]
pub struct ActorConfig {
    pub name: String,
}

/// Entity configs expose their name so actors can key state by it.
pub trait Named {
    fn name(&self) -> &str;
}

/// A named processing unit: monitor, filter or action.
///
/// Constructors subscribe the dispatcher to each entity's incoming topic
/// (via [`connect`]); `handle` is the plugin hook invoked inside the
/// dispatch failure boundary; `run` is the long-running driver and defaults
/// to an immediate return for passive actors.
#[async_trait]
pub trait Actor: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn entity_names(&self) -> Vec<String>;

    fn has_entity(&self, entity: &str) -> bool {
        self.entity_names().iter().any(|name| name == entity)
    }

    /// Record variants this actor's handler accepts. Records of other kinds
    /// are forwarded down the chain untouched before the handler runs.
    fn supported_kinds(&self) -> &'static [RecordKind] {
        RecordKind::ALL
    }

    fn handle(&self, entity: &str, record: &Record) -> anyhow::Result<()>;

    async fn run(self: Arc<Self>) {}
}

impl std::fmt::Debug for dyn Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Actor").field("name", &self.name()).finish()
    }
}

/// Subscribe the dispatch boundary to each of the actor's incoming topics.
/// Called exactly once per actor, at construction.
pub fn connect(bus: &Arc<MessageBus>, actor: Arc<dyn Actor>) {
    for entity in actor.entity_names() {
        let topic = MessageBus::incoming_topic_for(actor.name(), &entity);
        let label = format!("{}.dispatch", actor.name());
        let bus_cb = Arc::clone(bus);
        let actor_cb = Arc::clone(&actor);
        bus.subscribe(&topic, label, move |topic, record| {
            dispatch(&bus_cb, actor_cb.as_ref(), topic, record);
        });
    }
}

fn dispatch(bus: &MessageBus, actor: &dyn Actor, topic: &str, record: &Record) {
    let Some((_, _, entity)) = MessageBus::split_message_topic(topic) else {
        error!(topic, "failed to split message topic");
        return;
    };
    if !actor.has_entity(entity) {
        warn!(
            topic,
            actor = actor.name(),
            record = %record.debug(),
            "received record for unknown entity, dropping"
        );
        return;
    }
    if !actor.supported_kinds().contains(&record.kind()) {
        debug!(
            actor = actor.name(),
            class = record.class_name(),
            record = %record.debug(),
            "forwarding record with unsupported type down the chain"
        );
        emit(bus, actor.name(), entity, record);
    }
    if let Err(e) = actor.handle(entity, record) {
        error!(
            actor = actor.name(),
            entity,
            record = %record.debug(),
            error = %e,
            "error while processing record"
        );
    }
}

/// Publish a record on the actor's outgoing topic for the given entity.
pub fn emit(bus: &MessageBus, actor: &str, entity: &str, record: &Record) {
    bus.publish(&MessageBus::outgoing_topic_for(actor, entity), record);
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// The filter seam: take a record and return it (possibly transformed) if
/// it matches the entity's condition, else `None` to drop it.
pub trait Matcher: Send + Sync + 'static {
    type Entity: Named + Send + Sync + 'static;

    fn evaluate(&self, entity: &Self::Entity, record: &Record) -> Option<Record>;
}

/// Generic driver for filters: emits when the matcher returns a record,
/// silently drops otherwise.
pub struct FilterActor<M: Matcher> {
    conf: ActorConfig,
    bus: Arc<MessageBus>,
    entities: HashMap<String, M::Entity>,
    matcher: M,
}

impl<M: Matcher> FilterActor<M> {
    pub fn create(
        bus: Arc<MessageBus>,
        conf: ActorConfig,
        entities: Vec<M::Entity>,
        matcher: M,
    ) -> Arc<Self> {
        let entities = entities
            .into_iter()
            .map(|entity| (entity.name().to_string(), entity))
            .collect();
        let actor = Arc::new(Self {
            conf,
            bus: Arc::clone(&bus),
            entities,
            matcher,
        });
        connect(&bus, actor.clone());
        actor
    }
}

#[async_trait]
impl<M: Matcher> Actor for FilterActor<M> {
    fn name(&self) -> &str {
        &self.conf.name
    }

    fn entity_names(&self) -> Vec<String> {
        self.entities.keys().cloned().collect()
    }

    fn has_entity(&self, entity: &str) -> bool {
        self.entities.contains_key(entity)
    }

    fn handle(&self, entity: &str, record: &Record) -> anyhow::Result<()> {
        let Some(entity_conf) = self.entities.get(entity) else {
            return Ok(());
        };
        match self.matcher.evaluate(entity_conf, record) {
            Some(filtered) => emit(&self.bus, self.name(), entity, &filtered),
            None => debug!(
                filter = self.name(),
                entity,
                record = %record.debug(),
                "record dropped on filter"
            ),
        }
        Ok(())
    }
}

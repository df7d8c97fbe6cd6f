//! Plugin registry: a name → actor-builder table populated during the
//! load phase at startup.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::actor::Actor;
use crate::bus::MessageBus;
use crate::config::ConfigIssue;
use crate::error::LookoutError;

/// Dependencies handed to builders at construction time. Injecting the bus
/// here keeps it substitutable in tests.
#[derive(Clone)]
pub struct PluginContext {
    pub bus: Arc<MessageBus>,
}

/// A flattened actor section from the config document: defaults already
/// merged into each entity, the actor name injected into `config`.
#[derive(Debug, Clone)]
pub struct ActorSection {
    pub name: String,
    pub config: serde_json::Value,
    pub entities: Vec<serde_json::Value>,
}

/// One registered plugin. The builder owns both validation halves,
/// deserializing the generic config and entity sections into its typed
/// forms, and returns the constructed, already-subscribed actor.
#[async_trait]
pub trait ActorBuilder: Send + Sync {
    async fn build(
        &self,
        ctx: &PluginContext,
        section: ActorSection,
    ) -> Result<Arc<dyn Actor>, Vec<ConfigIssue>>;
}

impl std::fmt::Debug for dyn ActorBuilder + '_ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorBuilder").finish()
    }
}

#[derive(Default)]
pub struct PluginRegistry {
    entries: BTreeMap<String, Box<dyn ActorBuilder>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, builder: Box<dyn ActorBuilder>) {
        self.entries.insert(name.to_string(), builder);
    }

    pub fn get(&self, name: &str) -> Result<&dyn ActorBuilder, LookoutError> {
        match self.entries.get(name) {
            Some(builder) => Ok(builder.as_ref()),
            None => Err(LookoutError::UnknownPlugin {
                name: name.to_string(),
                known: self.known_names().join(", "),
            }),
        }
    }

    pub fn known_names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn log_loaded(&self) {
        info!(plugins = %self.known_names().join(", "), "plugins loaded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_plugin_error_lists_known_names() {
        struct Dummy;

        #[async_trait]
        impl ActorBuilder for Dummy {
            async fn build(
                &self,
                _ctx: &PluginContext,
                _section: ActorSection,
            ) -> Result<Arc<dyn Actor>, Vec<ConfigIssue>> {
                Err(vec![])
            }
        }

        let mut registry = PluginRegistry::new();
        registry.register("filter.noop", Box::new(Dummy));
        registry.register("generic_rss", Box::new(Dummy));

        let err = registry.get("no_such").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("no_such"));
        assert!(message.contains("filter.noop"));
        assert!(message.contains("generic_rss"));
    }
}

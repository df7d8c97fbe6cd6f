//! `get_url`: fetch a page on an interval and emit its body as a text
//! record whenever the content changes.

use std::sync::Arc;

use async_trait::async_trait;

use lookout_core::config::{parse_config, parse_entities};
use lookout_core::{
    Actor, ActorBuilder, ActorSection, ConfigIssue, FeedEntity, FeedMonitor, FeedMonitorConfig,
    FeedSource, PluginContext, PluginRegistry, Record,
};

pub fn register(registry: &mut PluginRegistry) {
    registry.register("get_url", Box::new(UrlMonitorBuilder));
}

/// One logical record per entity: the page itself. A changed body shows up
/// as an update of that record and re-emits; an unchanged body is dropped
/// by the store, and first-run priming keeps a fresh entity quiet.
pub struct UrlSource;

impl FeedSource for UrlSource {
    fn parse(&self, _entity: &FeedEntity, body: &str) -> anyhow::Result<Vec<Record>> {
        Ok(vec![Record::text(body)])
    }

    fn record_id(&self, _record: &Record) -> String {
        "page".to_string()
    }
}

struct UrlMonitorBuilder;

#[async_trait]
impl ActorBuilder for UrlMonitorBuilder {
    async fn build(
        &self,
        ctx: &PluginContext,
        section: ActorSection,
    ) -> Result<Arc<dyn Actor>, Vec<ConfigIssue>> {
        let mut issues = Vec::new();
        let conf: Option<FeedMonitorConfig> = parse_config(&section, &mut issues);
        let entities: Vec<FeedEntity> = parse_entities(&section, &mut issues);
        let (Some(conf), true) = (conf, issues.is_empty()) else {
            return Err(issues);
        };
        let db_path = conf.db_path.clone();
        let section_name = section.name.clone();
        match FeedMonitor::create(ctx.bus.clone(), conf, entities, UrlSource).await {
            Ok(monitor) => Ok(monitor as Arc<dyn Actor>),
            Err(e) => Err(vec![ConfigIssue {
                path: format!("Actors.{section_name}.config.db_path"),
                value: db_path,
                message: e.to_string(),
            }]),
        }
    }
}

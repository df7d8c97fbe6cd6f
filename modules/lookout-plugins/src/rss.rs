//! `generic_rss`: RSS/Atom feed monitoring on top of the store-backed
//! feed-monitor pipeline.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use lookout_core::config::{parse_config, parse_entities};
use lookout_core::{
    Actor, ActorBuilder, ActorSection, ConfigIssue, FeedEntity, FeedMonitor, FeedMonitorConfig,
    FeedRecord, FeedSource, PluginContext, PluginRegistry, Record,
};

pub fn register(registry: &mut PluginRegistry) {
    registry.register("generic_rss", Box::new(RssMonitorBuilder));
}

pub struct RssSource;

impl FeedSource for RssSource {
    fn parse(&self, entity: &FeedEntity, body: &str) -> anyhow::Result<Vec<Record>> {
        let feed = feed_rs::parser::parse(body.as_bytes()).context("failed to parse RSS/Atom feed")?;
        if feed.entries.is_empty() {
            anyhow::bail!("feed has no entries, probably broken");
        }
        let mut records = Vec::new();
        for entry in feed.entries {
            match parse_entry(entry, body) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(entity = %entity.name, error = %e, "failed to build record from feed entry, skipping");
                }
            }
        }
        Ok(records)
    }

    fn record_id(&self, record: &Record) -> String {
        match record {
            Record::Feed(feed) => feed.uid.clone(),
            other => other.content_hash(),
        }
    }
}

fn parse_entry(entry: feed_rs::model::Entry, body: &str) -> anyhow::Result<Record> {
    let url = entry
        .links
        .first()
        .map(|link| link.href.clone())
        .unwrap_or_default();
    let title = entry
        .title
        .as_ref()
        .map(|t| t.content.clone())
        .unwrap_or_default();
    let summary = entry
        .summary
        .as_ref()
        .map(|t| t.content.clone())
        .unwrap_or_default();
    let author = entry
        .authors
        .first()
        .map(|person| person.name.clone())
        .unwrap_or_default();
    let published: DateTime<Utc> = entry
        .published
        .or(entry.updated)
        .context("entry has neither published nor updated date")?;

    let uid = entry_uid(&entry.id, body, &url, &title, &summary);

    Ok(Record::Feed(FeedRecord {
        uid,
        url,
        summary,
        author,
        title,
        published,
        updated: entry.updated,
        extra: serde_json::Map::new(),
    }))
}

/// Duplicate-detection ladder: the feed's own guid/id when the source
/// actually carries one, else link plus title-or-summary, else a content
/// hash. The parser synthesizes an id for entries without a guid, so an id
/// that never occurs in the raw body is ignored.
fn entry_uid(id: &str, body: &str, url: &str, title: &str, summary: &str) -> String {
    if !id.is_empty() && body.contains(id) {
        return id.to_string();
    }
    if !url.is_empty() || !title.is_empty() || !summary.is_empty() {
        let tail = if !title.is_empty() { title } else { summary };
        return format!("{url}{tail}");
    }
    Record::text(format!("{url}{title}{summary}")).content_hash()
}

struct RssMonitorBuilder;

#[async_trait]
impl ActorBuilder for RssMonitorBuilder {
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
        match FeedMonitor::create(ctx.bus.clone(), conf, entities, RssSource).await {
            Ok(monitor) => Ok(monitor as Arc<dyn Actor>),
            Err(e) => Err(vec![ConfigIssue {
                path: format!("Actors.{section_name}.config.db_path"),
                value: db_path,
                message: e.to_string(),
            }]),
        }
    }
}

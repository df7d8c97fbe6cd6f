//! Store-backed HTTP feed monitoring: conditional requests, adaptive
//! polling intervals, failure backoff and cross-restart de-duplication.
//! The site-specific parser plugs in through [`FeedSource`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::actor::{connect, emit, Actor, Named};
use crate::bus::MessageBus;
use crate::error::Result;
use crate::http::{conditional_fetch, SessionPool};
use crate::monitor::{run_polling, EntityState, PollEntry, Poller};
use crate::record::{shorten, Record};
use crate::store::{PersistedRow, RecordStore, MEMORY_PATH};

fn default_db_path() -> String {
    MEMORY_PATH.to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedMonitorConfig {
    pub name: String,
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedEntity {
    pub name: String,
    pub url: String,
    /// Configured poll cadence in seconds; the live value drifts under
    /// adaptation and backoff.
    pub update_interval: f64,
    #[serde(default = "default_true")]
    pub adjust_update_interval: bool,
    #[serde(default)]
    pub cookies_file: Option<PathBuf>,
}

impl Named for FeedEntity {
    fn name(&self) -> &str {
        &self.name
    }
}

impl FeedEntity {
    pub fn base_interval(&self) -> Duration {
        Duration::from_secs_f64(self.update_interval)
    }
}

/// The parser seam for feed monitors.
pub trait FeedSource: Send + Sync + 'static {
    /// Parse a fetched body into records, both old and new.
    fn parse(&self, entity: &FeedEntity, body: &str) -> anyhow::Result<Vec<Record>>;

    /// A string that uniquely identifies a record even if its content has
    /// changed.
    fn record_id(&self, record: &Record) -> String;

    /// Whether a known record whose content changed is emitted again.
    /// Updated records are persisted either way.
    fn emit_updates(&self) -> bool {
        true
    }
}

pub struct FeedMonitor<S: FeedSource> {
    conf: FeedMonitorConfig,
    bus: Arc<MessageBus>,
    entities: HashMap<String, FeedEntity>,
    order: Vec<String>,
    store: RecordStore,
    sessions: SessionPool,
    source: S,
}

impl<S: FeedSource> FeedMonitor<S> {
    pub async fn create(
        bus: Arc<MessageBus>,
        conf: FeedMonitorConfig,
        entities: Vec<FeedEntity>,
        source: S,
    ) -> Result<Arc<Self>> {
        let store = RecordStore::open(&conf.db_path).await?;
        let order: Vec<String> = entities.iter().map(|e| e.name.clone()).collect();
        let entities = entities
            .into_iter()
            .map(|entity| (entity.name.clone(), entity))
            .collect();
        let monitor = Arc::new(Self {
            conf,
            bus: Arc::clone(&bus),
            entities,
            order,
            store,
            sessions: SessionPool::new(),
            source,
        });
        connect(&bus, monitor.clone());
        Ok(monitor)
    }

    pub fn record_store(&self) -> &RecordStore {
        &self.store
    }

    fn uid_for(&self, record: &Record, entity: &str) -> String {
        format!("{}:{}", entity, self.source.record_id(record))
    }

    async fn store_record(&self, record: &Record, entity: &str) -> Result<()> {
        let row = PersistedRow {
            parsed_at: Utc::now(),
            feed_name: entity.to_string(),
            uid: self.uid_for(record, entity),
            hashsum: record.content_hash(),
            class_name: record.class_name().to_string(),
            as_json: record.canonical_json(),
        };
        self.store.store(&row).await
    }

    /// Run every record through the new/updated predicates, persisting as
    /// needed. Returns the records to emit: the new ones, plus updated ones
    /// when the source re-emits updates.
    pub async fn store_and_filter(&self, records: &[Record], entity: &str) -> Result<Vec<Record>> {
        let mut fresh = Vec::new();
        for record in records {
            let uid = self.uid_for(record, entity);
            let hashsum = record.content_hash();
            if !self.store.exists(&uid, None).await? {
                debug!(entity, uid, hash = &hashsum[..5], "fetched record is new");
                self.store_record(record, entity).await?;
                fresh.push(record.clone());
            } else if !self.store.exists(&uid, Some(&hashsum)).await? {
                let stored = self.store.fetch(&uid, None).await?;
                debug!(
                    entity,
                    uid,
                    new_hash = &hashsum[..5],
                    old_hash = stored.as_ref().map(|r| &r.hashsum[..5]).unwrap_or("?????"),
                    "record already exists but has changed, storing new version"
                );
                self.store_record(record, entity).await?;
                if self.source.emit_updates() {
                    fresh.push(record.clone());
                }
            }
        }
        Ok(fresh)
    }

    async fn poll_entity(&self, name: &str, state: &mut EntityState) -> anyhow::Result<Vec<Record>> {
        let entity = self
            .entities
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("no entity named \"{name}\""))?;
        let client = self.sessions.client_for(entity.cookies_file.as_deref());
        let Some(body) = conditional_fetch(
            &client,
            name,
            &entity.url,
            entity.adjust_update_interval,
            state,
        )
        .await
        else {
            return Ok(Vec::new());
        };
        let records = match self.source.parse(entity, &body) {
            Ok(records) => records,
            Err(e) => {
                warn!(
                    entity = name,
                    url = %entity.url,
                    error = %e,
                    payload = %shorten(&body, 200),
                    "failed to parse response, dropping"
                );
                return Ok(Vec::new());
            }
        };
        let fresh = self.store_and_filter(&records, name).await?;
        Ok(fresh)
    }
}

#[async_trait]
impl<S: FeedSource> Actor for FeedMonitor<S> {
    fn name(&self) -> &str {
        &self.conf.name
    }

    fn entity_names(&self) -> Vec<String> {
        self.order.clone()
    }

    fn has_entity(&self, entity: &str) -> bool {
        self.entities.contains_key(entity)
    }

    /// Records arriving from a chain pass straight through to the outgoing
    /// topic.
    fn handle(&self, entity: &str, record: &Record) -> anyhow::Result<()> {
        emit(&self.bus, self.name(), entity, record);
        Ok(())
    }

    async fn run(self: Arc<Self>) {
        let bus = Arc::clone(&self.bus);
        if let Err(e) = run_polling(self.clone(), bus).await {
            tracing::error!(actor = self.name(), error = %e, "monitor terminated");
        }
    }
}

#[async_trait]
impl<S: FeedSource> Poller for FeedMonitor<S> {
    type State = EntityState;

    fn actor_name(&self) -> &str {
        &self.conf.name
    }

    fn poll_entries(&self) -> Vec<PollEntry> {
        self.order
            .iter()
            .map(|name| PollEntry {
                name: name.clone(),
                interval: self.entities[name].base_interval(),
            })
            .collect()
    }

    fn initial_state(&self, entry: &PollEntry) -> EntityState {
        EntityState::new(entry.interval)
    }

    async fn poll(&self, entity: &str, state: &mut EntityState) -> anyhow::Result<Vec<Record>> {
        self.poll_entity(entity, state).await
    }

    /// First-run priming: an entity with an empty DB partition gets one
    /// fetch-and-store cycle without emitting, so a freshly configured feed
    /// does not flood the chain with "new" records.
    async fn prime(&self) -> anyhow::Result<()> {
        for name in &self.order {
            let entity = &self.entities[name];
            let size = self.store.size(Some(name)).await?;
            if size == 0 {
                info!(
                    entity = %name,
                    db = %self.conf.db_path,
                    "database has no records for entity, assuming first run"
                );
                let mut state = EntityState::new(entity.base_interval());
                self.poll_entity(name, &mut state).await?;
            } else {
                info!(entity = %name, records = size, "records stored in database");
            }
        }
        Ok(())
    }
}

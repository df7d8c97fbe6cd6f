//! `webhook`: deliver records to an HTTP webhook in batches, honoring the
//! server's rate-limit hints.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use lookout_core::config::{parse_config, parse_entities};
use lookout_core::record::shorten;
use lookout_core::{
    connect, Actor, ActorBuilder, ActorConfig, ActorSection, ConfigIssue, MessageBus, Named,
    PluginContext, PluginRegistry, Record,
};

pub fn register(registry: &mut PluginRegistry) {
    registry.register("webhook", Box::new(WebhookBuilder));
}

const RECORDS_PER_MESSAGE: usize = 10;
/// Wait between batches: one message per `RECORDS_PER_MESSAGE`th of a minute.
const BATCH_WAIT: Duration = Duration::from_secs(60 / RECORDS_PER_MESSAGE as u64);
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(6);
const TITLE_MAX_LEN: usize = 256;
const DESCRIPTION_MAX_LEN: usize = 4096;

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEntity {
    pub name: String,
    pub url: String,
}

impl Named for WebhookEntity {
    fn name(&self) -> &str {
        &self.name
    }
}

pub struct WebhookAction {
    conf: ActorConfig,
    entities: HashMap<String, WebhookEntity>,
    senders: HashMap<String, mpsc::UnboundedSender<Record>>,
    receivers: Mutex<Vec<(String, mpsc::UnboundedReceiver<Record>)>>,
}

impl WebhookAction {
    pub fn create(
        bus: Arc<MessageBus>,
        conf: ActorConfig,
        entities: Vec<WebhookEntity>,
    ) -> Arc<Self> {
        let mut senders = HashMap::new();
        let mut receivers = Vec::new();
        for entity in &entities {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(entity.name.clone(), tx);
            receivers.push((entity.name.clone(), rx));
        }
        let entities = entities
            .into_iter()
            .map(|entity| (entity.name.clone(), entity))
            .collect();
        let action = Arc::new(Self {
            conf,
            entities,
            senders,
            receivers: Mutex::new(receivers),
        });
        connect(&bus, action.clone());
        action
    }
}

#[async_trait]
impl Actor for WebhookAction {
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
        if let Some(sender) = self.senders.get(entity) {
            if sender.send(record.clone()).is_err() {
                warn!(entity, "webhook delivery task is gone, dropping record");
            }
        }
        Ok(())
    }

    async fn run(self: Arc<Self>) {
        let receivers = std::mem::take(
            &mut *self.receivers.lock().expect("webhook receivers lock poisoned"),
        );
        let mut tasks = Vec::new();
        for (name, receiver) in receivers {
            let entity = self.entities[&name].clone();
            tasks.push(tokio::spawn(deliver_loop(entity, receiver)));
        }
        futures::future::join_all(tasks).await;
    }
}

async fn deliver_loop(entity: WebhookEntity, mut receiver: mpsc::UnboundedReceiver<Record>) {
    let client = reqwest::Client::builder()
        .timeout(lookout_core::http::DEFAULT_REQUEST_TIMEOUT)
        .build()
        .expect("failed to build HTTP client");

    let mut pending: Vec<Record> = Vec::new();
    loop {
        while pending.len() < RECORDS_PER_MESSAGE {
            match tokio::time::timeout(BATCH_WAIT, receiver.recv()).await {
                Ok(Some(record)) => pending.push(record),
                Ok(None) => return,
                Err(_) => break,
            }
        }
        if pending.is_empty() {
            continue;
        }
        let message = format_message(&pending);
        let (success, delay) = send(&client, &entity.url, &message).await;
        if success {
            pending.clear();
        }
        tokio::time::sleep(delay).await;
    }
}

/// Post one message; on failure the caller keeps the batch. The returned
/// delay is the server's rate-limit suggestion, or zero.
async fn send(
    client: &reqwest::Client,
    url: &str,
    message: &serde_json::Value,
) -> (bool, Duration) {
    let response = match client.post(url).json(message).send().await {
        Ok(response) => response,
        Err(e) => {
            warn!(url, error = %e, "webhook request failed");
            return (false, DEFAULT_RETRY_DELAY);
        }
    };
    let success = response.status().is_success();
    if !success {
        debug!(url, status = %response.status(), "webhook returned error status");
    }

    let headers = response.headers();
    let suggested = if let Some(value) = headers.get("Retry-After") {
        debug!(url, "Retry-After header present");
        Some(value)
    } else if headers
        .get("X-RateLimit-Remaining")
        .and_then(|v| v.to_str().ok())
        == Some("0")
    {
        headers.get("X-RateLimit-Reset-After")
    } else {
        None
    };

    let delay = match suggested {
        None => Duration::ZERO,
        Some(value) => match value.to_str().ok().and_then(|v| v.trim().parse::<u64>().ok()) {
            Some(seconds) => Duration::from_secs(seconds),
            None => {
                debug!(url, "failed to parse rate-limit delay, using default");
                DEFAULT_RETRY_DELAY
            }
        },
    };
    (success, delay)
}

/// Render records as webhook embeds: first line becomes the title, the
/// rest the description.
fn format_message(records: &[Record]) -> serde_json::Value {
    let embeds: Vec<serde_json::Value> = records
        .iter()
        .map(|record| {
            let text = record.display();
            let (title, description) = match text.split_once('\n') {
                Some((title, description)) => (title.to_string(), description.to_string()),
                None => (String::new(), text),
            };
            serde_json::json!({
                "title": shorten(&title, TITLE_MAX_LEN),
                "description": shorten(&description, DESCRIPTION_MAX_LEN),
            })
        })
        .collect();
    serde_json::json!({ "content": null, "embeds": embeds })
}

struct WebhookBuilder;

#[async_trait]
impl ActorBuilder for WebhookBuilder {
    async fn build(
        &self,
        ctx: &PluginContext,
        section: ActorSection,
    ) -> Result<Arc<dyn Actor>, Vec<ConfigIssue>> {
        let mut issues = Vec::new();
        let conf: Option<ActorConfig> = parse_config(&section, &mut issues);
        let entities: Vec<WebhookEntity> = parse_entities(&section, &mut issues);
        for entity in &entities {
            if entity.url.parse::<reqwest::Url>().is_err() {
                issues.push(ConfigIssue {
                    path: format!("Actors.{}.entities.{}.url", section.name, entity.name),
                    value: entity.url.clone(),
                    message: "not a valid url".to_string(),
                });
            }
        }
        let (Some(conf), true) = (conf, issues.is_empty()) else {
            return Err(issues);
        };
        Ok(WebhookAction::create(ctx.bus.clone(), conf, entities) as Arc<dyn Actor>)
    }
}

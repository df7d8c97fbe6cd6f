//! Local file adapters: `from_file` watches a text file by modification
//! time; `to_file` writes record text or JSON into a templated path.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use lookout_core::config::{parse_config, parse_entities};
use lookout_core::monitor::MAX_BACKOFF;
use lookout_core::template::expand_placeholders;
use lookout_core::{
    connect, emit, run_polling, Actor, ActorBuilder, ActorConfig, ActorSection, ConfigIssue,
    EntityState, EventType, MessageBus, Named, PluginContext, PluginRegistry, PollEntry, PollState,
    Poller, Record,
};

pub fn register(registry: &mut PluginRegistry) {
    registry.register("from_file", Box::new(FileMonitorBuilder));
    registry.register("to_file", Box::new(FileSinkBuilder));
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// from_file
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct FileMonitorEntity {
    pub name: String,
    pub path: PathBuf,
    pub update_interval: f64,
    /// One record per line instead of a single record with the whole file.
    #[serde(default)]
    pub split_lines: bool,
}

impl Named for FileMonitorEntity {
    fn name(&self) -> &str {
        &self.name
    }
}

pub struct FileState {
    shared: EntityState,
    mtime: Option<SystemTime>,
}

impl PollState for FileState {
    fn update_interval(&self) -> Duration {
        self.shared.update_interval
    }
}

/// Watch a text file: on each interval check the modification time, and on
/// change read the content into text records. Records are not checked for
/// novelty; appending to the file re-emits the whole content.
pub struct FileMonitor {
    conf: ActorConfig,
    bus: Arc<MessageBus>,
    entities: HashMap<String, FileMonitorEntity>,
    order: Vec<String>,
}

impl FileMonitor {
    pub fn create(
        bus: Arc<MessageBus>,
        conf: ActorConfig,
        entities: Vec<FileMonitorEntity>,
    ) -> Arc<Self> {
        let order = entities.iter().map(|e| e.name.clone()).collect();
        let entities = entities
            .into_iter()
            .map(|entity| (entity.name.clone(), entity))
            .collect();
        let monitor = Arc::new(Self {
            conf,
            bus: Arc::clone(&bus),
            entities,
            order,
        });
        connect(&bus, monitor.clone());
        monitor
    }
}

#[async_trait]
impl Actor for FileMonitor {
    fn name(&self) -> &str {
        &self.conf.name
    }

    fn entity_names(&self) -> Vec<String> {
        self.order.clone()
    }

    fn has_entity(&self, entity: &str) -> bool {
        self.entities.contains_key(entity)
    }

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
impl Poller for FileMonitor {
    type State = FileState;

    fn actor_name(&self) -> &str {
        &self.conf.name
    }

    fn poll_entries(&self) -> Vec<PollEntry> {
        self.order
            .iter()
            .map(|name| PollEntry {
                name: name.clone(),
                interval: Duration::from_secs_f64(self.entities[name].update_interval),
            })
            .collect()
    }

    fn initial_state(&self, entry: &PollEntry) -> FileState {
        FileState {
            shared: EntityState::new(entry.interval),
            mtime: None,
        }
    }

    async fn poll(&self, entity: &str, state: &mut FileState) -> anyhow::Result<Vec<Record>> {
        let entity = self
            .entities
            .get(entity)
            .ok_or_else(|| anyhow::anyhow!("no entity named \"{entity}\""))?;

        let modified = match tokio::fs::metadata(&entity.path).await {
            Ok(metadata) => match metadata.modified() {
                Ok(modified) => modified,
                Err(e) => {
                    debug!(entity = %entity.name, path = %entity.path.display(), error = %e, "failed to read file mtime");
                    return Ok(Vec::new());
                }
            },
            Err(_) => {
                state.mtime = None;
                return Ok(Vec::new());
            }
        };
        if state.mtime == Some(modified) {
            return Ok(Vec::new());
        }
        state.mtime = Some(modified);

        match tokio::fs::read_to_string(&entity.path).await {
            Ok(content) => {
                state.shared.restore();
                let records = if entity.split_lines {
                    content.lines().map(|line| Record::text(line.trim())).collect()
                } else {
                    vec![Record::text(content.trim())]
                };
                Ok(records)
            }
            Err(e) => {
                warn!(entity = %entity.name, path = %entity.path.display(), error = %e, "error when processing file");
                state.shared.update_interval =
                    state.shared.update_interval.mul_f64(1.2).min(MAX_BACKOFF);
                Ok(Vec::new())
            }
        }
    }
}

struct FileMonitorBuilder;

#[async_trait]
impl ActorBuilder for FileMonitorBuilder {
    async fn build(
        &self,
        ctx: &PluginContext,
        section: ActorSection,
    ) -> Result<Arc<dyn Actor>, Vec<ConfigIssue>> {
        let mut issues = Vec::new();
        let conf: Option<ActorConfig> = parse_config(&section, &mut issues);
        let entities: Vec<FileMonitorEntity> = parse_entities(&section, &mut issues);
        let (Some(conf), true) = (conf, issues.is_empty()) else {
            return Err(issues);
        };
        Ok(FileMonitor::create(ctx.bus.clone(), conf, entities) as Arc<dyn Actor>)
    }
}

// ---------------------------------------------------------------------------
// to_file
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Str,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileSinkEntity {
    pub name: String,
    /// Directory the output file is created in.
    #[serde(default = "default_sink_dir")]
    pub path: PathBuf,
    /// Output file name; supports `{field}` templating from the record.
    pub filename: String,
    #[serde(default)]
    pub output_format: OutputFormat,
    /// When false an existing file is left untouched.
    #[serde(default = "default_true")]
    pub overwrite: bool,
    /// When true records are appended instead of replacing the content.
    #[serde(default = "default_true")]
    pub append: bool,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_postfix")]
    pub postfix: String,
}

fn default_sink_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_postfix() -> String {
    "\n".to_string()
}

impl Named for FileSinkEntity {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Write each record to `{dir}/{filename}` as `prefix + body + postfix`.
pub struct FileSink {
    conf: ActorConfig,
    bus: Arc<MessageBus>,
    entities: HashMap<String, FileSinkEntity>,
}

impl FileSink {
    pub fn create(
        bus: Arc<MessageBus>,
        conf: ActorConfig,
        entities: Vec<FileSinkEntity>,
    ) -> Arc<Self> {
        let entities = entities
            .into_iter()
            .map(|entity| (entity.name.clone(), entity))
            .collect();
        let sink = Arc::new(Self {
            conf,
            bus: Arc::clone(&bus),
            entities,
        });
        connect(&bus, sink.clone());
        sink
    }
}

#[async_trait]
impl Actor for FileSink {
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
        let Some(entity) = self.entities.get(entity) else {
            return Ok(());
        };
        let filename = expand_placeholders(&entity.filename, record, "");
        let path = entity.path.join(filename);
        if path.exists() && !entity.overwrite {
            debug!(entity = %entity.name, path = %path.display(), "file already exists, not overwriting");
            return Ok(());
        }
        let body = match entity.output_format {
            OutputFormat::Str => record.display(),
            OutputFormat::Json => record.canonical_json(),
        };
        let text = format!("{}{}{}", entity.prefix, body, entity.postfix);

        let mut options = std::fs::OpenOptions::new();
        options.create(true).write(true);
        if entity.append {
            options.append(true);
        } else {
            options.truncate(true);
        }
        let result = options
            .open(&path)
            .and_then(|mut file| file.write_all(text.as_bytes()));
        if let Err(e) = result {
            let message = format!("error writing to \"{}\": {e}", path.display());
            emit(
                &self.bus,
                self.name(),
                &entity.name,
                &Record::event(EventType::Error, message.clone()),
            );
            anyhow::bail!(message);
        }
        Ok(())
    }
}

struct FileSinkBuilder;

#[async_trait]
impl ActorBuilder for FileSinkBuilder {
    async fn build(
        &self,
        ctx: &PluginContext,
        section: ActorSection,
    ) -> Result<Arc<dyn Actor>, Vec<ConfigIssue>> {
        let mut issues = Vec::new();
        let conf: Option<ActorConfig> = parse_config(&section, &mut issues);
        let entities: Vec<FileSinkEntity> = parse_entities(&section, &mut issues);
        for entity in &entities {
            if !entity.path.is_dir() {
                issues.push(ConfigIssue {
                    path: format!("Actors.{}.entities.{}.path", section.name, entity.name),
                    value: entity.path.display().to_string(),
                    message: "check if provided path points to a writeable directory".to_string(),
                });
            }
        }
        let (Some(conf), true) = (conf, issues.is_empty()) else {
            return Err(issues);
        };
        Ok(FileSink::create(ctx.bus.clone(), conf, entities) as Arc<dyn Actor>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink_entity(dir: &std::path::Path, overrides: serde_json::Value) -> FileSinkEntity {
        let mut base = serde_json::json!({
            "name": "out",
            "path": dir,
            "filename": "out.txt",
        });
        base.as_object_mut()
            .unwrap()
            .extend(overrides.as_object().unwrap().clone());
        serde_json::from_value(base).unwrap()
    }

    fn sink_with(dir: &std::path::Path, overrides: serde_json::Value) -> Arc<FileSink> {
        FileSink::create(
            Arc::new(MessageBus::new()),
            ActorConfig {
                name: "to_file".to_string(),
            },
            vec![sink_entity(dir, overrides)],
        )
    }

    #[test]
    fn appends_prefix_body_postfix() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink_with(dir.path(), serde_json::json!({"prefix": "> "}));
        sink.handle("out", &Record::text("one")).unwrap();
        sink.handle("out", &Record::text("two")).unwrap();
        let content = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert_eq!(content, "> one\n> two\n");
    }

    #[test]
    fn json_format_writes_canonical_json() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink_with(dir.path(), serde_json::json!({"output_format": "json"}));
        sink.handle("out", &Record::text("hi")).unwrap();
        let content = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert_eq!(content, "{\"text\":\"hi\"}\n");
    }

    #[test]
    fn no_overwrite_leaves_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("out.txt"), "original").unwrap();
        let sink = sink_with(dir.path(), serde_json::json!({"overwrite": false}));
        sink.handle("out", &Record::text("new")).unwrap();
        let content = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert_eq!(content, "original");
    }

    #[test]
    fn templated_filename_uses_record_fields() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink_with(dir.path(), serde_json::json!({"filename": "{text}.log"}));
        sink.handle("out", &Record::text("hello")).unwrap();
        assert!(dir.path().join("hello.log").exists());
    }

    #[test]
    fn write_error_emits_error_event() {
        let bus = Arc::new(MessageBus::new());
        let sink = FileSink::create(
            Arc::clone(&bus),
            ActorConfig {
                name: "to_file".to_string(),
            },
            vec![sink_entity(
                std::path::Path::new("/no/such/directory"),
                serde_json::json!({}),
            )],
        );
        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let events_cb = Arc::clone(&events);
        bus.subscribe("output/to_file/out", "collect", move |_, record| {
            events_cb.lock().unwrap().push(record.clone());
        });
        assert!(sink.handle("out", &Record::text("hi")).is_err());
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Record::Event(e) if e.event_type == EventType::Error));
    }

    #[tokio::test]
    async fn file_monitor_emits_on_change_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watched.txt");
        std::fs::write(&path, "line one\nline two\n").unwrap();

        let monitor = FileMonitor::create(
            Arc::new(MessageBus::new()),
            ActorConfig {
                name: "from_file".to_string(),
            },
            vec![serde_json::from_value(serde_json::json!({
                "name": "watched",
                "path": path,
                "update_interval": 1.0,
                "split_lines": true,
            }))
            .unwrap()],
        );

        let entries = monitor.poll_entries();
        let mut state = monitor.initial_state(&entries[0]);

        let records = monitor.poll("watched", &mut state).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].display(), "line one");

        // Unchanged mtime: nothing new.
        let records = monitor.poll("watched", &mut state).await.unwrap();
        assert!(records.is_empty());

        // Missing file: nothing, and no task failure.
        std::fs::remove_file(&path).unwrap();
        let records = monitor.poll("watched", &mut state).await.unwrap();
        assert!(records.is_empty());
    }
}

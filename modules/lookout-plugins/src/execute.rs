//! `execute`: run a subprocess for each incoming record, with placeholder
//! expansion, optional stdout capture and lifecycle events.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use lookout_core::config::{parse_config, parse_entities};
use lookout_core::{
    connect, emit, Actor, ActorBuilder, ActorConfig, ActorSection, ConfigIssue, EventType,
    MessageBus, Named, PluginContext, PluginRegistry, Record,
};

pub fn register(registry: &mut PluginRegistry) {
    registry.register("execute", Box::new(CommandBuilder));
}

fn default_true() -> bool {
    true
}

fn default_placeholders() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("{url}".to_string(), "url".to_string()),
        ("{title}".to_string(), "title".to_string()),
        ("{text}".to_string(), "text".to_string()),
    ])
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandEntity {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// placeholder → record field name.
    #[serde(default = "default_placeholders")]
    pub placeholders: BTreeMap<String, String>,
    /// placeholder → literal value.
    #[serde(default)]
    pub static_placeholders: BTreeMap<String, String>,
    /// Emit the original record down the chain on nonzero exit.
    #[serde(default)]
    pub forward_failed: bool,
    #[serde(default = "default_true")]
    pub report_failed: bool,
    #[serde(default)]
    pub report_finished: bool,
    #[serde(default)]
    pub report_started: bool,
    /// Write stdout+stderr to a log file in this directory.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

impl Named for CommandEntity {
    fn name(&self) -> &str {
        &self.name
    }
}

pub struct CommandAction {
    conf: ActorConfig,
    bus: Arc<MessageBus>,
    entities: HashMap<String, CommandEntity>,
    running: Arc<Mutex<HashSet<String>>>,
}

impl CommandAction {
    pub fn create(
        bus: Arc<MessageBus>,
        conf: ActorConfig,
        entities: Vec<CommandEntity>,
    ) -> Arc<Self> {
        let entities = entities
            .into_iter()
            .map(|entity| (entity.name.clone(), entity))
            .collect();
        let action = Arc::new(Self {
            conf,
            bus: Arc::clone(&bus),
            entities,
            running: Arc::new(Mutex::new(HashSet::new())),
        });
        connect(&bus, action.clone());
        action
    }

    fn args_for(&self, entity: &CommandEntity, record: &Record) -> anyhow::Result<Vec<String>> {
        let args = shell_words::split(&entity.command).map_err(|e| {
            anyhow::anyhow!(
                "error parsing \"command\" field of entity \"{}\" with value \"{}\": {e}",
                entity.name,
                entity.command
            )
        })?;
        if args.is_empty() {
            anyhow::bail!("entity \"{}\" has an empty command", entity.name);
        }
        let expanded = args
            .into_iter()
            .map(|arg| {
                let mut arg = arg;
                for (placeholder, field) in &entity.placeholders {
                    if let Some(value) = record.field(field) {
                        arg = arg.replace(placeholder.as_str(), &value);
                    }
                }
                for (placeholder, value) in &entity.static_placeholders {
                    arg = arg.replace(placeholder.as_str(), value);
                }
                arg
            })
            .collect();
        Ok(expanded)
    }
}

#[async_trait]
impl Actor for CommandAction {
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
        let args = self.args_for(entity, record)?;
        let command_line = args.join(" ");
        let task_id = format!(
            "{}:{}:{command_line}",
            entity.name,
            record.content_hash()
        );
        {
            let mut running = self.running.lock().expect("running set lock poisoned");
            if !running.insert(task_id.clone()) {
                info!(
                    entity = %entity.name,
                    command = %command_line,
                    "command for this record is already running, will not call again"
                );
                return Ok(());
            }
        }
        tokio::spawn(run_subprocess(
            Arc::clone(&self.bus),
            self.conf.name.clone(),
            entity.clone(),
            record.clone(),
            args,
            task_id,
            Arc::clone(&self.running),
        ));
        Ok(())
    }
}

async fn run_subprocess(
    bus: Arc<MessageBus>,
    actor: String,
    entity: CommandEntity,
    record: Record,
    args: Vec<String>,
    task_id: String,
    running: Arc<Mutex<HashSet<String>>>,
) {
    let command_line = args.join(" ");
    info!(entity = %entity.name, command = %command_line, "executing command");
    if entity.report_started {
        emit(
            &bus,
            &actor,
            &entity.name,
            &Record::event(EventType::Started, format!("Running command: {command_line}")),
        );
    }

    let mut command = tokio::process::Command::new(&args[0]);
    command.args(&args[1..]);
    if let Some(dir) = &entity.working_dir {
        command.current_dir(dir);
    }
    if let Some(path) = output_file(&entity, &task_id) {
        match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(stdout) => match stdout.try_clone() {
                Ok(stderr) => {
                    command.stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr));
                }
                Err(e) => warn!(entity = %entity.name, error = %e, "failed to capture stderr"),
            },
            Err(e) => {
                warn!(
                    entity = %entity.name,
                    path = %path.display(),
                    error = %e,
                    "failed to open output file, command output goes to stdout"
                );
            }
        }
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(entity = %entity.name, command = %command_line, error = %e, "failed to execute command");
            running.lock().expect("running set lock poisoned").remove(&task_id);
            if entity.report_failed {
                emit(
                    &bus,
                    &actor,
                    &entity.name,
                    &Record::event(
                        EventType::Error,
                        format!("[{}] failed to execute command: {command_line}", entity.name),
                    ),
                );
            }
            if entity.forward_failed {
                emit(&bus, &actor, &entity.name, &record);
            }
            return;
        }
    };

    // The child is never killed on teardown: its PID is on record and the
    // process group inherits it.
    info!(
        entity = %entity.name,
        pid = child.id().unwrap_or_default(),
        command = %command_line,
        "command started"
    );

    let status = child.wait().await;
    running.lock().expect("running set lock poisoned").remove(&task_id);

    let status = match status {
        Ok(status) => status,
        Err(e) => {
            warn!(entity = %entity.name, command = %command_line, error = %e, "failed to wait for command");
            return;
        }
    };
    debug!(
        entity = %entity.name,
        command = %command_line,
        code = status.code().unwrap_or(-1),
        "subprocess finished"
    );

    if status.success() {
        if entity.report_finished {
            emit(
                &bus,
                &actor,
                &entity.name,
                &Record::event(
                    EventType::Finished,
                    format!("[{}] command finished successfully: {command_line}", entity.name),
                ),
            );
        }
    } else {
        if entity.report_failed {
            emit(
                &bus,
                &actor,
                &entity.name,
                &Record::event(
                    EventType::Error,
                    format!("[{}] command finished with error: {command_line}", entity.name),
                ),
            );
        }
        if entity.forward_failed {
            emit(&bus, &actor, &entity.name, &record);
        }
    }
}

fn output_file(entity: &CommandEntity, task_id: &str) -> Option<PathBuf> {
    let dir = entity.output_dir.as_ref()?;
    if !dir.is_dir() {
        warn!(
            entity = %entity.name,
            path = %dir.display(),
            "output_dir is not a writeable directory, command output goes to stdout"
        );
        return None;
    }
    let timestamp = Utc::now().timestamp_millis();
    let mut hasher = Sha1::new();
    hasher.update(task_id.as_bytes());
    let hash = hex::encode(hasher.finalize());
    Some(dir.join(format!("command_{}_{timestamp}_{hash}_stdout.log", entity.name)))
}

struct CommandBuilder;

#[async_trait]
impl ActorBuilder for CommandBuilder {
    async fn build(
        &self,
        ctx: &PluginContext,
        section: ActorSection,
    ) -> Result<Arc<dyn Actor>, Vec<ConfigIssue>> {
        let mut issues = Vec::new();
        let conf: Option<ActorConfig> = parse_config(&section, &mut issues);
        let entities: Vec<CommandEntity> = parse_entities(&section, &mut issues);
        for entity in &entities {
            if let Err(e) = shell_words::split(&entity.command) {
                issues.push(ConfigIssue {
                    path: format!("Actors.{}.entities.{}.command", section.name, entity.name),
                    value: entity.command.clone(),
                    message: e.to_string(),
                });
            }
            if let Some(dir) = &entity.working_dir {
                if !dir.is_dir() {
                    issues.push(ConfigIssue {
                        path: format!(
                            "Actors.{}.entities.{}.working_dir",
                            section.name, entity.name
                        ),
                        value: dir.display().to_string(),
                        message: "check path exists and is a writeable directory".to_string(),
                    });
                }
            }
        }
        let (Some(conf), true) = (conf, issues.is_empty()) else {
            return Err(issues);
        };
        Ok(CommandAction::create(ctx.bus.clone(), conf, entities) as Arc<dyn Actor>)
    }
}

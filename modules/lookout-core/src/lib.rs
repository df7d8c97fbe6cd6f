//! Runtime engine for lookout: the message bus, the actor dispatch
//! contract, the polling scheduler, the HTTP feed-monitor pipeline, the
//! record store and the chain resolver. Site-specific parsers and sinks
//! live in `lookout-plugins` and register themselves through
//! [`registry::PluginRegistry`].

pub mod actor;
pub mod bus;
pub mod chain;
pub mod config;
pub mod error;
pub mod feed;
pub mod http;
pub mod monitor;
pub mod record;
pub mod registry;
pub mod store;
pub mod template;

pub use actor::{connect, emit, Actor, ActorConfig, FilterActor, Matcher, Named};
pub use bus::MessageBus;
pub use chain::{build_chain, Chain, ChainStage};
pub use config::{ConfigError, ConfigIssue};
pub use error::{LookoutError, Result};
pub use feed::{FeedEntity, FeedMonitor, FeedMonitorConfig, FeedSource};
pub use monitor::{run_polling, EntityState, PollEntry, PollState, Poller};
pub use record::{EventRecord, EventType, FeedRecord, Record, RecordKind, StreamRecord, TextRecord};
pub use registry::{ActorBuilder, ActorSection, PluginContext, PluginRegistry};
pub use store::{PersistedRow, RecordStore};

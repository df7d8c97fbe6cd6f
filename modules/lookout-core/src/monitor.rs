//! Cyclic task scheduling for monitors: one long-lived task per entity,
//! staggered startup inside each interval group, per-task failure
//! isolation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::actor::emit;
use crate::bus::MessageBus;
use crate::record::Record;

/// Ceiling for failure-driven backoff.
pub const MAX_BACKOFF: Duration = Duration::from_secs(4 * 3600);

/// Mutable per-entity runtime state, owned by the entity's task. Kept
/// separate from the immutable entity configuration.
#[derive(Debug, Clone)]
pub struct EntityState {
    /// Live poll cadence; drifts under adaptation and backoff.
    pub update_interval: Duration,
    /// The configured cadence the live value returns to.
    pub base_update_interval: Duration,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl EntityState {
    pub fn new(base: Duration) -> Self {
        Self {
            update_interval: base,
            base_update_interval: base,
            etag: None,
            last_modified: None,
        }
    }

    /// Failure backoff: `min(live × 2, base × 10, 4 h)`. Returns true when
    /// the live interval changed.
    pub fn back_off(&mut self) -> bool {
        let next = (self.update_interval * 2)
            .min(self.base_update_interval * 10)
            .min(MAX_BACKOFF);
        let changed = next != self.update_interval;
        self.update_interval = next;
        changed
    }

    /// Success with adaptation enabled: follow the server's cache TTL, but
    /// never poll faster than the configured base.
    pub fn adapt(&mut self, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.base_update_interval);
        self.update_interval = ttl.max(self.base_update_interval);
    }

    /// Success with adaptation disabled: undo any prior backoff.
    pub fn restore(&mut self) {
        self.update_interval = self.base_update_interval;
    }
}

/// Read access to the live interval, for states that wrap [`EntityState`].
pub trait PollState: Send + 'static {
    fn update_interval(&self) -> Duration;
}

impl PollState for EntityState {
    fn update_interval(&self) -> Duration {
        self.update_interval
    }
}

/// A schedulable entity: its name and configured base interval.
#[derive(Debug, Clone)]
pub struct PollEntry {
    pub name: String,
    pub interval: Duration,
}

/// The polling seam monitors implement. `poll` produces the new records for
/// one entity and may mutate the state's live interval; the driver emits
/// the records and sleeps.
#[async_trait]
pub trait Poller: Send + Sync + 'static {
    type State: PollState;

    fn actor_name(&self) -> &str;

    /// Entities in configuration order.
    fn poll_entries(&self) -> Vec<PollEntry>;

    fn initial_state(&self, entry: &PollEntry) -> Self::State;

    async fn poll(&self, entity: &str, state: &mut Self::State) -> anyhow::Result<Vec<Record>>;

    /// One-time setup before cyclic tasks start (e.g. first-run priming).
    async fn prime(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Start the cyclic tasks for a monitor and park forever.
///
/// Entities are grouped by base interval; inside a group, task launches are
/// offset by `interval / group_size` (no sleep after the last launch).
/// Groups launch in parallel; within a group, configuration order holds.
pub async fn run_polling<P: Poller>(poller: Arc<P>, bus: Arc<MessageBus>) -> anyhow::Result<()> {
    poller.prime().await?;

    let mut groups: BTreeMap<Duration, Vec<PollEntry>> = BTreeMap::new();
    for entry in poller.poll_entries() {
        groups.entry(entry.interval).or_default().push(entry);
    }

    for (interval, group) in groups {
        if group.is_empty() {
            continue;
        }
        let offset = interval / group.len() as u32;
        let names = group
            .iter()
            .map(|e| format!("{}.{}", poller.actor_name(), e.name))
            .collect::<Vec<_>>()
            .join(", ");
        info!(
            tasks = group.len(),
            interval_secs = interval.as_secs_f64(),
            offset_secs = offset.as_secs_f64(),
            "starting tasks for {names}"
        );
        let poller = Arc::clone(&poller);
        let bus = Arc::clone(&bus);
        tokio::spawn(async move {
            let last = group.len() - 1;
            for (i, entry) in group.into_iter().enumerate() {
                tokio::spawn(entity_loop(Arc::clone(&poller), Arc::clone(&bus), entry));
                if i < last {
                    tokio::time::sleep(offset).await;
                }
            }
        });
    }

    futures::future::pending::<()>().await;
    Ok(())
}

async fn entity_loop<P: Poller>(poller: Arc<P>, bus: Arc<MessageBus>, entry: PollEntry) {
    let mut state = poller.initial_state(&entry);
    loop {
        match poller.poll(&entry.name, &mut state).await {
            Ok(records) => {
                for record in &records {
                    emit(&bus, poller.actor_name(), &entry.name, record);
                }
            }
            Err(e) => {
                // Only this entity's task dies; siblings keep running.
                error!(
                    actor = poller.actor_name(),
                    entity = %entry.name,
                    error = %e,
                    "task for entity failed, terminating"
                );
                break;
            }
        }
        // The live interval may have been adjusted by the poll.
        tokio::time::sleep(state.update_interval()).await;
    }
    warn!(actor = poller.actor_name(), entity = %entry.name, "entity task finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[test]
    fn backoff_law() {
        let base = Duration::from_secs(60);
        let mut state = EntityState::new(base);
        let expected = [120, 240, 480, 600, 600];
        for secs in expected {
            state.back_off();
            assert_eq!(state.update_interval, Duration::from_secs(secs));
        }
    }

    #[test]
    fn backoff_caps_at_four_hours() {
        let base = Duration::from_secs(3000);
        let mut state = EntityState::new(base);
        for _ in 0..5 {
            state.back_off();
        }
        assert_eq!(state.update_interval, MAX_BACKOFF);
    }

    #[test]
    fn adapt_follows_ttl_but_never_below_base() {
        let mut state = EntityState::new(Duration::from_secs(60));
        state.adapt(Some(Duration::from_secs(300)));
        assert_eq!(state.update_interval, Duration::from_secs(300));
        state.adapt(Some(Duration::from_secs(30)));
        assert_eq!(state.update_interval, Duration::from_secs(60));
        state.adapt(None);
        assert_eq!(state.update_interval, Duration::from_secs(60));
    }

    #[test]
    fn restore_undoes_backoff() {
        let mut state = EntityState::new(Duration::from_secs(60));
        state.back_off();
        state.back_off();
        state.restore();
        assert_eq!(state.update_interval, Duration::from_secs(60));
    }

    struct RecordingPoller {
        started_at: Instant,
        polls: Mutex<Vec<(String, Duration)>>,
        entries: Vec<PollEntry>,
        fail_entity: Option<String>,
    }

    #[async_trait]
    impl Poller for RecordingPoller {
        type State = EntityState;

        fn actor_name(&self) -> &str {
            "probe"
        }

        fn poll_entries(&self) -> Vec<PollEntry> {
            self.entries.clone()
        }

        fn initial_state(&self, entry: &PollEntry) -> EntityState {
            EntityState::new(entry.interval)
        }

        async fn poll(&self, entity: &str, _state: &mut EntityState) -> anyhow::Result<Vec<Record>> {
            self.polls
                .lock()
                .unwrap()
                .push((entity.to_string(), self.started_at.elapsed()));
            if self.fail_entity.as_deref() == Some(entity) {
                anyhow::bail!("poll exploded");
            }
            Ok(vec![])
        }
    }

    fn entries(names: &[&str], interval: Duration) -> Vec<PollEntry> {
        names
            .iter()
            .map(|name| PollEntry {
                name: name.to_string(),
                interval,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn startup_staggers_entities_by_interval_over_group_size() {
        let poller = Arc::new(RecordingPoller {
            started_at: Instant::now(),
            polls: Mutex::new(Vec::new()),
            entries: entries(&["a", "b", "c"], Duration::from_secs(60)),
            fail_entity: None,
        });
        let bus = Arc::new(MessageBus::new());
        tokio::spawn(run_polling(Arc::clone(&poller), bus));

        tokio::time::sleep(Duration::from_secs(55)).await;

        let polls = poller.polls.lock().unwrap();
        let firsts: Vec<(&str, u64)> = polls
            .iter()
            .map(|(name, at)| (name.as_str(), at.as_secs()))
            .take(3)
            .collect();
        assert_eq!(firsts, vec![("a", 0), ("b", 20), ("c", 40)]);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_entity_does_not_stop_siblings() {
        let poller = Arc::new(RecordingPoller {
            started_at: Instant::now(),
            polls: Mutex::new(Vec::new()),
            entries: entries(&["bad", "good"], Duration::from_secs(10)),
            fail_entity: Some("bad".to_string()),
        });
        let bus = Arc::new(MessageBus::new());
        tokio::spawn(run_polling(Arc::clone(&poller), bus));

        tokio::time::sleep(Duration::from_secs(35)).await;

        let polls = poller.polls.lock().unwrap();
        let bad = polls.iter().filter(|(name, _)| name == "bad").count();
        let good = polls.iter().filter(|(name, _)| name == "good").count();
        assert_eq!(bad, 1, "failed task must not be rescheduled");
        assert!(good >= 3, "sibling should keep polling, saw {good}");
    }
}

//! Explicit per-session state threaded through the pipeline.

use crate::engine::{EventSender, Supervisor};
use crate::error::Result;
use crate::model::StageEvent;
use crate::storage::{InstallationRegistry, ResultCache};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_CAPACITY: usize = 256;

/// Paths handed to workers for every stage of the session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub ifs_root: PathBuf,
    pub output_dir: PathBuf,
    pub input_file: PathBuf,
}

/// One orchestrator session: a single supervisor (and therefore a single
/// in-flight stage), the shared store, and the event stream.
#[derive(Debug, Clone)]
pub struct Session {
    settings: SessionSettings,
    supervisor: Supervisor,
    cache: ResultCache,
    registry: InstallationRegistry,
    events: EventSender,
}

impl Session {
    pub async fn open(settings: SessionSettings, supervisor: Supervisor, db_path: &Path) -> Result<Self> {
        let cache = ResultCache::open(db_path).await?;
        let registry = InstallationRegistry::open(db_path).await?;
        debug!(db = %cache.path().display(), "result store opened");
        Ok(Self::new(settings, supervisor, cache, registry))
    }

    pub fn new(
        settings: SessionSettings,
        supervisor: Supervisor,
        cache: ResultCache,
        registry: InstallationRegistry,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            settings,
            supervisor,
            cache,
            registry,
            events,
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn registry(&self) -> &InstallationRegistry {
        &self.registry
    }

    pub fn events(&self) -> &EventSender {
        &self.events
    }

    /// New listener; dropping the receiver unsubscribes it.
    pub fn subscribe(&self) -> broadcast::Receiver<StageEvent> {
        self.events.subscribe()
    }

    /// Publish to current listeners. Having none is not an error.
    pub fn emit(&self, event: StageEvent) {
        let _ = self.events.send(event);
    }
}

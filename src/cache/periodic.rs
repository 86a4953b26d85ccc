//! The refresh engine behind every periodically fetched resource.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::error::CacheError;
use super::store::{CacheStore, RefreshMetadata};

/// Result of one fetch attempt against the remote origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The origin returned a new body.
    NewValue(String),
    /// The origin confirmed the stored version is current.
    NotModified,
    /// The fetch failed; the message is for logs only.
    Error(String),
}

/// Fetch and parse logic for one kind of cached resource.
pub trait ResourceSource: Send + Sync + 'static {
    /// Parsed, immutable value published to readers.
    type Value: Send + Sync + 'static;

    /// Perform one fetch. `version` is the stored version token, if any.
    fn fetch(&self, version: Option<&str>) -> impl Future<Output = FetchOutcome> + Send;

    /// Parse a fetched or stored body.
    fn parse(&self, content: &str) -> Result<Self::Value, CacheError>;

    /// Version token carried by a parsed value.
    fn version_of(&self, value: &Self::Value) -> String;

    /// Called after a new value has been published.
    fn on_updated(&self, _value: &Self::Value) {}

    /// Called after a fetch reported an error.
    fn on_failed(&self, _message: &str) {}
}

/// Delays between refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSchedule {
    /// Delay after a successful or not-modified fetch.
    pub refresh_interval: Duration,
    /// Delay after a failed fetch. Shorter than `refresh_interval`.
    pub error_backoff: Duration,
    /// Pause after an iteration failed unexpectedly (storage or parse error).
    pub failure_cooldown: Duration,
}

impl RefreshSchedule {
    /// Delay until the next fetch given the outcome of the last one.
    pub fn next_delay(&self, last_was_error: bool) -> Duration {
        if last_was_error {
            self.error_backoff
        } else {
            self.refresh_interval
        }
    }
}

/// Read-only view of the latest published value.
///
/// Always current: clones share the same channel, and a handle taken after
/// an update sees the updated value right away.
pub struct CacheHandle<T> {
    rx: watch::Receiver<Option<Arc<T>>>,
}

impl<T> Clone for CacheHandle<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<T> std::fmt::Debug for CacheHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHandle")
            .field("has_value", &self.rx.borrow().is_some())
            .finish()
    }
}

impl<T> CacheHandle<T> {
    /// A handle that always reports `value`.
    pub fn fixed(value: T) -> Self {
        let (_tx, rx) = watch::channel(Some(Arc::new(value)));
        Self { rx }
    }

    /// The latest value, `None` until the first successful fetch or load.
    pub fn current(&self) -> Option<Arc<T>> {
        self.rx.borrow().clone()
    }

    /// Wait until a value other than the one last seen by this handle is published.
    ///
    /// Returns `None` once the engine is gone.
    pub async fn changed(&mut self) -> Option<Arc<T>> {
        self.rx.changed().await.ok()?;
        self.rx.borrow_and_update().clone()
    }
}

/// Keeps a value fresh by periodically fetching, persisting and publishing it.
///
/// The engine is the only writer; readers hold [`CacheHandle`]s.
pub struct PeriodicResourceCache<S: ResourceSource> {
    store: CacheStore,
    source: S,
    schedule: RefreshSchedule,
    publisher: watch::Sender<Option<Arc<S::Value>>>,
    meta: Option<RefreshMetadata>,
}

impl<S: ResourceSource> PeriodicResourceCache<S> {
    /// Prepare storage, load the stored value and publish it immediately.
    ///
    /// A stored body that no longer parses is discarded and the next fetch
    /// happens right away. Storage errors are returned; they are fatal at
    /// startup.
    pub fn open(
        store: CacheStore,
        source: S,
        schedule: RefreshSchedule,
    ) -> Result<(Self, CacheHandle<S::Value>), CacheError> {
        store.ensure()?;

        let mut meta = match store.load_meta() {
            Ok(meta) => meta,
            Err(CacheError::CorruptMetadata { path, source: e }) => {
                warn!("Ignoring corrupt cache metadata {:?}: {}", path, e);
                None
            }
            Err(e) => return Err(e),
        };

        let content = store.load_content()?;
        let value = if content.trim().is_empty() {
            None
        } else {
            match source.parse(&content) {
                Ok(value) => Some(Arc::new(value)),
                Err(e) => {
                    warn!(
                        "Discarding unparseable cached content {:?}: {}",
                        store.content_path(),
                        e
                    );
                    meta = None;
                    None
                }
            }
        };

        // Without a body a version token would only earn "not modified" answers.
        if value.is_none() {
            if let Some(ref mut meta) = meta {
                meta.version.clear();
            }
        }

        match (&value, &meta) {
            (Some(_), Some(meta)) => info!(
                "Loaded cached {:?} (version '{}', next refresh {})",
                store.content_path(),
                meta.version,
                meta.update_after
            ),
            (Some(_), None) => info!("Loaded cached {:?}", store.content_path()),
            (None, _) => info!("No cached value in {:?}", store.content_path()),
        }

        let (publisher, rx) = watch::channel(value);
        let cache = Self {
            store,
            source,
            schedule,
            publisher,
            meta,
        };
        Ok((cache, CacheHandle { rx }))
    }

    /// Another handle onto the published value.
    pub fn handle(&self) -> CacheHandle<S::Value> {
        CacheHandle {
            rx: self.publisher.subscribe(),
        }
    }

    /// Refresh forever. Never returns; abort the task to stop it.
    ///
    /// An iteration that fails unexpectedly is logged and followed by the
    /// failure cooldown.
    pub async fn run(mut self) {
        loop {
            if let Err(e) = self.refresh_once().await {
                error!(
                    "Refresh of {:?} failed: {}; retrying in {:?}",
                    self.store.content_path(),
                    e,
                    self.schedule.failure_cooldown
                );
                tokio::time::sleep(self.schedule.failure_cooldown).await;
            }
        }
    }

    /// Wait until the next refresh is due, then fetch once and apply the outcome.
    pub async fn refresh_once(&mut self) -> Result<(), CacheError> {
        if let Some(ref meta) = self.meta {
            if let Ok(wait) = (meta.update_after - Utc::now()).to_std() {
                debug!("Next refresh of {:?} in {:?}", self.store.content_path(), wait);
                tokio::time::sleep(wait).await;
            }
        }

        let old_version = self
            .meta
            .as_ref()
            .map(|m| m.version.clone())
            .unwrap_or_default();
        let token = Some(old_version.as_str()).filter(|v| !v.is_empty());

        let outcome = self.source.fetch(token).await;
        let now = Utc::now();

        match outcome {
            FetchOutcome::NewValue(content) => {
                let value = self.source.parse(&content)?;
                let version = self.source.version_of(&value);
                self.store.write_content(&content)?;

                let value = Arc::new(value);
                self.publisher.send_replace(Some(value.clone()));
                self.source.on_updated(&value);
                info!(
                    "Updated {:?} to version '{}'",
                    self.store.content_path(),
                    version
                );

                self.persist_meta(now, false, version)
            }
            FetchOutcome::NotModified => {
                debug!(
                    "{:?} not modified (version '{}')",
                    self.store.content_path(),
                    old_version
                );
                self.persist_meta(now, false, old_version)
            }
            FetchOutcome::Error(message) => {
                warn!(
                    "Fetch for {:?} failed: {}; retrying in {:?}",
                    self.store.content_path(),
                    message,
                    self.schedule.error_backoff
                );
                self.source.on_failed(&message);
                self.persist_meta(now, true, old_version)
            }
        }
    }

    fn persist_meta(
        &mut self,
        now: DateTime<Utc>,
        last_was_error: bool,
        version: String,
    ) -> Result<(), CacheError> {
        let due = due_after(now, self.schedule.next_delay(last_was_error));
        let meta = RefreshMetadata::new(due, version);
        self.meta = Some(meta.clone());
        self.store.write_meta(&meta)
    }
}

fn due_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

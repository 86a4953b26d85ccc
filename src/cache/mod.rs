//! Periodically refreshed, crash-resilient resource cache.
//!
//! [`PeriodicResourceCache`] keeps one remote resource fresh. It is a single
//! engine parameterized by a [`ResourceSource`] (fetch + parse) and a
//! [`RefreshSchedule`]; the federation allow-list is one such configuration.
//!
//! On open, the last stored body is parsed and published before any network
//! access, so readers never wait for the origin. The refresh loop then
//! fetches whenever the stored `updateAfter` time has passed:
//!
//! | Outcome | Body | Published value | Metadata |
//! |---|---|---|---|
//! | new value | replaced | replaced | new version, `now + refresh_interval` |
//! | not modified | kept | kept | same version, `now + refresh_interval` |
//! | error | kept | kept | same version, `now + error_backoff` |
//!
//! A body that fails to parse aborts the update; nothing is written.
//!
//! # Example
//!
//! ```ignore
//! use tim_gateway::cache::{CacheStore, PeriodicResourceCache, RefreshSchedule};
//!
//! let store = CacheStore::new("/var/cache/app/list.json", "/var/cache/app/list.meta.json");
//! let (cache, handle) = PeriodicResourceCache::open(store, source, schedule)?;
//! let task = tokio::spawn(cache.run());
//!
//! if let Some(value) = handle.current() { /* ... */ }
//! task.abort();
//! ```

mod error;
mod periodic;
mod store;

pub use error::CacheError;
pub use periodic::{CacheHandle, FetchOutcome, PeriodicResourceCache, RefreshSchedule, ResourceSource};
pub use store::{CacheStore, RefreshMetadata};

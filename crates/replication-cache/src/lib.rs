//! Replication cache for the record store read path.
//!
//! This crate keeps an in-memory copy of recently read records fresh by
//! following the database's change feed:
//! - [`EntryCache`] bounded LRU of decoded record state
//! - [`ChangeFeed`] source of committed row changes, with PostgreSQL
//!   ([`PgNotifyFeed`]) and in-process ([`ChannelFeed`]) implementations
//! - [`ReplicationUpdater`] applies the feed to the cache in the background
//! - [`CachedRecordStore`] serves by-id reads from the cache when the
//!   updater is connected and falls back to the database otherwise

pub mod entry_cache;
pub mod error;
pub mod feed;
pub mod fetcher;
pub mod gate;
pub mod pg_feed;
pub mod settings;
pub mod singleton;
pub mod store;
pub mod updater;

pub use entry_cache::{CacheEntry, CacheStats, EntryCache};
pub use error::{CacheError, Result};
pub use feed::{ChangeFeed, ChangeKind, ChangeStream, ChannelFeed, FeedPosition, RowChange};
pub use fetcher::FallbackFetcher;
pub use gate::CacheGate;
pub use pg_feed::PgNotifyFeed;
pub use settings::StoreSettings;
pub use singleton::SingletonRegistry;
pub use store::{CacheStatus, CachedRecordStore};
pub use updater::{
    ReplicationUpdater, ReplicationUpdaterFactory, Updater, UpdaterFactory, UpdaterState,
};

//! Change feed contract and an in-process channel feed.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use common::RecordId;
use futures_core::Stream;
use record_store::RawRow;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::{CacheError, Result};

/// Position of a change within a feed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FeedPosition {
    /// Sequence number of the change, starting at 1.
    pub sequence: u64,
}

impl FeedPosition {
    /// Position before any change.
    pub fn zero() -> Self {
        Self { sequence: 0 }
    }

    /// Creates a position from a sequence number.
    pub fn new(sequence: u64) -> Self {
        Self { sequence }
    }

    /// Returns the following position.
    pub fn advance(&self) -> Self {
        Self {
            sequence: self.sequence + 1,
        }
    }
}

impl std::fmt::Display for FeedPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "position({})", self.sequence)
    }
}

/// What happened to a row.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeKind {
    /// Row inserted or updated; carries the committed row image.
    Upsert(RawRow),
    /// Row deleted.
    Delete(RecordId),
}

/// One committed row-level change.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub position: FeedPosition,
    pub kind: ChangeKind,
}

impl RowChange {
    /// Returns the id of the affected record, if known.
    pub fn record_id(&self) -> Option<RecordId> {
        match &self.kind {
            ChangeKind::Upsert(row) => row.id,
            ChangeKind::Delete(id) => Some(*id),
        }
    }
}

/// A stream of committed changes, in commit order.
pub type ChangeStream = Pin<Box<dyn Stream<Item = Result<RowChange>> + Send>>;

/// Source of committed row changes for the records table.
///
/// A feed may be subscribed to repeatedly; each subscription starts at the
/// current head and never replays earlier changes.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Checks the feed configuration without connecting.
    ///
    /// Returns [`CacheError::Configuration`] when the source can never work.
    fn validate(&self) -> Result<()>;

    /// Opens a new subscription at the head of the feed.
    async fn subscribe(&self) -> Result<ChangeStream>;
}

/// Change feed fed from inside the process.
///
/// Changes published while nobody is subscribed are dropped, just like
/// changes committed while a database listener is disconnected.
pub struct ChannelFeed {
    sender: broadcast::Sender<RowChange>,
    sequence: AtomicU64,
}

impl ChannelFeed {
    /// Creates a feed buffering up to `capacity` undelivered changes per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sequence: AtomicU64::new(0),
        }
    }

    /// Publishes an insert or update.
    pub fn publish_upsert(&self, row: RawRow) -> FeedPosition {
        self.publish(ChangeKind::Upsert(row))
    }

    /// Publishes a delete.
    pub fn publish_delete(&self, id: RecordId) -> FeedPosition {
        self.publish(ChangeKind::Delete(id))
    }

    /// Publishes a change and returns its position.
    pub fn publish(&self, kind: ChangeKind) -> FeedPosition {
        let position = FeedPosition::new(self.sequence.fetch_add(1, Ordering::SeqCst) + 1);
        // No subscribers is not an error: the change is simply not observed.
        let _ = self.sender.send(RowChange { position, kind });
        position
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChannelFeed {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl ChangeFeed for ChannelFeed {
    fn name(&self) -> &str {
        "channel"
    }

    fn validate(&self) -> Result<()> {
        Ok(())
    }

    async fn subscribe(&self) -> Result<ChangeStream> {
        let receiver = self.sender.subscribe();
        let stream = futures_util::stream::unfold(receiver, |mut receiver| async move {
            match receiver.recv().await {
                Ok(change) => Some((Ok(change), receiver)),
                Err(broadcast::error::RecvError::Closed) => None,
                Err(broadcast::error::RecvError::Lagged(skipped)) => Some((
                    Err(CacheError::Feed(format!(
                        "subscriber lagged, {skipped} changes skipped"
                    ))),
                    receiver,
                )),
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::TypeId;
    use futures_util::StreamExt;

    #[test]
    fn position_advances() {
        let pos = FeedPosition::zero();
        assert_eq!(pos.advance(), FeedPosition::new(1));
        assert_eq!(FeedPosition::new(42).to_string(), "position(42)");
    }

    #[tokio::test]
    async fn channel_feed_delivers_in_order() {
        let feed = ChannelFeed::new(16);
        let mut stream = feed.subscribe().await.unwrap();

        let id = RecordId::new();
        let first = feed.publish_upsert(RawRow::new(id, TypeId::random(), b"{}".to_vec()));
        let second = feed.publish_delete(id);
        assert!(first < second);

        let change = stream.next().await.unwrap().unwrap();
        assert_eq!(change.position, first);
        assert_eq!(change.record_id(), Some(id));

        let change = stream.next().await.unwrap().unwrap();
        assert_eq!(change.position, second);
        assert_eq!(change.kind, ChangeKind::Delete(id));
    }

    #[tokio::test]
    async fn channel_feed_reports_lag() {
        let feed = ChannelFeed::new(1);
        let mut stream = feed.subscribe().await.unwrap();

        feed.publish_delete(RecordId::new());
        feed.publish_delete(RecordId::new());

        assert!(matches!(
            stream.next().await,
            Some(Err(CacheError::Feed(_)))
        ));
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_dropped() {
        let feed = ChannelFeed::default();
        feed.publish_delete(RecordId::new());
        assert_eq!(feed.subscriber_count(), 0);

        let _stream = feed.subscribe().await.unwrap();
        assert_eq!(feed.subscriber_count(), 1);
    }
}

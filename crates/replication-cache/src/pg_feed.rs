//! PostgreSQL change feed over `LISTEN/NOTIFY`.
//!
//! A trigger on the records table announces every committed change on a
//! notification channel as `{"op": "upsert" | "delete", "id": "<uuid>"}`.
//! Notifications are delivered at commit, in commit order. Upserts carry
//! only the id, so the feed loads the committed row image before yielding.
//!
//! A channel no trigger announces on would leave the feed connected but
//! silent, so `subscribe` checks the trigger catalog first.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use common::RecordId;
use record_store::{PostgresRecordDatabase, RecordDatabase};
use serde::Deserialize;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use uuid::Uuid;

use crate::feed::{ChangeFeed, ChangeKind, ChangeStream, FeedPosition, RowChange};
use crate::{CacheError, Result};

/// Default notification channel used by the records table trigger.
pub const DEFAULT_CHANNEL: &str = "record_changes";

/// Postgres identifiers are truncated past this length.
const MAX_CHANNEL_LEN: usize = 63;

/// True when a records trigger runs `notify_record_change` for the channel.
/// Trigger arguments are stored NUL-terminated in `tgargs`.
const CHANNEL_ANNOUNCED_SQL: &str = r"
    SELECT EXISTS (
        SELECT 1
        FROM pg_trigger t
        JOIN pg_proc p ON p.oid = t.tgfoid
        WHERE t.tgrelid = to_regclass('records')
          AND p.proname = 'notify_record_change'
          AND t.tgenabled <> 'D'
          AND encode(t.tgargs, 'escape') = $1 || '\000'
    )
";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ChangeOp {
    Upsert,
    Delete,
}

#[derive(Debug, Deserialize)]
struct ChangeMessage {
    op: ChangeOp,
    id: Uuid,
}

/// Change feed backed by a PostgreSQL notification channel.
#[derive(Clone)]
pub struct PgNotifyFeed {
    database: PostgresRecordDatabase,
    channel: String,
    sequence: Arc<AtomicU64>,
}

impl PgNotifyFeed {
    /// Creates a feed listening on `channel` through connections from `pool`.
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            database: PostgresRecordDatabase::new(pool),
            channel: channel.into(),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns the notification channel name.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Fails with [`CacheError::Configuration`] unless an enabled trigger on
    /// the records table notifies on this feed's channel.
    pub async fn check_channel_announced(&self) -> Result<()> {
        let announced: bool = sqlx::query_scalar(CHANNEL_ANNOUNCED_SQL)
            .bind(&self.channel)
            .fetch_one(self.database.pool())
            .await
            .map_err(|e| CacheError::Feed(format!("can't inspect change triggers: {e}")))?;

        if !announced {
            return Err(CacheError::Configuration(format!(
                "no trigger on records notifies channel {:?}",
                self.channel
            )));
        }
        Ok(())
    }
}

fn is_valid_channel(channel: &str) -> bool {
    let mut chars = channel.chars();
    let starts_well = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    starts_well
        && channel.len() <= MAX_CHANNEL_LEN
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[async_trait]
impl ChangeFeed for PgNotifyFeed {
    fn name(&self) -> &str {
        "postgres-notify"
    }

    fn validate(&self) -> Result<()> {
        if !is_valid_channel(&self.channel) {
            return Err(CacheError::Configuration(format!(
                "invalid notification channel name: {:?}",
                self.channel
            )));
        }
        if self.database.pool().is_closed() {
            return Err(CacheError::Configuration(
                "connection pool is closed".to_string(),
            ));
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<ChangeStream> {
        self.check_channel_announced().await?;

        let mut listener = PgListener::connect_with(self.database.pool())
            .await
            .map_err(|e| CacheError::Feed(format!("can't connect listener: {e}")))?;
        listener
            .listen(&self.channel)
            .await
            .map_err(|e| CacheError::Feed(format!("can't listen on {}: {e}", self.channel)))?;

        tracing::debug!(channel = %self.channel, "listening for record changes");

        let state = (listener, self.database.clone(), Arc::clone(&self.sequence));
        let stream = futures_util::stream::unfold(
            state,
            |(mut listener, database, sequence)| async move {
                let change = next_change(&mut listener, &database, &sequence).await;
                Some((change, (listener, database, sequence)))
            },
        );
        Ok(Box::pin(stream))
    }
}

async fn next_change(
    listener: &mut PgListener,
    database: &PostgresRecordDatabase,
    sequence: &AtomicU64,
) -> Result<RowChange> {
    // try_recv reports a lost connection instead of silently reconnecting,
    // which would hide the notifications missed in between.
    let notification = listener
        .try_recv()
        .await
        .map_err(|e| CacheError::Feed(format!("listener error: {e}")))?
        .ok_or_else(|| CacheError::Feed("listener connection lost".to_string()))?;

    let message: ChangeMessage = serde_json::from_str(notification.payload()).map_err(|e| {
        CacheError::Feed(format!(
            "malformed change notification {:?}: {e}",
            notification.payload()
        ))
    })?;
    let id = RecordId::from_uuid(message.id);

    let kind = match message.op {
        ChangeOp::Delete => ChangeKind::Delete(id),
        ChangeOp::Upsert => {
            let mut rows = database
                .fetch_rows(&[id])
                .await
                .map_err(|e| CacheError::Feed(format!("can't load row {id}: {e}")))?;
            match rows.pop() {
                Some(row) => ChangeKind::Upsert(row),
                // Deleted again before we could read it.
                None => ChangeKind::Delete(id),
            }
        }
    };

    // Positions keep increasing across subscriptions.
    let position = FeedPosition::new(sequence.fetch_add(1, Ordering::SeqCst) + 1);
    Ok(RowChange { position, kind })
}

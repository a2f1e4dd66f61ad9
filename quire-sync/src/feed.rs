//! Change feeds: snapshot-then-live fan-out of the two server tables.
//!
//! Every document gets a [`DocumentFeed`] holding a commit lock and one
//! broadcast channel per table. Writers go through [`FeedHub`], which holds
//! the commit lock across the store write and the broadcast, so the order in
//! which subscribers see live rows is the order in which they were committed.
//!
//! ```text
//! subscribe(doc, table, offset)
//!   1. rx = channel.subscribe()        ◄── live rows from here on
//!   2. rows = store snapshot (> offset)
//!   3. yield rows, then UpToDate { cursor }
//!   4. yield rx rows with position > cursor
//! ```
//!
//! Subscribing before reading the snapshot means no commit can fall between
//! the two; rows seen by both are dropped by position. A receiver that falls
//! more than `capacity` rows behind is evicted and must resubscribe from its
//! cursor.
//!
//! Store calls block (RocksDB may fsync), so they run on the blocking pool;
//! the async workers only wait on them.

use log::{debug, trace, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::error::SyncError;
use crate::protocol::{now_ms, ClientId, DocumentId, FeedMessage, Table};
use crate::storage::{PresenceRecord, StoreError, SyncStore};

/// Statistics for monitoring feed health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub active_feeds: usize,
    pub messages_published: u64,
    pub subscribers_evicted: u64,
}

#[derive(Default)]
struct AtomicHubStats {
    messages_published: AtomicU64,
    subscribers_evicted: AtomicU64,
}

/// Broadcast channels and commit lock of a single document.
pub struct DocumentFeed {
    commit: Mutex<()>,
    updates: broadcast::Sender<Arc<FeedMessage>>,
    presence: broadcast::Sender<Arc<FeedMessage>>,
}

impl DocumentFeed {
    fn new(capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(capacity);
        let (presence, _) = broadcast::channel(capacity);
        Self {
            commit: Mutex::new(()),
            updates,
            presence,
        }
    }

    fn sender(&self, table: Table) -> &broadcast::Sender<Arc<FeedMessage>> {
        match table {
            Table::DocumentUpdates => &self.updates,
            Table::PresenceUpdates => &self.presence,
        }
    }
}

/// Write path and subscription source for every document's feeds.
pub struct FeedHub {
    store: Arc<dyn SyncStore>,
    feeds: RwLock<HashMap<DocumentId, Arc<DocumentFeed>>>,
    capacity: usize,
    presence_ttl: Duration,
    stats: Arc<AtomicHubStats>,
}

impl FeedHub {
    /// `capacity` is the number of live rows a subscriber may fall behind
    /// before it is evicted.
    pub fn new(store: Arc<dyn SyncStore>, capacity: usize, presence_ttl: Duration) -> Self {
        Self {
            store,
            feeds: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            presence_ttl,
            stats: Arc::new(AtomicHubStats::default()),
        }
    }

    pub fn store(&self) -> &Arc<dyn SyncStore> {
        &self.store
    }

    pub fn presence_ttl(&self) -> Duration {
        self.presence_ttl
    }

    /// Get or create the feed of a document.
    pub async fn feed(&self, doc_id: DocumentId) -> Arc<DocumentFeed> {
        {
            let feeds = self.feeds.read().await;
            if let Some(feed) = feeds.get(&doc_id) {
                return feed.clone();
            }
        }

        let mut feeds = self.feeds.write().await;
        if let Some(feed) = feeds.get(&doc_id) {
            return feed.clone();
        }
        let feed = Arc::new(DocumentFeed::new(self.capacity));
        feeds.insert(doc_id, feed.clone());
        debug!("Created feed for document {}", doc_id);
        feed
    }

    /// Run `op` against the store on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn SyncStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || op(store.as_ref()))
            .await
            .map_err(|e| SyncError::Storage(format!("store task failed: {e}")))?
            .map_err(SyncError::from)
    }

    fn publish(&self, feed: &DocumentFeed, table: Table, msg: FeedMessage) {
        let receivers = feed.sender(table).send(Arc::new(msg)).unwrap_or(0);
        self.stats.messages_published.fetch_add(1, Ordering::Relaxed);
        trace!("Published {} row to {} receivers", table, receivers);
    }

    /// Append to the update log and publish the row.
    pub async fn append_update(&self, doc_id: DocumentId, payload: &[u8]) -> Result<u64, SyncError> {
        let feed = self.feed(doc_id).await;
        let _commit = feed.commit.lock().await;
        let payload = payload.to_vec();
        let (seq, payload) = self
            .blocking(move |store| Ok((store.append_update(doc_id, &payload)?, payload)))
            .await?;
        self.publish(&feed, Table::DocumentUpdates, FeedMessage::Update { seq, payload });
        Ok(seq)
    }

    /// Upsert a client's presence row and publish it.
    pub async fn upsert_presence(
        &self,
        doc_id: DocumentId,
        client_id: ClientId,
        payload: &[u8],
    ) -> Result<PresenceRecord, SyncError> {
        let feed = self.feed(doc_id).await;
        let _commit = feed.commit.lock().await;
        let payload = payload.to_vec();
        let record = self
            .blocking(move |store| store.upsert_presence(doc_id, client_id, &payload, now_ms()))
            .await?;
        self.publish(&feed, Table::PresenceUpdates, presence_message(&record));
        Ok(record)
    }

    /// Delete a client's presence row and publish the tombstone.
    pub async fn delete_presence(&self, doc_id: DocumentId, client_id: ClientId) -> Result<u64, SyncError> {
        let feed = self.feed(doc_id).await;
        let _commit = feed.commit.lock().await;
        let version = self
            .blocking(move |store| store.delete_presence(doc_id, client_id))
            .await?;
        self.publish(
            &feed,
            Table::PresenceUpdates,
            FeedMessage::PresenceRemoved { client_id, version },
        );
        Ok(version)
    }

    /// Delete presence rows silent for longer than the presence TTL and
    /// publish their tombstones. Returns how many rows were removed.
    pub async fn sweep_stale_presence(&self) -> Result<usize, SyncError> {
        let ttl = self.presence_ttl;
        let candidates = self.blocking(move |store| store.stale_presence(now_ms(), ttl)).await?;
        let mut removed = 0;
        for candidate in candidates {
            let feed = self.feed(candidate.doc_id).await;
            let _commit = feed.commit.lock().await;
            let (doc_id, client_id) = (candidate.doc_id, candidate.client_id);
            let deleted = self
                .blocking(move |store| {
                    // The client may have refreshed since the scan.
                    let still_stale = store
                        .presence_rows(doc_id)?
                        .iter()
                        .any(|r| r.client_id == client_id && r.is_stale(now_ms(), ttl));
                    if !still_stale {
                        return Ok(None);
                    }
                    store.delete_presence(doc_id, client_id).map(Some)
                })
                .await?;
            let Some(version) = deleted else { continue };
            self.publish(
                &feed,
                Table::PresenceUpdates,
                FeedMessage::PresenceRemoved { client_id: candidate.client_id, version },
            );
            debug!(
                "Expired presence of client {} on document {}",
                candidate.client_id, candidate.doc_id
            );
            removed += 1;
        }
        Ok(removed)
    }

    /// Open a subscription: snapshot rows past `offset`, an `UpToDate`
    /// marker, then live rows.
    ///
    /// `offset` only applies to the update log; presence always starts from a
    /// full snapshot of the non-stale rows.
    pub async fn subscribe(
        &self,
        doc_id: DocumentId,
        table: Table,
        offset: u64,
    ) -> Result<Subscription, SyncError> {
        let feed = self.feed(doc_id).await;
        let live = feed.sender(table).subscribe();

        let (mut backlog, cursor) = match table {
            Table::DocumentUpdates => {
                let rows = self.blocking(move |store| store.updates_since(doc_id, offset)).await?;
                let cursor = rows.last().map_or(offset, |r| r.seq.max(offset));
                let backlog: VecDeque<Arc<FeedMessage>> = rows
                    .into_iter()
                    .map(|r| Arc::new(FeedMessage::Update { seq: r.seq, payload: r.payload }))
                    .collect();
                (backlog, cursor)
            }
            Table::PresenceUpdates => {
                let now = now_ms();
                let rows = self.blocking(move |store| store.presence_rows(doc_id)).await?;
                let cursor = rows.iter().map(|r| r.version).max().unwrap_or(0);
                let backlog: VecDeque<Arc<FeedMessage>> = rows
                    .iter()
                    .filter(|r| !r.is_stale(now, self.presence_ttl))
                    .map(|r| Arc::new(presence_message(r)))
                    .collect();
                (backlog, cursor)
            }
        };
        backlog.push_back(Arc::new(FeedMessage::UpToDate { cursor }));
        debug!(
            "Subscribed to {} of document {} ({} snapshot rows, cursor {})",
            table,
            doc_id,
            backlog.len() - 1,
            cursor
        );

        Ok(Subscription {
            doc_id,
            table,
            backlog,
            live,
            cursor,
            lagged: false,
            stats: self.stats.clone(),
            _feed: feed,
        })
    }

    /// Drop feeds nobody holds. Returns how many were dropped.
    pub async fn remove_idle(&self) -> usize {
        let mut feeds = self.feeds.write().await;
        let before = feeds.len();
        feeds.retain(|_, feed| Arc::strong_count(feed) > 1);
        before - feeds.len()
    }

    pub async fn feed_count(&self) -> usize {
        self.feeds.read().await.len()
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            active_feeds: self.feed_count().await,
            messages_published: self.stats.messages_published.load(Ordering::Relaxed),
            subscribers_evicted: self.stats.subscribers_evicted.load(Ordering::Relaxed),
        }
    }
}

fn presence_message(record: &PresenceRecord) -> FeedMessage {
    FeedMessage::Presence {
        client_id: record.client_id,
        version: record.version,
        updated_at_ms: record.updated_at_ms,
        payload: record.payload.clone(),
    }
}

/// One subscriber's view of a feed.
pub struct Subscription {
    doc_id: DocumentId,
    table: Table,
    backlog: VecDeque<Arc<FeedMessage>>,
    live: broadcast::Receiver<Arc<FeedMessage>>,
    cursor: u64,
    lagged: bool,
    stats: Arc<AtomicHubStats>,
    _feed: Arc<DocumentFeed>,
}

impl Subscription {
    /// Next message, or `None` once the subscription has ended (feed closed
    /// or subscriber evicted for lagging).
    pub async fn next(&mut self) -> Option<Arc<FeedMessage>> {
        if let Some(msg) = self.backlog.pop_front() {
            return Some(msg);
        }
        if self.lagged {
            return None;
        }
        loop {
            match self.live.recv().await {
                Ok(msg) => {
                    let position = msg.position();
                    if position <= self.cursor {
                        continue;
                    }
                    self.cursor = position;
                    return Some(msg);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        "Evicting {} subscriber of document {}: {} rows behind",
                        self.table, self.doc_id, skipped
                    );
                    self.lagged = true;
                    self.stats.subscribers_evicted.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Highest position delivered (or covered by the snapshot).
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn table(&self) -> Table {
        self.table
    }

    pub fn doc_id(&self) -> DocumentId {
        self.doc_id
    }
}

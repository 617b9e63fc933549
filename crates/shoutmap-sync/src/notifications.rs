//! The viewer's notification list.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use shoutmap_backend::{
    Binding, ChangeEvent, ChangeKind, NOTIFICATIONS_TABLE, NotificationRow, Query, Row,
};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::{ChannelLease, Optimistic, SyncContext, SyncError};

/// A notification addressed to the viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRecord {
    pub id: String,
    pub recipient_id: String,
    pub trigger_user_id: Option<String>,
    pub kind: String,
    pub resource_id: Option<String>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl From<NotificationRow> for NotificationRecord {
    fn from(row: NotificationRow) -> Self {
        Self {
            id: row.id,
            recipient_id: row.user_id,
            trigger_user_id: row.trigger_user_id,
            kind: row.kind,
            resource_id: row.resource_id,
            is_read: row.is_read,
            created_at: row.created_at,
        }
    }
}

/// Insert or replace by id, keeping newest first.
fn upsert(list: &mut Vec<NotificationRecord>, record: NotificationRecord) -> bool {
    if let Some(existing) = list.iter_mut().find(|n| n.id == record.id) {
        if *existing == record {
            return false;
        }
        *existing = record;
        return true;
    }
    let at = list.partition_point(|n| n.created_at >= record.created_at);
    list.insert(at, record);
    true
}

pub struct NotificationStore {
    ctx: Arc<SyncContext>,
    viewer: String,
    list: Optimistic<Vec<NotificationRecord>>,
    lease: ChannelLease,
    this: Weak<NotificationStore>,
}

impl NotificationStore {
    /// Open the store for the signed-in viewer and load the first page.
    pub async fn open(ctx: &Arc<SyncContext>) -> Result<Arc<Self>, SyncError> {
        let viewer = ctx.require_viewer()?.to_string();
        let lease = ctx.registry().get_or_create_channel("notifications");

        let store = Arc::new_cyclic(|this: &Weak<Self>| {
            let handler = this.clone();
            lease.on(Binding::all(NOTIFICATIONS_TABLE), move |event| {
                if let Some(store) = handler.upgrade() {
                    store.reconcile(event);
                }
            });
            Self {
                ctx: Arc::clone(ctx),
                viewer,
                list: Optimistic::new(Vec::new()),
                lease,
                this: this.clone(),
            }
        });

        if store.lease.should_subscribe {
            let _ = store.lease.channel.subscribe().await;
        }
        store.load().await?;
        Ok(store)
    }

    /// Newest first.
    pub fn notifications(&self) -> Vec<NotificationRecord> {
        self.list.get()
    }

    /// Unread among the loaded notifications. The badge uses the
    /// server-side count instead.
    pub fn unread_loaded(&self) -> usize {
        self.list.read(|list| list.iter().filter(|n| !n.is_read).count())
    }

    pub fn watch(&self) -> watch::Receiver<u64> {
        self.list.subscribe()
    }

    /// Load the newest page.
    #[tracing::instrument(skip(self))]
    pub async fn load(&self) -> Result<(), SyncError> {
        let attempts = self.ctx.config().refetch_attempts.max(1);
        let query = Query::table(NOTIFICATIONS_TABLE)
            .eq("user_id", self.viewer.as_str())
            .order_by("created_at", false)
            .limit(self.ctx.config().notification_page_size);

        for attempt in 1..=attempts {
            let version = self.list.version();
            let rows = self.ctx.backend().select(&query).await?;
            let mut fresh = Vec::with_capacity(rows.len());
            for row in rows {
                let row: NotificationRow = serde_json::from_value(Value::Object(row))?;
                upsert(&mut fresh, row.into());
            }
            if self.list.replace_if_unchanged(version, fresh) {
                return Ok(());
            }
            debug!(attempt, "notification load raced local changes");
        }
        warn!("notification load kept racing local changes");
        Ok(())
    }

    /// Mark one notification read.
    #[tracing::instrument(skip(self))]
    pub async fn mark_read(&self, id: &str) -> Result<(), SyncError> {
        let token = self.list.apply_optimistic(|list| {
            if let Some(n) = list.iter_mut().find(|n| n.id == id) {
                n.is_read = true;
            }
        });
        if token.snapshot().iter().any(|n| n.id == id && n.is_read) {
            self.list.confirm(token);
            return Ok(());
        }

        let query = Query::table(NOTIFICATIONS_TABLE)
            .eq("id", id)
            .eq("user_id", self.viewer.as_str());
        self.write_read_flag(query, token, Some(id)).await
    }

    /// Mark every notification read.
    #[tracing::instrument(skip(self))]
    pub async fn mark_all_read(&self) -> Result<(), SyncError> {
        let token = self
            .list
            .apply_optimistic(|list| list.iter_mut().for_each(|n| n.is_read = true));

        let query = Query::table(NOTIFICATIONS_TABLE)
            .eq("user_id", self.viewer.as_str())
            .eq("is_read", false);
        self.write_read_flag(query, token, None).await
    }

    async fn write_read_flag(
        &self,
        query: Query,
        token: crate::Token<Vec<NotificationRecord>>,
        only: Option<&str>,
    ) -> Result<(), SyncError> {
        let mut patch = Row::new();
        patch.insert("is_read".to_string(), json!(true));

        match self.ctx.backend().update(&query, patch).await {
            Ok(updated) => {
                self.list.confirm(token);
                trace!(updated = updated.len(), "marked notifications read");
                self.ctx.invalidation().trigger_count_refetch();
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "marking notifications read failed, restoring");
                // Put back only the flags this call flipped.
                self.list.compensate(token, |list, snapshot| {
                    let flipped = snapshot
                        .iter()
                        .filter(|n| !n.is_read && only.is_none_or(|id| n.id == id));
                    for before in flipped {
                        if let Some(n) = list.iter_mut().find(|n| n.id == before.id) {
                            n.is_read = false;
                        }
                    }
                });
                Err(e.into())
            }
        }
    }

    fn reconcile(&self, event: &ChangeEvent) {
        let changed = match event.kind {
            ChangeKind::Delete => match event.field("id") {
                Some(id) => self.list.update(|list| {
                    let before = list.len();
                    list.retain(|n| n.id != id);
                    before != list.len()
                }),
                None => {
                    self.spawn_load();
                    return;
                }
            },
            ChangeKind::Insert | ChangeKind::Update => {
                match event.field("user_id") {
                    Some(recipient) if recipient == self.viewer => {}
                    Some(_) => return,
                    None => {
                        debug!(kind = ?event.kind, "notification event without recipient, reloading");
                        self.spawn_load();
                        return;
                    }
                }
                match event.decode::<NotificationRow>() {
                    Ok(row) => self.list.update(|list| upsert(list, row.into())),
                    Err(e) => {
                        warn!(error = %e, "malformed notification event, reloading");
                        self.spawn_load();
                        return;
                    }
                }
            }
        };

        trace!(kind = ?event.kind, changed, "reconciled notification event");
        if changed {
            self.ctx.invalidation().trigger_count_refetch();
        }
    }

    fn spawn_load(&self) {
        let this = self.this.clone();
        crate::spawn_background("notification reload", async move {
            let Some(store) = this.upgrade() else {
                return;
            };
            if let Err(e) = store.load().await {
                warn!(error = %e, "notification reload failed");
            }
        });
    }

    pub async fn close(&self) {
        self.ctx.registry().safe_remove_channel(&self.lease).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{context, row, settle};
    use shoutmap_backend::{Backend, MemoryBackend};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn notification(id: &str, user: &str, at: &str) -> Row {
        row(json!({
            "id": id,
            "user_id": user,
            "trigger_user_id": "someone",
            "type": "shout_like",
            "resource_id": "s1",
            "is_read": false,
            "created_at": at
        }))
    }

    #[tokio::test]
    async fn test_load_newest_first_for_viewer_only() {
        let backend = MemoryBackend::new();
        backend.seed(NOTIFICATIONS_TABLE, notification("n1", "a", "2024-01-01T00:00:00Z"));
        backend.seed(NOTIFICATIONS_TABLE, notification("n2", "a", "2024-01-02T00:00:00Z"));
        backend.seed(NOTIFICATIONS_TABLE, notification("x", "b", "2024-01-03T00:00:00Z"));

        let ctx = context(&backend, Some("a"));
        let store = NotificationStore::open(&ctx).await.unwrap();
        let ids: Vec<_> = store.notifications().into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec!["n2", "n1"]);
    }

    #[tokio::test]
    async fn test_open_requires_viewer() {
        let backend = MemoryBackend::new();
        let ctx = context(&backend, None);
        assert!(matches!(
            NotificationStore::open(&ctx).await,
            Err(SyncError::NotSignedIn)
        ));
    }

    #[tokio::test]
    async fn test_insert_for_viewer_arrives_once_and_triggers_count() {
        let backend = MemoryBackend::new();
        let ctx = context(&backend, Some("a"));
        let store = NotificationStore::open(&ctx).await.unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let _r = ctx.invalidation().register_count_refetch(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let event = ChangeEvent::insert(
            NOTIFICATIONS_TABLE,
            notification("n1", "a", "2024-01-01T00:00:00Z"),
        );
        backend.emit(event.clone());
        backend.emit(event);
        backend.emit(ChangeEvent::insert(
            NOTIFICATIONS_TABLE,
            notification("n2", "b", "2024-01-01T00:00:00Z"),
        ));
        settle().await;

        assert_eq!(store.notifications().len(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mark_read_round_trip() {
        let backend = MemoryBackend::new();
        backend.seed(NOTIFICATIONS_TABLE, notification("n1", "a", "2024-01-01T00:00:00Z"));
        backend.seed(NOTIFICATIONS_TABLE, notification("n2", "a", "2024-01-02T00:00:00Z"));
        let ctx = context(&backend, Some("a"));
        let store = NotificationStore::open(&ctx).await.unwrap();

        store.mark_read("n1").await.unwrap();
        assert_eq!(store.unread_loaded(), 1);
        settle().await;
        assert_eq!(store.unread_loaded(), 1);
        assert_eq!(
            backend.count(&Query::table(NOTIFICATIONS_TABLE).eq("is_read", true)),
            1
        );

        store.mark_all_read().await.unwrap();
        settle().await;
        assert_eq!(store.unread_loaded(), 0);
    }

    #[tokio::test]
    async fn test_failed_mark_all_read_restores_flags() {
        let backend = MemoryBackend::new();
        backend.seed(NOTIFICATIONS_TABLE, notification("n1", "a", "2024-01-01T00:00:00Z"));
        let ctx = context(&backend, Some("a"));
        let store = NotificationStore::open(&ctx).await.unwrap();

        backend.fail_next(NOTIFICATIONS_TABLE, 1);
        assert!(store.mark_all_read().await.is_err());
        assert_eq!(store.unread_loaded(), 1);
    }

    #[tokio::test]
    async fn test_delete_event_removes_by_id() {
        let backend = MemoryBackend::new();
        backend.seed(NOTIFICATIONS_TABLE, notification("n1", "a", "2024-01-01T00:00:00Z"));
        let ctx = context(&backend, Some("a"));
        let store = NotificationStore::open(&ctx).await.unwrap();

        backend
            .delete(&Query::table(NOTIFICATIONS_TABLE).eq("id", "n1"))
            .await
            .unwrap();
        settle().await;
        assert!(store.notifications().is_empty());
    }
}

//! Comment threads for the shout or event currently on screen.
//!
//! The store follows one target at a time, held in a watch cell so event
//! handlers always filter against the live target. New comments appear
//! immediately as placeholders and are swapped for the confirmed row when
//! either the write response or the realtime event arrives, whichever
//! comes first. Confirmed rows are deduplicated by id.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use serde_json::Value;
use shoutmap_backend::{
    Binding, ChangeEvent, ChangeKind, CommentRow, EVENT_COMMENTS_TABLE, Query, Row,
    SHOUT_COMMENTS_TABLE,
};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::{ChannelLease, Optimistic, SyncContext, SyncError, Topic};

/// What a comment thread hangs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommentKind {
    Shout,
    Event,
}

impl CommentKind {
    pub fn table(&self) -> &'static str {
        match self {
            CommentKind::Shout => SHOUT_COMMENTS_TABLE,
            CommentKind::Event => EVENT_COMMENTS_TABLE,
        }
    }

    pub fn target_column(&self) -> &'static str {
        match self {
            CommentKind::Shout => "shout_id",
            CommentKind::Event => "event_id",
        }
    }

    pub fn channel_name(&self) -> &'static str {
        match self {
            CommentKind::Shout => "shout-comments",
            CommentKind::Event => "event-comments",
        }
    }

    pub fn topic(&self) -> Topic {
        match self {
            CommentKind::Shout => Topic::Shout,
            CommentKind::Event => Topic::Event,
        }
    }
}

/// A comment as shown in a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub id: String,
    pub parent_id: Option<String>,
    pub author_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl From<CommentRow> for Comment {
    fn from(row: CommentRow) -> Self {
        Self {
            id: row.id,
            parent_id: row.parent_id,
            author_id: row.user_id,
            content: row.content,
            created_at: row.created_at,
        }
    }
}

impl Comment {
    fn same_submission(&self, other: &Comment) -> bool {
        self.author_id == other.author_id
            && self.content == other.content
            && self.parent_id == other.parent_id
    }
}

/// Merge a confirmed comment into a thread.
///
/// Returns `false` if a comment with the same id is already present. The
/// comment is placed by `created_at`. With a `placeholder_prefix`, the
/// oldest placeholder for the same submission is removed first; rows that
/// arrive as events pass one, since they cannot name their placeholder.
fn merge_confirmed(
    list: &mut Vec<Comment>,
    comment: Comment,
    placeholder_prefix: Option<&str>,
) -> bool {
    if list.iter().any(|c| c.id == comment.id) {
        return false;
    }
    if let Some(prefix) = placeholder_prefix
        && let Some(pos) = list
            .iter()
            .position(|c| c.id.starts_with(prefix) && c.same_submission(&comment))
    {
        list.remove(pos);
    }
    let at = list.partition_point(|c| c.created_at <= comment.created_at);
    list.insert(at, comment);
    true
}

/// Comment thread of the current target.
pub struct CommentStore {
    kind: CommentKind,
    ctx: Arc<SyncContext>,
    target: watch::Sender<Option<String>>,
    comments: Optimistic<Vec<Comment>>,
    lease: ChannelLease,
    this: Weak<CommentStore>,
}

impl CommentStore {
    pub async fn open(ctx: &Arc<SyncContext>, kind: CommentKind) -> Arc<Self> {
        let lease = ctx.registry().get_or_create_channel(kind.channel_name());
        let (target, _) = watch::channel(None);

        let store = Arc::new_cyclic(|this: &Weak<Self>| {
            let handler = this.clone();
            lease.on(Binding::all(kind.table()), move |event| {
                if let Some(store) = handler.upgrade() {
                    store.reconcile(event);
                }
            });
            Self {
                kind,
                ctx: Arc::clone(ctx),
                target,
                comments: Optimistic::new(Vec::new()),
                lease,
                this: this.clone(),
            }
        });

        if store.lease.should_subscribe {
            let _ = store.lease.channel.subscribe().await;
        }
        store
    }

    pub fn target(&self) -> Option<String> {
        self.target.borrow().clone()
    }

    /// Watch the target cell.
    pub fn watch_target(&self) -> watch::Receiver<Option<String>> {
        self.target.subscribe()
    }

    /// Watch the thread for changes.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.comments.subscribe()
    }

    /// Current thread, oldest first.
    pub fn comments(&self) -> Vec<Comment> {
        self.comments.get()
    }

    fn placeholder_prefix(&self) -> &str {
        &self.ctx.config().placeholder_prefix
    }

    fn is_current(&self, target_id: &str) -> bool {
        self.target.borrow().as_deref() == Some(target_id)
    }

    /// Switch to another target and load its thread.
    #[tracing::instrument(skip(self), fields(kind = ?self.kind))]
    pub async fn set_target(&self, target_id: Option<&str>) -> Result<(), SyncError> {
        self.target.send_replace(target_id.map(str::to_string));
        self.comments.update(|list| list.clear());
        match target_id {
            Some(_) => self.load().await,
            None => Ok(()),
        }
    }

    /// Reload the thread from the backend, keeping unconfirmed placeholders.
    #[tracing::instrument(skip(self), fields(kind = ?self.kind))]
    pub async fn load(&self) -> Result<(), SyncError> {
        let attempts = self.ctx.config().refetch_attempts.max(1);

        for attempt in 1..=attempts {
            let Some(target_id) = self.target() else {
                return Ok(());
            };
            let version = self.comments.version();
            let pending: Vec<Comment> = self.comments.read(|list| {
                list.iter()
                    .filter(|c| self.ctx.config().is_placeholder(&c.id))
                    .cloned()
                    .collect()
            });

            let query = Query::table(self.kind.table())
                .eq(self.kind.target_column(), target_id.as_str())
                .order_by("created_at", true);
            let rows = self.ctx.backend().select(&query).await?;

            if !self.is_current(&target_id) {
                debug!(target = %target_id, "target changed during load, discarding");
                return Ok(());
            }

            let mut fresh = Vec::with_capacity(rows.len() + pending.len());
            for row in rows {
                let row: CommentRow = serde_json::from_value(Value::Object(row))?;
                merge_confirmed(&mut fresh, row.into(), None);
            }
            fresh.extend(pending);

            if self.comments.replace_if_unchanged(version, fresh) {
                return Ok(());
            }
            debug!(attempt, target = %target_id, "comment load raced local changes");
        }

        warn!(kind = ?self.kind, "comment load kept racing local changes");
        Ok(())
    }

    /// Post a top-level comment on the current target.
    pub async fn add_comment(&self, author_id: &str, content: &str) -> Result<Comment, SyncError> {
        self.submit(None, author_id, content).await
    }

    /// Post a reply to another comment on the current target.
    pub async fn add_reply(
        &self,
        parent_id: &str,
        author_id: &str,
        content: &str,
    ) -> Result<Comment, SyncError> {
        self.submit(Some(parent_id), author_id, content).await
    }

    #[tracing::instrument(skip(self, content), fields(kind = ?self.kind))]
    async fn submit(
        &self,
        parent_id: Option<&str>,
        author_id: &str,
        content: &str,
    ) -> Result<Comment, SyncError> {
        let target_id = self
            .target()
            .ok_or_else(|| SyncError::Rejected("no target selected".to_string()))?;
        let content = content.trim();
        if content.is_empty() {
            return Err(SyncError::Rejected("comment is empty".to_string()));
        }

        let placeholder = Comment {
            id: self.ctx.config().placeholder_id(),
            parent_id: parent_id.map(str::to_string),
            author_id: author_id.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
        };
        let placeholder_id = placeholder.id.clone();
        let token = self.comments.apply_optimistic(|list| list.push(placeholder));

        let mut row = Row::new();
        row.insert(
            self.kind.target_column().to_string(),
            Value::String(target_id.clone()),
        );
        row.insert("user_id".to_string(), Value::String(author_id.to_string()));
        row.insert("content".to_string(), Value::String(content.to_string()));
        if let Some(parent) = parent_id {
            row.insert("parent_id".to_string(), Value::String(parent.to_string()));
        }

        let stored = match self.ctx.backend().insert(self.kind.table(), row).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(target = %target_id, error = %e, "comment post failed, removing placeholder");
                self.comments
                    .compensate(token, |list, _| list.retain(|c| c.id != placeholder_id));
                return Err(e.into());
            }
        };
        self.comments.confirm(token);

        let comment: Comment = match serde_json::from_value::<CommentRow>(Value::Object(stored)) {
            Ok(row) => row.into(),
            Err(e) => {
                // Stored, but the echo is unusable: reload instead.
                warn!(error = %e, "malformed comment response, reloading thread");
                self.comments
                    .update(|list| list.retain(|c| c.id != placeholder_id));
                self.spawn_load();
                return Err(e.into());
            }
        };

        // Only our own placeholder goes; an identical post still in flight
        // keeps its own.
        self.comments.update(|list| {
            list.retain(|c| c.id != placeholder_id);
            if self.is_current(&target_id) {
                merge_confirmed(list, comment.clone(), None);
            }
        });
        debug!(target = %target_id, id = %comment.id, "comment posted");
        self.ctx.invalidation().trigger(self.kind.topic());
        Ok(comment)
    }

    /// Delete a confirmed comment. The comment disappears immediately and
    /// comes back if the delete fails.
    #[tracing::instrument(skip(self), fields(kind = ?self.kind))]
    pub async fn delete_comment(&self, comment_id: &str) -> Result<(), SyncError> {
        if self.ctx.config().is_placeholder(comment_id) {
            return Err(SyncError::Rejected("comment is not posted yet".to_string()));
        }
        if !self.comments.read(|list| list.iter().any(|c| c.id == comment_id)) {
            return Err(SyncError::Rejected(format!("unknown comment {}", comment_id)));
        }

        let token = self
            .comments
            .apply_optimistic(|list| list.retain(|c| c.id != comment_id));

        let query = Query::table(self.kind.table()).eq("id", comment_id);
        match self.ctx.backend().delete(&query).await {
            Ok(_) => {
                self.comments.confirm(token);
                self.ctx.invalidation().trigger(self.kind.topic());
                Ok(())
            }
            Err(e) => {
                warn!(id = %comment_id, error = %e, "comment delete failed, restoring");
                self.comments.compensate(token, |list, snapshot| {
                    if let Some(comment) = snapshot.iter().find(|c| c.id == comment_id) {
                        merge_confirmed(list, comment.clone(), None);
                    }
                });
                Err(e.into())
            }
        }
    }

    fn reconcile(&self, event: &ChangeEvent) {
        let Some(current) = self.target() else {
            return;
        };

        if event.kind == ChangeKind::Delete {
            // Ids are unique, so removing by id needs no target.
            if let Some(id) = event.field("id") {
                let removed = self.comments.update(|list| {
                    let before = list.len();
                    list.retain(|c| c.id != id);
                    before != list.len()
                });
                trace!(id = %id, removed, "reconciled comment delete");
            } else {
                warn!(table = %event.table, "comment delete without id, reloading");
                self.spawn_load();
            }
            return;
        }

        match event.field(self.kind.target_column()) {
            Some(target) if target == current => {}
            Some(_) => return,
            None => {
                debug!(kind = ?event.kind, "comment event without target, reloading");
                self.spawn_load();
                return;
            }
        }

        let comment: Comment = match event.decode::<CommentRow>() {
            Ok(row) => row.into(),
            Err(e) => {
                warn!(error = %e, "malformed comment event, reloading");
                self.spawn_load();
                return;
            }
        };

        let prefix = self.placeholder_prefix().to_string();
        match event.kind {
            ChangeKind::Insert => {
                let added = self
                    .comments
                    .update(|list| merge_confirmed(list, comment, Some(&prefix)));
                trace!(added, "reconciled comment insert");
            }
            ChangeKind::Update => {
                self.comments.update(|list| {
                    match list.iter_mut().find(|c| c.id == comment.id) {
                        Some(existing) => existing.content = comment.content,
                        None => {
                            merge_confirmed(list, comment, Some(&prefix));
                        }
                    }
                });
            }
            ChangeKind::Delete => {}
        }
    }

    fn spawn_load(&self) {
        let this = self.this.clone();
        crate::spawn_background("comment reload", async move {
            let Some(store) = this.upgrade() else {
                return;
            };
            if let Err(e) = store.load().await {
                warn!(kind = ?store.kind, error = %e, "comment reload failed");
            }
        });
    }

    /// Detach from the shared channel.
    pub async fn close(&self) {
        self.ctx.registry().safe_remove_channel(&self.lease).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{context, row, settle};
    use serde_json::json;
    use shoutmap_backend::MemoryBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn comment(id: &str, author: &str, content: &str, at: &str) -> Comment {
        Comment {
            id: id.to_string(),
            parent_id: None,
            author_id: author.to_string(),
            content: content.to_string(),
            created_at: at.parse().unwrap(),
        }
    }

    #[test]
    fn test_merge_dedupes_and_orders() {
        let mut list = vec![
            comment("1", "a", "first", "2024-01-01T00:00:00Z"),
            comment("3", "a", "third", "2024-01-03T00:00:00Z"),
        ];
        let second = comment("2", "b", "second", "2024-01-02T00:00:00Z");

        assert!(merge_confirmed(&mut list, second.clone(), Some("temp-")));
        assert!(!merge_confirmed(&mut list, second, Some("temp-")));

        let ids: Vec<_> = list.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_merge_replaces_matching_placeholder_only() {
        let mut list = vec![
            comment("temp-x", "a", "hello", "2024-01-05T00:00:00Z"),
            comment("temp-y", "a", "other", "2024-01-05T00:00:01Z"),
        ];
        merge_confirmed(
            &mut list,
            comment("9", "a", "hello", "2024-01-05T00:00:02Z"),
            Some("temp-"),
        );

        let ids: Vec<_> = list.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["temp-y", "9"]);
    }

    #[test]
    fn test_merge_without_prefix_keeps_placeholders() {
        let mut list = vec![comment("temp-x", "a", "hello", "2024-01-05T00:00:00Z")];
        merge_confirmed(
            &mut list,
            comment("9", "a", "hello", "2024-01-05T00:00:02Z"),
            None,
        );

        let ids: Vec<_> = list.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["temp-x", "9"]);
    }

    async fn open_on(backend: &Arc<MemoryBackend>, viewer: &str, shout: &str) -> Arc<CommentStore> {
        let ctx = context(backend, Some(viewer));
        let store = CommentStore::open(&ctx, CommentKind::Shout).await;
        store.set_target(Some(shout)).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_load_orders_existing_comments() {
        let backend = MemoryBackend::new();
        for (id, at) in [("c2", "2024-01-02T00:00:00Z"), ("c1", "2024-01-01T00:00:00Z")] {
            backend.seed(
                SHOUT_COMMENTS_TABLE,
                row(json!({"id": id, "shout_id": "s", "user_id": "b", "content": id, "created_at": at})),
            );
        }
        backend.seed(
            SHOUT_COMMENTS_TABLE,
            row(json!({"id": "other", "shout_id": "t", "user_id": "b", "content": "x"})),
        );

        let store = open_on(&backend, "a", "s").await;
        let ids: Vec<_> = store.comments().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
    }

    #[tokio::test]
    async fn test_add_comment_ends_with_single_confirmed_row() {
        let backend = MemoryBackend::new();
        let store = open_on(&backend, "a", "s").await;

        let posted = store.add_comment("a", "  nice spot ").await.unwrap();
        assert_eq!(posted.content, "nice spot");
        settle().await;

        let comments = store.comments();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].id, posted.id);
    }

    #[tokio::test]
    async fn test_event_before_response_still_single_comment() {
        let backend = MemoryBackend::new();
        let writer = open_on(&backend, "a", "s").await;
        let reader = open_on(&backend, "b", "s").await;

        // The reader sees the event first; the writer gets it after its response.
        writer.add_comment("a", "hello").await.unwrap();
        settle().await;

        assert_eq!(writer.comments().len(), 1);
        assert_eq!(reader.comments().len(), 1);
        assert_eq!(reader.comments()[0].author_id, "a");
    }

    #[tokio::test]
    async fn test_duplicate_insert_event_is_ignored() {
        let backend = MemoryBackend::new();
        let store = open_on(&backend, "a", "s").await;
        let event = ChangeEvent::insert(
            SHOUT_COMMENTS_TABLE,
            row(json!({
                "id": "c1",
                "shout_id": "s",
                "user_id": "b",
                "content": "hey",
                "created_at": "2024-01-01T00:00:00Z"
            })),
        );

        backend.emit(event.clone());
        backend.emit(event);
        settle().await;
        assert_eq!(store.comments().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_post_removes_placeholder() {
        let backend = MemoryBackend::new();
        backend.seed(
            SHOUT_COMMENTS_TABLE,
            row(json!({"id": "c1", "shout_id": "s", "user_id": "b", "content": "first"})),
        );
        let store = open_on(&backend, "a", "s").await;
        let before = store.comments();

        backend.fail_next(SHOUT_COMMENTS_TABLE, 1);
        let err = store.add_comment("a", "lost").await.unwrap_err();
        assert!(matches!(err, SyncError::Backend(_)));
        assert_eq!(store.comments(), before);
    }

    #[tokio::test]
    async fn test_empty_comment_rejected_without_placeholder() {
        let backend = MemoryBackend::new();
        let store = open_on(&backend, "a", "s").await;

        let err = store.add_comment("a", "   ").await.unwrap_err();
        assert!(matches!(err, SyncError::Rejected(_)));
        assert!(store.comments().is_empty());
        assert!(backend.rows(SHOUT_COMMENTS_TABLE).is_empty());
    }

    #[tokio::test]
    async fn test_events_for_other_targets_are_filtered() {
        let backend = MemoryBackend::new();
        let on_s = open_on(&backend, "a", "s").await;
        let on_t = open_on(&backend, "b", "t").await;

        on_t.add_comment("b", "over here").await.unwrap();
        settle().await;

        assert!(on_s.comments().is_empty());
        assert_eq!(on_t.comments().len(), 1);
    }

    #[tokio::test]
    async fn test_switching_target_filters_live() {
        let backend = MemoryBackend::new();
        let writer = open_on(&backend, "a", "t").await;
        let reader = open_on(&backend, "b", "s").await;

        reader.set_target(Some("t")).await.unwrap();
        writer.add_comment("a", "now you see me").await.unwrap();
        settle().await;

        assert_eq!(reader.comments().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_comment_is_optimistic_and_propagates() {
        let backend = MemoryBackend::new();
        let writer = open_on(&backend, "a", "s").await;
        let reader = open_on(&backend, "b", "s").await;
        let posted = writer.add_comment("a", "oops").await.unwrap();
        settle().await;
        assert_eq!(reader.comments().len(), 1);

        writer.delete_comment(&posted.id).await.unwrap();
        assert!(writer.comments().is_empty());
        settle().await;
        assert!(reader.comments().is_empty());
    }

    #[tokio::test]
    async fn test_failed_delete_restores_comment() {
        let backend = MemoryBackend::new();
        backend.seed(
            SHOUT_COMMENTS_TABLE,
            row(json!({"id": "c1", "shout_id": "s", "user_id": "a", "content": "keep"})),
        );
        let store = open_on(&backend, "a", "s").await;
        let before = store.comments();

        backend.fail_next(SHOUT_COMMENTS_TABLE, 1);
        assert!(store.delete_comment("c1").await.is_err());
        assert_eq!(store.comments(), before);
        assert!(matches!(
            store.delete_comment("temp-123").await,
            Err(SyncError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_update_event_edits_content() {
        let backend = MemoryBackend::new();
        backend.seed(
            SHOUT_COMMENTS_TABLE,
            row(json!({"id": "c1", "shout_id": "s", "user_id": "a", "content": "typo"})),
        );
        let store = open_on(&backend, "a", "s").await;

        shoutmap_backend::Backend::update(
            backend.as_ref(),
            &Query::table(SHOUT_COMMENTS_TABLE).eq("id", "c1"),
            row(json!({"content": "fixed"})),
        )
        .await
        .unwrap();
        settle().await;

        assert_eq!(store.comments()[0].content, "fixed");
    }

    #[tokio::test]
    async fn test_post_triggers_topic_refetch() {
        let backend = MemoryBackend::new();
        let ctx = context(&backend, Some("a"));
        let store = CommentStore::open(&ctx, CommentKind::Shout).await;
        store.set_target(Some("s")).await.unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let _registration = ctx.invalidation().register_shout_refetch(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let posted = store.add_comment("a", "pin counts should move").await.unwrap();
        store.delete_comment(&posted.id).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_target_rejects_post() {
        let backend = MemoryBackend::new();
        let ctx = context(&backend, Some("a"));
        let store = CommentStore::open(&ctx, CommentKind::Event).await;

        let err = store.add_comment("a", "hello").await.unwrap_err();
        assert!(matches!(err, SyncError::Rejected(_)));
    }
}

//! Like counts and the viewer's own like flag per target.
//!
//! Each tracked target has its own [`Optimistic`] cell. Toggles are applied
//! locally before the write goes out and rolled back to the captured
//! snapshot if it fails.
//!
//! Confirmed insert/delete events for the whole like table arrive over a
//! shared channel and are filtered down to tracked targets. The viewer's
//! own events are recognised by the `viewer_has_liked` flag: an insert by
//! the viewer on a target already liked locally is the echo of our own
//! toggle and changes nothing. Events missing the target or actor column
//! (delete payloads often carry only the primary key) trigger a refetch
//! instead of a guess.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde_json::Value;
use shoutmap_backend::{
    Binding, COMMENT_LIKES_TABLE, ChangeEvent, ChangeKind, EVENT_LIKES_TABLE, Query, Row,
    SHOUT_LIKES_TABLE, value_as_id,
};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::{ChannelLease, Optimistic, Registration, SyncContext, SyncError, Topic};

/// What a like points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LikeKind {
    Shout,
    Event,
    Comment,
}

impl LikeKind {
    pub fn table(&self) -> &'static str {
        match self {
            LikeKind::Shout => SHOUT_LIKES_TABLE,
            LikeKind::Event => EVENT_LIKES_TABLE,
            LikeKind::Comment => COMMENT_LIKES_TABLE,
        }
    }

    /// Column holding the liked target's id.
    pub fn target_column(&self) -> &'static str {
        match self {
            LikeKind::Shout => "shout_id",
            LikeKind::Event => "event_id",
            LikeKind::Comment => "comment_id",
        }
    }

    pub fn channel_name(&self) -> &'static str {
        match self {
            LikeKind::Shout => "shout-likes",
            LikeKind::Event => "event-likes",
            LikeKind::Comment => "comment-likes",
        }
    }

    /// Refetch topic covering this kind's targets.
    pub fn topic(&self) -> Option<Topic> {
        match self {
            LikeKind::Shout => Some(Topic::Shout),
            LikeKind::Event => Some(Topic::Event),
            LikeKind::Comment => None,
        }
    }
}

/// Like count for one target, plus whether the viewer is among the likers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LikeState {
    pub target_id: String,
    pub count: u64,
    pub viewer_has_liked: bool,
}

impl LikeState {
    pub fn new(target_id: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            ..Default::default()
        }
    }

    /// Flip the viewer's like.
    pub fn toggle(&mut self) {
        self.viewer_has_liked = !self.viewer_has_liked;
        if self.viewer_has_liked {
            self.count += 1;
        } else {
            self.count = self.count.saturating_sub(1);
        }
    }

    /// Apply a confirmed like insert. Returns whether the state changed.
    pub fn apply_insert(&mut self, by_viewer: bool) -> bool {
        if by_viewer {
            if self.viewer_has_liked {
                return false;
            }
            // Liked from another of the viewer's devices.
            self.viewer_has_liked = true;
        }
        self.count += 1;
        true
    }

    /// Apply a confirmed like delete. Returns whether the state changed.
    pub fn apply_delete(&mut self, by_viewer: bool) -> bool {
        if by_viewer {
            if !self.viewer_has_liked {
                return false;
            }
            self.viewer_has_liked = false;
        }
        self.count = self.count.saturating_sub(1);
        true
    }
}

type Cell = Arc<Optimistic<LikeState>>;

/// Like state for every tracked target of one [`LikeKind`].
pub struct LikeStore {
    kind: LikeKind,
    ctx: Arc<SyncContext>,
    targets: DashMap<String, Cell>,
    lease: ChannelLease,
    _refetch: Option<Registration>,
    this: Weak<LikeStore>,
}

impl LikeStore {
    /// Open a store and attach it to the shared like channel.
    pub async fn open(ctx: &Arc<SyncContext>, kind: LikeKind) -> Arc<Self> {
        let lease = ctx.registry().get_or_create_channel(kind.channel_name());

        let store = Arc::new_cyclic(|this: &Weak<Self>| {
            for change in [ChangeKind::Insert, ChangeKind::Delete] {
                let this = this.clone();
                lease.on(Binding::new(kind.table(), change), move |event| {
                    if let Some(store) = this.upgrade() {
                        store.reconcile(event);
                    }
                });
            }

            let refetch = kind.topic().map(|topic| {
                let this = this.clone();
                ctx.invalidation().register(topic, move || {
                    if let Some(store) = this.upgrade() {
                        store.spawn_refresh(store.tracked());
                    }
                })
            });

            Self {
                kind,
                ctx: Arc::clone(ctx),
                targets: DashMap::new(),
                lease,
                _refetch: refetch,
                this: this.clone(),
            }
        });

        if store.lease.should_subscribe {
            // Join failures are logged by the channel; counts still load by refetch.
            let _ = store.lease.channel.subscribe().await;
        }
        store
    }

    pub fn kind(&self) -> LikeKind {
        self.kind
    }

    fn cell(&self, target_id: &str) -> Option<Cell> {
        self.targets.get(target_id).map(|c| Arc::clone(c.value()))
    }

    /// Cell for a target, and whether it was just created.
    fn cell_or_insert(&self, target_id: &str) -> (Cell, bool) {
        let mut created = false;
        let entry = self.targets.entry(target_id.to_string()).or_insert_with(|| {
            created = true;
            Arc::new(Optimistic::new(LikeState::new(target_id)))
        });
        (Arc::clone(entry.value()), created)
    }

    /// Start tracking a target and load its current state.
    #[tracing::instrument(skip(self), fields(kind = ?self.kind))]
    pub async fn track(&self, target_id: &str) -> Result<LikeState, SyncError> {
        let (cell, _) = self.cell_or_insert(target_id);
        self.refresh_targets(vec![target_id.to_string()]).await?;
        Ok(cell.get())
    }

    /// Track many targets at once with a single fetch.
    #[tracing::instrument(skip(self, target_ids), fields(kind = ?self.kind, targets = target_ids.len()))]
    pub async fn track_many(&self, target_ids: &[String]) -> Result<(), SyncError> {
        for id in target_ids {
            self.cell_or_insert(id);
        }
        self.refresh_targets(target_ids.to_vec()).await
    }

    /// Stop tracking a target. Events for it are ignored from now on.
    pub fn untrack(&self, target_id: &str) -> bool {
        self.targets.remove(target_id).is_some()
    }

    pub fn tracked(&self) -> Vec<String> {
        self.targets.iter().map(|t| t.key().clone()).collect()
    }

    /// Current state of a tracked target.
    pub fn get_likes(&self, target_id: &str) -> Option<LikeState> {
        self.cell(target_id).map(|c| c.get())
    }

    /// Watch a tracked target for changes.
    pub fn watch(&self, target_id: &str) -> Option<watch::Receiver<u64>> {
        self.cell(target_id).map(|c| c.subscribe())
    }

    /// Like or unlike a target as the viewer.
    ///
    /// The local state flips before the write is sent. If the write fails
    /// the state is restored to exactly what it was before this call and
    /// the error is returned for the caller to surface.
    #[tracing::instrument(skip(self), fields(kind = ?self.kind))]
    pub async fn toggle_like(&self, target_id: &str) -> Result<LikeState, SyncError> {
        let viewer = self.ctx.require_viewer()?.to_string();
        let (cell, created) = self.cell_or_insert(target_id);
        if created {
            self.refresh_targets(vec![target_id.to_string()]).await?;
        }

        let token = cell.apply_optimistic(LikeState::toggle);
        let liking = !token.snapshot().viewer_has_liked;
        let backend = self.ctx.backend();

        let result = if liking {
            backend
                .insert(self.kind.table(), self.like_row(target_id, &viewer))
                .await
                .map(|_| ())
        } else {
            let query = Query::table(self.kind.table())
                .eq(self.kind.target_column(), target_id)
                .eq("user_id", viewer.as_str());
            backend.delete(&query).await.map(|removed| {
                if removed.is_empty() {
                    // Nothing to delete: our view of the server was stale.
                    debug!(target = %target_id, "unlike removed no rows, refetching");
                    self.spawn_refresh(vec![target_id.to_string()]);
                }
            })
        };

        match result {
            Ok(()) => {
                cell.confirm(token);
                debug!(target = %target_id, liking, "like toggled");
                Ok(cell.get())
            }
            Err(e) => {
                warn!(target = %target_id, error = %e, "like write failed, rolling back");
                cell.rollback(token);
                Err(e.into())
            }
        }
    }

    fn like_row(&self, target_id: &str, viewer: &str) -> Row {
        let mut row = Row::new();
        row.insert(
            self.kind.target_column().to_string(),
            Value::String(target_id.to_string()),
        );
        row.insert("user_id".to_string(), Value::String(viewer.to_string()));
        row
    }

    /// Fold a confirmed change event into the tracked state.
    fn reconcile(&self, event: &ChangeEvent) {
        let target = event.field(self.kind.target_column());
        let actor = event.field("user_id");

        let (target, actor) = match (target, actor) {
            (Some(target), Some(actor)) => (target, actor),
            (Some(target), None) => {
                if self.targets.contains_key(&target) {
                    debug!(target = %target, kind = ?event.kind, "like event without actor, refetching");
                    self.spawn_refresh(vec![target]);
                }
                return;
            }
            (None, _) => {
                debug!(kind = ?event.kind, "like event without target, refetching all tracked");
                self.spawn_refresh(self.tracked());
                return;
            }
        };

        let Some(cell) = self.cell(&target) else {
            trace!(target = %target, "like event for untracked target");
            return;
        };

        let by_viewer = self.ctx.viewer() == Some(actor.as_str());
        let changed = cell.update(|state| match event.kind {
            ChangeKind::Insert => state.apply_insert(by_viewer),
            ChangeKind::Delete => state.apply_delete(by_viewer),
            ChangeKind::Update => false,
        });
        trace!(target = %target, kind = ?event.kind, by_viewer, changed, "reconciled like event");
    }

    fn spawn_refresh(&self, target_ids: Vec<String>) {
        if target_ids.is_empty() {
            return;
        }
        let this = self.this.clone();
        crate::spawn_background("like refetch", async move {
            let Some(store) = this.upgrade() else {
                return;
            };
            if let Err(e) = store.refresh_targets(target_ids).await {
                warn!(kind = ?store.kind, error = %e, "like refetch failed");
            }
        });
    }

    /// Reload the server state of one tracked target.
    pub async fn refresh(&self, target_id: &str) -> Result<(), SyncError> {
        self.refresh_targets(vec![target_id.to_string()]).await
    }

    /// Reload tracked targets from the like table.
    ///
    /// A target that changed locally while the fetch was in flight is not
    /// overwritten; it is fetched again, up to the configured attempts.
    async fn refresh_targets(&self, mut target_ids: Vec<String>) -> Result<(), SyncError> {
        let attempts = self.ctx.config().refetch_attempts.max(1);

        for attempt in 1..=attempts {
            let cells: Vec<(String, Cell, u64)> = target_ids
                .iter()
                .filter_map(|id| {
                    self.cell(id).map(|cell| {
                        let version = cell.version();
                        (id.clone(), cell, version)
                    })
                })
                .collect();
            if cells.is_empty() {
                return Ok(());
            }

            let query = Query::table(self.kind.table()).is_in(
                self.kind.target_column(),
                cells.iter().map(|(id, _, _)| id.clone()),
            );
            let rows = self.ctx.backend().select(&query).await?;
            let mut fresh = self.aggregate(&rows);

            let mut stale = Vec::new();
            for (id, cell, version) in cells {
                let state = fresh.remove(&id).unwrap_or_else(|| LikeState::new(id.as_str()));
                if !cell.replace_if_unchanged(version, state) {
                    stale.push(id);
                }
            }
            if stale.is_empty() {
                return Ok(());
            }
            debug!(attempt, stale = stale.len(), "like refetch raced local changes");
            target_ids = stale;
        }

        warn!(
            kind = ?self.kind,
            targets = target_ids.len(),
            "like refetch kept racing local changes, keeping local state"
        );
        Ok(())
    }

    fn aggregate(&self, rows: &[Row]) -> HashMap<String, LikeState> {
        let viewer = self.ctx.viewer();
        let mut states: HashMap<String, LikeState> = HashMap::new();
        for row in rows {
            let Some(target) = row.get(self.kind.target_column()).and_then(value_as_id) else {
                continue;
            };
            let by_viewer = viewer.is_some()
                && row.get("user_id").and_then(value_as_id).as_deref() == viewer;
            let state = states
                .entry(target.clone())
                .or_insert_with(|| LikeState::new(target));
            state.count += 1;
            state.viewer_has_liked |= by_viewer;
        }
        states
    }

    /// Detach from the shared channel.
    pub async fn close(&self) {
        self.ctx.registry().safe_remove_channel(&self.lease).await;
    }
}

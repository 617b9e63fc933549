//! Simulate command: two viewers on one in-memory backend.
//!
//! Alice owns the shout. Bob likes and comments on it, Alice replies and
//! likes it herself, and the server-side notification rows are written the
//! way the hosted triggers would. Both sessions print what they converged
//! on at the end.

use std::sync::Arc;
use std::time::Duration;

use miette::Result;
use serde_json::{Value, json};
use tracing::{info, warn};

use shoutmap_backend::{
    Backend, MemoryBackend, NOTIFICATIONS_TABLE, PUBLIC_PROFILES_RPC, Query, Row,
    SHOUT_LIKES_TABLE, UNREAD_NOTIFICATION_COUNT_RPC,
};
use shoutmap_sync::{
    CommentKind, CommentStore, CounterKind, LikeKind, LikeStore, NotificationStore, ProfileCache,
    ServerCounter, SyncContext,
};

/// Time given to realtime events and refetches to land.
const SETTLE: Duration = Duration::from_millis(50);

/// One simulated signed-in client.
struct Session {
    user: String,
    ctx: Arc<SyncContext>,
    likes: Arc<LikeStore>,
    comments: Arc<CommentStore>,
    notifications: Arc<NotificationStore>,
    unread: Arc<ServerCounter>,
}

impl Session {
    async fn open(backend: &Arc<MemoryBackend>, user: &str, shout: &str) -> Result<Self> {
        let ctx = SyncContext::new(backend.clone(), backend.connect(), Some(user.to_string()));

        let likes = LikeStore::open(&ctx, LikeKind::Shout).await;
        likes.track(shout).await.map_err(|e| miette::miette!("{}", e))?;

        let comments = CommentStore::open(&ctx, CommentKind::Shout).await;
        comments
            .set_target(Some(shout))
            .await
            .map_err(|e| miette::miette!("{}", e))?;

        let notifications = NotificationStore::open(&ctx)
            .await
            .map_err(|e| miette::miette!("{}", e))?;
        let unread = ServerCounter::open(&ctx, CounterKind::UnreadNotifications)
            .await
            .map_err(|e| miette::miette!("{}", e))?;

        Ok(Self {
            user: user.to_string(),
            ctx,
            likes,
            comments,
            notifications,
            unread,
        })
    }

    async fn close(&self) {
        self.likes.close().await;
        self.comments.close().await;
        self.notifications.close().await;
        self.unread.close().await;
    }

    async fn report(&self, shout: &str) -> Result<()> {
        let profiles = ProfileCache::new(&self.ctx);
        let comments = self.comments.comments();
        let authors: Vec<String> = comments.iter().map(|c| c.author_id.clone()).collect();
        let names = profiles
            .fetch(&authors)
            .await
            .map_err(|e| miette::miette!("{}", e))?;

        let likes = self.likes.get_likes(shout).unwrap_or_default();
        println!("== {} ==", self.user);
        println!(
            "  likes: {} (liked by me: {})",
            likes.count, likes.viewer_has_liked
        );
        for comment in &comments {
            let author = names
                .get(&comment.author_id)
                .map(|p| p.username.as_str())
                .unwrap_or(comment.author_id.as_str());
            let indent = if comment.parent_id.is_some() { "    " } else { "  " };
            println!("{}{}: {}", indent, author, comment.content);
        }
        println!(
            "  notifications: {} loaded, {} unread (server count {})",
            self.notifications.notifications().len(),
            self.notifications.unread_loaded(),
            self.unread.get()
        );
        Ok(())
    }
}

fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap_or_default()
}

fn register_functions(backend: &MemoryBackend) {
    backend.register_rpc(UNREAD_NOTIFICATION_COUNT_RPC, |db, args| {
        let user = args["p_user_id"].as_str().unwrap_or_default();
        let query = Query::table(NOTIFICATIONS_TABLE)
            .eq("user_id", user)
            .eq("is_read", false);
        Ok(json!(db.count(&query)))
    });
    backend.register_rpc(PUBLIC_PROFILES_RPC, |_, args| {
        let profiles: Vec<Value> = args["user_ids"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .map(|id| json!({"id": id, "username": format!("@{}", id)}))
            .collect();
        Ok(Value::Array(profiles))
    });
}

/// What the hosted notification triggers would insert.
async fn notify(
    backend: &MemoryBackend,
    recipient: &str,
    actor: &str,
    kind: &str,
    shout: &str,
) -> Result<()> {
    backend
        .insert(
            NOTIFICATIONS_TABLE,
            row(json!({
                "user_id": recipient,
                "trigger_user_id": actor,
                "type": kind,
                "resource_id": shout,
                "is_read": false
            })),
        )
        .await
        .map_err(|e| miette::miette!("failed to write notification: {}", e))?;
    Ok(())
}

pub async fn run(shout: &str, fail_first_like: bool) -> Result<()> {
    let backend = MemoryBackend::new();
    backend.add_unique(SHOUT_LIKES_TABLE, &["shout_id", "user_id"]);
    register_functions(&backend);

    let alice = Session::open(&backend, "alice", shout).await?;
    let bob = Session::open(&backend, "bob", shout).await?;
    info!(shout, "sessions open");

    if fail_first_like {
        backend.fail_next(SHOUT_LIKES_TABLE, 1);
        match bob.likes.toggle_like(shout).await {
            Ok(_) => warn!("injected failure did not trigger"),
            Err(e) => info!(error = %e, "like failed and was rolled back"),
        }
    }

    bob.likes
        .toggle_like(shout)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    notify(&backend, "alice", "bob", "shout_like", shout).await?;

    let question = bob
        .comments
        .add_comment("bob", "Is this spot open late?")
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    notify(&backend, "alice", "bob", "shout_comment", shout).await?;
    tokio::time::sleep(SETTLE).await;

    alice
        .comments
        .add_reply(&question.id, "alice", "Until midnight on weekends.")
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    notify(&backend, "bob", "alice", "comment_reply", shout).await?;
    alice
        .likes
        .toggle_like(shout)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    tokio::time::sleep(SETTLE).await;

    info!(unread = alice.unread.get(), "alice before reading");
    alice
        .notifications
        .mark_all_read()
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    tokio::time::sleep(SETTLE).await;

    alice.report(shout).await?;
    bob.report(shout).await?;

    alice.close().await;
    bob.close().await;
    Ok(())
}

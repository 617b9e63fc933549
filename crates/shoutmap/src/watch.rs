//! Watch command: follow one shout on a live backend until Ctrl-C.

use std::sync::Arc;

use miette::Result;
use tokio::sync::watch;
use tracing::{error, info};

use shoutmap_backend::{BackendConfig, RealtimeSocket, RestClient};
use shoutmap_sync::{
    CommentKind, CommentStore, CounterKind, LikeKind, LikeStore, ServerCounter, SyncContext,
};

/// Wait for the next change, or forever when there is nothing to watch.
async fn changed(rx: &mut Option<watch::Receiver<u64>>) -> bool {
    match rx {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

async fn open_counter(ctx: &Arc<SyncContext>, kind: CounterKind) -> Option<Arc<ServerCounter>> {
    match ServerCounter::open(ctx, kind).await {
        Ok(counter) => {
            info!(kind = ?kind, count = counter.get(), "counter loaded");
            Some(counter)
        }
        Err(e) => {
            error!(kind = ?kind, error = %e, "failed to open counter");
            None
        }
    }
}

pub async fn run(
    url: &str,
    anon_key: &str,
    access_token: Option<String>,
    user_id: Option<String>,
    shout: &str,
) -> Result<()> {
    let mut config = BackendConfig::new(url, anon_key);
    if let Some(token) = access_token {
        config = config.with_access_token(token);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (socket, socket_handle) = RealtimeSocket::connect(&config, shutdown_rx);
    let ctx = SyncContext::new(
        Arc::new(RestClient::new(config)),
        Arc::new(socket),
        user_id,
    );

    let likes = LikeStore::open(&ctx, LikeKind::Shout).await;
    let state = likes
        .track(shout)
        .await
        .map_err(|e| miette::miette!("failed to load likes: {}", e))?;
    info!(shout, count = state.count, liked = state.viewer_has_liked, "likes loaded");

    let comments = CommentStore::open(&ctx, CommentKind::Shout).await;
    comments
        .set_target(Some(shout))
        .await
        .map_err(|e| miette::miette!("failed to load comments: {}", e))?;
    info!(shout, comments = comments.comments().len(), "comments loaded");

    let (notifications, messages) = if ctx.viewer().is_some() {
        (
            open_counter(&ctx, CounterKind::UnreadNotifications).await,
            open_counter(&ctx, CounterKind::UnreadMessages).await,
        )
    } else {
        (None, None)
    };

    let mut likes_rx = likes.watch(shout);
    let mut comments_rx = Some(comments.watch());
    let mut notifications_rx = notifications.as_ref().map(|c| c.watch());
    let mut messages_rx = messages.as_ref().map(|c| c.watch());

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("received shutdown signal");
                break;
            }
            alive = changed(&mut likes_rx) => {
                if !alive {
                    likes_rx = None;
                    continue;
                }
                if let Some(state) = likes.get_likes(shout) {
                    info!(count = state.count, liked = state.viewer_has_liked, "likes changed");
                }
            }
            alive = changed(&mut comments_rx) => {
                if !alive {
                    comments_rx = None;
                    continue;
                }
                let thread = comments.comments();
                if let Some(latest) = thread.last() {
                    info!(
                        comments = thread.len(),
                        author = %latest.author_id,
                        latest = %latest.content,
                        "comments changed"
                    );
                } else {
                    info!(comments = 0, "comments changed");
                }
            }
            alive = changed(&mut notifications_rx) => {
                if !alive {
                    notifications_rx = None;
                    continue;
                }
                if let Some(counter) = &notifications {
                    info!(unread = counter.get(), "unread notifications changed");
                }
            }
            alive = changed(&mut messages_rx) => {
                if !alive {
                    messages_rx = None;
                    continue;
                }
                if let Some(counter) = &messages {
                    info!(unread = counter.get(), "unread messages changed");
                }
            }
        }
    }

    likes.close().await;
    comments.close().await;
    for counter in notifications.iter().chain(messages.iter()) {
        counter.close().await;
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = socket_handle.await {
        error!(error = %e, "realtime socket task panicked");
    }
    Ok(())
}

//! Realtime cache synchronization for shoutmap.
//!
//! Client-side caches for likes, comments, notifications and unread counts
//! kept consistent with the backend while many users mutate the same rows.
//!
//! ## Pieces
//!
//! - **[`ChannelRegistry`]**: one shared realtime channel per name, leased
//!   by every store that listens to it
//! - **[`Optimistic`]**: local-first mutations with snapshot rollback
//! - **Stores** ([`LikeStore`], [`CommentStore`], [`NotificationStore`]):
//!   optimistic writes plus reconciliation of confirmed change events
//! - **[`InvalidationBus`]**: refetch callbacks shared across features
//! - **[`ServerCounter`]**: unread counts refetched from the server
//!
//! Everything hangs off a [`SyncContext`] created once per session.

mod channel;
mod comments;
mod config;
mod context;
mod counters;
mod error;
mod invalidation;
mod likes;
mod notifications;
mod optimistic;
mod profiles;

pub use channel::{Channel, ChannelLease, ChannelRegistry, ChannelState, Handler};
pub use comments::{Comment, CommentKind, CommentStore};
pub use config::SyncConfig;
pub use context::SyncContext;
pub use counters::{CounterKind, ServerCounter};
pub use error::SyncError;
pub use invalidation::{InvalidationBus, InvalidationHandle, Registration, Topic};
pub use likes::{LikeKind, LikeState, LikeStore};
pub use notifications::{NotificationRecord, NotificationStore};
pub use optimistic::{Optimistic, Token};
pub use profiles::ProfileCache;

use std::future::Future;

use tracing::warn;

/// Spawn fire-and-forget work on the current runtime, if there is one.
pub(crate) fn spawn_background<F>(task: &'static str, future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => warn!(task, "no async runtime; background task skipped"),
    }
}

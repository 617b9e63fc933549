//! Unread counters.
//!
//! Counts come from server functions, never from adding up events: the
//! client misses events while offline and other devices change read state.
//! Any event on a relevant table (or a `Count` refetch trigger) schedules a
//! refetch. The only local arithmetic is [`ServerCounter::clear_thread`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use serde_json::{Value, json};
use shoutmap_backend::{
    Binding, CONVERSATION_PARTICIPANTS_TABLE, MESSAGES_TABLE, NOTIFICATIONS_TABLE,
    UNREAD_MESSAGE_COUNT_RPC, UNREAD_NOTIFICATION_COUNT_RPC,
};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::{ChannelLease, Registration, SyncContext, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterKind {
    UnreadMessages,
    UnreadNotifications,
}

impl CounterKind {
    pub fn rpc(&self) -> &'static str {
        match self {
            CounterKind::UnreadMessages => UNREAD_MESSAGE_COUNT_RPC,
            CounterKind::UnreadNotifications => UNREAD_NOTIFICATION_COUNT_RPC,
        }
    }

    /// Tables whose changes can move the count.
    pub fn tables(&self) -> &'static [&'static str] {
        match self {
            CounterKind::UnreadMessages => &[MESSAGES_TABLE, CONVERSATION_PARTICIPANTS_TABLE],
            CounterKind::UnreadNotifications => &[NOTIFICATIONS_TABLE],
        }
    }

    pub fn channel_name(&self) -> &'static str {
        match self {
            CounterKind::UnreadMessages => "unread-messages",
            CounterKind::UnreadNotifications => "unread-notifications",
        }
    }
}

/// Read a count out of an RPC result: a bare number, or `{"count": n}`.
fn parse_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_i64().map(|i| i.max(0) as u64)),
        Value::Object(map) => map.get("count").and_then(parse_count),
        Value::Array(items) if items.len() == 1 => parse_count(&items[0]),
        _ => None,
    }
}

/// A server-authoritative count.
pub struct ServerCounter {
    kind: CounterKind,
    ctx: Arc<SyncContext>,
    value: watch::Sender<u64>,
    /// Sequence of the latest refetch (or local clear) issued.
    issued: AtomicU64,
    /// Sequence of the latest result applied.
    applied: AtomicU64,
    lease: ChannelLease,
    _refetch: Registration,
    this: Weak<ServerCounter>,
}

impl ServerCounter {
    /// Open a counter and load its first value.
    pub async fn open(ctx: &Arc<SyncContext>, kind: CounterKind) -> Result<Arc<Self>, SyncError> {
        ctx.require_viewer()?;
        let lease = ctx.registry().get_or_create_channel(kind.channel_name());
        let (value, _) = watch::channel(0);

        let counter = Arc::new_cyclic(|this: &Weak<Self>| {
            for table in kind.tables() {
                let handler = this.clone();
                lease.on(Binding::all(*table), move |event| {
                    if let Some(counter) = handler.upgrade() {
                        trace!(kind = ?counter.kind, table = %event.table, "counter event");
                        counter.spawn_refresh();
                    }
                });
            }
            let trigger = this.clone();
            let refetch = ctx.invalidation().register_count_refetch(move || {
                if let Some(counter) = trigger.upgrade() {
                    counter.spawn_refresh();
                }
            });

            Self {
                kind,
                ctx: Arc::clone(ctx),
                value,
                issued: AtomicU64::new(0),
                applied: AtomicU64::new(0),
                lease,
                _refetch: refetch,
                this: this.clone(),
            }
        });

        if counter.lease.should_subscribe {
            let _ = counter.lease.channel.subscribe().await;
        }
        // A failed first load leaves the counter at zero until the next event.
        let _ = counter.refresh().await;
        Ok(counter)
    }

    pub fn kind(&self) -> CounterKind {
        self.kind
    }

    pub fn get(&self) -> u64 {
        *self.value.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<u64> {
        self.value.subscribe()
    }

    fn next_sequence(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Claim `sequence` as the newest applied result. False if a newer
    /// refetch (or clear) already landed.
    fn claim(&self, sequence: u64) -> bool {
        self.applied.fetch_max(sequence, Ordering::SeqCst) < sequence
    }

    /// Refetch from the server.
    ///
    /// On failure the last known value stays. A response that arrives after
    /// a newer request's response is dropped.
    #[tracing::instrument(skip(self), fields(kind = ?self.kind))]
    pub async fn refresh(&self) -> Result<u64, SyncError> {
        let viewer = self.ctx.require_viewer()?;
        let sequence = self.next_sequence();

        let result = self
            .ctx
            .backend()
            .rpc(self.kind.rpc(), json!({ "p_user_id": viewer }))
            .await;
        let value = match result {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, kept = self.get(), "counter refetch failed, keeping last value");
                return Err(e.into());
            }
        };
        let Some(count) = parse_count(&value) else {
            warn!(response = %value, "counter refetch returned no count");
            return Err(SyncError::MissingField("count".to_string()));
        };

        if self.claim(sequence) {
            self.value.send_replace(count);
            debug!(count, sequence, "counter refreshed");
        } else {
            debug!(count, sequence, "stale counter response dropped");
        }
        Ok(self.get())
    }

    /// The viewer just read `n` items (e.g. opened a thread). Drops the
    /// count right away; the next refetch has the final say.
    pub fn clear_thread(&self, n: u64) {
        // Supersede refetches already in flight.
        let sequence = self.next_sequence();
        self.claim(sequence);
        self.value.send_modify(|count| *count = count.saturating_sub(n));
        self.spawn_refresh();
    }

    fn spawn_refresh(&self) {
        let this = self.this.clone();
        crate::spawn_background("counter refetch", async move {
            if let Some(counter) = this.upgrade() {
                // Failures are logged by refresh.
                let _ = counter.refresh().await;
            }
        });
    }

    pub async fn close(&self) {
        self.ctx.registry().safe_remove_channel(&self.lease).await;
    }
}

//! Channel registry.
//!
//! Many stores listen to the same table (every open shout view listens to
//! `shout_likes`). The backend allows one join per topic per socket, so
//! stores share a [`Channel`] by name through the [`ChannelRegistry`].
//!
//! Each call to [`ChannelRegistry::get_or_create_channel`] hands out a
//! [`ChannelLease`]. While the channel has not joined, exactly one live
//! lease is told to subscribe; the rest only attach handlers. If that lease
//! is released before subscribing, the claim passes to the next caller.
//! Handlers attached through a
//! lease are detached when that lease is released, and the channel leaves
//! the backend topic when its last lease goes.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use dashmap::DashMap;
use shoutmap_backend::{Binding, ChangeEvent, RealtimeTransport};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::SyncError;
use crate::invalidation::panic_message;

/// Callback invoked for each matching change event.
pub type Handler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    /// Created, not yet joined.
    Idle = 0,
    /// Join sent, waiting for the transport.
    Joining = 1,
    /// Receiving events.
    Joined = 2,
    /// Join failed or the event stream ended. Not retried.
    Errored = 3,
    /// Torn down after the last lease was released.
    Closed = 4,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::Idle,
            1 => ChannelState::Joining,
            2 => ChannelState::Joined,
            3 => ChannelState::Errored,
            _ => ChannelState::Closed,
        }
    }
}

struct HandlerEntry {
    lease: u64,
    binding: Binding,
    handler: Handler,
}

/// A named subscription shared by every lease holder.
pub struct Channel {
    name: String,
    transport: Arc<dyn RealtimeTransport>,
    state: AtomicU8,
    /// Lease told to subscribe, or 0.
    claimer: AtomicU64,
    leases: AtomicUsize,
    handlers: Mutex<Vec<HandlerEntry>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    fn new(name: &str, transport: Arc<dyn RealtimeTransport>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            transport,
            state: AtomicU8::new(ChannelState::Idle as u8),
            claimer: AtomicU64::new(0),
            leases: AtomicUsize::new(0),
            handlers: Mutex::new(Vec::new()),
            pump: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Leases currently holding the channel.
    pub fn lease_count(&self) -> usize {
        self.leases.load(Ordering::SeqCst)
    }

    pub fn handler_count(&self) -> usize {
        self.lock_handlers().len()
    }

    fn transition(&self, from: ChannelState, to: ChannelState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn lock_handlers(&self) -> MutexGuard<'_, Vec<HandlerEntry>> {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_pump(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.pump.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn attach(&self, lease: u64, binding: Binding, handler: Handler) {
        self.lock_handlers().push(HandlerEntry {
            lease,
            binding,
            handler,
        });
    }

    fn detach(&self, lease: u64) -> usize {
        let mut handlers = self.lock_handlers();
        let before = handlers.len();
        handlers.retain(|h| h.lease != lease);
        before - handlers.len()
    }

    /// Distinct bindings of every attached handler, in attach order.
    pub fn bindings(&self) -> Vec<Binding> {
        let mut bindings: Vec<Binding> = Vec::new();
        for entry in self.lock_handlers().iter() {
            if !bindings.contains(&entry.binding) {
                bindings.push(entry.binding.clone());
            }
        }
        bindings
    }

    /// Join the backend topic with the bindings attached so far.
    ///
    /// Only the first call does anything; later calls (and calls on an
    /// errored or closed channel) return `Ok` without touching the
    /// transport. A failed join is logged and leaves the channel
    /// [`ChannelState::Errored`].
    pub async fn subscribe(self: &Arc<Self>) -> Result<(), SyncError> {
        if !self.transition(ChannelState::Idle, ChannelState::Joining) {
            trace!(channel = %self.name, state = ?self.state(), "subscribe skipped");
            return Ok(());
        }

        let bindings = self.bindings();
        debug!(channel = %self.name, bindings = bindings.len(), "joining channel");

        let mut pending = PendingJoin {
            channel: self,
            armed: true,
        };
        let joined = self.transport.join(&self.name, bindings).await;
        pending.armed = false;

        let rx = match joined {
            Ok(rx) => rx,
            Err(e) => {
                error!(channel = %self.name, error = %e, "channel join failed");
                self.transition(ChannelState::Joining, ChannelState::Errored);
                return Err(e.into());
            }
        };

        if !self.transition(ChannelState::Joining, ChannelState::Joined) {
            // Released while the join was in flight.
            if let Err(e) = self.transport.leave(&self.name).await {
                warn!(channel = %self.name, error = %e, "failed to leave released channel");
            }
            return Err(SyncError::ChannelClosed(self.name.clone()));
        }

        let pump = tokio::spawn(pump_events(Arc::downgrade(self), rx));
        *self.lock_pump() = Some(pump);
        info!(channel = %self.name, "channel joined");
        Ok(())
    }

    /// Deliver an event to every handler whose binding matches. Returns how
    /// many handlers ran without panicking.
    pub fn dispatch(&self, event: &ChangeEvent) -> usize {
        let handlers: Vec<Handler> = self
            .lock_handlers()
            .iter()
            .filter(|h| h.binding.matches(event))
            .map(|h| Arc::clone(&h.handler))
            .collect();

        let mut delivered = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    error!(
                        channel = %self.name,
                        table = %event.table,
                        panic = %panic_message(&*panic),
                        "channel handler panicked"
                    );
                }
            }
        }
        delivered
    }

    /// Mark closed and stop delivery. Returns the state before closing.
    fn shutdown(&self) -> ChannelState {
        let previous = ChannelState::from_u8(
            self.state.swap(ChannelState::Closed as u8, Ordering::AcqRel),
        );
        if let Some(pump) = self.lock_pump().take() {
            pump.abort();
        }
        self.lock_handlers().clear();
        previous
    }

    async fn close(&self) {
        let previous = self.shutdown();
        // A join still in flight leaves on its own once it sees Closed.
        if matches!(previous, ChannelState::Joined | ChannelState::Errored)
            && let Err(e) = self.transport.leave(&self.name).await
        {
            warn!(channel = %self.name, error = %e, "failed to leave channel");
        }
        info!(channel = %self.name, "channel closed");
    }
}

/// Marks the channel errored if a join future is dropped before the
/// transport answered. The topic may be half-joined, so it is not retried;
/// closing the channel still leaves it.
struct PendingJoin<'a> {
    channel: &'a Channel,
    armed: bool,
}

impl Drop for PendingJoin<'_> {
    fn drop(&mut self) {
        if self.armed
            && self
                .channel
                .transition(ChannelState::Joining, ChannelState::Errored)
        {
            error!(channel = %self.channel.name, "channel join abandoned");
        }
    }
}

async fn pump_events(channel: Weak<Channel>, mut rx: mpsc::Receiver<ChangeEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(channel) = channel.upgrade() else {
            return;
        };
        let delivered = channel.dispatch(&event);
        trace!(channel = %channel.name, table = %event.table, delivered, "dispatched event");
    }

    if let Some(channel) = channel.upgrade()
        && channel.transition(ChannelState::Joined, ChannelState::Errored)
    {
        error!(channel = %channel.name, "channel event stream ended");
    }
}

/// A claim on a shared channel.
///
/// Release it with [`ChannelRegistry::safe_remove_channel`]. Dropping an
/// unreleased lease releases it in the background.
pub struct ChannelLease {
    pub channel: Arc<Channel>,
    /// Whether this holder must call [`Channel::subscribe`].
    pub should_subscribe: bool,
    id: u64,
    released: AtomicBool,
    registry: Weak<ChannelRegistry>,
}

impl ChannelLease {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Attach a handler for events matching `binding`. The handler stays
    /// attached until this lease is released.
    ///
    /// Bindings attached after the channel joined only see events the
    /// joined bindings already cover.
    pub fn on<F>(&self, binding: Binding, handler: F)
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        if self.is_released() {
            warn!(channel = %self.channel.name, "handler attached to released lease ignored");
            return;
        }
        self.channel.attach(self.id, binding, Arc::new(handler));
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        if !registry.release_lease(self.id, &self.channel) {
            return;
        }

        let channel = Arc::clone(&self.channel);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { channel.close().await });
            }
            Err(_) => {
                channel.shutdown();
                warn!(channel = %channel.name, "lease dropped outside a runtime; topic not left");
            }
        }
    }
}

/// Registry of shared channels keyed by name.
pub struct ChannelRegistry {
    transport: Arc<dyn RealtimeTransport>,
    channels: DashMap<String, Arc<Channel>>,
    next_lease: AtomicU64,
    this: Weak<ChannelRegistry>,
}

impl ChannelRegistry {
    pub fn new(transport: Arc<dyn RealtimeTransport>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            transport,
            channels: DashMap::new(),
            next_lease: AtomicU64::new(1),
            this: this.clone(),
        })
    }

    /// Get the live channel for `name`, creating it if needed.
    ///
    /// The lease is told to subscribe when the channel has not joined yet
    /// and no other live lease holds that duty.
    pub fn get_or_create_channel(&self, name: &str) -> ChannelLease {
        let channel = {
            let entry = self
                .channels
                .entry(name.to_string())
                .or_insert_with(|| Channel::new(name, Arc::clone(&self.transport)));
            // Counted under the shard lock so a concurrent release cannot
            // tear the channel down under us.
            entry.leases.fetch_add(1, Ordering::SeqCst);
            Arc::clone(entry.value())
        };
        let id = self.next_lease.fetch_add(1, Ordering::Relaxed);
        let should_subscribe = channel.state() == ChannelState::Idle
            && channel
                .claimer
                .compare_exchange(0, id, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok();
        debug!(
            channel = %name,
            lease = id,
            leases = channel.lease_count(),
            should_subscribe,
            "leased channel"
        );

        ChannelLease {
            channel,
            should_subscribe,
            id,
            released: AtomicBool::new(false),
            registry: self.this.clone(),
        }
    }

    /// Release a lease. Releasing the same lease again is a no-op.
    pub async fn safe_remove_channel(&self, lease: &ChannelLease) {
        if lease.released.swap(true, Ordering::SeqCst) {
            trace!(channel = %lease.channel.name, lease = lease.id, "lease already released");
            return;
        }
        if self.release_lease(lease.id, &lease.channel) {
            lease.channel.close().await;
        }
    }

    /// Detach a lease and drop its count. Returns whether the channel was
    /// removed from the registry and must be closed by the caller.
    fn release_lease(&self, lease: u64, channel: &Arc<Channel>) -> bool {
        let detached = channel.detach(lease);
        if channel.state() == ChannelState::Idle
            && channel
                .claimer
                .compare_exchange(lease, 0, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            debug!(channel = %channel.name, lease, "unused subscribe claim returned");
        }
        let remaining = channel.leases.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!(
            channel = %channel.name,
            lease,
            detached,
            remaining,
            "released channel lease"
        );
        if remaining > 0 {
            return false;
        }
        self.channels
            .remove_if(&channel.name, |_, current| {
                Arc::ptr_eq(current, channel) && current.lease_count() == 0
            })
            .is_some()
    }

    /// The live channel for `name`, if any.
    pub fn get(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.get(name).map(|c| Arc::clone(c.value()))
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.key().clone()).collect()
    }
}

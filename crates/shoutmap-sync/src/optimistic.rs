//! Two-phase optimistic state.
//!
//! A mutation is applied locally through [`Optimistic::apply_optimistic`],
//! which captures a snapshot of the prior value and hands back a [`Token`].
//! Once the backend write settles the token is either confirmed (the local
//! value stands) or rolled back (the snapshot is restored exactly).
//!
//! Every change bumps a version. Background refetches read the version
//! before going to the network and apply their result with
//! [`Optimistic::replace_if_unchanged`], so a late response never clobbers
//! a newer local mutation.

use std::sync::{Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::trace;

struct Slot<T> {
    value: T,
    version: u64,
}

/// Proof of an in-flight optimistic mutation.
#[must_use = "an optimistic mutation must be confirmed or rolled back"]
#[derive(Debug)]
pub struct Token<T> {
    snapshot: T,
    version: u64,
}

impl<T> Token<T> {
    /// The value before the mutation was applied.
    pub fn snapshot(&self) -> &T {
        &self.snapshot
    }

    /// Version produced by the mutation.
    pub fn version(&self) -> u64 {
        self.version
    }
}

/// A value with optimistic mutation support.
pub struct Optimistic<T> {
    slot: Mutex<Slot<T>>,
    changed: watch::Sender<u64>,
}

impl<T: Clone> Optimistic<T> {
    pub fn new(value: T) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            slot: Mutex::new(Slot { value, version: 0 }),
            changed,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` against the value under the lock, bumping the version.
    fn mutate<R>(&self, f: impl FnOnce(&mut T) -> R) -> (R, u64) {
        let (result, version) = {
            let mut slot = self.lock();
            let result = f(&mut slot.value);
            slot.version += 1;
            (result, slot.version)
        };
        self.changed.send_replace(version);
        (result, version)
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.lock().value.clone()
    }

    /// Read the value without cloning it.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.lock().value)
    }

    /// Current version.
    pub fn version(&self) -> u64 {
        self.lock().version
    }

    /// Apply a local mutation and capture the prior value.
    pub fn apply_optimistic(&self, f: impl FnOnce(&mut T)) -> Token<T> {
        let (snapshot, version) = self.mutate(|value| {
            let snapshot = value.clone();
            f(value);
            snapshot
        });
        Token { snapshot, version }
    }

    /// The write behind `token` succeeded; the local value stands.
    pub fn confirm(&self, token: Token<T>) {
        trace!(version = token.version, "optimistic mutation confirmed");
    }

    /// The write behind `token` failed; restore the captured snapshot.
    pub fn rollback(&self, token: Token<T>) {
        let Token { snapshot, version } = token;
        let (_, now) = self.mutate(|value| *value = snapshot);
        trace!(version, now, "optimistic mutation rolled back");
    }

    /// The write behind `token` failed; undo just that mutation with `f`
    /// instead of restoring the snapshot. For collections where events may
    /// have landed in between and must survive.
    pub fn compensate(&self, token: Token<T>, f: impl FnOnce(&mut T, &T)) {
        let Token { snapshot, version } = token;
        let (_, now) = self.mutate(|value| f(value, &snapshot));
        trace!(version, now, "optimistic mutation compensated");
    }

    /// Apply a server-driven change (a reconciled event).
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.mutate(f).0
    }

    /// Replace the value with a refetched one, unless it changed since
    /// `version` was read. Returns whether the value was replaced.
    pub fn replace_if_unchanged(&self, version: u64, value: T) -> bool {
        let replaced = {
            let mut slot = self.lock();
            if slot.version != version {
                None
            } else {
                slot.value = value;
                slot.version += 1;
                Some(slot.version)
            }
        };
        match replaced {
            Some(now) => {
                self.changed.send_replace(now);
                true
            }
            None => false,
        }
    }

    /// Watch the version counter to observe changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }
}

//! In-memory backend with a realtime feed, for tests and simulation.
//!
//! Behaves like the hosted backend where the sync layer cares:
//! - writes emit change events to every joined topic whose bindings match
//! - delete (and update) events carry only the primary key in `old` unless
//!   the table is configured for full row replication
//! - joining a topic already joined on the same socket fails
//! - unique constraints reject duplicate rows with a 409
//!
//! [`MemoryBackend::connect`] opens an extra socket, one per simulated
//! client; the backend itself acts as socket `0`.
//!
//! Failures can be injected per table or per function, and event delivery
//! can be held back to simulate a realtime event arriving after (or before)
//! the write response.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::{Backend, BackendError, Binding, ChangeEvent, Query, RealtimeTransport, Row};

/// Buffer size for each joined topic.
const TOPIC_BUFFER: usize = 1024;

/// A server function registered on the in-memory backend.
pub type RpcHandler =
    Arc<dyn Fn(&MemoryBackend, &Value) -> Result<Value, BackendError> + Send + Sync>;

struct JoinedTopic {
    bindings: Vec<Binding>,
    tx: mpsc::Sender<ChangeEvent>,
}

/// In-memory backend.
#[derive(Default)]
pub struct MemoryBackend {
    tables: Mutex<HashMap<String, Vec<Row>>>,
    functions: DashMap<String, RpcHandler>,
    /// Joined topics keyed by (socket, topic).
    topics: DashMap<(u64, String), JoinedTopic>,
    next_socket: AtomicU64,
    /// Tables whose delete/update events carry the full old row.
    full_replication: DashMap<String, ()>,
    /// Column sets that must be unique per table.
    unique: DashMap<String, Vec<Vec<String>>>,
    /// Remaining injected failures per table or function name.
    failures: DashMap<String, usize>,
    hold_events: AtomicBool,
    held: Mutex<VecDeque<ChangeEvent>>,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock_tables(&self) -> MutexGuard<'_, HashMap<String, Vec<Row>>> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replicate full old rows on delete/update for a table.
    pub fn set_full_replication(&self, table: &str, full: bool) {
        if full {
            self.full_replication.insert(table.to_string(), ());
        } else {
            self.full_replication.remove(table);
        }
    }

    /// Reject inserts that duplicate these columns in a table.
    pub fn add_unique(&self, table: &str, columns: &[&str]) {
        self.unique
            .entry(table.to_string())
            .or_default()
            .push(columns.iter().map(|c| c.to_string()).collect());
    }

    /// Register a server function.
    pub fn register_rpc<F>(&self, name: &str, handler: F)
    where
        F: Fn(&MemoryBackend, &Value) -> Result<Value, BackendError> + Send + Sync + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(handler));
    }

    /// Make the next `count` writes to a table (or calls to a function) fail.
    pub fn fail_next(&self, name: &str, count: usize) {
        *self.failures.entry(name.to_string()).or_insert(0) += count;
    }

    fn take_failure(&self, name: &str) -> Result<(), BackendError> {
        if let Some(mut remaining) = self.failures.get_mut(name)
            && *remaining > 0
        {
            *remaining -= 1;
            debug!(name, "injected backend failure");
            return Err(BackendError::Rest {
                status: 503,
                code: None,
                message: format!("injected failure for {}", name),
            });
        }
        Ok(())
    }

    /// Hold change events instead of delivering them.
    pub fn hold_events(&self, hold: bool) {
        self.hold_events.store(hold, Ordering::SeqCst);
    }

    /// Deliver every held event, oldest first.
    pub fn flush_held(&self) {
        let held: Vec<ChangeEvent> = {
            let mut queue = self.held.lock().unwrap_or_else(|e| e.into_inner());
            queue.drain(..).collect()
        };
        for event in held {
            self.deliver(&event);
        }
    }

    /// Number of events currently held.
    pub fn held_count(&self) -> usize {
        self.held.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Deliver an arbitrary event, e.g. one with a trimmed payload.
    pub fn emit(&self, event: ChangeEvent) {
        if self.hold_events.load(Ordering::SeqCst) {
            self.held
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push_back(event);
        } else {
            self.deliver(&event);
        }
    }

    fn deliver(&self, event: &ChangeEvent) {
        for topic in self.topics.iter() {
            if !topic.bindings.iter().any(|b| b.matches(event)) {
                continue;
            }
            if let Err(e) = topic.tx.try_send(event.clone()) {
                warn!(topic = %topic.key().1, error = %e, "dropping change event");
            }
        }
    }

    /// Snapshot of a table's rows.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock_tables().get(table).cloned().unwrap_or_default()
    }

    /// Count rows matching a query without going through the trait.
    pub fn count(&self, query: &Query) -> usize {
        self.lock_tables()
            .get(&query.table)
            .map(|rows| rows.iter().filter(|r| query.matches(r)).count())
            .unwrap_or(0)
    }

    /// Insert a row without emitting an event (seeding fixtures).
    pub fn seed(&self, table: &str, row: Row) -> Row {
        let row = with_defaults(row);
        self.lock_tables()
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        row
    }

    /// Topics currently joined on any socket, sorted.
    pub fn joined_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.iter().map(|t| t.key().1.clone()).collect();
        topics.sort();
        topics
    }

    /// Open another realtime socket on this backend.
    pub fn connect(self: &Arc<Self>) -> Arc<MemorySocket> {
        let id = self.next_socket.fetch_add(1, Ordering::Relaxed) + 1;
        Arc::new(MemorySocket {
            backend: Arc::clone(self),
            id,
        })
    }

    fn join_topic(
        &self,
        socket: u64,
        topic: &str,
        bindings: Vec<Binding>,
    ) -> Result<mpsc::Receiver<ChangeEvent>, BackendError> {
        use dashmap::mapref::entry::Entry;

        match self.topics.entry((socket, topic.to_string())) {
            Entry::Occupied(_) => Err(BackendError::Realtime(format!(
                "tried to subscribe multiple times to topic {}",
                topic
            ))),
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::channel(TOPIC_BUFFER);
                let tables: HashSet<&str> = bindings.iter().map(|b| b.table.as_str()).collect();
                debug!(socket, topic, tables = ?tables, "memory join");
                slot.insert(JoinedTopic { bindings, tx });
                Ok(rx)
            }
        }
    }

    fn leave_topic(&self, socket: u64, topic: &str) {
        if self.topics.remove(&(socket, topic.to_string())).is_some() {
            debug!(socket, topic, "memory leave");
        }
    }

    fn old_payload(&self, table: &str, row: &Row) -> Row {
        if self.full_replication.contains_key(table) {
            return row.clone();
        }
        let mut key = Row::new();
        if let Some(id) = row.get("id") {
            key.insert("id".to_string(), id.clone());
        }
        key
    }

    fn violates_unique(&self, table: &str, rows: &[Row], row: &Row) -> Option<String> {
        let constraints = self.unique.get(table)?;
        constraints.iter().find_map(|columns| {
            let clash = rows
                .iter()
                .any(|existing| columns.iter().all(|c| existing.get(c) == row.get(c)));
            clash.then(|| columns.join(","))
        })
    }
}

fn with_defaults(mut row: Row) -> Row {
    row.entry("id")
        .or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()));
    row.entry("created_at")
        .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
    row
}

fn sort_rows(rows: &mut [Row], query: &Query) {
    let Some(order) = &query.order else {
        return;
    };
    rows.sort_by(|a, b| {
        let a = a.get(&order.column).map(|v| v.to_string()).unwrap_or_default();
        let b = b.get(&order.column).map(|v| v.to_string()).unwrap_or_default();
        if order.ascending { a.cmp(&b) } else { b.cmp(&a) }
    });
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn select(&self, query: &Query) -> Result<Vec<Row>, BackendError> {
        let mut rows: Vec<Row> = self
            .lock_tables()
            .get(&query.table)
            .map(|rows| rows.iter().filter(|r| query.matches(r)).cloned().collect())
            .unwrap_or_default();
        sort_rows(&mut rows, query);
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn insert(&self, table: &str, row: Row) -> Result<Row, BackendError> {
        self.take_failure(table)?;
        let row = with_defaults(row);
        {
            let mut tables = self.lock_tables();
            let rows = tables.entry(table.to_string()).or_default();
            if let Some(columns) = self.violates_unique(table, rows, &row) {
                return Err(BackendError::Rest {
                    status: 409,
                    code: Some("23505".to_string()),
                    message: format!("duplicate key value violates unique ({})", columns),
                });
            }
            rows.push(row.clone());
        }
        trace!(table, "memory insert");
        self.emit(ChangeEvent::insert(table, row.clone()));
        Ok(row)
    }

    async fn update(&self, query: &Query, patch: Row) -> Result<Vec<Row>, BackendError> {
        self.take_failure(&query.table)?;
        let mut changed = Vec::new();
        {
            let mut tables = self.lock_tables();
            if let Some(rows) = tables.get_mut(&query.table) {
                for row in rows.iter_mut().filter(|r| query.matches(r)) {
                    let old = row.clone();
                    for (column, value) in &patch {
                        row.insert(column.clone(), value.clone());
                    }
                    changed.push((old, row.clone()));
                }
            }
        }
        for (old, new) in &changed {
            let old = self.old_payload(&query.table, old);
            self.emit(ChangeEvent::update(&query.table, new.clone(), Some(old)));
        }
        Ok(changed.into_iter().map(|(_, new)| new).collect())
    }

    async fn delete(&self, query: &Query) -> Result<Vec<Row>, BackendError> {
        self.take_failure(&query.table)?;
        let removed: Vec<Row> = {
            let mut tables = self.lock_tables();
            match tables.get_mut(&query.table) {
                Some(rows) => {
                    let (gone, kept): (Vec<Row>, Vec<Row>) =
                        rows.drain(..).partition(|r| query.matches(r));
                    *rows = kept;
                    gone
                }
                None => Vec::new(),
            }
        };
        for row in &removed {
            self.emit(ChangeEvent::delete(&query.table, self.old_payload(&query.table, row)));
        }
        Ok(removed)
    }

    async fn rpc(&self, function: &str, args: Value) -> Result<Value, BackendError> {
        self.take_failure(function)?;
        let handler = self
            .functions
            .get(function)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| BackendError::NotFound(format!("function {}", function)))?;
        handler(self, &args)
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<String, BackendError> {
        self.take_failure(bucket)?;
        debug!(bucket, path, size = bytes.len(), "memory upload");
        Ok(format!("memory://{}/{}", bucket, path))
    }
}

#[async_trait]
impl RealtimeTransport for MemoryBackend {
    async fn join(
        &self,
        topic: &str,
        bindings: Vec<Binding>,
    ) -> Result<mpsc::Receiver<ChangeEvent>, BackendError> {
        self.join_topic(0, topic, bindings)
    }

    async fn leave(&self, topic: &str) -> Result<(), BackendError> {
        self.leave_topic(0, topic);
        Ok(())
    }
}

/// A client socket on a [`MemoryBackend`].
pub struct MemorySocket {
    backend: Arc<MemoryBackend>,
    id: u64,
}

impl MemorySocket {
    pub fn backend(&self) -> &Arc<MemoryBackend> {
        &self.backend
    }
}

#[async_trait]
impl RealtimeTransport for MemorySocket {
    async fn join(
        &self,
        topic: &str,
        bindings: Vec<Binding>,
    ) -> Result<mpsc::Receiver<ChangeEvent>, BackendError> {
        self.backend.join_topic(self.id, topic, bindings)
    }

    async fn leave(&self, topic: &str) -> Result<(), BackendError> {
        self.backend.leave_topic(self.id, topic);
        Ok(())
    }
}

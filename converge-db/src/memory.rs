//! In-memory transaction backend.
//!
//! Rows live in one shared table guarded by a mutex. A write parks the new
//! row image next to the committed one and takes an exclusive lock on its key;
//! commit promotes parked images, rollback discards them. Lock acquisition
//! never waits: a conflicting holder yields `LockConflict` and the caller
//! decides whether to retry.
//!
//! Visibility per isolation level:
//!
//! - `ReadUncommitted`: parked images of other transactions are visible
//! - `ReadCommitted`: only committed images (and our own writes)
//! - `RepeatableRead`: the first image read for a key is pinned for the rest
//!   of the transaction; writing a key whose committed version moved since it
//!   was pinned is a `LockConflict`
//! - `Serializable`: as `RepeatableRead`, and every row read takes a shared
//!   lock that blocks other writers until this transaction ends

use converge_types::{
    Filter, IsolationLevel, LockPolicy, Paginator, Resource, ResourceState, Schema,
    SchemaRegistry,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::{DbError, DbResult};
use crate::locks::{LockMode, LockTable, RowKey};
use crate::transaction::{IsolationRebind, Transaction, TransactionStore, TxId, TxStatus};

#[derive(Debug, Clone)]
struct Row {
    resource: Resource,
    state: ResourceState,
}

#[derive(Debug, Default)]
struct Slot {
    committed: Option<Row>,
    /// Uncommitted image written by the owning transaction; `None` inside
    /// the tuple is a parked delete.
    pending: Option<(TxId, Option<Row>)>,
}

#[derive(Debug, Default)]
struct Tables {
    rows: BTreeMap<RowKey, Slot>,
    locks: LockTable,
}

impl Tables {
    fn committed_len(&self) -> usize {
        self.rows.values().filter(|s| s.committed.is_some()).count()
    }

    /// Drops a slot that holds neither a committed nor a parked image.
    fn prune(&mut self, key: &RowKey) {
        if matches!(self.rows.get(key), Some(slot) if slot.committed.is_none() && slot.pending.is_none()) {
            self.rows.remove(key);
        }
    }
}

fn lock_tables(tables: &Mutex<Tables>) -> DbResult<MutexGuard<'_, Tables>> {
    tables
        .lock()
        .map_err(|_| DbError::Internal("memory store mutex poisoned".into()))
}

fn key_of(resource: &Resource) -> RowKey {
    (resource.schema_id().to_string(), resource.id().to_string())
}

fn visible(slot: &Slot, tx: TxId, level: IsolationLevel) -> Option<Row> {
    match &slot.pending {
        Some((owner, image)) if *owner == tx || level.allows_dirty_reads() => image.clone(),
        _ => slot.committed.clone(),
    }
}

/// Shared in-memory store. Cloning shares the underlying tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    registry: Arc<SchemaRegistry>,
    rebind: IsolationRebind,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry used to follow relations transitively when cascading locks.
    /// Without it only the relations of the schema passed to `lock_fetch`
    /// are followed.
    pub fn with_registry(mut self, registry: Arc<SchemaRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_isolation_rebind(mut self, rebind: IsolationRebind) -> Self {
        self.rebind = rebind;
        self
    }

    /// Opens a transaction, returning the concrete type.
    pub fn open(&self, level: IsolationLevel, policy: LockPolicy) -> MemoryTransaction {
        let tx = MemoryTransaction {
            id: TxId::new(),
            tables: Arc::clone(&self.tables),
            registry: Arc::clone(&self.registry),
            level,
            policy,
            rebind: self.rebind,
            status: TxStatus::Open,
            used: false,
            snapshot: HashMap::new(),
            held: BTreeSet::new(),
            written: BTreeSet::new(),
        };
        debug!(tx = %tx.id, level = %level, "memory transaction begun");
        tx
    }

    /// Number of committed resources across all schemas.
    pub fn committed_len(&self) -> DbResult<usize> {
        Ok(lock_tables(&self.tables)?.committed_len())
    }

    /// Number of keys currently locked by any transaction.
    pub fn held_locks(&self) -> DbResult<usize> {
        Ok(lock_tables(&self.tables)?.locks.len())
    }

    /// Number of row slots, committed or parked.
    pub fn slot_count(&self) -> DbResult<usize> {
        Ok(lock_tables(&self.tables)?.rows.len())
    }
}

impl TransactionStore for MemoryStore {
    fn begin(&self, level: IsolationLevel, policy: LockPolicy) -> DbResult<Box<dyn Transaction>> {
        Ok(Box::new(self.open(level, policy)))
    }
}

/// A transaction over a [`MemoryStore`]. Rolls back on drop if still open.
#[derive(Debug)]
pub struct MemoryTransaction {
    id: TxId,
    tables: Arc<Mutex<Tables>>,
    registry: Arc<SchemaRegistry>,
    level: IsolationLevel,
    policy: LockPolicy,
    rebind: IsolationRebind,
    status: TxStatus,
    used: bool,
    /// Pinned row images for repeatable reads.
    snapshot: HashMap<RowKey, Option<Row>>,
    held: BTreeSet<RowKey>,
    written: BTreeSet<RowKey>,
}

impl MemoryTransaction {
    fn begin_op(&mut self) -> DbResult<()> {
        if self.status != TxStatus::Open {
            return Err(DbError::TransactionClosed);
        }
        self.used = true;
        Ok(())
    }

    fn read_row(&mut self, t: &Tables, key: &RowKey) -> Option<Row> {
        if self.level.repeatable() {
            if let Some(pinned) = self.snapshot.get(key) {
                return pinned.clone();
            }
        }
        let row = t
            .rows
            .get(key)
            .and_then(|slot| visible(slot, self.id, self.level));
        if self.level.repeatable() {
            self.snapshot.insert(key.clone(), row.clone());
        }
        row
    }

    /// The image a write builds on: our own parked image, else committed.
    fn current_for_write(&self, t: &Tables, key: &RowKey) -> Option<Row> {
        let slot = t.rows.get(key)?;
        match &slot.pending {
            Some((owner, image)) if *owner == self.id => image.clone(),
            _ => slot.committed.clone(),
        }
    }

    fn check_unchanged(&self, key: &RowKey, current: &Option<Row>) -> DbResult<()> {
        if !self.level.repeatable() {
            return Ok(());
        }
        let Some(pinned) = self.snapshot.get(key) else {
            return Ok(());
        };
        let pinned_version = pinned.as_ref().map(|r| r.state.config_version);
        let current_version = current.as_ref().map(|r| r.state.config_version);
        if pinned_version != current_version {
            return Err(DbError::LockConflict(format!(
                "{}/{} changed since it was read",
                key.0, key.1
            )));
        }
        Ok(())
    }

    fn acquire(&mut self, t: &mut Tables, key: &RowKey, mode: LockMode) -> DbResult<()> {
        t.locks.try_lock(key, self.id, mode)?;
        self.held.insert(key.clone());
        Ok(())
    }

    fn park(&mut self, t: &mut Tables, key: RowKey, image: Option<Row>) {
        let slot = t.rows.entry(key.clone()).or_default();
        slot.pending = Some((self.id, image.clone()));
        if self.level.repeatable() {
            self.snapshot.insert(key.clone(), image);
        }
        self.written.insert(key);
    }

    fn scan(&mut self, t: &mut Tables, schema: &Schema, filter: &Filter) -> DbResult<Vec<(RowKey, Row)>> {
        let keys: Vec<RowKey> = match filter.as_id() {
            Some(id) => vec![(schema.id.clone(), id.to_string())],
            None => t
                .rows
                .range((schema.id.clone(), String::new())..)
                .take_while(|((schema_id, _), _)| *schema_id == schema.id)
                .map(|(key, _)| key.clone())
                .collect(),
        };

        let mut matched = Vec::new();
        for key in keys {
            if let Some(row) = self.read_row(t, &key) {
                if filter.matches(&row.resource) {
                    matched.push((key, row));
                }
            }
        }

        if self.level == IsolationLevel::Serializable {
            for (key, _) in &matched {
                self.acquire(t, key, LockMode::Shared)?;
            }
        }
        Ok(matched)
    }

    /// Walks relations from `resource`, collecting related keys.
    fn collect_related(
        &self,
        t: &Tables,
        schema: &Schema,
        resource: &Resource,
        out: &mut BTreeSet<RowKey>,
    ) {
        let mut work: Vec<(Schema, Resource)> = vec![(schema.clone(), resource.clone())];
        while let Some((schema, resource)) = work.pop() {
            for relation in &schema.relations {
                let Some(related_id) = resource.get_str(&relation.property) else {
                    continue;
                };
                let key = (relation.schema_id.clone(), related_id.to_string());
                if !out.insert(key.clone()) {
                    continue;
                }
                let Some(related_schema) = self.registry.get(&relation.schema_id) else {
                    continue;
                };
                if let Some(row) = t.rows.get(&key).and_then(|s| visible(s, self.id, self.level)) {
                    work.push((related_schema.clone(), row.resource));
                }
            }
        }
    }

    fn lock_rows(
        &mut self,
        t: &mut Tables,
        schema: &Schema,
        rows: &[(RowKey, Row)],
        policy: LockPolicy,
    ) -> DbResult<()> {
        let mut keys = BTreeSet::new();
        for (key, row) in rows {
            keys.insert(key.clone());
            if policy.cascades() {
                self.collect_related(t, schema, &row.resource, &mut keys);
            }
        }

        self.held.extend(t.locks.lock_all(&keys, self.id)?);
        debug!(tx = %self.id, locked = keys.len(), ?policy, "rows locked");
        Ok(())
    }

    fn release(&mut self, t: &mut Tables) {
        for key in std::mem::take(&mut self.held) {
            t.locks.unlock(&key, self.id);
        }
        for key in &self.written {
            t.prune(key);
        }
        self.snapshot.clear();
        self.written.clear();
    }

    fn first_match(
        &mut self,
        schema: &Schema,
        filter: &Filter,
        policy: Option<LockPolicy>,
    ) -> DbResult<Row> {
        self.begin_op()?;
        let tables = Arc::clone(&self.tables);
        let mut t = lock_tables(&tables)?;
        let mut rows = self.scan(&mut t, schema, filter)?;
        if rows.is_empty() {
            return Err(DbError::not_found(&schema.id, format!("{filter:?}")));
        }
        rows.truncate(1);
        if let Some(policy) = policy {
            self.lock_rows(&mut t, schema, &rows, policy)?;
        }
        Ok(rows.remove(0).1)
    }

    fn page(
        &mut self,
        schema: &Schema,
        filter: &Filter,
        paginator: &Paginator,
        policy: Option<LockPolicy>,
    ) -> DbResult<(Vec<Resource>, u64)> {
        self.begin_op()?;
        let tables = Arc::clone(&self.tables);
        let mut t = lock_tables(&tables)?;
        let rows = self.scan(&mut t, schema, filter)?;
        let total = rows.len() as u64;
        let page = paginator.apply(rows.iter().map(|(_, row)| row.resource.clone()).collect());
        if let Some(policy) = policy {
            let on_page: Vec<(RowKey, Row)> = rows
                .into_iter()
                .filter(|(key, _)| page.iter().any(|r| r.id() == key.1))
                .collect();
            self.lock_rows(&mut t, schema, &on_page, policy)?;
        }
        Ok((page, total))
    }
}

impl Transaction for MemoryTransaction {
    fn id(&self) -> TxId {
        self.id
    }

    fn isolation_level(&self) -> IsolationLevel {
        self.level
    }

    fn lock_policy(&self) -> LockPolicy {
        self.policy
    }

    fn status(&self) -> TxStatus {
        self.status
    }

    fn set_isolation_level(&mut self, level: IsolationLevel) -> DbResult<()> {
        if self.status != TxStatus::Open {
            return Err(DbError::TransactionClosed);
        }
        if !self.rebind.permits(self.used) {
            return Err(DbError::IsolationLocked);
        }
        debug!(tx = %self.id, from = %self.level, to = %level, "isolation level rebound");
        self.level = level;
        Ok(())
    }

    fn create(&mut self, resource: &Resource) -> DbResult<()> {
        self.begin_op()?;
        let key = key_of(resource);
        let tables = Arc::clone(&self.tables);
        let mut t = lock_tables(&tables)?;
        self.acquire(&mut t, &key, LockMode::Exclusive)?;
        if self.current_for_write(&t, &key).is_some() {
            return Err(DbError::ConstraintViolation(format!(
                "{}/{} already exists",
                key.0, key.1
            )));
        }
        let row = Row {
            resource: resource.clone(),
            state: ResourceState {
                config_version: 1,
                ..ResourceState::default()
            },
        };
        self.park(&mut t, key, Some(row));
        Ok(())
    }

    fn update(&mut self, resource: &Resource) -> DbResult<()> {
        self.begin_op()?;
        let key = key_of(resource);
        let tables = Arc::clone(&self.tables);
        let mut t = lock_tables(&tables)?;
        if self.read_row(&t, &key).is_none() {
            return Err(DbError::not_found(&key.0, &key.1));
        }
        self.acquire(&mut t, &key, LockMode::Exclusive)?;
        let current = self.current_for_write(&t, &key);
        self.check_unchanged(&key, &current)?;
        let current = current.ok_or_else(|| DbError::not_found(&key.0, &key.1))?;
        let row = Row {
            resource: resource.clone(),
            state: ResourceState {
                config_version: current.state.config_version + 1,
                ..current.state
            },
        };
        self.park(&mut t, key, Some(row));
        Ok(())
    }

    fn delete(&mut self, schema: &Schema, filter: &Filter) -> DbResult<()> {
        self.begin_op()?;
        let tables = Arc::clone(&self.tables);
        let mut t = lock_tables(&tables)?;
        let rows = self.scan(&mut t, schema, filter)?;
        let key = match rows.as_slice() {
            [] => return Err(DbError::not_found(&schema.id, format!("{filter:?}"))),
            [(key, _)] => key.clone(),
            _ => {
                return Err(DbError::AmbiguousFilter {
                    schema_id: schema.id.clone(),
                    matched: rows.len(),
                });
            }
        };
        self.acquire(&mut t, &key, LockMode::Exclusive)?;
        let current = self.current_for_write(&t, &key);
        self.check_unchanged(&key, &current)?;
        if current.is_none() {
            return Err(DbError::not_found(&key.0, &key.1));
        }
        self.park(&mut t, key, None);
        Ok(())
    }

    fn fetch(&mut self, schema: &Schema, filter: &Filter) -> DbResult<Resource> {
        Ok(self.first_match(schema, filter, None)?.resource)
    }

    fn lock_fetch(
        &mut self,
        schema: &Schema,
        filter: &Filter,
        policy: LockPolicy,
    ) -> DbResult<Resource> {
        Ok(self.first_match(schema, filter, Some(policy))?.resource)
    }

    fn list(
        &mut self,
        schema: &Schema,
        filter: &Filter,
        paginator: &Paginator,
    ) -> DbResult<(Vec<Resource>, u64)> {
        self.page(schema, filter, paginator, None)
    }

    fn lock_list(
        &mut self,
        schema: &Schema,
        filter: &Filter,
        paginator: &Paginator,
        policy: LockPolicy,
    ) -> DbResult<(Vec<Resource>, u64)> {
        self.page(schema, filter, paginator, Some(policy))
    }

    fn state_fetch(&mut self, schema: &Schema, filter: &Filter) -> DbResult<ResourceState> {
        Ok(self.first_match(schema, filter, None)?.state)
    }

    fn state_update(&mut self, resource: &Resource, state: &ResourceState) -> DbResult<()> {
        self.begin_op()?;
        let key = key_of(resource);
        let tables = Arc::clone(&self.tables);
        let mut t = lock_tables(&tables)?;
        if self.read_row(&t, &key).is_none() {
            return Err(DbError::not_found(&key.0, &key.1));
        }
        self.acquire(&mut t, &key, LockMode::Exclusive)?;
        let current = self
            .current_for_write(&t, &key)
            .ok_or_else(|| DbError::not_found(&key.0, &key.1))?;
        let row = Row {
            state: ResourceState {
                config_version: current.state.config_version,
                state_version: state.state_version,
                state: state.state.clone(),
                monitoring: state.monitoring.clone(),
                error: state.error.clone(),
            },
            resource: current.resource,
        };
        self.park(&mut t, key, Some(row));
        Ok(())
    }

    /// Accepts `field = ? [AND field = ? ...]` with one argument per
    /// placeholder. An empty query selects every resource of the schema.
    fn query(
        &mut self,
        schema: &Schema,
        raw_query: &str,
        args: &[Value],
    ) -> DbResult<Vec<Resource>> {
        let filter = parse_equality_query(raw_query, args)?;
        let (resources, _) = self.page(schema, &filter, &Paginator::default(), None)?;
        Ok(resources)
    }

    fn commit(&mut self) -> DbResult<()> {
        if self.status != TxStatus::Open {
            return Err(DbError::TransactionClosed);
        }
        let tables = Arc::clone(&self.tables);
        let mut t = lock_tables(&tables)?;
        for key in &self.written {
            if let Some(slot) = t.rows.get_mut(key) {
                if let Some((owner, image)) = slot.pending.take() {
                    if owner == self.id {
                        slot.committed = image;
                    } else {
                        slot.pending = Some((owner, image));
                    }
                }
            }
        }
        let written = self.written.len();
        self.release(&mut t);
        self.status = TxStatus::Committed;
        debug!(tx = %self.id, written, "memory transaction committed");
        Ok(())
    }

    fn close(&mut self) -> DbResult<()> {
        if self.status == TxStatus::Closed {
            return Ok(());
        }
        let tables = Arc::clone(&self.tables);
        let mut t = lock_tables(&tables)?;
        if self.status == TxStatus::Open {
            for key in &self.written {
                if let Some(slot) = t.rows.get_mut(key) {
                    if matches!(slot.pending, Some((owner, _)) if owner == self.id) {
                        slot.pending = None;
                    }
                }
            }
            debug!(tx = %self.id, discarded = self.written.len(), "memory transaction rolled back");
        }
        self.release(&mut t);
        self.status = TxStatus::Closed;
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(tx = %self.id, "failed to release memory transaction: {e}");
        }
    }
}

fn parse_equality_query(raw_query: &str, args: &[Value]) -> DbResult<Filter> {
    let tokens: Vec<&str> = raw_query.split_whitespace().collect();
    let mut filter = Filter::new();
    let mut args = args.iter();

    let clauses = tokens
        .split(|t| t.eq_ignore_ascii_case("and"))
        .filter(|_| !tokens.is_empty());
    for (i, clause) in clauses.enumerate() {
        let [field, "=", "?"] = clause else {
            return Err(DbError::InvalidArgument(format!(
                "clause {} of query {raw_query:?} is not `field = ?`",
                i + 1
            )));
        };
        let value = args.next().ok_or_else(|| {
            DbError::InvalidArgument(format!("query {raw_query:?} has more placeholders than arguments"))
        })?;
        filter.insert(*field, value.clone());
    }

    if args.next().is_some() {
        return Err(DbError::InvalidArgument(format!(
            "query {raw_query:?} has more arguments than placeholders"
        )));
    }
    Ok(filter)
}

//! SQLite-backed transactions.
//!
//! Each transaction owns its own connection to the database file, which runs
//! in WAL mode so readers never block the writer. The SQL transaction is
//! started lazily with `BEGIN DEFERRED` on the first operation so the
//! isolation level can still be rebound before any work happens. Every read
//! inside it sees one snapshot.
//!
//! Row locks come from a lock table shared by the transactions of one store
//! (and its clones), the same one the memory backend uses:
//!
//! - writes take an exclusive lock on their row
//! - `Serializable` reads take shared locks on the rows they return
//! - `lock_fetch`/`lock_list` lock their targets exclusively, plus related
//!   rows under `LockRelatedResources`, all or nothing
//!
//! SQLite itself still admits one writing transaction at a time. A second
//! writer, or a write from a snapshot that another commit has overtaken,
//! surfaces as `LockConflict` once the busy timeout elapses.
//!
//! `ReadUncommitted` is served as a snapshot read: connections that do not
//! share a page cache never see each other's uncommitted rows.

use converge_types::{
    Filter, IsolationLevel, LockPolicy, Paginator, Resource, ResourceState, Schema,
    SchemaRegistry, SortOrder,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{DbError, DbResult};
use crate::locks::{LockMode, LockTable, RowKey};
use crate::transaction::{IsolationRebind, Transaction, TransactionStore, TxId, TxStatus};

const SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS resources (
        schema_id TEXT NOT NULL,
        id TEXT NOT NULL,
        body TEXT NOT NULL,
        PRIMARY KEY (schema_id, id)
    );

    CREATE TABLE IF NOT EXISTS resource_states (
        schema_id TEXT NOT NULL,
        id TEXT NOT NULL,
        config_version INTEGER NOT NULL DEFAULT 1,
        state_version INTEGER NOT NULL DEFAULT 0,
        state TEXT NOT NULL DEFAULT '',
        monitoring TEXT NOT NULL DEFAULT '',
        error TEXT NOT NULL DEFAULT '',
        PRIMARY KEY (schema_id, id)
    );
";

/// Store backed by one SQLite database file. Cloning shares the row lock
/// table.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
    busy_timeout: Duration,
    rebind: IsolationRebind,
    locks: Arc<Mutex<LockTable>>,
    registry: Arc<SchemaRegistry>,
}

fn lock_table(locks: &Mutex<LockTable>) -> DbResult<MutexGuard<'_, LockTable>> {
    locks
        .lock()
        .map_err(|_| DbError::Internal("sqlite lock table mutex poisoned".into()))
}

impl SqliteStore {
    /// Opens (or creates) the database at `path` and ensures the tables exist.
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        let journal: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !journal.eq_ignore_ascii_case("wal") {
            warn!(journal = %journal, "SQLite refused WAL mode, readers will block writers");
        }
        conn.execute_batch(SCHEMA_SQL)?;
        info!("Opened SQLite resource store at {:?}", path);
        Ok(Self {
            path,
            busy_timeout: Duration::ZERO,
            rebind: IsolationRebind::default(),
            locks: Arc::default(),
            registry: Arc::default(),
        })
    }

    /// Registry used to follow relations transitively when cascading locks.
    /// Without it only the relations of the schema passed to `lock_fetch`
    /// are followed.
    pub fn with_registry(mut self, registry: Arc<SchemaRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// How long a transaction waits on another connection's lock before
    /// failing with `LockConflict`. Zero (the default) fails immediately.
    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn with_isolation_rebind(mut self, rebind: IsolationRebind) -> Self {
        self.rebind = rebind;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of rows currently locked by any transaction of this store.
    pub fn held_locks(&self) -> DbResult<usize> {
        Ok(lock_table(&self.locks)?.len())
    }

    /// Opens a transaction, returning the concrete type.
    pub fn open_transaction(
        &self,
        level: IsolationLevel,
        policy: LockPolicy,
    ) -> DbResult<SqliteTransaction> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        let tx = SqliteTransaction {
            id: TxId::new(),
            conn,
            level,
            policy,
            rebind: self.rebind,
            status: TxStatus::Open,
            begun: false,
            locks: Arc::clone(&self.locks),
            registry: Arc::clone(&self.registry),
            held: BTreeSet::new(),
        };
        debug!(tx = %tx.id, level = %level, "sqlite transaction opened");
        Ok(tx)
    }
}

impl TransactionStore for SqliteStore {
    fn begin(&self, level: IsolationLevel, policy: LockPolicy) -> DbResult<Box<dyn Transaction>> {
        Ok(Box::new(self.open_transaction(level, policy)?))
    }
}

/// A transaction on its own SQLite connection. Rolls back on drop if still
/// open.
pub struct SqliteTransaction {
    id: TxId,
    conn: Connection,
    level: IsolationLevel,
    policy: LockPolicy,
    rebind: IsolationRebind,
    status: TxStatus,
    begun: bool,
    locks: Arc<Mutex<LockTable>>,
    registry: Arc<SchemaRegistry>,
    held: BTreeSet<RowKey>,
}

/// A WHERE clause plus its positional parameters.
struct Clause {
    sql: String,
    params: Vec<SqlValue>,
}

fn json_path(field: &str) -> String {
    format!("$.\"{}\"", field.replace('"', "\\\""))
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Translates a filter into SQL over the `resources` table (aliased `r`).
fn where_clause(schema: &Schema, filter: &Filter) -> Clause {
    let mut sql = String::from("r.schema_id = ?");
    let mut params = vec![SqlValue::Text(schema.id.clone())];

    for (field, expected) in filter.iter() {
        let column = if field == "id" {
            "r.id".to_string()
        } else {
            params.push(SqlValue::Text(json_path(field)));
            "json_extract(r.body, ?)".to_string()
        };
        match expected {
            Value::Null => sql.push_str(&format!(" AND {column} IS NULL")),
            Value::Array(candidates) if candidates.is_empty() => sql.push_str(" AND 0"),
            Value::Array(candidates) => {
                let placeholders = vec!["?"; candidates.len()].join(", ");
                sql.push_str(&format!(" AND {column} IN ({placeholders})"));
                params.extend(candidates.iter().map(to_sql_value));
            }
            other => {
                sql.push_str(&format!(" AND {column} = ?"));
                params.push(to_sql_value(other));
            }
        }
    }
    Clause { sql, params }
}

fn decode_resource(schema_id: &str, body: &str) -> DbResult<Resource> {
    let value: Value = serde_json::from_str(body)?;
    Ok(Resource::from_value(schema_id, value)?)
}

impl SqliteTransaction {
    fn begin_op(&mut self) -> DbResult<()> {
        if self.status != TxStatus::Open {
            return Err(DbError::TransactionClosed);
        }
        if !self.begun {
            self.conn.execute_batch("BEGIN DEFERRED")?;
            self.begun = true;
            debug!(tx = %self.id, level = %self.level, "sqlite transaction begun");
        }
        Ok(())
    }

    fn acquire(&mut self, key: RowKey, mode: LockMode) -> DbResult<()> {
        lock_table(&self.locks)?.try_lock(&key, self.id, mode)?;
        self.held.insert(key);
        Ok(())
    }

    fn lock_for_write(&mut self, schema_id: &str, id: &str) -> DbResult<()> {
        self.acquire((schema_id.to_string(), id.to_string()), LockMode::Exclusive)
    }

    /// Serializable reads keep other writers off the rows they saw.
    fn lock_for_read(&mut self, schema_id: &str, id: &str) -> DbResult<()> {
        if self.level == IsolationLevel::Serializable {
            self.acquire((schema_id.to_string(), id.to_string()), LockMode::Shared)?;
        }
        Ok(())
    }

    fn load(&self, key: &RowKey) -> DbResult<Option<Resource>> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM resources WHERE schema_id = ?1 AND id = ?2",
                params![key.0, key.1],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|body| decode_resource(&key.0, &body)).transpose()
    }

    /// Walks relations from `resource`, collecting related keys.
    fn collect_related(
        &self,
        schema: &Schema,
        resource: &Resource,
        out: &mut BTreeSet<RowKey>,
    ) -> DbResult<()> {
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
                if let Some(related) = self.load(&key)? {
                    work.push((related_schema.clone(), related));
                }
            }
        }
        Ok(())
    }

    fn lock_rows(
        &mut self,
        schema: &Schema,
        resources: &[Resource],
        policy: LockPolicy,
    ) -> DbResult<()> {
        let mut keys = BTreeSet::new();
        for resource in resources {
            keys.insert((schema.id.clone(), resource.id().to_string()));
            if policy.cascades() {
                self.collect_related(schema, resource, &mut keys)?;
            }
        }
        let fresh = lock_table(&self.locks)?.lock_all(&keys, self.id)?;
        self.held.extend(fresh);
        debug!(tx = %self.id, locked = keys.len(), ?policy, "rows locked");
        Ok(())
    }

    fn release(&mut self) -> DbResult<()> {
        if self.held.is_empty() {
            return Ok(());
        }
        let mut table = lock_table(&self.locks)?;
        for key in std::mem::take(&mut self.held) {
            table.unlock(&key, self.id);
        }
        Ok(())
    }

    fn matching_ids(&self, schema: &Schema, filter: &Filter) -> DbResult<Vec<String>> {
        let clause = where_clause(schema, filter);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT r.id FROM resources r WHERE {} ORDER BY r.id",
            clause.sql
        ))?;
        let ids = stmt
            .query_map(params_from_iter(clause.params.iter()), |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    fn first(&mut self, schema: &Schema, filter: &Filter) -> DbResult<Resource> {
        let clause = where_clause(schema, filter);
        let body: Option<String> = self
            .conn
            .query_row(
                &format!(
                    "SELECT r.body FROM resources r WHERE {} ORDER BY r.id LIMIT 1",
                    clause.sql
                ),
                params_from_iter(clause.params.iter()),
                |row| row.get(0),
            )
            .optional()?;
        match body {
            Some(body) => decode_resource(&schema.id, &body),
            None => Err(DbError::not_found(&schema.id, format!("{filter:?}"))),
        }
    }

    fn page(
        &mut self,
        schema: &Schema,
        filter: &Filter,
        paginator: &Paginator,
    ) -> DbResult<(Vec<Resource>, u64)> {
        let clause = where_clause(schema, filter);
        let total: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM resources r WHERE {}", clause.sql),
            params_from_iter(clause.params.iter()),
            |row| row.get(0),
        )?;

        let mut params = clause.params;
        let sort = if paginator.key == "id" {
            "r.id".to_string()
        } else {
            params.push(SqlValue::Text(json_path(&paginator.key)));
            "json_extract(r.body, ?)".to_string()
        };
        let direction = match paginator.order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        params.push(SqlValue::Integer(
            paginator.limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX)),
        ));
        params.push(SqlValue::Integer(
            i64::try_from(paginator.offset).unwrap_or(i64::MAX),
        ));

        let mut stmt = self.conn.prepare(&format!(
            "SELECT r.body FROM resources r WHERE {} ORDER BY {sort} {direction}, r.id {direction} LIMIT ? OFFSET ?",
            clause.sql
        ))?;
        let bodies = stmt
            .query_map(params_from_iter(params.iter()), |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        let resources = bodies
            .iter()
            .map(|body| decode_resource(&schema.id, body))
            .collect::<DbResult<Vec<_>>>()?;
        Ok((resources, u64::try_from(total).unwrap_or(0)))
    }

    /// Runs a backend-specific write statement inside this transaction and
    /// returns the number of changed rows.
    pub fn exec(&mut self, sql: &str, args: &[Value]) -> DbResult<usize> {
        self.begin_op()?;
        let params: Vec<SqlValue> = args.iter().map(to_sql_value).collect();
        Ok(self.conn.execute(sql, params_from_iter(params.iter()))?)
    }
}

impl Transaction for SqliteTransaction {
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

    /// Under `SilentRebind` the new level governs later reads only; locks
    /// already taken are kept until the transaction ends.
    fn set_isolation_level(&mut self, level: IsolationLevel) -> DbResult<()> {
        if self.status != TxStatus::Open {
            return Err(DbError::TransactionClosed);
        }
        if !self.rebind.permits(self.begun) {
            return Err(DbError::IsolationLocked);
        }
        self.level = level;
        Ok(())
    }

    fn create(&mut self, resource: &Resource) -> DbResult<()> {
        self.begin_op()?;
        self.lock_for_write(resource.schema_id(), resource.id())?;
        let body = serde_json::to_string(&resource.to_value())?;
        self.conn
            .execute(
                "INSERT INTO resources (schema_id, id, body) VALUES (?1, ?2, ?3)",
                params![resource.schema_id(), resource.id(), body],
            )
            .map_err(|e| match DbError::from(e) {
                DbError::ConstraintViolation(_) => DbError::ConstraintViolation(format!(
                    "{}/{} already exists",
                    resource.schema_id(),
                    resource.id()
                )),
                other => other,
            })?;
        self.conn.execute(
            "INSERT OR REPLACE INTO resource_states (schema_id, id, config_version) VALUES (?1, ?2, 1)",
            params![resource.schema_id(), resource.id()],
        )?;
        Ok(())
    }

    fn update(&mut self, resource: &Resource) -> DbResult<()> {
        self.begin_op()?;
        self.lock_for_write(resource.schema_id(), resource.id())?;
        let body = serde_json::to_string(&resource.to_value())?;
        let changed = self.conn.execute(
            "UPDATE resources SET body = ?3 WHERE schema_id = ?1 AND id = ?2",
            params![resource.schema_id(), resource.id(), body],
        )?;
        if changed == 0 {
            return Err(DbError::not_found(resource.schema_id(), resource.id()));
        }
        self.conn.execute(
            "UPDATE resource_states SET config_version = config_version + 1 WHERE schema_id = ?1 AND id = ?2",
            params![resource.schema_id(), resource.id()],
        )?;
        Ok(())
    }

    fn delete(&mut self, schema: &Schema, filter: &Filter) -> DbResult<()> {
        self.begin_op()?;
        let ids = self.matching_ids(schema, filter)?;
        let id = match ids.as_slice() {
            [] => return Err(DbError::not_found(&schema.id, format!("{filter:?}"))),
            [id] => id.clone(),
            _ => {
                return Err(DbError::AmbiguousFilter {
                    schema_id: schema.id.clone(),
                    matched: ids.len(),
                });
            }
        };
        self.lock_for_write(&schema.id, &id)?;
        self.conn.execute(
            "DELETE FROM resources WHERE schema_id = ?1 AND id = ?2",
            params![schema.id, id],
        )?;
        self.conn.execute(
            "DELETE FROM resource_states WHERE schema_id = ?1 AND id = ?2",
            params![schema.id, id],
        )?;
        Ok(())
    }

    fn fetch(&mut self, schema: &Schema, filter: &Filter) -> DbResult<Resource> {
        self.begin_op()?;
        let found = self.first(schema, filter)?;
        self.lock_for_read(&schema.id, found.id())?;
        Ok(found)
    }

    fn lock_fetch(
        &mut self,
        schema: &Schema,
        filter: &Filter,
        policy: LockPolicy,
    ) -> DbResult<Resource> {
        self.begin_op()?;
        let found = self.first(schema, filter)?;
        self.lock_rows(schema, std::slice::from_ref(&found), policy)?;
        Ok(found)
    }

    fn list(
        &mut self,
        schema: &Schema,
        filter: &Filter,
        paginator: &Paginator,
    ) -> DbResult<(Vec<Resource>, u64)> {
        self.begin_op()?;
        let (items, total) = self.page(schema, filter, paginator)?;
        for item in &items {
            self.lock_for_read(&schema.id, item.id())?;
        }
        Ok((items, total))
    }

    fn lock_list(
        &mut self,
        schema: &Schema,
        filter: &Filter,
        paginator: &Paginator,
        policy: LockPolicy,
    ) -> DbResult<(Vec<Resource>, u64)> {
        self.begin_op()?;
        let (items, total) = self.page(schema, filter, paginator)?;
        self.lock_rows(schema, &items, policy)?;
        Ok((items, total))
    }

    fn state_fetch(&mut self, schema: &Schema, filter: &Filter) -> DbResult<ResourceState> {
        self.begin_op()?;
        let id = self
            .matching_ids(schema, filter)?
            .into_iter()
            .next()
            .ok_or_else(|| DbError::not_found(&schema.id, format!("{filter:?}")))?;
        let state = self
            .conn
            .query_row(
                "SELECT config_version, state_version, state, monitoring, error
                 FROM resource_states WHERE schema_id = ?1 AND id = ?2",
                params![schema.id, id],
                |row| {
                    Ok(ResourceState {
                        config_version: row.get(0)?,
                        state_version: row.get(1)?,
                        state: row.get(2)?,
                        monitoring: row.get(3)?,
                        error: row.get(4)?,
                    })
                },
            )
            .optional()?;
        let state = state.ok_or_else(|| DbError::not_found(&schema.id, &id))?;
        self.lock_for_read(&schema.id, &id)?;
        Ok(state)
    }

    fn state_update(&mut self, resource: &Resource, state: &ResourceState) -> DbResult<()> {
        self.begin_op()?;
        self.lock_for_write(resource.schema_id(), resource.id())?;
        let changed = self.conn.execute(
            "UPDATE resource_states SET state_version = ?3, state = ?4, monitoring = ?5, error = ?6
             WHERE schema_id = ?1 AND id = ?2",
            params![
                resource.schema_id(),
                resource.id(),
                state.state_version,
                state.state,
                state.monitoring,
                state.error,
            ],
        )?;
        if changed == 0 {
            return Err(DbError::not_found(resource.schema_id(), resource.id()));
        }
        Ok(())
    }

    /// Runs raw SQL. The statement must return a `body` column holding the
    /// resource JSON, e.g. `SELECT body FROM resources WHERE ...`.
    fn query(
        &mut self,
        schema: &Schema,
        raw_query: &str,
        args: &[Value],
    ) -> DbResult<Vec<Resource>> {
        self.begin_op()?;
        let params: Vec<SqlValue> = args.iter().map(to_sql_value).collect();
        let mut stmt = self.conn.prepare(raw_query)?;
        let bodies = stmt
            .query_map(params_from_iter(params.iter()), |row| {
                row.get::<_, String>("body")
            })?
            .collect::<Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|body| decode_resource(&schema.id, body))
            .collect()
    }

    fn commit(&mut self) -> DbResult<()> {
        if self.status != TxStatus::Open {
            return Err(DbError::TransactionClosed);
        }
        if self.begun {
            self.conn.execute_batch("COMMIT")?;
        }
        self.status = TxStatus::Committed;
        let locked = self.held.len();
        self.release()?;
        debug!(tx = %self.id, locked, "sqlite transaction committed");
        Ok(())
    }

    fn close(&mut self) -> DbResult<()> {
        if self.status == TxStatus::Closed {
            return Ok(());
        }
        let rollback =
            self.status == TxStatus::Open && self.begun && !self.conn.is_autocommit();
        self.status = TxStatus::Closed;
        let rolled_back = if rollback {
            self.conn.execute_batch("ROLLBACK")
        } else {
            Ok(())
        };
        self.release()?;
        rolled_back?;
        if rollback {
            debug!(tx = %self.id, "sqlite transaction rolled back");
        }
        Ok(())
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(tx = %self.id, "failed to roll back sqlite transaction: {e}");
        }
    }
}

//! The transaction contract shared by every backend.

use converge_types::{
    Filter, IsolationLevel, LockPolicy, Paginator, Resource, ResourceState, Schema,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::error::DbResult;
use crate::isolation::resolve_isolation;

/// Identifies one transaction in logs and lock tables.
/// UUID v7, so ids sort by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(Uuid);

impl TxId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for TxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a transaction.
///
/// `Open -> Committed -> Closed`, or `Open -> Closed` (rollback).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Open,
    Committed,
    Closed,
}

/// What `set_isolation_level` does once the transaction has run an operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationRebind {
    /// Fail with `IsolationLocked`. Before the first operation the level can
    /// always change.
    #[default]
    RejectAfterUse,
    /// Accept the new level. It governs operations issued afterwards only.
    SilentRebind,
}

impl IsolationRebind {
    pub(crate) fn permits(&self, used: bool) -> bool {
        !used || *self == IsolationRebind::SilentRebind
    }
}

/// A scoped, single-owner unit of work over resources and their
/// reconciliation state.
///
/// Every method takes `&mut self`: a handle is owned by one caller at a time.
/// Sharing one transaction between concurrent callers is a caller error.
///
/// Every operation fails with `TransactionClosed` once the transaction is no
/// longer open (after `commit` or `close`).
pub trait Transaction: Send {
    fn id(&self) -> TxId;

    fn isolation_level(&self) -> IsolationLevel;

    /// The lock policy the transaction was created with.
    fn lock_policy(&self) -> LockPolicy;

    fn status(&self) -> TxStatus;

    /// Rebinds the isolation level. Behavior after the first operation
    /// follows the store's [`IsolationRebind`] policy.
    fn set_isolation_level(&mut self, level: IsolationLevel) -> DbResult<()>;

    /// Inserts a resource and its initial state (`config_version = 1`).
    fn create(&mut self, resource: &Resource) -> DbResult<()>;

    /// Replaces a resource's config and bumps `config_version`.
    fn update(&mut self, resource: &Resource) -> DbResult<()>;

    /// Removes the single resource selected by `filter`, with its state.
    fn delete(&mut self, schema: &Schema, filter: &Filter) -> DbResult<()>;

    /// Reads the first matching resource (in id order) without locking.
    fn fetch(&mut self, schema: &Schema, filter: &Filter) -> DbResult<Resource>;

    /// Reads one resource and locks it for the rest of the transaction.
    /// With `LockRelatedResources`, every resource reachable through the
    /// schema's relations is locked too, in lexical key order.
    fn lock_fetch(
        &mut self,
        schema: &Schema,
        filter: &Filter,
        policy: LockPolicy,
    ) -> DbResult<Resource>;

    /// Reads a page of matching resources plus the total match count.
    fn list(
        &mut self,
        schema: &Schema,
        filter: &Filter,
        paginator: &Paginator,
    ) -> DbResult<(Vec<Resource>, u64)>;

    /// Like `list`, locking every resource on the returned page.
    fn lock_list(
        &mut self,
        schema: &Schema,
        filter: &Filter,
        paginator: &Paginator,
        policy: LockPolicy,
    ) -> DbResult<(Vec<Resource>, u64)>;

    /// Reads the reconciliation state of the first matching resource.
    fn state_fetch(&mut self, schema: &Schema, filter: &Filter) -> DbResult<ResourceState>;

    /// Records observed state. `state.config_version` is ignored; only the
    /// store moves it.
    fn state_update(&mut self, resource: &Resource, state: &ResourceState) -> DbResult<()>;

    /// Backend-specific read query, run under this transaction's isolation.
    fn query(&mut self, schema: &Schema, raw_query: &str, args: &[Value])
        -> DbResult<Vec<Resource>>;

    /// Applies everything done so far.
    fn commit(&mut self) -> DbResult<()>;

    /// Releases locks and connections. Rolls back if not committed.
    /// Idempotent.
    fn close(&mut self) -> DbResult<()>;

    fn is_closed(&self) -> bool {
        self.status() == TxStatus::Closed
    }
}

/// Factory binding a backing store to new transactions.
pub trait TransactionStore: Send + Sync {
    /// Opens a transaction with an explicit isolation level and lock policy.
    fn begin(&self, level: IsolationLevel, policy: LockPolicy) -> DbResult<Box<dyn Transaction>>;

    /// Opens a transaction at the level `action` resolves to for `schema`.
    fn begin_for(
        &self,
        schema: &Schema,
        action: &str,
        policy: LockPolicy,
    ) -> DbResult<Box<dyn Transaction>> {
        self.begin(resolve_isolation(schema, action), policy)
    }
}

//! Row lock table shared by the transactions of one store.
//!
//! Acquisition never waits: a conflicting holder yields `LockConflict` and the
//! caller decides whether to retry.

use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::error::{DbError, DbResult};
use crate::transaction::TxId;

/// `(schema_id, resource_id)`. Ordering of keys is the lock acquisition order.
pub(crate) type RowKey = (String, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockMode {
    Shared,
    Exclusive,
}

/// What a successful [`LockTable::try_lock`] changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Grant {
    /// The transaction held nothing on the key before.
    Acquired,
    /// A shared lock held by this transaction alone became exclusive.
    Upgraded,
    /// Already held in a mode at least as strong.
    Held,
}

#[derive(Debug)]
enum LockEntry {
    Shared(BTreeSet<TxId>),
    Exclusive(TxId),
}

#[derive(Debug, Default)]
pub(crate) struct LockTable {
    entries: HashMap<RowKey, LockEntry>,
}

fn conflict(key: &RowKey, tx: TxId, holder: TxId) -> DbError {
    debug!(tx = %tx, holder = %holder, "lock conflict on {}/{}", key.0, key.1);
    DbError::LockConflict(format!("{}/{} is locked by transaction {holder}", key.0, key.1))
}

impl LockTable {
    pub(crate) fn try_lock(&mut self, key: &RowKey, tx: TxId, mode: LockMode) -> DbResult<Grant> {
        let grant = match (self.entries.get(key), mode) {
            (None, _) => Grant::Acquired,
            (Some(LockEntry::Exclusive(holder)), _) if *holder == tx => Grant::Held,
            (Some(LockEntry::Exclusive(holder)), _) => return Err(conflict(key, tx, *holder)),
            (Some(LockEntry::Shared(holders)), LockMode::Shared) => {
                if holders.contains(&tx) {
                    Grant::Held
                } else {
                    Grant::Acquired
                }
            }
            (Some(LockEntry::Shared(holders)), LockMode::Exclusive) => {
                if let Some(other) = holders.iter().find(|h| **h != tx) {
                    return Err(conflict(key, tx, *other));
                }
                Grant::Upgraded
            }
        };

        match mode {
            LockMode::Exclusive => {
                self.entries.insert(key.clone(), LockEntry::Exclusive(tx));
            }
            LockMode::Shared => {
                // An exclusive entry is ours already and stays exclusive.
                if let LockEntry::Shared(holders) = self
                    .entries
                    .entry(key.clone())
                    .or_insert_with(|| LockEntry::Shared(BTreeSet::new()))
                {
                    holders.insert(tx);
                }
            }
        }
        Ok(grant)
    }

    pub(crate) fn unlock(&mut self, key: &RowKey, tx: TxId) {
        let release = match self.entries.get_mut(key) {
            Some(LockEntry::Exclusive(holder)) => *holder == tx,
            Some(LockEntry::Shared(holders)) => {
                holders.remove(&tx);
                holders.is_empty()
            }
            None => false,
        };
        if release {
            self.entries.remove(key);
        }
    }

    /// Turns an exclusive lock of `tx` back into a shared one.
    pub(crate) fn downgrade(&mut self, key: &RowKey, tx: TxId) {
        if matches!(self.entries.get(key), Some(LockEntry::Exclusive(holder)) if *holder == tx) {
            self.entries
                .insert(key.clone(), LockEntry::Shared(BTreeSet::from([tx])));
        }
    }

    /// Locks every key exclusively, in key order, or none of them: on a
    /// conflict each grant made by this call is reverted. Returns the keys
    /// that were not held before.
    pub(crate) fn lock_all(&mut self, keys: &BTreeSet<RowKey>, tx: TxId) -> DbResult<Vec<RowKey>> {
        let mut granted: Vec<(&RowKey, Grant)> = Vec::with_capacity(keys.len());
        for key in keys {
            match self.try_lock(key, tx, LockMode::Exclusive) {
                Ok(grant) => granted.push((key, grant)),
                Err(e) => {
                    for (done, grant) in granted.into_iter().rev() {
                        match grant {
                            Grant::Acquired => self.unlock(done, tx),
                            Grant::Upgraded => self.downgrade(done, tx),
                            Grant::Held => {}
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(granted
            .into_iter()
            .filter(|(_, grant)| *grant == Grant::Acquired)
            .map(|(key, _)| key.clone())
            .collect())
    }

    /// Number of locked keys.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    fn mode_of(&self, key: &RowKey) -> Option<LockMode> {
        self.entries.get(key).map(|entry| match entry {
            LockEntry::Shared(_) => LockMode::Shared,
            LockEntry::Exclusive(_) => LockMode::Exclusive,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(schema: &str, id: &str) -> RowKey {
        (schema.to_string(), id.to_string())
    }

    #[test]
    fn shared_locks_coexist_but_block_exclusive() {
        let mut t = LockTable::default();
        let k = key("net", "n1");
        let (a, b) = (TxId::new(), TxId::new());
        assert_eq!(t.try_lock(&k, a, LockMode::Shared).unwrap(), Grant::Acquired);
        assert_eq!(t.try_lock(&k, b, LockMode::Shared).unwrap(), Grant::Acquired);
        assert!(t.try_lock(&k, a, LockMode::Exclusive).is_err());
        t.unlock(&k, b);
        assert_eq!(t.try_lock(&k, a, LockMode::Exclusive).unwrap(), Grant::Upgraded);
        assert!(t.try_lock(&k, b, LockMode::Shared).is_err());
        assert_eq!(t.try_lock(&k, a, LockMode::Shared).unwrap(), Grant::Held);
        assert_eq!(t.mode_of(&k), Some(LockMode::Exclusive));
        t.unlock(&k, a);
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn failed_lock_all_reverts_acquisitions_and_upgrades() {
        let mut t = LockTable::default();
        let (a, b) = (TxId::new(), TxId::new());
        let upgraded = key("net", "n1");
        let fresh = key("subnet", "s1");
        let already = key("subnet", "s2");
        let blocked = key("zone", "z1");

        t.try_lock(&upgraded, a, LockMode::Shared).unwrap();
        t.try_lock(&already, a, LockMode::Exclusive).unwrap();
        t.try_lock(&blocked, b, LockMode::Exclusive).unwrap();

        let keys = BTreeSet::from([upgraded.clone(), fresh.clone(), already.clone(), blocked.clone()]);
        assert!(matches!(t.lock_all(&keys, a), Err(DbError::LockConflict(_))));

        assert_eq!(t.mode_of(&upgraded), Some(LockMode::Shared));
        assert_eq!(t.mode_of(&fresh), None);
        assert_eq!(t.mode_of(&already), Some(LockMode::Exclusive));
        // Another reader can share the downgraded key again.
        assert_eq!(t.try_lock(&upgraded, b, LockMode::Shared).unwrap(), Grant::Acquired);
    }

    #[test]
    fn lock_all_reports_only_new_keys() {
        let mut t = LockTable::default();
        let a = TxId::new();
        t.try_lock(&key("net", "n1"), a, LockMode::Shared).unwrap();
        let keys = BTreeSet::from([key("net", "n1"), key("net", "n2")]);
        assert_eq!(t.lock_all(&keys, a).unwrap(), vec![key("net", "n2")]);
        assert_eq!(t.mode_of(&key("net", "n1")), Some(LockMode::Exclusive));
    }
}

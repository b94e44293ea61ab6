//! Module: txn
//! Responsibility: transaction state, the flush path that turns pending
//! operations into store calls, and the concurrency guard that translates
//! store collision signals into rollback plus a structured error.
//! Does not own: cascade traversal (cascade) or store semantics (store).
//!
//! Invariants:
//! - A multi-group transactional flush fails before any store call.
//! - A collision rolls back the local transaction state exactly once and is
//!   never retried here; completed earlier operations of the same flush are
//!   reported as completed, never as failed.
//! - Rollback restores every touched object's pre-transaction state, except
//!   that numeric ids allocated inside the transaction stay assigned (id
//!   allocation is not transactional in the store).

use crate::{
    cascade::{OpAction, PendingOperation},
    entity::{Entity, Properties},
    error::PersistError,
    key::Key,
    obs::sink::{self, MetricsEvent},
    session::{ManagedObject, ObjectId, Session},
    store::{StoreFault, TxnHandle},
    value::Value,
};
use std::collections::{BTreeMap, BTreeSet};

///
/// VersionCheck
///
/// Whether a version verification should also advance the counter. Deletes
/// verify without incrementing.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum VersionCheck {
    Increment,
    CheckOnly,
}

///
/// ActiveTxn
///
/// The engine's view of one store transaction: the opaque handle, the
/// entity group the transaction is pinned to, a transaction-scoped write
/// cache, and pre-transaction snapshots of every object touched inside it.
///

#[derive(Debug)]
pub(crate) struct ActiveTxn {
    handle: TxnHandle,
    group_root: Option<Key>,
    put_cache: BTreeMap<Key, Properties>,
    deleted: BTreeSet<Key>,
    snapshots: BTreeMap<ObjectId, ManagedObject>,
}

impl ActiveTxn {
    pub(crate) const fn new(handle: TxnHandle) -> Self {
        Self {
            handle,
            group_root: None,
            put_cache: BTreeMap::new(),
            deleted: BTreeSet::new(),
            snapshots: BTreeMap::new(),
        }
    }

    pub(crate) const fn handle(&self) -> TxnHandle {
        self.handle
    }

    pub(crate) fn is_deleted(&self, key: &Key) -> bool {
        self.deleted.contains(key)
    }

    /// Capture an object's pre-transaction state; only the first touch per
    /// object counts.
    pub(crate) fn snapshot(&mut self, id: ObjectId, object: &ManagedObject) {
        self.snapshots.entry(id).or_insert_with(|| object.clone());
    }
}

// One planned store call: a run of operation indices issued together.
#[derive(Debug)]
struct PlannedCall {
    delete: bool,
    op_indices: Vec<usize>,
}

impl Session<'_> {
    // ======================================================================
    // Transaction control
    // ======================================================================

    pub fn begin_transaction(&mut self) -> Result<(), PersistError> {
        if self.txn.is_some() {
            return Err(PersistError::illegal_state(
                "a transaction is already active",
            ));
        }

        let handle = self
            .engine
            .store()
            .begin_transaction()
            .map_err(|fault| fault.into_persist("begin_transaction"))?;
        self.txn = Some(ActiveTxn::new(handle));

        Ok(())
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    /// Flush pending dirty state, then commit the store transaction. A
    /// collision reported by the store at commit rolls the local state back
    /// and surfaces as `ConcurrentModification`; retry is the caller's call.
    pub fn commit(&mut self) -> Result<(), PersistError> {
        if self.txn.is_none() {
            return Err(PersistError::illegal_state("no active transaction"));
        }

        self.flush()?;

        let txn = self.txn.take().expect("transaction checked above");
        let kind = txn
            .group_root
            .as_ref()
            .map(|k| k.kind().to_string())
            .unwrap_or_default();

        match self.engine.store().commit(txn.handle()) {
            Ok(()) => Ok(()),
            Err(StoreFault::ConcurrentModification { key }) => {
                sink::record(MetricsEvent::Collision);
                let key = key.unwrap_or_default();
                self.rollback_local(txn);
                Err(PersistError::ConcurrentModification {
                    kind,
                    key,
                    completed: 0,
                })
            }
            Err(fault) => {
                self.rollback_local(txn);
                Err(fault.into_persist("commit"))
            }
        }
    }

    /// Abort the active transaction: roll back the store side and restore
    /// every touched object to its pre-transaction state.
    pub fn rollback(&mut self) -> Result<(), PersistError> {
        let txn = self
            .txn
            .take()
            .ok_or_else(|| PersistError::illegal_state("no active transaction"))?;

        let result = self.engine.store().rollback(txn.handle());
        self.rollback_local(txn);

        result.map_err(|fault| fault.into_persist("rollback"))
    }

    // Restore in-memory state from the transaction's snapshots. Keys
    // allocated during the transaction survive: numeric id allocation is
    // not transactional in the store, so the ids are burned either way.
    pub(crate) fn rollback_local(&mut self, txn: ActiveTxn) {
        sink::record(MetricsEvent::TxnRollback);

        for (id, mut saved) in txn.snapshots {
            if saved.key.is_none() {
                saved.key = self.objects[id.index()].key.clone();
            }
            self.objects[id.index()] = saved;
        }
    }

    // ======================================================================
    // Flush: pending operations -> store calls
    // ======================================================================

    pub(crate) fn flush_ops(&mut self, ops: Vec<PendingOperation>) -> Result<(), PersistError> {
        if ops.is_empty() {
            return Ok(());
        }

        // Fail fast: a transactional flush must stay inside the one entity
        // group the transaction is (or becomes) pinned to. Checked before
        // any store call so a violation leaves no partial writes.
        if let Some(txn) = &self.txn {
            let mut candidate = txn.group_root.clone();
            for op in &ops {
                match &candidate {
                    None => candidate = Some(op.group_root.clone()),
                    Some(root) if *root != op.group_root => {
                        return Err(PersistError::MultiGroupTransaction {
                            first: root.to_string(),
                            second: op.group_root.to_string(),
                        });
                    }
                    Some(_) => {}
                }
            }
            self.txn.as_mut().expect("transaction present").group_root = candidate;
        }

        // Transaction write cache: skip identical re-puts and operations on
        // keys already deleted in this transaction.
        let mut skipped: Vec<ObjectId> = Vec::new();
        let ops = self.filter_cached(ops, &mut skipped);
        if ops.is_empty() {
            self.apply_success_transitions(&ops, &skipped);
            return Ok(());
        }

        let calls = self.plan_calls(&ops);
        let txn_handle = self.txn.as_ref().map(ActiveTxn::handle);
        let mut completed = 0usize;

        for call in &calls {
            let result = self.issue_call(&ops, call, txn_handle.as_ref());
            match result {
                Ok(()) => {
                    completed += call.op_indices.len();
                    self.record_in_txn_cache(&ops, call);
                }
                Err(StoreFault::ConcurrentModification { key }) => {
                    let first = &ops[call.op_indices[0]];
                    let kind = first.key.kind().to_string();
                    let key = key.unwrap_or_else(|| first.key.to_string());
                    return Err(self.concurrency_failure(kind, key, completed));
                }
                Err(fault) => {
                    let operation = if call.delete { "delete" } else { "put" };
                    return Err(fault.into_persist(operation));
                }
            }
        }

        sink::record(MetricsEvent::FlushIssued {
            entities: completed as u64,
            store_calls: calls.len() as u64,
        });

        self.apply_success_transitions(&ops, &skipped);

        Ok(())
    }

    fn filter_cached(
        &mut self,
        ops: Vec<PendingOperation>,
        skipped: &mut Vec<ObjectId>,
    ) -> Vec<PendingOperation> {
        let Some(txn) = &self.txn else {
            return ops;
        };

        let mut kept = Vec::with_capacity(ops.len());
        for op in ops {
            match op.action {
                OpAction::Insert | OpAction::Update => {
                    if txn.deleted.contains(&op.key) {
                        // The entity was deleted earlier in this
                        // transaction; writing it back now is dropped, as
                        // the underlying store would reject the sequence.
                        if let Some(id) = op.object {
                            skipped.push(id);
                        }
                        continue;
                    }
                    let identical = op
                        .entity
                        .as_ref()
                        .is_some_and(|e| txn.put_cache.get(&op.key) == Some(e.properties()));
                    if identical {
                        if let Some(id) = op.object {
                            skipped.push(id);
                        }
                        continue;
                    }
                    kept.push(op);
                }
                OpAction::Delete => {
                    if !txn.deleted.contains(&op.key) {
                        kept.push(op);
                    }
                }
            }
        }

        kept
    }

    // Coalesce consecutive same-kind operations that share a batch token
    // into one batched store call; everything else is issued individually.
    // Batches of one entity skip the batched call form. The single-group
    // constraint binds only transactional batches, and a transactional
    // flush is already pinned to one group before planning starts.
    fn plan_calls(&self, ops: &[PendingOperation]) -> Vec<PlannedCall> {
        let coalesce = self.engine.config().coalesce_flush_calls;
        let mut calls: Vec<PlannedCall> = Vec::new();

        for (index, op) in ops.iter().enumerate() {
            let delete = op.action == OpAction::Delete;
            let mergeable = coalesce
                && op.batch_token.is_some()
                && calls.last().is_some_and(|call| {
                    let last = &ops[*call.op_indices.last().expect("calls are non-empty")];
                    call.delete == delete && last.batch_token == op.batch_token
                });

            if mergeable {
                calls
                    .last_mut()
                    .expect("mergeable implies a previous call")
                    .op_indices
                    .push(index);
            } else {
                calls.push(PlannedCall {
                    delete,
                    op_indices: vec![index],
                });
            }
        }

        calls
    }

    fn issue_call(
        &self,
        ops: &[PendingOperation],
        call: &PlannedCall,
        txn: Option<&TxnHandle>,
    ) -> Result<(), StoreFault> {
        let store = self.engine.store();

        if call.delete {
            let keys: Vec<Key> = call
                .op_indices
                .iter()
                .map(|&i| ops[i].key.clone())
                .collect();
            if keys.len() == 1 {
                store.delete(txn, &keys[0])
            } else {
                store.delete_many(txn, &keys)
            }
        } else {
            let entities: Vec<Entity> = call
                .op_indices
                .iter()
                .map(|&i| ops[i].entity.clone().expect("write operations carry entities"))
                .collect();
            if entities.len() == 1 {
                let entity = entities.into_iter().next().expect("one entity");
                store.put(txn, entity).map(|_| ())
            } else {
                store.put_many(txn, entities).map(|_| ())
            }
        }
    }

    fn record_in_txn_cache(&mut self, ops: &[PendingOperation], call: &PlannedCall) {
        let Some(txn) = self.txn.as_mut() else {
            return;
        };

        for &index in &call.op_indices {
            let op = &ops[index];
            match op.action {
                OpAction::Delete => {
                    txn.put_cache.remove(&op.key);
                    txn.deleted.insert(op.key.clone());
                }
                OpAction::Insert | OpAction::Update => {
                    let entity = op.entity.as_ref().expect("write operations carry entities");
                    txn.put_cache
                        .insert(op.key.clone(), entity.properties().clone());
                }
            }
        }
    }

    fn apply_success_transitions(&mut self, ops: &[PendingOperation], skipped: &[ObjectId]) {
        for op in ops {
            let Some(id) = op.object else {
                continue;
            };
            match op.action {
                OpAction::Insert | OpAction::Update => {
                    let object = &mut self.objects[id.index()];
                    object.state = object.state.after_flush();
                    self.capture_baseline(id);
                }
                OpAction::Delete => {
                    let object = &mut self.objects[id.index()];
                    object.baseline = None;
                }
            }
        }
        for &id in skipped {
            let object = &mut self.objects[id.index()];
            object.state = object.state.after_flush();
            self.capture_baseline(id);
        }
    }

    // ======================================================================
    // Concurrency guard
    // ======================================================================

    // Translate a store collision into the public error, rolling back the
    // active transaction (store side and local state) exactly once. Never
    // retries: that decision belongs to the caller.
    pub(crate) fn concurrency_failure(
        &mut self,
        kind: String,
        key: String,
        completed: usize,
    ) -> PersistError {
        sink::record(MetricsEvent::Collision);

        if let Some(txn) = self.txn.take() {
            // Best effort: local restoration is authoritative for memory;
            // the store's own rollback failure changes nothing here.
            let _ = self.engine.store().rollback(txn.handle());
            self.rollback_local(txn);
        }

        PersistError::ConcurrentModification {
            kind,
            key,
            completed,
        }
    }

    /// Optimistic version verification for updates and deletes. Reads the
    /// committed entity outside any transaction and compares its version
    /// property against this object's baseline; a mismatch (or a vanished
    /// row) is a concurrent modification.
    pub(crate) fn verify_version(
        &mut self,
        id: ObjectId,
        check: VersionCheck,
    ) -> Result<Option<i64>, PersistError> {
        let object = self.obj(id);
        let Some(position) = object.descriptor.version_position() else {
            return Ok(None);
        };
        let field_name = object
            .descriptor
            .field(position)
            .expect("version position")
            .name
            .clone();
        let kind = object.descriptor.kind().to_string();
        let key = object.key.clone().expect("persistent objects carry keys");

        let Some(baseline_version) = object.baseline.as_ref().and_then(|b| b.version) else {
            // Nothing committed to compare against yet.
            return Ok(match check {
                VersionCheck::Increment => Some(1),
                VersionCheck::CheckOnly => None,
            });
        };

        match self.engine.store().get(None, &key) {
            Ok(entity) => {
                let stored = entity.get(&field_name).and_then(Value::as_int);
                if stored != Some(baseline_version) {
                    return Err(self.concurrency_failure(kind, key.to_string(), 0));
                }
            }
            Err(StoreFault::NotFound { .. }) => {
                // Deleted out from under us.
                return Err(self.concurrency_failure(kind, key.to_string(), 0));
            }
            Err(fault) => return Err(fault.into_persist("get")),
        }

        Ok(match check {
            VersionCheck::Increment => Some(baseline_version + 1),
            VersionCheck::CheckOnly => None,
        })
    }
}

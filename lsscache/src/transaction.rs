//! Transactions against the persistent store.
//!
//! `TransactionManager` is the begin/commit/rollback state machine, generic over the hooks that
//! talk to the actual store. `Transaction` is the redb backed handle every mutating cache
//! operation takes. A `TxRegistry` shared with the owning store remembers which transaction id is
//! open, if any, without holding on to the transaction itself.

use crate::error::CacheError;
use crate::{info, warn, error};
use redb::{Database, TableHandle, WriteTransaction};
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub type TransactionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Open,
    Committed,
    RolledBack,
}

pub trait TransactionHooks {
    fn begin(&mut self) -> Result<(), CacheError>;
    fn commit(&mut self) -> Result<(), CacheError>;
    fn rollback(&mut self) -> Result<(), CacheError>;
    fn release(&mut self);
}

pub struct TransactionManager<H: TransactionHooks> {
    hooks: H,
    state: TxState,
}

impl<H: TransactionHooks> TransactionManager<H> {
    pub fn new(mut hooks: H) -> Result<Self, CacheError> {
        hooks.begin()?;
        Ok(TransactionManager { hooks, state: TxState::Open })
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Committing twice is a no-op, committing after a rollback is an error.
    pub fn commit(&mut self) -> Result<(), CacheError> {
        match self.state {
            TxState::Committed => Ok(()),
            TxState::RolledBack => Err(CacheError::transaction("commit attempted after rollback")),
            TxState::Open => {
                let result = self.hooks.commit();
                self.state = if result.is_ok() { TxState::Committed } else { TxState::RolledBack };
                self.hooks.release();
                result
            }
        }
    }

    /// Rolling back twice is a no-op, rolling back after a commit is an error.
    pub fn rollback(&mut self) -> Result<(), CacheError> {
        match self.state {
            TxState::RolledBack => Ok(()),
            TxState::Committed => Err(CacheError::transaction("rollback attempted after commit")),
            TxState::Open => {
                self.state = TxState::RolledBack;
                let result = self.hooks.rollback();
                self.hooks.release();
                result
            }
        }
    }
}

impl<H: TransactionHooks> Drop for TransactionManager<H> {
    fn drop(&mut self) {
        if self.state == TxState::Open {
            if let Err(e) = self.rollback() {
                error!("Rollback of abandoned transaction failed: {}", e);
            }
        }
    }
}

/// Which transaction is open against a store. Holds only the id.
#[derive(Debug, Default)]
pub struct TxRegistry {
    active: Mutex<Option<TransactionId>>,
    next_id: AtomicU64,
}

impl TxRegistry {
    pub fn active(&self) -> Option<TransactionId> {
        self.active.lock().ok().and_then(|guard| *guard)
    }

    fn acquire(&self) -> Result<TransactionId, CacheError> {
        let mut active = self.active.lock()?;
        if let Some(open) = *active {
            return Err(CacheError::transaction(format!("transaction {} is still open", open)));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        *active = Some(id);
        Ok(id)
    }

    fn release(&self, id: TransactionId) {
        match self.active.lock() {
            Ok(mut active) if *active == Some(id) => *active = None,
            Ok(active) => warn!("Releasing transaction {} but registry holds {:?}", id, *active),
            Err(e) => error!("Transaction registry poisoned while releasing {}: {}", id, e),
        }
    }
}

/// Hooks binding the state machine to a redb write transaction.
pub struct StoreHooks {
    db: Arc<Database>,
    registry: Arc<TxRegistry>,
    id: Option<TransactionId>,
    tx: Option<WriteTransaction>,
    temp_counter: Cell<u32>,
    temp_tables: RefCell<Vec<String>>,
}

impl StoreHooks {
    pub fn new(db: Arc<Database>, registry: Arc<TxRegistry>) -> Self {
        StoreHooks { db, registry, id: None, tx: None, temp_counter: Cell::new(0), temp_tables: RefCell::new(Vec::new()) }
    }

    fn drop_leftover_temp_tables(&self, tx: &WriteTransaction) -> Result<(), CacheError> {
        let leftovers: Vec<String> = self.temp_tables.borrow_mut().drain(..).collect();
        for name in leftovers {
            warn!("Temporary table {} still live at commit, dropping it", name);
            tx.delete_table(redb::TableDefinition::<u32, &[u8]>::new(&name))?;
        }
        Ok(())
    }
}

impl TransactionHooks for StoreHooks {
    fn begin(&mut self) -> Result<(), CacheError> {
        let id = self.registry.acquire()?;
        match self.db.begin_write() {
            Ok(tx) => {
                self.id = Some(id);
                self.tx = Some(tx);
                Ok(())
            }
            Err(e) => {
                self.registry.release(id);
                Err(e.into())
            }
        }
    }

    fn commit(&mut self) -> Result<(), CacheError> {
        let tx = self.tx.take().ok_or_else(|| CacheError::transaction("no write transaction to commit"))?;
        if let Err(e) = self.drop_leftover_temp_tables(&tx) {
            tx.abort()?;
            return Err(e);
        }
        tx.commit()?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), CacheError> {
        self.temp_tables.borrow_mut().clear();
        if let Some(tx) = self.tx.take() {
            tx.abort()?;
            if let Some(id) = self.id {
                info!("Transaction {} rolled back", id);
            }
        }
        Ok(())
    }

    fn release(&mut self) {
        if let Some(id) = self.id.take() {
            self.registry.release(id);
        }
    }
}

/// An open unit of work against the store. Dropping it without `commit` rolls it back.
pub struct Transaction {
    manager: TransactionManager<StoreHooks>,
    id: TransactionId,
}

impl Transaction {
    pub(crate) fn begin(db: Arc<Database>, registry: Arc<TxRegistry>) -> Result<Self, CacheError> {
        let manager = TransactionManager::new(StoreHooks::new(db, registry))?;
        let id = manager.hooks().id.ok_or_else(|| CacheError::transaction("transaction began without an id"))?;
        Ok(Transaction { manager, id })
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TxState {
        self.manager.state()
    }

    pub fn commit(&mut self) -> Result<(), CacheError> {
        self.manager.commit()
    }

    pub fn rollback(&mut self) -> Result<(), CacheError> {
        self.manager.rollback()
    }

    /// The underlying write transaction. Only available while open.
    pub fn write_tx(&self) -> Result<&WriteTransaction, CacheError> {
        match self.manager.state() {
            TxState::Open => self.manager.hooks().tx.as_ref().ok_or_else(|| CacheError::transaction("write transaction missing")),
            state => Err(CacheError::transaction(format!("transaction {} is {:?}, mutations need an open one", self.id, state))),
        }
    }

    /// Reserves a table name unique to this transaction and tracks it until `release_temp_name`.
    pub(crate) fn reserve_temp_name(&self) -> String {
        let hooks = self.manager.hooks();
        let n = hooks.temp_counter.get();
        hooks.temp_counter.set(n + 1);
        let name = format!("temp_{}_{}", self.id, n);
        hooks.temp_tables.borrow_mut().push(name.clone());
        name
    }

    pub(crate) fn release_temp_name(&self, name: &str) {
        self.manager.hooks().temp_tables.borrow_mut().retain(|n| n != name);
    }

    pub fn live_temp_tables(&self) -> Vec<String> {
        self.manager.hooks().temp_tables.borrow().clone()
    }

    pub fn table_names(&self) -> Result<Vec<String>, CacheError> {
        Ok(self.write_tx()?.list_tables()?.map(|h| h.name().to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::test_utils::mk_db;
    use redb::{ReadableTable, TableDefinition};
    use std::rc::Rc;

    #[derive(Default)]
    struct Calls {
        log: RefCell<Vec<&'static str>>,
    }

    struct RecordingHooks(Rc<Calls>);

    impl TransactionHooks for RecordingHooks {
        fn begin(&mut self) -> Result<(), CacheError> {
            self.0.log.borrow_mut().push("begin");
            Ok(())
        }
        fn commit(&mut self) -> Result<(), CacheError> {
            self.0.log.borrow_mut().push("commit");
            Ok(())
        }
        fn rollback(&mut self) -> Result<(), CacheError> {
            self.0.log.borrow_mut().push("rollback");
            Ok(())
        }
        fn release(&mut self) {
            self.0.log.borrow_mut().push("release");
        }
    }

    #[test]
    fn commit_runs_commit_then_release_once() {
        let calls = Rc::new(Calls::default());
        let mut mgr = TransactionManager::new(RecordingHooks(calls.clone())).expect("begin");
        mgr.commit().expect("commit");
        mgr.commit().expect("second commit is a no-op");
        drop(mgr);
        assert_eq!(*calls.log.borrow(), vec!["begin", "commit", "release"]);
    }

    #[test]
    fn abandoned_transaction_rolls_back() {
        let calls = Rc::new(Calls::default());
        {
            let _mgr = TransactionManager::new(RecordingHooks(calls.clone())).expect("begin");
        }
        assert_eq!(*calls.log.borrow(), vec!["begin", "rollback", "release"]);
    }

    #[test]
    fn terminal_states_reject_the_opposite_transition() {
        let calls = Rc::new(Calls::default());
        let mut mgr = TransactionManager::new(RecordingHooks(calls.clone())).expect("begin");
        mgr.rollback().expect("rollback");
        assert_eq!(mgr.commit().unwrap_err().kind(), ErrorKind::Transaction);

        let mut mgr = TransactionManager::new(RecordingHooks(calls)).expect("begin");
        mgr.commit().expect("commit");
        assert_eq!(mgr.rollback().unwrap_err().kind(), ErrorKind::Transaction);
    }

    #[test]
    fn second_open_transaction_fails_fast() {
        let (db, _) = mk_db("tx_single");
        let registry = Arc::new(TxRegistry::default());
        let mut first = Transaction::begin(db.clone(), registry.clone()).expect("first");
        assert_eq!(registry.active(), Some(first.id()));

        let err = Transaction::begin(db.clone(), registry.clone()).err().expect("second must fail");
        assert_eq!(err.kind(), ErrorKind::Transaction);

        first.commit().expect("commit");
        assert_eq!(registry.active(), None);
        let second = Transaction::begin(db, registry.clone()).expect("after commit");
        assert_ne!(second.id(), first.id());
    }

    #[test]
    fn dropped_transaction_leaves_store_untouched() {
        const T: TableDefinition<u32, u32> = TableDefinition::new("scratch");
        let (db, _) = mk_db("tx_drop");
        let registry = Arc::new(TxRegistry::default());

        let mut tx = Transaction::begin(db.clone(), registry.clone()).expect("begin");
        tx.write_tx().expect("open").open_table(T).expect("table").insert(1, 10).expect("insert");
        tx.commit().expect("commit");

        {
            let tx = Transaction::begin(db.clone(), registry.clone()).expect("begin");
            let mut table = tx.write_tx().expect("open").open_table(T).expect("table");
            table.insert(1, 99).expect("overwrite");
            table.insert(2, 20).expect("insert");
        }
        assert_eq!(registry.active(), None);

        let read = db.begin_read().expect("read");
        let table = read.open_table(T).expect("table");
        assert_eq!(table.get(1).expect("get").map(|v| v.value()), Some(10));
        assert!(table.get(2).expect("get").is_none());
    }

    #[test]
    fn mutations_need_an_open_transaction() {
        let (db, _) = mk_db("tx_closed");
        let mut tx = Transaction::begin(db, Arc::new(TxRegistry::default())).expect("begin");
        tx.rollback().expect("rollback");
        assert_eq!(tx.write_tx().err().map(|e| e.kind()), Some(ErrorKind::Transaction));
    }

    #[test]
    fn temp_names_are_unique_and_dropped_at_commit() {
        let (db, _) = mk_db("tx_temp");
        let mut tx = Transaction::begin(db, Arc::new(TxRegistry::default())).expect("begin");
        let a = tx.reserve_temp_name();
        let b = tx.reserve_temp_name();
        assert_ne!(a, b);
        tx.write_tx().expect("open").open_table(TableDefinition::<u32, &[u8]>::new(&a)).expect("temp");
        tx.release_temp_name(&b);
        assert_eq!(tx.live_temp_tables(), vec![a.clone()]);
        tx.commit().expect("commit drops leftovers");
    }
}

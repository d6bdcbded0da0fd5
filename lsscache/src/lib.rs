//! lsscache persists the intermediate products of a one-loop power spectrum pipeline into
//! [Redb](https://github.com/cberner/redb) and works out what still has to be computed.
//!
//! Configuration values (models, redshifts, wavenumbers, integration parameters) are tokenized
//! into small integer ids with tolerance keyed matching. Stage results are stored under keys made
//! of those tokens, so a rerun with the same sample grids finds its earlier work and only the
//! missing part of the tensor product ends up in a work list.
//!
//! All reads and writes go through a single open [`Transaction`] handed out by [`DataManager`].

pub mod admin;
pub mod config_db;
pub mod data_manager;
pub mod error;
pub mod logger;
pub mod payload;
pub mod resolver;
pub mod stage;
pub mod stage_table;
pub mod temp_table;
pub mod token;
pub mod tokenize;
pub mod transaction;
pub mod values;
pub mod work_list;

pub use chrono;
pub use redb;
pub use config_db::*;
pub use data_manager::DataManager;
pub use error::{CacheError, ErrorKind};
pub use payload::*;
pub use resolver::{loop_tensor_product, missing_redshifts, resum_tensor_product, LoopConfiguration, ResumConfiguration};
pub use stage::*;
pub use stage_table::{RebuildReport, TableInfo};
pub use token::*;
pub use transaction::{Transaction, TransactionId, TxState};
pub use values::*;
pub use work_list::*;

#[cfg(test)]
pub(crate) mod test_utils {
    use crate::data_manager::DataManager;
    use redb::Database;
    use std::sync::{Arc, Weak};

    pub(crate) fn mk_db(prefix: &str) -> (Arc<Database>, Weak<Database>) {
        let path = std::env::temp_dir().join(format!("{}_{}", prefix, rand::random::<u64>()));
        let db = Database::builder().create(path).expect("create db");
        let owned = Arc::new(db);
        let weak = Arc::downgrade(&owned);
        (owned, weak)
    }

    pub(crate) fn mk_store(prefix: &str) -> DataManager {
        DataManager::temp(prefix, true).expect("create store")
    }
}

use crate::error::CacheError;
use crate::transaction::Transaction;
use redb::{ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Transaction scoped staging table of `(id, value)` rows.
///
/// The name is reserved from the owning transaction, which drops the table at commit if
/// `discard` was never called. A rollback discards it with everything else.
pub struct TempTable {
    name: String,
    len: usize,
}

impl TempTable {
    pub fn create<V: Serialize>(tx: &Transaction, rows: impl IntoIterator<Item = (u32, V)>) -> Result<Self, CacheError> {
        let name = tx.reserve_temp_name();
        let mut len = 0;
        {
            let mut table = tx.write_tx()?.open_table(Self::def(&name))?;
            for (id, value) in rows {
                table.insert(id, bincode::serialize(&value)?.as_slice())?;
                len += 1;
            }
        }
        Ok(TempTable { name, len })
    }

    fn def(name: &str) -> TableDefinition<'_, u32, &'static [u8]> {
        TableDefinition::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Rows in ascending id order.
    pub fn rows<V: DeserializeOwned>(&self, tx: &Transaction) -> Result<Vec<(u32, V)>, CacheError> {
        let table = tx.write_tx()?.open_table(Self::def(&self.name))?;
        let mut out = Vec::with_capacity(self.len);
        for entry in table.iter()? {
            let (id, bytes) = entry?;
            out.push((id.value(), bincode::deserialize(bytes.value())?));
        }
        Ok(out)
    }

    pub fn discard(self, tx: &Transaction) -> Result<(), CacheError> {
        tx.write_tx()?.delete_table(Self::def(&self.name))?;
        tx.release_temp_name(&self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mk_store;
    use crate::values::Redshift;

    #[test]
    fn rows_come_back_in_id_order_and_table_is_gone_after_drop() {
        let store = mk_store("temp_rows");
        let tx = store.open_transaction().expect("tx");
        let table = TempTable::create(&tx, vec![(5, Redshift(0.5)), (1, Redshift(1.0)), (3, Redshift(3.0))]).expect("create");
        assert_eq!(table.len(), 3);
        let rows: Vec<(u32, Redshift)> = table.rows(&tx).expect("rows");
        assert_eq!(rows.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![1, 3, 5]);

        let name = table.name().to_string();
        assert!(tx.table_names().expect("names").contains(&name));
        table.discard(&tx).expect("discard");
        assert!(!tx.table_names().expect("names").contains(&name));
        assert!(tx.live_temp_tables().is_empty());
    }

    #[test]
    fn rolled_back_temp_tables_leave_nothing_behind() {
        let store = mk_store("temp_rollback");
        let name = {
            let tx = store.open_transaction().expect("tx");
            let table = TempTable::create(&tx, vec![(0, 1.0f64)]).expect("create");
            table.name().to_string()
        };
        let tx = store.open_transaction().expect("tx");
        assert!(!tx.table_names().expect("names").contains(&name));
    }
}

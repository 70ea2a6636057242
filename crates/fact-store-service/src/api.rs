use std::path::PathBuf;

use anyhow::Result;
use fact_store_core::{Fact, NewFact, PrincipalId};
use fact_store_sqlite::{SaveOutcome, SchemaStatus, SqliteFactStore};
use time::Duration;

/// Blocking facade over the SQLite store; each call opens its own connection.
#[derive(Debug, Clone)]
pub struct FactStoreApi {
    db_path: PathBuf,
    idempotency_window: Duration,
}

impl FactStoreApi {
    #[must_use]
    pub fn new(db_path: PathBuf, idempotency_window: Duration) -> Self {
        Self {
            db_path,
            idempotency_window,
        }
    }

    fn open(&self) -> Result<SqliteFactStore> {
        SqliteFactStore::open(&self.db_path)
    }

    pub fn migrate(&self) -> Result<SchemaStatus> {
        let store = self.open()?;
        store.migrate()?;
        store.schema_status()
    }

    pub fn save_fact(&self, input: &NewFact) -> Result<SaveOutcome> {
        let mut store = self.open()?;
        store.insert_fact(input, self.idempotency_window)
    }

    pub fn list_facts(&self, user_id: &PrincipalId) -> Result<Vec<Fact>> {
        self.open()?.list_facts_for_user(user_id)
    }

    #[cfg(test)]
    pub fn count_facts(&self) -> Result<usize> {
        self.open()?.count_facts()
    }
}

#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use fact_store_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, Fact, FactError, IdempotencyKey, NewFact,
    PrincipalId, IDEMPOTENCY_KEY_CONFLICT,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use time::{Duration, OffsetDateTime};

pub const FACTS_MIGRATION_VERSION: i64 = 1;

const SCHEMA_FACTS_V1: &str = r"
CREATE TABLE IF NOT EXISTS facts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  fact_text TEXT NOT NULL CHECK (length(fact_text) > 0),
  created_at TEXT NOT NULL,
  user_id TEXT NOT NULL CHECK (length(user_id) > 0)
);

CREATE TRIGGER IF NOT EXISTS trg_facts_no_update
BEFORE UPDATE ON facts
BEGIN
  SELECT RAISE(FAIL, 'facts are immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_facts_no_delete
BEFORE DELETE ON facts
BEGIN
  SELECT RAISE(FAIL, 'facts are immutable');
END;

CREATE INDEX IF NOT EXISTS idx_facts_user_id
  ON facts(user_id, id);

CREATE TABLE IF NOT EXISTS fact_idempotency (
  user_id TEXT NOT NULL,
  idempotency_key TEXT NOT NULL,
  fact_id INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  PRIMARY KEY (user_id, idempotency_key),
  FOREIGN KEY (fact_id) REFERENCES facts(id)
);
";

pub struct SqliteFactStore {
    conn: Connection,
}

/// Result of a write: the row, and whether it came from an earlier submission.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SaveOutcome {
    pub fact: Fact,
    pub replayed: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
}

impl SqliteFactStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_FACTS_V1)
            .context("failed to apply facts schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![FACTS_MIGRATION_VERSION, now],
            )
            .context("failed to register facts schema migration")?;

        Ok(())
    }

    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let has_table: bool = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations')",
                [],
                |row| row.get(0),
            )
            .context("failed to inspect sqlite_master")?;

        let current_version = if has_table {
            self.conn
                .query_row(
                    "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                    [],
                    |row| row.get(0),
                )
                .context("failed to read schema version")?
        } else {
            0
        };

        Ok(SchemaStatus {
            current_version,
            target_version: FACTS_MIGRATION_VERSION,
        })
    }

    /// Inserts one fact, or replays an earlier one when the same idempotency
    /// key was seen for the same owner within `window`.
    pub fn insert_fact(&mut self, input: &NewFact, window: Duration) -> Result<SaveOutcome> {
        self.insert_fact_at(input, now_utc(), window)
    }

    pub fn insert_fact_at(
        &mut self,
        input: &NewFact,
        now: OffsetDateTime,
        window: Duration,
    ) -> Result<SaveOutcome> {
        input
            .validate()
            .map_err(|err| anyhow!("fact validation failed: {err}"))?;

        let created_at_raw = format_rfc3339(now).map_err(|err| anyhow!(err.to_string()))?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start fact transaction")?;

        if let Some(key) = &input.idempotency_key {
            let seen: Option<(i64, String)> = tx
                .query_row(
                    "SELECT fact_id, created_at FROM fact_idempotency
                     WHERE user_id = ?1 AND idempotency_key = ?2",
                    params![input.user_id.as_str(), key.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .context("failed to look up idempotency key")?;

            if let Some((fact_id, seen_at_raw)) = seen {
                let seen_at =
                    parse_rfc3339_utc(&seen_at_raw).map_err(|err| anyhow!(err.to_string()))?;
                if now - seen_at <= window {
                    let fact = tx
                        .query_row(
                            "SELECT id, fact_text, created_at, user_id FROM facts WHERE id = ?1",
                            params![fact_id],
                            parse_fact_row,
                        )
                        .with_context(|| format!("idempotency key points at missing fact {fact_id}"))?;
                    if fact.fact_text != input.fact_text {
                        return Err(
                            FactError::Validation(IDEMPOTENCY_KEY_CONFLICT.to_string()).into()
                        );
                    }
                    tx.commit().context("failed to commit replay transaction")?;
                    return Ok(SaveOutcome {
                        fact,
                        replayed: true,
                    });
                }
            }
        }

        tx.execute(
            "INSERT INTO facts(fact_text, created_at, user_id) VALUES (?1, ?2, ?3)",
            params![input.fact_text, created_at_raw, input.user_id.as_str()],
        )
        .context("failed to insert fact")?;
        let id = tx.last_insert_rowid();

        if let Some(key) = &input.idempotency_key {
            record_idempotency_key(&tx, &input.user_id, key, id, &created_at_raw)?;
        }

        tx.commit().context("failed to commit fact transaction")?;

        Ok(SaveOutcome {
            fact: Fact {
                id,
                fact_text: input.fact_text.clone(),
                created_at: now,
                user_id: input.user_id.clone(),
            },
            replayed: false,
        })
    }

    /// Facts owned by `user_id`, oldest first.
    pub fn list_facts_for_user(&self, user_id: &PrincipalId) -> Result<Vec<Fact>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, fact_text, created_at, user_id
             FROM facts
             WHERE user_id = ?1
             ORDER BY id ASC",
        )?;

        let rows = stmt.query_map(params![user_id.as_str()], parse_fact_row)?;
        collect_rows(rows)
    }

    pub fn get_fact(&self, id: i64) -> Result<Option<Fact>> {
        self.conn
            .query_row(
                "SELECT id, fact_text, created_at, user_id FROM facts WHERE id = ?1",
                params![id],
                parse_fact_row,
            )
            .optional()
            .with_context(|| format!("failed to load fact {id}"))
    }

    pub fn count_facts(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM facts", [], |row| row.get(0))
            .context("failed to count facts")?;
        usize::try_from(count).with_context(|| format!("invalid fact count: {count}"))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn record_idempotency_key(
    conn: &Connection,
    user_id: &PrincipalId,
    key: &IdempotencyKey,
    fact_id: i64,
    created_at: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO fact_idempotency(user_id, idempotency_key, fact_id, created_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(user_id, idempotency_key) DO UPDATE SET
           fact_id = excluded.fact_id,
           created_at = excluded.created_at",
        params![user_id.as_str(), key.as_str(), fact_id, created_at],
    )
    .context("failed to record idempotency key")?;
    Ok(())
}

fn parse_fact_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Fact> {
    let created_at_raw: String = row.get(2)?;
    let created_at = parse_rfc3339_utc(&created_at_raw).map_err(to_sql_error)?;

    Ok(Fact {
        id: row.get(0)?,
        fact_text: row.get(1)?,
        created_at,
        user_id: PrincipalId(row.get(3)?),
    })
}

fn to_sql_error(err: FactError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        2,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn fixture_store() -> SqliteFactStore {
        let store = must(SqliteFactStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn fixture_time(raw: &str) -> OffsetDateTime {
        match parse_rfc3339_utc(raw) {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture timestamp: {err}"),
        }
    }

    fn new_fact(user: &str, text: &str) -> NewFact {
        NewFact {
            user_id: PrincipalId::from(user),
            fact_text: text.to_string(),
            idempotency_key: None,
        }
    }

    fn keyed_fact(user: &str, text: &str, key: &str) -> NewFact {
        NewFact {
            idempotency_key: Some(match IdempotencyKey::parse(key) {
                Ok(value) => value,
                Err(err) => panic!("invalid fixture key: {err}"),
            }),
            ..new_fact(user, text)
        }
    }

    fn window() -> Duration {
        Duration::minutes(10)
    }

    #[test]
    fn insert_returns_persisted_row_with_owner_and_timestamp() {
        let mut store = fixture_store();
        let now = fixture_time("2026-02-07T12:00:00Z");

        let outcome = must(store.insert_fact_at(
            &new_fact("user-a", "Water covers 71% of Earth's surface."),
            now,
            window(),
        ));

        assert!(!outcome.replayed);
        assert_eq!(outcome.fact.fact_text, "Water covers 71% of Earth's surface.");
        assert_eq!(outcome.fact.user_id, PrincipalId::from("user-a"));
        assert_eq!(outcome.fact.created_at, now);

        let stored = must(store.get_fact(outcome.fact.id));
        assert_eq!(stored, Some(outcome.fact));
    }

    #[test]
    fn identical_writes_without_key_produce_distinct_rows() {
        let mut store = fixture_store();
        let first = must(store.insert_fact(&new_fact("user-a", "same"), window()));
        let second = must(store.insert_fact(&new_fact("user-a", "same"), window()));

        assert_ne!(first.fact.id, second.fact.id);
        assert_eq!(must(store.count_facts()), 2);
    }

    #[test]
    fn empty_text_is_rejected_before_insert() {
        let mut store = fixture_store();
        let result = store.insert_fact(&new_fact("user-a", ""), window());
        assert!(result.is_err());
        assert_eq!(must(store.count_facts()), 0);
    }

    #[test]
    fn facts_are_immutable_at_the_schema_level() {
        let mut store = fixture_store();
        let outcome = must(store.insert_fact(&new_fact("user-a", "original"), window()));

        let update = store.connection().execute(
            "UPDATE facts SET fact_text = 'mutated' WHERE id = ?1",
            params![outcome.fact.id],
        );
        assert!(update.is_err());

        let delete = store
            .connection()
            .execute("DELETE FROM facts WHERE id = ?1", params![outcome.fact.id]);
        assert!(delete.is_err());
    }

    #[test]
    fn list_is_scoped_to_owner_and_ordered_by_id() {
        let mut store = fixture_store();
        must(store.insert_fact(&new_fact("user-a", "a1"), window()));
        must(store.insert_fact(&new_fact("user-b", "b1"), window()));
        must(store.insert_fact(&new_fact("user-a", "a2"), window()));

        let facts = must(store.list_facts_for_user(&PrincipalId::from("user-a")));
        let texts: Vec<&str> = facts.iter().map(|fact| fact.fact_text.as_str()).collect();
        assert_eq!(texts, vec!["a1", "a2"]);
        assert!(facts.windows(2).all(|pair| pair[0].id < pair[1].id));

        assert!(must(store.list_facts_for_user(&PrincipalId::from("user-c"))).is_empty());
    }

    #[test]
    fn idempotency_key_replays_within_window() {
        let mut store = fixture_store();
        let now = fixture_time("2026-02-07T12:00:00Z");

        let first = must(store.insert_fact_at(&keyed_fact("user-a", "fact", "key-1"), now, window()));
        let replay = must(store.insert_fact_at(
            &keyed_fact("user-a", "fact", "key-1"),
            now + Duration::minutes(5),
            window(),
        ));

        assert!(!first.replayed);
        assert!(replay.replayed);
        assert_eq!(replay.fact, first.fact);
        assert_eq!(must(store.count_facts()), 1);
    }

    #[test]
    fn replayed_key_with_different_text_is_a_validation_error() {
        let mut store = fixture_store();
        let now = fixture_time("2026-02-07T12:00:00Z");
        must(store.insert_fact_at(&keyed_fact("user-a", "fact", "key-1"), now, window()));

        let err = match store.insert_fact_at(
            &keyed_fact("user-a", "another fact", "key-1"),
            now + Duration::minutes(1),
            window(),
        ) {
            Ok(outcome) => panic!("conflicting replay should fail, got {outcome:?}"),
            Err(err) => err,
        };
        assert_eq!(
            err.downcast_ref::<FactError>(),
            Some(&FactError::Validation(IDEMPOTENCY_KEY_CONFLICT.to_string()))
        );
        assert_eq!(must(store.count_facts()), 1);
    }

    #[test]
    fn idempotency_key_expires_after_window() {
        let mut store = fixture_store();
        let now = fixture_time("2026-02-07T12:00:00Z");

        let first = must(store.insert_fact_at(&keyed_fact("user-a", "fact", "key-1"), now, window()));
        let later = must(store.insert_fact_at(
            &keyed_fact("user-a", "fact", "key-1"),
            now + Duration::minutes(11),
            window(),
        ));

        assert!(!later.replayed);
        assert_ne!(later.fact.id, first.fact.id);

        let again = must(store.insert_fact_at(
            &keyed_fact("user-a", "fact", "key-1"),
            now + Duration::minutes(12),
            window(),
        ));
        assert!(again.replayed);
        assert_eq!(again.fact.id, later.fact.id);
    }

    #[test]
    fn idempotency_keys_are_scoped_per_owner() {
        let mut store = fixture_store();
        let a = must(store.insert_fact(&keyed_fact("user-a", "fact", "shared"), window()));
        let b = must(store.insert_fact(&keyed_fact("user-b", "fact", "shared"), window()));

        assert!(!b.replayed);
        assert_ne!(a.fact.id, b.fact.id);
        assert_eq!(b.fact.user_id, PrincipalId::from("user-b"));
    }

    #[test]
    fn migration_is_idempotent_and_reports_status() {
        let store = must(SqliteFactStore::open(Path::new(":memory:")));
        assert_eq!(
            must(store.schema_status()),
            SchemaStatus {
                current_version: 0,
                target_version: FACTS_MIGRATION_VERSION
            }
        );

        must(store.migrate());
        must(store.migrate());
        let status = must(store.schema_status());
        assert_eq!(status.current_version, status.target_version);
    }

    #[test]
    fn file_backed_store_survives_reopen() {
        let path = std::env::temp_dir().join(format!("fact-store-{}.sqlite3", ulid::Ulid::new()));
        {
            let mut store = must(SqliteFactStore::open(&path));
            must(store.migrate());
            must(store.insert_fact(&new_fact("user-a", "persisted"), window()));
        }

        let store = must(SqliteFactStore::open(&path));
        must(store.migrate());
        let facts = must(store.list_facts_for_user(&PrincipalId::from("user-a")));
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].fact_text, "persisted");

        drop(store);
        let _ = std::fs::remove_file(&path);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_repeated_writes_never_deduplicate(text in "[a-zA-Z0-9 .,'%]{1,60}", repeats in 2usize..6) {
            let mut store = fixture_store();
            let mut ids = BTreeSet::new();
            for _ in 0..repeats {
                let outcome = must(store.insert_fact(&new_fact("user-a", &text), window()));
                prop_assert!(!outcome.replayed);
                prop_assert_eq!(&outcome.fact.fact_text, &text);
                ids.insert(outcome.fact.id);
            }
            prop_assert_eq!(ids.len(), repeats);
        }

        #[test]
        fn prop_listing_never_leaks_other_owners(owners in prop::collection::vec(any::<bool>(), 1..40)) {
            let mut store = fixture_store();
            let mut expected_a = 0usize;
            for (index, is_a) in owners.iter().enumerate() {
                let user = if *is_a { "user-a" } else { "user-b" };
                if *is_a {
                    expected_a += 1;
                }
                must(store.insert_fact(&new_fact(user, &format!("fact {index}")), window()));
            }

            let facts_a = must(store.list_facts_for_user(&PrincipalId::from("user-a")));
            prop_assert_eq!(facts_a.len(), expected_a);
            prop_assert!(facts_a.iter().all(|fact| fact.user_id.as_str() == "user-a"));

            let facts_b = must(store.list_facts_for_user(&PrincipalId::from("user-b")));
            prop_assert_eq!(facts_b.len(), owners.len() - expected_a);
            prop_assert!(facts_b.iter().all(|fact| fact.user_id.as_str() == "user-b"));
        }
    }
}

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use bookscout_core::Item;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS catalog_items (
  item_id TEXT PRIMARY KEY,
  position INTEGER NOT NULL,
  title TEXT NOT NULL,
  author TEXT NOT NULL,
  topic TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS recommendation_history (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  batch_id TEXT NOT NULL,
  recommended_at TEXT NOT NULL,
  item_id TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_catalog_items_position ON catalog_items(position);
CREATE INDEX IF NOT EXISTS idx_recommendation_history_item ON recommendation_history(item_id);
CREATE INDEX IF NOT EXISTS idx_recommendation_history_batch ON recommendation_history(batch_id);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// Result of handing a fresh catalog snapshot to the cache. The snapshot is
/// replaced only when the incoming item-ID set differs from the cached set;
/// otherwise the cached rows are reused verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncOutcome {
    pub replaced: bool,
    pub item_count: usize,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub batch_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub recommended_at: OffsetDateTime,
    pub item_id: String,
}

impl SqliteStore {
    /// Open a SQLite-backed catalog/history store and configure runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
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

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            self.conn
                .execute_batch(MIGRATION_001_SQL)
                .context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Hand a catalog snapshot to the cache. Replaces every cached row in one
    /// transaction when the incoming ID set differs from the cached ID set;
    /// reuses the cached snapshot untouched when the sets match.
    ///
    /// # Errors
    /// Returns an error when cached IDs cannot be read or the replacement
    /// transaction fails.
    pub fn sync_catalog(&mut self, items: &[Item]) -> Result<SyncOutcome> {
        let incoming: BTreeSet<String> = items.iter().map(|item| item.id.clone()).collect();
        let cached = self.cached_item_ids()?;
        let fingerprint = catalog_fingerprint(&incoming);

        if incoming == cached {
            return Ok(SyncOutcome { replaced: false, item_count: items.len(), fingerprint });
        }

        let tx = self.conn.transaction().context("failed to start catalog sync transaction")?;
        tx.execute("DELETE FROM catalog_items", [])
            .context("failed to clear cached catalog")?;
        for (position, item) in items.iter().enumerate() {
            tx.execute(
                "INSERT INTO catalog_items(item_id, position, title, author, topic)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![item.id, i64::try_from(position)?, item.title, item.author, item.topic],
            )
            .with_context(|| format!("failed to insert catalog item {}", item.id))?;
        }
        tx.commit().context("failed to commit catalog sync transaction")?;

        Ok(SyncOutcome { replaced: true, item_count: items.len(), fingerprint })
    }

    /// Load the cached catalog snapshot in its original upstream order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read from `SQLite`.
    pub fn load_catalog(&self) -> Result<Vec<Item>> {
        let mut stmt = self.conn.prepare(
            "SELECT item_id, title, author, topic
             FROM catalog_items
             ORDER BY position ASC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(Item {
                id: row.get(0)?,
                title: row.get(1)?,
                author: row.get(2)?,
                topic: row.get(3)?,
            })
        })?;

        let mut items = Vec::new();
        for item in rows {
            items.push(item.context("failed to decode catalog item row")?);
        }
        Ok(items)
    }

    /// The set of item IDs currently cached.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read from `SQLite`.
    pub fn cached_item_ids(&self) -> Result<BTreeSet<String>> {
        let mut stmt = self.conn.prepare("SELECT item_id FROM catalog_items")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut ids = BTreeSet::new();
        for id in rows {
            ids.insert(id.context("failed to decode cached item id")?);
        }
        Ok(ids)
    }

    /// Every item ID ever recommended, as the engine's exclusion set.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read from `SQLite`.
    pub fn past_recommendation_ids(&self) -> Result<BTreeSet<String>> {
        let mut stmt =
            self.conn.prepare("SELECT DISTINCT item_id FROM recommendation_history")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut ids = BTreeSet::new();
        for id in rows {
            ids.insert(id.context("failed to decode recommended item id")?);
        }
        Ok(ids)
    }

    /// Append one recommendation batch to the history, keyed by timestamp and
    /// a fresh batch ID. Returns the batch ID.
    ///
    /// # Errors
    /// Returns an error when timestamp formatting or any write in the
    /// transaction fails.
    pub fn record_recommendations(
        &mut self,
        item_ids: &[String],
        recommended_at: OffsetDateTime,
    ) -> Result<String> {
        let batch_id = Ulid::new().to_string();
        let recommended_at = rfc3339(recommended_at)?;

        let tx = self.conn.transaction().context("failed to start history transaction")?;
        for item_id in item_ids {
            tx.execute(
                "INSERT INTO recommendation_history(batch_id, recommended_at, item_id)
                 VALUES (?1, ?2, ?3)",
                params![batch_id, recommended_at, item_id],
            )
            .with_context(|| format!("failed to record recommendation for {item_id}"))?;
        }
        tx.commit().context("failed to commit history transaction")?;

        Ok(batch_id)
    }

    /// All recorded recommendations in append order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or timestamps fail to parse.
    pub fn list_history(&self) -> Result<Vec<HistoryEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT batch_id, recommended_at, item_id
             FROM recommendation_history
             ORDER BY id ASC",
        )?;

        let mut rows = stmt.query([])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(HistoryEntry {
                batch_id: row.get(0)?,
                recommended_at: parse_rfc3339(&row.get::<_, String>(1)?)?,
                item_id: row.get(2)?,
            });
        }
        Ok(entries)
    }

    /// Delete the entire recommendation history. Returns the number of rows
    /// removed.
    ///
    /// # Errors
    /// Returns an error when the delete statement fails.
    pub fn clear_history(&mut self) -> Result<usize> {
        self.conn
            .execute("DELETE FROM recommendation_history", [])
            .context("failed to clear recommendation history")
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
        .context("failed to read schema version")?;
    Ok(version.unwrap_or(0))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now_rfc3339()?],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

/// Stable digest of a catalog's identity: sha256 over the sorted item-ID set.
#[must_use]
pub fn catalog_fingerprint(item_ids: &BTreeSet<String>) -> String {
    let mut hasher = Sha256::new();
    for item_id in item_ids {
        hasher.update(item_id.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    let digest_hex = format!("{digest:x}");
    format!("cat_{}", &digest_hex[..16])
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn item(id: &str, title: &str) -> Item {
        Item {
            id: id.to_string(),
            title: title.to_string(),
            author: "Author".to_string(),
            topic: "topic".to_string(),
        }
    }

    #[test]
    fn migrate_reaches_latest_schema_and_is_idempotent() -> Result<()> {
        let mut store = open_store()?;
        store.migrate()?;

        let status = store.schema_status()?;
        assert_eq!(status.current_version, LATEST_SCHEMA_VERSION);
        assert_eq!(status.target_version, LATEST_SCHEMA_VERSION);
        assert!(status.pending_versions.is_empty());
        Ok(())
    }

    #[test]
    fn schema_status_reports_pending_migration_before_migrate() -> Result<()> {
        let store = SqliteStore::open(Path::new(":memory:"))?;

        let status = store.schema_status()?;
        assert_eq!(status.current_version, 0);
        assert_eq!(status.pending_versions, vec![1]);
        Ok(())
    }

    #[test]
    fn sync_replaces_on_id_set_change_and_reuses_otherwise() -> Result<()> {
        let mut store = open_store()?;

        let first = store.sync_catalog(&[item("a", "Dune"), item("b", "Emma")])?;
        assert!(first.replaced);
        assert_eq!(first.item_count, 2);

        // Same ID set with different titles: the cached snapshot wins.
        let second = store.sync_catalog(&[item("a", "Renamed"), item("b", "Emma")])?;
        assert!(!second.replaced);
        assert_eq!(second.fingerprint, first.fingerprint);
        let cached = store.load_catalog()?;
        assert_eq!(cached[0].title, "Dune");

        let third = store.sync_catalog(&[item("a", "Dune"), item("c", "Persuasion")])?;
        assert!(third.replaced);
        assert_ne!(third.fingerprint, first.fingerprint);
        let ids = store.cached_item_ids()?;
        assert!(ids.contains("c"));
        assert!(!ids.contains("b"));
        Ok(())
    }

    #[test]
    fn load_catalog_preserves_upstream_order() -> Result<()> {
        let mut store = open_store()?;
        let items =
            vec![item("z", "Last Alphabetically"), item("a", "First Alphabetically"), item("m", "Middle")];

        store.sync_catalog(&items)?;
        let loaded = store.load_catalog()?;

        assert_eq!(loaded, items);
        Ok(())
    }

    #[test]
    fn history_accumulates_batches_and_feeds_the_exclusion_set() -> Result<()> {
        let mut store = open_store()?;
        let now = OffsetDateTime::UNIX_EPOCH;

        let first_batch =
            store.record_recommendations(&["a".to_string(), "b".to_string()], now)?;
        let second_batch = store.record_recommendations(&["b".to_string()], now)?;
        assert_ne!(first_batch, second_batch);

        let past = store.past_recommendation_ids()?;
        let expected: BTreeSet<String> = ["a", "b"].iter().map(|id| (*id).to_string()).collect();
        assert_eq!(past, expected);

        let entries = store.list_history()?;
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].batch_id, first_batch);
        assert_eq!(entries[2].batch_id, second_batch);
        assert_eq!(entries[2].item_id, "b");
        Ok(())
    }

    #[test]
    fn clear_history_empties_the_exclusion_set() -> Result<()> {
        let mut store = open_store()?;
        store.record_recommendations(&["a".to_string()], OffsetDateTime::UNIX_EPOCH)?;

        let removed = store.clear_history()?;
        assert_eq!(removed, 1);
        assert!(store.past_recommendation_ids()?.is_empty());
        Ok(())
    }

    #[test]
    fn fingerprint_is_order_insensitive_over_the_id_set() {
        let forward: BTreeSet<String> = ["a", "b", "c"].iter().map(|id| (*id).to_string()).collect();
        let reverse: BTreeSet<String> = ["c", "b", "a"].iter().map(|id| (*id).to_string()).collect();

        assert_eq!(catalog_fingerprint(&forward), catalog_fingerprint(&reverse));
        assert!(catalog_fingerprint(&forward).starts_with("cat_"));
    }
}

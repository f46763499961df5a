use std::collections::BTreeMap;
use std::fs;
use std::io::BufRead;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use cycle_count_core::{canonical_bin, ExpectedRow};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS kv_entries (
  key TEXT PRIMARY KEY,
  value_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS expected_rows (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  location TEXT NOT NULL,
  location_key TEXT NOT NULL,
  sku TEXT NOT NULL,
  description TEXT NOT NULL,
  serial_id TEXT,
  quantity INTEGER NOT NULL CHECK (quantity >= 0)
);

CREATE TABLE IF NOT EXISTS snapshot_imports (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  imported_at TEXT NOT NULL,
  source TEXT NOT NULL,
  sha256 TEXT NOT NULL,
  rows INTEGER NOT NULL CHECK (rows >= 0)
);

CREATE INDEX IF NOT EXISTS idx_expected_rows_location_key ON expected_rows(location_key);
CREATE INDEX IF NOT EXISTS idx_expected_rows_serial_id ON expected_rows(serial_id);
";

/// Durable-enough JSON key-value storage. Each call stands alone: there is no
/// transaction spanning a `get` and the `set` that follows it.
pub trait KeyValueStore: Send + Sync {
    /// # Errors
    /// Returns an error when the backing store cannot be read or decoded.
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// # Errors
    /// Returns an error when the backing store rejects the write.
    fn set(&self, key: &str, value: &Value) -> Result<()>;
}

/// Read access to the expected-inventory snapshot.
pub trait SnapshotReader: Send + Sync {
    /// Rows whose location matches `bin` case-insensitively.
    ///
    /// # Errors
    /// Returns an error when the snapshot source cannot be read.
    fn expected_rows(&self, bin: &str) -> Result<Vec<ExpectedRow>>;

    /// First expected row carrying `serial_id`.
    ///
    /// # Errors
    /// Returns an error when the snapshot source cannot be read.
    fn find_serial(&self, serial_id: &str) -> Result<Option<ExpectedRow>>;
}

/// In-process fallback store used when no database is configured.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<MutexGuard<'_, BTreeMap<String, Value>>> {
        self.entries.lock().map_err(|_| anyhow!("memory store lock poisoned"))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &Value) -> Result<()> {
        self.entries()?.insert(key.to_string(), value.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemorySnapshot {
    rows: Vec<ExpectedRow>,
}

impl InMemorySnapshot {
    #[must_use]
    pub fn from_rows(rows: Vec<ExpectedRow>) -> Self {
        Self { rows: rows.iter().map(ExpectedRow::trimmed).collect() }
    }

    /// Load an NDJSON snapshot (one [`ExpectedRow`] per line).
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or a line is not a valid row.
    pub fn load_ndjson(path: &Path) -> Result<Self> {
        Ok(Self::from_rows(read_ndjson_file(path)?))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl SnapshotReader for InMemorySnapshot {
    fn expected_rows(&self, bin: &str) -> Result<Vec<ExpectedRow>> {
        let bin = canonical_bin(bin);
        Ok(self.rows.iter().filter(|row| canonical_bin(&row.location) == bin).cloned().collect())
    }

    fn find_serial(&self, serial_id: &str) -> Result<Option<ExpectedRow>> {
        let serial_id = serial_id.trim();
        Ok(self.rows.iter().find(|row| row.serial() == Some(serial_id)).cloned())
    }
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotImportSummary {
    pub source: String,
    pub sha256: String,
    pub rows: usize,
    pub serialized_rows: usize,
    pub locations: usize,
    pub imported_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub kv_entries: i64,
    pub expected_rows: i64,
    pub last_snapshot_import: Option<SnapshotImportSummary>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed store and configure required runtime pragmas.
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

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open the database and bring its schema up to date.
    ///
    /// # Errors
    /// Returns an error when opening or migrating fails.
    pub fn open_migrated(path: &Path) -> Result<Self> {
        let store = Self::open(path)?;
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("sqlite connection lock poisoned"))
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let conn = self.conn()?;
        schema_status(&conn)
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails.
    pub fn migrate(&self) -> Result<()> {
        let mut conn = self.conn()?;
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&conn)?;
        if version < 1 {
            let tx = conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            tracing::debug!(version = 1, "applied sqlite migration");
        }

        let version = current_schema_version(&conn)?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Replace the expected snapshot with the rows of an NDJSON file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed, or the replace
    /// transaction fails. A failed import leaves the previous snapshot intact.
    pub fn import_snapshot_ndjson(&self, path: &Path) -> Result<SnapshotImportSummary> {
        let bytes = fs::read(path)
            .with_context(|| format!("failed to read snapshot file {}", path.display()))?;
        let sha256 = format!("{:x}", Sha256::digest(&bytes));
        let rows = parse_ndjson(&bytes, path)?;
        self.replace_snapshot(&rows, &path.display().to_string(), &sha256)
    }

    /// Replace the expected snapshot atomically.
    ///
    /// # Errors
    /// Returns an error when any write in the replace transaction fails.
    pub fn replace_snapshot(
        &self,
        rows: &[ExpectedRow],
        source: &str,
        sha256: &str,
    ) -> Result<SnapshotImportSummary> {
        let imported_at = now_rfc3339()?;
        let mut conn = self.conn()?;
        let tx = conn.transaction().context("failed to start snapshot transaction")?;

        tx.execute("DELETE FROM expected_rows", []).context("failed to clear expected rows")?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO expected_rows(location, location_key, sku, description, serial_id, quantity)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for row in rows.iter().map(ExpectedRow::trimmed) {
                insert
                    .execute(params![
                        row.location,
                        canonical_bin(&row.location),
                        row.sku,
                        row.description,
                        row.serial_id,
                        i64::from(row.quantity),
                    ])
                    .with_context(|| {
                        format!("failed to insert expected row for location {}", row.location)
                    })?;
            }
        }
        tx.execute(
            "INSERT INTO snapshot_imports(imported_at, source, sha256, rows) VALUES (?1, ?2, ?3, ?4)",
            params![imported_at, source, sha256, i64::try_from(rows.len()).unwrap_or(i64::MAX)],
        )
        .context("failed to record snapshot import")?;
        tx.commit().context("failed to commit snapshot transaction")?;

        let summary = SnapshotImportSummary {
            source: source.to_string(),
            sha256: sha256.to_string(),
            rows: rows.len(),
            serialized_rows: rows.iter().filter(|row| row.serial().is_some()).count(),
            locations: rows
                .iter()
                .map(|row| canonical_bin(&row.location))
                .collect::<std::collections::BTreeSet<_>>()
                .len(),
            imported_at,
        };
        tracing::info!(rows = summary.rows, sha256 = %summary.sha256, "expected snapshot replaced");
        Ok(summary)
    }

    /// Most recent snapshot import, if any.
    ///
    /// # Errors
    /// Returns an error when the import log cannot be read.
    pub fn last_snapshot_import(&self) -> Result<Option<SnapshotImportSummary>> {
        let conn = self.conn()?;
        last_snapshot_import(&conn)
    }

    /// Run quick-check plus row-count and schema status health checks.
    ///
    /// # Errors
    /// Returns an error when any integrity check query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let conn = self.conn()?;
        let quick_check_message: String = conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;
        let kv_entries = count_rows(&conn, "kv_entries")?;
        let expected_rows = count_rows(&conn, "expected_rows")?;
        let last_snapshot_import = last_snapshot_import(&conn)?;
        let schema_status = schema_status(&conn)?;

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            kv_entries,
            expected_rows,
            last_snapshot_import,
            schema_status,
        })
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let conn = self.conn()?;
        let raw = conn
            .query_row("SELECT value_json FROM kv_entries WHERE key = ?1", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()
            .with_context(|| format!("failed to read key {key}"))?;

        match raw {
            Some(json) => {
                let value = serde_json::from_str(&json)
                    .with_context(|| format!("failed to deserialize stored value for key {key}"))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &Value) -> Result<()> {
        let json = serde_json::to_string(value).context("failed to serialize value")?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO kv_entries(key, value_json, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![key, json, now_rfc3339()?],
        )
        .with_context(|| format!("failed to write key {key}"))?;
        Ok(())
    }
}

impl SnapshotReader for SqliteStore {
    fn expected_rows(&self, bin: &str) -> Result<Vec<ExpectedRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT location, sku, description, serial_id, quantity
             FROM expected_rows
             WHERE location_key = ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![canonical_bin(bin)], map_expected_row)?;

        let mut expected = Vec::new();
        for row in rows {
            expected.push(row.context("failed to decode expected row")?);
        }
        Ok(expected)
    }

    fn find_serial(&self, serial_id: &str) -> Result<Option<ExpectedRow>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT location, sku, description, serial_id, quantity
             FROM expected_rows
             WHERE serial_id = ?1
             ORDER BY id ASC
             LIMIT 1",
            params![serial_id.trim()],
            map_expected_row,
        )
        .optional()
        .with_context(|| format!("failed to look up serial {serial_id}"))
    }
}

fn map_expected_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExpectedRow> {
    Ok(ExpectedRow {
        location: row.get(0)?,
        sku: row.get(1)?,
        description: row.get(2)?,
        serial_id: row.get(3)?,
        quantity: row.get(4)?,
    })
}

fn schema_status(conn: &Connection) -> Result<SchemaStatus> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to apply schema_migrations table")?;
    let current_version = current_schema_version(conn)?;
    let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
        ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
    } else {
        Vec::new()
    };

    Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn count_rows(conn: &Connection, table: &str) -> Result<i64> {
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get::<_, i64>(0))
        .with_context(|| format!("failed to count rows in {table}"))
}

fn last_snapshot_import(conn: &Connection) -> Result<Option<SnapshotImportSummary>> {
    let latest = conn
        .query_row(
            "SELECT imported_at, source, sha256, rows
             FROM snapshot_imports
             ORDER BY id DESC
             LIMIT 1",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()
        .context("failed to read snapshot import log")?;

    let Some((imported_at, source, sha256, rows)) = latest else {
        return Ok(None);
    };

    let serialized_rows = conn
        .query_row("SELECT COUNT(*) FROM expected_rows WHERE serial_id IS NOT NULL", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to count serialized expected rows")?;
    let locations = conn
        .query_row("SELECT COUNT(DISTINCT location_key) FROM expected_rows", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to count snapshot locations")?;

    Ok(Some(SnapshotImportSummary {
        source,
        sha256,
        rows: usize::try_from(rows).unwrap_or(0),
        serialized_rows: usize::try_from(serialized_rows).unwrap_or(0),
        locations: usize::try_from(locations).unwrap_or(0),
        imported_at,
    }))
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_ndjson<T: DeserializeOwned>(bytes: &[u8], path: &Path) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for (index, line) in bytes.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        values.push(value);
    }
    Ok(values)
}

fn read_ndjson_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read NDJSON file {}", path.display()))?;
    parse_ndjson(&bytes, path)
}

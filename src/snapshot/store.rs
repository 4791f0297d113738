use crate::snapshot::SnapshotData;
use anyhow::{bail, Result};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, TransactionBehavior};
use std::collections::HashMap;
use std::path::Path;

/// Append-only keyed storage for snapshots. Inserting an existing id fails;
/// nothing is ever updated or deleted.
pub trait SnapshotStore: Send + Sync {
    /// Stores `snapshot` and returns it as stored. An empty version is
    /// assigned the sandbox's snapshot count plus one, atomically with the
    /// insert.
    fn insert(&self, snapshot: SnapshotData) -> Result<SnapshotData>;
    fn get(&self, id: &str) -> Result<Option<SnapshotData>>;
    /// Snapshots of one sandbox in creation order.
    fn list_by_sandbox(&self, sandbox_id: &str) -> Result<Vec<SnapshotData>>;
    fn count_by_sandbox(&self, sandbox_id: &str) -> Result<usize>;
    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[derive(Default)]
struct Arena {
    log: Vec<SnapshotData>,
    by_id: HashMap<String, usize>,
    by_sandbox: HashMap<String, Vec<usize>>,
}

/// In-memory log with an id -> offset index and a per-sandbox index.
#[derive(Default)]
pub struct MemorySnapshotStore {
    arena: RwLock<Arena>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn insert(&self, mut snapshot: SnapshotData) -> Result<SnapshotData> {
        let mut arena = self.arena.write();
        if arena.by_id.contains_key(&snapshot.id) {
            bail!("snapshot {} already exists", snapshot.id);
        }
        if snapshot.metadata.version.is_empty() {
            let existing = arena.by_sandbox.get(&snapshot.sandbox_id).map_or(0, Vec::len);
            snapshot.metadata.version = (existing + 1).to_string();
        }
        let offset = arena.log.len();
        arena.log.push(snapshot.clone());
        arena.by_id.insert(snapshot.id.clone(), offset);
        arena
            .by_sandbox
            .entry(snapshot.sandbox_id.clone())
            .or_default()
            .push(offset);
        Ok(snapshot)
    }

    fn get(&self, id: &str) -> Result<Option<SnapshotData>> {
        let arena = self.arena.read();
        Ok(arena.by_id.get(id).map(|&offset| arena.log[offset].clone()))
    }

    fn list_by_sandbox(&self, sandbox_id: &str) -> Result<Vec<SnapshotData>> {
        let arena = self.arena.read();
        Ok(arena
            .by_sandbox
            .get(sandbox_id)
            .map(|offsets| offsets.iter().map(|&o| arena.log[o].clone()).collect())
            .unwrap_or_default())
    }

    fn count_by_sandbox(&self, sandbox_id: &str) -> Result<usize> {
        Ok(self
            .arena
            .read()
            .by_sandbox
            .get(sandbox_id)
            .map(Vec::len)
            .unwrap_or(0))
    }

    fn len(&self) -> Result<usize> {
        Ok(self.arena.read().log.len())
    }
}

/// SQLite-backed store. Payloads are stored as JSON next to indexed columns.
pub struct SqliteSnapshotStore {
    conn: Mutex<Connection>,
}

impl SqliteSnapshotStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        Self::init(Connection::open(db_path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS snapshots (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                sandbox_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                checksum TEXT NOT NULL,
                payload TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_snapshots_sandbox ON snapshots (sandbox_id, seq)",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn decode(payload: String) -> Result<SnapshotData> {
        Ok(serde_json::from_str(&payload)?)
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn insert(&self, mut snapshot: SnapshotData) -> Result<SnapshotData> {
        let mut conn = self.conn.lock();
        // IMMEDIATE holds the write lock across count and insert, so other
        // connections to the same file cannot interleave
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if snapshot.metadata.version.is_empty() {
            let existing: i64 = tx.query_row(
                "SELECT COUNT(*) FROM snapshots WHERE sandbox_id = ?1",
                params![snapshot.sandbox_id],
                |row| row.get(0),
            )?;
            snapshot.metadata.version = (existing + 1).to_string();
        }
        let payload = serde_json::to_string(&snapshot)?;
        tx.execute(
            "INSERT INTO snapshots (id, sandbox_id, created_at, checksum, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                snapshot.id,
                snapshot.sandbox_id,
                snapshot.timestamp.to_rfc3339(),
                snapshot.checksum,
                payload
            ],
        )?;
        tx.commit()?;
        Ok(snapshot)
    }

    fn get(&self, id: &str) -> Result<Option<SnapshotData>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT payload FROM snapshots WHERE id = ?1")?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::decode(row.get(0)?)?)),
            None => Ok(None),
        }
    }

    fn list_by_sandbox(&self, sandbox_id: &str) -> Result<Vec<SnapshotData>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT payload FROM snapshots WHERE sandbox_id = ?1 ORDER BY seq")?;
        let rows = stmt.query_map(params![sandbox_id], |row| row.get::<_, String>(0))?;

        let mut snapshots = Vec::new();
        for payload in rows {
            snapshots.push(Self::decode(payload?)?);
        }
        Ok(snapshots)
    }

    fn count_by_sandbox(&self, sandbox_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM snapshots WHERE sandbox_id = ?1",
            params![sandbox_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn len(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

//! SQLite reference store
//!
//! One database file under `<base>/.context/`, guarded by a connection
//! mutex. WAL mode keeps concurrent readers cheap. Rows carry JSON columns
//! for positions, parents and metadata; queries hit the indexed columns.

use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::document::{Construct, DocumentSnapshot};
use crate::ops::{OpId, OpKind, Operation, OperationMeta};
use crate::position::{AuthorId, Position};

use super::manifest::{Manifest, CONTEXT_DIR, MANIFEST_FILE};
use super::{DocumentStore, OperationStore, StorageError, Store};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS operations (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL,
    position_segments TEXT NOT NULL,
    content TEXT NOT NULL,
    length INTEGER,
    author TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    parents TEXT,
    metadata TEXT
);

CREATE TABLE IF NOT EXISTS documents (
    file_path TEXT PRIMARY KEY,
    version INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    last_operation TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS constructs (
    id TEXT PRIMARY KEY,
    document_path TEXT NOT NULL,
    position_segments TEXT NOT NULL,
    content TEXT NOT NULL,
    type TEXT NOT NULL,
    created_by TEXT NOT NULL,
    modified_by TEXT NOT NULL,
    metadata TEXT,
    FOREIGN KEY (document_path) REFERENCES documents(file_path),
    FOREIGN KEY (created_by) REFERENCES operations(id),
    FOREIGN KEY (modified_by) REFERENCES operations(id)
);

CREATE INDEX IF NOT EXISTS idx_operations_timestamp ON operations(timestamp);
CREATE INDEX IF NOT EXISTS idx_operations_author ON operations(author);
CREATE INDEX IF NOT EXISTS idx_operations_type ON operations(type);
CREATE INDEX IF NOT EXISTS idx_constructs_document ON constructs(document_path);
CREATE INDEX IF NOT EXISTS idx_constructs_type ON constructs(type);
CREATE INDEX IF NOT EXISTS idx_constructs_position ON constructs(position_segments);
";

/// The reference `Store`, persisting to a single SQLite database.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the store under `<base>/.context/`. An existing
    /// directory must carry a valid manifest with our marker and a
    /// compatible version.
    pub fn open(base_dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let context_path = base_dir.as_ref().join(CONTEXT_DIR);
        let manifest_path = context_path.join(MANIFEST_FILE);

        let manifest = if context_path.exists() {
            if !manifest_path.exists() {
                return Err(StorageError::UnrecognizedStore(context_path));
            }
            let mut manifest = Manifest::load(&manifest_path)?;
            manifest.validate(&context_path)?;
            manifest.touch();
            manifest.save(&manifest_path)?;
            manifest
        } else {
            fs::create_dir_all(&context_path)?;
            let manifest = Manifest::new();
            manifest.save(&manifest_path)?;
            manifest
        };

        let db_path = context_path.join(&manifest.database_file);
        info!(path = %db_path.display(), "opening sqlite store");
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory database, schema included. For tests.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        debug!("opening in-memory sqlite store");
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        self.lock()?.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|e| StorageError::Internal(format!("connection lock poisoned: {e}")))
    }
}

#[async_trait]
impl OperationStore for SqliteStore {
    async fn put_operation(&self, op: &Operation) -> Result<(), StorageError> {
        let position = serde_json::to_string(&op.position)?;
        let parents = serde_json::to_string(&op.parents)?;
        let metadata = serde_json::to_string(&op.metadata)?;

        self.lock()?.execute(
            "INSERT OR REPLACE INTO operations
             (id, type, position_segments, content, length, author, timestamp, parents, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                op.id,
                op.kind.as_str(),
                position,
                op.content,
                op.length.map(|l| l as i64),
                op.author,
                op.timestamp.timestamp(),
                parents,
                metadata,
            ],
        )?;
        Ok(())
    }

    async fn operation(&self, id: &str) -> Result<Operation, StorageError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, type, position_segments, content, length, author, timestamp, parents, metadata
                 FROM operations WHERE id = ?1",
                params![id],
                operation_from_row,
            )
            .optional()?;
        match row {
            Some(op) => Ok(op?),
            None => Err(StorageError::OperationNotFound(id.to_string())),
        }
    }

    async fn operations(&self, ids: &[OpId]) -> Result<Vec<Operation>, StorageError> {
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            match self.operation(id).await {
                Ok(op) => found.push(op),
                Err(StorageError::OperationNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(found)
    }

    async fn operations_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Operation>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, type, position_segments, content, length, author, timestamp, parents, metadata
             FROM operations WHERE timestamp > ?1 ORDER BY timestamp",
        )?;
        let rows = stmt.query_map(params![since.timestamp()], operation_from_row)?;
        collect_operations(rows)
    }

    async fn operations_by_author(
        &self,
        author: &AuthorId,
    ) -> Result<Vec<Operation>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, type, position_segments, content, length, author, timestamp, parents, metadata
             FROM operations WHERE author = ?1 ORDER BY timestamp",
        )?;
        let rows = stmt.query_map(params![author], operation_from_row)?;
        collect_operations(rows)
    }

    async fn delete_operation(&self, id: &str) -> Result<(), StorageError> {
        self.lock()?
            .execute("DELETE FROM operations WHERE id = ?1", params![id])?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn put_document(&self, snapshot: &DocumentSnapshot) -> Result<(), StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = Utc::now().timestamp();

        tx.execute(
            "INSERT INTO documents (file_path, version, content_hash, last_operation, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(file_path) DO UPDATE SET
                 version = excluded.version,
                 content_hash = excluded.content_hash,
                 last_operation = excluded.last_operation,
                 updated_at = excluded.updated_at",
            params![
                snapshot.file_path,
                snapshot.version as i64,
                snapshot.content_hash,
                snapshot.last_operation,
                now,
            ],
        )?;

        // Constructs are rewritten wholesale; the snapshot is authoritative.
        tx.execute(
            "DELETE FROM constructs WHERE document_path = ?1",
            params![snapshot.file_path],
        )?;
        for construct in &snapshot.constructs {
            let position = serde_json::to_string(&construct.position)?;
            let metadata = serde_json::to_string(&construct.metadata)?;
            tx.execute(
                "INSERT INTO constructs
                 (id, document_path, position_segments, content, type, created_by, modified_by, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    construct.id,
                    snapshot.file_path,
                    position,
                    construct.content,
                    construct.kind.as_str(),
                    construct.created_by,
                    construct.modified_by,
                    metadata,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    async fn document(&self, file_path: &str) -> Result<DocumentSnapshot, StorageError> {
        let conn = self.lock()?;
        let header = conn
            .query_row(
                "SELECT version, content_hash, last_operation FROM documents WHERE file_path = ?1",
                params![file_path],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((version, content_hash, last_operation)) = header else {
            return Err(StorageError::DocumentNotFound(file_path.to_string()));
        };

        let mut stmt = conn.prepare(
            "SELECT id, position_segments, content, type, created_by, modified_by, metadata
             FROM constructs WHERE document_path = ?1",
        )?;
        let rows = stmt.query_map(params![file_path], construct_from_row)?;

        let mut constructs = Vec::new();
        for row in rows {
            constructs.push(row??);
        }
        constructs.sort_by(|a: &Construct, b: &Construct| a.position.cmp(&b.position));

        Ok(DocumentSnapshot {
            file_path: file_path.to_string(),
            constructs,
            content_hash,
            version: version as u64,
            last_operation,
        })
    }

    async fn list_documents(&self) -> Result<Vec<String>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT file_path FROM documents ORDER BY file_path")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut paths = Vec::new();
        for row in rows {
            paths.push(row?);
        }
        Ok(paths)
    }

    async fn delete_document(&self, file_path: &str) -> Result<(), StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM constructs WHERE document_path = ?1",
            params![file_path],
        )?;
        tx.execute(
            "DELETE FROM documents WHERE file_path = ?1",
            params![file_path],
        )?;
        tx.commit()?;
        Ok(())
    }
}

impl Store for SqliteStore {
    fn close(&self) -> Result<(), StorageError> {
        debug!("closing sqlite store");
        Ok(())
    }
}

type RowResult<T> = Result<Result<T, StorageError>, rusqlite::Error>;

// Deserialization happens outside rusqlite's error type, so row mappers
// return a nested result: the outer layer is the driver's, the inner ours.
fn operation_from_row(row: &rusqlite::Row<'_>) -> RowResult<Operation> {
    let id: String = row.get(0)?;
    let kind_raw: String = row.get(1)?;
    let position_raw: String = row.get(2)?;
    let content: String = row.get(3)?;
    let length: Option<i64> = row.get(4)?;
    let author: String = row.get(5)?;
    let timestamp: i64 = row.get(6)?;
    let parents_raw: Option<String> = row.get(7)?;
    let metadata_raw: Option<String> = row.get(8)?;

    Ok(decode_operation(
        id,
        kind_raw,
        position_raw,
        content,
        length,
        author,
        timestamp,
        parents_raw,
        metadata_raw,
    ))
}

#[allow(clippy::too_many_arguments)]
fn decode_operation(
    id: String,
    kind_raw: String,
    position_raw: String,
    content: String,
    length: Option<i64>,
    author: String,
    timestamp: i64,
    parents_raw: Option<String>,
    metadata_raw: Option<String>,
) -> Result<Operation, StorageError> {
    let kind = OpKind::parse(&kind_raw)
        .ok_or_else(|| StorageError::Internal(format!("unknown operation kind {kind_raw:?}")))?;
    let position: Position = serde_json::from_str(&position_raw)?;
    let parents: Vec<OpId> = match parents_raw {
        Some(raw) if !raw.is_empty() => serde_json::from_str(&raw)?,
        _ => Vec::new(),
    };
    let metadata: OperationMeta = match metadata_raw {
        Some(raw) if !raw.is_empty() => serde_json::from_str(&raw)?,
        _ => OperationMeta::default(),
    };
    let timestamp = Utc
        .timestamp_opt(timestamp, 0)
        .single()
        .ok_or_else(|| StorageError::Internal(format!("bad timestamp {timestamp}")))?;

    Ok(Operation {
        id,
        kind,
        position,
        content,
        content_type: crate::ops::CONTENT_TYPE_TEXT.to_string(),
        length: length.map(|l| l as usize),
        author,
        timestamp,
        parents,
        metadata,
    })
}

fn construct_from_row(row: &rusqlite::Row<'_>) -> RowResult<Construct> {
    let id: String = row.get(0)?;
    let position_raw: String = row.get(1)?;
    let content: String = row.get(2)?;
    let kind_raw: String = row.get(3)?;
    let created_by: String = row.get(4)?;
    let modified_by: String = row.get(5)?;
    let metadata_raw: Option<String> = row.get(6)?;

    Ok(decode_construct(
        id,
        position_raw,
        content,
        kind_raw,
        created_by,
        modified_by,
        metadata_raw,
    ))
}

fn decode_construct(
    id: String,
    position_raw: String,
    content: String,
    kind_raw: String,
    created_by: String,
    modified_by: String,
    metadata_raw: Option<String>,
) -> Result<Construct, StorageError> {
    use crate::document::{ConstructKind, ConstructMeta};

    let kind = ConstructKind::parse(&kind_raw)
        .ok_or_else(|| StorageError::Internal(format!("unknown construct kind {kind_raw:?}")))?;
    let position: Position = serde_json::from_str(&position_raw)?;
    let metadata: ConstructMeta = match metadata_raw {
        Some(raw) if !raw.is_empty() => serde_json::from_str(&raw)?,
        _ => ConstructMeta::default(),
    };

    Ok(Construct {
        id,
        content,
        kind,
        position,
        created_by,
        modified_by,
        metadata,
    })
}

fn collect_operations(
    rows: impl Iterator<Item = Result<Result<Operation, StorageError>, rusqlite::Error>>,
) -> Result<Vec<Operation>, StorageError> {
    let mut ops = Vec::new();
    for row in rows {
        ops.push(row??);
    }
    Ok(ops)
}

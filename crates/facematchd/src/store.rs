//! SQLite-backed record store.

use chrono::{DateTime, Utc};
use facematch_core::types::{
    EnrolledFace, Embedding, FaceId, MatchHistoryRecord, NewFace, NewMatchRecord, RemovedFace, StoreStats,
};
use facematch_core::{FaceMatchError, RecordStore, VectorCodec};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS faces (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    label        TEXT NOT NULL,
    description  TEXT,
    source_image TEXT NOT NULL,
    embedding    BLOB NOT NULL,
    model        TEXT,
    created_at   TEXT NOT NULL,
    updated_at   TEXT
);
CREATE INDEX IF NOT EXISTS idx_faces_label ON faces(label);

CREATE TABLE IF NOT EXISTS match_history (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    query_image     TEXT NOT NULL,
    matched_face_id INTEGER,
    distance        REAL NOT NULL,
    confidence      REAL NOT NULL,
    created_at      TEXT NOT NULL
);
";

const FACE_COLUMNS: &str = "id, label, description, source_image, embedding, model, created_at, updated_at";

/// Enrolled faces and match history in one SQLite database.
///
/// One connection guarded by a mutex; every read returns an owned snapshot.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    codec: VectorCodec,
}

impl SqliteStore {
    /// Open (or create) a database file. Enables WAL.
    pub fn open(path: &Path, dim: usize) -> Result<Self, FaceMatchError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| FaceMatchError::Store(format!("create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path).map_err(store_err)?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(store_err)?;
        tracing::info!(path = %path.display(), journal_mode = %mode, "opened face database");
        Self::init(conn, dim)
    }

    pub fn open_in_memory(dim: usize) -> Result<Self, FaceMatchError> {
        Self::init(Connection::open_in_memory().map_err(store_err)?, dim)
    }

    fn init(conn: Connection, dim: usize) -> Result<Self, FaceMatchError> {
        conn.execute_batch(SCHEMA).map_err(store_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            codec: VectorCodec::new(dim),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, FaceMatchError> {
        self.conn
            .lock()
            .map_err(|_| FaceMatchError::Store("database mutex poisoned".into()))
    }

    fn face_from_row(&self, row: &Row<'_>) -> rusqlite::Result<RawFace> {
        Ok(RawFace {
            id: row.get(0)?,
            label: row.get(1)?,
            description: row.get(2)?,
            source_image: row.get(3)?,
            embedding: row.get(4)?,
            model: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn query_faces(
        &self,
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<EnrolledFace>, FaceMatchError> {
        let mut stmt = conn.prepare(sql).map_err(store_err)?;
        let rows = stmt
            .query_map(params, |row| self.face_from_row(row))
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;
        rows.into_iter().map(|raw| raw.decode(&self.codec)).collect()
    }

    fn get_locked(&self, conn: &Connection, id: FaceId) -> Result<Option<EnrolledFace>, FaceMatchError> {
        let raw = conn
            .query_row(
                &format!("SELECT {FACE_COLUMNS} FROM faces WHERE id = ?1"),
                params![id],
                |row| self.face_from_row(row),
            )
            .optional()
            .map_err(store_err)?;
        raw.map(|r| r.decode(&self.codec)).transpose()
    }
}

/// A `faces` row before its embedding is decoded.
struct RawFace {
    id: FaceId,
    label: String,
    description: Option<String>,
    source_image: String,
    embedding: Vec<u8>,
    model: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

impl RawFace {
    fn decode(self, codec: &VectorCodec) -> Result<EnrolledFace, FaceMatchError> {
        let values = codec.decode(&self.embedding).map_err(|e| {
            tracing::error!(id = self.id, error = %e, "stored embedding is corrupt");
            FaceMatchError::Codec(e)
        })?;
        Ok(EnrolledFace {
            id: self.id,
            label: self.label,
            description: self.description,
            source_image: self.source_image,
            embedding: Embedding {
                values,
                model_version: self.model,
            },
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn store_err(e: rusqlite::Error) -> FaceMatchError {
    FaceMatchError::Store(e.to_string())
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

impl RecordStore for SqliteStore {
    fn append(&self, face: NewFace) -> Result<EnrolledFace, FaceMatchError> {
        if face.embedding.dim() != self.codec.dim() {
            return Err(FaceMatchError::DimensionMismatch {
                expected: self.codec.dim(),
                actual: face.embedding.dim(),
            });
        }
        let label = facematch_core::store::normalize_label(&face.label)?;
        let blob = self.codec.encode(&face.embedding.values)?;
        let created_at = Utc::now();

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO faces (label, description, source_image, embedding, model, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                label,
                face.description,
                face.source_image,
                blob,
                face.embedding.model_version,
                created_at
            ],
        )
        .map_err(store_err)?;

        Ok(EnrolledFace {
            id: conn.last_insert_rowid(),
            label,
            description: face.description,
            source_image: face.source_image,
            embedding: face.embedding,
            created_at,
            updated_at: None,
        })
    }

    fn all(&self) -> Result<Vec<EnrolledFace>, FaceMatchError> {
        let conn = self.lock()?;
        self.query_faces(&conn, &format!("SELECT {FACE_COLUMNS} FROM faces ORDER BY id"), [])
    }

    fn list(&self, offset: usize, limit: usize) -> Result<Vec<EnrolledFace>, FaceMatchError> {
        let conn = self.lock()?;
        self.query_faces(
            &conn,
            &format!("SELECT {FACE_COLUMNS} FROM faces ORDER BY id LIMIT ?1 OFFSET ?2"),
            params![to_i64(limit), to_i64(offset)],
        )
    }

    fn get(&self, id: FaceId) -> Result<Option<EnrolledFace>, FaceMatchError> {
        let conn = self.lock()?;
        self.get_locked(&conn, id)
    }

    fn update_metadata(
        &self,
        id: FaceId,
        label: &str,
        description: Option<&str>,
    ) -> Result<Option<EnrolledFace>, FaceMatchError> {
        let label = facematch_core::store::normalize_label(label)?;
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE faces SET label = ?1, description = ?2, updated_at = ?3 WHERE id = ?4",
                params![label, description, Utc::now(), id],
            )
            .map_err(store_err)?;
        if changed == 0 {
            return Ok(None);
        }
        self.get_locked(&conn, id)
    }

    // The embedding column is never read here, so rows with a corrupt blob stay deletable.
    fn delete(&self, id: FaceId) -> Result<Option<RemovedFace>, FaceMatchError> {
        let conn = self.lock()?;
        conn.query_row(
            "DELETE FROM faces WHERE id = ?1 RETURNING id, label, source_image",
            params![id],
            |row| {
                Ok(RemovedFace {
                    id: row.get(0)?,
                    label: row.get(1)?,
                    source_image: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(store_err)
    }

    fn append_match(&self, record: NewMatchRecord) -> Result<MatchHistoryRecord, FaceMatchError> {
        let created_at = Utc::now();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO match_history (query_image, matched_face_id, distance, confidence, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.query_image(),
                record.matched_face_id(),
                record.distance(),
                record.confidence(),
                created_at
            ],
        )
        .map_err(store_err)?;

        Ok(MatchHistoryRecord {
            id: conn.last_insert_rowid(),
            query_image: record.query_image().to_string(),
            matched_face_id: record.matched_face_id(),
            distance: record.distance(),
            confidence: record.confidence(),
            created_at,
        })
    }

    fn match_history(&self, offset: usize, limit: usize) -> Result<Vec<MatchHistoryRecord>, FaceMatchError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, query_image, matched_face_id, distance, confidence, created_at
                 FROM match_history ORDER BY id DESC LIMIT ?1 OFFSET ?2",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![to_i64(limit), to_i64(offset)], |row| {
                Ok(MatchHistoryRecord {
                    id: row.get(0)?,
                    query_image: row.get(1)?,
                    matched_face_id: row.get(2)?,
                    distance: row.get(3)?,
                    confidence: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;
        Ok(rows)
    }

    fn stats(&self) -> Result<StoreStats, FaceMatchError> {
        let conn = self.lock()?;
        let count = |table: &str| -> Result<usize, FaceMatchError> {
            let n: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .map_err(store_err)?;
            Ok(usize::try_from(n).unwrap_or(0))
        };
        Ok(StoreStats {
            total_faces: count("faces")?,
            total_searches: count("match_history")?,
        })
    }
}

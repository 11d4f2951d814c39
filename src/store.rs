//! Persistent "best run so far" records, keyed by model and dataset.
//!
//! The orchestrator treats a store as an optional cache: it looks up the
//! previous best for a key, compares log-likelihoods, and writes back only
//! when the new batch wins.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use fs2::FileExt;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{ModelKind, ModelParameters};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BestRunKey {
    pub model: ModelKind,
    pub parameter_count: usize,
    /// Content hash of the annotation matrix.
    pub fingerprint: String,
    pub key_hash: String,
}

impl BestRunKey {
    pub fn new(model: ModelKind, parameter_count: usize, fingerprint: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(KEY_DOMAIN);
        for field in [model.as_str().as_bytes(), fingerprint.as_bytes()] {
            hasher.update(&(field.len() as u64).to_le_bytes());
            hasher.update(field);
        }
        hasher.update(&(parameter_count as u64).to_le_bytes());
        Self {
            model,
            parameter_count,
            fingerprint: fingerprint.to_string(),
            key_hash: hasher.finalize().to_hex().to_string(),
        }
    }
}

/// Versioned prefix of every key digest; bump when the key layout changes.
const KEY_DOMAIN: &[u8] = b"curation-best-run/v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredBest {
    pub log_likelihood: f64,
    pub parameters: ModelParameters,
    /// Runs in the batch that produced this record.
    pub number_of_runs: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("serialization error: {0}")]
    Serde(String),
}

pub trait BestRunStore: Send + Sync {
    fn get(&self, key: &BestRunKey) -> Result<Option<StoredBest>, StoreError>;
    fn put(&self, key: &BestRunKey, value: &StoredBest) -> Result<(), StoreError>;
}

/// In-process store, for tests and embedding.
#[derive(Debug, Default, Clone)]
pub struct MemoryBestRunStore {
    entries: Arc<Mutex<HashMap<String, StoredBest>>>,
}

impl MemoryBestRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BestRunStore for MemoryBestRunStore {
    fn get(&self, key: &BestRunKey) -> Result<Option<StoredBest>, StoreError> {
        let guard = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(guard.get(&key.key_hash).cloned())
    }

    fn put(&self, key: &BestRunKey, value: &StoredBest) -> Result<(), StoreError> {
        let mut guard = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        guard.insert(key.key_hash.clone(), value.clone());
        Ok(())
    }
}

#[derive(Clone)]
pub struct SqliteBestRunStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBestRunStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             CREATE TABLE IF NOT EXISTS best_runs (\
               key_hash TEXT PRIMARY KEY,\
               model TEXT NOT NULL,\
               parameter_count INTEGER NOT NULL,\
               fingerprint TEXT NOT NULL,\
               log_likelihood REAL NOT NULL,\
               number_of_runs INTEGER NOT NULL,\
               parameters_json TEXT NOT NULL,\
               created_at INTEGER NOT NULL,\
               updated_at INTEGER NOT NULL,\
               hit_count INTEGER NOT NULL DEFAULT 0\
             );",
        )?;
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("CURATION_STORE_PATH") {
            return PathBuf::from(path);
        }
        PathBuf::from(".curation_best_runs.sqlite")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize whole fit-and-reconcile cycles across processes sharing
    /// this database. Blocks until `<db>.lock` is free; released on drop.
    pub fn lock_exclusive(&self) -> Result<StoreLock, StoreError> {
        let mut lock_path = self.path.clone().into_os_string();
        lock_path.push(".lock");
        let lock_path = PathBuf::from(lock_path);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        file.lock_exclusive()?;
        debug!(path = %lock_path.display(), "acquired best-run store lock");
        Ok(StoreLock {
            file,
            path: lock_path,
        })
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        let n: i64 = self
            .connection()?
            .query_row("SELECT COUNT(*) FROM best_runs", [], |row| row.get(0))?;
        Ok(n.max(0) as usize)
    }

    pub fn export_jsonl(&self, path: impl AsRef<Path>) -> Result<usize, StoreError> {
        use std::io::Write;

        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT key_hash, model, parameter_count, fingerprint, log_likelihood,\
                    number_of_runs, parameters_json, created_at, updated_at, hit_count \
             FROM best_runs ORDER BY updated_at DESC, key_hash",
        )?;
        let mut rows = stmt.query([])?;
        let mut file = std::io::BufWriter::new(std::fs::File::create(path.as_ref())?);
        let mut written = 0;
        while let Some(row) = rows.next()? {
            let parameters_json: String = row.get(6)?;
            let record = StoreExportRow {
                key_hash: row.get(0)?,
                model: row.get(1)?,
                parameter_count: row.get::<_, i64>(2)?.max(0) as usize,
                fingerprint: row.get(3)?,
                log_likelihood: row.get(4)?,
                number_of_runs: row.get::<_, i64>(5)?.max(0) as usize,
                parameters: decode_parameters(&parameters_json)?,
                created_at: row.get(7)?,
                updated_at: row.get(8)?,
                hit_count: row.get(9)?,
            };
            let line =
                serde_json::to_string(&record).map_err(|e| StoreError::Serde(e.to_string()))?;
            writeln!(file, "{line}")?;
            written += 1;
        }
        file.flush()?;
        Ok(written)
    }
}

impl BestRunStore for SqliteBestRunStore {
    /// Reading a record counts as a hit.
    fn get(&self, key: &BestRunKey) -> Result<Option<StoredBest>, StoreError> {
        let conn = self.connection()?;
        let found = conn.query_row(
            "UPDATE best_runs SET hit_count = hit_count + 1 WHERE key_hash = ?1 \
             RETURNING log_likelihood, number_of_runs, parameters_json",
            params![key.key_hash],
            |row| {
                Ok((
                    row.get::<_, f64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        );
        let (log_likelihood, number_of_runs, parameters_json) = match found {
            Ok(row) => row,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(StoredBest {
            log_likelihood,
            number_of_runs: number_of_runs.max(0) as usize,
            parameters: decode_parameters(&parameters_json)?,
        }))
    }

    /// Upsert; `created_at` and `hit_count` survive a replacement.
    fn put(&self, key: &BestRunKey, value: &StoredBest) -> Result<(), StoreError> {
        let parameters_json =
            serde_json::to_string(&value.parameters).map_err(|e| StoreError::Serde(e.to_string()))?;
        self.connection()?.execute(
            "INSERT INTO best_runs (\
                key_hash, model, parameter_count, fingerprint, log_likelihood,\
                number_of_runs, parameters_json, created_at, updated_at\
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, strftime('%s', 'now'), strftime('%s', 'now')) \
             ON CONFLICT(key_hash) DO UPDATE SET \
                log_likelihood = excluded.log_likelihood,\
                number_of_runs = excluded.number_of_runs,\
                parameters_json = excluded.parameters_json,\
                updated_at = excluded.updated_at",
            params![
                key.key_hash,
                key.model.as_str(),
                key.parameter_count as i64,
                key.fingerprint,
                value.log_likelihood,
                value.number_of_runs as i64,
                parameters_json,
            ],
        )?;
        Ok(())
    }
}

fn decode_parameters(json: &str) -> Result<ModelParameters, StoreError> {
    serde_json::from_str(json).map_err(|e| StoreError::Serde(e.to_string()))
}

/// Guard returned by [`SqliteBestRunStore::lock_exclusive`].
#[derive(Debug)]
pub struct StoreLock {
    file: std::fs::File,
    path: PathBuf,
}

impl StoreLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!(path = %self.path.display(), error = %e, "best-run store unlock failed");
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StoreExportRow {
    pub key_hash: String,
    pub model: String,
    pub parameter_count: usize,
    pub fingerprint: String,
    pub log_likelihood: f64,
    pub number_of_runs: usize,
    pub parameters: ModelParameters,
    pub created_at: i64,
    pub updated_at: i64,
    pub hit_count: i64,
}


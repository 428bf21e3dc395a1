mod executions;
mod graph;
pub mod types;

pub use executions::NewExecution;
pub use graph::{NewEntity, NewRelationship};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use rusqlite::{Connection, params};
use tokio::sync::Mutex;
use tracing::info;

use types::{CaseFileRecord, CaseRecord};

/// SQLite-backed persistence for cases, evidence files, the execution
/// ledger, and the knowledge graph. One `CaseStore` wraps one connection;
/// concurrent pipeline tasks each open their own via [`CaseStore::open_isolated`]
/// so a failing task cannot poison a sibling's connection state.
pub struct CaseStore {
    pub(crate) db: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl CaseStore {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db = Connection::open(&db_path)?;
        // WAL + busy timeout: required for the dispatcher's one-connection-per-task model.
        db.pragma_update(None, "journal_mode", "WAL")?;
        db.pragma_update(None, "busy_timeout", 5000)?;

        Self::init_schema(&db)?;
        info!("Case store ready at {:?}", db_path);

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path,
        })
    }

    /// A fresh connection to the same database file. Each dispatched task
    /// gets its own handle.
    pub async fn open_isolated(&self) -> Result<CaseStore> {
        let db = Connection::open(&self.db_path)?;
        db.pragma_update(None, "busy_timeout", 5000)?;
        Ok(CaseStore {
            db: Arc::new(Mutex::new(db)),
            db_path: self.db_path.clone(),
        })
    }

    fn init_schema(db: &Connection) -> Result<()> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS cases (
                case_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                finished_at DATETIME
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS case_files (
                file_id TEXT PRIMARY KEY,
                case_id TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS agent_executions (
                execution_id TEXT PRIMARY KEY,
                case_id TEXT NOT NULL,
                workflow_id TEXT NOT NULL,
                analyst_name TEXT NOT NULL,
                analyst_kind TEXT NOT NULL,
                model TEXT NOT NULL,
                status TEXT NOT NULL,
                parent_execution_id TEXT,
                input_json TEXT NOT NULL,
                output_json TEXT,
                error TEXT,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                started_at DATETIME,
                completed_at DATETIME,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS kg_entities (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_id TEXT NOT NULL UNIQUE,
                case_id TEXT NOT NULL,
                name TEXT NOT NULL,
                normalized_name TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                source_domain TEXT NOT NULL,
                confidence INTEGER NOT NULL,
                properties_json TEXT,
                merged_into TEXT,
                merge_count INTEGER NOT NULL DEFAULT 0,
                degree INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS kg_relationships (
                relationship_id TEXT PRIMARY KEY,
                case_id TEXT NOT NULL,
                source_id TEXT NOT NULL,
                target_id TEXT NOT NULL,
                rel_type TEXT NOT NULL,
                label TEXT NOT NULL,
                strength INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_executions_workflow ON agent_executions(workflow_id)",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_executions_case_status ON agent_executions(case_id, status)",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_entities_case_type ON kg_entities(case_id, entity_type, merged_into)",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_relationships_case ON kg_relationships(case_id)",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_case_files_case ON case_files(case_id)",
            [],
        )?;

        Ok(())
    }

    // ── cases ──

    pub async fn create_case(&self, status: &str) -> Result<CaseRecord> {
        let case_id = uuid::Uuid::new_v4().to_string();
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO cases (case_id, status) VALUES (?1, ?2)",
            params![case_id, status],
        )?;
        let rec = db.query_row(
            "SELECT case_id, status, created_at, updated_at, finished_at FROM cases WHERE case_id = ?1",
            params![case_id],
            Self::map_case,
        )?;
        Ok(rec)
    }

    pub async fn get_case(&self, case_id: &str) -> Result<Option<CaseRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT case_id, status, created_at, updated_at, finished_at FROM cases WHERE case_id = ?1 LIMIT 1",
        )?;
        let mut rows = stmt.query(params![case_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Self::map_case(row)?))
        } else {
            Ok(None)
        }
    }

    pub async fn update_case_status(&self, case_id: &str, status: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let terminal = matches!(status, "complete" | "error");
        let rows = if terminal {
            db.execute(
                "UPDATE cases SET status = ?1, updated_at = CURRENT_TIMESTAMP, finished_at = CURRENT_TIMESTAMP
                 WHERE case_id = ?2",
                params![status, case_id],
            )?
        } else {
            db.execute(
                "UPDATE cases SET status = ?1, updated_at = CURRENT_TIMESTAMP WHERE case_id = ?2",
                params![status, case_id],
            )?
        };
        Ok(rows > 0)
    }

    // ── evidence files ──

    pub async fn add_case_file(&self, case_id: &str, name: &str) -> Result<CaseFileRecord> {
        let file_id = uuid::Uuid::new_v4().to_string();
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO case_files (file_id, case_id, name, status) VALUES (?1, ?2, ?3, 'pending')",
            params![file_id, case_id, name],
        )?;
        Ok(CaseFileRecord {
            file_id,
            case_id: case_id.to_string(),
            name: name.to_string(),
            status: "pending".to_string(),
        })
    }

    pub async fn update_file_status(&self, file_id: &str, status: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE case_files SET status = ?1 WHERE file_id = ?2",
            params![status, file_id],
        )?;
        Ok(rows > 0)
    }

    /// Sweep every file not yet in a terminal status to failed. Used when the
    /// pipeline itself dies.
    pub async fn mark_unfinished_files_failed(&self, case_id: &str) -> Result<usize> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE case_files SET status = 'failed'
             WHERE case_id = ?1 AND status NOT IN ('analyzed', 'failed')",
            params![case_id],
        )?;
        Ok(rows)
    }

    pub async fn list_case_files(&self, case_id: &str) -> Result<Vec<CaseFileRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT file_id, case_id, name, status FROM case_files WHERE case_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![case_id], |row| {
            Ok(CaseFileRecord {
                file_id: row.get(0)?,
                case_id: row.get(1)?,
                name: row.get(2)?,
                status: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn map_case(row: &rusqlite::Row<'_>) -> rusqlite::Result<CaseRecord> {
        Ok(CaseRecord {
            case_id: row.get(0)?,
            status: row.get(1)?,
            created_at: row.get(2)?,
            updated_at: row.get(3)?,
            finished_at: row.get(4)?,
        })
    }
}

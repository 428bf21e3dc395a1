use anyhow::Result;
use rusqlite::params;

use super::CaseStore;
use super::types::ExecutionRecord;

const EXECUTION_COLUMNS: &str = "execution_id, case_id, workflow_id, analyst_name, analyst_kind, model, status, parent_execution_id, input_json, output_json, error, input_tokens, output_tokens, started_at, completed_at";

/// Fields for a new ledger row. Everything else starts at its pending default.
pub struct NewExecution<'a> {
    pub case_id: &'a str,
    pub workflow_id: &'a str,
    pub analyst_name: &'a str,
    pub analyst_kind: &'a str,
    pub model: &'a str,
    pub parent_execution_id: Option<&'a str>,
    pub input_json: &'a str,
}

impl CaseStore {
    /// Append a pending row to the execution ledger. Rows are never deleted.
    pub async fn create_execution(&self, new: NewExecution<'_>) -> Result<ExecutionRecord> {
        let execution_id = uuid::Uuid::new_v4().to_string();
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO agent_executions
             (execution_id, case_id, workflow_id, analyst_name, analyst_kind, model, status, parent_execution_id, input_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8)",
            params![
                execution_id,
                new.case_id,
                new.workflow_id,
                new.analyst_name,
                new.analyst_kind,
                new.model,
                new.parent_execution_id,
                new.input_json
            ],
        )?;
        let rec = db.query_row(
            &format!("SELECT {EXECUTION_COLUMNS} FROM agent_executions WHERE execution_id = ?1"),
            params![execution_id],
            Self::map_execution,
        )?;
        Ok(rec)
    }

    /// pending → running. Returns false if the row was not in a startable state.
    pub async fn mark_execution_running(&self, execution_id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE agent_executions
             SET status = 'running', started_at = CURRENT_TIMESTAMP
             WHERE execution_id = ?1 AND status = 'pending'",
            params![execution_id],
        )?;
        Ok(rows > 0)
    }

    /// running → retrying. Terminal rows are untouched.
    pub async fn mark_execution_retrying(&self, execution_id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE agent_executions SET status = 'retrying'
             WHERE execution_id = ?1 AND status = 'running'",
            params![execution_id],
        )?;
        Ok(rows > 0)
    }

    /// Finish the row as completed. The model column records the tier that
    /// actually produced the output (the fallback model when the primary
    /// tier was exhausted). Guarded so a terminal row cannot be rewritten.
    pub async fn complete_execution(
        &self,
        execution_id: &str,
        output_json: &str,
        model: &str,
        input_tokens: i64,
        output_tokens: i64,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE agent_executions
             SET status = 'completed', output_json = ?2, model = ?3,
                 input_tokens = ?4, output_tokens = ?5, completed_at = CURRENT_TIMESTAMP
             WHERE execution_id = ?1 AND status IN ('running', 'retrying')",
            params![execution_id, output_json, model, input_tokens, output_tokens],
        )?;
        Ok(rows > 0)
    }

    /// Finish the row as failed, keeping whatever tokens were burned.
    pub async fn fail_execution(
        &self,
        execution_id: &str,
        error: &str,
        input_tokens: i64,
        output_tokens: i64,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE agent_executions
             SET status = 'failed', error = ?2,
                 input_tokens = ?3, output_tokens = ?4, completed_at = CURRENT_TIMESTAMP
             WHERE execution_id = ?1 AND status IN ('pending', 'running', 'retrying')",
            params![execution_id, error, input_tokens, output_tokens],
        )?;
        Ok(rows > 0)
    }

    pub async fn get_execution(&self, execution_id: &str) -> Result<Option<ExecutionRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM agent_executions WHERE execution_id = ?1 LIMIT 1"
        ))?;
        let mut rows = stmt.query(params![execution_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Self::map_execution(row)?))
        } else {
            Ok(None)
        }
    }

    pub async fn list_executions_for_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<ExecutionRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM agent_executions WHERE workflow_id = ?1 ORDER BY created_at ASC, execution_id ASC"
        ))?;
        let rows = stmt.query_map(params![workflow_id], Self::map_execution)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn list_executions_for_case(&self, case_id: &str) -> Result<Vec<ExecutionRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM agent_executions WHERE case_id = ?1 ORDER BY created_at ASC, execution_id ASC"
        ))?;
        let rows = stmt.query_map(params![case_id], Self::map_execution)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn map_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionRecord> {
        Ok(ExecutionRecord {
            execution_id: row.get(0)?,
            case_id: row.get(1)?,
            workflow_id: row.get(2)?,
            analyst_name: row.get(3)?,
            analyst_kind: row.get(4)?,
            model: row.get(5)?,
            status: row.get(6)?,
            parent_execution_id: row.get(7)?,
            input_json: row.get(8)?,
            output_json: row.get(9)?,
            error: row.get(10)?,
            input_tokens: row.get(11)?,
            output_tokens: row.get(12)?,
            started_at: row.get(13)?,
            completed_at: row.get(14)?,
        })
    }
}

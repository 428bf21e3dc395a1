//! Row records returned by the case store. Statuses are stored as plain
//! strings; the pipeline layer owns the typed enums.

#[derive(Debug, Clone)]
pub struct CaseRecord {
    pub case_id: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
    pub finished_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CaseFileRecord {
    pub file_id: String,
    pub case_id: String,
    pub name: String,
    pub status: String,
}

/// One analyst invocation in the append-only execution ledger.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub case_id: String,
    pub workflow_id: String,
    pub analyst_name: String,
    pub analyst_kind: String,
    pub model: String,
    pub status: String,
    pub parent_execution_id: Option<String>,
    pub input_json: String,
    pub output_json: Option<String>,
    pub error: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

/// A knowledge-graph node. `seq` is the insertion rowid and defines
/// creation order for merge-primary selection.
#[derive(Debug, Clone)]
pub struct EntityRecord {
    pub seq: i64,
    pub entity_id: String,
    pub case_id: String,
    pub name: String,
    pub normalized_name: String,
    pub entity_type: String,
    pub source_domain: String,
    pub confidence: i64,
    pub properties_json: Option<String>,
    pub merged_into: Option<String>,
    pub merge_count: i64,
    pub degree: i64,
}

#[derive(Debug, Clone)]
pub struct RelationshipRecord {
    pub relationship_id: String,
    pub case_id: String,
    pub source_id: String,
    pub target_id: String,
    pub rel_type: String,
    pub label: String,
    pub strength: i64,
}

use serde::{Deserialize, Serialize};

/// Case lifecycle stage, always inferable from the execution ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Pending,
    Triage,
    Orchestrating,
    DomainAnalysis,
    Complete,
    Error,
}

impl PipelineStage {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStage::Pending => "pending",
            PipelineStage::Triage => "triage",
            PipelineStage::Orchestrating => "orchestrating",
            PipelineStage::DomainAnalysis => "domain_analysis",
            PipelineStage::Complete => "complete",
            PipelineStage::Error => "error",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(PipelineStage::Pending),
            "triage" => Some(PipelineStage::Triage),
            "orchestrating" => Some(PipelineStage::Orchestrating),
            "domain_analysis" => Some(PipelineStage::DomainAnalysis),
            "complete" => Some(PipelineStage::Complete),
            "error" => Some(PipelineStage::Error),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineStage::Complete | PipelineStage::Error)
    }
}

/// Specialized analyst roles. Triage, routing, and synthesis frame the run;
/// the rest are the domain analysts routed over evidence files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalystKind {
    Triage,
    Routing,
    Financial,
    Legal,
    Communications,
    Timeline,
    Synthesis,
}

impl AnalystKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AnalystKind::Triage => "triage",
            AnalystKind::Routing => "routing",
            AnalystKind::Financial => "financial",
            AnalystKind::Legal => "legal",
            AnalystKind::Communications => "communications",
            AnalystKind::Timeline => "timeline",
            AnalystKind::Synthesis => "synthesis",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        match value {
            "triage" => Some(AnalystKind::Triage),
            "routing" => Some(AnalystKind::Routing),
            "financial" => Some(AnalystKind::Financial),
            "legal" => Some(AnalystKind::Legal),
            "communications" => Some(AnalystKind::Communications),
            "timeline" => Some(AnalystKind::Timeline),
            "synthesis" => Some(AnalystKind::Synthesis),
            _ => None,
        }
    }

    pub fn is_domain(self) -> bool {
        !matches!(
            self,
            AnalystKind::Triage | AnalystKind::Routing | AnalystKind::Synthesis
        )
    }
}

/// Execution ledger status strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Retrying => "retrying",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "retrying" => Some(ExecutionStatus::Retrying),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

/// A set of files the routing analyst wants analyzed together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileGroup {
    pub file_ids: Vec<String>,
    pub analysts: Vec<AnalystKind>,
    #[serde(default)]
    pub shared_context: Option<String>,
}

/// Per-file assignment for files routed individually.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRouting {
    pub file_id: String,
    pub analysts: Vec<AnalystKind>,
}

/// Output of the routing analyst: which analyst kinds apply to which files,
/// and which files travel together.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingDecision {
    #[serde(default)]
    pub groups: Vec<FileGroup>,
    #[serde(default)]
    pub per_file: Vec<FileRouting>,
}

/// One planned unit of work: immutable, consumed exactly once by the
/// dispatcher. The group label is positional and stable across repeated
/// planning calls on identical input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentTask {
    pub analyst: AnalystKind,
    pub file_ids: Vec<String>,
    pub shared_context: Option<String>,
    pub group_label: String,
}

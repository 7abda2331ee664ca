use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::dag::DatasetId;
use crate::task::JobId;

/// Acción que fuerza la materialización de un dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Collect,
    Count,
    TopN(usize),
    SaveAs(String),
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Collect => f.write_str("collect"),
            Action::Count => f.write_str("count"),
            Action::TopN(n) => write!(f, "top_n({n})"),
            Action::SaveAs(path) => write!(f, "save_as({path})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Accepted,
    Running,
    Failed,
    Succeeded,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Failed | JobStatus::Succeeded | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,

    /// Dataset sobre el que se ejecutó la acción
    pub target: DatasetId,
    pub action: Action,

    /// -------- Métricas del job --------
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stages: u32,
    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub failed_tasks: u32,
    pub retries: u32,
    /// Tareas map que se regeneraron desde el linaje por bloques perdidos.
    pub recomputed_tasks: u32,
    /// Mensaje del error terminal, si lo hubo.
    pub error: Option<String>,
}

impl JobInfo {
    pub fn new(id: JobId, name: impl Into<String>, target: DatasetId, action: Action) -> Self {
        Self {
            id,
            name: name.into(),
            status: JobStatus::Accepted,
            target,
            action,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            stages: 0,
            total_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            retries: 0,
            recomputed_tasks: 0,
            error: None,
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        let start = self.started_at?;
        let end = self.finished_at?;
        Some((end - start).num_milliseconds())
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::record::Records;
use crate::task::{BlockId, StageId, TaskId};

/// Índice del worker dentro del pool.
pub type WorkerId = usize;

/// Lo que produjo una tarea exitosa.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    /// Bloques de shuffle guardados en el store del worker.
    ShuffleWritten { buckets: u32, records: u64 },
    Records(Records),
    Count(u64),
    Saved { records: u64 },
}

/// Motivo por el que falló un intento. El driver lo traduce a `EngineError`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    /// Panic o error dentro de una función de usuario.
    #[error("{0}")]
    Fault(String),

    #[error("{path}: {reason}")]
    Storage { path: String, reason: String },

    /// Un bloque de shuffle ya no está en el worker que lo produjo.
    #[error("no se encontró el bloque {block} en el worker {worker}")]
    FetchFailed { block: BlockId, worker: WorkerId },

    #[error("se esperaban {expected} bloques de shuffle y llegaron {found}")]
    ShuffleMismatch { expected: u32, found: u32 },

    #[error("tarea cancelada")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub stage_id: StageId,
    pub partition: u32,
    pub attempt: u32,
    pub worker: WorkerId,
    pub outcome: Result<TaskOutput, TaskError>,
    pub duration_ms: u64,
}

impl fmt::Display for TaskReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tarea {} (etapa {}, partición {}, intento {}) en worker {}",
            self.task_id, self.stage_id, self.partition, self.attempt, self.worker
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct WorkerMetrics {
    pub worker_id: WorkerId,
    pub active_tasks: u32,
    pub tasks_started: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub cached_blocks: usize,
    pub avg_task_ms: Option<f64>,
}

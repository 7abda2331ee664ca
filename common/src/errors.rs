use thiserror::Error;

use crate::task::StageId;

/// Taxonomía de errores visibles para quien lanza un job.
///
/// - `Schema`: construcción del grafo, nunca se reintenta.
/// - `StorageUnavailable`: frontera de I/O, se reintenta a nivel de tarea.
/// - `TaskFailure`: fallo dentro de una función de usuario, se recomputa por linaje.
/// - `ShuffleMismatch`: inconsistencia interna del scheduler, siempre fatal.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("SchemaError: {0}")]
    Schema(String),

    #[error("StorageUnavailable: {path}: {reason}")]
    StorageUnavailable { path: String, reason: String },

    #[error("TaskFailure: etapa {stage_id}, partición {partition_id} ({attempts} intentos): {cause}")]
    TaskFailure {
        stage_id: StageId,
        partition_id: u32,
        attempts: u32,
        cause: String,
    },

    #[error(
        "ShuffleMismatch: shuffle de la etapa {stage_id} esperaba {expected} buckets y la partición {map_partition} produjo {found}"
    )]
    ShuffleMismatch {
        stage_id: StageId,
        map_partition: u32,
        expected: u32,
        found: u32,
    },

    #[error("job cancelado")]
    Cancelled,
}

impl EngineError {
    pub fn schema(msg: impl Into<String>) -> Self {
        EngineError::Schema(msg.into())
    }

    pub fn storage(path: impl Into<String>, reason: impl ToString) -> Self {
        EngineError::StorageUnavailable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Nombre de la categoría, útil para métricas y para la CLI.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Schema(_) => "SchemaError",
            EngineError::StorageUnavailable { .. } => "StorageUnavailable",
            EngineError::TaskFailure { .. } => "TaskFailure",
            EngineError::ShuffleMismatch { .. } => "ShuffleMismatch",
            EngineError::Cancelled => "Cancelled",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

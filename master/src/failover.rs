use tracing::{info, warn};

use common::{BlockId, EngineError, StageId, TaskError, TaskOutput, TaskReport, WorkerId};

/// Qué hacer con el reporte de un intento.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Done(TaskOutput),
    /// Reintentar la misma tarea (nuevo intento regenerado desde el linaje).
    Retry,
    /// Falta un bloque de shuffle: recomputar a su productor y reintentar.
    Recompute {
        block: BlockId,
        worker: WorkerId,
    },
    Fatal(EngineError),
}

/// Política de reintentos: hasta `max_retries` intentos extra por tarea.
/// Los errores de shuffle y la cancelación nunca se reintentan.
pub fn decide(report: TaskReport, expected_buckets: Option<u32>, max_retries: u32) -> Decision {
    let TaskReport {
        stage_id,
        partition,
        attempt,
        outcome,
        ..
    } = report;
    let can_retry = attempt < max_retries;

    match outcome {
        Ok(TaskOutput::ShuffleWritten { buckets, .. })
            if expected_buckets.is_some_and(|expected| expected != buckets) =>
        {
            Decision::Fatal(EngineError::ShuffleMismatch {
                stage_id,
                map_partition: partition,
                expected: expected_buckets.unwrap_or_default(),
                found: buckets,
            })
        }
        Ok(output) => Decision::Done(output),

        Err(TaskError::Cancelled) => Decision::Fatal(EngineError::Cancelled),

        Err(TaskError::ShuffleMismatch { expected, found }) => {
            Decision::Fatal(EngineError::ShuffleMismatch {
                stage_id,
                map_partition: partition,
                expected,
                found,
            })
        }

        Err(TaskError::FetchFailed { block, worker }) if can_retry => {
            info!(
                "etapa {} partición {}: falta el bloque {} en worker {}, se recomputa",
                stage_id, partition, block, worker
            );
            Decision::Recompute { block, worker }
        }

        Err(TaskError::Storage { .. }) | Err(TaskError::Fault(_)) if can_retry => {
            warn!(
                "reencolando tarea de etapa {} partición {} (attempt={})",
                stage_id,
                partition,
                attempt + 1
            );
            Decision::Retry
        }

        Err(TaskError::Storage { path, reason }) => {
            warn!(
                "etapa {} partición {}: almacenamiento no disponible tras {} intentos",
                stage_id,
                partition,
                attempt + 1
            );
            Decision::Fatal(EngineError::StorageUnavailable { path, reason })
        }

        Err(err) => {
            warn!(
                "tarea de etapa {} partición {} superó el máximo de intentos ({}), job FAILED",
                stage_id,
                partition,
                max_retries + 1
            );
            Decision::Fatal(EngineError::TaskFailure {
                stage_id,
                partition_id: partition,
                attempts: attempt + 1,
                cause: err.to_string(),
            })
        }
    }
}

/// Reporte de un intento cuyo future murió antes de responder (panic o
/// abort del runtime). Cuenta como un fallo más de la tarea.
pub fn lost_attempt(
    stage_id: StageId,
    partition: u32,
    attempt: u32,
    worker: WorkerId,
    cause: String,
) -> TaskReport {
    TaskReport {
        task_id: format!("s{stage_id}-p{partition}-a{attempt}"),
        stage_id,
        partition,
        attempt,
        worker,
        outcome: Err(TaskError::Fault(cause)),
        duration_ms: 0,
    }
}

/// El bloque que pide un consumidor, como (etapa productora, partición map).
pub fn producer_of(block: &BlockId) -> Option<(StageId, u32)> {
    match block {
        BlockId::Shuffle {
            stage,
            map_partition,
            ..
        } => Some((*stage, *map_partition)),
        BlockId::Persisted { .. } => None,
    }
}

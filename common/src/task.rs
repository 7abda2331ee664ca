use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use uuid::Uuid;

use crate::dag::{CombineFn, DatasetId, Graph};
use crate::storage::{OutputHandle, PartitionDescriptor};
use crate::worker::WorkerId;

pub type JobId = Uuid;
pub type TaskId = String;
pub type StageId = u32;

/// Identidad de un bloque guardado en el store de un worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockId {
    /// Partición materializada de un dataset marcado con `persist`.
    Persisted {
        graph: Uuid,
        dataset: DatasetId,
        partition: u32,
    },
    /// Salida de una tarea map para un bucket de shuffle.
    Shuffle {
        job: JobId,
        stage: StageId,
        map_partition: u32,
        bucket: u32,
    },
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockId::Persisted {
                dataset, partition, ..
            } => write!(f, "rdd_{}_{}", dataset.raw(), partition),
            BlockId::Shuffle {
                stage,
                map_partition,
                bucket,
                ..
            } => write!(f, "shuffle_{stage}_{map_partition}_{bucket}"),
        }
    }
}

/// Dónde quedó un bloque de shuffle (qué worker lo tiene).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLocation {
    pub block: BlockId,
    pub worker: WorkerId,
}

/// De dónde lee una tarea su entrada.
#[derive(Debug, Clone)]
pub enum TaskInput {
    /// Rango de bytes de un archivo de entrada.
    Source {
        dataset: DatasetId,
        descriptor: PartitionDescriptor,
    },
    /// Un bucket de cada tarea map de la etapa anterior (todos contra todos).
    ShuffleRead {
        /// Dataset que introduce el shuffle (reduce_by_key o sort_by).
        dataset: DatasetId,
        /// Cantidad de tareas map que deben aportar un bloque.
        map_partitions: u32,
        blocks: Vec<BlockLocation>,
    },
}

impl TaskInput {
    pub fn dataset(&self) -> DatasetId {
        match self {
            TaskInput::Source { dataset, .. } | TaskInput::ShuffleRead { dataset, .. } => *dataset,
        }
    }
}

#[derive(Clone, Copy)]
pub enum ShuffleKind {
    /// Reparto por hash(clave) % buckets, con combinación local previa.
    Hash { buckets: u32, combine: CombineFn },
    /// Un único bucket: la partición p alimenta a la partición p.
    OneToOne,
}

impl ShuffleKind {
    pub fn buckets(&self) -> u32 {
        match self {
            ShuffleKind::Hash { buckets, .. } => *buckets,
            ShuffleKind::OneToOne => 1,
        }
    }
}

impl fmt::Debug for ShuffleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShuffleKind::Hash { buckets, .. } => write!(f, "Hash({buckets})"),
            ShuffleKind::OneToOne => f.write_str("OneToOne"),
        }
    }
}

/// Qué hace la tarea con su partición de salida.
#[derive(Debug, Clone)]
pub enum ResultKind {
    Collect,
    Count,
    TopN(usize),
    Save(OutputHandle),
}

#[derive(Debug, Clone)]
pub enum TaskSink {
    ShuffleWrite(ShuffleKind),
    Result(ResultKind),
}

/// Unidad de trabajo: una etapa aplicada a una partición.
/// El grafo y la cadena de datasets se comparten (sólo lectura).
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub job_id: JobId,
    pub stage_id: StageId,
    pub partition: u32,
    pub attempt: u32,
    pub graph: Arc<Graph>,
    pub input: TaskInput,
    /// Datasets de la etapa en orden: el de entrada primero, el de salida último.
    pub pipeline: Arc<[DatasetId]>,
    pub sink: TaskSink,
}

impl Task {
    pub fn new_id() -> TaskId {
        Uuid::new_v4().to_string()
    }

    /// Bloque donde esta tarea deja el bucket `bucket` de su salida.
    pub fn shuffle_block(&self, bucket: u32) -> BlockId {
        BlockId::Shuffle {
            job: self.job_id,
            stage: self.stage_id,
            map_partition: self.partition,
            bucket,
        }
    }

    pub fn persisted_block(&self, dataset: DatasetId) -> BlockId {
        BlockId::Persisted {
            graph: self.graph.id(),
            dataset,
            partition: self.partition,
        }
    }

    pub fn output_dataset(&self) -> DatasetId {
        self.pipeline
            .last()
            .copied()
            .unwrap_or_else(|| self.input.dataset())
    }
}

//! Planificador de etapas.
//!
//! Recorre el linaje desde el dataset pedido y corta una etapa nueva en cada
//! transformación con shuffle (`reduce_by_key`, `sort_by`). Cada etapa tiene
//! una tarea por partición de salida.

use std::{fmt::Write, sync::Arc};

use common::dag::{SortOrder, Transformation};
use common::{
    DatasetId, EngineError, Graph, PartitionDescriptor, Result, ShuffleKind, StageId,
    StorageReader,
};

#[derive(Debug, Clone)]
pub enum StageInput {
    /// Rangos de la fuente, uno por partición.
    Source {
        dataset: DatasetId,
        descriptors: Vec<PartitionDescriptor>,
    },
    /// Buckets escritos por la etapa `parent`.
    Shuffle {
        dataset: DatasetId,
        parent: StageId,
        kind: ShuffleKind,
        map_partitions: u32,
    },
}

#[derive(Debug, Clone, Copy)]
pub enum StageOutput {
    Shuffle(ShuffleKind),
    Result,
}

#[derive(Debug, Clone)]
pub struct Stage {
    pub id: StageId,
    pub input: StageInput,
    /// Datasets en orden de ejecución; el primero es el de entrada.
    pub pipeline: Arc<[DatasetId]>,
    pub partitions: u32,
    pub parents: Vec<StageId>,
    pub output: StageOutput,
    ops: Vec<String>,
}

impl Stage {
    pub fn is_result(&self) -> bool {
        matches!(self.output, StageOutput::Result)
    }

    pub fn output_dataset(&self) -> DatasetId {
        self.pipeline[self.pipeline.len() - 1]
    }

    /// Cantidad de buckets que debe reportar cada tarea map.
    pub fn expected_buckets(&self) -> Option<u32> {
        match self.output {
            StageOutput::Shuffle(kind) => Some(kind.buckets()),
            StageOutput::Result => None,
        }
    }
}

/// Etapas en orden topológico; la última produce el resultado.
#[derive(Debug, Clone)]
pub struct Plan {
    pub target: DatasetId,
    pub stages: Vec<Stage>,
    /// Orden de las particiones del resultado, si el dataset lo tiene.
    pub order: Option<SortOrder>,
}

impl Plan {
    /// Arma el plan. Las fuentes se abren acá, así que una ruta inválida
    /// falla antes de lanzar ninguna tarea.
    pub fn build<S>(graph: &Graph, target: DatasetId, storage: &S) -> Result<Self>
    where
        S: StorageReader + ?Sized,
    {
        let lineage = graph.lineage(target)?;

        // segmentos: cada shuffle abre uno nuevo
        let mut segments: Vec<Vec<DatasetId>> = Vec::new();
        for ds in lineage {
            let node = graph.node(ds)?;
            if segments.is_empty() || node.op.is_shuffle() {
                segments.push(Vec::new());
            }
            if let Some(current) = segments.last_mut() {
                current.push(ds);
            }
        }

        let mut stages: Vec<Stage> = Vec::with_capacity(segments.len());
        for (idx, segment) in segments.into_iter().enumerate() {
            let id = idx as StageId;
            let head = graph.node(segment[0])?;

            let (input, partitions, parents) = match &head.op {
                Transformation::Source {
                    path,
                    min_partitions,
                } => {
                    let descriptors = storage.open(path, *min_partitions)?;
                    let n = descriptors.len() as u32;
                    let input = StageInput::Source {
                        dataset: head.id,
                        descriptors,
                    };
                    (input, n, Vec::new())
                }
                op => {
                    let parent = stages.last_mut().ok_or_else(|| {
                        EngineError::schema(format!("{} sin etapa padre", op.name()))
                    })?;
                    let map_partitions = parent.partitions;
                    let (kind, partitions) = match op {
                        Transformation::ReduceByKey {
                            combine,
                            partitions,
                        } => {
                            let buckets = partitions.unwrap_or(map_partitions).max(1);
                            (
                                ShuffleKind::Hash {
                                    buckets,
                                    combine: *combine,
                                },
                                buckets,
                            )
                        }
                        Transformation::SortBy(_) => (ShuffleKind::OneToOne, map_partitions),
                        other => {
                            return Err(EngineError::schema(format!(
                                "{} no puede abrir una etapa",
                                other.name()
                            )))
                        }
                    };
                    parent.output = StageOutput::Shuffle(kind);
                    let input = StageInput::Shuffle {
                        dataset: head.id,
                        parent: parent.id,
                        kind,
                        map_partitions,
                    };
                    (input, partitions, vec![parent.id])
                }
            };

            let ops = segment
                .iter()
                .map(|ds| graph.node(*ds).map(|n| format!("{:?}", n.op)))
                .collect::<Result<Vec<_>>>()?;

            stages.push(Stage {
                id,
                input,
                pipeline: segment.into(),
                partitions,
                parents,
                output: StageOutput::Result,
                ops,
            });
        }

        Ok(Self {
            target,
            stages,
            order: graph.node(target)?.order,
        })
    }

    pub fn stage(&self, id: StageId) -> Result<&Stage> {
        self.stages
            .get(id as usize)
            .ok_or_else(|| EngineError::schema(format!("etapa desconocida: {id}")))
    }

    pub fn result_stage(&self) -> &Stage {
        // build siempre deja al menos la etapa de la fuente
        &self.stages[self.stages.len() - 1]
    }

    pub fn total_tasks(&self) -> u32 {
        self.stages.iter().map(|s| s.partitions).sum()
    }

    /// Descripción legible de las etapas, sus límites y la cadena de cada una.
    pub fn explain(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "== plan para {} ({} etapas, {} tareas) ==",
            self.target,
            self.stages.len(),
            self.total_tasks()
        );
        for stage in &self.stages {
            let from = match &stage.input {
                StageInput::Source { descriptors, .. } => {
                    let source = descriptors
                        .first()
                        .map(|d| d.source.as_str())
                        .unwrap_or("?");
                    format!("lee {source}")
                }
                StageInput::Shuffle { parent, kind, .. } => {
                    format!("shuffle {kind:?} desde etapa {parent}")
                }
            };
            let to = match stage.output {
                StageOutput::Shuffle(kind) => format!("escribe shuffle {kind:?}"),
                StageOutput::Result => "resultado".to_string(),
            };
            let _ = writeln!(
                out,
                "etapa {} [{} tareas] {}: {} -> {}",
                stage.id,
                stage.partitions,
                from,
                stage.ops.join(" -> "),
                to
            );
        }
        out
    }
}

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use serde_json::Value;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinError,
};
use tracing::{debug, info, warn};

use common::dag::{DatasetNode, Graph, Transformation};
use common::engine::{self, NarrowChain, NarrowOp, OpError};
use common::{
    CancelToken, DatasetId, EngineError, Records, ResultKind, ShuffleKind, Storage, Task,
    TaskError, TaskInput, TaskOutput, TaskReport, TaskSink, WorkerId, WorkerMetrics,
};

use crate::fault::FaultPlan;
use crate::store::BlockStore;

/// Lo que una tarea necesita del pool además de sí misma.
#[derive(Clone)]
pub(crate) struct ExecContext {
    pub storage: Arc<dyn Storage>,
    /// Stores de todos los workers, indexados por `WorkerId`.
    pub peers: Arc<[Arc<BlockStore>]>,
    pub faults: FaultPlan,
}

#[derive(Debug, Default)]
struct Counters {
    active: u32,
    started: u64,
    succeeded: u64,
    failed: u64,
    total_task_ms: u64,
}

/// Contexto de ejecución: una tarea en vuelo a la vez, más su store de bloques.
pub struct Worker {
    id: WorkerId,
    store: Arc<BlockStore>,
    slot: Arc<Semaphore>,
    counters: Mutex<Counters>,
}

impl Worker {
    pub fn new(id: WorkerId, cache_blocks: usize) -> Self {
        Self {
            id,
            store: Arc::new(BlockStore::new(cache_blocks)),
            slot: Arc::new(Semaphore::new(1)),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn metrics(&self) -> WorkerMetrics {
        let c = self.counters();
        let finished = c.succeeded + c.failed;
        WorkerMetrics {
            worker_id: self.id,
            active_tasks: c.active,
            tasks_started: c.started,
            tasks_succeeded: c.succeeded,
            tasks_failed: c.failed,
            cached_blocks: self.store.len(),
            avg_task_ms: (finished > 0).then(|| c.total_task_ms as f64 / finished as f64),
        }
    }

    /// Espera el slot libre, ejecuta la tarea en un hilo de bloqueo y arma el reporte.
    ///
    /// El slot y los contadores viajan con el hilo de bloqueo: si este future
    /// se descarta, el worker sigue ocupado hasta que la tarea termine de verdad.
    pub(crate) async fn run(self: Arc<Self>, task: Task, ctx: ExecContext, cancel: CancelToken) -> TaskReport {
        let started = Instant::now();
        let (task_id, stage_id, partition, attempt) =
            (task.id.clone(), task.stage_id, task.partition, task.attempt);

        let outcome = match self.slot.clone().acquire_owned().await {
            Err(_) => Err(TaskError::Fault(format!("worker {} cerrado", self.id))),
            Ok(_) if cancel.is_cancelled() => Err(TaskError::Cancelled),
            Ok(permit) => {
                debug!(
                    "worker {} ejecutando tarea {} (etapa {}, partición {}, intento {})",
                    self.id, task_id, stage_id, partition, attempt
                );

                let mut busy = Busy::start(self.clone(), permit);
                let handle = tokio::task::spawn_blocking(move || {
                    let outcome = execute(&task, &busy.worker.store, &ctx, &cancel);
                    busy.succeeded = outcome.is_ok();
                    outcome
                });

                match handle.await {
                    Ok(Ok(out)) => {
                        info!("terminé tarea {} correctamente", task_id);
                        Ok(out)
                    }
                    Ok(Err(e)) => {
                        warn!("error procesando tarea {}: {}", task_id, e);
                        Err(e)
                    }
                    Err(e) => {
                        warn!("panic o join error en tarea {}: {:?}", task_id, e);
                        Err(TaskError::Fault(panic_message(e)))
                    }
                }
            }
        };

        TaskReport {
            task_id,
            stage_id,
            partition,
            attempt,
            worker: self.id,
            outcome,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Ocupación del slot durante una ejecución. Al soltarse (fin normal o
/// panic) libera el permiso y cierra los contadores.
struct Busy {
    worker: Arc<Worker>,
    _permit: OwnedSemaphorePermit,
    started: Instant,
    succeeded: bool,
}

impl Busy {
    fn start(worker: Arc<Worker>, permit: OwnedSemaphorePermit) -> Self {
        {
            let mut c = worker.counters();
            c.active += 1;
            c.started += 1;
        }
        Self {
            worker,
            _permit: permit,
            started: Instant::now(),
            succeeded: false,
        }
    }
}

impl Drop for Busy {
    fn drop(&mut self) {
        let mut c = self.worker.counters();
        c.active = c.active.saturating_sub(1);
        if self.succeeded {
            c.succeeded += 1;
        } else {
            c.failed += 1;
        }
        c.total_task_ms += self.started.elapsed().as_millis() as u64;
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return format!("join error: {err}");
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic sin mensaje".to_string()
    }
}

/* =========================
   Ejecución de una tarea
   ========================= */

fn op_error(e: OpError) -> TaskError {
    match e {
        OpError::Interrupted => TaskError::Cancelled,
        OpError::NotAPair(_) => TaskError::Fault(e.to_string()),
    }
}

fn storage_error(e: EngineError) -> TaskError {
    match e {
        EngineError::StorageUnavailable { path, reason } => TaskError::Storage { path, reason },
        other => TaskError::Fault(other.to_string()),
    }
}

fn node(graph: &Graph, ds: DatasetId) -> Result<&DatasetNode, TaskError> {
    graph.node(ds).map_err(|e| TaskError::Fault(e.to_string()))
}

pub(crate) fn execute(
    task: &Task,
    store: &BlockStore,
    ctx: &ExecContext,
    cancel: &CancelToken,
) -> Result<TaskOutput, TaskError> {
    if ctx.faults.take_failure(task.stage_id, task.partition) {
        return Err(TaskError::Fault(format!(
            "fallo inyectado en etapa {}, partición {}",
            task.stage_id, task.partition
        )));
    }

    let records = materialize(task, store, ctx, cancel)?;
    write_sink(task, records, store, ctx, cancel)
}

/// Produce la partición de salida de la etapa, arrancando desde la
/// partición persistida más cercana que siga en caché.
fn materialize(
    task: &Task,
    store: &BlockStore,
    ctx: &ExecContext,
    cancel: &CancelToken,
) -> Result<Records, TaskError> {
    let graph = &task.graph;

    let mut cached = None;
    for (i, ds) in task.pipeline.iter().enumerate().rev() {
        if !node(graph, *ds)?.persisted {
            continue;
        }
        if let Some(data) = store.get(&task.persisted_block(*ds)) {
            debug!("partición {} de {} encontrada en caché", task.partition, ds);
            cached = Some((i + 1, data.as_ref().clone()));
            break;
        }
    }

    let (first, mut records) = match cached {
        Some(hit) => hit,
        None => {
            let records = read_input(task, ctx, cancel)?;
            let input = task.input.dataset();
            if node(graph, input)?.persisted {
                store.put(task.persisted_block(input), Arc::new(records.clone()));
            }
            (1, records)
        }
    };

    let mut segment = Vec::new();
    for ds in task.pipeline.iter().skip(first) {
        let n = node(graph, *ds)?;
        let op = NarrowOp::from_transformation(&n.op).ok_or_else(|| {
            TaskError::Fault(format!("{} no puede ir dentro de una etapa ({})", n.op.name(), ds))
        })?;
        segment.push(op);

        if n.persisted {
            records = run_chain(std::mem::take(&mut segment), records, cancel)?;
            store.put(task.persisted_block(*ds), Arc::new(records.clone()));
        }
    }
    if !segment.is_empty() {
        records = run_chain(segment, records, cancel)?;
    }
    Ok(records)
}

fn run_chain(ops: Vec<NarrowOp>, input: Records, cancel: &CancelToken) -> Result<Records, TaskError> {
    NarrowChain::new(ops)
        .run(input, &|| cancel.is_cancelled())
        .map_err(op_error)
}

fn read_input(task: &Task, ctx: &ExecContext, cancel: &CancelToken) -> Result<Records, TaskError> {
    match &task.input {
        TaskInput::Source { descriptor, .. } => {
            let lines = ctx.storage.read_partition(descriptor).map_err(storage_error)?;
            Ok(lines.into_iter().map(Value::String).collect())
        }
        TaskInput::ShuffleRead {
            dataset,
            map_partitions,
            blocks,
        } => {
            if blocks.len() as u32 != *map_partitions {
                return Err(TaskError::ShuffleMismatch {
                    expected: *map_partitions,
                    found: blocks.len() as u32,
                });
            }

            let mut fetched = Vec::with_capacity(blocks.len());
            for loc in blocks {
                let data = ctx
                    .peers
                    .get(loc.worker)
                    .and_then(|peer| peer.get(&loc.block))
                    .ok_or_else(|| TaskError::FetchFailed {
                        block: loc.block.clone(),
                        worker: loc.worker,
                    })?;
                fetched.push(data);
            }
            if cancel.is_cancelled() {
                return Err(TaskError::Cancelled);
            }

            match &node(&task.graph, *dataset)?.op {
                Transformation::ReduceByKey { combine, .. } => {
                    engine::merge_buckets(&fetched, *combine).map_err(op_error)
                }
                Transformation::SortBy(order) => {
                    let all: Records = fetched.iter().flat_map(|b| b.iter().cloned()).collect();
                    Ok(engine::sort_partition(all, order.key, order.descending))
                }
                other => Err(TaskError::Fault(format!(
                    "{} no lee de un shuffle ({})",
                    other.name(),
                    dataset
                ))),
            }
        }
    }
}

fn write_sink(
    task: &Task,
    records: Records,
    store: &BlockStore,
    ctx: &ExecContext,
    cancel: &CancelToken,
) -> Result<TaskOutput, TaskError> {
    match &task.sink {
        TaskSink::ShuffleWrite(kind) => {
            let buckets = match kind {
                ShuffleKind::Hash { buckets, combine } => {
                    engine::bucketize(records, *buckets, *combine).map_err(op_error)?
                }
                ShuffleKind::OneToOne => vec![records],
            };

            // un job abortado no deja bloques detrás
            if cancel.is_cancelled() {
                return Err(TaskError::Cancelled);
            }

            let n = buckets.len() as u32;
            let mut written = 0;
            for (bucket, data) in buckets.into_iter().enumerate() {
                written += data.len() as u64;
                store.put(task.shuffle_block(bucket as u32), Arc::new(data));
            }

            if ctx.faults.take_loss(task.stage_id, task.partition) {
                for bucket in 0..n {
                    store.remove(&task.shuffle_block(bucket));
                }
                warn!(
                    "salida de shuffle de etapa {} partición {} descartada (fallo inyectado)",
                    task.stage_id, task.partition
                );
            }

            Ok(TaskOutput::ShuffleWritten {
                buckets: n,
                records: written,
            })
        }
        TaskSink::Result(ResultKind::Collect) => Ok(TaskOutput::Records(records)),
        TaskSink::Result(ResultKind::Count) => Ok(TaskOutput::Count(records.len() as u64)),
        TaskSink::Result(ResultKind::TopN(n)) => {
            // la partición ya viene ordenada si el dataset lo está
            let mut records = records;
            records.truncate(*n);
            Ok(TaskOutput::Records(records))
        }
        TaskSink::Result(ResultKind::Save(handle)) => {
            let written = ctx
                .storage
                .write_partition(handle, task.partition, &records)
                .map_err(storage_error)?;
            Ok(TaskOutput::Saved { records: written })
        }
    }
}

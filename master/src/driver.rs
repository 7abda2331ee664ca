use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::task::{Id, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use common::{
    Action, ActionOutput, BlockId, BlockLocation, CancelToken, DatasetId, EngineConfig,
    EngineError, Graph, JobInfo, JobResult, JobStatus, Records, Result, ResultKind, ShuffleKind,
    StageId, Storage, StorageRegistry, Task, TaskInput, TaskOutput, TaskReport, TaskSink,
};
use worker::{FaultPlan, WorkerPool};

use crate::aggregate;
use crate::failover::{self, Decision};
use crate::scheduler::{Plan, Stage, StageInput, StageOutput};
use crate::state::JobContext;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Jobs terminados que se conservan para consulta.
pub const JOB_HISTORY: usize = 32;

/// Orquesta los jobs: planifica, despacha tareas al pool, reintenta,
/// recomputa por linaje y combina el resultado final.
pub struct Driver {
    pool: WorkerPool,
    storage: Arc<dyn Storage>,
    config: EngineConfig,
    /// Últimos jobs terminados (sólo métricas, acotado a `JOB_HISTORY`).
    jobs: Mutex<VecDeque<JobInfo>>,
}

impl Driver {
    pub fn new(config: EngineConfig) -> Self {
        let storage: Arc<dyn Storage> = Arc::new(StorageRegistry::from_config(&config));
        Self::with_storage(config, storage)
    }

    pub fn with_storage(config: EngineConfig, storage: Arc<dyn Storage>) -> Self {
        let pool = WorkerPool::from_config(&config, storage.clone());
        Self {
            pool,
            storage,
            config,
            jobs: Mutex::new(VecDeque::with_capacity(JOB_HISTORY)),
        }
    }

    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.pool = self.pool.with_faults(faults);
        self
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn history(&self) -> MutexGuard<'_, VecDeque<JobInfo>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, info: JobInfo) {
        let mut jobs = self.history();
        if jobs.len() == JOB_HISTORY {
            jobs.pop_front();
        }
        jobs.push_back(info);
    }

    /// Los últimos jobs terminados, del más viejo al más nuevo.
    pub fn jobs(&self) -> Vec<JobInfo> {
        self.history().iter().cloned().collect()
    }

    pub fn last_job(&self) -> Option<JobInfo> {
        self.history().back().cloned()
    }

    /// Plan de etapas para `target`, sin ejecutar nada.
    pub fn explain(&self, graph: &Graph, target: DatasetId) -> Result<String> {
        Ok(Plan::build(graph, target, self.storage.as_ref())?.explain())
    }

    /* =========================
       Acciones
       ========================= */

    pub async fn collect(&self, graph: &Arc<Graph>, target: DatasetId) -> Result<Records> {
        let res = self
            .run_job(graph, target, Action::Collect, &CancelToken::new())
            .await?;
        expect_records(res.output)
    }

    pub async fn count(&self, graph: &Arc<Graph>, target: DatasetId) -> Result<u64> {
        let res = self
            .run_job(graph, target, Action::Count, &CancelToken::new())
            .await?;
        match res.output {
            ActionOutput::Count(n) => Ok(n),
            other => Err(EngineError::schema(format!("count devolvió {other:?}"))),
        }
    }

    pub async fn top_n(&self, graph: &Arc<Graph>, target: DatasetId, n: usize) -> Result<Records> {
        let res = self
            .run_job(graph, target, Action::TopN(n), &CancelToken::new())
            .await?;
        expect_records(res.output)
    }

    pub async fn save_as(&self, graph: &Arc<Graph>, target: DatasetId, path: &str) -> Result<u64> {
        let res = self
            .run_job(graph, target, Action::SaveAs(path.to_string()), &CancelToken::new())
            .await?;
        match res.output {
            ActionOutput::Saved { records, .. } => Ok(records),
            other => Err(EngineError::schema(format!("save_as devolvió {other:?}"))),
        }
    }

    /// Ejecuta una acción completa. Todo o nada: ante un error no queda
    /// resultado parcial ni salida publicada.
    pub async fn run_job(
        &self,
        graph: &Arc<Graph>,
        target: DatasetId,
        action: Action,
        cancel: &CancelToken,
    ) -> Result<JobResult> {
        let info = JobInfo::new(Uuid::new_v4(), format!("{action} sobre {target}"), target, action.clone());
        info!("job {} aceptado: {}", info.id, info.name);

        let plan = match Plan::build(graph, target, self.storage.as_ref()) {
            Ok(plan) => plan,
            Err(e) => return Err(self.reject(info, e)),
        };
        debug!("job {}\n{}", info.id, plan.explain());

        let output = match &action {
            Action::SaveAs(path) => match self.storage.create_output(path) {
                Ok(handle) => Some(handle),
                Err(e) => return Err(self.reject(info, e)),
            },
            _ => None,
        };

        // token propio: un fallo del job frena sus tareas sin tocar al llamador
        let ctx = JobContext::new(graph.clone(), plan, cancel.child(), output, info);
        let outcome = match self.execute(&ctx).await {
            Ok(out) => self.commit(&ctx).map(|_| out),
            Err(e) => Err(e),
        };
        self.pool.release_job(ctx.id);

        match outcome {
            Ok(output) => {
                let info = ctx.finish(JobStatus::Succeeded, None);
                info!(
                    "job {} SUCCEEDED: {} tareas, {} reintentos, {} recomputadas",
                    info.id, info.completed_tasks, info.retries, info.recomputed_tasks
                );
                self.record(info.clone());
                Ok(JobResult { info, output })
            }
            Err(e) => {
                if let Some(handle) = &ctx.output {
                    if let Err(abort_err) = self.storage.abort(handle) {
                        warn!("no se pudo limpiar la salida {}: {}", handle.path, abort_err);
                    }
                }
                let status = if e == EngineError::Cancelled {
                    JobStatus::Cancelled
                } else {
                    JobStatus::Failed
                };
                let info = ctx.finish(status, Some(e.to_string()));
                warn!("job {} terminó en {:?}: {}", info.id, status, e);
                self.record(info);
                Err(e)
            }
        }
    }

    fn reject(&self, mut info: JobInfo, e: EngineError) -> EngineError {
        warn!("job {} rechazado: {}", info.id, e);
        info.status = JobStatus::Failed;
        info.finished_at = Some(chrono::Utc::now());
        info.error = Some(e.to_string());
        self.record(info);
        e
    }

    fn commit(&self, ctx: &JobContext) -> Result<()> {
        match &ctx.output {
            Some(handle) => self
                .storage
                .commit(handle, ctx.plan.result_stage().partitions),
            None => Ok(()),
        }
    }

    /// Etapas en orden, con barrera entre una y otra.
    async fn execute(&self, ctx: &JobContext) -> Result<ActionOutput> {
        let mut last = Vec::new();
        for stage in &ctx.plan.stages {
            if ctx.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            info!(
                "job {}: etapa {} con {} tareas",
                ctx.id, stage.id, stage.partitions
            );
            last = self
                .run_tasks(ctx, stage.id, (0..stage.partitions).collect())
                .await?;
        }
        aggregate::combine(&ctx.action, ctx.plan.order, last)
    }

    /* =========================
       Despacho de tareas
       ========================= */

    /// Corre las particiones pedidas de una etapa hasta que todas terminen.
    /// Se llama a sí misma para regenerar salidas de shuffle perdidas.
    ///
    /// Si la etapa termina en error cancela el job y espera a que cada tarea
    /// en vuelo suelte su worker, así nada escribe bloques después de
    /// `release_job`.
    fn run_tasks<'a>(
        &'a self,
        ctx: &'a JobContext,
        stage_id: StageId,
        partitions: Vec<u32>,
    ) -> BoxFuture<'a, Result<Vec<(u32, TaskOutput)>>> {
        Box::pin(async move {
            let mut running = JoinSet::new();
            let result = self
                .drive_stage(ctx, stage_id, partitions, &mut running)
                .await;
            if result.is_err() {
                ctx.cancel.cancel();
                while running.join_next().await.is_some() {}
            }
            result
        })
    }

    async fn drive_stage(
        &self,
        ctx: &JobContext,
        stage_id: StageId,
        partitions: Vec<u32>,
        running: &mut JoinSet<TaskReport>,
    ) -> Result<Vec<(u32, TaskOutput)>> {
        let stage = ctx.plan.stage(stage_id)?;
        let expected_buckets = stage.expected_buckets();
        let wanted = partitions.len();

        // id de la tarea tokio -> (partición, intento)
        let mut owners: HashMap<Id, (u32, u32)> = HashMap::new();
        let mut done: BTreeMap<u32, TaskOutput> = BTreeMap::new();

        for partition in partitions {
            let task = self.build_task(ctx, stage, partition, 0)?;
            let handle = running.spawn(self.pool.submit(task, ctx.cancel.clone()));
            owners.insert(handle.id(), (partition, 0));
        }

        while done.len() < wanted {
            let joined = tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(EngineError::Cancelled),
                joined = running.join_next_with_id() => joined,
            };

            let report = match joined {
                Some(Ok((id, report))) => {
                    owners.remove(&id);
                    report
                }
                Some(Err(e)) => {
                    let Some((partition, attempt)) = owners.remove(&e.id()) else {
                        return Err(EngineError::schema(format!(
                            "etapa {stage_id}: terminó una tarea desconocida: {e}"
                        )));
                    };
                    warn!(
                        "etapa {} partición {}: el intento {} murió sin reportar: {}",
                        stage_id, partition, attempt, e
                    );
                    failover::lost_attempt(
                        stage_id,
                        partition,
                        attempt,
                        self.pool.preferred_worker(partition),
                        e.to_string(),
                    )
                }
                None => {
                    return Err(EngineError::schema(format!(
                        "etapa {stage_id}: no quedan tareas y faltan {}",
                        wanted - done.len()
                    )));
                }
            };

            let (partition, attempt, worker) = (report.partition, report.attempt, report.worker);
            let next = match failover::decide(report, expected_buckets, self.config.max_retries) {
                Decision::Done(output) => {
                    ctx.mark_completed(stage_id, partition, worker, expected_buckets.is_some());
                    done.insert(partition, output);
                    continue;
                }
                Decision::Retry => {
                    ctx.note_retry();
                    attempt + 1
                }
                Decision::Recompute { block, .. } => {
                    ctx.note_retry();
                    self.recover_block(ctx, &block).await?;
                    attempt + 1
                }
                Decision::Fatal(e) => {
                    ctx.note_failure();
                    return Err(e);
                }
            };

            let task = self.build_task(ctx, stage, partition, next)?;
            let handle = running.spawn(self.pool.submit(task, ctx.cancel.clone()));
            owners.insert(handle.id(), (partition, next));
        }

        Ok(done.into_iter().collect())
    }

    /// Si el bloque sigue perdido, regenera la tarea map que lo produjo.
    async fn recover_block(&self, ctx: &JobContext, block: &BlockId) -> Result<()> {
        let Some((producer, map_partition)) = failover::producer_of(block) else {
            return Ok(());
        };

        let still_there = ctx
            .shuffle_location(producer, map_partition)
            .map(|worker| {
                self.pool.has_block(&BlockLocation {
                    block: block.clone(),
                    worker,
                })
            })
            .unwrap_or(false);
        if still_there {
            // otro consumidor ya lo recomputó
            return Ok(());
        }

        info!(
            "job {}: recomputando etapa {} partición {} desde el linaje",
            ctx.id, producer, map_partition
        );
        ctx.forget_output(producer, map_partition);
        self.run_tasks(ctx, producer, vec![map_partition]).await?;
        Ok(())
    }

    fn build_task(&self, ctx: &JobContext, stage: &Stage, partition: u32, attempt: u32) -> Result<Task> {
        let input = match &stage.input {
            StageInput::Source {
                dataset,
                descriptors,
            } => {
                let descriptor = descriptors
                    .get(partition as usize)
                    .cloned()
                    .ok_or_else(|| {
                        EngineError::schema(format!("partición {partition} fuera de rango"))
                    })?;
                TaskInput::Source {
                    dataset: *dataset,
                    descriptor,
                }
            }
            StageInput::Shuffle {
                dataset,
                parent,
                kind,
                map_partitions,
            } => {
                let (producers, bucket): (Vec<u32>, u32) = match kind {
                    ShuffleKind::Hash { .. } => ((0..*map_partitions).collect(), partition),
                    ShuffleKind::OneToOne => (vec![partition], 0),
                };
                let expected = producers.len() as u32;
                // sin ubicación no hay bloque: el worker lo reporta como mismatch
                let blocks = producers
                    .into_iter()
                    .filter_map(|map_partition| {
                        ctx.shuffle_location(*parent, map_partition)
                            .map(|worker| BlockLocation {
                                block: BlockId::Shuffle {
                                    job: ctx.id,
                                    stage: *parent,
                                    map_partition,
                                    bucket,
                                },
                                worker,
                            })
                    })
                    .collect();
                TaskInput::ShuffleRead {
                    dataset: *dataset,
                    map_partitions: expected,
                    blocks,
                }
            }
        };

        let sink = match stage.output {
            StageOutput::Shuffle(kind) => TaskSink::ShuffleWrite(kind),
            StageOutput::Result => TaskSink::Result(result_kind(ctx)?),
        };

        Ok(Task {
            id: Task::new_id(),
            job_id: ctx.id,
            stage_id: stage.id,
            partition,
            attempt,
            graph: ctx.graph.clone(),
            input,
            pipeline: stage.pipeline.clone(),
            sink,
        })
    }
}

fn result_kind(ctx: &JobContext) -> Result<ResultKind> {
    Ok(match &ctx.action {
        Action::Collect => ResultKind::Collect,
        Action::Count => ResultKind::Count,
        Action::TopN(n) => ResultKind::TopN(*n),
        Action::SaveAs(path) => {
            let handle = ctx
                .output
                .clone()
                .ok_or_else(|| EngineError::storage(path.as_str(), "salida no abierta"))?;
            ResultKind::Save(handle)
        }
    })
}

fn expect_records(output: ActionOutput) -> Result<Records> {
    match output {
        ActionOutput::Records(r) => Ok(r),
        other => Err(EngineError::schema(format!("se esperaban registros, llegó {other:?}"))),
    }
}

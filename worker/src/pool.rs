use std::{future::Future, sync::Arc};

use tracing::{debug, info};

use common::{
    BlockId, BlockLocation, CancelToken, EngineConfig, JobId, Storage, Task, TaskReport, WorkerId,
    WorkerMetrics,
};

use crate::fault::FaultPlan;
use crate::store::BlockStore;
use crate::worker::{ExecContext, Worker};

/// Pool fijo de workers. Cada worker corre una tarea a la vez.
pub struct WorkerPool {
    workers: Vec<Arc<Worker>>,
    stores: Arc<[Arc<BlockStore>]>,
    storage: Arc<dyn Storage>,
    faults: FaultPlan,
}

impl WorkerPool {
    pub fn new(size: usize, cache_blocks: usize, storage: Arc<dyn Storage>) -> Self {
        let workers: Vec<Arc<Worker>> = (0..size.max(1))
            .map(|id| Arc::new(Worker::new(id, cache_blocks)))
            .collect();
        let stores = workers.iter().map(|w| w.store().clone()).collect();

        info!(
            "pool iniciado con {} workers (caché de {} bloques c/u)",
            workers.len(),
            cache_blocks
        );

        Self {
            workers,
            stores,
            storage,
            faults: FaultPlan::new(),
        }
    }

    pub fn from_config(config: &EngineConfig, storage: Arc<dyn Storage>) -> Self {
        Self::new(config.workers, config.cache_blocks, storage)
    }

    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }

    pub fn faults(&self) -> &FaultPlan {
        &self.faults
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Localidad: la partición p va al worker p mod N, donde quedan sus
    /// particiones persistidas.
    pub fn preferred_worker(&self, partition: u32) -> WorkerId {
        partition as usize % self.workers.len()
    }

    /// Encola la tarea en su worker. El future no toma prestado el pool.
    pub fn submit(&self, task: Task, cancel: CancelToken) -> impl Future<Output = TaskReport> + Send + 'static {
        let worker = self.workers[self.preferred_worker(task.partition)].clone();
        let ctx = ExecContext {
            storage: self.storage.clone(),
            peers: self.stores.clone(),
            faults: self.faults.clone(),
        };
        debug!(
            "tarea {} (etapa {}, partición {}) asignada al worker {}",
            task.id,
            task.stage_id,
            task.partition,
            worker.id()
        );
        worker.run(task, ctx, cancel)
    }

    pub fn has_block(&self, loc: &BlockLocation) -> bool {
        self.stores
            .get(loc.worker)
            .map(|s| s.contains(&loc.block))
            .unwrap_or(false)
    }

    /// Descarta un bloque en todos los workers. Devuelve en cuántos estaba.
    pub fn evict(&self, block: &BlockId) -> usize {
        self.stores.iter().filter(|s| s.remove(block)).count()
    }

    /// Libera los bloques de shuffle de un job.
    pub fn release_job(&self, job: JobId) -> usize {
        let released: usize = self.stores.iter().map(|s| s.release_job(job)).sum();
        debug!("job {}: {} bloques de shuffle liberados", job, released);
        released
    }

    pub fn metrics(&self) -> Vec<WorkerMetrics> {
        self.workers.iter().map(|w| w.metrics()).collect()
    }
}

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::Utc;

use common::{
    Action, CancelToken, Graph, JobId, JobInfo, JobStatus, OutputHandle, StageId, WorkerId,
};

use crate::scheduler::Plan;

/// Tabla de avance del job: la única parte mutable compartida.
#[derive(Debug)]
struct CompletionTable {
    info: JobInfo,
    /// Worker que guarda la salida de shuffle de (etapa, partición).
    shuffle_outputs: HashMap<(StageId, u32), WorkerId>,
}

/// Contexto de ejecución de una acción. Se crea por job y se descarta al
/// terminar; nada sobrevive entre jobs salvo lo que el worker tenga en caché.
pub struct JobContext {
    pub id: JobId,
    pub graph: Arc<Graph>,
    pub plan: Plan,
    pub action: Action,
    pub cancel: CancelToken,
    /// Salida abierta si la acción es `save_as`.
    pub output: Option<OutputHandle>,
    table: Mutex<CompletionTable>,
}

impl JobContext {
    pub fn new(
        graph: Arc<Graph>,
        plan: Plan,
        cancel: CancelToken,
        output: Option<OutputHandle>,
        mut info: JobInfo,
    ) -> Self {
        info.status = JobStatus::Running;
        info.started_at = Some(Utc::now());
        info.stages = plan.stages.len() as u32;
        info.total_tasks = plan.total_tasks();

        Self {
            id: info.id,
            graph,
            plan,
            action: info.action.clone(),
            cancel,
            output,
            table: Mutex::new(CompletionTable {
                info,
                shuffle_outputs: HashMap::new(),
            }),
        }
    }

    fn table(&self) -> MutexGuard<'_, CompletionTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mark_completed(&self, stage: StageId, partition: u32, worker: WorkerId, produces_shuffle: bool) {
        let mut t = self.table();
        t.info.completed_tasks += 1;
        if produces_shuffle {
            t.shuffle_outputs.insert((stage, partition), worker);
        }
    }

    pub fn shuffle_location(&self, stage: StageId, partition: u32) -> Option<WorkerId> {
        self.table().shuffle_outputs.get(&(stage, partition)).copied()
    }

    /// Olvida una salida de shuffle perdida para que se vuelva a producir.
    pub fn forget_output(&self, stage: StageId, partition: u32) {
        let mut t = self.table();
        t.shuffle_outputs.remove(&(stage, partition));
        t.info.total_tasks += 1;
        t.info.recomputed_tasks += 1;
    }

    pub fn note_retry(&self) {
        let mut t = self.table();
        t.info.retries += 1;
        t.info.failed_tasks += 1;
    }

    pub fn note_failure(&self) {
        self.table().info.failed_tasks += 1;
    }

    pub fn info(&self) -> JobInfo {
        self.table().info.clone()
    }

    pub fn finish(&self, status: JobStatus, error: Option<String>) -> JobInfo {
        let mut t = self.table();
        t.info.status = status;
        t.info.finished_at = Some(Utc::now());
        t.info.error = error;
        t.shuffle_outputs.clear();
        t.info.clone()
    }
}

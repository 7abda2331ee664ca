use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use common::StageId;

#[derive(Debug, Default)]
struct FaultState {
    /// (etapa, partición) -> fallos que quedan por inyectar
    failures: HashMap<(StageId, u32), u32>,
    /// salidas de shuffle que se pierden una vez después de escribirse
    lost_outputs: HashSet<(StageId, u32)>,
}

/// Fallos inyectados desde afuera, sin tocar las funciones de usuario.
/// Se comparte entre todos los workers del pool.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    state: Arc<Mutex<FaultState>>,
}

impl FaultPlan {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FaultState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Las próximas `times` ejecuciones de (etapa, partición) fallan.
    pub fn fail_task(&self, stage: StageId, partition: u32, times: u32) {
        self.state().failures.insert((stage, partition), times);
    }

    /// La próxima salida de shuffle de (etapa, partición) se descarta
    /// apenas se escribe.
    pub fn lose_output_once(&self, stage: StageId, partition: u32) {
        self.state().lost_outputs.insert((stage, partition));
    }

    pub(crate) fn take_failure(&self, stage: StageId, partition: u32) -> bool {
        let mut state = self.state();
        match state.failures.get_mut(&(stage, partition)) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn take_loss(&self, stage: StageId, partition: u32) -> bool {
        self.state().lost_outputs.remove(&(stage, partition))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_task_se_consume_de_a_uno() {
        let plan = FaultPlan::new();
        plan.fail_task(1, 0, 2);
        assert!(plan.take_failure(1, 0));
        assert!(plan.take_failure(1, 0));
        assert!(!plan.take_failure(1, 0));
        assert!(!plan.take_failure(0, 0));

        plan.lose_output_once(0, 3);
        assert!(plan.take_loss(0, 3));
        assert!(!plan.take_loss(0, 3));
    }
}

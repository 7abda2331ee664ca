use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use quick_cache::sync::Cache;

use common::{BlockId, JobId, Records};

/// Store de bloques de un worker.
///
/// Las particiones persistidas viven en una caché acotada (pueden
/// desalojarse: se recomputan por linaje). Los bloques de shuffle se quedan
/// hasta que el driver libera el job.
pub struct BlockStore {
    cached: Cache<BlockId, Arc<Records>>,
    shuffle: Mutex<HashMap<BlockId, Arc<Records>>>,
}

impl BlockStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            cached: Cache::new(capacity.max(1)),
            shuffle: Mutex::new(HashMap::new()),
        }
    }

    fn shuffle(&self) -> MutexGuard<'_, HashMap<BlockId, Arc<Records>>> {
        self.shuffle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, block: &BlockId) -> Option<Arc<Records>> {
        match block {
            BlockId::Persisted { .. } => self.cached.get(block),
            BlockId::Shuffle { .. } => self.shuffle().get(block).cloned(),
        }
    }

    pub fn put(&self, block: BlockId, data: Arc<Records>) {
        match block {
            BlockId::Persisted { .. } => self.cached.insert(block, data),
            BlockId::Shuffle { .. } => {
                self.shuffle().insert(block, data);
            }
        }
    }

    pub fn contains(&self, block: &BlockId) -> bool {
        self.get(block).is_some()
    }

    /// Descarta un bloque. Devuelve si existía.
    pub fn remove(&self, block: &BlockId) -> bool {
        match block {
            BlockId::Persisted { .. } => self.cached.remove(block).is_some(),
            BlockId::Shuffle { .. } => self.shuffle().remove(block).is_some(),
        }
    }

    /// Borra los bloques de shuffle de un job terminado.
    pub fn release_job(&self, job: JobId) -> usize {
        let mut shuffle = self.shuffle();
        let before = shuffle.len();
        shuffle.retain(|id, _| !matches!(id, BlockId::Shuffle { job: j, .. } if *j == job));
        before - shuffle.len()
    }

    pub fn len(&self) -> usize {
        self.cached.len() + self.shuffle().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::DatasetId;
    use serde_json::json;
    use uuid::Uuid;

    fn shuffle_block(job: JobId, bucket: u32) -> BlockId {
        BlockId::Shuffle {
            job,
            stage: 0,
            map_partition: 0,
            bucket,
        }
    }

    #[test]
    fn guarda_y_libera_bloques_de_shuffle_por_job() {
        let store = BlockStore::new(8);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        store.put(shuffle_block(a, 0), Arc::new(vec![json!(1)]));
        store.put(shuffle_block(a, 1), Arc::new(vec![]));
        store.put(shuffle_block(b, 0), Arc::new(vec![json!(2)]));

        assert_eq!(store.get(&shuffle_block(a, 0)).unwrap().len(), 1);
        assert_eq!(store.release_job(a), 2);
        assert!(!store.contains(&shuffle_block(a, 0)));
        assert!(store.contains(&shuffle_block(b, 0)));
        assert!(store.remove(&shuffle_block(b, 0)));
        assert!(store.is_empty());
    }

    #[test]
    fn cache_de_persistidos_esta_acotada() {
        let store = BlockStore::new(4);
        let graph = Uuid::new_v4();
        let ds: DatasetId = serde_json::from_value(json!(3)).unwrap();
        for partition in 0..100 {
            let id = BlockId::Persisted {
                graph,
                dataset: ds,
                partition,
            };
            store.put(id, Arc::new(vec![json!(partition)]));
        }
        assert!(store.len() < 50);
    }
}

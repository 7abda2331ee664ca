use std::{cmp::Ordering, collections::HashMap, sync::Arc};
use thiserror::Error;

use crate::dag::{CombineFn, FilterFn, FlatMapFn, KeyFn, MapFn, Transformation};
use crate::record::{self, Record, Records};

/// Cada cuántos registros se consulta la señal de cancelación.
const INTERRUPT_CHECK_EVERY: usize = 4096;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OpError {
    #[error("se esperaba un par clave/valor y llegó {0}")]
    NotAPair(String),

    #[error("ejecución interrumpida")]
    Interrupted,
}

/* =========================
   Acumulador por clave
   ========================= */

/// Acumulador clave→valor con alcance de una sola tarea.
pub struct KeyedAggregator<F> {
    map: HashMap<String, (Record, Record)>,
    combine: F,
}

impl<F> KeyedAggregator<F>
where
    F: Fn(&Record, &Record) -> Record,
{
    pub fn new(combine: F) -> Self {
        Self {
            map: HashMap::new(),
            combine,
        }
    }

    pub fn add(&mut self, key: Record, value: Record) {
        let k = record::key_string(&key);
        match self.map.get_mut(&k) {
            Some((_, acc)) => {
                *acc = (self.combine)(acc, &value);
            }
            None => {
                self.map.insert(k, (key, value));
            }
        }
    }

    pub fn add_record(&mut self, rec: Record) -> Result<(), OpError> {
        let (key, value) =
            record::into_pair(rec).map_err(|other| OpError::NotAPair(other.to_string()))?;
        self.add(key, value);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// determinista: ordenar por clave
    pub fn finalize(self) -> Records {
        let mut entries: Vec<(String, (Record, Record))> = self.map.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
            .into_iter()
            .map(|(_, (k, v))| record::pair(k, v))
            .collect()
    }
}

/* =========================
   Cadena de operadores angostos (streaming)
   ========================= */

#[derive(Clone, Copy)]
pub enum NarrowOp {
    Map(MapFn),
    Filter(FilterFn),
    FlatMap(FlatMapFn),
}

impl NarrowOp {
    /// `None` para fuentes y límites de shuffle.
    pub fn from_transformation(op: &Transformation) -> Option<Self> {
        match op {
            Transformation::Map(f) => Some(NarrowOp::Map(*f)),
            Transformation::Filter(f) => Some(NarrowOp::Filter(*f)),
            Transformation::FlatMap(f) => Some(NarrowOp::FlatMap(*f)),
            _ => None,
        }
    }
}

/// Aplica map/filter/flat_map registro por registro, sin colecciones
/// intermedias. El orden dentro de la partición se conserva.
#[derive(Clone, Default)]
pub struct NarrowChain {
    ops: Vec<NarrowOp>,
}

impl NarrowChain {
    pub fn new(ops: Vec<NarrowOp>) -> Self {
        Self { ops }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn run(&self, input: Records, interrupted: &dyn Fn() -> bool) -> Result<Records, OpError> {
        if self.ops.is_empty() {
            return Ok(input);
        }
        let mut out = Vec::with_capacity(input.len());
        for (i, rec) in input.into_iter().enumerate() {
            if i % INTERRUPT_CHECK_EVERY == 0 && interrupted() {
                return Err(OpError::Interrupted);
            }
            self.push(rec, 0, &mut out);
        }
        Ok(out)
    }

    fn push(&self, rec: Record, from: usize, out: &mut Records) {
        let mut rec = rec;
        for (i, op) in self.ops.iter().enumerate().skip(from) {
            match op {
                NarrowOp::Map(f) => rec = f(&rec),
                NarrowOp::Filter(p) => {
                    if !p(&rec) {
                        return;
                    }
                }
                NarrowOp::FlatMap(f) => {
                    for child in f(&rec) {
                        self.push(child, i + 1, out);
                    }
                    return;
                }
            }
        }
        out.push(rec);
    }
}

/* =========================
   Shuffle en memoria
   ========================= */

/// Lado map del shuffle: combina localmente y reparte cada clave
/// en el bucket hash(clave) % buckets.
pub fn bucketize(input: Records, buckets: u32, combine: CombineFn) -> Result<Vec<Records>, OpError> {
    let buckets = buckets.max(1);
    let mut aggs: Vec<KeyedAggregator<CombineFn>> =
        (0..buckets).map(|_| KeyedAggregator::new(combine)).collect();

    for rec in input {
        let (key, value) =
            record::into_pair(rec).map_err(|other| OpError::NotAPair(other.to_string()))?;
        let pid = record::hash_key_to_partition(&record::key_string(&key), buckets) as usize;
        aggs[pid].add(key, value);
    }

    Ok(aggs.into_iter().map(KeyedAggregator::finalize).collect())
}

/// Lado reduce: junta el mismo bucket de todos los productores y vuelve a combinar.
pub fn merge_buckets(blocks: &[Arc<Records>], combine: CombineFn) -> Result<Records, OpError> {
    let mut agg = KeyedAggregator::new(combine);
    for block in blocks {
        for rec in block.iter() {
            agg.add_record(rec.clone())?;
        }
    }
    Ok(agg.finalize())
}

/* =========================
   Orden
   ========================= */

/// Compara por clave de orden; empata por el texto canónico del registro
/// (siempre ascendente) para que el resultado sea determinista.
pub fn order_by_key(ka: &Record, a: &Record, kb: &Record, b: &Record, descending: bool) -> Ordering {
    let by_key = record::compare_values(ka, kb);
    let by_key = if descending { by_key.reverse() } else { by_key };
    by_key.then_with(|| record::canonical(a).cmp(&record::canonical(b)))
}

pub fn sort_partition(input: Records, key: KeyFn, descending: bool) -> Records {
    let mut keyed: Vec<(Record, Record)> = input.into_iter().map(|r| (key(&r), r)).collect();
    keyed.sort_by(|(ka, a), (kb, b)| order_by_key(ka, a, kb, b, descending));
    keyed.into_iter().map(|(_, r)| r).collect()
}


#[cfg(test)]
mod props {
    use super::*;
    use crate::record::{pair, sum_values};
    use proptest::prelude::*;

    fn words() -> impl Strategy<Value = Vec<(String, u32)>> {
        prop::collection::vec(("[a-e]{1,2}", 1u32..5), 0..60)
    }

    proptest! {
        #[test]
        fn shuffle_en_buckets_equivale_a_reducir_todo_junto(
            input in words(),
            buckets in 1u32..8,
        ) {
            let records: Records = input.iter().map(|(k, v)| pair(k.as_str(), *v)).collect();
            let mut oracle = KeyedAggregator::new(sum_values);
            for rec in records.clone() {
                oracle.add_record(rec).unwrap();
            }
            let expected = oracle.finalize();

            let blocks = bucketize(records, buckets, sum_values).unwrap();
            prop_assert_eq!(blocks.len() as u32, buckets);

            let mut merged: Records = Vec::new();
            for block in blocks {
                merged.extend(merge_buckets(&[Arc::new(block)], sum_values).unwrap());
            }
            merged.sort_by_key(|r| r.to_string());
            let mut expected = expected;
            expected.sort_by_key(|r| r.to_string());
            prop_assert_eq!(merged, expected);
        }

        #[test]
        fn sort_partition_es_una_permutacion_ordenada(input in words(), descending in any::<bool>()) {
            let records: Records = input.iter().map(|(k, v)| pair(k.as_str(), *v)).collect();
            let out = sort_partition(records.clone(), |r| r[1].clone(), descending);
            prop_assert_eq!(out.len(), records.len());
            for w in out.windows(2) {
                let ord = order_by_key(&w[0][1], &w[0], &w[1][1], &w[1], descending);
                prop_assert_ne!(ord, Ordering::Greater);
            }
        }
    }
}

//! Combinación final de los resultados parciales de cada partición.

use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
};

use common::dag::SortOrder;
use common::engine::order_by_key;
use common::{Action, ActionOutput, EngineError, Record, Records, Result, TaskOutput};

/// Cabeza de una partición ordenada dentro del heap de mezcla.
struct Head {
    key: Record,
    rec: Record,
    part: usize,
    descending: bool,
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        order_by_key(&self.key, &self.rec, &other.key, &other.rec, self.descending)
            .then_with(|| self.part.cmp(&other.part))
    }
}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Head {}

/// Mezcla k particiones ya ordenadas. Con `limit` corta apenas junta n.
pub fn k_way_merge(parts: Vec<Records>, order: SortOrder, limit: Option<usize>) -> Records {
    let limit = limit.unwrap_or(usize::MAX);
    let total: usize = parts.iter().map(Vec::len).sum();
    let mut out = Vec::with_capacity(total.min(limit));

    let mut iters: Vec<std::vec::IntoIter<Record>> = parts.into_iter().map(Vec::into_iter).collect();
    // min-heap vía Reverse: la cabeza es el siguiente en orden
    let mut heap = BinaryHeap::with_capacity(iters.len());

    for (part, it) in iters.iter_mut().enumerate() {
        if let Some(rec) = it.next() {
            heap.push(Reverse(Head {
                key: (order.key)(&rec),
                rec,
                part,
                descending: order.descending,
            }));
        }
    }

    while out.len() < limit {
        let Some(Reverse(head)) = heap.pop() else {
            break;
        };
        let part = head.part;
        out.push(head.rec);
        if let Some(rec) = iters[part].next() {
            heap.push(Reverse(Head {
                key: (order.key)(&rec),
                rec,
                part,
                descending: order.descending,
            }));
        }
    }
    out
}

fn unexpected(output: &TaskOutput, action: &Action) -> EngineError {
    EngineError::schema(format!("salida {output:?} inesperada para {action}"))
}

fn records_of(parts: Vec<(u32, TaskOutput)>, action: &Action) -> Result<Vec<Records>> {
    parts
        .into_iter()
        .map(|(_, out)| match out {
            TaskOutput::Records(r) => Ok(r),
            other => Err(unexpected(&other, action)),
        })
        .collect()
}

/// Combina las salidas de la etapa final. `parts` viene ordenado por partición.
pub fn combine(action: &Action, order: Option<SortOrder>, parts: Vec<(u32, TaskOutput)>) -> Result<ActionOutput> {
    match action {
        Action::Count => {
            let mut total = 0u64;
            for (_, out) in parts {
                match out {
                    TaskOutput::Count(n) => total += n,
                    other => return Err(unexpected(&other, action)),
                }
            }
            Ok(ActionOutput::Count(total))
        }
        Action::Collect => {
            let parts = records_of(parts, action)?;
            let all = match order {
                Some(order) => k_way_merge(parts, order, None),
                // concatenación en orden de partición
                None => parts.into_iter().flatten().collect(),
            };
            Ok(ActionOutput::Records(all))
        }
        Action::TopN(n) => {
            let parts = records_of(parts, action)?;
            let top = match order {
                Some(order) => k_way_merge(parts, order, Some(*n)),
                None => parts.into_iter().flatten().take(*n).collect(),
            };
            Ok(ActionOutput::Records(top))
        }
        Action::SaveAs(path) => {
            let mut records = 0u64;
            for (_, out) in parts {
                match out {
                    TaskOutput::Saved { records: n } => records += n,
                    other => return Err(unexpected(&other, action)),
                }
            }
            Ok(ActionOutput::Saved {
                path: path.clone(),
                records,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::record::pair;
    use serde_json::json;

    fn count_of(r: &Record) -> Record {
        r[1].clone()
    }

    fn desc() -> SortOrder {
        SortOrder {
            key: count_of,
            descending: true,
        }
    }

    #[test]
    fn k_way_merge_respeta_el_orden_y_el_limite() {
        let parts = vec![
            vec![pair("/a", 9), pair("/c", 2)],
            vec![],
            vec![pair("/b", 5), pair("/d", 2), pair("/e", 1)],
        ];
        let all = k_way_merge(parts.clone(), desc(), None);
        assert_eq!(
            all,
            vec![pair("/a", 9), pair("/b", 5), pair("/c", 2), pair("/d", 2), pair("/e", 1)]
        );

        let top = k_way_merge(parts, desc(), Some(2));
        assert_eq!(top, vec![pair("/a", 9), pair("/b", 5)]);
    }

    #[test]
    fn combine_suma_conteos_y_concatena_en_orden_de_particion() {
        let counts = vec![(0, TaskOutput::Count(3)), (1, TaskOutput::Count(4))];
        assert_eq!(
            combine(&Action::Count, None, counts).unwrap(),
            ActionOutput::Count(7)
        );

        let parts = vec![
            (0, TaskOutput::Records(vec![json!("x"), json!("y")])),
            (1, TaskOutput::Records(vec![json!("z")])),
        ];
        assert_eq!(
            combine(&Action::Collect, None, parts.clone()).unwrap(),
            ActionOutput::Records(vec![json!("x"), json!("y"), json!("z")])
        );
        assert_eq!(
            combine(&Action::TopN(2), None, parts).unwrap(),
            ActionOutput::Records(vec![json!("x"), json!("y")])
        );
    }

    #[test]
    fn combine_detecta_salidas_inesperadas() {
        let parts = vec![(0, TaskOutput::Count(1))];
        let err = combine(&Action::Collect, None, parts).unwrap_err();
        assert_eq!(err.kind(), "SchemaError");

        let saved = vec![(0, TaskOutput::Saved { records: 2 }), (1, TaskOutput::Saved { records: 1 })];
        assert_eq!(
            combine(&Action::SaveAs("out".into()), None, saved).unwrap(),
            ActionOutput::Saved {
                path: "out".into(),
                records: 3
            }
        );
    }
}

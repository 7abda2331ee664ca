use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::errors::{EngineError, Result};
use crate::record::Record;

/* --------- Funciones de usuario ---------
   Sólo se aceptan punteros a función: no pueden capturar entorno
   (archivos, sockets, contadores), así que re-ejecutarlas es seguro. */

pub type MapFn = fn(&Record) -> Record;
pub type FilterFn = fn(&Record) -> bool;
pub type FlatMapFn = fn(&Record) -> Vec<Record>;
pub type CombineFn = fn(&Record, &Record) -> Record;
pub type KeyFn = fn(&Record) -> Record;

/// Índice estable de un dataset dentro de su grafo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasetId(u32);

impl DatasetId {
    pub fn raw(self) -> u32 {
        self.0
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ds{}", self.0)
    }
}

/// Forma lógica de los registros de un dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Shape {
    /// Líneas crudas leídas del almacenamiento.
    Line,
    /// Cualquier valor (tokens, registros derivados).
    Value,
    /// Pares `[clave, valor]`.
    Pair,
}

#[derive(Clone, Copy)]
pub struct SortOrder {
    pub key: KeyFn,
    pub descending: bool,
}

impl fmt::Debug for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SortOrder")
            .field("descending", &self.descending)
            .finish()
    }
}

#[derive(Clone)]
pub enum Transformation {
    Source { path: String, min_partitions: u32 },
    Map(MapFn),
    Filter(FilterFn),
    FlatMap(FlatMapFn),
    ReduceByKey {
        combine: CombineFn,
        /// Particiones de salida; `None` hereda las del padre.
        partitions: Option<u32>,
    },
    SortBy(SortOrder),
}

impl Transformation {
    pub fn name(&self) -> &'static str {
        match self {
            Transformation::Source { .. } => "source",
            Transformation::Map(_) => "map",
            Transformation::Filter(_) => "filter",
            Transformation::FlatMap(_) => "flat_map",
            Transformation::ReduceByKey { .. } => "reduce_by_key",
            Transformation::SortBy(_) => "sort_by",
        }
    }

    /// ¿Introduce un límite de etapa?
    pub fn is_shuffle(&self) -> bool {
        matches!(
            self,
            Transformation::ReduceByKey { .. } | Transformation::SortBy(_)
        )
    }
}

impl fmt::Debug for Transformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transformation::Source {
                path,
                min_partitions,
            } => write!(f, "source({path}, min_partitions={min_partitions})"),
            Transformation::ReduceByKey { partitions, .. } => {
                write!(f, "reduce_by_key(partitions={partitions:?})")
            }
            Transformation::SortBy(order) => write!(f, "sort_by(descending={})", order.descending),
            other => f.write_str(other.name()),
        }
    }
}

/// Nodo inmutable del DAG de linaje.
#[derive(Debug, Clone)]
pub struct DatasetNode {
    pub id: DatasetId,
    /// Vacío para las fuentes.
    pub parents: Vec<DatasetId>,
    pub op: Transformation,
    pub shape: Shape,
    /// Mantener las particiones materializadas en la caché del worker.
    pub persisted: bool,
    /// Orden garantizado dentro de cada partición (lo fija `sort_by`).
    pub order: Option<SortOrder>,
}

impl DatasetNode {
    pub fn parent(&self) -> Option<DatasetId> {
        self.parents.first().copied()
    }
}

/// Arena de datasets. Cada transformación agrega un nodo nuevo y devuelve
/// su índice; nada se ejecuta al construir.
pub struct Graph {
    id: Uuid,
    nodes: Vec<DatasetNode>,
}

/// Un clon puede divergir del original en los mismos `DatasetId`, así que
/// recibe identidad propia y no comparte bloques persistidos.
impl Clone for Graph {
    fn clone(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            nodes: self.nodes.clone(),
        }
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("id", &self.id)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

impl Graph {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            nodes: Vec::new(),
        }
    }

    /// Identidad del grafo (separa las entradas de caché entre grafos).
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: DatasetId) -> Result<&DatasetNode> {
        self.nodes
            .get(id.index())
            .ok_or_else(|| EngineError::schema(format!("dataset desconocido: {id}")))
    }

    fn push(
        &mut self,
        parent: Option<DatasetId>,
        op: Transformation,
        shape: Shape,
        order: Option<SortOrder>,
    ) -> DatasetId {
        let id = DatasetId(self.nodes.len() as u32);
        self.nodes.push(DatasetNode {
            id,
            parents: parent.into_iter().collect(),
            op,
            shape,
            persisted: false,
            order,
        });
        id
    }

    /// Fuente de líneas crudas. `path` se resuelve recién al ejecutar una acción.
    pub fn source(&mut self, path: impl Into<String>, min_partitions: u32) -> DatasetId {
        let op = Transformation::Source {
            path: path.into(),
            min_partitions: min_partitions.max(1),
        };
        self.push(None, op, Shape::Line, None)
    }

    pub fn map(&mut self, ds: DatasetId, f: MapFn) -> Result<DatasetId> {
        self.node(ds)?;
        Ok(self.push(Some(ds), Transformation::Map(f), Shape::Value, None))
    }

    /// Igual que `map`, pero declara que la salida son pares clave/valor.
    pub fn map_to_pair(&mut self, ds: DatasetId, f: MapFn) -> Result<DatasetId> {
        self.node(ds)?;
        Ok(self.push(Some(ds), Transformation::Map(f), Shape::Pair, None))
    }

    pub fn filter(&mut self, ds: DatasetId, f: FilterFn) -> Result<DatasetId> {
        let parent = self.node(ds)?;
        let (shape, order) = (parent.shape, parent.order);
        Ok(self.push(Some(ds), Transformation::Filter(f), shape, order))
    }

    pub fn flat_map(&mut self, ds: DatasetId, f: FlatMapFn) -> Result<DatasetId> {
        self.node(ds)?;
        Ok(self.push(Some(ds), Transformation::FlatMap(f), Shape::Value, None))
    }

    pub fn flat_map_to_pair(&mut self, ds: DatasetId, f: FlatMapFn) -> Result<DatasetId> {
        self.node(ds)?;
        Ok(self.push(Some(ds), Transformation::FlatMap(f), Shape::Pair, None))
    }

    /// Límite de shuffle: reparte por hash(clave) mod `partitions` y combina.
    pub fn reduce_by_key(
        &mut self,
        ds: DatasetId,
        combine: CombineFn,
        partitions: Option<u32>,
    ) -> Result<DatasetId> {
        let parent = self.node(ds)?;
        if parent.shape != Shape::Pair {
            return Err(EngineError::schema(format!(
                "reduce_by_key requiere pares clave/valor, {ds} produce {:?}",
                parent.shape
            )));
        }
        if partitions == Some(0) {
            return Err(EngineError::schema("reduce_by_key con 0 particiones"));
        }
        let op = Transformation::ReduceByKey {
            combine,
            partitions,
        };
        Ok(self.push(Some(ds), op, Shape::Pair, None))
    }

    /// Orden local por partición; la mezcla global la hace el driver.
    pub fn sort_by(&mut self, ds: DatasetId, key: KeyFn, descending: bool) -> Result<DatasetId> {
        let shape = self.node(ds)?.shape;
        let order = SortOrder { key, descending };
        Ok(self.push(Some(ds), Transformation::SortBy(order), shape, Some(order)))
    }

    /// Marca el dataset para cachear sus particiones en los workers.
    pub fn persist(&mut self, ds: DatasetId) -> Result<DatasetId> {
        self.node(ds)?;
        self.nodes[ds.index()].persisted = true;
        Ok(ds)
    }

    /// Cadena de linaje desde la fuente hasta `ds` (inclusive).
    pub fn lineage(&self, ds: DatasetId) -> Result<Vec<DatasetId>> {
        let mut chain = Vec::new();
        let mut cur = Some(ds);
        while let Some(id) = cur {
            chain.push(id);
            cur = self.node(id)?.parent();
        }
        chain.reverse();
        Ok(chain)
    }
}

//! Frontera con el almacenamiento externo.
//!
//! El lector entrega descriptores de partición (rangos de bytes alineados a
//! líneas) y las líneas de cada uno. El escritor usa un protocolo de commit:
//! las particiones se escriben en `_temporary/` y sólo se publican cuando el
//! job entero terminó bien.

mod local;
pub mod path;

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf};

use crate::config::EngineConfig;
use crate::errors::Result;
use crate::record::Record;

pub use local::part_file_name;
pub use path::StoragePath;

/// Rango de bytes de un archivo, legible por sí solo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionDescriptor {
    pub index: u32,
    pub file: PathBuf,
    pub start: u64,
    pub end: u64,
    /// Dirección tal como la escribió el usuario.
    pub source: String,
}

/// Salida abierta de un `save_as`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputHandle {
    pub path: String,
    pub final_dir: PathBuf,
    pub temp_dir: PathBuf,
    /// El directorio final lo creó este job (abort lo borra entero).
    pub created_root: bool,
}

pub trait StorageReader: Send + Sync {
    fn open(&self, path: &str, min_partitions: u32) -> Result<Vec<PartitionDescriptor>>;

    fn read_partition(&self, descriptor: &PartitionDescriptor) -> Result<Vec<String>>;
}

pub trait StorageWriter: Send + Sync {
    fn create_output(&self, path: &str) -> Result<OutputHandle>;

    /// Idempotente: reescribir una partición reemplaza la anterior.
    fn write_partition(&self, handle: &OutputHandle, partition: u32, records: &[Record]) -> Result<u64>;

    fn commit(&self, handle: &OutputHandle, partitions: u32) -> Result<()>;

    fn abort(&self, handle: &OutputHandle) -> Result<()>;
}

pub trait Storage: StorageReader + StorageWriter {}

impl<T: StorageReader + StorageWriter> Storage for T {}

/// Filesystem local más namespaces montados (`host:port` → directorio).
#[derive(Debug, Clone, Default)]
pub struct StorageRegistry {
    namespaces: HashMap<String, PathBuf>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        let mut reg = Self::new();
        for (authority, root) in &config.namespaces {
            reg = reg.with_namespace(authority, root.clone());
        }
        reg
    }

    pub fn with_namespace(mut self, authority: &str, root: impl Into<PathBuf>) -> Self {
        self.namespaces.insert(authority.to_string(), root.into());
        self
    }

    pub fn resolve(&self, raw: &str) -> Result<PathBuf> {
        StoragePath::parse(raw)?.resolve(raw, &self.namespaces)
    }
}

impl StorageReader for StorageRegistry {
    fn open(&self, path: &str, min_partitions: u32) -> Result<Vec<PartitionDescriptor>> {
        let resolved = self.resolve(path)?;
        let files = local::expand_inputs(path, &resolved)?;
        local::split_files(path, &files, min_partitions)
    }

    fn read_partition(&self, descriptor: &PartitionDescriptor) -> Result<Vec<String>> {
        local::read_range(descriptor)
    }
}

impl StorageWriter for StorageRegistry {
    fn create_output(&self, path: &str) -> Result<OutputHandle> {
        let resolved = self.resolve(path)?;
        local::create_output(path, resolved)
    }

    fn write_partition(&self, handle: &OutputHandle, partition: u32, records: &[Record]) -> Result<u64> {
        local::write_partition(handle, partition, records)
    }

    fn commit(&self, handle: &OutputHandle, partitions: u32) -> Result<()> {
        local::commit(handle, partitions)
    }

    fn abort(&self, handle: &OutputHandle) -> Result<()> {
        local::abort(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn registry_lee_a_traves_de_un_namespace() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("user")).unwrap();
        fs::write(tmp.path().join("user/in.txt"), "a b a\nb c\n").unwrap();

        let reg = StorageRegistry::new().with_namespace("namenode:9000", tmp.path());
        let descs = reg.open("hdfs://namenode:9000/user/in.txt", 2).unwrap();
        let lines: Vec<String> = descs
            .iter()
            .flat_map(|d| reg.read_partition(d).unwrap())
            .collect();
        assert_eq!(lines, vec!["a b a", "b c"]);

        let err = reg.open("hdfs://namenode:9000/user/nada.txt", 2).unwrap_err();
        assert_eq!(err.kind(), "StorageUnavailable");
        let err = reg.open("hdfs://otro:9000/user/in.txt", 2).unwrap_err();
        assert_eq!(err.kind(), "StorageUnavailable");
    }
}

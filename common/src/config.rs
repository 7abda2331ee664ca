use std::{env, path::PathBuf, str::FromStr};

use crate::errors::{EngineError, Result};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_CACHE_BLOCKS: usize = 4096;
pub const DEFAULT_PARTITIONS: u32 = 4;
const MIN_WORKERS: usize = 2;

/// Parámetros del motor. Los valores por defecto se pueden pisar con
/// variables de entorno `SPARKMINI_*` y, por encima, con flags de la CLI.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Tamaño fijo del pool de workers.
    pub workers: usize,
    /// Intentos extra por tarea antes de fallar el job.
    pub max_retries: u32,
    /// Bloques que guarda cada worker en su caché LRU.
    pub cache_blocks: usize,
    /// Particiones mínimas al leer una fuente.
    pub default_partitions: u32,
    /// Montajes `host:port` → directorio local.
    pub namespaces: Vec<(String, PathBuf)>,
}

fn default_workers() -> usize {
    (num_cpus::get() * 2).max(MIN_WORKERS)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_retries: DEFAULT_MAX_RETRIES,
            cache_blocks: DEFAULT_CACHE_BLOCKS,
            default_partitions: DEFAULT_PARTITIONS,
            namespaces: Vec::new(),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let namespaces = match env::var("SPARKMINI_NAMESPACES") {
            Ok(raw) => parse_namespaces(&raw)?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            workers: env_or("SPARKMINI_WORKERS", default_workers()).max(1),
            max_retries: env_or("SPARKMINI_MAX_RETRIES", DEFAULT_MAX_RETRIES),
            cache_blocks: env_or("SPARKMINI_CACHE_BLOCKS", DEFAULT_CACHE_BLOCKS).max(1),
            default_partitions: env_or("SPARKMINI_PARTITIONS", DEFAULT_PARTITIONS).max(1),
            namespaces,
        })
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_cache_blocks(mut self, cache_blocks: usize) -> Self {
        self.cache_blocks = cache_blocks.max(1);
        self
    }
}

/// `namenode:9000=/srv/hdfs,otro:8020=/data`
pub fn parse_namespaces(raw: &str) -> Result<Vec<(String, PathBuf)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (authority, dir) = entry
                .split_once('=')
                .ok_or_else(|| EngineError::storage(entry, "se esperaba host:puerto=/directorio"))?;
            let (host, port) = authority
                .rsplit_once(':')
                .ok_or_else(|| EngineError::storage(entry, "se esperaba host:puerto"))?;
            let port: u16 = port
                .parse()
                .map_err(|_| EngineError::storage(entry, format!("puerto inválido '{port}'")))?;
            if host.is_empty() || dir.is_empty() {
                return Err(EngineError::storage(entry, "montaje incompleto"));
            }
            Ok((format!("{host}:{port}"), PathBuf::from(dir)))
        })
        .collect()
}

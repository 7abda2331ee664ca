use serde::{Deserialize, Serialize};

use crate::job::JobInfo;
use crate::record::Records;

/// Valor agregado que devuelve una acción.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionOutput {
    /// `collect` y `top_n`
    Records(Records),
    Count(u64),
    /// `save_as`: dónde quedó y cuántos registros se escribieron
    Saved { path: String, records: u64 },
}

impl ActionOutput {
    pub fn records(&self) -> Option<&Records> {
        match self {
            ActionOutput::Records(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_records(self) -> Option<Records> {
        match self {
            ActionOutput::Records(r) => Some(r),
            _ => None,
        }
    }

    pub fn count(&self) -> Option<u64> {
        match self {
            ActionOutput::Count(n) => Some(*n),
            _ => None,
        }
    }
}

/// Resultado completo de un job exitoso.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub info: JobInfo,
    pub output: ActionOutput,
}

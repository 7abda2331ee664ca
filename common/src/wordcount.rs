use serde_json::json;

use crate::dag::{DatasetId, Graph};
use crate::errors::Result;
use crate::record::{self, Record};

/// Separa una línea en palabras normalizadas:
/// sólo alfanumérico y '_', en minúscula; los tokens vacíos se descartan.
pub fn tokenize(line: &Record) -> Vec<Record> {
    let Some(text) = line.as_str() else {
        return Vec::new();
    };
    text.split_whitespace()
        .filter_map(|raw| {
            let cleaned: String = raw
                .chars()
                .filter(|c| c.is_alphanumeric() || *c == '_')
                .collect::<String>()
                .to_lowercase();
            (!cleaned.is_empty()).then(|| json!(cleaned))
        })
        .collect()
}

/// palabra -> [palabra, 1]
pub fn to_one(word: &Record) -> Record {
    record::pair(word.clone(), 1)
}

/// source → flat_map(tokenize) → map(w -> (w,1)) → reduce_by_key(+)
pub fn build_wordcount(graph: &mut Graph, input: &str, partitions: u32) -> Result<DatasetId> {
    let lines = graph.source(input, partitions);
    let words = graph.flat_map(lines, tokenize)?;
    let pairs = graph.map_to_pair(words, to_one)?;
    graph.reduce_by_key(pairs, record::sum_values, None)
}

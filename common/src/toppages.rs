use serde_json::json;

use crate::dag::{DatasetId, Graph};
use crate::errors::Result;
use crate::record::{self, Record};

const HTTP_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "TRACE", "CONNECT",
];

/// Extrae la página pedida de una línea de log.
///
/// La petición es el primer tramo entre comillas (formato común de Apache,
/// `"GET /index.html HTTP/1.1"`) o, si no hay comillas, los tokens a partir
/// del primer método HTTP. La página es el token 1 de la petición y tiene que
/// empezar con '/'. Cualquier otra cosa devuelve `None`.
pub fn extract_page(line: &str) -> Option<String> {
    let request: Vec<&str> = match line.split('"').nth(1) {
        Some(quoted) if line.matches('"').count() >= 2 => quoted.split_whitespace().collect(),
        _ => {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let method = tokens.iter().position(|t| HTTP_METHODS.contains(t))?;
            tokens[method..].to_vec()
        }
    };

    let page = request.get(1)?;
    page.starts_with('/').then(|| page.to_string())
}

/// Adaptador para `flat_map`: cero o una página por línea.
pub fn extract_page_record(line: &Record) -> Vec<Record> {
    line.as_str()
        .and_then(extract_page)
        .map(|p| vec![json!(p)])
        .unwrap_or_default()
}

/// página -> [página, 1]
pub fn page_to_one(page: &Record) -> Record {
    record::pair(page.clone(), 1)
}

/// Clave de orden: el conteo (segundo elemento del par).
pub fn by_count(rec: &Record) -> Record {
    record::as_pair(rec)
        .map(|(_, v)| v.clone())
        .unwrap_or(Record::Null)
}

/// source → flat_map(extract_page) → map(p -> (p,1)) → reduce_by_key(+)
/// → sort_by(conteo, desc). El top-k lo aplica la acción.
pub fn build_toppages(graph: &mut Graph, log_path: &str, partitions: u32) -> Result<DatasetId> {
    let lines = graph.source(log_path, partitions);
    let pages = graph.flat_map(lines, extract_page_record)?;
    let pairs = graph.map_to_pair(pages, page_to_one)?;
    let counts = graph.reduce_by_key(pairs, record::sum_values, None)?;
    graph.sort_by(counts, by_count, true)
}

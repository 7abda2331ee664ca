use serde_json::Value;
use std::{
    cmp::Ordering,
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

/// Tipo genérico de registro (fila de datos).
/// Usamos JSON para poder representar líneas, tokens y pares clave/valor.
/// Un par es siempre un arreglo de dos elementos `[clave, valor]`.
pub type Record = Value;

/// Colección en memoria de registros.
pub type Records = Vec<Record>;

pub fn pair(key: impl Into<Value>, value: impl Into<Value>) -> Record {
    Value::Array(vec![key.into(), value.into()])
}

pub fn as_pair(rec: &Record) -> Option<(&Record, &Record)> {
    match rec {
        Value::Array(items) if items.len() == 2 => Some((&items[0], &items[1])),
        _ => None,
    }
}

/// Descompone un par. Si el registro no es un par lo devuelve intacto.
pub fn into_pair(rec: Record) -> Result<(Record, Record), Record> {
    match rec {
        Value::Array(items) => match <[Value; 2]>::try_from(items) {
            Ok([key, value]) => Ok((key, value)),
            Err(items) => Err(Value::Array(items)),
        },
        other => Err(other),
    }
}

/// Texto canónico de una clave: el string tal cual, o el JSON compacto.
pub fn key_string(key: &Record) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Texto canónico de un registro completo (desempate determinista).
pub fn canonical(rec: &Record) -> String {
    rec.to_string()
}

/// SipHash con claves fijas: el mismo bucket en cualquier proceso.
pub fn hash_key_to_partition(key: &str, num_partitions: u32) -> u32 {
    let mut h = DefaultHasher::new();
    key.hash(&mut h);
    (h.finish() % num_partitions.max(1) as u64) as u32
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Orden total entre registros:
/// null < bool < número < string < arreglo < objeto.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(_), Value::Number(_)) => compare_numbers(a, b),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(xs), Value::Array(ys)) => {
            for (x, y) in xs.iter().zip(ys.iter()) {
                let ord = compare_values(x, y);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            xs.len().cmp(&ys.len())
        }
        (Value::Object(_), Value::Object(_)) => a.to_string().cmp(&b.to_string()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn compare_numbers(a: &Value, b: &Value) -> Ordering {
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x.cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x.cmp(&y);
    }
    let x = a.as_f64().unwrap_or(0.0);
    let y = b.as_f64().unwrap_or(0.0);
    x.partial_cmp(&y).unwrap_or(Ordering::Equal)
}

/// Suma numérica: enteros sin signo si se puede, luego con signo, luego f64.
/// Cualquier valor no numérico cuenta como 0.
pub fn sum_values(a: &Record, b: &Record) -> Record {
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        if let Some(s) = x.checked_add(y) {
            return Value::from(s);
        }
    }
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(s) = x.checked_add(y) {
            return Value::from(s);
        }
    }
    let x = a.as_f64().unwrap_or(0.0);
    let y = b.as_f64().unwrap_or(0.0);
    Value::from(x + y)
}

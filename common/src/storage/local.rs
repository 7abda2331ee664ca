use std::{
    fs::{self, File},
    io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::errors::{EngineError, Result};
use crate::record::{self, Record};
use crate::storage::{OutputHandle, PartitionDescriptor};

const TEMPORARY_DIR: &str = "_temporary";
const SUCCESS_MARKER: &str = "_SUCCESS";

pub fn part_file_name(partition: u32) -> String {
    format!("part-{partition:05}")
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('_') || n.starts_with('.'))
        .unwrap_or(false)
}

fn has_glob_chars(s: &str) -> bool {
    s.contains(['*', '?', '['])
}

/* =========================
   Lectura
   ========================= */

/// Expande una ruta a la lista ordenada de archivos que la componen:
/// un archivo, los archivos visibles de un directorio, o lo que coincida con un glob.
pub fn expand_inputs(raw: &str, path: &Path) -> Result<Vec<PathBuf>> {
    let text = path.to_string_lossy();

    let mut files: Vec<PathBuf> = if has_glob_chars(&text) {
        let entries = glob::glob(&text).map_err(|e| EngineError::storage(raw, e))?;
        entries
            .filter_map(|entry| entry.ok())
            .filter(|p| p.is_file())
            .collect()
    } else if path.is_dir() {
        fs::read_dir(path)
            .map_err(|e| EngineError::storage(raw, e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && !is_hidden(p))
            .collect()
    } else if path.is_file() {
        vec![path.to_path_buf()]
    } else {
        return Err(EngineError::storage(raw, "no existe"));
    };

    if files.is_empty() {
        return Err(EngineError::storage(raw, "ningún archivo de entrada"));
    }
    files.sort();
    Ok(files)
}

/// Corta los archivos en rangos de ceil(total / min_partitions) bytes.
/// Cada archivo se corta por separado; los archivos vacíos no generan rangos,
/// salvo que toda la entrada esté vacía (una partición vacía).
pub fn split_files(raw: &str, files: &[PathBuf], min_partitions: u32) -> Result<Vec<PartitionDescriptor>> {
    let mut sizes = Vec::with_capacity(files.len());
    for f in files {
        let len = fs::metadata(f)
            .map_err(|e| EngineError::storage(f.display().to_string(), e))?
            .len();
        sizes.push(len);
    }

    let total: u64 = sizes.iter().sum();
    let split_size = total.div_ceil(min_partitions.max(1) as u64).max(1);

    let mut out = Vec::new();
    for (file, len) in files.iter().zip(sizes) {
        let mut start = 0;
        while start < len {
            let end = (start + split_size).min(len);
            out.push(PartitionDescriptor {
                index: out.len() as u32,
                file: file.clone(),
                start,
                end,
                source: raw.to_string(),
            });
            start = end;
        }
    }

    if out.is_empty() {
        out.push(PartitionDescriptor {
            index: 0,
            file: files[0].clone(),
            start: 0,
            end: 0,
            source: raw.to_string(),
        });
    }

    debug!(
        "entrada {} dividida en {} particiones (split={} bytes, total={} bytes)",
        raw,
        out.len(),
        split_size,
        total
    );
    Ok(out)
}

/// Lee las líneas que empiezan dentro de [start, end).
///
/// Un rango que no arranca al principio de una línea descarta la línea
/// parcial (la lee el rango anterior, que sigue hasta terminar su última línea).
pub fn read_range(desc: &PartitionDescriptor) -> Result<Vec<String>> {
    let err = |e: std::io::Error| EngineError::storage(desc.file.display().to_string(), e);

    let mut file = File::open(&desc.file).map_err(err)?;
    let mut pos = desc.start;
    let mut buf = Vec::new();

    if desc.start > 0 {
        file.seek(SeekFrom::Start(desc.start - 1)).map_err(err)?;
    }
    let mut reader = BufReader::new(file);

    if desc.start > 0 {
        // si el byte anterior es '\n' esto consume sólo ese byte
        let n = reader.read_until(b'\n', &mut buf).map_err(err)?;
        pos = desc.start - 1 + n as u64;
    }

    let mut lines = Vec::new();
    while pos < desc.end {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf).map_err(err)?;
        if n == 0 {
            break;
        }
        pos += n as u64;

        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        lines.push(String::from_utf8_lossy(&buf).into_owned());
    }
    Ok(lines)
}

/* =========================
   Escritura con commit
   ========================= */

pub fn create_output(raw: &str, final_dir: PathBuf) -> Result<OutputHandle> {
    let exists = final_dir.exists();
    if exists {
        let committed = final_dir.join(SUCCESS_MARKER).exists()
            || fs::read_dir(&final_dir)
                .map_err(|e| EngineError::storage(raw, e))?
                .filter_map(|e| e.ok())
                .any(|e| !is_hidden(&e.path()));
        if committed || final_dir.is_file() {
            return Err(EngineError::storage(raw, "la salida ya existe"));
        }
    }

    let temp_dir = final_dir.join(TEMPORARY_DIR);
    fs::create_dir_all(&temp_dir).map_err(|e| EngineError::storage(raw, e))?;

    Ok(OutputHandle {
        path: raw.to_string(),
        final_dir,
        temp_dir,
        created_root: !exists,
    })
}

/// Escribe (o reescribe) `_temporary/part-NNNNN`. Los pares van como filas
/// CSV `clave,valor`; el resto de los registros como una fila de un campo.
pub fn write_partition(handle: &OutputHandle, partition: u32, records: &[Record]) -> Result<u64> {
    let target = handle.temp_dir.join(part_file_name(partition));
    let err = |e: &dyn std::fmt::Display| EngineError::storage(target.display().to_string(), e);

    let file = File::create(&target).map_err(|e| err(&e))?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_writer(BufWriter::new(file));

    for rec in records {
        let row = match record::as_pair(rec) {
            Some((k, v)) => vec![record::key_string(k), record::key_string(v)],
            None => vec![record::key_string(rec)],
        };
        writer.write_record(&row).map_err(|e| err(&e))?;
    }

    let mut inner = writer.into_inner().map_err(|e| err(e.error()))?;
    inner.flush().map_err(|e| err(&e))?;
    Ok(records.len() as u64)
}

/// Mueve las particiones temporales a su lugar final y deja `_SUCCESS`.
pub fn commit(handle: &OutputHandle, partitions: u32) -> Result<()> {
    let err = |e: std::io::Error| EngineError::storage(handle.path.clone(), e);

    for p in 0..partitions {
        let name = part_file_name(p);
        let from = handle.temp_dir.join(&name);
        if !from.is_file() {
            return Err(EngineError::storage(
                handle.path.clone(),
                format!("falta la partición temporal {name}"),
            ));
        }
        fs::rename(&from, handle.final_dir.join(&name)).map_err(err)?;
    }

    fs::remove_dir_all(&handle.temp_dir).map_err(err)?;
    File::create(handle.final_dir.join(SUCCESS_MARKER)).map_err(err)?;
    Ok(())
}

/// Borra todo lo que escribió el job. Se puede llamar más de una vez.
pub fn abort(handle: &OutputHandle) -> Result<()> {
    let err = |e: std::io::Error| EngineError::storage(handle.path.clone(), e);

    if handle.created_root {
        if handle.final_dir.exists() {
            fs::remove_dir_all(&handle.final_dir).map_err(err)?;
        }
    } else if handle.temp_dir.exists() {
        fs::remove_dir_all(&handle.temp_dir).map_err(err)?;
    }
    Ok(())
}

use std::{collections::HashMap, path::PathBuf};

use crate::errors::{EngineError, Result};

/// Dirección de almacenamiento ya validada.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoragePath {
    /// Ruta local, con o sin `file://`. Puede ser un glob.
    Local(PathBuf),
    /// `scheme://host:port/ruta` dentro de un namespace montado.
    Namespace {
        scheme: String,
        authority: String,
        path: String,
    },
}

impl StoragePath {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(EngineError::storage(raw, "ruta vacía"));
        }

        let Some((scheme, rest)) = raw.split_once("://") else {
            return Ok(StoragePath::Local(PathBuf::from(raw)));
        };

        if scheme.is_empty()
            || !scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
        {
            return Err(EngineError::storage(raw, "esquema inválido"));
        }

        if scheme == "file" {
            if !rest.starts_with('/') {
                return Err(EngineError::storage(raw, "file:// requiere una ruta absoluta"));
            }
            return Ok(StoragePath::Local(PathBuf::from(rest)));
        }

        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, ""),
        };
        if path.trim_matches('/').is_empty() {
            return Err(EngineError::storage(raw, "falta la ruta"));
        }

        let (host, port) = authority
            .rsplit_once(':')
            .ok_or_else(|| EngineError::storage(raw, "se esperaba host:puerto"))?;
        if host.is_empty() {
            return Err(EngineError::storage(raw, "falta el host"));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| EngineError::storage(raw, format!("puerto inválido '{port}'")))?;

        Ok(StoragePath::Namespace {
            scheme: scheme.to_string(),
            authority: format!("{host}:{port}"),
            path: path.to_string(),
        })
    }

    /// Traduce la dirección a una ruta del filesystem local.
    pub fn resolve(&self, raw: &str, namespaces: &HashMap<String, PathBuf>) -> Result<PathBuf> {
        match self {
            StoragePath::Local(p) => Ok(p.clone()),
            StoragePath::Namespace {
                authority, path, ..
            } => {
                let root = namespaces.get(authority).ok_or_else(|| {
                    EngineError::storage(raw, format!("namespace {authority} inalcanzable"))
                })?;
                Ok(root.join(path.trim_start_matches('/')))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rutas_locales_y_file() {
        assert_eq!(
            StoragePath::parse("data/in.txt").unwrap(),
            StoragePath::Local(PathBuf::from("data/in.txt"))
        );
        assert_eq!(
            StoragePath::parse("file:///tmp/x").unwrap(),
            StoragePath::Local(PathBuf::from("/tmp/x"))
        );
        assert!(StoragePath::parse("file://relativo").is_err());
        assert!(StoragePath::parse("   ").is_err());
    }

    #[test]
    fn parse_namespace_valida_host_puerto_y_ruta() {
        let p = StoragePath::parse("hdfs://namenode:9000/user/logs").unwrap();
        assert_eq!(
            p,
            StoragePath::Namespace {
                scheme: "hdfs".into(),
                authority: "namenode:9000".into(),
                path: "/user/logs".into(),
            }
        );

        for bad in [
            "hdfs://namenode/user",
            "hdfs://:9000/user",
            "hdfs://namenode:99999/user",
            "hdfs://namenode:9000",
            "hdfs://namenode:9000/",
            "://x/y",
        ] {
            let err = StoragePath::parse(bad).unwrap_err();
            assert_eq!(err.kind(), "StorageUnavailable", "{bad}");
        }
    }

    #[test]
    fn resolve_usa_los_montajes() {
        let mut ns = HashMap::new();
        ns.insert("namenode:9000".to_string(), PathBuf::from("/srv/hdfs"));

        let raw = "hdfs://namenode:9000/user/a.txt";
        let p = StoragePath::parse(raw).unwrap();
        assert_eq!(p.resolve(raw, &ns).unwrap(), PathBuf::from("/srv/hdfs/user/a.txt"));

        let raw = "hdfs://otro:9000/user/a.txt";
        let p = StoragePath::parse(raw).unwrap();
        assert!(p.resolve(raw, &ns).is_err());
    }
}

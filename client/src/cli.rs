use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use common::{config, record, toppages, wordcount, EngineConfig, Graph};
use master::Driver;

#[derive(Parser, Debug)]
#[command(name = "sparkmini")]
#[command(about = "Motor batch estilo Spark: wordcount y top de páginas")]
pub struct Cli {
    #[command(flatten)]
    pub engine: EngineArgs,

    /// Nivel de log (pisa RUST_LOG), p. ej. `debug` o `master=trace`
    #[arg(long, global = true, value_name = "FILTRO")]
    pub log_level: Option<String>,

    /// Sólo muestra el plan de etapas, sin ejecutar
    #[arg(long, global = true)]
    pub explain: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flags que pisan la configuración tomada del entorno.
#[derive(Args, Debug, Default)]
pub struct EngineArgs {
    /// Tamaño del pool de workers
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// Particiones mínimas al leer la entrada
    #[arg(long, global = true)]
    pub partitions: Option<u32>,

    /// Reintentos por tarea antes de fallar el job
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Bloques en la caché de cada worker
    #[arg(long, global = true)]
    pub cache_blocks: Option<usize>,

    /// Montaje `host:port=/dir` para rutas `hdfs://host:port/...` (repetible)
    #[arg(long = "namespace", global = true, value_name = "MONTAJE")]
    pub namespaces: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ejecuta uno de los trabajos incluidos
    #[command(subcommand)]
    Run(Job),
}

#[derive(Subcommand, Debug)]
pub enum Job {
    /// Cuenta palabras y guarda los pares `palabra,conteo`
    Wordcount {
        #[arg(value_name = "ENTRADA")]
        input: String,
        #[arg(value_name = "SALIDA")]
        output: String,
    },
    /// Las k páginas más pedidas de un log de accesos
    Toppages {
        #[arg(value_name = "LOG")]
        log: String,
        #[arg(value_name = "K")]
        k: usize,
    },
}

impl EngineArgs {
    /// Entorno primero, flags encima.
    pub fn resolve(&self) -> Result<EngineConfig> {
        let mut cfg = EngineConfig::from_env().context("configuración del entorno inválida")?;
        if let Some(w) = self.workers {
            cfg = cfg.with_workers(w);
        }
        if let Some(p) = self.partitions {
            cfg.default_partitions = p.max(1);
        }
        if let Some(r) = self.max_retries {
            cfg = cfg.with_max_retries(r);
        }
        if let Some(c) = self.cache_blocks {
            cfg = cfg.with_cache_blocks(c);
        }
        for raw in &self.namespaces {
            let mounts: Vec<(String, PathBuf)> = config::parse_namespaces(raw)
                .with_context(|| format!("--namespace inválido: {raw}"))?;
            cfg.namespaces.extend(mounts);
        }
        Ok(cfg)
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    let cfg = cli.engine.resolve()?;
    let partitions = cfg.default_partitions;
    info!(
        "sparkmini: {} workers, {} reintentos, {} particiones",
        cfg.workers, cfg.max_retries, partitions
    );
    let driver = Driver::new(cfg);

    let Commands::Run(job) = cli.command;
    match job {
        Job::Wordcount { input, output } => {
            let mut g = Graph::new();
            let counts = wordcount::build_wordcount(&mut g, &input, partitions)?;
            if cli.explain {
                print!("{}", driver.explain(&g, counts)?);
                return Ok(());
            }

            let g = Arc::new(g);
            let written = driver.save_as(&g, counts, &output).await?;
            println!("{written} palabras distintas escritas en {output}");
        }
        Job::Toppages { log, k } => {
            let mut g = Graph::new();
            let ranked = toppages::build_toppages(&mut g, &log, partitions)?;
            if cli.explain {
                print!("{}", driver.explain(&g, ranked)?);
                return Ok(());
            }

            let g = Arc::new(g);
            let top = driver.top_n(&g, ranked, k).await?;
            for rec in &top {
                match record::as_pair(rec) {
                    Some((page, hits)) => {
                        println!("{}\t{}", record::key_string(page), record::key_string(hits))
                    }
                    None => println!("{}", record::key_string(rec)),
                }
            }
        }
    }

    if let Some(job) = driver.last_job() {
        info!(
            "job {} {:?} en {} ms: {}/{} tareas, {} reintentos",
            job.id,
            job.status,
            job.duration_ms().unwrap_or_default(),
            job.completed_tasks,
            job.total_tasks,
            job.retries
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsea_wordcount_con_flags_globales() {
        let cli = Cli::try_parse_from([
            "sparkmini",
            "--workers",
            "3",
            "run",
            "wordcount",
            "in.txt",
            "out",
            "--namespace",
            "namenode:9000=/srv/hdfs",
        ])
        .unwrap();

        assert_eq!(cli.engine.workers, Some(3));
        assert_eq!(cli.engine.namespaces, vec!["namenode:9000=/srv/hdfs"]);
        match cli.command {
            Commands::Run(Job::Wordcount { input, output }) => {
                assert_eq!((input.as_str(), output.as_str()), ("in.txt", "out"));
            }
            other => panic!("comando inesperado: {other:?}"),
        }
    }

    #[test]
    fn parsea_toppages_y_rechaza_k_invalido() {
        let cli = Cli::try_parse_from(["sparkmini", "run", "toppages", "access.log", "5"]).unwrap();
        assert!(matches!(cli.command, Commands::Run(Job::Toppages { k: 5, .. })));

        assert!(Cli::try_parse_from(["sparkmini", "run", "toppages", "access.log", "muchas"]).is_err());
        assert!(Cli::try_parse_from(["sparkmini", "run", "wordcount", "in.txt"]).is_err());
    }

    #[test]
    fn flags_pisan_la_configuracion() {
        let args = EngineArgs {
            workers: Some(5),
            partitions: Some(0),
            max_retries: Some(1),
            cache_blocks: Some(16),
            namespaces: vec!["nn:9000=/srv/a".into()],
        };
        let cfg = args.resolve().unwrap();
        assert_eq!(cfg.workers, 5);
        assert_eq!(cfg.default_partitions, 1);
        assert_eq!(cfg.max_retries, 1);
        assert_eq!(cfg.cache_blocks, 16);
        assert!(cfg
            .namespaces
            .contains(&("nn:9000".to_string(), PathBuf::from("/srv/a"))));

        let bad = EngineArgs {
            namespaces: vec!["sin-igual".into()],
            ..EngineArgs::default()
        };
        assert!(bad.resolve().is_err());
    }
}

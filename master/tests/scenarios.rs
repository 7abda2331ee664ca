use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use serde_json::json;

use common::record::pair;
use common::{
    toppages, wordcount, Action, BlockId, CancelToken, EngineConfig, EngineError, Graph, JobStatus,
    Record, Records,
};
use master::{Driver, JOB_HISTORY};
use worker::FaultPlan;

fn write_input(dir: &Path, name: &str, content: &str) -> String {
    let p = dir.join(name);
    fs::write(&p, content).unwrap();
    p.to_string_lossy().into_owned()
}

fn config() -> EngineConfig {
    EngineConfig::default().with_workers(3).with_max_retries(3)
}

fn sorted(mut recs: Records) -> Records {
    recs.sort_by_key(|r| r.to_string());
    recs
}

/* =========================
   Escenarios de punta a punta
   ========================= */

#[tokio::test]
async fn wordcount_cuenta_palabras() {
    let tmp = tempfile::tempdir().unwrap();
    let input = write_input(tmp.path(), "in.txt", "a b a\nb c\n");

    let driver = Driver::new(config());
    let mut g = Graph::new();
    let counts = wordcount::build_wordcount(&mut g, &input, 2).unwrap();
    let g = Arc::new(g);

    let out = driver.collect(&g, counts).await.unwrap();
    assert_eq!(
        sorted(out),
        vec![pair("a", 2), pair("b", 2), pair("c", 1)]
    );

    let job = driver.last_job().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.stages, 2);
    assert_eq!(job.completed_tasks, job.total_tasks);
    assert_eq!(job.retries, 0);
}

#[tokio::test]
async fn toppages_devuelve_la_pagina_mas_vista() {
    let tmp = tempfile::tempdir().unwrap();
    let log = write_input(
        tmp.path(),
        "access.log",
        "x GET /page0 200\nx GET /page1 200\nx GET /page0 200\n",
    );

    let driver = Driver::new(config());
    let mut g = Graph::new();
    let top = toppages::build_toppages(&mut g, &log, 2).unwrap();
    let g = Arc::new(g);

    assert_eq!(driver.top_n(&g, top, 1).await.unwrap(), vec![pair("/page0", 2)]);
    assert_eq!(
        driver.collect(&g, top).await.unwrap(),
        vec![pair("/page0", 2), pair("/page1", 1)]
    );
}

#[tokio::test]
async fn fallos_transitorios_no_cambian_el_resultado() {
    let tmp = tempfile::tempdir().unwrap();
    let input = write_input(tmp.path(), "in.txt", "a b a\nb c\n");

    let faults = FaultPlan::new();
    // la tarea reduce 0 falla dos veces antes de andar
    faults.fail_task(1, 0, 2);
    let driver = Driver::new(config()).with_faults(faults);

    let mut g = Graph::new();
    let counts = wordcount::build_wordcount(&mut g, &input, 2).unwrap();
    let g = Arc::new(g);

    let out = driver.collect(&g, counts).await.unwrap();
    assert_eq!(sorted(out), vec![pair("a", 2), pair("b", 2), pair("c", 1)]);

    let job = driver.last_job().unwrap();
    assert_eq!(job.retries, 2);
    assert_eq!(job.failed_tasks, 2);
}

#[tokio::test]
async fn reintentos_agotados_fallan_el_job() {
    let tmp = tempfile::tempdir().unwrap();
    let input = write_input(tmp.path(), "in.txt", "a b a\nb c\n");

    let faults = FaultPlan::new();
    faults.fail_task(0, 0, 10);
    let driver = Driver::new(config()).with_faults(faults);

    let mut g = Graph::new();
    let counts = wordcount::build_wordcount(&mut g, &input, 1).unwrap();
    let g = Arc::new(g);

    match driver.collect(&g, counts).await.unwrap_err() {
        EngineError::TaskFailure {
            stage_id,
            partition_id,
            attempts,
            ..
        } => assert_eq!((stage_id, partition_id, attempts), (0, 0, 4)),
        other => panic!("se esperaba TaskFailure, llegó {other:?}"),
    }

    let job = driver.last_job().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().starts_with("TaskFailure"));
}

#[tokio::test]
async fn ruta_hdfs_inalcanzable_es_storage_unavailable() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("salida");

    let driver = Driver::new(config());
    let mut g = Graph::new();
    let counts =
        wordcount::build_wordcount(&mut g, "hdfs://namenode:9000/no/existe.txt", 2).unwrap();
    let g = Arc::new(g);

    let err = driver
        .save_as(&g, counts, &out.to_string_lossy())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "StorageUnavailable");
    assert!(!out.exists());
    assert_eq!(driver.last_job().unwrap().status, JobStatus::Failed);
}

#[tokio::test]
async fn namespace_montado_se_lee_como_hdfs() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("hdfs");
    fs::create_dir_all(root.join("user")).unwrap();
    fs::write(root.join("user/in.txt"), "x y x\n").unwrap();

    let mut cfg = config();
    cfg.namespaces = vec![("namenode:9000".to_string(), root)];
    let driver = Driver::new(cfg);

    let mut g = Graph::new();
    let counts =
        wordcount::build_wordcount(&mut g, "hdfs://namenode:9000/user/in.txt", 2).unwrap();
    let g = Arc::new(g);

    let out = driver.collect(&g, counts).await.unwrap();
    assert_eq!(sorted(out), vec![pair("x", 2), pair("y", 1)]);
}

#[tokio::test]
async fn salida_perdida_se_recomputa_desde_el_linaje() {
    let tmp = tempfile::tempdir().unwrap();
    let input = write_input(tmp.path(), "in.txt", "a b a\nb c\nc c d\n");

    let mut g = Graph::new();
    let counts = wordcount::build_wordcount(&mut g, &input, 2).unwrap();
    let g = Arc::new(g);

    let expected = Driver::new(config()).collect(&g, counts).await.unwrap();

    let faults = FaultPlan::new();
    faults.lose_output_once(0, 0);
    let driver = Driver::new(config()).with_faults(faults);
    let out = driver.collect(&g, counts).await.unwrap();

    // mismo contenido y mismo orden que sin la pérdida
    assert_eq!(out, expected);
    let job = driver.last_job().unwrap();
    assert!(job.recomputed_tasks >= 1);
    assert!(job.total_tasks > 4);
}

static PERSIST_CALLS: AtomicUsize = AtomicUsize::new(0);

fn counted_len(r: &Record) -> Record {
    PERSIST_CALLS.fetch_add(1, Ordering::SeqCst);
    json!(r.as_str().map(str::len).unwrap_or(0))
}

#[tokio::test]
async fn dataset_persistido_no_se_recalcula() {
    let tmp = tempfile::tempdir().unwrap();
    let input = write_input(tmp.path(), "in.txt", "uno\ndos\ntres\ncuatro\n");

    let driver = Driver::new(config());
    let mut g = Graph::new();
    let src = g.source(input, 2);
    let lens = g.map(src, counted_len).unwrap();
    let lens = g.persist(lens).unwrap();
    let g = Arc::new(g);

    assert_eq!(driver.count(&g, lens).await.unwrap(), 4);
    let after_first = PERSIST_CALLS.load(Ordering::SeqCst);
    assert_eq!(after_first, 4);

    assert_eq!(driver.count(&g, lens).await.unwrap(), 4);
    assert_eq!(PERSIST_CALLS.load(Ordering::SeqCst), after_first);
}

static EVICTED_CALLS: AtomicUsize = AtomicUsize::new(0);

fn counted_tag(r: &Record) -> Record {
    EVICTED_CALLS.fetch_add(1, Ordering::SeqCst);
    json!(format!("<{}>", r.as_str().unwrap_or("")))
}

#[tokio::test]
async fn bloque_persistido_desalojado_se_recomputa_igual() {
    let tmp = tempfile::tempdir().unwrap();
    let input = write_input(tmp.path(), "in.txt", "uno\ndos\ntres\ncuatro\ncinco\nseis\n");

    let driver = Driver::new(config());
    let mut g = Graph::new();
    let src = g.source(input, 3);
    let tagged = g.map(src, counted_tag).unwrap();
    let tagged = g.persist(tagged).unwrap();
    let g = Arc::new(g);

    let first = driver.collect(&g, tagged).await.unwrap();
    assert_eq!(EVICTED_CALLS.load(Ordering::SeqCst), 6);

    let evicted: usize = (0..3)
        .map(|partition| {
            driver.pool().evict(&BlockId::Persisted {
                graph: g.id(),
                dataset: tagged,
                partition,
            })
        })
        .sum();
    assert_eq!(evicted, 3);

    let again = driver.collect(&g, tagged).await.unwrap();
    assert_eq!(again, first);
    assert_eq!(EVICTED_CALLS.load(Ordering::SeqCst), 12);
}

fn upper(r: &Record) -> Record {
    json!(r.as_str().unwrap_or("").to_uppercase())
}

fn reversed(r: &Record) -> Record {
    json!(r.as_str().unwrap_or("").chars().rev().collect::<String>())
}

#[tokio::test]
async fn grafos_clonados_no_comparten_cache() {
    let tmp = tempfile::tempdir().unwrap();
    let input = write_input(tmp.path(), "in.txt", "hola\nmundo\n");

    let driver = Driver::new(config());
    let mut base = Graph::new();
    let src = base.source(input, 2);
    let mut other = base.clone();

    // mismo DatasetId en los dos grafos, con funciones distintas
    let up = base.map(src, upper).unwrap();
    let up = base.persist(up).unwrap();
    let rev = other.map(src, reversed).unwrap();
    let rev = other.persist(rev).unwrap();
    assert_eq!(up, rev);
    let (base, other) = (Arc::new(base), Arc::new(other));

    assert_eq!(
        driver.collect(&base, up).await.unwrap(),
        vec![json!("HOLA"), json!("MUNDO")]
    );
    assert_eq!(
        driver.collect(&other, rev).await.unwrap(),
        vec![json!("aloh"), json!("odnum")]
    );
}

fn slow(r: &Record) -> Record {
    std::thread::sleep(Duration::from_millis(20));
    r.clone()
}

#[tokio::test]
async fn cancelar_un_job_lo_deja_cancelado() {
    let tmp = tempfile::tempdir().unwrap();
    let lines: String = (0..40).map(|i| format!("linea {i}\n")).collect();
    let input = write_input(tmp.path(), "in.txt", &lines);

    let driver = Driver::new(config());
    let mut g = Graph::new();
    let src = g.source(input, 2);
    let slowed = g.map(src, slow).unwrap();
    let g = Arc::new(g);

    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = driver
        .run_job(&g, slowed, Action::Collect, &cancel)
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::Cancelled);
    assert_eq!(driver.last_job().unwrap().status, JobStatus::Cancelled);
}

fn slow_pair(r: &Record) -> Record {
    std::thread::sleep(Duration::from_millis(10));
    pair(r.as_str().unwrap_or(""), 1)
}

#[tokio::test]
async fn fallo_fatal_espera_a_las_tareas_en_vuelo() {
    let tmp = tempfile::tempdir().unwrap();
    let lines: String = (0..40).map(|i| format!("linea{i}\n")).collect();
    let input = write_input(tmp.path(), "in.txt", &lines);

    let faults = FaultPlan::new();
    // sin reintentos basta un fallo para matar el job
    faults.fail_task(0, 0, 1);
    let driver = Driver::new(config().with_max_retries(0)).with_faults(faults);

    let mut g = Graph::new();
    let src = g.source(input, 2);
    let pairs = g.map_to_pair(src, slow_pair).unwrap();
    let counts = g.reduce_by_key(pairs, common::record::sum_values, None).unwrap();
    let g = Arc::new(g);

    let err = driver.collect(&g, counts).await.unwrap_err();
    assert_eq!(err.kind(), "TaskFailure");

    // al volver, la partición lenta ya terminó y no dejó bloques
    for m in driver.pool().metrics() {
        assert_eq!(m.active_tasks, 0, "worker {}", m.worker_id);
        assert_eq!(m.cached_blocks, 0, "worker {}", m.worker_id);
    }

    // el pool queda usable para el siguiente job
    assert_eq!(driver.count(&g, src).await.unwrap(), 40);
}

#[tokio::test]
async fn el_historial_de_jobs_esta_acotado() {
    let tmp = tempfile::tempdir().unwrap();
    let input = write_input(tmp.path(), "in.txt", "a\nb\n");

    let driver = Driver::new(config());
    let mut g = Graph::new();
    let src = g.source(input, 1);
    let g = Arc::new(g);

    let first = driver
        .run_job(&g, src, Action::Count, &CancelToken::new())
        .await
        .unwrap();
    let mut newest = first.info.id;
    for _ in 0..JOB_HISTORY + 2 {
        newest = driver
            .run_job(&g, src, Action::Count, &CancelToken::new())
            .await
            .unwrap()
            .info
            .id;
    }

    let jobs = driver.jobs();
    assert_eq!(jobs.len(), JOB_HISTORY);
    assert!(jobs.iter().all(|j| j.id != first.info.id));
    assert_eq!(driver.last_job().unwrap().id, newest);
}

fn part_lines(dir: &Path) -> Vec<String> {
    let mut parts: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("part-"))
        })
        .collect();
    parts.sort();
    parts
        .iter()
        .flat_map(|p| {
            fs::read_to_string(p)
                .unwrap()
                .lines()
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect()
}

#[tokio::test]
async fn save_as_publica_particiones_y_success() {
    let tmp = tempfile::tempdir().unwrap();
    let input = write_input(tmp.path(), "in.txt", "a b a\nb c\n");
    let out = tmp.path().join("conteos");
    let out_str = out.to_string_lossy().into_owned();

    let driver = Driver::new(config());
    let mut g = Graph::new();
    let counts = wordcount::build_wordcount(&mut g, &input, 2).unwrap();
    let g = Arc::new(g);

    assert_eq!(driver.save_as(&g, counts, &out_str).await.unwrap(), 3);
    assert!(out.join("_SUCCESS").is_file());
    assert!(out.join("part-00000").is_file());
    assert!(out.join("part-00001").is_file());
    assert!(!out.join("_temporary").exists());

    let mut lines = part_lines(&out);
    lines.sort();
    assert_eq!(lines, vec!["a,2", "b,2", "c,1"]);

    // no se pisa una salida ya publicada
    let err = driver.save_as(&g, counts, &out_str).await.unwrap_err();
    assert_eq!(err.kind(), "StorageUnavailable");
    assert!(out.join("_SUCCESS").is_file());
}

#[tokio::test]
async fn save_as_fallido_no_deja_salida() {
    let tmp = tempfile::tempdir().unwrap();
    let input = write_input(tmp.path(), "in.txt", "a b a\nb c\n");
    let out = tmp.path().join("conteos");

    let faults = FaultPlan::new();
    faults.fail_task(1, 1, 10);
    let driver = Driver::new(config()).with_faults(faults);

    let mut g = Graph::new();
    let counts = wordcount::build_wordcount(&mut g, &input, 2).unwrap();
    let g = Arc::new(g);

    let err = driver
        .save_as(&g, counts, &out.to_string_lossy())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "TaskFailure");
    assert!(!out.exists());
}

#[tokio::test]
async fn explain_describe_las_etapas() {
    let tmp = tempfile::tempdir().unwrap();
    let log = write_input(tmp.path(), "access.log", "x GET /a 200\n");

    let driver = Driver::new(config());
    let mut g = Graph::new();
    let top = toppages::build_toppages(&mut g, &log, 2).unwrap();

    let plan = driver.explain(&g, top).unwrap();
    assert!(plan.contains("3 etapas"));
    assert!(plan.contains("sort_by(descending=true)"));
}

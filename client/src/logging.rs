use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "client=info,master=info,worker=info";

/// Logs a stderr; stdout queda para los resultados.
/// Prioridad del filtro: `--log-level`, después `RUST_LOG`, después el default.
pub fn init(level: Option<&str>) {
    let filter = match level {
        Some(l) => EnvFilter::new(l),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

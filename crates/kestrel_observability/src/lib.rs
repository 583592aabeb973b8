//! Observability setup: structured logging and Prometheus metrics for the
//! query engine.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber with structured logging.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kestrel=debug"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Initialize the Prometheus metrics exporter on `listen_addr`.
pub fn init_metrics(listen_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("Prometheus metrics endpoint on http://{}/metrics", addr);
    Ok(())
}

/// Record one evaluated query.
pub fn record_query_metrics(duration_us: u64, query_type: &str, success: bool) {
    metrics::counter!("kestrel_queries_total", "type" => query_type.to_string(), "success" => success.to_string()).increment(1);
    metrics::histogram!("kestrel_query_duration_us", "type" => query_type.to_string()).record(duration_us as f64);
}

/// Record one leaf query answered by a data source.
pub fn record_leaf_fetch(data_source: &str, rows: usize, duration_us: u64) {
    metrics::counter!("kestrel_leaf_fetches_total", "data_source" => data_source.to_string()).increment(1);
    metrics::histogram!("kestrel_leaf_rows", "data_source" => data_source.to_string()).record(rows as f64);
    metrics::histogram!("kestrel_leaf_fetch_duration_us", "data_source" => data_source.to_string())
        .record(duration_us as f64);
}

/// Record one compiled SQL statement.
pub fn record_sql_compile(dialect: &str, stages: usize) {
    metrics::counter!("kestrel_sql_compiles_total", "dialect" => dialect.to_string()).increment(1);
    metrics::histogram!("kestrel_sql_stages", "dialect" => dialect.to_string()).record(stages as f64);
}

/// Record a vector-vector combination whose key columns did not match.
pub fn record_key_mismatch() {
    metrics::counter!("kestrel_key_mismatch_total").increment(1);
}

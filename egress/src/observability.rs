use crate::config::{LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

const METRICS_PREFIX: &str = "egress";

/// Installs the global tracing subscriber. When a Sentry DSN is configured, errors are also
/// reported to Sentry; keep the returned guard alive for the lifetime of the process.
pub fn init_logging(logging: Option<&LoggingConfig>) -> Option<sentry::ClientInitGuard> {
    let guard = logging.map(|logging| {
        sentry::init((
            logging.sentry_dsn.as_str(),
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(true))
        .with(guard.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .init();

    guard
}

/// Installs the statsd recorder if metrics are configured and describes every metric.
pub fn init_metrics(metrics: Option<&MetricsConfig>) -> Result<(), String> {
    let Some(metrics) = metrics else {
        return Ok(());
    };

    let recorder = StatsdBuilder::from(metrics.statsd_host.clone(), metrics.statsd_port)
        .build(Some(METRICS_PREFIX))
        .map_err(|e| e.to_string())?;
    metrics::set_global_recorder(recorder).map_err(|e| e.to_string())?;

    shared::metrics_defs::describe_all(egress_router::metrics_defs::ALL_METRICS);
    shared::metrics_defs::describe_all(repo_store::metrics_defs::ALL_METRICS);

    tracing::info!(
        host = %metrics.statsd_host,
        port = metrics.statsd_port,
        "Reporting metrics to statsd"
    );
    Ok(())
}

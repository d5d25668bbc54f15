//! Demo entry point: runs the saga and consistency scenarios in-process.

mod scenarios;

use consistency::CoordinatorConfig;
use saga::EngineConfig;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() {
    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Load configuration
    let engine_config = EngineConfig::from_env();
    let coordinator_config = CoordinatorConfig::from_env();
    tracing::info!(
        source_service = %engine_config.source_service,
        lock_owner = %coordinator_config.lock_owner,
        "starting saga demo"
    );

    // 4. Run scenarios
    if let Err(err) = scenarios::run_sagas(engine_config).await {
        tracing::error!(error = %err, "saga scenario failed");
        std::process::exit(1);
    }
    if let Err(err) = scenarios::run_consistency(coordinator_config).await {
        tracing::error!(error = %err, "consistency scenario failed");
        std::process::exit(1);
    }

    // 5. Dump collected metrics
    println!("{}", metrics_handle.render());
}

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use ws_loadtest::{
    Config, HttpFixtureService, LoadTestOrchestrator, SysinfoLocator, WsTransport,
};

/// Expose the harness's own counters for scraping during long runs
fn setup_prometheus_exporter(addr: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = addr.parse()?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    info!("Prometheus exporter listening on {}", addr);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ws_loadtest=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment
    let config = Config::from_env();
    info!(
        "Loaded configuration: ws_url={}, api={}, connections={}, targets={}",
        config.ws_url,
        config.api_base_url,
        config.connections.total,
        config.fixture.target_count
    );
    info!(
        "Pressure: {:?} at one message per {:?} per agent, memory sampled every {:?}",
        config.pressure.duration, config.pressure.message_interval, config.monitor.interval
    );

    if let Some(ref addr) = config.metrics_addr {
        setup_prometheus_exporter(addr)?;
    }

    let transport = Arc::new(WsTransport::new(
        config.ws_url.clone(),
        config.route_key_field.clone(),
    ));
    let fixtures = Arc::new(HttpFixtureService::new(&config.api_base_url)?);
    let locator = Arc::new(SysinfoLocator::new());
    let output_dir = config.output_dir.clone();

    let orchestrator = LoadTestOrchestrator::new(config, fixtures, transport, locator);
    let report = orchestrator
        .run_with_shutdown(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => warn!("Received Ctrl+C, stopping the run"),
                Err(e) => {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        })
        .await;

    println!("{}", report);

    let paths = report.write_to(&output_dir)?;
    info!("Report written to {}", paths.json.display());
    info!("Summary written to {}", paths.text.display());
    if let Some(csv) = paths.memory_csv {
        info!("Memory samples written to {}", csv.display());
    }

    report.outcome()?;
    Ok(())
}

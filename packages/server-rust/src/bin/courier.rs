//! `courier`: runs a microservice wrapper or the gateway.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use courier_server::broker::Broker;
use courier_server::config::{load_or_write_default, BrokerConfig};
use courier_server::gateway::server as front_door;
use courier_server::network::HttpServer;
use courier_server::service::domain::GuessCounter;
use courier_server::{
    Dispatcher, GatewayConfig, GatewayService, IntakeManager, ServiceHost, Transport, WrapperConfig,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "courier", version)]
#[command(about = "Microservice wrapper and gateway over HTTP or a message broker")]
struct Args {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host the bundled microservices behind the configured intakes.
    Wrapper {
        #[arg(long, env = "COURIER_CONFIG", default_value = "wrapper.json")]
        config: PathBuf,
    },
    /// Run the front-line gateway.
    Gateway {
        #[arg(long, env = "COURIER_CONFIG", default_value = "gateway.json")]
        config: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn install_metrics(port: Option<u16>) -> anyhow::Result<()> {
    let Some(port) = port else {
        return Ok(());
    };
    PrometheusBuilder::new()
        .with_http_listener(SocketAddr::from(([0, 0, 0, 0], port)))
        .install()
        .context("failed to install metrics exporter")?;
    info!(port, "metrics exporter listening");
    Ok(())
}

#[cfg(feature = "amqp")]
async fn connect_broker(config: &BrokerConfig) -> anyhow::Result<Arc<dyn Broker>> {
    let broker = courier_server::broker::AmqpBroker::connect(config).await?;
    Ok(Arc::new(broker))
}

#[cfg(not(feature = "amqp"))]
async fn connect_broker(_config: &BrokerConfig) -> anyhow::Result<Arc<dyn Broker>> {
    anyhow::bail!("broker transport requires building with the `amqp` feature")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn run_wrapper(config: WrapperConfig) -> anyhow::Result<()> {
    install_metrics(config.metrics_port)?;

    let broker = if config.host_with_broker {
        Some(connect_broker(&config.broker).await?)
    } else {
        None
    };

    let dispatcher = Arc::new(Dispatcher::new());
    let intakes = IntakeManager::from_config(&config, &dispatcher, broker.clone());
    let host = ServiceHost::new(dispatcher, intakes)?;
    host.run(Arc::new(GuessCounter::default()))?;
    host.start().await?;
    info!(services = ?host.running_ids(), "wrapper running");

    shutdown_signal().await;

    let result = host.shutdown().await;
    if let Some(broker) = broker {
        broker.close().await;
    }
    result
}

async fn run_gateway(config: GatewayConfig) -> anyhow::Result<()> {
    install_metrics(config.metrics_port)?;

    let broker = match config.transport {
        Transport::Broker => Some(connect_broker(&config.broker).await?),
        Transport::Http => None,
    };

    let service = GatewayService::start(&config, broker.clone()).await?;

    let mut server = HttpServer::new(front_door::http_config(&config));
    let addr = server.start().await?;
    let router = front_door::router(service.gateway(), server.shutdown_controller());
    info!(%addr, "gateway listening");
    server.serve(router, shutdown_signal()).await?;

    service.stop().await;
    if let Some(broker) = broker {
        broker.close().await;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    match args.command {
        Command::Wrapper { config } => run_wrapper(load_or_write_default(&config)?).await,
        Command::Gateway { config } => run_gateway(load_or_write_default(&config)?).await,
    }
}

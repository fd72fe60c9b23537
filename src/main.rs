//! `ramqp` command line client
//!
//! Publishes, consumes and declares topology against the broker described
//! by a TOML configuration file.

use clap::{Parser, Subcommand};
use resilient_amqp::config::ClientConfig;
use resilient_amqp::consumer::{handler_fn, ConsumeError, ConsumerConfig, ConsumerPool};
use resilient_amqp::dead_letter::DeadLetterSink;
use resilient_amqp::observability::{init_default_logging, init_logging, metrics, LogFormat};
use resilient_amqp::protocol::PublishRequest;
use resilient_amqp::publisher::Publisher;
use resilient_amqp::supervisor::ConnectionSupervisor;
use resilient_amqp::transport::amqp::AmqpConnector;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};

/// Resilient AMQP client
#[derive(Parser)]
#[command(name = "ramqp")]
#[command(about = "Publish and consume AMQP messages with supervised reconnects")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "RAMQP_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish one message
    Publish {
        /// Target exchange ("" for the default exchange)
        #[arg(short, long, default_value = "")]
        exchange: String,

        /// Routing key
        #[arg(short, long)]
        routing_key: String,

        /// Header as KEY=VALUE, repeatable
        #[arg(short = 'H', long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,

        /// Per-message TTL in milliseconds
        #[arg(long)]
        expiration_ms: Option<u64>,

        /// Read the body from a file instead of the argument
        #[arg(short, long, value_name = "FILE", conflicts_with = "body")]
        file: Option<PathBuf>,

        /// Message body
        body: Option<String>,
    },
    /// Consume a queue and log every delivery
    Consume {
        /// Queue to consume; overrides the [consumer] section
        #[arg(short, long)]
        queue: Option<String>,

        /// Number of workers; overrides the [consumer] section
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Declare the exchanges and queues of the [topology] section
    Declare,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, LogFormat::Pretty, false),
        _ => init_logging(Level::TRACE, LogFormat::Pretty, true),
    }

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Publish {
            exchange,
            routing_key,
            headers,
            expiration_ms,
            file,
            body,
        } => {
            let body = match read_body(file, body) {
                Ok(body) => body,
                Err(e) => {
                    error!("Failed to read message body: {}", e);
                    process::exit(1);
                }
            };
            let mut request = PublishRequest::new(exchange, routing_key, body)
                .with_headers(headers.into_iter().collect());
            if let Some(ms) = expiration_ms {
                request = request.with_expiration(Duration::from_millis(ms));
            }
            run_publish(config, request).await
        }
        Commands::Consume { queue, workers } => run_consume(config, queue, workers).await,
        Commands::Declare => run_declare(config).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(ClientConfig::load_from_file(path)?)
        }
        None => {
            for path_str in ["ramqp.toml", "config/ramqp.toml"] {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(ClientConfig::load_from_file(&path)?);
                }
            }
            Err("no configuration file found; pass -c/--config or create ramqp.toml".into())
        }
    }
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

fn read_body(file: Option<PathBuf>, body: Option<String>) -> std::io::Result<Vec<u8>> {
    match (file, body) {
        (Some(path), _) => std::fs::read(path),
        (None, Some(body)) => Ok(body.into_bytes()),
        (None, None) => Ok(Vec::new()),
    }
}

async fn connect(config: &ClientConfig) -> Result<ConnectionSupervisor, Box<dyn std::error::Error>> {
    let endpoint = config.endpoint()?;
    let supervisor = ConnectionSupervisor::connect(
        endpoint,
        Arc::new(AmqpConnector::new()),
        config.reconnect.clone(),
        config.initial_connect_timeout(),
    )
    .await?;
    Ok(supervisor)
}

fn build_publisher(config: &ClientConfig, supervisor: &ConnectionSupervisor) -> Publisher {
    let publisher = Publisher::new(supervisor.clone(), config.publish_retry.clone());
    match &config.broker.default_content_type {
        Some(content_type) => publisher.with_content_type(content_type.clone()),
        None => publisher,
    }
}

async fn run_publish(
    config: ClientConfig,
    request: PublishRequest,
) -> Result<(), Box<dyn std::error::Error>> {
    let supervisor = connect(&config).await?;
    let publisher = build_publisher(&config, &supervisor);

    let cancel = CancellationToken::new();
    let watcher = spawn_signal_watcher(cancel.clone())?;

    let result = publisher.publish(&cancel, request).await;
    watcher.abort();
    supervisor.shutdown().await;

    result?;
    info!("Message published");
    Ok(())
}

async fn run_consume(
    config: ClientConfig,
    queue: Option<String>,
    workers: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut consumer_config = match (config.consumer.clone(), queue) {
        (Some(consumer), Some(queue)) => ConsumerConfig { queue, ..consumer },
        (Some(consumer), None) => consumer,
        (None, Some(queue)) => ConsumerConfig::new(queue),
        (None, None) => return Err("no queue given and no [consumer] section configured".into()),
    };
    if let Some(workers) = workers {
        consumer_config = consumer_config.with_workers(workers);
    }
    consumer_config.validate()?;

    let supervisor = connect(&config).await?;
    let mut pool = ConsumerPool::new(
        supervisor.clone(),
        consumer_config,
        config.consume_retry.clone(),
    );
    if let Some(destination) = &config.dead_letter {
        let sink = DeadLetterSink::new(build_publisher(&config, &supervisor), destination.clone());
        pool = pool.with_dead_letter(sink);
    }

    let cancel = CancellationToken::new();
    let watcher = spawn_signal_watcher(cancel.clone())?;

    let handler = handler_fn(|_cancel, delivery| async move {
        info!(
            exchange = %delivery.exchange,
            routing_key = %delivery.routing_key,
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.redelivered,
            bytes = delivery.body.len(),
            body = %String::from_utf8_lossy(&delivery.body),
            "message received"
        );
        Ok(())
    });

    let result = pool.start(&cancel, handler).await;
    watcher.abort();
    supervisor.shutdown().await;

    let snapshot = metrics().snapshot();
    info!(
        received = snapshot.consume.deliveries_received,
        acked = snapshot.consume.acked,
        dead_lettered = snapshot.consume.dead_lettered,
        "Consumer stopped"
    );

    match result {
        Ok(()) | Err(ConsumeError::Cancelled) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn run_declare(config: ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    if config.topology.is_empty() {
        info!("No topology configured, nothing to declare");
        return Ok(());
    }

    let supervisor = connect(&config).await?;
    let result = supervisor.declare_topology(&config.topology).await;
    supervisor.shutdown().await;
    result?;

    info!(
        exchanges = config.topology.exchanges.len(),
        queues = config.topology.queues.len(),
        "Topology declared"
    );
    Ok(())
}

fn handle_config_command(config: ClientConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

/// Cancel `cancel` on the first SIGINT or SIGTERM
fn spawn_signal_watcher(
    cancel: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>, Box<dyn std::error::Error>> {
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
        }
        cancel.cancel();
    }))
}

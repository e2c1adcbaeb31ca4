//! mqtt-session - command-line driver for the TLS MQTT session
//!
//! Reads the broker settings from the environment (a `.env` file in the
//! working directory is loaded first) or from a TOML file.

use clap::{Parser, Subcommand};
use mqtt_session::config::ClientConfig;
use mqtt_session::identity;
use mqtt_session::observability::init_default_logging;
use mqtt_session::session::{ClientIdentity, PublishOutcome, Session};
use mqtt_session::transport::{InboundMessage, MqttTransport};
use std::path::{Path, PathBuf};
use std::process;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const DEMO_TOPIC: &str = "teste/status";
const DEMO_PAYLOAD: &str = "Hello World!";
const CONNECT_ATTEMPTS: u32 = 3;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// TLS MQTT client session
#[derive(Parser)]
#[command(name = "mqtt-session")]
#[command(about = "TLS MQTT client with acknowledged publish and subscribe")]
#[command(version)]
struct Cli {
    /// Configuration file path; the environment is used when omitted
    #[arg(short, long, value_name = "FILE", env = "MQTT_SESSION_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, subscribe, publish a retained greeting and disconnect
    Demo,
    /// Publish one message and wait for its acknowledgement
    Publish {
        #[arg(short, long)]
        topic: String,
        #[arg(short, long)]
        payload: String,
        #[arg(short, long, default_value_t = 1)]
        qos: u8,
        #[arg(short, long)]
        retain: bool,
    },
    /// Subscribe and print messages until interrupted
    Listen {
        #[arg(short, long)]
        topic: String,
        #[arg(short, long, default_value_t = 1)]
        qos: u8,
        /// Exit after this many messages
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },
    /// Validate configuration
    Config {
        /// Show the resolved configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    // A missing .env is fine; variables may come from the real environment
    if let Err(e) = dotenvy::dotenv_override() {
        if !e.not_found() {
            eprintln!("Failed to load .env: {e}");
        }
    }

    let cli = Cli::parse();
    init_default_logging();

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Demo => run_demo(&config).await,
        Commands::Publish {
            topic,
            payload,
            qos,
            retain,
        } => run_publish(&config, &topic, payload, qos, retain).await,
        Commands::Listen { topic, qos, count } => run_listen(&config, &topic, qos, count).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(path: Option<&Path>) -> CliResult<ClientConfig> {
    match path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(ClientConfig::load_from_file(path)?)
        }
        None => Ok(ClientConfig::from_env()?),
    }
}

fn build_session(config: &ClientConfig) -> CliResult<Session<MqttTransport>> {
    let machine_id = identity::load_or_create(&config.client.machine_id_file)?;
    let identity = ClientIdentity::from_config(config, &machine_id)?;
    info!(client_id = %identity.client_id, host = %identity.host, port = identity.port, "Session configured");

    let transport = MqttTransport::new(&identity.client_id)
        .with_reconnect_policy(config.session.reconnect_policy());
    Ok(Session::new(identity, transport)?)
}

/// Connect, retrying failures that may clear up on their own
async fn connect(session: &Session<MqttTransport>, config: &ClientConfig) -> CliResult<()> {
    let settings = &config.session;
    let mut attempt = 1;
    loop {
        match session
            .connect(settings.keepalive(), settings.connect_timeout())
            .await
        {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt < CONNECT_ATTEMPTS => {
                warn!(attempt, "Connect failed, retrying: {}", e);
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Disconnect regardless of how the command ended
async fn finish(session: &Session<MqttTransport>, result: CliResult<()>) -> CliResult<()> {
    if let Err(e) = session.disconnect().await {
        warn!("Disconnect failed: {}", e);
    }
    result
}

async fn run_demo(config: &ClientConfig) -> CliResult<()> {
    let session = build_session(config)?;
    let result = demo_sequence(&session, config).await;
    finish(&session, result).await
}

async fn demo_sequence(session: &Session<MqttTransport>, config: &ClientConfig) -> CliResult<()> {
    let timeout = config.session.operation_timeout();
    connect(session, config).await?;

    let ack = session.subscribe(DEMO_TOPIC, 1, timeout).await?;
    info!(topic = DEMO_TOPIC, mid = ack.mid, granted = ?ack.granted_qos(), "Subscribed");

    let outcome = session
        .publish(DEMO_TOPIC, DEMO_PAYLOAD, 1, true, timeout)
        .await?;
    report_publish(DEMO_TOPIC, &outcome)?;

    match session.wait_for_message(timeout).await {
        Some(message) => print_message(&message),
        None => warn!(topic = DEMO_TOPIC, ?timeout, "No message received"),
    }
    Ok(())
}

async fn run_publish(
    config: &ClientConfig,
    topic: &str,
    payload: String,
    qos: u8,
    retain: bool,
) -> CliResult<()> {
    let session = build_session(config)?;
    let result = async {
        connect(&session, config).await?;
        let outcome = session
            .publish(topic, payload, qos, retain, config.session.operation_timeout())
            .await?;
        report_publish(topic, &outcome)
    }
    .await;
    finish(&session, result).await
}

async fn run_listen(
    config: &ClientConfig,
    topic: &str,
    qos: u8,
    count: Option<usize>,
) -> CliResult<()> {
    let session = build_session(config)?;
    let result = listen(&session, config, topic, qos, count).await;
    finish(&session, result).await
}

async fn listen(
    session: &Session<MqttTransport>,
    config: &ClientConfig,
    topic: &str,
    qos: u8,
    count: Option<usize>,
) -> CliResult<()> {
    let (tx, mut rx) = mpsc::channel::<InboundMessage>(64);
    session.set_message_sender(tx);

    connect(session, config).await?;
    session
        .subscribe(topic, qos, config.session.operation_timeout())
        .await?;
    info!(topic, "Listening, press Ctrl-C to stop");

    let mut received = 0usize;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            message = rx.recv() => {
                let Some(message) = message else { break };
                print_message(&message);
                received += 1;
                if count.is_some_and(|limit| received >= limit) {
                    break;
                }
            }
        }
    }
    Ok(())
}

fn report_publish(topic: &str, outcome: &PublishOutcome) -> CliResult<()> {
    match outcome {
        PublishOutcome::Acknowledged { mid } => {
            info!(topic, mid, "Publish acknowledged");
            Ok(())
        }
        PublishOutcome::Timeout => {
            // Delivery may still happen; report but do not fail
            warn!(topic, "Publish not acknowledged in time");
            Ok(())
        }
        PublishOutcome::NotConnected => Err("publish attempted while not connected".into()),
        PublishOutcome::SendFailed(reason) => Err(format!("publish failed: {reason}").into()),
    }
}

fn print_message(message: &InboundMessage) {
    println!(
        "{} [{}{}] {}",
        message.received_at.to_rfc3339(),
        message.topic,
        if message.retain { ", retained" } else { "" },
        message.payload_str()
    );
}

fn handle_config_command(config: &ClientConfig, show: bool) -> CliResult<()> {
    if show {
        println!("{}", toml::to_string_pretty(config)?);
        match config.credentials() {
            Ok((username, _)) => println!("# credentials: {username} / ***"),
            Err(e) => println!("# credentials: {e}"),
        }
    }

    info!("Configuration validation complete");
    Ok(())
}

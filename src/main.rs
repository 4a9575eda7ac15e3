use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kiosk_link::config::ConfigStore;
use kiosk_link::datachannel::ChannelState;
use kiosk_link::events::EventBus;
use kiosk_link::kiosk::KioskResponder;
use kiosk_link::negotiation::{ConnectionState, CounterSession};
use kiosk_link::peer::RtcPeerFactory;
use kiosk_link::signaling::MemoryHub;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// kiosk-link command line arguments
#[derive(Parser, Debug)]
#[command(name = "kiosk-link")]
#[command(version, about = "Counter-to-kiosk WebRTC loopback demo", long_about = None)]
struct CliArgs {
    /// Configuration file (created with defaults when missing)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Session key to join (overrides config)
    #[arg(short = 's', long, value_name = "KEY")]
    session_key: Option<String>,

    /// Negotiation timeout in milliseconds (overrides config)
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u32>,

    /// Text sent to the kiosk once the data channel is open
    #[arg(short = 'm', long, default_value = "hello kiosk")]
    message: String,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose, args.json_logs);

    tracing::info!("Starting kiosk-link v{}", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.unwrap_or_else(get_config_path);
    let config_store = ConfigStore::new(&config_path)
        .await
        .with_context(|| format!("loading {}", config_path.display()))?;
    tracing::info!("Configuration: {}", config_store.path().display());

    // CLI overrides apply to this run only
    let mut config = (*config_store.get()).clone();
    if let Some(key) = args.session_key {
        config.session_key = key;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.negotiation_timeout_ms = timeout_ms;
    }

    let hub = MemoryHub::new()
        .with_ice_servers(config.fallback_ice_servers.clone())
        .with_record_capacity(0);
    let kiosk_endpoint = hub.connect();
    hub.register_kiosk(config.session_key.clone(), kiosk_endpoint.id());
    let factory = Arc::new(RtcPeerFactory::new());

    let kiosk = KioskResponder::spawn(config.clone(), Arc::new(kiosk_endpoint), factory.clone());

    let events = EventBus::with_capacity(config.event_capacity as usize);
    let mut diagnostics = events.subscribe();
    tokio::spawn(async move {
        while let Ok(entry) = diagnostics.recv().await {
            match serde_json::to_string(&entry) {
                Ok(line) => tracing::debug!(target: "kiosk_link::diagnostics", "{}", line),
                Err(e) => tracing::warn!("Unserializable diagnostic entry: {}", e),
            }
        }
    });

    let session = CounterSession::spawn(
        uuid::Uuid::new_v4().to_string(),
        config.clone(),
        Arc::new(hub.connect()),
        factory,
        events,
    );

    let local_id = session.wait_ready().await?;
    tracing::info!("Counter ready as {}", local_id);
    session.start(&config.session_key).await?;

    let outcome = exchange(&session, &args.message, config.negotiation_timeout()).await;

    session.close().await;
    kiosk.close();

    match outcome {
        Ok(reply) => {
            println!("{}", reply);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Wait for the channel, send `message` and return the kiosk's reply
async fn exchange(
    session: &CounterSession,
    message: &str,
    limit: Duration,
) -> anyhow::Result<String> {
    let mut channel = session.channel_watch();
    let mut state = session.state_watch();

    let opened = tokio::time::timeout(limit, async {
        tokio::select! {
            open = channel.wait_for(|s| *s == ChannelState::Open) => open.is_ok(),
            _ = state.wait_for(|s| *s == ConnectionState::Closed) => false,
        }
    })
    .await
    .unwrap_or(false);
    if !opened {
        bail!("data channel did not open (state: {})", session.state());
    }

    let mut messages = session.message_watch();
    messages.borrow_and_update();
    session.send_message(message).await?;
    tracing::info!("Sent: {}", message);

    tokio::time::timeout(limit, messages.changed())
        .await
        .context("no reply from kiosk")?
        .context("session ended")?;
    session
        .last_received_message()
        .context("empty reply from kiosk")
}

fn init_logging(level: LogLevel, verbose_count: u8, json: bool) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    // Build filter string based on effective level
    let filter = match effective_level {
        LogLevel::Error => "kiosk_link=error,webrtc=error",
        LogLevel::Warn => "kiosk_link=warn,webrtc=warn",
        LogLevel::Info => "kiosk_link=info,webrtc=warn",
        LogLevel::Verbose => "kiosk_link=debug,webrtc=warn",
        LogLevel::Debug => "kiosk_link=debug,webrtc=info",
        LogLevel::Trace => "kiosk_link=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    if let Err(err) = result {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Get the configuration file path
fn get_config_path() -> PathBuf {
    // Check environment variable first
    if let Ok(path) = std::env::var("KIOSK_LINK_CONFIG") {
        return PathBuf::from(path);
    }

    PathBuf::from("kiosk-link.json")
}

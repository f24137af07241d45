//! Proctor Telemetry CLI
//!
//! Streams monitoring events for a session, watches the aggregate feed, or
//! runs the relay.

use clap::{Parser, Subcommand};
use proctor_telemetry::{
    config::Config,
    event::{Event, SCORE_UPDATE_TYPE},
    feed::{describe, FeedFilter, LiveFeed},
    producer::{seeded_rng, AnalysisProducer, AudioAnalyzer, GazeAnalyzer, ScreenMonitor},
    producer::{ScreenTrigger, SharedSink},
    risk::RiskStatus,
    stats::PipelineStats,
    transport::{Endpoint, Transport, TransportNotice, WsConnector},
    VERSION,
};
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "proctor")]
#[command(version = VERSION)]
#[command(about = "Real-time proctoring telemetry pipeline", long_about = None)]
struct Cli {
    /// Verbose logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Monitor a session and stream its events
    Monitor {
        /// Session identifier (random if not given)
        #[arg(long)]
        session: Option<String>,

        /// Base WebSocket URL (overrides the config file)
        #[arg(long)]
        endpoint: Option<String>,

        /// Seed for reproducible readings
        #[arg(long)]
        seed: Option<u64>,

        /// Disable gaze analysis
        #[arg(long)]
        no_gaze: bool,

        /// Disable audio analysis
        #[arg(long)]
        no_audio: bool,

        /// Read screen triggers from stdin, one per line
        #[arg(long)]
        screen_stdin: bool,
    },

    /// Watch every session through the dashboard stream
    Watch {
        /// Base WebSocket URL (overrides the config file)
        #[arg(long)]
        endpoint: Option<String>,

        /// Event type to show (all, eye_tracking, audio, screen, system)
        #[arg(long, default_value = "all")]
        filter: FeedFilter,
    },

    /// Run the relay server
    #[cfg(feature = "server")]
    Serve {
        /// Port to listen on (overrides the config file)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Show configuration
    Config {
        /// Write the effective configuration to the config file
        #[arg(long)]
        init: bool,
    },
}

/// Initialize tracing subscriber
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("proctor_telemetry=debug,proctor=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("proctor_telemetry=info,proctor=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = Config::load().unwrap_or_else(|e| {
        tracing::warn!("Could not load config, using defaults: {}", e);
        Config::default()
    });

    match cli.command {
        Commands::Monitor {
            session,
            endpoint,
            seed,
            no_gaze,
            no_audio,
            screen_stdin,
        } => {
            let options = MonitorOptions {
                session: session.unwrap_or_else(|| Uuid::new_v4().to_string()),
                endpoint: endpoint.unwrap_or_else(|| config.endpoint.clone()),
                seed: seed.or(config.producers.seed),
                gaze: !no_gaze,
                audio: !no_audio,
                screen_stdin,
            };
            cmd_monitor(&config, options).await
        }
        Commands::Watch { endpoint, filter } => {
            let endpoint = endpoint.unwrap_or_else(|| config.endpoint.clone());
            cmd_watch(&config, &endpoint, filter).await
        }
        #[cfg(feature = "server")]
        Commands::Serve { port } => cmd_serve(&config, port).await,
        Commands::Config { init } => cmd_config(&config, init),
    }
}

struct MonitorOptions {
    session: String,
    endpoint: String,
    seed: Option<u64>,
    gaze: bool,
    audio: bool,
    screen_stdin: bool,
}

async fn cmd_monitor(config: &Config, options: MonitorOptions) -> anyhow::Result<()> {
    println!("Proctor Telemetry v{VERSION}");
    println!();
    println!("Session: {}", options.session);
    println!(
        "  Gaze: {}",
        if options.gaze { "enabled" } else { "disabled" }
    );
    println!(
        "  Audio: {}",
        if options.audio { "enabled" } else { "disabled" }
    );
    println!(
        "  Screen triggers: {}",
        if options.screen_stdin {
            "stdin"
        } else {
            "disabled"
        }
    );
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let stats = Arc::new(PipelineStats::new());

    let (transport, mut channels) = Transport::spawn(
        WsConnector::new(config.transport.outbound_buffer),
        &options.endpoint,
        Endpoint::Session(options.session.clone()),
        config.transport.transport_config(),
    );
    tracing::info!("Streaming to {}", transport.url());
    transport.connect();

    let (events_tx, mut events) = mpsc::unbounded_channel::<Event>();
    let sink: SharedSink = Arc::new(events_tx);

    let mut gaze = options.gaze.then(|| {
        AnalysisProducer::new(
            GazeAnalyzer::new(),
            options.session.clone(),
            config.producers.gaze_interval,
            sink.clone(),
            seeded_rng(options.seed),
        )
    });
    // Distinct stream per producer so a fixed seed doesn't correlate them
    let mut audio = options.audio.then(|| {
        AnalysisProducer::new(
            AudioAnalyzer::new(),
            options.session.clone(),
            config.producers.audio_interval,
            sink.clone(),
            seeded_rng(options.seed.map(|s| s.wrapping_add(1))),
        )
    });
    let mut screen = ScreenMonitor::new(options.session.clone(), sink.clone());

    let (triggers_tx, mut triggers) = mpsc::unbounded_channel::<ScreenTrigger>();
    if options.screen_stdin {
        screen.start();
        tokio::spawn(read_triggers(triggers_tx));
    } else {
        drop(triggers_tx);
    }
    if let Some(producer) = gaze.as_mut() {
        producer.start();
    }
    if let Some(producer) = audio.as_mut() {
        producer.start();
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                println!();
                println!("Stopping...");
                break;
            }
            Some(event) = events.recv() => {
                stats.record_produced();
                let ok = transport.send(&event).await;
                stats.record_send(ok);
            }
            Some(trigger) = triggers.recv() => {
                screen.observe(trigger);
            }
            Some(message) = channels.messages.recv() => {
                stats.record_received();
                tracing::debug!("Received {} message", message.kind);
            }
            Some(notice) = channels.notices.recv() => {
                report_notice(&notice, &stats);
            }
        }
    }

    if let Some(producer) = gaze.as_mut() {
        producer.stop();
    }
    if let Some(producer) = audio.as_mut() {
        producer.stop();
    }
    screen.stop();

    // Flush the stop announcements
    while let Ok(event) = events.try_recv() {
        stats.record_produced();
        let ok = transport.send(&event).await;
        stats.record_send(ok);
    }
    transport.disconnect().await;

    println!();
    println!("{}", stats.summary());
    Ok(())
}

/// Forward parsed stdin lines as screen triggers.
async fn read_triggers(triggers: mpsc::UnboundedSender<ScreenTrigger>) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match line.parse::<ScreenTrigger>() {
                Ok(trigger) => {
                    if triggers.send(trigger).is_err() {
                        return;
                    }
                }
                Err(e) => eprintln!("{e}"),
            },
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Failed to read stdin: {}", e);
                return;
            }
        }
    }
}

fn report_notice(notice: &TransportNotice, stats: &PipelineStats) {
    match notice {
        TransportNotice::Connected => println!("Connected"),
        TransportNotice::Reconnected { attempts } => {
            stats.record_reconnect();
            println!("Reconnected after {attempts} attempt(s)");
        }
        TransportNotice::Reconnecting { attempt, max } => {
            println!("Connection lost, reconnecting ({attempt}/{max})...");
        }
        TransportNotice::ReconnectExhausted { max } => {
            eprintln!("Could not reconnect after {max} attempts");
        }
        TransportNotice::SendFailed { reason } => {
            tracing::warn!("Send failed: {}", reason);
        }
        TransportNotice::Alert { message } => {
            stats.record_alert();
            println!("ALERT: {message}");
        }
    }
}

async fn cmd_watch(config: &Config, endpoint: &str, filter: FeedFilter) -> anyhow::Result<()> {
    println!("Proctor Telemetry v{VERSION}");
    println!();
    println!("Watching all sessions (filter: {filter})");
    println!("Press Ctrl+C to stop");
    println!();

    let (transport, mut channels) = Transport::spawn(
        WsConnector::new(config.transport.outbound_buffer),
        endpoint,
        Endpoint::Dashboard,
        config.transport.transport_config(),
    );
    transport.connect();

    let mut feed = LiveFeed::new(config.feed.max_events);
    feed.set_filter(filter);
    let mut ledger = config.risk.ledger();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some(message) = channels.messages.recv() => {
                if message.kind == SCORE_UPDATE_TYPE {
                    tracing::debug!("Relay score update: {}", message.data);
                    continue;
                }
                let Some(event) = Event::from_wire(message) else {
                    continue;
                };

                let assessment = ledger.record(&event);
                if feed.filter().matches(&event) {
                    println!("[{}] {}", event.session_id(), describe(&event));
                }
                if assessment.delta > 0 && assessment.status > RiskStatus::Normal {
                    println!(
                        "  {} score {} ({}): {}",
                        assessment.session_id,
                        assessment.score,
                        assessment.status,
                        assessment.flags.join(", ")
                    );
                }
                feed.ingest(event);
            }
            Some(notice) = channels.notices.recv() => match notice {
                TransportNotice::Connected => println!("Connected to {}", transport.url()),
                TransportNotice::Reconnecting { attempt, max } => {
                    println!("Connection lost, reconnecting ({attempt}/{max})...");
                }
                TransportNotice::ReconnectExhausted { max } => {
                    eprintln!("Could not reconnect after {max} attempts");
                }
                other => tracing::debug!("{:?}", other),
            },
        }
    }

    transport.disconnect().await;
    println!();
    println!(
        "Events seen: {} ({} shown in window)",
        feed.total_ingested(),
        feed.presented_len()
    );
    Ok(())
}

#[cfg(feature = "server")]
async fn cmd_serve(config: &Config, port: Option<u16>) -> anyhow::Result<()> {
    use proctor_telemetry::server::{run, ServerConfig};

    let server_config = ServerConfig::new(
        port.unwrap_or(config.server.port),
        config.risk.thresholds(),
        config.risk.window,
    )
    .with_patterns(config.risk.patterns);
    let (addr, shutdown) = run(server_config).await?;

    println!("Proctor Telemetry relay v{VERSION}");
    println!("  Sessions:  ws://{addr}/ws/<session_id>");
    println!("  Dashboard: ws://{addr}/ws/dashboard");
    println!();
    println!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    let _ = shutdown.send(());
    Ok(())
}

fn cmd_config(config: &Config, init: bool) -> anyhow::Result<()> {
    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!("{}", serde_json::to_string_pretty(config)?);

    if init {
        config.save()?;
        println!();
        println!("Written to {:?}", Config::config_path());
    }
    Ok(())
}

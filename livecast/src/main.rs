mod commands;
mod transport_udp;

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use livecast_core::config::{load_config, Config};
use livecast_core::logging::init_logging;
use livecast_core::models::{EncodeProfile, PlaybackRequest};
use livecast_core::resolver::{DirectUrlResolver, Resolver};
use livecast_core::Result;
use livecast_relay::pipeline::FfmpegRunner;
use livecast_relay::session::{EnqueueOutcome, SessionManager};
use livecast_relay::status::StatusSink;

use commands::Command;
use transport_udp::UdpTransport;

#[derive(Parser)]
#[command(name = "livecast", about = "Relay video into live destination channels")]
struct Args {
    /// Path to a TOML config file (falls back to ./livecast.toml, then
    /// environment variables).
    #[arg(long)]
    config: Option<String>,

    /// Override the configured log level.
    #[arg(long)]
    log_level: Option<String>,
}

/// Presence sink for the console: state strings land in the log.
struct PresenceLog;

#[async_trait]
impl StatusSink for PresenceLog {
    async fn publish(&self, emoji: &str, text: &str) -> Result<()> {
        info!(target: "livecast::presence", "{emoji} {text}");
        Ok(())
    }
}

type Manager = SessionManager<UdpTransport, FfmpegRunner, PresenceLog>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path).with_context(|| format!("loading {path}"))?,
        None => load_config()?,
    };
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Err(errors) = config.validate() {
        anyhow::bail!("invalid configuration: {}", errors.join("; "));
    }

    init_logging(&config.logging)?;
    info!("livecast starting");

    let transport = Arc::new(UdpTransport::new(config.transport.clone()));
    let runner = Arc::new(FfmpegRunner::new(config.pipeline.clone()));
    let profile = EncodeProfile::from(&config.stream);
    let manager: Manager = SessionManager::new(
        transport,
        runner,
        Arc::new(PresenceLog),
        config.session.clone(),
        profile,
    );
    let resolver = DirectUrlResolver;

    println!("{}", commands::USAGE);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("reading stdin")? {
                    None => break,
                    Some(line) => match commands::parse(&line) {
                        None => {}
                        Some(Err(message)) => println!("✗ {message}"),
                        Some(Ok(Command::Quit)) => break,
                        Some(Ok(command)) => dispatch(&manager, &resolver, command).await,
                    },
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    info!("Shutting down, stopping all sessions");
    manager.stop_all().await;
    Ok(())
}

async fn dispatch(manager: &Manager, resolver: &DirectUrlResolver, command: Command) {
    match command {
        Command::Help => println!("{}", commands::USAGE),
        Command::Quit => {}
        Command::Play { destination, input } => match resolver.resolve(&input).await {
            Err(e) => println!("✗ {e}"),
            Ok(media) => {
                let request = PlaybackRequest::new(
                    media.kind,
                    media.locator,
                    media.title,
                    destination.channel_id.clone(),
                );
                match manager.enqueue(&destination, request).await {
                    Ok(EnqueueOutcome::Started) => println!("▶ starting on {destination}"),
                    Ok(EnqueueOutcome::Queued { position }) => {
                        println!("▶ queued at #{position} for {destination}");
                    }
                    Err(e) => println!("✗ {e}"),
                }
            }
        },
        Command::Stop { destination } => {
            match manager.session(&destination.server_id).stop().await {
                Ok(true) => println!("👋 stopped {}", destination.server_id),
                Ok(false) => println!("nothing playing on {}", destination.server_id),
                Err(e) => println!("✗ {e}"),
            }
        }
        Command::Volume {
            destination,
            percent,
        } => {
            match manager
                .session(&destination.server_id)
                .set_volume(percent)
                .await
            {
                Ok(stored) => println!("🔊 volume {stored}% on {}", destination.server_id),
                Err(e) => println!("✗ {e}"),
            }
        }
        Command::Status { destination } => {
            match manager.session(&destination.server_id).snapshot().await {
                Ok(snapshot) => {
                    println!(
                        "{}: {}{}",
                        destination.server_id,
                        snapshot.state,
                        snapshot
                            .current_title
                            .as_deref()
                            .map(|t| format!(" — {t}"))
                            .unwrap_or_default()
                    );
                    for (i, title) in snapshot.queued_titles.iter().enumerate() {
                        println!("  {}. {title}", i + 1);
                    }
                    println!("  volume: {}%", snapshot.volume_percent);
                }
                Err(e) => println!("✗ {e}"),
            }
        }
    }
}

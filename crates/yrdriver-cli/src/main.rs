//! yrdriver - command-line front end for game automation sessions.
//!
//! `watch` keeps a session against a live game process running and reports its
//! progress; `peer` serves a synthetic game on a local port so automation
//! scripts can be rehearsed without one.

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use yrdriver::{ChannelConfig, LoopState, LoopbackPeer, SessionConfig, Stage, SyncLoop, SyntheticGame};

#[derive(Parser, Debug)]
#[command(name = "yrdriver")]
#[command(about = "Drive and observe a live game process over its command endpoint")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Run the synchronization loop against a game and report its state
    Watch(WatchArgs),
    /// Serve a synthetic game on a local port
    Peer(PeerArgs),
}

#[derive(ClapArgs, Debug)]
struct WatchArgs {
    /// Host of the game's command endpoint
    #[arg(long, default_value = ChannelConfig::DEFAULT_HOST)]
    host: String,

    /// Port of the game's command endpoint
    #[arg(short, long, default_value_t = ChannelConfig::DEFAULT_PORT)]
    port: u16,

    /// State fetch frequency in Hz (clamped to 1..=60)
    #[arg(short, long, default_value_t = yrdriver::LoopConfig::DEFAULT_FREQUENCY)]
    frequency: u32,

    /// Deadline for one state fetch, in milliseconds
    #[arg(long, default_value_t = 5000)]
    fetch_timeout: u64,

    /// Timeout carried by blocking polls, in milliseconds
    #[arg(long, default_value_t = 5000)]
    poll_timeout: u64,

    /// Wait this many seconds for the match to begin before reporting
    #[arg(long)]
    wait_begin: Option<u64>,

    /// Seconds between progress reports
    #[arg(long, default_value_t = 5)]
    report_every: u64,
}

#[derive(ClapArgs, Debug)]
struct PeerArgs {
    /// Host to bind to
    #[arg(long, default_value = ChannelConfig::DEFAULT_HOST)]
    host: String,

    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value_t = ChannelConfig::DEFAULT_PORT)]
    port: u16,

    /// Switch the synthetic game to exit once this frame is reached
    #[arg(long)]
    exit_after: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match args.mode {
        Mode::Watch(watch) => run_watch(watch).await,
        Mode::Peer(peer) => run_peer(peer).await,
    }
}

async fn run_watch(args: WatchArgs) -> Result<()> {
    let config = SessionConfig::new(args.host, args.port)
        .with_frequency(args.frequency)
        .with_fetch_timeout(Duration::from_millis(args.fetch_timeout))
        .with_poll_timeout(Duration::from_millis(args.poll_timeout));
    if config.frequency != args.frequency {
        warn!("Frequency {} Hz clamped to {} Hz", args.frequency, config.frequency);
    }

    let session = SyncLoop::remote(config);
    session.start()?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    if let Some(secs) = args.wait_begin {
        let commands = session.commands();
        tokio::select! {
            begun = commands.wait_game_to_begin(Duration::from_secs(secs)) => {
                begun.context("waiting for the game to begin")?;
                info!("Game has begun");
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received, exiting");
                return session.stop().await.map_err(Into::into);
            }
        }
    }

    let mut report = tokio::time::interval(Duration::from_secs(args.report_every.max(1)));
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received, exiting");
                break;
            }
            _ = report.tick() => {
                let state = session.state();
                info!(
                    "Frame {} ({}), {} updates",
                    state.current_frame,
                    state.stage,
                    session.update_count()
                );
                if state.stage == Stage::ExitGame {
                    info!("Game is exiting");
                    break;
                }
                if session.loop_state() == LoopState::Stopped {
                    break;
                }
            }
        }
    }

    session.stop().await?;
    Ok(())
}

async fn run_peer(args: PeerArgs) -> Result<()> {
    let mut game = SyntheticGame::new();
    if let Some(frame) = args.exit_after {
        game = game.with_exit_after(frame);
    }

    let addr = format!("{}:{}", args.host, args.port);
    let mut handle = LoopbackPeer::start_on(&addr, Arc::new(game))
        .await
        .with_context(|| format!("binding synthetic game to {}", addr))?;

    // Printed for scripts that start the peer on an auto-assigned port.
    println!("PEER_PORT={}", handle.port());
    info!("Synthetic game serving on {}", handle.addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    handle.shutdown();

    Ok(())
}

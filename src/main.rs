use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Result};
use mipow_candle::*;
use tokio::time::Duration;
use tracing::{debug, info, instrument, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// MAC address (or platform id) of the candle
    #[arg(short, long, global = true)]
    address: Option<String>,

    /// Friendly name used in log output
    #[arg(short, long, global = true, default_value = "")]
    name: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List nearby BLE peripherals
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value_t = 5)]
        duration: u64,
    },
    /// Read and print the current state and identity
    Status,
    /// Turn the candle on with the last color, or warm white
    On,
    /// Turn the candle off
    Off,
    /// Set a static RGBW color
    Color {
        /// Red value (0-255)
        #[arg(short, long, default_value_t = 0)]
        red: u8,
        /// Green value (0-255)
        #[arg(short, long, default_value_t = 0)]
        green: u8,
        /// Blue value (0-255)
        #[arg(short, long, default_value_t = 0)]
        blue: u8,
        /// White value (0-255)
        #[arg(short, long, default_value_t = 255)]
        white: u8,
    },
    /// Run a firmware effect
    Effect {
        /// flash, pulse, colorloop, rainbow, candle or light
        effect: Effect,
        /// Effect step delay
        #[arg(short, long)]
        delay: Option<u8>,
        /// Repetitions, 0 repeats forever
        #[arg(short, long)]
        repetitions: Option<u8>,
        /// Pause between repetitions
        #[arg(short, long)]
        pause: Option<u8>,
    },
    /// Arm the sleep timer, or disarm it with 0
    Timer {
        /// Minutes until the candle turns itself off (0-1439)
        minutes: u16,
    },
    /// Poll the candle and print every state change
    Watch {
        /// Poll interval in seconds
        #[arg(short, long, default_value_t = 30)]
        interval: u64,
    },
}

/// Fallback color for `on` when nothing was set before
const WARM_WHITE: Rgbw = Rgbw::new(0, 0, 0, 255);

#[tokio::main]
#[instrument]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| EnvFilter::new("mipow_candle=info")),
        )
        .compact()
        .init();

    color_eyre::install()?;

    let cli = Cli::parse();
    debug!("Parsed command line arguments");

    let transport = Arc::new(BtleplugTransport::new().await?);

    if let Commands::Scan { duration } = cli.command {
        for candle in transport.scan(Duration::from_secs(duration)).await? {
            println!(
                "{}  {:>4}  {}",
                candle.address,
                candle
                    .rssi
                    .map(|rssi| rssi.to_string())
                    .unwrap_or_else(|| "?".into()),
                candle.name.as_deref().unwrap_or("")
            );
        }
        return Ok(());
    }

    let address = cli
        .address
        .ok_or_else(|| eyre!("--address is required for this command"))?;
    let session = CandleSession::new(address, cli.name, transport, SessionConfig::default());

    match cli.command {
        Commands::Scan { .. } => {}
        Commands::Status => {
            session.refresh().await?;
            print_status(&session);
        }
        Commands::On => {
            // Learn the current color first so `on` keeps it.
            session.refresh().await?;
            let update = if session.rgbw().is_off() {
                LightUpdate::new().color(WARM_WHITE)
            } else {
                LightUpdate::new().color(session.rgbw())
            };
            session.set_light(update).await?;
        }
        Commands::Off => {
            session.turn_off().await?;
        }
        Commands::Color {
            red,
            green,
            blue,
            white,
        } => {
            session
                .set_light(
                    LightUpdate::new()
                        .color(Rgbw::new(red, green, blue, white))
                        .effect(Effect::Light),
                )
                .await?;
        }
        Commands::Effect {
            effect,
            delay,
            repetitions,
            pause,
        } => {
            session.refresh().await?;
            let mut update = LightUpdate::new().effect(effect);
            update.delay = delay;
            update.repetitions = repetitions;
            update.pause = pause;
            if session.rgbw().is_off() {
                update = update.color(WARM_WHITE);
            }
            session.set_light(update).await?;
        }
        Commands::Timer { minutes } => {
            session.refresh().await?;
            let mut update = LightUpdate::new().timer_minutes(minutes);
            if session.rgbw().is_off() {
                update = update.color(WARM_WHITE);
            }
            session.set_light(update).await?;
        }
        Commands::Watch { interval } => {
            watch(&session, interval).await?;
        }
    }

    session.stop().await;
    Ok(())
}

fn print_status(session: &CandleSession) {
    let state = session.state();
    println!("name:     {}", session.name());
    println!("power:    {}", if state.power { "on" } else { "off" });
    println!(
        "color:    r={} g={} b={} w={}",
        state.red, state.green, state.blue, state.white
    );
    if let Some(level) = state.battery_level {
        println!("battery:  {level}%");
    }
    if let Some(identity) = session.device_identity() {
        if let Some(model) = identity.display_model() {
            println!("model:    {model}");
        }
        if let Some(manufacturer) = identity.manufacturer {
            println!("vendor:   {manufacturer}");
        }
        if let Some(version) = identity.sw_version {
            println!("firmware: {version}");
        }
    }
}

/// Poll until Ctrl+C
#[instrument(skip(session))]
async fn watch(session: &CandleSession, interval: u64) -> Result<()> {
    info!("Watching {} every {}s", session.name(), interval);
    let subscription = session.register_observer(|state| {
        println!(
            "{} power={} rgbw=({},{},{},{}) battery={}",
            state
                .updated_at
                .map(|at| at.format("%H:%M:%S").to_string())
                .unwrap_or_default(),
            if state.power { "on" } else { "off" },
            state.red,
            state.green,
            state.blue,
            state.white,
            state
                .battery_level
                .map(|level| format!("{level}%"))
                .unwrap_or_else(|| "?".into())
        );
    });

    let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = session.refresh().await {
                    warn!("Refresh failed: {}", e);
                }
                if session.should_back_off() {
                    warn!(
                        "{} unreachable for {} polls",
                        session.name(),
                        session.consecutive_failures()
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping watch");
                break;
            }
        }
    }

    subscription.unregister();
    Ok(())
}

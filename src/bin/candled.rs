use mipow_candle::*;
use std::{env, io};
use tracing_subscriber::EnvFilter;

fn parse_color(args: &str) -> Option<Rgbw> {
    let values: Vec<u8> = args
        .split(',')
        .map(|s| s.trim().parse().ok())
        .collect::<Option<_>>()?;
    match values[..] {
        [red, green, blue, white] => Some(Rgbw::new(red, green, blue, white)),
        [red, green, blue] => Some(Rgbw::new(red, green, blue, 0)),
        _ => None,
    }
}

fn reply(result: Result<()>) {
    match result {
        Ok(()) => println!("OK"),
        Err(e) => eprintln!("ERR {e}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| EnvFilter::new("mipow_candle=warn")),
        )
        .with_writer(io::stderr)
        .compact()
        .init();

    // Get a target id/mac address from command line arguments.
    let usage = "Usage: candled <id/mac address> [name]";
    let args: Vec<_> = env::args().collect();
    if args.len() < 2 {
        eprintln!("{usage}");
        std::process::exit(1);
    }
    if args[1] == "-h" || args[1] == "--help" {
        eprintln!("{usage}");
        std::process::exit(0);
    }
    let name = args.get(2).map(String::as_str).unwrap_or_default();

    let session = CandleSession::with_btleplug(&args[1], name).await?;
    println!("OK");

    // Mainloop: one command per line until stdin closes
    for line in io::stdin().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                eprintln!("ERR {e}");
                break;
            }
        };

        let (cmd, arg) = match line.trim().split_once(':') {
            Some((cmd, arg)) => (cmd, Some(arg)),
            None => (line.trim(), None),
        };
        match (cmd, arg) {
            ("refresh", None) => reply(session.refresh().await),
            ("status", None) => {
                let state = session.state();
                println!(
                    "OK power={} rgbw={},{},{},{} battery={} effect={} timer={}",
                    u8::from(state.power),
                    state.red,
                    state.green,
                    state.blue,
                    state.white,
                    state
                        .battery_level
                        .map(|level| level.to_string())
                        .unwrap_or_else(|| "-".into()),
                    session.effect(),
                    session.timer_minutes()
                );
            }
            ("power_off", None) => reply(session.turn_off().await),
            ("set_color", Some(arg)) => match parse_color(arg) {
                Some(color) => reply(
                    session
                        .set_light(LightUpdate::new().color(color).effect(Effect::Light))
                        .await,
                ),
                None => eprintln!("ERR Invalid color format. Use R,G,B,W (e.g., 255,0,0,0 for red)"),
            },
            ("set_effect", Some(arg)) => match arg.parse::<Effect>() {
                Ok(effect) => reply(session.set_light(LightUpdate::new().effect(effect)).await),
                Err(e) => eprintln!("ERR {e}"),
            },
            ("set_timer", Some(arg)) => match arg.trim().parse::<u16>() {
                Ok(minutes) => reply(
                    session
                        .set_light(LightUpdate::new().timer_minutes(minutes))
                        .await,
                ),
                Err(_) => eprintln!("ERR Timer must be a number of minutes"),
            },
            ("", None) => eprintln!("ERR No command given"),
            (other, _) => eprintln!("ERR Unknown command: {other}"),
        }
    }

    session.stop().await;
    Ok(())
}

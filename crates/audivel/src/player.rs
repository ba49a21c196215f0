//! Line-driven terminal player over [`PlaybackController`].

use std::io::Write;
use std::time::Duration;

use anyhow::Result;
use audivel_core::config::PlaybackConfig;
use audivel_core::format::clock;
use audivel_core::{MediaEngine, PlayState, PlaybackController, PlaybackState};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

/// One line of user input.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Toggle,
    Forward,
    Back,
    Seek(f64),
    Rate(f64),
    Quit,
    Help,
}

impl Command {
    pub fn parse(line: &str) -> Option<Command> {
        let mut parts = line.split_whitespace();
        let head = parts.next()?;
        let arg = parts
            .next()
            .and_then(|a| a.parse::<f64>().ok())
            .filter(|v| v.is_finite());
        match (head, arg) {
            ("p" | "play" | "pause", _) => Some(Command::Toggle),
            ("f", _) => Some(Command::Forward),
            ("b", _) => Some(Command::Back),
            ("s", Some(secs)) => Some(Command::Seek(secs)),
            ("r", Some(rate)) => Some(Command::Rate(rate)),
            ("q" | "quit", _) => Some(Command::Quit),
            ("h" | "?" | "help", _) => Some(Command::Help),
            _ => None,
        }
    }
}

const HELP: &str = "p play/pause · f/b skip · s <secs> seek · r <rate> speed · q quit";

pub fn status_line(state: &PlaybackState) -> String {
    let label = match state.play_state {
        PlayState::Idle => "idle",
        PlayState::Loading => "loading",
        PlayState::Ready => "paused",
        PlayState::Playing => "playing",
        PlayState::Ended => "ended",
    };
    let total = state
        .duration
        .map(clock)
        .unwrap_or_else(|| "--:--".to_string());
    let mut line = format!(
        "[{}] {} / {}  x{:.2}",
        label,
        clock(state.position),
        total,
        state.rate
    );
    if let Some(err) = &state.last_error {
        line.push_str(&format!("  ({})", err));
    }
    line
}

/// Load `url` and run the interactive loop until `q`, EOF or Ctrl-C.
pub async fn run<E: MediaEngine>(
    player: &PlaybackController<E>,
    url: &str,
    settings: &PlaybackConfig,
) -> Result<()> {
    let mut updates = player.subscribe();

    println!("Loading {}", url);
    let duration = player.load(url).await?;
    if (settings.default_rate - 1.0).abs() > f64::EPSILON {
        player.set_rate(settings.default_rate).await?;
    }
    println!("Duration {}.  {}", clock(duration), HELP);
    player.play().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = updates.borrow_and_update().clone();
                print!("\r{:<60}", status_line(&state));
                let _ = std::io::stdout().flush();
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match Command::parse(&line) {
                    Some(Command::Quit) => break,
                    Some(cmd) => {
                        if let Err(e) = apply(player, cmd, settings.skip_secs).await {
                            println!("\n{}", e);
                        }
                    }
                    None if line.trim().is_empty() => {}
                    None => println!("\n{}", HELP),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!();
    player.close().await?;
    info!("player: closed");
    Ok(())
}

async fn apply<E: MediaEngine>(
    player: &PlaybackController<E>,
    cmd: Command,
    skip_secs: f64,
) -> Result<()> {
    debug!("player: {:?}", cmd);
    match cmd {
        Command::Toggle => {
            if player.state().await.is_playing() {
                player.pause().await?;
            } else {
                player.play().await?;
            }
        }
        Command::Forward => {
            player.skip(skip_secs).await?;
        }
        Command::Back => {
            player.skip(-skip_secs).await?;
        }
        Command::Seek(secs) => {
            let target = Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX);
            player.seek(target).await?;
        }
        Command::Rate(rate) => player.set_rate(rate).await?,
        Command::Help => println!("\n{}", HELP),
        Command::Quit => {}
    }
    Ok(())
}

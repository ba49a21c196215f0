mod export;
mod mpv;
mod player;
mod playnote;

use anyhow::{Context, Result};
use audivel_core::config::{Config, API_KEY_ENV, USER_ID_ENV};
use audivel_core::format::eta;
use audivel_core::{
    ConversionRequest, JobController, JobState, PlaybackController, SourceRef, SubmitError,
    SynthesisStyle, VoiceId,
};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tracing::{error, info};

use crate::mpv::MpvEngine;
use crate::playnote::PlayNoteClient;

#[derive(Parser)]
#[command(name = "audivel", version, about = "Turn documents into two-voice narrations")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Convert a PDF (URL or local path) into a narration.
    Convert {
        source: String,
        /// First voice: `angelo`, `nia`, or a voice manifest id.
        #[arg(long, default_value = "angelo")]
        voice1: String,
        /// Second voice: `angelo`, `nia`, or a voice manifest id.
        #[arg(long, default_value = "nia")]
        voice2: String,
        /// podcast, executive-briefing, childrens-story or debate.
        #[arg(long, default_value = "podcast", value_parser = parse_style)]
        style: SynthesisStyle,
        /// Open the player once the narration is ready.
        #[arg(long)]
        play: bool,
        /// Save the narration as audio.wav in the downloads directory.
        #[arg(long)]
        save: bool,
    },
    /// Play an audio URL or local file.
    Play { url: String },
    /// Show where the configuration lives and what it contains.
    Config,
}

fn parse_style(raw: &str) -> Result<SynthesisStyle, String> {
    raw.parse()
}

fn parse_voice(raw: &str) -> VoiceId {
    match raw.trim().to_ascii_lowercase().as_str() {
        "angelo" => VoiceId::angelo(),
        "nia" => VoiceId::nia(),
        _ => VoiceId::new(raw.trim()),
    }
}

fn init_logging() -> Result<()> {
    let data_dir = audivel_core::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("audivel.log");
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    // RUST_LOG wins; keep HTTP client internals quiet by default.
    let log_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info,audivel=debug,audivel_core=debug,hyper_util=warn".to_string());
    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_env_filter(log_filter.as_str())
        .with_ansi(false)
        .init();

    eprintln!("audivel log: {}", log_path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    init_logging()?;
    info!("audivel starting");

    let config = Config::load().context("Failed to load config")?;

    match cli.command {
        Command::Convert {
            source,
            voice1,
            voice2,
            style,
            play,
            save,
        } => {
            let request = ConversionRequest::new(
                SourceRef::parse(&source),
                parse_voice(&voice1),
                parse_voice(&voice2),
                style,
            );
            convert(&config, request, play, save).await
        }
        Command::Play { url } => play_url(&config, &url).await,
        Command::Config => show_config(&config),
    }
}

async fn convert(config: &Config, request: ConversionRequest, play: bool, save: bool) -> Result<()> {
    if !config.playht.has_credentials() {
        anyhow::bail!(
            "Play.ht credentials missing: set {} and {} (or a .env file), or edit {}",
            API_KEY_ENV,
            USER_ID_ENV,
            Config::config_path().display()
        );
    }

    let client = PlayNoteClient::new(&config.playht)?;
    let jobs = JobController::with_policy(client, config.polling.policy());
    let mut states = jobs.observe_state().await;

    println!("Converting {} ({})", request.source(), request.style());
    match jobs.submit(request).await {
        Ok(handle) => info!("convert: job #{} submitted", handle.generation()),
        Err(SubmitError::InvalidSource(reason)) => anyhow::bail!("Invalid source: {}", reason),
        Err(e) => return Err(e.into()),
    }

    let mut finished: Option<JobState> = None;
    loop {
        tokio::select! {
            next = states.next() => {
                let Some(state) = next else { break };
                print_progress(&state);
                if state.is_terminal() {
                    finished = Some(state);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nCancelling...");
                jobs.cancel().await;
            }
        }
    }
    println!();

    match finished.unwrap_or(jobs.state().await) {
        JobState::Completed { audio_url } => {
            println!("Narration ready: {}", audio_url);
            let mut target = audio_url.clone();
            if save {
                let path = export::save_audio(&audio_url, &config.paths.downloads_dir).await?;
                println!("Saved to {}", path.display());
                target = path.to_string_lossy().into_owned();
            }
            if play {
                play_url(config, &target).await?;
            }
            Ok(())
        }
        JobState::Failed { kind, message } => {
            error!("convert: failed ({:?}): {}", kind, message);
            anyhow::bail!("Conversion failed: {}", message)
        }
        JobState::Cancelled => {
            println!("Conversion cancelled");
            Ok(())
        }
        other => anyhow::bail!("Conversion ended unexpectedly in {:?}", other),
    }
}

fn print_progress(state: &JobState) {
    use std::io::Write;

    let mut line = state.headline();
    if let JobState::InProgress { eta: Some(left), .. } = state {
        line.push_str(&format!(" · about {} left", eta(*left)));
    }
    print!("\r{:<72}", line);
    let _ = std::io::stdout().flush();
}

async fn play_url(config: &Config, url: &str) -> Result<()> {
    let player = PlaybackController::with_policy(MpvEngine::new(), config.playback.tick_policy());
    player::run(&player, url, &config.playback).await
}

fn show_config(config: &Config) -> Result<()> {
    let mut shown = config.clone();
    if !shown.playht.api_key.is_empty() {
        shown.playht.api_key = "********".to_string();
    }
    println!("# {}", Config::config_path().display());
    println!("{}", toml::to_string_pretty(&shown)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_voice() {
        assert_eq!(parse_voice("Angelo"), VoiceId::angelo());
        assert_eq!(parse_voice(" nia "), VoiceId::nia());
        assert_eq!(parse_voice("s3://custom/manifest.json").as_str(), "s3://custom/manifest.json");
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["audivel", "convert", "paper.pdf"]).unwrap();
        match cli.command {
            Command::Convert {
                source,
                voice1,
                voice2,
                style,
                play,
                save,
            } => {
                assert_eq!(source, "paper.pdf");
                assert_eq!(voice1, "angelo");
                assert_eq!(voice2, "nia");
                assert_eq!(style, SynthesisStyle::Podcast);
                assert!(!play && !save);
            }
            _ => panic!("expected convert"),
        }

        let cli = Cli::try_parse_from(["audivel", "convert", "x.pdf", "--style", "childrens_story"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Command::Convert { style: SynthesisStyle::ChildrensStory, .. }
        ));
        assert!(Cli::try_parse_from(["audivel", "convert", "x.pdf", "--style", "opera"]).is_err());
    }
}

//! Saving finished narrations next to the user's documents.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::info;

pub const AUDIO_FILE_NAME: &str = "audio.wav";

enum AudioSource {
    Remote(reqwest::Url),
    Local(PathBuf),
}

fn classify(audio_url: &str) -> Result<AudioSource> {
    let trimmed = audio_url.trim();
    if trimmed.contains("://") {
        let url = reqwest::Url::parse(trimmed)
            .with_context(|| format!("Invalid audio URL: {}", trimmed))?;
        return match url.scheme() {
            "http" | "https" => Ok(AudioSource::Remote(url)),
            "file" => url
                .to_file_path()
                .map(AudioSource::Local)
                .map_err(|_| anyhow::anyhow!("Invalid file URL: {}", trimmed)),
            other => anyhow::bail!("Unsupported audio URL scheme: {}", other),
        };
    }
    Ok(AudioSource::Local(PathBuf::from(trimmed)))
}

/// Store `audio_url` as `<dir>/audio.wav`, replacing any earlier export.
pub async fn save_audio(audio_url: &str, dir: &Path) -> Result<PathBuf> {
    let source = classify(audio_url)?;
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let dest = dir.join(AUDIO_FILE_NAME);
    if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
        tokio::fs::remove_file(&dest)
            .await
            .with_context(|| format!("Failed to remove old {}", dest.display()))?;
    }

    match source {
        AudioSource::Local(path) => {
            tokio::fs::copy(&path, &dest)
                .await
                .with_context(|| format!("Failed to copy {}", path.display()))?;
        }
        AudioSource::Remote(url) => download(url, &dest).await?,
    }

    info!("export: saved {} -> {}", audio_url, dest.display());
    Ok(dest)
}

async fn download(url: reqwest::Url, dest: &Path) -> Result<()> {
    let response = reqwest::get(url.clone())
        .await
        .with_context(|| format!("Failed to fetch {}", url))?
        .error_for_status()
        .with_context(|| format!("Audio download refused: {}", url))?;

    let mut file = tokio::fs::File::create(dest)
        .await
        .with_context(|| format!("Failed to create {}", dest.display()))?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Audio download interrupted")?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(())
}

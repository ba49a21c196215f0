use async_trait::async_trait;
use std::time::Duration;

/// The media engine behind the playback controller: one open, seekable audio
/// stream at a time.
///
/// Errors are plain `anyhow` errors; the controller turns them into
/// `PlaybackError`s.
#[async_trait]
pub trait MediaEngine: Send + 'static {
    /// Open `url` paused at the start and resolve its duration.
    async fn load(&mut self, url: &str) -> anyhow::Result<Duration>;

    async fn play(&mut self) -> anyhow::Result<()>;

    async fn pause(&mut self) -> anyhow::Result<()>;

    async fn seek(&mut self, to: Duration) -> anyhow::Result<()>;

    async fn set_rate(&mut self, rate: f64) -> anyhow::Result<()>;

    /// True media position.
    async fn position(&mut self) -> anyhow::Result<Duration>;

    /// True once the engine stopped on its own (end of stream).
    async fn is_stopped(&mut self) -> anyhow::Result<bool>;

    /// Close the media handle.
    async fn release(&mut self) -> anyhow::Result<()>;
}

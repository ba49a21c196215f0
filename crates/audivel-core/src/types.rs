use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::PlaybackError;

// ── conversion request ────────────────────────────────────────────────────────

/// The document to narrate: a remote URL or a local file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SourceRef {
    Url(String),
    File(PathBuf),
}

impl SourceRef {
    /// Treats anything with a `scheme://` prefix as a URL, everything else as a
    /// local path.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.contains("://") {
            SourceRef::Url(raw.to_string())
        } else {
            SourceRef::File(PathBuf::from(raw))
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceRef::Url(url) => f.write_str(url),
            SourceRef::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Remote voice identifier (for Play.ht, a voice manifest URL).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VoiceId(pub String);

impl VoiceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Male narrator used as the default first voice.
    pub fn angelo() -> Self {
        Self::new("s3://voice-cloning-zero-shot/baf1ef41-36b6-428c-9bdf-50ba54682bd8/original/manifest.json")
    }

    /// Female narrator used as the default second voice.
    pub fn nia() -> Self {
        Self::new("s3://voice-cloning-zero-shot/831bd330-85c6-4333-b2b4-10c476ea3491/original/manifest.json")
    }

    /// Short display name for the two bundled voices, falling back to the raw id.
    pub fn display_name(&self) -> &str {
        if *self == Self::angelo() {
            "Angelo"
        } else if *self == Self::nia() {
            "Nia"
        } else {
            &self.0
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VoiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SynthesisStyle {
    #[default]
    Podcast,
    ExecutiveBriefing,
    ChildrensStory,
    Debate,
}

impl SynthesisStyle {
    pub const ALL: [SynthesisStyle; 4] = [
        SynthesisStyle::Podcast,
        SynthesisStyle::ExecutiveBriefing,
        SynthesisStyle::ChildrensStory,
        SynthesisStyle::Debate,
    ];

    /// Wire name used by the conversion service.
    pub fn as_str(&self) -> &'static str {
        match self {
            SynthesisStyle::Podcast => "podcast",
            SynthesisStyle::ExecutiveBriefing => "executive-briefing",
            SynthesisStyle::ChildrensStory => "childrens-story",
            SynthesisStyle::Debate => "debate",
        }
    }
}

impl fmt::Display for SynthesisStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SynthesisStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|style| style.as_str() == wanted)
            .ok_or_else(|| format!("unknown synthesis style: {}", s))
    }
}

/// A conversion request.  Fields are private so a submitted request cannot
/// be altered afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionRequest {
    source: SourceRef,
    voice_1: VoiceId,
    voice_2: VoiceId,
    style: SynthesisStyle,
}

impl ConversionRequest {
    pub fn new(source: SourceRef, voice_1: VoiceId, voice_2: VoiceId, style: SynthesisStyle) -> Self {
        Self {
            source,
            voice_1,
            voice_2,
            style,
        }
    }

    pub fn source(&self) -> &SourceRef {
        &self.source
    }

    pub fn voice_1(&self) -> &VoiceId {
        &self.voice_1
    }

    pub fn voice_2(&self) -> &VoiceId {
        &self.voice_2
    }

    pub fn style(&self) -> SynthesisStyle {
        self.style
    }
}

// ── job state ─────────────────────────────────────────────────────────────────

/// Opaque job identity assigned by the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Coarse conversion stage derived from raw status text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Accepted by the service, no recognised status seen yet.
    Pending,
    Processing,
    Generating,
    Finalizing,
    Complete,
}

impl Phase {
    pub fn label(&self) -> &'static str {
        match self {
            Phase::Pending => "Waiting for the service",
            Phase::Processing => "Processing document",
            Phase::Generating => "Generating audio",
            Phase::Finalizing => "Finalizing narration",
            Phase::Complete => "Complete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Retry budget exhausted.
    Unreachable,
    /// The service reported an error.
    Remote,
    /// Completion reported without an audio URL.
    MalformedResponse,
}

/// Lifecycle of one conversion job.
///
/// Transitions only move forward:
///   Idle -> Submitting -> InProgress* -> Completed | Failed | Cancelled
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Idle,
    Submitting,
    InProgress {
        phase: Phase,
        /// 0.0 ..= 1.0
        progress: f64,
        eta: Option<Duration>,
    },
    Completed {
        audio_url: String,
    },
    Failed {
        kind: FailureKind,
        message: String,
    },
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed { .. } | JobState::Failed { .. } | JobState::Cancelled
        )
    }

    /// True while a job occupies the controller.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, JobState::Submitting | JobState::InProgress { .. })
    }

    pub fn progress(&self) -> f64 {
        match self {
            JobState::InProgress { progress, .. } => *progress,
            JobState::Completed { .. } => 1.0,
            _ => 0.0,
        }
    }

    /// One-line status text for a progress view.
    pub fn headline(&self) -> String {
        match self {
            JobState::Idle => "Ready".to_string(),
            JobState::Submitting => "Uploading document...".to_string(),
            JobState::InProgress { phase, progress, .. } => {
                format!("{} ({:.0}%)", phase.label(), progress * 100.0)
            }
            JobState::Completed { .. } => "Narration ready".to_string(),
            JobState::Failed { message, .. } => format!("Conversion failed: {}", message),
            JobState::Cancelled => "Conversion cancelled".to_string(),
        }
    }
}

/// Snapshot of the job owned by the controller.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionJob {
    pub id: Option<JobId>,
    pub state: JobState,
    pub last_raw_status: Option<String>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub cancelled: bool,
}

impl ConversionJob {
    pub(crate) fn new() -> Self {
        Self {
            id: None,
            state: JobState::Idle,
            last_raw_status: None,
            updated_at: chrono::Utc::now(),
            cancelled: false,
        }
    }
}

// ── playback state ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlayState {
    #[default]
    Idle,
    Loading,
    /// Loaded and paused.
    Ready,
    Playing,
    Ended,
}

/// Published playback state.  `position` never exceeds a known `duration`,
/// and `Ended` always sits at `position == duration`.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackState {
    pub url: Option<String>,
    pub position: Duration,
    pub duration: Option<Duration>,
    pub rate: f64,
    pub play_state: PlayState,
    pub last_error: Option<PlaybackError>,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            url: None,
            position: Duration::ZERO,
            duration: None,
            rate: 1.0,
            play_state: PlayState::Idle,
            last_error: None,
        }
    }
}

impl PlaybackState {
    pub fn is_playing(&self) -> bool {
        self.play_state == PlayState::Playing
    }
}

//! Core of the audivel narrator: turns a document into a two-voice narration
//! through a remote conversion service, and plays the result back.
//!
//! The two stateful pieces are [`job::JobController`] (submit, poll, cancel)
//! and [`playback::PlaybackController`] (load, play, pause, seek, rate).
//! Both own their state exclusively and publish it through subscriptions;
//! callers only send intents.

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod format;
pub mod job;
pub mod platform;
pub mod playback;
pub mod progress;
pub mod types;

pub use client::{RemoteConversionClient, RemoteStatus};
pub use engine::MediaEngine;
pub use error::{ClientError, PlaybackError, SubmitError};
pub use job::{JobController, JobHandle, JobStateStream, PollPolicy};
pub use playback::{PlaybackController, TickPolicy};
pub use types::{
    ConversionJob, ConversionRequest, FailureKind, JobId, JobState, Phase, PlayState,
    PlaybackState, SourceRef, SynthesisStyle, VoiceId,
};

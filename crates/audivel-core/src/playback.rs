//! Playback state machine on top of a [`MediaEngine`].
//!
//! ```text
//!   Idle ─load─► Loading ─metadata ok─► Ready ◄─pause── Playing
//!     ▲             │                     │  ──play──►    │
//!     └─metadata ───┘                     ▲               │ tick: pos >= duration
//!        failed                           └──seek── Ended ◄┘   and engine stopped
//!                                                    └──play──► Playing
//! ```
//!
//! Lock order is always `slot` before `engine`.  The tick task follows the
//! same order, so it can never deadlock against an intent.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::MediaEngine;
use crate::error::PlaybackError;
use crate::types::{PlayState, PlaybackState};

#[derive(Debug, Clone)]
pub struct TickPolicy {
    /// Position refresh period while playing.
    pub interval: Duration,
}

impl Default for TickPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
        }
    }
}

struct Slot {
    state: PlaybackState,
    /// Running tick task, if any.
    ticker: Option<CancellationToken>,
    /// Bumped on every `load`, so a stale metadata result can be ignored.
    load_seq: u64,
}

impl Slot {
    fn stop_ticker(&mut self) {
        if let Some(token) = self.ticker.take() {
            token.cancel();
        }
    }
}

pub struct PlaybackController<E: MediaEngine> {
    slot: Arc<Mutex<Slot>>,
    engine: Arc<Mutex<E>>,
    tx: Arc<watch::Sender<PlaybackState>>,
    policy: TickPolicy,
    /// Parent of every ticker token; cancelled on drop.
    shutdown: CancellationToken,
}

impl<E: MediaEngine> Drop for PlaybackController<E> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl<E: MediaEngine> PlaybackController<E> {
    pub fn new(engine: E) -> Self {
        Self::with_policy(engine, TickPolicy::default())
    }

    pub fn with_policy(engine: E, policy: TickPolicy) -> Self {
        let (tx, _) = watch::channel(PlaybackState::default());
        Self {
            slot: Arc::new(Mutex::new(Slot {
                state: PlaybackState::default(),
                ticker: None,
                load_seq: 0,
            })),
            engine: Arc::new(Mutex::new(engine)),
            tx: Arc::new(tx),
            policy,
            shutdown: CancellationToken::new(),
        }
    }

    /// Latest-value subscription to the playback state.
    pub fn subscribe(&self) -> watch::Receiver<PlaybackState> {
        self.tx.subscribe()
    }

    pub async fn state(&self) -> PlaybackState {
        self.slot.lock().await.state.clone()
    }

    /// Open `url` and resolve its duration.  Ends in `Ready` on success, or
    /// back in `Idle` with `last_error` set on failure.  A second call while
    /// the first is still resolving fails with `Busy`.
    pub async fn load(&self, url: &str) -> Result<Duration, PlaybackError> {
        let seq = {
            let mut slot = self.slot.lock().await;
            if slot.state.play_state == PlayState::Loading {
                return Err(PlaybackError::Busy);
            }
            slot.stop_ticker();
            slot.load_seq += 1;
            let rate = slot.state.rate;
            slot.state = PlaybackState {
                url: Some(url.to_string()),
                rate,
                play_state: PlayState::Loading,
                ..PlaybackState::default()
            };
            self.publish(&slot);
            slot.load_seq
        };
        info!("playback: loading {}", url);

        let loaded = {
            let mut engine = self.engine.lock().await;
            engine.load(url).await
        };

        let mut slot = self.slot.lock().await;
        if slot.load_seq != seq || slot.state.play_state != PlayState::Loading {
            debug!("playback: discarding stale load result for {}", url);
            return Err(PlaybackError::LoadFailed("superseded".to_string()));
        }
        match loaded {
            Ok(duration) => {
                let rate = slot.state.rate;
                if rate != 1.0 {
                    let mut engine = self.engine.lock().await;
                    if let Err(e) = engine.set_rate(rate).await {
                        warn!("playback: could not restore rate {}: {:#}", rate, e);
                    }
                }
                slot.state.duration = Some(duration);
                slot.state.position = Duration::ZERO;
                slot.state.play_state = PlayState::Ready;
                self.publish(&slot);
                info!("playback: ready, duration {:?}", duration);
                Ok(duration)
            }
            Err(e) => {
                let err = PlaybackError::LoadFailed(format!("{:#}", e));
                warn!("playback: {}", err);
                slot.state.play_state = PlayState::Idle;
                slot.state.duration = None;
                slot.state.position = Duration::ZERO;
                slot.state.last_error = Some(err.clone());
                self.publish(&slot);
                Err(err)
            }
        }
    }

    /// Start playing from `Ready` or `Ended`.  Returns `Ok(false)` when the
    /// call was a no-op.
    pub async fn play(&self) -> Result<bool, PlaybackError> {
        let mut slot = self.slot.lock().await;
        let from = slot.state.play_state;
        if !matches!(from, PlayState::Ready | PlayState::Ended) {
            debug!("playback: play ignored in {:?}", from);
            return Ok(false);
        }
        {
            let mut engine = self.engine.lock().await;
            if from == PlayState::Ended {
                engine.seek(Duration::ZERO).await?;
                if let Err(e) = engine.play().await {
                    // Rewound but not playing: Ended would contradict position 0.
                    slot.state.position = Duration::ZERO;
                    slot.state.play_state = PlayState::Ready;
                    self.publish(&slot);
                    return Err(e.into());
                }
                slot.state.position = Duration::ZERO;
            } else {
                engine.play().await?;
            }
        }
        slot.state.play_state = PlayState::Playing;
        slot.state.last_error = None;
        self.start_ticker(&mut slot);
        self.publish(&slot);
        info!("playback: playing from {:?}", slot.state.position);
        Ok(true)
    }

    /// Pause from `Playing`.  The published position stays at the last tick.
    pub async fn pause(&self) -> Result<bool, PlaybackError> {
        let mut slot = self.slot.lock().await;
        if slot.state.play_state != PlayState::Playing {
            debug!("playback: pause ignored in {:?}", slot.state.play_state);
            return Ok(false);
        }
        self.engine.lock().await.pause().await?;
        slot.stop_ticker();
        slot.state.play_state = PlayState::Ready;
        self.publish(&slot);
        info!("playback: paused at {:?}", slot.state.position);
        Ok(true)
    }

    /// Move to `to`, clamped into `[0, duration]`.  Rejected while the
    /// duration is unknown.  Leaves the play state alone, except that a seek
    /// out of `Ended` re-arms `Ready`.
    pub async fn seek(&self, to: Duration) -> Result<Duration, PlaybackError> {
        let mut slot = self.slot.lock().await;
        let Some(duration) = slot.state.duration else {
            debug!("playback: seek to {:?} rejected, duration unknown", to);
            return Err(PlaybackError::InvalidSeekTarget);
        };
        let target = to.min(duration);
        self.engine.lock().await.seek(target).await?;
        slot.state.position = target;
        if slot.state.play_state == PlayState::Ended {
            slot.state.play_state = PlayState::Ready;
        }
        self.publish(&slot);
        debug!("playback: seek to {:?}", target);
        Ok(target)
    }

    /// Relative seek, e.g. the ±15 s transport buttons.  Any delta is
    /// accepted; the target is clamped into `[0, duration]` and a NaN delta
    /// stays put.
    pub async fn skip(&self, delta_secs: f64) -> Result<Duration, PlaybackError> {
        let current = self.slot.lock().await.state.position;
        let target = if delta_secs.is_nan() {
            current
        } else {
            let secs = current.as_secs_f64() + delta_secs;
            if secs <= 0.0 {
                Duration::ZERO
            } else {
                Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
            }
        };
        self.seek(target).await
    }

    /// Change the playback speed.  Rejects non-positive rates.
    pub async fn set_rate(&self, rate: f64) -> Result<(), PlaybackError> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(PlaybackError::InvalidRate(rate));
        }
        let mut slot = self.slot.lock().await;
        if !matches!(slot.state.play_state, PlayState::Idle | PlayState::Loading) {
            self.engine.lock().await.set_rate(rate).await?;
        }
        slot.state.rate = rate;
        self.publish(&slot);
        debug!("playback: rate {}", rate);
        Ok(())
    }

    /// Release the media handle and go back to `Idle`.
    pub async fn close(&self) -> Result<(), PlaybackError> {
        let mut slot = self.slot.lock().await;
        slot.stop_ticker();
        slot.load_seq += 1;
        self.engine.lock().await.release().await?;
        let rate = slot.state.rate;
        slot.state = PlaybackState {
            rate,
            ..PlaybackState::default()
        };
        self.publish(&slot);
        info!("playback: closed");
        Ok(())
    }

    fn publish(&self, slot: &Slot) {
        self.tx.send_replace(slot.state.clone());
    }

    fn start_ticker(&self, slot: &mut Slot) {
        slot.stop_ticker();
        let token = self.shutdown.child_token();
        slot.ticker = Some(token.clone());

        let ticker = Ticker {
            slot: Arc::clone(&self.slot),
            engine: Arc::clone(&self.engine),
            tx: Arc::clone(&self.tx),
            token,
        };
        tokio::spawn(ticker.run(self.policy.interval));
    }
}

// ── tick task ─────────────────────────────────────────────────────────────────

struct Ticker<E: MediaEngine> {
    slot: Arc<Mutex<Slot>>,
    engine: Arc<Mutex<E>>,
    tx: Arc<watch::Sender<PlaybackState>>,
    token: CancellationToken,
}

impl<E: MediaEngine> Ticker<E> {
    async fn run(self, period: Duration) {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = interval.tick() => {}
            }
            if !self.tick().await {
                break;
            }
        }
        debug!("playback: tick task exiting");
    }

    /// One position refresh.  Returns `false` once ticking should stop.
    async fn tick(&self) -> bool {
        let mut slot = self.slot.lock().await;
        if self.token.is_cancelled() || slot.state.play_state != PlayState::Playing {
            return false;
        }

        let (position, stopped) = {
            let mut engine = self.engine.lock().await;
            let position = match engine.position().await {
                Ok(p) => p,
                Err(e) => {
                    warn!("playback: tick could not read position: {:#}", e);
                    return true;
                }
            };
            let stopped = engine.is_stopped().await.unwrap_or_else(|e| {
                warn!("playback: tick could not read engine status: {:#}", e);
                false
            });
            (position, stopped)
        };

        let duration = slot.state.duration.unwrap_or(position);
        slot.state.position = position.min(duration);

        let ended = slot.state.position >= duration && stopped;
        if ended {
            slot.state.position = duration;
            slot.state.play_state = PlayState::Ended;
            slot.ticker = None;
            info!("playback: reached the end at {:?}", duration);
        }
        self.tx.send_replace(slot.state.clone());
        !ended
    }
}

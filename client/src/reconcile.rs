//! Client-side playback reconciliation.
//!
//! Keeps the local media element in line with the room's authoritative
//! `(position, position_timestamp, playing)` triple: applies remote events
//! with latency compensation, measures drift on demand, performs the one-off
//! late-joiner sync once media is buffered, and filters out local media
//! callbacks that are merely echoes of remote corrections.

use crate::clock::{RoundTrip, ServerClock};
use crate::error::SyncError;
use crate::media::{MediaElement, MediaError, MediaEvent};
use crate::protocol::{PlaybackAction, RoomSnapshot, VideoEvent};
use crate::suppression::EchoGuard;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcileSettings {
    /// Drift beyond this is flagged as out of sync.
    pub drift_threshold_ms: f64,
    /// Echo window after applying a remote event or correction.
    pub remote_window_ms: i64,
    /// Echo window after the late-joiner initial sync.
    pub initial_window_ms: i64,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            drift_threshold_ms: 2000.0,
            remote_window_ms: 1000,
            initial_window_ms: 2000,
        }
    }
}

/// A user-originated media change that should be sent to the server.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalControl {
    pub action: PlaybackAction,
    pub position: f64,
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftReport {
    pub local: f64,
    pub expected: f64,
    /// Positive when we are ahead of the room.
    pub drift_ms: f64,
    pub in_sync: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcileStatus {
    pub in_sync: bool,
    pub drift_ms: f64,
    pub last_check: Option<i64>,
    pub needs_interaction: bool,
}

pub struct Reconciler<M> {
    media: M,
    settings: ReconcileSettings,
    guard: EchoGuard,
    clock: ServerClock,
    room: Option<RoomSnapshot>,
    is_host: bool,
    can_control: bool,
    initial_sync_done: bool,
    pending_play: bool,
    needs_interaction: bool,
    in_sync: bool,
    drift_ms: f64,
    last_check: Option<i64>,
}

impl<M: MediaElement> Reconciler<M> {
    pub fn new(media: M, settings: ReconcileSettings) -> Self {
        Self {
            media,
            settings,
            guard: EchoGuard::Idle,
            clock: ServerClock::default(),
            room: None,
            is_host: false,
            can_control: false,
            initial_sync_done: false,
            pending_play: false,
            needs_interaction: false,
            in_sync: true,
            drift_ms: 0.0,
            last_check: None,
        }
    }

    pub fn media(&self) -> &M {
        &self.media
    }

    pub fn media_mut(&mut self) -> &mut M {
        &mut self.media
    }

    pub fn room(&self) -> Option<&RoomSnapshot> {
        self.room.as_ref()
    }

    pub fn room_mut(&mut self) -> Option<&mut RoomSnapshot> {
        self.room.as_mut()
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    pub fn can_control(&self) -> bool {
        self.can_control
    }

    /// `is_host` exempts us from drift checks; `can_control` lets local
    /// user actions reach the server.
    pub fn set_role(&mut self, is_host: bool, can_control: bool) {
        self.is_host = is_host;
        self.can_control = can_control;
        if is_host {
            self.in_sync = true;
            self.drift_ms = 0.0;
        }
    }

    pub fn observe_clock(&mut self, round_trip: RoundTrip, server_time: i64) {
        self.clock.observe(round_trip, server_time);
    }

    pub fn status(&self) -> ReconcileStatus {
        ReconcileStatus {
            in_sync: self.in_sync,
            drift_ms: self.drift_ms,
            last_check: self.last_check,
            needs_interaction: self.needs_interaction,
        }
    }

    /// Adopt the room from a create/join acknowledgment and start loading its
    /// media. The initial seek waits for [`MediaEvent::Buffered`].
    pub fn load_room(&mut self, room: RoomSnapshot) -> Result<(), SyncError> {
        let url = room.video_url.clone();
        self.room = Some(room);
        self.load_media(&url)
    }

    pub fn video_changed(&mut self, video_url: &str, server_time: i64) -> Result<(), SyncError> {
        if let Some(room) = self.room.as_mut() {
            room.video_url = video_url.to_string();
            room.position = 0.0;
            room.playing = false;
            room.position_timestamp = server_time;
            room.duration = None;
        }
        self.load_media(video_url)
    }

    fn load_media(&mut self, url: &str) -> Result<(), SyncError> {
        self.initial_sync_done = false;
        self.pending_play = false;
        self.needs_interaction = false;
        self.media.load(url).map_err(|err| match err {
            MediaError::Unsupported(reason) => SyncError::Unsupported(reason),
            other => SyncError::Unsupported(other.to_string()),
        })
    }

    /// Room position extrapolated to local time `now`.
    pub fn expected_position(&self, now: i64) -> Option<f64> {
        let server_now = self.clock.to_server(now);
        self.room
            .as_ref()
            .map(|room| room.effective_position(server_now))
    }

    /// Apply a broadcast playback event. A play is compensated for the time
    /// the event spent in flight; pause and seek targets are static.
    pub fn apply_remote_event(&mut self, event: &VideoEvent, now: i64) {
        if let Some(room) = self.room.as_mut() {
            room.apply_event(event);
        }
        self.guard.arm(now, self.settings.remote_window_ms);

        let latency = (self.clock.to_server(now) - event.server_time).max(0) as f64 / 1000.0;
        tracing::debug!(
            "Remote {:?} at {:.2}s (latency {:.0}ms)",
            event.action,
            event.position,
            latency * 1000.0
        );

        match event.action {
            PlaybackAction::Play => {
                self.media.seek(event.position + latency);
                self.try_play();
            }
            PlaybackAction::Pause => {
                self.media.seek(event.position);
                self.media.pause();
                self.pending_play = false;
                self.needs_interaction = false;
            }
            PlaybackAction::Seek => self.media.seek(event.position),
        }
    }

    /// Process media callbacks raised since the last pump. Returns the
    /// user-originated controls to forward to the server.
    pub fn pump(&mut self, now: i64) -> Vec<LocalControl> {
        let mut controls = Vec::new();
        for event in self.media.take_events() {
            let action = match event {
                MediaEvent::Buffered => {
                    self.initial_sync(now);
                    continue;
                }
                MediaEvent::Play => PlaybackAction::Play,
                MediaEvent::Pause => PlaybackAction::Pause,
                MediaEvent::Seeked => PlaybackAction::Seek,
            };

            if self.guard.is_suppressing(now) {
                tracing::trace!("Suppressed echo of {:?}", action);
                continue;
            }
            if !self.can_control {
                continue;
            }
            let Some(position) = self.media.position() else {
                continue;
            };

            let control = LocalControl {
                action,
                position,
                duration: self.media.duration(),
            };
            let server_time = self.clock.to_server(now);
            if let Some(room) = self.room.as_mut() {
                room.apply_event(&VideoEvent {
                    action,
                    position,
                    duration: control.duration,
                    server_time,
                });
            }
            controls.push(control);
        }
        controls
    }

    /// Seek/play to the room's position once per media load, after the first
    /// buffering so the element is seekable.
    fn initial_sync(&mut self, now: i64) {
        if self.initial_sync_done {
            return;
        }
        self.initial_sync_done = true;
        if self.is_host {
            return;
        }

        let Some(should_play) = self.room.as_ref().map(|room| room.playing) else {
            return;
        };
        let target = self.expected_position(now).unwrap_or(0.0);
        tracing::info!("Initial sync: seeking to {:.2}s, playing: {}", target, should_play);

        self.guard.arm(now, self.settings.initial_window_ms);
        if target > 0.0 {
            self.media.seek(target);
        }
        if should_play {
            self.try_play();
        }
    }

    /// Compare local playback against a fresh sync reply. Flags drift but
    /// never corrects it.
    pub fn check_drift(
        &mut self,
        room: RoomSnapshot,
        round_trip: RoundTrip,
        now: i64,
    ) -> Option<DriftReport> {
        self.clock.observe(round_trip, room.server_time);
        self.last_check = Some(now);

        let video_changed = self
            .room
            .as_ref()
            .map_or(true, |current| current.video_url != room.video_url);
        let url = room.video_url.clone();
        self.room = Some(room);
        if video_changed {
            if let Err(err) = self.load_media(&url) {
                tracing::warn!("Could not load synced media: {}", err);
            }
        }

        if self.is_host {
            self.in_sync = true;
            self.drift_ms = 0.0;
            return None;
        }

        let local = self.media.position()?;
        let expected = self.expected_position(now)?;
        let drift_ms = (local - expected) * 1000.0;
        let in_sync = drift_ms.abs() <= self.settings.drift_threshold_ms;

        self.in_sync = in_sync;
        self.drift_ms = drift_ms;
        tracing::debug!(
            "Drift {:.0}ms (local {:.2}s, expected {:.2}s)",
            drift_ms,
            local,
            expected
        );

        Some(DriftReport {
            local,
            expected,
            drift_ms,
            in_sync,
        })
    }

    /// Check drift and then correct position and play state regardless.
    pub fn force_sync(
        &mut self,
        room: RoomSnapshot,
        round_trip: RoundTrip,
        now: i64,
    ) -> Option<DriftReport> {
        let report = self.check_drift(room, round_trip, now)?;
        let should_play = self.room.as_ref().is_some_and(|room| room.playing);

        tracing::info!(
            "Sync correction: drift was {:.0}ms, seeking to {:.2}s",
            report.drift_ms,
            report.expected
        );
        self.guard.arm(now, self.settings.remote_window_ms);
        self.media.seek(report.expected);
        if should_play && !self.media.is_playing() {
            self.try_play();
        } else if !should_play && self.media.is_playing() {
            self.media.pause();
            self.pending_play = false;
        }

        self.in_sync = true;
        self.drift_ms = 0.0;
        Some(report)
    }

    pub fn user_play(&mut self) {
        self.media.user_gesture();
        self.try_play();
    }

    pub fn user_pause(&mut self) {
        self.media.pause();
    }

    pub fn user_seek(&mut self, position: f64) {
        self.media.seek(position.max(0.0));
    }

    /// Retry a play that autoplay policy blocked, now that the user interacted.
    pub fn enable_playback(&mut self, now: i64) {
        self.media.user_gesture();
        self.needs_interaction = false;
        if !self.pending_play {
            return;
        }

        self.guard.arm(now, self.settings.remote_window_ms);
        if let Some(target) = self.expected_position(now) {
            self.media.seek(target);
        }
        self.try_play();
    }

    fn try_play(&mut self) {
        match self.media.play() {
            Ok(()) => {
                self.pending_play = false;
                self.needs_interaction = false;
            }
            Err(MediaError::AutoplayBlocked) => {
                tracing::warn!("Play blocked by autoplay policy, waiting for user interaction");
                self.pending_play = true;
                self.needs_interaction = true;
            }
            Err(err) => tracing::warn!("Play failed: {}", err),
        }
    }
}

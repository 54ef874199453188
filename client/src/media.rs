//! Boundary to the local media element.
//!
//! Rendering is someone else's job; the reconciliation engine only needs to
//! drive playback and observe the element's callbacks.

use std::collections::VecDeque;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    /// The runtime refused a programmatic play until the user interacts.
    #[error("playback blocked until user interaction")]
    AutoplayBlocked,
    #[error("unsupported media: {0}")]
    Unsupported(String),
}

/// Callbacks emitted by the element, in the order they happened.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MediaEvent {
    Play,
    Pause,
    Seeked,
    /// First media data is buffered and the element is seekable.
    Buffered,
}

pub trait MediaElement: Send {
    fn load(&mut self, url: &str) -> Result<(), MediaError>;
    fn play(&mut self) -> Result<(), MediaError>;
    fn pause(&mut self);
    fn seek(&mut self, position: f64);
    /// Current position in seconds, `None` until media is loaded.
    fn position(&self) -> Option<f64>;
    fn is_playing(&self) -> bool;
    fn duration(&self) -> Option<f64> {
        None
    }
    /// Drain callbacks raised since the last call.
    fn take_events(&mut self) -> Vec<MediaEvent>;
    /// A qualifying user gesture happened (click, key press).
    fn user_gesture(&mut self) {}
}

/// Headless player that advances its position with wall-clock time.
///
/// Only HLS sources are accepted, and programmatic play can be made to fail
/// until a user gesture, mimicking browser autoplay policy.
pub struct SimulatedPlayer {
    source: Option<String>,
    playing: bool,
    base_position: f64,
    base_instant: Instant,
    duration: Option<f64>,
    autoplay_allowed: bool,
    events: VecDeque<MediaEvent>,
}

impl SimulatedPlayer {
    pub fn new(autoplay_allowed: bool) -> Self {
        Self {
            source: None,
            playing: false,
            base_position: 0.0,
            base_instant: Instant::now(),
            duration: None,
            autoplay_allowed,
            events: VecDeque::new(),
        }
    }

    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    fn current(&self) -> f64 {
        let mut position = self.base_position;
        if self.playing {
            position += self.base_instant.elapsed().as_secs_f64();
        }
        match self.duration {
            Some(duration) => position.min(duration),
            None => position,
        }
    }

    fn rebase(&mut self, position: f64) {
        self.base_position = position.max(0.0);
        self.base_instant = Instant::now();
    }
}

impl MediaElement for SimulatedPlayer {
    fn load(&mut self, url: &str) -> Result<(), MediaError> {
        if !url.to_ascii_lowercase().contains("m3u8") {
            return Err(MediaError::Unsupported(format!("no HLS support for {url}")));
        }
        self.source = Some(url.to_string());
        self.playing = false;
        self.rebase(0.0);
        self.events.clear();
        self.events.push_back(MediaEvent::Buffered);
        Ok(())
    }

    fn play(&mut self) -> Result<(), MediaError> {
        if self.source.is_none() {
            return Err(MediaError::Unsupported("nothing loaded".into()));
        }
        if !self.autoplay_allowed {
            return Err(MediaError::AutoplayBlocked);
        }
        if !self.playing {
            let position = self.current();
            self.playing = true;
            self.rebase(position);
            self.events.push_back(MediaEvent::Play);
        }
        Ok(())
    }

    fn pause(&mut self) {
        if self.playing {
            let position = self.current();
            self.playing = false;
            self.rebase(position);
            self.events.push_back(MediaEvent::Pause);
        }
    }

    fn seek(&mut self, position: f64) {
        if self.source.is_none() {
            return;
        }
        self.rebase(position);
        self.events.push_back(MediaEvent::Seeked);
    }

    fn position(&self) -> Option<f64> {
        self.source.as_ref().map(|_| self.current())
    }

    fn is_playing(&self) -> bool {
        self.playing
    }

    fn duration(&self) -> Option<f64> {
        self.duration
    }

    fn take_events(&mut self) -> Vec<MediaEvent> {
        self.events.drain(..).collect()
    }

    fn user_gesture(&mut self) {
        self.autoplay_allowed = true;
    }
}

//! Per-room authoritative playback record.
//!
//! Playback is stored as a `(position, position_timestamp, playing)` triple and
//! extrapolated on demand, so nothing needs to tick server-side.

use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::protocol::{Participant, PlaybackAction, RoomSnapshot, VideoEvent};

/// Who may mutate a room's playback state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthorityPolicy {
    /// Only the current host.
    #[default]
    Host,
    /// Every participant of the room.
    AnyParticipant,
}

impl AuthorityPolicy {
    pub fn is_authority(self, room: &Room, participant_id: Uuid) -> bool {
        match self {
            AuthorityPolicy::Host => room.host_id == participant_id,
            AuthorityPolicy::AnyParticipant => room.has_participant(participant_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPhase {
    Idle,
    Active,
}

/// Position at `now` (unix millis) extrapolated from the stored triple.
pub fn effective_position(position: f64, position_timestamp: i64, playing: bool, now: i64) -> f64 {
    if !playing {
        return position;
    }
    let elapsed = (now - position_timestamp).max(0) as f64 / 1000.0;
    position + elapsed
}

#[derive(Debug, Clone)]
pub struct Room {
    pub id: String,
    pub video_url: String,
    pub host_id: Uuid,
    pub position: f64,
    pub playing: bool,
    pub position_timestamp: i64,
    pub duration: Option<f64>,
    /// Join order; the first entry inherits the host role on migration.
    pub participants: Vec<Participant>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Result of removing a participant from a room.
#[derive(Debug, Clone)]
pub struct Departure {
    pub participant: Participant,
    pub new_host_id: Option<Uuid>,
}

impl Room {
    pub fn new(id: String, video_url: String, creator: Participant, now: i64) -> Self {
        Self {
            id,
            video_url,
            host_id: creator.id,
            position: 0.0,
            playing: false,
            position_timestamp: now,
            duration: None,
            participants: vec![creator],
            created_at: now,
            updated_at: now,
        }
    }

    pub fn phase(&self) -> RoomPhase {
        if self.video_url.is_empty() {
            RoomPhase::Idle
        } else {
            RoomPhase::Active
        }
    }

    pub fn has_participant(&self, participant_id: Uuid) -> bool {
        self.participants.iter().any(|p| p.id == participant_id)
    }

    pub fn touch(&mut self, now: i64) {
        self.updated_at = self.updated_at.max(now);
    }

    pub fn effective_position(&self, now: i64) -> f64 {
        effective_position(self.position, self.position_timestamp, self.playing, now)
    }

    /// Replace the video and rewind. Moves Idle to Active or resets within Active.
    pub fn set_video(
        &mut self,
        policy: AuthorityPolicy,
        requester: Uuid,
        video_url: String,
        now: i64,
    ) -> SyncResult<()> {
        if !policy.is_authority(self, requester) {
            return Err(SyncError::Forbidden);
        }
        self.video_url = video_url;
        self.position = 0.0;
        self.playing = false;
        self.duration = None;
        self.position_timestamp = now;
        self.touch(now);
        Ok(())
    }

    /// Overwrite the playback triple. Non-authority requests leave the room untouched.
    pub fn update_playback(
        &mut self,
        policy: AuthorityPolicy,
        requester: Uuid,
        playing: bool,
        position: f64,
        duration: Option<f64>,
        now: i64,
    ) -> SyncResult<()> {
        if !policy.is_authority(self, requester) {
            return Err(SyncError::Forbidden);
        }
        if !position.is_finite() || position < 0.0 {
            return Err(SyncError::Invalid(format!("position {position} out of range")));
        }
        self.playing = playing;
        self.position = position;
        self.position_timestamp = now;
        if let Some(duration) = duration.filter(|d| d.is_finite() && *d > 0.0) {
            self.duration = Some(duration);
        }
        self.touch(now);
        Ok(())
    }

    /// Apply a play/pause/seek control and build the event to broadcast.
    /// A seek keeps the current playing flag.
    pub fn apply_action(
        &mut self,
        policy: AuthorityPolicy,
        requester: Uuid,
        action: PlaybackAction,
        position: f64,
        duration: Option<f64>,
        now: i64,
    ) -> SyncResult<VideoEvent> {
        let playing = match action {
            PlaybackAction::Play => true,
            PlaybackAction::Pause => false,
            PlaybackAction::Seek => self.playing,
        };
        self.update_playback(policy, requester, playing, position, duration, now)?;
        Ok(VideoEvent {
            action,
            position: self.position,
            duration: self.duration,
            server_time: now,
        })
    }

    /// Append a participant. A newcomer to an empty room becomes its host.
    pub fn add_participant(&mut self, participant: Participant, now: i64) {
        if self.participants.is_empty() {
            self.host_id = participant.id;
        }
        self.participants.push(participant);
        self.touch(now);
    }

    /// Remove a participant, handing the host role to the earliest remaining
    /// member when the host leaves.
    pub fn remove_participant(&mut self, participant_id: Uuid, now: i64) -> Option<Departure> {
        let index = self
            .participants
            .iter()
            .position(|p| p.id == participant_id)?;
        let participant = self.participants.remove(index);
        self.touch(now);

        let mut new_host_id = None;
        if participant.id == self.host_id {
            if let Some(next) = self.participants.first() {
                self.host_id = next.id;
                new_host_id = Some(next.id);
            }
        }

        Some(Departure {
            participant,
            new_host_id,
        })
    }

    pub fn snapshot(&self, now: i64) -> RoomSnapshot {
        RoomSnapshot {
            room_id: self.id.clone(),
            video_url: self.video_url.clone(),
            host_id: self.host_id,
            position: self.position,
            playing: self.playing,
            position_timestamp: self.position_timestamp,
            duration: self.duration,
            participants: self.participants.clone(),
            server_time: now,
        }
    }
}

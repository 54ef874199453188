use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::now_millis;
use crate::protocol::{Participant, PlaybackAction, RoomSnapshot, VideoEvent};
use crate::room::{AuthorityPolicy, Departure, Room};

const LOG_TAG: &str = "[SyncStream]";
const ROOM_CODE_LEN: usize = 8;
const ROOM_CODE_ALPHABET: &[u8] = b"abcdefghjkmnpqrstuvwxyz23456789";
const MAX_DISPLAY_NAME_CHARS: usize = 50;

/// In-memory table of active rooms.
///
/// Each room lives in its own map entry, so mutations on one room never wait
/// on another room's lock.
#[derive(Clone)]
pub struct RoomRegistry {
    rooms: Arc<DashMap<String, Room>>,
    max_participants: usize,
    policy: AuthorityPolicy,
}

/// Outcome of a participant leaving a room.
#[derive(Debug, Clone)]
pub struct LeaveOutcome {
    pub participant: Participant,
    /// `None` once the last participant is gone and the room was deleted.
    pub room: Option<Room>,
    pub new_host_id: Option<Uuid>,
}

impl RoomRegistry {
    pub fn new(max_participants: usize, policy: AuthorityPolicy) -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            max_participants: max_participants.max(1),
            policy,
        }
    }

    pub fn policy(&self) -> AuthorityPolicy {
        self.policy
    }

    pub fn max_participants(&self) -> usize {
        self.max_participants
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Insert a fresh room. `notify` runs while the new entry is still locked.
    pub fn create_room<F>(&self, video_url: &str, creator: Participant, notify: F) -> SyncResult<Room>
    where
        F: FnOnce(&Room),
    {
        let video_url = validate_video_url(video_url)?;
        let creator_id = creator.id;
        loop {
            let room_id = Self::room_code();
            if let Entry::Vacant(slot) = self.rooms.entry(room_id.clone()) {
                let room = slot.insert(Room::new(room_id, video_url, creator, now_millis()));
                notify(room.value());
                tracing::info!("{LOG_TAG} Room {} created by participant {}", room.id, creator_id);
                return Ok(room.value().clone());
            }
        }
    }

    pub fn get_room(&self, room_id: &str) -> SyncResult<Room> {
        self.rooms
            .get(room_id)
            .map(|room| room.value().clone())
            .ok_or_else(|| SyncError::RoomNotFound(room_id.to_string()))
    }

    pub fn snapshot(&self, room_id: &str) -> SyncResult<RoomSnapshot> {
        self.rooms
            .get(room_id)
            .map(|room| room.snapshot(now_millis()))
            .ok_or_else(|| SyncError::RoomNotFound(room_id.to_string()))
    }

    /// Add `participant`; `notify` sees the updated room before the entry is released.
    pub fn join_room<F>(&self, room_id: &str, participant: Participant, notify: F) -> SyncResult<Room>
    where
        F: FnOnce(&Room),
    {
        let mut room = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| SyncError::RoomNotFound(room_id.to_string()))?;

        if room.participants.len() >= self.max_participants {
            return Err(SyncError::RoomFull {
                capacity: self.max_participants,
            });
        }

        let participant_id = participant.id;
        room.add_participant(participant, now_millis());
        notify(room.value());
        tracing::info!(
            "{LOG_TAG} Participant {} joined room {} ({} present)",
            participant_id,
            room_id,
            room.participants.len()
        );
        Ok(room.value().clone())
    }

    /// Remove a participant. The room is deleted in the same critical section
    /// when it becomes empty; otherwise `notify` sees the remaining room.
    pub fn leave_room<F>(&self, room_id: &str, participant_id: Uuid, notify: F) -> SyncResult<LeaveOutcome>
    where
        F: FnOnce(&Room, &Departure),
    {
        let Entry::Occupied(mut entry) = self.rooms.entry(room_id.to_string()) else {
            return Err(SyncError::RoomNotFound(room_id.to_string()));
        };
        let departure = entry
            .get_mut()
            .remove_participant(participant_id, now_millis())
            .ok_or_else(|| SyncError::ParticipantNotFound(participant_id.to_string()))?;

        let remaining = if entry.get().participants.is_empty() {
            entry.remove();
            tracing::info!("{LOG_TAG} Room {} deleted (empty)", room_id);
            None
        } else {
            notify(entry.get(), &departure);
            tracing::info!("{LOG_TAG} Participant {} left room {}", participant_id, room_id);
            Some(entry.get().clone())
        };

        if let Some(new_host_id) = departure.new_host_id {
            tracing::info!("{LOG_TAG} Host of room {} migrated to {}", room_id, new_host_id);
        }

        Ok(LeaveOutcome {
            participant: departure.participant,
            room: remaining,
            new_host_id: departure.new_host_id,
        })
    }

    /// Apply a play/pause/seek from `requester`. `notify` receives the accepted
    /// event while the room is still locked, so fan-out follows acceptance order.
    pub fn control<F>(
        &self,
        room_id: &str,
        requester: Uuid,
        action: PlaybackAction,
        position: f64,
        duration: Option<f64>,
        notify: F,
    ) -> SyncResult<VideoEvent>
    where
        F: FnOnce(&Room, &VideoEvent),
    {
        let mut room = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| SyncError::RoomNotFound(room_id.to_string()))?;
        let event = room.apply_action(
            self.policy,
            requester,
            action,
            position,
            duration,
            now_millis(),
        )?;
        notify(room.value(), &event);
        tracing::debug!(
            "{LOG_TAG} Playback event in {}: {:?} at {:.2}s",
            room_id,
            event.action,
            event.position
        );
        Ok(event)
    }

    /// Switch the room to a new video. Returns the server time of the change.
    pub fn set_video<F>(
        &self,
        room_id: &str,
        requester: Uuid,
        video_url: &str,
        notify: F,
    ) -> SyncResult<i64>
    where
        F: FnOnce(&Room),
    {
        let video_url = validate_video_url(video_url)?;
        let mut room = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| SyncError::RoomNotFound(room_id.to_string()))?;
        let now = now_millis();
        room.set_video(self.policy, requester, video_url, now)?;
        notify(room.value());
        tracing::info!("{LOG_TAG} Room {} switched video", room_id);
        Ok(now)
    }

    /// Drop rooms whose last mutation is older than `timeout`.
    pub fn evict_inactive(&self, now: i64, timeout: Duration) -> Vec<String> {
        let cutoff = now - timeout.as_millis() as i64;
        let stale: Vec<String> = self
            .rooms
            .iter()
            .filter(|entry| entry.value().updated_at < cutoff)
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = Vec::with_capacity(stale.len());
        for room_id in stale {
            if self
                .rooms
                .remove_if(&room_id, |_, room| room.updated_at < cutoff)
                .is_some()
            {
                tracing::info!("{LOG_TAG} Room {} evicted after inactivity", room_id);
                evicted.push(room_id);
            }
        }
        evicted
    }

    pub fn new_participant(connection_id: Uuid, display_name: Option<String>) -> Participant {
        let id = Uuid::new_v4();
        let display_name = display_name
            .and_then(|value| Self::sanitize_display_name(&value))
            .unwrap_or_else(|| Self::default_display_name(id));
        Participant {
            id,
            connection_id,
            display_name,
        }
    }

    fn room_code() -> String {
        let raw = Uuid::new_v4().as_u128();
        (0..ROOM_CODE_LEN)
            .map(|i| {
                let idx = (raw >> (i * 8)) as usize % ROOM_CODE_ALPHABET.len();
                ROOM_CODE_ALPHABET[idx] as char
            })
            .collect()
    }

    fn sanitize_display_name(raw: &str) -> Option<String> {
        let cleaned: String = raw
            .trim()
            .chars()
            .filter(|ch| !ch.is_control())
            .take(MAX_DISPLAY_NAME_CHARS)
            .collect();
        let cleaned = cleaned.trim_end().to_string();
        if cleaned.is_empty() {
            None
        } else {
            Some(cleaned)
        }
    }

    fn default_display_name(participant_id: Uuid) -> String {
        let short = &participant_id.to_string()[..8];
        format!("Guest {short}")
    }
}

/// Accept absolute http(s) URLs that point at an HLS playlist.
pub fn validate_video_url(raw: &str) -> SyncResult<String> {
    let trimmed = raw.trim();
    let url = Url::parse(trimmed)
        .map_err(|e| SyncError::Invalid(format!("video url: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(SyncError::Invalid("video url must be http(s)".into()));
    }
    if !trimmed.to_ascii_lowercase().contains("m3u8") {
        return Err(SyncError::Invalid("video url must be an m3u8/HLS stream".into()));
    }
    Ok(trimmed.to_string())
}

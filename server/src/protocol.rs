use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorKind, SyncError};

/// Messages sent from a client to the server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    CreateRoom {
        request_id: u64,
        video_url: String,
        display_name: Option<String>,
    },
    JoinRoom {
        request_id: u64,
        room_id: String,
        display_name: Option<String>,
    },
    LeaveRoom {
        room_id: String,
        participant_id: Uuid,
    },
    ControlEvent {
        room_id: String,
        action: PlaybackAction,
        position: f64,
        #[serde(default)]
        duration: Option<f64>,
    },
    SetVideo {
        room_id: String,
        video_url: String,
    },
    RequestSync {
        request_id: u64,
        room_id: String,
    },
}

/// Messages pushed from the server to a client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    Reply {
        request_id: u64,
        result: ReplyResult,
    },
    ParticipantJoined {
        participant: Participant,
        participants: Vec<Participant>,
    },
    ParticipantLeft {
        participant_id: Uuid,
        participants: Vec<Participant>,
    },
    HostMigrated {
        new_host_id: Uuid,
    },
    Playback(VideoEvent),
    VideoChanged {
        video_url: String,
        server_time: i64,
    },
    Error {
        message: String,
    },
}

/// Outcome of a request that expects an acknowledgment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReplyResult {
    RoomCreated {
        participant_id: Uuid,
        room: RoomSnapshot,
    },
    RoomJoined {
        participant_id: Uuid,
        room: RoomSnapshot,
    },
    Synced {
        room: RoomSnapshot,
    },
    Failed {
        kind: ErrorKind,
        message: String,
    },
}

impl From<SyncError> for ReplyResult {
    fn from(err: SyncError) -> Self {
        ReplyResult::Failed {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackAction {
    Play,
    Pause,
    Seek,
}

/// Broadcast notification of an accepted playback mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoEvent {
    pub action: PlaybackAction,
    pub position: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    /// Unix millis at which the server accepted the action
    pub server_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: Uuid,
    #[serde(skip)]
    pub connection_id: Uuid,
    pub display_name: String,
}

/// Point-in-time view of a room as seen by clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub video_url: String,
    pub host_id: Uuid,
    /// Stored position in seconds, authoritative as of `position_timestamp`
    pub position: f64,
    pub playing: bool,
    pub position_timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    pub participants: Vec<Participant>,
    pub server_time: i64,
}

impl RoomSnapshot {
    pub fn effective_position(&self, now: i64) -> f64 {
        crate::room::effective_position(self.position, self.position_timestamp, self.playing, now)
    }
}

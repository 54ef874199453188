use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Messages sent from client to server (must match server protocol)
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

/// Messages pushed from server to client (must match server protocol)
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    Capacity,
    RateLimited,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackAction {
    Play,
    Pause,
    Seek,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoEvent {
    pub action: PlaybackAction,
    pub position: f64,
    #[serde(default)]
    pub duration: Option<f64>,
    pub server_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: Uuid,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub video_url: String,
    pub host_id: Uuid,
    pub position: f64,
    pub playing: bool,
    pub position_timestamp: i64,
    #[serde(default)]
    pub duration: Option<f64>,
    pub participants: Vec<Participant>,
    pub server_time: i64,
}

impl RoomSnapshot {
    /// Authoritative position at `server_now` (server clock, unix millis).
    pub fn effective_position(&self, server_now: i64) -> f64 {
        if !self.playing {
            return self.position;
        }
        let elapsed = (server_now - self.position_timestamp).max(0) as f64 / 1000.0;
        self.position + elapsed
    }

    /// Fold a broadcast playback event into the cached triple.
    pub fn apply_event(&mut self, event: &VideoEvent) {
        self.position = event.position;
        self.position_timestamp = event.server_time;
        self.playing = match event.action {
            PlaybackAction::Play => true,
            PlaybackAction::Pause => false,
            PlaybackAction::Seek => self.playing,
        };
        if event.duration.is_some() {
            self.duration = event.duration;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_server_reply() {
        let raw = r#"{
            "type": "reply",
            "payload": {
                "request_id": 3,
                "result": {
                    "status": "synced",
                    "room": {
                        "room_id": "k3m9pqrs",
                        "video_url": "https://ex.com/a.m3u8",
                        "host_id": "6f1c1a9e-2a2b-4c55-9f0e-0d7c1e1f2a3b",
                        "position": 10.0,
                        "playing": true,
                        "position_timestamp": 1000,
                        "participants": [],
                        "server_time": 6000
                    }
                }
            }
        }"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();
        let ServerMessage::Reply {
            request_id,
            result: ReplyResult::Synced { room },
        } = msg
        else {
            panic!("unexpected message");
        };
        assert_eq!(request_id, 3);
        assert_eq!(room.duration, None);
        assert!((room.effective_position(6000) - 15.0).abs() < 1e-9);
    }

    #[test]
    fn seek_event_keeps_playing_flag() {
        let mut room = RoomSnapshot {
            room_id: "r".into(),
            video_url: "https://ex.com/a.m3u8".into(),
            host_id: Uuid::nil(),
            position: 0.0,
            playing: true,
            position_timestamp: 0,
            duration: None,
            participants: vec![],
            server_time: 0,
        };
        room.apply_event(&VideoEvent {
            action: PlaybackAction::Seek,
            position: 30.0,
            duration: None,
            server_time: 500,
        });
        assert!(room.playing);
        assert_eq!(room.position_timestamp, 500);
        assert_eq!(room.effective_position(1500), 31.0);
    }
}

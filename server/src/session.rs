//! Connection/session layer.
//!
//! Binds each transport connection to an identity and at most one room
//! membership, routes inbound messages to the registry and fans results out
//! to room members. Transport-agnostic: every connection is represented by an
//! unbounded sender of [`ServerMessage`]s, so per-connection ordering is the
//! channel's FIFO order.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::error::SyncError;
use crate::now_millis;
use crate::protocol::{ClientMessage, PlaybackAction, ReplyResult, ServerMessage};
use crate::rate_limit::RateLimiter;
use crate::registry::{validate_video_url, RoomRegistry};
use crate::room::Room;

pub type ClientSender = mpsc::UnboundedSender<ServerMessage>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub room_id: String,
    pub participant_id: Uuid,
}

struct ConnectionEntry {
    sender: ClientSender,
    origin: String,
    membership: Option<Membership>,
}

#[derive(Clone)]
pub struct SessionHub {
    registry: RoomRegistry,
    limiter: RateLimiter,
    connections: Arc<DashMap<Uuid, ConnectionEntry>>,
}

impl SessionHub {
    pub fn new(registry: RoomRegistry, limiter: RateLimiter) -> Self {
        Self {
            registry,
            limiter,
            connections: Arc::new(DashMap::new()),
        }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Register a connection. `origin` keys the room-creation rate limit.
    pub fn connect(&self, origin: impl Into<String>, sender: ClientSender) -> Uuid {
        let connection_id = Uuid::new_v4();
        let origin = origin.into();
        tracing::info!("Connection {} opened from {}", connection_id, origin);
        self.connections.insert(
            connection_id,
            ConnectionEntry {
                sender,
                origin,
                membership: None,
            },
        );
        connection_id
    }

    pub fn disconnect(&self, connection_id: Uuid) {
        self.leave_current(connection_id);
        self.connections.remove(&connection_id);
        tracing::info!("Connection {} closed", connection_id);
    }

    pub fn membership(&self, connection_id: Uuid) -> Option<Membership> {
        self.connections
            .get(&connection_id)
            .and_then(|entry| entry.membership.clone())
    }

    pub fn handle_text(&self, connection_id: Uuid, text: &str) -> anyhow::Result<()> {
        let msg: ClientMessage = serde_json::from_str(text)?;
        self.handle_message(connection_id, msg);
        Ok(())
    }

    pub fn handle_message(&self, connection_id: Uuid, msg: ClientMessage) {
        match msg {
            ClientMessage::CreateRoom {
                request_id,
                video_url,
                display_name,
            } => self.create_room(connection_id, request_id, &video_url, display_name),

            ClientMessage::JoinRoom {
                request_id,
                room_id,
                display_name,
            } => self.join_room(connection_id, request_id, &room_id, display_name),

            ClientMessage::LeaveRoom {
                room_id,
                participant_id,
            } => {
                let requested = Membership {
                    room_id,
                    participant_id,
                };
                if self.membership(connection_id).as_ref() == Some(&requested) {
                    self.leave_current(connection_id);
                } else {
                    tracing::debug!(
                        "Dropping leave for {:?} from connection {}",
                        requested,
                        connection_id
                    );
                }
            }

            ClientMessage::ControlEvent {
                room_id,
                action,
                position,
                duration,
            } => self.control_event(connection_id, &room_id, action, position, duration),

            ClientMessage::SetVideo { room_id, video_url } => {
                self.set_video(connection_id, &room_id, &video_url)
            }

            ClientMessage::RequestSync {
                request_id,
                room_id,
            } => {
                let result = match self.registry.snapshot(&room_id) {
                    Ok(room) => ReplyResult::Synced { room },
                    Err(err) => err.into(),
                };
                self.reply(connection_id, request_id, result);
            }
        }
    }

    fn create_room(
        &self,
        connection_id: Uuid,
        request_id: u64,
        video_url: &str,
        display_name: Option<String>,
    ) {
        let origin = match self.connections.get(&connection_id) {
            Some(entry) => entry.origin.clone(),
            None => return,
        };

        if let Err(err) = self.limiter.check(&origin, now_millis()) {
            self.reply(connection_id, request_id, err.into());
            return;
        }

        let video_url = match validate_video_url(video_url) {
            Ok(url) => url,
            Err(err) => {
                self.reply(connection_id, request_id, err.into());
                return;
            }
        };

        self.leave_current(connection_id);

        let creator = RoomRegistry::new_participant(connection_id, display_name);
        let participant = creator.clone();
        let created = self.registry.create_room(&video_url, creator, |room| {
            self.set_membership(
                connection_id,
                Some(Membership {
                    room_id: room.id.clone(),
                    participant_id: participant.id,
                }),
            );
            self.reply(
                connection_id,
                request_id,
                ReplyResult::RoomCreated {
                    participant_id: participant.id,
                    room: room.snapshot(now_millis()),
                },
            );
            self.fan_out(
                room,
                ServerMessage::ParticipantJoined {
                    participant: participant.clone(),
                    participants: room.participants.clone(),
                },
                None,
            );
        });
        if let Err(err) = created {
            self.reply(connection_id, request_id, err.into());
        }
    }

    fn join_room(
        &self,
        connection_id: Uuid,
        request_id: u64,
        room_id: &str,
        display_name: Option<String>,
    ) {
        self.leave_current(connection_id);

        let participant = RoomRegistry::new_participant(connection_id, display_name);
        let joined = participant.clone();
        let result = self.registry.join_room(room_id, participant, |room| {
            self.set_membership(
                connection_id,
                Some(Membership {
                    room_id: room.id.clone(),
                    participant_id: joined.id,
                }),
            );
            self.reply(
                connection_id,
                request_id,
                ReplyResult::RoomJoined {
                    participant_id: joined.id,
                    room: room.snapshot(now_millis()),
                },
            );
            self.fan_out(
                room,
                ServerMessage::ParticipantJoined {
                    participant: joined.clone(),
                    participants: room.participants.clone(),
                },
                None,
            );
        });
        if let Err(err) = result {
            self.reply(connection_id, request_id, err.into());
        }
    }

    fn control_event(
        &self,
        connection_id: Uuid,
        room_id: &str,
        action: PlaybackAction,
        position: f64,
        duration: Option<f64>,
    ) {
        let Some(participant_id) = self.member_of(connection_id, room_id) else {
            tracing::debug!("Dropping control from non-member {}", connection_id);
            return;
        };

        let result = self.registry.control(
            room_id,
            participant_id,
            action,
            position,
            duration,
            |room, event| {
                self.fan_out(room, ServerMessage::Playback(event.clone()), Some(connection_id))
            },
        );
        if let Err(err) = result {
            tracing::debug!("Dropping control from {}: {}", participant_id, err);
        }
    }

    fn set_video(&self, connection_id: Uuid, room_id: &str, video_url: &str) {
        let Some(participant_id) = self.member_of(connection_id, room_id) else {
            tracing::debug!("Dropping set_video from non-member {}", connection_id);
            return;
        };

        let result = self.registry.set_video(room_id, participant_id, video_url, |room| {
            self.fan_out(
                room,
                ServerMessage::VideoChanged {
                    video_url: room.video_url.clone(),
                    server_time: room.position_timestamp,
                },
                Some(connection_id),
            )
        });
        if let Err(err) = result {
            tracing::debug!("Dropping set_video from {}: {}", participant_id, err);
        }
    }

    /// Leave whatever room the connection is in and notify the remaining members.
    fn leave_current(&self, connection_id: Uuid) {
        let Some(membership) = self.take_membership(connection_id) else {
            return;
        };

        let result = self.registry.leave_room(
            &membership.room_id,
            membership.participant_id,
            |room, departure| {
                self.fan_out(
                    room,
                    ServerMessage::ParticipantLeft {
                        participant_id: departure.participant.id,
                        participants: room.participants.clone(),
                    },
                    None,
                );
                if let Some(new_host_id) = departure.new_host_id {
                    self.fan_out(room, ServerMessage::HostMigrated { new_host_id }, None);
                }
            },
        );
        match result {
            Ok(_) | Err(SyncError::RoomNotFound(_)) | Err(SyncError::ParticipantNotFound(_)) => {}
            Err(err) => tracing::warn!("Leave failed for {}: {}", connection_id, err),
        }
    }

    /// Background sweep of inactive rooms and expired rate-limit buckets.
    pub fn spawn_sweeper(
        &self,
        interval: Duration,
        room_timeout: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        hub.sweep(now_millis(), room_timeout);
                    }
                    _ = shutdown.recv() => {
                        tracing::info!("Sweep task shutting down");
                        break;
                    }
                }
            }
        })
    }

    pub fn sweep(&self, now: i64, room_timeout: Duration) -> Vec<String> {
        let evicted = self.registry.evict_inactive(now, room_timeout);
        if !evicted.is_empty() {
            for mut entry in self.connections.iter_mut() {
                let stale = entry
                    .membership
                    .as_ref()
                    .is_some_and(|m| evicted.contains(&m.room_id));
                if stale {
                    entry.membership = None;
                }
            }
        }
        let pruned = self.limiter.prune(now);
        if pruned > 0 {
            tracing::debug!("Pruned {} rate-limit buckets", pruned);
        }
        evicted
    }

    fn member_of(&self, connection_id: Uuid, room_id: &str) -> Option<Uuid> {
        self.membership(connection_id)
            .filter(|m| m.room_id == room_id)
            .map(|m| m.participant_id)
    }

    fn set_membership(&self, connection_id: Uuid, membership: Option<Membership>) {
        if let Some(mut entry) = self.connections.get_mut(&connection_id) {
            entry.membership = membership;
        }
    }

    fn take_membership(&self, connection_id: Uuid) -> Option<Membership> {
        self.connections
            .get_mut(&connection_id)
            .and_then(|mut entry| entry.membership.take())
    }

    fn reply(&self, connection_id: Uuid, request_id: u64, result: ReplyResult) {
        self.send(connection_id, ServerMessage::Reply { request_id, result });
    }

    pub fn send(&self, connection_id: Uuid, msg: ServerMessage) {
        if let Some(entry) = self.connections.get(&connection_id) {
            let _ = entry.sender.send(msg);
        }
    }

    /// Enqueue `msg` to every member of `room`. Callers run this while the
    /// registry holds the room entry, so members see events in commit order.
    fn fan_out(&self, room: &Room, msg: ServerMessage, exclude: Option<Uuid>) {
        tracing::debug!(
            "Broadcasting {:?} to {} members of {}",
            msg,
            room.participants.len(),
            room.id
        );
        for member in room.participants.iter().map(|p| p.connection_id) {
            if Some(member) == exclude {
                continue;
            }
            self.send(member, msg.clone());
        }
    }
}

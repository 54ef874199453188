use std::time::Duration;

use syncstream_server::error::ErrorKind;
use syncstream_server::now_millis;
use syncstream_server::protocol::{
    ClientMessage, PlaybackAction, ReplyResult, RoomSnapshot, ServerMessage,
};
use syncstream_server::rate_limit::RateLimiter;
use syncstream_server::{AuthorityPolicy, RoomRegistry, SessionHub};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use uuid::Uuid;

const URL: &str = "https://ex.com/a.m3u8";

struct Client {
    id: Uuid,
    rx: UnboundedReceiver<ServerMessage>,
}

impl Client {
    fn connect(hub: &SessionHub, origin: &str) -> Self {
        let (tx, rx) = unbounded_channel();
        let id = hub.connect(origin, tx);
        Self { id, rx }
    }

    fn drain(&mut self) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            out.push(msg);
        }
        out
    }
}

fn hub_with(policy: AuthorityPolicy, max_participants: usize, max_creations: u32) -> SessionHub {
    SessionHub::new(
        RoomRegistry::new(max_participants, policy),
        RateLimiter::new(Duration::from_secs(60), max_creations),
    )
}

fn hub() -> SessionHub {
    hub_with(AuthorityPolicy::Host, 20, 10)
}

fn expect_reply(messages: &[ServerMessage], request_id: u64) -> ReplyResult {
    messages
        .iter()
        .find_map(|msg| match msg {
            ServerMessage::Reply {
                request_id: id,
                result,
            } if *id == request_id => Some(result.clone()),
            _ => None,
        })
        .unwrap_or_else(|| panic!("no reply for request {request_id} in {messages:?}"))
}

fn create(hub: &SessionHub, client: &mut Client, name: &str) -> (String, Uuid) {
    hub.handle_message(
        client.id,
        ClientMessage::CreateRoom {
            request_id: 1,
            video_url: URL.into(),
            display_name: Some(name.into()),
        },
    );
    match expect_reply(&client.drain(), 1) {
        ReplyResult::RoomCreated {
            participant_id,
            room,
        } => (room.room_id, participant_id),
        other => panic!("unexpected reply {other:?}"),
    }
}

fn join(hub: &SessionHub, client: &mut Client, room_id: &str, name: &str) -> Uuid {
    hub.handle_message(
        client.id,
        ClientMessage::JoinRoom {
            request_id: 2,
            room_id: room_id.into(),
            display_name: Some(name.into()),
        },
    );
    match expect_reply(&client.drain(), 2) {
        ReplyResult::RoomJoined { participant_id, .. } => participant_id,
        other => panic!("unexpected reply {other:?}"),
    }
}

fn sync(hub: &SessionHub, client: &mut Client, room_id: &str) -> ReplyResult {
    hub.handle_message(
        client.id,
        ClientMessage::RequestSync {
            request_id: 9,
            room_id: room_id.into(),
        },
    );
    expect_reply(&client.drain(), 9)
}

fn synced_room(result: ReplyResult) -> RoomSnapshot {
    match result {
        ReplyResult::Synced { room } => room,
        other => panic!("expected synced, got {other:?}"),
    }
}

#[test]
fn creator_receives_reply_before_own_roster_update() {
    let hub = hub();
    let mut host = Client::connect(&hub, "10.0.0.1");
    hub.handle_message(
        host.id,
        ClientMessage::CreateRoom {
            request_id: 1,
            video_url: URL.into(),
            display_name: Some("Host".into()),
        },
    );
    let messages = host.drain();
    assert!(matches!(messages[0], ServerMessage::Reply { request_id: 1, .. }));
    assert!(matches!(messages[1], ServerMessage::ParticipantJoined { .. }));
}

#[test]
fn join_notifies_everyone_including_joiner() {
    let hub = hub();
    let mut host = Client::connect(&hub, "10.0.0.1");
    let mut guest = Client::connect(&hub, "10.0.0.2");
    let (room_id, _) = create(&hub, &mut host, "Host");

    hub.handle_message(
        guest.id,
        ClientMessage::JoinRoom {
            request_id: 2,
            room_id: room_id.clone(),
            display_name: Some("Guest".into()),
        },
    );
    let guest_msgs = guest.drain();
    assert!(matches!(guest_msgs[0], ServerMessage::Reply { .. }));
    match &guest_msgs[1] {
        ServerMessage::ParticipantJoined { participants, .. } => assert_eq!(participants.len(), 2),
        other => panic!("unexpected {other:?}"),
    }

    let host_msgs = host.drain();
    assert!(matches!(
        host_msgs.as_slice(),
        [ServerMessage::ParticipantJoined { participant, .. }] if participant.display_name == "Guest"
    ));
}

#[test]
fn host_control_is_broadcast_to_others_only() {
    let hub = hub();
    let mut host = Client::connect(&hub, "10.0.0.1");
    let mut guest = Client::connect(&hub, "10.0.0.2");
    let (room_id, _) = create(&hub, &mut host, "Host");
    join(&hub, &mut guest, &room_id, "Guest");
    host.drain();

    hub.handle_message(
        host.id,
        ClientMessage::ControlEvent {
            room_id: room_id.clone(),
            action: PlaybackAction::Play,
            position: 10.0,
            duration: Some(3600.0),
        },
    );

    assert!(host.drain().is_empty());
    match guest.drain().as_slice() {
        [ServerMessage::Playback(event)] => {
            assert_eq!(event.action, PlaybackAction::Play);
            assert_eq!(event.position, 10.0);
            assert_eq!(event.duration, Some(3600.0));
        }
        other => panic!("unexpected {other:?}"),
    }

    let room = synced_room(sync(&hub, &mut guest, &room_id));
    assert!(room.playing);
    let position = room.effective_position(room.position_timestamp + 5_000);
    assert!((position - 15.0).abs() < 1e-6);
}

#[test]
fn guest_control_is_silently_dropped() {
    let hub = hub();
    let mut host = Client::connect(&hub, "10.0.0.1");
    let mut guest = Client::connect(&hub, "10.0.0.2");
    let (room_id, _) = create(&hub, &mut host, "Host");
    join(&hub, &mut guest, &room_id, "Guest");
    host.drain();
    let before = hub.registry().get_room(&room_id).unwrap();

    hub.handle_message(
        guest.id,
        ClientMessage::ControlEvent {
            room_id: room_id.clone(),
            action: PlaybackAction::Play,
            position: 99.0,
            duration: None,
        },
    );
    hub.handle_message(
        guest.id,
        ClientMessage::SetVideo {
            room_id: room_id.clone(),
            video_url: "https://ex.com/other.m3u8".into(),
        },
    );

    assert!(host.drain().is_empty());
    assert!(guest.drain().is_empty());
    let after = hub.registry().get_room(&room_id).unwrap();
    assert_eq!(after.position, before.position);
    assert_eq!(after.playing, before.playing);
    assert_eq!(after.updated_at, before.updated_at);
    assert_eq!(after.video_url, before.video_url);
}

#[test]
fn any_participant_policy_lets_guests_drive_playback() {
    let hub = hub_with(AuthorityPolicy::AnyParticipant, 20, 10);
    let mut host = Client::connect(&hub, "10.0.0.1");
    let mut guest = Client::connect(&hub, "10.0.0.2");
    let (room_id, _) = create(&hub, &mut host, "Host");
    join(&hub, &mut guest, &room_id, "Guest");
    host.drain();

    hub.handle_message(
        guest.id,
        ClientMessage::ControlEvent {
            room_id: room_id.clone(),
            action: PlaybackAction::Seek,
            position: 42.0,
            duration: None,
        },
    );
    assert!(matches!(host.drain().as_slice(), [ServerMessage::Playback(_)]));
    assert_eq!(hub.registry().get_room(&room_id).unwrap().position, 42.0);
}

#[test]
fn host_set_video_notifies_guests() {
    let hub = hub();
    let mut host = Client::connect(&hub, "10.0.0.1");
    let mut guest = Client::connect(&hub, "10.0.0.2");
    let (room_id, _) = create(&hub, &mut host, "Host");
    join(&hub, &mut guest, &room_id, "Guest");
    host.drain();

    hub.handle_message(
        host.id,
        ClientMessage::SetVideo {
            room_id: room_id.clone(),
            video_url: "https://ex.com/b.m3u8".into(),
        },
    );
    match guest.drain().as_slice() {
        [ServerMessage::VideoChanged { video_url, .. }] => {
            assert_eq!(video_url, "https://ex.com/b.m3u8")
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn host_disconnect_migrates_and_notifies() {
    let hub = hub();
    let mut host = Client::connect(&hub, "10.0.0.1");
    let mut b = Client::connect(&hub, "10.0.0.2");
    let mut c = Client::connect(&hub, "10.0.0.3");
    let (room_id, host_pid) = create(&hub, &mut host, "Host");
    let b_pid = join(&hub, &mut b, &room_id, "B");
    let c_pid = join(&hub, &mut c, &room_id, "C");
    b.drain();

    hub.disconnect(host.id);

    for client in [&mut b, &mut c] {
        let msgs = client.drain();
        match msgs.as_slice() {
            [ServerMessage::ParticipantLeft {
                participant_id,
                participants,
            }, ServerMessage::HostMigrated { new_host_id }] => {
                assert_eq!(*participant_id, host_pid);
                assert_eq!(participants.len(), 2);
                assert!([b_pid, c_pid].contains(new_host_id));
                assert_eq!(hub.registry().get_room(&room_id).unwrap().host_id, *new_host_id);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

#[test]
fn leave_requires_matching_membership() {
    let hub = hub();
    let mut host = Client::connect(&hub, "10.0.0.1");
    let mut guest = Client::connect(&hub, "10.0.0.2");
    let (room_id, host_pid) = create(&hub, &mut host, "Host");
    let guest_pid = join(&hub, &mut guest, &room_id, "Guest");

    hub.handle_message(
        guest.id,
        ClientMessage::LeaveRoom {
            room_id: room_id.clone(),
            participant_id: host_pid,
        },
    );
    assert_eq!(hub.registry().get_room(&room_id).unwrap().participants.len(), 2);

    hub.handle_message(
        guest.id,
        ClientMessage::LeaveRoom {
            room_id: room_id.clone(),
            participant_id: guest_pid,
        },
    );
    assert_eq!(hub.registry().get_room(&room_id).unwrap().participants.len(), 1);
    assert!(hub.membership(guest.id).is_none());
}

#[test]
fn last_leave_deletes_room() {
    let hub = hub();
    let mut host = Client::connect(&hub, "10.0.0.1");
    let (room_id, host_pid) = create(&hub, &mut host, "Host");

    hub.handle_message(
        host.id,
        ClientMessage::LeaveRoom {
            room_id: room_id.clone(),
            participant_id: host_pid,
        },
    );

    let mut other = Client::connect(&hub, "10.0.0.9");
    match sync(&hub, &mut other, &room_id) {
        ReplyResult::Failed { kind, .. } => assert_eq!(kind, ErrorKind::NotFound),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn full_room_rejects_join_with_capacity() {
    let hub = hub_with(AuthorityPolicy::Host, 2, 10);
    let mut host = Client::connect(&hub, "10.0.0.1");
    let mut b = Client::connect(&hub, "10.0.0.2");
    let mut c = Client::connect(&hub, "10.0.0.3");
    let (room_id, _) = create(&hub, &mut host, "Host");
    join(&hub, &mut b, &room_id, "B");

    hub.handle_message(
        c.id,
        ClientMessage::JoinRoom {
            request_id: 5,
            room_id: room_id.clone(),
            display_name: None,
        },
    );
    match expect_reply(&c.drain(), 5) {
        ReplyResult::Failed { kind, .. } => assert_eq!(kind, ErrorKind::Capacity),
        other => panic!("unexpected {other:?}"),
    }
    assert!(hub.membership(c.id).is_none());
    assert_eq!(hub.registry().get_room(&room_id).unwrap().participants.len(), 2);
}

#[test]
fn creation_is_rate_limited_per_origin() {
    let hub = hub_with(AuthorityPolicy::Host, 20, 2);
    let mut a = Client::connect(&hub, "10.0.0.1");
    create(&hub, &mut a, "A");
    create(&hub, &mut a, "A");

    hub.handle_message(
        a.id,
        ClientMessage::CreateRoom {
            request_id: 3,
            video_url: URL.into(),
            display_name: None,
        },
    );
    match expect_reply(&a.drain(), 3) {
        ReplyResult::Failed { kind, .. } => assert_eq!(kind, ErrorKind::RateLimited),
        other => panic!("unexpected {other:?}"),
    }

    let mut b = Client::connect(&hub, "10.0.0.2");
    create(&hub, &mut b, "B");
}

#[test]
fn creating_again_leaves_previous_room() {
    let hub = hub();
    let mut host = Client::connect(&hub, "10.0.0.1");
    let (first, _) = create(&hub, &mut host, "Host");
    let (second, _) = create(&hub, &mut host, "Host");

    assert_ne!(first, second);
    assert!(hub.registry().get_room(&first).is_err());
    assert_eq!(hub.membership(host.id).unwrap().room_id, second);
}

#[test]
fn invalid_url_is_reported_as_invalid() {
    let hub = hub();
    let mut host = Client::connect(&hub, "10.0.0.1");
    hub.handle_message(
        host.id,
        ClientMessage::CreateRoom {
            request_id: 4,
            video_url: "https://ex.com/clip.mp4".into(),
            display_name: None,
        },
    );
    match expect_reply(&host.drain(), 4) {
        ReplyResult::Failed { kind, .. } => assert_eq!(kind, ErrorKind::Invalid),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(hub.registry().room_count(), 0);
}

#[test]
fn rejected_create_keeps_current_membership() {
    let hub = hub();
    let mut host = Client::connect(&hub, "10.0.0.1");
    let mut guest = Client::connect(&hub, "10.0.0.2");
    let (room_id, _) = create(&hub, &mut host, "Host");
    let guest_pid = join(&hub, &mut guest, &room_id, "Guest");
    host.drain();

    hub.handle_message(
        guest.id,
        ClientMessage::CreateRoom {
            request_id: 7,
            video_url: "not a url".into(),
            display_name: None,
        },
    );
    match expect_reply(&guest.drain(), 7) {
        ReplyResult::Failed { kind, .. } => assert_eq!(kind, ErrorKind::Invalid),
        other => panic!("unexpected {other:?}"),
    }
    let membership = hub.membership(guest.id).unwrap();
    assert_eq!(membership.room_id, room_id);
    assert_eq!(membership.participant_id, guest_pid);
    assert_eq!(hub.registry().get_room(&room_id).unwrap().participants.len(), 2);
    assert!(host.drain().is_empty());
    assert_eq!(hub.registry().room_count(), 1);
}

#[test]
fn concurrent_controls_reach_members_in_commit_order() {
    use std::sync::{Arc, Barrier};
    use std::thread;

    let hub = hub_with(AuthorityPolicy::AnyParticipant, 20, 10);
    let mut a = Client::connect(&hub, "10.0.0.1");
    let mut b = Client::connect(&hub, "10.0.0.2");
    let mut c = Client::connect(&hub, "10.0.0.3");
    let (room_id, _) = create(&hub, &mut a, "A");
    join(&hub, &mut b, &room_id, "B");
    join(&hub, &mut c, &room_id, "C");

    for round in 0..500 {
        c.drain();
        let barrier = Arc::new(Barrier::new(2));
        let senders: Vec<_> = [
            (a.id, PlaybackAction::Play, 10.0),
            (b.id, PlaybackAction::Seek, 50.0),
        ]
        .into_iter()
        .map(|(connection_id, action, position)| {
            let hub = hub.clone();
            let barrier = Arc::clone(&barrier);
            let room_id = room_id.clone();
            thread::spawn(move || {
                barrier.wait();
                hub.handle_message(
                    connection_id,
                    ClientMessage::ControlEvent {
                        room_id,
                        action,
                        position: position + round as f64,
                        duration: None,
                    },
                );
            })
        })
        .collect();
        for sender in senders {
            sender.join().unwrap();
        }

        let events: Vec<_> = c
            .drain()
            .into_iter()
            .filter_map(|msg| match msg {
                ServerMessage::Playback(event) => Some(event),
                _ => None,
            })
            .collect();
        assert_eq!(events.len(), 2);
        let stored = hub.registry().get_room(&room_id).unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.position, stored.position);
        assert_eq!(last.server_time, stored.position_timestamp);
    }
    a.drain();
    b.drain();
}

#[test]
fn malformed_text_is_an_error() {
    let hub = hub();
    let host = Client::connect(&hub, "10.0.0.1");
    assert!(hub.handle_text(host.id, "{\"type\":\"dance\"}").is_err());
    assert!(hub
        .handle_text(
            host.id,
            r#"{"type":"request_sync","payload":{"request_id":1,"room_id":"nope"}}"#
        )
        .is_ok());
}

#[test]
fn sweep_clears_memberships_of_evicted_rooms() {
    let hub = hub();
    let mut host = Client::connect(&hub, "10.0.0.1");
    let (room_id, _) = create(&hub, &mut host, "Host");
    let timeout = Duration::from_secs(1800);

    let later = now_millis() + timeout.as_millis() as i64 + 1_000;
    assert_eq!(hub.sweep(later, timeout), vec![room_id.clone()]);
    assert!(hub.membership(host.id).is_none());
    assert!(hub.registry().get_room(&room_id).is_err());
}

#[tokio::test(start_paused = true)]
async fn sweeper_task_stops_on_shutdown() {
    let hub = hub();
    let (tx, rx) = tokio::sync::broadcast::channel(1);
    let handle = hub.spawn_sweeper(Duration::from_secs(60), Duration::from_secs(1800), rx);
    tokio::time::advance(Duration::from_secs(120)).await;
    tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("sweeper should stop")
        .unwrap();
}

//! One room membership: dispatches server pushes into the reconciliation
//! engine, forwards local controls, and runs the periodic drift check.

use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use uuid::Uuid;

use crate::clock::now_millis;
use crate::error::SyncError;
use crate::invite::build_invite_url;
use crate::media::MediaElement;
use crate::protocol::{Participant, ServerMessage};
use crate::reconcile::{DriftReport, Reconciler};
use crate::sync::{Joined, SyncClient};

pub type SharedEngine<M> = Arc<Mutex<Reconciler<M>>>;

pub struct WatchSession<M: MediaElement + 'static> {
    client: SyncClient,
    engine: SharedEngine<M>,
    room_id: String,
    participant_id: Uuid,
    everyone_controls: bool,
    check_in_flight: Arc<AtomicBool>,
    drift_timer: Option<DriftTimer>,
}

impl<M: MediaElement + 'static> WatchSession<M> {
    /// Adopt an acknowledged membership and start the drift timer.
    pub fn start(
        client: SyncClient,
        engine: SharedEngine<M>,
        joined: Joined,
        everyone_controls: bool,
        drift_interval: Duration,
    ) -> Result<Self, SyncError> {
        let room_id = joined.room.room_id.clone();
        let participant_id = joined.participant_id;
        {
            let mut engine = engine.lock();
            engine.observe_clock(joined.round_trip, joined.room.server_time);
            let is_host = joined.room.host_id == participant_id;
            engine.set_role(is_host, is_host || everyone_controls);
            engine.load_room(joined.room)?;
        }

        let check_in_flight = Arc::new(AtomicBool::new(false));
        let drift_timer = DriftTimer::spawn(
            client.clone(),
            Arc::clone(&engine),
            room_id.clone(),
            drift_interval,
            Arc::clone(&check_in_flight),
        );
        tracing::info!("Watching room {} as {}", room_id, participant_id);

        Ok(Self {
            client,
            engine,
            room_id,
            participant_id,
            everyone_controls,
            check_in_flight,
            drift_timer: Some(drift_timer),
        })
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn participant_id(&self) -> Uuid {
        self.participant_id
    }

    pub fn invite_link(&self) -> String {
        build_invite_url(&self.room_id)
    }

    pub fn engine(&self) -> &SharedEngine<M> {
        &self.engine
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.engine
            .lock()
            .room()
            .map(|room| room.participants.clone())
            .unwrap_or_default()
    }

    pub fn handle_server_message(&self, message: ServerMessage) {
        let now = now_millis();
        match message {
            ServerMessage::Playback(event) => {
                self.engine.lock().apply_remote_event(&event, now);
            }
            ServerMessage::ParticipantJoined {
                participant,
                participants,
            } => {
                tracing::info!("{} joined ({} watching)", participant.display_name, participants.len());
                if let Some(room) = self.engine.lock().room_mut() {
                    room.participants = participants;
                }
            }
            ServerMessage::ParticipantLeft {
                participant_id,
                participants,
            } => {
                tracing::info!("Participant {} left ({} watching)", participant_id, participants.len());
                if let Some(room) = self.engine.lock().room_mut() {
                    room.participants = participants;
                }
            }
            ServerMessage::HostMigrated { new_host_id } => {
                let is_host = new_host_id == self.participant_id;
                tracing::info!(
                    "Host migrated to {}{}",
                    new_host_id,
                    if is_host { " (you)" } else { "" }
                );
                let mut engine = self.engine.lock();
                if let Some(room) = engine.room_mut() {
                    room.host_id = new_host_id;
                }
                engine.set_role(is_host, is_host || self.everyone_controls);
            }
            ServerMessage::VideoChanged {
                video_url,
                server_time,
            } => {
                tracing::info!("Video changed to {}", video_url);
                if let Err(err) = self.engine.lock().video_changed(&video_url, server_time) {
                    tracing::warn!("Cannot play new video: {}", err);
                }
            }
            ServerMessage::Error { message } => {
                tracing::warn!("Server error: {}", message);
            }
            ServerMessage::Reply { request_id, .. } => {
                tracing::debug!("Unrouted reply for request {}", request_id);
            }
        }
    }

    /// Drain local media callbacks and forward user-originated controls.
    pub fn pump(&self) -> Result<(), SyncError> {
        let controls = self.engine.lock().pump(now_millis());
        for control in controls {
            tracing::debug!("Sending {:?} at {:.2}s", control.action, control.position);
            self.client.send_control(
                self.room_id.clone(),
                control.action,
                control.position,
                control.duration,
            )?;
        }
        Ok(())
    }

    /// Fetch fresh state and correct local playback, regardless of drift.
    pub async fn force_sync(&self) -> Result<Option<DriftReport>, SyncError> {
        let Some(_slot) = CheckSlot::acquire(&self.check_in_flight) else {
            tracing::debug!("Sync check already in flight");
            return Ok(None);
        };
        let sample = self.client.request_sync(self.room_id.clone()).await?;
        Ok(self
            .engine
            .lock()
            .force_sync(sample.room, sample.round_trip, now_millis()))
    }

    pub fn set_video(&self, video_url: String) -> Result<(), SyncError> {
        self.client.set_video(self.room_id.clone(), video_url)
    }

    /// Leave the room and stop the drift timer.
    pub fn leave(mut self) -> Result<(), SyncError> {
        if let Some(timer) = self.drift_timer.take() {
            timer.stop();
        }
        tracing::info!("Leaving room {}", self.room_id);
        self.client
            .leave_room(self.room_id.clone(), self.participant_id)
    }
}

/// Periodic drift check bound to one membership. Aborted when dropped.
pub struct DriftTimer {
    handle: JoinHandle<()>,
}

impl DriftTimer {
    pub fn spawn<M: MediaElement + 'static>(
        client: SyncClient,
        engine: SharedEngine<M>,
        room_id: String,
        interval: Duration,
        in_flight: Arc<AtomicBool>,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if engine.lock().is_host() {
                    continue;
                }
                let Some(_slot) = CheckSlot::acquire(&in_flight) else {
                    continue;
                };

                match client.request_sync(room_id.clone()).await {
                    Ok(sample) => {
                        let report =
                            engine
                                .lock()
                                .check_drift(sample.room, sample.round_trip, now_millis());
                        if let Some(report) = report.filter(|report| !report.in_sync) {
                            tracing::info!(
                                "Out of sync by {:.0}ms; sync to catch up",
                                report.drift_ms
                            );
                        }
                    }
                    Err(err) => tracing::debug!("Drift check failed: {}", err),
                }
            }
        });
        Self { handle }
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for DriftTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Held while a sync request is outstanding.
struct CheckSlot(Arc<AtomicBool>);

impl CheckSlot {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CheckSlot(Arc::clone(flag)))
    }
}

impl Drop for CheckSlot {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

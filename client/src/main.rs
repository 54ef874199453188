use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::{mpsc, oneshot},
    time::Duration,
};

use syncstream_client::{
    clock::now_millis,
    invite::parse_invite_url,
    sync::SyncStatsSnapshot,
    ClientConfig, MediaElement, Reconciler, SimulatedPlayer, SyncClient, SyncError, WatchSession,
};

type Session = WatchSession<SimulatedPlayer>;

#[derive(Parser)]
#[command(name = "syncstream-client", version, about = "Headless synchronized watch client")]
struct Cli {
    #[command(flatten)]
    config: ClientConfig,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a room for an HLS stream and host it
    Create { video_url: String },
    /// Join a room by id or invite link
    Join { invite: String },
}

/// What to do on the next successful connection.
enum Target {
    Create(String),
    Join(String),
}

#[derive(Debug, Clone, PartialEq)]
enum UserCommand {
    Play,
    Pause,
    Seek(f64),
    Sync,
    Click,
    Status,
    Invite,
    Video(String),
    Leave,
    Help,
}

enum Exit {
    Quit,
    Disconnected,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "syncstream_client=debug,info".into()),
        )
        .init();

    let cli = Cli::parse();
    let target = match cli.command {
        Command::Create { video_url } => Target::Create(video_url),
        Command::Join { invite } => {
            let link = parse_invite_url(&invite)
                .ok_or_else(|| anyhow!("not a room id or invite link: {invite}"))?;
            Target::Join(link.room_id)
        }
    };

    let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    run_connection_loop(cli.config, target, line_rx).await
}

async fn run_connection_loop(
    config: ClientConfig,
    mut target: Target,
    mut lines: mpsc::UnboundedReceiver<String>,
) -> Result<()> {
    let client = SyncClient::new(config.request_timeout());
    let engine = Arc::new(Mutex::new(Reconciler::new(
        SimulatedPlayer::new(config.autoplay),
        config.reconcile_settings(),
    )));
    let current: Arc<Mutex<Option<Arc<Session>>>> = Arc::new(Mutex::new(None));
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        tracing::info!(
            "Connecting to {} (attempt {attempt})...",
            config.server_url
        );

        let handler_slot = Arc::clone(&current);
        match client
            .connect(&config.server_url, move |msg| {
                if let Some(session) = handler_slot.lock().as_ref() {
                    session.handle_server_message(msg);
                }
            })
            .await
        {
            Ok(disconnected) => {
                client.mark_connected();
                match establish(&client, &engine, &config, &mut target).await {
                    Ok(session) => {
                        attempt = 0;
                        let session = Arc::new(session);
                        *current.lock() = Some(Arc::clone(&session));
                        println!("Room {} | invite: {}", session.room_id(), session.invite_link());

                        let exit = drive(&session, &client, disconnected, &mut lines).await;
                        current.lock().take();
                        match exit {
                            Exit::Quit => {
                                if let Ok(session) = Arc::try_unwrap(session) {
                                    if let Err(err) = session.leave() {
                                        tracing::debug!("Leave not delivered: {}", err);
                                    }
                                }
                                return Ok(());
                            }
                            Exit::Disconnected => {
                                client.mark_disconnected();
                                tracing::warn!("Lost connection to sync server");
                            }
                        }
                    }
                    Err(err) if err.is_retryable() => {
                        tracing::warn!("Could not enter room: {}", err);
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            Err(e) => {
                tracing::warn!("Failed to connect to {}: {}", config.server_url, e);
            }
        }

        let capped_attempt = attempt.clamp(1, 6);
        let delay = Duration::from_secs(2 * capped_attempt as u64);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {},
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted; stopping connection loop");
                return Ok(());
            }
        }
    }
}

/// Create or join, then hand the membership to a session. Reconnects rejoin
/// the same room.
async fn establish(
    client: &SyncClient,
    engine: &Arc<Mutex<Reconciler<SimulatedPlayer>>>,
    config: &ClientConfig,
    target: &mut Target,
) -> Result<Session, SyncError> {
    let joined = match target {
        Target::Create(video_url) => {
            client
                .create_room(video_url.clone(), config.display_name.clone())
                .await?
        }
        Target::Join(room_id) => {
            client
                .join_room(room_id.clone(), config.display_name.clone())
                .await?
        }
    };
    *target = Target::Join(joined.room.room_id.clone());

    WatchSession::start(
        client.clone(),
        Arc::clone(engine),
        joined,
        config.everyone_controls,
        config.drift_interval(),
    )
}

async fn drive(
    session: &Session,
    client: &SyncClient,
    mut disconnected: oneshot::Receiver<()>,
    lines: &mut mpsc::UnboundedReceiver<String>,
) -> Exit {
    let mut pump = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = &mut disconnected => return Exit::Disconnected,
            _ = pump.tick() => {
                if let Err(err) = session.pump() {
                    tracing::warn!("Could not send control: {}", err);
                }
            }
            line = lines.recv() => {
                let Some(line) = line else {
                    return Exit::Quit;
                };
                match parse_command(&line) {
                    Some(UserCommand::Leave) => return Exit::Quit,
                    Some(command) => execute(session, client, command).await,
                    None if line.trim().is_empty() => {}
                    None => println!("Unknown command; type `help`"),
                }
            }
            _ = tokio::signal::ctrl_c() => return Exit::Quit,
        }
    }
}

async fn execute(session: &Session, client: &SyncClient, command: UserCommand) {
    let now = now_millis();
    match command {
        UserCommand::Play => session.engine().lock().user_play(),
        UserCommand::Pause => session.engine().lock().user_pause(),
        UserCommand::Seek(position) => session.engine().lock().user_seek(position),
        UserCommand::Click => session.engine().lock().enable_playback(now),
        UserCommand::Sync => match session.force_sync().await {
            Ok(Some(report)) => println!("Synced (drift was {:.0}ms)", report.drift_ms),
            Ok(None) => println!("Nothing to sync"),
            Err(err) => tracing::warn!("Sync failed: {}", err),
        },
        UserCommand::Video(url) => {
            if !session.engine().lock().can_control() {
                println!("Only the host can change the video");
                return;
            }
            match session.set_video(url.clone()) {
                Ok(()) => {
                    if let Err(err) = session.engine().lock().video_changed(&url, now) {
                        tracing::warn!("Cannot play new video: {}", err);
                    }
                }
                Err(err) => tracing::warn!("Could not change video: {}", err),
            }
        }
        UserCommand::Status => print_status(session, client),
        UserCommand::Invite => println!("{}", session.invite_link()),
        UserCommand::Help => println!(
            "commands: play | pause | seek <secs> | sync | click | video <url> | status | invite | leave"
        ),
        UserCommand::Leave => {}
    }
}

fn print_status(session: &Session, client: &SyncClient) {
    let stats = client.stats_snapshot();
    let engine = session.engine().lock();
    let status = engine.status();
    let position = engine.media().position().unwrap_or(0.0);

    println!(
        "{} | {} at {:.1}s | {} | {} watching{}",
        session.room_id(),
        if engine.media().is_playing() { "playing" } else { "paused" },
        position,
        if status.in_sync {
            "in sync".to_string()
        } else {
            format!("drift {:.0}ms", status.drift_ms)
        },
        engine.room().map_or(0, |room| room.participants.len()),
        if engine.is_host() { " | host" } else { "" },
    );
    if status.needs_interaction {
        println!("Playback is blocked; type `click` to start");
    }
    println!("{}", connection_line(&stats));
}

fn connection_line(stats: &SyncStatsSnapshot) -> String {
    let mut parts = vec![match stats.connected_duration {
        Some(secs) => format!("connected {secs:.0}s"),
        None => "disconnected".to_string(),
    }];
    if stats.reconnect_attempts > 0 {
        parts.push(format!("{} reconnects", stats.reconnect_attempts));
    }
    if let Some(rtt) = stats.last_rtt_ms {
        parts.push(format!("rtt {rtt:.0}ms"));
    }
    parts.push(format!("{} in / {} out", stats.messages_in, stats.messages_out));
    if let Some(age) = stats.last_message_age {
        parts.push(format!("last message {age:.1}s ago"));
    }
    parts.join(", ")
}

fn parse_command(line: &str) -> Option<UserCommand> {
    let mut parts = line.split_whitespace();
    let command = match parts.next()?.to_ascii_lowercase().as_str() {
        "play" => UserCommand::Play,
        "pause" => UserCommand::Pause,
        "seek" => UserCommand::Seek(parts.next()?.parse().ok().filter(|p: &f64| p.is_finite())?),
        "sync" => UserCommand::Sync,
        "click" => UserCommand::Click,
        "status" => UserCommand::Status,
        "invite" => UserCommand::Invite,
        "video" => UserCommand::Video(parts.next()?.to_string()),
        "leave" | "quit" | "exit" => UserCommand::Leave,
        "help" => UserCommand::Help,
        _ => return None,
    };
    Some(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(parse_command("play"), Some(UserCommand::Play));
        assert_eq!(parse_command("  SEEK 12.5 "), Some(UserCommand::Seek(12.5)));
        assert_eq!(
            parse_command("video https://ex.com/b.m3u8"),
            Some(UserCommand::Video("https://ex.com/b.m3u8".into()))
        );
        assert_eq!(parse_command("quit"), Some(UserCommand::Leave));
    }

    #[test]
    fn rejects_incomplete_commands() {
        assert_eq!(parse_command(""), None);
        assert_eq!(parse_command("seek"), None);
        assert_eq!(parse_command("seek NaN"), None);
        assert_eq!(parse_command("dance"), None);
    }

    #[test]
    fn connection_line_reports_link_health() {
        let stats = SyncStatsSnapshot {
            messages_out: 4,
            messages_in: 9,
            last_rtt_ms: Some(42.4),
            last_message_age: Some(1.5),
            connected_duration: Some(95.0),
            reconnect_attempts: 2,
        };
        assert_eq!(
            connection_line(&stats),
            "connected 95s, 2 reconnects, rtt 42ms, 9 in / 4 out, last message 1.5s ago"
        );

        let idle = SyncStatsSnapshot {
            connected_duration: None,
            reconnect_attempts: 0,
            last_rtt_ms: None,
            last_message_age: None,
            ..stats
        };
        assert_eq!(connection_line(&idle), "disconnected, 9 in / 4 out");
    }
}

use axum::{
    extract::{
        ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{HeaderValue, Method},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::{AllowOrigin, CorsLayer};

use syncstream_server::protocol::ServerMessage;
use syncstream_server::rate_limit::RateLimiter;
use syncstream_server::{RoomRegistry, ServerConfig, SessionHub};

#[derive(Clone)]
struct AppState {
    hub: SessionHub,
    started_at: Instant,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "syncstream_server=debug,info".into()),
        )
        .init();

    let config = ServerConfig::from_env();
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    let registry = RoomRegistry::new(config.max_participants, config.authority_policy);
    let limiter = RateLimiter::new(config.rate_limit_window, config.rate_limit_max_creations);
    let hub = SessionHub::new(registry, limiter);

    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    let sweeper = hub.spawn_sweeper(config.sweep_interval, config.room_timeout, shutdown_rx);

    let app_state = AppState {
        hub,
        started_at: Instant::now(),
    };

    let app = Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/healthz", get(health_check))
        .route("/ws", get(ws_endpoint))
        .layer(cors_layer(&config))
        .with_state(app_state);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("SyncStream server listening on {}", addr);
    tracing::info!(
        "Rooms: max {} participants, {:?} inactivity timeout, {:?} authority",
        config.max_participants,
        config.room_timeout,
        config.authority_policy
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    let _ = shutdown_tx.send(());
    let _ = sweeper.await;
    tracing::info!("Server stopped");
    Ok(())
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = ["http://localhost:5173", "http://localhost:5174"]
        .into_iter()
        .map(str::to_string)
        .chain(config.client_url.iter().map(|url| url.trim_end_matches('/').to_string()))
        .filter_map(|origin| HeaderValue::from_str(&origin).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutting down gracefully...");
}

async fn ws_endpoint(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, peer, state))
}

async fn index() -> Json<serde_json::Value> {
    Json(json!({
        "name": "SyncStream API",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "rooms": state.hub.registry().room_count(),
        "connections": state.hub.connection_count(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn health_check() -> &'static str {
    "ok"
}

async fn handle_connection(socket: WebSocket, peer: SocketAddr, state: AppState) {
    let hub = state.hub;
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let connection_id = hub.connect(peer.ip().to_string(), tx);

    // Spawn task to send messages to client
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {}", e);
                    continue;
                }
            };

            if let Err(e) = ws_sender.send(AxumWsMessage::Text(json)).await {
                tracing::error!("Failed to send message: {}", e);
                break;
            }
        }
    });

    // Inbound messages are handled one at a time, in arrival order
    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(AxumWsMessage::Text(text)) => {
                if let Err(e) = hub.handle_text(connection_id, &text) {
                    tracing::warn!("Rejected message from {}: {}", connection_id, e);
                    hub.send(
                        connection_id,
                        ServerMessage::Error {
                            message: format!("invalid message: {e}"),
                        },
                    );
                }
            }
            Ok(AxumWsMessage::Close(_)) => {
                tracing::info!("Client {} closing connection", connection_id);
                break;
            }
            Err(e) => {
                tracing::error!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    hub.disconnect(connection_id);
    send_task.abort();
}

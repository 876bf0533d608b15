use chainpulse_data::{
    AggregateView, DataConfig, HttpProvider, MetricsOrchestrator, NetworkId, Timeframe,
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::broadcast,
};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

const DEFAULT_PROVIDER_URL: &str = "http://127.0.0.1:8080/api/";
const DEFAULT_NETWORK: &str = "ethereum";
const DEFAULT_WS_BUFFER_SIZE: usize = 64;

type Orchestrator = MetricsOrchestrator<HttpProvider>;

/// Aggregate view wrapper for JSON serialization
#[derive(Debug, Clone, Serialize)]
struct ViewMessage {
    r#type: &'static str,
    timestamp: DateTime<Utc>,
    view: AggregateView,
}

impl From<AggregateView> for ViewMessage {
    fn from(view: AggregateView) -> Self {
        Self {
            r#type: "metrics",
            timestamp: Utc::now(),
            view,
        }
    }
}

/// Commands a dashboard client may send
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientCommand {
    Load {
        network: NetworkId,
        timeframe: Timeframe,
    },
    Refresh,
}

#[tokio::main]
async fn main() {
    // Initialize logging
    init_logging();

    info!("Starting chainpulse-data WebSocket server");

    // Upstream provider
    // Configurable via CHAINPULSE_PROVIDER_URL env var (default: http://127.0.0.1:8080/api/)
    let provider_url = std::env::var("CHAINPULSE_PROVIDER_URL")
        .unwrap_or_else(|_| DEFAULT_PROVIDER_URL.to_string());
    let provider_url = match Url::parse(&provider_url) {
        Ok(url) => url,
        Err(error) => {
            error!(%provider_url, %error, "invalid CHAINPULSE_PROVIDER_URL");
            return;
        }
    };
    let mut provider = HttpProvider::new(provider_url.clone());
    if let Some(timeout) = env_parse::<u64>("CHAINPULSE_HTTP_TIMEOUT_SECS") {
        provider = provider.with_timeout(Duration::from_secs(timeout));
    }

    let network = std::env::var("CHAINPULSE_NETWORK")
        .map(NetworkId::from)
        .unwrap_or_else(|_| NetworkId::new(DEFAULT_NETWORK));
    let timeframe = env_parse::<Timeframe>("CHAINPULSE_TIMEFRAME").unwrap_or_default();

    let config = DataConfig::from_env();
    info!(%provider_url, %network, %timeframe, ?config, "Data layer configured");

    let orchestrator = Arc::new(MetricsOrchestrator::new(provider, config));

    // Create broadcast channel for aggregate views
    // Configurable buffer size via WS_BUFFER_SIZE env var (default: 64)
    let buffer_size = env_parse("WS_BUFFER_SIZE").unwrap_or(DEFAULT_WS_BUFFER_SIZE);
    info!("WebSocket broadcast buffer size: {}", buffer_size);
    let (tx, _rx) = broadcast::channel::<ViewMessage>(buffer_size.max(1));
    let tx = Arc::new(tx);

    // Start WebSocket server
    // Configurable via WS_ADDR env var (default: 0.0.0.0:9001)
    let server_addr = std::env::var("WS_ADDR")
        .ok()
        .and_then(|addr| addr.parse::<SocketAddr>().ok())
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 9001)));
    let listener = match TcpListener::bind(&server_addr).await {
        Ok(listener) => listener,
        Err(error) => {
            error!(%server_addr, %error, "Failed to bind WebSocket server");
            return;
        }
    };
    tokio::spawn(start_websocket_server(
        listener,
        Arc::clone(&tx),
        Arc::clone(&orchestrator),
    ));

    info!("WebSocket server listening on ws://{}", server_addr);
    info!("Clients can connect to receive dashboard metric views");

    // Forward every published view to connected clients
    tokio::spawn(forward_views(Arc::clone(&orchestrator), Arc::clone(&tx)));

    orchestrator.load(network, timeframe).await;
    let auto_refresh = orchestrator.spawn_auto_refresh();

    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(%error, "Failed to listen for shutdown signal");
    }

    info!("Shutting down");
    auto_refresh.shutdown().await;
    orchestrator.shutdown();
}

/// Publish every view change of the orchestrator to the broadcast channel
async fn forward_views(orchestrator: Arc<Orchestrator>, tx: Arc<broadcast::Sender<ViewMessage>>) {
    let mut views = orchestrator.subscribe();

    while views.changed().await.is_ok() {
        let view = views.borrow_and_update().clone();
        if view.is_degraded && !view.is_loading {
            warn!(
                network = %view.network,
                timeframe = %view.timeframe,
                error = view.error.as_deref().unwrap_or_default(),
                "Serving degraded view"
            );
        }

        // Broadcast to all connected clients (ignore errors if no receivers)
        match tx.send(ViewMessage::from(view)) {
            Ok(count) => debug!("View sent to {} receivers", count),
            Err(_) => debug!("No clients connected, view dropped"),
        }
    }

    info!("View publisher closed");
}

/// Start WebSocket server that broadcasts aggregate views to connected clients
async fn start_websocket_server(
    listener: TcpListener,
    tx: Arc<broadcast::Sender<ViewMessage>>,
    orchestrator: Arc<Orchestrator>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                info!("New WebSocket connection from {}", peer_addr);
                tokio::spawn(handle_client(
                    stream,
                    peer_addr,
                    Arc::clone(&tx),
                    Arc::clone(&orchestrator),
                ));
            }
            Err(error) => {
                error!(%error, "Failed to accept WebSocket connection");
                break;
            }
        }
    }
}

/// Handle individual WebSocket client connection
async fn handle_client(
    stream: TcpStream,
    peer_addr: SocketAddr,
    tx: Arc<broadcast::Sender<ViewMessage>>,
    orchestrator: Arc<Orchestrator>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", peer_addr, e);
            return;
        }
    };

    info!("WebSocket handshake completed for {}", peer_addr);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let mut rx = tx.subscribe();

    // Send welcome message followed by the current view
    let welcome = serde_json::json!({
        "type": "welcome",
        "message": "Connected to chainpulse-data metrics feed",
        "timestamp": Utc::now()
    });
    for message in [
        serde_json::to_string(&welcome),
        serde_json::to_string(&ViewMessage::from(orchestrator.view())),
    ] {
        match message {
            Ok(json) => {
                if ws_sender.send(Message::Text(json.into())).await.is_err() {
                    return;
                }
            }
            Err(error) => warn!(%error, "Failed to serialise initial message"),
        }
    }

    // Spawn task to send views to this client
    let mut send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(message) => match serde_json::to_string(&message) {
                    Ok(json) => {
                        if ws_sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => warn!(%error, "Failed to serialise view"),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Only the latest view matters, so a lagging client just skips ahead
                    warn!("Client {} lagged, skipped {} views", peer_addr, skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Broadcast channel closed for {}", peer_addr);
                    break;
                }
            }
        }
    });

    // Handle incoming messages from client (commands, ping/pong)
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(_)) => {
                    // Tungstenite handles pong automatically
                    debug!("Received ping from {}", peer_addr);
                }
                Ok(Message::Text(text)) => {
                    handle_command(&orchestrator, peer_addr, text.as_str());
                }
                Err(e) => {
                    error!("WebSocket error for {}: {}", peer_addr, e);
                    break;
                }
                _ => {}
            }
        }
    });

    // Wait for either task to complete
    tokio::select! {
        _ = &mut send_task => {
            info!("Send task completed for {}", peer_addr);
            recv_task.abort();
        }
        _ = &mut recv_task => {
            info!("Receive task completed for {}", peer_addr);
            send_task.abort();
        }
    }

    info!("WebSocket connection closed for {}", peer_addr);
}

/// Run a client command in the background; results reach every client via the broadcast
fn handle_command(orchestrator: &Arc<Orchestrator>, peer_addr: SocketAddr, text: &str) {
    let command = match serde_json::from_str::<ClientCommand>(text) {
        Ok(command) => command,
        Err(error) => {
            debug!("Ignoring unrecognised message from {}: {}", peer_addr, error);
            return;
        }
    };

    info!(?command, "Command from {}", peer_addr);
    let orchestrator = Arc::clone(orchestrator);
    tokio::spawn(async move {
        match command {
            ClientCommand::Load { network, timeframe } => {
                orchestrator.load(network, timeframe).await;
            }
            ClientCommand::Refresh => {
                orchestrator.refresh().await;
            }
        }
    });
}

fn env_parse<T>(key: &str) -> Option<T>
where
    T: std::str::FromStr,
{
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}

/// Initialize logging
fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_client_commands() {
        struct TestCase {
            input: &'static str,
            expected: Option<(&'static str, Timeframe)>,
        }

        let tests = vec![
            TestCase {
                // TC0: load with network and timeframe
                input: r#"{"type":"load","network":"solana","timeframe":"7D"}"#,
                expected: Some(("solana", Timeframe::Week)),
            },
            TestCase {
                // TC1: refresh carries no payload
                input: r#"{"type":"refresh"}"#,
                expected: None,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = serde_json::from_str::<ClientCommand>(test.input).unwrap();
            match (actual, test.expected) {
                (ClientCommand::Load { network, timeframe }, Some((expected_network, expected_timeframe))) => {
                    assert_eq!(network, expected_network, "TC{} failed", index);
                    assert_eq!(timeframe, expected_timeframe, "TC{} failed", index);
                }
                (ClientCommand::Refresh, None) => {}
                (actual, expected) => panic!("TC{index} failed: {actual:?} vs {expected:?}"),
            }
        }
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        assert!(serde_json::from_str::<ClientCommand>(r#"{"type":"subscribe"}"#).is_err());
    }

    #[test]
    fn test_view_message_serialises_with_type_tag() {
        let view = AggregateView::placeholder(NetworkId::new("ethereum"), Timeframe::Month);
        let json = serde_json::to_value(ViewMessage::from(view)).unwrap();

        assert_eq!(json["type"], "metrics");
        assert_eq!(json["view"]["network"], "ethereum");
        assert_eq!(json["view"]["timeframe"], "30D");
        assert!(json["view"]["usage"]["metrics"]["activeAddresses"].is_object());
    }
}

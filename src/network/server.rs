//! WebSocket Wager Server
//!
//! Async WebSocket server for wager operations. Handles authentication,
//! request routing into the lifecycle engine, and the periodic sweep that
//! cancels expired wagers.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::interval;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::network::auth::{validate_token, AuthConfig, AuthError};
use crate::network::protocol::{
    AdjudicateRequest, AuthRequest, AuthResult, ClientMessage, CreateWagerRequest, ErrorCode,
    EvidenceUpload, JoinWagerRequest, ListRequest, ServerError, ServerMessage,
    VerificationResult, VerifyRequest, WagerView,
};
use crate::ports::escrow::EscrowLedger;
use crate::ports::extractor::StatsExtractor;
use crate::wager::engine::{Ruling, WagerEngine};
use crate::wager::state::{ParticipantId, WagerId};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// How often the expiry sweep runs.
    pub sweep_interval: Duration,
    /// Idle connections are dropped after this long.
    pub idle_timeout: Duration,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().unwrap(),
            max_connections: 1000,
            sweep_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(300),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Wager server errors.
#[derive(Debug, thiserror::Error)]
pub enum WagerServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Connected client state.
struct ConnectedClient {
    /// Participant identity (after auth).
    participant: Option<ParticipantId>,
    /// Is authenticated.
    authenticated: bool,
    /// Connection time.
    #[allow(dead_code)]
    connected_at: Instant,
    /// Last activity.
    last_activity: Instant,
    /// Message sender (for direct messaging to client).
    #[allow(dead_code)]
    sender: mpsc::Sender<ServerMessage>,
}

type ClientMap = Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>;

/// The wager server.
pub struct WagerServer<L, X> {
    /// Server configuration.
    config: ServerConfig,
    /// Auth configuration.
    auth: AuthConfig,
    /// Lifecycle engine.
    engine: Arc<WagerEngine<L, X>>,
    /// Connected clients.
    clients: ClientMap,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl<L, X> WagerServer<L, X>
where
    L: EscrowLedger + 'static,
    X: StatsExtractor + 'static,
{
    /// Create a new wager server.
    pub fn new(config: ServerConfig, auth: AuthConfig, engine: WagerEngine<L, X>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            auth,
            engine: Arc::new(engine),
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        }
    }

    /// Run the server.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), WagerServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Wager server listening on {}", self.config.bind_addr);

        if !self.auth.is_configured() {
            warn!("authentication not configured; all connections will be rejected at auth");
        }

        // Spawn expiry sweep task
        let sweep_engine = self.engine.clone();
        let sweep_interval = self.config.sweep_interval;
        let sweep_handle = tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);
            loop {
                ticker.tick().await;
                sweep_engine.cancel_expired().await;
            }
        });

        // Spawn idle-client cleanup task
        let cleanup_clients = self.clients.clone();
        let idle_timeout = self.config.idle_timeout;
        let cleanup_handle = tokio::spawn(async move {
            Self::run_cleanup_loop(cleanup_clients, idle_timeout).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.clients.read().await.len();
                            if clients_count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        // Wait for background tasks
        sweep_handle.abort();
        cleanup_handle.abort();

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let clients = self.clients.clone();
        let engine = self.engine.clone();
        let auth = self.auth.clone();
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(64);

            // Register client
            {
                let mut clients = clients.write().await;
                clients.insert(
                    addr,
                    ConnectedClient {
                        participant: None,
                        authenticated: false,
                        connected_at: Instant::now(),
                        last_activity: Instant::now(),
                        sender: msg_tx.clone(),
                    },
                );
            }

            // Spawn message sender task
            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            });

            // Handle incoming messages
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let client_msg = match ClientMessage::from_json(&text) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", addr, e);
                                        let _ = msg_tx.send(ServerMessage::Error(
                                            ServerError::new(
                                                ErrorCode::InvalidRequest,
                                                "Invalid message format",
                                            ),
                                        )).await;
                                        continue;
                                    }
                                };

                                // Update activity
                                {
                                    let mut clients = clients.write().await;
                                    if let Some(client) = clients.get_mut(&addr) {
                                        client.last_activity = Instant::now();
                                    }
                                }

                                Self::handle_client_message(
                                    addr,
                                    client_msg,
                                    &clients,
                                    &engine,
                                    &auth,
                                    &config,
                                    &msg_tx,
                                ).await;
                            }
                            Some(Ok(Message::Binary(data))) => {
                                // The binary path carries raw evidence.
                                match EvidenceUpload::from_bytes(&data) {
                                    Ok(upload) => {
                                        Self::handle_evidence_upload(
                                            addr, upload, &clients, &engine, &msg_tx,
                                        ).await;
                                    }
                                    Err(e) => {
                                        debug!("Invalid binary frame from {}: {}", addr, e);
                                        let _ = msg_tx.send(ServerMessage::Error(
                                            ServerError::new(
                                                ErrorCode::InvalidRequest,
                                                "Invalid evidence frame",
                                            ),
                                        )).await;
                                    }
                                }
                            }
                            Some(Ok(Message::Ping(_))) => {
                                let _ = msg_tx.send(ServerMessage::Pong {
                                    timestamp: 0,
                                    server_time: now_millis(),
                                }).await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = msg_tx.send(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            // Cleanup
            sender_task.abort();

            {
                let mut clients = clients.write().await;
                clients.remove(&addr);
            }

            info!("Client {} cleaned up", addr);
        });
    }

    /// Handle a client message.
    async fn handle_client_message(
        addr: SocketAddr,
        msg: ClientMessage,
        clients: &ClientMap,
        engine: &Arc<WagerEngine<L, X>>,
        auth: &AuthConfig,
        config: &ServerConfig,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        match msg {
            ClientMessage::Auth(request) => {
                Self::handle_auth(addr, request, clients, auth, config, sender).await;
            }
            ClientMessage::Create(request) => {
                Self::handle_create(addr, request, clients, engine, sender).await;
            }
            ClientMessage::Join(request) => {
                Self::handle_join(addr, request, clients, engine, sender).await;
            }
            ClientMessage::Verify(request) => {
                Self::handle_verify(addr, request, clients, engine, sender).await;
            }
            ClientMessage::Adjudicate(request) => {
                Self::handle_adjudicate(addr, request, clients, engine, sender).await;
            }
            ClientMessage::List(request) => {
                Self::handle_list(addr, request, clients, engine, sender).await;
            }
            ClientMessage::Ping { timestamp } => {
                let _ = sender
                    .send(ServerMessage::Pong {
                        timestamp,
                        server_time: now_millis(),
                    })
                    .await;
            }
        }
    }

    /// Handle authentication.
    async fn handle_auth(
        addr: SocketAddr,
        request: AuthRequest,
        clients: &ClientMap,
        auth: &AuthConfig,
        config: &ServerConfig,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        let claims = match validate_token(&request.token, auth) {
            Ok(claims) => claims,
            Err(e) => {
                debug!("Auth failed for {}: {}", addr, e);
                let _ = sender
                    .send(ServerMessage::Error(ServerError::new(
                        map_auth_error(&e),
                        e.to_string(),
                    )))
                    .await;
                return;
            }
        };

        let participant = claims.participant_id();
        {
            let mut clients = clients.write().await;
            if let Some(client) = clients.get_mut(&addr) {
                client.participant = Some(participant.clone());
                client.authenticated = true;
            }
        }

        let _ = sender
            .send(ServerMessage::AuthResult(AuthResult {
                success: true,
                participant: Some(participant.to_string()),
                error: None,
                server_version: config.version.clone(),
            }))
            .await;

        debug!("Client {} authenticated as {}", addr, participant);
    }

    /// Authenticated participant for a connection, or an error reply.
    async fn require_auth(
        addr: SocketAddr,
        clients: &ClientMap,
        sender: &mpsc::Sender<ServerMessage>,
    ) -> Option<ParticipantId> {
        let participant = {
            let clients = clients.read().await;
            clients
                .get(&addr)
                .filter(|c| c.authenticated)
                .and_then(|c| c.participant.clone())
        };

        if participant.is_none() {
            let _ = sender
                .send(ServerMessage::Error(ServerError::new(
                    ErrorCode::NotAuthenticated,
                    "Must authenticate first",
                )))
                .await;
        }
        participant
    }

    /// Handle wager creation.
    async fn handle_create(
        addr: SocketAddr,
        request: CreateWagerRequest,
        clients: &ClientMap,
        engine: &Arc<WagerEngine<L, X>>,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        let Some(creator) = Self::require_auth(addr, clients, sender).await else {
            return;
        };

        let reply = match engine.create_wager(request.into_spec(creator)).await {
            Ok(wager) => ServerMessage::Created(WagerView::from(&wager)),
            Err(e) => ServerMessage::Error(ServerError::from(&e)),
        };
        let _ = sender.send(reply).await;
    }

    /// Handle a join request.
    async fn handle_join(
        addr: SocketAddr,
        request: JoinWagerRequest,
        clients: &ClientMap,
        engine: &Arc<WagerEngine<L, X>>,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        let Some(participant) = Self::require_auth(addr, clients, sender).await else {
            return;
        };

        let Some(id) = parse_wager_id(&request.wager_id, sender).await else {
            return;
        };

        let context = request.context();
        let reply = match engine
            .join_wager(id, participant, request.stake_amount, context)
            .await
        {
            Ok(wager) => ServerMessage::Joined(WagerView::from(&wager)),
            Err(e) => ServerMessage::Error(ServerError::from(&e)),
        };
        let _ = sender.send(reply).await;
    }

    /// Handle a verification request with hex-encoded evidence.
    async fn handle_verify(
        addr: SocketAddr,
        request: VerifyRequest,
        clients: &ClientMap,
        engine: &Arc<WagerEngine<L, X>>,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        let Some(claimant) = Self::require_auth(addr, clients, sender).await else {
            return;
        };

        let Some(id) = parse_wager_id(&request.wager_id, sender).await else {
            return;
        };

        let evidence = match request.evidence() {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = sender
                    .send(ServerMessage::Error(ServerError::new(
                        ErrorCode::InvalidRequest,
                        format!("evidence is not valid hex: {e}"),
                    )))
                    .await;
                return;
            }
        };

        Self::run_verification(id, claimant, &evidence, engine, sender).await;
    }

    /// Handle a binary evidence upload.
    async fn handle_evidence_upload(
        addr: SocketAddr,
        upload: EvidenceUpload,
        clients: &ClientMap,
        engine: &Arc<WagerEngine<L, X>>,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        let Some(claimant) = Self::require_auth(addr, clients, sender).await else {
            return;
        };

        let id = WagerId::new(upload.wager_id);
        Self::run_verification(id, claimant, &upload.evidence, engine, sender).await;
    }

    /// Run a verification and send the outcome.
    async fn run_verification(
        id: WagerId,
        claimant: ParticipantId,
        evidence: &[u8],
        engine: &Arc<WagerEngine<L, X>>,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        let reply = match engine.submit_verification(id, claimant, evidence).await {
            Ok(outcome) => ServerMessage::Verified(VerificationResult::from(&outcome)),
            Err(e) => ServerMessage::Error(ServerError::from(&e)),
        };
        let _ = sender.send(reply).await;
    }

    /// Handle a manual adjudication request.
    async fn handle_adjudicate(
        addr: SocketAddr,
        request: AdjudicateRequest,
        clients: &ClientMap,
        engine: &Arc<WagerEngine<L, X>>,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        if Self::require_auth(addr, clients, sender).await.is_none() {
            return;
        }

        let Some(id) = parse_wager_id(&request.wager_id, sender).await else {
            return;
        };

        let ruling = match request.winner {
            Some(winner) => Ruling::Winner(ParticipantId::new(winner)),
            None => Ruling::Void,
        };

        let reply = match engine.adjudicate(id, ruling).await {
            Ok(wager) => ServerMessage::Adjudicated(WagerView::from(&wager)),
            Err(e) => ServerMessage::Error(ServerError::from(&e)),
        };
        let _ = sender.send(reply).await;
    }

    /// Handle a listing request.
    async fn handle_list(
        addr: SocketAddr,
        request: ListRequest,
        clients: &ClientMap,
        engine: &Arc<WagerEngine<L, X>>,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        if Self::require_auth(addr, clients, sender).await.is_none() {
            return;
        }

        let wagers = engine.list_wagers(&request.filter()).await;
        let _ = sender
            .send(ServerMessage::WagerList {
                wagers: wagers.iter().map(WagerView::from).collect(),
            })
            .await;
    }

    /// Run cleanup loop for idle connections.
    async fn run_cleanup_loop(clients: ClientMap, idle_timeout: Duration) {
        let mut ticker = interval(Duration::from_secs(60));

        loop {
            ticker.tick().await;

            let now = Instant::now();
            let to_remove: Vec<_> = {
                let clients = clients.read().await;
                clients
                    .iter()
                    .filter(|(_, c)| now.duration_since(c.last_activity) > idle_timeout)
                    .map(|(addr, _)| *addr)
                    .collect()
            };

            for addr in to_remove {
                let mut clients = clients.write().await;
                if clients.remove(&addr).is_some() {
                    info!("Removed idle client {}", addr);
                }
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// The lifecycle engine behind this server.
    pub fn engine(&self) -> &Arc<WagerEngine<L, X>> {
        &self.engine
    }
}

/// Parse a wager id string, replying with an error on failure.
async fn parse_wager_id(
    raw: &str,
    sender: &mpsc::Sender<ServerMessage>,
) -> Option<WagerId> {
    match WagerId::from_uuid_str(raw) {
        Some(id) => Some(id),
        None => {
            let _ = sender
                .send(ServerMessage::Error(ServerError::new(
                    ErrorCode::InvalidRequest,
                    format!("invalid wager id: {raw}"),
                )))
                .await;
            None
        }
    }
}

/// Map auth errors to wire error codes.
fn map_auth_error(err: &AuthError) -> ErrorCode {
    match err {
        AuthError::Expired => ErrorCode::TokenExpired,
        AuthError::NotConfigured => ErrorCode::AuthFailed,
        _ => ErrorCode::InvalidToken,
    }
}

/// Milliseconds since the Unix epoch.
fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::escrow::InMemoryLedger;
    use crate::ports::extractor::ScoreboardJsonExtractor;
    use crate::wager::engine::EngineConfig;

    fn test_server() -> WagerServer<InMemoryLedger, ScoreboardJsonExtractor> {
        let engine = WagerEngine::new(
            InMemoryLedger::new(),
            ScoreboardJsonExtractor::new(),
            EngineConfig::default(),
        );
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        WagerServer::new(config, AuthConfig::default(), engine)
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = test_server();
        assert_eq!(server.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_server_shutdown() {
        let server = test_server();
        server.shutdown();
        // Should not panic
    }

    #[test]
    fn test_auth_error_codes() {
        assert_eq!(map_auth_error(&AuthError::Expired), ErrorCode::TokenExpired);
        assert_eq!(
            map_auth_error(&AuthError::NotConfigured),
            ErrorCode::AuthFailed
        );
        assert_eq!(
            map_auth_error(&AuthError::InvalidSignature),
            ErrorCode::InvalidToken
        );
    }
}

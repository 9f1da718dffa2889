use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use haul_cache::EphemeralStore;
use haul_engine::{
    HoldAuthority, HoldConfig, HoldManager, Outbox, PresenceConfig, PresenceTracker, RoomBus, RoomConfig,
    SessionConfig, SessionRegistry,
};
use haul_store::messages::MessageRepo;
use haul_store::offers::OfferRepo;
use haul_store::Database;
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::auth::Authenticator;
use crate::client::ClientRegistry;
use crate::config::RelayConfig;
use crate::event_bridge;
use crate::gateway;
use crate::handlers::HandlerState;
use crate::webhooks;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Server configuration.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub max_send_queue: usize,
    pub jwt_secret: SecretString,
    pub webhook_secret: SecretString,
}

impl ServerConfig {
    pub fn from_relay(config: &RelayConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            environment: config.environment.clone(),
            max_send_queue: 256,
            jwt_secret: config.jwt_secret.clone(),
            webhook_secret: config.webhook_secret.clone(),
        }
    }
}

/// The engine components the transport drives.
#[derive(Clone)]
pub struct Services {
    pub outbox: Outbox,
    pub sessions: Arc<SessionRegistry>,
    pub rooms: Arc<RoomBus>,
    pub holds: Arc<HoldManager>,
    pub offers: Arc<OfferRepo>,
}

impl Services {
    pub fn new(store: Arc<dyn EphemeralStore>, db: Database, authority: Arc<dyn HoldAuthority>) -> Self {
        Self::with_hold_config(store, db, authority, HoldConfig::default())
    }

    pub fn with_hold_config(
        store: Arc<dyn EphemeralStore>,
        db: Database,
        authority: Arc<dyn HoldAuthority>,
        hold_config: HoldConfig,
    ) -> Self {
        let outbox = Outbox::default();
        let presence = Arc::new(PresenceTracker::new(Arc::clone(&store), PresenceConfig::default()));
        let sessions = Arc::new(SessionRegistry::new(
            Arc::clone(&store),
            presence,
            SessionConfig::default(),
        ));
        let rooms = Arc::new(RoomBus::new(
            MessageRepo::new(db.clone()),
            Arc::clone(&store),
            outbox.clone(),
            RoomConfig::default(),
        ));
        let holds = Arc::new(HoldManager::new(store, authority, outbox.clone(), hold_config));
        Self {
            outbox,
            sessions,
            rooms,
            holds,
            offers: Arc::new(OfferRepo::new(db)),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub handlers: Arc<HandlerState>,
    pub clients: Arc<ClientRegistry>,
    pub outbox: Outbox,
    pub auth: Arc<Authenticator>,
    pub offers: Arc<OfferRepo>,
    pub webhook_secret: Arc<SecretString>,
    pub environment: Arc<str>,
    pub started_at: Instant,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let webhooks = Router::new()
        .route("/offer-created", post(webhooks::offer_created))
        .route("/message-sent", post(webhooks::message_sent))
        .route("/hold-placed", post(webhooks::hold_placed))
        .route("/hold-removed", post(webhooks::hold_removed))
        .layer(TimeoutLayer::new(WEBHOOK_TIMEOUT));

    Router::new()
        .route("/ws", get(gateway::ws_handler))
        .route("/health", get(health_handler))
        .nest("/webhooks", webhooks)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(config: ServerConfig, services: Services) -> Result<ServerHandle, std::io::Error> {
    let clients = Arc::new(ClientRegistry::new(config.max_send_queue));
    let cancel = CancellationToken::new();

    // Start event bridge
    let bridge = event_bridge::create_bridge(Arc::clone(&clients), services.outbox.subscribe());

    let expiry = services
        .holds
        .spawn_expiry_listener(cancel.clone())
        .await
        .map_err(std::io::Error::other)?;

    let state = AppState {
        handlers: Arc::new(HandlerState {
            sessions: services.sessions,
            rooms: services.rooms,
            holds: services.holds,
        }),
        clients,
        outbox: services.outbox,
        auth: Arc::new(Authenticator::new(&config.jwt_secret)),
        offers: services.offers,
        webhook_secret: Arc::new(config.webhook_secret),
        environment: Arc::from(config.environment.as_str()),
        started_at: Instant::now(),
    };

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(
        port = local_addr.port(),
        environment = %config.environment,
        "relay server started"
    );

    let shutdown = cancel.clone();
    let server = tokio::spawn(async move {
        let serve = axum::serve(listener, router).with_graceful_shutdown(async move { shutdown.cancelled().await });
        if let Err(e) = serve.await {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        cancel,
        server,
        bridge,
        expiry,
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    cancel: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    bridge: tokio::task::JoinHandle<()>,
    expiry: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting, stop the expiry listener, wait briefly for the
    /// server to drain.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if tokio::time::timeout(Duration::from_secs(5), self.server).await.is_err() {
            tracing::warn!("server did not drain in time");
        }
        let _ = self.expiry.await;
        self.bridge.abort();
        tracing::info!("relay server stopped");
    }
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "environment": state.environment.as_ref(),
        "connections": state.clients.count(),
    }))
}

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post, put},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use aperture_api::middleware::require_auth;
use aperture_api::{AppState, AppStateInner, conversations, messages};
use aperture_gateway::router::GroupRouter;
use aperture_gateway::session::{self, HandshakeError};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "aperture=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("APERTURE_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("APERTURE_DB_PATH").unwrap_or_else(|_| "aperture.db".into());
    let host = std::env::var("APERTURE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("APERTURE_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    // Init database
    let db = Arc::new(aperture_db::Database::open(&PathBuf::from(&db_path))?);

    // Shared state. The broadcast router lives for the life of the process
    // and is handed to both the WebSocket layer and the REST layer.
    let router = GroupRouter::new();
    let state: AppState = Arc::new(AppStateInner {
        db,
        jwt_secret,
        router,
    });

    // Routes
    let protected_routes = Router::new()
        .route(
            "/conversations",
            get(conversations::list_conversations).post(conversations::create_conversation),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route(
            "/conversations/{conversation_id}/read",
            post(conversations::read_conversation),
        )
        .route(
            "/conversations/{conversation_id}/mute",
            put(conversations::set_mute),
        )
        .route("/messages/{message_id}/read", post(messages::mark_read))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state.clone());

    let ws_route = Router::new()
        .route("/ws/chat/{conversation_id}", get(ws_upgrade))
        .with_state(state);

    let app = Router::new()
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Aperture server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// The WebSocket handshake cannot carry an Authorization header, so the
/// bearer token rides in a query parameter. Authentication and membership are
/// checked before the upgrade is accepted: a rejected client is refused at
/// the handshake and never sees an open socket.
async fn ws_upgrade(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, StatusCode> {
    let ctx = session::authorize(
        &state.db,
        &state.jwt_secret,
        conversation_id,
        query.token.as_deref(),
    )
    .await
    .map_err(|e| match e {
        HandshakeError::Unauthenticated => StatusCode::UNAUTHORIZED,
        HandshakeError::ConversationNotFound => StatusCode::NOT_FOUND,
        HandshakeError::NotParticipant => StatusCode::FORBIDDEN,
        HandshakeError::Store(err) => {
            warn!("handshake store error: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    })?;

    let router = state.router.clone();
    let db = state.db.clone();
    Ok(ws.on_upgrade(move |socket| session::run(socket, router, db, ctx)))
}

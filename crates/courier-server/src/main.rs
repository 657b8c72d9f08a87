use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use courier_api::middleware::{decode_token, require_auth};
use courier_api::{AppState, AppStateInner, messages};
use courier_gateway::{Gateway, connection};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("COURIER_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("COURIER_DB_PATH").unwrap_or_else(|_| "courier.db".into());
    let host = std::env::var("COURIER_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("COURIER_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    // Init database + gateway
    let db = Arc::new(courier_db::Database::open(&PathBuf::from(&db_path))?);
    let gateway = Gateway::new(db.clone());

    let app_state: AppState = Arc::new(AppStateInner {
        db,
        gateway,
        jwt_secret,
    });

    // Routes
    let protected_routes = Router::new()
        .route("/rooms/{room_id}/messages", get(messages::get_messages))
        .route("/rooms/{room_id}/messages", post(messages::send_message))
        .route("/rooms/{room_id}/read/{up_to}", post(messages::open_room))
        .layer(middleware::from_fn_with_state(
            app_state.clone(),
            require_auth,
        ));

    let app = Router::new()
        .merge(protected_routes)
        .route("/gateway", get(ws_upgrade))
        .with_state(app_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Courier server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Deserialize)]
struct WsQuery {
    token: String,
}

/// WebSocket upgrade. The browser WebSocket API cannot set headers, so the
/// token arrives as a query parameter and is validated before the upgrade.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let Some(claims) = decode_token(&state.jwt_secret, &query.token) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let gateway = state.gateway.clone();
    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, gateway, claims.user_id(), claims.username)
    })
    .into_response()
}

use std::{
    env,
    net::SocketAddr,
    sync::{atomic::{AtomicUsize, Ordering}, Arc},
};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::{mpsc, Mutex};
use tower_http::cors::CorsLayer;

use crate::{
    ai::{AiResponder, OpenAiClient, SaleAnalyzer},
    dashboard::{DashboardApi, HttpDashboardApi},
    dedup::InflightRegistry,
    geo::{GeoResolver, HttpGeoResolver},
    handlers,
    limits::{FailOpen, HttpLimitChecker, LimitChecker},
    store::{ConversationStore, PgConversationStore},
    types::{
        AdminMessageIn, AppState, EventEnvelopeIn, MarkReadIn, RealtimeState, VisitorMessageIn,
    },
};

fn resolve_database_url() -> String {
    if let Ok(url) = env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            return url;
        }
    }
    let host = env::var("POSTGRES_HOST")
        .or_else(|_| env::var("PGHOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_else(|_| "postgres".to_string());
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "livechat".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": Utc::now().to_rfc3339() }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, addr: SocketAddr) {
    let client_id = state.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    {
        let mut rt = state.realtime.lock().await;
        rt.clients.insert(client_id, tx);
        rt.ip_by_client.insert(client_id, addr.ip().to_string());
    }

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };

        let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(&text) else {
            continue;
        };
        let EventEnvelopeIn { event, data } = envelope;

        match event.as_str() {
            "admin:join" => {
                let website_id = data
                    .get("websiteId")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("");
                if website_id.is_empty() {
                    continue;
                }
                let mut rt = state.realtime.lock().await;
                rt.admins.insert(client_id);
                rt.website_by_client
                    .insert(client_id, website_id.to_string());
            }
            "visitor:join" => {
                let website_id = data
                    .get("websiteId")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("");
                if website_id.is_empty() {
                    continue;
                }
                let mut rt = state.realtime.lock().await;
                rt.website_by_client
                    .insert(client_id, website_id.to_string());
                if let Some(visitor_id) = data.get("visitorId").and_then(serde_json::Value::as_str)
                {
                    rt.visitor_by_client
                        .insert(client_id, visitor_id.to_string());
                }
                // Proxied deployments forward the real address in the join
                // payload; it wins over the socket peer address.
                if let Some(ip) = data.get("visitorIp").and_then(serde_json::Value::as_str) {
                    if !ip.trim().is_empty() {
                        rt.ip_by_client.insert(client_id, ip.trim().to_string());
                    }
                }
            }
            "admin-message" => {
                let Ok(msg) = serde_json::from_value::<AdminMessageIn>(data) else {
                    continue;
                };
                handlers::handle_admin_message(&state, client_id, msg).await;
            }
            "visitor-message" => {
                let Ok(msg) = serde_json::from_value::<VisitorMessageIn>(data) else {
                    continue;
                };
                handlers::handle_visitor_message(&state, client_id, msg).await;
            }
            "mark-read" => {
                let Ok(msg) = serde_json::from_value::<MarkReadIn>(data) else {
                    continue;
                };
                handlers::handle_mark_read(&state, client_id, msg).await;
            }
            _ => {}
        }
    }

    {
        let mut rt = state.realtime.lock().await;
        rt.clients.remove(&client_id);
        rt.admins.remove(&client_id);
        rt.website_by_client.remove(&client_id);
        rt.visitor_by_client.remove(&client_id);
        rt.ip_by_client.remove(&client_id);
    }

    send_task.abort();
}

pub async fn run() {
    let _ = dotenvy::dotenv();

    let port = env::var("PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(4000);
    let database_url = resolve_database_url();

    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)");

    sqlx::migrate!("./migrations")
        .run(&db)
        .await
        .expect("failed to run sqlx migrations");

    let http_client = reqwest::Client::new();
    let dashboard_url =
        env::var("DASHBOARD_API_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());
    let geo_url =
        env::var("GEO_API_URL").unwrap_or_else(|_| "https://api.ipquery.io".to_string());
    let chat_model =
        env::var("OPENAI_CHAT_MODEL").unwrap_or_else(|_| "gpt-4.1-mini".to_string());
    let service_token = env::var("DASHBOARD_SERVICE_TOKEN")
        .ok()
        .filter(|token| !token.trim().is_empty());

    let dashboard: Arc<dyn DashboardApi> = Arc::new(HttpDashboardApi::new(
        http_client.clone(),
        dashboard_url.clone(),
        service_token,
    ));
    let limits: Arc<dyn LimitChecker> = Arc::new(FailOpen::new(HttpLimitChecker::new(
        http_client.clone(),
        dashboard_url,
    )));
    let geo: Arc<dyn GeoResolver> = Arc::new(HttpGeoResolver::new(http_client.clone(), geo_url));
    let openai = OpenAiClient::new(http_client, chat_model);
    let responder: Arc<dyn AiResponder> = Arc::new(openai.clone());
    let sales: Arc<dyn SaleAnalyzer> = Arc::new(openai);
    let store: Arc<dyn ConversationStore> = Arc::new(PgConversationStore::new(
        db,
        limits.clone(),
        geo,
        dashboard.clone(),
    ));

    let state = Arc::new(AppState {
        store,
        limits,
        responder,
        sales,
        dashboard,
        realtime: Mutex::new(RealtimeState::default()),
        inflight: Mutex::new(InflightRegistry::new()),
        next_client_id: AtomicUsize::new(0),
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");

    tracing::info!(%addr, "livechat server listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("server runtime failure");
}

//! Tapline Web 服务
//!
//! 启动: cargo run --bin tapline-web --features web
//!
//! - `POST /api/chat/stream`：NDJSON 事件流（一行一个事件，以 done 结束）
//! - `POST /api/chat/respond`：提交 ask_user 回答
//! - `GET /api/properties` / `GET /api/properties/gsc`：列出账号下的分析属性 / Search Console 站点
//! - `GET /api/health`
//!
//! 用户标识与 refresh token 由上游鉴权层写入请求头 `x-owner-id` / `x-refresh-token`。

#![cfg(feature = "web")]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use serde::Deserialize;

use tapline::chat::{ConversationStore, InMemoryConversationStore, TurnRecorder};
use tapline::config::{load_config, AppConfig};
use tapline::core::{
    engine_materializer, secret_from_config, CredentialCleanup, EngineBuilder, ShutdownCoordinator,
    ShutdownManager, SweeperCleanup,
};
use tapline::llm::Message;
use tapline::observability;
use tapline::properties::{
    list_analytics_properties, list_search_console_sites, AnalyticsProperty, SearchConsoleSite,
};
use tapline::stream::{TurnEngine, TurnRequest, TurnStream};

const OWNER_HEADER: &str = "x-owner-id";
const REFRESH_TOKEN_HEADER: &str = "x-refresh-token";

struct AppState {
    config: AppConfig,
    engine: Arc<TurnEngine>,
    store: Arc<dyn ConversationStore>,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    conversation_id: Option<String>,
    /// 没有已存对话时可由前端带上的历史
    #[serde(default)]
    history: Vec<Message>,
    /// 本轮针对的分析属性
    #[serde(default)]
    property_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RespondRequest {
    group_id: String,
    #[serde(default)]
    responses: HashMap<String, String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::var("TAPLINE_CONFIG").ok().map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;
    let engine = EngineBuilder::new(cfg.clone()).build();

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let sweeper_token = shutdown.token().child_token();
    let sweeper = engine
        .sessions()
        .spawn_sweeper(cfg.sweep_interval(), sweeper_token.clone());
    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&shutdown));
    coordinator.register(SweeperCleanup::new(sweeper_token, sweeper));
    coordinator.register(CredentialCleanup::new(engine_materializer(&engine)));

    let addr = cfg.app.listen_addr.clone();
    let state = Arc::new(AppState {
        config: cfg,
        engine,
        store: Arc::new(InMemoryConversationStore::new()),
    });

    let app = Router::new()
        .route("/api/health", get(api_health))
        .route("/api/chat/stream", post(api_chat_stream))
        .route("/api/chat/respond", post(api_chat_respond))
        .route("/api/properties", get(api_list_properties))
        .route("/api/properties/gsc", get(api_list_sites))
        .with_state(state);

    tracing::info!("Tapline Web: http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let signal = Arc::clone(&shutdown);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { signal.wait_for_shutdown().await })
        .await
        .context("Server failed")?;

    coordinator.run_cleanup().await;
    Ok(())
}

async fn api_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// POST /api/chat/stream：启动一轮，边产生边以 NDJSON 推送
async fn api_chat_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Result<Response, (StatusCode, String)> {
    let owner = header_value(&headers, OWNER_HEADER)
        .ok_or_else(|| (StatusCode::UNAUTHORIZED, "missing owner".to_string()))?;
    let refresh_token = header_value(&headers, REFRESH_TOKEN_HEADER).unwrap_or_default();
    if req.message.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "message is required".to_string()));
    }

    let mut run = tapline::agent::RunRequest::new(req.message.clone());
    run.history = req.history;
    if let Some(id) = req.conversation_id.as_deref() {
        match state.store.load(id).await {
            Ok(Some(record)) if record.owner == owner => {
                run = record.to_run_request(req.message.clone());
            }
            Ok(Some(_)) => {
                return Err((StatusCode::NOT_FOUND, "conversation not found".to_string()));
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(conversation_id = id, error = %e, "failed to load conversation");
            }
        }
    }

    run.property_id = req.property_id.filter(|p| !p.trim().is_empty());

    let recorder = TurnRecorder::new(
        Arc::clone(&state.store),
        owner.clone(),
        req.conversation_id,
        req.message,
    );
    let turn = state.engine.start_turn(TurnRequest {
        owner,
        secret: secret_from_config(&state.config, refresh_token),
        run,
        conversation_id: Some(recorder.conversation_id().to_string()),
    });

    // 响应体被丢弃（客户端断开）时 TurnStream 随之丢弃，驱动任务停止投递并回收
    let body = stream::unfold(
        (turn, recorder),
        |(mut turn, mut recorder): (TurnStream, TurnRecorder)| async move {
            loop {
                let event = turn.next().await?;
                let Some(event) = recorder.observe(event).await else {
                    continue;
                };
                if let Some(line) = event.to_wire_line() {
                    return Some((
                        Ok::<_, std::convert::Infallible>(Bytes::from(line)),
                        (turn, recorder),
                    ));
                }
            }
        },
    );

    let mut res = Response::new(Body::from_stream(body));
    res.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/x-ndjson; charset=utf-8"),
    );
    Ok(res)
}

/// 列表类接口的鉴权：owner 与 refresh token 都必须存在
fn list_auth(headers: &HeaderMap) -> Result<(String, String), (StatusCode, String)> {
    let owner = header_value(headers, OWNER_HEADER)
        .ok_or_else(|| (StatusCode::UNAUTHORIZED, "missing owner".to_string()))?;
    let refresh_token = header_value(headers, REFRESH_TOKEN_HEADER).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            "Google account not connected".to_string(),
        )
    })?;
    Ok((owner, refresh_token))
}

/// GET /api/properties
async fn api_list_properties(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<AnalyticsProperty>>, (StatusCode, String)> {
    let (owner, refresh_token) = list_auth(&headers)?;
    let secret = secret_from_config(&state.config, refresh_token);
    list_analytics_properties(state.engine.sessions(), &owner, &secret)
        .await
        .map(Json)
        .map_err(|e| {
            tracing::warn!(owner = %owner, error = %e, "failed to list properties");
            (StatusCode::BAD_GATEWAY, format!("MCP server error: {e}"))
        })
}

/// GET /api/properties/gsc
async fn api_list_sites(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<SearchConsoleSite>>, (StatusCode, String)> {
    let (owner, refresh_token) = list_auth(&headers)?;
    let secret = secret_from_config(&state.config, refresh_token);
    list_search_console_sites(state.engine.sessions(), &owner, &secret)
        .await
        .map(Json)
        .map_err(|e| {
            tracing::warn!(owner = %owner, error = %e, "failed to list search console sites");
            (StatusCode::BAD_GATEWAY, format!("GSC MCP server error: {e}"))
        })
}

/// POST /api/chat/respond：提交问题组回答（每题可选）
async fn api_chat_respond(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RespondRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    if state
        .engine
        .ask_user()
        .submit_responses(&req.group_id, req.responses)
    {
        Ok(Json(serde_json::json!({"status": "ok"})))
    } else {
        Err((
            StatusCode::NOT_FOUND,
            "Question group not found or already answered".to_string(),
        ))
    }
}

//! Chat endpoints.

use crate::app::AppState;
use crate::error::ApiError;
use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use speda_conversation::{
    CollectedTurn, ConversationSummary, Message, OpenTurn, TurnRequest, collect_turn,
};
use speda_core::ConversationId;
use std::convert::Infallible;
use std::str::FromStr;
use std::sync::Arc;

const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 100;

/// Body of a turn submission.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    conversation_id: Option<ConversationId>,
    message: String,
    /// Base64 strings or data URLs.
    #[serde(default)]
    images: Vec<String>,
    #[serde(default)]
    location: Option<JsonValue>,
    #[serde(default)]
    timezone: Option<String>,
    #[serde(default)]
    confirm: Option<bool>,
}

impl ChatRequest {
    fn into_turn_request(self, state: &AppState) -> TurnRequest {
        TurnRequest {
            conversation_id: self.conversation_id,
            user_id: state.owner.user_id,
            user_name: state.owner.name.clone(),
            message: self.message,
            images: self.images,
            location: self.location,
            timezone: self.timezone,
            confirm: self.confirm,
        }
    }
}

/// Query parameters for the conversation listing.
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

/// A conversation with its messages.
#[derive(Debug, Serialize)]
pub struct ConversationDetail {
    #[serde(flatten)]
    summary: ConversationSummary,
    messages: Vec<Message>,
}

fn parse_conversation_id(raw: &str) -> Result<ConversationId, ApiError> {
    ConversationId::from_str(raw).map_err(|e| ApiError::BadRequest {
        message: e.to_string(),
    })
}

async fn open_turn(state: &AppState, request: ChatRequest) -> Result<OpenTurn, ApiError> {
    Ok(state
        .sessions
        .open(request.into_turn_request(state))
        .await?)
}

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// `POST /api/chat/stream`: runs a turn and streams its events.
pub async fn chat_stream(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let turn = open_turn(&state, request).await?;
    let frames = turn
        .events
        .map(|event| Ok::<_, Infallible>(event.to_sse_frame()));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(frames))
        .map_err(|e| ApiError::Internal {
            details: e.to_string(),
        })
}

/// `POST /api/chat`: runs a turn and answers once it is done.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<CollectedTurn>, ApiError> {
    let turn = open_turn(&state, request).await?;
    Ok(Json(collect_turn(turn).await?))
}

/// `GET /api/chat/conversations`
pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ConversationSummary>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    if !(1..=MAX_LIST_LIMIT).contains(&limit) {
        return Err(ApiError::BadRequest {
            message: format!("limit must be between 1 and {MAX_LIST_LIMIT}"),
        });
    }
    let summaries = state
        .store
        .list(limit, query.offset.unwrap_or_default())
        .await?;
    Ok(Json(summaries))
}

/// `GET /api/chat/conversations/{id}`
pub async fn get_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ConversationDetail>, ApiError> {
    let id = parse_conversation_id(&id)?;
    let summary = state.store.get(id).await?;
    let messages = state.store.read_history(id).await?;
    Ok(Json(ConversationDetail { summary, messages }))
}

/// `DELETE /api/chat/conversations/{id}`
pub async fn delete_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_conversation_id(&id)?;
    state.sessions.delete_conversation(id).await?;
    tracing::info!(conversation_id = %id, "conversation deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/chat/conversations/{id}/stop`
pub async fn stop_turn(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let id = parse_conversation_id(&id)?;
    let stopped = state.sessions.stop(id);
    Ok(Json(json!({ "stopped": stopped })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{Owner, router};
    use axum::Router;
    use axum::http::Request;
    use speda_ai::{ScriptedBackend, ScriptedStep};
    use speda_conversation::{
        ConfirmationLedger, ConversationStore, InMemoryConversationStore, SessionConfig,
        SessionController, TurnConfig, TurnExecutor,
    };
    use speda_core::UserId;
    use speda_tools::{TaskList, default_registry};
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        store: Arc<InMemoryConversationStore>,
        owner: UserId,
    }

    fn app(backend: ScriptedBackend) -> TestApp {
        let store = Arc::new(InMemoryConversationStore::new());
        let executor = Arc::new(TurnExecutor::new(
            Arc::new(backend),
            Arc::new(default_registry(Arc::new(TaskList::new()))),
            store.clone(),
            Arc::new(ConfirmationLedger::new()),
            TurnConfig::default(),
        ));
        let owner = UserId::new();
        let state = AppState::new(
            SessionController::new(executor, SessionConfig::default()),
            store.clone(),
            Owner {
                user_id: owner,
                name: Some("Ada".to_string()),
            },
        );
        TestApp {
            router: router(Arc::new(state)),
            store,
            owner,
        }
    }

    fn post_json(uri: &str, body: JsonValue) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).expect("request")
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        String::from_utf8(bytes.to_vec()).expect("utf8")
    }

    async fn body_json(response: Response) -> JsonValue {
        serde_json::from_str(&body_text(response).await).expect("json")
    }

    #[tokio::test]
    async fn health_is_ok() {
        let app = app(ScriptedBackend::default());
        let response = app.router.oneshot(get("/health")).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn stream_endpoint_frames_events() {
        let app = app(
            ScriptedBackend::new([
                ScriptedStep::tool_call("c1", "create_task", json!({"title": "milk"})),
                ScriptedStep::text("Added milk."),
            ])
            .with_generated_text("Grocery List"),
        );

        let response = app
            .router
            .oneshot(post_json(
                "/api/chat/stream",
                json!({"message": "Add milk to my tasks"}),
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        assert_eq!(response.headers()["x-accel-buffering"], "no");

        let text = body_text(response).await;
        let events: Vec<JsonValue> = text
            .split("\n\n")
            .filter(|frame| !frame.is_empty())
            .map(|frame| {
                let data = frame.strip_prefix("data: ").expect("data prefix");
                serde_json::from_str(data).expect("event json")
            })
            .collect();
        let types: Vec<&str> = events
            .iter()
            .map(|e| e["type"].as_str().expect("type"))
            .collect();
        assert_eq!(
            types,
            [
                "start",
                "function_start",
                "function_result",
                "chunk",
                "chunk",
                "title_generated",
                "done"
            ]
        );
        assert_eq!(events[2]["result"]["title"], "milk");
        assert_eq!(events[3]["content"], "Added ");
        assert_eq!(events[4]["content"], "milk.");
        assert_eq!(events[5]["title"], "Grocery List");
        assert_eq!(events[6]["content"], "Added milk.");

        let summaries = app.store.list(10, 0).await.expect("list");
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].owner, app.owner);
        assert_eq!(summaries[0].message_count, 3);
    }

    #[tokio::test]
    async fn chat_endpoint_collects_the_turn() {
        let app = app(ScriptedBackend::new([ScriptedStep::text("Hello Ada!")]));

        let response = app
            .router
            .oneshot(post_json("/api/chat", json!({"message": "hi"})))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["reply"], "Hello Ada!");
        assert!(body["conversation_id"].is_string());
        assert_eq!(body["tool_results"], json!([]));
    }

    #[tokio::test]
    async fn chat_endpoint_reports_turn_errors() {
        let app = app(ScriptedBackend::new([ScriptedStep::ConnectFailure(
            speda_ai::LlmError::Timeout,
        )]));

        let response = app
            .router
            .oneshot(post_json("/api/chat", json!({"message": "hi"})))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            body_json(response).await,
            json!({"error": "LLM request timed out"})
        );
    }

    #[tokio::test]
    async fn invalid_submissions_are_rejected() {
        let app = app(ScriptedBackend::default());

        let empty = app
            .router
            .clone()
            .oneshot(post_json("/api/chat/stream", json!({"message": ""})))
            .await
            .expect("response");
        assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(empty).await["error"].is_string());

        let missing = app
            .router
            .oneshot(post_json(
                "/api/chat/stream",
                json!({"message": "hi", "conversation_id": ConversationId::new()}),
            ))
            .await
            .expect("response");
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn conversation_lifecycle() {
        let app = app(ScriptedBackend::default());
        let id = app.store.create(app.owner).await.expect("create");
        app.store
            .append(id, Message::user("Add milk"))
            .await
            .expect("append");

        let listed = app
            .router
            .clone()
            .oneshot(get("/api/chat/conversations"))
            .await
            .expect("response");
        assert_eq!(listed.status(), StatusCode::OK);
        let listed = body_json(listed).await;
        assert_eq!(listed[0]["preview"], "Add milk");

        let detail = app
            .router
            .clone()
            .oneshot(get(&format!("/api/chat/conversations/{id}")))
            .await
            .expect("response");
        assert_eq!(detail.status(), StatusCode::OK);
        let detail = body_json(detail).await;
        assert_eq!(detail["message_count"], 1);
        assert_eq!(detail["messages"][0]["content"], "Add milk");

        let stopped = app
            .router
            .clone()
            .oneshot(post_json(
                &format!("/api/chat/conversations/{id}/stop"),
                json!({}),
            ))
            .await
            .expect("response");
        assert_eq!(body_json(stopped).await, json!({"stopped": false}));

        let deleted = app
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/chat/conversations/{id}"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

        let gone = app
            .router
            .oneshot(get(&format!("/api/chat/conversations/{id}")))
            .await
            .expect("response");
        assert_eq!(gone.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_limit_is_bounded() {
        let app = app(ScriptedBackend::default());
        for uri in [
            "/api/chat/conversations?limit=0",
            "/api/chat/conversations?limit=101",
        ] {
            let response = app.router.clone().oneshot(get(uri)).await.expect("response");
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }

        let bad_id = app
            .router
            .oneshot(get("/api/chat/conversations/not-an-id"))
            .await
            .expect("response");
        assert_eq!(bad_id.status(), StatusCode::BAD_REQUEST);
    }
}

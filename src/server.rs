//! Inbound streaming endpoint.
//!
//! `POST /api/analyze` takes the conversation history plus an optional
//! dataset and streams back the assistant's reply as UTF-8 text chunks;
//! concatenated chunks form the final message. Request-shape problems and
//! upstream model failures map to non-2xx; sandbox execution failures are
//! conversational data and never fail the request.

use crate::agent::{AgentEvent, ToolInvocationLoop};
use crate::llm::ChatMessage;
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub agent: Arc<ToolInvocationLoop>,
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub messages: Vec<InboundMessage>,
    #[serde(default)]
    pub dataset: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct InboundMessage {
    pub role: String,
    pub content: String,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/analyze", post(analyze_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

fn to_chat_messages(inbound: &[InboundMessage]) -> Vec<ChatMessage> {
    inbound
        .iter()
        .map(|m| match m.role.as_str() {
            "assistant" => ChatMessage {
                role: crate::llm::Role::Assistant,
                content: vec![crate::llm::ContentBlock::Text {
                    text: m.content.clone(),
                }],
            },
            _ => ChatMessage::user_text(m.content.clone()),
        })
        .collect()
}

async fn analyze_handler(
    State(state): State<AppState>,
    Json(request): Json<AnalyzeRequest>,
) -> Response {
    if request.messages.is_empty() {
        return (StatusCode::BAD_REQUEST, "messages must not be empty").into_response();
    }

    let messages = to_chat_messages(&request.messages);
    let mut events = state.agent.clone().run(messages, request.dataset);

    // Peek one event so an upstream failure before any output becomes a
    // proper error status instead of an empty 200.
    let first = events.next().await;
    if let Some(Err(e)) = &first {
        error!("upstream model failure: {e}");
        return (StatusCode::BAD_GATEWAY, format!("upstream error: {e}")).into_response();
    }

    let body = Body::from_stream(
        futures::stream::iter(first)
            .chain(events)
            .filter_map(|event| async move {
                match event {
                    Ok(AgentEvent::TextDelta(text)) => {
                        Some(Ok::<Bytes, std::io::Error>(Bytes::from(text)))
                    }
                    // Tool steps are interleaved metadata; the minimal
                    // contract streams assistant text only.
                    Ok(AgentEvent::ToolStep(_)) => None,
                    Err(e) => {
                        error!("stream error mid-response: {e}");
                        None
                    }
                }
            }),
    );

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}

//! Push channel: the long-lived SSE stream and the inbound assessment
//! endpoint.
//!
//! Outbound frames follow `event: <type>\ndata: <json>\n\n`; the payload is
//! the full envelope (event id, occurrence time, source component, schema
//! version, typed data). The assessment collaborator pushes
//! `collection.completed` and `grading.completed` in the opposite
//! direction through `POST /v1/events/assessment`.

use std::convert::Infallible;

use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, Sse},
    response::{IntoResponse, Response},
    Json,
};
use futures::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::api::rest::{into_response, ApiContext};
use crate::domain::event::{EventEnvelope, InboundEvent};

fn frame(envelope: &EventEnvelope) -> Event {
    let event = Event::default().event(envelope.kind.as_str());
    match serde_json::to_string(envelope) {
        Ok(json) => event.data(json),
        Err(err) => {
            tracing::error!(error = %err, "event serialization failed");
            event.data("{}")
        }
    }
}

/// `GET /v1/events/stream`
pub async fn stream(
    State(ctx): State<ApiContext>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = ctx.fanout.subscribe();
    tracing::debug!(subscriber = subscription.id, "push channel subscriber connected");
    let stream = ReceiverStream::new(subscription.rx).map(|envelope| Ok(frame(&envelope)));
    Sse::new(stream)
}

/// `POST /v1/events/assessment`
pub async fn assessment(
    State(ctx): State<ApiContext>,
    Json(event): Json<InboundEvent>,
) -> Response {
    let result = match event {
        InboundEvent::CollectionCompleted {
            instance_id,
            artifacts_uri,
        } => {
            tracing::info!(instance_id = %instance_id, "collection completed");
            ctx.service.record_collection(instance_id, artifacts_uri).await
        }
        InboundEvent::GradingCompleted { instance_id, score } => {
            tracing::info!(instance_id = %instance_id, passed = score.passed, "grading completed");
            ctx.service.record_grading(instance_id, score).await
        }
    };
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => into_response(err),
    }
}

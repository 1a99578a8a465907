// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Server-sent event streams over the event bus.
//!
//! Framing is `event: <TYPE>` / `data: <json>` with a `:keepalive` comment
//! every 15 seconds. Each connection owns one bounded bus subscription; a
//! client that cannot keep up loses events rather than stalling publishers,
//! and the subscription detaches when the connection drops.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;

use super::AppState;
use crate::constants::SSE_KEEPALIVE_SECS;
use crate::events::{Event, EventFilter};

#[derive(Deserialize)]
pub struct EventsQuery {
    pub resource_type: Option<String>,
}

/// `GET /api/v1/events[?resource_type=…]`
pub async fn all_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let filter = match query.resource_type {
        Some(name) => EventFilter::for_type(name),
        None => EventFilter::all(),
    };
    event_stream(&state, filter)
}

/// `GET /api/v1/resources/{id}/events`
pub async fn resource_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    event_stream(&state, EventFilter::for_resource(id))
}

fn event_stream(
    state: &AppState,
    filter: EventFilter,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let mut subscription = state.bus.subscribe(filter);
    let stream = stream::poll_fn(move |cx| subscription.receiver.poll_recv(cx)).map(frame);

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(SSE_KEEPALIVE_SECS))
            .text("keepalive"),
    )
}

fn frame(event: Event) -> Result<SseEvent, Infallible> {
    let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
    Ok(SseEvent::default().event(event.event_type.as_str()).data(data))
}

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::Stream;
use serde::Serialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;
use tracing::info;

use super::http::AppState;

/// Session transitions go out as `status`, registry changes as `display`.
/// A lagging client gets `sync-required` and should re-read the lists.
pub async fn sse_handler(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("New SSE client connected");

    let status = BroadcastStream::new(state.controller.subscribe()).map(|result| to_event("status", result));
    let displays =
        BroadcastStream::new(state.controller.registry().subscribe()).map(|result| to_event("display", result));

    Sse::new(status.merge(displays)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("keep-alive"),
    )
}

fn to_event<T: Serialize>(kind: &str, result: Result<T, BroadcastStreamRecvError>) -> Result<Event, Infallible> {
    Ok(match result {
        Ok(payload) => {
            let json = serde_json::to_string(&payload).unwrap_or_default();
            Event::default().event(kind).data(json)
        }
        Err(BroadcastStreamRecvError::Lagged(_)) => Event::default().event("sync-required").data("{}"),
    })
}

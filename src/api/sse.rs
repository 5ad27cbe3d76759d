//! SSE dialect: `GET /events/tasks/{taskId}` — `progress` and `terminal`
//! events in generation order, closing the stream on the terminal event.

use super::AppState;
use crate::executor::ProgressEvent;
use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

pub async fn stream_task_events(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.executor.subscribe(&task_id).await;

    let events = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(event) => Some(Ok(progress_event_to_axum(event))),
        Err(_) => None,
    });

    Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping"))
}

fn progress_event_to_axum(event: ProgressEvent) -> Event {
    let ts = chrono::Utc::now().to_rfc3339();

    if event.status.is_terminal() {
        let data = json!({
            "taskId": event.task_id,
            "status": event.status.as_str(),
            "resultRef": if event.status == crate::db::TaskStatus::Completed { Some(event.task_id.clone()) } else { None },
            "errorKind": event.error_kind.map(|k| k.as_str()),
            "ts": ts,
        });
        Event::default().event("terminal").data(data.to_string())
    } else {
        let data = json!({
            "taskId": event.task_id,
            "percent": event.progress_percent,
            "message": event.progress_message,
            "ts": ts,
        });
        Event::default().event("progress").data(data.to_string())
    }
}

//! Server-Sent Events stream of dashboard updates.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use tokio::sync::broadcast;
use tracing::warn;

use orion::io::sink::DashboardUpdate;

use crate::state::AppState;

/// Render one update as an SSE event named after its kind.
fn to_event(update: &DashboardUpdate) -> Option<Event> {
    let json = serde_json::to_string(update).ok()?;
    Some(Event::default().event(update.event_name()).data(json))
}

/// SSE endpoint handler.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events.subscribe();
    Sse::new(update_stream(rx)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn update_stream(
    mut rx: broadcast::Receiver<DashboardUpdate>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        yield Ok(Event::default().event("connected").data("{}"));

        loop {
            match rx.recv().await {
                Ok(update) => {
                    if let Some(event) = to_event(&update) {
                        yield Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some updates dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use orion::hub::HubStatus;
    use orion::io::sink::{BroadcastSink, DashboardSink, DashboardSnapshot};

    use super::*;

    fn status_update() -> DashboardUpdate {
        DashboardUpdate::Status(DashboardSnapshot {
            hub: HubStatus {
                instances: Vec::new(),
                active_executor: Some("orion".to_string()),
                executor_conflict: false,
            },
            queue_depth: 2,
            pending_decisions: 1,
            stalls: Vec::new(),
            open_circuits: Vec::new(),
        })
    }

    #[test]
    fn status_update_renders_tagged_json() {
        let json = serde_json::to_value(status_update()).expect("serialize");
        assert_eq!(json["type"], "status");
        assert_eq!(json["data"]["queue_depth"], 2);
        assert_eq!(json["data"]["hub"]["active_executor"], "orion");
    }

    #[tokio::test]
    async fn stream_starts_connected_then_relays_updates() {
        let sink = BroadcastSink::new(8);
        let stream = update_stream(sink.subscribe());
        futures::pin_mut!(stream);

        assert!(stream.next().await.is_some());
        sink.publish(&status_update());
        assert!(matches!(stream.next().await, Some(Ok(_))));
    }

    #[tokio::test]
    async fn stream_ends_when_the_sink_is_dropped() {
        let sink = BroadcastSink::new(8);
        let stream = update_stream(sink.subscribe());
        drop(sink);
        futures::pin_mut!(stream);

        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_none());
    }
}

use super::context::RequestContext;
use super::envelope::ApiError;
use super::extract::ApiQuery;
use crate::app::hub::authorize_topics;
use crate::domain::events::BusEvent;
use crate::AppState;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;

const KEEPALIVE: Duration = Duration::from_secs(15);

#[derive(Debug, Default, Deserialize)]
pub struct SseQuery {
    /// Comma-separated topic globs; everything the caller may read when absent.
    #[serde(default)]
    pub topics: Option<String>,
}

fn to_event(event: &BusEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".into());
    Event::default()
        .id(event.seq.to_string())
        .event(event.event_type.as_str())
        .data(data)
}

/// `/events`: live events as server-sent events. No replay; use
/// `/events/replay` or the WebSocket for that.
pub async fn events(
    State(state): State<AppState>,
    ctx: RequestContext,
    ApiQuery(query): ApiQuery<SseQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let requested: Vec<String> = query
        .topics
        .as_deref()
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|topic| !topic.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_else(|| vec!["*".to_string()]);
    let globs = authorize_topics(&ctx.identity, &requested).map_err(ApiError::forbidden)?;

    let connected = Event::default().event("connected").data(
        json!({
            "seq": state.bus.current_seq(),
            "topics": globs,
            "user_id": ctx.identity.user_id,
        })
        .to_string(),
    );
    let subscription = state.sse.subscribe(globs);
    let live = stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        Some((Ok(to_event(&event)), subscription))
    });
    let stream = stream::once(async move { Ok(connected) }).chain(live);
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEPALIVE)))
}

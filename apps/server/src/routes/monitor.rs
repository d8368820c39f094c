use std::convert::Infallible;

use actix_web::http::header;
use actix_web::web::{self, Bytes};
use actix_web::{HttpResponse, get};
use sitewatch::{ChannelSink, LiveStatusStream};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::state::AppState;

macros_utils::routes! {
    route monitor_sse,
}

/// Chunks buffered between the stream loop and the response body
const STREAM_BUFFER: usize = 16;

/// Live probe results of one project as server-sent events.
///
/// Each connection gets its own prober, stopped when the client goes away.
#[get("/api/projects/{project_id}/monitor-sse")]
pub async fn monitor_sse(
    state: web::Data<AppState>,
    project_id: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let project_id = project_id.into_inner();
    state.store.get_project(&project_id).await?;

    let (mut sink, rx) = ChannelSink::channel(STREAM_BUFFER);
    let cancel = CancellationToken::new();
    sink.cancel_on_close(cancel.clone());

    let stream = LiveStatusStream::new(state.prober(&project_id)).with_heartbeat(state.heartbeat);
    tokio::spawn(async move {
        // releases the close watcher, which ends the response body
        let _done = cancel.clone().drop_guard();
        match stream.run(&mut sink, cancel).await {
            Ok(end) => debug!(project_id = %project_id, reason = ?end, "monitor stream closed"),
            Err(e) => warn!(project_id = %project_id, error = %e, "monitor stream failed to start"),
        }
    });

    let body = ReceiverStream::new(rx).map(|chunk| Ok::<_, Infallible>(Bytes::from(chunk)));
    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .insert_header((header::CONNECTION, "keep-alive"))
        .streaming(body))
}

use std::convert::Infallible;
use std::future::Future;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use manager_sdk::protocol::SessionFrame;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{ManagerError, ManagerResult};
use crate::session::FrameSink;

const FRAME_BUFFER: usize = 64;
pub const FRAME_EVENT: &str = "frame";
pub const ERROR_EVENT: &str = "error";

/// Runs `produce` in its own task and serves its frames as SSE. A failure
/// before the first frame becomes a plain HTTP error; later failures are
/// sent as a final `error` event.
pub async fn frame_stream<F, Fut>(
    produce: F,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ManagerError>
where
    F: FnOnce(FrameSink) -> Fut,
    Fut: Future<Output = ManagerResult<()>> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel(FRAME_BUFFER);
    let errors = tx.clone();
    let producer = produce(tx);
    tokio::spawn(async move {
        if let Err(err) = producer.await {
            let _ = errors.send(Err(err)).await;
        }
    });

    let head = match rx.recv().await {
        None => None,
        Some(Err(err)) => return Err(err),
        Some(Ok(frame)) => Some(Ok(frame)),
    };
    let stream = futures::stream::iter(head)
        .chain(ReceiverStream::new(rx))
        .map(|item| Ok(to_event(item)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn to_event(item: Result<SessionFrame, ManagerError>) -> Event {
    match item {
        Ok(frame) => {
            let data = serde_json::to_string(&frame).unwrap_or_else(|_| "{}".into());
            Event::default().event(FRAME_EVENT).data(data)
        }
        Err(err) => {
            let data = serde_json::to_string(&err.to_body()).unwrap_or_else(|_| "{}".into());
            Event::default().event(ERROR_EVENT).data(data)
        }
    }
}

use crate::error::Result;
use crate::types::{BackendRequest, StreamEvent};
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;

/// Finite, non-restartable sequence of normalized events for one exchange.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Short identifier used in logs and origin labels: "chunk", "sse", "rpc".
    fn backend_id(&self) -> &str;

    /// Open one streaming exchange.
    ///
    /// Failures before any event could be produced surface as `Err` so the
    /// caller's retry policy can observe and classify them. Once a stream is
    /// returned, every later failure becomes a terminal
    /// [`StreamEvent::Error`] on the stream itself.
    async fn stream(&self, request: BackendRequest) -> Result<EventStream>;
}

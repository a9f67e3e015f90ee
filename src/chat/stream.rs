//! Streaming message send.
//!
//! Bridges one `chat.send` RPC with a concurrent wildcard event
//! subscription into a finite stream of `Chunk`s followed by exactly one
//! `Done`. Assistant deltas arrive as push events while the RPC is in
//! flight; whichever of {final chat event, RPC resolution} happens first
//! supplies the `Done`, and the other is dropped.
//!
//! Cleanup does not depend on the consumer draining the stream: dropping
//! the stream unsubscribes the event callback and aborts the RPC task.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures::Stream;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::events::translate::{PushEvent, translate_frame};
use crate::gateway::{EventSubscription, GatewayResult, RpcClient};

/// One element of a streaming send.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// An assistant text delta.
    Chunk(String),
    /// Terminal element: the final message (from a `chat final` event) or
    /// the raw RPC result if no final event arrived first.
    Done(Value),
}

/// Finite stream of chunks ending in `Done` or an error.
pub struct MessageStream {
    rx: mpsc::UnboundedReceiver<GatewayResult<StreamEvent>>,
    finished: bool,
    _subscription: EventSubscription,
    rpc_task: JoinHandle<()>,
}

impl MessageStream {
    /// Subscribe for this session's events, then fire the send.
    ///
    /// The subscription must exist before the RPC goes out so no delta can
    /// slip between the two.
    pub(crate) fn start(client: Arc<RpcClient>, session_key: String, params: Value) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let done = Arc::new(AtomicBool::new(false));

        let subscription = {
            let tx = tx.clone();
            let done = Arc::clone(&done);
            let session_key = session_key.clone();
            client.subscribe_event("*", move |frame| {
                // The socket is shared; frames tagged for another session
                // are not ours.
                if let Some(key) = frame.payload.get("sessionKey").and_then(Value::as_str) {
                    if key != session_key {
                        return;
                    }
                }
                match translate_frame(&frame.event, &frame.payload) {
                    Some(PushEvent::Chunk { text, .. }) => {
                        let _ = tx.send(Ok(StreamEvent::Chunk(text)));
                    }
                    Some(PushEvent::MessageFinal { message, .. }) => {
                        if !done.swap(true, Ordering::SeqCst) {
                            let _ = tx.send(Ok(StreamEvent::Done(message)));
                        }
                    }
                    _ => {}
                }
            })
        };

        let rpc_task = tokio::spawn(async move {
            match client.request("chat.send", Some(params)).await {
                Ok(result) => {
                    if !done.swap(true, Ordering::SeqCst) {
                        let _ = tx.send(Ok(StreamEvent::Done(result)));
                    }
                }
                Err(err) => {
                    let _ = tx.send(Err(err));
                }
            }
        });

        Self {
            rx,
            finished: false,
            _subscription: subscription,
            rpc_task,
        }
    }
}

impl Stream for MessageStream {
    type Item = GatewayResult<StreamEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(item)) => {
                if matches!(item, Ok(StreamEvent::Done(_)) | Err(_)) {
                    self.finished = true;
                }
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        self.rpc_task.abort();
    }
}

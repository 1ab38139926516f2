//! Tag demultiplexer over a [`TaggedConnection`].
//!
//! One background task reads every frame and routes it to a per-tag FIFO
//! buffer, letting independent conversations (request/response on one tag, a
//! long-lived notification stream on another) share a single socket.
//!
//! ## Responsibilities
//! - Lazily create a buffer the first time anyone waits on (or watches) a
//!   tag; frames for tags nobody has asked for are dropped.
//! - Deliver buffered messages to waiters in arrival order.
//! - Record the first terminal connection error and re-raise it to every
//!   blocked and future waiter, on every tag, once their buffers drain.

use crate::{Error, Frame, Message, Result, TaggedConnection};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;

pub struct Demultiplexer {
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
}

struct Shared {
    connection: TaggedConnection,
    routes: Mutex<Routes>,
}

#[derive(Default)]
struct Routes {
    buffers: HashMap<i32, TagBuffer>,
    failure: Option<Error>,
}

/// FIFO buffer for one tag. The sender is dropped once the connection fails,
/// so a drained receiver observes the end of the channel.
struct TagBuffer {
    sender: Option<UnboundedSender<Message>>,
    receiver: Arc<tokio::sync::Mutex<UnboundedReceiver<Message>>>,
}

impl TagBuffer {
    fn new(failed: bool) -> Self {
        let (sender, receiver) = unbounded_channel();
        Self {
            sender: (!failed).then_some(sender),
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
        }
    }
}

impl Shared {
    fn deliver(&self, frame: Frame) {
        let routes = self.routes.lock();
        match routes.buffers.get(&frame.tag).and_then(|b| b.sender.as_ref()) {
            // The buffer keeps its receiver alive, so sending cannot fail.
            Some(sender) => {
                let _ = sender.send(frame.message);
            }
            None => {
                #[cfg(feature = "tracing")]
                tracing::trace!(tag = frame.tag, "dropping frame for unwatched tag");
            }
        }
    }

    fn fail(&self, err: Error) {
        let mut routes = self.routes.lock();
        if routes.failure.is_none() {
            routes.failure = Some(err);
        }
        for buffer in routes.buffers.values_mut() {
            buffer.sender = None;
        }
    }

    fn failure(&self) -> Error {
        self.routes
            .lock()
            .failure
            .clone()
            .unwrap_or(Error::ConnectionClosed)
    }
}

async fn read_loop(shared: Arc<Shared>) {
    let err = loop {
        match shared.connection.receive().await {
            Ok(frame) => shared.deliver(frame),
            Err(e) => break e,
        }
    };
    #[cfg(feature = "tracing")]
    tracing::debug!(error = %err, "demultiplexer reader stopped");
    shared.fail(err);
}

impl Demultiplexer {
    /// Takes ownership of `connection` and spawns the background reader.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(connection: TaggedConnection) -> Self {
        let shared = Arc::new(Shared {
            connection,
            routes: Mutex::new(Routes::default()),
        });
        let reader = tokio::spawn(read_loop(Arc::clone(&shared)));
        Self { shared, reader }
    }

    pub async fn send(&self, tag: i32, message: Message) -> Result<()> {
        self.shared.connection.send(tag, message).await
    }

    /// Starts buffering frames for `tag` without waiting on it.
    ///
    /// Call this before sending a request whose reply must not be dropped.
    pub fn watch(&self, tag: i32) {
        self.buffer(tag);
    }

    /// Stops buffering `tag`, discarding anything unread. Frames arriving
    /// for it afterwards are dropped.
    pub fn unwatch(&self, tag: i32) {
        self.shared.routes.lock().buffers.remove(&tag);
    }

    fn buffer(&self, tag: i32) -> Arc<tokio::sync::Mutex<UnboundedReceiver<Message>>> {
        let mut routes = self.shared.routes.lock();
        let failed = routes.failure.is_some();
        let buffer = routes
            .buffers
            .entry(tag)
            .or_insert_with(|| TagBuffer::new(failed));
        Arc::clone(&buffer.receiver)
    }

    /// Waits for the oldest unread message on `tag`.
    pub async fn receive(&self, tag: i32) -> Result<Message> {
        let receiver = self.buffer(tag);
        let mut receiver = receiver.lock().await;
        match receiver.recv().await {
            Some(message) => Ok(message),
            None => Err(self.shared.failure()),
        }
    }

    /// Closes the connection. Every waiter then fails with
    /// [`Error::ConnectionClosed`] unless an earlier error was recorded.
    pub async fn close(&self) -> Result<()> {
        self.shared.connection.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.connection.is_closed() || self.reader.is_finished()
    }
}

impl Drop for Demultiplexer {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

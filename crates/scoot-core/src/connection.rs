//! Tagged frame transport over a single byte stream.
//!
//! A [`TaggedConnection`] owns both halves of a stream. Writers and readers are
//! serialized independently, so one task can block in [`receive`] while any
//! number of tasks [`send`] concurrently.
//!
//! [`receive`]: TaggedConnection::receive
//! [`send`]: TaggedConnection::send

use crate::{Error, Frame, FrameCodec, Message, Registry, Result};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

type BoxedStream = Box<dyn ByteStream + Send + Unpin>;

/// Any bidirectional byte stream a connection can run over.
pub trait ByteStream: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite + ?Sized> ByteStream for T {}

pub struct TaggedConnection {
    reader: Mutex<FramedRead<ReadHalf<BoxedStream>, FrameCodec>>,
    writer: Mutex<FramedWrite<WriteHalf<BoxedStream>, FrameCodec>>,
    closed: CancellationToken,
}

impl TaggedConnection {
    pub fn new<S>(stream: S, registry: Arc<Registry>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let stream: BoxedStream = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(stream);
        let codec = FrameCodec::new(registry);
        Self {
            reader: Mutex::new(FramedRead::new(read_half, codec.clone())),
            writer: Mutex::new(FramedWrite::new(write_half, codec)),
            closed: CancellationToken::new(),
        }
    }

    /// Writes one frame and flushes it before releasing the send lock.
    pub async fn send(&self, tag: i32, message: Message) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        writer.send(Frame::new(tag, message)).await?;
        #[cfg(feature = "tracing")]
        tracing::trace!(tag, "frame sent");
        Ok(())
    }

    /// Waits for the next complete frame.
    ///
    /// A stream that ends, cleanly or mid-frame, yields [`Error::PeerClosed`].
    /// A local [`close`](Self::close) wakes a blocked receiver with
    /// [`Error::ConnectionClosed`].
    pub async fn receive(&self) -> Result<Frame> {
        let mut reader = tokio::select! {
            biased;
            () = self.closed.cancelled() => return Err(Error::ConnectionClosed),
            reader = self.reader.lock() => reader,
        };
        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(Error::ConnectionClosed),
            frame = reader.next() => match frame {
                Some(Ok(frame)) => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(tag = frame.tag, kind = ?frame.message.kind(), "frame received");
                    Ok(frame)
                }
                Some(Err(e)) => Err(e),
                None => Err(Error::PeerClosed),
            },
        }
    }

    /// Shuts down the write side and fails every later operation with
    /// [`Error::ConnectionClosed`]. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();
        let mut writer = self.writer.lock().await;
        match writer.get_mut().shutdown().await {
            Ok(()) => Ok(()),
            Err(e) => match Error::from(e) {
                Error::PeerClosed => Ok(()),
                other => Err(other),
            },
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Location;
    use tokio::io::duplex;

    fn pair() -> (TaggedConnection, TaggedConnection) {
        let registry = Arc::new(Registry::standard().unwrap());
        let (a, b) = duplex(1024);
        (
            TaggedConnection::new(a, Arc::clone(&registry)),
            TaggedConnection::new(b, registry),
        )
    }

    #[tokio::test]
    async fn frames_arrive_with_their_tags() {
        let (client, server) = pair();
        client
            .send(
                1,
                Message::FreeVehiclesNear {
                    location: Location::new(2, 3),
                },
            )
            .await
            .unwrap();
        client.send(7, Message::SubscribeToRewards).await.unwrap();

        let first = server.receive().await.unwrap();
        assert_eq!(first.tag, 1);
        assert_eq!(
            first.message,
            Message::FreeVehiclesNear {
                location: Location::new(2, 3)
            }
        );
        assert_eq!(
            server.receive().await.unwrap(),
            Frame::new(7, Message::SubscribeToRewards)
        );
    }

    #[tokio::test]
    async fn concurrent_senders_do_not_interleave() {
        let (client, server) = pair();
        let client = Arc::new(client);
        let senders: Vec<_> = (0..8)
            .map(|tag| {
                let client = Arc::clone(&client);
                tokio::spawn(async move {
                    for _ in 0..25 {
                        client
                            .send(
                                tag,
                                Message::Register {
                                    username: format!("user-{tag}"),
                                    password: "x".repeat(300),
                                },
                            )
                            .await
                            .unwrap();
                    }
                })
            })
            .collect();

        let mut seen = [0; 8];
        for _ in 0..200 {
            let frame = server.receive().await.unwrap();
            let Message::Register { username, .. } = frame.message else {
                panic!("unexpected message");
            };
            assert_eq!(username, format!("user-{}", frame.tag));
            seen[frame.tag as usize] += 1;
        }
        for sender in senders {
            sender.await.unwrap();
        }
        assert!(seen.iter().all(|&n| n == 25));
    }

    #[tokio::test]
    async fn peer_shutdown_is_peer_closed() {
        let (client, server) = pair();
        client.close().await.unwrap();
        assert!(matches!(server.receive().await, Err(Error::PeerClosed)));
    }

    #[tokio::test]
    async fn closed_connection_rejects_operations() {
        let (client, _server) = pair();
        client.close().await.unwrap();
        client.close().await.unwrap();
        assert!(client.is_closed());
        assert!(matches!(
            client.send(1, Message::NotAuthenticated).await,
            Err(Error::ConnectionClosed)
        ));
        assert!(matches!(
            client.receive().await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn close_wakes_a_blocked_receiver() {
        let (client, _server) = pair();
        let client = Arc::new(client);
        let receiver = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.receive().await })
        };
        tokio::task::yield_now().await;
        client.close().await.unwrap();
        assert!(matches!(
            receiver.await.unwrap(),
            Err(Error::ConnectionClosed)
        ));
    }
}

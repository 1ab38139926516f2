//! Typed client for the scoot service.
//!
//! The server answers every request on the tag it arrived on, so each call
//! gets a tag of its own from [`FIRST_CALL_TAG`] upwards. Concurrent calls
//! never read each other's replies, and a reply to a call that was dropped
//! before it arrived is discarded with the call's tag. Requests that get no
//! reply travel on [`REQUEST_TAG`].
//!
//! Reward notifications arrive on a tag of the caller's choosing (by default
//! [`NOTIFICATION_TAG`]), which must stay below [`FIRST_CALL_TAG`].

use crate::{
    Demultiplexer, Error, Location, Message, Notification, Registry, ReservedVehicle, Result,
    Reward, TaggedConnection, TripReceipt, User,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use tokio::net::{TcpStream, ToSocketAddrs};

pub const REQUEST_TAG: i32 = 1;
pub const NOTIFICATION_TAG: i32 = 2;
pub const FIRST_CALL_TAG: i32 = 1 << 16;

pub struct Client {
    demux: Demultiplexer,
    next_tag: AtomicI32,
}

/// Keeps a call's reply tag buffered until the call completes or is dropped.
struct PendingReply<'a> {
    demux: &'a Demultiplexer,
    tag: i32,
}

impl<'a> PendingReply<'a> {
    fn watch(demux: &'a Demultiplexer, tag: i32) -> Self {
        demux.watch(tag);
        Self { demux, tag }
    }
}

impl Drop for PendingReply<'_> {
    fn drop(&mut self) {
        self.demux.unwatch(self.tag);
    }
}

impl Client {
    pub async fn connect(addr: impl ToSocketAddrs, registry: Arc<Registry>) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(TaggedConnection::new(stream, registry)))
    }

    /// Wraps an established connection and starts its demultiplexer.
    pub fn new(connection: TaggedConnection) -> Self {
        Self {
            demux: Demultiplexer::start(connection),
            next_tag: AtomicI32::new(FIRST_CALL_TAG),
        }
    }

    fn call_tag(&self) -> i32 {
        let advance = |tag: i32| Some(tag.checked_add(1).unwrap_or(FIRST_CALL_TAG));
        self.next_tag
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, advance)
            .unwrap_or_else(|tag| tag)
    }

    async fn call(&self, request: Message) -> Result<Message> {
        let reply = PendingReply::watch(&self.demux, self.call_tag());
        self.demux.send(reply.tag, request).await?;
        match self.demux.receive(reply.tag).await? {
            Message::NotAuthenticated => Err(Error::NotAuthenticated),
            response => Ok(response),
        }
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<Option<User>> {
        let request = Message::Login {
            username: username.to_owned(),
            password: password.to_owned(),
        };
        match self.call(request).await? {
            Message::LoginResult { user } => Ok(user),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn register(&self, username: &str, password: &str) -> Result<Option<User>> {
        let request = Message::Register {
            username: username.to_owned(),
            password: password.to_owned(),
        };
        match self.call(request).await? {
            Message::RegisterResult { user } => Ok(user),
            other => Err(unexpected(&other)),
        }
    }

    /// Free vehicles within the service radius of `location`, by location.
    pub async fn vehicles_near(&self, location: Location) -> Result<BTreeMap<Location, i32>> {
        match self.call(Message::FreeVehiclesNear { location }).await? {
            Message::FreeVehiclesResult { vehicles } => Ok(vehicles),
            other => Err(unexpected(&other)),
        }
    }

    /// Reserves the closest free vehicle, or `None` if nothing is in range.
    pub async fn reserve(&self, location: Location) -> Result<Option<ReservedVehicle>> {
        match self.call(Message::ReserveClosest { location }).await? {
            Message::ReserveResult { reservation } => Ok(reservation),
            other => Err(unexpected(&other)),
        }
    }

    /// Ends a reservation at `location`. `None` means the server rejected it.
    pub async fn end_reservation(
        &self,
        reservation_id: i32,
        location: Location,
    ) -> Result<Option<TripReceipt>> {
        let request = Message::EndReservation {
            location,
            reservation_id,
        };
        match self.call(request).await? {
            Message::EndReservationResult { cost, prize } => {
                Ok(cost.map(|cost| TripReceipt { cost, prize }))
            }
            other => Err(unexpected(&other)),
        }
    }

    pub async fn rewards_near(&self, location: Location) -> Result<Vec<Reward>> {
        match self.call(Message::RewardsNear { location }).await? {
            Message::RewardsNearResult { rewards } => Ok(rewards),
            other => Err(unexpected(&other)),
        }
    }

    /// Asks the server to stream reward notifications on `tag`.
    pub async fn subscribe(&self, tag: i32) -> Result<()> {
        self.demux.watch(tag);
        self.demux.send(tag, Message::SubscribeToRewards).await
    }

    pub async fn unsubscribe(&self) -> Result<()> {
        self.demux
            .send(REQUEST_TAG, Message::UnsubscribeFromRewards)
            .await
    }

    /// Waits for the next reward batch streamed on `tag`.
    pub async fn next_notification(&self, tag: i32) -> Result<Notification> {
        match self.demux.receive(tag).await? {
            Message::RewardNotification { notification } => Ok(notification),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.demux.close().await
    }
}

fn unexpected(message: &Message) -> Error {
    Error::UnexpectedMessage {
        kind: message.kind(),
    }
}

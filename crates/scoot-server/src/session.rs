//! Per-connection request handling.
//!
//! A [`Session`] reads frames one at a time and answers each request on the
//! tag it arrived on. It remembers the authenticated user and, while
//! subscribed, owns a background task forwarding reward batches to the
//! client on the subscription's tag.
//!
//! ## Dispatch rules
//!
//! - `Login` / `Register` set the session user on success.
//! - Vehicle, reservation and reward queries need a session user; without one
//!   the answer is `NotAuthenticated`.
//! - `SubscribeToRewards` and `UnsubscribeFromRewards` get no response.
//! - A server-to-client message kind sent as a request is a protocol error
//!   and ends the connection.

use crate::facade::ScooterService;
use crate::queue::{Subscription, SubscriptionHandle};
use crate::telemetry::{decrement_connections, increment_connections, increment_requests};
use crate::{Error, Result};
use scoot_core::{Frame, Message, Notification, ReservedVehicle, TaggedConnection, User};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::Instrument;

pub struct Session {
    service: Arc<ScooterService>,
    connection: Arc<TaggedConnection>,
    peer: SocketAddr,
    user: Option<User>,
    subscription: Option<SubscriptionHandle>,
}

impl Session {
    pub fn new(service: Arc<ScooterService>, connection: TaggedConnection, peer: SocketAddr) -> Self {
        increment_connections();
        Self {
            service,
            connection: Arc::new(connection),
            peer,
            user: None,
            subscription: None,
        }
    }

    /// Serves requests until the peer leaves or the connection fails, then
    /// closes the subscription and the connection.
    #[tracing::instrument(name = "session", skip_all, fields(peer = %self.peer))]
    pub async fn run(mut self) -> Result<()> {
        let result = self.serve().await;
        self.teardown().await;
        result
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            let Frame { tag, message } = match self.connection.receive().await {
                Ok(frame) => frame,
                Err(e) if e.is_disconnect() => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            increment_requests();
            if let Some(response) = self.dispatch(tag, message)? {
                self.connection.send(tag, response).await?;
            }
        }
    }

    fn dispatch(&mut self, tag: i32, message: Message) -> Result<Option<Message>> {
        let kind = message.kind();
        tracing::debug!(tag, ?kind, user = ?self.user.as_ref().map(|u| &u.username), "request");
        if !kind.is_request() {
            return Err(scoot_core::Error::UnexpectedMessage { kind }.into());
        }

        let response = match message {
            Message::Login { username, password } => {
                let user = self.service.authenticate(&username, &password);
                if user.is_some() {
                    self.user.clone_from(&user);
                }
                Some(Message::LoginResult { user })
            }
            Message::Register { username, password } => {
                let user = self.service.register(&username, &password);
                if user.is_some() {
                    self.user.clone_from(&user);
                }
                Some(Message::RegisterResult { user })
            }
            Message::SubscribeToRewards => {
                self.subscribe(tag);
                None
            }
            Message::UnsubscribeFromRewards => {
                self.unsubscribe();
                None
            }
            request => match self.user.as_ref() {
                Some(user) => Some(self.handle_authenticated(user, request)?),
                None => Some(Message::NotAuthenticated),
            },
        };
        Ok(response)
    }

    fn handle_authenticated(&self, user: &User, request: Message) -> Result<Message> {
        let response = match request {
            Message::FreeVehiclesNear { location } => Message::FreeVehiclesResult {
                vehicles: self
                    .service
                    .scooters_near(location)
                    .into_iter()
                    .map(|(l, count)| (l, i32::try_from(count).unwrap_or(i32::MAX)))
                    .collect(),
            },
            Message::ReserveClosest { location } => Message::ReserveResult {
                reservation: self
                    .service
                    .reserve(user, location)
                    .map(|r| ReservedVehicle {
                        location: r.start,
                        id: r.id,
                    }),
            },
            Message::EndReservation {
                location,
                reservation_id,
            } => match self.service.end_reservation(user, reservation_id, location) {
                Ok(receipt) => Message::EndReservationResult {
                    cost: Some(receipt.cost),
                    prize: receipt.prize,
                },
                Err(rejection) => {
                    tracing::debug!(reservation_id, %rejection, "end reservation rejected");
                    Message::EndReservationResult {
                        cost: None,
                        prize: None,
                    }
                }
            },
            Message::RewardsNear { location } => Message::RewardsNearResult {
                rewards: self.service.rewards_near(location),
            },
            other => {
                return Err(Error::Protocol(scoot_core::Error::UnexpectedMessage {
                    kind: other.kind(),
                }));
            }
        };
        Ok(response)
    }

    fn subscribe(&mut self, tag: i32) {
        if self.subscription.as_ref().is_some_and(|h| !h.is_closed()) {
            tracing::debug!(tag, "already subscribed");
            return;
        }
        let subscription = self.service.subscribe_rewards();
        self.subscription = Some(subscription.handle());
        tracing::debug!(tag, "subscribed to rewards");
        tokio::spawn(
            forward_notifications(Arc::clone(&self.connection), tag, subscription)
                .in_current_span(),
        );
    }

    fn unsubscribe(&mut self) {
        if let Some(handle) = self.subscription.take() {
            handle.close();
            tracing::debug!("unsubscribed from rewards");
        }
    }

    async fn teardown(&mut self) {
        self.unsubscribe();
        if let Err(e) = self.connection.close().await {
            tracing::debug!(error = %e, "error closing connection");
        }
        decrement_connections();
    }
}

async fn forward_notifications(
    connection: Arc<TaggedConnection>,
    tag: i32,
    mut subscription: Subscription<Notification>,
) {
    while let Some(batch) = subscription.next().await {
        let message = Message::RewardNotification {
            notification: Notification::clone(&batch),
        };
        if let Err(e) = connection.send(tag, message).await {
            if e.is_disconnect() {
                tracing::debug!(error = %e, "notification stream ended");
            } else {
                tracing::warn!(error = %e, "failed to forward notification");
            }
            break;
        }
    }
    subscription.close();
}

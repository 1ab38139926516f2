//! Domain values exchanged between client and server.

use crate::Location;

/// The public profile of an account. Passwords never travel back to clients.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct User {
    pub username: String,
}

impl User {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }
}

/// A prize offered for riding a vehicle from `start` to `end`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reward {
    pub start: Location,
    pub end: Location,
    pub prize: i32,
}

/// What the client learns after a successful reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ReservedVehicle {
    pub location: Location,
    pub id: i32,
}

/// Outcome of ending a reservation: the fare, and the prize of a claimed
/// reward if the trip matched one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TripReceipt {
    pub cost: i32,
    pub prize: Option<i32>,
}

/// A batch of rewards published after a scan.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Notification {
    pub rewards: Vec<Reward>,
}

impl Notification {
    pub fn new(rewards: Vec<Reward>) -> Self {
        Self { rewards }
    }

    pub fn is_empty(&self) -> bool {
        self.rewards.is_empty()
    }
}

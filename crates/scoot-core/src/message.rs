//! The closed set of protocol messages.
//!
//! Every message that can cross the wire is a variant of [`Message`], and
//! every variant has a payload-free [`MessageKind`] twin used by the registry
//! to map kinds to 32-bit type codes.

use crate::{Location, Notification, ReservedVehicle, Reward, User};
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Login {
        username: String,
        password: String,
    },
    LoginResult {
        user: Option<User>,
    },
    Register {
        username: String,
        password: String,
    },
    RegisterResult {
        user: Option<User>,
    },
    FreeVehiclesNear {
        location: Location,
    },
    FreeVehiclesResult {
        vehicles: BTreeMap<Location, i32>,
    },
    ReserveClosest {
        location: Location,
    },
    ReserveResult {
        reservation: Option<ReservedVehicle>,
    },
    EndReservation {
        location: Location,
        reservation_id: i32,
    },
    EndReservationResult {
        cost: Option<i32>,
        prize: Option<i32>,
    },
    RewardsNear {
        location: Location,
    },
    RewardsNearResult {
        rewards: Vec<Reward>,
    },
    SubscribeToRewards,
    UnsubscribeFromRewards,
    RewardNotification {
        notification: Notification,
    },
    NotAuthenticated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    Login,
    LoginResult,
    Register,
    RegisterResult,
    FreeVehiclesNear,
    FreeVehiclesResult,
    ReserveClosest,
    ReserveResult,
    EndReservation,
    EndReservationResult,
    RewardsNear,
    RewardsNearResult,
    SubscribeToRewards,
    UnsubscribeFromRewards,
    RewardNotification,
    NotAuthenticated,
}

impl Message {
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::Login { .. } => MessageKind::Login,
            Self::LoginResult { .. } => MessageKind::LoginResult,
            Self::Register { .. } => MessageKind::Register,
            Self::RegisterResult { .. } => MessageKind::RegisterResult,
            Self::FreeVehiclesNear { .. } => MessageKind::FreeVehiclesNear,
            Self::FreeVehiclesResult { .. } => MessageKind::FreeVehiclesResult,
            Self::ReserveClosest { .. } => MessageKind::ReserveClosest,
            Self::ReserveResult { .. } => MessageKind::ReserveResult,
            Self::EndReservation { .. } => MessageKind::EndReservation,
            Self::EndReservationResult { .. } => MessageKind::EndReservationResult,
            Self::RewardsNear { .. } => MessageKind::RewardsNear,
            Self::RewardsNearResult { .. } => MessageKind::RewardsNearResult,
            Self::SubscribeToRewards => MessageKind::SubscribeToRewards,
            Self::UnsubscribeFromRewards => MessageKind::UnsubscribeFromRewards,
            Self::RewardNotification { .. } => MessageKind::RewardNotification,
            Self::NotAuthenticated => MessageKind::NotAuthenticated,
        }
    }
}

impl MessageKind {
    pub const ALL: [Self; 16] = [
        Self::Login,
        Self::LoginResult,
        Self::Register,
        Self::RegisterResult,
        Self::FreeVehiclesNear,
        Self::FreeVehiclesResult,
        Self::ReserveClosest,
        Self::ReserveResult,
        Self::EndReservation,
        Self::EndReservationResult,
        Self::RewardsNear,
        Self::RewardsNearResult,
        Self::SubscribeToRewards,
        Self::UnsubscribeFromRewards,
        Self::RewardNotification,
        Self::NotAuthenticated,
    ];

    /// Kinds a client may send to the server.
    pub const fn is_request(self) -> bool {
        matches!(
            self,
            Self::Login
                | Self::Register
                | Self::FreeVehiclesNear
                | Self::ReserveClosest
                | Self::EndReservation
                | Self::RewardsNear
                | Self::SubscribeToRewards
                | Self::UnsubscribeFromRewards
        )
    }

    /// Requests that a server answers without an authenticated user.
    pub const fn is_public(self) -> bool {
        matches!(
            self,
            Self::Login
                | Self::Register
                | Self::SubscribeToRewards
                | Self::UnsubscribeFromRewards
        )
    }
}

//! Process-wide service state shared by every connection.
//!
//! [`ScooterService`] owns the spatial store, the reservation ledger, the
//! reward board and scanner, and the user directory. It is the only place
//! that holds more than one of their locks at a time, always in the order
//! reservations -> scooters -> rewards.

use crate::ledger::{Pricing, Rejection, Reservation, ReservationLedger, SharedClock, SystemClock};
use crate::queue::Subscription;
use crate::rewards::{RewardBoard, RewardScanner};
use crate::store::ChunkGrid;
use crate::telemetry::increment_reservations;
use crate::users::UserDirectory;
use crate::Result;
use scoot_core::{Location, Notification, Reward, TripReceipt, User};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Domain parameters of a service instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceSettings {
    pub grid_size: i32,
    pub radius: i32,
    pub pricing: Pricing,
    pub prizes: RangeInclusive<i32>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            grid_size: 20,
            radius: 2,
            pricing: Pricing::default(),
            prizes: 5..=20,
        }
    }
}

pub struct ScooterService {
    ledger: ReservationLedger<SharedClock>,
    grid: Arc<ChunkGrid>,
    rewards: Arc<RewardBoard>,
    scanner: Arc<RewardScanner>,
    users: UserDirectory,
}

impl ScooterService {
    pub fn new(settings: &ServiceSettings) -> Result<Self> {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: &ServiceSettings, clock: SharedClock) -> Result<Self> {
        let grid = Arc::new(ChunkGrid::new(settings.grid_size, settings.radius)?);
        let rewards = Arc::new(RewardBoard::new());
        let scanner = Arc::new(RewardScanner::new(
            Arc::clone(&grid),
            Arc::clone(&rewards),
            settings.prizes.clone(),
        ));
        Ok(Self {
            ledger: ReservationLedger::new(clock, settings.pricing),
            grid,
            rewards,
            scanner,
            users: UserDirectory::new(),
        })
    }

    /// Spawns the background reward scanner.
    pub fn start(&self) -> JoinHandle<()> {
        self.scanner.spawn()
    }

    /// Stops the reward scanner. Connections are unaffected.
    pub fn shutdown(&self) {
        self.scanner.shutdown();
    }

    pub fn grid(&self) -> &ChunkGrid {
        &self.grid
    }

    pub fn users(&self) -> &UserDirectory {
        &self.users
    }

    pub fn rewards(&self) -> &RewardBoard {
        &self.rewards
    }

    pub fn scanner(&self) -> &RewardScanner {
        &self.scanner
    }

    pub fn register(&self, username: &str, password: &str) -> Option<User> {
        self.users.register(username, password)
    }

    pub fn authenticate(&self, username: &str, password: &str) -> Option<User> {
        self.users.authenticate(username, password)
    }

    pub fn scooters_near(&self, location: Location) -> BTreeMap<Location, u32> {
        self.grid.scooters_near(location)
    }

    /// Reserves the closest free vehicle for `user`.
    pub fn reserve(&self, user: &User, location: Location) -> Option<Reservation> {
        let reservation = {
            let mut ledger = self.ledger.lock();
            let start = self.grid.reserve_closest(location)?;
            ledger.create(&user.username, start)
        };
        increment_reservations();
        self.scanner.trigger();
        Some(reservation)
    }

    /// Ends `user`'s reservation at `end`, parking the vehicle there.
    ///
    /// A current reward for exactly this trip is claimed and its prize
    /// reported next to the fare.
    pub fn end_reservation(
        &self,
        user: &User,
        reservation_id: i32,
        end: Location,
    ) -> core::result::Result<TripReceipt, Rejection> {
        let receipt = {
            let mut ledger = self.ledger.lock();
            ledger.check(reservation_id, &user.username)?;
            if !self.grid.contains(end) {
                return Err(Rejection::OffGrid);
            }
            let termination = ledger.terminate(reservation_id, &user.username, end)?;
            self.grid.release(end);
            let prize = self.rewards.claim(termination.reservation.start, end);
            TripReceipt {
                cost: termination.cost,
                prize,
            }
        };
        self.scanner.trigger();
        Ok(receipt)
    }

    pub fn rewards_near(&self, location: Location) -> Vec<Reward> {
        self.rewards.near(location, self.grid.radius().unsigned_abs())
    }

    pub fn subscribe_rewards(&self) -> Subscription<Notification> {
        self.rewards.subscribe()
    }
}

//! Reservation ledger and fare computation.
//!
//! All reservations live in one map behind a single lock, together with the
//! id counter. Callers that must keep the ledger locked while touching other
//! components (the reservations -> scooters -> rewards ordering) take a
//! [`LedgerGuard`] through [`ReservationLedger::lock`].

use parking_lot::{Mutex, MutexGuard};
use scoot_core::Location;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of wall-clock time in milliseconds.
pub trait TimeSource<T> {
    fn current_millis(&self) -> T;
}

impl<T, C> TimeSource<T> for Arc<C>
where
    C: TimeSource<T> + ?Sized,
{
    fn current_millis(&self) -> T {
        (**self).current_millis()
    }
}

/// Milliseconds since the Unix epoch, from the system clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl TimeSource<u64> for SystemClock {
    fn current_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default()
    }
}

/// A clock that can be shared across the service and swapped in tests.
pub type SharedClock = Arc<dyn TimeSource<u64> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pricing {
    pub per_second: i32,
    pub per_unit: i32,
}

impl Pricing {
    /// `per_second * whole elapsed seconds + per_unit * distance`, saturated
    /// to the `i32` range the wire carries.
    pub fn fare(&self, elapsed_millis: u64, distance: u32) -> i32 {
        let seconds = i64::try_from(elapsed_millis / 1000).unwrap_or(i64::MAX);
        let fare = i64::from(self.per_second)
            .saturating_mul(seconds)
            .saturating_add(i64::from(self.per_unit).saturating_mul(i64::from(distance)));
        i32::try_from(fare).unwrap_or(if fare < 0 { i32::MIN } else { i32::MAX })
    }
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            per_second: 20,
            per_unit: 10,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reservation {
    pub id: i32,
    pub username: String,
    pub start: Location,
    pub started_at: u64,
    pub end: Option<Location>,
    pub ended_at: Option<u64>,
}

impl Reservation {
    pub fn is_terminated(&self) -> bool {
        self.end.is_some()
    }

    /// The fare, once both end fields are set.
    pub fn cost(&self, pricing: &Pricing) -> Option<i32> {
        let end = self.end?;
        let ended_at = self.ended_at?;
        Some(pricing.fare(
            ended_at.saturating_sub(self.started_at),
            self.start.distance(end),
        ))
    }
}

/// A successful termination: the closed reservation and what it costs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Termination {
    pub reservation: Reservation,
    pub cost: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("no reservation with that id")]
    NotFound,
    #[error("reservation belongs to another user")]
    NotOwner,
    #[error("reservation already terminated")]
    AlreadyTerminated,
    #[error("end location is off the grid")]
    OffGrid,
}

#[derive(Default)]
struct LedgerState {
    reservations: BTreeMap<i32, Reservation>,
    next_id: i32,
}

pub struct ReservationLedger<C = SystemClock> {
    state: Mutex<LedgerState>,
    clock: C,
    pricing: Pricing,
}

/// Exclusive access to the ledger for the lifetime of the guard.
pub struct LedgerGuard<'a, C> {
    state: MutexGuard<'a, LedgerState>,
    clock: &'a C,
    pricing: Pricing,
}

impl<C: TimeSource<u64>> ReservationLedger<C> {
    pub fn new(clock: C, pricing: Pricing) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            clock,
            pricing,
        }
    }

    pub fn pricing(&self) -> Pricing {
        self.pricing
    }

    pub fn lock(&self) -> LedgerGuard<'_, C> {
        LedgerGuard {
            state: self.state.lock(),
            clock: &self.clock,
            pricing: self.pricing,
        }
    }

    pub fn create(&self, username: &str, start: Location) -> Reservation {
        self.lock().create(username, start)
    }

    pub fn terminate(
        &self,
        id: i32,
        username: &str,
        end: Location,
    ) -> Result<Termination, Rejection> {
        self.lock().terminate(id, username, end)
    }

    pub fn get(&self, id: i32) -> Option<Reservation> {
        self.state.lock().reservations.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().reservations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<C: TimeSource<u64>> LedgerGuard<'_, C> {
    pub fn create(&mut self, username: &str, start: Location) -> Reservation {
        let id = self.state.next_id;
        // Ids are never reused; the counter saturates rather than wrapping.
        self.state.next_id = id.saturating_add(1);
        let reservation = Reservation {
            id,
            username: username.to_owned(),
            start,
            started_at: self.clock.current_millis(),
            end: None,
            ended_at: None,
        };
        self.state.reservations.insert(id, reservation.clone());
        reservation
    }

    /// Validates ownership and state without changing anything.
    pub fn check(&self, id: i32, username: &str) -> Result<&Reservation, Rejection> {
        let reservation = self
            .state
            .reservations
            .get(&id)
            .ok_or(Rejection::NotFound)?;
        if reservation.username != username {
            return Err(Rejection::NotOwner);
        }
        if reservation.is_terminated() {
            return Err(Rejection::AlreadyTerminated);
        }
        Ok(reservation)
    }

    pub fn terminate(
        &mut self,
        id: i32,
        username: &str,
        end: Location,
    ) -> Result<Termination, Rejection> {
        self.check(id, username)?;
        let now = self.clock.current_millis();
        let pricing = self.pricing;
        let reservation = self
            .state
            .reservations
            .get_mut(&id)
            .ok_or(Rejection::NotFound)?;
        reservation.end = Some(end);
        reservation.ended_at = Some(now);
        let cost = reservation
            .cost(&pricing)
            .ok_or(Rejection::AlreadyTerminated)?;
        Ok(Termination {
            reservation: reservation.clone(),
            cost,
        })
    }
}

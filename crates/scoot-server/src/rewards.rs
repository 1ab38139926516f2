//! Reward generation.
//!
//! ## Responsibilities
//!
//! - [`compute_rewards`]: turn an occupancy snapshot into one reward per
//!   crowded location, each pointing at a random under-served cell.
//! - [`RewardBoard`]: hold the current reward set, replace it wholesale after
//!   each scan and publish the new set to subscribers.
//! - [`RewardScanner`]: a background task that coalesces scan requests, so a
//!   burst of reservations collapses into a handful of scans.

use crate::queue::{NotificationQueue, Subscription};
use crate::store::ChunkGrid;
use crate::telemetry::record_rewards_published;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use rand::seq::IndexedRandom;
use scoot_core::{Location, Notification, Reward};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Cells of the `size x size` grid with no occupied location within
/// `radius`, in [`Location`] order.
pub fn empty_cells(occupied: &BTreeMap<Location, u32>, size: i32, radius: i32) -> Vec<Location> {
    let side = usize::try_from(size).unwrap_or(0);
    let index = |x: i32, y: i32| x as usize * side + y as usize;
    let mut covered = vec![false; side * side];

    for location in occupied.keys() {
        for dx in -radius..=radius {
            let span = radius - dx.abs();
            for dy in -span..=span {
                let (x, y) = (location.x + dx, location.y + dy);
                if (0..size).contains(&x) && (0..size).contains(&y) {
                    covered[index(x, y)] = true;
                }
            }
        }
    }

    (0..size)
        .flat_map(|x| (0..size).map(move |y| Location::new(x, y)))
        .filter(|l| !covered[index(l.x, l.y)])
        .collect()
}

/// One reward per location holding more than one vehicle, towards a
/// uniformly chosen empty cell, with a uniform prize from `prizes`.
///
/// With no empty cell (or an empty prize range) there is nothing to offer
/// and the result is empty.
pub fn compute_rewards<R: Rng + ?Sized>(
    occupied: &BTreeMap<Location, u32>,
    size: i32,
    radius: i32,
    prizes: &RangeInclusive<i32>,
    rng: &mut R,
) -> Vec<Reward> {
    let empty = empty_cells(occupied, size, radius);
    if empty.is_empty() || prizes.is_empty() {
        return Vec::new();
    }
    occupied
        .iter()
        .filter(|(_, count)| **count > 1)
        .filter_map(|(start, _)| {
            let end = *empty.choose(rng)?;
            Some(Reward {
                start: *start,
                end,
                prize: rng.random_range(prizes.clone()),
            })
        })
        .collect()
}

/// The current reward set.
pub struct RewardBoard {
    current: RwLock<Vec<Reward>>,
    queue: NotificationQueue<Notification>,
}

impl Default for RewardBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl RewardBoard {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Vec::new()),
            queue: NotificationQueue::new(),
        }
    }

    /// Swaps in `rewards` and publishes them, unless both the old and the new
    /// set are empty. Returns whether a batch was published.
    pub fn replace(&self, rewards: Vec<Reward>) -> bool {
        let mut current = self.current.write();
        let publish = !(rewards.is_empty() && current.is_empty());
        if publish {
            // Published under the board lock so batches follow replace order.
            self.queue.push(Notification::new(rewards.clone()));
        }
        *current = rewards;
        publish
    }

    /// Removes the reward for the trip `start -> end`, returning its prize.
    pub fn claim(&self, start: Location, end: Location) -> Option<i32> {
        let mut current = self.current.write();
        let position = current
            .iter()
            .position(|r| r.start == start && r.end == end)?;
        Some(current.remove(position).prize)
    }

    /// Rewards starting within `radius` of `location`.
    pub fn near(&self, location: Location, radius: u32) -> Vec<Reward> {
        self.current
            .read()
            .iter()
            .filter(|r| r.start.distance(location) <= radius)
            .copied()
            .collect()
    }

    pub fn current(&self) -> Vec<Reward> {
        self.current.read().clone()
    }

    pub fn subscribe(&self) -> Subscription<Notification> {
        self.queue.subscribe()
    }
}

/// Coalescing background scanner.
///
/// [`trigger`](Self::trigger) only raises a flag; the task clears it and runs
/// one scan per wake-up, however many triggers arrived in between.
pub struct RewardScanner {
    grid: Arc<ChunkGrid>,
    board: Arc<RewardBoard>,
    prizes: RangeInclusive<i32>,
    pending: Mutex<bool>,
    wake: Notify,
    shutdown: CancellationToken,
    scans: AtomicU64,
}

impl RewardScanner {
    pub fn new(grid: Arc<ChunkGrid>, board: Arc<RewardBoard>, prizes: RangeInclusive<i32>) -> Self {
        Self {
            grid,
            board,
            prizes,
            pending: Mutex::new(false),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            scans: AtomicU64::new(0),
        }
    }

    pub fn trigger(&self) {
        *self.pending.lock() = true;
        self.wake.notify_one();
    }

    /// Runs one scan on the calling thread and returns the new reward count.
    pub fn scan_now(&self) -> usize {
        let snapshot = self.grid.all_occupied();
        let rewards = compute_rewards(
            &snapshot,
            self.grid.size(),
            self.grid.radius(),
            &self.prizes,
            &mut rand::rng(),
        );
        let count = rewards.len();
        if self.board.replace(rewards) {
            record_rewards_published(count as u64);
        }
        self.scans.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Number of scans performed so far.
    pub fn scans(&self) -> u64 {
        self.scans.load(Ordering::Relaxed)
    }

    pub async fn run(self: Arc<Self>) {
        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                () = self.wake.notified() => {}
            }
            let pending = std::mem::take(&mut *self.pending.lock());
            if pending {
                // A scan locks every chunk and walks the whole grid.
                let scanner = Arc::clone(&self);
                match tokio::task::spawn_blocking(move || scanner.scan_now()).await {
                    Ok(count) => tracing::info!(rewards = count, "reward scan complete"),
                    Err(e) => tracing::error!(error = %e, "reward scan failed"),
                }
            }
        }
        tracing::debug!("reward scanner stopped");
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run())
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};
    use std::time::Duration;

    fn loc(x: i32, y: i32) -> Location {
        Location::new(x, y)
    }

    fn occupied(entries: &[(Location, u32)]) -> BTreeMap<Location, u32> {
        entries.iter().copied().collect()
    }

    #[test]
    fn empty_cells_exclude_the_radius_diamond() {
        let snapshot = occupied(&[(loc(2, 2), 1)]);
        let empty = empty_cells(&snapshot, 5, 1);
        // 25 cells minus the centre and its four neighbours.
        assert_eq!(empty.len(), 20);
        for covered in [loc(2, 2), loc(1, 2), loc(3, 2), loc(2, 1), loc(2, 3)] {
            assert!(!empty.contains(&covered));
        }
        assert!(empty.contains(&loc(1, 1)));
        assert!(empty.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn one_reward_per_crowded_location() {
        let snapshot = occupied(&[(loc(0, 0), 3), (loc(6, 6), 2), (loc(10, 10), 1)]);
        let mut rng = StdRng::seed_from_u64(3);
        let empty = empty_cells(&snapshot, 20, 2);
        let rewards = compute_rewards(&snapshot, 20, 2, &(5..=20), &mut rng);

        let starts: Vec<_> = rewards.iter().map(|r| r.start).collect();
        assert_eq!(starts, vec![loc(0, 0), loc(6, 6)]);
        for reward in &rewards {
            assert!(empty.contains(&reward.end));
            assert!((5..=20).contains(&reward.prize));
        }
    }

    #[test]
    fn no_empty_cell_means_no_rewards() {
        // Radius 2 around (1, 1) covers every cell of a 2x2 grid.
        let snapshot = occupied(&[(loc(1, 1), 4)]);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(compute_rewards(&snapshot, 2, 2, &(1..=1), &mut rng).is_empty());
    }

    #[test]
    fn fixed_prize_range_is_respected() {
        let snapshot = occupied(&[(loc(0, 0), 2)]);
        let mut rng = StdRng::seed_from_u64(11);
        let rewards = compute_rewards(&snapshot, 20, 2, &(10_000..=10_000), &mut rng);
        assert_eq!(rewards.len(), 1);
        assert_eq!(rewards[0].prize, 10_000);
    }

    #[tokio::test]
    async fn board_publishes_replacements_and_withdrawals() {
        let board = RewardBoard::new();
        let mut sub = board.subscribe();
        let reward = Reward {
            start: loc(0, 0),
            end: loc(9, 9),
            prize: 7,
        };

        assert!(!board.replace(Vec::new()));
        assert!(board.replace(vec![reward]));
        assert!(board.replace(Vec::new()));
        assert!(!board.replace(Vec::new()));

        assert_eq!(sub.next().await.unwrap().rewards, vec![reward]);
        assert!(sub.next().await.unwrap().is_empty());
        assert!(sub.try_next().is_none());
    }

    #[test]
    fn claim_removes_exactly_one_matching_reward() {
        let board = RewardBoard::new();
        let a = Reward {
            start: loc(0, 0),
            end: loc(9, 9),
            prize: 7,
        };
        let b = Reward {
            start: loc(6, 6),
            end: loc(9, 9),
            prize: 12,
        };
        board.replace(vec![a, b]);

        assert_eq!(board.claim(loc(0, 0), loc(9, 8)), None);
        assert_eq!(board.claim(loc(6, 6), loc(9, 9)), Some(12));
        assert_eq!(board.claim(loc(6, 6), loc(9, 9)), None);
        assert_eq!(board.current(), vec![a]);
        assert_eq!(board.near(loc(1, 1), 2), vec![a]);
        assert!(board.near(loc(5, 5), 1).is_empty());
    }

    #[tokio::test]
    async fn scanner_coalesces_bursts() {
        let grid = Arc::new(ChunkGrid::new(20, 2).unwrap());
        for _ in 0..3 {
            grid.release(loc(0, 0));
        }
        let board = Arc::new(RewardBoard::new());
        let mut sub = board.subscribe();
        let scanner = Arc::new(RewardScanner::new(grid, Arc::clone(&board), 5..=20));

        for _ in 0..50 {
            scanner.trigger();
        }
        let task = scanner.spawn();

        let batch = tokio::time::timeout(Duration::from_secs(5), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.rewards.len(), 1);
        assert_eq!(batch.rewards[0].start, loc(0, 0));

        scanner.shutdown();
        task.await.unwrap();
        assert_eq!(scanner.scans(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    #[allow(clippy::await_holding_lock)]
    async fn blocked_scan_leaves_the_runtime_free() {
        let grid = Arc::new(ChunkGrid::new(8, 1).unwrap());
        grid.release(loc(3, 3));
        grid.release(loc(3, 3));
        let board = Arc::new(RewardBoard::new());
        let mut sub = board.subscribe();
        let scanner = Arc::new(RewardScanner::new(grid, Arc::clone(&board), 1..=3));

        // The scan stalls in `replace` until this guard goes away.
        let held = board.current.read();
        scanner.trigger();
        let task = scanner.spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scanner.scans(), 0);
        drop(held);

        let batch = tokio::time::timeout(Duration::from_secs(5), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.rewards[0].start, loc(3, 3));
        scanner.shutdown();
        task.await.unwrap();
        assert_eq!(scanner.scans(), 1);
    }

    #[test]
    fn scan_now_replaces_the_board() {
        let grid = Arc::new(ChunkGrid::new(8, 1).unwrap());
        grid.release(loc(3, 3));
        grid.release(loc(3, 3));
        let board = Arc::new(RewardBoard::new());
        let scanner = RewardScanner::new(Arc::clone(&grid), Arc::clone(&board), 1..=3);

        assert_eq!(scanner.scan_now(), 1);
        assert_eq!(board.current()[0].start, loc(3, 3));

        grid.reserve_closest(loc(3, 3));
        assert_eq!(scanner.scan_now(), 0);
        assert!(board.current().is_empty());
        assert_eq!(scanner.scans(), 2);
    }
}

//! Chunk-partitioned store of idle vehicles.
//!
//! The `N x N` grid is tiled by square chunks of side `2 * radius`, each
//! owning the tallies of the locations inside it behind its own read/write
//! lock. A query around a target only ever needs the target's chunk plus the
//! neighbours on the side of the quadrant the target sits in, so at most four
//! chunks are locked per operation.
//!
//! ## Locking protocol
//!
//! - Every operation holds the locks of exactly the chunks it touches for its
//!   whole duration.
//! - Locks are taken in ascending linear chunk index (`row * side + col`,
//!   row-major) and released in the same order, so overlapping region queries
//!   cannot deadlock.
//! - Full-grid reads take every chunk's lock, in index order, before reading
//!   anything.

use crate::{Error, Result};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use rand::Rng;
use scoot_core::Location;
use std::collections::{BTreeMap, HashMap};

type Tally = HashMap<Location, u32>;

struct Chunk {
    vehicles: RwLock<Tally>,
}

pub struct ChunkGrid {
    size: i32,
    radius: i32,
    chunk_side: i32,
    chunks_per_side: i32,
    chunks: Box<[Chunk]>,
}

impl ChunkGrid {
    /// Builds an empty grid of `size x size` cells served within `radius`.
    ///
    /// `size` must be a positive multiple of `2 * radius`.
    pub fn new(size: i32, radius: i32) -> Result<Self> {
        if size <= 0 || radius <= 0 {
            return Err(Error::InvalidGrid {
                reason: format!("size ({size}) and radius ({radius}) must be positive"),
            });
        }
        let chunk_side = radius.checked_mul(2).ok_or_else(|| Error::InvalidGrid {
            reason: format!("radius {radius} is too large"),
        })?;
        if size % chunk_side != 0 {
            return Err(Error::InvalidGrid {
                reason: format!("size {size} is not a multiple of 2 * radius ({chunk_side})"),
            });
        }
        let chunks_per_side = size / chunk_side;
        let chunks = (0..chunks_per_side * chunks_per_side)
            .map(|_| Chunk {
                vehicles: RwLock::new(Tally::new()),
            })
            .collect();
        Ok(Self {
            size,
            radius,
            chunk_side,
            chunks_per_side,
            chunks,
        })
    }

    pub fn size(&self) -> i32 {
        self.size
    }

    pub fn radius(&self) -> i32 {
        self.radius
    }

    pub fn contains(&self, location: Location) -> bool {
        (0..self.size).contains(&location.x) && (0..self.size).contains(&location.y)
    }

    fn within_radius(&self, a: Location, b: Location) -> bool {
        a.distance(b) <= self.radius.unsigned_abs()
    }

    fn chunk_index(&self, col: i32, row: i32) -> Option<usize> {
        let in_range = 0..self.chunks_per_side;
        if in_range.contains(&col) && in_range.contains(&row) {
            usize::try_from(row * self.chunks_per_side + col).ok()
        } else {
            None
        }
    }

    /// Indices of the chunks that can hold a location within `radius` of
    /// `target`, ascending. Empty when `target` is off the grid.
    fn region(&self, target: Location) -> Vec<usize> {
        if !self.contains(target) {
            return Vec::new();
        }
        let col = target.x / self.chunk_side;
        let row = target.y / self.chunk_side;
        let dx = if target.x - col * self.chunk_side < self.radius { -1 } else { 1 };
        let dy = if target.y - row * self.chunk_side < self.radius { -1 } else { 1 };

        let mut indices: Vec<usize> = [
            (col, row),
            (col + dx, row),
            (col, row + dy),
            (col + dx, row + dy),
        ]
        .into_iter()
        .filter_map(|(c, r)| self.chunk_index(c, r))
        .collect();
        indices.sort_unstable();
        indices
    }

    fn read_chunks(&self, indices: &[usize]) -> Vec<RwLockReadGuard<'_, Tally>> {
        indices
            .iter()
            .map(|&i| self.chunks[i].vehicles.read())
            .collect()
    }

    fn write_chunks(&self, indices: &[usize]) -> Vec<RwLockWriteGuard<'_, Tally>> {
        indices
            .iter()
            .map(|&i| self.chunks[i].vehicles.write())
            .collect()
    }

    fn owner(&self, location: Location) -> Option<&Chunk> {
        if !self.contains(location) {
            return None;
        }
        self.chunk_index(location.x / self.chunk_side, location.y / self.chunk_side)
            .map(|i| &self.chunks[i])
    }

    /// Every occupied location within `radius` of `target`, with its count.
    pub fn scooters_near(&self, target: Location) -> BTreeMap<Location, u32> {
        let guards = self.read_chunks(&self.region(target));
        guards
            .iter()
            .flat_map(|tally| tally.iter())
            .filter(|(location, _)| self.within_radius(**location, target))
            .map(|(location, count)| (*location, *count))
            .collect()
    }

    /// Takes one vehicle from the closest occupied location within `radius`.
    ///
    /// Ties on distance go to the smallest location.
    pub fn reserve_closest(&self, target: Location) -> Option<Location> {
        let mut guards = self.write_chunks(&self.region(target));
        let (slot, location) = guards
            .iter()
            .enumerate()
            .flat_map(|(slot, tally)| tally.keys().map(move |location| (slot, *location)))
            .filter(|(_, location)| self.within_radius(*location, target))
            .min_by_key(|(_, location)| (location.distance(target), *location))?;

        let tally = &mut guards[slot];
        match tally.get_mut(&location) {
            Some(count) if *count > 1 => *count -= 1,
            _ => {
                tally.remove(&location);
            }
        }
        Some(location)
    }

    /// Parks one vehicle at `location`. Returns `false` if it is off the grid.
    pub fn release(&self, location: Location) -> bool {
        match self.owner(location) {
            Some(chunk) => {
                *chunk.vehicles.write().entry(location).or_insert(0) += 1;
                true
            }
            None => false,
        }
    }

    /// Snapshot of every occupied location, read with all chunks locked.
    pub fn all_occupied(&self) -> BTreeMap<Location, u32> {
        let guards: Vec<_> = self.chunks.iter().map(|c| c.vehicles.read()).collect();
        guards
            .iter()
            .flat_map(|tally| tally.iter().map(|(l, c)| (*l, *c)))
            .collect()
    }

    pub fn total_vehicles(&self) -> u64 {
        self.all_occupied().values().map(|&c| u64::from(c)).sum()
    }

    /// Parks `count` vehicles at uniformly random cells.
    pub fn seed_random<R: Rng + ?Sized>(&self, count: usize, rng: &mut R) {
        for _ in 0..count {
            let location = Location::new(
                rng.random_range(0..self.size),
                rng.random_range(0..self.size),
            );
            self.release(location);
        }
    }
}

#[cfg(test)]
mod tests;

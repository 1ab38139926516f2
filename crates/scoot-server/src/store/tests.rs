use super::ChunkGrid;
use rand::{Rng, SeedableRng, rngs::StdRng};
use scoot_core::Location;
use std::collections::{BTreeMap, HashSet};

fn loc(x: i32, y: i32) -> Location {
    Location::new(x, y)
}

fn grid_with(size: i32, radius: i32, vehicles: &[(Location, u32)]) -> ChunkGrid {
    let grid = ChunkGrid::new(size, radius).unwrap();
    for &(location, count) in vehicles {
        for _ in 0..count {
            assert!(grid.release(location));
        }
    }
    grid
}

fn brute_force_near(grid: &ChunkGrid, target: Location) -> BTreeMap<Location, u32> {
    grid.all_occupied()
        .into_iter()
        .filter(|(location, _)| location.distance(target) <= grid.radius() as u32)
        .collect()
}

fn run_region_matches_full_scan(size: i32, radius: i32, seed: u64) {
    let grid = ChunkGrid::new(size, radius).unwrap();
    let mut rng = StdRng::seed_from_u64(seed);
    grid.seed_random((size * size / 3) as usize, &mut rng);

    for x in 0..size {
        for y in 0..size {
            let target = loc(x, y);
            assert_eq!(
                grid.scooters_near(target),
                brute_force_near(&grid, target),
                "target {target} on a {size}x{size} grid with radius {radius}"
            );
        }
    }
}

#[test]
fn scenario_three_and_three() {
    let grid = grid_with(20, 2, &[(loc(0, 0), 3), (loc(6, 6), 3)]);

    assert_eq!(
        grid.scooters_near(loc(0, 0)),
        BTreeMap::from([(loc(0, 0), 3)])
    );

    assert_eq!(grid.reserve_closest(loc(0, 0)), Some(loc(0, 0)));
    assert_eq!(grid.scooters_near(loc(0, 0))[&loc(0, 0)], 2);
    assert_eq!(grid.reserve_closest(loc(0, 0)), Some(loc(0, 0)));
    assert_eq!(grid.reserve_closest(loc(0, 0)), Some(loc(0, 0)));
    assert_eq!(grid.reserve_closest(loc(0, 0)), None);

    assert!(grid.scooters_near(loc(0, 0)).is_empty());
    assert_eq!(grid.all_occupied(), BTreeMap::from([(loc(6, 6), 3)]));
}

#[test]
fn region_query_matches_full_scan() {
    run_region_matches_full_scan(20, 2, 1);
    run_region_matches_full_scan(12, 3, 2);
    run_region_matches_full_scan(8, 1, 3);
    run_region_matches_full_scan(6, 3, 4);
}

#[test]
fn finds_vehicles_across_chunk_borders() {
    // Chunks are 4x4; (4, 4) sits at the top-left of chunk (1, 1).
    let grid = grid_with(20, 2, &[(loc(3, 3), 1), (loc(2, 4), 1), (loc(4, 7), 1)]);
    let near = grid.scooters_near(loc(4, 4));
    assert_eq!(near, BTreeMap::from([(loc(2, 4), 1), (loc(3, 3), 1)]));

    // Bottom-right quadrant of chunk (0, 0) reaches into (1, 0), (0, 1), (1, 1).
    let grid = grid_with(20, 2, &[(loc(4, 3), 1), (loc(3, 4), 1), (loc(4, 4), 1)]);
    assert_eq!(grid.scooters_near(loc(3, 3)).len(), 3);
}

#[test]
fn reserve_picks_closest_then_smallest_location() {
    let grid = grid_with(20, 2, &[(loc(2, 1), 1), (loc(1, 2), 1), (loc(4, 4), 1)]);
    assert_eq!(grid.reserve_closest(loc(2, 2)), Some(loc(1, 2)));
    assert_eq!(grid.reserve_closest(loc(2, 2)), Some(loc(2, 1)));
    // (4, 4) is at distance 4 > radius.
    assert_eq!(grid.reserve_closest(loc(2, 2)), None);
    assert_eq!(grid.all_occupied(), BTreeMap::from([(loc(4, 4), 1)]));
}

#[test]
fn reserve_never_returns_a_farther_vehicle() {
    let grid = ChunkGrid::new(12, 2).unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    grid.seed_random(30, &mut rng);

    for _ in 0..200 {
        let target = loc(rng.random_range(0..12), rng.random_range(0..12));
        let before = brute_force_near(&grid, target);
        match grid.reserve_closest(target) {
            Some(taken) => {
                let best = before.keys().map(|l| l.distance(target)).min().unwrap();
                assert_eq!(taken.distance(target), best);
                assert!(grid.release(taken));
            }
            None => assert!(before.is_empty()),
        }
    }
}

#[test]
fn reserve_then_release_restores_counts() {
    let grid = grid_with(20, 2, &[(loc(5, 5), 2), (loc(6, 5), 1)]);
    let before = grid.all_occupied();
    let taken = grid.reserve_closest(loc(6, 5)).unwrap();
    assert_eq!(taken, loc(6, 5));
    assert!(!grid.all_occupied().contains_key(&taken));
    assert!(grid.release(taken));
    assert_eq!(grid.all_occupied(), before);
}

#[test]
fn off_grid_locations_are_rejected() {
    let grid = grid_with(8, 2, &[(loc(0, 0), 1)]);
    assert!(!grid.release(loc(-1, 0)));
    assert!(!grid.release(loc(0, 8)));
    assert!(grid.scooters_near(loc(-1, 0)).is_empty());
    assert_eq!(grid.reserve_closest(loc(0, -1)), None);
    assert!(!grid.contains(loc(8, 8)));
    assert_eq!(grid.total_vehicles(), 1);
}

#[test]
fn geometry_is_validated() {
    assert!(ChunkGrid::new(0, 2).is_err());
    assert!(ChunkGrid::new(20, 0).is_err());
    assert!(ChunkGrid::new(10, 3).is_err());
    assert!(ChunkGrid::new(-4, 1).is_err());
    assert!(ChunkGrid::new(12, 3).is_ok());
}

#[test]
fn region_is_sorted_and_bounded() {
    let grid = ChunkGrid::new(20, 2).unwrap();
    for x in 0..20 {
        for y in 0..20 {
            let region = grid.region(loc(x, y));
            assert!((1..=4).contains(&region.len()));
            assert!(region.windows(2).all(|w| w[0] < w[1]));
        }
    }
    // Corners only have one neighbour on each side.
    assert_eq!(grid.region(loc(0, 0)), vec![0]);
    assert_eq!(grid.region(loc(19, 19)), vec![24]);
    assert_eq!(grid.region(loc(4, 4)), vec![0, 1, 5, 6]);
}

#[test]
fn seeding_places_every_vehicle_on_the_grid() {
    let grid = ChunkGrid::new(20, 2).unwrap();
    let mut rng = StdRng::seed_from_u64(42);
    grid.seed_random(50, &mut rng);
    assert_eq!(grid.total_vehicles(), 50);
    assert!(grid.all_occupied().keys().all(|&l| grid.contains(l)));
}

#[test]
fn concurrent_reservations_conserve_vehicles() {
    let grid = ChunkGrid::new(20, 2).unwrap();
    let mut rng = StdRng::seed_from_u64(9);
    grid.seed_random(200, &mut rng);
    let total = grid.total_vehicles();

    std::thread::scope(|s| {
        for t in 0..8u64 {
            let grid = &grid;
            s.spawn(move || {
                let mut rng = StdRng::seed_from_u64(100 + t);
                for _ in 0..2_000 {
                    let target = loc(rng.random_range(0..20), rng.random_range(0..20));
                    if let Some(taken) = grid.reserve_closest(target) {
                        assert!(taken.distance(target) <= 2);
                        let drop_at = loc(rng.random_range(0..20), rng.random_range(0..20));
                        assert!(grid.release(drop_at));
                    }
                    let _ = grid.scooters_near(target);
                }
            });
        }
        // Full-grid scans interleave with region writers.
        s.spawn(|| {
            for _ in 0..200 {
                let snapshot = grid.all_occupied();
                assert!(snapshot.values().all(|&c| c > 0));
            }
        });
    });

    assert_eq!(grid.total_vehicles(), total);
    let cells: HashSet<_> = grid.all_occupied().into_keys().collect();
    assert!(cells.iter().all(|&l| grid.contains(l)));
}

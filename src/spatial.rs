//! Grid-bucketed spatial index over the live driver population.
//!
//! Drivers are bucketed into fixed-size grid cells keyed by
//! [`crate::geo::grid_key`]. Ingest builds a fresh map and swaps it in
//! wholesale, so readers always observe a consistent snapshot; no partial
//! merge is ever visible. Cells stay small because the grid is fine and the
//! liveness window is short.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::config::SpatialConfig;
use crate::domain::Driver;
use crate::geo;

/// Index statistics for the operator surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GridStats {
    /// Occupied grid cells.
    pub cells: usize,

    /// Drivers across all cells.
    pub drivers: usize,

    /// Mean drivers per occupied cell.
    pub avg_per_cell: f64,
}

/// Spatial index of live drivers, bucketed by grid cell.
pub struct DriverGrid {
    config: SpatialConfig,
    cells: RwLock<HashMap<String, Vec<Driver>>>,
}

impl DriverGrid {
    /// Create an empty grid.
    pub fn new(config: SpatialConfig) -> Self {
        Self {
            config,
            cells: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild the grid from `drivers` and swap it in atomically.
    ///
    /// Only drivers with a position that pass the liveness predicate are
    /// indexed; insertion order within a cell is preserved. Runs a stale
    /// sweep afterwards so a slow ingest cannot leave expired heartbeats
    /// behind.
    pub fn upsert_drivers(&self, drivers: &[Driver]) {
        let now = Utc::now();
        let mut next: HashMap<String, Vec<Driver>> = HashMap::new();

        for driver in drivers {
            let Some(position) = driver.position else {
                continue;
            };
            if !driver.is_live(now, self.config.driver_liveness_minutes) {
                continue;
            }
            let key = geo::grid_key(position.lat, position.lon, self.config.grid_degrees);
            next.entry(key).or_default().push(driver.clone());
        }

        let indexed: usize = next.values().map(Vec::len).sum();
        *self.cells.write() = next;
        tracing::debug!(drivers = indexed, "driver grid replaced");

        self.gc_stale();
    }

    /// Drop drivers that no longer satisfy the liveness predicate and
    /// delete cells that become empty. Returns how many drivers were
    /// removed.
    pub fn gc_stale(&self) -> usize {
        let now = Utc::now();
        let liveness = self.config.driver_liveness_minutes;
        let mut cells = self.cells.write();

        let before: usize = cells.values().map(Vec::len).sum();
        for drivers in cells.values_mut() {
            drivers.retain(|d| d.is_live(now, liveness));
        }
        cells.retain(|_, drivers| !drivers.is_empty());
        let after: usize = cells.values().map(Vec::len).sum();

        let removed = before - after;
        if removed > 0 {
            tracing::debug!(removed, "stale drivers swept from grid");
        }
        removed
    }

    /// Drivers within `radius_miles` of `(lat, lon)`, deduplicated by id
    /// and sorted by ascending distance. A zero radius returns only drivers
    /// exactly at the query position.
    pub fn near(&self, lat: f64, lon: f64, radius_miles: f64) -> Vec<Driver> {
        let g = self.config.grid_degrees;
        let d_lat = geo::lat_delta_degrees(radius_miles);
        let d_lon = geo::lon_delta_degrees(radius_miles, lat);

        let lat_lo = ((lat - d_lat) / g).floor() as i64;
        let lat_hi = ((lat + d_lat) / g).floor() as i64;
        let lon_lo = ((lon - d_lon) / g).floor() as i64;
        let lon_hi = ((lon + d_lon) / g).floor() as i64;

        let cells = self.cells.read();
        let mut seen: HashSet<String> = HashSet::new();
        let mut matches: Vec<(Driver, f64)> = Vec::new();

        for cell_lat in lat_lo..=lat_hi {
            for cell_lon in lon_lo..=lon_hi {
                let key = geo::cell_key(cell_lat, cell_lon, g);
                let Some(drivers) = cells.get(&key) else {
                    continue;
                };
                for driver in drivers {
                    let Some(position) = driver.position else {
                        continue;
                    };
                    let distance = geo::distance_miles(lat, lon, position.lat, position.lon);
                    if distance <= radius_miles && seen.insert(driver.id.clone()) {
                        matches.push((driver.clone(), distance));
                    }
                }
            }
        }

        matches.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        matches.into_iter().map(|(driver, _)| driver).collect()
    }

    /// Remove every cell. Used by emergency cleanup.
    pub fn clear(&self) {
        self.cells.write().clear();
        tracing::warn!("driver grid cleared");
    }

    /// Cell and driver counts.
    pub fn stats(&self) -> GridStats {
        let cells = self.cells.read();
        let drivers: usize = cells.values().map(Vec::len).sum();
        GridStats {
            cells: cells.len(),
            drivers,
            avg_per_cell: if cells.is_empty() {
                0.0
            } else {
                drivers as f64 / cells.len() as f64
            },
        }
    }
}

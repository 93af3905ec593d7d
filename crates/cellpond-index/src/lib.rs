//! Spatial occupancy indexing for compartment-local entity lookups.
//!
//! Each compartment owns one grid per entity kind. The grid discretizes
//! world positions onto the integer lattice and stores at most one payload
//! per lattice point, which matches the one-occupant-per-site contract of
//! the simulation core.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors emitted by occupancy grids.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Position lies outside the rectangle served by this grid.
    #[error("position ({0}, {1}) outside indexed rectangle")]
    OutOfBounds(i64, i64),
}

/// Common behaviour exposed by occupancy indices.
pub trait OccupancyIndex<T: Copy> {
    /// Drop all stored occupants while retaining capacity.
    fn clear(&mut self);

    /// Store `payload` at the lattice point containing `pos`.
    fn set(&mut self, pos: (f64, f64), payload: T) -> Result<(), IndexError>;

    /// Remove the occupant at `pos` if `predicate` accepts it.
    fn remove_if(&mut self, pos: (f64, f64), predicate: &mut dyn FnMut(&T) -> bool);

    /// Point lookup at the lattice point containing `pos`.
    fn get(&self, pos: (f64, f64)) -> Option<T>;

    /// Visit every occupant within `radius` of `pos`, nearest first.
    fn visit_within(&self, pos: (f64, f64), radius: f64, visitor: &mut dyn FnMut(T, f64));
}

/// Dense grid covering one compartment rectangle at unit resolution.
///
/// Lattice coordinates are absolute; the grid subtracts its own origin, so
/// callers pass canonical (already wrapped) world positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompartmentGrid<T: Copy> {
    origin_x: i64,
    origin_y: i64,
    width: usize,
    height: usize,
    #[serde(skip)]
    slots: Vec<Option<T>>,
}

impl<T: Copy> CompartmentGrid<T> {
    /// Create a grid for the rectangle starting at `origin` spanning `width`
    /// by `height` lattice points.
    pub fn new(
        origin: (i64, i64),
        width: usize,
        height: usize,
    ) -> Result<Self, IndexError> {
        if width == 0 || height == 0 {
            return Err(IndexError::InvalidConfig(
                "grid dimensions must be non-zero",
            ));
        }
        Ok(Self {
            origin_x: origin.0,
            origin_y: origin.1,
            width,
            height,
            slots: vec![None; width * height],
        })
    }

    /// Width of the indexed rectangle in lattice points.
    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }

    /// Height of the indexed rectangle in lattice points.
    #[must_use]
    pub const fn height(&self) -> usize {
        self.height
    }

    fn lattice(pos: (f64, f64)) -> (i64, i64) {
        (pos.0.floor() as i64, pos.1.floor() as i64)
    }

    fn offset(&self, lattice: (i64, i64)) -> Option<usize> {
        let x = lattice.0 - self.origin_x;
        let y = lattice.1 - self.origin_y;
        if x < 0 || y < 0 || x as usize >= self.width || y as usize >= self.height {
            return None;
        }
        Some(y as usize * self.width + x as usize)
    }

    /// Restore slot storage after deserialization (slots are transient).
    pub fn ensure_capacity(&mut self) {
        let len = self.width * self.height;
        if self.slots.len() != len {
            self.slots = vec![None; len];
        }
    }
}

impl<T: Copy> OccupancyIndex<T> for CompartmentGrid<T> {
    fn clear(&mut self) {
        self.ensure_capacity();
        self.slots.fill(None);
    }

    fn set(&mut self, pos: (f64, f64), payload: T) -> Result<(), IndexError> {
        let lattice = Self::lattice(pos);
        let offset = self
            .offset(lattice)
            .ok_or(IndexError::OutOfBounds(lattice.0, lattice.1))?;
        self.slots[offset] = Some(payload);
        Ok(())
    }

    fn remove_if(&mut self, pos: (f64, f64), predicate: &mut dyn FnMut(&T) -> bool) {
        if let Some(offset) = self.offset(Self::lattice(pos)) {
            if matches!(&self.slots[offset], Some(existing) if predicate(existing)) {
                self.slots[offset] = None;
            }
        }
    }

    fn get(&self, pos: (f64, f64)) -> Option<T> {
        self.offset(Self::lattice(pos))
            .and_then(|offset| self.slots[offset])
    }

    fn visit_within(&self, pos: (f64, f64), radius: f64, visitor: &mut dyn FnMut(T, f64)) {
        if radius < 0.0 {
            return;
        }
        let reach = radius.ceil() as i64;
        let (cx, cy) = Self::lattice(pos);
        let mut hits: Vec<(OrderedFloat<f64>, i64, i64, T)> = Vec::new();
        for dy in -reach..=reach {
            for dx in -reach..=reach {
                let lattice = (cx + dx, cy + dy);
                let Some(offset) = self.offset(lattice) else {
                    continue;
                };
                let Some(payload) = self.slots[offset] else {
                    continue;
                };
                let px = lattice.0 as f64 + 0.5 - pos.0;
                let py = lattice.1 as f64 + 0.5 - pos.1;
                let dist = (px * px + py * py).sqrt();
                if dist <= radius {
                    hits.push((OrderedFloat(dist), lattice.1, lattice.0, payload));
                }
            }
        }
        // Sort keys include lattice coordinates so traversal order is stable
        // across runs regardless of insertion history.
        hits.sort_by(|a, b| (a.0, a.1, a.2).cmp(&(b.0, b.1, b.2)));
        for (dist, _, _, payload) in hits {
            visitor(payload, dist.into_inner());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sized_grid_is_rejected() {
        assert!(matches!(
            CompartmentGrid::<u32>::new((0, 0), 0, 4),
            Err(IndexError::InvalidConfig(_))
        ));
    }

    #[test]
    fn point_lookup_round_trips() {
        let mut grid = CompartmentGrid::new((8, 8), 8, 8).expect("grid");
        grid.set((10.4, 12.9), 7u32).expect("in bounds");
        assert_eq!(grid.get((10.1, 12.2)), Some(7));
        assert_eq!(grid.get((11.0, 12.2)), None);
        assert!(matches!(
            grid.set((2.0, 2.0), 9),
            Err(IndexError::OutOfBounds(2, 2))
        ));
    }

    #[test]
    fn remove_respects_predicate() {
        let mut grid = CompartmentGrid::new((0, 0), 4, 4).expect("grid");
        grid.set((1.5, 1.5), 3u32).expect("set");
        grid.remove_if((1.5, 1.5), &mut |value| *value == 4);
        assert_eq!(grid.get((1.5, 1.5)), Some(3));
        grid.remove_if((1.5, 1.5), &mut |value| *value == 3);
        assert_eq!(grid.get((1.5, 1.5)), None);
    }

    #[test]
    fn radius_query_is_sorted_by_distance() {
        let mut grid = CompartmentGrid::new((0, 0), 16, 16).expect("grid");
        grid.set((8.5, 8.5), 0u32).expect("set");
        grid.set((10.5, 8.5), 1u32).expect("set");
        grid.set((8.5, 12.5), 2u32).expect("set");
        grid.set((14.5, 14.5), 3u32).expect("set");

        let mut seen = Vec::new();
        grid.visit_within((8.5, 8.5), 5.0, &mut |payload, _| seen.push(payload));
        assert_eq!(seen, vec![0, 1, 2]);
    }
}

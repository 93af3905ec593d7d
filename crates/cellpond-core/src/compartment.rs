//! Rectangular world partitioning and neighbor addressing.

use crate::space::{SpaceMetric, Vector2};
use crate::{ContextKey, CoreError};
use serde::{Deserialize, Serialize};

/// One of the 8 compass directions used to address compartment neighbors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RelativeLocation {
    North,
    NorthEast,
    East,
    SouthEast,
    South,
    SouthWest,
    West,
    NorthWest,
}

impl RelativeLocation {
    /// All directions in a fixed order matching [`Self::index`].
    pub const ALL: [Self; 8] = [
        Self::North,
        Self::NorthEast,
        Self::East,
        Self::SouthEast,
        Self::South,
        Self::SouthWest,
        Self::West,
        Self::NorthWest,
    ];

    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::North => 0,
            Self::NorthEast => 1,
            Self::East => 2,
            Self::SouthEast => 3,
            Self::South => 4,
            Self::SouthWest => 5,
            Self::West => 6,
            Self::NorthWest => 7,
        }
    }

    /// Grid offset of the neighbor in this direction. North is -y.
    #[must_use]
    pub const fn offset(self) -> (i64, i64) {
        match self {
            Self::North => (0, -1),
            Self::NorthEast => (1, -1),
            Self::East => (1, 0),
            Self::SouthEast => (1, 1),
            Self::South => (0, 1),
            Self::SouthWest => (-1, 1),
            Self::West => (-1, 0),
            Self::NorthWest => (-1, -1),
        }
    }

    /// Direction matching a non-zero grid offset, if any.
    #[must_use]
    pub fn from_offset(dx: i64, dy: i64) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|location| location.offset() == (dx, dy))
    }
}

/// Axis-aligned compartment rectangle on the lattice, half-open.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompartmentRect {
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
}

impl CompartmentRect {
    #[must_use]
    pub const fn new(x: i64, y: i64, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    #[must_use]
    pub fn contains(&self, pos: Vector2) -> bool {
        pos.x >= self.x as f64
            && pos.x < (self.x + i64::from(self.width)) as f64
            && pos.y >= self.y as f64
            && pos.y < (self.y + i64::from(self.height)) as f64
    }

    /// Center of the rectangle, used for wrap-aware direction tests.
    #[must_use]
    pub fn center(&self) -> Vector2 {
        Vector2::new(
            self.x as f64 + f64::from(self.width) / 2.0,
            self.y as f64 + f64::from(self.height) / 2.0,
        )
    }
}

/// A compartment: its rectangle plus weak references (context keys) to the
/// 8 neighboring execution contexts. Registration happens once during world
/// construction and is idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Compartment {
    rect: CompartmentRect,
    neighbors: [Option<ContextKey>; 8],
}

impl Compartment {
    #[must_use]
    pub fn new(rect: CompartmentRect) -> Self {
        Self {
            rect,
            neighbors: [None; 8],
        }
    }

    #[must_use]
    pub const fn rect(&self) -> CompartmentRect {
        self.rect
    }

    pub fn register_neighbor_context(&mut self, location: RelativeLocation, context: ContextKey) {
        self.neighbors[location.index()] = Some(context);
    }

    #[must_use]
    pub fn neighbor(&self, location: RelativeLocation) -> Option<ContextKey> {
        self.neighbors[location.index()]
    }

    /// All registered neighbor contexts in direction order.
    pub fn neighbor_contexts(&self) -> impl Iterator<Item = ContextKey> + '_ {
        self.neighbors.iter().filter_map(|slot| *slot)
    }

    #[must_use]
    pub fn is_point_in_compartment(&self, pos: Vector2) -> bool {
        self.rect.contains(pos)
    }

    /// Resolve the neighbor context whose rectangle contains `pos`.
    ///
    /// `pos` must be canonical (wrapped). Compartments tile the world, so an
    /// unregistered direction is a construction error.
    pub fn get_neighbor_context(
        &self,
        pos: Vector2,
        metric: &SpaceMetric,
    ) -> Result<ContextKey, CoreError> {
        let delta = metric.displacement(self.rect.center(), pos);
        let half_w = f64::from(self.rect.width) / 2.0;
        let half_h = f64::from(self.rect.height) / 2.0;
        let dx = if delta.x < -half_w {
            -1
        } else if delta.x >= half_w {
            1
        } else {
            0
        };
        let dy = if delta.y < -half_h {
            -1
        } else if delta.y >= half_h {
            1
        } else {
            0
        };
        let location = RelativeLocation::from_offset(dx, dy).ok_or(
            CoreError::NoNeighborRegistered(pos.x.floor() as i64, pos.y.floor() as i64),
        )?;
        self.neighbor(location)
            .ok_or(CoreError::NoNeighborRegistered(
                pos.x.floor() as i64,
                pos.y.floor() as i64,
            ))
    }
}

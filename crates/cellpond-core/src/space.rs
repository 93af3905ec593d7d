//! Toroidal coordinate arithmetic shared by every compartment.

use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign, Div, Mul, Sub};

/// 2D position or displacement in world units.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Vector2 {
    pub x: f64,
    pub y: f64,
}

impl Vector2 {
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    #[must_use]
    pub fn length(self) -> f64 {
        (self.x * self.x + self.y * self.y).sqrt()
    }
}

impl Add for Vector2 {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl AddAssign for Vector2 {
    fn add_assign(&mut self, rhs: Self) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl Sub for Vector2 {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f64> for Vector2 {
    type Output = Self;
    fn mul(self, rhs: f64) -> Self {
        Self::new(self.x * rhs, self.y * rhs)
    }
}

impl Div<f64> for Vector2 {
    type Output = Self;
    fn div(self, rhs: f64) -> Self {
        Self::new(self.x / rhs, self.y / rhs)
    }
}

/// Wrap-around metric over a `width` by `height` torus.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SpaceMetric {
    width: f64,
    height: f64,
}

impl SpaceMetric {
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: f64::from(width),
            height: f64::from(height),
        }
    }

    #[must_use]
    pub const fn width(&self) -> f64 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> f64 {
        self.height
    }

    /// Map any coordinate into the canonical range `[0, extent)` per axis.
    #[must_use]
    pub fn wrap(&self, pos: Vector2) -> Vector2 {
        Vector2::new(
            wrap_axis(pos.x, self.width),
            wrap_axis(pos.y, self.height),
        )
    }

    /// Shortest displacement from `a` to `b` across the torus.
    #[must_use]
    pub fn displacement(&self, a: Vector2, b: Vector2) -> Vector2 {
        Vector2::new(
            shortest_axis(b.x - a.x, self.width),
            shortest_axis(b.y - a.y, self.height),
        )
    }

    /// Toroidal distance between two positions.
    #[must_use]
    pub fn distance(&self, a: Vector2, b: Vector2) -> f64 {
        self.displacement(a, b).length()
    }
}

fn wrap_axis(value: f64, extent: f64) -> f64 {
    let wrapped = value % extent;
    if wrapped < 0.0 {
        wrapped + extent
    } else {
        wrapped
    }
}

fn shortest_axis(delta: f64, extent: f64) -> f64 {
    let wrapped = wrap_axis(delta, extent);
    if wrapped > extent / 2.0 {
        wrapped - extent
    } else {
        wrapped
    }
}

/// Direction angle of a displacement in degrees, in `[0, 360)`.
///
/// Zero points along the positive x axis, growing counter-clockwise.
#[must_use]
pub fn angle_of_vector(delta: Vector2) -> f64 {
    if delta.x == 0.0 && delta.y == 0.0 {
        return 0.0;
    }
    let degrees = delta.y.atan2(delta.x).to_degrees();
    if degrees < 0.0 {
        degrees + 360.0
    } else {
        degrees
    }
}

/// Unit vector pointing along `angle` degrees.
#[must_use]
pub fn unit_vector_of_angle(angle: f64) -> Vector2 {
    let radians = angle.to_radians();
    Vector2::new(radians.cos(), radians.sin())
}

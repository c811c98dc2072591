use glam::{Affine2, Vec2 as GlamVec2};
use serde::{Deserialize, Serialize};

/// 2D vector type used throughout Lumen2D.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Self = Self { x: 0.0, y: 0.0 };
    pub const ONE: Self = Self { x: 1.0, y: 1.0 };

    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn splat(value: f32) -> Self {
        Self::new(value, value)
    }

    pub fn length(&self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    pub fn normalized(&self) -> Self {
        let len = self.length();
        if len == 0.0 {
            Self::ZERO
        } else {
            Self::new(self.x / len, self.y / len)
        }
    }

    pub fn to_glam(&self) -> GlamVec2 {
        GlamVec2::new(self.x, self.y)
    }

    pub fn from_glam(value: GlamVec2) -> Self {
        Self::new(value.x, value.y)
    }

    /// Returns the squared length of the vector (faster than `length()`).
    pub fn length_squared(&self) -> f32 {
        self.x * self.x + self.y * self.y
    }

    /// Computes the dot product of two vectors.
    pub fn dot(self, rhs: Self) -> f32 {
        self.x * rhs.x + self.y * rhs.y
    }

    /// Z component of the 3D cross product. Positive when `rhs` lies
    /// counter-clockwise of `self`.
    pub fn cross(self, rhs: Self) -> f32 {
        self.x * rhs.y - self.y * rhs.x
    }

    /// Computes the squared distance between two points (faster than `distance()`).
    pub fn distance_squared(self, rhs: Self) -> f32 {
        (self - rhs).length_squared()
    }

    /// Linearly interpolates between two vectors.
    pub fn lerp(self, rhs: Self, t: f32) -> Self {
        Self::new(
            self.x + (rhs.x - self.x) * t,
            self.y + (rhs.y - self.y) * t,
        )
    }

    /// Rotates the vector counter-clockwise by `angle` radians.
    pub fn rotated(self, angle: f32) -> Self {
        let (sin, cos) = angle.sin_cos();
        Self::new(self.x * cos - self.y * sin, self.x * sin + self.y * cos)
    }

    /// Returns a vector with component-wise minimum values.
    pub fn min(self, rhs: Self) -> Self {
        Self::new(self.x.min(rhs.x), self.y.min(rhs.y))
    }

    /// Returns a vector with component-wise maximum values.
    pub fn max(self, rhs: Self) -> Self {
        Self::new(self.x.max(rhs.x), self.y.max(rhs.y))
    }

    pub fn to_array(self) -> [f32; 2] {
        [self.x, self.y]
    }
}

impl From<(f32, f32)> for Vec2 {
    fn from(value: (f32, f32)) -> Self {
        Self {
            x: value.0,
            y: value.1,
        }
    }
}

impl std::ops::Add for Vec2 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl std::ops::AddAssign for Vec2 {
    fn add_assign(&mut self, rhs: Self) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl std::ops::Sub for Vec2 {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl std::ops::SubAssign for Vec2 {
    fn sub_assign(&mut self, rhs: Self) {
        self.x -= rhs.x;
        self.y -= rhs.y;
    }
}

impl std::ops::Mul<f32> for Vec2 {
    type Output = Self;

    fn mul(self, rhs: f32) -> Self::Output {
        Self::new(self.x * rhs, self.y * rhs)
    }
}

/// Component-wise product.
impl std::ops::Mul<Vec2> for Vec2 {
    type Output = Self;

    fn mul(self, rhs: Vec2) -> Self::Output {
        Self::new(self.x * rhs.x, self.y * rhs.y)
    }
}

impl std::ops::Div<f32> for Vec2 {
    type Output = Self;

    fn div(self, rhs: f32) -> Self::Output {
        Self::new(self.x / rhs, self.y / rhs)
    }
}

/// Component-wise quotient.
impl std::ops::Div<Vec2> for Vec2 {
    type Output = Self;

    fn div(self, rhs: Vec2) -> Self::Output {
        Self::new(self.x / rhs.x, self.y / rhs.y)
    }
}

impl std::ops::Neg for Vec2 {
    type Output = Self;

    fn neg(self) -> Self::Output {
        Self::new(-self.x, -self.y)
    }
}

/// Applies an affine transform to a point.
pub fn transform_point(matrix: &Affine2, point: Vec2) -> Vec2 {
    Vec2::from_glam(matrix.transform_point2(point.to_glam()))
}

/// Axis-aligned box in a y-up coordinate space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Box2 {
    pub left: f32,
    pub bottom: f32,
    pub right: f32,
    pub top: f32,
}

impl Box2 {
    pub const fn new(left: f32, bottom: f32, right: f32, top: f32) -> Self {
        Self {
            left,
            bottom,
            right,
            top,
        }
    }

    pub fn from_corners(bottom_left: Vec2, top_right: Vec2) -> Self {
        Self::new(bottom_left.x, bottom_left.y, top_right.x, top_right.y)
    }

    /// Box of the given full `size` centred on `center`.
    pub fn centered_around(center: Vec2, size: Vec2) -> Self {
        let half = size * 0.5;
        Self::from_corners(center - half, center + half)
    }

    /// Zero-area box at a single point.
    pub fn point(point: Vec2) -> Self {
        Self::from_corners(point, point)
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.top - self.bottom
    }

    pub fn size(&self) -> Vec2 {
        Vec2::new(self.width(), self.height())
    }

    pub fn center(&self) -> Vec2 {
        Vec2::new(
            (self.left + self.right) * 0.5,
            (self.bottom + self.top) * 0.5,
        )
    }

    pub fn bottom_left(&self) -> Vec2 {
        Vec2::new(self.left, self.bottom)
    }

    pub fn bottom_right(&self) -> Vec2 {
        Vec2::new(self.right, self.bottom)
    }

    pub fn top_left(&self) -> Vec2 {
        Vec2::new(self.left, self.top)
    }

    pub fn top_right(&self) -> Vec2 {
        Vec2::new(self.right, self.top)
    }

    /// True when the box has no area (or is inverted).
    pub fn is_empty(&self) -> bool {
        self.right <= self.left || self.top <= self.bottom
    }

    pub fn contains(&self, point: Vec2) -> bool {
        point.x >= self.left && point.x <= self.right && point.y >= self.bottom && point.y <= self.top
    }

    /// Inclusive overlap test: boxes that share only an edge intersect.
    pub fn intersects(&self, other: &Box2) -> bool {
        self.left <= other.right
            && other.left <= self.right
            && self.bottom <= other.top
            && other.bottom <= self.top
    }

    /// Overlapping region. Disjoint boxes yield a zero-sized box.
    pub fn intersect(&self, other: &Box2) -> Box2 {
        let left = self.left.max(other.left);
        let bottom = self.bottom.max(other.bottom);
        let right = self.right.min(other.right).max(left);
        let top = self.top.min(other.top).max(bottom);
        Box2::new(left, bottom, right, top)
    }

    pub fn union(&self, other: &Box2) -> Box2 {
        Box2::new(
            self.left.min(other.left),
            self.bottom.min(other.bottom),
            self.right.max(other.right),
            self.top.max(other.top),
        )
    }

    #[must_use]
    pub fn extend_to_contain(&self, point: Vec2) -> Box2 {
        Box2::new(
            self.left.min(point.x),
            self.bottom.min(point.y),
            self.right.max(point.x),
            self.top.max(point.y),
        )
    }

    #[must_use]
    pub fn enlarged(&self, amount: f32) -> Box2 {
        Box2::new(
            self.left - amount,
            self.bottom - amount,
            self.right + amount,
            self.top + amount,
        )
    }

    #[must_use]
    pub fn translated(&self, offset: Vec2) -> Box2 {
        Box2::new(
            self.left + offset.x,
            self.bottom + offset.y,
            self.right + offset.x,
            self.top + offset.y,
        )
    }

    /// Bounding box of the four corners after applying `matrix`.
    pub fn transformed(&self, matrix: &Affine2) -> Box2 {
        let corners = [
            self.bottom_left(),
            self.bottom_right(),
            self.top_right(),
            self.top_left(),
        ];
        bounds_of(corners.iter().map(|c| transform_point(matrix, *c)))
    }
}

fn bounds_of(mut points: impl Iterator<Item = Vec2>) -> Box2 {
    let Some(first) = points.next() else {
        return Box2::default();
    };
    points.fold(Box2::point(first), |acc, p| acc.extend_to_contain(p))
}

/// A [`Box2`] rotated by `rotation` radians around `origin`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Box2Rotated {
    pub bounds: Box2,
    pub rotation: f32,
    pub origin: Vec2,
}

impl Box2Rotated {
    pub fn new(bounds: Box2, rotation: f32, origin: Vec2) -> Self {
        Self {
            bounds,
            rotation,
            origin,
        }
    }

    pub fn corners(&self) -> [Vec2; 4] {
        let rotate = |p: Vec2| (p - self.origin).rotated(self.rotation) + self.origin;
        [
            rotate(self.bounds.bottom_left()),
            rotate(self.bounds.bottom_right()),
            rotate(self.bounds.top_right()),
            rotate(self.bounds.top_left()),
        ]
    }

    /// Axis-aligned box enclosing the rotated corners.
    pub fn calc_bounding_box(&self) -> Box2 {
        bounds_of(self.corners().into_iter())
    }

    /// Axis-aligned box enclosing the rotated corners after `matrix`.
    pub fn transformed(&self, matrix: &Affine2) -> Box2 {
        bounds_of(self.corners().into_iter().map(|c| transform_point(matrix, c)))
    }
}

impl From<Box2> for Box2Rotated {
    fn from(bounds: Box2) -> Self {
        Self::new(bounds, 0.0, Vec2::ZERO)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Circle {
    pub center: Vec2,
    pub radius: f32,
}

impl Circle {
    pub fn new(center: Vec2, radius: f32) -> Self {
        Self { center, radius }
    }

    /// Inclusive: a circle tangent to the box intersects it.
    pub fn intersects_box(&self, bounds: &Box2) -> bool {
        let closest = Vec2::new(
            self.center.x.clamp(bounds.left, bounds.right),
            self.center.y.clamp(bounds.bottom, bounds.top),
        );
        closest.distance_squared(self.center) <= self.radius * self.radius
    }

    pub fn bounding_box(&self) -> Box2 {
        Box2::centered_around(self.center, Vec2::splat(self.radius * 2.0))
    }
}

/// Position and rotation of an entity or a spatial tree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Transform2D {
    pub position: Vec2,
    /// Rotation in radians, counter-clockwise.
    pub rotation: f32,
}

impl Transform2D {
    pub fn new(position: Vec2, rotation: f32) -> Self {
        Self { position, rotation }
    }

    pub fn identity() -> Self {
        Self::default()
    }

    pub fn from_position(position: Vec2) -> Self {
        Self::new(position, 0.0)
    }

    pub fn to_affine(&self) -> Affine2 {
        Affine2::from_angle_translation(self.rotation, self.position.to_glam())
    }

    pub fn inverse_affine(&self) -> Affine2 {
        self.to_affine().inverse()
    }

    /// Composes a local transform under this (parent) transform.
    pub fn then(&self, local: &Transform2D) -> Transform2D {
        Transform2D::new(
            self.position + local.position.rotated(self.rotation),
            self.rotation + local.rotation,
        )
    }

    pub fn transform_point(&self, point: Vec2) -> Vec2 {
        self.position + point.rotated(self.rotation)
    }
}

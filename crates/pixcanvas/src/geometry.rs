use std::fmt;

use serde::{Deserialize, Serialize};

/// Position in world pixel space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn offset(self, other: Point) -> Self {
        Self {
            x: self.x.saturating_add(other.x),
            y: self.y.saturating_add(other.y),
        }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Extent in pixels. Used for the chunk size of a canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelSize {
    pub width: i32,
    pub height: i32,
}

impl PixelSize {
    pub const fn new(width: i32, height: i32) -> Self {
        Self { width, height }
    }

    pub fn is_positive(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// Chunk that contains the given pixel.
    ///
    /// Positive origin values move the chunk grid into negative direction.
    pub fn chunk_coord(&self, pos: Point, origin: Point) -> ChunkCoordinate {
        ChunkCoordinate {
            x: saturate(divide_floor(pos.x as i64 + origin.x as i64, self.width as i64)),
            y: saturate(divide_floor(pos.y as i64 + origin.y as i64, self.height as i64)),
        }
    }

    /// Smallest chunk rectangle that fully contains `rect`.
    pub fn outer_chunk_rect(&self, rect: Rect, origin: Point) -> ChunkRect {
        let (min_x, min_y, max_x, max_y) = shifted_bounds(rect, origin);
        ChunkRect {
            min: ChunkCoordinate {
                x: saturate(divide_floor(min_x, self.width as i64)),
                y: saturate(divide_floor(min_y, self.height as i64)),
            },
            max: ChunkCoordinate {
                x: saturate(divide_ceil(max_x, self.width as i64)),
                y: saturate(divide_ceil(max_y, self.height as i64)),
            },
        }
    }

    /// Largest chunk rectangle that is fully contained by `rect`.
    ///
    /// The result has zero area when `rect` is smaller than a chunk.
    pub fn inner_chunk_rect(&self, rect: Rect, origin: Point) -> ChunkRect {
        let (min_x, min_y, max_x, max_y) = shifted_bounds(rect, origin);
        let min = ChunkCoordinate {
            x: saturate(divide_ceil(min_x, self.width as i64)),
            y: saturate(divide_ceil(min_y, self.height as i64)),
        };
        let mut max = ChunkCoordinate {
            x: saturate(divide_floor(max_x, self.width as i64)),
            y: saturate(divide_floor(max_y, self.height as i64)),
        };
        if max.x < min.x {
            max.x = min.x;
        }
        if max.y < min.y {
            max.y = min.y;
        }
        ChunkRect { min, max }
    }
}

impl fmt::Display for PixelSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Half-open pixel rectangle `[min, max)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub min: Point,
    pub max: Point,
}

impl Rect {
    /// Builds a canonical rectangle, swapping corners where needed.
    pub fn new(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        Self {
            min: Point::new(x0.min(x1), y0.min(y1)),
            max: Point::new(x0.max(x1), y0.max(y1)),
        }
    }

    pub fn from_origin_size(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self::new(x, y, x.saturating_add(width), y.saturating_add(height))
    }

    /// The whole addressable i32 plane.
    pub const fn everything() -> Self {
        Self {
            min: Point::new(i32::MIN, i32::MIN),
            max: Point::new(i32::MAX, i32::MAX),
        }
    }

    pub fn width(&self) -> i32 {
        self.max.x.saturating_sub(self.min.x)
    }

    pub fn height(&self) -> i32 {
        self.max.y.saturating_sub(self.min.y)
    }

    pub fn area(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        self.width() as u64 * self.height() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.min.x >= self.max.x || self.min.y >= self.max.y
    }

    pub fn contains_point(&self, pos: Point) -> bool {
        pos.x >= self.min.x && pos.x < self.max.x && pos.y >= self.min.y && pos.y < self.max.y
    }

    /// True if `other` lies within `self`. Empty rectangles are contained by everything.
    pub fn contains_rect(&self, other: &Rect) -> bool {
        if other.is_empty() {
            return true;
        }
        other.min.x >= self.min.x
            && other.min.y >= self.min.y
            && other.max.x <= self.max.x
            && other.max.y <= self.max.y
    }

    pub fn intersect(&self, other: &Rect) -> Rect {
        let rect = Rect {
            min: Point::new(self.min.x.max(other.min.x), self.min.y.max(other.min.y)),
            max: Point::new(self.max.x.min(other.max.x), self.max.y.min(other.max.y)),
        };
        if rect.is_empty() {
            Rect::default()
        } else {
            rect
        }
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        !self.intersect(other).is_empty()
    }

    pub fn translate(&self, delta: Point) -> Rect {
        Rect {
            min: self.min.offset(delta),
            max: self.max.offset(delta),
        }
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

/// Index of a chunk in tile space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkCoordinate {
    pub x: i32,
    pub y: i32,
}

impl ChunkCoordinate {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Pixel rectangle covered by this chunk.
    pub fn pixel_rect(&self, chunk_size: PixelSize, origin: Point) -> Rect {
        ChunkRect {
            min: *self,
            max: ChunkCoordinate::new(self.x.saturating_add(1), self.y.saturating_add(1)),
        }
        .pixel_rect(chunk_size, origin)
    }
}

impl fmt::Display for ChunkCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.x, self.y)
    }
}

/// Half-open rectangle measured in chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ChunkRect {
    pub min: ChunkCoordinate,
    pub max: ChunkCoordinate,
}

impl ChunkRect {
    pub fn is_empty(&self) -> bool {
        self.min.x >= self.max.x || self.min.y >= self.max.y
    }

    pub fn contains(&self, coord: ChunkCoordinate) -> bool {
        coord.x >= self.min.x && coord.x < self.max.x && coord.y >= self.min.y && coord.y < self.max.y
    }

    pub fn len(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        let width = (self.max.x as i64 - self.min.x as i64) as usize;
        let height = (self.max.y as i64 - self.min.y as i64) as usize;
        width.saturating_mul(height)
    }

    /// Converts back into pixel space.
    ///
    /// Positive origin values move the chunk grid into negative direction.
    pub fn pixel_rect(&self, chunk_size: PixelSize, origin: Point) -> Rect {
        let to_pixel = |chunk: i32, size: i32, origin: i32| {
            saturate(chunk as i64 * size as i64 - origin as i64)
        };
        Rect {
            min: Point::new(
                to_pixel(self.min.x, chunk_size.width, origin.x),
                to_pixel(self.min.y, chunk_size.height, origin.y),
            ),
            max: Point::new(
                to_pixel(self.max.x, chunk_size.width, origin.x),
                to_pixel(self.max.y, chunk_size.height, origin.y),
            ),
        }
    }

    /// Row-major enumeration of all contained chunk coordinates.
    pub fn iter(&self) -> impl Iterator<Item = ChunkCoordinate> {
        let rect = *self;
        let (min_x, max_x) = (rect.min.x, rect.max.x.max(rect.min.x));
        (rect.min.y..rect.max.y)
            .flat_map(move |y| (min_x..max_x).map(move |x| ChunkCoordinate::new(x, y)))
    }
}

/// Integer division rounding toward negative infinity.
pub fn divide_floor(a: i64, b: i64) -> i64 {
    let quotient = a / b;
    if (a ^ b) < 0 && a % b != 0 {
        quotient - 1
    } else {
        quotient
    }
}

/// Integer division rounding toward positive infinity.
pub fn divide_ceil(a: i64, b: i64) -> i64 {
    let quotient = a / b;
    if (a ^ b) >= 0 && a % b != 0 {
        quotient + 1
    } else {
        quotient
    }
}

fn shifted_bounds(rect: Rect, origin: Point) -> (i64, i64, i64, i64) {
    let rect = Rect::new(rect.min.x, rect.min.y, rect.max.x, rect.max.y);
    (
        rect.min.x as i64 + origin.x as i64,
        rect.min.y as i64 + origin.y as i64,
        rect.max.x as i64 + origin.x as i64,
        rect.max.y as i64 + origin.y as i64,
    )
}

fn saturate(value: i64) -> i32 {
    value.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

use bytemuck::{Pod, Zeroable};

/// One render-ready point: normalized position plus the raw channel value.
/// Laid out exactly as the vertex buffer expects it (12 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Point {
    pub x: f32,
    pub y: f32,
    pub value: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32, value: f32) -> Self {
        Self { x, y, value }
    }
}

impl From<[f32; 3]> for Point {
    fn from(v: [f32; 3]) -> Self {
        Self::new(v[0], v[1], v[2])
    }
}

/// A finished point array, produced off-thread and handed to the render
/// engine as a whole.
#[derive(Clone, Debug, Default)]
pub struct PointCloud {
    points: Vec<Point>,
}

impl PointCloud {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.points)
    }

    /// Min/max of the value column, ignoring non-finite values.
    pub fn value_range(&self) -> Option<(f32, f32)> {
        self.points
            .iter()
            .map(|p| p.value)
            .filter(|v| v.is_finite())
            .fold(None, |acc, v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }

    /// Two crossing lines with values ramping 0..32767, useful before any
    /// layer has been loaded.
    pub fn demo_cross() -> Self {
        let n = 50;
        let mut points = Vec::with_capacity(n * 2);
        for i in 0..n {
            let t = -0.5 + i as f32 / (n - 1) as f32;
            points.push(Point::new(t, 0.0, (t + 0.5) * 32767.0));
        }
        for i in 0..n {
            let t = -0.5 + i as f32 / (n - 1) as f32;
            points.push(Point::new(0.0, t, (t + 0.5) * 32767.0));
        }
        Self::new(points)
    }
}

impl FromIterator<Point> for PointCloud {
    fn from_iter<I: IntoIterator<Item = Point>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

use crate::points::Point;

/// Axis-aligned bounds of the x/y columns.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Extent {
    pub x_min: f32,
    pub x_max: f32,
    pub y_min: f32,
    pub y_max: f32,
}

impl Extent {
    /// Full pass over `rows`; `None` when there are no finite rows.
    pub fn scan(rows: impl IntoIterator<Item = [f32; 3]>) -> Option<Self> {
        rows.into_iter()
            .filter(|r| r[0].is_finite() && r[1].is_finite())
            .fold(None, |acc, [x, y, _]| {
                Some(match acc {
                    None => Extent {
                        x_min: x,
                        x_max: x,
                        y_min: y,
                        y_max: y,
                    },
                    Some(e) => Extent {
                        x_min: e.x_min.min(x),
                        x_max: e.x_max.max(x),
                        y_min: e.y_min.min(y),
                        y_max: e.y_max.max(y),
                    },
                })
            })
    }

    /// Maps `(x, y)` into [-1, 1]. A zero-width axis maps to 0.0.
    pub fn map(&self, x: f32, y: f32) -> (f32, f32) {
        (
            map_axis(x, self.x_min, self.x_max),
            map_axis(y, self.y_min, self.y_max),
        )
    }
}

fn map_axis(v: f32, min: f32, max: f32) -> f32 {
    let span = max - min;
    if span > 0.0 {
        2.0 * (v - min) / span - 1.0
    } else {
        0.0
    }
}

/// Rescales x/y of every row into [-1, 1], leaving the value column as is.
///
/// The extrema have to be known before the first row can be mapped, so
/// `rows` is walked twice: once here to find them and once lazily by the
/// returned iterator.
pub fn normalize<I>(rows: I) -> impl Iterator<Item = Point>
where
    I: Iterator<Item = [f32; 3]> + Clone,
{
    let extent = Extent::scan(rows.clone());
    rows.filter_map(move |[x, y, v]| {
        let e = extent?;
        let (xn, yn) = e.map(x, y);
        Some(Point::new(xn, yn, v))
    })
}

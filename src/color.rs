use colorous::Gradient;

/// Texels in the colormap texture.
pub const COLORMAP_SIZE: usize = 256;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ColormapKind {
    /// Closed-form cosine approximation of viridis.
    #[default]
    Cosine,
    Viridis,
    Inferno,
    Turbo,
}

impl ColormapKind {
    pub const ALL: [ColormapKind; 4] = [
        ColormapKind::Cosine,
        ColormapKind::Viridis,
        ColormapKind::Inferno,
        ColormapKind::Turbo,
    ];

    pub fn label(self) -> &'static str {
        match self {
            ColormapKind::Cosine => "Cosine",
            ColormapKind::Viridis => "Viridis",
            ColormapKind::Inferno => "Inferno",
            ColormapKind::Turbo => "Turbo",
        }
    }

    fn gradient(self) -> Option<Gradient> {
        match self {
            ColormapKind::Cosine => None,
            ColormapKind::Viridis => Some(colorous::VIRIDIS),
            ColormapKind::Inferno => Some(colorous::INFERNO),
            ColormapKind::Turbo => Some(colorous::TURBO),
        }
    }
}

/// `n` RGBA texels, `t = i / (n - 1)`, each channel
/// `0.5 + 0.5 * cos(phase + 5t)` with phases 3.0, 1.5, 0.0.
pub fn cosine_colormap(n: usize) -> Vec<[f32; 4]> {
    (0..n)
        .map(|i| {
            let t = if n <= 1 { 0.0 } else { i as f32 / (n - 1) as f32 };
            [
                0.5 + 0.5 * (3.0 + t * 5.0).cos(),
                0.5 + 0.5 * (1.5 + t * 5.0).cos(),
                0.5 + 0.5 * (0.0 + t * 5.0).cos(),
                1.0,
            ]
        })
        .collect()
}

fn gradient_colormap(grad: &Gradient, n: usize) -> Vec<[f32; 4]> {
    (0..n)
        .map(|i| {
            let t = if n <= 1 { 0.0 } else { i as f64 / (n - 1) as f64 };
            let c = grad.eval_continuous(t);
            [c.r as f32 / 255.0, c.g as f32 / 255.0, c.b as f32 / 255.0, 1.0]
        })
        .collect()
}

pub fn colormap(kind: ColormapKind, n: usize) -> Vec<[f32; 4]> {
    match kind.gradient() {
        Some(grad) => gradient_colormap(&grad, n),
        None => cosine_colormap(n),
    }
}

/// Linear lookup into a texel table, `t` clamped to [0, 1]. Mirrors the
/// fragment shader so legends match the plot.
pub fn sample(table: &[[f32; 4]], t: f32) -> [f32; 4] {
    if table.is_empty() {
        return [0.0, 0.0, 0.0, 1.0];
    }
    let pos = t.clamp(0.0, 1.0) * (table.len() - 1) as f32;
    let i0 = pos.floor() as usize;
    let i1 = (i0 + 1).min(table.len() - 1);
    let f = pos - i0 as f32;
    let (a, b) = (table[i0], table[i1]);
    std::array::from_fn(|k| a[k] + (b[k] - a[k]) * f)
}

pub fn to_rgba8(c: [f32; 4]) -> [u8; 4] {
    c.map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_endpoints() {
        let cmap = cosine_colormap(COLORMAP_SIZE);
        assert_eq!(cmap.len(), 256);
        let first = cmap[0];
        assert!((first[0] - (0.5 + 0.5 * 3.0f32.cos())).abs() < 1e-6);
        assert!((first[1] - (0.5 + 0.5 * 1.5f32.cos())).abs() < 1e-6);
        assert!((first[2] - 1.0).abs() < 1e-6);
        let last = cmap[255];
        assert!((last[0] - (0.5 + 0.5 * 8.0f32.cos())).abs() < 1e-5);
        assert!((last[2] - (0.5 + 0.5 * 5.0f32.cos())).abs() < 1e-5);
        assert!(cmap.iter().all(|c| c[3] == 1.0));
        assert!(cmap.iter().flatten().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn every_kind_fills_the_table() {
        for kind in ColormapKind::ALL {
            let cmap = colormap(kind, COLORMAP_SIZE);
            assert_eq!(cmap.len(), COLORMAP_SIZE, "{}", kind.label());
        }
    }

    #[test]
    fn sample_interpolates_and_clamps() {
        let table = [[0.0, 0.0, 0.0, 1.0], [1.0, 0.5, 0.0, 1.0]];
        assert_eq!(sample(&table, 0.5), [0.5, 0.25, 0.0, 1.0]);
        assert_eq!(sample(&table, -3.0), table[0]);
        assert_eq!(sample(&table, 7.0), table[1]);
        assert_eq!(to_rgba8(sample(&table, 1.0)), [255, 128, 0, 255]);
    }
}

//! Synthetic layers for trying the viewer without recordings.

use crate::{
    error::LayerError,
    layer::{write_layer, RawSamples},
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::path::{Path, PathBuf};

const FULL_SCALE: f32 = 32767.0;

#[derive(Clone, Debug)]
pub struct MockOptions {
    pub layers: usize,
    /// Approximate points per layer; rounded down to a square raster.
    pub points: usize,
    pub seed: u64,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            layers: 5,
            points: 250_000,
            seed: rand::thread_rng().gen(),
        }
    }
}

/// One raster scan: `side x side` grid positions, four detector channels
/// showing a blob that drifts from layer to layer, plus noise. Channels 5
/// and 6 of the eight recorded ones carry the beam position, 7 and 8 the
/// layer and a frame counter.
fn mock_samples(rng: &mut StdRng, layer: usize, side: usize) -> RawSamples {
    const CHANNELS: usize = 8;
    let drift = layer as f32 * 0.05;
    let (cx, cy) = (0.4 + drift, 0.5 - drift * 0.5);
    let sigma2 = 0.02 + 0.005 * layer as f32;

    let mut data = Vec::with_capacity(side * side * CHANNELS);
    for row in 0..side {
        for col in 0..side {
            let u = col as f32 / side.max(2) as f32;
            let v = row as f32 / side.max(2) as f32;
            let r2 = (u - cx).powi(2) + (v - cy).powi(2);
            let blob = (-r2 / sigma2).exp();
            for k in 0..4 {
                let gain = 1.0 - 0.15 * k as f32;
                let noise: f32 = rng.gen_range(-0.03..0.03);
                let value = ((blob * gain + 0.05 + noise) * FULL_SCALE).clamp(0.0, FULL_SCALE);
                data.push(value.round());
            }
            data.push(col as f32);
            data.push(row as f32);
            data.push(layer as f32);
            data.push((row * side + col) as f32);
        }
    }
    RawSamples::new(CHANNELS, data).with_source(format!("mock layer {}", layer + 1))
}

/// Writes `opts.layers` synthetic layers into `out_dir`.
pub fn write_mock_layers(out_dir: &Path, opts: &MockOptions) -> Result<Vec<PathBuf>, LayerError> {
    let side = (opts.points as f64).sqrt().floor() as usize;
    let mut rng = StdRng::seed_from_u64(opts.seed);
    let mut written = Vec::with_capacity(opts.layers);
    for layer in 0..opts.layers {
        let raw = mock_samples(&mut rng, layer, side);
        written.push(write_layer(&raw, out_dir, layer + 1)?);
    }
    log::info!(
        "wrote {} mock layers of {} points to {} (seed {})",
        opts.layers,
        side * side,
        out_dir.display(),
        opts.seed
    );
    Ok(written)
}

use crate::{
    error::LayerError,
    layer::{list_layers, LayerFile},
};
use rayon::prelude::*;
use std::{collections::HashMap, path::Path};

/// Distinct value -> occurrence count, sorted by value ascending.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Histogram {
    bins: Vec<(f32, u64)>,
}

impl Histogram {
    pub fn bins(&self) -> &[(f32, u64)] {
        &self.bins
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub fn total(&self) -> u64 {
        self.bins.iter().map(|&(_, c)| c).sum()
    }

    pub fn max_count(&self) -> u64 {
        self.bins.iter().map(|&(_, c)| c).max().unwrap_or(0)
    }

    /// Smallest and largest finite key.
    pub fn value_range(&self) -> Option<(f32, f32)> {
        let mut finite = self.bins.iter().map(|&(v, _)| v).filter(|v| v.is_finite());
        let first = finite.next()?;
        let last = finite.last().unwrap_or(first);
        Some((first, last))
    }

    fn from_counts(counts: HashMap<u32, u64>) -> Self {
        let mut bins: Vec<(f32, u64)> = counts
            .into_iter()
            .map(|(bits, c)| (f32::from_bits(bits), c))
            .collect();
        bins.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self { bins }
    }

    /// Re-buckets into `n` equal-width bins over the finite value range.
    /// Each bin is keyed by its lower edge; non-finite keys are kept as is.
    pub fn rebin(&self, n: usize) -> Self {
        let Some((lo, hi)) = self.value_range() else {
            return self.clone();
        };
        if n == 0 {
            return self.clone();
        }
        let width = (hi - lo) / n as f32;
        let mut counts = vec![0u64; n];
        let mut rest = Vec::new();
        for &(v, c) in &self.bins {
            if !v.is_finite() {
                rest.push((v, c));
                continue;
            }
            let idx = if width > 0.0 {
                (((v - lo) / width) as usize).min(n - 1)
            } else {
                0
            };
            counts[idx] += c;
        }
        let mut bins: Vec<(f32, u64)> = counts
            .into_iter()
            .enumerate()
            .map(|(i, c)| (lo + width * i as f32, c))
            .collect();
        if width <= 0.0 {
            bins.truncate(1);
        }
        bins.extend(rest);
        bins.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self { bins }
    }
}

/// Grouping key for an exact f32 value. `-0.0` and `0.0` share a key, and
/// every NaN shares one.
fn value_key(v: f32) -> u32 {
    if v.is_nan() {
        f32::NAN.to_bits()
    } else if v == 0.0 {
        0.0f32.to_bits()
    } else {
        v.to_bits()
    }
}

fn count_layer(path: &Path, channel: &str) -> Result<HashMap<u32, u64>, LayerError> {
    let layer = LayerFile::open(path)?;
    let mut counts = HashMap::new();
    for &v in layer.column(channel)? {
        *counts.entry(value_key(v)).or_insert(0) += 1;
    }
    log::debug!("histogram: {} distinct values in {}", counts.len(), path.display());
    Ok(counts)
}

/// Counts every value of `channel` across all layers in `dir`.
///
/// Layers are memory mapped and counted one file per task, so only the
/// distinct-value maps stay resident. An empty or unreadable directory
/// gives an empty histogram. `bins` re-buckets the result, see
/// [`Histogram::rebin`].
pub fn histogram(dir: &Path, channel: &str, bins: Option<usize>) -> Result<Histogram, LayerError> {
    let layers = list_layers(dir);
    let counts = layers
        .par_iter()
        .map(|path| count_layer(path, channel))
        .try_reduce(HashMap::new, |mut acc, part| {
            for (k, c) in part {
                *acc.entry(k).or_insert(0) += c;
            }
            Ok(acc)
        })?;
    let hist = Histogram::from_counts(counts);
    log::info!(
        "histogram of {channel} over {} layers: {} values, {} points",
        layers.len(),
        hist.bins.len(),
        hist.total()
    );
    Ok(match bins {
        Some(n) => hist.rebin(n),
        None => hist,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{write_layer, RawSamples};

    fn layer_with_channel_1(dir: &Path, index: usize, values: &[f32]) {
        let data = values.iter().flat_map(|&v| [v, 0.0, 0.0, 0.0]).collect();
        write_layer(&RawSamples::new(4, data), dir, index).unwrap();
    }

    #[test]
    fn counts_sum_to_total_points() {
        let dir = tempfile::tempdir().unwrap();
        layer_with_channel_1(dir.path(), 1, &[3.0, 1.0, 3.0, 2.0]);
        layer_with_channel_1(dir.path(), 2, &[3.0, 5.0]);
        layer_with_channel_1(dir.path(), 10, &[1.0]);

        let hist = histogram(dir.path(), "channel_1", None).unwrap();
        assert_eq!(hist.bins(), &[(1.0, 2), (2.0, 1), (3.0, 3), (5.0, 1)]);
        assert_eq!(hist.total(), 7);
        assert_eq!(hist.value_range(), Some((1.0, 5.0)));
        assert_eq!(hist.max_count(), 3);
    }

    #[test]
    fn empty_or_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(histogram(dir.path(), "channel_1", None).unwrap().is_empty());
        assert!(histogram(&dir.path().join("missing"), "channel_1", Some(10)).unwrap().is_empty());
    }

    #[test]
    fn missing_channel_is_schema_error() {
        let dir = tempfile::tempdir().unwrap();
        layer_with_channel_1(dir.path(), 1, &[1.0]);
        let err = histogram(dir.path(), "energy", None).unwrap_err();
        assert!(matches!(err, LayerError::Schema { .. }));
    }

    #[test]
    fn signed_zero_and_nan_group_together() {
        let dir = tempfile::tempdir().unwrap();
        layer_with_channel_1(dir.path(), 1, &[0.0, -0.0, f32::NAN, f32::NAN, 1.0]);
        let hist = histogram(dir.path(), "channel_1", None).unwrap();
        assert_eq!(hist.bins().len(), 3);
        assert_eq!(hist.bins()[0], (0.0, 2));
        assert!(hist.bins()[2].0.is_nan());
        assert_eq!(hist.total(), 5);
    }

    #[test]
    fn rebin_conserves_counts() {
        let dir = tempfile::tempdir().unwrap();
        let values: Vec<f32> = (0..100).map(|i| i as f32).collect();
        layer_with_channel_1(dir.path(), 1, &values);
        let hist = histogram(dir.path(), "channel_1", Some(10)).unwrap();
        assert_eq!(hist.bins().len(), 10);
        assert_eq!(hist.total(), 100);
        assert!(hist.bins().iter().all(|&(_, c)| c == 10));
        assert_eq!(hist.bins()[0].0, 0.0);
    }

    #[test]
    fn rebin_of_single_value() {
        let dir = tempfile::tempdir().unwrap();
        layer_with_channel_1(dir.path(), 1, &[4.0, 4.0]);
        let hist = histogram(dir.path(), "channel_1", Some(8)).unwrap();
        assert_eq!(hist.bins(), &[(4.0, 2)]);
    }
}

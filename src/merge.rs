//! Union of coordinate-keyed point sets with summed values.

use crate::{error::MergeError, points::Point};
use std::cmp::Ordering;

fn coord_cmp(a: &Point, b: &Point) -> Ordering {
    a.x.total_cmp(&b.x).then_with(|| a.y.total_cmp(&b.y))
}

/// Merges `a` and `b`, summing the values of rows that share a coordinate.
/// Every input value is divided by `scale` before summing. Output is sorted
/// by `(x, y)` ascending with unique coordinates.
pub fn merge_summed(a: &[Point], b: &[Point], scale: f32) -> Result<Vec<Point>, MergeError> {
    merge_summed_all(&[a, b], scale)
}

/// Same as [`merge_summed`] over any number of sets, in one sort.
///
/// Each input value is divided by `scale` exactly once. Feeding a merged
/// result back in as an input divides its values again, so callers
/// combining many sets pass them all here instead of folding pairwise.
pub fn merge_summed_all(sets: &[&[Point]], scale: f32) -> Result<Vec<Point>, MergeError> {
    if !(scale.is_finite() && scale > 0.0) {
        return Err(MergeError::InvalidScale(scale));
    }

    let mut rows: Vec<Point> = Vec::with_capacity(sets.iter().map(|s| s.len()).sum());
    for set in sets {
        // `+ 0.0` folds -0.0 into 0.0 so both land in one group.
        rows.extend(set.iter().map(|p| Point::new(p.x + 0.0, p.y + 0.0, p.value / scale)));
    }
    // Stable, x major then y.
    rows.sort_by(coord_cmp);

    let mut out: Vec<Point> = Vec::new();
    let mut acc = 0.0f64;
    for (i, row) in rows.iter().enumerate() {
        let starts_group = i == 0 || coord_cmp(&rows[i - 1], row) != Ordering::Equal;
        if starts_group {
            if let Some(last) = out.last_mut() {
                last.value = acc as f32;
            }
            out.push(*row);
            acc = 0.0;
        }
        acc += row.value as f64;
    }
    if let Some(last) = out.last_mut() {
        last.value = acc as f32;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn is_sorted_unique(points: &[Point]) -> bool {
        points
            .windows(2)
            .all(|w| coord_cmp(&w[0], &w[1]) == Ordering::Less)
    }

    #[test]
    fn empty_inputs_give_empty_output() {
        assert!(merge_summed(&[], &[], 2.0).unwrap().is_empty());
    }

    #[test]
    fn single_input_is_scaled_and_sorted() {
        let a = [Point::new(2.0, 0.0, 4.0), Point::new(1.0, 5.0, 8.0), Point::new(1.0, 3.0, 2.0)];
        let out = merge_summed(&a, &[], 2.0).unwrap();
        assert_eq!(
            out,
            vec![Point::new(1.0, 3.0, 1.0), Point::new(1.0, 5.0, 4.0), Point::new(2.0, 0.0, 2.0)]
        );
    }

    #[test]
    fn duplicates_are_summed_once() {
        let a = [Point::new(1.0, 1.0, 3.0), Point::new(0.0, 0.0, 1.0), Point::new(1.0, 1.0, 5.0)];
        let b = [Point::new(1.0, 1.0, 2.0), Point::new(0.0, 1.0, 7.0)];
        let out = merge_summed(&a, &b, 4.0).unwrap();
        assert_eq!(
            out,
            vec![Point::new(0.0, 0.0, 0.25), Point::new(0.0, 1.0, 1.75), Point::new(1.0, 1.0, 2.5)]
        );
    }

    #[test]
    fn disjoint_sets_keep_every_coordinate() {
        let mut rng = StdRng::seed_from_u64(7);
        let a: Vec<Point> = (0..200)
            .map(|i| Point::new(i as f32, rng.gen_range(0.0..10.0), rng.gen_range(0.0..100.0)))
            .collect();
        let b: Vec<Point> = (0..150)
            .map(|i| Point::new(-1.0 - i as f32, rng.gen_range(0.0..10.0), rng.gen_range(0.0..100.0)))
            .collect();
        let scale = 3.0;
        let out = merge_summed(&a, &b, scale).unwrap();
        assert_eq!(out.len(), a.len() + b.len());
        assert!(is_sorted_unique(&out));

        let input: f64 = a.iter().chain(&b).map(|p| p.value as f64).sum();
        let output: f64 = out.iter().map(|p| p.value as f64).sum();
        assert!((output - input / scale as f64).abs() < 1e-2);
    }

    #[test]
    fn random_grid_collapses_to_unique_sorted_cells() {
        let mut rng = StdRng::seed_from_u64(42);
        let gen = |rng: &mut StdRng| -> Vec<Point> {
            (0..500)
                .map(|_| {
                    Point::new(
                        rng.gen_range(0..8) as f32,
                        rng.gen_range(0..8) as f32,
                        rng.gen_range(1..10) as f32,
                    )
                })
                .collect()
        };
        let a = gen(&mut rng);
        let b = gen(&mut rng);
        let out = merge_summed(&a, &b, 1.0).unwrap();
        assert!(is_sorted_unique(&out));
        assert!(out.len() <= 64);
        for p in &out {
            let expected: f32 = a
                .iter()
                .chain(&b)
                .filter(|q| q.x == p.x && q.y == p.y)
                .map(|q| q.value)
                .sum();
            assert_eq!(p.value, expected);
        }
    }

    #[test]
    fn many_sets_divide_once() {
        let layer = [Point::new(0.0, 0.0, 6.0)];
        let out = merge_summed_all(&[&layer, &layer, &layer], 3.0).unwrap();
        assert_eq!(out, vec![Point::new(0.0, 0.0, 6.0)]);
    }

    #[test]
    fn signed_zero_coordinates_share_a_row() {
        let out = merge_summed(&[Point::new(0.0, 0.0, 1.0)], &[Point::new(-0.0, 0.0, 2.0)], 1.0).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, 3.0);
        assert!(out[0].x.is_sign_positive());

        let a = [Point::new(1.0, -0.0, 4.0), Point::new(-0.0, -0.0, 1.0)];
        let b = [Point::new(1.0, 0.0, 2.0)];
        let out = merge_summed(&a, &b, 2.0).unwrap();
        assert_eq!(out, vec![Point::new(0.0, 0.0, 0.5), Point::new(1.0, 0.0, 3.0)]);
        assert!(is_sorted_unique(&out));
    }

    #[test]
    fn rejects_bad_scale() {
        let a = [Point::new(0.0, 0.0, 1.0)];
        assert_eq!(merge_summed(&a, &a, 0.0), Err(MergeError::InvalidScale(0.0)));
        assert!(merge_summed(&a, &a, -1.0).is_err());
        assert!(merge_summed(&a, &a, f32::NAN).is_err());
    }
}

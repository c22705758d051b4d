//! Train/test split over duplicate measurements.
//!
//! Rows arrive as duplicate pairs (every `(run, conc)` cell measured twice,
//! adjacent in the table). Taking positions 1, 3, 5, … (1-indexed) for training
//! and 2, 4, 6, … for testing puts one physical replicate of each cell on each
//! side. An odd trailing row has no partner and stays in `train`.

use crate::domain::{Dataset, Observation, Split};

/// Partition `dataset` into alternating train/test subsets.
///
/// Pure function of row order: the same input always yields the same split.
pub fn split(dataset: &Dataset) -> Split {
    let half = dataset.len().div_ceil(2);
    let mut train: Vec<Observation> = Vec::with_capacity(half);
    let mut test: Vec<Observation> = Vec::with_capacity(half);

    for pair in dataset.rows().chunks(2) {
        let mut rows = pair.iter();
        if let Some(first) = rows.next() {
            train.push(first.clone());
        }
        if let Some(second) = rows.next() {
            test.push(second.clone());
        }
    }

    Split {
        train: Dataset::new(train),
        test: Dataset::new(test),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(n: usize) -> Dataset {
        (0..n)
            .map(|i| Observation::new(format!("{}", i / 4), (i / 2) as f64, i as f64 * 0.1))
            .collect()
    }

    fn sorted_keys(rows: &[Observation]) -> Vec<(String, u64, u64)> {
        let mut keys: Vec<_> = rows
            .iter()
            .map(|o| (o.run.clone(), o.conc.to_bits(), o.density.to_bits()))
            .collect();
        keys.sort();
        keys
    }

    #[test]
    fn split_is_complete_and_balanced() {
        for n in 1..=17 {
            let data = table(n);
            let s = split(&data);
            let diff = s.train.len() - s.test.len();
            assert!(diff == 0 || diff == 1, "n={n}");
            assert_eq!(diff, n % 2);

            let mut joined: Vec<Observation> = s.train.rows().to_vec();
            joined.extend_from_slice(s.test.rows());
            assert_eq!(sorted_keys(&joined), sorted_keys(data.rows()), "n={n}");
        }
    }

    #[test]
    fn split_is_deterministic() {
        let data = table(11);
        assert_eq!(split(&data), split(&data));
    }

    #[test]
    fn duplicates_land_on_opposite_sides() {
        let data = table(8);
        let s = split(&data);
        for (a, b) in s.train.iter().zip(s.test.iter()) {
            assert_eq!(a.run, b.run);
            assert_eq!(a.conc, b.conc);
        }
        // 1-indexed odd positions go to train.
        assert_eq!(s.train.rows()[0], data.rows()[0]);
        assert_eq!(s.test.rows()[0], data.rows()[1]);
    }

    #[test]
    fn odd_remainder_goes_to_train() {
        let data = table(5);
        let s = split(&data);
        assert_eq!(s.train.rows().last(), data.rows().last());
    }

    #[test]
    fn empty_dataset_yields_empty_subsets() {
        let s = split(&Dataset::default());
        assert!(s.train.is_empty());
        assert!(s.test.is_empty());
    }
}

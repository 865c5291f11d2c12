//! Cartesian expansion of a set of sweeps.
use super::ValueSequence;
use crate::error::SweepError;
use serde::Serialize;

/// Upper bound on the size of one combination space.
pub const MAX_COMBINATIONS: usize = 1_000_000;

/// Sweeps keyed by the location they rewrite, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct SweepSet {
    entries: Vec<(String, ValueSequence)>,
}

impl SweepSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sweep; two sweeps may never target the same key.
    pub fn insert(&mut self, key: impl Into<String>, values: ValueSequence) -> Result<(), SweepError> {
        let key = key.into();
        if self.contains(&key) {
            return Err(SweepError::malformed(format!(
                "{key} is swept more than once"
            )));
        }
        self.entries.push((key, values));
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(existing, _)| existing == key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    pub fn values(&self, key: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, values)| values.as_slice())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of combinations before deduplication, or an error past the cap.
    pub fn space_size(&self) -> Result<usize, SweepError> {
        let mut total: usize = 1;
        for (_, values) in &self.entries {
            total = total
                .checked_mul(values.len())
                .filter(|size| *size <= MAX_COMBINATIONS)
                .ok_or(SweepError::TooManyCombinations {
                    limit: MAX_COMBINATIONS,
                })?;
        }
        Ok(total)
    }
}

/// One key's chosen value within a combination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Choice {
    pub key: String,
    pub index: usize,
    pub value: String,
}

/// One simultaneous choice of value for every sweep in a set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Combination {
    choices: Vec<Choice>,
}

impl Combination {
    pub fn choices(&self) -> &[Choice] {
        &self.choices
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.choices
            .iter()
            .find(|choice| choice.key == key)
            .map(|choice| choice.value.as_str())
    }

    /// Chosen values, in declaration order.
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.choices.iter().map(|choice| choice.value.as_str())
    }

    /// Indices of the chosen values, in declaration order.
    pub fn coordinates(&self) -> Vec<usize> {
        self.choices.iter().map(|choice| choice.index).collect()
    }

    /// Stable file-name fragment for these coordinates (`base` when unswept).
    pub fn coordinate_label(&self) -> String {
        if self.choices.is_empty() {
            return "base".to_string();
        }
        self.coordinates()
            .iter()
            .map(usize::to_string)
            .collect::<Vec<_>>()
            .join("_")
    }
}

/// Enumerate every combination in odometer order: the last key varies
/// fastest. No deduplication.
pub fn combine_all(set: &SweepSet) -> Result<Vec<Combination>, SweepError> {
    let total = set.space_size()?;
    if total == 0 {
        return Ok(Vec::new());
    }
    let sizes: Vec<usize> = set.entries.iter().map(|(_, values)| values.len()).collect();
    let mut positions = vec![0usize; sizes.len()];
    let mut combinations = Vec::with_capacity(total);

    loop {
        combinations.push(materialize(set, &positions));

        let mut digit = positions.len();
        loop {
            if digit == 0 {
                return Ok(combinations);
            }
            digit -= 1;
            positions[digit] += 1;
            if positions[digit] < sizes[digit] {
                break;
            }
            positions[digit] = 0;
        }
    }
}

/// Enumerate combinations, stable-sort them by their chosen values and drop
/// adjacent repeats of the same key/value mapping.
///
/// The result depends only on the sweep set, so ordinals and the legend are
/// reproducible. Each survivor keeps the coordinates of its first occurrence
/// in odometer order.
pub fn combine(set: &SweepSet) -> Result<Vec<Combination>, SweepError> {
    let mut all = combine_all(set)?;
    let before = all.len();
    all.sort_by(|left, right| left.values().cmp(right.values()));
    all.dedup_by(|later, earlier| later.values().eq(earlier.values()));
    if all.len() != before {
        tracing::warn!(
            removed = before - all.len(),
            "dropped duplicate combinations"
        );
    }
    Ok(all)
}

fn materialize(set: &SweepSet, positions: &[usize]) -> Combination {
    let choices = set
        .entries
        .iter()
        .zip(positions)
        .map(|((key, values), index)| Choice {
            key: key.clone(),
            index: *index,
            value: values[*index].clone(),
        })
        .collect();
    Combination { choices }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn two_by_three_space_has_six_combinations_in_odometer_order() {
        let mut set = SweepSet::new();
        set.insert("a", strings(&["a0", "a1"])).expect("insert a");
        set.insert("b", strings(&["b0", "b1", "b2"])).expect("insert b");

        let all = combine_all(&set).expect("combine");
        assert_eq!(all.len(), 6);
        let labels: Vec<String> = all.iter().map(Combination::coordinate_label).collect();
        assert_eq!(labels, ["0_0", "0_1", "0_2", "1_0", "1_1", "1_2"]);
        assert_eq!(all[4].get("a"), Some("a1"));
        assert_eq!(all[4].get("b"), Some("b1"));
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let mut set = SweepSet::new();
        set.insert("geo:3", strings(&["x"])).expect("first insert");
        let err = set.insert("geo:3", strings(&["y"])).expect_err("duplicate key");
        assert!(matches!(err, SweepError::MalformedSpec(_)));
    }

    #[test]
    fn empty_set_yields_single_base_combination() {
        let all = combine(&SweepSet::new()).expect("combine");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].coordinate_label(), "base");
    }

    #[test]
    fn any_empty_sweep_empties_the_space() {
        let mut set = SweepSet::new();
        set.insert("a", strings(&["1", "2"])).expect("insert a");
        set.insert("b", Vec::new()).expect("insert b");
        assert!(combine(&set).expect("combine").is_empty());
    }

    #[test]
    fn repeated_literals_collapse_to_first_occurrence() {
        let mut set = SweepSet::new();
        set.insert("a", strings(&["x", "y", "x"])).expect("insert a");
        let unique = combine(&set).expect("combine");
        let values: Vec<&str> = unique.iter().filter_map(|c| c.get("a")).collect();
        assert_eq!(values, ["x", "y"]);
        assert_eq!(unique[1].coordinates(), vec![1]);
    }

    #[test]
    fn unique_combinations_come_out_sorted() {
        let mut set = SweepSet::new();
        set.insert("a", strings(&["b", "a", "b"])).expect("insert a");
        let unique = combine(&set).expect("combine");
        let values: Vec<&str> = unique.iter().filter_map(|c| c.get("a")).collect();
        assert_eq!(values, ["a", "b"]);
        assert_eq!(unique[1].coordinates(), vec![0]);
    }

    #[test]
    fn oversized_space_is_an_error() {
        let mut set = SweepSet::new();
        let big: Vec<String> = (0..1001).map(|i| i.to_string()).collect();
        set.insert("a", big.clone()).expect("insert a");
        set.insert("b", big).expect("insert b");
        let err = combine_all(&set).expect_err("too large");
        assert!(matches!(err, SweepError::TooManyCombinations { .. }));
    }

    proptest! {
        #[test]
        fn space_size_is_product_of_sweep_sizes(sizes in prop::collection::vec(1usize..5, 0..5)) {
            let mut set = SweepSet::new();
            for (position, size) in sizes.iter().enumerate() {
                let values = (0..*size).map(|i| format!("k{position}v{i}")).collect();
                set.insert(format!("k{position}"), values).expect("insert");
            }
            let all = combine_all(&set).expect("combine");
            prop_assert_eq!(all.len(), sizes.iter().product::<usize>());
            let distinct: HashSet<&Combination> = all.iter().collect();
            prop_assert_eq!(distinct.len(), all.len());
            for combination in &all {
                prop_assert_eq!(combination.choices().len(), sizes.len());
            }
        }

        #[test]
        fn combine_is_sorted_and_free_of_repeats(
            sweeps in prop::collection::vec(prop::collection::vec("[a-c]", 1..4), 0..4)
        ) {
            let mut set = SweepSet::new();
            for (position, values) in sweeps.iter().enumerate() {
                set.insert(format!("k{position}"), values.clone()).expect("insert");
            }
            let unique = combine(&set).expect("combine");
            let rows: Vec<Vec<&str>> = unique.iter().map(|c| c.values().collect()).collect();
            prop_assert!(rows.windows(2).all(|pair| pair[0] < pair[1]));

            let distinct: HashSet<Vec<String>> = combine_all(&set)
                .expect("combine_all")
                .iter()
                .map(|c| c.values().map(str::to_string).collect())
                .collect();
            prop_assert_eq!(rows.len(), distinct.len());
        }
    }
}

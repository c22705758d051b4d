//! Stable mapping from categorical group labels to dense indices.
//!
//! Built once per fit call. Indices follow first appearance in the data, so
//! the same table always produces the same numbering regardless of how the
//! labels would sort (`"10"` before `"2"` lexically, etc.).

use std::collections::HashMap;

use crate::domain::Observation;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupIndex {
    labels: Vec<String>,
    lookup: HashMap<String, usize>,
}

impl GroupIndex {
    /// Index the distinct labels produced by `group_of` over `rows`.
    pub fn build<F>(rows: &[Observation], group_of: F) -> Self
    where
        F: Fn(&Observation) -> &str,
    {
        let mut index = GroupIndex::default();
        for obs in rows {
            let label = group_of(obs);
            if !index.lookup.contains_key(label) {
                index.lookup.insert(label.to_string(), index.labels.len());
                index.labels.push(label.to_string());
            }
        }
        index
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.lookup.get(label).copied()
    }

    pub fn label(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Row indices of `rows` per group, in group-index order.
    pub fn partition<F>(&self, rows: &[Observation], group_of: F) -> Vec<Vec<usize>>
    where
        F: Fn(&Observation) -> &str,
    {
        let mut members = vec![Vec::new(); self.labels.len()];
        for (i, obs) in rows.iter().enumerate() {
            if let Some(g) = self.index_of(group_of(obs)) {
                members[g].push(i);
            }
        }
        members
    }
}

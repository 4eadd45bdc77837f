// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::column::Column;
use crate::dataset::{DataProvider, ExampleId};
use crate::error::{ColonnadeError, TrainResult};
use std::collections::HashMap;

/// Per-column view over an assignment: bucket sizes and member id lists.
///
/// Stats are rebuilt together with the map that produced them and never live
/// on their own; member lists keep provider order so routing is reproducible.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnStats {
    counts: Vec<usize>,
    members: Vec<Vec<ExampleId>>,
}

impl ColumnStats {
    fn new(columns: usize) -> Self {
        Self {
            counts: vec![0; columns],
            members: vec![Vec::new(); columns],
        }
    }

    /// Bucket sizes, indexed by column.
    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    /// Ids routed to the given column, in the order they were evaluated.
    pub fn members(&self, column: usize) -> &[ExampleId] {
        &self.members[column]
    }

    /// Largest bucket size.
    pub fn max_count(&self) -> usize {
        self.counts.iter().copied().max().unwrap_or(0)
    }

    /// Returns `true` when at least one column received no examples.
    pub fn has_starved_column(&self) -> bool {
        self.counts.iter().any(|&count| count == 0)
    }

    /// Total number of routed examples.
    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }
}

/// Total mapping from example id to column index for one routing round.
///
/// Rebuilt wholesale by [`assign`]; the previous round's map is kept only for
/// the stationarity comparison.
#[derive(Clone, Debug)]
pub struct AssignmentMap {
    assignments: HashMap<ExampleId, usize>,
    stats: ColumnStats,
}

impl AssignmentMap {
    /// Column the given example was routed to, if it was seen this round.
    pub fn column_of(&self, id: ExampleId) -> Option<usize> {
        self.assignments.get(&id).copied()
    }

    /// Number of routed examples.
    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    /// Returns `true` when the map holds no assignments.
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Number of columns the map was built over.
    pub fn columns(&self) -> usize {
        self.stats.counts.len()
    }

    /// Derived per-column statistics for this round.
    pub fn stats(&self) -> &ColumnStats {
        &self.stats
    }

    /// Iterates over `(id, column)` pairs in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (ExampleId, usize)> + '_ {
        self.assignments.iter().map(|(&id, &col)| (id, col))
    }

    /// Fraction of examples whose assignment matches the other map.
    pub fn agreement(&self, other: &AssignmentMap) -> f32 {
        if self.assignments.is_empty() {
            return 1.0;
        }
        let matches = self
            .assignments
            .iter()
            .filter(|(&id, &col)| other.column_of(id) == Some(col))
            .count();
        matches as f32 / self.assignments.len() as f32
    }

    #[cfg(test)]
    pub(crate) fn from_pairs(columns: usize, pairs: &[(ExampleId, usize)]) -> Self {
        let mut stats = ColumnStats::new(columns);
        let mut assignments = HashMap::new();
        for &(id, col) in pairs {
            assignments.insert(id, col);
            stats.counts[col] += 1;
            stats.members[col].push(id);
        }
        Self { assignments, stats }
    }
}

/// Evaluates every example against every column and routes each example to
/// the arg-min reconstruction-loss column, ties broken by the lowest index.
///
/// This is a pure evaluation pass: no column parameters change. An untrained
/// pool collapsing most examples onto one column is expected here and is
/// handled by the balanced trainer's starvation fallback, not by this pass.
pub fn assign<C, P>(columns: &[C], provider: &P) -> TrainResult<AssignmentMap>
where
    C: Column,
    P: DataProvider + ?Sized,
{
    if provider.is_empty() {
        return Err(ColonnadeError::EmptyDataset);
    }
    let mut stats = ColumnStats::new(columns.len());
    let mut assignments = HashMap::with_capacity(provider.len());
    for mb in provider.minibatches() {
        let mut losses = Vec::with_capacity(columns.len());
        for column in columns {
            losses.push(column.per_example_loss(&mb.features)?);
        }
        for (slot, &id) in mb.ids.iter().enumerate() {
            let mut best = 0usize;
            for (index, loss) in losses.iter().enumerate().skip(1) {
                if loss[slot] < losses[best][slot] {
                    best = index;
                }
            }
            assignments.insert(id, best);
            stats.counts[best] += 1;
            stats.members[best].push(id);
        }
    }
    Ok(AssignmentMap { assignments, stats })
}

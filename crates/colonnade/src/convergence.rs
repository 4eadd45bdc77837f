// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::assignment::AssignmentMap;

/// Decides whether the routing has stopped moving between two rounds.
///
/// A threshold too loose to ever require a single agreeing example
/// (`threshold * |current| < 1`) is declared stationary immediately. A
/// missing map on either side (the first round) is never stationary.
/// Otherwise the unchanged fraction must strictly exceed the threshold.
pub fn stationary(
    current: Option<&AssignmentMap>,
    previous: Option<&AssignmentMap>,
    threshold: f32,
) -> bool {
    let Some(current) = current else {
        return false;
    };
    if threshold * (current.len() as f32) < 1.0 {
        return true;
    }
    let Some(previous) = previous else {
        return false;
    };
    current.agreement(previous) > threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(u64, usize)]) -> AssignmentMap {
        AssignmentMap::from_pairs(2, pairs)
    }

    #[test]
    fn loose_threshold_is_stationary_regardless_of_history() {
        let current = map(&[(0, 0), (1, 1), (2, 0)]);
        // 0.2 * 3 < 1, so no agreement is ever required.
        assert!(stationary(Some(&current), None, 0.2));
        let unrelated = map(&[(0, 1), (1, 0), (2, 1)]);
        assert!(stationary(Some(&current), Some(&unrelated), 0.2));
        assert!(stationary(Some(&current), Some(&current), 0.0));
    }

    #[test]
    fn missing_maps_are_never_stationary() {
        let current = map(&[(0, 0), (1, 1), (2, 0)]);
        assert!(!stationary(None, Some(&current), 0.5));
        assert!(!stationary(None, None, 0.5));
        // First round: tight threshold and no previous map.
        assert!(!stationary(Some(&current), None, 0.5));
    }

    #[test]
    fn identical_maps_are_stationary_below_full_agreement() {
        let current = map(&[(0, 0), (1, 1), (2, 0), (3, 1)]);
        assert!(stationary(Some(&current), Some(&current), 0.5));
        assert!(stationary(Some(&current), Some(&current), 0.99));
    }

    #[test]
    fn agreement_must_strictly_exceed_the_threshold() {
        let a = map(&[(0, 0), (1, 1), (2, 0), (3, 1)]);
        let b = map(&[(0, 0), (1, 1), (2, 0), (3, 0)]);
        // 3 of 4 unchanged: 0.75 is not > 0.75, but is > 0.7.
        assert!(!stationary(Some(&a), Some(&b), 0.75));
        assert!(stationary(Some(&a), Some(&b), 0.7));
    }
}

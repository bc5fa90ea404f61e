//! Fold verifier and staleness check tests.
//!
//! ## Coverage
//! - Reference cases: gap, duplicate, complete
//! - Boundaries: empty key space, trailing gap, out-of-range keys
//! - Shuffled-then-sorted inputs as produced by real folds
//! - Baseline comparison in both directions

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::record::Record;
    use crate::verify::*;
    use rand::seq::SliceRandom;

    // ================================================================
    // verify_fold_keys
    // ================================================================

    #[test]
    fn verify__gap_reports_first_missing_key() {
        assert_eq!(verify_fold_keys(&[1, 2, 3, 5], 5), FoldCheck::Missing(4));
    }

    #[test]
    fn verify__duplicate_reports_first_repeated_key() {
        assert_eq!(verify_fold_keys(&[1, 2, 2, 3], 4), FoldCheck::Duplicate(2));
    }

    #[test]
    fn verify__contiguous_range_is_complete() {
        assert_eq!(verify_fold_keys(&[1, 2, 3, 4], 4), FoldCheck::Complete);
        assert!(verify_fold_keys(&[1, 2, 3, 4], 4).is_complete());
    }

    #[test]
    fn verify__empty_key_space() {
        assert_eq!(verify_fold_keys(&[], 0), FoldCheck::Complete);
        assert_eq!(verify_fold_keys(&[], 3), FoldCheck::Missing(1));
    }

    #[test]
    fn verify__missing_tail_is_reported() {
        assert_eq!(verify_fold_keys(&[1, 2], 4), FoldCheck::Missing(3));
    }

    #[test]
    fn verify__missing_head_is_reported() {
        assert_eq!(verify_fold_keys(&[2, 3, 4], 4), FoldCheck::Missing(1));
    }

    #[test]
    fn verify__only_first_divergence_is_reported() {
        // Gap at 2 precedes the duplicate at 5 and the gap at 7.
        assert_eq!(
            verify_fold_keys(&[1, 3, 4, 5, 5, 6, 8], 8),
            FoldCheck::Missing(2)
        );
        // Duplicate at 1 precedes the gap at 3.
        assert_eq!(verify_fold_keys(&[1, 1, 2, 4], 4), FoldCheck::Duplicate(1));
    }

    #[test]
    fn verify__out_of_range_keys_are_unexpected() {
        assert_eq!(verify_fold_keys(&[0, 1, 2], 2), FoldCheck::Unexpected(0));
        assert_eq!(verify_fold_keys(&[1, 2, 3], 2), FoldCheck::Unexpected(3));
    }

    /// # Scenario
    /// Key 4 is skipped and the next key, 6, is past `expected_max`.
    ///
    /// # Expected behavior
    /// The gap comes first in the walk, so it is the one reported.
    #[test]
    fn verify__gap_before_out_of_range_key_reports_missing() {
        assert_eq!(verify_fold_keys(&[1, 2, 3, 6], 5), FoldCheck::Missing(4));
        // Once every expected key is seen, an extra key is unexpected.
        assert_eq!(verify_fold_keys(&[1, 2, 3, 6], 3), FoldCheck::Unexpected(6));
        assert_eq!(verify_fold_keys(&[1, 2, 3, 4, 5, 9], 5), FoldCheck::Unexpected(9));
    }

    #[test]
    fn verify__unsorted_input_is_not_silently_accepted() {
        assert_ne!(verify_fold_keys(&[2, 1], 2), FoldCheck::Complete);
    }

    #[test]
    fn verify__top_of_key_space_does_not_overflow() {
        assert_eq!(
            verify_fold_keys(&[1, 2, u32::MAX], u32::MAX),
            FoldCheck::Missing(3)
        );
    }

    #[test]
    fn verify__shuffled_fold_output_after_sort() {
        let mut rng = rand::rng();
        let mut keys: Vec<u32> = (1..=2_000).collect();
        keys.shuffle(&mut rng);
        keys.sort_unstable();
        assert_eq!(verify_fold_keys(&keys, 2_000), FoldCheck::Complete);

        // Drop one random key and duplicate another.
        let mut keys: Vec<u32> = (1..=2_000).filter(|k| *k != 1_234).collect();
        keys.push(77);
        keys.shuffle(&mut rng);
        keys.sort_unstable();
        assert_eq!(verify_fold_keys(&keys, 2_000), FoldCheck::Duplicate(77));
    }

    #[test]
    fn verify__display_names_the_key() {
        assert_eq!(FoldCheck::Missing(4).to_string(), "missing key 4");
        assert_eq!(FoldCheck::Duplicate(2).to_string(), "duplicate key 2");
    }

    // ================================================================
    // check_sequence
    // ================================================================

    #[test]
    fn check__older_than_baseline_is_stale() {
        let err = check_sequence(5, &Record::new(42, 4)).unwrap_err();
        assert_eq!(
            err,
            StaleRead {
                key: 42,
                observed: 4,
                expected: 5
            }
        );
    }

    #[test]
    fn check__at_or_above_baseline_passes() {
        assert!(check_sequence(5, &Record::new(42, 5)).is_ok());
        assert!(check_sequence(5, &Record::new(42, 6)).is_ok());
        assert!(check_sequence(0, &Record::new(1, 0)).is_ok());
    }
}

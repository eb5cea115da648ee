//! Match an observed barcode against the reference barcodes of one index type.
//!
//! Exact matches are looked up directly. Otherwise every reference of the same length is compared
//! by hamming distance and the closest one within the allowed number of mismatches is kept, ties
//! going to the lexicographically smallest reference.

use ahash::AHashSet;

use crate::registry::{IndexType, PerIndex};

/// The base used for an uncalled position.
pub const NO_CALL: u8 = b'N';

#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub enum MatchResult<'a> {
    /// The observed barcode resolves to `barcode` with `hamming_dist` mismatches.
    Match { barcode: &'a [u8], hamming_dist: usize },
    NoMatch,
}

impl<'a> MatchResult<'a> {
    /// The resolved barcode, if any.
    pub fn barcode(&self) -> Option<&'a [u8]> {
        match self {
            MatchResult::Match { barcode, .. } => Some(*barcode),
            MatchResult::NoMatch => None,
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match { .. })
    }

}

/// Matches observed barcodes with up to a per index type number of mismatches.
#[derive(Debug, Clone, Default)]
pub struct FuzzyMatcher {
    max_mistakes: PerIndex<usize>,
    accept_all: PerIndex<bool>,
}

impl FuzzyMatcher {
    /// `accept_all` index types match any observed barcode that has no [`NO_CALL`].
    pub fn new(max_mistakes: PerIndex<usize>, accept_all: PerIndex<bool>) -> Self {
        Self { max_mistakes, accept_all }
    }

    pub fn is_accept_all(&self, index_type: IndexType) -> bool {
        self.accept_all[index_type]
    }

    /// Find the reference in `bucket` that `observed` resolves to.
    pub fn find<'a>(
        &self,
        observed: &'a [u8],
        index_type: IndexType,
        bucket: &'a AHashSet<Vec<u8>>,
    ) -> MatchResult<'a> {
        if self.accept_all[index_type] {
            return if observed.contains(&NO_CALL) {
                MatchResult::NoMatch
            } else {
                MatchResult::Match { barcode: observed, hamming_dist: 0 }
            };
        }
        if let Some(reference) = bucket.get(observed) {
            return MatchResult::Match { barcode: reference.as_slice(), hamming_dist: 0 };
        }
        self.find_nearest(observed, index_type, bucket)
    }

    /// Bounded hamming distance search over every reference in `bucket` of the same length as
    /// `observed`.
    pub fn find_nearest<'a>(
        &self,
        observed: &[u8],
        index_type: IndexType,
        bucket: &'a AHashSet<Vec<u8>>,
    ) -> MatchResult<'a> {
        let max_mistakes = self.max_mistakes[index_type];
        let mut best: Option<(usize, &'a [u8])> = None;
        for reference in bucket.iter().filter(|r| r.len() == observed.len()) {
            let dist = hamming_distance(observed, reference);
            if dist > max_mistakes {
                continue;
            }
            let candidate = (dist, reference.as_slice());
            if best.map_or(true, |current| candidate < current) {
                best = Some(candidate);
            }
        }
        match best {
            Some((hamming_dist, barcode)) => MatchResult::Match { barcode, hamming_dist },
            None => MatchResult::NoMatch,
        }
    }
}

/// Hamming distance on slice of bytes.
///
/// Skips length check and will stop comparing after alpha is exhausted. A [`NO_CALL`] only
/// matches another [`NO_CALL`].
pub fn hamming_distance(alpha: &[u8], beta: &[u8]) -> usize {
    alpha.iter().zip(beta.iter()).filter(|(a, b)| a != b).count()
}

#[cfg(test)]
mod test {
    use ahash::AHashSet;
    use rstest::rstest;

    use super::*;

    fn bucket(barcodes: &[&str]) -> AHashSet<Vec<u8>> {
        barcodes.iter().map(|b| b.as_bytes().to_vec()).collect()
    }

    fn matcher(max_mistakes: usize) -> FuzzyMatcher {
        FuzzyMatcher::new(PerIndex::from_fn(|_| max_mistakes), PerIndex::default())
    }

    #[test]
    fn test_hamming_dist_no_mismatches() {
        assert_eq!(hamming_distance(b"GATTACA", b"GATTACA"), 0);
    }

    #[test]
    fn test_hamming_dist_two_mismatches() {
        assert_eq!(hamming_distance(b"GATTACA", b"GACCACA"), 2);
    }

    #[test]
    fn test_hamming_dist_all_mismatches() {
        assert_eq!(hamming_distance(b"GATTACA", b"CTAATGT"), 7);
    }

    #[test]
    fn test_hamming_dist_no_calls() {
        assert_eq!(hamming_distance(b"GANTACA", b"GATTACA"), 1);
        assert_eq!(hamming_distance(b"GANTACA", b"GANTACA"), 0);
    }

    #[rstest]
    fn test_exact_match_accepted_for_any_threshold(#[values(0, 1, 2, 5)] max_mistakes: usize) {
        let references = bucket(&["AAAA", "CCCC"]);
        let result = matcher(max_mistakes).find(b"CCCC", IndexType::P7, &references);
        assert_eq!(result, MatchResult::Match { barcode: b"CCCC", hamming_dist: 0 });
    }

    #[rstest]
    #[case(b"AAAT", Some("AAAA"))]
    #[case(b"AATT", None)]
    #[case(b"AAAAA", None)]
    fn test_one_mismatch_allowed(#[case] observed: &[u8], #[case] expected: Option<&str>) {
        let references = bucket(&["AAAA"]);
        let result = matcher(1).find(observed, IndexType::P7, &references);
        assert_eq!(result.barcode(), expected.map(str::as_bytes));
    }

    #[test]
    fn test_nothing_farther_than_threshold_is_returned() {
        let references = bucket(&["AAAAAAAA", "CCCCCCCC", "GGGGGGGG"]);
        let result = matcher(2).find(b"AAAATTTT", IndexType::I7, &references);
        assert!(!result.is_match());
    }

    #[test]
    fn test_closest_reference_wins() {
        let references = bucket(&["AAAAAAAA", "AAAAAATT"]);
        let result = matcher(2).find(b"AAAAAAAT", IndexType::I5, &references);
        assert_eq!(result.barcode(), Some(b"AAAAAAAA".as_slice()));
        // Both at distance 1: lexicographically smallest wins
        let references = bucket(&["AAAAAAAT", "AAAAAAGA"]);
        let result = matcher(2).find(b"AAAAAAAA", IndexType::I5, &references);
        assert_eq!(result, MatchResult::Match { barcode: b"AAAAAAAT", hamming_dist: 1 });
    }

    #[test]
    fn test_thresholds_are_per_index_type() {
        let mut max_mistakes = PerIndex::from_fn(|_| 0);
        max_mistakes[IndexType::P5] = 1;
        let matcher = FuzzyMatcher::new(max_mistakes, PerIndex::default());
        let references = bucket(&["ACGT"]);
        assert!(matcher.find(b"ACGA", IndexType::P5, &references).is_match());
        assert!(!matcher.find(b"ACGA", IndexType::P7, &references).is_match());
    }

    #[rstest]
    #[case(b"ACGTACGT", true)]
    #[case(b"ACGTNCGT", false)]
    fn test_accept_all(#[case] observed: &[u8], #[case] accepted: bool) {
        let mut accept_all = PerIndex::default();
        accept_all[IndexType::I5] = true;
        let matcher = FuzzyMatcher::new(PerIndex::default(), accept_all);
        let empty = AHashSet::new();
        let result = matcher.find(observed, IndexType::I5, &empty);
        assert_eq!(result.is_match(), accepted);
        if accepted {
            assert_eq!(result.barcode(), Some(observed));
        }
        // Other index types still require a reference
        assert!(!matcher.find(observed, IndexType::I7, &empty).is_match());
    }
}

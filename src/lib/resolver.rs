//! Combine the matches of the four barcode slots of a read into a single verdict.
//!
//! Each slot match carries a replicate signal: `1` when the barcode was found only in the first
//! replicate (or in the no-replicate dictionary), `-1` when found only in the second replicate,
//! and `0` when found in both or when the slot is disabled. A read is accepted when every slot
//! matched and the signals sum to a non-zero value, whose sign gives the replicate.

use ahash::AHashSet;

use crate::{
    matcher::FuzzyMatcher,
    registry::{BarcodeRegistry, Dictionaries, IndexType, PerIndex},
};

/// The outcome of resolving one barcode slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotMatch<'a> {
    pub success: bool,
    /// The resolved reference on success, the observed barcode otherwise.
    pub resolved: &'a [u8],
    pub signal: i8,
}

impl<'a> SlotMatch<'a> {
    fn hit(resolved: &'a [u8], signal: i8) -> Self {
        Self { success: true, resolved, signal }
    }

    fn miss(observed: &'a [u8]) -> Self {
        Self { success: false, resolved: observed, signal: 0 }
    }
}

/// The outcome of resolving a whole read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadVerdict<'a> {
    /// The replicate (1 or 2) of an accepted read, `None` for a rejected read.
    pub replicate: Option<usize>,
    /// The resolved barcodes of an accepted read, or the observed barcodes of a rejected read.
    pub barcodes: PerIndex<&'a [u8]>,
}

impl<'a> ReadVerdict<'a> {
    pub fn is_accepted(&self) -> bool {
        self.replicate.is_some()
    }

    /// Concatenate the barcodes in slot order into `buffer`.
    pub fn write_cell_barcode(&self, buffer: &mut Vec<u8>) {
        buffer.clear();
        for (_, barcode) in self.barcodes.iter() {
            buffer.extend_from_slice(barcode);
        }
    }
}

/// Resolves reads against a [`BarcodeRegistry`].
#[derive(Debug, Clone)]
pub struct ReplicateResolver {
    registry: BarcodeRegistry,
    matcher: FuzzyMatcher,
    empty: AHashSet<Vec<u8>>,
}

impl ReplicateResolver {
    pub fn new(registry: BarcodeRegistry, matcher: FuzzyMatcher) -> Self {
        Self { registry, matcher, empty: AHashSet::new() }
    }

    pub fn registry(&self) -> &BarcodeRegistry {
        &self.registry
    }

    /// Resolve the observed barcodes of a read. Disabled slots hold an empty barcode.
    pub fn resolve<'a>(&'a self, observed: PerIndex<&'a [u8]>) -> ReadVerdict<'a> {
        if self.registry.is_passthrough() {
            return ReadVerdict { replicate: Some(1), barcodes: observed };
        }

        let mut barcodes = observed;
        let mut signal: i32 = 0;
        for index_type in IndexType::ALL {
            let slot = self.resolve_slot(observed[index_type], index_type);
            if !slot.success {
                return ReadVerdict { replicate: None, barcodes: observed };
            }
            signal += i32::from(slot.signal);
            barcodes[index_type] = slot.resolved;
        }

        match signal {
            0 => ReadVerdict { replicate: None, barcodes: observed },
            s if s > 0 => ReadVerdict { replicate: Some(1), barcodes },
            _ => ReadVerdict { replicate: Some(2), barcodes },
        }
    }

    /// Resolve a single slot.
    pub fn resolve_slot<'a>(&'a self, observed: &'a [u8], index_type: IndexType) -> SlotMatch<'a> {
        if observed.is_empty() {
            return SlotMatch::hit(observed, 0);
        }
        if self.matcher.is_accept_all(index_type) {
            return match self.matcher.find(observed, index_type, &self.empty).barcode() {
                Some(resolved) => SlotMatch::hit(resolved, 1),
                None => SlotMatch::miss(observed),
            };
        }

        match self.registry.dictionaries() {
            Dictionaries::Empty => SlotMatch::miss(observed),
            Dictionaries::NoReplicate(dict) => {
                match self.matcher.find(observed, index_type, dict.bucket(index_type)).barcode() {
                    Some(resolved) => SlotMatch::hit(resolved, 1),
                    None => SlotMatch::miss(observed),
                }
            }
            Dictionaries::Replicates(repl1, repl2) => {
                let (repl1, repl2) = (repl1.bucket(index_type), repl2.bucket(index_type));
                match (repl1.get(observed), repl2.get(observed)) {
                    (Some(exact), Some(_)) => SlotMatch::hit(exact, 0),
                    (Some(exact), None) => SlotMatch::hit(exact, 1),
                    (None, Some(exact)) => SlotMatch::hit(exact, -1),
                    (None, None) => {
                        let in_repl1 = self.matcher.find_nearest(observed, index_type, repl1);
                        let in_repl2 = self.matcher.find_nearest(observed, index_type, repl2);
                        match (in_repl1.barcode(), in_repl2.barcode()) {
                            (Some(a), Some(b)) if a == b => SlotMatch::hit(a, 0),
                            (Some(a), None) => SlotMatch::hit(a, 1),
                            (None, Some(b)) => SlotMatch::hit(b, -1),
                            _ => SlotMatch::miss(observed),
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;
    use crate::registry::BarcodeDict;

    fn dict(entries: &[(IndexType, &str)]) -> BarcodeDict {
        let mut dict = BarcodeDict::default();
        for (index_type, barcode) in entries {
            dict.insert(*index_type, barcode.as_bytes());
        }
        dict
    }

    fn lengths(p7: usize, i7: usize, i5: usize, p5: usize) -> PerIndex<usize> {
        let mut lengths = PerIndex::default();
        lengths[IndexType::P7] = p7;
        lengths[IndexType::I7] = i7;
        lengths[IndexType::I5] = i5;
        lengths[IndexType::P5] = p5;
        lengths
    }

    fn resolver(dictionaries: Dictionaries, max_mistakes: usize) -> ReplicateResolver {
        let registry =
            BarcodeRegistry::new(dictionaries, lengths(4, 4, 0, 0), PerIndex::default(), false);
        let matcher = FuzzyMatcher::new(PerIndex::from_fn(|_| max_mistakes), PerIndex::default());
        ReplicateResolver::new(registry, matcher)
    }

    fn observed<'a>(p7: &'a str, i7: &'a str) -> PerIndex<&'a [u8]> {
        let mut observed: PerIndex<&[u8]> = PerIndex::from_fn(|_| b"".as_slice());
        observed[IndexType::P7] = p7.as_bytes();
        observed[IndexType::I7] = i7.as_bytes();
        observed
    }

    fn replicated() -> ReplicateResolver {
        let repl1 =
            dict(&[(IndexType::P7, "AAAA"), (IndexType::I7, "CCCC"), (IndexType::I7, "GGGG")]);
        let repl2 =
            dict(&[(IndexType::P7, "TTTT"), (IndexType::P7, "ACAC"), (IndexType::I7, "GGGG")]);
        resolver(Dictionaries::Replicates(repl1, repl2), 1)
    }

    #[rstest]
    #[case("AAAT", true)]
    #[case("AATT", false)]
    fn test_single_replicate_scenario(#[case] p7: &str, #[case] accepted: bool) {
        let resolver = resolver(Dictionaries::NoReplicate(dict(&[(IndexType::P7, "AAAA")])), 1);
        let verdict = resolver.resolve(observed(p7, ""));
        assert_eq!(verdict.is_accepted(), accepted);
        if accepted {
            assert_eq!(verdict.replicate, Some(1));
            assert_eq!(verdict.barcodes[IndexType::P7], b"AAAA");
        } else {
            assert_eq!(verdict.barcodes[IndexType::P7], p7.as_bytes());
        }
    }

    #[rstest]
    #[case("AAAA", "CCCC", Some(1))]
    #[case("TTTT", "GGGG", Some(2))]
    // i7 found in both replicates
    #[case("AAAA", "GGGG", Some(1))]
    #[case("AAAA", "TTTT", None)]
    // Fuzzy hits
    #[case("AAAT", "CCCA", Some(1))]
    #[case("TTTA", "GGGA", Some(2))]
    fn test_two_replicates(
        #[case] p7: &str,
        #[case] i7: &str,
        #[case] expected: Option<usize>,
    ) {
        let resolver = replicated();
        assert_eq!(resolver.resolve(observed(p7, i7)).replicate, expected);
    }

    #[test]
    fn test_contradictory_replicates_are_rejected() {
        let repl1 = dict(&[(IndexType::P7, "AAAA"), (IndexType::I7, "CCCC")]);
        let repl2 = dict(&[(IndexType::P7, "TTTT"), (IndexType::I7, "GGGG")]);
        let resolver = resolver(Dictionaries::Replicates(repl1, repl2), 1);
        let verdict = resolver.resolve(observed("AAAA", "GGGG"));
        assert!(!verdict.is_accepted());
        assert_eq!(verdict.barcodes[IndexType::I7], b"GGGG");
    }

    #[test]
    fn test_slot_signals() {
        let resolver = replicated();
        // Exact in both
        assert_eq!(resolver.resolve_slot(b"GGGG", IndexType::I7), SlotMatch::hit(b"GGGG", 0));
        // Exact only in repl1 even though a fuzzy repl2 hit exists
        assert_eq!(resolver.resolve_slot(b"AAAA", IndexType::P7), SlotMatch::hit(b"AAAA", 1));
        // Fuzzy hits on different references in each replicate
        assert_eq!(resolver.resolve_slot(b"ACAA", IndexType::P7), SlotMatch::miss(b"ACAA"));
        // Disabled slot
        assert_eq!(resolver.resolve_slot(b"", IndexType::P5), SlotMatch::hit(b"", 0));
    }

    #[test]
    fn test_passthrough_accepts_everything_as_observed() {
        let registry = BarcodeRegistry::new(
            Dictionaries::Empty,
            PerIndex::from_fn(|_| 4),
            PerIndex::default(),
            true,
        );
        let resolver = ReplicateResolver::new(registry, FuzzyMatcher::default());
        let verdict = resolver.resolve(observed("NNNN", "ACGT"));
        assert_eq!(verdict.replicate, Some(1));
        let mut cell = vec![];
        verdict.write_cell_barcode(&mut cell);
        assert_eq!(cell, b"NNNNACGT");
    }

    #[test]
    fn test_accept_all_slot_without_dictionary() {
        let mut accept_all = PerIndex::default();
        accept_all[IndexType::P7] = true;
        let registry =
            BarcodeRegistry::new(Dictionaries::Empty, lengths(4, 0, 0, 0), accept_all, false);
        let resolver =
            ReplicateResolver::new(registry, FuzzyMatcher::new(PerIndex::default(), accept_all));
        assert_eq!(resolver.resolve(observed("ACGT", "")).replicate, Some(1));
        assert_eq!(resolver.resolve(observed("ACNT", "")).replicate, None);
    }
}

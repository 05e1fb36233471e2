//! Property-based tests using proptest.
//!
//! These cover the invariants that must hold for all inputs: the boundary
//! filter equivalence, result merging algebra, and identity/position
//! round-trips.

use proptest::prelude::*;

use source_sync::record::diff_attributes;
use source_sync::{Attributes, Filter, Identity, Position, SynchronizationResult};

fn changelog_row(sequence: u64) -> Attributes {
    let mut row = Attributes::new();
    row.set("changeNumber", sequence.to_string());
    row
}

// =============================================================================
// Boundary Filter Equivalence
// =============================================================================

proptest! {
    /// `(>= X) AND NOT (= X)` selects exactly the records `> X`, for any X
    /// and any multiset of change numbers (duplicate ties included).
    #[test]
    fn filter_forms_equivalent(
        x in 0u64..10_000,
        sequences in prop::collection::vec(0u64..10_000, 0..100),
    ) {
        let direct = Filter::changes_after("changeNumber", x);
        let compat = Filter::changes_after_compat("changeNumber", x);

        for sequence in &sequences {
            let row = changelog_row(*sequence);
            prop_assert_eq!(
                direct.matches(&row),
                compat.matches(&row),
                "disagree at sequence {} for boundary {}", sequence, x
            );
        }
    }

    /// The direct form means strictly greater, nothing else.
    #[test]
    fn filter_direct_is_strictly_greater(
        x in 0u64..10_000,
        sequence in 0u64..10_000,
    ) {
        let filter = Filter::changes_after("changeNumber", x);
        prop_assert_eq!(filter.matches(&changelog_row(sequence)), sequence > x);
    }

    /// Values with duplicate ties on the boundary are always excluded.
    #[test]
    fn filter_boundary_ties_excluded(x in 0u64..10_000, copies in 1usize..5) {
        let compat = Filter::changes_after_compat("changeNumber", x);
        for _ in 0..copies {
            prop_assert!(!compat.matches(&changelog_row(x)));
        }
    }
}

// =============================================================================
// Result Merge Algebra
// =============================================================================

fn arb_result() -> impl Strategy<Value = SynchronizationResult> {
    (
        0u64..1000,
        0u64..1000,
        0u64..1000,
        0u64..1000,
        0u64..1000,
        0u64..1000,
        -1000i64..1000,
        0u64..10_000,
    )
        .prop_map(
            |(source, added, modified, deleted, unchanged, failed, target, millis)| {
                SynchronizationResult {
                    source_entries: source,
                    added_entries: added,
                    modified_entries: modified,
                    deleted_entries: deleted,
                    unchanged_entries: unchanged,
                    failed_entries: failed,
                    target_entries: target,
                    duration: std::time::Duration::from_millis(millis),
                }
            },
        )
}

proptest! {
    #[test]
    fn merge_commutative(a in arb_result(), b in arb_result()) {
        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        prop_assert_eq!(ab, ba);
    }

    #[test]
    fn merge_associative(a in arb_result(), b in arb_result(), c in arb_result()) {
        let mut left = a.clone();
        left.merge(&b);
        left.merge(&c);

        let mut bc = b.clone();
        bc.merge(&c);
        let mut right = a.clone();
        right.merge(&bc);

        prop_assert_eq!(left, right);
    }

    #[test]
    fn merge_identity_element(a in arb_result()) {
        let mut merged = a.clone();
        merged.merge(&SynchronizationResult::new());
        prop_assert_eq!(merged, a);
    }
}

// =============================================================================
// Identity and Position
// =============================================================================

fn arb_identity() -> impl Strategy<Value = Identity> {
    prop::collection::vec(("[a-z]{1,8}", "[a-zA-Z0-9]{1,12}"), 1..4).prop_map(|pairs| {
        Identity::new(
            pairs
                .into_iter()
                .map(|(f, v)| (f.to_string(), v.to_string()))
                .collect(),
        )
    })
}

proptest! {
    /// Display then parse restores the identity.
    #[test]
    fn identity_display_parse_roundtrip(identity in arb_identity()) {
        let rendered = identity.to_string();
        let parsed = Identity::parse(&rendered);
        prop_assert_eq!(parsed, Some(identity));
    }

    /// Every identity sits under its own suffix.
    #[test]
    fn identity_is_under_own_suffix(identity in arb_identity(), split in 0usize..4) {
        let fields = identity.fields();
        let split = split.min(fields.len());
        let base = Identity::new(fields[fields.len() - split..].to_vec());
        if !base.is_empty() {
            prop_assert!(identity.is_under(&base));
        }
    }

    /// Numbered positions order like their change numbers.
    #[test]
    fn position_number_ordering(a in any::<u64>(), b in any::<u64>()) {
        let pa = Position::Number(a);
        let pb = Position::Number(b);
        prop_assert_eq!(pa.partial_cmp(&pb), Some(a.cmp(&b)));
    }

    /// Mixed position kinds are never comparable.
    #[test]
    fn position_mixed_kinds_incomparable(
        n in any::<u64>(),
        cookie in prop::collection::vec(any::<u8>(), 0..32),
    ) {
        let number = Position::Number(n);
        let cookie = Position::Cookie(cookie);
        prop_assert!(number.partial_cmp(&cookie).is_none());
        prop_assert!(cookie.partial_cmp(&number).is_none());
    }
}

// =============================================================================
// Attribute Diff
// =============================================================================

fn arb_attributes() -> impl Strategy<Value = Attributes> {
    prop::collection::vec(("[a-z]{1,6}", "[a-z0-9]{1,10}"), 0..8).prop_map(|pairs| {
        pairs
            .into_iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    })
}

proptest! {
    /// Identical attribute sets diff to nothing.
    #[test]
    fn diff_of_identical_sets_is_empty(attrs in arb_attributes()) {
        let mods = diff_attributes(&attrs, &attrs, &Default::default());
        prop_assert!(mods.is_empty(), "got {:?}", mods);
    }

    /// A non-empty diff means the sets actually differ.
    #[test]
    fn diff_nonempty_implies_difference(a in arb_attributes(), b in arb_attributes()) {
        let mods = diff_attributes(&a, &b, &Default::default());
        if a == b {
            prop_assert!(mods.is_empty());
        }
    }
}

/*
    Convergence tests - Replica merge properties of record state

    Tests:
    1. Idempotent merge
    2. Commutative and associative merge
    3. Tombstones survive any merge without an explicit resolution
    4. Replicas that exchange state end identical
*/

use crate::core_store::crdt::{Crdt, RecordState};
use crate::core_store::model::{EntityKind, FieldMap, RecordId, Timestamp};
use proptest::prelude::*;
use serde_json::json;

const FIELDS: [&str; 3] = ["moisture", "height", "notes"];
const PATHS: [&str; 3] = ["photos/a.jpg", "photos/b.jpg", "photos/c.jpg"];

#[derive(Debug, Clone)]
enum Edit {
    Set(usize, i64),
    Delete,
    Attach(usize),
    Detach(usize),
}

fn edit_strategy() -> impl Strategy<Value = Edit> {
    prop_oneof![
        4 => (0..FIELDS.len(), 0..5i64).prop_map(|(f, v)| Edit::Set(f, v)),
        1 => Just(Edit::Delete),
        2 => (0..PATHS.len()).prop_map(Edit::Attach),
        1 => (0..PATHS.len()).prop_map(Edit::Detach),
    ]
}

fn base() -> RecordState {
    let mut state = RecordState::new(RecordId::from("abc"), EntityKind::Observation);
    let mut fields = FieldMap::new();
    fields.insert("moisture".into(), json!(10));
    state.edit_fields("origin", &fields, Timestamp(1));
    state
}

fn replica(node: &str, edits: &[Edit]) -> RecordState {
    let mut state = base();
    for (i, edit) in edits.iter().enumerate() {
        let now = Timestamp(10 + i as u64);
        match edit {
            Edit::Set(f, v) => {
                let mut fields = FieldMap::new();
                fields.insert(FIELDS[*f].to_string(), json!(v));
                state.edit_fields(node, &fields, now);
            }
            Edit::Delete => {
                state.delete(node, now);
            }
            Edit::Attach(p) => {
                state.attach_media(node, PATHS[*p], now);
            }
            Edit::Detach(p) => {
                state.detach_media(node, PATHS[*p], now);
            }
        }
    }
    state
}

fn merged(a: &RecordState, b: &RecordState) -> RecordState {
    let mut out = a.clone();
    out.merge(b).unwrap();
    out
}

proptest! {
    #[test]
    fn prop_merge_idempotent(edits in prop::collection::vec(edit_strategy(), 0..8)) {
        let a = replica("tablet-a", &edits);
        let once = merged(&a, &a);
        prop_assert_eq!(&once, &a);
        prop_assert_eq!(merged(&once, &a), a);
    }

    #[test]
    fn prop_merge_commutative(
        edits_a in prop::collection::vec(edit_strategy(), 0..8),
        edits_b in prop::collection::vec(edit_strategy(), 0..8),
    ) {
        let a = replica("tablet-a", &edits_a);
        let b = replica("tablet-b", &edits_b);

        let ab = merged(&a, &b);
        let ba = merged(&b, &a);
        prop_assert_eq!(&ab, &ba);
        prop_assert_eq!(ab.materialize(), ba.materialize());
    }

    #[test]
    fn prop_merge_associative(
        edits_a in prop::collection::vec(edit_strategy(), 0..6),
        edits_b in prop::collection::vec(edit_strategy(), 0..6),
        edits_c in prop::collection::vec(edit_strategy(), 0..6),
    ) {
        let a = replica("tablet-a", &edits_a);
        let b = replica("tablet-b", &edits_b);
        let c = replica("tablet-c", &edits_c);

        let left = merged(&merged(&a, &b), &c);
        let right = merged(&a, &merged(&b, &c));
        prop_assert_eq!(left, right);
    }

    #[test]
    fn prop_tombstone_survives_merge(
        edits_a in prop::collection::vec(edit_strategy(), 0..6),
        edits_b in prop::collection::vec(edit_strategy(), 0..6),
    ) {
        let mut a = replica("tablet-a", &edits_a);
        a.delete("tablet-a", Timestamp(100));
        let b = replica("tablet-b", &edits_b);

        prop_assert!(merged(&a, &b).is_deleted());
        prop_assert!(merged(&b, &a).is_deleted());
    }

    #[test]
    fn prop_ancestor_never_undoes_delete(edits in prop::collection::vec(edit_strategy(), 0..6)) {
        let ancestor = replica("tablet-a", &edits);
        let mut deleted = ancestor.clone();
        deleted.delete("tablet-a", Timestamp(100));

        let folded = merged(&deleted, &ancestor);
        prop_assert!(folded.is_deleted());
        prop_assert!(!folded.materialize().conflict || ancestor.is_conflicted());
    }
}

#[test]
fn test_two_replicas_exchange_and_converge() {
    let a = replica("tablet-a", &[Edit::Set(0, 12), Edit::Attach(0)]);
    let b = replica("tablet-b", &[Edit::Set(0, 14), Edit::Set(1, 3)]);

    let mut left = a.clone();
    left.merge(&b).unwrap();
    let mut right = b.clone();
    right.merge(&a).unwrap();

    let left = left.materialize();
    let right = right.materialize();
    assert_eq!(left, right);
    assert!(left.conflict);
    assert_eq!(left.fields["height"], json!(3));
    assert_eq!(left.media, vec!["photos/a.jpg"]);
}

#[test]
fn test_sequential_edits_never_conflict() {
    let a = replica("tablet-a", &[Edit::Set(0, 12)]);
    let mut b = a.clone();
    let mut fields = FieldMap::new();
    fields.insert("moisture".into(), json!(13));
    b.edit_fields("tablet-b", &fields, Timestamp(50));

    let mut folded = a.clone();
    folded.merge(&b).unwrap();
    assert!(!folded.is_conflicted());
    assert_eq!(folded.materialize().fields["moisture"], json!(13));
}

#[test]
fn test_equal_values_from_two_devices_are_not_a_conflict() {
    let a = replica("tablet-a", &[Edit::Set(0, 12)]);
    let b = replica("tablet-b", &[Edit::Set(0, 12)]);
    let folded = merged(&a, &b);
    assert!(!folded.is_conflicted());
    assert_eq!(folded.materialize().fields["moisture"], json!(12));
}

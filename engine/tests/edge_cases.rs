//! Edge case tests for twoway-engine
//!
//! These tests cover boundary conditions and unusual inputs to the delta
//! engine, the record model, and reconciliation.

use twoway_engine::delta::{apply_delta, fallback_delta, match_details, score_for_detail_pair};
use twoway_engine::reconcile::reconcile_remote;
use twoway_engine::{
    guid_belongs_to, parse_guid, Detail, DetailKind, FieldId, FieldValue, Primitive, Record,
    SyncPair,
};

fn record(guid: &str, details: Vec<Detail>) -> Record {
    details
        .into_iter()
        .fold(Record::new().with_guid(guid), Record::with_detail)
}

// ============================================================================
// Value Equivalence
// ============================================================================

#[test]
fn url_as_text_is_unmodified() {
    let prev = record(
        "acct:1",
        vec![Detail::new(DetailKind::Url)
            .with(FieldId::Url, FieldValue::text("https://example.org"))
            .with_id("u1")],
    );
    let curr = record(
        "acct:1",
        vec![Detail::new(DetailKind::Url).with(FieldId::Url, FieldValue::url("https://example.org"))],
    );

    let updated = apply_delta(&prev, &curr);
    assert_eq!(updated, prev);
}

#[test]
fn int_list_matches_generic_list() {
    let a = Detail::new(DetailKind::PhoneNumber)
        .with(FieldId::Number, FieldValue::text("1"))
        .with(FieldId::SubTypes, FieldValue::IntList(vec![1, 2]));
    let b = Detail::new(DetailKind::PhoneNumber)
        .with(FieldId::Number, FieldValue::text("1"))
        .with(
            FieldId::SubTypes,
            FieldValue::List(vec![Primitive::Int(1), Primitive::Int(2)]),
        );
    assert_eq!(score_for_detail_pair(&a, &b), 0);

    let c = Detail::new(DetailKind::PhoneNumber)
        .with(FieldId::Number, FieldValue::text("1"))
        .with(FieldId::SubTypes, FieldValue::IntList(vec![2, 1]));
    assert_eq!(score_for_detail_pair(&a, &c), 1);
}

#[test]
fn absent_field_equals_empty_string() {
    let a = Detail::name("Ann", "");
    let b = Detail::new(DetailKind::Name).with(FieldId::FirstName, FieldValue::text("Ann"));
    assert_eq!(score_for_detail_pair(&a, &b), 0);
}

#[test]
fn different_kinds_never_match() {
    let phone = Detail::phone("555");
    let email = Detail::email("555");
    assert_eq!(score_for_detail_pair(&phone, &email), u32::MAX);

    let matching = match_details(&[&phone], &[&email]);
    assert!(matching.pairs.is_empty());
    assert_eq!(matching.unmatched_removals, vec![0]);
    assert_eq!(matching.unmatched_additions, vec![0]);
}

// ============================================================================
// String Edge Cases
// ============================================================================

#[test]
fn unicode_values_compare_exactly() {
    let names = ["日本語テスト", "Привет мир", "مرحبا", "🎉🚀", "Hello\nWorld\tTab"];
    for name in names {
        let prev = record("acct:1", vec![Detail::name(name, "")]);
        let curr = record("acct:1", vec![Detail::name(name, "")]);
        assert!(prev.same_content(&curr), "{name}");
    }

    let a = record("acct:1", vec![Detail::name("café", "")]);
    // Decomposed form: "cafe" + combining acute accent
    let b = record("acct:1", vec![Detail::name("cafe\u{301}", "")]);
    assert!(!a.same_content(&b));
}

#[test]
fn very_long_values() {
    let long = "x".repeat(100_000);
    let prev = record("acct:1", vec![Detail::note(long.clone()).with_id("n")]);
    let curr = record("acct:1", vec![Detail::note(format!("{long}y"))]);

    let updated = apply_delta(&prev, &curr);
    let note = updated.detail(DetailKind::Note).unwrap();
    assert_eq!(note.id.as_deref(), Some("n"));
    assert_eq!(note.get(FieldId::Note).and_then(FieldValue::as_str).map(str::len), Some(100_001));
}

// ============================================================================
// GUID Edge Cases
// ============================================================================

#[test]
fn guid_prefix_must_end_at_separator() {
    assert!(guid_belongs_to("acct:1", "acct"));
    assert!(!guid_belongs_to("acct2:1", "acct"));
    assert!(!guid_belongs_to("acct", "acct"));
    assert!(guid_belongs_to("a:b:c", "a"));
}

#[test]
fn guid_without_separator_does_not_parse() {
    assert_eq!(parse_guid("noseparator"), None);
    assert_eq!(parse_guid(":r1"), Some(("", "r1")));
}

#[test]
fn empty_guid_is_no_guid() {
    let r = Record::new().with_guid("");
    assert_eq!(r.guid(), None);
}

// ============================================================================
// Delta Edge Cases
// ============================================================================

#[test]
fn empty_records_produce_no_delta() {
    let delta = fallback_delta(&[], &[]);
    assert!(delta.is_empty());
    assert_eq!(apply_delta(&Record::new(), &Record::new()), Record::new());
}

#[test]
fn ignorable_details_alone_are_no_content() {
    let a = Record::new()
        .with_detail(Detail::sync_target("a"))
        .with_detail(Detail::new(DetailKind::Presence));
    assert!(a.same_content(&Record::new()));
}

#[test]
fn remote_cannot_remove_ignorable_details() {
    let prev = record("acct:1", vec![Detail::phone("1"), Detail::sync_target("twoway")]);
    let curr = record("acct:1", vec![Detail::phone("2")]);
    let updated = apply_delta(&prev, &curr);
    assert_eq!(updated.sync_target(), Some("twoway"));
}

#[test]
fn many_identical_details_pair_one_to_one() {
    let prev = record("acct:1", vec![Detail::phone("1"); 5]);
    let curr = record("acct:1", vec![Detail::phone("1"); 3]);

    let delta = fallback_delta(&prev.details, &curr.details);
    assert_eq!(delta.removals.len(), 2);
    assert!(delta.additions.is_empty());

    let updated = apply_delta(&prev, &curr);
    assert_eq!(updated.details_of(DetailKind::PhoneNumber).count(), 3);
}

#[test]
fn greedy_tie_prefers_earlier_pair() {
    let a = Detail::phone("1");
    let b = Detail::phone("2");
    let c = Detail::phone("3");
    // Every pair scores 1; commit order follows encounter order.
    let matching = match_details(&[&a, &b], &[&c]);
    assert_eq!(matching.pairs, vec![(0, 0, 1)]);
    assert_eq!(matching.unmatched_removals, vec![1]);
}

// ============================================================================
// Reconciliation Edge Cases
// ============================================================================

#[test]
fn empty_report_keeps_snapshot() {
    let prev = vec![record("acct:1", vec![Detail::phone("1")])];
    let delta = reconcile_remote(&prev, &[], &[], &mut Vec::new());
    assert!(delta.pairs.is_empty());
    assert_eq!(delta.mutated_prev_remote, prev);
}

#[test]
fn duplicate_deletions_delete_once() {
    let prev = vec![record("acct:1", vec![Detail::phone("1")]).with_id("1")];
    let deleted = vec![Record::new().with_guid("acct:1"), Record::new().with_guid("acct:1")];
    let delta = reconcile_remote(&prev, &deleted, &[], &mut Vec::new());
    assert_eq!(delta.pairs, vec![SyncPair::delete(prev[0].clone())]);
    assert!(delta.mutated_prev_remote.is_empty());
}

#[test]
fn deleted_and_modified_in_one_report_deletes() {
    let prev = vec![record("acct:1", vec![Detail::phone("1")]).with_id("1")];
    let deleted = vec![Record::new().with_guid("acct:1")];
    let modified = vec![record("acct:1", vec![Detail::phone("2")])];
    let delta = reconcile_remote(&prev, &deleted, &modified, &mut Vec::new());
    assert_eq!(delta.pairs, vec![SyncPair::delete(prev[0].clone())]);
    assert!(delta.mutated_prev_remote.is_empty());
}

#[test]
fn record_json_roundtrip_with_every_value_type() {
    let detail = Detail::new(DetailKind::Organization)
        .with(FieldId::OrganizationName, FieldValue::text("Acme"))
        .with(FieldId::ImageUrl, FieldValue::url("https://acme.example/logo.png"))
        .with(FieldId::Context, FieldValue::Int(2))
        .with(FieldId::Accuracy, FieldValue::Float(0.5))
        .with(FieldId::Flags, FieldValue::Bool(true))
        .with(FieldId::SubTypes, FieldValue::IntList(vec![1, 3]))
        .with(
            FieldId::Capabilities,
            FieldValue::List(vec![Primitive::Text("chat".into()), Primitive::Bool(false)]),
        )
        .with_id("org");
    let original = record("acct:1", vec![detail]).with_id("42");

    let json = serde_json::to_string(&original).unwrap();
    let restored: Record = serde_json::from_str(&json).unwrap();
    assert_eq!(restored, original);
}

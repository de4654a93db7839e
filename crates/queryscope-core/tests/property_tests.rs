//! Property-based tests for shape canonicalization and the tail watermark
//!
//! Uses proptest to check the invariants that the live pipeline relies on.

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use mongodb::bson::{Bson, Document};
use proptest::prelude::*;
use queryscope_core::profiler::shape::render_document;
use queryscope_core::profiler::Watermark;
use queryscope_core::{canonicalize, LogPayload, QueryShape, RawLogEntry};

// ============================================================================
// Strategy Generators
// ============================================================================

/// Identifier-like field names, rendered without quotes
fn field_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z_][a-zA-Z0-9_]{0,12}").expect("valid regex")
}

/// Collection names as they appear in command targets
fn collection_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,20}").expect("valid regex")
}

/// Scalar BSON values
fn scalar_strategy() -> impl Strategy<Value = Bson> {
    prop_oneof![
        any::<i32>().prop_map(Bson::Int32),
        any::<i64>().prop_map(Bson::Int64),
        any::<bool>().prop_map(Bson::Boolean),
        "[ -~]{0,20}".prop_map(Bson::String),
        Just(Bson::Null),
    ]
}

/// Flat filter documents with unique keys
fn filter_strategy() -> impl Strategy<Value = Document> {
    prop::collection::btree_map(field_name_strategy(), scalar_strategy(), 0..6).prop_map(|fields| {
        let mut doc = Document::new();
        for (key, value) in fields {
            doc.insert(key, value);
        }
        doc
    })
}

/// Commands the canonicalizer does not recognise
fn unsupported_command_strategy() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec![
        "insert",
        "update",
        "delete",
        "findAndModify",
        "getMore",
        "createIndexes",
        "listCollections",
    ])
}

fn entry(command: Document) -> RawLogEntry {
    RawLogEntry::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        "shop.orders",
        3,
        LogPayload::Command(command),
    )
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    /// The same entry always yields the same shape
    #[test]
    fn canonicalize_is_deterministic(target in collection_strategy(), filter in filter_strategy()) {
        let mut command = Document::new();
        command.insert("find", target);
        command.insert("filter", filter);
        let entry = entry(command);

        prop_assert_eq!(canonicalize(&entry), canonicalize(&entry.clone()));
    }

    /// Find shapes name the command target and embed the rendered filter
    #[test]
    fn find_shape_embeds_rendered_filter(target in collection_strategy(), filter in filter_strategy()) {
        let expected = format!("db.{}.find({})", target, render_document(&filter));
        let mut command = Document::new();
        command.insert("find", target);
        command.insert("filter", filter);

        prop_assert_eq!(canonicalize(&entry(command)), QueryShape::Shape(expected));
    }

    /// Rendered documents keep the field order of the source document
    #[test]
    fn rendering_preserves_field_order(filter in filter_strategy()) {
        let rendered = render_document(&filter);
        let mut last = 0;
        for key in filter.keys() {
            let needle = format!("{}: ", key);
            let position = rendered[last..].find(&needle);
            prop_assert!(position.is_some(), "{} missing from {}", key, rendered);
            last += position.unwrap() + needle.len();
        }
    }

    /// Commands outside find/aggregate/count/distinct are unsupported
    #[test]
    fn other_commands_are_unsupported(name in unsupported_command_strategy(), target in collection_strategy()) {
        let mut command = Document::new();
        command.insert(name, target);

        let shape = canonicalize(&entry(command));
        prop_assert_eq!(shape, QueryShape::UnsupportedCommand);
    }

    /// Accepted timestamps are strictly increasing, whatever order they arrive in
    #[test]
    fn watermark_accepts_strictly_increasing(offsets in prop::collection::vec(-50i64..50, 0..64)) {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut watermark = Watermark::new(start);
        let mut accepted = Vec::new();

        for offset in &offsets {
            let ts = start + ChronoDuration::milliseconds(*offset);
            if watermark.advance(ts) {
                accepted.push(ts);
            }
        }

        prop_assert!(accepted.windows(2).all(|pair| pair[0] < pair[1]));
        prop_assert!(accepted.iter().all(|ts| *ts > start));
        if let Some(max) = accepted.last() {
            prop_assert_eq!(watermark.current(), *max);
        } else {
            prop_assert_eq!(watermark.current(), start);
        }
    }

    /// Replaying a stream through a used watermark accepts nothing
    #[test]
    fn watermark_rejects_replays(offsets in prop::collection::vec(1i64..1000, 1..32)) {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut watermark = Watermark::new(start);
        let stamps: Vec<_> = offsets
            .iter()
            .map(|offset| start + ChronoDuration::milliseconds(*offset))
            .collect();

        for ts in &stamps {
            watermark.advance(*ts);
        }
        for ts in &stamps {
            prop_assert!(!watermark.advance(*ts));
        }
    }
}

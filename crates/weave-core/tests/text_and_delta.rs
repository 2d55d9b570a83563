use serde_json::json;
use weave_core::{Attrs, Doc, DocOptions, Event, TextDelta};

fn doc_with_client(client: u64) -> Doc {
    Doc::with_options(DocOptions {
        client_id: Some(client),
        gc: true,
    })
}

fn bold() -> Attrs {
    let mut attrs = Attrs::new();
    attrs.insert("bold".to_string(), json!(true));
    attrs
}

#[test]
fn hello_world_insert_and_length() {
    let mut doc = doc_with_client(100_000);
    let text = doc.get_text("t").unwrap();
    doc.transact(|txn| {
        text.insert(txn, 0, "Hello").unwrap();
        text.insert(txn, 5, " World").unwrap();
    });
    assert_eq!(text.get_string(&doc).unwrap(), "Hello World");
    assert_eq!(text.len(&doc).unwrap(), 11);
}

#[test]
fn insert_beyond_length_clamps_to_append() {
    let mut doc = doc_with_client(100_000);
    let text = doc.get_text("t").unwrap();
    doc.transact(|txn| {
        text.insert(txn, 0, "ab").unwrap();
        text.insert(txn, 99, "c").unwrap();
    });
    assert_eq!(text.get_string(&doc).unwrap(), "abc");
}

#[test]
fn delete_overlapping_live_end_trims_silently() {
    let mut doc = doc_with_client(100_000);
    let text = doc.get_text("t").unwrap();
    doc.transact(|txn| text.insert(txn, 0, "hello").unwrap());
    doc.transact(|txn| text.delete(txn, 3, 50).unwrap());
    assert_eq!(text.get_string(&doc).unwrap(), "hel");
    // Deleting an already-deleted range is a no-op, never an error.
    doc.transact(|txn| text.delete(txn, 3, 50).unwrap());
    assert_eq!(text.get_string(&doc).unwrap(), "hel");
}

#[test]
fn delete_in_middle_splits_runs() {
    let mut doc = doc_with_client(100_000);
    let text = doc.get_text("t").unwrap();
    doc.transact(|txn| text.insert(txn, 0, "hello world").unwrap());
    doc.transact(|txn| text.delete(txn, 2, 3).unwrap());
    assert_eq!(text.get_string(&doc).unwrap(), "he world");
    assert_eq!(text.len(&doc).unwrap(), 8);
}

#[test]
fn format_projects_into_delta() {
    let mut doc = doc_with_client(100_000);
    let text = doc.get_text("t").unwrap();
    doc.transact(|txn| text.insert(txn, 0, "Hello World").unwrap());
    doc.transact(|txn| text.format(txn, 0, 5, bold()).unwrap());

    let delta = text.to_delta(&doc).unwrap();
    assert_eq!(
        delta,
        vec![
            TextDelta::Insert {
                text: "Hello".to_string(),
                attributes: Some(bold()),
            },
            TextDelta::Insert {
                text: " World".to_string(),
                attributes: None,
            },
        ]
    );
    // The string projection is unaffected by formatting.
    assert_eq!(text.get_string(&doc).unwrap(), "Hello World");
    assert_eq!(text.len(&doc).unwrap(), 11);
}

#[test]
fn format_event_carries_retain_attributes() {
    let mut doc = doc_with_client(100_000);
    let text = doc.get_text("t").unwrap();
    doc.transact(|txn| text.insert(txn, 0, "Hello World").unwrap());

    let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let sink = std::rc::Rc::clone(&seen);
    doc.observe(&text, move |event, _info| {
        if let Event::Text(text_event) = event {
            sink.borrow_mut().push(text_event.delta.clone());
        }
    });

    doc.transact(|txn| text.format(txn, 0, 5, bold()).unwrap());
    let deltas = seen.borrow();
    assert_eq!(
        deltas.as_slice(),
        [vec![TextDelta::Retain {
            len: 5,
            attributes: Some(bold()),
        }]]
    );
}

#[test]
fn insert_with_attributes_carries_formatting() {
    let mut doc = doc_with_client(100_000);
    let text = doc.get_text("t").unwrap();
    doc.transact(|txn| {
        text.insert(txn, 0, "plain ").unwrap();
        text.insert_with_attributes(txn, 6, "loud", bold()).unwrap();
    });
    let delta = text.to_delta(&doc).unwrap();
    assert_eq!(
        delta,
        vec![
            TextDelta::Insert {
                text: "plain ".to_string(),
                attributes: None,
            },
            TextDelta::Insert {
                text: "loud".to_string(),
                attributes: Some(bold()),
            },
        ]
    );
}

#[test]
fn unformat_with_null_value() {
    let mut doc = doc_with_client(100_000);
    let text = doc.get_text("t").unwrap();
    doc.transact(|txn| text.insert(txn, 0, "abcd").unwrap());
    doc.transact(|txn| text.format(txn, 0, 4, bold()).unwrap());

    let mut clear = Attrs::new();
    clear.insert("bold".to_string(), json!(null));
    doc.transact(|txn| text.format(txn, 0, 4, clear).unwrap());

    let delta = text.to_delta(&doc).unwrap();
    assert_eq!(
        delta,
        vec![TextDelta::Insert {
            text: "abcd".to_string(),
            attributes: None,
        }]
    );
}

#[test]
fn embeds_occupy_one_position() {
    let mut doc = doc_with_client(100_000);
    let text = doc.get_text("t").unwrap();
    doc.transact(|txn| {
        text.insert(txn, 0, "ab").unwrap();
        text.insert_embed(txn, 1, json!({"image": "x.png"})).unwrap();
    });
    assert_eq!(text.len(&doc).unwrap(), 3);
    // Embeds are invisible to the plain string projection.
    assert_eq!(text.get_string(&doc).unwrap(), "ab");
    let delta = text.to_delta(&doc).unwrap();
    assert_eq!(
        delta,
        vec![
            TextDelta::Insert {
                text: "a".to_string(),
                attributes: None,
            },
            TextDelta::InsertEmbed {
                value: json!({"image": "x.png"}),
                attributes: None,
            },
            TextDelta::Insert {
                text: "b".to_string(),
                attributes: None,
            },
        ]
    );
}

#[test]
fn apply_delta_round_trips_edit_sequences() {
    let mut doc = doc_with_client(100_000);
    let text = doc.get_text("t").unwrap();
    doc.transact(|txn| text.insert(txn, 0, "Hello World").unwrap());
    doc.transact(|txn| {
        text.apply_delta(
            txn,
            &[
                TextDelta::Retain {
                    len: 6,
                    attributes: None,
                },
                TextDelta::Delete { len: 5 },
                TextDelta::Insert {
                    text: "Rust".to_string(),
                    attributes: None,
                },
            ],
        )
        .unwrap();
    });
    assert_eq!(text.get_string(&doc).unwrap(), "Hello Rust");
}

#[test]
fn detached_after_destroy() {
    let mut doc = doc_with_client(100_000);
    let text = doc.get_text("t").unwrap();
    doc.transact(|txn| text.insert(txn, 0, "x").unwrap());
    doc.destroy();
    assert!(text.get_string(&doc).is_err());
    let failed = doc.transact(|txn| text.insert(txn, 0, "y"));
    assert!(failed.is_err());
}

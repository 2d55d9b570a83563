//! Map and array semantics, nested types and prelim materialization.

use serde_json::json;
use weave_core::{
    Doc, DocError, DocOptions, EntryAction, Event, ListDelta, Out, PrelimArray, PrelimMap,
    PrelimText,
};

fn doc_with_client(client: u64) -> Doc {
    Doc::with_options(DocOptions {
        client_id: Some(client),
        gc: true,
    })
}

#[test]
fn map_set_get_remove_len() {
    let mut doc = doc_with_client(100_000);
    let map = doc.get_map("m").unwrap();
    doc.transact(|txn| {
        map.set(txn, "a", 1i64).unwrap();
        map.set(txn, "b", "two").unwrap();
    });
    assert_eq!(map.len(&doc).unwrap(), 2);
    assert!(map.contains_key(&doc, "a").unwrap());
    assert_eq!(map.keys(&doc).unwrap(), vec!["a".to_string(), "b".to_string()]);

    let removed = doc.transact(|txn| map.remove(txn, "a").unwrap());
    assert_eq!(removed, Some(Out::Json(json!(1))));
    assert_eq!(map.len(&doc).unwrap(), 1);
    assert!(!map.contains_key(&doc, "a").unwrap());

    // Removing an absent key is a no-op.
    let removed = doc.transact(|txn| map.remove(txn, "missing").unwrap());
    assert_eq!(removed, None);
}

#[test]
fn map_set_supersedes_without_deleting_history() {
    let mut doc = doc_with_client(100_000);
    let map = doc.get_map("m").unwrap();
    doc.transact(|txn| map.set(txn, "k", "v1").unwrap());
    doc.transact(|txn| map.set(txn, "k", "v2").unwrap());
    assert_eq!(map.get(&doc, "k").unwrap(), Some(Out::Json(json!("v2"))));
    assert_eq!(map.len(&doc).unwrap(), 1);
}

#[test]
fn map_clear_and_to_json() {
    let mut doc = doc_with_client(100_000);
    let map = doc.get_map("m").unwrap();
    doc.transact(|txn| {
        map.set(txn, "z", 26i64).unwrap();
        map.set(txn, "a", 1i64).unwrap();
    });
    // Keys project deterministically sorted.
    assert_eq!(map.to_json(&doc).unwrap(), json!({"a": 1, "z": 26}));
    doc.transact(|txn| map.clear(txn).unwrap());
    assert_eq!(map.to_json(&doc).unwrap(), json!({}));
}

#[test]
fn map_events_report_actions_and_old_values() {
    let mut doc = doc_with_client(100_000);
    let map = doc.get_map("m").unwrap();
    doc.transact(|txn| map.set(txn, "k", "v1").unwrap());

    let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let sink = std::rc::Rc::clone(&seen);
    doc.observe(&map, move |event, _info| {
        if let Event::Map(map_event) = event {
            for (key, change) in &map_event.keys {
                sink.borrow_mut().push((
                    key.clone(),
                    change.action,
                    change.old_value.clone(),
                    change.new_value.clone(),
                ));
            }
        }
    });

    doc.transact(|txn| map.set(txn, "k", "v2").unwrap());
    doc.transact(|txn| map.set(txn, "fresh", 1i64).unwrap());
    doc.transact(|txn| {
        map.remove(txn, "k").unwrap();
    });

    let events = seen.borrow();
    assert_eq!(events.len(), 3);
    assert_eq!(
        events[0],
        (
            "k".to_string(),
            EntryAction::Update,
            Some(Out::Json(json!("v1"))),
            Some(Out::Json(json!("v2"))),
        )
    );
    assert_eq!(
        events[1],
        (
            "fresh".to_string(),
            EntryAction::Add,
            None,
            Some(Out::Json(json!(1))),
        )
    );
    assert_eq!(
        events[2],
        (
            "k".to_string(),
            EntryAction::Delete,
            Some(Out::Json(json!("v2"))),
            None,
        )
    );
}

#[test]
fn array_positional_sugar() {
    let mut doc = doc_with_client(100_000);
    let array = doc.get_array("a").unwrap();
    doc.transact(|txn| {
        array.push(txn, vec![2i64.into()]).unwrap();
        array.unshift(txn, vec![1i64.into()]).unwrap();
        array.push(txn, vec![3i64.into(), 4i64.into()]).unwrap();
        array.insert(txn, 99, vec![5i64.into()]).unwrap();
    });
    assert_eq!(array.to_json(&doc).unwrap(), json!([1, 2, 3, 4, 5]));
    assert_eq!(array.len(&doc).unwrap(), 5);
    assert_eq!(array.get(&doc, 2).unwrap(), Some(Out::Json(json!(3))));
    assert_eq!(array.get(&doc, 9).unwrap(), None);

    doc.transact(|txn| array.delete(txn, 1, 2).unwrap());
    assert_eq!(array.to_json(&doc).unwrap(), json!([1, 4, 5]));
}

#[test]
fn array_delta_events() {
    let mut doc = doc_with_client(100_000);
    let array = doc.get_array("a").unwrap();
    doc.transact(|txn| {
        array
            .push(txn, vec![1i64.into(), 2i64.into(), 3i64.into()])
            .unwrap();
    });

    let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let sink = std::rc::Rc::clone(&seen);
    doc.observe(&array, move |event, _info| {
        if let Event::Array(array_event) = event {
            sink.borrow_mut().push(array_event.delta.clone());
        }
    });

    doc.transact(|txn| {
        array.delete(txn, 1, 1).unwrap();
        array.insert(txn, 1, vec!["x".into()]).unwrap();
    });
    let deltas = seen.borrow();
    assert_eq!(
        deltas.as_slice(),
        [vec![
            ListDelta::Retain { len: 1 },
            ListDelta::Insert {
                values: vec![Out::Json(json!("x"))],
            },
            ListDelta::Delete { len: 1 },
        ]]
    );
}

#[test]
fn prelim_types_materialize_on_insertion() {
    let mut doc = doc_with_client(100_000);
    let map = doc.get_map("root").unwrap();
    doc.transact(|txn| {
        map.set(
            txn,
            "todo",
            PrelimArray(vec![
                "buy milk".into(),
                PrelimText("nested note".to_string()).into(),
            ]),
        )
        .unwrap();
        map.set(
            txn,
            "settings",
            PrelimMap(vec![("dark".to_string(), true.into())]),
        )
        .unwrap();
    });

    assert_eq!(
        map.to_json(&doc).unwrap(),
        json!({
            "settings": {"dark": true},
            "todo": ["buy milk", "nested note"],
        })
    );

    // The nested array is a live shared type, not a snapshot.
    let todo = match map.get(&doc, "todo").unwrap() {
        Some(Out::Shared(weave_core::SharedRef::Array(array))) => array,
        other => panic!("expected nested array, got {other:?}"),
    };
    doc.transact(|txn| todo.push(txn, vec!["done".into()]).unwrap());
    assert_eq!(
        todo.to_json(&doc).unwrap(),
        json!(["buy milk", "nested note", "done"])
    );
}

#[test]
fn unattached_prelims_are_freely_mutable() {
    let mut prelim = PrelimArray(vec![1i64.into()]);
    prelim.0.push(2i64.into());

    let mut doc = doc_with_client(100_000);
    let array = doc.get_array("a").unwrap();
    doc.transact(|txn| array.push(txn, vec![prelim.into()]).unwrap());
    assert_eq!(array.to_json(&doc).unwrap(), json!([[1, 2]]));
}

#[test]
fn root_kind_mismatch_is_an_error() {
    let mut doc = doc_with_client(100_000);
    doc.get_text("shared").unwrap();
    match doc.get_array("shared") {
        Err(DocError::RootKindMismatch { .. }) => {}
        other => panic!("expected kind mismatch, got {other:?}"),
    }
}

#[test]
fn nested_types_sync_across_replicas() {
    let mut a = doc_with_client(100_000);
    let map_a = a.get_map("root").unwrap();
    a.transact(|txn| {
        map_a
            .set(txn, "list", PrelimArray(vec![1i64.into(), 2i64.into()]))
            .unwrap();
    });

    let mut b = doc_with_client(200_000);
    b.apply_update(&a.encode_state_as_update().unwrap(), weave_core::Origin::None)
        .unwrap();
    let map_b = b.get_map("root").unwrap();
    assert_eq!(map_b.to_json(&b).unwrap(), json!({"list": [1, 2]}));
}

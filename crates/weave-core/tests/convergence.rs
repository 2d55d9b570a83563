//! Replica convergence under arbitrary update delivery orders.

use std::cell::RefCell;
use std::rc::Rc;

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde_json::json;
use weave_core::{Doc, DocOptions, Origin, Out};

fn doc_with_client(client: u64) -> Doc {
    Doc::with_options(DocOptions {
        client_id: Some(client),
        gc: true,
    })
}

/// Records every update payload the document emits.
fn record_updates(doc: &mut Doc) -> Rc<RefCell<Vec<Vec<u8>>>> {
    let log = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&log);
    doc.on_update(move |payload, _origin| sink.borrow_mut().push(payload.to_vec()));
    log
}

#[test]
fn concurrent_inserts_tie_break_by_client_id() {
    let mut a = doc_with_client(100_000);
    let mut b = doc_with_client(200_000);
    let text_a = a.get_text("t").unwrap();
    let text_b = b.get_text("t").unwrap();
    let log_a = record_updates(&mut a);
    let log_b = record_updates(&mut b);

    a.transact(|txn| text_a.insert(txn, 0, "A").unwrap());
    b.transact(|txn| text_b.insert(txn, 0, "B").unwrap());

    let from_a = log_a.borrow().clone();
    let from_b = log_b.borrow().clone();
    for update in &from_b {
        a.apply_update(update, Origin::from("remote")).unwrap();
    }
    for update in &from_a {
        b.apply_update(update, Origin::from("remote")).unwrap();
    }

    // The same two-character order on both replicas, decided by client id
    // (the higher client is placed to the right), not by arrival order.
    assert_eq!(text_a.get_string(&a).unwrap(), "AB");
    assert_eq!(text_b.get_string(&b).unwrap(), "AB");
}

#[test]
fn duplicated_and_reversed_delivery_is_idempotent() {
    let mut a = doc_with_client(100_000);
    let text_a = a.get_text("t").unwrap();
    let log_a = record_updates(&mut a);

    a.transact(|txn| text_a.insert(txn, 0, "hello").unwrap());
    a.transact(|txn| text_a.insert(txn, 5, " world").unwrap());
    a.transact(|txn| text_a.delete(txn, 0, 1).unwrap());

    let updates = log_a.borrow().clone();

    let mut b = doc_with_client(200_000);
    let text_b = b.get_text("t").unwrap();
    // Reversed, then forward, then everything again.
    for update in updates.iter().rev() {
        b.apply_update(update, Origin::None).unwrap();
    }
    for update in updates.iter() {
        b.apply_update(update, Origin::None).unwrap();
    }
    for update in updates.iter() {
        b.apply_update(update, Origin::None).unwrap();
    }
    assert_eq!(text_b.get_string(&b).unwrap(), "ello world");
    assert_eq!(text_b.get_string(&b).unwrap(), text_a.get_string(&a).unwrap());
}

#[test]
fn full_state_bootstrap_matches_incremental_sync() {
    let mut a = doc_with_client(100_000);
    let text_a = a.get_text("t").unwrap();
    let map_a = a.get_map("m").unwrap();
    a.transact(|txn| {
        text_a.insert(txn, 0, "shared state").unwrap();
        map_a.set(txn, "answer", 42i64).unwrap();
        map_a.set(txn, "gone", "soon").unwrap();
    });
    a.transact(|txn| {
        text_a.delete(txn, 0, 7).unwrap();
        map_a.remove(txn, "gone").unwrap();
    });

    let state = a.encode_state_as_update().unwrap();
    let mut b = doc_with_client(200_000);
    b.apply_update(&state, Origin::None).unwrap();

    let text_b = b.get_text("t").unwrap();
    let map_b = b.get_map("m").unwrap();
    assert_eq!(text_b.get_string(&b).unwrap(), "state");
    assert_eq!(map_b.to_json(&b).unwrap(), json!({"answer": 42}));
}

#[test]
fn concurrent_map_sets_agree_on_one_winner() {
    let mut a = doc_with_client(100_000);
    let mut b = doc_with_client(200_000);
    let map_a = a.get_map("m").unwrap();
    let map_b = b.get_map("m").unwrap();
    let log_a = record_updates(&mut a);

    a.transact(|txn| map_a.set(txn, "k", "v1").unwrap());
    let seed = log_a.borrow().clone();
    for update in &seed {
        b.apply_update(update, Origin::None).unwrap();
    }

    let log_a2 = log_a.borrow().len();
    a.transact(|txn| map_a.set(txn, "k", "v2").unwrap());
    let log_b = record_updates(&mut b);
    b.transact(|txn| map_b.set(txn, "k", "v3").unwrap());

    let from_a = log_a.borrow()[log_a2..].to_vec();
    let from_b = log_b.borrow().clone();
    for update in &from_b {
        a.apply_update(update, Origin::None).unwrap();
    }
    for update in &from_a {
        b.apply_update(update, Origin::None).unwrap();
    }

    let winner_a = match map_a.get(&a, "k").unwrap() {
        Some(Out::Json(v)) => v,
        other => panic!("unexpected value: {other:?}"),
    };
    let winner_b = match map_b.get(&b, "k").unwrap() {
        Some(Out::Json(v)) => v,
        other => panic!("unexpected value: {other:?}"),
    };
    assert_eq!(winner_a, winner_b);
    assert!(winner_a == json!("v2") || winner_a == json!("v3"));
}

#[test]
fn corrupt_update_is_rejected_atomically() {
    let mut doc = doc_with_client(100_000);
    let text = doc.get_text("t").unwrap();
    doc.transact(|txn| text.insert(txn, 0, "stable").unwrap());
    let before = text.get_string(&doc).unwrap();

    assert!(doc.apply_update(&[0xff, 0x01, 0x02], Origin::None).is_err());
    assert!(doc.apply_update(&[], Origin::None).is_err());

    assert_eq!(text.get_string(&doc).unwrap(), before);
}

#[test]
fn out_of_order_delivery_parks_and_drains() {
    let mut a = doc_with_client(100_000);
    let text_a = a.get_text("t").unwrap();
    let log_a = record_updates(&mut a);
    a.transact(|txn| text_a.insert(txn, 0, "one").unwrap());
    a.transact(|txn| text_a.insert(txn, 3, " two").unwrap());
    a.transact(|txn| text_a.insert(txn, 7, " three").unwrap());
    let updates = log_a.borrow().clone();

    let mut b = doc_with_client(200_000);
    let text_b = b.get_text("t").unwrap();
    // Deliver the causally latest update first: it must park, then drain
    // once its prerequisites arrive.
    b.apply_update(&updates[2], Origin::None).unwrap();
    assert_eq!(text_b.get_string(&b).unwrap(), "");
    b.apply_update(&updates[0], Origin::None).unwrap();
    b.apply_update(&updates[1], Origin::None).unwrap();
    assert_eq!(text_b.get_string(&b).unwrap(), "one two three");
}

#[test]
fn randomized_replicas_converge_under_shuffled_delivery() {
    for seed in 0..12u64 {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let clients = [100_000u64, 200_000, 300_000];
        let mut docs: Vec<Doc> = clients.iter().map(|c| doc_with_client(*c)).collect();
        let texts: Vec<_> = docs
            .iter_mut()
            .map(|doc| doc.get_text("t").unwrap())
            .collect();
        let logs: Vec<_> = docs.iter_mut().map(record_updates).collect();

        for _ in 0..12 {
            for (doc, text) in docs.iter_mut().zip(&texts) {
                let len = text.len(doc).unwrap();
                if len > 0 && rng.gen_bool(0.3) {
                    let at = rng.gen_range(0..len);
                    let max_del = (len - at).min(3);
                    let del = rng.gen_range(1..=max_del);
                    doc.transact(|txn| text.delete(txn, at, del).unwrap());
                } else {
                    let at = if len == 0 { 0 } else { rng.gen_range(0..=len) };
                    let word: String = (0..rng.gen_range(1..4))
                        .map(|_| char::from(b'a' + rng.gen_range(0..26u8)))
                        .collect();
                    doc.transact(|txn| text.insert(txn, at, &word).unwrap());
                }
            }
        }

        let snapshots: Vec<Vec<Vec<u8>>> = logs.iter().map(|log| log.borrow().clone()).collect();
        for (i, doc) in docs.iter_mut().enumerate() {
            let mut incoming: Vec<&Vec<u8>> = Vec::new();
            for (j, updates) in snapshots.iter().enumerate() {
                if i != j {
                    incoming.extend(updates.iter());
                }
            }
            // Shuffled delivery with duplicates.
            incoming.shuffle(&mut rng);
            let dupes: Vec<&Vec<u8>> = incoming
                .iter()
                .filter(|_| rng.gen_bool(0.25))
                .copied()
                .collect();
            for update in incoming.iter().chain(dupes.iter()) {
                doc.apply_update(update, Origin::from("sync")).unwrap();
            }
        }

        let rendered: Vec<String> = docs
            .iter()
            .zip(&texts)
            .map(|(doc, text)| text.get_string(doc).unwrap())
            .collect();
        assert_eq!(rendered[0], rendered[1], "seed {seed} diverged");
        assert_eq!(rendered[1], rendered[2], "seed {seed} diverged");
    }
}

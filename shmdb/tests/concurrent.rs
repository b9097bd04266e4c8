// Copyright 2024-Present the shmdb authors.
// SPDX-License-Identifier: Apache-2.0

//! Concurrency behavior: writer exclusion and lock-free counters.

use shmdb::{Database, Value};
use std::sync::Arc;

#[test]
fn writer_lock_serializes_increments() {
    let db = Arc::new(Database::attach_local(1 << 20).unwrap());
    let rec = {
        let _w = db.write();
        let rec = db.create_record(1).unwrap();
        db.set_int_field(rec, 0, 0).unwrap();
        rec
    };

    const THREADS: usize = 4;
    const ROUNDS: i64 = 1500;
    let mut handles = Vec::new();
    for _ in 0..THREADS {
        let db = Arc::clone(&db);
        handles.push(std::thread::spawn(move || {
            for _ in 0..ROUNDS {
                let _w = db.write();
                let v = match db.get_field(rec, 0).unwrap() {
                    Value::Int(v) => v,
                    other => panic!("unexpected {other:?}"),
                };
                db.set_int_field(rec, 0, v + 1).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    let _r = db.read();
    assert_eq!(Value::Int(THREADS as i64 * ROUNDS), db.get_field(rec, 0).unwrap());
}

#[test]
fn atomic_counter_needs_no_outer_lock() {
    let db = Arc::new(Database::attach_local(1 << 20).unwrap());
    let rec = {
        let _w = db.write();
        let rec = db.create_record(1).unwrap();
        db.set_int_field(rec, 0, 0).unwrap();
        rec
    };

    const THREADS: usize = 8;
    const ROUNDS: i64 = 4000;
    let mut handles = Vec::new();
    for _ in 0..THREADS {
        let db = Arc::clone(&db);
        handles.push(std::thread::spawn(move || {
            for _ in 0..ROUNDS {
                db.add_int_atomic_field(rec, 0, 1).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(
        Value::Int(THREADS as i64 * ROUNDS),
        db.get_field(rec, 0).unwrap()
    );
}

#[test]
fn readers_run_concurrently_with_each_other() {
    let db = Arc::new(Database::attach_local(1 << 20).unwrap());
    {
        let _w = db.write();
        for i in 0..100 {
            let rec = db.create_record(1).unwrap();
            db.set_int_field(rec, 0, i).unwrap();
        }
    }

    let mut handles = Vec::new();
    for _ in 0..6 {
        let db = Arc::clone(&db);
        handles.push(std::thread::spawn(move || {
            for _ in 0..50 {
                let _r = db.read();
                let mut count = 0;
                let mut cur = db.first_record();
                while let Some(rec) = cur {
                    count += 1;
                    cur = db.next_record(rec);
                }
                assert_eq!(100, count);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn update_atomic_field_compare_and_set() {
    let db = Database::attach_local(1 << 20).unwrap();
    let _w = db.write();
    let rec = db.create_record(1).unwrap();
    let zero = db.encode_value(&Value::Int(0)).unwrap();
    let one = db.encode_value(&Value::Int(1)).unwrap();
    db.set_field_word(rec, 0, zero).unwrap();
    // Swap succeeds when the expectation holds, and reports the observed
    // word either way.
    let seen = db.update_atomic_field(rec, 0, one, zero).unwrap();
    assert_eq!(zero, seen);
    let seen = db.update_atomic_field(rec, 0, one, zero).unwrap();
    assert_eq!(one, seen);
    assert_eq!(Value::Int(1), db.get_field(rec, 0).unwrap());
}

// Copyright 2024-Present the shmdb authors.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios through the public API.

use shmdb::{Comparator, Database, DbError, IndexKind, QueryArg, Record, Value};

fn int_arg(column: usize, cond: Comparator, v: i64) -> QueryArg {
    QueryArg { column, cond, value: Value::Int(v) }
}

fn drain(db: &Database, q: &mut shmdb::Query) -> Vec<Record> {
    let mut out = Vec::new();
    while let Some(r) = db.fetch(q) {
        out.push(r);
    }
    out
}

fn col_int(db: &Database, rec: Record, col: usize) -> i64 {
    match db.get_field(rec, col).unwrap() {
        Value::Int(v) => v,
        other => panic!("expected int in column {col}, got {other:?}"),
    }
}

/// Twenty rows: field 0 cycles 0,1,2; field 2 is the row index; field 3
/// is 6 for rows below 6.
fn populate_sample(db: &Database, rows: i64) {
    let _w = db.write();
    for row in 0..rows {
        let rec = db.create_record(4).unwrap();
        db.set_int_field(rec, 0, row % 3).unwrap();
        db.set_int_field(rec, 2, row).unwrap();
        if row < 6 {
            db.set_int_field(rec, 3, 6).unwrap();
        }
    }
}

#[test]
fn scenario_int_fields_round_trip() {
    let db = Database::attach_local(1 << 20).unwrap();
    let _w = db.write();
    let rec = db.create_record(3).unwrap();
    db.set_int_field(rec, 0, 44).unwrap();
    db.set_int_field(rec, 1, -199_999).unwrap();
    db.set_int_field(rec, 2, 0).unwrap();
    assert_eq!(3, db.record_len(rec));
    assert_eq!(Value::Int(-199_999), db.get_field(rec, 1).unwrap());
    db.set_int_field(rec, 1, 0).unwrap();
    assert_eq!(Value::Int(0), db.get_field(rec, 1).unwrap());
}

#[test]
fn scenario_ordered_index_one_sided_range() {
    let db = Database::attach_local(4 << 20).unwrap();
    populate_sample(&db, 20);
    {
        let _w = db.write();
        db.create_index(2, IndexKind::Ordered, None).unwrap();
    }
    let _r = db.read();
    let mut q = db.make_query(None, &[int_arg(2, Comparator::Less, 30)]).unwrap();
    let rows = drain(&db, &mut q);
    assert_eq!(20, rows.len());
    let keys: Vec<i64> = rows.iter().map(|r| col_int(&db, *r, 2)).collect();
    assert_eq!((0..20).collect::<Vec<i64>>(), keys);
}

#[test]
fn scenario_two_sided_range() {
    let db = Database::attach_local(8 << 20).unwrap();
    populate_sample(&db, 200);
    {
        let _w = db.write();
        db.create_index(2, IndexKind::Ordered, None).unwrap();
    }
    let _r = db.read();
    let mut q = db
        .make_query(
            None,
            &[int_arg(2, Comparator::Greater, 21), int_arg(2, Comparator::LessOrEqual, 111)],
        )
        .unwrap();
    let rows = drain(&db, &mut q);
    assert_eq!(90, rows.len());
    assert_eq!(22, col_int(&db, rows[0], 2));
    assert_eq!(111, col_int(&db, *rows.last().unwrap(), 2));
}

#[test]
fn scenario_match_template() {
    let db = Database::attach_local(4 << 20).unwrap();
    populate_sample(&db, 20);
    let _r = db.read();
    let template = [Value::Int(0), Value::Var(0), Value::Var(0), Value::Var(0)];
    let mut q = db.make_query(Some(&template), &[]).unwrap();
    let rows = drain(&db, &mut q);
    assert_eq!(7, rows.len()); // rows 0,3,6,9,12,15,18
    for rec in rows {
        assert_eq!(0, col_int(&db, rec, 0));
    }
}

#[test]
fn scenario_cross_references_and_delete_protection() {
    let db = Database::attach_local(1 << 20).unwrap();
    let _w = db.write();
    let a = db.create_record(2).unwrap();
    let b = db.create_record(3).unwrap();
    let c = db.create_record(4).unwrap();
    db.set_field(b, 2, &Value::Record(a)).unwrap();
    db.set_field(b, 1, &Value::Record(c)).unwrap();
    db.set_field(a, 0, &Value::Record(c)).unwrap();

    let mut parents = Vec::new();
    let mut cur = db.first_parent(c);
    while let Some(p) = cur {
        parents.push(p.record);
        cur = db.next_parent(&p);
    }
    parents.sort_by_key(|r| r.offset());
    let mut expected = vec![a, b];
    expected.sort_by_key(|r| r.offset());
    assert_eq!(expected, parents);

    assert!(matches!(db.delete_record(c), Err(DbError::HasReferences)));
    db.set_field(a, 0, &Value::Null).unwrap();
    db.set_field(b, 1, &Value::Null).unwrap();
    db.delete_record(c).unwrap();
    // A and B survive, with their remaining links intact.
    assert_eq!(Value::Record(a), db.get_field(b, 2).unwrap());
}

#[test]
fn query_results_match_naive_scan() {
    let db = Database::attach_local(8 << 20).unwrap();
    populate_sample(&db, 150);
    {
        let _w = db.write();
        db.create_index(0, IndexKind::Hashed, None).unwrap();
        db.create_index(2, IndexKind::Ordered, None).unwrap();
    }

    let cases: Vec<Vec<QueryArg>> = vec![
        vec![int_arg(0, Comparator::Equal, 1)],
        vec![int_arg(2, Comparator::Greater, 100)],
        vec![int_arg(2, Comparator::GreaterOrEqual, 10), int_arg(2, Comparator::Less, 20)],
        vec![int_arg(0, Comparator::Equal, 2), int_arg(2, Comparator::NotEqual, 5)],
        vec![int_arg(3, Comparator::Equal, 6)],
        vec![int_arg(2, Comparator::LessOrEqual, 0)],
    ];

    let _r = db.read();
    for args in cases {
        let naive: Vec<Record> = {
            let mut out = Vec::new();
            let mut cur = db.first_record();
            while let Some(rec) = cur {
                let ok = args.iter().all(|a| {
                    let have = db.get_field(rec, a.column).unwrap();
                    match a.cond {
                        Comparator::Equal => have.db_eq(&a.value),
                        Comparator::NotEqual => !have.db_eq(&a.value),
                        Comparator::Less => have.db_cmp(&a.value).is_lt(),
                        Comparator::Greater => have.db_cmp(&a.value).is_gt(),
                        Comparator::LessOrEqual => have.db_cmp(&a.value).is_le(),
                        Comparator::GreaterOrEqual => have.db_cmp(&a.value).is_ge(),
                    }
                });
                if ok {
                    out.push(rec);
                }
                cur = db.next_record(rec);
            }
            out
        };
        let mut q = db.make_query(None, &args).unwrap();
        let mut planned = drain(&db, &mut q);
        let mut naive_sorted = naive.clone();
        planned.sort_by_key(|r| r.offset());
        naive_sorted.sort_by_key(|r| r.offset());
        assert_eq!(naive_sorted, planned, "constraints {args:?}");
    }
}

#[test]
fn record_list_visits_each_live_record_once() {
    let db = Database::attach_local(1 << 20).unwrap();
    let _w = db.write();
    let recs: Vec<Record> = (0..30).map(|_| db.create_record(1).unwrap()).collect();
    for (i, rec) in recs.iter().enumerate() {
        if i % 4 == 0 {
            db.delete_record(*rec).unwrap();
        }
    }
    let mut seen = Vec::new();
    let mut cur = db.first_record();
    while let Some(rec) = cur {
        seen.push(rec);
        cur = db.next_record(rec);
    }
    let expected: Vec<Record> =
        recs.iter().enumerate().filter(|(i, _)| i % 4 != 0).map(|(_, r)| *r).collect();
    assert_eq!(expected, seen);
}

#[test]
fn interning_determinism_via_public_api() {
    let db = Database::attach_local(1 << 20).unwrap();
    let _w = db.write();
    let v = Value::Str { s: "the same long string twice".into(), lang: Some("en".into()) };
    let a = db.encode_value(&v).unwrap();
    let b = db.encode_value(&v).unwrap();
    assert_eq!(a, b);
    db.free_encoded(a);
    db.free_encoded(b);
}

#[test]
fn dump_and_import_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.db");
    let size = 1 << 20;

    let source = Database::attach_local(size).unwrap();
    {
        let _w = source.write();
        let rec = source.create_record(2).unwrap();
        source.set_int_field(rec, 0, 99).unwrap();
        source.set_str_field(rec, 1, "snapshotted").unwrap();
        source.create_index(0, IndexKind::Ordered, None).unwrap();
    }
    source.dump(&path).unwrap();

    let target = Database::attach_local(size).unwrap();
    target.import_dump(&path).unwrap();
    let _r = target.read();
    let rec = target.first_record().unwrap();
    assert_eq!(Value::Int(99), target.get_field(rec, 0).unwrap());
    assert_eq!(
        Value::Str { s: "snapshotted".into(), lang: None },
        target.get_field(rec, 1).unwrap()
    );
    // The imported index answers queries.
    let mut q = target
        .make_query(None, &[int_arg(0, Comparator::Equal, 99)])
        .unwrap();
    assert_eq!(1, drain(&target, &mut q).len());
}

#[test]
fn json_documents_are_records() {
    let db = Database::attach_local(2 << 20).unwrap();
    let doc = {
        let _w = db.write();
        db.parse_json_document(r#"{"sensor":"t1","reads":[1,2,3]}"#).unwrap()
    };
    let _r = db.read();
    assert!(db.is_json_document(doc));
    let back = db.json_to_value(doc).unwrap();
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(r#"{"sensor":"t1","reads":[1,2,3]}"#).unwrap(),
        back
    );
}

#[test]
fn date_time_values_order_chronologically() {
    let db = Database::attach_local(1 << 20).unwrap();
    let _w = db.write();
    let rec = db.create_record(2).unwrap();
    let d = Database::ymd_to_date(2024, 7, 1).unwrap();
    let t = Database::hms_to_time(12, 30, 0, 0).unwrap();
    db.set_field(rec, 0, &Value::Date(d)).unwrap();
    db.set_field(rec, 1, &Value::Time(t)).unwrap();
    assert_eq!(Value::Date(d), db.get_field(rec, 0).unwrap());
    let later = Value::Date(Database::ymd_to_date(2024, 7, 2).unwrap());
    assert!(db.get_field(rec, 0).unwrap().db_cmp(&later).is_lt());
}

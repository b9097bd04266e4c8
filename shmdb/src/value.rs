// Copyright 2024-Present the shmdb authors.
// SPDX-License-Identifier: Apache-2.0

//! Dynamically typed field values.
//!
//! [Value] is the decoded form handed to and from the API; the packed
//! one-word form lives in [crate::encode]. The kind enumeration here is
//! authoritative: consumers never see raw tag bits.

use crate::record::Record;
use std::cmp::Ordering;

/// Kind of an encoded word or decoded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    Null = 1,
    Record = 2,
    Int = 3,
    Double = 4,
    Str = 5,
    XmlLiteral = 6,
    Uri = 7,
    Blob = 8,
    Char = 9,
    FixedPoint = 10,
    Date = 11,
    Time = 12,
    AnonConst = 13,
    Var = 14,
}

impl Kind {
    pub(crate) fn from_u8(raw: u8) -> Option<Kind> {
        Some(match raw {
            1 => Kind::Null,
            2 => Kind::Record,
            3 => Kind::Int,
            4 => Kind::Double,
            5 => Kind::Str,
            6 => Kind::XmlLiteral,
            7 => Kind::Uri,
            8 => Kind::Blob,
            9 => Kind::Char,
            10 => Kind::FixedPoint,
            11 => Kind::Date,
            12 => Kind::Time,
            13 => Kind::AnonConst,
            14 => Kind::Var,
            _ => return None,
        })
    }
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    /// Reference to another record in the same segment.
    Record(Record),
    Int(i64),
    Double(f64),
    /// Decimal fixed-point number, stored scaled by 10^4.
    FixedPoint(f64),
    /// String with an optional language tag.
    Str { s: String, lang: Option<String> },
    /// XML literal with its XSD type.
    XmlLiteral { s: String, xsd_type: String },
    /// URI with an optional namespace prefix.
    Uri { s: String, prefix: Option<String> },
    /// Opaque bytes with an optional media type.
    Blob { bytes: Vec<u8>, media_type: Option<String> },
    Char(char),
    /// Signed day count; day 1 is 0001-01-01 in the proleptic Gregorian
    /// calendar (chrono's "days from the Common Era" grid).
    Date(i32),
    /// Hundredths of a second since midnight, 0..8_640_000.
    Time(i32),
    /// Anonymous constant: an interned symbol.
    AnonConst(String),
    /// Query wildcard, identified by number.
    Var(u32),
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::Null => Kind::Null,
            Value::Record(_) => Kind::Record,
            Value::Int(_) => Kind::Int,
            Value::Double(_) => Kind::Double,
            Value::FixedPoint(_) => Kind::FixedPoint,
            Value::Str { .. } => Kind::Str,
            Value::XmlLiteral { .. } => Kind::XmlLiteral,
            Value::Uri { .. } => Kind::Uri,
            Value::Blob { .. } => Kind::Blob,
            Value::Char(_) => Kind::Char,
            Value::Date(_) => Kind::Date,
            Value::Time(_) => Kind::Time,
            Value::AnonConst(_) => Kind::AnonConst,
            Value::Var(_) => Kind::Var,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    fn numeric(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Double(d) | Value::FixedPoint(d) => Some(*d),
            _ => None,
        }
    }

    /// Position of the kind in the cross-kind order. The numeric family
    /// shares one slot and compares by mathematical value.
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Int(_) | Value::Double(_) | Value::FixedPoint(_) => 1,
            Value::Char(_) => 2,
            Value::Str { .. } | Value::AnonConst(_) => 3,
            Value::Uri { .. } => 4,
            Value::XmlLiteral { .. } => 5,
            Value::Blob { .. } => 6,
            Value::Date(_) => 7,
            Value::Time(_) => 8,
            Value::Record(_) => 9,
            Value::Var(_) => 10,
        }
    }

    /// Total order used by the ordered index and the query comparators:
    /// Null < numbers < Char < Str < Uri < XmlLiteral < Blob < Date <
    /// Time < Record < Var. Equality across kinds is false except within
    /// the numeric family.
    pub fn db_cmp(&self, other: &Value) -> Ordering {
        let by_rank = self.rank().cmp(&other.rank());
        if by_rank != Ordering::Equal {
            return by_rank;
        }
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            _ if self.rank() == 1 => {
                // Mixed numeric comparison via f64 total order.
                self.numeric().unwrap().total_cmp(&other.numeric().unwrap())
            }
            (Value::Char(a), Value::Char(b)) => a.cmp(b),
            (Value::Str { s: a, lang: al }, Value::Str { s: b, lang: bl }) => {
                a.as_bytes().cmp(b.as_bytes()).then_with(|| al.cmp(bl))
            }
            (Value::AnonConst(a), Value::AnonConst(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Value::Str { .. }, Value::AnonConst(_)) => Ordering::Less,
            (Value::AnonConst(_), Value::Str { .. }) => Ordering::Greater,
            (Value::Uri { s: a, prefix: ap }, Value::Uri { s: b, prefix: bp }) => {
                ap.cmp(bp).then_with(|| a.as_bytes().cmp(b.as_bytes()))
            }
            (
                Value::XmlLiteral { s: a, xsd_type: at },
                Value::XmlLiteral { s: b, xsd_type: bt },
            ) => at.cmp(bt).then_with(|| a.as_bytes().cmp(b.as_bytes())),
            (
                Value::Blob { bytes: a, media_type: am },
                Value::Blob { bytes: b, media_type: bm },
            ) => a.cmp(b).then_with(|| am.cmp(bm)),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::Time(a), Value::Time(b)) => a.cmp(b),
            (Value::Record(a), Value::Record(b)) => a.offset().cmp(&b.offset()),
            (Value::Var(a), Value::Var(b)) => a.cmp(b),
            _ => unreachable!("ranks matched but kinds did not"),
        }
    }

    /// Equality under [Self::db_cmp].
    pub fn db_eq(&self, other: &Value) -> bool {
        self.db_cmp(other) == Ordering::Equal
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Record(r) => write!(f, "#{}", r.offset()),
            Value::Int(i) => write!(f, "{i}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::FixedPoint(d) => write!(f, "{d:.4}"),
            Value::Str { s, lang: None } => write!(f, "{s}"),
            Value::Str { s, lang: Some(lang) } => write!(f, "{s}@{lang}"),
            Value::XmlLiteral { s, xsd_type } => write!(f, "{s}^^{xsd_type}"),
            Value::Uri { s, prefix: None } => write!(f, "{s}"),
            Value::Uri { s, prefix: Some(p) } => write!(f, "{p}{s}"),
            Value::Blob { bytes, .. } => write!(f, "<blob {} bytes>", bytes.len()),
            Value::Char(c) => write!(f, "{c}"),
            Value::Date(d) => write!(f, "date({d})"),
            Value::Time(t) => write!(f, "time({t})"),
            Value::AnonConst(s) => write!(f, "!{s}"),
            Value::Var(n) => write!(f, "?{n}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> Value {
        Value::Str { s: v.into(), lang: None }
    }

    #[test]
    fn test_cross_kind_order() {
        let ladder = [
            Value::Null,
            Value::Int(i64::MAX),
            Value::Char('a'),
            s("zzz"),
            Value::Uri { s: "a".into(), prefix: None },
            Value::XmlLiteral { s: "a".into(), xsd_type: "t".into() },
            Value::Blob { bytes: vec![0], media_type: None },
            Value::Date(1),
            Value::Time(1),
            Value::Var(0),
        ];
        for w in ladder.windows(2) {
            assert_eq!(Ordering::Less, w[0].db_cmp(&w[1]), "{:?} < {:?}", w[0], w[1]);
        }
    }

    #[test]
    fn test_numeric_family_compares_by_value() {
        assert!(Value::Int(3).db_eq(&Value::Double(3.0)));
        assert!(Value::FixedPoint(2.5).db_eq(&Value::Double(2.5)));
        assert_eq!(Ordering::Less, Value::Int(2).db_cmp(&Value::Double(2.5)));
        assert_eq!(Ordering::Greater, Value::Double(10.0).db_cmp(&Value::Int(9)));
    }

    #[test]
    fn test_cross_kind_equality_is_false() {
        assert!(!s("1").db_eq(&Value::Int(1)));
        assert!(!Value::Date(5).db_eq(&Value::Time(5)));
        assert!(!Value::Null.db_eq(&Value::Int(0)));
    }

    #[test]
    fn test_string_order_is_bytewise_then_lang() {
        assert_eq!(Ordering::Less, s("abc").db_cmp(&s("abd")));
        let en = Value::Str { s: "x".into(), lang: Some("en".into()) };
        let et = Value::Str { s: "x".into(), lang: Some("et".into()) };
        assert_eq!(Ordering::Less, en.db_cmp(&et));
        assert!(!en.db_eq(&et));
    }

    #[test]
    fn test_display_forms() {
        assert_eq!("null", Value::Null.to_string());
        assert_eq!("tere@et", Value::Str { s: "tere".into(), lang: Some("et".into()) }.to_string());
        assert_eq!("2.5000", Value::FixedPoint(2.5).to_string());
        assert_eq!("?3", Value::Var(3).to_string());
    }

    #[test]
    fn test_large_ints_keep_exact_order() {
        let a = Value::Int(i64::MAX - 1);
        let b = Value::Int(i64::MAX);
        assert_eq!(Ordering::Less, a.db_cmp(&b));
    }
}

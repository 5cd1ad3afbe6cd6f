//! Conformance-witness operator class: a key is a byte-string range `[lo,
//! hi]`, with optional per-endpoint "prefix" flags meaning that endpoint
//! matches any extension of its bytes rather than an exact boundary.
//!
//! Not part of the core — this exists to demonstrate the Consistent / Union
//! / Penalty / PickSplit / Compare contract end to end.

use std::cmp::Ordering;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};
use crate::gist::{Element, OperatorClass};

/// A range `[lo, hi]` over byte strings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub lo: Vec<u8>,
    pub hi: Vec<u8>,
    pub lo_prefix: bool,
    pub hi_prefix: bool,
}

impl ByteRange {
    /// A single exact-match point: `lo == hi`, no prefix extension.
    pub fn point(key: impl Into<Vec<u8>>) -> Self {
        let key = key.into();
        Self {
            hi: key.clone(),
            lo: key,
            lo_prefix: false,
            hi_prefix: false,
        }
    }
}

fn overlaps(a: &ByteRange, b: &ByteRange) -> bool {
    // Only declare a clean gap when neither adjacent boundary extends past
    // its literal bytes; a prefix boundary might match arbitrarily far in
    // either direction, so treat it as a conservative "maybe overlaps".
    let a_strictly_before_b = !a.hi_prefix && !b.lo_prefix && a.hi < b.lo;
    let b_strictly_before_a = !b.hi_prefix && !a.lo_prefix && b.hi < a.lo;
    !a_strictly_before_b && !b_strictly_before_a
}

/// The byte-string range operator class.
pub struct ByteStringOps;

impl OperatorClass for ByteStringOps {
    type Predicate = ByteRange;

    fn consistent(&self, e: &ByteRange, q: &ByteRange) -> bool {
        overlaps(e, q)
    }

    fn union(&self, preds: &[ByteRange]) -> ByteRange {
        let mut out = preds[0].clone();
        for p in &preds[1..] {
            match p.lo.cmp(&out.lo) {
                Ordering::Less => {
                    out.lo = p.lo.clone();
                    out.lo_prefix = p.lo_prefix;
                }
                Ordering::Equal => out.lo_prefix = out.lo_prefix || p.lo_prefix,
                Ordering::Greater => {}
            }
            match p.hi.cmp(&out.hi) {
                Ordering::Greater => {
                    out.hi = p.hi.clone();
                    out.hi_prefix = p.hi_prefix;
                }
                Ordering::Equal => out.hi_prefix = out.hi_prefix || p.hi_prefix,
                Ordering::Less => {}
            }
        }
        out
    }

    /// Four-level step function: a subtree already containing `incoming`
    /// costs nothing; an overlapping-but-not-containing subtree costs more;
    /// a disjoint subtree costs most, split by which side it falls on so
    /// `PickSplit`'s median-on-`lo` ordering has somewhere to push ties.
    fn penalty(&self, existing: &ByteRange, incoming: &ByteRange) -> f64 {
        let subset = existing.lo <= incoming.lo && incoming.hi <= existing.hi;
        if subset {
            return 0.0;
        }
        if overlaps(existing, incoming) {
            return 1.0;
        }
        if existing.hi < incoming.lo {
            return 2.0; // incoming sorts entirely to the right of existing
        }
        3.0 // incoming sorts entirely to the left of existing
    }

    fn pick_split(
        &self,
        mut elems: Vec<Element<ByteRange>>,
    ) -> (Vec<Element<ByteRange>>, Vec<Element<ByteRange>>) {
        elems.sort_by(|a, b| a.pred.lo.cmp(&b.pred.lo));
        let mid = elems.len() / 2;
        let right = elems.split_off(mid);
        (elems, right)
    }

    fn compare(&self, a: &ByteRange, b: &ByteRange) -> Ordering {
        a.lo.cmp(&b.lo)
    }

    fn is_ordered(&self) -> bool {
        true
    }

    fn encode_predicate(&self, p: &ByteRange) -> Vec<u8> {
        let mut buf = Vec::with_capacity(p.lo.len() + p.hi.len() + 9);
        let mut lo_len = [0u8; 4];
        BigEndian::write_u32(&mut lo_len, p.lo.len() as u32);
        buf.extend_from_slice(&lo_len);
        buf.extend_from_slice(&p.lo);
        let mut hi_len = [0u8; 4];
        BigEndian::write_u32(&mut hi_len, p.hi.len() as u32);
        buf.extend_from_slice(&hi_len);
        buf.extend_from_slice(&p.hi);
        let flags = (p.lo_prefix as u8) | ((p.hi_prefix as u8) << 1);
        buf.push(flags);
        buf
    }

    fn decode_predicate(&self, buf: &[u8]) -> Result<ByteRange> {
        if buf.len() < 4 {
            return Err(Error::DataFormat("byte range predicate truncated"));
        }
        let lo_len = BigEndian::read_u32(&buf[0..4]) as usize;
        let mut at = 4;
        if at + lo_len > buf.len() {
            return Err(Error::DataFormat("byte range predicate truncated (lo)"));
        }
        let lo = buf[at..at + lo_len].to_vec();
        at += lo_len;
        if at + 4 > buf.len() {
            return Err(Error::DataFormat("byte range predicate truncated"));
        }
        let hi_len = BigEndian::read_u32(&buf[at..at + 4]) as usize;
        at += 4;
        if at + hi_len + 1 > buf.len() {
            return Err(Error::DataFormat("byte range predicate truncated (hi)"));
        }
        let hi = buf[at..at + hi_len].to_vec();
        at += hi_len;
        let flags = buf[at];
        Ok(ByteRange {
            lo,
            hi,
            lo_prefix: flags & 1 != 0,
            hi_prefix: flags & 2 != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_detects_disjoint_ranges() {
        let a = ByteRange {
            lo: b"a".to_vec(),
            hi: b"c".to_vec(),
            lo_prefix: false,
            hi_prefix: false,
        };
        let b = ByteRange {
            lo: b"x".to_vec(),
            hi: b"z".to_vec(),
            lo_prefix: false,
            hi_prefix: false,
        };
        assert!(!overlaps(&a, &b));
        assert!(!overlaps(&b, &a));
    }

    #[test]
    fn overlap_detects_overlapping_ranges() {
        let a = ByteRange {
            lo: b"a".to_vec(),
            hi: b"m".to_vec(),
            lo_prefix: false,
            hi_prefix: false,
        };
        let b = ByteRange {
            lo: b"g".to_vec(),
            hi: b"z".to_vec(),
            lo_prefix: false,
            hi_prefix: false,
        };
        assert!(overlaps(&a, &b));
    }

    #[test]
    fn prefix_bound_is_treated_conservatively() {
        let a = ByteRange {
            lo: b"a".to_vec(),
            hi: b"b".to_vec(),
            lo_prefix: false,
            hi_prefix: true,
        };
        let b = ByteRange::point(b"zzz".to_vec());
        assert!(overlaps(&a, &b));
    }

    #[test]
    fn predicate_round_trips_through_encode_decode() {
        let ops = ByteStringOps;
        let p = ByteRange {
            lo: b"hello".to_vec(),
            hi: b"world".to_vec(),
            lo_prefix: true,
            hi_prefix: false,
        };
        let encoded = ops.encode_predicate(&p);
        let decoded = ops.decode_predicate(&encoded).unwrap();
        assert_eq!(p, decoded);
    }

    #[test]
    fn pick_split_produces_two_non_empty_halves() {
        let ops = ByteStringOps;
        let elems = vec![
            Element::leaf(ByteRange::point(b"a".to_vec()), b"1".to_vec()),
            Element::leaf(ByteRange::point(b"m".to_vec()), b"2".to_vec()),
            Element::leaf(ByteRange::point(b"z".to_vec()), b"3".to_vec()),
        ];
        let (left, right) = ops.pick_split(elems);
        assert!(!left.is_empty());
        assert!(!right.is_empty());
        assert_eq!(left.len() + right.len(), 3);
    }
}

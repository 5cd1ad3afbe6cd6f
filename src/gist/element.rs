//! GiST node and element encoding: `int(n)` followed by `n` elements, each
//! `(predicate, data, ptr)`. An element with non-empty `data` is a leaf
//! entry; one with empty `data` and `ptr >= 16` is an internal pointer.

use byteorder::{BigEndian, ByteOrder};

use super::OperatorClass;
use crate::error::{Error, Result};

/// One entry in a GiST node.
#[derive(Clone, Debug)]
pub struct Element<P> {
    pub pred: P,
    pub data: Vec<u8>,
    pub ptr: u64,
}

impl<P> Element<P> {
    pub fn leaf(pred: P, data: Vec<u8>) -> Self {
        Self { pred, data, ptr: 0 }
    }

    pub fn pointer(pred: P, ptr: u64) -> Self {
        Self {
            pred,
            data: Vec::new(),
            ptr,
        }
    }

    pub fn is_leaf(&self) -> bool {
        !self.data.is_empty()
    }
}

pub(super) fn encode_node<O: OperatorClass>(op: &O, node: &[Element<O::Predicate>]) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut n = [0u8; 4];
    BigEndian::write_u32(&mut n, node.len() as u32);
    buf.extend_from_slice(&n);
    for e in node {
        let pbytes = op.encode_predicate(&e.pred);
        push_len_prefixed(&mut buf, &pbytes);
        push_len_prefixed(&mut buf, &e.data);
        let mut ptr = [0u8; 8];
        BigEndian::write_u64(&mut ptr, e.ptr);
        buf.extend_from_slice(&ptr);
    }
    buf
}

fn push_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    let mut len = [0u8; 4];
    BigEndian::write_u32(&mut len, bytes.len() as u32);
    buf.extend_from_slice(&len);
    buf.extend_from_slice(bytes);
}

fn take_len_prefixed<'a>(buf: &'a [u8], at: &mut usize) -> Result<&'a [u8]> {
    if *at + 4 > buf.len() {
        return Err(Error::DataFormat("gist node truncated (length prefix)"));
    }
    let len = BigEndian::read_u32(&buf[*at..*at + 4]) as usize;
    *at += 4;
    if *at + len > buf.len() {
        return Err(Error::DataFormat("gist node truncated (payload)"));
    }
    let out = &buf[*at..*at + len];
    *at += len;
    Ok(out)
}

pub(super) fn decode_node<O: OperatorClass>(
    op: &O,
    buf: &[u8],
) -> Result<Vec<Element<O::Predicate>>> {
    if buf.len() < 4 {
        return Err(Error::DataFormat("gist node truncated (count)"));
    }
    let n = BigEndian::read_u32(&buf[0..4]) as usize;
    let mut at = 4usize;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let pbytes = take_len_prefixed(buf, &mut at)?;
        let pred = op.decode_predicate(pbytes)?;
        let data = take_len_prefixed(buf, &mut at)?.to_vec();
        if at + 8 > buf.len() {
            return Err(Error::DataFormat("gist node truncated (ptr)"));
        }
        let ptr = BigEndian::read_u64(&buf[at..at + 8]);
        at += 8;
        out.push(Element { pred, data, ptr });
    }
    Ok(out)
}

//! Generic Search Tree: a persistent index generic over a user-supplied
//! operator class, built on top of [`crate::tx::Tx`] for node storage.
//!
//! The tree owns one mutable piece of state: the root offset, written back
//! via [`crate::tx::Tx::set_root`] on every structural change. Everything
//! else (node contents) is addressed purely by the offsets the transaction
//! layer hands out.

pub mod bytestring;
mod element;

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use log::debug;

pub use element::Element;
use element::{decode_node, encode_node};

use crate::error::{Error, Result};
use crate::tx::Tx;

/// The set of callbacks that specialize a GiST for a particular key domain.
pub trait OperatorClass {
    /// The predicate (key) type. Must be cheap enough to clone: every
    /// `Union` call clones the predicates it's summarizing.
    type Predicate: Clone;

    /// `false` guarantees no descendant of `e` matches `q`.
    fn consistent(&self, e: &Self::Predicate, q: &Self::Predicate) -> bool;

    /// A predicate that subsumes every predicate in `preds`. Never called
    /// with an empty slice.
    fn union(&self, preds: &[Self::Predicate]) -> Self::Predicate;

    /// Cost of inserting `incoming` into the subtree dominated by `existing`.
    /// Lower is better; insert descends into the minimum-penalty child.
    fn penalty(&self, existing: &Self::Predicate, incoming: &Self::Predicate) -> f64;

    /// Partition an over-full node's elements into two non-empty groups.
    fn pick_split(
        &self,
        elems: Vec<Element<Self::Predicate>>,
    ) -> (Vec<Element<Self::Predicate>>, Vec<Element<Self::Predicate>>);

    /// Ordering between two predicates. Only consulted when [`Self::is_ordered`]
    /// returns true.
    fn compare(&self, _a: &Self::Predicate, _b: &Self::Predicate) -> std::cmp::Ordering {
        std::cmp::Ordering::Equal
    }

    /// Whether nodes should be kept sorted by [`Self::compare`] on persist.
    fn is_ordered(&self) -> bool {
        false
    }

    fn encode_predicate(&self, p: &Self::Predicate) -> Vec<u8>;
    fn decode_predicate(&self, buf: &[u8]) -> Result<Self::Predicate>;
}

/// Cooperative cancellation for [`Gist::search`]. Cloning shares the same
/// underlying flag, so a caller can hold one clone and trip it from another
/// thread (or from inside the visitor, to stop early).
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(AtomicOrdering::Relaxed)
    }
}

/// Branching-factor configuration. Generalizes the source's hardcoded tree
/// fanout into a runtime option.
#[derive(Clone, Copy, Debug)]
pub struct GistOptions {
    /// Maximum elements per node before `PickSplit` is invoked.
    pub branching_factor: usize,
}

impl Default for GistOptions {
    fn default() -> Self {
        Self { branching_factor: 64 }
    }
}

fn preds<P: Clone>(elems: &[Element<P>]) -> Vec<P> {
    elems.iter().map(|e| e.pred.clone()).collect()
}

/// A generic GiST index over a blob-level transaction.
pub struct Gist<'a, O: OperatorClass> {
    tx: Tx<'a>,
    op: O,
    branching_factor: usize,
}

impl<'a, O: OperatorClass> Gist<'a, O> {
    pub fn new(tx: Tx<'a>, op: O, opts: GistOptions) -> Self {
        Self {
            tx,
            op,
            branching_factor: opts.branching_factor.max(2),
        }
    }

    pub fn commit(self) -> Result<()> {
        self.tx.commit()
    }

    pub fn rollback(self) -> Result<()> {
        self.tx.rollback()
    }

    fn read_node(&self, off: u64) -> Result<Vec<Element<O::Predicate>>> {
        let bytes = self.tx.read(off)?;
        decode_node(&self.op, &bytes)
    }

    /// Persist `node`, reusing `off`'s storage when possible. On `Undersized`,
    /// relocates: allocate a fresh region, write there, free `off`. This is
    /// the only mechanism by which a node's address changes.
    fn persist_node(&self, off: u64, node: &[Element<O::Predicate>]) -> Result<u64> {
        let encoded = encode_node(&self.op, node);
        match self.tx.update(off, &encoded) {
            Ok(()) => Ok(off),
            Err(Error::Undersized { .. }) => {
                let new_off = self.tx.insert(&encoded)?;
                self.tx.delete(off)?;
                Ok(new_off)
            }
            Err(e) => Err(e),
        }
    }

    fn persist_new_node(&self, node: &[Element<O::Predicate>]) -> Result<u64> {
        let encoded = encode_node(&self.op, node);
        self.tx.insert(&encoded)
    }

    /// Insert a single leaf entry.
    pub fn insert(&self, pred: O::Predicate, data: Vec<u8>) -> Result<()> {
        let root = self.tx.get_root()?;
        let new_elem = Element::leaf(pred, data);

        if root == 0 {
            let off = self.persist_new_node(std::slice::from_ref(&new_elem))?;
            self.tx.set_root(off)?;
            debug!("gist: created singleton leaf root at offset {off}");
            return Ok(());
        }

        let result = self.insert_recursive(root, new_elem)?;
        match result.len() {
            1 => self.tx.set_root(result[0].ptr)?,
            2 => {
                let off = self.persist_new_node(&result)?;
                self.tx.set_root(off)?;
                debug!("gist: root split, promoted new internal root at offset {off}");
            }
            _ => unreachable!("insert_recursive always returns one or two elements"),
        }
        Ok(())
    }

    fn insert_recursive(
        &self,
        off: u64,
        new_elem: Element<O::Predicate>,
    ) -> Result<Vec<Element<O::Predicate>>> {
        let mut node = self.read_node(off)?;
        let any_leaf = node.iter().any(|e| e.is_leaf());
        let any_internal = node.iter().any(|e| !e.is_leaf());

        if any_leaf || !any_internal {
            node.push(new_elem);
        } else {
            let mut best_idx = 0;
            let mut best_penalty = f64::INFINITY;
            for (i, e) in node.iter().enumerate() {
                let p = self.op.penalty(&e.pred, &new_elem.pred);
                if p < best_penalty {
                    best_penalty = p;
                    best_idx = i;
                }
            }
            let child_off = node[best_idx].ptr;
            if child_off < 16 {
                return Err(Error::InternalCorruption(
                    "gist child pointer fell in the reserved allocator zone",
                ));
            }
            let child_result = self.insert_recursive(child_off, new_elem)?;
            let mut it = child_result.into_iter();
            node[best_idx] = it.next().expect("child always returns at least one element");
            if let Some(second) = it.next() {
                node.push(second);
            }
        }

        self.finish_node(off, node)
    }

    /// Shared tail of insert/delete's per-node bookkeeping: split if
    /// over-full, sort if ordered, persist, and wrap the result as the
    /// element(s) the caller installs in place of the old pointer.
    fn finish_node(
        &self,
        off: u64,
        mut node: Vec<Element<O::Predicate>>,
    ) -> Result<Vec<Element<O::Predicate>>> {
        if node.len() > self.branching_factor {
            let (g1, g2) = self.op.pick_split(node);
            let off1 = self.persist_node(off, &g1)?;
            let off2 = self.persist_new_node(&g2)?;
            debug!("gist: node at offset {off} split into {off1} and {off2}");
            Ok(vec![
                Element::pointer(self.op.union(&preds(&g1)), off1),
                Element::pointer(self.op.union(&preds(&g2)), off2),
            ])
        } else {
            if self.op.is_ordered() {
                node.sort_by(|a, b| self.op.compare(&a.pred, &b.pred));
            }
            let new_off = self.persist_node(off, &node)?;
            Ok(vec![Element::pointer(self.op.union(&preds(&node)), new_off)])
        }
    }

    /// Walk the tree for every leaf element `Consistent` with `query`,
    /// calling `visit` for each. Checks `token` before every node read and
    /// before every emission.
    pub fn search(
        &self,
        query: &O::Predicate,
        token: &CancelToken,
        visit: &mut dyn FnMut(&O::Predicate, &[u8]),
    ) -> Result<()> {
        let root = self.tx.get_root()?;
        if root == 0 {
            return Ok(());
        }
        self.search_recursive(root, query, token, visit)
    }

    fn search_recursive(
        &self,
        off: u64,
        query: &O::Predicate,
        token: &CancelToken,
        visit: &mut dyn FnMut(&O::Predicate, &[u8]),
    ) -> Result<()> {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let node = self.read_node(off)?;
        for e in &node {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if !self.op.consistent(&e.pred, query) {
                continue;
            }
            if e.is_leaf() {
                visit(&e.pred, &e.data);
            } else if e.ptr >= 16 {
                self.search_recursive(e.ptr, query, token, visit)?;
            }
        }
        Ok(())
    }

    /// Remove every leaf element matching `query` for which `keep_pred`
    /// returns true.
    pub fn delete(
        &self,
        query: &O::Predicate,
        mut keep_pred: impl FnMut(&O::Predicate, &[u8]) -> bool,
    ) -> Result<()> {
        let root = self.tx.get_root()?;
        if root == 0 {
            return Ok(());
        }
        let (repl, tail) = self.delete_recursive(root, query, &mut keep_pred)?;
        let combined = if !repl.is_empty() { repl } else { tail };

        match combined.len() {
            0 => {
                self.tx.set_root(0)?;
                debug!("gist: tree emptied, root demoted to 0");
            }
            1 => {
                let only = &combined[0];
                if only.is_leaf() {
                    // The whole tree collapsed to a single surviving leaf;
                    // it still needs a node to live in, unlike an internal
                    // pointer which already names one.
                    let off = self.persist_new_node(std::slice::from_ref(only))?;
                    self.tx.set_root(off)?;
                } else {
                    self.tx.set_root(only.ptr)?;
                    debug!("gist: root demoted one level to offset {}", only.ptr);
                }
            }
            2 => {
                let off = self.persist_new_node(&combined)?;
                self.tx.set_root(off)?;
                debug!("gist: root promoted after delete rebalancing to offset {off}");
            }
            _ => unreachable!("delete_recursive always returns 0, 1, or 2 elements at the top"),
        }
        Ok(())
    }

    /// Returns `(replacement_elements, underflow_tail)`: the entries the
    /// caller should install in place of the pointer to `off` (0, 1, or 2),
    /// and any elements this node spilled because it underflowed and was
    /// deleted (for the caller to absorb directly).
    fn delete_recursive(
        &self,
        off: u64,
        query: &O::Predicate,
        keep_pred: &mut impl FnMut(&O::Predicate, &[u8]) -> bool,
    ) -> Result<(Vec<Element<O::Predicate>>, Vec<Element<O::Predicate>>)> {
        let node = self.read_node(off)?;
        let mut kept = Vec::with_capacity(node.len());
        let mut pending_tail: Vec<Element<O::Predicate>> = Vec::new();

        for e in node {
            if !self.op.consistent(&e.pred, query) {
                kept.push(e);
                continue;
            }
            if e.is_leaf() {
                if !keep_pred(&e.pred, &e.data) {
                    kept.push(e);
                }
                // else: matched and approved for removal, dropped.
            } else {
                if e.ptr < 16 {
                    return Err(Error::InternalCorruption(
                        "gist child pointer fell in the reserved allocator zone",
                    ));
                }
                let (child_repl, child_tail) = self.delete_recursive(e.ptr, query, keep_pred)?;
                kept.extend(child_repl);
                pending_tail.extend(child_tail);
            }
        }

        if !pending_tail.is_empty() {
            self.absorb_underflow(&mut kept, &mut pending_tail)?;
        }

        if kept.len() < 2 {
            self.tx.delete(off)?;
            return Ok((Vec::new(), kept));
        }

        let repl = self.finish_node(off, kept)?;
        Ok((repl, Vec::new()))
    }

    /// Try to merge `tail` into the last internal pointer of `kept`,
    /// splitting the sibling if that overflows it; if `kept` has no
    /// internal pointer left, materialize `tail` as a brand-new child.
    fn absorb_underflow(
        &self,
        kept: &mut Vec<Element<O::Predicate>>,
        tail: &mut Vec<Element<O::Predicate>>,
    ) -> Result<()> {
        if let Some(last_idx) = kept.iter().rposition(|e| !e.is_leaf()) {
            let sibling_off = kept[last_idx].ptr;
            let mut sibling_node = self.read_node(sibling_off)?;
            sibling_node.extend(tail.drain(..));
            let replacement = self.finish_node(sibling_off, sibling_node)?;
            let mut it = replacement.into_iter();
            kept[last_idx] = it.next().expect("finish_node always returns at least one element");
            kept.extend(it);
        } else {
            let new_off = self.persist_new_node(tail)?;
            kept.push(Element::pointer(self.op.union(&preds(tail)), new_off));
            tail.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::BlockAllocator;
    use crate::gist::bytestring::{ByteRange, ByteStringOps};
    use crate::tx::TxMode;
    use tempfile::NamedTempFile;

    fn open_alloc() -> (BlockAllocator, NamedTempFile, NamedTempFile) {
        let data = NamedTempFile::new().unwrap();
        let wal = NamedTempFile::new().unwrap();
        let alloc =
            BlockAllocator::open(data.reopen().unwrap(), Some(wal.reopen().unwrap())).unwrap();
        (alloc, data, wal)
    }

    fn collect_matches(
        gist: &Gist<'_, ByteStringOps>,
        query: &ByteRange,
    ) -> Vec<(ByteRange, Vec<u8>)> {
        let mut hits = Vec::new();
        let token = CancelToken::new();
        gist.search(query, &token, &mut |p, d| hits.push((p.clone(), d.to_vec())))
            .unwrap();
        hits
    }

    #[test]
    fn insert_then_search_finds_exact_match() {
        let (alloc, _d, _w) = open_alloc();
        let tx = Tx::begin(&alloc, TxMode::Write).unwrap();
        let gist = Gist::new(tx, ByteStringOps, GistOptions::default());

        gist.insert(ByteRange::point(b"apple".to_vec()), b"fruit".to_vec())
            .unwrap();
        gist.insert(ByteRange::point(b"carrot".to_vec()), b"veg".to_vec())
            .unwrap();

        let hits = collect_matches(&gist, &ByteRange::point(b"apple".to_vec()));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1, b"fruit");

        gist.commit().unwrap();
    }

    #[test]
    fn split_keeps_every_inserted_key_reachable() {
        let (alloc, _d, _w) = open_alloc();
        let tx = Tx::begin(&alloc, TxMode::Write).unwrap();
        let gist = Gist::new(
            tx,
            ByteStringOps,
            GistOptions { branching_factor: 3 },
        );

        let keys: Vec<Vec<u8>> = (0..20).map(|i| format!("key-{i:03}").into_bytes()).collect();
        for k in &keys {
            gist.insert(ByteRange::point(k.clone()), k.clone()).unwrap();
        }

        for k in &keys {
            let hits = collect_matches(&gist, &ByteRange::point(k.clone()));
            assert!(
                hits.iter().any(|(_, d)| d == k),
                "key {k:?} should be findable after splits"
            );
        }

        gist.commit().unwrap();
    }

    #[test]
    fn delete_removes_only_matching_entries() {
        let (alloc, _d, _w) = open_alloc();
        let tx = Tx::begin(&alloc, TxMode::Write).unwrap();
        let gist = Gist::new(tx, ByteStringOps, GistOptions::default());

        gist.insert(ByteRange::point(b"a".to_vec()), b"1".to_vec()).unwrap();
        gist.insert(ByteRange::point(b"b".to_vec()), b"2".to_vec()).unwrap();
        gist.insert(ByteRange::point(b"c".to_vec()), b"3".to_vec()).unwrap();

        gist.delete(&ByteRange::point(b"b".to_vec()), |_, _| true).unwrap();

        assert!(collect_matches(&gist, &ByteRange::point(b"a".to_vec())).len() == 1);
        assert!(collect_matches(&gist, &ByteRange::point(b"b".to_vec())).is_empty());
        assert!(collect_matches(&gist, &ByteRange::point(b"c".to_vec())).len() == 1);

        gist.commit().unwrap();
    }

    #[test]
    fn deleting_every_element_empties_the_root() {
        let (alloc, _d, _w) = open_alloc();
        let tx = Tx::begin(&alloc, TxMode::Write).unwrap();
        let gist = Gist::new(tx, ByteStringOps, GistOptions::default());

        gist.insert(ByteRange::point(b"only".to_vec()), b"value".to_vec())
            .unwrap();
        gist.delete(&ByteRange::point(b"only".to_vec()), |_, _| true)
            .unwrap();

        assert_eq!(gist.tx.get_root().unwrap(), 0);
        gist.commit().unwrap();
    }

    #[test]
    fn cancelled_token_aborts_search() {
        let (alloc, _d, _w) = open_alloc();
        let tx = Tx::begin(&alloc, TxMode::Write).unwrap();
        let gist = Gist::new(tx, ByteStringOps, GistOptions::default());
        gist.insert(ByteRange::point(b"x".to_vec()), b"y".to_vec()).unwrap();

        let token = CancelToken::new();
        token.cancel();
        let mut hits = Vec::new();
        let result = gist.search(&ByteRange::point(b"x".to_vec()), &token, &mut |p, d| {
            hits.push((p.clone(), d.to_vec()))
        });
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(hits.is_empty());
    }

    #[test]
    fn root_survives_reopen_via_read_committed_tx() {
        let (alloc, _d, _w) = open_alloc();
        {
            let tx = Tx::begin(&alloc, TxMode::Write).unwrap();
            let gist = Gist::new(tx, ByteStringOps, GistOptions::default());
            gist.insert(ByteRange::point(b"durable".to_vec()), b"value".to_vec())
                .unwrap();
            gist.commit().unwrap();
        }

        let tx = Tx::begin(&alloc, TxMode::ReadCommitted).unwrap();
        let gist = Gist::new(tx, ByteStringOps, GistOptions::default());
        let hits = collect_matches(&gist, &ByteRange::point(b"durable".to_vec()));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1, b"value");
    }
}

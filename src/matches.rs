//! Match records and per-string match lists.
//!
//! A [`Match`] lives in the per-scan match arena and is linked into exactly
//! one [`MatchList`] by its intrusive `next` id. Each string carries two
//! lists per scan: confirmed matches, which the evaluator reads, and
//! unconfirmed matches, which hold leading hex-chain segments awaiting a
//! gap-consistent tail. Appends are O(1) through the tail id.

use crate::arena::{Arena, NIL};
use crate::errors::ScanError;

/// Longest matched-data snapshot stored per match.
pub const MAX_MATCH_DATA: usize = 512;

/// Confirmed matches recorded per string before overflow is reported.
pub const MAX_STRING_MATCHES: u32 = 1_000_000;

/// One verified (or chain-pending) occurrence of a string in the scanned
/// address space.
#[derive(Debug)]
pub struct Match {
    /// Offset in the logical address space (block base + in-block offset).
    pub offset: u64,
    /// Match length in bytes of the scanned representation.
    pub length: u32,
    /// XOR key the input was decoded with; zero for plain matches.
    pub xor_key: u8,
    /// Bounded snapshot of the matched bytes, at most [`MAX_MATCH_DATA`].
    pub data: Box<[u8]>,
    pub(crate) next: u32,
}

impl Match {
    pub(crate) fn new(offset: u64, length: u32, xor_key: u8, window: &[u8]) -> Self {
        let take = window.len().min(MAX_MATCH_DATA);
        Self {
            offset,
            length,
            xor_key,
            data: window[..take].into(),
            next: NIL,
        }
    }

    /// Exclusive end offset in the logical address space.
    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + u64::from(self.length)
    }
}

/// Intrusive FIFO of match ids with head/tail and a count.
#[derive(Clone, Copy, Debug)]
pub(crate) struct MatchList {
    head: u32,
    tail: u32,
    count: u32,
}

impl MatchList {
    pub(crate) const fn new() -> Self {
        Self {
            head: NIL,
            tail: NIL,
            count: 0,
        }
    }

    /// Allocates `m` in `arena` and appends it, returning the new id.
    pub(crate) fn append(&mut self, arena: &mut Arena<Match>, m: Match) -> Result<u32, ScanError> {
        debug_assert!(m.next == NIL);
        let id = arena.alloc(m)?;
        if self.tail == NIL {
            self.head = id;
        } else {
            arena.get_mut(self.tail).next = id;
        }
        self.tail = id;
        self.count += 1;
        Ok(id)
    }

    /// Resets the list to empty; records stay in the arena.
    pub(crate) fn clear(&mut self) {
        self.head = NIL;
        self.tail = NIL;
        self.count = 0;
    }

    #[inline]
    pub(crate) fn count(&self) -> u32 {
        self.count
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub(crate) fn iter<'a>(&self, arena: &'a Arena<Match>) -> MatchIter<'a> {
        MatchIter {
            arena,
            cur: self.head,
        }
    }
}

pub(crate) struct MatchIter<'a> {
    arena: &'a Arena<Match>,
    cur: u32,
}

impl<'a> Iterator for MatchIter<'a> {
    type Item = &'a Match;

    fn next(&mut self) -> Option<&'a Match> {
        if self.cur == NIL {
            return None;
        }
        let m = self.arena.get(self.cur);
        self.cur = m.next;
        Some(m)
    }
}

/// Per-string transient match state, held in the scan context's side table.
#[derive(Clone, Copy, Debug)]
pub(crate) struct StringMatchState {
    pub matches: MatchList,
    pub unconfirmed: MatchList,
    /// Set once the overflow event for this string has been emitted.
    pub overflowed: bool,
}

impl StringMatchState {
    pub(crate) const fn new() -> Self {
        Self {
            matches: MatchList::new(),
            unconfirmed: MatchList::new(),
            overflowed: false,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.matches.clear();
        self.unconfirmed.clear();
        self.overflowed = false;
    }

    /// True when neither list has seen a match yet.
    #[inline]
    pub(crate) fn untouched(&self) -> bool {
        self.matches.is_empty() && self.unconfirmed.is_empty()
    }
}

//! Transient per-scan state.
//!
//! A [`ScanContext`] lives for exactly one `scan_*` call. It owns the match
//! arena, the matching-strings log, the per-entity side tables (string match
//! lists, rule match flags, namespace global-gate flags), and the
//! module-object table the evaluator reads externals through. Nothing in the
//! shared ruleset is written during a scan; everything transient is here and
//! is torn down before the scan slot is released.

use std::time::{Duration, Instant};

use ahash::AHashMap;

use crate::arena::Arena;
use crate::errors::ScanError;
use crate::matches::{Match, StringMatchState};
use crate::ruleset::{ExternalValue, Ruleset, StringId};

/// Initial chunk capacity of the match arena.
const MATCHES_ARENA_CHUNK: usize = 1024;
/// Initial chunk capacity of the matching-strings log.
const MATCHING_LOG_CHUNK: usize = 8;
/// Initial bucket count of the module-object table.
const OBJECTS_TABLE_CAPACITY: usize = 64;

pub(crate) struct ScanContext<'r> {
    pub(crate) ruleset: &'r Ruleset,
    pub(crate) flags: u32,
    pub(crate) deadline: Option<Instant>,
    /// Owns every match record produced by this scan.
    pub(crate) matches: Arena<Match>,
    /// Stable log of strings that acquired their first match, walked at
    /// teardown to reset exactly the touched side-table entries.
    pub(crate) matching_log: Arena<StringId>,
    pub(crate) strings: Vec<StringMatchState>,
    pub(crate) rule_matched: Vec<bool>,
    pub(crate) ns_unsatisfied: Vec<bool>,
    /// Identifier-keyed objects materialized from external variables.
    pub(crate) objects: AHashMap<String, ExternalValue>,
    /// First block's size; undefined when the block list is empty.
    pub(crate) file_size: Option<u64>,
    /// Entry-point offset (buffer scans) or address (process scans), when
    /// the first block parses as an executable.
    pub(crate) entry_point: Option<u64>,
    /// Per-string confirmed-match cap; lowered only by tests.
    pub(crate) max_string_matches: u32,
}

impl<'r> ScanContext<'r> {
    pub(crate) fn new(ruleset: &'r Ruleset, flags: u32, timeout: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            ruleset,
            flags,
            deadline: timeout.map(|t| now + t),
            matches: Arena::with_chunk_capacity(MATCHES_ARENA_CHUNK),
            matching_log: Arena::with_chunk_capacity(MATCHING_LOG_CHUNK),
            strings: vec![StringMatchState::new(); ruleset.strings.len()],
            rule_matched: vec![false; ruleset.rules.len()],
            ns_unsatisfied: vec![false; ruleset.namespaces.len()],
            objects: AHashMap::with_capacity(OBJECTS_TABLE_CAPACITY),
            file_size: None,
            entry_point: None,
            max_string_matches: crate::matches::MAX_STRING_MATCHES,
        }
    }

    /// Fails with `ScanTimeout` once the deadline has passed.
    #[inline]
    pub(crate) fn check_deadline(&self) -> Result<(), ScanError> {
        match self.deadline {
            Some(deadline) if Instant::now() > deadline => Err(ScanError::ScanTimeout),
            _ => Ok(()),
        }
    }

    /// Records `id` in the matching-strings log the first time either of its
    /// lists goes from empty to non-empty. Must be called before appending.
    pub(crate) fn log_first_match(&mut self, id: StringId) -> Result<(), ScanError> {
        if self.strings[id.index()].untouched() {
            self.matching_log.alloc(id)?;
        }
        Ok(())
    }

    /// Resets every transient mark this scan left: match lists of touched
    /// strings, rule match flags, and namespace global gates. Runs on every
    /// exit path before the slot is released.
    pub(crate) fn clear_match_state(&mut self) {
        let mut id = if self.matching_log.is_empty() {
            crate::arena::NIL
        } else {
            0
        };
        while id != crate::arena::NIL {
            let sid = *self.matching_log.get(id);
            self.strings[sid.index()].clear();
            id = self.matching_log.next_id(id);
        }
        self.rule_matched.fill(false);
        self.ns_unsatisfied.fill(false);
    }
}

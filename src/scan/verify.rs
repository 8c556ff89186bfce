//! Candidate verification: from automaton hit to recorded match.
//!
//! The automaton only guarantees that some atom variant occurred; this module
//! re-checks the full candidate window under the string's modifiers (ascii /
//! wide forms, case folding, XOR key, mask bytes, fullword boundaries,
//! offset anchors, regex tails) and records the result in the per-scan match
//! lists.
//!
//! Hex chains: a leading segment's match goes to the unconfirmed list. When
//! the tail segment verifies, the chain is resolved backwards through the
//! unconfirmed lists; a gap-consistent path promotes the full span into the
//! tail string's confirmed list. Chains do not cross block boundaries.

use crate::automaton::AcMatch;
use crate::matches::Match;
use crate::ruleset::{
    Pattern, StringId, STRING_FLAG_CHAIN_PART, STRING_FLAG_FULLWORD, STRING_FLAG_NOCASE,
    STRING_FLAG_REGEXP,
};
use crate::scan::context::ScanContext;
use crate::scan::{CallbackAction, Interrupt, ScanEvent, SCAN_FLAGS_FAST_MODE};

/// Verifies one automaton candidate and records any resulting match.
///
/// `offset` is the candidate start within `data`; `base` is the block's
/// logical base address.
pub(crate) fn verify_match<F>(
    ctx: &mut ScanContext<'_>,
    cb: &mut F,
    ac: AcMatch,
    data: &[u8],
    base: u64,
    offset: usize,
) -> Result<(), Interrupt>
where
    F: FnMut(ScanEvent<'_>) -> CallbackAction,
{
    let rs = ctx.ruleset;
    let sid = ac.string;
    let pat = rs.string(sid);
    let state = &ctx.strings[sid.index()];

    if state.overflowed {
        return Ok(());
    }
    if ctx.flags & SCAN_FLAGS_FAST_MODE != 0
        && !pat.has(STRING_FLAG_CHAIN_PART)
        && state.matches.count() > 0
    {
        return Ok(());
    }

    let logical = base + offset as u64;
    if pat.chained_to.is_none() && !anchors_allow(pat, logical) {
        return Ok(());
    }

    let length = if pat.has(STRING_FLAG_REGEXP) {
        verify_regex(pat, data, offset)
    } else {
        verify_literal(pat, ac, data, offset)
    };
    let Some(length) = length else {
        return Ok(());
    };

    if pat.has(STRING_FLAG_FULLWORD) && !fullword_ok(ac, data, offset, length as usize) {
        return Ok(());
    }

    if pat.has(STRING_FLAG_CHAIN_PART) {
        // Leading chain segment: park it until a tail arrives.
        ctx.log_first_match(sid).map_err(Interrupt::Fail)?;
        let m = Match::new(logical, length, ac.xor_key(), &data[offset..offset + length as usize]);
        ctx.strings[sid.index()]
            .unconfirmed
            .append(&mut ctx.matches, m)
            .map_err(Interrupt::Fail)?;
        return Ok(());
    }

    if let Some(prev) = pat.chained_to {
        // Chain tail: promote the full span when a consistent path exists
        // inside this block.
        let Some(start) = resolve_chain(ctx, prev, pat.gap, logical) else {
            return Ok(());
        };
        if start < base || !anchors_allow(pat, start) {
            return Ok(());
        }
        let full_len = (logical - start) as u32 + length;
        let window_start = (start - base) as usize;
        let window = &data[window_start..offset + length as usize];
        return record_confirmed(ctx, cb, sid, start, full_len, ac.xor_key(), window);
    }

    let window = &data[offset..offset + length as usize];
    record_confirmed(ctx, cb, sid, logical, length, ac.xor_key(), window)
}

fn anchors_allow(pat: &Pattern, logical: u64) -> bool {
    if let Some(at) = pat.fixed_offset {
        return logical == at;
    }
    if let Some((lo, hi)) = pat.bounds {
        return logical >= lo && logical <= hi;
    }
    true
}

/// Byte-level verification of literal and hex patterns. Returns the match
/// length in the scanned representation.
fn verify_literal(pat: &Pattern, ac: AcMatch, data: &[u8], offset: usize) -> Option<u32> {
    let lit = &pat.literal;
    let key = ac.xor_key();
    let nocase = pat.has(STRING_FLAG_NOCASE);

    if ac.is_wide() {
        let need = lit.len() * 2;
        if offset + need > data.len() {
            return None;
        }
        for (i, &want) in lit.iter().enumerate() {
            let lo = data[offset + 2 * i] ^ key;
            let hi = data[offset + 2 * i + 1] ^ key;
            if hi != 0 || !byte_eq(lo, want, nocase) {
                return None;
            }
        }
        Some(need as u32)
    } else {
        if offset + lit.len() > data.len() {
            return None;
        }
        for (i, &want) in lit.iter().enumerate() {
            let got = data[offset + i] ^ key;
            let mask = pat.mask.get(i).copied().unwrap_or(0xFF);
            if mask != 0xFF {
                if got & mask != want {
                    return None;
                }
            } else if !byte_eq(got, want, nocase) {
                return None;
            }
        }
        Some(lit.len() as u32)
    }
}

#[inline]
fn byte_eq(got: u8, want: u8, nocase: bool) -> bool {
    if nocase {
        got.eq_ignore_ascii_case(&want)
    } else {
        got == want
    }
}

/// Runs the regex tail anchored at the candidate start.
fn verify_regex(pat: &Pattern, data: &[u8], offset: usize) -> Option<u32> {
    let re = pat.regex.as_ref()?;
    let m = re.find_at(data, offset)?;
    if m.start() != offset {
        return None;
    }
    Some((m.end() - m.start()) as u32)
}

/// Word-boundary check on both sides of the candidate, in the hit's
/// encoding (wide boundaries are two-byte, XOR is undone first).
fn fullword_ok(ac: AcMatch, data: &[u8], offset: usize, length: usize) -> bool {
    let key = ac.xor_key();
    let word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    let end = offset + length;

    if ac.is_wide() {
        if offset >= 2 && data[offset - 1] ^ key == 0 && word(data[offset - 2] ^ key) {
            return false;
        }
        if end + 1 < data.len() && data[end + 1] ^ key == 0 && word(data[end] ^ key) {
            return false;
        }
    } else {
        if offset > 0 && word(data[offset - 1] ^ key) {
            return false;
        }
        if end < data.len() && word(data[end] ^ key) {
            return false;
        }
    }
    true
}

/// Walks chain segments backwards through unconfirmed lists, looking for a
/// gap-consistent path. Returns the full-match start offset.
///
/// Unconfirmed entries are in scan order, so the first complete path found
/// starts earliest.
fn resolve_chain(
    ctx: &ScanContext<'_>,
    prev: StringId,
    gap: (u32, u32),
    seg_start: u64,
) -> Option<u64> {
    let pat = ctx.ruleset.string(prev);
    let state = &ctx.strings[prev.index()];
    for m in state.unconfirmed.iter(&ctx.matches) {
        if m.end() > seg_start {
            continue;
        }
        let dist = seg_start - m.end();
        if dist < u64::from(gap.0) || dist > u64::from(gap.1) {
            continue;
        }
        match pat.chained_to {
            None => return Some(m.offset),
            Some(pp) => {
                if let Some(start) = resolve_chain(ctx, pp, pat.gap, m.offset) {
                    return Some(start);
                }
            }
        }
    }
    None
}

/// Appends a confirmed match, maintaining the first-match log and the
/// per-string overflow cap.
fn record_confirmed<F>(
    ctx: &mut ScanContext<'_>,
    cb: &mut F,
    sid: StringId,
    offset: u64,
    length: u32,
    xor_key: u8,
    window: &[u8],
) -> Result<(), Interrupt>
where
    F: FnMut(ScanEvent<'_>) -> CallbackAction,
{
    if ctx.strings[sid.index()].matches.count() >= ctx.max_string_matches {
        ctx.strings[sid.index()].overflowed = true;
        let pat = ctx.ruleset.string(sid);
        return match cb(ScanEvent::TooManyMatches(pat)) {
            CallbackAction::Continue => Ok(()),
            CallbackAction::Abort => Err(Interrupt::Abort),
            CallbackAction::Error => Err(Interrupt::Fail(crate::errors::ScanError::CallbackError)),
        };
    }
    ctx.log_first_match(sid).map_err(Interrupt::Fail)?;
    let m = Match::new(offset, length, xor_key, window);
    ctx.strings[sid.index()]
        .matches
        .append(&mut ctx.matches, m)
        .map_err(Interrupt::Fail)?;
    Ok(())
}

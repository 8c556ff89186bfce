//! Automaton walk over one memory block.
//!
//! At each input position the current state's accept records are emitted
//! (candidates whose backtrack would not underflow the block), then the
//! transition for the next byte is consumed. A final drain at the terminal
//! state reports patterns ending on the last byte. The deadline is probed
//! every [`TIMEOUT_CHECK_BYTES`] positions so a never-matching input over a
//! huge block still times out promptly.

use crate::automaton::AC_ROOT_STATE;
use crate::scan::blocks::MemoryBlock;
use crate::scan::context::ScanContext;
use crate::scan::verify::verify_match;
use crate::scan::{CallbackAction, Interrupt, ScanEvent};

/// Input bytes between deadline checks.
pub(crate) const TIMEOUT_CHECK_BYTES: usize = 4096;

/// Scans one block, verifying candidates into the context's match lists.
pub(crate) fn scan_block<F>(
    ctx: &mut ScanContext<'_>,
    cb: &mut F,
    block: MemoryBlock<'_>,
) -> Result<(), Interrupt>
where
    F: FnMut(ScanEvent<'_>) -> CallbackAction,
{
    let auto = &ctx.ruleset.automaton;
    let data = block.data;
    let mut state = AC_ROOT_STATE;
    let mut i = 0usize;

    while i < data.len() {
        if i % TIMEOUT_CHECK_BYTES == 0 {
            ctx.check_deadline().map_err(Interrupt::Fail)?;
        }
        for m in auto.matches_at(state) {
            let backtrack = m.backtrack as usize;
            if backtrack <= i {
                verify_match(ctx, cb, m, data, block.base, i - backtrack)?;
            }
        }
        state = auto.step(state, data[i]);
        i += 1;
    }

    // Residual accepts at the terminal state.
    for m in auto.matches_at(state) {
        let backtrack = m.backtrack as usize;
        if backtrack <= i {
            verify_match(ctx, cb, m, data, block.base, i - backtrack)?;
        }
    }
    Ok(())
}

//! Scan orchestration: entry points, slot discipline, and the report phase.
//!
//! `scan_blocks` is the central driver; the other entry points adapt their
//! source (buffer, mapped file, process regions) into a block sequence and
//! delegate. Protocol per scan:
//!
//! 1. Reserve a scan slot from the ruleset bitmask (admission control).
//! 2. Build the transient context (arenas, side tables, objects table).
//! 3. Materialize external variables as module objects, announcing each
//!    through the callback.
//! 4. Probe the first block for an entry point; failures stay silent.
//! 5. Walk every block through the automaton scanner.
//! 6. Evaluate the condition program.
//! 7. Report each non-private rule in declaration order, then emit the
//!    terminal finished event (unless the callback aborted).
//! 8. Tear down: reset touched side-table state, drop the context, release
//!    the slot. Teardown runs on every exit path; the slot release is
//!    `Drop`-backed so even a panicking callback cannot leak it.

pub(crate) mod ac_scan;
pub(crate) mod blocks;
pub(crate) mod context;
pub(crate) mod verify;

use std::fs::File;
use std::io;
use std::path::Path;
use std::time::Duration;

use memmap2::Mmap;

use crate::errors::ScanError;
use crate::ruleset::{Pattern, Rule, Ruleset};
use crate::vm;
use context::ScanContext;

pub use blocks::MemoryBlock;

/// Stop collecting matches for a string once it has one confirmed match.
pub const SCAN_FLAGS_FAST_MODE: u32 = 1 << 0;
/// The block list is process memory; bases are virtual addresses and the
/// entry-point probe yields an address instead of a file offset.
pub const SCAN_FLAGS_PROCESS_MEMORY: u32 = 1 << 1;

/// Verdict returned by the scan callback for each event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackAction {
    /// Keep going.
    Continue,
    /// Stop the scan; the scan still returns success.
    Abort,
    /// Stop the scan with [`ScanError::CallbackError`].
    Error,
}

/// Events delivered to the scan callback.
///
/// During the report phase every non-private rule produces exactly one
/// `RuleMatching` or `RuleNotMatching` in declaration order, followed by one
/// `ScanFinished`. The module events bracket external-variable
/// materialization before any block is read; `TooManyMatches` may arrive at
/// any point during block scanning.
#[derive(Debug)]
pub enum ScanEvent<'r> {
    RuleMatching(&'r Rule),
    RuleNotMatching(&'r Rule),
    ImportModule(&'r str),
    ModuleImported(&'r str),
    TooManyMatches(&'r Pattern),
    ScanFinished,
}

/// Internal scan control flow: hard failure or cooperative abort.
#[derive(Debug)]
pub(crate) enum Interrupt {
    Fail(ScanError),
    Abort,
}

/// Releases the scan slot when dropped, after all other context state.
struct SlotGuard<'r> {
    ruleset: &'r Ruleset,
    slot: u32,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.ruleset.release_slot(self.slot);
    }
}

impl Ruleset {
    /// Scans a single in-memory buffer.
    pub fn scan_memory<F>(
        &self,
        data: &[u8],
        flags: u32,
        timeout: Option<Duration>,
        callback: F,
    ) -> Result<(), ScanError>
    where
        F: FnMut(ScanEvent<'_>) -> CallbackAction,
    {
        self.scan_blocks(MemoryBlock::single(data), flags, timeout, callback)
    }

    /// Memory-maps a file and scans it.
    pub fn scan_file<F>(
        &self,
        path: &Path,
        flags: u32,
        timeout: Option<Duration>,
        callback: F,
    ) -> Result<(), ScanError>
    where
        F: FnMut(ScanEvent<'_>) -> CallbackAction,
    {
        let file = File::open(path).map_err(ScanError::CouldNotOpenFile)?;
        self.scan_file_handle(&file, flags, timeout, callback)
    }

    /// Scans an already-open file through a private mapping.
    pub fn scan_file_handle<F>(
        &self,
        file: &File,
        flags: u32,
        timeout: Option<Duration>,
        callback: F,
    ) -> Result<(), ScanError>
    where
        F: FnMut(ScanEvent<'_>) -> CallbackAction,
    {
        let len = file
            .metadata()
            .map_err(|_| ScanError::CouldNotMapFile)?
            .len();
        if len == 0 {
            // Zero-length mappings are rejected by the OS; an empty file is
            // just an empty buffer.
            return self.scan_memory(&[], flags, timeout, callback);
        }
        // SAFETY: the mapping is read-only and lives only for this call.
        // A concurrent truncation of the underlying file by another process
        // is the caller's race to avoid, as with any mapped scan source.
        let map = unsafe { Mmap::map(file) }.map_err(|_| ScanError::CouldNotMapFile)?;
        self.scan_memory(&map, flags, timeout, callback)
    }

    /// Enumerates a live process's readable regions and scans them.
    ///
    /// Region data is copied out via syscalls that return errors instead of
    /// faulting, and is freed when the scan returns.
    #[cfg(target_os = "linux")]
    pub fn scan_process<F>(
        &self,
        pid: i32,
        flags: u32,
        timeout: Option<Duration>,
        callback: F,
    ) -> Result<(), ScanError>
    where
        F: FnMut(ScanEvent<'_>) -> CallbackAction,
    {
        let regions = crate::process::read_process_memory(pid)?;
        self.scan_blocks(
            regions.iter().map(|r| Ok(r.as_block())),
            flags | SCAN_FLAGS_PROCESS_MEMORY,
            timeout,
            callback,
        )
    }

    /// Scans a sequence of memory blocks. This is the central driver all
    /// other entry points delegate to.
    ///
    /// A block source may yield `Err` for a block it cannot fetch; the scan
    /// then fails with [`ScanError::CouldNotMapFile`] after teardown.
    pub fn scan_blocks<'a, I, F>(
        &self,
        blocks: I,
        flags: u32,
        timeout: Option<Duration>,
        mut callback: F,
    ) -> Result<(), ScanError>
    where
        I: IntoIterator<Item = io::Result<MemoryBlock<'a>>>,
        F: FnMut(ScanEvent<'_>) -> CallbackAction,
    {
        let slot = self.acquire_slot()?;
        let guard = SlotGuard {
            ruleset: self,
            slot,
        };
        let mut ctx = ScanContext::new(self, flags, timeout);

        let outcome = run_scan(&mut ctx, blocks, &mut callback);

        // Mandatory teardown, on every exit path.
        ctx.clear_match_state();
        drop(ctx);
        drop(guard);

        match outcome {
            Ok(()) | Err(Interrupt::Abort) => Ok(()),
            Err(Interrupt::Fail(err)) => Err(err),
        }
    }
}

fn handle(action: CallbackAction) -> Result<(), Interrupt> {
    match action {
        CallbackAction::Continue => Ok(()),
        CallbackAction::Abort => Err(Interrupt::Abort),
        CallbackAction::Error => Err(Interrupt::Fail(ScanError::CallbackError)),
    }
}

fn run_scan<'a, I, F>(ctx: &mut ScanContext<'_>, blocks: I, cb: &mut F) -> Result<(), Interrupt>
where
    I: IntoIterator<Item = io::Result<MemoryBlock<'a>>>,
    F: FnMut(ScanEvent<'_>) -> CallbackAction,
{
    let rs = ctx.ruleset;

    // Materialize external variables as module objects.
    for ext in rs.externals() {
        handle(cb(ScanEvent::ImportModule(ext.identifier())))?;
        ctx.objects
            .insert(ext.identifier().to_owned(), ext.value().clone());
        handle(cb(ScanEvent::ModuleImported(ext.identifier())))?;
    }

    let mut first = true;
    for item in blocks {
        let block = item.map_err(|_| Interrupt::Fail(ScanError::CouldNotMapFile))?;
        if first {
            first = false;
            ctx.file_size = Some(block.data.len() as u64);
            ctx.entry_point = if ctx.flags & SCAN_FLAGS_PROCESS_MEMORY != 0 {
                crate::entrypoint::entry_point_address(block.data, block.base)
            } else {
                crate::entrypoint::entry_point_offset(block.data)
            };
        }
        ac_scan::scan_block(ctx, cb, block)?;
    }

    vm::execute(ctx).map_err(Interrupt::Fail)?;

    for (idx, rule) in rs.rules().iter().enumerate() {
        if rule.is_private() {
            continue;
        }
        let matched = ctx.rule_matched[idx] && !ctx.ns_unsatisfied[rule.namespace().index()];
        let event = if matched {
            ScanEvent::RuleMatching(rule)
        } else {
            ScanEvent::RuleNotMatching(rule)
        };
        handle(cb(event))?;
    }

    // Terminal event; its verdict is not consulted.
    let _ = cb(ScanEvent::ScanFinished);
    Ok(())
}

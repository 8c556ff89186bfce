//! Scan core of a rule-based byte-pattern engine.
//!
//! A compiled [`Ruleset`] — string patterns, condition bytecode, and a
//! packed Aho-Corasick automaton, frozen behind one container — is scanned
//! against buffers, files, or live process memory. Every rule reports
//! match or no-match through an event callback.
//!
//! Scan flow (one `scan_*` call):
//! 1. Reserve a scan slot on the ruleset (bounded concurrent reentrancy).
//! 2. Walk each memory block through the automaton; verify candidate hits
//!    under the string's modifiers and record matches in per-scan lists.
//! 3. Evaluate every rule's condition over the recorded match state.
//! 4. Report rules in declaration order, then tear down all transient state.
//!
//! The ruleset itself is never written during a scan, so one loaded ruleset
//! serves any number of threads up to [`MAX_SCAN_SLOTS`].
//!
//! ```
//! use vigil::{CallbackAction, Cond, PatternSpec, RuleDef, RulesetBuilder, ScanEvent};
//!
//! let mut builder = RulesetBuilder::new();
//! builder
//!     .add_rule(
//!         RuleDef::new("greeting")
//!             .string("$a", PatternSpec::text(b"hello").nocase())
//!             .condition(Cond::string("$a")),
//!     )
//!     .unwrap();
//! let rules = builder.build().unwrap();
//!
//! let mut matched = Vec::new();
//! rules
//!     .scan_memory(b"xx HELLO xx", 0, None, |event| {
//!         if let ScanEvent::RuleMatching(rule) = event {
//!             matched.push(rule.identifier().to_owned());
//!         }
//!         CallbackAction::Continue
//!     })
//!     .unwrap();
//! assert_eq!(matched, ["greeting"]);
//! ```

mod arena;
mod automaton;
mod bytecode;
mod entrypoint;
mod errors;
mod matches;
#[cfg(target_os = "linux")]
mod process;
mod ruleset;
mod scan;
mod vm;

pub use errors::ScanError;
pub use matches::{Match, MAX_MATCH_DATA, MAX_STRING_MATCHES};
pub use ruleset::{
    CmpOp, Cond, ExternalValue, ExternalVariable, HexToken, Namespace, NamespaceId, Pattern,
    PatternSpec, Rule, RuleDef, RuleId, Ruleset, RulesetBuilder, StringId, MAX_SCAN_SLOTS,
    RULE_FLAG_GLOBAL, RULE_FLAG_PRIVATE,
};
pub use scan::{
    CallbackAction, MemoryBlock, ScanEvent, SCAN_FLAGS_FAST_MODE, SCAN_FLAGS_PROCESS_MEMORY,
};

//! The frozen ruleset container.
//!
//! A [`Ruleset`] is an immutable-after-build bundle: namespace, rule, and
//! string records, the external-variable list, the condition bytecode, and
//! the packed automaton tables. Records reference each other through dense
//! ids, so the container can be serialized without pointer fix-ups and shared
//! across scan threads without interior writes. The only mutable shared
//! field is the scan-slot bitmask behind its mutex.
//!
//! Construction goes through [`builder::RulesetBuilder`]; persistence lives
//! in `wire`.

pub(crate) mod builder;
pub(crate) mod wire;

use std::sync::Mutex;

use crate::automaton::Automaton;
use crate::errors::ScanError;

pub use builder::{CmpOp, Cond, HexToken, PatternSpec, RuleDef, RulesetBuilder};

/// Concurrent scans a single ruleset admits.
pub const MAX_SCAN_SLOTS: u32 = 32;

/// Rule flag: never reported through the callback.
pub const RULE_FLAG_PRIVATE: u32 = 1 << 0;
/// Rule flag: a non-match disqualifies every rule in its namespace.
pub const RULE_FLAG_GLOBAL: u32 = 1 << 1;

pub(crate) const STRING_FLAG_ASCII: u32 = 1 << 0;
pub(crate) const STRING_FLAG_WIDE: u32 = 1 << 1;
pub(crate) const STRING_FLAG_NOCASE: u32 = 1 << 2;
pub(crate) const STRING_FLAG_FULLWORD: u32 = 1 << 3;
pub(crate) const STRING_FLAG_REGEXP: u32 = 1 << 4;
pub(crate) const STRING_FLAG_HEX: u32 = 1 << 5;
pub(crate) const STRING_FLAG_XOR: u32 = 1 << 6;
/// Hidden leading segment of a hex chain; matches are unconfirmed until a
/// gap-consistent tail promotes the full span.
pub(crate) const STRING_FLAG_CHAIN_PART: u32 = 1 << 7;

/// Index of a rule in declaration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RuleId(pub(crate) u32);

/// Index of a string record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StringId(pub(crate) u32);

/// Index of a namespace record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NamespaceId(pub(crate) u32);

impl RuleId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl StringId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl NamespaceId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// A rule record: identifier, owning namespace, its contiguous string span,
/// condition code offset, and flags.
#[derive(Debug)]
pub struct Rule {
    pub(crate) identifier: String,
    pub(crate) namespace: NamespaceId,
    pub(crate) strings_start: u32,
    pub(crate) strings_end: u32,
    pub(crate) code_offset: u32,
    pub(crate) flags: u32,
}

impl Rule {
    /// The rule's declared identifier.
    #[inline]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// The id of the namespace this rule belongs to.
    #[inline]
    pub fn namespace(&self) -> NamespaceId {
        self.namespace
    }

    #[inline]
    pub fn is_private(&self) -> bool {
        self.flags & RULE_FLAG_PRIVATE != 0
    }

    #[inline]
    pub fn is_global(&self) -> bool {
        self.flags & RULE_FLAG_GLOBAL != 0
    }
}

/// A namespace record. Rules belong to exactly one namespace.
#[derive(Debug)]
pub struct Namespace {
    pub(crate) name: String,
}

impl Namespace {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A string record: pattern bytes, modifier flags, anchors, and chain links.
///
/// `literal` holds the declared bytes for literal and hex strings; for hex
/// strings `mask` carries one mask byte per literal byte (`0xFF` concrete).
/// Regex strings keep their source for recompilation at load time.
#[derive(Debug)]
pub struct Pattern {
    pub(crate) identifier: String,
    pub(crate) flags: u32,
    pub(crate) literal: Vec<u8>,
    pub(crate) mask: Vec<u8>,
    pub(crate) regex_src: Option<String>,
    pub(crate) regex: Option<regex::bytes::Regex>,
    pub(crate) fixed_offset: Option<u64>,
    pub(crate) bounds: Option<(u64, u64)>,
    pub(crate) xor: Option<(u8, u8)>,
    pub(crate) rule: RuleId,
    /// Previous segment of a hex chain, if any.
    pub(crate) chained_to: Option<StringId>,
    /// Allowed distance range between the previous segment's end and this
    /// segment's start.
    pub(crate) gap: (u32, u32),
}

impl Pattern {
    /// The string's declared identifier (e.g. `$a`). Hidden chain segments
    /// share their tail's identifier.
    #[inline]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    #[inline]
    pub(crate) fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

/// A typed external-variable value.
#[derive(Clone, Debug, PartialEq)]
pub enum ExternalValue {
    Integer(i64),
    Float(f64),
    Boolean(bool),
    String(String),
}

/// An external-variable record: identifier plus current value.
#[derive(Debug)]
pub struct ExternalVariable {
    pub(crate) identifier: String,
    pub(crate) value: ExternalValue,
}

impl ExternalVariable {
    #[inline]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    #[inline]
    pub fn value(&self) -> &ExternalValue {
        &self.value
    }
}

/// A frozen, shareable compiled ruleset.
#[derive(Debug)]
pub struct Ruleset {
    pub(crate) namespaces: Vec<Namespace>,
    pub(crate) rules: Vec<Rule>,
    pub(crate) strings: Vec<Pattern>,
    pub(crate) externals: Vec<ExternalVariable>,
    pub(crate) code: Vec<u8>,
    pub(crate) automaton: Automaton,
    pub(crate) slot_mask: Mutex<u32>,
}

impl Ruleset {
    /// Rules in declaration order.
    #[inline]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Namespaces in declaration order.
    #[inline]
    pub fn namespaces(&self) -> &[Namespace] {
        &self.namespaces
    }

    /// External variables in declaration order.
    #[inline]
    pub fn externals(&self) -> &[ExternalVariable] {
        &self.externals
    }

    pub(crate) fn string(&self, id: StringId) -> &Pattern {
        &self.strings[id.index()]
    }

    /// Sets an integer external. Fails with `InvalidArgument` when the
    /// identifier was not declared at build time.
    pub fn define_integer_variable(
        &mut self,
        identifier: &str,
        value: i64,
    ) -> Result<(), ScanError> {
        self.define(identifier, ExternalValue::Integer(value))
    }

    /// Sets a boolean external.
    pub fn define_boolean_variable(
        &mut self,
        identifier: &str,
        value: bool,
    ) -> Result<(), ScanError> {
        self.define(identifier, ExternalValue::Boolean(value))
    }

    /// Sets a float external.
    pub fn define_float_variable(
        &mut self,
        identifier: &str,
        value: f64,
    ) -> Result<(), ScanError> {
        self.define(identifier, ExternalValue::Float(value))
    }

    /// Sets a string external. Any previous value is dropped and the new
    /// one is copied into the ruleset.
    pub fn define_string_variable(
        &mut self,
        identifier: &str,
        value: &str,
    ) -> Result<(), ScanError> {
        self.define(identifier, ExternalValue::String(value.to_owned()))
    }

    fn define(&mut self, identifier: &str, value: ExternalValue) -> Result<(), ScanError> {
        let ext = self
            .externals
            .iter_mut()
            .find(|e| e.identifier == identifier)
            .ok_or(ScanError::invalid("unknown external variable"))?;
        ext.value = value;
        Ok(())
    }

    /// Reserves the lowest free scan slot, or fails when all
    /// [`MAX_SCAN_SLOTS`] are held.
    pub(crate) fn acquire_slot(&self) -> Result<u32, ScanError> {
        let mut mask = self.slot_mask.lock().expect("slot mask poisoned");
        let slot = mask.trailing_ones();
        if slot >= MAX_SCAN_SLOTS {
            return Err(ScanError::TooManyScanThreads);
        }
        *mask |= 1 << slot;
        Ok(slot)
    }

    pub(crate) fn release_slot(&self, slot: u32) {
        let mut mask = self.slot_mask.lock().expect("slot mask poisoned");
        debug_assert!(*mask & (1 << slot) != 0, "releasing a free slot");
        *mask &= !(1 << slot);
    }

    #[cfg(test)]
    pub(crate) fn slot_mask_snapshot(&self) -> u32 {
        *self.slot_mask.lock().expect("slot mask poisoned")
    }
}

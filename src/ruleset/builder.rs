//! Programmatic ruleset construction.
//!
//! The builder compiles rule definitions into the frozen container: string
//! specs become pattern records plus automaton atoms, condition expression
//! trees become bytecode segments. There is no rule-language parser here;
//! callers describe rules with [`RuleDef`], [`PatternSpec`], and [`Cond`].
//!
//! Atom selection mirrors the usual trade: the automaton carries a short,
//! fully concrete window of each string variant (at most [`MAX_ATOM_LEN`]
//! bytes, expanded per case/wide/XOR variant) and the verifier re-checks the
//! whole candidate around every hit. Windows are scored so rare bytes are
//! preferred over padding-like ones.

use ahash::AHashMap;

use crate::automaton::{AtomRef, AutomatonBuilder, ATOM_WIDE, ATOM_XOR};
use crate::bytecode::{op, CodeWriter};
use crate::errors::ScanError;
use crate::ruleset::{
    ExternalValue, ExternalVariable, Namespace, NamespaceId, Pattern, Rule, RuleId, Ruleset,
    StringId, RULE_FLAG_GLOBAL, RULE_FLAG_PRIVATE, STRING_FLAG_ASCII, STRING_FLAG_CHAIN_PART,
    STRING_FLAG_FULLWORD, STRING_FLAG_HEX, STRING_FLAG_NOCASE, STRING_FLAG_REGEXP,
    STRING_FLAG_WIDE, STRING_FLAG_XOR,
};

/// Longest automaton atom cut from a string variant.
pub(crate) const MAX_ATOM_LEN: usize = 4;

const DEFAULT_NAMESPACE: &str = "default";

/// One token of a hex string: a concrete byte, a masked byte, or a bounded
/// jump separating chain segments.
#[derive(Clone, Copy, Debug)]
pub enum HexToken {
    /// A fully concrete byte.
    Byte(u8),
    /// A byte compared under a mask: `value & mask == input & mask`.
    Masked(u8, u8),
    /// A gap of `min..=max` bytes between the surrounding segments.
    Jump(u32, u32),
}

#[derive(Clone, Debug)]
enum SpecKind {
    Text(Vec<u8>),
    Regex { src: String, atom: Vec<u8> },
    Hex(Vec<HexToken>),
}

/// Declarative description of one string pattern and its modifiers.
#[derive(Clone, Debug)]
pub struct PatternSpec {
    kind: SpecKind,
    ascii: Option<bool>,
    wide: bool,
    nocase: bool,
    fullword: bool,
    xor: Option<(u8, u8)>,
    at: Option<u64>,
    within: Option<(u64, u64)>,
}

impl PatternSpec {
    fn new(kind: SpecKind) -> Self {
        Self {
            kind,
            ascii: None,
            wide: false,
            nocase: false,
            fullword: false,
            xor: None,
            at: None,
            within: None,
        }
    }

    /// A literal byte string.
    pub fn text(bytes: &[u8]) -> Self {
        Self::new(SpecKind::Text(bytes.to_vec()))
    }

    /// A regex pattern with an explicit anchor atom.
    ///
    /// `atom` must be a literal prefix of every match of `src`; the verifier
    /// runs the regex anchored at each atom hit.
    pub fn regex(src: &str, atom: &[u8]) -> Self {
        Self::new(SpecKind::Regex {
            src: src.to_owned(),
            atom: atom.to_vec(),
        })
    }

    /// A hex pattern from tokens (bytes, masked bytes, jumps).
    pub fn hex(tokens: &[HexToken]) -> Self {
        Self::new(SpecKind::Hex(tokens.to_vec()))
    }

    /// Match the ASCII form (default unless `wide` is requested alone).
    pub fn ascii(mut self) -> Self {
        self.ascii = Some(true);
        self
    }

    /// Also match the UTF-16LE form (interleaved zero bytes).
    pub fn wide(mut self) -> Self {
        self.wide = true;
        self
    }

    /// Case-insensitive matching.
    pub fn nocase(mut self) -> Self {
        self.nocase = true;
        self
    }

    /// Require non-word bytes on both sides of a match.
    pub fn fullword(mut self) -> Self {
        self.fullword = true;
        self
    }

    /// Match the pattern XOR-encoded with any single-byte key in
    /// `min..=max`.
    pub fn xor(mut self, min: u8, max: u8) -> Self {
        self.xor = Some((min, max));
        self
    }

    /// Only match at exactly this offset in the logical address space.
    pub fn at(mut self, offset: u64) -> Self {
        self.at = Some(offset);
        self
    }

    /// Only match with a start offset inside `lo..=hi`.
    pub fn in_range(mut self, lo: u64, hi: u64) -> Self {
        self.within = Some((lo, hi));
        self
    }
}

/// Comparison operators for [`Cond::Cmp`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Condition expression tree, compiled to bytecode per rule.
#[derive(Clone, Debug)]
pub enum Cond {
    True,
    False,
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
    /// The named string has at least one confirmed match.
    Found(String),
    /// The named string matches exactly at the popped offset.
    FoundAt(String, Box<Cond>),
    /// The named string matches with a start offset inside `lo..=hi`.
    FoundIn(String, Box<Cond>, Box<Cond>),
    /// Confirmed match count of the named string.
    Count(String),
    /// Offset of the i-th match (1-based); undefined past the last.
    Offset(String, Box<Cond>),
    /// Length of the i-th match (1-based); undefined past the last.
    Length(String, Box<Cond>),
    /// Current value of a declared external variable.
    External(String),
    /// Match state of a previously declared rule.
    RuleMatched(String),
    Filesize,
    Entrypoint,
    And(Box<Cond>, Box<Cond>),
    Or(Box<Cond>, Box<Cond>),
    Not(Box<Cond>),
    Cmp(CmpOp, Box<Cond>, Box<Cond>),
    Add(Box<Cond>, Box<Cond>),
    Sub(Box<Cond>, Box<Cond>),
    Mul(Box<Cond>, Box<Cond>),
    Div(Box<Cond>, Box<Cond>),
    Mod(Box<Cond>, Box<Cond>),
    Neg(Box<Cond>),
    /// Byte-string containment (haystack, needle).
    Contains(Box<Cond>, Box<Cond>),
}

impl Cond {
    pub fn string(name: &str) -> Self {
        Self::Found(name.to_owned())
    }

    pub fn external(name: &str) -> Self {
        Self::External(name.to_owned())
    }

    pub fn rule(name: &str) -> Self {
        Self::RuleMatched(name.to_owned())
    }

    pub fn and(a: Cond, b: Cond) -> Self {
        Self::And(Box::new(a), Box::new(b))
    }

    pub fn or(a: Cond, b: Cond) -> Self {
        Self::Or(Box::new(a), Box::new(b))
    }

    pub fn not(a: Cond) -> Self {
        Self::Not(Box::new(a))
    }

    pub fn cmp(op: CmpOp, a: Cond, b: Cond) -> Self {
        Self::Cmp(op, Box::new(a), Box::new(b))
    }
}

/// Declarative description of one rule.
#[derive(Clone, Debug)]
pub struct RuleDef {
    identifier: String,
    namespace: Option<String>,
    flags: u32,
    strings: Vec<(String, PatternSpec)>,
    condition: Cond,
}

impl RuleDef {
    pub fn new(identifier: &str) -> Self {
        Self {
            identifier: identifier.to_owned(),
            namespace: None,
            flags: 0,
            strings: Vec::new(),
            condition: Cond::False,
        }
    }

    /// Places the rule in `namespace` instead of the default one.
    pub fn namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_owned());
        self
    }

    pub fn private(mut self) -> Self {
        self.flags |= RULE_FLAG_PRIVATE;
        self
    }

    pub fn global(mut self) -> Self {
        self.flags |= RULE_FLAG_GLOBAL;
        self
    }

    /// Declares a string; `name` is referenced from the condition.
    pub fn string(mut self, name: &str, spec: PatternSpec) -> Self {
        self.strings.push((name.to_owned(), spec));
        self
    }

    pub fn condition(mut self, condition: Cond) -> Self {
        self.condition = condition;
        self
    }
}

/// Compiles rule definitions into a frozen [`Ruleset`].
pub struct RulesetBuilder {
    namespaces: Vec<Namespace>,
    rules: Vec<Rule>,
    strings: Vec<Pattern>,
    externals: Vec<ExternalVariable>,
    code: CodeWriter,
    ac: AutomatonBuilder,
}

impl Default for RulesetBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RulesetBuilder {
    pub fn new() -> Self {
        Self {
            namespaces: Vec::new(),
            rules: Vec::new(),
            strings: Vec::new(),
            externals: Vec::new(),
            code: CodeWriter::new(),
            ac: AutomatonBuilder::new(),
        }
    }

    /// Declares an integer external with a default value.
    pub fn declare_integer(&mut self, identifier: &str, value: i64) -> Result<(), ScanError> {
        self.declare(identifier, ExternalValue::Integer(value))
    }

    /// Declares a boolean external with a default value.
    pub fn declare_boolean(&mut self, identifier: &str, value: bool) -> Result<(), ScanError> {
        self.declare(identifier, ExternalValue::Boolean(value))
    }

    /// Declares a float external with a default value.
    pub fn declare_float(&mut self, identifier: &str, value: f64) -> Result<(), ScanError> {
        self.declare(identifier, ExternalValue::Float(value))
    }

    /// Declares a string external with a default value.
    pub fn declare_string(&mut self, identifier: &str, value: &str) -> Result<(), ScanError> {
        self.declare(identifier, ExternalValue::String(value.to_owned()))
    }

    fn declare(&mut self, identifier: &str, value: ExternalValue) -> Result<(), ScanError> {
        if self.externals.iter().any(|e| e.identifier == identifier) {
            return Err(ScanError::invalid("external variable already declared"));
        }
        self.externals.push(ExternalVariable {
            identifier: identifier.to_owned(),
            value,
        });
        Ok(())
    }

    fn namespace_id(&mut self, name: &str) -> NamespaceId {
        if let Some(i) = self.namespaces.iter().position(|n| n.name == name) {
            return NamespaceId(i as u32);
        }
        self.namespaces.push(Namespace {
            name: name.to_owned(),
        });
        NamespaceId(self.namespaces.len() as u32 - 1)
    }

    /// Compiles and appends one rule. Rules evaluate in insertion order, so
    /// a condition may reference any rule added before it.
    pub fn add_rule(&mut self, def: RuleDef) -> Result<RuleId, ScanError> {
        if def.identifier.is_empty() {
            return Err(ScanError::invalid("empty rule identifier"));
        }
        if self.rules.iter().any(|r| r.identifier == def.identifier) {
            return Err(ScanError::invalid("duplicate rule identifier"));
        }

        let rule_id = RuleId(self.rules.len() as u32);
        let namespace = self.namespace_id(def.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE));
        let strings_start = self.strings.len() as u32;

        let mut name_map: AHashMap<String, StringId> = AHashMap::new();
        for (name, spec) in &def.strings {
            if name_map.contains_key(name) {
                return Err(ScanError::invalid("duplicate string identifier in rule"));
            }
            let visible = self.add_string(rule_id, name, spec)?;
            name_map.insert(name.clone(), visible);
        }
        let strings_end = self.strings.len() as u32;

        let code_offset = self.code.offset();
        compile_cond(
            &mut self.code,
            &def.condition,
            &name_map,
            &self.externals,
            &self.rules,
        )?;
        self.code.emit_u32(op::MATCH_RULE, rule_id.0);

        self.rules.push(Rule {
            identifier: def.identifier,
            namespace,
            strings_start,
            strings_end,
            code_offset,
            flags: def.flags,
        });
        Ok(rule_id)
    }

    /// Finalizes the container. The automaton tables and bytecode are frozen
    /// from this point on.
    pub fn build(mut self) -> Result<Ruleset, ScanError> {
        self.code.emit(op::HALT);
        Ok(Ruleset {
            namespaces: self.namespaces,
            rules: self.rules,
            strings: self.strings,
            externals: self.externals,
            code: self.code.finish(),
            automaton: self.ac.build(),
            slot_mask: std::sync::Mutex::new(0),
        })
    }

    /// Creates the pattern record(s) for one string spec and registers its
    /// atoms. Returns the condition-visible string id (the chain tail for
    /// hex strings with jumps).
    fn add_string(
        &mut self,
        rule: RuleId,
        name: &str,
        spec: &PatternSpec,
    ) -> Result<StringId, ScanError> {
        if spec.at.is_some() && spec.within.is_some() {
            return Err(ScanError::invalid("string has both at and in anchors"));
        }
        if let Some((min, max)) = spec.xor {
            if min > max {
                return Err(ScanError::invalid("empty xor key range"));
            }
            if spec.nocase {
                return Err(ScanError::invalid("xor and nocase are incompatible"));
            }
        }
        match &spec.kind {
            SpecKind::Text(bytes) => self.add_text_string(rule, name, spec, bytes),
            SpecKind::Regex { src, atom } => self.add_regex_string(rule, name, spec, src, atom),
            SpecKind::Hex(tokens) => self.add_hex_string(rule, name, spec, tokens),
        }
    }

    fn add_text_string(
        &mut self,
        rule: RuleId,
        name: &str,
        spec: &PatternSpec,
        bytes: &[u8],
    ) -> Result<StringId, ScanError> {
        if bytes.is_empty() {
            return Err(ScanError::invalid("empty string pattern"));
        }
        let mut flags = 0u32;
        if spec.ascii.unwrap_or(!spec.wide) {
            flags |= STRING_FLAG_ASCII;
        }
        if spec.wide {
            flags |= STRING_FLAG_WIDE;
        }
        if spec.nocase {
            flags |= STRING_FLAG_NOCASE;
        }
        if spec.fullword {
            flags |= STRING_FLAG_FULLWORD;
        }
        if spec.xor.is_some() {
            flags |= STRING_FLAG_XOR;
        }

        let id = StringId(self.strings.len() as u32);
        let (atom_off, atom) =
            pick_atom(bytes, &[]).ok_or(ScanError::invalid("pattern has no concrete bytes"))?;
        self.register_text_atoms(id, spec, flags, atom_off, &atom);

        self.strings.push(Pattern {
            identifier: name.to_owned(),
            flags,
            literal: bytes.to_vec(),
            mask: Vec::new(),
            regex_src: None,
            regex: None,
            fixed_offset: spec.at,
            bounds: spec.within,
            xor: spec.xor,
            rule,
            chained_to: None,
            gap: (0, 0),
        });
        Ok(id)
    }

    fn add_regex_string(
        &mut self,
        rule: RuleId,
        name: &str,
        spec: &PatternSpec,
        src: &str,
        atom: &[u8],
    ) -> Result<StringId, ScanError> {
        if atom.is_empty() {
            return Err(ScanError::invalid("regex string needs a non-empty atom"));
        }
        if spec.wide {
            return Err(ScanError::invalid("regex strings cannot be wide"));
        }
        if spec.xor.is_some() {
            return Err(ScanError::invalid("regex strings cannot be xor"));
        }
        let regex = compile_regex(src, spec.nocase)
            .ok_or(ScanError::invalid("regex pattern failed to compile"))?;

        let mut flags = STRING_FLAG_REGEXP | STRING_FLAG_ASCII;
        if spec.nocase {
            flags |= STRING_FLAG_NOCASE;
        }
        if spec.fullword {
            flags |= STRING_FLAG_FULLWORD;
        }

        let id = StringId(self.strings.len() as u32);
        // Long caller-supplied prefixes are truncated to the atom cap so
        // nocase variant expansion stays bounded.
        let atom = &atom[..atom.len().min(MAX_ATOM_LEN)];
        let backtrack = atom.len() as u32;
        if spec.nocase {
            for variant in case_variants(atom) {
                self.ac.add_atom(
                    &variant,
                    AtomRef {
                        string: id,
                        backtrack,
                        flags: 0,
                    },
                );
            }
        } else {
            self.ac.add_atom(
                atom,
                AtomRef {
                    string: id,
                    backtrack,
                    flags: 0,
                },
            );
        }

        self.strings.push(Pattern {
            identifier: name.to_owned(),
            flags,
            literal: atom.to_vec(),
            mask: Vec::new(),
            regex_src: Some(src.to_owned()),
            regex: Some(regex),
            fixed_offset: spec.at,
            bounds: spec.within,
            xor: None,
            rule,
            chained_to: None,
            gap: (0, 0),
        });
        Ok(id)
    }

    fn add_hex_string(
        &mut self,
        rule: RuleId,
        name: &str,
        spec: &PatternSpec,
        tokens: &[HexToken],
    ) -> Result<StringId, ScanError> {
        if spec.wide || spec.nocase || spec.xor.is_some() || spec.fullword {
            return Err(ScanError::invalid(
                "hex strings accept no text modifiers",
            ));
        }
        let segments = split_hex_segments(tokens)?;
        let last = segments.len() - 1;

        let mut prev: Option<StringId> = None;
        let mut visible = StringId(0);
        for (k, seg) in segments.iter().enumerate() {
            let mut flags = STRING_FLAG_HEX | STRING_FLAG_ASCII;
            if k < last {
                flags |= STRING_FLAG_CHAIN_PART;
            }

            let id = StringId(self.strings.len() as u32);
            let (atom_off, atom) = pick_atom(&seg.bytes, &seg.mask)
                .ok_or(ScanError::invalid("hex segment has no concrete bytes"))?;
            self.ac.add_atom(
                &atom,
                AtomRef {
                    string: id,
                    backtrack: (atom_off + atom.len()) as u32,
                    flags: 0,
                },
            );

            self.strings.push(Pattern {
                identifier: name.to_owned(),
                flags,
                literal: seg.bytes.clone(),
                mask: seg.mask.clone(),
                regex_src: None,
                regex: None,
                // Anchors apply to the full chain, checked on promotion.
                fixed_offset: if k == last { spec.at } else { None },
                bounds: if k == last { spec.within } else { None },
                xor: None,
                rule,
                chained_to: prev,
                gap: seg.gap,
            });
            prev = Some(id);
            visible = id;
        }
        Ok(visible)
    }

    /// Registers the atom variants of a text string: ascii/wide forms, case
    /// variants under nocase, and one copy per XOR key.
    fn register_text_atoms(
        &mut self,
        id: StringId,
        spec: &PatternSpec,
        flags: u32,
        atom_off: usize,
        atom: &[u8],
    ) {
        let ascii_variants: Vec<Vec<u8>> = if spec.nocase {
            case_variants(atom)
        } else {
            vec![atom.to_vec()]
        };
        let keys: Vec<u8> = match spec.xor {
            Some((min, max)) => (min..=max).collect(),
            None => vec![0],
        };
        let xored = spec.xor.is_some();

        for variant in &ascii_variants {
            if flags & STRING_FLAG_ASCII != 0 {
                let backtrack = (atom_off + variant.len()) as u32;
                for &key in &keys {
                    let bytes: Vec<u8> = variant.iter().map(|&b| b ^ key).collect();
                    let mut aflags = u32::from(key);
                    if xored {
                        aflags |= ATOM_XOR;
                    }
                    self.ac.add_atom(
                        &bytes,
                        AtomRef {
                            string: id,
                            backtrack,
                            flags: aflags,
                        },
                    );
                }
            }
            if flags & STRING_FLAG_WIDE != 0 {
                let wide = widen(variant);
                let backtrack = (2 * atom_off + wide.len()) as u32;
                for &key in &keys {
                    let bytes: Vec<u8> = wide.iter().map(|&b| b ^ key).collect();
                    let mut aflags = ATOM_WIDE | u32::from(key);
                    if xored {
                        aflags |= ATOM_XOR;
                    }
                    self.ac.add_atom(
                        &bytes,
                        AtomRef {
                            string: id,
                            backtrack,
                            flags: aflags,
                        },
                    );
                }
            }
        }
    }
}

struct HexSegment {
    bytes: Vec<u8>,
    mask: Vec<u8>,
    /// Gap to the previous segment; `(0, 0)` for the head.
    gap: (u32, u32),
}

fn split_hex_segments(tokens: &[HexToken]) -> Result<Vec<HexSegment>, ScanError> {
    let mut segments = Vec::new();
    let mut cur = HexSegment {
        bytes: Vec::new(),
        mask: Vec::new(),
        gap: (0, 0),
    };
    for tok in tokens {
        match *tok {
            HexToken::Byte(b) => {
                cur.bytes.push(b);
                cur.mask.push(0xFF);
            }
            HexToken::Masked(b, m) => {
                cur.bytes.push(b & m);
                cur.mask.push(m);
            }
            HexToken::Jump(min, max) => {
                if min > max {
                    return Err(ScanError::invalid("hex jump with min > max"));
                }
                if cur.bytes.is_empty() {
                    return Err(ScanError::invalid("hex jump at segment start"));
                }
                segments.push(cur);
                cur = HexSegment {
                    bytes: Vec::new(),
                    mask: Vec::new(),
                    gap: (min, max),
                };
            }
        }
    }
    if cur.bytes.is_empty() {
        return Err(ScanError::invalid("hex pattern ends with a jump"));
    }
    segments.push(cur);
    Ok(segments)
}

/// Interleaves zero bytes, producing the UTF-16LE form of an ASCII pattern.
pub(crate) fn widen(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(b);
        out.push(0);
    }
    out
}

/// Enumerates every ASCII case variant of `atom` (alphabetic positions only).
fn case_variants(atom: &[u8]) -> Vec<Vec<u8>> {
    let alpha: Vec<usize> = atom
        .iter()
        .enumerate()
        .filter(|(_, b)| b.is_ascii_alphabetic())
        .map(|(i, _)| i)
        .collect();
    let mut out = Vec::with_capacity(1 << alpha.len());
    for bits in 0u32..(1 << alpha.len()) {
        let mut v = atom.to_vec();
        for (j, &i) in alpha.iter().enumerate() {
            v[i] = if bits >> j & 1 == 1 {
                v[i].to_ascii_uppercase()
            } else {
                v[i].to_ascii_lowercase()
            };
        }
        out.push(v);
    }
    out
}

/// Picks the best fully concrete window of at most [`MAX_ATOM_LEN`] bytes.
///
/// Returns `(offset, atom)` or `None` when no concrete byte exists. Scoring
/// prefers longer windows, more distinct bytes, and penalizes padding-like
/// values that dominate real-world inputs.
fn pick_atom(bytes: &[u8], mask: &[u8]) -> Option<(usize, Vec<u8>)> {
    let concrete = |i: usize| mask.is_empty() || mask[i] == 0xFF;
    let mut best: Option<(i32, usize, usize)> = None; // (score, offset, len)

    let mut run_start = 0;
    for i in 0..=bytes.len() {
        let in_run = i < bytes.len() && concrete(i);
        if in_run {
            continue;
        }
        let run = run_start..i;
        run_start = i + 1;
        if run.is_empty() {
            continue;
        }
        for start in run.clone() {
            let len = MAX_ATOM_LEN.min(run.end - start);
            let window = &bytes[start..start + len];
            let score = atom_quality(window);
            if best.map(|(s, _, _)| score > s).unwrap_or(true) {
                best = Some((score, start, len));
            }
        }
    }

    best.map(|(_, off, len)| (off, bytes[off..off + len].to_vec()))
}

fn atom_quality(window: &[u8]) -> i32 {
    let mut seen = [false; 256];
    let mut distinct = 0i32;
    let mut score = 0i32;
    for &b in window {
        if !seen[b as usize] {
            seen[b as usize] = true;
            distinct += 1;
        }
        score += match b {
            0x00 | 0xFF => 1,
            0x20 | 0x0A | 0x0D | 0xCC | 0x90 => 2,
            _ => 4,
        };
    }
    score + distinct * 2 + window.len() as i32 * 8
}

fn compile_regex(src: &str, nocase: bool) -> Option<regex::bytes::Regex> {
    regex::bytes::RegexBuilder::new(src)
        .unicode(false)
        .case_insensitive(nocase)
        .size_limit(1 << 22)
        .dfa_size_limit(1 << 22)
        .build()
        .ok()
}

/// Rebuilds the compiled regex for a deserialized pattern record.
pub(crate) fn recompile_pattern_regex(pat: &mut Pattern) -> Result<(), ScanError> {
    if let Some(src) = &pat.regex_src {
        pat.regex = Some(
            compile_regex(src, pat.has(STRING_FLAG_NOCASE))
                .ok_or(ScanError::corrupt("stored regex failed to compile"))?,
        );
    }
    Ok(())
}

/// Postfix-compiles a condition expression into the shared code stream.
fn compile_cond(
    code: &mut CodeWriter,
    cond: &Cond,
    strings: &AHashMap<String, StringId>,
    externals: &[ExternalVariable],
    rules: &[Rule],
) -> Result<(), ScanError> {
    let string_id = |name: &str| -> Result<u32, ScanError> {
        strings
            .get(name)
            .map(|id| id.0)
            .ok_or(ScanError::invalid("condition references unknown string"))
    };

    match cond {
        Cond::True => code.emit_u32(op::PUSH_BOOL, 1),
        Cond::False => code.emit_u32(op::PUSH_BOOL, 0),
        Cond::Int(v) => code.emit_i64(op::PUSH_INT, *v),
        Cond::Float(v) => code.emit_f64(op::PUSH_FLOAT, *v),
        Cond::Bytes(v) => code.emit_str(v),
        Cond::Found(name) => code.emit_u32(op::FOUND, string_id(name)?),
        Cond::FoundAt(name, offset) => {
            compile_cond(code, offset, strings, externals, rules)?;
            code.emit_u32(op::FOUND_AT, string_id(name)?);
        }
        Cond::FoundIn(name, lo, hi) => {
            compile_cond(code, lo, strings, externals, rules)?;
            compile_cond(code, hi, strings, externals, rules)?;
            code.emit_u32(op::FOUND_IN, string_id(name)?);
        }
        Cond::Count(name) => code.emit_u32(op::COUNT, string_id(name)?),
        Cond::Offset(name, index) => {
            compile_cond(code, index, strings, externals, rules)?;
            code.emit_u32(op::OFFSET, string_id(name)?);
        }
        Cond::Length(name, index) => {
            compile_cond(code, index, strings, externals, rules)?;
            code.emit_u32(op::MATCH_LENGTH, string_id(name)?);
        }
        Cond::External(name) => {
            let idx = externals
                .iter()
                .position(|e| e.identifier == *name)
                .ok_or(ScanError::invalid("condition references unknown external"))?;
            code.emit_u32(op::EXT_LOAD, idx as u32);
        }
        Cond::RuleMatched(name) => {
            let idx = rules
                .iter()
                .position(|r| r.identifier == *name)
                .ok_or(ScanError::invalid(
                    "condition references an undeclared rule",
                ))?;
            code.emit_u32(op::PUSH_RULE, idx as u32);
        }
        Cond::Filesize => code.emit(op::FILESIZE),
        Cond::Entrypoint => code.emit(op::ENTRYPOINT),
        Cond::And(a, b) => {
            compile_cond(code, a, strings, externals, rules)?;
            compile_cond(code, b, strings, externals, rules)?;
            code.emit(op::AND);
        }
        Cond::Or(a, b) => {
            compile_cond(code, a, strings, externals, rules)?;
            compile_cond(code, b, strings, externals, rules)?;
            code.emit(op::OR);
        }
        Cond::Not(a) => {
            compile_cond(code, a, strings, externals, rules)?;
            code.emit(op::NOT);
        }
        Cond::Cmp(cmp, a, b) => {
            compile_cond(code, a, strings, externals, rules)?;
            compile_cond(code, b, strings, externals, rules)?;
            code.emit(match cmp {
                CmpOp::Eq => op::EQ,
                CmpOp::Ne => op::NE,
                CmpOp::Lt => op::LT,
                CmpOp::Le => op::LE,
                CmpOp::Gt => op::GT,
                CmpOp::Ge => op::GE,
            });
        }
        Cond::Add(a, b) | Cond::Sub(a, b) | Cond::Mul(a, b) | Cond::Div(a, b)
        | Cond::Mod(a, b) => {
            compile_cond(code, a, strings, externals, rules)?;
            compile_cond(code, b, strings, externals, rules)?;
            code.emit(match cond {
                Cond::Add(..) => op::ADD,
                Cond::Sub(..) => op::SUB,
                Cond::Mul(..) => op::MUL,
                Cond::Div(..) => op::DIV,
                _ => op::MOD,
            });
        }
        Cond::Neg(a) => {
            compile_cond(code, a, strings, externals, rules)?;
            code.emit(op::NEG);
        }
        Cond::Contains(hay, needle) => {
            compile_cond(code, hay, strings, externals, rules)?;
            compile_cond(code, needle, strings, externals, rules)?;
            code.emit(op::CONTAINS);
        }
    }
    Ok(())
}

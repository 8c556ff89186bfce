//! Versioned binary serialization of the frozen container.
//!
//! The stream is a fixed header (magic + format version) followed by the
//! container sections in a fixed order, all little-endian and length
//! prefixed. Because records reference each other by dense ids there are no
//! pointer fix-ups; load validates the header, bounds-checks every count and
//! cross-reference, recompiles stored regex sources, and rebuilds the
//! automaton through the same validation the builder output gets.
//!
//! Short reads and malformed sections fail with `CorruptFile`; the ruleset
//! is not created. Saving requires that no scan is in progress.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::automaton::{AcMatch, Automaton};
use crate::errors::ScanError;
use crate::ruleset::builder::recompile_pattern_regex;
use crate::ruleset::{
    ExternalValue, ExternalVariable, Namespace, NamespaceId, Pattern, Rule, RuleId, Ruleset,
    StringId,
};

const MAGIC: [u8; 4] = *b"VGLR";
const FORMAT_VERSION: u32 = 1;

/// Upper bound on any serialized count or byte length; larger values are
/// treated as corruption before any allocation happens.
const MAX_SECTION_LEN: u64 = 1 << 30;

impl Ruleset {
    /// Serializes the container to a stream.
    ///
    /// # Panics
    /// Panics if any scan is in progress; defining this as a caller bug
    /// keeps the frozen bytes unambiguous.
    pub fn save_stream<W: Write>(&self, writer: W) -> Result<(), ScanError> {
        assert_eq!(
            *self.slot_mask.lock().expect("slot mask poisoned"),
            0,
            "cannot save a ruleset while scans are in progress"
        );
        let mut w = BufWriter::new(writer);
        self.write_to(&mut w).map_err(ScanError::Io)?;
        w.flush().map_err(ScanError::Io)
    }

    /// Serializes the container to a file.
    pub fn save(&self, path: &Path) -> Result<(), ScanError> {
        let file = File::create(path).map_err(ScanError::CouldNotOpenFile)?;
        self.save_stream(file)
    }

    /// Deserializes a container from a stream.
    pub fn load_stream<R: Read>(reader: R) -> Result<Ruleset, ScanError> {
        let mut r = Reader {
            inner: BufReader::new(reader),
        };
        read_ruleset(&mut r)
    }

    /// Deserializes a container from a file.
    pub fn load(path: &Path) -> Result<Ruleset, ScanError> {
        let file = File::open(path).map_err(ScanError::CouldNotOpenFile)?;
        Self::load_stream(file)
    }

    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&MAGIC)?;
        w.write_all(&FORMAT_VERSION.to_le_bytes())?;

        write_u32(w, self.namespaces.len() as u32)?;
        for ns in &self.namespaces {
            write_str(w, &ns.name)?;
        }

        write_u32(w, self.rules.len() as u32)?;
        for rule in &self.rules {
            write_str(w, &rule.identifier)?;
            write_u32(w, rule.namespace.0)?;
            write_u32(w, rule.strings_start)?;
            write_u32(w, rule.strings_end)?;
            write_u32(w, rule.code_offset)?;
            write_u32(w, rule.flags)?;
        }

        write_u32(w, self.strings.len() as u32)?;
        for pat in &self.strings {
            write_str(w, &pat.identifier)?;
            write_u32(w, pat.flags)?;
            write_bytes(w, &pat.literal)?;
            write_bytes(w, &pat.mask)?;
            match &pat.regex_src {
                Some(src) => {
                    w.write_all(&[1])?;
                    write_str(w, src)?;
                }
                None => w.write_all(&[0])?,
            }
            match pat.fixed_offset {
                Some(v) => {
                    w.write_all(&[1])?;
                    w.write_all(&v.to_le_bytes())?;
                }
                None => w.write_all(&[0])?,
            }
            match pat.bounds {
                Some((lo, hi)) => {
                    w.write_all(&[1])?;
                    w.write_all(&lo.to_le_bytes())?;
                    w.write_all(&hi.to_le_bytes())?;
                }
                None => w.write_all(&[0])?,
            }
            match pat.xor {
                Some((min, max)) => w.write_all(&[1, min, max])?,
                None => w.write_all(&[0])?,
            }
            write_u32(w, pat.rule.0)?;
            match pat.chained_to {
                Some(id) => {
                    w.write_all(&[1])?;
                    write_u32(w, id.0)?;
                }
                None => w.write_all(&[0])?,
            }
            write_u32(w, pat.gap.0)?;
            write_u32(w, pat.gap.1)?;
        }

        write_u32(w, self.externals.len() as u32)?;
        for ext in &self.externals {
            write_str(w, &ext.identifier)?;
            match &ext.value {
                ExternalValue::Integer(v) => {
                    w.write_all(&[0])?;
                    w.write_all(&v.to_le_bytes())?;
                }
                ExternalValue::Float(v) => {
                    w.write_all(&[1])?;
                    w.write_all(&v.to_bits().to_le_bytes())?;
                }
                ExternalValue::Boolean(v) => w.write_all(&[2, u8::from(*v)])?,
                ExternalValue::String(v) => {
                    w.write_all(&[3])?;
                    write_str(w, v)?;
                }
            }
        }

        write_bytes(w, &self.code)?;

        write_u32(w, self.automaton.transitions.len() as u32)?;
        for &t in &self.automaton.transitions {
            w.write_all(&t.to_le_bytes())?;
        }
        write_u32(w, self.automaton.match_heads.len() as u32)?;
        for &h in &self.automaton.match_heads {
            w.write_all(&h.to_le_bytes())?;
        }
        write_u32(w, self.automaton.matches.len() as u32)?;
        for m in &self.automaton.matches {
            write_u32(w, m.string.0)?;
            write_u32(w, m.backtrack)?;
            write_u32(w, m.flags)?;
            write_u32(w, m.next)?;
        }
        Ok(())
    }
}

fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_bytes<W: Write>(w: &mut W, bytes: &[u8]) -> io::Result<()> {
    write_u32(w, bytes.len() as u32)?;
    w.write_all(bytes)
}

fn write_str<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    write_bytes(w, s.as_bytes())
}

struct Reader<R> {
    inner: R,
}

impl<R: Read> Reader<R> {
    fn u8(&mut self) -> Result<u8, ScanError> {
        let mut b = [0u8; 1];
        self.exact(&mut b)?;
        Ok(b[0])
    }

    fn u32(&mut self) -> Result<u32, ScanError> {
        let mut b = [0u8; 4];
        self.exact(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn u64(&mut self) -> Result<u64, ScanError> {
        let mut b = [0u8; 8];
        self.exact(&mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    fn count(&mut self) -> Result<usize, ScanError> {
        let v = self.u32()?;
        if u64::from(v) > MAX_SECTION_LEN {
            return Err(ScanError::corrupt("section length out of range"));
        }
        Ok(v as usize)
    }

    fn bytes(&mut self) -> Result<Vec<u8>, ScanError> {
        let len = self.count()?;
        let mut buf = vec![0u8; len];
        self.exact(&mut buf)?;
        Ok(buf)
    }

    fn string(&mut self) -> Result<String, ScanError> {
        String::from_utf8(self.bytes()?).map_err(|_| ScanError::corrupt("invalid identifier"))
    }

    fn exact(&mut self, buf: &mut [u8]) -> Result<(), ScanError> {
        self.inner
            .read_exact(buf)
            .map_err(|_| ScanError::corrupt("truncated stream"))
    }
}

fn read_ruleset<R: Read>(r: &mut Reader<R>) -> Result<Ruleset, ScanError> {
    let mut magic = [0u8; 4];
    r.exact(&mut magic)?;
    if magic != MAGIC {
        return Err(ScanError::corrupt("bad magic"));
    }
    if r.u32()? != FORMAT_VERSION {
        return Err(ScanError::corrupt("format version mismatch"));
    }

    let ns_count = r.count()?;
    let mut namespaces = Vec::with_capacity(ns_count);
    for _ in 0..ns_count {
        namespaces.push(Namespace { name: r.string()? });
    }

    let rule_count = r.count()?;
    let mut rules = Vec::with_capacity(rule_count);
    for _ in 0..rule_count {
        rules.push(Rule {
            identifier: r.string()?,
            namespace: NamespaceId(r.u32()?),
            strings_start: r.u32()?,
            strings_end: r.u32()?,
            code_offset: r.u32()?,
            flags: r.u32()?,
        });
    }

    let string_count = r.count()?;
    let mut strings = Vec::with_capacity(string_count);
    for _ in 0..string_count {
        let identifier = r.string()?;
        let flags = r.u32()?;
        let literal = r.bytes()?;
        let mask = r.bytes()?;
        let regex_src = match r.u8()? {
            0 => None,
            1 => Some(r.string()?),
            _ => return Err(ScanError::corrupt("bad regex tag")),
        };
        let fixed_offset = match r.u8()? {
            0 => None,
            1 => Some(r.u64()?),
            _ => return Err(ScanError::corrupt("bad anchor tag")),
        };
        let bounds = match r.u8()? {
            0 => None,
            1 => Some((r.u64()?, r.u64()?)),
            _ => return Err(ScanError::corrupt("bad bounds tag")),
        };
        let xor = match r.u8()? {
            0 => None,
            1 => Some((r.u8()?, r.u8()?)),
            _ => return Err(ScanError::corrupt("bad xor tag")),
        };
        let rule = RuleId(r.u32()?);
        let chained_to = match r.u8()? {
            0 => None,
            1 => Some(StringId(r.u32()?)),
            _ => return Err(ScanError::corrupt("bad chain tag")),
        };
        let gap = (r.u32()?, r.u32()?);

        let mut pat = Pattern {
            identifier,
            flags,
            literal,
            mask,
            regex_src,
            regex: None,
            fixed_offset,
            bounds,
            xor,
            rule,
            chained_to,
            gap,
        };
        recompile_pattern_regex(&mut pat)?;
        strings.push(pat);
    }

    let ext_count = r.count()?;
    let mut externals = Vec::with_capacity(ext_count);
    for _ in 0..ext_count {
        let identifier = r.string()?;
        let value = match r.u8()? {
            0 => ExternalValue::Integer(r.u64()? as i64),
            1 => ExternalValue::Float(f64::from_bits(r.u64()?)),
            2 => ExternalValue::Boolean(r.u8()? != 0),
            3 => ExternalValue::String(r.string()?),
            _ => return Err(ScanError::corrupt("bad external tag")),
        };
        externals.push(ExternalVariable { identifier, value });
    }

    let code = r.bytes()?;

    let t_count = r.count()?;
    let mut transitions = Vec::with_capacity(t_count);
    for _ in 0..t_count {
        transitions.push(r.u64()?);
    }
    let h_count = r.count()?;
    let mut match_heads = Vec::with_capacity(h_count);
    for _ in 0..h_count {
        match_heads.push(r.u32()?);
    }
    let m_count = r.count()?;
    let mut ac_matches = Vec::with_capacity(m_count);
    for _ in 0..m_count {
        ac_matches.push(AcMatch {
            string: StringId(r.u32()?),
            backtrack: r.u32()?,
            flags: r.u32()?,
            next: r.u32()?,
        });
    }

    // Cross-reference validation before the container goes live.
    for rule in &rules {
        if rule.namespace.index() >= namespaces.len() {
            return Err(ScanError::corrupt("rule namespace out of range"));
        }
        if rule.strings_start > rule.strings_end || rule.strings_end as usize > strings.len() {
            return Err(ScanError::corrupt("rule string span out of range"));
        }
        if rule.code_offset as usize > code.len() {
            return Err(ScanError::corrupt("rule code offset out of range"));
        }
    }
    for pat in &strings {
        if pat.rule.index() >= rules.len() {
            return Err(ScanError::corrupt("string rule out of range"));
        }
        if let Some(prev) = pat.chained_to {
            if prev.index() >= strings.len() {
                return Err(ScanError::corrupt("chain link out of range"));
            }
        }
        if !pat.mask.is_empty() && pat.mask.len() != pat.literal.len() {
            return Err(ScanError::corrupt("mask length mismatch"));
        }
    }
    for m in &ac_matches {
        if m.string.index() >= strings.len() {
            return Err(ScanError::corrupt("accept record string out of range"));
        }
    }

    let automaton = Automaton::from_parts(transitions, match_heads, ac_matches)?;

    Ok(Ruleset {
        namespaces,
        rules,
        strings,
        externals,
        code,
        automaton,
        slot_mask: Mutex::new(0),
    })
}

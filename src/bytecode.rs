//! Condition bytecode: opcode set, emitter, and operand readers.
//!
//! The condition program is one flat little-endian byte stream shared by all
//! rules. Each rule's segment evaluates its condition expression and ends
//! with [`op::MATCH_RULE`], which commits the result; the program ends with
//! [`op::HALT`]. Operands follow their opcode inline: `u32` for entity ids,
//! `i64`/`f64` for constants.
//!
//! Readers return `None` on truncation so the evaluator can contain a
//! malformed stream as a fault instead of panicking.

/// Opcode bytes. Gaps leave room for future families.
pub(crate) mod op {
    pub const HALT: u8 = 0x00;

    pub const PUSH_INT: u8 = 0x01;
    pub const PUSH_UNDEF: u8 = 0x02;
    pub const PUSH_BOOL: u8 = 0x03;
    pub const PUSH_FLOAT: u8 = 0x04;
    /// `u32` length followed by that many inline bytes.
    pub const PUSH_STR: u8 = 0x05;

    pub const AND: u8 = 0x10;
    pub const OR: u8 = 0x11;
    pub const NOT: u8 = 0x12;

    pub const EQ: u8 = 0x18;
    pub const NE: u8 = 0x19;
    pub const LT: u8 = 0x1A;
    pub const LE: u8 = 0x1B;
    pub const GT: u8 = 0x1C;
    pub const GE: u8 = 0x1D;

    pub const ADD: u8 = 0x20;
    pub const SUB: u8 = 0x21;
    pub const MUL: u8 = 0x22;
    pub const DIV: u8 = 0x23;
    pub const MOD: u8 = 0x24;
    pub const NEG: u8 = 0x25;

    pub const FOUND: u8 = 0x30;
    pub const FOUND_AT: u8 = 0x31;
    pub const FOUND_IN: u8 = 0x32;
    pub const COUNT: u8 = 0x33;
    pub const OFFSET: u8 = 0x34;
    pub const MATCH_LENGTH: u8 = 0x35;

    pub const EXT_LOAD: u8 = 0x40;
    pub const CONTAINS: u8 = 0x41;

    pub const FILESIZE: u8 = 0x48;
    pub const ENTRYPOINT: u8 = 0x49;

    pub const PUSH_RULE: u8 = 0x50;
    pub const MATCH_RULE: u8 = 0x58;
}

/// Appends encoded instructions to the shared code buffer.
pub(crate) struct CodeWriter {
    buf: Vec<u8>,
}

impl CodeWriter {
    pub(crate) fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Current length, i.e. the offset of the next emitted instruction.
    pub(crate) fn offset(&self) -> u32 {
        self.buf.len() as u32
    }

    pub(crate) fn emit(&mut self, opcode: u8) {
        self.buf.push(opcode);
    }

    pub(crate) fn emit_u32(&mut self, opcode: u8, operand: u32) {
        self.buf.push(opcode);
        self.buf.extend_from_slice(&operand.to_le_bytes());
    }

    pub(crate) fn emit_i64(&mut self, opcode: u8, operand: i64) {
        self.buf.push(opcode);
        self.buf.extend_from_slice(&operand.to_le_bytes());
    }

    pub(crate) fn emit_f64(&mut self, opcode: u8, operand: f64) {
        self.buf.push(opcode);
        self.buf.extend_from_slice(&operand.to_bits().to_le_bytes());
    }

    /// Emits [`op::PUSH_STR`] with the literal bytes inline.
    pub(crate) fn emit_str(&mut self, bytes: &[u8]) {
        self.buf.push(op::PUSH_STR);
        self.buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(bytes);
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads a `u8` at `*ip`, advancing it.
#[inline]
pub(crate) fn read_u8(code: &[u8], ip: &mut usize) -> Option<u8> {
    let b = *code.get(*ip)?;
    *ip += 1;
    Some(b)
}

/// Reads a little-endian `u32` at `*ip`, advancing it.
#[inline]
pub(crate) fn read_u32(code: &[u8], ip: &mut usize) -> Option<u32> {
    let bytes = code.get(*ip..*ip + 4)?;
    *ip += 4;
    Some(u32::from_le_bytes(bytes.try_into().unwrap()))
}

/// Reads a little-endian `i64` at `*ip`, advancing it.
#[inline]
pub(crate) fn read_i64(code: &[u8], ip: &mut usize) -> Option<i64> {
    let bytes = code.get(*ip..*ip + 8)?;
    *ip += 8;
    Some(i64::from_le_bytes(bytes.try_into().unwrap()))
}

/// Reads a little-endian `f64` at `*ip`, advancing it.
#[inline]
pub(crate) fn read_f64(code: &[u8], ip: &mut usize) -> Option<f64> {
    let bytes = code.get(*ip..*ip + 8)?;
    *ip += 8;
    Some(f64::from_bits(u64::from_le_bytes(bytes.try_into().unwrap())))
}

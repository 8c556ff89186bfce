//! Stack evaluator for compiled condition programs.
//!
//! Runs once per scan, after every block has been walked. The program is one
//! linear pass: each rule's segment leaves its boolean on the stack and
//! commits it via `MATCH_RULE`, which also raises the owning namespace's
//! global gate when a global rule fails. The evaluator reads the per-string
//! match lists and the module-object table and writes only the context's
//! side tables.
//!
//! Undefined propagates: arithmetic or comparison over an undefined operand
//! stays undefined, `and`/`or` treat undefined as false, and committing an
//! undefined result is a non-match. This keeps conditions over absent state
//! (no entry point, no such match index) total without special cases.
//!
//! Malformed code — unknown opcode, truncated operand, stack underflow — is
//! contained as a mapping fault rather than a panic; teardown still runs.

use std::time::Instant;

use ahash::AHashMap;
use memchr::memmem;

use crate::arena::Arena;
use crate::bytecode::{op, read_f64, read_i64, read_u32, read_u8};
use crate::errors::ScanError;
use crate::matches::{Match, MatchList, StringMatchState};
use crate::ruleset::ExternalValue;
use crate::scan::context::ScanContext;

/// Instructions between deadline checks.
const TIMEOUT_CHECK_OPS: u32 = 4096;

/// Hard cap on evaluation stack depth.
const MAX_STACK: usize = 16 * 1024;

#[derive(Clone, Copy, Debug)]
enum Value<'r> {
    Undefined,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(&'r [u8]),
}

impl Value<'_> {
    /// Truthiness for commits and boolean connectives; undefined is false.
    fn truthy(self) -> bool {
        match self {
            Value::Undefined => false,
            Value::Bool(b) => b,
            Value::Int(i) => i != 0,
            Value::Float(f) => f != 0.0,
            Value::Str(s) => !s.is_empty(),
        }
    }

    fn as_offset(self) -> Option<u64> {
        match self {
            Value::Int(i) if i >= 0 => Some(i as u64),
            _ => None,
        }
    }
}

fn fault() -> ScanError {
    ScanError::CouldNotMapFile
}

/// Evaluates the whole condition program against the scan context.
pub(crate) fn execute(ctx: &mut ScanContext<'_>) -> Result<(), ScanError> {
    // Split the context into disjoint borrows: stack values may borrow the
    // object table and code while rule commits write the side tables.
    let ScanContext {
        ruleset,
        deadline,
        matches,
        strings,
        rule_matched,
        ns_unsatisfied,
        objects,
        file_size,
        entry_point,
        ..
    } = ctx;
    let rs = *ruleset;
    let deadline = *deadline;
    let file_size = *file_size;
    let entry_point = *entry_point;
    let matches: &Arena<Match> = matches;
    let strings: &[StringMatchState] = strings;
    let objects: &AHashMap<String, ExternalValue> = objects;

    let code: &[u8] = &rs.code;
    let mut stack: Vec<Value<'_>> = Vec::with_capacity(64);
    let mut ip = 0usize;
    let mut ops = 0u32;

    macro_rules! pop {
        () => {
            stack.pop().ok_or_else(fault)?
        };
    }
    macro_rules! push {
        ($v:expr) => {{
            if stack.len() >= MAX_STACK {
                return Err(fault());
            }
            stack.push($v);
        }};
    }

    loop {
        ops += 1;
        if ops % TIMEOUT_CHECK_OPS == 0 {
            if let Some(d) = deadline {
                if Instant::now() > d {
                    return Err(ScanError::ScanTimeout);
                }
            }
        }

        let opcode = read_u8(code, &mut ip).ok_or_else(fault)?;
        match opcode {
            op::HALT => return Ok(()),

            op::PUSH_INT => {
                let v = read_i64(code, &mut ip).ok_or_else(fault)?;
                push!(Value::Int(v));
            }
            op::PUSH_UNDEF => push!(Value::Undefined),
            op::PUSH_BOOL => {
                let v = read_u32(code, &mut ip).ok_or_else(fault)?;
                push!(Value::Bool(v != 0));
            }
            op::PUSH_FLOAT => {
                let v = read_f64(code, &mut ip).ok_or_else(fault)?;
                push!(Value::Float(v));
            }
            op::PUSH_STR => {
                let len = read_u32(code, &mut ip).ok_or_else(fault)? as usize;
                let bytes = code.get(ip..ip + len).ok_or_else(fault)?;
                ip += len;
                push!(Value::Str(bytes));
            }

            op::AND => {
                let b = pop!();
                let a = pop!();
                push!(Value::Bool(a.truthy() && b.truthy()));
            }
            op::OR => {
                let b = pop!();
                let a = pop!();
                push!(Value::Bool(a.truthy() || b.truthy()));
            }
            op::NOT => {
                let a = pop!();
                push!(match a {
                    Value::Undefined => Value::Undefined,
                    v => Value::Bool(!v.truthy()),
                });
            }

            op::EQ | op::NE | op::LT | op::LE | op::GT | op::GE => {
                let b = pop!();
                let a = pop!();
                push!(compare(opcode, a, b));
            }

            op::ADD | op::SUB | op::MUL | op::DIV | op::MOD => {
                let b = pop!();
                let a = pop!();
                push!(arith(opcode, a, b));
            }
            op::NEG => {
                let a = pop!();
                push!(match a {
                    Value::Int(i) => i.checked_neg().map(Value::Int).unwrap_or(Value::Undefined),
                    Value::Float(f) => Value::Float(-f),
                    _ => Value::Undefined,
                });
            }

            op::FOUND => {
                let list = read_string_list(strings, code, &mut ip)?;
                push!(Value::Bool(list.count() > 0));
            }
            op::FOUND_AT => {
                let target = pop!().as_offset();
                let list = read_string_list(strings, code, &mut ip)?;
                let hit = target
                    .map(|off| list.iter(matches).any(|m| m.offset == off))
                    .unwrap_or(false);
                push!(Value::Bool(hit));
            }
            op::FOUND_IN => {
                let hi = pop!().as_offset();
                let lo = pop!().as_offset();
                let list = read_string_list(strings, code, &mut ip)?;
                let hit = match (lo, hi) {
                    (Some(lo), Some(hi)) => list
                        .iter(matches)
                        .any(|m| m.offset >= lo && m.offset <= hi),
                    _ => false,
                };
                push!(Value::Bool(hit));
            }
            op::COUNT => {
                let list = read_string_list(strings, code, &mut ip)?;
                push!(Value::Int(i64::from(list.count())));
            }
            op::OFFSET => {
                let index = pop!();
                let list = read_string_list(strings, code, &mut ip)?;
                push!(nth_match(matches, list, index)
                    .map_or(Value::Undefined, |m| Value::Int(m.offset as i64)));
            }
            op::MATCH_LENGTH => {
                let index = pop!();
                let list = read_string_list(strings, code, &mut ip)?;
                push!(nth_match(matches, list, index)
                    .map_or(Value::Undefined, |m| Value::Int(i64::from(m.length))));
            }

            op::EXT_LOAD => {
                let idx = read_u32(code, &mut ip).ok_or_else(fault)? as usize;
                let ext = rs.externals.get(idx).ok_or_else(fault)?;
                push!(object_value(objects, ext.identifier.as_str()));
            }
            op::CONTAINS => {
                let needle = pop!();
                let hay = pop!();
                push!(match (hay, needle) {
                    (Value::Str(h), Value::Str(n)) => Value::Bool(memmem::find(h, n).is_some()),
                    _ => Value::Undefined,
                });
            }

            op::FILESIZE => {
                push!(file_size.map_or(Value::Undefined, |s| Value::Int(s as i64)));
            }
            op::ENTRYPOINT => {
                push!(entry_point.map_or(Value::Undefined, |e| Value::Int(e as i64)));
            }

            op::PUSH_RULE => {
                let idx = read_u32(code, &mut ip).ok_or_else(fault)? as usize;
                let matched = *rule_matched.get(idx).ok_or_else(fault)?;
                push!(Value::Bool(matched));
            }
            op::MATCH_RULE => {
                let idx = read_u32(code, &mut ip).ok_or_else(fault)? as usize;
                let rule = rs.rules.get(idx).ok_or_else(fault)?;
                let matched = pop!().truthy();
                rule_matched[idx] = matched;
                if !matched && rule.is_global() {
                    ns_unsatisfied[rule.namespace().index()] = true;
                }
            }

            _ => return Err(fault()),
        }
    }
}

/// Reads a string-id operand and returns that string's confirmed list.
fn read_string_list(
    strings: &[StringMatchState],
    code: &[u8],
    ip: &mut usize,
) -> Result<MatchList, ScanError> {
    let idx = read_u32(code, ip).ok_or_else(fault)? as usize;
    let state = strings.get(idx).ok_or_else(fault)?;
    Ok(state.matches)
}

fn nth_match<'a>(arena: &'a Arena<Match>, list: MatchList, index: Value<'_>) -> Option<&'a Match> {
    let i = match index {
        Value::Int(i) if i >= 1 => i as usize,
        _ => return None,
    };
    list.iter(arena).nth(i - 1)
}

fn object_value<'c>(objects: &'c AHashMap<String, ExternalValue>, identifier: &str) -> Value<'c> {
    match objects.get(identifier) {
        Some(ExternalValue::Integer(i)) => Value::Int(*i),
        Some(ExternalValue::Float(f)) => Value::Float(*f),
        Some(ExternalValue::Boolean(b)) => Value::Bool(*b),
        Some(ExternalValue::String(s)) => Value::Str(s.as_bytes()),
        None => Value::Undefined,
    }
}

fn compare<'r>(opcode: u8, a: Value<'r>, b: Value<'r>) -> Value<'r> {
    use std::cmp::Ordering;

    let ord = match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.partial_cmp(&y),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(&y),
        (Value::Int(x), Value::Float(y)) => (x as f64).partial_cmp(&y),
        (Value::Float(x), Value::Int(y)) => x.partial_cmp(&(y as f64)),
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(&y)),
        _ => None,
    };
    let Some(ord) = ord else {
        return Value::Undefined;
    };
    Value::Bool(match opcode {
        op::EQ => ord == Ordering::Equal,
        op::NE => ord != Ordering::Equal,
        op::LT => ord == Ordering::Less,
        op::LE => ord != Ordering::Greater,
        op::GT => ord == Ordering::Greater,
        _ => ord != Ordering::Less,
    })
}

fn arith<'r>(opcode: u8, a: Value<'r>, b: Value<'r>) -> Value<'r> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => {
            let r = match opcode {
                op::ADD => x.checked_add(y),
                op::SUB => x.checked_sub(y),
                op::MUL => x.checked_mul(y),
                op::DIV => x.checked_div(y),
                _ => x.checked_rem(y),
            };
            r.map(Value::Int).unwrap_or(Value::Undefined)
        }
        (Value::Int(_), Value::Float(_))
        | (Value::Float(_), Value::Int(_))
        | (Value::Float(_), Value::Float(_)) => {
            let as_f64 = |v: Value<'_>| match v {
                Value::Int(i) => i as f64,
                Value::Float(f) => f,
                _ => unreachable!(),
            };
            let (x, y) = (as_f64(a), as_f64(b));
            match opcode {
                op::ADD => Value::Float(x + y),
                op::SUB => Value::Float(x - y),
                op::MUL => Value::Float(x * y),
                op::DIV if y != 0.0 => Value::Float(x / y),
                op::MOD if y != 0.0 => Value::Float(x % y),
                _ => Value::Undefined,
            }
        }
        _ => Value::Undefined,
    }
}

//! Update operations — the payload of UPSERT and UPDATE.
//!
//! An operations payload is a MessagePack array of operations, each
//! itself an array `[op, field, arg]`:
//!
//! | op  | effect                                            |
//! |-----|---------------------------------------------------|
//! | `=` | assign `arg` to the field                         |
//! | `+` | numeric add                                       |
//! | `-` | numeric subtract                                  |
//! | `&` | bitwise and (unsigned operands)                   |
//! | `\|`| bitwise or (unsigned operands)                    |
//! | `^` | bitwise xor (unsigned operands)                   |
//! | `!` | insert `arg` before the field                     |
//! | `#` | delete `arg` fields starting at the field         |
//!
//! Field numbers are 1-based on the wire (`index_base = 1`); negative
//! numbers address fields from the end (`-1` is the last field).

use tracing::warn;

use crate::msgpack::{self, MpValue};

use super::StmtError;

// ------------------------------------------------------------------------------------------------
// Parsing
// ------------------------------------------------------------------------------------------------

struct ParsedOp<'a> {
    op: u8,
    field: i64,
    /// Raw encoded argument value.
    arg: &'a [u8],
}

fn parse_ops(ops: &[u8]) -> Result<Vec<ParsedOp<'_>>, StmtError> {
    let (count, mut pos) = msgpack::read_array_len(ops)?;
    let mut parsed = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (arity, n) = msgpack::read_array_len(&ops[pos..])
            .map_err(|_| StmtError::IllegalOp("operation must be an array".into()))?;
        pos += n;
        if arity != 3 {
            return Err(StmtError::IllegalOp(format!(
                "operation must have 3 elements, has {arity}"
            )));
        }
        let (op_str, n) = msgpack::read_str(&ops[pos..])
            .map_err(|_| StmtError::IllegalOp("operation name must be a string".into()))?;
        pos += n;
        if op_str.len() != 1 {
            return Err(StmtError::IllegalOp(format!(
                "unknown operation '{op_str}'"
            )));
        }
        let op = op_str.as_bytes()[0];
        if !matches!(op, b'=' | b'+' | b'-' | b'&' | b'|' | b'^' | b'!' | b'#') {
            return Err(StmtError::IllegalOp(format!(
                "unknown operation '{}'",
                op as char
            )));
        }
        let (field, n) = msgpack::read_int(&ops[pos..])
            .map_err(|_| StmtError::IllegalOp("field number must be an integer".into()))?;
        pos += n;
        let arg_len = msgpack::skip_value(&ops[pos..])?;
        let arg = &ops[pos..pos + arg_len];
        pos += arg_len;
        parsed.push(ParsedOp { op, field, arg });
    }
    Ok(parsed)
}

fn resolve_field(
    field: i64,
    field_count: usize,
    index_base: i64,
) -> Result<usize, StmtError> {
    if field >= index_base {
        Ok((field - index_base) as usize)
    } else if field < 0 {
        let idx = field_count as i64 + field;
        if idx < 0 {
            return Err(StmtError::FieldOutOfRange {
                field,
                field_count: field_count as u32,
            });
        }
        Ok(idx as usize)
    } else {
        Err(StmtError::FieldOutOfRange {
            field,
            field_count: field_count as u32,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Arithmetic
// ------------------------------------------------------------------------------------------------

enum Num {
    Int(i128),
    Double(f64),
}

fn decode_num(raw: &[u8]) -> Option<Num> {
    match msgpack::read_value(raw).ok()?.0 {
        MpValue::Uint(v) => Some(Num::Int(v as i128)),
        MpValue::Int(v) => Some(Num::Int(v as i128)),
        MpValue::Double(v) => Some(Num::Double(v)),
        _ => None,
    }
}

fn encode_num(buf: &mut Vec<u8>, num: Num, field: i64) -> Result<(), StmtError> {
    match num {
        Num::Int(v) => {
            if v >= 0 {
                let v = u64::try_from(v)
                    .map_err(|_| StmtError::ArithmeticOverflow { field })?;
                msgpack::write_uint(buf, v);
            } else {
                let v = i64::try_from(v)
                    .map_err(|_| StmtError::ArithmeticOverflow { field })?;
                msgpack::write_int(buf, v);
            }
        }
        Num::Double(v) => msgpack::write_double(buf, v),
    }
    Ok(())
}

fn arith(op: u8, a: Num, b: Num) -> Num {
    match (a, b) {
        (Num::Int(x), Num::Int(y)) => Num::Int(if op == b'+' { x + y } else { x - y }),
        (a, b) => {
            let x = match a {
                Num::Int(v) => v as f64,
                Num::Double(v) => v,
            };
            let y = match b {
                Num::Int(v) => v as f64,
                Num::Double(v) => v,
            };
            Num::Double(if op == b'+' { x + y } else { x - y })
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Application
// ------------------------------------------------------------------------------------------------

/// Applies an operations payload to a tuple, producing the new tuple.
///
/// With `suppress_error` set, an operation that fails (bad field, bad
/// operand) is logged and skipped; otherwise the first failure aborts
/// the whole application.
pub fn apply_update_ops(
    tuple: &[u8],
    ops: &[u8],
    index_base: i64,
    suppress_error: bool,
) -> Result<Vec<u8>, StmtError> {
    let (field_count, mut pos) = msgpack::read_array_len(tuple)?;
    let mut fields: Vec<Vec<u8>> = Vec::with_capacity(field_count as usize);
    for _ in 0..field_count {
        let len = msgpack::skip_value(&tuple[pos..])?;
        fields.push(tuple[pos..pos + len].to_vec());
        pos += len;
    }

    for op in parse_ops(ops)? {
        match apply_one(&mut fields, &op, index_base) {
            Ok(()) => {}
            Err(e) if suppress_error => {
                warn!(op = %(op.op as char), field = op.field, error = %e, "skipping bad update operation");
            }
            Err(e) => return Err(e),
        }
    }

    let mut out = Vec::with_capacity(tuple.len());
    msgpack::write_array_len(&mut out, fields.len() as u32);
    for field in &fields {
        out.extend_from_slice(field);
    }
    Ok(out)
}

fn apply_one(
    fields: &mut Vec<Vec<u8>>,
    op: &ParsedOp<'_>,
    index_base: i64,
) -> Result<(), StmtError> {
    match op.op {
        b'=' => {
            let idx = resolve_field(op.field, fields.len(), index_base)?;
            if idx >= fields.len() {
                return Err(StmtError::FieldOutOfRange {
                    field: op.field,
                    field_count: fields.len() as u32,
                });
            }
            fields[idx] = op.arg.to_vec();
        }
        b'!' => {
            let idx = resolve_field(op.field, fields.len(), index_base)?;
            if idx > fields.len() {
                return Err(StmtError::FieldOutOfRange {
                    field: op.field,
                    field_count: fields.len() as u32,
                });
            }
            fields.insert(idx, op.arg.to_vec());
        }
        b'#' => {
            let idx = resolve_field(op.field, fields.len(), index_base)?;
            let (count, _) = msgpack::read_uint(op.arg)
                .map_err(|_| StmtError::IllegalOp("'#' argument must be unsigned".into()))?;
            if idx >= fields.len() {
                return Err(StmtError::FieldOutOfRange {
                    field: op.field,
                    field_count: fields.len() as u32,
                });
            }
            let end = (idx + count as usize).min(fields.len());
            fields.drain(idx..end);
        }
        b'+' | b'-' => {
            let idx = resolve_field(op.field, fields.len(), index_base)?;
            if idx >= fields.len() {
                return Err(StmtError::FieldOutOfRange {
                    field: op.field,
                    field_count: fields.len() as u32,
                });
            }
            let a = decode_num(&fields[idx]).ok_or(StmtError::ArithmeticType {
                field: op.field,
            })?;
            let b = decode_num(op.arg).ok_or(StmtError::ArithmeticType { field: op.field })?;
            let mut out = Vec::new();
            encode_num(&mut out, arith(op.op, a, b), op.field)?;
            fields[idx] = out;
        }
        b'&' | b'|' | b'^' => {
            let idx = resolve_field(op.field, fields.len(), index_base)?;
            if idx >= fields.len() {
                return Err(StmtError::FieldOutOfRange {
                    field: op.field,
                    field_count: fields.len() as u32,
                });
            }
            let a = match msgpack::read_value(&fields[idx])?.0 {
                MpValue::Uint(v) => v,
                _ => return Err(StmtError::ArithmeticType { field: op.field }),
            };
            let b = match msgpack::read_value(op.arg)?.0 {
                MpValue::Uint(v) => v,
                _ => return Err(StmtError::ArithmeticType { field: op.field }),
            };
            let result = match op.op {
                b'&' => a & b,
                b'|' => a | b,
                _ => a ^ b,
            };
            let mut out = Vec::new();
            msgpack::write_uint(&mut out, result);
            fields[idx] = out;
        }
        _ => unreachable!("rejected by parse_ops"),
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Squash / concat
// ------------------------------------------------------------------------------------------------

/// Attempts to squash two operation sequences into one equivalent
/// sequence.
///
/// Squashing succeeds only for sequences consisting entirely of `=`,
/// `+`, and `-` operations with positive field numbers, where each
/// sequence touches every field at most once. Anything else returns
/// `Ok(None)` and the caller falls back to concatenation.
pub fn squash_op_sequences(old: &[u8], new: &[u8]) -> Result<Option<Vec<u8>>, StmtError> {
    let old_ops = parse_ops(old)?;
    let new_ops = parse_ops(new)?;

    fn squashable(ops: &[ParsedOp<'_>]) -> bool {
        ops.iter().all(|o| matches!(o.op, b'=' | b'+' | b'-') && o.field > 0)
            && {
                let mut fields: Vec<i64> = ops.iter().map(|o| o.field).collect();
                fields.sort_unstable();
                fields.windows(2).all(|w| w[0] != w[1])
            }
    }
    if !squashable(&old_ops) || !squashable(&new_ops) {
        return Ok(None);
    }

    // (field, op, encoded arg) in old-sequence order, new fields appended.
    let mut merged: Vec<(i64, u8, Vec<u8>)> = old_ops
        .iter()
        .map(|o| (o.field, o.op, o.arg.to_vec()))
        .collect();

    for new_op in &new_ops {
        match merged.iter_mut().find(|(f, _, _)| *f == new_op.field) {
            None => merged.push((new_op.field, new_op.op, new_op.arg.to_vec())),
            Some((field, op, arg)) => match new_op.op {
                b'=' => {
                    *op = b'=';
                    *arg = new_op.arg.to_vec();
                }
                _ => {
                    let old_num = match decode_num(arg) {
                        Some(n) => n,
                        None => return Ok(None),
                    };
                    let new_num = match decode_num(new_op.arg) {
                        Some(n) => n,
                        None => return Ok(None),
                    };
                    if *op == b'=' {
                        // '=' v then '+' d  ⇒  '=' (v ± d)
                        let mut out = Vec::new();
                        encode_num(&mut out, arith(new_op.op, old_num, new_num), *field)?;
                        *arg = out;
                    } else {
                        // Normalize both deltas to '+' and sum them.
                        let a = signed_delta(*op, old_num);
                        let b = signed_delta(new_op.op, new_num);
                        let mut out = Vec::new();
                        encode_num(&mut out, arith(b'+', a, b), *field)?;
                        *op = b'+';
                        *arg = out;
                    }
                }
            },
        }
    }

    let mut out = Vec::new();
    msgpack::write_array_len(&mut out, merged.len() as u32);
    for (field, op, arg) in &merged {
        msgpack::write_array_len(&mut out, 3);
        let name = [*op];
        // Single-byte ASCII operation name.
        msgpack::write_str(&mut out, std::str::from_utf8(&name).unwrap_or("="));
        msgpack::write_int(&mut out, *field);
        out.extend_from_slice(arg);
    }
    Ok(Some(out))
}

fn signed_delta(op: u8, num: Num) -> Num {
    match (op, num) {
        (b'-', Num::Int(v)) => Num::Int(-v),
        (b'-', Num::Double(v)) => Num::Double(-v),
        (_, n) => n,
    }
}

/// Concatenates two operation sequences, old first.
pub fn concat_op_sequences(old: &[u8], new: &[u8]) -> Result<Vec<u8>, StmtError> {
    let (old_count, old_pos) = msgpack::read_array_len(old)?;
    let (new_count, new_pos) = msgpack::read_array_len(new)?;
    let mut out = Vec::with_capacity(old.len() + new.len());
    msgpack::write_array_len(&mut out, old_count + new_count);
    out.extend_from_slice(&old[old_pos..]);
    out.extend_from_slice(&new[new_pos..]);
    Ok(out)
}

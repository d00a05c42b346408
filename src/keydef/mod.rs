//! Key definitions — multi-part key descriptors and comparators.
//!
//! A key definition is an ordered list of `(field_no, field_type)` parts
//! plus index-level options (uniqueness, LSM sizing, RTREE geometry,
//! creation LSN). It is the single authority for:
//!
//! - validating key and tuple fields against their declared types,
//! - comparing tuples and keys part by part,
//! - extracting a key from a stored tuple,
//! - deriving the full comparison definition of a secondary index
//!   (secondary parts + missing primary parts) and the extractor that
//!   recovers a primary key from a stored secondary tuple.
//!
//! Keys travel as MessagePack arrays of part values; tuples are
//! MessagePack arrays of fields addressed by `field_no`.

#[cfg(test)]
mod tests;

use std::cmp::Ordering;

use thiserror::Error;

use crate::msgpack::{self, MpValue, MsgpackError, ValueClass};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by key-definition operations.
#[derive(Debug, Error)]
pub enum KeyDefError {
    /// MessagePack decoding failure.
    #[error("msgpack error: {0}")]
    Msgpack(#[from] MsgpackError),

    /// A field's value does not match the declared field type.
    #[error("field {field_no} type mismatch: expected {expected:?}, found {found:?}")]
    FieldTypeMismatch {
        /// Zero-based field number.
        field_no: u32,
        /// Declared field type.
        expected: FieldType,
        /// Actual MessagePack class.
        found: ValueClass,
    },

    /// A tuple is missing a field referenced by a key part.
    #[error("tuple is missing field {field_no} (has {field_count} fields)")]
    MissingField {
        /// Zero-based field number.
        field_no: u32,
        /// Actual field count of the tuple.
        field_count: u32,
    },

    /// A key supplied more parts than the definition has.
    #[error("key has {part_count} parts, definition allows {max}")]
    TooManyParts {
        /// Parts supplied.
        part_count: u32,
        /// Parts in the definition.
        max: u32,
    },

    /// Two field types referencing the same field cannot be combined.
    #[error("incompatible field types {0:?} and {1:?} for the same field")]
    IncompatibleTypes(FieldType, FieldType),
}

// ------------------------------------------------------------------------------------------------
// Field types
// ------------------------------------------------------------------------------------------------

/// Declared type of an indexed field.
///
/// Each type accepts a fixed set of MessagePack value classes, validated
/// on ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    /// Any value; never validated.
    Any,
    /// Non-negative integer.
    Unsigned,
    /// UTF-8 string.
    String,
    /// MessagePack array (RTREE coordinates).
    Array,
    /// Integer or float.
    Number,
    /// Signed or unsigned integer.
    Integer,
    /// Any indexable scalar: bool, number, string, or binary.
    Scalar,
}

impl FieldType {
    /// Whether a decoded value is acceptable for this field type.
    pub fn accepts(self, value: &MpValue<'_>) -> bool {
        match self {
            FieldType::Any => true,
            FieldType::Unsigned => matches!(value, MpValue::Uint(_)),
            FieldType::String => matches!(value, MpValue::Str(_)),
            FieldType::Array => matches!(value, MpValue::Array { .. }),
            FieldType::Number => matches!(
                value,
                MpValue::Uint(_) | MpValue::Int(_) | MpValue::Double(_)
            ),
            FieldType::Integer => matches!(value, MpValue::Uint(_) | MpValue::Int(_)),
            FieldType::Scalar => matches!(
                value,
                MpValue::Bool(_)
                    | MpValue::Uint(_)
                    | MpValue::Int(_)
                    | MpValue::Double(_)
                    | MpValue::Str(_)
                    | MpValue::Bin(_)
            ),
        }
    }

    /// Combines two declarations of the same field into the narrower
    /// one; errors when the declarations cannot both hold.
    pub fn merge(self, other: FieldType) -> Result<FieldType, KeyDefError> {
        use FieldType::*;
        if self == other {
            return Ok(self);
        }
        Ok(match (self, other) {
            (Any, t) | (t, Any) => t,
            (Scalar, t) | (t, Scalar) if t != Array => t,
            (Number, Integer) | (Integer, Number) => Integer,
            (Number, Unsigned) | (Unsigned, Number) => Unsigned,
            (Integer, Unsigned) | (Unsigned, Integer) => Unsigned,
            (a, b) => return Err(KeyDefError::IncompatibleTypes(a, b)),
        })
    }

    /// Compares two values of this field type.
    ///
    /// Numeric types compare numerically, strings lexicographically,
    /// SCALAR (and ANY) first by class rank, then by value.
    pub fn compare(self, a: &MpValue<'_>, b: &MpValue<'_>) -> Ordering {
        match self {
            FieldType::Unsigned | FieldType::Integer | FieldType::Number => {
                msgpack::cmp_numbers(a, b)
            }
            FieldType::String => match (a, b) {
                (MpValue::Str(x), MpValue::Str(y)) => x.cmp(y),
                _ => msgpack::cmp_scalar(a, b),
            },
            _ => msgpack::cmp_scalar(a, b),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Parts and options
// ------------------------------------------------------------------------------------------------

/// One part of a multi-part key: a field number and its declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPart {
    /// Zero-based field number within the tuple.
    pub field_no: u32,
    /// Declared field type.
    pub field_type: FieldType,
}

/// RTREE distance metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RtreeDistance {
    /// Euclidean distance.
    #[default]
    Euclid,
    /// Manhattan distance.
    Manhattan,
}

/// Index-level options carried by a key definition.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyDefOpts {
    /// Unique index constraint.
    pub unique: bool,
    /// RTREE dimension (ignored by other index types).
    pub dimension: u32,
    /// RTREE distance metric.
    pub distance: RtreeDistance,
    /// Target size of one LSM range in bytes.
    pub range_size: u64,
    /// Target size of one run page in bytes.
    pub page_size: u32,
    /// Run count per range that triggers compaction.
    pub compact_wm: u32,
    /// LSN of the row that created this index.
    pub lsn: i64,
}

impl Default for KeyDefOpts {
    fn default() -> Self {
        Self {
            unique: true,
            dimension: 2,
            distance: RtreeDistance::default(),
            range_size: 1024 * 1024 * 1024,
            page_size: 128 * 1024,
            compact_wm: 2,
            lsn: 0,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Key definition
// ------------------------------------------------------------------------------------------------

/// A multi-part key descriptor.
///
/// Two key definitions are equal iff their parts and options match.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyDef {
    /// Ordered key parts.
    pub parts: Vec<KeyPart>,
    /// Index-level options.
    pub opts: KeyDefOpts,
}

impl KeyDef {
    /// Creates a key definition from parts and options.
    pub fn new(parts: Vec<KeyPart>, opts: KeyDefOpts) -> Self {
        Self { parts, opts }
    }

    /// Number of parts.
    pub fn part_count(&self) -> u32 {
        self.parts.len() as u32
    }

    /// Highest field number referenced by any part, plus one.
    pub fn min_field_count(&self) -> u32 {
        self.parts
            .iter()
            .map(|p| p.field_no + 1)
            .max()
            .unwrap_or(0)
    }

    /// Unions the parts of `self` and `other`, preserving first-key
    /// order: all of `self`'s parts, then `other`'s parts whose field
    /// is not already present. Options are taken from `self`.
    pub fn merge(&self, other: &KeyDef) -> Result<KeyDef, KeyDefError> {
        let mut parts = self.parts.clone();
        for part in &other.parts {
            match parts.iter_mut().find(|p| p.field_no == part.field_no) {
                Some(existing) => {
                    existing.field_type = existing.field_type.merge(part.field_type)?;
                }
                None => parts.push(*part),
            }
        }
        Ok(KeyDef::new(parts, self.opts.clone()))
    }

    /// Builds the full comparison definition of a secondary index:
    /// the secondary parts followed by the primary parts it is missing.
    ///
    /// A secondary tuple stores exactly these fields, in this order, so
    /// the result is also the storage format of the secondary index.
    pub fn build_secondary(primary: &KeyDef, secondary: &KeyDef) -> Result<KeyDef, KeyDefError> {
        secondary.merge(primary)
    }

    /// Builds the extractor that recovers a primary key from a tuple
    /// stored in a secondary index.
    ///
    /// `cmp_def` must be the output of [`KeyDef::build_secondary`] for
    /// the same pair. Each primary part is renumbered to its position
    /// within the stored secondary tuple.
    pub fn build_secondary_to_primary(
        primary: &KeyDef,
        cmp_def: &KeyDef,
    ) -> Result<KeyDef, KeyDefError> {
        let mut parts = Vec::with_capacity(primary.parts.len());
        for ppart in &primary.parts {
            let pos = cmp_def
                .parts
                .iter()
                .position(|p| p.field_no == ppart.field_no)
                .ok_or(KeyDefError::MissingField {
                    field_no: ppart.field_no,
                    field_count: cmp_def.part_count(),
                })?;
            parts.push(KeyPart {
                field_no: pos as u32,
                field_type: ppart.field_type,
            });
        }
        Ok(KeyDef::new(parts, primary.opts.clone()))
    }

    // --------------------------------------------------------------------------------------------
    // Validation
    // --------------------------------------------------------------------------------------------

    /// Validates a key (MessagePack array of part values) against this
    /// definition and returns its part count.
    ///
    /// Partial keys (fewer parts than the definition) are accepted.
    pub fn validate_key(&self, key: &[u8]) -> Result<u32, KeyDefError> {
        let (count, mut pos) = msgpack::read_array_len(key)?;
        if count > self.part_count() {
            return Err(KeyDefError::TooManyParts {
                part_count: count,
                max: self.part_count(),
            });
        }
        for (i, part) in self.parts.iter().take(count as usize).enumerate() {
            let (value, n) = msgpack::read_value(&key[pos..])?;
            if !part.field_type.accepts(&value) {
                return Err(KeyDefError::FieldTypeMismatch {
                    field_no: i as u32,
                    expected: part.field_type,
                    found: value.class(),
                });
            }
            pos += n;
        }
        Ok(count)
    }

    // --------------------------------------------------------------------------------------------
    // Field access and comparison
    // --------------------------------------------------------------------------------------------

    /// Extracts this definition's key from a tuple (MessagePack array),
    /// returning it as a MessagePack array of part values.
    pub fn extract_key(&self, tuple: &[u8]) -> Result<Vec<u8>, KeyDefError> {
        let mut out = Vec::with_capacity(tuple.len().min(64));
        msgpack::write_array_len(&mut out, self.part_count());
        for part in &self.parts {
            let field = tuple_field(tuple, part.field_no)?;
            out.extend_from_slice(field);
        }
        Ok(out)
    }

    /// Compares two tuples part by part.
    pub fn compare_tuples(&self, a: &[u8], b: &[u8]) -> Result<Ordering, KeyDefError> {
        for part in &self.parts {
            let fa = tuple_field(a, part.field_no)?;
            let fb = tuple_field(b, part.field_no)?;
            let (va, _) = msgpack::read_value(fa)?;
            let (vb, _) = msgpack::read_value(fb)?;
            match part.field_type.compare(&va, &vb) {
                Ordering::Equal => continue,
                ord => return Ok(ord),
            }
        }
        Ok(Ordering::Equal)
    }

    /// Compares two keys (MessagePack arrays of part values).
    ///
    /// Only the shared prefix is compared; an equal prefix yields
    /// `Equal`, implementing partial-key semantics.
    pub fn compare_keys(&self, a: &[u8], b: &[u8]) -> Result<Ordering, KeyDefError> {
        let (count_a, mut pos_a) = msgpack::read_array_len(a)?;
        let (count_b, mut pos_b) = msgpack::read_array_len(b)?;
        let prefix = count_a.min(count_b).min(self.part_count());
        for part in self.parts.iter().take(prefix as usize) {
            let (va, na) = msgpack::read_value(&a[pos_a..])?;
            let (vb, nb) = msgpack::read_value(&b[pos_b..])?;
            match part.field_type.compare(&va, &vb) {
                Ordering::Equal => {}
                ord => return Ok(ord),
            }
            pos_a += na;
            pos_b += nb;
        }
        Ok(Ordering::Equal)
    }

    /// Compares a tuple against a (possibly partial) key.
    pub fn compare_tuple_with_key(&self, tuple: &[u8], key: &[u8]) -> Result<Ordering, KeyDefError> {
        let (count, mut pos) = msgpack::read_array_len(key)?;
        let prefix = count.min(self.part_count());
        for part in self.parts.iter().take(prefix as usize) {
            let field = tuple_field(tuple, part.field_no)?;
            let (vt, _) = msgpack::read_value(field)?;
            let (vk, nk) = msgpack::read_value(&key[pos..])?;
            match part.field_type.compare(&vt, &vk) {
                Ordering::Equal => {}
                ord => return Ok(ord),
            }
            pos += nk;
        }
        Ok(Ordering::Equal)
    }
}

// ------------------------------------------------------------------------------------------------
// Raw tuple field access
// ------------------------------------------------------------------------------------------------

/// Returns the raw encoded bytes of field `field_no` of a tuple
/// (MessagePack array), walking the array sequentially.
pub fn tuple_field(tuple: &[u8], field_no: u32) -> Result<&[u8], KeyDefError> {
    let (count, mut pos) = msgpack::read_array_len(tuple)?;
    if field_no >= count {
        return Err(KeyDefError::MissingField {
            field_no,
            field_count: count,
        });
    }
    for _ in 0..field_no {
        pos += msgpack::skip_value(&tuple[pos..])?;
    }
    let len = msgpack::skip_value(&tuple[pos..])?;
    Ok(&tuple[pos..pos + len])
}

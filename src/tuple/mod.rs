//! Tuples and tuple formats.
//!
//! A tuple is an ordered array of MessagePack fields plus an offset map
//! giving O(1) access to indexed fields. The backing allocation holds
//! the offsets *before* the field data:
//!
//! ```text
//! [offset_N … offset_1 | MessagePack array]
//!                      ^ data start; offsets sit at negative indices
//! ```
//!
//! Offsets are 32-bit, relative to the data start, and recorded only for
//! fields that some index reaches past field 0 (field 0 is addressable
//! directly behind the array header). Which fields get a slot is decided
//! by the [`TupleFormat`], which is derived from the key definitions of
//! all indexes of a space.
//!
//! Tuples are immutable after creation and shared by reference count
//! ([`Arc`]): iterators, in-memory trees, and result sets all hold the
//! same allocation.

#[cfg(test)]
mod tests;

use std::sync::Arc;

use thiserror::Error;

use crate::keydef::{FieldType, KeyDef, KeyDefError};
use crate::msgpack::{self, MsgpackError};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by tuple construction and access.
#[derive(Debug, Error)]
pub enum TupleError {
    /// MessagePack decoding failure.
    #[error("msgpack error: {0}")]
    Msgpack(#[from] MsgpackError),

    /// Field validation failure.
    #[error("key def error: {0}")]
    KeyDef(#[from] KeyDefError),

    /// Tuple body is not a MessagePack array.
    #[error("tuple body must be a msgpack array")]
    NotAnArray,

    /// The space declares an exact field count and the tuple differs.
    #[error("tuple field count {found} does not match space field count {expected}")]
    FieldCountMismatch {
        /// Declared exact field count.
        expected: u32,
        /// Actual field count.
        found: u32,
    },

    /// The tuple has fewer fields than the indexes require.
    #[error("tuple has {found} fields, indexes require at least {required}")]
    TooFewFields {
        /// Minimum field count required by index parts.
        required: u32,
        /// Actual field count.
        found: u32,
    },
}

// ------------------------------------------------------------------------------------------------
// Tuple format
// ------------------------------------------------------------------------------------------------

/// Per-field description inside a [`TupleFormat`].
#[derive(Debug, Clone, Copy)]
pub struct FormatField {
    /// Declared type, unioned across all key definitions.
    pub field_type: FieldType,
    /// Offset-map slot for this field, or `None` when unindexed or
    /// reachable without one (field 0).
    pub offset_slot: Option<u32>,
}

/// The shape of tuples stored in one space: per-field types and the
/// offset-map layout shared by every tuple of the space.
#[derive(Debug)]
pub struct TupleFormat {
    /// Field descriptors for all indexed fields, addressed by field no.
    fields: Vec<FormatField>,
    /// Number of offset slots each tuple carries.
    offset_count: u32,
    /// Exact field count enforced on ingest, when the space declares one.
    exact_field_count: Option<u32>,
    /// Minimum field count implied by the index parts.
    min_field_count: u32,
}

impl TupleFormat {
    /// Derives a format from the key definitions of a space's indexes.
    ///
    /// Field types referenced by several definitions are narrowed via
    /// [`FieldType::merge`]; conflicting declarations are an error.
    pub fn new(
        key_defs: &[&KeyDef],
        exact_field_count: Option<u32>,
    ) -> Result<Arc<Self>, TupleError> {
        let field_count = key_defs
            .iter()
            .map(|d| d.min_field_count())
            .max()
            .unwrap_or(0);

        let mut fields: Vec<FormatField> = (0..field_count)
            .map(|_| FormatField {
                field_type: FieldType::Any,
                offset_slot: None,
            })
            .collect();

        for def in key_defs {
            for part in &def.parts {
                let slot = &mut fields[part.field_no as usize];
                slot.field_type = slot.field_type.merge(part.field_type)?;
            }
        }

        // Assign offset slots to every indexed field past field 0.
        let mut offset_count = 0;
        for def in key_defs {
            for part in &def.parts {
                let field = &mut fields[part.field_no as usize];
                if part.field_no > 0 && field.offset_slot.is_none() {
                    field.offset_slot = Some(offset_count);
                    offset_count += 1;
                }
            }
        }

        Ok(Arc::new(Self {
            fields,
            offset_count,
            exact_field_count,
            min_field_count: field_count,
        }))
    }

    /// A format with no indexed fields (keys pass through unvalidated).
    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            fields: Vec::new(),
            offset_count: 0,
            exact_field_count: None,
            min_field_count: 0,
        })
    }

    /// Number of offset slots tuples of this format carry.
    pub fn offset_count(&self) -> u32 {
        self.offset_count
    }

    /// Declared type of a field, `Any` when past the indexed prefix.
    pub fn field_type(&self, field_no: u32) -> FieldType {
        self.fields
            .get(field_no as usize)
            .map(|f| f.field_type)
            .unwrap_or(FieldType::Any)
    }
}

// ------------------------------------------------------------------------------------------------
// Tuple
// ------------------------------------------------------------------------------------------------

/// An immutable, reference-counted tuple.
///
/// See the [module documentation](self) for the memory layout.
#[derive(Debug)]
pub struct Tuple {
    /// Backing allocation: `[offsets | msgpack array]`.
    raw: Box<[u8]>,
    /// Byte position where the MessagePack array starts.
    data_start: usize,
    /// Number of fields in the array.
    field_count: u32,
    /// Format this tuple was validated against.
    format: Arc<TupleFormat>,
}

impl Tuple {
    /// Builds a tuple from a MessagePack array, validating every indexed
    /// field against the format and recording the offset map.
    pub fn new(format: Arc<TupleFormat>, data: &[u8]) -> Result<Arc<Tuple>, TupleError> {
        let (field_count, header_len) =
            msgpack::read_array_len(data).map_err(|_| TupleError::NotAnArray)?;

        if let Some(expected) = format.exact_field_count
            && field_count != expected
        {
            return Err(TupleError::FieldCountMismatch {
                expected,
                found: field_count,
            });
        }
        if field_count < format.min_field_count {
            return Err(TupleError::TooFewFields {
                required: format.min_field_count,
                found: field_count,
            });
        }

        let offsets_len = format.offset_count as usize * 4;
        let mut raw = vec![0u8; offsets_len + data.len()];
        raw[offsets_len..].copy_from_slice(data);

        // Walk the indexed prefix once: validate types and fill slots.
        let mut pos = header_len;
        for (field_no, field) in format.fields.iter().enumerate() {
            let (value, _) = msgpack::read_value(&data[pos..])?;
            if !field.field_type.accepts(&value) {
                return Err(TupleError::KeyDef(KeyDefError::FieldTypeMismatch {
                    field_no: field_no as u32,
                    expected: field.field_type,
                    found: value.class(),
                }));
            }
            if let Some(slot) = field.offset_slot {
                // Slot `k` lives at negative index `k + 1` from the data
                // start, i.e. bytes `offsets_len - (k + 1) * 4 ..`.
                let at = offsets_len - (slot as usize + 1) * 4;
                raw[at..at + 4].copy_from_slice(&(pos as u32).to_le_bytes());
            }
            pos += msgpack::skip_value(&data[pos..])?;
        }

        Ok(Arc::new(Tuple {
            raw: raw.into_boxed_slice(),
            data_start: offsets_len,
            field_count,
            format,
        }))
    }

    /// The MessagePack array this tuple stores.
    pub fn data(&self) -> &[u8] {
        &self.raw[self.data_start..]
    }

    /// Number of fields.
    pub fn field_count(&self) -> u32 {
        self.field_count
    }

    /// Format this tuple belongs to.
    pub fn format(&self) -> &Arc<TupleFormat> {
        &self.format
    }

    /// Raw encoded bytes of one field.
    ///
    /// Fields with an offset slot resolve in O(1); others are reached by
    /// a sequential walk.
    pub fn field(&self, field_no: u32) -> Result<&[u8], TupleError> {
        if field_no >= self.field_count {
            return Err(TupleError::KeyDef(KeyDefError::MissingField {
                field_no,
                field_count: self.field_count,
            }));
        }
        if let Some(FormatField {
            offset_slot: Some(slot),
            ..
        }) = self.format.fields.get(field_no as usize)
        {
            let at = self.data_start - (*slot as usize + 1) * 4;
            let off = u32::from_le_bytes([
                self.raw[at],
                self.raw[at + 1],
                self.raw[at + 2],
                self.raw[at + 3],
            ]) as usize;
            let data = self.data();
            let len = msgpack::skip_value(&data[off..])?;
            return Ok(&data[off..off + len]);
        }
        Ok(crate::keydef::tuple_field(self.data(), field_no)?)
    }
}

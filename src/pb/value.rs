//! Field values: the tagged sum a parsed protobuf document is made of.
//!
//! Schema templates and parsed values share the same representation: a
//! template carries its default as its value, and instantiating it for
//! a read is a plain `clone`.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

use crate::pb::message::Message;
use crate::pb::text::TokenCursor;
use crate::pb::wire::ByteStream;
use crate::{ErrorKind, Result};

#[derive(Clone, Debug, PartialEq)]
pub enum Field {
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    Bool(bool),
    /// Strings and bytes. Protobuf does not guarantee UTF-8 on the wire.
    Bytes(Vec<u8>),
    Enum(EnumValue),
    Packed(Packed),
    Message(Message),
}

/// An enum field: the current symbolic name plus the id table it
/// resolves against. The table is shared by all instances of the field.
#[derive(Clone, Debug, PartialEq)]
pub struct EnumValue {
    pub name: String,
    pub values: Arc<BTreeMap<i32, String>>,
    pub packed: bool,
}

impl EnumValue {
    fn resolve(&self, id: i64) -> Result<&str> {
        self.values
            .get(&(id as i32))
            .map(|s| &**s)
            .ok_or_else(|| ErrorKind::Parse(format!("unknown enum value [{}]", id)).into())
    }
}

/// A packed repeated primitive: one length-delimited run of elements.
#[derive(Clone, Debug, PartialEq)]
pub enum Packed {
    Int32(Vec<i32>),
    UInt32(Vec<u32>),
    Int64(Vec<i64>),
    UInt64(Vec<u64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    Bool(Vec<bool>),
}

impl Packed {
    pub fn len(&self) -> usize {
        match self {
            Packed::Int32(v) => v.len(),
            Packed::UInt32(v) => v.len(),
            Packed::Int64(v) => v.len(),
            Packed::UInt64(v) => v.len(),
            Packed::Float(v) => v.len(),
            Packed::Double(v) => v.len(),
            Packed::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn elem_size(&self) -> usize {
        match self {
            Packed::Int32(_) | Packed::UInt32(_) | Packed::Float(_) => 4,
            Packed::Int64(_) | Packed::UInt64(_) | Packed::Double(_) => 8,
            Packed::Bool(_) => 1,
        }
    }

    fn read_binary(&mut self, s: &mut ByteStream) -> Result<()> {
        let num_bytes = s.read_varint()? as usize;
        match self {
            // fixed-width element types come as raw little-endian runs
            Packed::Float(values) => {
                if num_bytes % 4 != 0 {
                    bail!(ErrorKind::Parse(format!("packed float body of {} bytes", num_bytes)));
                }
                let bytes = s.read_exact(num_bytes)?;
                values.clear();
                values.extend(
                    bytes.chunks(4).map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
                );
            }
            Packed::Double(values) => {
                if num_bytes % 8 != 0 {
                    bail!(ErrorKind::Parse(format!("packed double body of {} bytes", num_bytes)));
                }
                let bytes = s.read_exact(num_bytes)?;
                values.clear();
                values.extend(bytes.chunks(8).map(|b| {
                    f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
                }));
            }
            // varint element types are consumed until the declared byte
            // count is exhausted, and must land on it exactly
            Packed::Int32(values) => {
                values.clear();
                read_packed_varints(s, num_bytes, |v| values.push(v as i32))?;
            }
            Packed::UInt32(values) => {
                values.clear();
                read_packed_varints(s, num_bytes, |v| values.push(v as u32))?;
            }
            Packed::Int64(values) => {
                values.clear();
                read_packed_varints(s, num_bytes, |v| values.push(v as i64))?;
            }
            Packed::UInt64(values) => {
                values.clear();
                read_packed_varints(s, num_bytes, |v| values.push(v))?;
            }
            Packed::Bool(values) => {
                values.clear();
                read_packed_varints(s, num_bytes, |v| values.push(v != 0))?;
            }
        }
        Ok(())
    }

    fn read_text(&mut self, cursor: &mut TokenCursor) -> Result<()> {
        // a text document spells repeated fields one element at a time
        let token = cursor.next()?;
        match self {
            Packed::Int32(values) => *values = vec![scalar_from_str(&token)?],
            Packed::UInt32(values) => *values = vec![scalar_from_str(&token)?],
            Packed::Int64(values) => *values = vec![scalar_from_str(&token)?],
            Packed::UInt64(values) => *values = vec![scalar_from_str(&token)?],
            Packed::Float(values) => *values = vec![scalar_from_str(&token)?],
            Packed::Double(values) => *values = vec![scalar_from_str(&token)?],
            Packed::Bool(values) => *values = vec![bool_from_str(&token)?],
        }
        Ok(())
    }
}

fn read_packed_varints(
    s: &mut ByteStream,
    num_bytes: usize,
    mut push: impl FnMut(u64),
) -> Result<()> {
    let end = s.tell() + num_bytes;
    while s.tell() < end {
        push(s.read_varint()?);
    }
    if s.tell() != end {
        bail!(ErrorKind::Parse("packed field overran its byte count".to_string()));
    }
    Ok(())
}

impl Field {
    pub fn read_binary(&mut self, s: &mut ByteStream) -> Result<()> {
        match self {
            Field::Int32(v) => *v = s.read_varint()? as i32,
            Field::UInt32(v) => *v = s.read_varint()? as u32,
            Field::Int64(v) => *v = s.read_varint()? as i64,
            Field::UInt64(v) => *v = s.read_varint()?,
            Field::Float(v) => *v = f32::from_bits(s.read_fixed32()?),
            Field::Double(v) => *v = f64::from_bits(s.read_fixed64()?),
            Field::Bool(v) => *v = s.read_varint()? != 0,
            Field::Bytes(v) => *v = s.read_len_delimited()?.to_vec(),
            Field::Enum(e) => {
                if e.packed {
                    let mut ids = Packed::Int32(vec![]);
                    ids.read_binary(s)?;
                    // last-one-wins, as for any scalar field; earlier
                    // ids in the block are not resolved
                    if let Packed::Int32(ids) = ids {
                        if let Some(&last) = ids.last() {
                            e.name = e.resolve(last as i64)?.to_string();
                        }
                    }
                } else {
                    let id = s.read_varint()? as i64;
                    e.name = e.resolve(id)?.to_string();
                }
            }
            Field::Packed(p) => p.read_binary(s)?,
            Field::Message(m) => m.read_binary(s)?,
        }
        Ok(())
    }

    pub fn read_text(&mut self, cursor: &mut TokenCursor) -> Result<()> {
        match self {
            Field::Int32(v) => *v = scalar_from_str(&cursor.next()?)?,
            Field::UInt32(v) => *v = scalar_from_str(&cursor.next()?)?,
            Field::Int64(v) => *v = scalar_from_str(&cursor.next()?)?,
            Field::UInt64(v) => *v = scalar_from_str(&cursor.next()?)?,
            Field::Float(v) => *v = scalar_from_str(&cursor.next()?)?,
            Field::Double(v) => *v = scalar_from_str(&cursor.next()?)?,
            Field::Bool(v) => *v = bool_from_str(&cursor.next()?)?,
            Field::Bytes(v) => *v = cursor.next()?.into_bytes(),
            // the tokenizer already stripped quotes, the symbolic name
            // comes through verbatim
            Field::Enum(e) => e.name = cursor.next()?,
            Field::Packed(p) => p.read_text(cursor)?,
            Field::Message(m) => m.read_text(cursor)?,
        }
        Ok(())
    }
}

/// A template for one of the eight primitive field types, initialized
/// from the descriptor's textual default value.
pub fn primitive(type_name: &str, default: &str, packed: bool) -> Result<Field> {
    let field = match (type_name, packed) {
        ("int32", false) => Field::Int32(scalar_from_str(default)?),
        ("int32", true) => Field::Packed(Packed::Int32(vec![])),
        ("uint32", false) => Field::UInt32(scalar_from_str(default)?),
        ("uint32", true) => Field::Packed(Packed::UInt32(vec![])),
        ("int64", false) => Field::Int64(scalar_from_str(default)?),
        ("int64", true) => Field::Packed(Packed::Int64(vec![])),
        ("uint64", false) => Field::UInt64(scalar_from_str(default)?),
        ("uint64", true) => Field::Packed(Packed::UInt64(vec![])),
        ("float", false) => Field::Float(scalar_from_str(default)?),
        ("float", true) => Field::Packed(Packed::Float(vec![])),
        ("double", false) => Field::Double(scalar_from_str(default)?),
        ("double", true) => Field::Packed(Packed::Double(vec![])),
        ("bool", false) => Field::Bool(bool_from_str(default)?),
        ("bool", true) => Field::Packed(Packed::Bool(vec![])),
        // strings are length-delimited already, never packed
        ("string", _) => Field::Bytes(default.as_bytes().to_vec()),
        (other, _) => {
            bail!(ErrorKind::NotImplemented(format!("unknown protobuf type \"{}\"", other)))
        }
    };
    Ok(field)
}

fn scalar_from_str<T>(s: &str) -> Result<T>
where
    T: Default + FromStr,
    T::Err: Display,
{
    if s.is_empty() {
        return Ok(T::default());
    }
    s.parse()
        .map_err(|e| ErrorKind::Parse(format!("cannot interpret value \"{}\": {}", s, e)).into())
}

fn bool_from_str(s: &str) -> Result<bool> {
    match s {
        "" | "false" => Ok(false),
        "true" => Ok(true),
        _ => bail!(ErrorKind::Parse(format!("cannot interpret boolean value: {}", s))),
    }
}

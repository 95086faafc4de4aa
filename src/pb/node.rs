//! Read-only navigation over parsed messages.

use num_traits::cast::{cast, NumCast};

use crate::pb::value::{Field, Packed};
use crate::{ErrorKind, Result};

/// A view over the values parsed for one field (or over the root
/// message itself). Indexing a repeated field narrows the view;
/// indexing a packed field selects one element of the pack.
#[derive(Clone, Debug)]
pub struct Node<'a> {
    fields: Vec<&'a Field>,
    /// Selects one element of a singleton packed field.
    elem: Option<usize>,
}

enum Single<'a> {
    Value(&'a Field),
    PackedElem(&'a Packed, usize),
}

impl<'a> Node<'a> {
    pub fn from_fields(fields: Vec<&'a Field>) -> Node<'a> {
        Node { fields, elem: None }
    }

    pub fn empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The node's value, when it holds exactly one.
    fn only(&self) -> Option<&'a Field> {
        if self.fields.len() == 1 {
            Some(self.fields[0])
        } else {
            None
        }
    }

    pub fn size(&self) -> usize {
        if self.elem.is_some() {
            return 1;
        }
        if let Some(Field::Packed(p)) = self.only() {
            return p.len();
        }
        self.fields.len()
    }

    /// Navigate into a singleton message by field name. Yields an empty
    /// node for a field that was neither read nor defaulted.
    pub fn by_name(&self, name: &str) -> Result<Node<'a>> {
        match self.only() {
            Some(Field::Message(m)) => Ok(m.node(name)),
            _ => bail!(ErrorKind::TypeMismatch(format!(
                "field access \"{}\" on a node that is not a single message",
                name
            ))),
        }
    }

    /// True if a singleton message has read the named field.
    pub fn has(&self, name: &str) -> Result<bool> {
        match self.only() {
            Some(Field::Message(m)) => Ok(m.has(name)),
            _ => bail!(ErrorKind::TypeMismatch(format!(
                "\"has {}\" on a node that is not a single message",
                name
            ))),
        }
    }

    pub fn at(&self, idx: usize) -> Result<Node<'a>> {
        if self.elem.is_none() {
            if let Some(Field::Packed(p)) = self.only() {
                if idx >= p.len() {
                    bail!(ErrorKind::NotFound(format!(
                        "index [{}] out of packed range [0, {})",
                        idx,
                        p.len()
                    )));
                }
                return Ok(Node { fields: self.fields.clone(), elem: Some(idx) });
            }
        }
        if idx >= self.fields.len() {
            bail!(ErrorKind::NotFound(format!(
                "index [{}] out of range [0, {})",
                idx,
                self.fields.len()
            )));
        }
        Ok(Node { fields: vec![self.fields[idx]], elem: None })
    }

    fn single(&self) -> Result<Single<'a>> {
        if let Some(field) = self.only() {
            if let Field::Packed(p) = field {
                let idx = match self.elem {
                    Some(idx) => idx,
                    // a one-element pack unwraps transparently
                    None if p.len() == 1 => 0,
                    None => bail!(ErrorKind::TypeMismatch(format!(
                        "scalar access on a packed field of {} values",
                        p.len()
                    ))),
                };
                return Ok(Single::PackedElem(p, idx));
            }
            return Ok(Single::Value(field));
        }
        bail!(ErrorKind::TypeMismatch(format!(
            "scalar access on a node of {} values",
            self.fields.len()
        )))
    }

    fn int_scalar<T: NumCast>(&self) -> Result<T> {
        let value = match self.single()? {
            Single::Value(Field::Int32(v)) => cast(*v),
            Single::Value(Field::UInt32(v)) => cast(*v),
            Single::Value(Field::Int64(v)) => cast(*v),
            Single::Value(Field::UInt64(v)) => cast(*v),
            Single::PackedElem(Packed::Int32(v), i) => cast(v[i]),
            Single::PackedElem(Packed::UInt32(v), i) => cast(v[i]),
            Single::PackedElem(Packed::Int64(v), i) => cast(v[i]),
            Single::PackedElem(Packed::UInt64(v), i) => cast(v[i]),
            _ => bail!(ErrorKind::TypeMismatch("integer requested from a non-integer field".to_string())),
        };
        value.ok_or_else(|| {
            ErrorKind::TypeMismatch("integer value out of range for requested type".to_string())
                .into()
        })
    }

    fn float_scalar<T: NumCast>(&self) -> Result<T> {
        let value = match self.single()? {
            Single::Value(Field::Float(v)) => cast(*v),
            Single::Value(Field::Double(v)) => cast(*v),
            Single::PackedElem(Packed::Float(v), i) => cast(v[i]),
            Single::PackedElem(Packed::Double(v), i) => cast(v[i]),
            _ => bail!(ErrorKind::TypeMismatch("real requested from a non-real field".to_string())),
        };
        value.ok_or_else(|| {
            ErrorKind::TypeMismatch("real value out of range for requested type".to_string()).into()
        })
    }

    pub fn as_i32(&self) -> Result<i32> {
        self.int_scalar()
    }

    pub fn as_u32(&self) -> Result<u32> {
        self.int_scalar()
    }

    pub fn as_i64(&self) -> Result<i64> {
        self.int_scalar()
    }

    pub fn as_u64(&self) -> Result<u64> {
        self.int_scalar()
    }

    pub fn as_f32(&self) -> Result<f32> {
        self.float_scalar()
    }

    pub fn as_f64(&self) -> Result<f64> {
        self.float_scalar()
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self.single()? {
            Single::Value(Field::Bool(v)) => Ok(*v),
            Single::PackedElem(Packed::Bool(v), i) => Ok(v[i]),
            _ => bail!(ErrorKind::TypeMismatch("boolean requested from a non-boolean field".to_string())),
        }
    }

    pub fn as_str(&self) -> Result<&'a str> {
        match self.single()? {
            Single::Value(Field::Bytes(v)) => Ok(::std::str::from_utf8(v)?),
            Single::Value(Field::Enum(e)) => Ok(&e.name),
            _ => bail!(ErrorKind::TypeMismatch("string requested from a non-string field".to_string())),
        }
    }

    fn all(&self, pred: fn(&Field) -> bool, packed_pred: fn(&Packed) -> bool) -> bool {
        if self.fields.is_empty() {
            return false;
        }
        self.fields.iter().all(|f| match f {
            Field::Packed(p) => packed_pred(p),
            other => pred(other),
        })
    }

    pub fn is_int32(&self) -> bool {
        self.all(|f| matches!(f, Field::Int32(_)), |p| matches!(p, Packed::Int32(_)))
    }

    pub fn is_uint32(&self) -> bool {
        self.all(|f| matches!(f, Field::UInt32(_)), |p| matches!(p, Packed::UInt32(_)))
    }

    pub fn is_int64(&self) -> bool {
        self.all(|f| matches!(f, Field::Int64(_)), |p| matches!(p, Packed::Int64(_)))
    }

    pub fn is_uint64(&self) -> bool {
        self.all(|f| matches!(f, Field::UInt64(_)), |p| matches!(p, Packed::UInt64(_)))
    }

    pub fn is_float(&self) -> bool {
        self.all(|f| matches!(f, Field::Float(_)), |p| matches!(p, Packed::Float(_)))
    }

    pub fn is_double(&self) -> bool {
        self.all(|f| matches!(f, Field::Double(_)), |p| matches!(p, Packed::Double(_)))
    }

    pub fn is_bool(&self) -> bool {
        self.all(|f| matches!(f, Field::Bool(_)), |p| matches!(p, Packed::Bool(_)))
    }

    pub fn is_string(&self) -> bool {
        self.all(
            |f| matches!(f, Field::Bytes(_) | Field::Enum(_)),
            |_| false,
        )
    }

    /// Bulk extraction into raw little-endian bytes. A packed field is
    /// copied in one go; anything else is written element by element in
    /// the node's detected scalar type. The destination must have the
    /// exact byte size.
    pub fn copy_to(&self, dst: &mut [u8]) -> Result<()> {
        if self.elem.is_none() {
            if let Some(Field::Packed(p)) = self.only() {
                let num_bytes = p.len() * p.elem_size();
                if dst.len() != num_bytes {
                    bail!(ErrorKind::Parse(format!(
                        "destination of {} bytes for a packed field of {}",
                        dst.len(),
                        num_bytes
                    )));
                }
                match p {
                    Packed::Int32(v) => write_le(dst, v, |x| x.to_le_bytes()),
                    Packed::UInt32(v) => write_le(dst, v, |x| x.to_le_bytes()),
                    Packed::Int64(v) => write_le(dst, v, |x| x.to_le_bytes()),
                    Packed::UInt64(v) => write_le(dst, v, |x| x.to_le_bytes()),
                    Packed::Float(v) => write_le(dst, v, |x| x.to_le_bytes()),
                    Packed::Double(v) => write_le(dst, v, |x| x.to_le_bytes()),
                    Packed::Bool(v) => write_le(dst, v, |x| [x as u8]),
                }
                return Ok(());
            }
        }
        if self.is_int32() {
            self.copy_elems(dst, 4, |node, out: &mut [u8]| {
                out.copy_from_slice(&node.as_i32()?.to_le_bytes());
                Ok(())
            })
        } else if self.is_uint32() {
            self.copy_elems(dst, 4, |node, out: &mut [u8]| {
                out.copy_from_slice(&node.as_u32()?.to_le_bytes());
                Ok(())
            })
        } else if self.is_int64() {
            self.copy_elems(dst, 8, |node, out: &mut [u8]| {
                out.copy_from_slice(&node.as_i64()?.to_le_bytes());
                Ok(())
            })
        } else if self.is_uint64() {
            self.copy_elems(dst, 8, |node, out: &mut [u8]| {
                out.copy_from_slice(&node.as_u64()?.to_le_bytes());
                Ok(())
            })
        } else if self.is_float() {
            self.copy_elems(dst, 4, |node, out: &mut [u8]| {
                out.copy_from_slice(&node.as_f32()?.to_le_bytes());
                Ok(())
            })
        } else if self.is_double() {
            self.copy_elems(dst, 8, |node, out: &mut [u8]| {
                out.copy_from_slice(&node.as_f64()?.to_le_bytes());
                Ok(())
            })
        } else if self.is_bool() {
            self.copy_elems(dst, 1, |node, out: &mut [u8]| {
                out[0] = node.as_bool()? as u8;
                Ok(())
            })
        } else {
            bail!(ErrorKind::TypeMismatch("bulk copy of a non-numeric node".to_string()))
        }
    }

    fn copy_elems(
        &self,
        dst: &mut [u8],
        width: usize,
        write: impl Fn(&Node, &mut [u8]) -> Result<()>,
    ) -> Result<()> {
        let n = self.size();
        if dst.len() != n * width {
            bail!(ErrorKind::Parse(format!(
                "destination of {} bytes for {} elements of {} bytes",
                dst.len(),
                n,
                width
            )));
        }
        for (i, out) in dst.chunks_mut(width.max(1)).enumerate() {
            write(&self.at(i)?, out)?;
        }
        Ok(())
    }
}

fn write_le<T: Copy, B: AsRef<[u8]>>(dst: &mut [u8], values: &[T], to_bytes: impl Fn(T) -> B) {
    if values.is_empty() {
        return;
    }
    let width = dst.len() / values.len();
    for (out, &v) in dst.chunks_mut(width).zip(values) {
        out.copy_from_slice(to_bytes(v).as_ref());
    }
}

//! Hand-written bootstrap schema for compiled `.proto` files.
//!
//! A `FileDescriptorSet` is itself a protobuf message (see
//! `google/protobuf/descriptor.proto`), so the engine can read it with
//! a schema spelled out here once, by hand, covering exactly the subset
//! of the descriptor format the builder consumes.

use std::sync::Arc;

use crate::pb::message::{Message, MessageSchema};
use crate::pb::value::Field;
use crate::{ErrorKind, Result};

/// How deep nested message declarations are followed. Deeper nestings
/// are silently dropped by the unknown-tag skip; callers with deeper
/// schemas must raise the bound.
pub const DEFAULT_MAX_MESSAGE_DEPTH: usize = 3;

fn field_options() -> Result<MessageSchema> {
    let mut schema = MessageSchema::new();
    schema.add_primitive("bool", "packed", 2)?;
    Ok(schema)
}

fn field_descriptor() -> Result<MessageSchema> {
    let mut schema = MessageSchema::new();
    schema.add_primitive("string", "name", 1)?;
    schema.add_primitive("int32", "number", 3)?;
    // optional, required, repeated
    schema.add_primitive("int32", "label", 4)?;
    schema.add_primitive("int32", "type", 5)?;
    schema.add_primitive("string", "type_name", 6)?;
    schema.add_primitive("string", "default_value", 7)?;
    schema.add_field(embedded(field_options()?), "options", 8, false)?;
    Ok(schema)
}

fn enum_value_descriptor() -> Result<MessageSchema> {
    let mut schema = MessageSchema::new();
    schema.add_primitive("string", "name", 1)?;
    schema.add_primitive("int32", "number", 2)?;
    Ok(schema)
}

fn enum_descriptor() -> Result<MessageSchema> {
    let mut schema = MessageSchema::new();
    schema.add_primitive("string", "name", 1)?;
    schema.add_field(embedded(enum_value_descriptor()?), "value", 2, false)?;
    Ok(schema)
}

fn message_descriptor(max_depth: usize) -> Result<MessageSchema> {
    let mut schema = MessageSchema::new();
    schema.add_primitive("string", "name", 1)?;
    schema.add_field(embedded(field_descriptor()?), "field", 2, false)?;
    if max_depth > 0 {
        // `nested_type` on the wire, exposed as `message_type` so the
        // builder walks files and messages uniformly
        schema.add_field(embedded(message_descriptor(max_depth - 1)?), "message_type", 3, false)?;
    }
    schema.add_field(embedded(enum_descriptor()?), "enum_type", 4, false)?;
    Ok(schema)
}

fn file_descriptor(max_depth: usize) -> Result<MessageSchema> {
    let mut schema = MessageSchema::new();
    schema.add_primitive("string", "name", 1)?;
    schema.add_primitive("string", "package", 2)?;
    schema.add_primitive("string", "syntax", 12)?;
    schema.add_field(embedded(message_descriptor(max_depth)?), "message_type", 4, false)?;
    schema.add_field(embedded(enum_descriptor()?), "enum_type", 5, false)?;
    Ok(schema)
}

/// The schema of a whole descriptor set, as produced by
/// `protoc --include_imports --descriptor_set_out`.
pub fn file_descriptor_set(max_depth: usize) -> Result<MessageSchema> {
    let mut schema = MessageSchema::new();
    schema.add_field(embedded(file_descriptor(max_depth)?), "file", 1, false)?;
    Ok(schema)
}

fn embedded(schema: MessageSchema) -> Field {
    Field::Message(Message::new(Arc::new(schema)))
}

/// Field type name for a `FieldDescriptorProto.Type` value.
pub fn type_name_by_id(id: i64) -> Result<&'static str> {
    match id {
        1 => Ok("double"),
        2 => Ok("float"),
        3 => Ok("int64"),
        4 => Ok("uint64"),
        5 => Ok("int32"),
        8 => Ok("bool"),
        9 | 12 => Ok("string"),
        11 => Ok("message"),
        13 => Ok("uint32"),
        14 => Ok("enum"),
        _ => bail!(ErrorKind::Parse(format!("unknown protobuf type id [{}]", id))),
    }
}

/// Field label name for a `FieldDescriptorProto.Label` value.
pub fn label_by_id(id: i64) -> Result<&'static str> {
    match id {
        1 => Ok("optional"),
        2 => Ok("required"),
        3 => Ok("repeated"),
        _ => bail!(ErrorKind::Parse(format!("unknown protobuf label id [{}]", id))),
    }
}

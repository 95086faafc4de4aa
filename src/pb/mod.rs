//! Self-describing protobuf engine.
//!
//! The parsing schema is built at runtime from a compiled
//! `FileDescriptorSet` (the output of `protoc --include_imports`): the
//! descriptor set is itself decoded with the hand-written bootstrap
//! schema from [`descriptor`], then [`builder`] assembles the schema of
//! the requested root message. The same machinery then decodes binary
//! `.pb` or textual `.pbtxt` payloads of that message.

pub mod builder;
pub mod descriptor;
pub mod message;
pub mod node;
pub mod text;
pub mod value;
pub mod wire;

use std::fs;
use std::path::Path;
use std::sync::Arc;

pub use self::message::{FieldDef, Message, MessageSchema};
pub use self::node::Node;
pub use self::value::{EnumValue, Field, Packed};
pub use self::wire::ByteStream;

use self::text::TokenCursor;
use crate::{ErrorKind, Result};

/// Parser for one root message type, ready to decode any number of
/// payloads of that type.
pub struct ProtobufParser {
    root: Field,
}

impl ProtobufParser {
    /// Build a parser from descriptor set bytes and a fully qualified
    /// root message name (with its leading dot, e.g. `.caffe.NetParameter`).
    pub fn new(descriptor_set: &[u8], root_message: &str) -> Result<ProtobufParser> {
        Self::with_max_depth(descriptor_set, root_message, descriptor::DEFAULT_MAX_MESSAGE_DEPTH)
    }

    /// Same, for schemas nesting message declarations deeper than the
    /// default bound.
    pub fn with_max_depth(
        descriptor_set: &[u8],
        root_message: &str,
        max_depth: usize,
    ) -> Result<ProtobufParser> {
        let bootstrap = Arc::new(descriptor::file_descriptor_set(max_depth)?);
        let mut set = Message::new(bootstrap);
        set.read_binary(&mut ByteStream::new(descriptor_set))?;
        let schema = builder::build(&set, root_message)?;
        Ok(ProtobufParser { root: Field::Message(Message::new(Arc::new(schema))) })
    }

    pub fn from_path(path: impl AsRef<Path>, root_message: &str) -> Result<ProtobufParser> {
        Self::new(&fs::read(path)?, root_message)
    }

    fn root_message(&self) -> Result<&Message> {
        match &self.root {
            Field::Message(m) => Ok(m),
            _ => bail!(ErrorKind::Internal("parser root is not a message".to_string())),
        }
    }

    fn root_message_mut(&mut self) -> Result<&mut Message> {
        match &mut self.root {
            Field::Message(m) => Ok(m),
            _ => bail!(ErrorKind::Internal("parser root is not a message".to_string())),
        }
    }

    /// Decode one binary payload, replacing anything parsed before.
    pub fn parse_binary(&mut self, payload: &[u8]) -> Result<()> {
        self.root_message_mut()?.read_binary(&mut ByteStream::new(payload))
    }

    /// Decode one text format payload, replacing anything parsed before.
    pub fn parse_text(&mut self, payload: &str) -> Result<()> {
        self.root_message_mut()?.read_text(&mut TokenCursor::for_document(payload))
    }

    pub fn parse_file(&mut self, path: impl AsRef<Path>, is_text: bool) -> Result<()> {
        if is_text {
            let content = fs::read_to_string(path)?;
            self.parse_text(&content)
        } else {
            self.parse_binary(&fs::read(path)?)
        }
    }

    /// The parsed document as a navigable node.
    pub fn root(&self) -> Node {
        Node::from_fields(vec![&self.root])
    }

    /// Values of a top-level field (or its default).
    pub fn get(&self, name: &str) -> Node {
        match &self.root {
            Field::Message(m) => m.node(name),
            _ => Node::from_fields(vec![]),
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.root_message().map(|m| m.has(name)).unwrap_or(false)
    }

    pub fn remove(&mut self, name: &str, idx: usize) -> Result<()> {
        self.root_message_mut()?.remove(name, idx)
    }
}

/// Wire-format encoders for building test payloads and descriptors.
#[cfg(test)]
pub(crate) mod enc {
    pub use super::wire::encode_varint as varint;

    pub fn key(tag: u64, wire: u64) -> Vec<u8> {
        varint(tag << 3 | wire)
    }

    pub fn field_varint(tag: u64, v: u64) -> Vec<u8> {
        let mut out = key(tag, 0);
        out.extend(varint(v));
        out
    }

    pub fn field_bytes(tag: u64, bytes: &[u8]) -> Vec<u8> {
        let mut out = key(tag, 2);
        out.extend(varint(bytes.len() as u64));
        out.extend(bytes);
        out
    }

    pub fn field_str(tag: u64, s: &str) -> Vec<u8> {
        field_bytes(tag, s.as_bytes())
    }

    /// `FieldDescriptorProto`
    pub struct FieldSpec {
        pub name: &'static str,
        pub number: u64,
        pub label: u64,
        pub type_id: u64,
        pub type_name: Option<&'static str>,
        pub default_value: Option<&'static str>,
        pub packed: bool,
    }

    impl FieldSpec {
        pub fn plain(name: &'static str, number: u64, type_id: u64) -> FieldSpec {
            FieldSpec {
                name,
                number,
                label: 1,
                type_id,
                type_name: None,
                default_value: None,
                packed: false,
            }
        }

        pub fn repeated(name: &'static str, number: u64, type_id: u64) -> FieldSpec {
            FieldSpec { label: 3, ..FieldSpec::plain(name, number, type_id) }
        }

        pub fn message(name: &'static str, number: u64, type_name: &'static str) -> FieldSpec {
            FieldSpec { type_name: Some(type_name), ..FieldSpec::plain(name, number, 11) }
        }

        pub fn packed(self) -> FieldSpec {
            FieldSpec { packed: true, ..self }
        }

        pub fn with_default(self, default_value: &'static str) -> FieldSpec {
            FieldSpec { default_value: Some(default_value), ..self }
        }

        pub fn encode(&self) -> Vec<u8> {
            let mut out = field_str(1, self.name);
            out.extend(field_varint(3, self.number));
            out.extend(field_varint(4, self.label));
            out.extend(field_varint(5, self.type_id));
            if let Some(type_name) = self.type_name {
                out.extend(field_str(6, type_name));
            }
            if let Some(default_value) = self.default_value {
                out.extend(field_str(7, default_value));
            }
            if self.packed {
                out.extend(field_bytes(8, &field_varint(2, 1)));
            }
            out
        }
    }

    /// `DescriptorProto`: name, fields, nested types, enums.
    pub fn message_type(
        name: &str,
        fields: &[FieldSpec],
        nested: &[Vec<u8>],
        enums: &[Vec<u8>],
    ) -> Vec<u8> {
        let mut out = field_str(1, name);
        for f in fields {
            out.extend(field_bytes(2, &f.encode()));
        }
        for n in nested {
            out.extend(field_bytes(3, n));
        }
        for e in enums {
            out.extend(field_bytes(4, e));
        }
        out
    }

    /// `EnumDescriptorProto`
    pub fn enum_type(name: &str, values: &[(&str, u64)]) -> Vec<u8> {
        let mut out = field_str(1, name);
        for (symbol, id) in values {
            let mut value = field_str(1, symbol);
            value.extend(field_varint(2, *id));
            out.extend(field_bytes(2, &value));
        }
        out
    }

    /// `FileDescriptorProto`
    pub fn file(
        package: Option<&str>,
        syntax: Option<&str>,
        messages: &[Vec<u8>],
        enums: &[Vec<u8>],
    ) -> Vec<u8> {
        let mut out = field_str(1, "test.proto");
        if let Some(package) = package {
            out.extend(field_str(2, package));
        }
        for m in messages {
            out.extend(field_bytes(4, m));
        }
        for e in enums {
            out.extend(field_bytes(5, e));
        }
        if let Some(syntax) = syntax {
            out.extend(field_str(12, syntax));
        }
        out
    }

    /// `FileDescriptorSet`
    pub fn descriptor_set(files: &[Vec<u8>]) -> Vec<u8> {
        let mut out = vec![];
        for f in files {
            out.extend(field_bytes(1, f));
        }
        out
    }
}

//! Message schemas and their parsed instances.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use crate::pb::node::Node;
use crate::pb::text::TokenCursor;
use crate::pb::value::{self, Field};
use crate::pb::wire::ByteStream;
use crate::{ErrorKind, Result};

/// One field slot of a schema: the parsing template plus its identity.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub tag: i32,
    pub template: Field,
    pub has_default: bool,
}

/// The parsing pattern for one message type: an ordered bag of field
/// templates indexed both by tag and by name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MessageSchema {
    fields: Vec<FieldDef>,
    by_tag: HashMap<i32, usize>,
    by_name: HashMap<String, usize>,
}

impl MessageSchema {
    pub fn new() -> MessageSchema {
        MessageSchema::default()
    }

    pub fn add_field(
        &mut self,
        template: Field,
        name: &str,
        tag: i32,
        has_default: bool,
    ) -> Result<()> {
        if self.by_tag.contains_key(&tag) {
            bail!(ErrorKind::Duplicate(format!("field tag [{}] in message schema", tag)));
        }
        if self.by_name.contains_key(name) {
            bail!(ErrorKind::Duplicate(format!("field name \"{}\" in message schema", name)));
        }
        self.by_tag.insert(tag, self.fields.len());
        self.by_name.insert(name.to_string(), self.fields.len());
        self.fields.push(FieldDef { name: name.to_string(), tag, template, has_default });
        Ok(())
    }

    /// Shortcut for declaring a primitive field without default value.
    pub fn add_primitive(&mut self, type_name: &str, name: &str, tag: i32) -> Result<()> {
        self.add_field(value::primitive(type_name, "", false)?, name, tag, false)
    }

    pub fn field_by_tag(&self, tag: i32) -> Option<&FieldDef> {
        self.by_tag.get(&tag).map(|&i| &self.fields[i])
    }

    pub fn field_by_name(&self, name: &str) -> Option<&FieldDef> {
        self.by_name.get(name).map(|&i| &self.fields[i])
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }
}

/// A message instance: shared schema plus whatever was read from the
/// wire, as `name -> values` in wire order.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    schema: Arc<MessageSchema>,
    fields: BTreeMap<String, Vec<Field>>,
}

impl Message {
    pub fn new(schema: Arc<MessageSchema>) -> Message {
        Message { schema, fields: BTreeMap::new() }
    }

    pub fn schema(&self) -> &Arc<MessageSchema> {
        &self.schema
    }

    /// Decode from binary wire data. An embedded message (anywhere but
    /// the very beginning of the stream) starts with its byte length;
    /// the top-level message runs to the end of input. Unknown tags are
    /// skipped according to their wire type.
    pub fn read_binary(&mut self, s: &mut ByteStream) -> Result<()> {
        self.fields.clear();

        let end = if s.tell() != 0 {
            let num_bytes = s.read_varint()? as usize;
            Some(s.tell() + num_bytes)
        } else {
            None
        };

        loop {
            if let Some(end) = end {
                if s.tell() >= end {
                    break;
                }
            }
            let (tag, wire) = match s.read_key()? {
                Some(key) => key,
                None => break,
            };
            match self.schema.field_by_tag(tag) {
                Some(def) => {
                    let mut field = def.template.clone();
                    field.read_binary(s)?;
                    self.fields.entry(def.name.clone()).or_insert_with(Vec::new).push(field);
                }
                None => s.skip_field(wire)?,
            }
        }

        if let Some(end) = end {
            if !s.eof() && s.tell() != end {
                bail!(ErrorKind::Parse(format!(
                    "embedded message ends at {} instead of {}",
                    s.tell(),
                    end
                )));
            }
        }
        Ok(())
    }

    /// Decode from a token stream: `{`, then `name value` pairs until
    /// the matching `}`. There is no tag to skip by in text form, so an
    /// unknown name is fatal.
    pub fn read_text(&mut self, cursor: &mut TokenCursor) -> Result<()> {
        self.fields.clear();

        let open = cursor.next()?;
        if open != "{" {
            bail!(ErrorKind::Parse(format!("expected '{{', got \"{}\"", open)));
        }
        loop {
            if cursor.peek() == Some("}") {
                cursor.next()?;
                return Ok(());
            }
            let name = cursor.next()?;
            let def = self.schema.field_by_name(&name).ok_or_else(|| {
                ErrorKind::NotImplemented(format!(
                    "skip of unknown field \"{}\" in text format",
                    name
                ))
            })?;
            let mut field = def.template.clone();
            field.read_text(cursor)?;
            self.fields.entry(def.name.clone()).or_insert_with(Vec::new).push(field);
        }
    }

    /// Parsed values for a field, the default as a singleton when the
    /// field has one and nothing was read, an empty node otherwise.
    pub fn node(&self, name: &str) -> Node {
        if let Some(values) = self.fields.get(name) {
            return Node::from_fields(values.iter().collect());
        }
        match self.schema.field_by_name(name) {
            Some(def) if def.has_default => Node::from_fields(vec![&def.template]),
            _ => Node::from_fields(vec![]),
        }
    }

    /// True only for fields actually read; defaults do not count.
    pub fn has(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Drop the idx-th parsed occurrence of a field.
    pub fn remove(&mut self, name: &str, idx: usize) -> Result<()> {
        let values = self
            .fields
            .get_mut(name)
            .ok_or_else(|| ErrorKind::NotFound(format!("field \"{}\"", name)))?;
        if idx >= values.len() {
            bail!(ErrorKind::NotFound(format!(
                "occurrence [{}] of field \"{}\" ({} read)",
                idx,
                name,
                values.len()
            )));
        }
        values.remove(idx);
        if values.is_empty() {
            self.fields.remove(name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pb::wire::encode_varint;

    fn schema() -> Arc<MessageSchema> {
        let mut schema = MessageSchema::new();
        schema.add_primitive("int32", "a", 1).unwrap();
        schema.add_primitive("string", "s", 2).unwrap();
        schema
            .add_field(value::primitive("float", "-0.5", false).unwrap(), "f", 3, true)
            .unwrap();
        Arc::new(schema)
    }

    #[test]
    fn unique_tags_and_names() {
        let mut schema = MessageSchema::new();
        schema.add_primitive("int32", "a", 1).unwrap();
        assert!(schema.add_primitive("int32", "b", 1).is_err());
        assert!(schema.add_primitive("int32", "a", 2).is_err());
    }

    #[test]
    fn wire_order_and_repeats() {
        // a: 7, s: "hi", a: 12
        let bytes = vec![0x08, 0x07, 0x12, 0x02, b'h', b'i', 0x08, 0x0c];
        let mut msg = Message::new(schema());
        msg.read_binary(&mut ByteStream::new(&bytes)).unwrap();
        assert!(msg.has("a"));
        assert_eq!(msg.node("a").size(), 2);
        assert_eq!(msg.node("a").at(0).unwrap().as_i32().unwrap(), 7);
        assert_eq!(msg.node("a").at(1).unwrap().as_i32().unwrap(), 12);
        assert_eq!(msg.node("s").as_str().unwrap(), "hi");
    }

    #[test]
    fn unknown_tags_are_skipped() {
        // tag 9 varint, tag 10 length-delimited, then a: 3
        let bytes = vec![0x48, 0x2a, 0x52, 0x03, 1, 2, 3, 0x08, 0x03];
        let mut msg = Message::new(schema());
        msg.read_binary(&mut ByteStream::new(&bytes)).unwrap();
        assert_eq!(msg.node("a").as_i32().unwrap(), 3);
    }

    #[test]
    fn default_materializes_without_has() {
        let mut msg = Message::new(schema());
        msg.read_binary(&mut ByteStream::new(&[])).unwrap();
        assert!(!msg.has("f"));
        assert_eq!(msg.node("f").as_f32().unwrap(), -0.5);
        assert!(msg.node("a").empty());
    }

    #[test]
    fn remove_checks_bounds() {
        let mut msg = Message::new(schema());
        msg.read_binary(&mut ByteStream::new(&[0x08, 0x07])).unwrap();
        assert!(msg.remove("a", 1).is_err());
        msg.remove("a", 0).unwrap();
        assert!(!msg.has("a"));
    }

    #[test]
    fn embedded_length_is_enforced() {
        // embedded message claiming 2 bytes but its field runs over it
        let bytes = vec![0x00, 0x02, 0x12, 0x02, b'h', b'i', 0xff];
        let mut s = ByteStream::new(&bytes);
        s.skip(1).unwrap();
        let mut msg = Message::new(schema());
        assert!(msg.read_binary(&mut s).is_err());
    }

    #[test]
    fn varint_round_trip() {
        for v in 0..300u64 {
            let bytes = encode_varint(v);
            let mut s = ByteStream::new(&bytes);
            assert_eq!(s.read_varint().unwrap(), v);
            assert!(s.eof());
        }
    }
}

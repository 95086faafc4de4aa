//! Turns a decoded descriptor set into message schemas.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::pb::descriptor::{label_by_id, type_name_by_id};
use crate::pb::message::{Message, MessageSchema};
use crate::pb::node::Node;
use crate::pb::value::{self, EnumValue, Field};
use crate::{ErrorKind, Result};

/// Build the schema of `root_message` (fully qualified, leading dot)
/// out of a parsed `FileDescriptorSet`.
pub fn build(descriptor_set: &Message, root_message: &str) -> Result<MessageSchema> {
    let mut type_nodes = HashMap::new();
    let files = descriptor_set.node("file");
    let mut proto3 = false;
    for i in 0..files.size() {
        let file = files.at(i)?;
        collect_file_types(&file, &mut type_nodes)?;
        proto3 = proto3 || file.has("syntax")? && file.by_name("syntax")?.as_str()? == "proto3";
    }
    let mut built = HashMap::new();
    build_message(root_message, &type_nodes, &mut built, proto3)
}

fn collect_file_types<'a>(file: &Node<'a>, out: &mut HashMap<String, Node<'a>>) -> Result<()> {
    let package = if file.has("package")? {
        format!(".{}", file.by_name("package")?.as_str()?)
    } else {
        String::new()
    };
    if file.has("message_type")? {
        collect_types(&file.by_name("message_type")?, &package, out)?;
    }
    if file.has("enum_type")? {
        collect_types(&file.by_name("enum_type")?, &package, out)?;
    }
    Ok(())
}

fn collect_types<'a>(
    types: &Node<'a>,
    parent: &str,
    out: &mut HashMap<String, Node<'a>>,
) -> Result<()> {
    for i in 0..types.size() {
        let node = types.at(i)?;
        if !node.has("name")? {
            bail!(ErrorKind::Parse("type declaration without a name".to_string()));
        }
        let name = format!("{}.{}", parent, node.by_name("name")?.as_str()?);
        if out.insert(name.clone(), node.clone()).is_some() {
            bail!(ErrorKind::Duplicate(format!("type name \"{}\"", name)));
        }
        if node.has("message_type")? {
            collect_types(&node.by_name("message_type")?, &name, out)?;
        }
        if node.has("enum_type")? {
            collect_types(&node.by_name("enum_type")?, &name, out)?;
        }
    }
    Ok(())
}

/// Schemas are memoized by name before their fields are filled in, so a
/// message referring to itself resolves to a snapshot of what has been
/// built so far. That keeps the template graph finite on cyclic
/// schemas.
fn build_message(
    name: &str,
    type_nodes: &HashMap<String, Node>,
    built: &mut HashMap<String, MessageSchema>,
    proto3: bool,
) -> Result<MessageSchema> {
    if let Some(schema) = built.get(name) {
        return Ok(schema.clone());
    }
    let message_node = type_nodes
        .get(name)
        .ok_or_else(|| ErrorKind::Parse(format!("message type \"{}\" not found", name)))?
        .clone();
    built.insert(name.to_string(), MessageSchema::new());

    let fields = message_node.by_name("field")?;
    for i in 0..fields.size() {
        let field = fields.at(i)?;
        for required in &["name", "number", "type", "label"] {
            if !field.has(required)? {
                bail!(ErrorKind::Parse(format!(
                    "field declaration in \"{}\" without \"{}\"",
                    name, required
                )));
            }
        }
        let field_name = field.by_name("name")?.as_str()?;
        let tag = field.by_name("number")?.as_i32()?;
        let kind = type_name_by_id(field.by_name("type")?.as_i64()?)?;
        let type_str = if field.has("type_name")? {
            field.by_name("type_name")?.as_str()?.to_string()
        } else {
            kind.to_string()
        };
        let default_value = if field.has("default_value")? {
            field.by_name("default_value")?.as_str()?.to_string()
        } else {
            String::new()
        };
        let label = label_by_id(field.by_name("label")?.as_i64()?)?;
        let explicit_packed = field.has("options")? && {
            let options = field.by_name("options")?;
            options.has("packed")? && options.by_name("packed")?.as_bool()?
        };
        let packed = explicit_packed || proto3 && label == "repeated";

        let template = match kind {
            "message" => {
                let sub = build_message(&type_str, type_nodes, built, proto3)?;
                Field::Message(Message::new(Arc::new(sub)))
            }
            "enum" => build_enum(&type_str, type_nodes, &default_value, packed)?,
            _ => value::primitive(&type_str, &default_value, packed)?,
        };
        built
            .get_mut(name)
            .ok_or_else(|| ErrorKind::Internal(format!("memoized schema \"{}\" vanished", name)))?
            .add_field(template, field_name, tag, !default_value.is_empty())?;
    }
    built
        .get(name)
        .cloned()
        .ok_or_else(|| ErrorKind::Internal(format!("memoized schema \"{}\" vanished", name)).into())
}

fn build_enum(
    name: &str,
    type_nodes: &HashMap<String, Node>,
    default_value: &str,
    packed: bool,
) -> Result<Field> {
    let enum_node = type_nodes
        .get(name)
        .ok_or_else(|| ErrorKind::Parse(format!("enum type \"{}\" not found", name)))?;
    let values = enum_node.by_name("value")?;
    let mut by_id = BTreeMap::new();
    for i in 0..values.size() {
        let value = values.at(i)?;
        let id = value.by_name("number")?.as_i32()?;
        let symbol = value.by_name("name")?.as_str()?.to_string();
        if by_id.insert(id, symbol).is_some() {
            bail!(ErrorKind::Duplicate(format!("enum value id [{}] in \"{}\"", id, name)));
        }
    }
    Ok(Field::Enum(EnumValue {
        name: default_value.to_string(),
        values: Arc::new(by_id),
        packed,
    }))
}

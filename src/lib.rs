//! # thdeploy
//!
//! Tiny, self-contained model deserialization.
//!
//! Two importers live here. The first is a self-describing protobuf
//! engine: feed it a compiled `FileDescriptorSet` (the output of
//! `protoc --include_imports`) and a root message name, and it builds a
//! parsing schema at runtime, able to decode both binary `.pb` and
//! textual `.pbtxt` payloads. No generated code is involved at any
//! point.
//!
//! The second reads the legacy Torch7 binary object stream, translates
//! the serialized module tree into a graph of primitive layers, and
//! hands it to a small runtime ([`Net`]) that propagates shapes,
//! allocates blobs and runs layers in topological order. Layer kernels
//! are not part of this crate: implement [`net::Layer`] and register
//! constructors through [`net::factory`].

#[macro_use]
extern crate derive_new;
#[macro_use]
extern crate error_chain;
#[macro_use]
extern crate lazy_static;
#[allow(unused_imports)]
#[macro_use]
extern crate log;

pub mod net;
pub mod params;
pub mod pb;
pub mod tensor;
pub mod torch;

pub use crate::net::Net;
pub use crate::params::{Dict, LayerParams, ParamValue};
pub use crate::pb::ProtobufParser;
pub use crate::tensor::{Blob, Shape, TVec};

error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }
    foreign_links {
        Io(::std::io::Error);
        Utf8(::std::str::Utf8Error);
        FromUtf8(::std::string::FromUtf8Error);
    }
    errors {
        Parse(msg: String) {
            description("malformed input")
            display("parse error: {}", msg)
        }
        TypeMismatch(msg: String) {
            description("type mismatch")
            display("type mismatch: {}", msg)
        }
        NotFound(msg: String) {
            description("object not found")
            display("not found: {}", msg)
        }
        NotImplemented(msg: String) {
            description("not implemented")
            display("not implemented: {}", msg)
        }
        Duplicate(msg: String) {
            description("duplicate object")
            display("duplicate: {}", msg)
        }
        Internal(msg: String) {
            description("internal invariant breach")
            display("internal error: {}", msg)
        }
    }
}

//! Importer for the legacy Torch7 binary serialization format.
//!
//! ```no_run
//! # fn main() -> thdeploy::Result<()> {
//! let mut net = thdeploy::torch::for_path("vgg16.t7")?;
//! # Ok(())
//! # }
//! ```

pub mod importer;
pub mod lower;
pub mod stream;

use std::fs;
use std::io::{BufReader, Read, Seek};
use std::path::Path;

pub use self::importer::{Module, TorchImporter};

use crate::net::Net;
use crate::tensor::Blob;
use crate::Result;

/// Import a serialized network from a file.
pub fn for_path(path: impl AsRef<Path>) -> Result<Net> {
    for_reader(BufReader::new(fs::File::open(path)?))
}

/// Import a serialized network from any seekable reader.
pub fn for_reader<R: Read + Seek>(reader: R) -> Result<Net> {
    let mut net = Net::new();
    populate_net(reader, &mut net)?;
    Ok(net)
}

/// Decode the module tree and lower it onto an existing net.
pub fn populate_net<R: Read + Seek>(reader: R, net: &mut Net) -> Result<()> {
    let mut importer = TorchImporter::new(reader);
    let root = importer.read_root()?;
    lower::populate(&root, net)
}

/// Read a stream holding a single serialized tensor.
pub fn read_blob<R: Read + Seek>(reader: R) -> Result<Blob> {
    TorchImporter::new(reader).read_blob()
}

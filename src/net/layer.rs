//! The layer contract the runtime graph drives.

use std::fmt::Debug;

use crate::tensor::{Blob, Shape};
use crate::{ErrorKind, Result};

/// What a layer needs allocated: its output shapes, scratch shapes, and
/// whether outputs may alias same-sized inputs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MemoryShapes {
    pub outputs: Vec<Shape>,
    pub internals: Vec<Shape>,
    pub inplace: bool,
}

/// A computation kernel. Implementations live outside this crate and
/// are registered through [`crate::net::factory`].
pub trait Layer: Debug {
    /// Output and scratch shapes for the given input shapes. Must be a
    /// pure function of the layer parameters and `inputs`.
    ///
    /// The default replicates the first input shape over
    /// `required_outputs` outputs and does not allow aliasing.
    fn memory_shapes(&self, inputs: &[Shape], required_outputs: usize) -> Result<MemoryShapes> {
        let first = inputs
            .first()
            .ok_or_else(|| ErrorKind::Internal("layer without inputs".to_string()))?;
        Ok(MemoryShapes {
            outputs: vec![first.clone(); required_outputs.max(inputs.len())],
            internals: vec![],
            inplace: false,
        })
    }

    /// Called once after blobs are bound, before the first forward.
    fn finalize(&mut self, _inputs: &[Blob], _outputs: &mut [Blob]) -> Result<()> {
        Ok(())
    }

    /// Compute outputs from inputs. An output blob may share storage
    /// with an input blob when the layer declared `inplace`; writes go
    /// through [`Blob::data_mut`], which unshares lazily, so reading a
    /// stale input after writing the aliased output is the only misuse.
    fn forward(
        &mut self,
        inputs: &[Blob],
        outputs: &mut [Blob],
        internals: &mut [Blob],
    ) -> Result<()>;

    /// Estimated work for one forward pass.
    fn flops(&self, _inputs: &[Shape], _outputs: &[Shape]) -> i64 {
        0
    }

    fn input_name_to_index(&self, _name: &str) -> Option<usize> {
        None
    }

    fn output_name_to_index(&self, _name: &str) -> Option<usize> {
        None
    }
}

/// Sentinel layer holding the network input blobs at id 0.
#[derive(Debug, Default)]
pub struct DataLayer {
    names: Vec<String>,
}

impl DataLayer {
    pub fn set_names(&mut self, names: &[&str]) {
        self.names = names.iter().map(|s| s.to_string()).collect();
    }
}

impl Layer for DataLayer {
    fn memory_shapes(&self, inputs: &[Shape], required_outputs: usize) -> Result<MemoryShapes> {
        // input shapes are seeded by the network, pass them through
        Ok(MemoryShapes {
            outputs: if inputs.len() >= required_outputs {
                inputs.to_vec()
            } else {
                let mut outputs = inputs.to_vec();
                let first = inputs
                    .first()
                    .cloned()
                    .ok_or_else(|| ErrorKind::Internal("network inputs not set".to_string()))?;
                outputs.resize(required_outputs, first);
                outputs
            },
            internals: vec![],
            inplace: false,
        })
    }

    fn forward(&mut self, _: &[Blob], _: &mut [Blob], _: &mut [Blob]) -> Result<()> {
        Ok(())
    }

    fn output_name_to_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }
}

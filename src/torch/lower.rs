//! Lowers a module tree onto the runtime graph: containers become
//! Split/Slice/Reshape/Concat/Eltwise plumbing, primitives become
//! layers wired by pins.

use crate::net::Net;
use crate::params::LayerParams;
use crate::torch::importer::Module;
use crate::{ErrorKind, Result};

pub fn populate(root: &Module, net: &mut Net) -> Result<()> {
    let mut lowerer = Lowerer { counter: 0, added: vec![] };
    lowerer.fill(net, root, 0, 0)?;
    Ok(())
}

struct Lowerer<'m> {
    counter: usize,
    /// Layers added so far, with the module they came from, in
    /// placement order. The unpooling resolver scans this.
    added: Vec<(usize, &'m Module)>,
}

impl<'m> Lowerer<'m> {
    fn layer_name(&mut self, label: &str) -> String {
        self.counter += 1;
        format!("l{}_{}", self.counter, label)
    }

    /// Place one module, connecting it after `(prev_id, prev_slot)`.
    /// Returns the id whose output the next sibling continues from.
    fn fill(
        &mut self,
        net: &mut Net,
        module: &'m Module,
        prev_id: usize,
        prev_slot: usize,
    ) -> Result<usize> {
        if let Some(api_type) = &module.api_type {
            let name = self.layer_name(api_type);
            let id = net.add_layer(&name, api_type, module.params.clone())?;
            net.connect(prev_id, prev_slot, id, 0)?;
            self.added.push((id, module));
            return Ok(id);
        }

        match &*module.class {
            "Sequential" => {
                let mut prev_id = prev_id;
                let mut prev_slot = prev_slot;
                for child in &module.children {
                    prev_id = self.fill(net, child, prev_id, prev_slot)?;
                    prev_slot = 0;
                }
                Ok(prev_id)
            }
            "Concat" => {
                let mut merge_params = LayerParams::default();
                merge_params.set("axis", module.params.get_int("dimension")? - 1);

                let split_name = self.layer_name("torchSplit");
                let split_id = net.add_layer(&split_name, "Split", LayerParams::default())?;
                let merge_name = self.layer_name("torchMerge");
                let merge_id = net.add_layer(&merge_name, "Concat", merge_params)?;
                net.connect(prev_id, prev_slot, split_id, 0)?;

                for (i, child) in module.children.iter().enumerate() {
                    let branch_id = self.fill(net, child, split_id, i)?;
                    net.connect(branch_id, 0, merge_id, i)?;
                }
                self.added.push((merge_id, module));
                Ok(merge_id)
            }
            "Parallel" => {
                let axis = module.params.get_int("inputDimension")? - 1;
                let mut split_params = LayerParams::default();
                split_params.set("axis", axis);
                let mut merge_params = LayerParams::default();
                merge_params.set("axis", module.params.get_int("outputDimension")? - 1);
                // each slice loses the split axis before entering its branch
                let mut reshape_params = LayerParams::default();
                reshape_params.set("axis", axis);
                reshape_params.set("num_axes", 1);

                let split_name = self.layer_name("torchSplit");
                let split_id = net.add_layer(&split_name, "Slice", split_params)?;
                let merge_name = self.layer_name("torchMerge");
                let merge_id = net.add_layer(&merge_name, "Concat", merge_params)?;
                let reshape_name = self.layer_name("torchReshape");
                let reshape_id = net.add_layer(&reshape_name, "Reshape", reshape_params)?;
                net.connect(prev_id, prev_slot, split_id, 0)?;

                for (i, child) in module.children.iter().enumerate() {
                    net.connect(split_id, i, reshape_id, i)?;
                    let branch_id = self.fill(net, child, reshape_id, i)?;
                    net.connect(branch_id, 0, merge_id, i)?;
                }
                self.added.push((merge_id, module));
                Ok(merge_id)
            }
            "ConcatTable" => {
                let split_name = self.layer_name("torchSplit");
                let split_id = net.add_layer(&split_name, "Split", LayerParams::default())?;
                net.connect(prev_id, prev_slot, split_id, 0)?;
                self.added.push((split_id, module));

                let mut last_id = None;
                for (i, child) in module.children.iter().enumerate() {
                    last_id = Some(self.fill(net, child, split_id, i)?);
                }
                // the table's consumers (JoinTable, CAddTable) pick the
                // branch ends up themselves
                last_id.ok_or_else(|| {
                    ErrorKind::Parse("ConcatTable without branches".to_string()).into()
                })
            }
            "JoinTable" => {
                let loose_ends = net.unconnected_out_layers();
                let mut merge_params = LayerParams::default();
                merge_params.set("axis", module.params.get_int("dimension")? - 1);
                let merge_name = self.layer_name("torchMerge");
                let merge_id = net.add_layer(&merge_name, "Concat", merge_params)?;
                self.added.push((merge_id, module));
                for (i, id) in loose_ends.iter().enumerate() {
                    net.connect(*id, 0, merge_id, i)?;
                }
                Ok(merge_id)
            }
            "CAddTable" => {
                let loose_ends = net.unconnected_out_layers();
                let mut params = LayerParams::default();
                params.set("operation", "sum");
                let name = self.layer_name("torchCAddTable");
                let id = net.add_layer(&name, "Eltwise", params)?;
                for (i, src) in loose_ends.iter().enumerate() {
                    net.connect(*src, 0, id, i)?;
                }
                self.added.push((id, module));
                Ok(id)
            }
            "SpatialMaxUnpooling" => {
                let indices_id = module.params.get_int("indices_blob_id")?;
                // the pooling layer that produced those indices; its
                // second output carries them
                let pool = self
                    .added
                    .iter()
                    .find(|(_, m)| {
                        m.api_type.as_deref() == Some("Pooling")
                            && m.params
                                .get_opt("indices_blob_id")
                                .and_then(|v| v.as_int().ok())
                                == Some(indices_id)
                    })
                    .map(|&(id, m)| (id, m));
                let (pool_id, pool_module) = pool.ok_or_else(|| {
                    ErrorKind::NotFound(format!(
                        "pooling layer producing indices blob [{}]",
                        indices_id
                    ))
                })?;

                let mut params = module.params.clone();
                params.set("pool_k_h", pool_module.params.get_int("kernel_h")?);
                params.set("pool_k_w", pool_module.params.get_int("kernel_w")?);
                params.set("pool_stride_h", pool_module.params.get_int("stride_h")?);
                params.set("pool_stride_w", pool_module.params.get_int("stride_w")?);
                params.set("pool_pad_h", pool_module.params.get_int("pad_h")?);
                params.set("pool_pad_w", pool_module.params.get_int("pad_w")?);

                let name = self.layer_name("torchMaxUnpooling");
                let id = net.add_layer(&name, "MaxUnpool", params)?;
                net.connect(prev_id, prev_slot, id, 0)?;
                net.connect(pool_id, 1, id, 1)?;
                Ok(id)
            }
            other => bail!(ErrorKind::Internal(format!("unexpected torch container \"{}\"", other))),
        }
    }
}

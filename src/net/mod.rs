//! In-memory runtime graph: layers wired by pins, shape propagation,
//! blob allocation and topological forward execution.

pub mod factory;
pub mod layer;

pub use self::layer::{DataLayer, Layer, MemoryShapes};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::mem;

use bit_set::BitSet;

use crate::params::LayerParams;
use crate::tensor::{Blob, Shape};
use crate::{ErrorKind, Result, ResultExt};

/// One output of one layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, new)]
pub struct LayerPin {
    pub layer: usize,
    pub slot: usize,
}

/// A layer designated either by id or by name.
#[derive(Clone, Debug)]
pub enum LayerId {
    Index(usize),
    Name(String),
}

impl From<usize> for LayerId {
    fn from(id: usize) -> LayerId {
        LayerId::Index(id)
    }
}

impl From<&str> for LayerId {
    fn from(name: &str) -> LayerId {
        LayerId::Name(name.to_string())
    }
}

/// Everything the network tracks about one layer.
#[derive(Debug)]
pub struct LayerData {
    id: usize,
    name: String,
    layer_type: String,
    params: LayerParams,
    inputs: Vec<Option<LayerPin>>,
    required_outputs: BTreeSet<usize>,
    instance: Option<Box<dyn Layer>>,
    output_blobs: Vec<Blob>,
    internals: Vec<Blob>,
}

impl LayerData {
    fn new(id: usize, name: &str, layer_type: &str, mut params: LayerParams) -> LayerData {
        params.name = name.to_string();
        params.layer_type = layer_type.to_string();
        LayerData {
            id,
            name: name.to_string(),
            layer_type: layer_type.to_string(),
            params,
            inputs: vec![],
            required_outputs: BTreeSet::new(),
            instance: None,
            output_blobs: vec![],
            internals: vec![],
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layer_type(&self) -> &str {
        &self.layer_type
    }

    pub fn params(&self) -> &LayerParams {
        &self.params
    }

    pub fn input_pins(&self) -> &[Option<LayerPin>] {
        &self.inputs
    }

    pub fn output_blobs(&self) -> &[Blob] {
        &self.output_blobs
    }

    fn pins(&self) -> Result<Vec<LayerPin>> {
        self.inputs
            .iter()
            .enumerate()
            .map(|(i, pin)| {
                pin.ok_or_else(|| {
                    ErrorKind::Internal(format!(
                        "input #{} of layer \"{}\" was never connected",
                        i, self.name
                    ))
                    .into()
                })
            })
            .collect()
    }
}

/// Shapes inferred for one layer, without any allocation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LayerShapes {
    pub inputs: Vec<Shape>,
    pub outputs: Vec<Shape>,
    pub internals: Vec<Shape>,
    pub inplace: bool,
}

/// The runtime graph. Owns a sentinel input layer at id 0; added
/// layers get sequential ids from 1 on.
#[derive(Debug)]
pub struct Net {
    layers: BTreeMap<usize, LayerData>,
    ids_by_name: HashMap<String, usize>,
    last_id: usize,
    allocated: bool,
}

impl Default for Net {
    fn default() -> Net {
        Net::new()
    }
}

impl Net {
    pub fn new() -> Net {
        let mut input = LayerData::new(0, "_input", "__net_input__", LayerParams::default());
        input.instance = Some(Box::new(DataLayer::default()));
        let mut layers = BTreeMap::new();
        layers.insert(0, input);
        let mut ids_by_name = HashMap::new();
        ids_by_name.insert("_input".to_string(), 0);
        Net { layers, ids_by_name, last_id: 0, allocated: false }
    }

    /// True while no layer beyond the input sentinel was added.
    pub fn is_empty(&self) -> bool {
        self.layers.len() <= 1
    }

    pub fn add_layer(&mut self, name: &str, layer_type: &str, params: LayerParams) -> Result<usize> {
        if name.contains('.') {
            bail!(ErrorKind::Parse(format!(
                "layer name \"{}\" must not contain a dot",
                name
            )));
        }
        if self.ids_by_name.contains_key(name) {
            bail!(ErrorKind::Duplicate(format!("layer \"{}\" already in the net", name)));
        }
        self.last_id += 1;
        let id = self.last_id;
        self.ids_by_name.insert(name.to_string(), id);
        self.layers.insert(id, LayerData::new(id, name, layer_type, params));
        trace!("added layer {} \"{}\" of type {}", id, name, layer_type);
        Ok(id)
    }

    /// Wire `(out_layer, out_slot)` into input `in_slot` of `in_layer`.
    pub fn connect(
        &mut self,
        out_layer: usize,
        out_slot: usize,
        in_layer: usize,
        in_slot: usize,
    ) -> Result<()> {
        if !self.layers.contains_key(&out_layer) {
            bail!(ErrorKind::NotFound(format!("layer with id [{}]", out_layer)));
        }
        let pin = LayerPin::new(out_layer, out_slot);
        let dst = self
            .layers
            .get_mut(&in_layer)
            .ok_or_else(|| ErrorKind::NotFound(format!("layer with id [{}]", in_layer)))?;
        if dst.inputs.len() <= in_slot {
            dst.inputs.resize(in_slot + 1, None);
        }
        if let Some(existing) = dst.inputs[in_slot] {
            if existing != pin {
                bail!(ErrorKind::Duplicate(format!(
                    "input #{} of layer \"{}\" already connected",
                    in_slot, dst.name
                )));
            }
        }
        dst.inputs[in_slot] = Some(pin);
        self.layers
            .get_mut(&out_layer)
            .ok_or_else(|| ErrorKind::NotFound(format!("layer with id [{}]", out_layer)))?
            .required_outputs
            .insert(out_slot);
        Ok(())
    }

    /// Name the network input blobs, so `set_blob("name", ..)` works.
    pub fn set_net_inputs(&mut self, names: &[&str]) -> Result<()> {
        let mut data_layer = DataLayer::default();
        data_layer.set_names(names);
        self.layers
            .get_mut(&0)
            .ok_or_else(|| ErrorKind::Internal("input layer vanished".to_string()))?
            .instance = Some(Box::new(data_layer));
        Ok(())
    }

    pub fn layer_id(&self, name: &str) -> Option<usize> {
        self.ids_by_name.get(name).cloned()
    }

    fn resolve(&self, layer: &LayerId) -> Result<usize> {
        match layer {
            LayerId::Index(id) if self.layers.contains_key(id) => Ok(*id),
            LayerId::Index(id) => bail!(ErrorKind::NotFound(format!("layer with id [{}]", id))),
            LayerId::Name(name) => self
                .layer_id(name)
                .ok_or_else(|| ErrorKind::NotFound(format!("layer \"{}\"", name)).into()),
        }
    }

    pub fn layer_data(&self, layer: impl Into<LayerId>) -> Result<&LayerData> {
        let id = self.resolve(&layer.into())?;
        self.layers
            .get(&id)
            .ok_or_else(|| ErrorKind::NotFound(format!("layer with id [{}]", id)).into())
    }

    pub fn layer_names(&self) -> Vec<&str> {
        self.layers.values().filter(|l| l.id != 0).map(|l| &*l.name).collect()
    }

    /// Distinct layer types present, the input sentinel included.
    pub fn layer_types(&self) -> Vec<&str> {
        self.layers
            .values()
            .map(|l| &*l.layer_type)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn layers_count(&self, layer_type: &str) -> usize {
        self.layers.values().filter(|l| l.layer_type == layer_type).count()
    }

    /// Layers with no consumer on any output, in id order.
    pub fn unconnected_out_layers(&self) -> Vec<usize> {
        self.layers
            .values()
            .filter(|l| l.required_outputs.is_empty())
            .map(|l| l.id)
            .collect()
    }

    pub fn get_param(&self, layer: impl Into<LayerId>, idx: usize) -> Result<Blob> {
        let ld = self.layer_data(layer)?;
        ld.params
            .blobs
            .get(idx)
            .cloned()
            .ok_or_else(|| {
                ErrorKind::NotFound(format!(
                    "parameter blob [{}] of layer \"{}\" ({} blobs)",
                    idx,
                    ld.name,
                    ld.params.blobs.len()
                ))
                .into()
            })
    }

    pub fn set_param(&mut self, layer: impl Into<LayerId>, idx: usize, blob: Blob) -> Result<()> {
        let id = self.resolve(&layer.into())?;
        let ld = self
            .layers
            .get_mut(&id)
            .ok_or_else(|| ErrorKind::NotFound(format!("layer with id [{}]", id)))?;
        if idx >= ld.params.blobs.len() {
            bail!(ErrorKind::NotFound(format!(
                "parameter blob [{}] of layer \"{}\"",
                idx, ld.name
            )));
        }
        ld.params.blobs[idx] = blob;
        Ok(())
    }

    /// Resolve a `"layer.slot"` alias. The layer part defaults to the
    /// input sentinel, the slot part to 0; a non-numeric slot is asked
    /// to the layer itself by name.
    fn pin_by_alias(&mut self, alias: &str, is_out: bool) -> Result<LayerPin> {
        let (layer_name, slot_name) = match alias.find('.') {
            Some(dot) => (&alias[..dot], &alias[dot + 1..]),
            None => (alias, ""),
        };
        let id = if layer_name.is_empty() {
            0
        } else {
            match self.layer_id(layer_name) {
                Some(id) => id,
                // a bare input name addresses the sentinel
                None => match self.named_input_slot(layer_name)? {
                    Some(slot) => return Ok(LayerPin::new(0, slot)),
                    None => bail!(ErrorKind::NotFound(format!("blob \"{}\"", alias))),
                },
            }
        };
        if slot_name.is_empty() {
            return Ok(LayerPin::new(id, 0));
        }
        if let Ok(slot) = slot_name.parse::<usize>() {
            return Ok(LayerPin::new(id, slot));
        }
        self.ensure_instance(id)?;
        let ld = self.layer_data(id)?;
        let instance = ld
            .instance
            .as_ref()
            .ok_or_else(|| ErrorKind::Internal("layer instance vanished".to_string()))?;
        let slot = if is_out {
            instance.output_name_to_index(slot_name)
        } else {
            instance.input_name_to_index(slot_name)
        };
        slot.map(|s| LayerPin::new(id, s))
            .ok_or_else(|| ErrorKind::NotFound(format!("blob \"{}\"", alias)).into())
    }

    fn named_input_slot(&self, name: &str) -> Result<Option<usize>> {
        let input = self
            .layers
            .get(&0)
            .and_then(|l| l.instance.as_ref())
            .ok_or_else(|| ErrorKind::Internal("input layer vanished".to_string()))?;
        Ok(input.output_name_to_index(name))
    }

    /// Install a blob on a pin, typically a network input.
    pub fn set_blob(&mut self, alias: &str, blob: Blob) -> Result<()> {
        let pin = self.pin_by_alias(alias, true)?;
        let ld = self
            .layers
            .get_mut(&pin.layer)
            .ok_or_else(|| ErrorKind::NotFound(format!("layer with id [{}]", pin.layer)))?;
        let min_outputs = (pin.slot + 1).max(ld.required_outputs.len());
        if ld.output_blobs.len() < min_outputs {
            ld.output_blobs.resize(min_outputs, Blob::empty());
        }
        let shape_changed = ld.output_blobs[pin.slot].shape() != blob.shape();
        ld.output_blobs[pin.slot] = blob;
        self.allocated = self.allocated && !shape_changed;
        Ok(())
    }

    pub fn get_blob(&mut self, alias: &str) -> Result<Blob> {
        let pin = self.pin_by_alias(alias, true)?;
        let ld = self.layer_data(pin.layer)?;
        ld.output_blobs.get(pin.slot).cloned().ok_or_else(|| {
            ErrorKind::NotFound(format!(
                "layer \"{}\" produces only {} outputs, #{} requested",
                ld.name,
                ld.output_blobs.len(),
                pin.slot
            ))
            .into()
        })
    }

    fn ensure_instance(&mut self, id: usize) -> Result<()> {
        let ld = self
            .layers
            .get_mut(&id)
            .ok_or_else(|| ErrorKind::NotFound(format!("layer with id [{}]", id)))?;
        if ld.instance.is_none() {
            let instance = factory::create(&ld.layer_type, &ld.params)?.ok_or_else(|| {
                ErrorKind::NotFound(format!(
                    "can't create layer \"{}\" of type \"{}\"",
                    ld.name, ld.layer_type
                ))
            })?;
            ld.instance = Some(instance);
        }
        Ok(())
    }

    /// Infer shapes for every layer from the given network input
    /// shapes. Pure: repeated calls yield identical results.
    pub fn layers_shapes(&mut self, input_shapes: &[Shape]) -> Result<BTreeMap<usize, LayerShapes>> {
        let mut shapes = BTreeMap::new();
        shapes.insert(
            0,
            LayerShapes { inputs: input_shapes.to_vec(), ..LayerShapes::default() },
        );
        let ids: Vec<usize> = self.layers.keys().cloned().collect();
        let mut done = BitSet::with_capacity(self.last_id + 1);
        for id in ids {
            self.layer_shapes_rec(id, &mut shapes, &mut done)?;
        }
        Ok(shapes)
    }

    /// Shapes of one layer (and its cone) only.
    pub fn layer_shapes(
        &mut self,
        input_shapes: &[Shape],
        layer: impl Into<LayerId>,
    ) -> Result<LayerShapes> {
        let id = self.resolve(&layer.into())?;
        let mut shapes = BTreeMap::new();
        shapes.insert(
            0,
            LayerShapes { inputs: input_shapes.to_vec(), ..LayerShapes::default() },
        );
        let mut done = BitSet::with_capacity(self.last_id + 1);
        self.layer_shapes_rec(id, &mut shapes, &mut done)?;
        shapes
            .remove(&id)
            .ok_or_else(|| ErrorKind::Internal("shape pass skipped the target layer".to_string()).into())
    }

    fn layer_shapes_rec(
        &mut self,
        id: usize,
        shapes: &mut BTreeMap<usize, LayerShapes>,
        done: &mut BitSet,
    ) -> Result<()> {
        if done.contains(id) {
            return Ok(());
        }
        let pins = self.layer_data(id)?.pins()?;
        let mut inputs: Vec<Shape> = shapes.get(&id).map(|s| s.inputs.clone()).unwrap_or_default();
        if inputs.is_empty() {
            for pin in &pins {
                self.layer_shapes_rec(pin.layer, shapes, done)?;
                let parent = shapes.get(&pin.layer).ok_or_else(|| {
                    ErrorKind::Internal(format!("no shapes for parent layer [{}]", pin.layer))
                })?;
                let shape = parent.outputs.get(pin.slot).ok_or_else(|| {
                    ErrorKind::Internal(format!(
                        "parent layer [{}] has no output #{}",
                        pin.layer, pin.slot
                    ))
                })?;
                inputs.push(shape.clone());
            }
        }
        let required = self.layer_data(id)?.required_outputs.len();
        self.ensure_instance(id)?;
        let ld = self
            .layers
            .get(&id)
            .ok_or_else(|| ErrorKind::NotFound(format!("layer with id [{}]", id)))?;
        let instance = ld
            .instance
            .as_ref()
            .ok_or_else(|| ErrorKind::Internal("layer instance vanished".to_string()))?;
        let memory = instance
            .memory_shapes(&inputs, required)
            .chain_err(|| format!("inferring shapes of layer \"{}\"", ld.name))?;
        shapes.insert(
            id,
            LayerShapes {
                inputs,
                outputs: memory.outputs,
                internals: memory.internals,
                inplace: memory.inplace,
            },
        );
        done.insert(id);
        Ok(())
    }

    /// Compute shapes and allocate every blob, binding in-place outputs
    /// to their input storage. Idempotent until the net changes.
    pub fn allocate(&mut self) -> Result<()> {
        if self.allocated {
            return Ok(());
        }
        let input_shapes = self.input_shapes()?;
        let shapes = self.layers_shapes(&input_shapes)?;
        let ids: Vec<usize> = self.layers.keys().cloned().collect();
        let mut done = BitSet::with_capacity(self.last_id + 1);
        for id in ids {
            self.allocate_layer(id, &shapes, &mut done)?;
        }
        self.allocated = true;
        Ok(())
    }

    fn input_shapes(&self) -> Result<Vec<Shape>> {
        let input = self
            .layers
            .get(&0)
            .ok_or_else(|| ErrorKind::Internal("input layer vanished".to_string()))?;
        if input.output_blobs.is_empty() {
            bail!(ErrorKind::NotFound("network input blobs are not set".to_string()));
        }
        Ok(input.output_blobs.iter().map(|b| b.shape().iter().cloned().collect()).collect())
    }

    fn allocate_layer(
        &mut self,
        id: usize,
        shapes: &BTreeMap<usize, LayerShapes>,
        done: &mut BitSet,
    ) -> Result<()> {
        if done.contains(id) {
            return Ok(());
        }
        let pins = self.layer_data(id)?.pins()?;
        for pin in &pins {
            self.allocate_layer(pin.layer, shapes, done)?;
        }
        let inputs = self.gather_inputs(&pins)?;
        let ls = shapes
            .get(&id)
            .ok_or_else(|| ErrorKind::Internal(format!("no shapes for layer [{}]", id)))?;

        let ld = self
            .layers
            .get_mut(&id)
            .ok_or_else(|| ErrorKind::NotFound(format!("layer with id [{}]", id)))?;
        // every layer produces at least one output blob
        let num_outputs = ls.outputs.len().max(1);
        if ld.output_blobs.len() < num_outputs {
            ld.output_blobs.resize(num_outputs, Blob::empty());
        }
        for (i, shape) in ls.outputs.iter().enumerate() {
            if ld.output_blobs[i].shape() == &shape[..] {
                continue;
            }
            let wanted: usize = shape.iter().product();
            if ls.inplace && inputs.len() == ls.outputs.len() && inputs[i].len() == wanted {
                ld.output_blobs[i] = inputs[i].reshaped(shape)?;
            } else {
                ld.output_blobs[i] = Blob::zeros(shape);
            }
        }
        if ld.internals.len() != ls.internals.len() {
            ld.internals.resize(ls.internals.len(), Blob::empty());
        }
        for (i, shape) in ls.internals.iter().enumerate() {
            if ld.internals[i].shape() != &shape[..] {
                ld.internals[i] = Blob::zeros(shape);
            }
        }
        debug!(
            "allocated layer {} \"{}\": {} outputs, {} internals",
            id,
            ld.name,
            ls.outputs.len(),
            ls.internals.len()
        );

        let mut outputs = mem::take(&mut ld.output_blobs);
        let result = match ld.instance.as_mut() {
            Some(instance) => instance.finalize(&inputs, &mut outputs),
            None => Err(ErrorKind::Internal("layer instance vanished".to_string()).into()),
        };
        let name = ld.name.clone();
        ld.output_blobs = outputs;
        result.chain_err(|| format!("finalizing layer \"{}\"", name))?;
        done.insert(id);
        Ok(())
    }

    fn gather_inputs(&self, pins: &[LayerPin]) -> Result<Vec<Blob>> {
        pins.iter()
            .map(|pin| {
                self.layers
                    .get(&pin.layer)
                    .and_then(|l| l.output_blobs.get(pin.slot))
                    .cloned()
                    .ok_or_else(|| {
                        ErrorKind::Internal(format!(
                            "no blob behind pin ({}, {})",
                            pin.layer, pin.slot
                        ))
                        .into()
                    })
            })
            .collect()
    }

    /// Run the whole net, parents before children, each layer once.
    pub fn forward(&mut self) -> Result<()> {
        self.allocate()?;
        let ids: Vec<usize> = self.layers.keys().cloned().collect();
        let mut done = BitSet::with_capacity(self.last_id + 1);
        for id in ids {
            self.forward_layer(id, &mut done)?;
        }
        Ok(())
    }

    /// Run only the cone of one layer.
    pub fn forward_to(&mut self, layer: impl Into<LayerId>) -> Result<()> {
        self.allocate()?;
        let id = self.resolve(&layer.into())?;
        let mut done = BitSet::with_capacity(self.last_id + 1);
        self.forward_layer(id, &mut done)
    }

    fn forward_layer(&mut self, id: usize, done: &mut BitSet) -> Result<()> {
        if done.contains(id) {
            return Ok(());
        }
        let pins = self.layer_data(id)?.pins()?;
        for pin in &pins {
            self.forward_layer(pin.layer, done)?;
        }
        let inputs = self.gather_inputs(&pins)?;
        let ld = self
            .layers
            .get_mut(&id)
            .ok_or_else(|| ErrorKind::NotFound(format!("layer with id [{}]", id)))?;
        let mut outputs = mem::take(&mut ld.output_blobs);
        let mut internals = mem::take(&mut ld.internals);
        let result = match ld.instance.as_mut() {
            Some(instance) => instance.forward(&inputs, &mut outputs, &mut internals),
            None => Err(ErrorKind::Internal("layer instance vanished".to_string()).into()),
        };
        let name = ld.name.clone();
        ld.output_blobs = outputs;
        ld.internals = internals;
        result.chain_err(|| format!("running layer \"{}\"", name))?;
        done.insert(id);
        Ok(())
    }

    /// Estimated work for one pass over the whole net.
    pub fn flops(&mut self, input_shapes: &[Shape]) -> Result<i64> {
        let shapes = self.layers_shapes(input_shapes)?;
        let mut total = 0;
        for (id, ls) in &shapes {
            self.ensure_instance(*id)?;
            let ld = self.layer_data(*id)?;
            let instance = ld
                .instance
                .as_ref()
                .ok_or_else(|| ErrorKind::Internal("layer instance vanished".to_string()))?;
            total += instance.flops(&ls.inputs, &ls.outputs);
        }
        Ok(total)
    }

    /// Weight bytes and output blob bytes the net would use for the
    /// given input shapes, without allocating anything.
    pub fn memory_consumption(&mut self, input_shapes: &[Shape]) -> Result<(usize, usize)> {
        let shapes = self.layers_shapes(input_shapes)?;
        let mut weights = 0;
        let mut blobs = 0;
        for (id, ls) in &shapes {
            let ld = self.layer_data(*id)?;
            weights += ld.params.blobs.iter().map(|b| b.len() * 4).sum::<usize>();
            blobs += ls.outputs.iter().map(|s| s.iter().product::<usize>() * 4).sum::<usize>();
        }
        Ok((weights, blobs))
    }
}

//! Decoder for the legacy Torch7 serialization: a tagged object stream
//! with back-references, typed storages and tensors, and `nn` modules
//! that become a tree of containers and layers.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{Read, Seek};

use ndarray::IxDyn;

use crate::params::{Dict, LayerParams};
use crate::tensor::Blob;
use crate::torch::stream::*;
use crate::{ErrorKind, Result};

/// Element type of a serialized tensor or storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ElemKind {
    U8,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

/// A flat typed buffer that tensors view with offset and strides.
/// `Long` storages are widened to f64 at read time.
#[derive(Debug)]
enum Storage {
    U8(Vec<u8>),
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl Storage {
    fn len(&self) -> usize {
        match self {
            Storage::U8(v) => v.len(),
            Storage::I8(v) => v.len(),
            Storage::I16(v) => v.len(),
            Storage::I32(v) => v.len(),
            Storage::F32(v) => v.len(),
            Storage::F64(v) => v.len(),
        }
    }

    fn at(&self, i: usize) -> f32 {
        match self {
            Storage::U8(v) => v[i] as f32,
            Storage::I8(v) => v[i] as f32,
            Storage::I16(v) => v[i] as f32,
            Storage::I32(v) => v[i] as f32,
            Storage::F32(v) => v[i],
            Storage::F64(v) => v[i] as f32,
        }
    }

    fn to_f64s(&self) -> Vec<f64> {
        match self {
            Storage::U8(v) => v.iter().map(|&x| x as f64).collect(),
            Storage::I8(v) => v.iter().map(|&x| x as f64).collect(),
            Storage::I16(v) => v.iter().map(|&x| x as f64).collect(),
            Storage::I32(v) => v.iter().map(|&x| x as f64).collect(),
            Storage::F32(v) => v.iter().map(|&x| x as f64).collect(),
            Storage::F64(v) => v.clone(),
        }
    }
}

/// A node of the intermediate module tree: a container or a primitive
/// layer with its translated parameters and weight blobs.
#[derive(Clone, Debug, Default)]
pub struct Module {
    pub class: String,
    /// Runtime layer type for primitives; `None` for containers and
    /// modules the lowerer resolves itself.
    pub api_type: Option<String>,
    pub params: LayerParams,
    pub children: Vec<Module>,
}

impl Module {
    pub fn container(class: &str) -> Module {
        Module { class: class.to_string(), ..Module::default() }
    }
}

/// `torch.<Elem><suffix>` class names carry the element type in the
/// middle. `Cuda` tensors decode like `Float` ones.
fn torch_elem_kind(class: &str, suffix: &str) -> Result<Option<ElemKind>> {
    const PREFIX: &str = "torch.";
    if !class.starts_with(PREFIX) || !class.ends_with(suffix)
        || class.len() < PREFIX.len() + suffix.len()
    {
        return Ok(None);
    }
    let elem = &class[PREFIX.len()..class.len() - suffix.len()];
    let kind = match elem {
        "Double" => ElemKind::F64,
        "Float" | "Cuda" => ElemKind::F32,
        "Byte" => ElemKind::U8,
        "Char" => ElemKind::I8,
        "Short" => ElemKind::I16,
        "Int" => ElemKind::I32,
        "Long" => ElemKind::I64,
        _ => bail!(ErrorKind::NotImplemented(format!(
            "unknown element type \"{}\" of torch class \"{}\"",
            elem, class
        ))),
    };
    Ok(Some(kind))
}

fn nn_class(class: &str) -> Option<&str> {
    for prefix in &["nn.", "cunn.", "cudnn.", "fbcunn."] {
        if class.starts_with(prefix) {
            return Some(&class[prefix.len()..]);
        }
    }
    None
}

type TensorParams = BTreeMap<String, (i32, Blob)>;

pub struct TorchImporter<R> {
    stream: TorchStream<R>,
    seen: HashSet<i32>,
    storages: HashMap<i32, Storage>,
    tensors: HashMap<i32, Blob>,
}

impl<R: Read + Seek> TorchImporter<R> {
    pub fn new(reader: R) -> TorchImporter<R> {
        TorchImporter {
            stream: TorchStream::new(reader),
            seen: HashSet::new(),
            storages: HashMap::new(),
            tensors: HashMap::new(),
        }
    }

    /// Read the whole stream into a module tree rooted at a synthetic
    /// `Sequential`.
    pub fn read_root(&mut self) -> Result<Module> {
        let mut root = Module::container("Sequential");
        self.stream.seek_to(0)?;
        self.read_object(&mut root)?;
        Ok(root)
    }

    /// Read one object and expect it to be a single tensor.
    pub fn read_blob(mut self) -> Result<Blob> {
        let mut scratch = Module::container("Sequential");
        self.read_object(&mut scratch)?;
        if self.tensors.len() != 1 {
            bail!(ErrorKind::Parse(format!(
                "expected a stream holding one tensor, found {}",
                self.tensors.len()
            )));
        }
        Ok(self.tensors.into_iter().map(|(_, blob)| blob).next().unwrap_or_else(Blob::empty))
    }

    fn read_object(&mut self, parent: &mut Module) -> Result<()> {
        let tag = self.stream.read_i32()?;
        match tag {
            TYPE_TORCH => {
                let index = self.stream.read_i32()?;
                self.read_torch_object(index, parent)?;
                self.seen.insert(index);
                Ok(())
            }
            TYPE_NIL => Ok(()),
            TYPE_NUMBER => self.stream.read_f64().map(|_| ()),
            TYPE_STRING => self.stream.read_string().map(|_| ()),
            TYPE_BOOLEAN => self.stream.read_bool().map(|_| ()),
            TYPE_TABLE => self.read_table(None, parent),
            other => bail!(ErrorKind::NotImplemented(format!("unsupported Lua type [{}]", other))),
        }
    }

    fn read_table(&mut self, index: Option<i32>, parent: &mut Module) -> Result<()> {
        let index = match index {
            Some(index) => index,
            None => self.stream.read_i32()?,
        };
        // a table seen before is only a back-reference, no body follows
        if !self.seen.insert(index) {
            return Ok(());
        }
        let size = self.stream.read_i32()?;
        for _ in 0..size {
            self.read_object(parent)?; // key
            self.read_object(parent)?; // value
        }
        Ok(())
    }

    /// Class name, with the optional `"V <version>"` prefix record.
    fn read_class_name(&mut self) -> Result<String> {
        let name = self.stream.read_string()?;
        if name.starts_with("V ") {
            self.stream.read_string()
        } else {
            Ok(name)
        }
    }

    fn read_torch_object(&mut self, index: i32, parent: &mut Module) -> Result<()> {
        if self.seen.contains(&index) {
            return Ok(());
        }
        let class = self.read_class_name()?;
        trace!("torch object [{}]: {}", index, class);
        if let Some(kind) = torch_elem_kind(&class, "Tensor")? {
            self.read_tensor(index, kind)?;
        } else if let Some(kind) = torch_elem_kind(&class, "Storage")? {
            self.read_storage(index, kind)?;
        } else if let Some(nn_name) = nn_class(&class) {
            let nn_name = nn_name.to_string();
            self.read_nn_module(index, &nn_name, &class, parent)?;
        } else {
            bail!(ErrorKind::NotImplemented(format!("unsupported Torch class \"{}\"", class)));
        }
        self.seen.insert(index);
        Ok(())
    }

    fn read_storage(&mut self, index: i32, kind: ElemKind) -> Result<()> {
        let len = self.stream.read_i64()?;
        if len < 0 {
            bail!(ErrorKind::Parse(format!("negative storage length [{}]", len)));
        }
        let len = len as usize;
        let storage = match kind {
            ElemKind::U8 => Storage::U8(self.stream.read_u8s(len)?),
            ElemKind::I8 => Storage::I8(self.stream.read_i8s(len)?),
            ElemKind::I16 => Storage::I16(self.stream.read_i16s(len)?),
            ElemKind::I32 => Storage::I32(self.stream.read_i32s(len)?),
            ElemKind::F32 => Storage::F32(self.stream.read_f32s(len)?),
            // widened to keep 64-bit integers exact downstream
            ElemKind::I64 => {
                Storage::F64(self.stream.read_i64s(len)?.into_iter().map(|x| x as f64).collect())
            }
            ElemKind::F64 => Storage::F64(self.stream.read_f64s(len)?),
        };
        self.storages.insert(index, storage);
        Ok(())
    }

    fn read_tensor(&mut self, index: i32, kind: ElemKind) -> Result<()> {
        let ndims = self.stream.read_i32()?;
        if ndims < 0 {
            bail!(ErrorKind::Parse(format!("negative tensor rank [{}]", ndims)));
        }
        let ndims = ndims as usize;
        let sizes = self.stream.read_i64s(ndims)?;
        let strides = self.stream.read_i64s(ndims)?;
        // offsets are 1-based on the wire
        let offset = self.stream.read_i64()? - 1;

        let storage_tag = self.stream.read_i32()?;
        if storage_tag == TYPE_NIL {
            if ndims != 0 {
                bail!(ErrorKind::Parse("shaped tensor without a storage".to_string()));
            }
            self.tensors.insert(index, Blob::empty());
            return Ok(());
        }
        if storage_tag != TYPE_TORCH {
            bail!(ErrorKind::Parse(format!(
                "tensor storage must be a torch object, got tag [{}]",
                storage_tag
            )));
        }
        let storage_index = self.stream.read_i32()?;
        if !self.seen.contains(&storage_index) {
            let class = self.read_class_name()?;
            let storage_kind = torch_elem_kind(&class, "Storage")?.ok_or_else(|| {
                ErrorKind::Parse(format!("expected a storage class, got \"{}\"", class))
            })?;
            if storage_kind != kind {
                bail!(ErrorKind::Parse(format!(
                    "tensor and storage element types disagree ({:?} vs {:?})",
                    kind, storage_kind
                )));
            }
            self.read_storage(storage_index, storage_kind)?;
            self.seen.insert(storage_index);
        }
        let storage = self.storages.get(&storage_index).ok_or_else(|| {
            ErrorKind::Parse(format!("tensor back-reference to unknown storage [{}]", storage_index))
        })?;

        if ndims == 0 {
            self.tensors.insert(index, Blob::empty());
            return Ok(());
        }
        let needed = offset + strides[0] * sizes[0];
        if offset < 0 || needed < 0 || needed as usize > storage.len() {
            bail!(ErrorKind::Parse(
                "storage has insufficient elements for the tensor".to_string()
            ));
        }

        let mut dims = Vec::with_capacity(ndims);
        for &size in &sizes {
            if size < 0 {
                bail!(ErrorKind::Parse(format!("negative tensor dimension [{}]", size)));
            }
            dims.push(size as usize);
        }
        // materialize as a contiguous f32 blob, walking the strided view
        let total: usize = dims.iter().product();
        let mut data = Vec::with_capacity(total);
        for ix in ndarray::indices(IxDyn(&dims)) {
            let mut pos = offset;
            for d in 0..ndims {
                pos += ix[d] as i64 * strides[d];
            }
            if pos < 0 || pos as usize >= storage.len() {
                bail!(ErrorKind::Parse(
                    "tensor strides walk outside their storage".to_string()
                ));
            }
            data.push(storage.at(pos as usize));
        }
        let blob = Blob::from_vec(&dims, data)?;
        debug!("tensor [{}]: shape {:?} from storage [{}]", index, blob.shape(), storage_index);
        self.tensors.insert(index, blob);
        Ok(())
    }

    /// A module body is a Lua table. String-keyed scalars and storages
    /// land in the dict (storages as real arrays), string-keyed tensors
    /// in the tensor map; anything else is read and dropped, with child
    /// modules attaching to `module` on the way.
    fn read_module_table(&mut self, module: &mut Module) -> Result<(Dict, TensorParams)> {
        let tag = self.stream.read_i32()?;
        let index = self.stream.read_i32()?;
        if tag != TYPE_TABLE || self.seen.contains(&index) {
            bail!(ErrorKind::Parse("module body must be a fresh table".to_string()));
        }
        self.seen.insert(index);

        let num_pairs = self.stream.read_i32()?;
        let mut scalars = Dict::default();
        let mut tensors = TensorParams::new();
        for _ in 0..num_pairs {
            let key_pos = self.stream.position()?;
            let key_tag = self.stream.read_i32()?;
            if key_tag != TYPE_STRING {
                // non-string key: re-read the pair as anonymous objects
                self.stream.seek_to(key_pos)?;
                self.read_object(module)?;
                self.read_object(module)?;
                continue;
            }
            let key = self.stream.read_string()?;
            let value_pos = self.stream.position()?;
            let value_tag = self.stream.read_i32()?;
            match value_tag {
                TYPE_TORCH => {
                    let value_index = self.stream.read_i32()?;
                    self.read_torch_object(value_index, module)?;
                    if let Some(tensor) = self.tensors.get(&value_index) {
                        tensors.insert(key, (value_index, tensor.clone()));
                    } else if let Some(storage) = self.storages.get(&value_index) {
                        scalars.set(key, storage.to_f64s());
                    }
                }
                TYPE_NUMBER => scalars.set(key, self.stream.read_f64()?),
                TYPE_STRING => scalars.set(key, self.stream.read_string()?),
                TYPE_BOOLEAN => scalars.set(key, self.stream.read_bool()?),
                _ => {
                    self.stream.seek_to(value_pos)?;
                    self.read_object(module)?;
                }
            }
        }
        Ok((scalars, tensors))
    }

    fn read_nn_module(
        &mut self,
        index: i32,
        nn_name: &str,
        class: &str,
        parent: &mut Module,
    ) -> Result<()> {
        let mut module = Module::container(nn_name);
        module.params.set("torch_index", index as i64);

        match nn_name {
            "Sequential" | "Parallel" | "Concat" | "ConcatTable" | "JoinTable" => {
                let (scalars, _tensors) = self.read_module_table(&mut module)?;
                match nn_name {
                    "Parallel" => {
                        module.params.set("inputDimension", scalars.get_int("inputDimension")?);
                        module.params.set("outputDimension", scalars.get_int("outputDimension")?);
                    }
                    "Concat" | "JoinTable" => {
                        module.params.set("dimension", scalars.get_int("dimension")?);
                    }
                    _ => (),
                }
                parent.children.push(module);
            }
            "SpatialConvolution" => {
                module.api_type = Some("Convolution".to_string());
                let (scalars, tensors) = self.read_module_table(&mut module)?;
                let weight = required_tensor(&tensors, "weight", class)?;
                module.params.blobs.push(weight.clone());
                let bias = tensors.get("bias");
                module.params.set("bias_term", bias.is_some());
                if let Some((_, bias)) = bias {
                    module.params.blobs.push(bias.clone());
                }
                module.params.set("num_output", scalars.get_int("nOutputPlane")?);
                kernel_params(&scalars, &mut module.params)?;
                parent.children.push(module);
            }
            "SpatialMaxPooling" | "SpatialAveragePooling" => {
                module.api_type = Some("Pooling".to_string());
                let (scalars, tensors) = self.read_module_table(&mut module)?;
                if nn_name == "SpatialMaxPooling" {
                    module.params.set("pool", "MAX");
                    let indices_id = required_tensor_entry(&tensors, "indices", class)?.0;
                    module.params.set("indices_blob_id", indices_id as i64);
                } else {
                    module.params.set("pool", "AVE");
                }
                kernel_params(&scalars, &mut module.params)?;
                parent.children.push(module);
            }
            "Linear" => {
                module.api_type = Some("InnerProduct".to_string());
                let (_scalars, tensors) = self.read_module_table(&mut module)?;
                let weight = required_tensor(&tensors, "weight", class)?;
                let num_output = *weight.shape().first().ok_or_else(|| {
                    ErrorKind::Parse("Linear weight without dimensions".to_string())
                })?;
                module.params.blobs.push(weight.clone());
                let bias = tensors.get("bias");
                if let Some((_, bias)) = bias {
                    module.params.blobs.push(bias.clone());
                }
                module.params.set("bias_term", bias.is_some());
                module.params.set("num_output", num_output);
                parent.children.push(module);
            }
            "Reshape" => {
                module.api_type = Some("Reshape".to_string());
                let (scalars, _tensors) = self.read_module_table(&mut module)?;
                module.params.set("dim", scalars.get("size")?.clone());
                if scalars.get_bool_or("batchMode", false)? {
                    module.params.set("axis", 1);
                }
                parent.children.push(module);
            }
            "ReLU" | "Tanh" | "Sigmoid" => {
                let api_type = match nn_name {
                    "ReLU" => "ReLU",
                    "Tanh" => "TanH",
                    _ => "Sigmoid",
                };
                let mut activation = Module::container(nn_name);
                activation.api_type = Some(api_type.to_string());
                parent.children.push(activation);
                self.read_object(parent)?;
            }
            "SpatialBatchNormalization" => {
                module.api_type = Some("BatchNorm".to_string());
                let (scalars, tensors) = self.read_module_table(&mut module)?;
                let mean = required_tensor(&tensors, "running_mean", class)?;
                let var = required_tensor(&tensors, "running_var", class)?;
                module.params.blobs.push(mean.clone());
                module.params.blobs.push(var.clone());
                module.params.set("eps", scalars.get_real("eps")?);
                if let Some((_, weight)) = tensors.get("weight") {
                    module.params.set("has_weight", true);
                    module.params.blobs.push(weight.clone());
                }
                if let Some((_, bias)) = tensors.get("bias") {
                    module.params.set("has_bias", true);
                    module.params.blobs.push(bias.clone());
                }
                parent.children.push(module);
            }
            "PReLU" => {
                let (scalars, tensors) = self.read_module_table(&mut module)?;
                let weight = required_tensor(&tensors, "weight", class)?;
                let output_channels = scalars.get_int("nOutputPlane")?;
                if output_channels != 0 {
                    if weight.len() != output_channels as usize {
                        bail!(ErrorKind::Parse(format!(
                            "PReLU weight of {} values for {} channels",
                            weight.len(),
                            output_channels
                        )));
                    }
                    module.params.blobs.push(weight.clone());
                    module.api_type = Some("ChannelsPReLU".to_string());
                } else {
                    if weight.len() != 1 {
                        bail!(ErrorKind::Parse(format!(
                            "scalar PReLU with a weight of {} values",
                            weight.len()
                        )));
                    }
                    module.params.set("negative_slope", weight.data()[0] as f64);
                    module.api_type = Some("ReLU".to_string());
                }
                parent.children.push(module);
            }
            "SpatialDropout" => {
                let (scalars, _tensors) = self.read_module_table(&mut module)?;
                let scale = 1.0 - scalars.get_real("p")?;
                if scale <= 0.0 {
                    bail!(ErrorKind::Parse(format!(
                        "SpatialDropout keeps a non-positive fraction [{}]",
                        scale
                    )));
                }
                module.api_type = Some("Power".to_string());
                module.params.set("scale", scale);
                parent.children.push(module);
            }
            "Identity" => {
                let (_scalars, _tensors) = self.read_module_table(&mut module)?;
                module.api_type = Some("Identity".to_string());
                parent.children.push(module);
            }
            "Padding" => {
                let (scalars, _tensors) = self.read_module_table(&mut module)?;
                module.api_type = Some("Padding".to_string());
                module.params.set("padding_dim", scalars.get_int("dim")? - 1);
                module.params.set("padding", scalars.get_int("pad")?);
                if scalars.has("nInputDim") {
                    module.params.set("input_dims", scalars.get_int("nInputDim")?);
                }
                if scalars.has("value") {
                    module.params.set("value", scalars.get_real("value")?);
                }
                if scalars.has("index") {
                    // 1-based in torch
                    module.params.set("index", scalars.get_int("index")? - 1);
                }
                parent.children.push(module);
            }
            "CAddTable" => {
                parent.children.push(module);
                self.read_object(parent)?;
            }
            "SpatialDilatedConvolution" => {
                module.api_type = Some("Convolution".to_string());
                let (scalars, tensors) = self.read_module_table(&mut module)?;
                kernel_params(&scalars, &mut module.params)?;
                module.params.set("dilation_w", scalars.get_int("dilationW")?);
                module.params.set("dilation_h", scalars.get_int("dilationH")?);
                module.params.set("num_output", scalars.get_int("nOutputPlane")?);
                let weight = required_tensor(&tensors, "weight", class)?;
                module.params.blobs.push(weight.clone());
                let bias = tensors.get("bias");
                module.params.set("bias_term", bias.is_some());
                if let Some((_, bias)) = bias {
                    module.params.blobs.push(bias.clone());
                }
                parent.children.push(module);
            }
            "SpatialFullConvolution" => {
                module.api_type = Some("Deconvolution".to_string());
                let (scalars, tensors) = self.read_module_table(&mut module)?;
                kernel_params(&scalars, &mut module.params)?;
                module.params.set("adj_w", scalars.get_int("adjW")?);
                module.params.set("adj_h", scalars.get_int("adjH")?);
                module.params.set("num_output", scalars.get_int("nOutputPlane")?);
                let weight = required_tensor(&tensors, "weight", class)?;
                if weight.ndim() != 4 {
                    bail!(ErrorKind::Parse(format!(
                        "SpatialFullConvolution weight of rank {}",
                        weight.ndim()
                    )));
                }
                // serialized as [out, in, h, w], the runtime wants
                // [in, out, h, w]; relabeling the axes is enough
                let s = weight.shape();
                let reordered = weight.reshaped(&[s[1], s[0], s[2], s[3]])?;
                module.params.blobs.push(reordered);
                let bias = tensors.get("bias");
                module.params.set("bias_term", bias.is_some());
                if let Some((_, bias)) = bias {
                    module.params.blobs.push(bias.clone());
                }
                parent.children.push(module);
            }
            "SpatialMaxUnpooling" => {
                let (_scalars, tensors) = self.read_module_table(&mut module)?;
                let indices_id = required_tensor_entry(&tensors, "indices", class)?.0;
                module.params.set("indices_blob_id", indices_id as i64);
                parent.children.push(module);
            }
            _ => bail!(ErrorKind::NotImplemented(format!("unknown nn class \"{}\"", class))),
        }
        Ok(())
    }
}

fn required_tensor_entry<'a>(
    tensors: &'a TensorParams,
    key: &str,
    class: &str,
) -> Result<&'a (i32, Blob)> {
    tensors
        .get(key)
        .ok_or_else(|| ErrorKind::Parse(format!("{} without a \"{}\" tensor", class, key)).into())
}

fn required_tensor<'a>(tensors: &'a TensorParams, key: &str, class: &str) -> Result<&'a Blob> {
    required_tensor_entry(tensors, key, class).map(|(_, blob)| blob)
}

fn kernel_params(scalars: &Dict, params: &mut LayerParams) -> Result<()> {
    params.set("kernel_h", scalars.get_int("kH")?);
    params.set("kernel_w", scalars.get_int("kW")?);
    params.set("stride_h", scalars.get_int("dH")?);
    params.set("stride_w", scalars.get_int("dW")?);
    params.set("pad_h", scalars.get_int_or("padH", 0)?);
    params.set("pad_w", scalars.get_int_or("padW", 0)?);
    Ok(())
}

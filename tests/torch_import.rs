//! End-to-end import of hand-assembled Torch7 streams.

extern crate thdeploy;

use std::io::Cursor;

use thdeploy::net::{LayerPin, Net};
use thdeploy::torch;

const TYPE_NIL: i32 = 0;
const TYPE_NUMBER: i32 = 1;
const TYPE_STRING: i32 = 2;
const TYPE_TABLE: i32 = 3;
const TYPE_TORCH: i32 = 4;
const TYPE_BOOLEAN: i32 = 5;

/// Byte-level builder for the legacy stream format.
struct T7 {
    bytes: Vec<u8>,
    next_index: i32,
}

impl T7 {
    fn new() -> T7 {
        T7 { bytes: vec![], next_index: 1000 }
    }

    fn index(&mut self) -> i32 {
        self.next_index += 1;
        self.next_index
    }

    fn i32(&mut self, v: i32) {
        self.bytes.extend(&v.to_le_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.bytes.extend(&v.to_le_bytes());
    }

    fn f64(&mut self, v: f64) {
        self.bytes.extend(&v.to_le_bytes());
    }

    fn str(&mut self, s: &str) {
        self.i32(s.len() as i32);
        self.bytes.extend(s.as_bytes());
    }

    fn number_obj(&mut self, v: f64) {
        self.i32(TYPE_NUMBER);
        self.f64(v);
    }

    fn string_obj(&mut self, s: &str) {
        self.i32(TYPE_STRING);
        self.str(s);
    }

    /// `TYPE_TORCH` header for a fresh object.
    fn torch_obj(&mut self, class: &str) -> i32 {
        let index = self.index();
        self.i32(TYPE_TORCH);
        self.i32(index);
        self.str(class);
        index
    }

    /// Back-reference to an already-serialized object.
    fn torch_ref(&mut self, index: i32) {
        self.i32(TYPE_TORCH);
        self.i32(index);
    }

    fn contiguous_strides(shape: &[i64]) -> Vec<i64> {
        let mut strides = vec![1; shape.len()];
        for d in (0..shape.len().saturating_sub(1)).rev() {
            strides[d] = strides[d + 1] * shape[d + 1];
        }
        strides
    }

    /// A float tensor with its own inline storage.
    fn tensor_f32(&mut self, shape: &[i64], data: &[f32]) -> i32 {
        let index = self.torch_obj("torch.FloatTensor");
        self.i32(shape.len() as i32);
        for &s in shape {
            self.i64(s);
        }
        for s in Self::contiguous_strides(shape) {
            self.i64(s);
        }
        self.i64(1);
        self.torch_obj("torch.FloatStorage");
        self.i64(data.len() as i64);
        for f in data {
            self.bytes.extend(&f.to_le_bytes());
        }
        index
    }

    fn tensor_f32_shared(&mut self, shape: &[i64], strides: &[i64], offset_1based: i64, storage: i32) -> i32 {
        let index = self.torch_obj("torch.FloatTensor");
        self.i32(shape.len() as i32);
        for &s in shape {
            self.i64(s);
        }
        for &s in strides {
            self.i64(s);
        }
        self.i64(offset_1based);
        self.torch_ref(storage);
        index
    }

    /// A long tensor with inline storage, as pooling `indices` are.
    fn tensor_i64(&mut self, shape: &[i64], data: &[i64]) -> i32 {
        let index = self.torch_obj("torch.LongTensor");
        self.i32(shape.len() as i32);
        for &s in shape {
            self.i64(s);
        }
        for s in Self::contiguous_strides(shape) {
            self.i64(s);
        }
        self.i64(1);
        self.torch_obj("torch.LongStorage");
        self.i64(data.len() as i64);
        for &v in data {
            self.i64(v);
        }
        index
    }

    /// Open a module body table of `pairs` key/value pairs.
    fn table(&mut self, pairs: i32) {
        let index = self.index();
        self.i32(TYPE_TABLE);
        self.i32(index);
        self.i32(pairs);
    }

    fn pair_number(&mut self, key: &str, v: f64) {
        self.string_obj(key);
        self.number_obj(v);
    }
}

fn relu(t: &mut T7) {
    t.torch_obj("nn.ReLU");
    t.table(0);
}

fn identity(t: &mut T7) {
    t.torch_obj("nn.Identity");
    t.table(0);
}

fn sequential_open(t: &mut T7, children: i32) {
    t.torch_obj("nn.Sequential");
    t.table(1);
    t.string_obj("modules");
    let index = t.index();
    t.i32(TYPE_TABLE);
    t.i32(index);
    t.i32(children);
}

fn import(t: T7) -> Net {
    torch::for_reader(Cursor::new(t.bytes)).unwrap()
}

fn pin(layer: usize, slot: usize) -> Option<LayerPin> {
    Some(LayerPin::new(layer, slot))
}

#[test]
fn sequential_conv_relu_pool() {
    let mut t = T7::new();
    sequential_open(&mut t, 3);

    t.number_obj(1.0);
    t.torch_obj("nn.SpatialConvolution");
    t.table(8);
    t.pair_number("kW", 3.0);
    t.pair_number("kH", 3.0);
    t.pair_number("dW", 1.0);
    t.pair_number("dH", 1.0);
    t.pair_number("padW", 1.0);
    t.pair_number("padH", 1.0);
    t.pair_number("nOutputPlane", 16.0);
    t.string_obj("weight");
    let weight: Vec<f32> = (0..16 * 3 * 3 * 3).map(|i| i as f32).collect();
    t.tensor_f32(&[16, 3, 3, 3], &weight);

    t.number_obj(2.0);
    relu(&mut t);

    t.number_obj(3.0);
    t.torch_obj("nn.SpatialMaxPooling");
    t.table(5);
    t.pair_number("kW", 2.0);
    t.pair_number("kH", 2.0);
    t.pair_number("dW", 2.0);
    t.pair_number("dH", 2.0);
    t.string_obj("indices");
    t.tensor_i64(&[4], &[1, 2, 3, 4]);

    let net = import(t);

    let conv = net.layer_data(1usize).unwrap();
    assert_eq!(conv.layer_type(), "Convolution");
    assert_eq!(conv.input_pins(), &[pin(0, 0)]);
    assert_eq!(conv.params().get_int("kernel_w").unwrap(), 3);
    assert_eq!(conv.params().get_int("stride_h").unwrap(), 1);
    assert_eq!(conv.params().get_int("pad_h").unwrap(), 1);
    assert_eq!(conv.params().get_int("num_output").unwrap(), 16);
    assert!(!conv.params().get("bias_term").unwrap().as_bool().unwrap());
    assert_eq!(conv.params().blobs[0].shape(), &[16, 3, 3, 3]);
    assert_eq!(conv.params().blobs[0].data()[5], 5.0);

    let relu = net.layer_data(2usize).unwrap();
    assert_eq!(relu.layer_type(), "ReLU");
    assert_eq!(relu.input_pins(), &[pin(1, 0)]);

    let pool = net.layer_data(3usize).unwrap();
    assert_eq!(pool.layer_type(), "Pooling");
    assert_eq!(pool.input_pins(), &[pin(2, 0)]);
    assert_eq!(pool.params().get_str("pool").unwrap(), "MAX");
    assert_eq!(pool.params().get_int("kernel_h").unwrap(), 2);
    assert_eq!(pool.params().get_int("pad_w").unwrap(), 0);
}

#[test]
fn unpooling_finds_its_pooling() {
    let mut t = T7::new();
    sequential_open(&mut t, 2);

    t.number_obj(1.0);
    t.torch_obj("nn.SpatialMaxPooling");
    t.table(5);
    t.pair_number("kW", 2.0);
    t.pair_number("kH", 2.0);
    t.pair_number("dW", 2.0);
    t.pair_number("dH", 2.0);
    t.string_obj("indices");
    let indices = t.tensor_i64(&[4], &[0, 2, 8, 10]);

    t.number_obj(2.0);
    t.torch_obj("nn.SpatialMaxUnpooling");
    t.table(1);
    t.string_obj("indices");
    t.torch_ref(indices);

    let net = import(t);

    let pool = net.layer_data(1usize).unwrap();
    assert_eq!(pool.layer_type(), "Pooling");
    let unpool = net.layer_data(2usize).unwrap();
    assert_eq!(unpool.layer_type(), "MaxUnpool");
    // previous pin, plus the pooling's second output carrying indices
    assert_eq!(unpool.input_pins(), &[pin(1, 0), pin(1, 1)]);
    assert_eq!(unpool.params().get_int("pool_k_h").unwrap(), 2);
    assert_eq!(unpool.params().get_int("pool_stride_w").unwrap(), 2);
    assert_eq!(unpool.params().get_int("pool_pad_h").unwrap(), 0);
}

#[test]
fn unpooling_without_pooling_fails() {
    let mut t = T7::new();
    sequential_open(&mut t, 1);
    t.number_obj(1.0);
    t.torch_obj("nn.SpatialMaxUnpooling");
    t.table(1);
    t.string_obj("indices");
    t.tensor_i64(&[1], &[3]);

    let err = torch::for_reader(Cursor::new(t.bytes)).unwrap_err();
    match err.kind() {
        thdeploy::ErrorKind::NotFound(_) => (),
        other => panic!("unexpected error kind: {:?}", other),
    }
}

#[test]
fn prelu_with_scalar_weight_becomes_relu() {
    let mut t = T7::new();
    sequential_open(&mut t, 1);
    t.number_obj(1.0);
    t.torch_obj("nn.PReLU");
    t.table(2);
    t.pair_number("nOutputPlane", 0.0);
    t.string_obj("weight");
    t.tensor_f32(&[1], &[0.25]);

    let net = import(t);
    let relu = net.layer_data(1usize).unwrap();
    assert_eq!(relu.layer_type(), "ReLU");
    assert_eq!(relu.params().get_real("negative_slope").unwrap(), 0.25);
    assert!(relu.params().blobs.is_empty());
}

#[test]
fn prelu_with_channel_weights_stays_parametric() {
    let mut t = T7::new();
    sequential_open(&mut t, 1);
    t.number_obj(1.0);
    t.torch_obj("nn.PReLU");
    t.table(2);
    t.pair_number("nOutputPlane", 3.0);
    t.string_obj("weight");
    t.tensor_f32(&[3], &[0.1, 0.2, 0.3]);

    let net = import(t);
    let prelu = net.layer_data(1usize).unwrap();
    assert_eq!(prelu.layer_type(), "ChannelsPReLU");
    assert_eq!(prelu.params().blobs[0].data(), &[0.1, 0.2, 0.3]);
}

#[test]
fn shared_storage_and_strided_views() {
    let mut t = T7::new();
    sequential_open(&mut t, 1);
    t.number_obj(1.0);
    t.torch_obj("nn.Linear");
    t.table(2);
    t.string_obj("weight");
    // transposed view over a shared storage
    let storage_data: Vec<f32> = (0..6).map(|i| i as f32).collect();
    let weight_index = t.torch_obj("torch.FloatTensor");
    t.i32(2);
    t.i64(2);
    t.i64(2);
    t.i64(1);
    t.i64(2);
    t.i64(1);
    let storage = t.torch_obj("torch.FloatStorage");
    t.i64(storage_data.len() as i64);
    for f in &storage_data {
        t.bytes.extend(&f.to_le_bytes());
    }
    let _ = weight_index;
    t.string_obj("bias");
    // tail of the same storage, via back-reference
    t.tensor_f32_shared(&[2], &[1], 5, storage);

    let net = import(t);
    let linear = net.layer_data(1usize).unwrap();
    assert_eq!(linear.layer_type(), "InnerProduct");
    assert_eq!(linear.params().get_int("num_output").unwrap(), 2);
    assert!(linear.params().get("bias_term").unwrap().as_bool().unwrap());
    // weight was a [2,2] view with strides [1,2]: a transpose
    assert_eq!(linear.params().blobs[0].shape(), &[2, 2]);
    assert_eq!(linear.params().blobs[0].data(), &[0.0, 2.0, 1.0, 3.0]);
    // bias starts at element 4 of the shared storage
    assert_eq!(linear.params().blobs[1].data(), &[4.0, 5.0]);
}

#[test]
fn concat_table_then_sum() {
    let mut t = T7::new();
    sequential_open(&mut t, 2);

    t.number_obj(1.0);
    t.torch_obj("nn.ConcatTable");
    t.table(1);
    t.string_obj("modules");
    let index = t.index();
    t.i32(TYPE_TABLE);
    t.i32(index);
    t.i32(2);
    t.number_obj(1.0);
    identity(&mut t);
    t.number_obj(2.0);
    identity(&mut t);

    t.number_obj(2.0);
    t.torch_obj("nn.CAddTable");
    t.table(0);

    let net = import(t);

    // Split, two Identity branches, then the Eltwise sum
    let split = net.layer_data(1usize).unwrap();
    assert_eq!(split.layer_type(), "Split");
    assert_eq!(net.layer_data(2usize).unwrap().input_pins(), &[pin(1, 0)]);
    assert_eq!(net.layer_data(3usize).unwrap().input_pins(), &[pin(1, 1)]);
    let sum = net.layer_data(4usize).unwrap();
    assert_eq!(sum.layer_type(), "Eltwise");
    assert_eq!(sum.params().get_str("operation").unwrap(), "sum");
    assert_eq!(sum.input_pins(), &[pin(2, 0), pin(3, 0)]);
}

#[test]
fn concat_container_splits_and_merges() {
    let mut t = T7::new();
    sequential_open(&mut t, 1);

    t.number_obj(1.0);
    t.torch_obj("nn.Concat");
    t.table(2);
    t.pair_number("dimension", 2.0);
    t.string_obj("modules");
    let index = t.index();
    t.i32(TYPE_TABLE);
    t.i32(index);
    t.i32(2);
    t.number_obj(1.0);
    relu(&mut t);
    t.number_obj(2.0);
    identity(&mut t);

    let net = import(t);

    let split = net.layer_data(1usize).unwrap();
    assert_eq!(split.layer_type(), "Split");
    assert_eq!(split.input_pins(), &[pin(0, 0)]);
    let merge = net.layer_data(2usize).unwrap();
    assert_eq!(merge.layer_type(), "Concat");
    assert_eq!(merge.params().get_int("axis").unwrap(), 1);
    // branches feed the merge in order
    assert_eq!(net.layer_data(3usize).unwrap().input_pins(), &[pin(1, 0)]);
    assert_eq!(net.layer_data(4usize).unwrap().input_pins(), &[pin(1, 1)]);
    assert_eq!(merge.input_pins(), &[pin(3, 0), pin(4, 0)]);

    // the lowered graph is a DAG: a topological order exists
    assert_topological(&net, &[1, 3, 4, 2]);
}

fn assert_topological(net: &Net, ids: &[usize]) {
    let mut done = vec![0usize];
    for &id in ids {
        let ld = net.layer_data(id).unwrap();
        for pin in ld.input_pins() {
            let pin = pin.expect("connected pin");
            assert!(done.contains(&pin.layer), "pin {:?} not ready for layer {}", pin, id);
        }
        done.push(id);
    }
}

#[test]
fn batchnorm_reshape_and_full_convolution() {
    let mut t = T7::new();
    sequential_open(&mut t, 3);

    t.number_obj(1.0);
    t.torch_obj("nn.SpatialBatchNormalization");
    t.table(4);
    t.string_obj("running_mean");
    t.tensor_f32(&[2], &[0.5, 1.5]);
    t.string_obj("running_var");
    t.tensor_f32(&[2], &[1.0, 2.0]);
    t.pair_number("eps", 1e-5);
    t.string_obj("weight");
    t.tensor_f32(&[2], &[2.0, 3.0]);

    t.number_obj(2.0);
    t.torch_obj("nn.Reshape");
    t.table(2);
    t.string_obj("size");
    t.torch_obj("torch.LongStorage");
    t.i64(3);
    t.i64(16);
    t.i64(8);
    t.i64(8);
    t.string_obj("batchMode");
    t.i32(TYPE_BOOLEAN);
    t.i32(1);

    t.number_obj(3.0);
    t.torch_obj("nn.SpatialFullConvolution");
    t.table(10);
    t.pair_number("kW", 2.0);
    t.pair_number("kH", 2.0);
    t.pair_number("dW", 2.0);
    t.pair_number("dH", 2.0);
    t.pair_number("padW", 0.0);
    t.pair_number("padH", 0.0);
    t.pair_number("adjW", 1.0);
    t.pair_number("adjH", 1.0);
    t.pair_number("nOutputPlane", 3.0);
    t.string_obj("weight");
    let weight: Vec<f32> = (0..2 * 3 * 2 * 2).map(|i| i as f32).collect();
    t.tensor_f32(&[2, 3, 2, 2], &weight);

    let net = import(t);

    let bn = net.layer_data(1usize).unwrap();
    assert_eq!(bn.layer_type(), "BatchNorm");
    // blobs come as [mean, var, weight]
    assert_eq!(bn.params().blobs.len(), 3);
    assert_eq!(bn.params().blobs[0].data(), &[0.5, 1.5]);
    assert_eq!(bn.params().blobs[1].data(), &[1.0, 2.0]);
    assert!(bn.params().get("has_weight").unwrap().as_bool().unwrap());
    assert!(!bn.params().has("has_bias"));
    assert!(bn.params().get_real("eps").unwrap() < 1e-4);

    let reshape = net.layer_data(2usize).unwrap();
    assert_eq!(reshape.layer_type(), "Reshape");
    assert_eq!(reshape.params().get("dim").unwrap().as_ints().unwrap(), vec![16, 8, 8]);
    assert_eq!(reshape.params().get_int("axis").unwrap(), 1);

    let deconv = net.layer_data(3usize).unwrap();
    assert_eq!(deconv.layer_type(), "Deconvolution");
    assert_eq!(deconv.params().get_int("adj_w").unwrap(), 1);
    // the [out, in, h, w] weight is relabeled [in, out, h, w] in place
    assert_eq!(deconv.params().blobs[0].shape(), &[3, 2, 2, 2]);
    assert_eq!(deconv.params().blobs[0].data()[0], 0.0);
    assert_eq!(deconv.params().blobs[0].data()[23], 23.0);
}

#[test]
fn single_tensor_blob_stream() {
    let mut t = T7::new();
    t.tensor_f32(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let blob = torch::read_blob(Cursor::new(t.bytes)).unwrap();
    assert_eq!(blob.shape(), &[2, 3]);
    assert_eq!(blob.data()[4], 5.0);
}

#[test]
fn empty_tensor_stream() {
    let mut t = T7::new();
    let index = t.torch_obj("torch.FloatTensor");
    t.i32(0);
    t.i64(1);
    t.i32(TYPE_NIL);
    let _ = index;
    let blob = torch::read_blob(Cursor::new(t.bytes)).unwrap();
    assert!(blob.is_empty());
}

#[test]
fn unknown_class_is_rejected_by_name() {
    let mut t = T7::new();
    sequential_open(&mut t, 1);
    t.number_obj(1.0);
    t.torch_obj("nn.FancyNewLayer");
    t.table(0);

    let err = torch::for_reader(Cursor::new(t.bytes)).unwrap_err();
    match err.kind() {
        thdeploy::ErrorKind::NotImplemented(msg) => assert!(msg.contains("nn.FancyNewLayer")),
        other => panic!("unexpected error kind: {:?}", other),
    }
}

#[test]
fn version_prefixed_class_names() {
    let mut t = T7::new();
    sequential_open(&mut t, 1);
    t.number_obj(1.0);
    // "V 2" version record before the class name proper
    let index = t.index();
    t.i32(TYPE_TORCH);
    t.i32(index);
    t.str("V 2");
    t.str("nn.Identity");
    t.table(0);

    let net = import(t);
    assert_eq!(net.layer_data(1usize).unwrap().layer_type(), "Identity");
}
